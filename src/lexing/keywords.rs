//! Keywords are reserved words that help the parser interpret tokens and
//! resolve ambiguities. Primitive type names (`int`, `u8`, `double`, ...) are
//! deliberately not keywords: the parser resolves them through its primitive
//! table so the set here stays the closed keyword set of the language.

use std::collections::HashMap;

use crate::lexing::tokens::Token;

pub fn new() -> HashMap<&'static str, Token> {
    let mut map = HashMap::new();
    map.extend(vec![
        ("if", Token::If),
        ("else", Token::Else),
        ("while", Token::While),
        ("for", Token::For),
        ("break", Token::Break),
        ("continue", Token::Continue),
        ("return", Token::Return),
        ("match", Token::Match),
        ("case", Token::Case),
        ("default", Token::Default),
        ("struct", Token::Struct),
        ("union", Token::Union),
        ("enum", Token::Enum),
        ("newtype", Token::Newtype),
        ("region", Token::Region),
        ("generic", Token::Generic),
        ("const", Token::Const),
        ("consteval", Token::Consteval),
        ("static", Token::Static),
        ("stack", Token::Stack),
        ("heap", Token::Heap),
        ("arena", Token::Arena),
        ("unsafe", Token::Unsafe),
        ("escape", Token::Escape),
        ("defer", Token::Defer),
        ("spawn", Token::Spawn),
        ("new", Token::New),
        ("try", Token::Try),
        ("pure", Token::Pure),
        ("naked", Token::Naked),
        ("interrupt", Token::Interrupt),
        ("noreturn", Token::Noreturn),
        ("section", Token::Section),
        ("packed", Token::Packed),
        ("must_use", Token::MustUse),
        ("inline", Token::Inline),
        ("extern", Token::Extern),
        ("cdecl", Token::Cdecl),
        ("mut", Token::Mut),
        ("volatile_load", Token::VolatileLoad),
        ("volatile_store", Token::VolatileStore),
        ("asm", Token::Asm),
        ("sizeof", Token::Sizeof),
        ("alignof", Token::Alignof),
        ("fieldcount", Token::Fieldcount),
        ("typeof", Token::Typeof),
        ("static_assert", Token::StaticAssert),
        ("null", Token::Null),
        ("true", Token::True),
        ("false", Token::False),
    ]);
    map
}
