//! # SafeC Parser
//!
//! Recursive descent over the C-like grammar extended with regions,
//! generics, tagged unions, `match`, `defer`, and compile-time constructs.
//! Declarations and statements have dedicated sub-parsers; expressions use
//! precedence climbing. The parser produces the AST shape and nothing else:
//! no name resolution, no types, no constant evaluation.
//!
//! Ambiguity resolutions:
//!
//! * `&` at expression start is address-of; `&region T` at type position is
//!   a reference type whose region keyword is lexically next.
//! * A parameter written `T... name` is a variadic generic type pack, not a
//!   C `...`.
//! * `Foo::method` at top level binds a method definition to a previously
//!   declared struct.
//! * `(T) expr` is a cast only when `T` parses as a type that could not also
//!   be a bare expression identifier (primitives always qualify); this keeps
//!   `(x) - y` an arithmetic expression.
//! * Declaration-versus-expression statements are resolved by checkpointing
//!   the token buffer, attempting a type, and rewinding on failure.

pub mod nodes;

use std::result;

use crate::common::interning::Name;
use crate::common::peekable_buffer::PeekableBuffer;
use crate::diagnostics::{Category, Diagnostics};
use crate::lexing::tokens::Token;
use crate::lexing::Tokens;
use crate::parsing::nodes::*;
use crate::source::Position;
use crate::types::{CallConv, Region};

#[derive(Debug)]
pub enum ParserErrorDescription {
    Described(String),
    Expected(Token),
    Unexpected(Token),
    PrematureEof,
}

#[derive(Debug)]
pub struct ParserError {
    pub position: Position,
    pub description: ParserErrorDescription,
}

impl ParserError {
    pub fn message(&self) -> String {
        match &self.description {
            ParserErrorDescription::Described(message) => message.clone(),
            ParserErrorDescription::Expected(token) => format!("expected {:?}", token),
            ParserErrorDescription::Unexpected(token) => format!("unexpected {:?}", token),
            ParserErrorDescription::PrematureEof => "unexpected end of input".to_owned(),
        }
    }
}

type Result<T> = result::Result<T, ParserError>;

const PRIMITIVE_NAMES: &[&str] = &[
    "void", "bool", "char", "i8", "i16", "i32", "i64", "u8", "u16", "u32", "u64", "int", "uint",
    "usize", "isize", "float", "double",
];

fn is_primitive_name(name: &str) -> bool {
    PRIMITIVE_NAMES.contains(&name)
}

pub struct Parser<'a> {
    tokens: Tokens,
    diagnostics: &'a mut Diagnostics,
}

impl<'a> Parser<'a> {
    pub fn new(tokens: Tokens, diagnostics: &'a mut Diagnostics) -> Self {
        Self {
            tokens,
            diagnostics,
        }
    }

    /// Fail at parsing, describing the reason why.
    fn fail<T>(&self, message: impl Into<String>) -> Result<T> {
        Err(ParserError {
            position: self.tokens.position(),
            description: ParserErrorDescription::Described(message.into()),
        })
    }

    /// Fail at parsing, stating that `expected` was expected but did not
    /// appear.
    fn expected<T>(&self, expected: Token) -> Result<T> {
        Err(ParserError {
            position: self.tokens.position(),
            description: ParserErrorDescription::Expected(expected),
        })
    }

    fn unexpected<T>(&self, unexpected: Token) -> Result<T> {
        Err(ParserError {
            position: self.tokens.position(),
            description: ParserErrorDescription::Unexpected(unexpected),
        })
    }

    fn premature_eof<T>(&self) -> Result<T> {
        Err(ParserError {
            position: self.tokens.position(),
            description: ParserErrorDescription::PrematureEof,
        })
    }

    fn peek_token(&self) -> Token {
        self.tokens
            .peek()
            .map(|lexed| lexed.token.clone())
            .unwrap_or_default()
    }

    fn nth_token(&self, n: usize) -> Token {
        self.tokens
            .peek_nth(n)
            .map(|lexed| lexed.token.clone())
            .unwrap_or_default()
    }

    fn position(&self) -> Position {
        self.tokens.position()
    }

    fn advance(&mut self) {
        self.tokens.discard();
    }

    fn next_is(&self, expected: &Token) -> bool {
        self.tokens.match_next(|lexed| lexed.token == *expected)
    }

    fn nth_is(&self, n: usize, expected: &Token) -> bool {
        self.tokens.match_nth(n, |lexed| lexed.token == *expected)
    }

    /// Discard the next token if it matches, otherwise fail stating what was
    /// expected.
    fn expect_and_discard(&mut self, expected: Token) -> Result<()> {
        if self.next_is(&expected) {
            self.advance();
            Ok(())
        } else if self.tokens.at_eof() {
            self.premature_eof()
        } else {
            self.expected(expected)
        }
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.next_is(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn parse_identifier(&mut self) -> Result<Name> {
        match self.peek_token() {
            Token::Identifier(name) => {
                self.advance();
                Ok(name)
            }
            Token::Eof => self.premature_eof(),
            other => self.unexpected(other),
        }
    }

    fn report(&mut self, error: &ParserError) {
        self.diagnostics
            .error(Category::ParseUnexpected, error.position, error.message());
    }

    // ---- top level ----

    /// Parse a whole translation unit, recovering at the next plausible
    /// declaration after an error so independent errors all surface.
    pub fn parse_unit(mut self) -> Unit {
        let mut unit = Unit::default();
        while !self.tokens.at_eof() {
            match self.parse_decl() {
                Ok(decl) => unit.decls.push(decl),
                Err(error) => {
                    self.report(&error);
                    self.synchronize_top_level();
                }
            }
        }
        unit
    }

    fn synchronize_top_level(&mut self) {
        // Skip to the end of the broken declaration: past a top-level `;` or
        // the brace that closes the body it opened. Always makes progress.
        let mut depth = 0usize;
        while !self.tokens.at_eof() {
            match self.peek_token() {
                Token::Struct
                | Token::Union
                | Token::Enum
                | Token::Newtype
                | Token::Region
                | Token::Generic
                | Token::StaticAssert
                | Token::Static
                | Token::Extern
                    if depth == 0 =>
                {
                    break;
                }
                Token::Eof => break,
                Token::Semicolon if depth == 0 => {
                    self.advance();
                    break;
                }
                Token::OpenBrace => {
                    depth += 1;
                    self.advance();
                }
                Token::CloseBrace => {
                    self.advance();
                    if depth <= 1 {
                        break;
                    }
                    depth -= 1;
                }
                _ => self.advance(),
            }
        }
    }

    fn parse_decl(&mut self) -> Result<Decl> {
        match self.peek_token() {
            Token::Struct => self.parse_struct(Vec::new(), false, false).map(Decl::Struct),
            Token::Union => {
                self.advance();
                self.parse_struct_body(Vec::new(), true, false)
                    .map(Decl::Struct)
            }
            Token::Packed => {
                self.advance();
                let is_union = self.eat(&Token::Union);
                if !is_union {
                    self.expect_and_discard(Token::Struct)?;
                }
                self.parse_struct_body(Vec::new(), is_union, true)
                    .map(Decl::Struct)
            }
            Token::Enum => {
                if self.nth_is(1, &Token::Union) {
                    self.parse_tagged().map(Decl::Tagged)
                } else {
                    self.parse_enum().map(Decl::Enum)
                }
            }
            Token::Newtype => self.parse_newtype().map(Decl::Newtype),
            Token::Region => self.parse_region().map(Decl::Region),
            Token::StaticAssert => {
                let position = self.position();
                let (cond, message) = self.parse_static_assert()?;
                Ok(Decl::StaticAssert {
                    cond,
                    message,
                    position,
                })
            }
            Token::Generic => {
                let generics = self.parse_generics()?;
                match self.peek_token() {
                    Token::Struct => self.parse_struct(generics, false, false).map(Decl::Struct),
                    Token::Union => {
                        self.advance();
                        self.parse_struct_body(generics, true, false).map(Decl::Struct)
                    }
                    Token::Packed => {
                        self.advance();
                        let is_union = self.eat(&Token::Union);
                        if !is_union {
                            self.expect_and_discard(Token::Struct)?;
                        }
                        self.parse_struct_body(generics, is_union, true)
                            .map(Decl::Struct)
                    }
                    _ => self.parse_function_or_global(generics),
                }
            }
            Token::Static => {
                self.advance();
                self.parse_global(false)
            }
            Token::Eof => self.premature_eof(),
            _ => self.parse_function_or_global(Vec::new()),
        }
    }

    fn parse_global(&mut self, is_const: bool) -> Result<Decl> {
        let position = self.position();
        let ty = self.parse_type()?;
        let name = self.parse_identifier()?;
        let init = if self.eat(&Token::Assign) {
            Some(self.parse_initializer()?)
        } else {
            None
        };
        self.expect_and_discard(Token::Semicolon)?;
        Ok(Decl::Global(GlobalDecl {
            name,
            ty,
            init,
            is_const,
            position,
            symbol: None,
        }))
    }

    fn parse_function_or_global(&mut self, generics: Vec<GenericParam>) -> Result<Decl> {
        let position = self.position();
        let (attrs, section, convention) = self.parse_fn_attrs()?;
        let return_type = self.parse_type()?;
        let name = self.parse_function_name()?;
        let owner;
        let name = if self.eat(&Token::ColonColon) {
            owner = Some(name);
            self.parse_function_name()?
        } else {
            owner = None;
            name
        };

        if self.next_is(&Token::OpenParen) {
            let (params, variadic) = self.parse_params()?;
            let attrs = if variadic {
                attrs | FnAttrs::VARIADIC
            } else {
                attrs
            };
            let body = if self.next_is(&Token::OpenBrace) {
                Some(self.parse_block()?)
            } else {
                self.expect_and_discard(Token::Semicolon)?;
                None
            };
            Ok(Decl::Function(FunctionDecl {
                name,
                owner,
                generics,
                params,
                return_type,
                attrs,
                section,
                convention,
                body,
                position,
                symbol: None,
            }))
        } else {
            if owner.is_some() || !generics.is_empty() {
                return self.fail("expected a parameter list after the function name");
            }
            let init = if self.eat(&Token::Assign) {
                Some(self.parse_initializer()?)
            } else {
                None
            };
            self.expect_and_discard(Token::Semicolon)?;
            Ok(Decl::Global(GlobalDecl {
                name,
                ty: return_type,
                init,
                is_const: attrs.contains(FnAttrs::CONST),
                position,
                symbol: None,
            }))
        }
    }

    fn parse_fn_attrs(&mut self) -> Result<(FnAttrs, Option<Name>, CallConv)> {
        let mut attrs = FnAttrs::empty();
        let mut section = None;
        let mut convention = CallConv::Default;
        loop {
            match self.peek_token() {
                Token::Const => attrs |= FnAttrs::CONST,
                Token::Consteval => attrs |= FnAttrs::CONSTEVAL,
                Token::Inline => attrs |= FnAttrs::INLINE,
                Token::Extern => attrs |= FnAttrs::EXTERN,
                Token::MustUse => attrs |= FnAttrs::MUST_USE,
                Token::Pure => attrs |= FnAttrs::PURE,
                Token::Naked => attrs |= FnAttrs::NAKED,
                Token::Interrupt => attrs |= FnAttrs::INTERRUPT,
                Token::Noreturn => attrs |= FnAttrs::NORETURN,
                Token::Cdecl => convention = CallConv::C,
                Token::Section => {
                    self.advance();
                    self.expect_and_discard(Token::OpenParen)?;
                    match self.peek_token() {
                        Token::Str(name) => {
                            self.advance();
                            section = Some(name);
                        }
                        other => return self.unexpected(other),
                    }
                    self.expect_and_discard(Token::CloseParen)?;
                    continue;
                }
                _ => break,
            }
            self.advance();
        }
        Ok((attrs, section, convention))
    }

    /// A function name: an identifier, or `operator` followed by an
    /// overloadable operator symbol.
    fn parse_function_name(&mut self) -> Result<Name> {
        let name = self.parse_identifier()?;
        if name.as_str() == "operator" {
            let symbol = match self.peek_token() {
                Token::Plus => "+",
                Token::Minus => "-",
                Token::Star => "*",
                Token::Slash => "/",
                Token::Percent => "%",
                Token::PlusWrap => "+|",
                Token::MinusWrap => "-|",
                Token::StarWrap => "*|",
                Token::PlusSat => "+%",
                Token::MinusSat => "-%",
                Token::StarSat => "*%",
                Token::EqEq => "==",
                Token::BangEq => "!=",
                Token::Lt => "<",
                Token::Le => "<=",
                Token::Gt => ">",
                Token::Ge => ">=",
                _ => return Ok(name),
            };
            self.advance();
            Ok(Name::from(format!("operator{}", symbol)))
        } else {
            Ok(name)
        }
    }

    fn parse_generics(&mut self) -> Result<Vec<GenericParam>> {
        self.expect_and_discard(Token::Generic)?;
        self.expect_and_discard(Token::Lt)?;
        let mut generics = Vec::new();
        loop {
            let position = self.position();
            let first = self.parse_identifier()?;
            if let Token::Identifier(value_name) = self.peek_token() {
                // `generic<int N>`: a value parameter typed by the first
                // identifier.
                self.advance();
                generics.push(GenericParam {
                    name: value_name,
                    constraint: None,
                    pack: false,
                    value_type: Some(TypeExpr::Named(first)),
                    position,
                });
            } else {
                let pack = self.eat(&Token::Ellipsis);
                let constraint = if !pack && self.eat(&Token::Colon) {
                    Some(self.parse_identifier()?)
                } else {
                    None
                };
                generics.push(GenericParam {
                    name: first,
                    constraint,
                    pack,
                    value_type: None,
                    position,
                });
            }
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect_and_discard(Token::Gt)?;
        Ok(generics)
    }

    fn parse_params(&mut self) -> Result<(Vec<Param>, bool)> {
        self.expect_and_discard(Token::OpenParen)?;
        let mut params = Vec::new();
        let mut variadic = false;
        loop {
            if self.next_is(&Token::CloseParen) {
                break;
            }
            if self.next_is(&Token::Ellipsis) {
                self.advance();
                variadic = true;
                break;
            }
            let position = self.position();
            let ty = self.parse_type()?;
            let pack = self.eat(&Token::Ellipsis);
            let name = self.parse_identifier()?;
            params.push(Param {
                name,
                ty,
                pack,
                position,
                symbol: None,
            });
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect_and_discard(Token::CloseParen)?;
        Ok((params, variadic))
    }

    fn parse_struct(
        &mut self,
        generics: Vec<GenericParam>,
        is_union: bool,
        packed: bool,
    ) -> Result<StructDecl> {
        self.expect_and_discard(Token::Struct)?;
        self.parse_struct_body(generics, is_union, packed)
    }

    /// The struct head keyword is already consumed.
    fn parse_struct_body(
        &mut self,
        generics: Vec<GenericParam>,
        is_union: bool,
        packed: bool,
    ) -> Result<StructDecl> {
        let position = self.position();
        let name = self.parse_identifier()?;
        self.expect_and_discard(Token::OpenBrace)?;
        let mut fields = Vec::new();
        let mut methods = Vec::new();
        while !self.next_is(&Token::CloseBrace) {
            if self.tokens.at_eof() {
                return self.premature_eof();
            }
            let member_position = self.position();
            let (attrs, section, convention) = self.parse_fn_attrs()?;
            let ty = self.parse_type()?;
            let member = self.parse_function_name()?;
            if self.next_is(&Token::OpenParen) {
                let (params, variadic) = self.parse_params()?;
                let attrs = if variadic {
                    attrs | FnAttrs::VARIADIC
                } else {
                    attrs
                };
                self.expect_and_discard(Token::Semicolon)?;
                methods.push(FunctionDecl {
                    name: member,
                    owner: Some(name.clone()),
                    generics: Vec::new(),
                    params,
                    return_type: ty,
                    attrs,
                    section,
                    convention,
                    body: None,
                    position: member_position,
                    symbol: None,
                });
            } else {
                self.expect_and_discard(Token::Semicolon)?;
                fields.push(FieldDecl {
                    name: member,
                    ty,
                    position: member_position,
                });
            }
        }
        self.expect_and_discard(Token::CloseBrace)?;
        self.eat(&Token::Semicolon);
        Ok(StructDecl {
            name,
            is_union,
            packed,
            generics,
            fields,
            methods,
            position,
            nominal: None,
        })
    }

    fn parse_tagged(&mut self) -> Result<TaggedDecl> {
        self.expect_and_discard(Token::Enum)?;
        self.expect_and_discard(Token::Union)?;
        let position = self.position();
        let name = self.parse_identifier()?;
        self.expect_and_discard(Token::OpenBrace)?;
        let mut variants = Vec::new();
        while !self.next_is(&Token::CloseBrace) {
            let variant_position = self.position();
            let variant = self.parse_identifier()?;
            let payload = if self.eat(&Token::OpenParen) {
                let ty = self.parse_type()?;
                self.expect_and_discard(Token::CloseParen)?;
                Some(ty)
            } else {
                None
            };
            variants.push(VariantDecl {
                name: variant,
                payload,
                position: variant_position,
            });
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect_and_discard(Token::CloseBrace)?;
        self.eat(&Token::Semicolon);
        Ok(TaggedDecl {
            name,
            variants,
            position,
            nominal: None,
        })
    }

    fn parse_enum(&mut self) -> Result<EnumDecl> {
        self.expect_and_discard(Token::Enum)?;
        let position = self.position();
        let name = self.parse_identifier()?;
        let underlying = if self.eat(&Token::Colon) {
            Some(self.parse_type()?)
        } else {
            None
        };
        self.expect_and_discard(Token::OpenBrace)?;
        let mut enumerators = Vec::new();
        while !self.next_is(&Token::CloseBrace) {
            let enumerator_position = self.position();
            let enumerator = self.parse_identifier()?;
            let value = if self.eat(&Token::Assign) {
                Some(self.parse_expr()?)
            } else {
                None
            };
            enumerators.push(EnumeratorDecl {
                name: enumerator,
                value,
                position: enumerator_position,
            });
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect_and_discard(Token::CloseBrace)?;
        self.eat(&Token::Semicolon);
        Ok(EnumDecl {
            name,
            underlying,
            enumerators,
            position,
            nominal: None,
        })
    }

    fn parse_newtype(&mut self) -> Result<NewtypeDecl> {
        self.expect_and_discard(Token::Newtype)?;
        let position = self.position();
        let name = self.parse_identifier()?;
        self.expect_and_discard(Token::Assign)?;
        let target = self.parse_type()?;
        self.expect_and_discard(Token::Semicolon)?;
        Ok(NewtypeDecl {
            name,
            target,
            position,
            nominal: None,
        })
    }

    fn parse_region(&mut self) -> Result<RegionDecl> {
        self.expect_and_discard(Token::Region)?;
        let position = self.position();
        let name = self.parse_identifier()?;
        self.expect_and_discard(Token::OpenBrace)?;
        let field = self.parse_identifier()?;
        if field.as_str() != "capacity" {
            return self.fail("region declarations take a single field: capacity");
        }
        self.expect_and_discard(Token::Colon)?;
        let capacity = self.parse_expr()?;
        self.expect_and_discard(Token::CloseBrace)?;
        self.eat(&Token::Semicolon);
        Ok(RegionDecl {
            name,
            capacity,
            position,
            symbol: None,
        })
    }

    fn parse_static_assert(&mut self) -> Result<(Expr, Option<Name>)> {
        self.expect_and_discard(Token::StaticAssert)?;
        self.expect_and_discard(Token::OpenParen)?;
        let cond = self.parse_expr()?;
        let message = if self.eat(&Token::Comma) {
            match self.peek_token() {
                Token::Str(message) => {
                    self.advance();
                    Some(message)
                }
                other => return self.unexpected(other),
            }
        } else {
            None
        };
        self.expect_and_discard(Token::CloseParen)?;
        self.expect_and_discard(Token::Semicolon)?;
        Ok((cond, message))
    }

    // ---- types ----

    fn parse_type(&mut self) -> Result<TypeExpr> {
        // Leading `const` only matters for pointer constness at FFI sites.
        let leading_const = self.eat(&Token::Const);
        let mut ty = self.parse_type_prefix()?;
        let mut first_suffix = true;
        loop {
            match self.peek_token() {
                Token::Star => {
                    self.advance();
                    ty = TypeExpr::Pointer {
                        pointee: Box::new(ty),
                        mutable: !(leading_const && first_suffix),
                    };
                    first_suffix = false;
                }
                Token::OpenBracket => {
                    self.advance();
                    if self.eat(&Token::CloseBracket) {
                        ty = TypeExpr::Slice {
                            element: Box::new(ty),
                        };
                    } else {
                        let length = self.parse_expr()?;
                        self.expect_and_discard(Token::CloseBracket)?;
                        ty = TypeExpr::Array {
                            element: Box::new(ty),
                            length: Box::new(length),
                        };
                    }
                    first_suffix = false;
                }
                _ => break,
            }
        }
        Ok(ty)
    }

    fn parse_type_prefix(&mut self) -> Result<TypeExpr> {
        match self.peek_token() {
            Token::QuestionAmp => {
                self.advance();
                self.parse_reference(true)
            }
            Token::Amp => {
                self.advance();
                self.parse_reference(false)
            }
            Token::Typeof => {
                self.advance();
                self.expect_and_discard(Token::OpenParen)?;
                let expr = self.parse_expr()?;
                self.expect_and_discard(Token::CloseParen)?;
                Ok(TypeExpr::Typeof(Box::new(expr)))
            }
            Token::OpenParen => {
                self.advance();
                let mut elements = vec![self.parse_type()?];
                while self.eat(&Token::Comma) {
                    elements.push(self.parse_type()?);
                }
                self.expect_and_discard(Token::CloseParen)?;
                if elements.len() == 1 {
                    Ok(elements.pop().unwrap())
                } else {
                    Ok(TypeExpr::Tuple(elements))
                }
            }
            Token::Identifier(name) => {
                self.advance();
                if self.next_is(&Token::Lt) && !is_primitive_name(name.as_str()) {
                    self.advance();
                    let mut args = vec![self.parse_type()?];
                    while self.eat(&Token::Comma) {
                        args.push(self.parse_type()?);
                    }
                    self.expect_and_discard(Token::Gt)?;
                    Ok(TypeExpr::Generic { name, args })
                } else {
                    Ok(TypeExpr::Named(name))
                }
            }
            Token::Eof => self.premature_eof(),
            other => self.unexpected(other),
        }
    }

    /// The `&`/`?&` has been consumed; the region keyword, if any, is
    /// lexically next.
    fn parse_reference(&mut self, nullable: bool) -> Result<TypeExpr> {
        let region = match self.peek_token() {
            Token::Stack => {
                self.advance();
                Region::Stack
            }
            Token::Heap => {
                self.advance();
                Region::Heap
            }
            Token::Static => {
                self.advance();
                Region::Static
            }
            Token::Arena => {
                self.advance();
                self.expect_and_discard(Token::Lt)?;
                let name = self.parse_identifier()?;
                self.expect_and_discard(Token::Gt)?;
                Region::Arena(name)
            }
            // A reference written without a region is a stack reference.
            _ => Region::Stack,
        };
        let mutable = self.eat(&Token::Mut);
        let pointee = self.parse_type()?;
        Ok(TypeExpr::Reference {
            pointee: Box::new(pointee),
            region,
            mutable,
            nullable,
        })
    }

    // ---- statements ----

    fn parse_block(&mut self) -> Result<Block> {
        let position = self.position();
        self.expect_and_discard(Token::OpenBrace)?;
        let mut stmts = Vec::new();
        loop {
            if self.eat(&Token::CloseBrace) {
                break;
            }
            if self.tokens.at_eof() {
                return Err(ParserError {
                    position: self.position(),
                    description: ParserErrorDescription::Described(
                        "unterminated block".to_owned(),
                    ),
                });
            }
            match self.parse_stmt() {
                Ok(stmt) => stmts.push(stmt),
                Err(error) => {
                    self.report(&error);
                    self.synchronize_stmt();
                }
            }
        }
        Ok(Block { stmts, position })
    }

    fn synchronize_stmt(&mut self) {
        while !self.tokens.at_eof() {
            match self.peek_token() {
                Token::Semicolon => {
                    self.advance();
                    break;
                }
                Token::CloseBrace => break,
                _ => self.advance(),
            }
        }
    }

    fn parse_stmt(&mut self) -> Result<Stmt> {
        let position = self.position();
        match self.peek_token() {
            Token::OpenBrace => {
                let block = self.parse_block()?;
                Ok(Stmt {
                    kind: StmtKind::Block(block),
                    position,
                })
            }
            Token::If => {
                if self.nth_is(1, &Token::Const) {
                    self.parse_if_const()
                } else {
                    self.parse_if()
                }
            }
            Token::While => self.parse_while(None),
            Token::For => self.parse_for(None),
            Token::Identifier(label)
                if self.nth_is(1, &Token::Colon)
                    && (self.nth_is(2, &Token::While) || self.nth_is(2, &Token::For)) =>
            {
                self.advance();
                self.advance();
                if self.next_is(&Token::While) {
                    self.parse_while(Some(label))
                } else {
                    self.parse_for(Some(label))
                }
            }
            Token::Match => self.parse_match(),
            Token::Return => {
                self.advance();
                let value = if self.next_is(&Token::Semicolon) {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                self.expect_and_discard(Token::Semicolon)?;
                Ok(Stmt {
                    kind: StmtKind::Return(value),
                    position,
                })
            }
            Token::Break => {
                self.advance();
                let label = match self.peek_token() {
                    Token::Identifier(label) => {
                        self.advance();
                        Some(label)
                    }
                    _ => None,
                };
                self.expect_and_discard(Token::Semicolon)?;
                Ok(Stmt {
                    kind: StmtKind::Break(label),
                    position,
                })
            }
            Token::Continue => {
                self.advance();
                let label = match self.peek_token() {
                    Token::Identifier(label) => {
                        self.advance();
                        Some(label)
                    }
                    _ => None,
                };
                self.expect_and_discard(Token::Semicolon)?;
                Ok(Stmt {
                    kind: StmtKind::Continue(label),
                    position,
                })
            }
            Token::Defer => {
                self.advance();
                let expr = self.parse_expr()?;
                self.expect_and_discard(Token::Semicolon)?;
                Ok(Stmt {
                    kind: StmtKind::Defer(expr),
                    position,
                })
            }
            Token::Unsafe => {
                self.advance();
                let escape = self.eat(&Token::Escape);
                let body = self.parse_block()?;
                Ok(Stmt {
                    kind: StmtKind::Unsafe { escape, body },
                    position,
                })
            }
            Token::Region => {
                let region = self.parse_region()?;
                Ok(Stmt {
                    kind: StmtKind::Region(region),
                    position,
                })
            }
            Token::StaticAssert => {
                let (cond, message) = self.parse_static_assert()?;
                Ok(Stmt {
                    kind: StmtKind::StaticAssert { cond, message },
                    position,
                })
            }
            Token::Semicolon => {
                self.advance();
                Ok(Stmt {
                    kind: StmtKind::Empty,
                    position,
                })
            }
            Token::Const => {
                self.advance();
                let local = self.parse_local(true, position)?;
                Ok(Stmt {
                    kind: StmtKind::Local(local),
                    position,
                })
            }
            _ => {
                if let Some(local) = self.try_parse_local(position)? {
                    Ok(Stmt {
                        kind: StmtKind::Local(local),
                        position,
                    })
                } else {
                    let expr = self.parse_expr()?;
                    self.expect_and_discard(Token::Semicolon)?;
                    Ok(Stmt {
                        kind: StmtKind::Expr(expr),
                        position,
                    })
                }
            }
        }
    }

    /// A statement is a declaration when a type followed by a bare name and
    /// `=` or `;` parses from here; otherwise rewind and treat it as an
    /// expression.
    fn try_parse_local(&mut self, position: Position) -> Result<Option<LocalDecl>> {
        let checkpoint = self.tokens.checkpoint();
        match self.parse_type() {
            Ok(ty) => {
                if let Token::Identifier(name) = self.peek_token() {
                    if self.nth_is(1, &Token::Assign) || self.nth_is(1, &Token::Semicolon) {
                        self.advance();
                        let init = if self.eat(&Token::Assign) {
                            Some(self.parse_initializer()?)
                        } else {
                            None
                        };
                        self.expect_and_discard(Token::Semicolon)?;
                        return Ok(Some(LocalDecl {
                            name,
                            ty,
                            init,
                            is_const: false,
                            position,
                            symbol: None,
                        }));
                    }
                }
                self.tokens.rewind(checkpoint);
                Ok(None)
            }
            Err(_) => {
                self.tokens.rewind(checkpoint);
                Ok(None)
            }
        }
    }

    /// A local declaration whose shape is already committed (after `const`).
    fn parse_local(&mut self, is_const: bool, position: Position) -> Result<LocalDecl> {
        let ty = self.parse_type()?;
        let name = self.parse_identifier()?;
        let init = if self.eat(&Token::Assign) {
            Some(self.parse_initializer()?)
        } else {
            None
        };
        self.expect_and_discard(Token::Semicolon)?;
        Ok(LocalDecl {
            name,
            ty,
            init,
            is_const,
            position,
            symbol: None,
        })
    }

    /// An initializer: a brace list or an expression.
    fn parse_initializer(&mut self) -> Result<Expr> {
        if self.next_is(&Token::OpenBrace) {
            let position = self.position();
            self.advance();
            let mut elements = Vec::new();
            while !self.next_is(&Token::CloseBrace) {
                elements.push(self.parse_initializer()?);
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
            self.expect_and_discard(Token::CloseBrace)?;
            Ok(Expr::new(ExprKind::InitList(elements), position))
        } else {
            self.parse_expr()
        }
    }

    fn parse_if(&mut self) -> Result<Stmt> {
        let position = self.position();
        self.expect_and_discard(Token::If)?;
        self.expect_and_discard(Token::OpenParen)?;
        let cond = self.parse_expr()?;
        self.expect_and_discard(Token::CloseParen)?;
        let then = self.parse_block()?;
        let else_branch = if self.eat(&Token::Else) {
            Some(Box::new(self.parse_stmt()?))
        } else {
            None
        };
        Ok(Stmt {
            kind: StmtKind::If {
                cond,
                then,
                else_branch,
            },
            position,
        })
    }

    fn parse_if_const(&mut self) -> Result<Stmt> {
        let position = self.position();
        self.expect_and_discard(Token::If)?;
        self.expect_and_discard(Token::Const)?;
        self.expect_and_discard(Token::OpenParen)?;
        let cond = self.parse_expr()?;
        self.expect_and_discard(Token::CloseParen)?;
        let then = self.parse_block()?;
        let else_branch = if self.eat(&Token::Else) {
            Some(Box::new(self.parse_stmt()?))
        } else {
            None
        };
        Ok(Stmt {
            kind: StmtKind::IfConst {
                cond,
                then,
                else_branch,
                taken: None,
            },
            position,
        })
    }

    fn parse_while(&mut self, label: Option<Name>) -> Result<Stmt> {
        let position = self.position();
        self.expect_and_discard(Token::While)?;
        self.expect_and_discard(Token::OpenParen)?;
        let cond = self.parse_expr()?;
        self.expect_and_discard(Token::CloseParen)?;
        let body = self.parse_block()?;
        Ok(Stmt {
            kind: StmtKind::While { label, cond, body },
            position,
        })
    }

    fn parse_for(&mut self, label: Option<Name>) -> Result<Stmt> {
        let position = self.position();
        self.expect_and_discard(Token::For)?;
        self.expect_and_discard(Token::OpenParen)?;
        let init = if self.eat(&Token::Semicolon) {
            None
        } else {
            let init_position = self.position();
            if let Some(local) = self.try_parse_local(init_position)? {
                Some(Box::new(Stmt {
                    kind: StmtKind::Local(local),
                    position: init_position,
                }))
            } else {
                let expr = self.parse_expr()?;
                self.expect_and_discard(Token::Semicolon)?;
                Some(Box::new(Stmt {
                    kind: StmtKind::Expr(expr),
                    position: init_position,
                }))
            }
        };
        let cond = if self.next_is(&Token::Semicolon) {
            None
        } else {
            Some(self.parse_expr()?)
        };
        self.expect_and_discard(Token::Semicolon)?;
        let step = if self.next_is(&Token::CloseParen) {
            None
        } else {
            Some(self.parse_expr()?)
        };
        self.expect_and_discard(Token::CloseParen)?;
        let body = self.parse_block()?;
        Ok(Stmt {
            kind: StmtKind::For {
                label,
                init,
                cond,
                step,
                body,
            },
            position,
        })
    }

    fn parse_match(&mut self) -> Result<Stmt> {
        let position = self.position();
        self.expect_and_discard(Token::Match)?;
        self.expect_and_discard(Token::OpenParen)?;
        let scrutinee = self.parse_expr()?;
        self.expect_and_discard(Token::CloseParen)?;
        self.expect_and_discard(Token::OpenBrace)?;
        let mut arms = Vec::new();
        while !self.next_is(&Token::CloseBrace) {
            if self.tokens.at_eof() {
                return self.premature_eof();
            }
            let arm_position = self.position();
            let pattern = if self.eat(&Token::Default) {
                Pattern::Default
            } else {
                self.expect_and_discard(Token::Case)?;
                self.parse_pattern()?
            };
            self.expect_and_discard(Token::Colon)?;
            let mut body = Vec::new();
            while !matches!(
                self.peek_token(),
                Token::Case | Token::Default | Token::CloseBrace | Token::Eof
            ) {
                body.push(self.parse_stmt()?);
            }
            arms.push(MatchArm {
                pattern,
                body,
                position: arm_position,
            });
        }
        self.expect_and_discard(Token::CloseBrace)?;
        Ok(Stmt {
            kind: StmtKind::Match { scrutinee, arms },
            position,
        })
    }

    fn parse_pattern(&mut self) -> Result<Pattern> {
        if self.eat(&Token::Dot) {
            let name = self.parse_identifier()?;
            let binding = if self.eat(&Token::OpenParen) {
                let binding = self.parse_identifier()?;
                self.expect_and_discard(Token::CloseParen)?;
                Some(binding)
            } else {
                None
            };
            return Ok(Pattern::Variant {
                name,
                binding,
                symbol: None,
            });
        }
        let lo = self.parse_binary(1)?;
        if self.eat(&Token::DotDot) {
            let hi = self.parse_binary(1)?;
            Ok(Pattern::Range { lo, hi })
        } else {
            Ok(Pattern::Expr(lo))
        }
    }

    // ---- expressions ----

    pub fn parse_expr(&mut self) -> Result<Expr> {
        let lhs = self.parse_binary(1)?;
        let op = match self.peek_token() {
            Token::Assign => None,
            Token::PlusAssign => Some(BinaryOp::Add),
            Token::MinusAssign => Some(BinaryOp::Sub),
            Token::StarAssign => Some(BinaryOp::Mul),
            Token::SlashAssign => Some(BinaryOp::Div),
            Token::PercentAssign => Some(BinaryOp::Rem),
            Token::AmpAssign => Some(BinaryOp::BitAnd),
            Token::PipeAssign => Some(BinaryOp::BitOr),
            Token::CaretAssign => Some(BinaryOp::BitXor),
            Token::ShlAssign => Some(BinaryOp::Shl),
            Token::ShrAssign => Some(BinaryOp::Shr),
            _ => return Ok(lhs),
        };
        self.advance();
        let position = lhs.position;
        let rhs = self.parse_expr()?;
        Ok(Expr::new(
            ExprKind::Assign {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            position,
        ))
    }

    fn binary_op(token: &Token) -> Option<(BinaryOp, u8)> {
        Some(match token {
            Token::PipePipe => (BinaryOp::Or, 1),
            Token::AmpAmp => (BinaryOp::And, 2),
            Token::Pipe => (BinaryOp::BitOr, 3),
            Token::Caret => (BinaryOp::BitXor, 4),
            Token::Amp => (BinaryOp::BitAnd, 5),
            Token::EqEq => (BinaryOp::Eq, 6),
            Token::BangEq => (BinaryOp::Ne, 6),
            Token::Lt => (BinaryOp::Lt, 7),
            Token::Le => (BinaryOp::Le, 7),
            Token::Gt => (BinaryOp::Gt, 7),
            Token::Ge => (BinaryOp::Ge, 7),
            Token::Shl => (BinaryOp::Shl, 8),
            Token::Shr => (BinaryOp::Shr, 8),
            Token::Plus => (BinaryOp::Add, 9),
            Token::Minus => (BinaryOp::Sub, 9),
            Token::PlusWrap => (BinaryOp::AddWrap, 9),
            Token::MinusWrap => (BinaryOp::SubWrap, 9),
            Token::PlusSat => (BinaryOp::AddSat, 9),
            Token::MinusSat => (BinaryOp::SubSat, 9),
            Token::Star => (BinaryOp::Mul, 10),
            Token::Slash => (BinaryOp::Div, 10),
            Token::Percent => (BinaryOp::Rem, 10),
            Token::StarWrap => (BinaryOp::MulWrap, 10),
            Token::StarSat => (BinaryOp::MulSat, 10),
            _ => return None,
        })
    }

    fn parse_binary(&mut self, min_precedence: u8) -> Result<Expr> {
        let mut lhs = self.parse_unary()?;
        while let Some((op, precedence)) = Self::binary_op(&self.peek_token()) {
            if precedence < min_precedence {
                break;
            }
            self.advance();
            let rhs = self.parse_binary(precedence + 1)?;
            let position = lhs.position;
            lhs = Expr::new(
                ExprKind::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                position,
            );
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        let position = self.position();
        let unary = |op| move |operand| ExprKind::Unary {
            op,
            operand: Box::new(operand),
        };
        match self.peek_token() {
            Token::Minus => {
                self.advance();
                let operand = self.parse_unary()?;
                Ok(Expr::new(unary(UnaryOp::Neg)(operand), position))
            }
            Token::Bang => {
                self.advance();
                let operand = self.parse_unary()?;
                Ok(Expr::new(unary(UnaryOp::Not)(operand), position))
            }
            Token::Tilde => {
                self.advance();
                let operand = self.parse_unary()?;
                Ok(Expr::new(unary(UnaryOp::BitNot)(operand), position))
            }
            Token::Star => {
                self.advance();
                let operand = self.parse_unary()?;
                Ok(Expr::new(unary(UnaryOp::Deref)(operand), position))
            }
            Token::Amp => {
                self.advance();
                let operand = self.parse_unary()?;
                Ok(Expr::new(unary(UnaryOp::AddrOf)(operand), position))
            }
            Token::PlusPlus => {
                self.advance();
                let operand = self.parse_unary()?;
                Ok(Expr::new(unary(UnaryOp::PreInc)(operand), position))
            }
            Token::MinusMinus => {
                self.advance();
                let operand = self.parse_unary()?;
                Ok(Expr::new(unary(UnaryOp::PreDec)(operand), position))
            }
            Token::Try => {
                self.advance();
                let operand = self.parse_unary()?;
                Ok(Expr::new(ExprKind::Try(Box::new(operand)), position))
            }
            Token::Spawn => {
                self.advance();
                let operand = self.parse_unary()?;
                Ok(Expr::new(ExprKind::Spawn(Box::new(operand)), position))
            }
            Token::New => self.parse_new(),
            Token::Sizeof => {
                self.advance();
                if self.eat(&Token::Ellipsis) {
                    self.expect_and_discard(Token::OpenParen)?;
                    let pack = self.parse_identifier()?;
                    self.expect_and_discard(Token::CloseParen)?;
                    Ok(Expr::new(ExprKind::SizeofPack(pack), position))
                } else {
                    self.expect_and_discard(Token::OpenParen)?;
                    let ty = self.parse_type()?;
                    self.expect_and_discard(Token::CloseParen)?;
                    Ok(Expr::new(ExprKind::Sizeof(ty), position))
                }
            }
            Token::Alignof => {
                self.advance();
                self.expect_and_discard(Token::OpenParen)?;
                let ty = self.parse_type()?;
                self.expect_and_discard(Token::CloseParen)?;
                Ok(Expr::new(ExprKind::Alignof(ty), position))
            }
            Token::Fieldcount => {
                self.advance();
                self.expect_and_discard(Token::OpenParen)?;
                let ty = self.parse_type()?;
                self.expect_and_discard(Token::CloseParen)?;
                Ok(Expr::new(ExprKind::Fieldcount(ty), position))
            }
            Token::VolatileLoad => {
                self.advance();
                self.expect_and_discard(Token::OpenParen)?;
                let pointer = self.parse_expr()?;
                self.expect_and_discard(Token::CloseParen)?;
                Ok(Expr::new(
                    ExprKind::VolatileLoad(Box::new(pointer)),
                    position,
                ))
            }
            Token::VolatileStore => {
                self.advance();
                self.expect_and_discard(Token::OpenParen)?;
                let pointer = self.parse_expr()?;
                self.expect_and_discard(Token::Comma)?;
                let value = self.parse_expr()?;
                self.expect_and_discard(Token::CloseParen)?;
                Ok(Expr::new(
                    ExprKind::VolatileStore {
                        pointer: Box::new(pointer),
                        value: Box::new(value),
                    },
                    position,
                ))
            }
            Token::Asm => {
                self.advance();
                self.expect_and_discard(Token::OpenParen)?;
                let text = match self.peek_token() {
                    Token::Str(text) => {
                        self.advance();
                        text
                    }
                    other => return self.unexpected(other),
                };
                self.expect_and_discard(Token::CloseParen)?;
                Ok(Expr::new(ExprKind::Asm(text), position))
            }
            Token::OpenParen => {
                if let Some(cast) = self.try_parse_cast(position)? {
                    Ok(cast)
                } else {
                    self.parse_postfix()
                }
            }
            _ => self.parse_postfix(),
        }
    }

    /// `(T) operand` is a cast when `T` parses as a type, the parenthesis
    /// closes, and what follows begins an expression. Bare nonprimitive
    /// identifiers stay expressions so `(x) - y` keeps meaning subtraction.
    fn try_parse_cast(&mut self, position: Position) -> Result<Option<Expr>> {
        let checkpoint = self.tokens.checkpoint();
        self.advance();
        let ty = match self.parse_type() {
            Ok(ty) => ty,
            Err(_) => {
                self.tokens.rewind(checkpoint);
                return Ok(None);
            }
        };
        let plausible = match &ty {
            TypeExpr::Named(name) => is_primitive_name(name.as_str()),
            _ => true,
        };
        if !plausible || !self.next_is(&Token::CloseParen) {
            self.tokens.rewind(checkpoint);
            return Ok(None);
        }
        self.advance();
        if !starts_expression(&self.peek_token()) {
            self.tokens.rewind(checkpoint);
            return Ok(None);
        }
        let operand = self.parse_unary()?;
        Ok(Some(Expr::new(
            ExprKind::Cast {
                ty,
                operand: Box::new(operand),
            },
            position,
        )))
    }

    fn parse_new(&mut self) -> Result<Expr> {
        let position = self.position();
        self.expect_and_discard(Token::New)?;
        let region = if self.eat(&Token::Lt) {
            let name = self.parse_identifier()?;
            self.expect_and_discard(Token::Gt)?;
            Some(name)
        } else {
            None
        };
        let ty = self.parse_type()?;
        let init = if self.eat(&Token::OpenParen) {
            let init = self.parse_expr()?;
            self.expect_and_discard(Token::CloseParen)?;
            Some(Box::new(init))
        } else {
            None
        };
        Ok(Expr::new(ExprKind::New { region, ty, init }, position))
    }

    fn parse_call_args(&mut self) -> Result<Vec<Expr>> {
        self.expect_and_discard(Token::OpenParen)?;
        let mut args = Vec::new();
        while !self.next_is(&Token::CloseParen) {
            args.push(self.parse_expr()?);
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect_and_discard(Token::CloseParen)?;
        Ok(args)
    }

    fn parse_postfix(&mut self) -> Result<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            let position = expr.position;
            match self.peek_token() {
                Token::OpenParen => {
                    let args = self.parse_call_args()?;
                    expr = Expr::new(
                        ExprKind::Call {
                            callee: Box::new(expr),
                            generic_args: Vec::new(),
                            args,
                        },
                        position,
                    );
                }
                Token::ColonColon if self.nth_is(1, &Token::Lt) => {
                    self.advance();
                    self.advance();
                    let mut generic_args = Vec::new();
                    loop {
                        match self.peek_token() {
                            Token::Int { .. } | Token::OpenParen | Token::Minus => {
                                generic_args.push(GenericArg::Value(self.parse_binary(1)?));
                            }
                            _ => generic_args.push(GenericArg::Type(self.parse_type()?)),
                        }
                        if !self.eat(&Token::Comma) {
                            break;
                        }
                    }
                    self.expect_and_discard(Token::Gt)?;
                    let args = self.parse_call_args()?;
                    expr = Expr::new(
                        ExprKind::Call {
                            callee: Box::new(expr),
                            generic_args,
                            args,
                        },
                        position,
                    );
                }
                Token::Dot => {
                    self.advance();
                    let name = self.parse_identifier()?;
                    if self.next_is(&Token::OpenParen) {
                        let args = self.parse_call_args()?;
                        expr = Expr::new(
                            ExprKind::MethodCall {
                                receiver: Box::new(expr),
                                method: name,
                                args,
                                symbol: None,
                            },
                            position,
                        );
                    } else {
                        expr = Expr::new(
                            ExprKind::Field {
                                base: Box::new(expr),
                                name,
                                through_pointer: false,
                            },
                            position,
                        );
                    }
                }
                Token::Arrow => {
                    self.advance();
                    let name = self.parse_identifier()?;
                    expr = Expr::new(
                        ExprKind::Field {
                            base: Box::new(expr),
                            name,
                            through_pointer: true,
                        },
                        position,
                    );
                }
                Token::OpenBracket => {
                    self.advance();
                    let index = self.parse_expr()?;
                    let index = if self.eat(&Token::DotDot) {
                        let hi = self.parse_expr()?;
                        let index_position = index.position;
                        Expr::new(
                            ExprKind::Range {
                                lo: Box::new(index),
                                hi: Box::new(hi),
                            },
                            index_position,
                        )
                    } else {
                        index
                    };
                    self.expect_and_discard(Token::CloseBracket)?;
                    expr = Expr::new(
                        ExprKind::Index {
                            base: Box::new(expr),
                            index: Box::new(index),
                        },
                        position,
                    );
                }
                Token::PlusPlus => {
                    self.advance();
                    expr = Expr::new(
                        ExprKind::Unary {
                            op: UnaryOp::PostInc,
                            operand: Box::new(expr),
                        },
                        position,
                    );
                }
                Token::MinusMinus => {
                    self.advance();
                    expr = Expr::new(
                        ExprKind::Unary {
                            op: UnaryOp::PostDec,
                            operand: Box::new(expr),
                        },
                        position,
                    );
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        let position = self.position();
        match self.peek_token() {
            Token::Int { value, ty } => {
                self.advance();
                Ok(Expr::new(ExprKind::IntLit { value, suffix: ty }, position))
            }
            Token::Float { value, single } => {
                self.advance();
                Ok(Expr::new(ExprKind::FloatLit { value, single }, position))
            }
            Token::Str(value) => {
                self.advance();
                Ok(Expr::new(ExprKind::StrLit(value), position))
            }
            Token::Char(value) => {
                self.advance();
                Ok(Expr::new(ExprKind::CharLit(value), position))
            }
            Token::True => {
                self.advance();
                Ok(Expr::new(ExprKind::BoolLit(true), position))
            }
            Token::False => {
                self.advance();
                Ok(Expr::new(ExprKind::BoolLit(false), position))
            }
            Token::Null => {
                self.advance();
                Ok(Expr::new(ExprKind::NullLit, position))
            }
            Token::Identifier(name) => {
                self.advance();
                Ok(Expr::new(
                    ExprKind::Ident { name, symbol: None },
                    position,
                ))
            }
            Token::OpenParen => {
                self.advance();
                let expr = self.parse_expr()?;
                if self.eat(&Token::Comma) {
                    let mut elements = vec![expr];
                    while !self.next_is(&Token::CloseParen) {
                        elements.push(self.parse_expr()?);
                        if !self.eat(&Token::Comma) {
                            break;
                        }
                    }
                    self.expect_and_discard(Token::CloseParen)?;
                    Ok(Expr::new(ExprKind::Tuple(elements), position))
                } else {
                    self.expect_and_discard(Token::CloseParen)?;
                    Ok(expr)
                }
            }
            Token::PipePipe => {
                self.advance();
                let body = self.parse_expr()?;
                Ok(Expr::new(
                    ExprKind::Closure {
                        params: Vec::new(),
                        body: Box::new(body),
                    },
                    position,
                ))
            }
            Token::Pipe => {
                self.advance();
                let mut params = Vec::new();
                while !self.next_is(&Token::Pipe) {
                    let param_position = self.position();
                    let ty = self.parse_type()?;
                    let name = self.parse_identifier()?;
                    params.push(ClosureParam {
                        name,
                        ty,
                        position: param_position,
                    });
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
                self.expect_and_discard(Token::Pipe)?;
                let body = self.parse_expr()?;
                Ok(Expr::new(
                    ExprKind::Closure {
                        params,
                        body: Box::new(body),
                    },
                    position,
                ))
            }
            Token::Eof => self.premature_eof(),
            other => self.unexpected(other),
        }
    }
}

fn starts_expression(token: &Token) -> bool {
    matches!(
        token,
        Token::Int { .. }
            | Token::Float { .. }
            | Token::Str(_)
            | Token::Char(_)
            | Token::True
            | Token::False
            | Token::Null
            | Token::Identifier(_)
            | Token::OpenParen
            | Token::Minus
            | Token::Bang
            | Token::Tilde
            | Token::Star
            | Token::Amp
            | Token::PlusPlus
            | Token::MinusMinus
            | Token::New
            | Token::Try
            | Token::Spawn
            | Token::Sizeof
            | Token::Alignof
            | Token::Fieldcount
            | Token::VolatileLoad
            | Token::VolatileStore
            | Token::Pipe
            | Token::PipePipe
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{FileId, Source};

    fn parse(text: &str) -> (Unit, Diagnostics) {
        let mut diagnostics = Diagnostics::new();
        let source = Source::from_text(FileId(0), text);
        let tokens = Tokens::lex(source, &mut diagnostics);
        let unit = Parser::new(tokens, &mut diagnostics).parse_unit();
        (unit, diagnostics)
    }

    fn parse_ok(text: &str) -> Unit {
        let (unit, diagnostics) = parse(text);
        assert!(
            !diagnostics.has_errors(),
            "unexpected parse errors in {:?}",
            text
        );
        unit
    }

    #[test]
    fn function_with_body() {
        let unit = parse_ok("int add(int a, int b) { return a + b; }");
        assert_eq!(unit.decls.len(), 1);
        match &unit.decls[0] {
            Decl::Function(f) => {
                assert_eq!(f.name.as_str(), "add");
                assert_eq!(f.params.len(), 2);
                assert!(f.body.is_some());
            }
            other => panic!("expected function, got {:?}", other),
        }
    }

    #[test]
    fn reference_types_carry_regions() {
        let unit = parse_ok("&stack int f(&heap mut int p, ?&arena<P> int q);");
        match &unit.decls[0] {
            Decl::Function(f) => {
                assert!(matches!(
                    &f.return_type,
                    TypeExpr::Reference {
                        region: Region::Stack,
                        mutable: false,
                        nullable: false,
                        ..
                    }
                ));
                assert!(matches!(
                    &f.params[0].ty,
                    TypeExpr::Reference {
                        region: Region::Heap,
                        mutable: true,
                        ..
                    }
                ));
                match &f.params[1].ty {
                    TypeExpr::Reference {
                        region: Region::Arena(name),
                        nullable: true,
                        ..
                    } => assert_eq!(name.as_str(), "P"),
                    other => panic!("expected arena reference, got {:?}", other),
                }
            }
            other => panic!("expected function, got {:?}", other),
        }
    }

    #[test]
    fn reference_without_region_defaults_to_stack() {
        let unit = parse_ok("void f(&mut int p);");
        match &unit.decls[0] {
            Decl::Function(f) => assert!(matches!(
                &f.params[0].ty,
                TypeExpr::Reference {
                    region: Region::Stack,
                    mutable: true,
                    ..
                }
            )),
            other => panic!("expected function, got {:?}", other),
        }
    }

    #[test]
    fn tagged_union_and_match() {
        let unit = parse_ok(
            "enum union Shape { Circle(double), Point, }\n\
             int f(Shape s) {\n\
               match (s) {\n\
                 case .Circle(r): return 1;\n\
                 case .Point: return 2;\n\
                 default: return 0;\n\
               }\n\
             }",
        );
        assert_eq!(unit.decls.len(), 2);
        match &unit.decls[0] {
            Decl::Tagged(t) => {
                assert_eq!(t.variants.len(), 2);
                assert!(t.variants[0].payload.is_some());
                assert!(t.variants[1].payload.is_none());
            }
            other => panic!("expected tagged union, got {:?}", other),
        }
        match &unit.decls[1] {
            Decl::Function(f) => {
                let body = f.body.as_ref().unwrap();
                match &body.stmts[0].kind {
                    StmtKind::Match { arms, .. } => {
                        assert_eq!(arms.len(), 3);
                        assert!(matches!(
                            &arms[0].pattern,
                            Pattern::Variant { binding: Some(_), .. }
                        ));
                        assert!(matches!(&arms[2].pattern, Pattern::Default));
                    }
                    other => panic!("expected match, got {:?}", other),
                }
            }
            other => panic!("expected function, got {:?}", other),
        }
    }

    #[test]
    fn case_ranges_parse() {
        let unit = parse_ok(
            "int f(int x) { match (x) { case 0..9: return 1; default: return 0; } }",
        );
        match &unit.decls[0] {
            Decl::Function(f) => match &f.body.as_ref().unwrap().stmts[0].kind {
                StmtKind::Match { arms, .. } => {
                    assert!(matches!(&arms[0].pattern, Pattern::Range { .. }));
                }
                other => panic!("expected match, got {:?}", other),
            },
            other => panic!("expected function, got {:?}", other),
        }
    }

    #[test]
    fn region_declaration_and_new() {
        let unit = parse_ok(
            "void f() { region P { capacity: 1024 } &arena<P> int p = new<P> int; }",
        );
        match &unit.decls[0] {
            Decl::Function(f) => {
                let body = f.body.as_ref().unwrap();
                assert!(matches!(&body.stmts[0].kind, StmtKind::Region(_)));
                match &body.stmts[1].kind {
                    StmtKind::Local(local) => match &local.init {
                        Some(Expr {
                            kind: ExprKind::New { region: Some(r), .. },
                            ..
                        }) => assert_eq!(r.as_str(), "P"),
                        other => panic!("expected new<P>, got {:?}", other),
                    },
                    other => panic!("expected local, got {:?}", other),
                }
            }
            other => panic!("expected function, got {:?}", other),
        }
    }

    #[test]
    fn generic_function_with_constraint() {
        let unit = parse_ok("generic<T: Numeric> T min(T a, T b) { return a; }");
        match &unit.decls[0] {
            Decl::Function(f) => {
                assert_eq!(f.generics.len(), 1);
                assert_eq!(f.generics[0].constraint.as_ref().unwrap().as_str(), "Numeric");
            }
            other => panic!("expected function, got {:?}", other),
        }
    }

    #[test]
    fn pack_parameter_is_not_c_variadic() {
        let unit = parse_ok("generic<T...> int count(T... items) { return sizeof...(T); }");
        match &unit.decls[0] {
            Decl::Function(f) => {
                assert!(f.generics[0].pack);
                assert!(f.params[0].pack);
                assert!(!f.attrs.contains(FnAttrs::VARIADIC));
            }
            other => panic!("expected function, got {:?}", other),
        }
    }

    #[test]
    fn method_definition_binds_to_struct() {
        let unit = parse_ok(
            "struct Vec2 { double x; double y; double length(); }\n\
             double Vec2::length() { return 0.0; }",
        );
        match &unit.decls[1] {
            Decl::Function(f) => {
                assert_eq!(f.owner.as_ref().unwrap().as_str(), "Vec2");
                assert_eq!(f.name.as_str(), "length");
            }
            other => panic!("expected method definition, got {:?}", other),
        }
    }

    #[test]
    fn cast_versus_grouping() {
        let unit = parse_ok("int f(int x) { int y = (int) x; return (x) - 1; }");
        match &unit.decls[0] {
            Decl::Function(f) => {
                let body = f.body.as_ref().unwrap();
                match &body.stmts[0].kind {
                    StmtKind::Local(local) => {
                        assert!(matches!(
                            local.init.as_ref().unwrap().kind,
                            ExprKind::Cast { .. }
                        ));
                    }
                    other => panic!("expected local, got {:?}", other),
                }
                match &body.stmts[1].kind {
                    StmtKind::Return(Some(e)) => {
                        assert!(matches!(
                            e.kind,
                            ExprKind::Binary {
                                op: BinaryOp::Sub,
                                ..
                            }
                        ));
                    }
                    other => panic!("expected return, got {:?}", other),
                }
            }
            other => panic!("expected function, got {:?}", other),
        }
    }

    #[test]
    fn defer_unsafe_and_if_const() {
        let unit = parse_ok(
            "void f() {\n\
               defer cleanup();\n\
               unsafe { }\n\
               unsafe escape { }\n\
               if const (1) { } else { }\n\
             }",
        );
        match &unit.decls[0] {
            Decl::Function(f) => {
                let body = f.body.as_ref().unwrap();
                assert!(matches!(&body.stmts[0].kind, StmtKind::Defer(_)));
                assert!(matches!(
                    &body.stmts[1].kind,
                    StmtKind::Unsafe { escape: false, .. }
                ));
                assert!(matches!(
                    &body.stmts[2].kind,
                    StmtKind::Unsafe { escape: true, .. }
                ));
                assert!(matches!(&body.stmts[3].kind, StmtKind::IfConst { .. }));
            }
            other => panic!("expected function, got {:?}", other),
        }
    }

    #[test]
    fn labeled_loops_and_jumps() {
        let unit = parse_ok(
            "void f() { outer: while (true) { for (;;) { break outer; continue outer; } } }",
        );
        match &unit.decls[0] {
            Decl::Function(f) => match &f.body.as_ref().unwrap().stmts[0].kind {
                StmtKind::While { label, .. } => {
                    assert_eq!(label.as_ref().unwrap().as_str(), "outer")
                }
                other => panic!("expected labeled while, got {:?}", other),
            },
            other => panic!("expected function, got {:?}", other),
        }
    }

    #[test]
    fn turbofish_generic_call() {
        let unit = parse_ok("int f() { return min::<int>(3, 7); }");
        match &unit.decls[0] {
            Decl::Function(f) => match &f.body.as_ref().unwrap().stmts[0].kind {
                StmtKind::Return(Some(e)) => match &e.kind {
                    ExprKind::Call { generic_args, args, .. } => {
                        assert_eq!(generic_args.len(), 1);
                        assert_eq!(args.len(), 2);
                    }
                    other => panic!("expected call, got {:?}", other),
                },
                other => panic!("expected return, got {:?}", other),
            },
            other => panic!("expected function, got {:?}", other),
        }
    }

    #[test]
    fn errors_recover_at_the_next_declaration() {
        let (unit, diagnostics) = parse("int broken(; int ok() { return 1; }");
        assert!(diagnostics.has_errors());
        // The second function still parses.
        assert!(unit
            .decls
            .iter()
            .any(|d| matches!(d, Decl::Function(f) if f.name.as_str() == "ok")));
    }
}
