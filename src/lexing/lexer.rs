//! The SafeC lexer. Consumes the preprocessed character stream and emits
//! surface tokens with positions. Lexical errors are reported through the
//! diagnostic sink and lexing continues at the next character, so one bad
//! byte does not hide the rest of the file.

use std::collections::HashMap;

use crate::common::interning::Name;
use crate::common::peekable_buffer::PeekableBuffer;
use crate::diagnostics::{Category, Diagnostics};
use crate::lexing::char_escapes;
use crate::lexing::keywords;
use crate::lexing::tokens::Token;
use crate::source::{Position, Source};
use crate::types::IntType;

/// A lexed token that remembers where it came from.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LexedToken {
    pub position: Position,
    pub token: Token,
}

#[derive(Debug)]
pub enum ErrorDescription {
    Described(String),
    UnknownChar(char),
    InvalidEscape(char),
    UnterminatedString,
    UnterminatedChar,
    UnterminatedComment,
    MalformedNumber(String),
    PrematureEof,
}

#[derive(Debug)]
pub struct Error {
    pub position: Position,
    pub description: ErrorDescription,
}

impl Error {
    pub fn category(&self) -> Category {
        match self.description {
            ErrorDescription::UnknownChar(_) | ErrorDescription::MalformedNumber(_) => {
                Category::LexChar
            }
            ErrorDescription::InvalidEscape(_) => Category::LexEscape,
            _ => Category::LexUnterminated,
        }
    }

    pub fn message(&self) -> String {
        match &self.description {
            ErrorDescription::Described(message) => message.clone(),
            ErrorDescription::UnknownChar(c) => format!("unknown character {:?}", c),
            ErrorDescription::InvalidEscape(c) => format!("invalid escape: \\{}", c),
            ErrorDescription::UnterminatedString => "unterminated string literal".to_owned(),
            ErrorDescription::UnterminatedChar => "unterminated character literal".to_owned(),
            ErrorDescription::UnterminatedComment => "unterminated block comment".to_owned(),
            ErrorDescription::MalformedNumber(detail) => {
                format!("malformed number literal: {}", detail)
            }
            ErrorDescription::PrematureEof => "unexpected end of input".to_owned(),
        }
    }
}

type TokenResult = Result<Token, Error>;

/// The lexer proper: a source to lex plus the character-escape and keyword
/// tables to lex it with.
pub struct Lexer {
    source: Source,
    char_escapes: HashMap<char, char>,
    keywords: HashMap<&'static str, Token>,
}

impl From<Source> for Lexer {
    fn from(source: Source) -> Self {
        Self {
            source,
            char_escapes: char_escapes::new(),
            keywords: keywords::new(),
        }
    }
}

impl Lexer {
    fn error<T>(&self, description: ErrorDescription) -> Result<T, Error> {
        Err(Error {
            position: self.source.position(),
            description,
        })
    }

    fn error_at<T>(&self, position: Position, description: ErrorDescription) -> Result<T, Error> {
        Err(Error {
            position,
            description,
        })
    }

    // The following methods are sub-lexers that are reentrant and handle the
    // lexing of a particular subcontext of the overall source. Each expects
    // the whole context next in the stream, so previous steps working out
    // which sub-lexer to delegate to should use peeks and not reads.

    /// Skip whitespace and comments. Block comments follow C and do not nest.
    fn lex_trivia(&mut self) -> Result<(), Error> {
        loop {
            match self.source.peek() {
                Some(&c) if c.is_whitespace() => {
                    self.source.discard();
                }
                Some(&'/') if self.source.nth_is(1, &'/') => {
                    self.source.discard_many(2);
                    while let Some(&c) = self.source.peek() {
                        self.source.discard();
                        if c == '\n' {
                            break;
                        }
                    }
                }
                Some(&'/') if self.source.nth_is(1, &'*') => {
                    let start = self.source.position();
                    self.source.discard_many(2);
                    loop {
                        match self.source.read() {
                            Some('*') if self.source.next_is(&'/') => {
                                self.source.discard();
                                break;
                            }
                            Some(_) => {}
                            None => {
                                return self
                                    .error_at(start, ErrorDescription::UnterminatedComment)
                            }
                        }
                    }
                }
                _ => break Ok(()),
            }
        }
    }

    fn lex_escape(&mut self) -> Result<char, Error> {
        self.source.discard();
        match self.source.read() {
            Some(escaped) => match self.char_escapes.get(&escaped) {
                Some(&c) => Ok(c),
                None => self.error(ErrorDescription::InvalidEscape(escaped)),
            },
            None => self.error(ErrorDescription::PrematureEof),
        }
    }

    fn lex_char(&mut self) -> TokenResult {
        let start = self.source.position();
        self.source.discard();
        let c = match self.source.peek() {
            Some(&'\\') => self.lex_escape()?,
            Some(&c) if c != '\'' && c != '\n' => {
                self.source.discard();
                c
            }
            _ => return self.error_at(start, ErrorDescription::UnterminatedChar),
        };
        if self.source.next_is(&'\'') {
            self.source.discard();
            Ok(Token::Char(c))
        } else {
            self.error_at(start, ErrorDescription::UnterminatedChar)
        }
    }

    fn lex_string(&mut self) -> TokenResult {
        let start = self.source.position();
        self.source.discard();
        let mut string = String::new();
        loop {
            match self.source.peek() {
                Some(&'"') => {
                    self.source.discard();
                    break Ok(Token::Str(Name::from(string)));
                }
                Some(&'\\') => string.push(self.lex_escape()?),
                Some(&'\n') | None => {
                    break self.error_at(start, ErrorDescription::UnterminatedString)
                }
                Some(&c) => {
                    self.source.discard();
                    string.push(c);
                }
            }
        }
    }

    fn lex_word(&mut self) -> Token {
        let mut word = String::new();
        while let Some(&c) = self.source.peek() {
            if c.is_alphanumeric() || c == '_' {
                self.source.discard();
                word.push(c);
            } else {
                break;
            }
        }
        match self.keywords.get(&word[..]) {
            Some(token) => token.clone(),
            None => Token::Identifier(Name::from(word)),
        }
    }

    fn lex_digits(&mut self, radix: u32, buffer: &mut String) {
        while let Some(&c) = self.source.peek() {
            if c.is_digit(radix) {
                self.source.discard();
                buffer.push(c);
            } else {
                break;
            }
        }
    }

    fn lex_int_suffix(&mut self) -> Result<Option<IntType>, Error> {
        let mut suffix = String::new();
        while let Some(&c) = self.source.peek() {
            if matches!(c, 'u' | 'U' | 'l' | 'L') {
                self.source.discard();
                suffix.push(c.to_ascii_uppercase());
            } else {
                break;
            }
        }
        match suffix.as_str() {
            "" => Ok(None),
            "U" => Ok(Some(IntType::U32)),
            "L" | "LL" => Ok(Some(IntType::I64)),
            "UL" | "LU" | "ULL" | "LLU" => Ok(Some(IntType::U64)),
            other => self.error(ErrorDescription::MalformedNumber(format!(
                "unknown integer suffix {}",
                other
            ))),
        }
    }

    fn lex_radix_number(&mut self, radix: u32) -> TokenResult {
        // Skip the 0x / 0b prefix.
        self.source.discard_many(2);
        let mut digits = String::new();
        self.lex_digits(radix, &mut digits);
        if digits.is_empty() {
            return self.error(ErrorDescription::MalformedNumber(
                "digits expected after radix prefix".to_owned(),
            ));
        }
        let value = match u128::from_str_radix(&digits, radix) {
            Ok(value) => value,
            Err(err) => {
                return self.error(ErrorDescription::MalformedNumber(err.to_string()));
            }
        };
        let ty = self.lex_int_suffix()?;
        Ok(Token::Int { value, ty })
    }

    fn lex_number(&mut self) -> TokenResult {
        if self.source.next_is(&'0') {
            match self.source.peek_nth(1) {
                Some(&'x') | Some(&'X') => return self.lex_radix_number(16),
                Some(&'b') | Some(&'B') => return self.lex_radix_number(2),
                Some(&c) if c.is_digit(8) => {
                    self.source.discard();
                    let mut digits = String::new();
                    self.lex_digits(8, &mut digits);
                    let value = match u128::from_str_radix(&digits, 8) {
                        Ok(value) => value,
                        Err(err) => {
                            return self
                                .error(ErrorDescription::MalformedNumber(err.to_string()));
                        }
                    };
                    let ty = self.lex_int_suffix()?;
                    return Ok(Token::Int { value, ty });
                }
                _ => {}
            }
        }

        let mut digits = String::new();
        self.lex_digits(10, &mut digits);

        // A dot begins a fraction only when a digit follows; `1..10` is a
        // range over two integers.
        let has_fraction =
            self.source.next_is(&'.') && self.source.match_nth(1, |c| c.is_ascii_digit());
        let has_exponent = self.source.match_next(|&c| c == 'e' || c == 'E');

        if !has_fraction && !has_exponent {
            let value = match digits.parse::<u128>() {
                Ok(value) => value,
                Err(err) => {
                    return self.error(ErrorDescription::MalformedNumber(err.to_string()));
                }
            };
            let ty = self.lex_int_suffix()?;
            return Ok(Token::Int { value, ty });
        }

        if has_fraction {
            self.source.discard();
            digits.push('.');
            self.lex_digits(10, &mut digits);
        }
        if self.source.match_next(|&c| c == 'e' || c == 'E') {
            self.source.discard();
            digits.push('e');
            if let Some(&sign) = self.source.peek() {
                if sign == '+' || sign == '-' {
                    self.source.discard();
                    digits.push(sign);
                }
            }
            let before = digits.len();
            self.lex_digits(10, &mut digits);
            if digits.len() == before {
                return self.error(ErrorDescription::MalformedNumber(
                    "digits expected in exponent".to_owned(),
                ));
            }
        }
        let single = match self.source.peek() {
            Some(&'f') | Some(&'F') => {
                self.source.discard();
                true
            }
            _ => false,
        };
        match digits.parse::<f64>() {
            Ok(value) => Ok(Token::Float { value, single }),
            Err(err) => self.error(ErrorDescription::MalformedNumber(err.to_string())),
        }
    }

    fn lex_symbolic(&mut self) -> TokenResult {
        let c = match self.source.read() {
            Some(c) => c,
            None => return self.error(ErrorDescription::PrematureEof),
        };
        match c {
            '{' => Ok(Token::OpenBrace),
            '}' => Ok(Token::CloseBrace),
            '(' => Ok(Token::OpenParen),
            ')' => Ok(Token::CloseParen),
            '[' => Ok(Token::OpenBracket),
            ']' => Ok(Token::CloseBracket),
            ';' => Ok(Token::Semicolon),
            ',' => Ok(Token::Comma),
            '~' => Ok(Token::Tilde),
            '^' => Ok(self.one_or_assign(Token::Caret, Token::CaretAssign)),
            '+' => Ok(self.lex_with_leading_plus()),
            '-' => Ok(self.lex_with_leading_minus()),
            '*' => Ok(self.lex_with_leading_star()),
            '/' => Ok(self.one_or_assign(Token::Slash, Token::SlashAssign)),
            '%' => Ok(self.one_or_assign(Token::Percent, Token::PercentAssign)),
            '&' => Ok(self.lex_with_leading_ampersand()),
            '|' => Ok(self.lex_with_leading_vertical_bar()),
            '!' => Ok(self.one_or_assign(Token::Bang, Token::BangEq)),
            '=' => Ok(self.one_or_assign(Token::Assign, Token::EqEq)),
            '<' => Ok(self.lex_with_leading_left_angle()),
            '>' => Ok(self.lex_with_leading_right_angle()),
            '.' => Ok(self.lex_with_leading_dot()),
            ':' => Ok(self.lex_with_leading_colon()),
            '?' => Ok(self.lex_with_leading_question()),
            unknown => self.error(ErrorDescription::UnknownChar(unknown)),
        }
    }

    fn one_or_assign(&mut self, plain: Token, assigning: Token) -> Token {
        if self.source.next_is(&'=') {
            self.source.discard();
            assigning
        } else {
            plain
        }
    }

    fn lex_with_leading_plus(&mut self) -> Token {
        match self.source.peek() {
            Some(&'|') => {
                self.source.discard();
                Token::PlusWrap
            }
            Some(&'%') => {
                self.source.discard();
                Token::PlusSat
            }
            Some(&'=') => {
                self.source.discard();
                Token::PlusAssign
            }
            Some(&'+') => {
                self.source.discard();
                Token::PlusPlus
            }
            _ => Token::Plus,
        }
    }

    fn lex_with_leading_minus(&mut self) -> Token {
        match self.source.peek() {
            Some(&'|') => {
                self.source.discard();
                Token::MinusWrap
            }
            Some(&'%') => {
                self.source.discard();
                Token::MinusSat
            }
            Some(&'=') => {
                self.source.discard();
                Token::MinusAssign
            }
            Some(&'-') => {
                self.source.discard();
                Token::MinusMinus
            }
            Some(&'>') => {
                self.source.discard();
                Token::Arrow
            }
            _ => Token::Minus,
        }
    }

    fn lex_with_leading_star(&mut self) -> Token {
        match self.source.peek() {
            Some(&'|') => {
                self.source.discard();
                Token::StarWrap
            }
            Some(&'%') => {
                self.source.discard();
                Token::StarSat
            }
            Some(&'=') => {
                self.source.discard();
                Token::StarAssign
            }
            _ => Token::Star,
        }
    }

    fn lex_with_leading_ampersand(&mut self) -> Token {
        match self.source.peek() {
            Some(&'&') => {
                self.source.discard();
                Token::AmpAmp
            }
            Some(&'=') => {
                self.source.discard();
                Token::AmpAssign
            }
            _ => Token::Amp,
        }
    }

    fn lex_with_leading_vertical_bar(&mut self) -> Token {
        match self.source.peek() {
            Some(&'|') => {
                self.source.discard();
                Token::PipePipe
            }
            Some(&'=') => {
                self.source.discard();
                Token::PipeAssign
            }
            _ => Token::Pipe,
        }
    }

    fn lex_with_leading_left_angle(&mut self) -> Token {
        match self.source.peek() {
            Some(&'<') => {
                self.source.discard();
                self.one_or_assign(Token::Shl, Token::ShlAssign)
            }
            Some(&'=') => {
                self.source.discard();
                Token::Le
            }
            _ => Token::Lt,
        }
    }

    fn lex_with_leading_right_angle(&mut self) -> Token {
        match self.source.peek() {
            Some(&'>') => {
                self.source.discard();
                self.one_or_assign(Token::Shr, Token::ShrAssign)
            }
            Some(&'=') => {
                self.source.discard();
                Token::Ge
            }
            _ => Token::Gt,
        }
    }

    fn lex_with_leading_dot(&mut self) -> Token {
        if self.source.next_is(&'.') {
            self.source.discard();
            if self.source.next_is(&'.') {
                self.source.discard();
                Token::Ellipsis
            } else {
                Token::DotDot
            }
        } else {
            Token::Dot
        }
    }

    fn lex_with_leading_colon(&mut self) -> Token {
        if self.source.next_is(&':') {
            self.source.discard();
            Token::ColonColon
        } else {
            Token::Colon
        }
    }

    fn lex_with_leading_question(&mut self) -> Token {
        if self.source.next_is(&'&') {
            self.source.discard();
            Token::QuestionAmp
        } else {
            Token::Question
        }
    }

    pub fn lex_next(&mut self) -> Result<LexedToken, Error> {
        self.lex_trivia()?;
        let position = self.source.position();
        let token = match self.source.peek() {
            None => Ok(Token::Eof),
            Some(&'"') => self.lex_string(),
            Some(&'\'') => self.lex_char(),
            Some(&c) if c.is_ascii_digit() => self.lex_number(),
            Some(&c) if c.is_alphabetic() || c == '_' => Ok(self.lex_word()),
            Some(_) => self.lex_symbolic(),
        };
        token.map(|token| LexedToken { position, token })
    }

    /// Lex everything, reporting errors through the sink and recovering at
    /// the next character so the rest of the stream still tokenizes.
    pub fn lex_all(mut self, diagnostics: &mut Diagnostics) -> Vec<LexedToken> {
        let mut tokens = Vec::new();
        loop {
            match self.lex_next() {
                Ok(lexed) => {
                    let eof = lexed.token == Token::Eof;
                    tokens.push(lexed);
                    if eof {
                        break tokens;
                    }
                }
                Err(error) => {
                    diagnostics.error(error.category(), error.position, error.message());
                    self.source.discard();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::FileId;

    fn test_lexer(s: &str) -> Lexer {
        Lexer::from(Source::from_text(FileId(0), s))
    }

    fn assert_next(lexer: &mut Lexer, token: &Token) {
        match lexer.lex_next() {
            Ok(LexedToken { token: t, .. }) => assert_eq!(t, *token),
            Err(e) => panic!("lex error: {:?}", e),
        }
    }

    #[test]
    fn empty() {
        let mut lexer = test_lexer("    \t  \n      ");
        assert_next(&mut lexer, &Token::Eof);
    }

    #[test]
    fn identifiers_and_keywords() {
        let mut lexer = test_lexer("  region  \t scratch \r\n unsafe defer x1");
        assert_next(&mut lexer, &Token::Region);
        assert_next(&mut lexer, &Token::Identifier(Name::from("scratch")));
        assert_next(&mut lexer, &Token::Unsafe);
        assert_next(&mut lexer, &Token::Defer);
        assert_next(&mut lexer, &Token::Identifier(Name::from("x1")));
    }

    #[test]
    fn numbers() {
        let mut lexer = test_lexer("42 0x2A 0b101010 052 7u 7ul 9ll");
        assert_next(&mut lexer, &Token::Int { value: 42, ty: None });
        assert_next(&mut lexer, &Token::Int { value: 42, ty: None });
        assert_next(&mut lexer, &Token::Int { value: 42, ty: None });
        assert_next(&mut lexer, &Token::Int { value: 42, ty: None });
        assert_next(
            &mut lexer,
            &Token::Int {
                value: 7,
                ty: Some(IntType::U32),
            },
        );
        assert_next(
            &mut lexer,
            &Token::Int {
                value: 7,
                ty: Some(IntType::U64),
            },
        );
        assert_next(
            &mut lexer,
            &Token::Int {
                value: 9,
                ty: Some(IntType::I64),
            },
        );
    }

    #[test]
    fn floats() {
        let mut lexer = test_lexer("1.5 2.5f 1e3 2.5e-1");
        assert_next(
            &mut lexer,
            &Token::Float {
                value: 1.5,
                single: false,
            },
        );
        assert_next(
            &mut lexer,
            &Token::Float {
                value: 2.5,
                single: true,
            },
        );
        assert_next(
            &mut lexer,
            &Token::Float {
                value: 1000.0,
                single: false,
            },
        );
        assert_next(
            &mut lexer,
            &Token::Float {
                value: 0.25,
                single: false,
            },
        );
    }

    #[test]
    fn integer_range_is_not_a_float() {
        let mut lexer = test_lexer("1..10");
        assert_next(&mut lexer, &Token::Int { value: 1, ty: None });
        assert_next(&mut lexer, &Token::DotDot);
        assert_next(&mut lexer, &Token::Int { value: 10, ty: None });
    }

    #[test]
    fn chars_and_strings() {
        let mut lexer = test_lexer(r#" 'a' '\n' "ab\tc" "#);
        assert_next(&mut lexer, &Token::Char('a'));
        assert_next(&mut lexer, &Token::Char('\n'));
        assert_next(&mut lexer, &Token::Str(Name::from("ab\tc")));
    }

    #[test]
    fn region_and_arithmetic_operators() {
        let mut lexer = test_lexer("?& +| -| *| +% -% *% .. :: -> ++ <<=");
        assert_next(&mut lexer, &Token::QuestionAmp);
        assert_next(&mut lexer, &Token::PlusWrap);
        assert_next(&mut lexer, &Token::MinusWrap);
        assert_next(&mut lexer, &Token::StarWrap);
        assert_next(&mut lexer, &Token::PlusSat);
        assert_next(&mut lexer, &Token::MinusSat);
        assert_next(&mut lexer, &Token::StarSat);
        assert_next(&mut lexer, &Token::DotDot);
        assert_next(&mut lexer, &Token::ColonColon);
        assert_next(&mut lexer, &Token::Arrow);
        assert_next(&mut lexer, &Token::PlusPlus);
        assert_next(&mut lexer, &Token::ShlAssign);
    }

    #[test]
    fn comments_are_skipped() {
        let mut lexer = test_lexer("  // line\n  /* block /* no nesting */ 1");
        assert_next(&mut lexer, &Token::Int { value: 1, ty: None });
    }

    #[test]
    fn unknown_character_is_reported_and_skipped() {
        let mut diagnostics = Diagnostics::new();
        let tokens = test_lexer("1 @ 2").lex_all(&mut diagnostics);
        assert_eq!(diagnostics.error_count(), 1);
        let kinds: Vec<&Token> = tokens.iter().map(|t| &t.token).collect();
        assert_eq!(
            kinds,
            vec![
                &Token::Int { value: 1, ty: None },
                &Token::Int { value: 2, ty: None },
                &Token::Eof,
            ]
        );
    }
}
