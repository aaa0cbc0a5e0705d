//! # SafeC Lexing
//!
//! Turns the preprocessed character stream into a buffer of surface tokens.
//! The buffer implements the same `PeekableBuffer` the character source does,
//! so the parser's lookahead vocabulary matches the lexer's. The buffer also
//! supports checkpointing, which the parser uses to resolve the C-style
//! cast-versus-parenthesized-expression and declaration-versus-expression
//! ambiguities by local backtracking.

mod char_escapes;
mod keywords;

pub mod lexer;
pub mod tokens;

use crate::common::peekable_buffer::PeekableBuffer;
use crate::diagnostics::Diagnostics;
use crate::lexing::lexer::{LexedToken, Lexer};
use crate::lexing::tokens::Token;
use crate::source::{Position, Source};

/// An eagerly lexed token stream. The final element is always `Eof`.
pub struct Tokens {
    tokens: Vec<LexedToken>,
    cursor: usize,
}

/// A saved stream position for backtracking.
#[derive(Clone, Copy, Debug)]
pub struct Checkpoint(usize);

impl Tokens {
    pub fn lex(source: Source, diagnostics: &mut Diagnostics) -> Self {
        Self {
            tokens: Lexer::from(source).lex_all(diagnostics),
            cursor: 0,
        }
    }

    pub fn from_tokens(tokens: Vec<LexedToken>) -> Self {
        Self { tokens, cursor: 0 }
    }

    /// The position of the next unread token; EOF's position once exhausted.
    pub fn position(&self) -> Position {
        self.tokens
            .get(self.cursor)
            .or_else(|| self.tokens.last())
            .map(|lexed| lexed.position)
            .unwrap_or_default()
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint(self.cursor)
    }

    pub fn rewind(&mut self, checkpoint: Checkpoint) {
        self.cursor = checkpoint.0;
    }

    pub fn at_eof(&self) -> bool {
        self.cursor >= self.tokens.len()
            || self.match_next(|lexed| lexed.token == Token::Eof)
    }
}

impl PeekableBuffer<LexedToken> for Tokens {
    fn peek_many(&self, n: usize) -> Option<&[LexedToken]> {
        if self.tokens.len() < self.cursor + n {
            None
        } else {
            Some(&self.tokens[self.cursor..self.cursor + n])
        }
    }

    fn read(&mut self) -> Option<LexedToken> {
        let token = self.tokens.get(self.cursor).cloned();
        if token.is_some() {
            self.cursor += 1;
        }
        token
    }

    fn discard_many(&mut self, n: usize) -> bool {
        if self.tokens.len() < self.cursor + n {
            self.cursor = self.tokens.len();
            false
        } else {
            self.cursor += n;
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::interning::Name;
    use crate::source::FileId;

    fn test_tokens(s: &str) -> Tokens {
        let mut diagnostics = Diagnostics::new();
        let tokens = Tokens::lex(Source::from_text(FileId(0), s), &mut diagnostics);
        assert!(!diagnostics.has_errors());
        tokens
    }

    #[test]
    fn peeking_and_reading() {
        let mut tokens = test_tokens("int x = 1;");
        assert!(tokens.match_next(|t| t.token == Token::Identifier(Name::from("int"))));
        assert!(tokens.nth_is(2, &LexedToken {
            position: tokens.peek_nth(2).unwrap().position,
            token: Token::Assign,
        }));
        tokens.discard_many(2);
        assert_eq!(tokens.read().unwrap().token, Token::Assign);
    }

    #[test]
    fn checkpoint_rewinds() {
        let mut tokens = test_tokens("a b c");
        let checkpoint = tokens.checkpoint();
        tokens.discard_many(2);
        assert!(tokens.match_next(|t| t.token == Token::Identifier(Name::from("c"))));
        tokens.rewind(checkpoint);
        assert!(tokens.match_next(|t| t.token == Token::Identifier(Name::from("a"))));
    }

    #[test]
    fn eof_is_last() {
        let mut tokens = test_tokens("");
        assert!(tokens.at_eof());
        assert_eq!(tokens.read().unwrap().token, Token::Eof);
    }
}
