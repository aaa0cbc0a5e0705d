//! # SafeC Sourcing
//!
//! A source is preprocessed SafeC text fronted by a `PeekableBuffer` that
//! hides how the text was produced. Every character carries the position it
//! originated from, so positions survive `#include` and macro expansion: a
//! character that came out of a macro body reports the macro's use site.
//!
//! The `SourceMap` owns the raw text of every file touched by a compilation
//! and is what diagnostics rendering consults for line excerpts.

use crate::common::peekable_buffer::PeekableBuffer;
use std::cmp::Ordering;

/// Identifies one file registered in the [SourceMap].
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub struct FileId(pub u32);

/// A point in some registered source file.
///
/// `line` and `column` are one-based and for human consumption; `offset` is
/// the zero-based character index within the file and is what ordering uses.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Position {
    pub file: FileId,
    pub line: u32,
    pub column: u32,
    pub offset: u32,
}

impl Position {
    pub fn start_of(file: FileId) -> Self {
        Self {
            file,
            line: 1,
            column: 1,
            offset: 0,
        }
    }

    /// The position of the character following `c` at this position.
    pub fn after(self, c: char) -> Self {
        if c == '\n' {
            Self {
                file: self.file,
                line: self.line + 1,
                column: 1,
                offset: self.offset + 1,
            }
        } else {
            Self {
                file: self.file,
                line: self.line,
                column: self.column + 1,
                offset: self.offset + 1,
            }
        }
    }
}

impl Default for Position {
    fn default() -> Self {
        Self::start_of(FileId(0))
    }
}

impl Ord for Position {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.file, self.offset).cmp(&(other.file, other.offset))
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct SourceFile {
    name: String,
    /// Offsets of the first character of each line, for excerpt rendering.
    lines: Vec<String>,
}

/// All files loaded during one compilation: the main translation unit plus
/// everything reached through `#include`.
#[derive(Default)]
pub struct SourceMap {
    files: Vec<SourceFile>,
}

impl SourceMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>, text: &str) -> FileId {
        let id = FileId(self.files.len() as u32);
        self.files.push(SourceFile {
            name: name.into(),
            lines: text.split('\n').map(|l| l.trim_end_matches('\r').to_owned()).collect(),
        });
        id
    }

    pub fn name(&self, file: FileId) -> &str {
        &self.files[file.0 as usize].name
    }

    /// The text of a one-based line, for caret excerpts.
    pub fn line_text(&self, file: FileId, line: u32) -> Option<&str> {
        self.files
            .get(file.0 as usize)
            .and_then(|f| f.lines.get(line.saturating_sub(1) as usize))
            .map(String::as_str)
    }
}

/// The preprocessed character stream consumed by the lexer. Loaded fully into
/// memory: a modern system makes IO system calls expensive relative to one
/// larger allocation, and translation units are small.
pub struct Source {
    chars: Vec<char>,
    positions: Vec<Position>,
    end: Position,
    cursor: usize,
}

impl Source {
    pub fn new(chars: Vec<char>, positions: Vec<Position>) -> Self {
        debug_assert_eq!(chars.len(), positions.len());
        let end = match (chars.last(), positions.last()) {
            (Some(&c), Some(&p)) => p.after(c),
            _ => Position::default(),
        };
        Self {
            chars,
            positions,
            end,
            cursor: 0,
        }
    }

    /// Build a source directly from file text, with no preprocessing. Used by
    /// tests and by the preprocessor to walk raw file contents.
    pub fn from_text(file: FileId, text: &str) -> Self {
        let chars: Vec<char> = text.chars().collect();
        let mut positions = Vec::with_capacity(chars.len());
        let mut position = Position::start_of(file);
        for &c in &chars {
            positions.push(position);
            position = position.after(c);
        }
        Self {
            chars,
            positions,
            end: position,
            cursor: 0,
        }
    }

    /// The position of the next unread character, or one past the final
    /// character at EOF.
    pub fn position(&self) -> Position {
        self.positions.get(self.cursor).copied().unwrap_or(self.end)
    }

    pub fn at_start(&self) -> bool {
        self.cursor == 0
    }

    /// The remaining characters, for dump output.
    pub fn remaining_text(&self) -> String {
        self.chars[self.cursor..].iter().collect()
    }
}

impl PeekableBuffer<char> for Source {
    fn peek_many(&self, n: usize) -> Option<&[char]> {
        if self.chars.len() < self.cursor + n {
            None
        } else {
            Some(&self.chars[self.cursor..self.cursor + n])
        }
    }

    fn read(&mut self) -> Option<char> {
        let c = self.chars.get(self.cursor).copied();
        if c.is_some() {
            self.cursor += 1;
        }
        c
    }

    fn discard_many(&mut self, n: usize) -> bool {
        if self.chars.len() < self.cursor + n {
            self.cursor = self.chars.len();
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

    fn test_source(s: &str) -> Source {
        Source::from_text(FileId(0), s)
    }

    #[test]
    fn peeking_and_reading() {
        let mut source = test_source("this is a test");

        assert_eq!(['t', 'h', 'i', 's', ' '], source.peek_many(5).unwrap());
        assert_eq!(&'h', source.peek_nth(1).unwrap());
        assert_eq!('t', source.read().unwrap());
        assert_eq!(&'h', source.peek().unwrap());
        assert!(source.peek_many(999).is_none());
        source.discard_many("his is a tes".len());
        assert_eq!(&'t', source.peek().unwrap());
        source.discard();
        assert!(source.peek().is_none());
    }

    #[test]
    fn position_tracking() {
        let mut source = test_source("ab\ncd\r\nef");

        assert_eq!(source.position(), Position::start_of(FileId(0)));
        source.discard_many(3);
        assert_eq!(source.position().line, 2);
        assert_eq!(source.position().column, 1);
        source.discard_many(4);
        assert_eq!(source.position().line, 3);
        assert_eq!(source.position().column, 1);
        assert_eq!(source.position().offset, 7);
    }

    #[test]
    fn positions_order_by_file_then_offset() {
        let early = Position {
            file: FileId(0),
            line: 9,
            column: 1,
            offset: 100,
        };
        let late = Position {
            file: FileId(1),
            line: 1,
            column: 1,
            offset: 0,
        };
        assert!(early < late);
    }
}
