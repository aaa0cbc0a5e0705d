/// A buffer that allows reading, peeking, and provides convenience methods for
/// common operations like checking a predicate against a peeked value.
///
/// Both the preprocessed character source and the lexed token stream implement
/// this, so the lexer and the parser share one vocabulary for lookahead.
pub trait PeekableBuffer<T: Clone + PartialEq> {
    /// Get an immutable view over the next `n` elements in the buffer, or
    /// `None` if fewer than `n` remain.
    fn peek_many(&self, n: usize) -> Option<&[T]>;

    /// Consume an item from the buffer and return it.
    fn read(&mut self) -> Option<T>;

    /// Throw away the next `n` elements from the buffer, returning `true` if
    /// all `n` were thrown away.
    fn discard_many(&mut self, n: usize) -> bool;

    /// Get an immutable view of the next element in the buffer.
    fn peek(&self) -> Option<&T> {
        self.peek_many(1).and_then(<[T]>::first)
    }

    /// Get an immutable view of the `n`th next element, where `n` is
    /// zero-indexed.
    fn peek_nth(&self, n: usize) -> Option<&T> {
        self.peek_many(n + 1).and_then(|items| items.get(n))
    }

    /// Check whether the `n`th next item matches `predicate`, where `n` is
    /// zero-indexed.
    fn match_nth(&self, n: usize, predicate: impl Fn(&T) -> bool) -> bool {
        self.peek_nth(n).map_or(false, predicate)
    }

    /// Check whether the next item matches `predicate`.
    fn match_next(&self, predicate: impl Fn(&T) -> bool) -> bool {
        self.match_nth(0, predicate)
    }

    /// Check whether the `n`th next item is equal to `to_match`.
    fn nth_is(&self, n: usize, to_match: &T) -> bool {
        self.match_nth(n, |item| item == to_match)
    }

    /// Check whether the next item is equal to `to_match`.
    fn next_is(&self, to_match: &T) -> bool {
        self.nth_is(0, to_match)
    }

    /// Throw away the next element, returning `false` if the buffer was
    /// already empty.
    fn discard(&mut self) -> bool {
        self.discard_many(1)
    }
}
