//! # SafeC Common Utilities
//!
//! Types that exist across all phases: the buffer trait shared by the
//! character source and the token stream, and the shared string handles that
//! pass through multiple stages unaltered, the way identifier names travel
//! from the lexer through monomorphization to the lowered tree.
//!
//! As the different phases should be isolated as much as possible, this module
//! should be kept small to avoid heavy coupling.

pub mod interning;
pub mod peekable_buffer;
