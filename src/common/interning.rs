//! Immutable shared strings that cross over multiple phases.
//!
//! Identifier names, string-literal contents, and section names are produced
//! by the lexer and then passed unaltered between the parser, the analyzer,
//! the monomorphizer, and the lowered tree. Sharing one allocation keeps the
//! AST cheap to clone during monomorphization.

use std::fmt;
use std::sync::Arc;

macro_rules! shared_str_type {
    ( $( $type:ident ),* ) => {
        $(
            #[derive(Clone, Debug, Eq, Hash, PartialEq, Ord, PartialOrd)]
            pub struct $type(pub Arc<str>);

            impl $type {
                pub fn as_str(&self) -> &str {
                    &self.0
                }
            }

            impl From<String> for $type {
                fn from(string: String) -> Self {
                    $type(Arc::from(string.as_str()))
                }
            }

            impl From<&str> for $type {
                fn from(string: &str) -> Self {
                    $type(Arc::from(string))
                }
            }

            impl fmt::Display for $type {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(&self.0)
                }
            }
        )*
    }
}

shared_str_type![Name];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_compare_by_content() {
        let a = Name::from("factorial");
        let b = Name::from(String::from("factorial"));
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "factorial");
    }
}
