//! Character escapes let developers enter characters into SafeC strings and
//! character literals that are otherwise awkward to encode in UTF-8 source.

use std::collections::HashMap;

/// Map escape characters to the literal characters they represent.
pub fn new() -> HashMap<char, char> {
    let mut map = HashMap::new();
    map.extend(vec![
        ('n', '\n'),
        ('r', '\r'),
        ('t', '\t'),
        ('0', '\0'),
        ('\\', '\\'),
        ('\'', '\''),
        ('"', '"'),
    ]);
    map
}
