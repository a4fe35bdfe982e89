//! Locale collaborator stub (C13). The real collaborator converts path bytes
//! between the wire's UTF-8 and the local character set, and measures
//! display width for columnar listings. This client only ever runs with a
//! UTF-8 locale, so both converters are the identity function; `display_width`
//! counts Unicode scalar values rather than doing a real wcwidth lookup.

/// Convert a local-encoding path to the wire's UTF-8.
pub fn to_wire(local: &str) -> String {
    local.to_string()
}

/// Convert a wire UTF-8 path to the local encoding.
pub fn from_wire(wire: &str) -> String {
    wire.to_string()
}

/// Number of display cells a string occupies. A real implementation would
/// consult wcwidth/grapheme-cluster tables for double-width and combining
/// characters; this stub just counts scalar values.
pub fn display_width(s: &str) -> usize {
    s.chars().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_conversion() {
        assert_eq!(to_wire("a/b"), "a/b");
        assert_eq!(from_wire("a/b"), "a/b");
    }

    #[test]
    fn width_counts_scalars() {
        assert_eq!(display_width("abc"), 3);
        assert_eq!(display_width(""), 0);
    }
}
