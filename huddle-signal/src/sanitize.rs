//! Display-name cleanup.

/// Invisible or control characters stripped from names.
const STRIPPED: [char; 14] = [
    '\u{200B}', // zero width space
    '\u{200C}', // zero width non-joiner
    '\u{200D}', // zero width joiner
    '\u{FEFF}', // zero width no-break space
    '\u{0000}',
    '\u{0007}', // bell
    '\u{0008}', // backspace
    '\t',
    '\n',
    '\u{000B}', // vertical tab
    '\u{000C}', // form feed
    '\r',
    '\u{001A}', // control-z
    '\u{001B}', // escape
];

/// Strip invisible characters, trim, and cap at `max_len` characters.
///
/// Returns `None` if nothing printable is left.
pub fn sanitize_name(raw: &str, max_len: usize) -> Option<String> {
    let cleaned: String = raw.chars().filter(|c| !STRIPPED.contains(c)).collect();
    let name: String = cleaned.trim().chars().take(max_len).collect();
    (!name.is_empty()).then_some(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_invisible_characters() {
        assert_eq!(sanitize_name("\n\tmo\r\u{200B}", 100).as_deref(), Some("mo"));
    }

    #[test]
    fn test_truncates_by_characters() {
        assert_eq!(sanitize_name("héllo wörld", 5).as_deref(), Some("héllo"));
    }

    #[test]
    fn test_rejects_empty() {
        assert_eq!(sanitize_name("", 10), None);
        assert_eq!(sanitize_name("\u{FEFF}\u{200D}  ", 10), None);
    }

    #[test]
    fn test_zero_length_limit() {
        assert_eq!(sanitize_name("mo", 0), None);
    }
}
