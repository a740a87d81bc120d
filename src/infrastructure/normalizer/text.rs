//! Text cleanup shared by every normalized field

use unicode_normalization::UnicodeNormalization;

/// Zero-width characters that survive NFKC and break comparisons
const INVISIBLE: [char; 4] = ['\u{200b}', '\u{200c}', '\u{200d}', '\u{feff}'];

/// NFKC, drop invisible characters, collapse whitespace runs, trim.
///
/// NFKC folds non-breaking and narrow spaces into plain spaces, so
/// `"1\u{a0}299"` and `"1 299"` clean to the same string.
pub fn clean_text(raw: &str) -> String {
    let folded: String = raw.nfkc().filter(|c| !INVISIBLE.contains(c)).collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// `clean_text`, with empty results mapped to `None`
pub fn clean_optional(raw: Option<&str>) -> Option<String> {
    raw.map(clean_text).filter(|text| !text.is_empty())
}

/// Specification values: comma-separated parts, each trimmed, empties dropped
pub fn clean_spec_value(raw: &str) -> Option<String> {
    let parts: Vec<String> = clean_text(raw)
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect();
    (!parts.is_empty()).then(|| parts.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("  Widget   Pro ", "Widget Pro")]
    #[case("Widget\u{a0}Pro", "Widget Pro")]
    #[case("Wid\u{200b}get\n\tPro", "Widget Pro")]
    #[case("\u{ff37}idget", "Widget")]
    #[case("", "")]
    fn test_clean_text(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(clean_text(raw), expected);
    }

    #[test]
    fn test_clean_spec_value() {
        assert_eq!(clean_spec_value("6.1\u{a0}\", OLED ,, "), Some("6.1 \", OLED".to_string()));
        assert_eq!(clean_spec_value(" , "), None);
        assert_eq!(clean_optional(Some("   ")), None);
        assert_eq!(clean_optional(Some(" Acme ")), Some("Acme".to_string()));
    }
}
