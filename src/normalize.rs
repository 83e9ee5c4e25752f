use unicode_general_category::{get_general_category, GeneralCategory};
use unicode_normalization::UnicodeNormalization;

/// Canonical comparison key for a host or container name.
///
/// Decomposes, drops every symbol-category character (emoji included), collapses
/// whitespace runs, trims and lowercases. Total and idempotent.
pub fn normalize(raw: &str) -> String {
    if raw.is_empty() {
        return String::new();
    }
    let stripped: String = raw.nfkd().filter(|c| !is_symbol(*c)).collect();
    stripped
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn is_symbol(c: char) -> bool {
    matches!(
        get_general_category(c),
        GeneralCategory::MathSymbol
            | GeneralCategory::CurrencySymbol
            | GeneralCategory::ModifierSymbol
            | GeneralCategory::OtherSymbol
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_emoji_and_case() {
        assert_eq!(normalize("Arbor🏠Lon "), "arborlon");
        assert_eq!(normalize("🚀 Paranor  Media\tBox "), "paranor media box");
    }

    #[test]
    fn empty_and_blank() {
        assert_eq!(normalize(""), "");
        assert_eq!(normalize("   \t\n"), "");
        assert_eq!(normalize("🏠🔥"), "");
    }

    #[test]
    fn separates_accents() {
        // combining marks are category Mn, so they survive as separate chars
        let key = normalize("Café");
        assert!(key.starts_with("cafe"));
        assert_eq!(key, normalize("Cafe\u{301}"));
    }

    #[test]
    fn idempotent() {
        for raw in ["Arbor🏠Lon ", "  ÅNGSTRÖM   host ", "x+y=z", "ﬁle Server", "", "plain"] {
            let once = normalize(raw);
            assert_eq!(normalize(&once), once, "not idempotent for {raw:?}");
        }
    }
}
