use lazy_regex::regex;
use unicode_normalization::UnicodeNormalization;

/// Turns a story title into a filesystem-safe folder name: NFKD-normalize, fold to ASCII,
/// lowercase, strip anything that isn't `[a-z0-9\s-]`, then collapse whitespace/hyphen runs.
pub fn generate(text: &str) -> String {
    let ascii_folded: String = text.nfkd().filter(char::is_ascii).collect();
    let lowercased = ascii_folded.to_lowercase();

    let stripped = regex!(r"[^a-z0-9\s-]").replace_all(&lowercased, "");
    let trimmed = stripped.trim();
    let hyphenated = regex!(r"\s+").replace_all(trimmed, "-");
    let collapsed = regex!(r"-+").replace_all(&hyphenated, "-");

    collapsed.trim_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::generate;

    #[test]
    fn plain_title() {
        assert_eq!(generate("The Wandering Inn"), "the-wandering-inn");
    }

    #[test]
    fn punctuation_is_dropped() {
        assert_eq!(generate("Mother of Learning!"), "mother-of-learning");
    }

    #[test]
    fn accents_are_folded() {
        assert_eq!(generate("Déjà Vu"), "deja-vu");
    }

    #[test]
    fn collapses_whitespace_and_hyphens() {
        assert_eq!(generate("  A   Boring---Title  "), "a-boring-title");
    }

    #[test]
    fn empty_title_yields_empty_slug() {
        assert_eq!(generate("!!!"), "");
    }
}
