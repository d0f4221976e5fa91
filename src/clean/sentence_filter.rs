use lazy_regex::regex;
use regex::Regex;
use serde::Deserialize;
use tracing::warn;

use super::html_cleaner;

#[derive(Debug, Default, Deserialize)]
pub struct SentenceFilterConfig {
    #[serde(default)]
    remove_sentences: Vec<String>,
    #[serde(default)]
    remove_patterns: Vec<String>,
}

impl SentenceFilterConfig {
    /// Loads a sentence-removal config from disk. Missing files and malformed JSON are not
    /// fatal: this is an optional, best-effort transformation.
    pub fn load(path: &std::path::Path) -> Self {
        let Ok(raw) = std::fs::read_to_string(path) else {
            warn!(path = %path.display(), "sentence removal config not found, skipping");
            return Self::default();
        };
        serde_json::from_str(&raw).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "malformed sentence removal config, skipping");
            Self::default()
        })
    }

    fn compiled_patterns(&self) -> Vec<Regex> {
        self.remove_patterns
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(pattern = p, error = %e, "malformed sentence-removal regex, skipped");
                    None
                }
            })
            .collect()
    }

    pub const fn is_empty(&self) -> bool {
        self.remove_sentences.is_empty() && self.remove_patterns.is_empty()
    }
}

/// Removes configured sentences/patterns from text nodes only, leaving tags and attributes
/// untouched, then collapses any element left empty by the removal. A no-op if `config` has no
/// rules.
pub fn filter(html: &str, config: &SentenceFilterConfig) -> String {
    if config.is_empty() {
        return html.to_string();
    }

    let patterns = config.compiled_patterns();
    let filtered = map_text_nodes(html, |text| {
        let mut text = text.to_string();
        for sentence in &config.remove_sentences {
            text = text.replace(sentence.as_str(), "");
        }
        for pattern in &patterns {
            text = pattern.replace_all(&text, "").to_string();
        }
        text
    });

    html_cleaner::collapse_empty_elements(&filtered)
}

/// Walks `html` tag-by-tag, applying `transform` to every run of text that isn't inside a tag,
/// a comment, or a `<script>`/`<style>` element. This keeps the filter a pure text-node
/// transformation without needing a full DOM rebuild.
fn map_text_nodes(html: &str, transform: impl Fn(&str) -> String) -> String {
    let tag_re = regex!(r"(?s)<!--.*?-->|<[^>]+>");
    let mut output = String::with_capacity(html.len());
    let mut last_end = 0;
    let mut suppress_depth = 0usize;

    for m in tag_re.find_iter(html) {
        let text_segment = &html[last_end..m.start()];
        if suppress_depth == 0 && !text_segment.is_empty() {
            output.push_str(&transform(text_segment));
        } else {
            output.push_str(text_segment);
        }

        let tag = m.as_str();
        output.push_str(tag);
        if is_opening_tag(tag, "script") || is_opening_tag(tag, "style") {
            suppress_depth += 1;
        } else if is_closing_tag(tag, "script") || is_closing_tag(tag, "style") {
            suppress_depth = suppress_depth.saturating_sub(1);
        }

        last_end = m.end();
    }
    let tail = &html[last_end..];
    if suppress_depth == 0 {
        output.push_str(&transform(tail));
    } else {
        output.push_str(tail);
    }
    output
}

fn is_opening_tag(tag: &str, name: &str) -> bool {
    let lower = tag.to_lowercase();
    lower.starts_with(&format!("<{name}")) && !lower.ends_with("/>")
}

fn is_closing_tag(tag: &str, name: &str) -> bool {
    tag.to_lowercase() == format!("</{name}>")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(sentences: &[&str], patterns: &[&str]) -> SentenceFilterConfig {
        SentenceFilterConfig {
            remove_sentences: sentences.iter().map(|s| (*s).to_string()).collect(),
            remove_patterns: patterns.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    #[test]
    fn no_rules_is_a_no_op() {
        let html = "<p>Hello world.</p>";
        assert_eq!(filter(html, &SentenceFilterConfig::default()), html);
    }

    #[test]
    fn removes_exact_sentence() {
        let html = "<p>Hello. Please subscribe now. Goodbye.</p>";
        let cfg = config(&["Please subscribe now."], &[]);
        let result = filter(html, &cfg);
        assert!(!result.contains("subscribe"));
        assert!(result.contains("Hello"));
        assert!(result.contains("Goodbye"));
    }

    #[test]
    fn does_not_touch_script_contents() {
        let html = "<script>var subscribe = 1;</script><p>subscribe</p>";
        let cfg = config(&["subscribe"], &[]);
        let result = filter(html, &cfg);
        assert!(result.contains("var subscribe = 1;"));
        assert!(!result.contains("<p>subscribe</p>"));
    }

    #[test]
    fn malformed_pattern_is_skipped_not_fatal() {
        let cfg = config(&[], &["*["]);
        let html = "<p>Text</p>";
        assert_eq!(filter(html, &cfg), html);
    }

    #[test]
    fn removes_now_empty_parent() {
        let html = "<p><span>Please subscribe now.</span></p><p>Keep</p>";
        let cfg = config(&["Please subscribe now."], &[]);
        let result = filter(html, &cfg);
        assert!(!result.contains("<span>"));
        assert!(result.contains("Keep"));
    }
}
