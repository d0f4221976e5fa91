use lazy_regex::regex;
use regex::Regex;
use scraper::{Html, Selector};

use crate::lazy_selectors;
use crate::parsing::QuickSelect;

lazy_selectors! {
    ROYALROAD_CONTENT_SELECTOR: ".chapter-content";
}

const UNWANTED_TAGS: [&str; 12] = [
    "script", "style", "link", "meta", "noscript", "header", "footer", "nav", "aside", "form",
    "iframe", "button",
];
const UNWANTED_ATTRIBUTES: [&str; 13] = [
    "style",
    "class",
    "id",
    "onclick",
    "onerror",
    "onload",
    "onmouseover",
    "onmouseout",
    "data-reactid",
    "data-testid",
    "aria-labelledby",
    "aria-describedby",
    "role",
];
const ROYALROAD_SELECTORS_TO_REMOVE: [&str; 10] = [
    ".author-notes-start",
    ".author-notes-end",
    ".comments-area",
    "#comments",
    ".rating-section",
    ".patreon-button",
    ".subscribe-button",
    ".portlet",
    "div[id*=\"nitro-ad\"]",
    "div[class*=\"ad-container\"]",
];

/// Normalizes raw chapter HTML into an EPUB-safe fragment: extracts the known content
/// container (falling back to cleaning the whole document), strips scripting/styling/clutter
/// elements, removes site-specific noise, drops now-empty elements, and closes void tags.
///
/// Best-effort: never panics on malformed input.
pub fn clean(raw_html: &str, source_site: Option<&str>) -> String {
    let fragment = extract_main_content(raw_html, source_site);
    let mut parsed = Html::parse_fragment(&fragment);

    if source_site == Some("royalroad") {
        remove_matching(&mut parsed, &ROYALROAD_SELECTORS_TO_REMOVE);
    }
    remove_matching(&mut parsed, &UNWANTED_TAGS);

    let mut html = parsed.root_element().inner_html();
    html = strip_attributes(&html);
    html = collapse_empty_elements(&html);
    html = close_void_tags(&html);
    html.trim().to_string()
}

fn extract_main_content(raw_html: &str, source_site: Option<&str>) -> String {
    if source_site == Some("royalroad") {
        let parsed = Html::parse_document(raw_html);
        if let Some(inner) = parsed.get_inner_html_of(&ROYALROAD_CONTENT_SELECTOR) {
            return inner;
        }
    }
    raw_html.to_string()
}

fn remove_matching(parsed: &mut Html, selectors: &[&str]) {
    for selector in selectors {
        let Ok(selector) = Selector::parse(selector) else {
            continue;
        };
        let ids: Vec<_> = parsed.select(&selector).map(|e| e.id()).collect();
        for id in ids {
            if let Some(mut node) = parsed.tree.get_mut(id) {
                node.detach();
            }
        }
    }
}

fn strip_attributes(html: &str) -> String {
    let mut html = html.to_string();
    for attr in UNWANTED_ATTRIBUTES {
        let pattern = format!(r#"\s+{attr}="[^"]*""#);
        if let Ok(re) = Regex::new(&pattern) {
            html = re.replace_all(&html, "").to_string();
        }
    }
    // Strip any remaining on* handlers / framework hooks not covered above.
    html = regex!(r#"\s+(?:on\w+|js\w+|c-wiz)="[^"]*""#).replace_all(&html, "").to_string();
    html
}

pub(crate) fn collapse_empty_elements(html: &str) -> String {
    // Repeatedly remove innermost empty non-void elements, since removing one can make its
    // parent empty too.
    let mut html = html.to_string();
    let empty_tag = regex!(r"<([a-zA-Z][a-zA-Z0-9]*)(?:\s[^>]*)?>(?:\s|&nbsp;)*</\1>");
    loop {
        let replaced = empty_tag.replace_all(&html, |caps: &regex::Captures| {
            let tag = &caps[1];
            if matches!(tag, "br" | "hr" | "img") {
                caps[0].to_string()
            } else {
                String::new()
            }
        });
        if replaced.as_ref() == html {
            break;
        }
        html = replaced.to_string();
    }
    html
}

fn close_void_tags(html: &str) -> String {
    let mut html = regex!(r"(<img[^>]*[^/])>").replace_all(html, "$1/>").to_string();
    html = html.replace("<br>", "<br/>");
    html = html.replace("<hr>", "<hr/>");
    html
}

#[cfg(test)]
mod tests {
    use super::clean;

    #[test]
    fn strips_scripts_and_styles() {
        let raw = r#"<div class="chapter-content"><script>evil()</script><p>Hello</p></div>"#;
        let cleaned = clean(raw, Some("royalroad"));
        assert!(!cleaned.contains("script"));
        assert!(cleaned.contains("Hello"));
    }

    #[test]
    fn removes_author_notes_and_comments() {
        let raw = r#"<div class="chapter-content">
            <div class="author-notes-start">Note</div>
            <p>Real content</p>
            <div id="comments">junk</div>
        </div>"#;
        let cleaned = clean(raw, Some("royalroad"));
        assert!(!cleaned.contains("Note"));
        assert!(!cleaned.contains("junk"));
        assert!(cleaned.contains("Real content"));
    }

    #[test]
    fn falls_back_to_whole_document_when_container_missing() {
        let raw = "<html><body><script>x()</script><p>Text</p></body></html>";
        let cleaned = clean(raw, Some("generic"));
        assert!(cleaned.contains("Text"));
        assert!(!cleaned.contains("script"));
    }

    #[test]
    fn collapses_empty_paragraphs() {
        let raw = r#"<div class="chapter-content"><p></p><p>   </p><p>Keep me</p></div>"#;
        let cleaned = clean(raw, Some("royalroad"));
        assert_eq!(cleaned.matches("<p>").count(), 1);
    }
}
