use scraper::{Html, Selector};

/// Declares `LazyLock<Selector>` statics and, for each one, a `#[cfg(test)]` function asserting
/// the selector string parses — so a typo in a selector fails `cargo test`, not a production run.
#[macro_export]
macro_rules! lazy_selectors {
    ( $( $selector_name:ident: $selector:expr; )+ ) => {
        $(
        #[allow(clippy::expect_used)]
        static $selector_name: std::sync::LazyLock<scraper::Selector> =
            std::sync::LazyLock::new(|| scraper::Selector::parse($selector)
                .expect("one of the lazy selectors failed, run `cargo test` to find out which"));
        )*

        #[cfg(test)]
        mod lazy_selectors_autotest {
            $(
                #[test]
                #[allow(non_snake_case)]
                fn $selector_name() {
                    assert!(scraper::Selector::parse($selector).is_ok());
                }
            )*
        }
    };
}

pub trait QuickSelect {
    fn get_inner_html_of(&self, selector: &Selector) -> Option<String>;
    fn get_text_of(&self, selector: &Selector) -> Option<String>;
    fn get_attr_of(&self, selector: &Selector, attr: &str) -> Option<String>;
    fn get_attr_content_of(&self, selector: &Selector) -> Option<String>;
}

impl QuickSelect for Html {
    fn get_inner_html_of(&self, selector: &Selector) -> Option<String> {
        self.select(selector)
            .next()
            .map(|element| element.inner_html())
            .filter(|s| !s.is_empty())
    }

    fn get_text_of(&self, selector: &Selector) -> Option<String> {
        self.select(selector).next().map(|element| {
            element
                .text()
                .collect::<String>()
                .trim()
                .to_string()
        }).filter(|s| !s.is_empty())
    }

    fn get_attr_of(&self, selector: &Selector, attr: &str) -> Option<String> {
        self.select(selector)
            .next()
            .and_then(|e| e.attr(attr))
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
    }

    fn get_attr_content_of(&self, selector: &Selector) -> Option<String> {
        self.get_attr_of(selector, "content")
    }
}
