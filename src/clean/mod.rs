mod html_cleaner;
mod sentence_filter;

pub use html_cleaner::clean;
pub use sentence_filter::{SentenceFilterConfig, filter};
