mod request;
mod royalroad;

use chrono::{DateTime, Utc};

use crate::error::FetchError;

pub use request::{get_bytes, get_text, HostRateLimiter};
pub use royalroad::RoyalRoad;

/// Minimal identity of a chapter as advertised by a source's manifest, before any content has
/// been fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterStub {
    pub source_chapter_id: String,
    pub chapter_url: String,
    pub chapter_title: String,
    pub source_order: u32,
}

#[derive(Debug, Clone, Default)]
pub struct Metadata {
    pub title: String,
    pub author: String,
    pub cover_image_url: Option<String>,
    pub synopsis: Option<String>,
    pub estimated_total_chapters: Option<u32>,
    pub last_update: Option<DateTime<Utc>>,
}

/// Capability set a story source must provide. The only concrete implementation is
/// [`RoyalRoad`]; additional sources plug in at [`get`] without touching callers.
pub trait Fetcher: Send + Sync {
    fn permanent_id(&self, story_url: &str) -> Result<String, FetchError>;
    fn metadata(&self, story_url: &str) -> Result<Metadata, FetchError>;
    fn manifest(&self, story_url: &str) -> Result<Vec<ChapterStub>, FetchError>;
    fn chapter_body(&self, chapter_url: &str) -> Result<String, FetchError>;
    /// Best-effort "is there a chapter after this one" probe, used to avoid a full manifest
    /// re-fetch when we already know the last chapter we have.
    fn probe_next(&self, chapter_url: &str) -> Result<Option<String>, FetchError>;
}

/// Resolves the fetcher that recognizes `url`'s host. Mirrors the teacher's `try_source!`
/// dispatch macro, generalized to the capability-set trait above.
pub fn get(url: &str) -> Result<Box<dyn Fetcher>, FetchError> {
    if let Some(rr) = RoyalRoad::for_url(url) {
        return Ok(Box::new(rr));
    }
    Err(FetchError::UnsupportedSource(url.to_string()))
}
