use chrono::Utc;
use lazy_regex::regex;
use scraper::Html;
use serde::Deserialize;

use super::{request, ChapterStub, Fetcher, Metadata};
use crate::error::FetchError;
use crate::lazy_selectors;
use crate::parsing::QuickSelect;

lazy_selectors! {
    TITLE_SELECTOR: "h1.font-white";
    TITLE_FALLBACK_SELECTOR: "meta[property=\"og:title\"]";
    AUTHOR_SELECTOR: "h4.font-white a[href*=\"/profile/\"]";
    AUTHOR_FALLBACK_SELECTOR: "meta[property=\"books:author\"]";
    COVER_SELECTOR: "div.cover-art-container img.thumbnail";
    COVER_FALLBACK_SELECTOR: "meta[property=\"og:image\"]";
    DESCRIPTION_SELECTOR: "div.description div.hidden-content";
    CHAPTER_ROW_SELECTOR: "table#chapters tbody tr.chapter-row a";
    CONTENT_SELECTOR: ".chapter-content";
    NEXT_REL_SELECTOR: "a[rel=\"next\"]";
    NEXT_CLASS_SELECTOR: "a.next-chapter";
    NEXT_BTN_SELECTOR: "a.btn-primary.next-chapter";
    WATERMARK_SELECTOR: "[class^=cj],[class^=cm]";
}

const NOT_FOUND_SENTINEL: &str = "Chapter content not found.";
const BASE_URL: &str = "https://www.royalroad.com";

pub struct RoyalRoad;

impl RoyalRoad {
    /// Returns `Some` iff `url` looks like a RoyalRoad fiction URL; this is the dispatch-table
    /// check used by [`super::get`].
    pub fn for_url(url: &str) -> Option<Self> {
        regex!(r"royalroad\.com/fiction/(\d+)")
            .is_match(url)
            .then_some(Self)
    }
}

impl Fetcher for RoyalRoad {
    fn permanent_id(&self, story_url: &str) -> Result<String, FetchError> {
        regex!(r"royalroad\.com/fiction/(\d+)")
            .captures(story_url)
            .map(|c| format!("royalroad-{}", &c[1]))
            .ok_or_else(|| FetchError::MalformedUrl(story_url.to_string()))
    }

    fn metadata(&self, story_url: &str) -> Result<Metadata, FetchError> {
        let body = request::get_text(story_url)?;
        let parsed = Html::parse_document(&body);

        let title = parsed
            .get_text_of(&TITLE_SELECTOR)
            .or_else(|| parsed.get_attr_content_of(&TITLE_FALLBACK_SELECTOR))
            .ok_or_else(|| FetchError::Parse {
                url: story_url.to_string(),
                reason: "no title found".to_string(),
            })?;

        let author = parsed
            .get_text_of(&AUTHOR_SELECTOR)
            .or_else(|| parsed.get_attr_content_of(&AUTHOR_FALLBACK_SELECTOR))
            .unwrap_or_else(|| "<unknown>".to_string());

        let cover_image_url = parsed
            .get_attr_of(&COVER_SELECTOR, "src")
            .or_else(|| parsed.get_attr_content_of(&COVER_FALLBACK_SELECTOR));

        let synopsis = parsed.get_text_of(&DESCRIPTION_SELECTOR);

        let estimated_total_chapters = parsed
            .select(&CHAPTER_ROW_SELECTOR)
            .count()
            .try_into()
            .ok();

        Ok(Metadata {
            title,
            author,
            cover_image_url,
            synopsis,
            estimated_total_chapters,
            last_update: Some(Utc::now()),
        })
    }

    fn manifest(&self, story_url: &str) -> Result<Vec<ChapterStub>, FetchError> {
        let body = request::get_text(story_url)?;

        // Chapters array embedded in the page as `window.chapters = [...]`; cheaper and more
        // stable than scraping the chapter table row by row.
        if let Some(captures) = regex!(r"window\.chapters = (\[.*]);").captures(&body) {
            let chapters: Vec<RawChapter> = serde_json::from_str(&captures[1]).map_err(|e| {
                FetchError::Parse {
                    url: story_url.to_string(),
                    reason: e.to_string(),
                }
            })?;
            return Ok(chapters
                .into_iter()
                .enumerate()
                .map(|(i, c)| c.into_stub(i as u32 + 1))
                .collect());
        }

        // Fall back to scraping the chapter table directly.
        let parsed = Html::parse_document(&body);
        Ok(parsed
            .select(&CHAPTER_ROW_SELECTOR)
            .enumerate()
            .filter_map(|(i, a)| {
                let href = a.attr("href")?;
                let url = if href.starts_with('/') {
                    format!("{BASE_URL}{href}")
                } else {
                    href.to_string()
                };
                let source_chapter_id = regex!(r"/chapter/(\d+)/")
                    .captures(&url)
                    .map(|c| c[1].to_string())
                    .unwrap_or_else(|| format!("order_{}", i + 1));
                Some(ChapterStub {
                    source_chapter_id,
                    chapter_title: a.text().collect::<String>().trim().to_string(),
                    chapter_url: url,
                    source_order: i as u32 + 1,
                })
            })
            .collect())
    }

    fn chapter_body(&self, chapter_url: &str) -> Result<String, FetchError> {
        let body = request::get_text(chapter_url)?;
        let mut parsed = Html::parse_document(&body);
        remove_royalroad_watermarks(&mut parsed);

        parsed
            .get_inner_html_of(&CONTENT_SELECTOR)
            .filter(|html| !html.trim().is_empty())
            .ok_or_else(|| FetchError::Parse {
                url: chapter_url.to_string(),
                reason: NOT_FOUND_SENTINEL.to_string(),
            })
    }

    fn probe_next(&self, chapter_url: &str) -> Result<Option<String>, FetchError> {
        let body = request::get_text(chapter_url)?;
        let parsed = Html::parse_document(&body);

        let href = parsed
            .get_attr_of(&NEXT_REL_SELECTOR, "href")
            .or_else(|| parsed.get_attr_of(&NEXT_CLASS_SELECTOR, "href"))
            .or_else(|| parsed.get_attr_of(&NEXT_BTN_SELECTOR, "href"));

        Ok(href.map(|href| {
            if href.starts_with('/') {
                format!("{BASE_URL}{href}")
            } else {
                href
            }
        }))
    }
}

#[derive(Deserialize)]
struct RawChapter {
    id: u32,
    url: String,
    title: String,
}

impl RawChapter {
    fn into_stub(self, source_order: u32) -> ChapterStub {
        ChapterStub {
            source_chapter_id: self.id.to_string(),
            chapter_url: format!("{BASE_URL}{}", self.url),
            chapter_title: self.title,
            source_order,
        }
    }
}

/// Strips RoyalRoad's anti-scraping watermark spans. Please don't use this tool to re-publish
/// authors' work without their permission.
fn remove_royalroad_watermarks(parsed: &mut Html) {
    let ids: Vec<_> = parsed
        .select(&WATERMARK_SELECTOR)
        .filter(|e| e.inner_html().len() < 200)
        .map(|e| e.id())
        .collect();
    for id in ids {
        if let Some(mut node) = parsed.tree.get_mut(id) {
            node.detach();
        }
    }
}
