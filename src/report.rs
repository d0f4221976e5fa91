use std::fmt::Write as _;
use std::path::Path;

use tracing::warn;

use crate::error::StoreError;
use crate::index::StoryIndex;
use crate::progress::{ChapterStatus, ProgressStore};
use crate::workspace::PathResolver;

/// Renders a read-only static HTML index over every story reachable from the Story Index, per
/// `SPEC_FULL.md` §6: title, chapter counts, last-updated timestamp, links to generated EPUBs.
/// No client-side scripting, no pagination — this is a view, not state the core depends on.
pub fn generate(workspace_root: &Path, index: &mut StoryIndex) -> Result<std::path::PathBuf, StoreError> {
    let entries: Vec<(String, String)> = index
        .entries()
        .map(|(id, folder)| (id.to_string(), folder.to_string()))
        .collect();

    let mut cards = String::new();
    for (permanent_id, folder_name) in &entries {
        let resolver = PathResolver::set_story(workspace_root, index, permanent_id, folder_name)?;
        let progress_path = resolver.progress_filepath();
        if !progress_path.exists() {
            warn!(permanent_id, "progress file missing, omitting from report");
            continue;
        }
        match ProgressStore::load(&progress_path) {
            Ok(record) => {
                let _ = write!(cards, "{}", story_card_html(permanent_id, &record));
            }
            Err(e) => warn!(permanent_id, error = %e, "could not load progress for report"),
        }
    }

    if cards.is_empty() {
        cards.push_str("<p class=\"no-items\">No stories found in the archive to report.</p>");
    }

    let html = html_skeleton(&cards, entries.len());

    let reports_dir = workspace_root.join("reports");
    std::fs::create_dir_all(&reports_dir).map_err(|source| StoreError::Write {
        path: reports_dir.display().to_string(),
        source,
    })?;
    let report_path = reports_dir.join("index.html");
    std::fs::write(&report_path, html).map_err(|source| StoreError::Write {
        path: report_path.display().to_string(),
        source,
    })?;

    Ok(report_path)
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn story_card_html(permanent_id: &str, record: &crate::progress::ProgressRecord) -> String {
    let title = escape_html(record.title());
    let author = escape_html(&record.original_author);
    let permanent_id_escaped = escape_html(permanent_id);

    let total = record.downloaded_chapters.len();
    let active = record
        .downloaded_chapters
        .iter()
        .filter(|c| c.status == ChapterStatus::Active)
        .count();
    let archived = record
        .downloaded_chapters
        .iter()
        .filter(|c| c.status == ChapterStatus::Archived)
        .count();

    let last_updated = record
        .last_updated_timestamp
        .map(|ts| ts.to_rfc3339())
        .unwrap_or_else(|| "never".to_string());

    let mut epub_links = String::new();
    for epub in &record.last_epub_processing.generated_epub_files {
        let _ = write!(
            epub_links,
            "<li><a href=\"file://{}\">{}</a></li>",
            escape_html(&epub.absolute_path),
            escape_html(&epub.name)
        );
    }
    if epub_links.is_empty() {
        epub_links.push_str("<li>no EPUB generated yet</li>");
    }

    format!(
        r#"<div class="story-card">
  <h2>{title}</h2>
  <p class="author">by {author}</p>
  <p class="permanent-id">{permanent_id_escaped}</p>
  <p class="chapters">{total} chapters ({active} active, {archived} archived)</p>
  <p class="last-updated">Last updated: {last_updated}</p>
  <ul class="epubs">{epub_links}</ul>
</div>
"#
    )
}

fn html_skeleton(body: &str, story_count: usize) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>Webnovel Archive Report</title>
<style>
body {{ font-family: sans-serif; max-width: 900px; margin: 2rem auto; }}
.story-card {{ border: 1px solid #ccc; border-radius: 6px; padding: 1rem; margin-bottom: 1rem; }}
.author {{ color: #555; }}
.permanent-id {{ font-family: monospace; color: #888; font-size: 0.85em; }}
</style>
</head>
<body>
<h1>Webnovel Archive Report</h1>
<p>{story_count} stories archived</p>
{body}
</body>
</html>
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressRecord;

    #[test]
    fn report_lists_every_story_with_chapter_counts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut index = StoryIndex::load(dir.path()).expect("index");
        let resolver = PathResolver::set_story(dir.path(), &mut index, "royalroad-1", "My Story").expect("set_story");

        let mut record = ProgressRecord::new("royalroad-1", "https://x");
        record.original_title = "My Story".to_string();
        ProgressStore::save(&resolver.progress_filepath(), &mut record).expect("save");
        drop(resolver);

        let report_path = generate(dir.path(), &mut index).expect("generate");
        let html = std::fs::read_to_string(&report_path).expect("read report");

        assert!(html.contains("My Story"));
        assert!(html.contains("1 stories archived"));
    }

    #[test]
    fn empty_index_still_produces_a_report() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut index = StoryIndex::load(dir.path()).expect("index");

        let report_path = generate(dir.path(), &mut index).expect("generate");
        let html = std::fs::read_to_string(&report_path).expect("read report");

        assert!(html.contains("No stories found"));
    }
}
