use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use crate::clean::SentenceFilterConfig;
use crate::epub::{self, EpubOptions};
use crate::error::{FatalError, StoreError};
use crate::fetch::{self, Fetcher};
use crate::index::StoryIndex;
use crate::pool::{DownloadPool, PoolOptions};
use crate::progress::{GeneratedEpubFile, ProgressRecord, ProgressStore};
use crate::reconcile::{self, ReconcileFlags};
use crate::workspace::PathResolver;

/// Phases the CLI's progress surface (MultiProgress bars + styled summaries) renders live, per
/// `SPEC_FULL.md` §4.8 step 9 and §6's logging contract.
#[derive(Debug, Clone)]
pub enum RunEvent {
    FetchingMetadata,
    Reconciled { work_queue_len: usize, total_chapters: usize },
    Downloading { total: usize },
    BuildingEpub,
    Done { generated: Vec<GeneratedEpubFile> },
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub ebook_title_override: Option<String>,
    pub keep_temp_files: bool,
    pub force_reprocessing: bool,
    pub sentence_filter: SentenceFilterConfig,
    pub chapters_per_volume: Option<u32>,
    pub epub_contents: epub::EpubContents,
    pub chapter_limit: Option<u32>,
    pub workers: usize,
    /// Overrides `record.last_downloaded_chapter_url` before reconciliation, so a run can be
    /// pointed at an earlier chapter (e.g. after a manual correction on the source site) instead
    /// of trusting the progress record's own pointer.
    pub resume_from_url: Option<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            ebook_title_override: None,
            keep_temp_files: false,
            force_reprocessing: false,
            sentence_filter: SentenceFilterConfig::default(),
            chapters_per_volume: None,
            epub_contents: epub::EpubContents::default(),
            chapter_limit: None,
            workers: 4,
            resume_from_url: None,
        }
    }
}

/// Runs a single archive cycle for `story_url`: fetch, reconcile, download, save, build EPUB,
/// save again, optionally clean temp files. Mirrors the teacher's top-level `run`/`archive`
/// entry point, generalized to the capability-set [`Fetcher`] trait. See `SPEC_FULL.md` §4.8.
pub fn run(
    workspace_root: &Path,
    index: &mut StoryIndex,
    story_url: &str,
    options: &RunOptions,
    cancel: &Arc<AtomicBool>,
    on_event: &dyn Fn(RunEvent),
) -> Result<ProgressRecord, FatalError> {
    let fetcher = fetch::get(story_url).map_err(|_| FatalError::UnsupportedSource(story_url.to_string()))?;

    on_event(RunEvent::FetchingMetadata);
    let permanent_id = fetcher.permanent_id(story_url).map_err(|_| FatalError::UnsupportedSource(story_url.to_string()))?;

    let source_site = source_site_of(&permanent_id);

    // Resolve a provisional path via the current (possibly stale) title before the metadata
    // fetch, so a brand-new story always has somewhere to load/save a progress record from.
    let provisional_title = index
        .get_folder_name(&permanent_id)
        .map(str::to_string)
        .unwrap_or_else(|| permanent_id.clone());
    let provisional_resolver =
        PathResolver::set_story(workspace_root, index, &permanent_id, &provisional_title)?;
    let mut record = ProgressStore::load_or_new(&provisional_resolver.progress_filepath(), &permanent_id, story_url)?;
    drop(provisional_resolver);

    if let Ok(metadata) = fetcher.metadata(story_url) {
        record.original_title = metadata.title;
        record.original_author = metadata.author;
        record.cover_image_url = metadata.cover_image_url;
        record.synopsis = metadata.synopsis;
        record.estimated_total_chapters_source = metadata.estimated_total_chapters;
    }
    if let Some(override_title) = &options.ebook_title_override {
        record.effective_title = Some(override_title.clone());
    }

    if let Some(resume_url) = &options.resume_from_url {
        record.last_downloaded_chapter_url = Some(resume_url.clone());
    }

    let resolver = PathResolver::set_story(workspace_root, index, &permanent_id, record.title())?;

    let mut manifest = fetcher.manifest(story_url).unwrap_or_default();
    if manifest.is_empty() {
        if let Some(last_url) = &record.last_downloaded_chapter_url {
            if let Ok(Some(_new_next)) = fetcher.probe_next(last_url) {
                manifest = fetcher.manifest(story_url).unwrap_or_default();
            }
        }
    }

    let flags = ReconcileFlags {
        force_reprocessing: options.force_reprocessing,
    };
    let reconciled = reconcile::reconcile(&record, &manifest, flags, Utc::now(), &|c| {
        chapter_files_present(&resolver, c)
    });
    on_event(RunEvent::Reconciled {
        work_queue_len: reconciled.work_queue.len(),
        total_chapters: reconciled.chapters.len(),
    });

    on_event(RunEvent::Downloading { total: reconciled.work_queue.len() });
    let pool = DownloadPool::new(PoolOptions {
        workers: options.workers,
        chapter_limit_for_run: options.chapter_limit,
    })
    .map_err(|e| FatalError::PoolInit(e.to_string()))?;

    let outcomes = pool.run(
        fetcher.as_ref(),
        reconciled.work_queue,
        &resolver,
        &options.sentence_filter,
        source_site,
        cancel,
    );

    record.downloaded_chapters = merge_outcomes(reconciled.chapters, outcomes);
    record.downloaded_chapters.sort_by_key(|c| c.download_order);

    let (last_downloaded, next_to_download) = reconcile::recompute_pointers(&record.downloaded_chapters, &manifest);
    record.last_downloaded_chapter_url = last_downloaded;
    record.next_chapter_to_download_url = next_to_download;

    ProgressStore::save(&resolver.progress_filepath(), &mut record)?;

    on_event(RunEvent::BuildingEpub);
    let epub_options = EpubOptions {
        chapters_per_volume: options.chapters_per_volume,
        epub_contents: options.epub_contents,
    };
    match epub::build(&record, &resolver, &epub_options) {
        Ok(generated) => {
            record.last_epub_processing.timestamp = Some(Utc::now());
            record.last_epub_processing.generated_epub_files = generated;
        }
        Err(e) => {
            info!(permanent_id, error = %e, "epub build failed, progress was still saved");
        }
    }
    ProgressStore::save(&resolver.progress_filepath(), &mut record)?;

    if !options.keep_temp_files {
        resolver.cleanup_temp_dirs().ok();
    }

    on_event(RunEvent::Done {
        generated: record.last_epub_processing.generated_epub_files.clone(),
    });

    Ok(record)
}

/// Ground-truth disk check backing the reconciler's "either local file is missing" edge case
/// (`SPEC_FULL.md` §4.6 step 2): a chapter only counts as still present if both its raw and
/// processed files are recorded *and* actually exist, independent of `keep_temp_files`, since
/// files can disappear between runs regardless of that setting.
fn chapter_files_present(resolver: &PathResolver<'_>, chapter: &crate::progress::ChapterRecord) -> bool {
    let raw_present = chapter
        .local_raw_filename
        .as_deref()
        .is_some_and(|name| resolver.raw_content_file(name).exists());
    let processed_present = chapter
        .local_processed_filename
        .as_deref()
        .is_some_and(|name| resolver.processed_content_file(name).exists());
    raw_present && processed_present
}

fn source_site_of(permanent_id: &str) -> Option<&'static str> {
    if permanent_id.starts_with("royalroad-") {
        Some("royalroad")
    } else {
        None
    }
}

/// Reconciled chapters arrive in `download_order`; pool outcomes arrive in work-queue (source)
/// order. Splice outcomes back in by URL so the final record is a single, order-correct list.
fn merge_outcomes(
    chapters: Vec<crate::progress::ChapterRecord>,
    outcomes: Vec<crate::progress::ChapterRecord>,
) -> Vec<crate::progress::ChapterRecord> {
    let mut outcomes_by_url: std::collections::HashMap<String, crate::progress::ChapterRecord> =
        outcomes.into_iter().map(|c| (c.chapter_url.clone(), c)).collect();

    chapters
        .into_iter()
        .map(|c| outcomes_by_url.remove(&c.chapter_url).unwrap_or(c))
        .collect()
}

impl From<StoreError> for FatalError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Write { path, source } => FatalError::ProgressSave { slug: path, source },
            other => FatalError::ProgressSave {
                slug: "unknown".to_string(),
                source: std::io::Error::other(other.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_outcomes_preserves_download_order() {
        use crate::progress::{ChapterRecord, ChapterStatus};
        let now = Utc::now();
        let chapters = vec![
            ChapterRecord::new_pending("1".into(), "https://x/1".into(), "C1".into(), 1, now),
            ChapterRecord::new_pending("2".into(), "https://x/2".into(), "C2".into(), 2, now),
        ];
        let mut outcome = chapters[1].clone();
        outcome.status = ChapterStatus::Active;

        let merged = merge_outcomes(chapters, vec![outcome]);
        assert_eq!(merged[0].download_order, 1);
        assert_eq!(merged[1].status, ChapterStatus::Active);
    }

    #[test]
    fn source_site_of_recognizes_royalroad() {
        assert_eq!(source_site_of("royalroad-1"), Some("royalroad"));
        assert_eq!(source_site_of("other-1"), None);
    }
}
