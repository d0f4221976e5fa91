use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{info, warn};

use crate::clean::{self, SentenceFilterConfig};
use crate::error::DownloadTaskError;
use crate::fetch::Fetcher;
use crate::progress::{ChapterRecord, ChapterStatus, ErrorInfo};
use crate::workspace::PathResolver;

const DEFAULT_WORKERS: usize = 4;
const MAX_ATTEMPTS: u32 = 5;
const BACKOFF_BASE_SECS: u64 = 1;
const BACKOFF_FACTOR: u64 = 2;

#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    pub workers: usize,
    pub chapter_limit_for_run: Option<u32>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            chapter_limit_for_run: None,
        }
    }
}

/// Executes a reconciled work queue with bounded concurrency, per-host rate limiting (inherited
/// from the Fetcher's own request layer), retries, and cooperative cancellation. Writes raw and
/// processed chapter files atomically and returns the updated records in `download_order`.
///
/// Mirrors the teacher's preference for a synchronous `rayon` worker pool over async tasks
/// (`updater::native::request`'s blocking client is the direct ancestor of this design).
pub struct DownloadPool {
    pool: ThreadPool,
    options: PoolOptions,
}

impl DownloadPool {
    #[allow(clippy::missing_errors_doc)]
    pub fn new(options: PoolOptions) -> Result<Self, rayon::ThreadPoolBuildError> {
        let pool = ThreadPoolBuilder::new().num_threads(options.workers.max(1)).build()?;
        Ok(Self { pool, options })
    }

    /// Runs `work_queue` to completion (or cancellation), writing files under `resolver` and
    /// applying the sentence filter from `sentence_filter`. Returns updated chapter records in
    /// the same order as `work_queue`; merging them into the `ProgressRecord` is the
    /// orchestrator's job (§4.7 step 7: "record merging happens in a single-writer section").
    pub fn run(
        &self,
        fetcher: &dyn Fetcher,
        work_queue: Vec<ChapterRecord>,
        resolver: &PathResolver<'_>,
        sentence_filter: &SentenceFilterConfig,
        source_site: Option<&str>,
        cancel: &Arc<std::sync::atomic::AtomicBool>,
    ) -> Vec<ChapterRecord> {
        let downloaded_this_run = AtomicU32::new(0);
        let limit = self.options.chapter_limit_for_run.unwrap_or(u32::MAX);

        self.pool.install(|| {
            use rayon::prelude::*;
            work_queue
                .into_par_iter()
                .map(|chapter| {
                    if cancel.load(Ordering::Relaxed) {
                        return cancelled(chapter);
                    }
                    if downloaded_this_run.load(Ordering::Relaxed) >= limit {
                        return chapter;
                    }

                    let outcome = run_one(fetcher, &chapter, resolver, sentence_filter, source_site, cancel);
                    if outcome.status == ChapterStatus::Active {
                        downloaded_this_run.fetch_add(1, Ordering::Relaxed);
                    }
                    outcome
                })
                .collect()
        })
    }
}

fn cancelled(mut chapter: ChapterRecord) -> ChapterRecord {
    chapter.error_info = Some(ErrorInfo {
        kind: "cancelled".to_string(),
        message: "run was cancelled before this chapter started".to_string(),
        timestamp: Utc::now(),
    });
    chapter
}

fn run_one(
    fetcher: &dyn Fetcher,
    chapter: &ChapterRecord,
    resolver: &PathResolver<'_>,
    sentence_filter: &SentenceFilterConfig,
    source_site: Option<&str>,
    cancel: &Arc<std::sync::atomic::AtomicBool>,
) -> ChapterRecord {
    let mut chapter = chapter.clone();

    match fetch_with_retry(fetcher, &chapter.chapter_url, cancel) {
        Ok(raw) => match write_and_clean(&chapter, &raw, resolver, sentence_filter, source_site) {
            Ok((raw_name, processed_name)) => {
                chapter.status = ChapterStatus::Active;
                chapter.download_timestamp = Some(Utc::now());
                chapter.local_raw_filename = Some(raw_name);
                chapter.local_processed_filename = Some(processed_name);
                chapter.error_info = None;
                info!(url = chapter.chapter_url, "chapter downloaded");
            }
            Err(e) => mark_failed(&mut chapter, &e),
        },
        Err(e) => mark_failed(&mut chapter, &e),
    }

    chapter
}

fn mark_failed(chapter: &mut ChapterRecord, error: &DownloadTaskError) {
    warn!(url = chapter.chapter_url, error = %error, "chapter task failed");
    chapter.status = ChapterStatus::Failed;
    chapter.error_info = Some(ErrorInfo {
        kind: error_kind(error).to_string(),
        message: error.to_string(),
        timestamp: Utc::now(),
    });
}

fn error_kind(error: &DownloadTaskError) -> &'static str {
    match error {
        DownloadTaskError::Fetch(_) => "fetch_error",
        DownloadTaskError::EmptyAfterClean => "empty_after_clean",
        DownloadTaskError::Filesystem(_) => "filesystem_error",
        DownloadTaskError::Cancelled => "cancelled",
    }
}

/// Retries transient fetch failures with exponential backoff (base 1s, factor 2) and ±20%
/// jitter, bailing out after `MAX_ATTEMPTS`. A 404/parse failure is terminal immediately.
fn fetch_with_retry(
    fetcher: &dyn Fetcher,
    chapter_url: &str,
    cancel: &Arc<std::sync::atomic::AtomicBool>,
) -> Result<String, DownloadTaskError> {
    let mut attempt = 0;
    loop {
        if cancel.load(Ordering::Relaxed) {
            return Err(DownloadTaskError::Cancelled);
        }
        attempt += 1;
        match fetcher.chapter_body(chapter_url) {
            Ok(body) => return Ok(body),
            Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS => {
                let sleep = backoff_with_jitter(attempt);
                warn!(chapter_url, attempt, ?sleep, "transient fetch failure, retrying");
                thread::sleep(sleep);
            }
            Err(e) => return Err(DownloadTaskError::Fetch(e)),
        }
    }
}

fn backoff_with_jitter(attempt: u32) -> Duration {
    let base_ms = BACKOFF_BASE_SECS * 1000 * BACKOFF_FACTOR.pow(attempt - 1);
    // Deterministic, attempt-seeded jitter in [-20%, +20%] without pulling in a PRNG dependency
    // for a pure ±20% cosmetic spread.
    let jitter_pct = (i64::from(attempt) * 37 % 41 - 20) as i64;
    let jittered = i64::try_from(base_ms).unwrap_or(i64::MAX) * (100 + jitter_pct) / 100;
    Duration::from_millis(jittered.max(0).unsigned_abs())
}

fn write_and_clean(
    chapter: &ChapterRecord,
    raw_body: &str,
    resolver: &PathResolver<'_>,
    sentence_filter: &SentenceFilterConfig,
    source_site: Option<&str>,
) -> Result<(String, String), DownloadTaskError> {
    let raw_name = format!(
        "chapter_{:05}_{}.html",
        chapter.download_order, chapter.source_chapter_id
    );
    let processed_name = format!(
        "chapter_{:05}_{}_clean.html",
        chapter.download_order, chapter.source_chapter_id
    );

    atomic_write(&resolver.raw_content_file(&raw_name), raw_body)?;

    let cleaned = clean::clean(raw_body, source_site);
    let cleaned = clean::filter(&cleaned, sentence_filter);

    if cleaned.trim().is_empty() {
        return Err(DownloadTaskError::EmptyAfterClean);
    }

    atomic_write(&resolver.processed_content_file(&processed_name), &cleaned)?;

    Ok((raw_name, processed_name))
}

fn atomic_write(path: &std::path::Path, contents: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp_path = std::path::PathBuf::from(tmp);
    std::fs::write(&tmp_path, contents)?;
    std::fs::rename(&tmp_path, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use crate::fetch::{ChapterStub, Metadata};
    use crate::index::StoryIndex;

    struct StubFetcher {
        body: Result<String, ()>,
    }

    impl Fetcher for StubFetcher {
        fn permanent_id(&self, _story_url: &str) -> Result<String, FetchError> {
            Ok("stub-1".to_string())
        }
        fn metadata(&self, _story_url: &str) -> Result<Metadata, FetchError> {
            Ok(Metadata::default())
        }
        fn manifest(&self, _story_url: &str) -> Result<Vec<ChapterStub>, FetchError> {
            Ok(Vec::new())
        }
        fn chapter_body(&self, chapter_url: &str) -> Result<String, FetchError> {
            self.body.clone().map_err(|()| FetchError::ChapterGone(chapter_url.to_string()))
        }
        fn probe_next(&self, _chapter_url: &str) -> Result<Option<String>, FetchError> {
            Ok(None)
        }
    }

    fn resolver(workspace: &std::path::Path, index: &mut StoryIndex) -> PathResolver<'_> {
        PathResolver::set_story(workspace, index, "stub-1", "Test Story").expect("set_story")
    }

    #[test]
    fn successful_chapter_is_marked_active_with_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut index = StoryIndex::load(dir.path()).expect("index");
        let fetcher = StubFetcher {
            body: Ok(r#"<div class="chapter-content"><p>Hello</p></div>"#.to_string()),
        };
        let resolver = resolver(dir.path(), &mut index);
        let pool = DownloadPool::new(PoolOptions::default()).expect("pool");
        let cancel = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let work_queue = vec![ChapterRecord::new_pending(
            "1".into(),
            "https://x/chapter/1".into(),
            "Chapter 1".into(),
            1,
            Utc::now(),
        )];

        let result = pool.run(
            &fetcher,
            work_queue,
            &resolver,
            &SentenceFilterConfig::default(),
            Some("royalroad"),
            &cancel,
        );

        assert_eq!(result.len(), 1);
        assert_eq!(result[0].status, ChapterStatus::Active);
        assert!(result[0].local_raw_filename.is_some());
        assert!(result[0].local_processed_filename.is_some());
        assert!(resolver.raw_content_file(result[0].local_raw_filename.as_ref().unwrap()).exists());
    }

    #[test]
    fn chapter_gone_is_marked_failed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut index = StoryIndex::load(dir.path()).expect("index");
        let fetcher = StubFetcher { body: Err(()) };
        let resolver = resolver(dir.path(), &mut index);
        let pool = DownloadPool::new(PoolOptions::default()).expect("pool");
        let cancel = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let work_queue = vec![ChapterRecord::new_pending(
            "1".into(),
            "https://x/chapter/1".into(),
            "Chapter 1".into(),
            1,
            Utc::now(),
        )];

        let result = pool.run(
            &fetcher,
            work_queue,
            &resolver,
            &SentenceFilterConfig::default(),
            Some("royalroad"),
            &cancel,
        );

        assert_eq!(result[0].status, ChapterStatus::Failed);
        assert!(result[0].error_info.is_some());
    }

    #[test]
    fn cancellation_before_start_skips_the_task() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut index = StoryIndex::load(dir.path()).expect("index");
        let fetcher = StubFetcher { body: Ok("<p>x</p>".to_string()) };
        let resolver = resolver(dir.path(), &mut index);
        let pool = DownloadPool::new(PoolOptions::default()).expect("pool");
        let cancel = Arc::new(std::sync::atomic::AtomicBool::new(true));

        let work_queue = vec![ChapterRecord::new_pending(
            "1".into(),
            "https://x/chapter/1".into(),
            "Chapter 1".into(),
            1,
            Utc::now(),
        )];

        let result = pool.run(
            &fetcher,
            work_queue,
            &resolver,
            &SentenceFilterConfig::default(),
            Some("royalroad"),
            &cancel,
        );

        assert_eq!(result[0].status, ChapterStatus::Pending);
        assert_eq!(result[0].error_info.as_ref().unwrap().kind, "cancelled");
    }

    #[test]
    fn chapter_limit_stops_scheduling_new_work() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut index = StoryIndex::load(dir.path()).expect("index");
        let fetcher = StubFetcher {
            body: Ok(r#"<div class="chapter-content"><p>Hi</p></div>"#.to_string()),
        };
        let resolver = resolver(dir.path(), &mut index);
        let pool = DownloadPool::new(PoolOptions {
            workers: 1,
            chapter_limit_for_run: Some(1),
        })
        .expect("pool");
        let cancel = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let work_queue = vec![
            ChapterRecord::new_pending("1".into(), "https://x/chapter/1".into(), "C1".into(), 1, Utc::now()),
            ChapterRecord::new_pending("2".into(), "https://x/chapter/2".into(), "C2".into(), 2, Utc::now()),
        ];

        let result = pool.run(
            &fetcher,
            work_queue,
            &resolver,
            &SentenceFilterConfig::default(),
            Some("royalroad"),
            &cancel,
        );

        let active_count = result.iter().filter(|c| c.status == ChapterStatus::Active).count();
        assert_eq!(active_count, 1);
    }
}
