use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::fetch::ChapterStub;
use crate::progress::{ChapterRecord, ChapterStatus, ProgressRecord};

#[derive(Debug, Clone, Copy)]
pub struct ReconcileFlags {
    pub force_reprocessing: bool,
}

/// Reconciliation output: the full, updated chapter set (already sorted by `download_order`)
/// plus the subset that needs a download this run, in source order.
///
/// `last_downloaded_chapter_url`/`next_chapter_to_download_url` reflect chapter state as known
/// *before* the download pool runs this cycle's work queue; the orchestrator must call
/// [`recompute_pointers`] again once the pool's outcomes are merged in, since newly-queued
/// chapters are still `pending` here.
pub struct ReconcileResult {
    pub chapters: Vec<ChapterRecord>,
    pub work_queue: Vec<ChapterRecord>,
    pub last_downloaded_chapter_url: Option<String>,
    pub next_chapter_to_download_url: Option<String>,
}

/// Diffs `manifest` against `record`'s known chapters and classifies each as new, needing
/// reprocess, unchanged, or (if absent from the manifest) archived.
///
/// `files_present` is called for each chapter already known to the progress record and must
/// report whether both its raw and processed files genuinely exist on disk right now; a chapter
/// whose files were deleted out from under the progress record is reprocessed unconditionally,
/// matching `files_present` being the caller's only I/O seam (everything else here is pure).
///
/// See `SPEC_FULL.md` §4.6 for the full algorithm and its resolved Open Questions.
pub fn reconcile(
    record: &ProgressRecord,
    manifest: &[ChapterStub],
    flags: ReconcileFlags,
    now: DateTime<Utc>,
    files_present: &dyn Fn(&ChapterRecord) -> bool,
) -> ReconcileResult {
    let mut existing_by_url: HashMap<&str, ChapterRecord> = record
        .downloaded_chapters
        .iter()
        .map(|c| (c.chapter_url.as_str(), c.clone()))
        .collect();

    let mut max_existing_order = record
        .downloaded_chapters
        .iter()
        .map(|c| c.download_order)
        .max()
        .unwrap_or(0);

    let mut chapters: Vec<ChapterRecord> = Vec::with_capacity(manifest.len());
    let mut work_queue: Vec<ChapterRecord> = Vec::new();

    for stub in manifest {
        if let Some(mut existing) = existing_by_url.remove(stub.chapter_url.as_str()) {
            existing.last_checked_on = now;
            existing.chapter_title = stub.chapter_title.clone();
            existing.source_chapter_id = stub.source_chapter_id.clone();

            let missing_files = !files_present(&existing);
            // A chapter reappearing after being archived must be reprocessed to flip its status
            // back to `active`; merely finding its URL in the manifest again isn't enough.
            let needs_reprocess = flags.force_reprocessing
                || matches!(
                    existing.status,
                    ChapterStatus::Failed | ChapterStatus::Pending | ChapterStatus::Archived
                )
                || missing_files;

            if needs_reprocess {
                existing.status = ChapterStatus::Pending;
                work_queue.push(existing.clone());
            }
            chapters.push(existing);
        } else {
            max_existing_order += 1;
            let fresh = ChapterRecord::new_pending(
                stub.source_chapter_id.clone(),
                stub.chapter_url.clone(),
                stub.chapter_title.clone(),
                max_existing_order,
                now,
            );
            work_queue.push(fresh.clone());
            chapters.push(fresh);
        }
    }

    // Anything left in `existing_by_url` was not in the current manifest: archive it, but keep
    // its order and files.
    for mut archived in existing_by_url.into_values() {
        archived.status = ChapterStatus::Archived;
        archived.last_checked_on = now;
        chapters.push(archived);
    }

    chapters.sort_by_key(|c| c.download_order);

    let (last_downloaded_chapter_url, next_chapter_to_download_url) =
        recompute_pointers(&chapters, manifest);

    ReconcileResult {
        chapters,
        work_queue,
        last_downloaded_chapter_url,
        next_chapter_to_download_url,
    }
}

/// Derives `last_downloaded_chapter_url` (highest source-ordered `active` chapter) and
/// `next_chapter_to_download_url` (first source-ordered chapter that is not `active`) from the
/// current chapter set. Called by [`reconcile`] for a pre-download estimate, and again by the
/// orchestrator after the download pool's outcomes are merged in, per SPEC_FULL.md §4.6 step 6.
pub fn recompute_pointers(
    chapters: &[ChapterRecord],
    manifest: &[ChapterStub],
) -> (Option<String>, Option<String>) {
    let source_order: HashMap<&str, u32> = manifest
        .iter()
        .map(|s| (s.chapter_url.as_str(), s.source_order))
        .collect();

    let last_downloaded_chapter_url = chapters
        .iter()
        .filter(|c| c.status == ChapterStatus::Active)
        .filter_map(|c| source_order.get(c.chapter_url.as_str()).map(|order| (*order, c)))
        .max_by_key(|(order, _)| *order)
        .map(|(_, c)| c.chapter_url.clone());

    let next_chapter_to_download_url = manifest
        .iter()
        .min_by_key(|s| s.source_order)
        .iter()
        .flat_map(|_| manifest.iter())
        .filter(|stub| {
            chapters
                .iter()
                .find(|c| c.chapter_url == stub.chapter_url)
                .is_none_or(|c| c.status != ChapterStatus::Active)
        })
        .min_by_key(|s| s.source_order)
        .map(|s| s.chapter_url.clone());

    (last_downloaded_chapter_url, next_chapter_to_download_url)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub(order: u32, id: &str) -> ChapterStub {
        ChapterStub {
            source_chapter_id: id.to_string(),
            chapter_url: format!("https://x/chapter/{id}"),
            chapter_title: format!("Chapter {id}"),
            source_order: order,
        }
    }

    fn active_record(order: u32, id: &str, now: DateTime<Utc>) -> ChapterRecord {
        let mut c = ChapterRecord::new_pending(
            id.to_string(),
            format!("https://x/chapter/{id}"),
            format!("Chapter {id}"),
            order,
            now,
        );
        c.status = ChapterStatus::Active;
        c.local_raw_filename = Some(format!("{id}.html"));
        c.local_processed_filename = Some(format!("{id}_clean.html"));
        c
    }

    fn flags() -> ReconcileFlags {
        ReconcileFlags { force_reprocessing: false }
    }

    fn all_present(_: &ChapterRecord) -> bool {
        true
    }

    #[test]
    fn fresh_archive_assigns_monotonic_order() {
        let now = Utc::now();
        let record = ProgressRecord::new("royalroad-1", "https://x");
        let manifest = vec![stub(1, "a"), stub(2, "b"), stub(3, "c")];

        let result = reconcile(&record, &manifest, flags(), now, &all_present);

        assert_eq!(result.work_queue.len(), 3);
        assert_eq!(
            result.chapters.iter().map(|c| c.download_order).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn incremental_run_only_queues_new_chapter() {
        let now = Utc::now();
        let mut record = ProgressRecord::new("royalroad-1", "https://x");
        record.downloaded_chapters = vec![
            active_record(1, "a", now),
            active_record(2, "b", now),
            active_record(3, "c", now),
        ];
        let manifest = vec![stub(1, "a"), stub(2, "b"), stub(3, "c"), stub(4, "d")];

        let result = reconcile(&record, &manifest, flags(), now, &all_present);

        assert_eq!(result.work_queue.len(), 1);
        assert_eq!(result.work_queue[0].download_order, 4);
        // D is still `pending` at reconcile time; the pool hasn't run yet.
        assert_eq!(result.next_chapter_to_download_url.as_deref(), Some("https://x/chapter/d"));

        // Once the pool reports D downloaded, the orchestrator recomputes the pointers.
        let mut chapters = result.chapters;
        chapters.last_mut().expect("d present").status = ChapterStatus::Active;
        let (_, next) = recompute_pointers(&chapters, &manifest);
        assert!(next.is_none());
    }

    #[test]
    fn chapter_absent_from_manifest_is_archived_not_deleted() {
        let now = Utc::now();
        let mut record = ProgressRecord::new("royalroad-1", "https://x");
        record.downloaded_chapters = vec![
            active_record(1, "a", now),
            active_record(2, "b", now),
            active_record(3, "c", now),
        ];
        let manifest = vec![stub(1, "a"), stub(2, "c")];

        let result = reconcile(&record, &manifest, flags(), now, &all_present);

        let b = result.chapters.iter().find(|c| c.source_chapter_id == "b").expect("b present");
        assert_eq!(b.status, ChapterStatus::Archived);
        assert_eq!(b.download_order, 2);
        let c = result.chapters.iter().find(|c| c.source_chapter_id == "c").expect("c present");
        assert_eq!(c.download_order, 3);
    }

    #[test]
    fn reappearance_keeps_original_order() {
        let now = Utc::now();
        let mut record = ProgressRecord::new("royalroad-1", "https://x");
        record.downloaded_chapters = vec![active_record(1, "a", now), active_record(2, "b", now)];
        record.downloaded_chapters[1].status = ChapterStatus::Archived;
        let manifest = vec![stub(1, "a"), stub(2, "b")];

        let result = reconcile(&record, &manifest, flags(), now, &all_present);
        let b = result.chapters.iter().find(|c| c.source_chapter_id == "b").expect("b present");
        assert_eq!(b.download_order, 2);
        assert_eq!(b.status, ChapterStatus::Pending); // queued for re-download; pool will flip to Active
    }

    #[test]
    fn force_reprocessing_preserves_order_and_requeues_all() {
        let now = Utc::now();
        let mut record = ProgressRecord::new("royalroad-1", "https://x");
        record.downloaded_chapters = vec![active_record(1, "a", now), active_record(2, "b", now)];
        let manifest = vec![stub(1, "a"), stub(2, "b")];

        let forced = ReconcileFlags { force_reprocessing: true };
        let result = reconcile(&record, &manifest, forced, now, &all_present);

        assert_eq!(result.work_queue.len(), 2);
        assert_eq!(result.chapters[0].download_order, 1);
        assert_eq!(result.chapters[1].download_order, 2);
    }

    #[test]
    fn missing_file_on_disk_forces_reprocess_even_when_active() {
        let now = Utc::now();
        let mut record = ProgressRecord::new("royalroad-1", "https://x");
        record.downloaded_chapters = vec![active_record(1, "a", now), active_record(2, "b", now)];
        let manifest = vec![stub(1, "a"), stub(2, "b")];

        // "b"'s processed file was deleted out from under the progress record; "a"'s files are
        // both still present.
        let result = reconcile(&record, &manifest, flags(), now, &|c| c.source_chapter_id != "b");

        let a = result.chapters.iter().find(|c| c.source_chapter_id == "a").expect("a present");
        assert_eq!(a.status, ChapterStatus::Active);
        assert!(result.work_queue.iter().all(|c| c.source_chapter_id != "a"));

        let b = result.chapters.iter().find(|c| c.source_chapter_id == "b").expect("b present");
        assert_eq!(b.status, ChapterStatus::Pending);
        assert!(result.work_queue.iter().any(|c| c.source_chapter_id == "b"));
    }

    #[test]
    fn chapter_limit_does_not_truncate_the_work_queue() {
        // Capping `downloaded_this_run` to the configured limit is the download pool's job
        // (success-gated counter, SPEC_FULL.md §4.7); reconcile always surfaces the full,
        // source-ordered work queue regardless of any configured limit.
        let now = Utc::now();
        let record = ProgressRecord::new("royalroad-1", "https://x");
        let manifest = vec![stub(1, "a"), stub(2, "b"), stub(3, "c"), stub(4, "d"), stub(5, "e")];

        let result = reconcile(&record, &manifest, flags(), now, &all_present);

        assert_eq!(result.work_queue.len(), 5);
        assert_eq!(result.chapters.len(), 5);
    }
}
