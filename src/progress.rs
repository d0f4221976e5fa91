use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::StoreError;

pub const PROGRESS_FILE_VERSION: &str = "1.1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChapterStatus {
    Pending,
    Active,
    Failed,
    Archived,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterRecord {
    pub source_chapter_id: String,
    pub chapter_url: String,
    pub chapter_title: String,
    pub download_order: u32,
    pub status: ChapterStatus,
    pub first_seen_on: DateTime<Utc>,
    pub last_checked_on: DateTime<Utc>,
    pub download_timestamp: Option<DateTime<Utc>>,
    pub local_raw_filename: Option<String>,
    pub local_processed_filename: Option<String>,
    pub error_info: Option<ErrorInfo>,
}

impl ChapterRecord {
    pub fn new_pending(
        source_chapter_id: String,
        chapter_url: String,
        chapter_title: String,
        download_order: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            source_chapter_id,
            chapter_url,
            chapter_title,
            download_order,
            status: ChapterStatus::Pending,
            first_seen_on: now,
            last_checked_on: now,
            download_timestamp: None,
            local_raw_filename: None,
            local_processed_filename: None,
            error_info: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedEpubFile {
    pub name: String,
    pub absolute_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EpubProcessing {
    pub timestamp: Option<DateTime<Utc>>,
    pub generated_epub_files: Vec<GeneratedEpubFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudFileRecord {
    pub remote_name: String,
    pub remote_modified_time: DateTime<Utc>,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloudBackupStatus {
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub files: Vec<CloudFileRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub version: String,
    pub permanent_id: String,
    pub story_url: String,
    pub original_title: String,
    pub effective_title: Option<String>,
    pub original_author: String,
    pub cover_image_url: Option<String>,
    pub synopsis: Option<String>,
    pub estimated_total_chapters_source: Option<u32>,
    pub downloaded_chapters: Vec<ChapterRecord>,
    pub last_downloaded_chapter_url: Option<String>,
    pub next_chapter_to_download_url: Option<String>,
    #[serde(default)]
    pub last_epub_processing: EpubProcessing,
    #[serde(default)]
    pub cloud_backup_status: CloudBackupStatus,
    pub last_updated_timestamp: Option<DateTime<Utc>>,
}

impl ProgressRecord {
    pub fn new(permanent_id: &str, story_url: &str) -> Self {
        Self {
            version: PROGRESS_FILE_VERSION.to_string(),
            permanent_id: permanent_id.to_string(),
            story_url: story_url.to_string(),
            original_title: String::new(),
            effective_title: None,
            original_author: String::new(),
            cover_image_url: None,
            synopsis: None,
            estimated_total_chapters_source: None,
            downloaded_chapters: Vec::new(),
            last_downloaded_chapter_url: None,
            next_chapter_to_download_url: None,
            last_epub_processing: EpubProcessing::default(),
            cloud_backup_status: CloudBackupStatus::default(),
            last_updated_timestamp: None,
        }
    }

    pub fn title(&self) -> &str {
        self.effective_title.as_deref().unwrap_or(&self.original_title)
    }
}

/// Loads and atomically saves per-story `ProgressRecord`s, with in-place schema migration for
/// records written before the per-chapter status/timestamp fields existed.
pub struct ProgressStore;

impl ProgressStore {
    pub fn load(progress_filepath: &Path) -> Result<ProgressRecord, StoreError> {
        if !progress_filepath.exists() {
            return Err(StoreError::Read {
                path: progress_filepath.display().to_string(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }

        let raw = std::fs::read_to_string(progress_filepath).map_err(|source| StoreError::Read {
            path: progress_filepath.display().to_string(),
            source,
        })?;

        let mut value: serde_json::Value =
            serde_json::from_str(&raw).map_err(|source| StoreError::Parse {
                path: progress_filepath.display().to_string(),
                source,
            })?;

        if Self::needs_schema_migration(&value) {
            Self::backup_legacy_file(progress_filepath, &raw);
            Self::migrate_schema_in_place(&mut value);
        }

        serde_json::from_value(value).map_err(|source| StoreError::Parse {
            path: progress_filepath.display().to_string(),
            source,
        })
    }

    pub fn load_or_new(
        progress_filepath: &Path,
        permanent_id: &str,
        story_url: &str,
    ) -> Result<ProgressRecord, StoreError> {
        match Self::load(progress_filepath) {
            Ok(record) => Ok(record),
            Err(StoreError::Read { .. }) => Ok(ProgressRecord::new(permanent_id, story_url)),
            Err(other) => Err(other),
        }
    }

    pub fn save(progress_filepath: &Path, record: &mut ProgressRecord) -> Result<(), StoreError> {
        record.last_updated_timestamp = Some(Utc::now());
        record.version = PROGRESS_FILE_VERSION.to_string();

        if let Some(parent) = progress_filepath.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Write {
                path: progress_filepath.display().to_string(),
                source,
            })?;
        }

        let json = serde_json::to_string_pretty(record).map_err(|source| StoreError::Parse {
            path: progress_filepath.display().to_string(),
            source,
        })?;

        let tmp_path = Self::tmp_path(progress_filepath);
        std::fs::write(&tmp_path, json).map_err(|source| StoreError::Write {
            path: tmp_path.display().to_string(),
            source,
        })?;
        std::fs::rename(&tmp_path, progress_filepath).map_err(|source| StoreError::Write {
            path: progress_filepath.display().to_string(),
            source,
        })
    }

    fn tmp_path(path: &Path) -> PathBuf {
        let mut os_str = path.as_os_str().to_owned();
        os_str.push(".tmp");
        PathBuf::from(os_str)
    }

    fn needs_schema_migration(value: &serde_json::Value) -> bool {
        value
            .get("downloaded_chapters")
            .and_then(|c| c.as_array())
            .is_some_and(|chapters| {
                chapters
                    .iter()
                    .any(|c| c.get("status").is_none() || c.get("first_seen_on").is_none())
            })
    }

    fn backup_legacy_file(progress_filepath: &Path, raw: &str) {
        let backup_path = Self::tmp_path(progress_filepath).with_extension("bak");
        if let Err(e) = std::fs::write(&backup_path, raw) {
            warn!(path = %backup_path.display(), error = %e, "could not write schema-migration backup");
        }
    }

    fn migrate_schema_in_place(value: &mut serde_json::Value) {
        let mtime_fallback = value
            .get("last_updated_timestamp")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.to_utc())
            .unwrap_or_else(Utc::now);

        if let Some(chapters) = value
            .get_mut("downloaded_chapters")
            .and_then(|c| c.as_array_mut())
        {
            for chapter in chapters {
                let Some(obj) = chapter.as_object_mut() else {
                    continue;
                };
                obj.entry("status")
                    .or_insert_with(|| serde_json::Value::String("active".to_string()));
                obj.entry("first_seen_on")
                    .or_insert_with(|| serde_json::Value::String(mtime_fallback.to_rfc3339()));
                obj.entry("last_checked_on")
                    .or_insert_with(|| serde_json::Value::String(mtime_fallback.to_rfc3339()));
                obj.entry("error_info").or_insert(serde_json::Value::Null);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_chapters() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("progress.json");

        let mut record = ProgressRecord::new("royalroad-1", "https://www.royalroad.com/fiction/1");
        record.downloaded_chapters.push(ChapterRecord::new_pending(
            "1".into(),
            "https://www.royalroad.com/fiction/1/chapter/1".into(),
            "Chapter 1".into(),
            1,
            Utc::now(),
        ));

        ProgressStore::save(&path, &mut record).expect("save");
        let reloaded = ProgressStore::load(&path).expect("load");

        assert_eq!(reloaded.downloaded_chapters.len(), 1);
        assert_eq!(reloaded.downloaded_chapters[0].download_order, 1);
    }

    #[test]
    fn legacy_schema_is_migrated_in_place() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("progress.json");
        std::fs::write(
            &path,
            serde_json::json!({
                "version": "1.0",
                "permanent_id": "royalroad-1",
                "story_url": "https://www.royalroad.com/fiction/1",
                "original_title": "Test",
                "original_author": "Author",
                "downloaded_chapters": [
                    {
                        "source_chapter_id": "1",
                        "chapter_url": "https://www.royalroad.com/fiction/1/chapter/1",
                        "chapter_title": "Chapter 1",
                        "download_order": 1
                    }
                ]
            })
            .to_string(),
        )
        .expect("write legacy");

        let migrated = ProgressStore::load(&path).expect("load");
        assert_eq!(migrated.downloaded_chapters[0].status, ChapterStatus::Active);

        let backup = path.with_extension("tmp").with_extension("bak");
        assert!(backup.exists());
    }

    #[test]
    fn missing_file_yields_default() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("progress.json");
        let record = ProgressStore::load_or_new(&path, "royalroad-1", "https://x").expect("load_or_new");
        assert!(record.downloaded_chapters.is_empty());
    }
}
