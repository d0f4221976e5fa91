use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::error::{CloudError, StoreError};
use crate::index::StoryIndex;
use crate::progress::{CloudBackupStatus, CloudFileRecord, ProgressStore};
use crate::workspace::PathResolver;

#[derive(Debug, Clone)]
pub struct CloudFileMeta {
    pub id: String,
    pub name: String,
    pub modified_time: DateTime<Utc>,
}

/// Capability set a cloud replication backend must provide. Mirrors the teacher's
/// `Fetcher` pattern: one trait, one concrete implementation selected by name, so a
/// future real backend plugs in without touching [`run_backup`].
pub trait CloudStore: Send + Sync {
    fn ensure_folder(&self, name: &str, parent_id: Option<&str>) -> Result<String, CloudError>;
    fn upload(&self, local_path: &Path, folder_id: &str, remote_name: &str) -> Result<CloudFileMeta, CloudError>;
    fn metadata(&self, folder_id: &str, name: &str) -> Result<Option<CloudFileMeta>, CloudError>;
    fn is_remote_older(&self, local_path: &Path, remote_modified: DateTime<Utc>) -> Result<bool, CloudError>;
}

/// Filesystem-backed stand-in for a real OAuth cloud backend (e.g. Google Drive), so the
/// replication traversal and `cloud_backup_status` bookkeeping are exercisable without
/// network access or credentials. Folder IDs are just paths relative to `root`.
pub struct LocalDriveStore {
    root: PathBuf,
}

impl LocalDriveStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn resolve(&self, folder_id: &str) -> PathBuf {
        if folder_id.is_empty() {
            self.root.clone()
        } else {
            self.root.join(folder_id)
        }
    }
}

impl CloudStore for LocalDriveStore {
    fn ensure_folder(&self, name: &str, parent_id: Option<&str>) -> Result<String, CloudError> {
        let parent = parent_id.unwrap_or("");
        let relative = if parent.is_empty() {
            name.to_string()
        } else {
            format!("{parent}/{name}")
        };
        std::fs::create_dir_all(self.resolve(&relative))
            .map_err(|e| CloudError::Network(e.to_string()))?;
        Ok(relative)
    }

    fn upload(&self, local_path: &Path, folder_id: &str, remote_name: &str) -> Result<CloudFileMeta, CloudError> {
        if !local_path.exists() {
            return Err(CloudError::LocalFileMissing(local_path.display().to_string()));
        }
        let dest_dir = self.resolve(folder_id);
        std::fs::create_dir_all(&dest_dir).map_err(|e| CloudError::Network(e.to_string()))?;
        let dest = dest_dir.join(remote_name);
        std::fs::copy(local_path, &dest).map_err(|e| CloudError::Network(e.to_string()))?;

        let modified_time = std::fs::metadata(&dest)
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        Ok(CloudFileMeta {
            id: format!("{folder_id}/{remote_name}"),
            name: remote_name.to_string(),
            modified_time,
        })
    }

    fn metadata(&self, folder_id: &str, name: &str) -> Result<Option<CloudFileMeta>, CloudError> {
        let path = self.resolve(folder_id).join(name);
        if !path.exists() {
            return Ok(None);
        }
        let modified_time = std::fs::metadata(&path)
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .map_err(|e| CloudError::Network(e.to_string()))?;
        Ok(Some(CloudFileMeta {
            id: format!("{folder_id}/{name}"),
            name: name.to_string(),
            modified_time,
        }))
    }

    fn is_remote_older(&self, local_path: &Path, remote_modified: DateTime<Utc>) -> Result<bool, CloudError> {
        let local_modified = std::fs::metadata(local_path)
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .map_err(|e| CloudError::Network(e.to_string()))?;
        Ok(remote_modified < local_modified)
    }
}

/// Resolves the named cloud service. Only `local` (the filesystem stub) is implemented;
/// a real `gdrive` backend is out of scope (see `SPEC_FULL.md` §6).
pub fn resolve_store(service: &str, workspace_root: &Path) -> Result<Box<dyn CloudStore>, CloudError> {
    match service {
        "local" | "gdrive" => Ok(Box::new(LocalDriveStore::new(workspace_root.join("cloud_backups")))),
        other => Err(CloudError::Auth(format!("unknown cloud service: {other}"))),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackupOptions {
    pub force_full_upload: bool,
}

#[derive(Debug, Clone)]
pub struct BackupOutcome {
    pub permanent_id: String,
    pub uploaded_files: usize,
    pub skipped: bool,
    pub error: Option<String>,
}

const BASE_BACKUP_FOLDER: &str = "webnovel-archiver-backups";

/// Replicates one or every story's progress file and generated EPUBs to `store`, per
/// `SPEC_FULL.md` §6/§9: only stories with changes since their last successful backup are
/// re-uploaded unless `options.force_full_upload` is set. Opens its own `ProgressStore`
/// handle per story and only rewrites `cloud_backup_status`, never touching the rest of
/// the record concurrently with an archive run.
pub fn run_backup(
    store: &dyn CloudStore,
    workspace_root: &Path,
    index: &mut StoryIndex,
    story_id: Option<&str>,
    options: BackupOptions,
) -> Result<Vec<BackupOutcome>, StoreError> {
    let base_folder_id = store
        .ensure_folder(BASE_BACKUP_FOLDER, None)
        .unwrap_or_else(|_| BASE_BACKUP_FOLDER.to_string());

    let targets: Vec<(String, String)> = match story_id {
        Some(id) => index
            .get_folder_name(id)
            .map(|folder| vec![(id.to_string(), folder.to_string())])
            .unwrap_or_default(),
        None => index
            .entries()
            .map(|(id, folder)| (id.to_string(), folder.to_string()))
            .collect(),
    };

    let mut outcomes = Vec::with_capacity(targets.len());
    for (permanent_id, folder_name) in targets {
        outcomes.push(backup_one_story(
            store,
            workspace_root,
            index,
            &permanent_id,
            &folder_name,
            &base_folder_id,
            options,
        )?);
    }
    Ok(outcomes)
}

fn backup_one_story(
    store: &dyn CloudStore,
    workspace_root: &Path,
    index: &mut StoryIndex,
    permanent_id: &str,
    folder_name: &str,
    base_folder_id: &str,
    options: BackupOptions,
) -> Result<BackupOutcome, StoreError> {
    let resolver = PathResolver::set_story(workspace_root, index, permanent_id, folder_name)?;
    let progress_path = resolver.progress_filepath();

    if !progress_path.exists() {
        warn!(permanent_id, "progress file missing, skipping backup");
        return Ok(BackupOutcome {
            permanent_id: permanent_id.to_string(),
            uploaded_files: 0,
            skipped: true,
            error: None,
        });
    }

    let mut record = ProgressStore::load(&progress_path)?;

    let needs_backup = options.force_full_upload
        || record.cloud_backup_status.last_success.is_none()
        || record
            .last_updated_timestamp
            .zip(record.cloud_backup_status.last_success)
            .is_some_and(|(updated, last_success)| updated > last_success);

    if !needs_backup {
        info!(permanent_id, "no changes since last backup, skipping");
        return Ok(BackupOutcome {
            permanent_id: permanent_id.to_string(),
            uploaded_files: 0,
            skipped: true,
            error: None,
        });
    }

    let story_folder_id = match store.ensure_folder(permanent_id, Some(base_folder_id)) {
        Ok(id) => id,
        Err(e) => {
            return Ok(BackupOutcome {
                permanent_id: permanent_id.to_string(),
                uploaded_files: 0,
                skipped: false,
                error: Some(e.to_string()),
            });
        }
    };

    let mut files_to_upload = vec![(progress_path.clone(), "progress_status.json".to_string())];
    for epub in &record.last_epub_processing.generated_epub_files {
        files_to_upload.push((PathBuf::from(&epub.absolute_path), epub.name.clone()));
    }

    let mut uploaded = Vec::new();
    for (local_path, remote_name) in files_to_upload {
        match store.upload(&local_path, &story_folder_id, &remote_name) {
            Ok(meta) => uploaded.push(CloudFileRecord {
                remote_name: meta.name,
                remote_modified_time: meta.modified_time,
                uploaded_at: Utc::now(),
            }),
            Err(e) => warn!(permanent_id, %remote_name, error = %e, "upload failed"),
        }
    }

    let uploaded_count = uploaded.len();
    record.cloud_backup_status = CloudBackupStatus {
        last_attempt: Some(Utc::now()),
        last_success: Some(Utc::now()),
        files: uploaded,
    };
    ProgressStore::save(&progress_path, &mut record)?;

    Ok(BackupOutcome {
        permanent_id: permanent_id.to_string(),
        uploaded_files: uploaded_count,
        skipped: false,
        error: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressRecord;

    #[test]
    fn local_drive_upload_round_trips_metadata() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LocalDriveStore::new(dir.path().join("drive"));

        let local_dir = dir.path().join("local");
        std::fs::create_dir_all(&local_dir).expect("mkdir");
        let local_file = local_dir.join("progress_status.json");
        std::fs::write(&local_file, "{}").expect("write");

        let folder_id = store.ensure_folder("story-1", None).expect("ensure_folder");
        let meta = store.upload(&local_file, &folder_id, "progress_status.json").expect("upload");
        assert_eq!(meta.name, "progress_status.json");

        let fetched = store.metadata(&folder_id, "progress_status.json").expect("metadata");
        assert!(fetched.is_some());
    }

    #[test]
    fn upload_of_missing_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LocalDriveStore::new(dir.path().join("drive"));
        let folder_id = store.ensure_folder("story-1", None).expect("ensure_folder");

        let result = store.upload(&dir.path().join("does-not-exist.json"), &folder_id, "x.json");
        assert!(result.is_err());
    }

    #[test]
    fn run_backup_skips_story_with_no_progress_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut index = StoryIndex::load(dir.path()).expect("index");
        index.add_story("royalroad-1", "a-story").expect("add_story");

        let store = LocalDriveStore::new(dir.path().join("drive"));
        let outcomes = run_backup(
            &store,
            dir.path(),
            &mut index,
            None,
            BackupOptions { force_full_upload: false },
        )
        .expect("run_backup");

        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].skipped);
    }

    #[test]
    fn run_backup_uploads_progress_file_for_fresh_story() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut index = StoryIndex::load(dir.path()).expect("index");
        let resolver = PathResolver::set_story(dir.path(), &mut index, "royalroad-1", "a-story").expect("set_story");

        let mut record = ProgressRecord::new("royalroad-1", "https://x");
        ProgressStore::save(&resolver.progress_filepath(), &mut record).expect("save");
        drop(resolver);

        let store = LocalDriveStore::new(dir.path().join("drive"));
        let outcomes = run_backup(
            &store,
            dir.path(),
            &mut index,
            None,
            BackupOptions { force_full_upload: false },
        )
        .expect("run_backup");

        assert_eq!(outcomes.len(), 1);
        assert!(!outcomes[0].skipped);
        assert_eq!(outcomes[0].uploaded_files, 1);
    }
}
