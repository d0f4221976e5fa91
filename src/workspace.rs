use std::path::{Path, PathBuf};

use tracing::{error, info};

use crate::error::StoreError;
use crate::index::StoryIndex;
use crate::slug;

const RAW_CONTENT_DIR: &str = "raw_content";
const PROCESSED_CONTENT_DIR: &str = "processed_content";
const EBOOKS_DIR: &str = "ebooks";
const ARCHIVAL_STATUS_DIR: &str = "archival_status";
const TEMP_COVER_DIR: &str = "temp_cover_images";
const PROGRESS_FILENAME: &str = "progress.json";

/// Maps `(workspace, permanent story ID)` to the four per-story directories, renaming them on
/// title change. Mirrors the original `PathManager`; the directory rename this performs is
/// explicitly NOT atomic across the four directories (see SPEC_FULL.md C4 and §9).
pub struct PathResolver<'a> {
    workspace_root: PathBuf,
    index: &'a mut StoryIndex,
    permanent_id: String,
    folder_name: String,
}

impl<'a> PathResolver<'a> {
    /// Resolves (and, if needed, renames) the story's folder slug from its effective title.
    pub fn set_story(
        workspace_root: &Path,
        index: &'a mut StoryIndex,
        permanent_id: &str,
        effective_title: &str,
    ) -> Result<Self, StoreError> {
        let new_slug = slug::generate(effective_title);

        let folder_name = match index.get_folder_name(permanent_id) {
            Some(existing) if existing == new_slug => existing.to_string(),
            Some(existing) => {
                let existing = existing.to_string();
                Self::rename_story_folders(workspace_root, &existing, &new_slug);
                index.update_folder_name(permanent_id, &new_slug)?;
                new_slug
            }
            None => {
                index.add_story(permanent_id, &new_slug)?;
                new_slug
            }
        };

        Ok(Self {
            workspace_root: workspace_root.to_path_buf(),
            index,
            permanent_id: permanent_id.to_string(),
            folder_name,
        })
    }

    fn rename_story_folders(workspace_root: &Path, old_slug: &str, new_slug: &str) {
        info!(old_slug, new_slug, "renaming story folders");
        for dir_name in [
            RAW_CONTENT_DIR,
            PROCESSED_CONTENT_DIR,
            EBOOKS_DIR,
            ARCHIVAL_STATUS_DIR,
        ] {
            let base = workspace_root.join(dir_name);
            let old_path = base.join(old_slug);
            let new_path = base.join(new_slug);
            if old_path.exists() {
                if let Err(e) = std::fs::rename(&old_path, &new_path) {
                    error!(
                        from = %old_path.display(),
                        to = %new_path.display(),
                        error = %e,
                        "failed to rename story directory, continuing with the rest",
                    );
                }
            }
        }
    }

    pub fn permanent_id(&self) -> &str {
        &self.permanent_id
    }

    pub fn folder_name(&self) -> &str {
        &self.folder_name
    }

    pub fn raw_content_dir(&self) -> PathBuf {
        self.workspace_root.join(RAW_CONTENT_DIR).join(&self.folder_name)
    }

    pub fn raw_content_file(&self, filename: &str) -> PathBuf {
        self.raw_content_dir().join(filename)
    }

    pub fn processed_content_dir(&self) -> PathBuf {
        self.workspace_root
            .join(PROCESSED_CONTENT_DIR)
            .join(&self.folder_name)
    }

    pub fn processed_content_file(&self, filename: &str) -> PathBuf {
        self.processed_content_dir().join(filename)
    }

    pub fn archival_status_dir(&self) -> PathBuf {
        self.workspace_root
            .join(ARCHIVAL_STATUS_DIR)
            .join(&self.folder_name)
    }

    pub fn progress_filepath(&self) -> PathBuf {
        self.archival_status_dir().join(PROGRESS_FILENAME)
    }

    pub fn ebooks_dir(&self) -> PathBuf {
        self.workspace_root.join(EBOOKS_DIR).join(&self.folder_name)
    }

    pub fn epub_filepath(&self, epub_filename: &str) -> PathBuf {
        self.ebooks_dir().join(epub_filename)
    }

    pub fn temp_cover_dir(&self) -> PathBuf {
        self.ebooks_dir().join(TEMP_COVER_DIR)
    }

    /// Deletes the raw/processed working directories for this story. Called by the
    /// orchestrator at the end of a run unless `keep_temp_files` was requested.
    pub fn cleanup_temp_dirs(&self) -> std::io::Result<()> {
        for dir in [self.raw_content_dir(), self.processed_content_dir()] {
            if dir.exists() {
                std::fs::remove_dir_all(dir)?;
            }
        }
        Ok(())
    }
}

/// One-shot migration for workspaces that predate the Story Index: walk every
/// `archival_status/<slug>/progress.json`, derive each story's permanent ID via its fetcher,
/// and register the mapping without moving any files.
pub fn migrate_legacy_index(
    workspace_root: &Path,
    index: &mut StoryIndex,
    permanent_id_of: impl Fn(&str) -> Option<String>,
) -> Result<usize, StoreError> {
    let status_dir = workspace_root.join(ARCHIVAL_STATUS_DIR);
    if !status_dir.exists() {
        return Ok(0);
    }

    let mut migrated = 0;
    for entry in ignore::WalkBuilder::new(&status_dir)
        .max_depth(Some(2))
        .build()
        .flatten()
    {
        if entry.file_name() != PROGRESS_FILENAME {
            continue;
        }
        let Some(slug) = entry
            .path()
            .parent()
            .and_then(|p| p.file_name())
            .map(|s| s.to_string_lossy().to_string())
        else {
            continue;
        };

        let raw = match std::fs::read_to_string(entry.path()) {
            Ok(raw) => raw,
            Err(e) => {
                error!(path = %entry.path().display(), error = %e, "could not read legacy progress file");
                continue;
            }
        };
        let Some(story_url) = serde_json::from_str::<serde_json::Value>(&raw)
            .ok()
            .and_then(|v| v.get("story_url").and_then(|u| u.as_str()).map(str::to_string))
        else {
            continue;
        };
        let Some(permanent_id) = permanent_id_of(&story_url) else {
            continue;
        };

        if index.get_folder_name(&permanent_id).is_none() {
            index.add_story(&permanent_id, &slug)?;
            migrated += 1;
        }
    }

    Ok(migrated)
}
