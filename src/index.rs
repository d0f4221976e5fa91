use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::StoreError;

/// Workspace-wide map from a story's permanent, source-derived ID to its current folder slug.
///
/// Persisted as `index.json` at the workspace root, sorted by key (a `BTreeMap` serializes that
/// way for free, matching the original's `json.dump(..., sort_keys=True)`).
#[derive(Default, Debug, Serialize, Deserialize)]
pub struct StoryIndex {
    #[serde(flatten)]
    entries: BTreeMap<String, String>,
    #[serde(skip)]
    path: PathBuf,
}

impl StoryIndex {
    pub fn load(workspace_root: &Path) -> Result<Self, StoreError> {
        let path = workspace_root.join("index.json");
        if !path.exists() {
            return Ok(Self {
                entries: BTreeMap::new(),
                path,
            });
        }

        let raw = std::fs::read_to_string(&path).map_err(|source| StoreError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let entries = serde_json::from_str(&raw).map_err(|source| StoreError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self { entries, path })
    }

    pub fn get_folder_name(&self, permanent_id: &str) -> Option<&str> {
        self.entries.get(permanent_id).map(String::as_str)
    }

    /// Registers a brand-new story. Warns (rather than failing) if it is already present,
    /// matching the original `IndexManager.add_story` no-op-with-warning behavior.
    pub fn add_story(&mut self, permanent_id: &str, folder_name: &str) -> Result<(), StoreError> {
        if self.entries.contains_key(permanent_id) {
            warn!(permanent_id, "story already present in index, not overwriting");
            return Ok(());
        }
        self.entries
            .insert(permanent_id.to_string(), folder_name.to_string());
        self.save()
    }

    /// Updates the folder name for an existing story. Warns and no-ops if it isn't present yet.
    pub fn update_folder_name(
        &mut self,
        permanent_id: &str,
        new_folder_name: &str,
    ) -> Result<(), StoreError> {
        let Some(existing) = self.entries.get(permanent_id) else {
            warn!(permanent_id, "cannot update folder name, story not in index");
            return Ok(());
        };
        if existing == new_folder_name {
            return Ok(());
        }
        self.entries
            .insert(permanent_id.to_string(), new_folder_name.to_string());
        self.save()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn save(&self) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Write {
                path: self.path.display().to_string(),
                source,
            })?;
        }
        let json = serde_json::to_string_pretty(&self.entries).unwrap_or_default();

        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json).map_err(|source| StoreError::Write {
            path: tmp_path.display().to_string(),
            source,
        })?;
        std::fs::rename(&tmp_path, &self.path).map_err(|source| StoreError::Write {
            path: self.path.display().to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_lookup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut index = StoryIndex::load(dir.path()).expect("load");
        index.add_story("royalroad-1", "the-story").expect("add");

        let reloaded = StoryIndex::load(dir.path()).expect("reload");
        assert_eq!(reloaded.get_folder_name("royalroad-1"), Some("the-story"));
    }

    #[test]
    fn duplicate_add_does_not_overwrite() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut index = StoryIndex::load(dir.path()).expect("load");
        index.add_story("royalroad-1", "the-story").expect("add");
        index.add_story("royalroad-1", "a-different-slug").expect("add");

        assert_eq!(index.get_folder_name("royalroad-1"), Some("the-story"));
    }

    #[test]
    fn update_rewrites_existing_entry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut index = StoryIndex::load(dir.path()).expect("load");
        index.add_story("royalroad-1", "old-slug").expect("add");
        index
            .update_folder_name("royalroad-1", "new-slug")
            .expect("update");

        assert_eq!(index.get_folder_name("royalroad-1"), Some("new-slug"));
    }
}
