use std::path::{Path, PathBuf};

use configparser::ini::Ini;

use crate::error::ConfigError;

const GENERAL_SECTION: &str = "General";
const WORKSPACE_PATH_KEY: &str = "workspace_path";
const SENTENCE_REMOVAL_SECTION: &str = "SentenceRemoval";
const SENTENCE_REMOVAL_FILE_KEY: &str = "default_sentence_removal_file";

const DEFAULT_WORKSPACE_DIR: &str = "workspace";
const WNA_WORKSPACE_ROOT_ENV: &str = "WNA_WORKSPACE_ROOT";

/// Layered configuration: `config/settings.ini`, overridden by `WNA_WORKSPACE_ROOT`,
/// overridden in turn by whatever the CLI was given explicitly.
///
/// Missing sections/options are backfilled with defaults and the file is rewritten, mirroring
/// the auto-healing behavior of the original `ConfigManager`.
#[derive(Debug, Clone)]
pub struct Config {
    pub workspace_path: PathBuf,
    pub default_sentence_removal_file: Option<PathBuf>,
}

impl Config {
    /// `project_root` is the directory relative paths in the ini file resolve against.
    pub fn load(config_path: &Path, project_root: &Path) -> Result<Self, ConfigError> {
        let default_workspace = project_root.join(DEFAULT_WORKSPACE_DIR);
        let default_sentence_removal = default_workspace
            .join("config")
            .join("default_sentence_removal.json");

        let mut ini = Ini::new();
        let mut dirty = false;

        if config_path.exists() {
            ini.load(config_path).map_err(|e| ConfigError::Read {
                path: config_path.display().to_string(),
                source: std::io::Error::other(e),
            })?;
        } else {
            dirty = true;
        }

        if ini.get(GENERAL_SECTION, WORKSPACE_PATH_KEY).is_none() {
            ini.set(
                GENERAL_SECTION,
                WORKSPACE_PATH_KEY,
                Some(default_workspace.display().to_string()),
            );
            dirty = true;
        }
        if ini
            .get(SENTENCE_REMOVAL_SECTION, SENTENCE_REMOVAL_FILE_KEY)
            .is_none()
        {
            ini.set(
                SENTENCE_REMOVAL_SECTION,
                SENTENCE_REMOVAL_FILE_KEY,
                Some(default_sentence_removal.display().to_string()),
            );
            dirty = true;
        }

        if dirty {
            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                    path: config_path.display().to_string(),
                    source: e,
                })?;
            }
            ini.write(config_path).map_err(|e| ConfigError::Write {
                path: config_path.display().to_string(),
                source: e,
            })?;
        }

        let workspace_path = ini
            .get(GENERAL_SECTION, WORKSPACE_PATH_KEY)
            .map(PathBuf::from)
            .filter(|p| p.is_absolute())
            .unwrap_or(default_workspace);

        let default_sentence_removal_file = ini
            .get(SENTENCE_REMOVAL_SECTION, SENTENCE_REMOVAL_FILE_KEY)
            .map(PathBuf::from)
            .filter(|p| !p.as_os_str().is_empty());

        let workspace_path = std::env::var(WNA_WORKSPACE_ROOT_ENV)
            .ok()
            .map(PathBuf::from)
            .unwrap_or(workspace_path);

        Ok(Self {
            workspace_path,
            default_sentence_removal_file,
        })
    }
}
