//! Engine configuration.

use std::path::{Path, PathBuf};

use mountkit_common::{MountError, MountPaths, MountResult};
use serde::{Deserialize, Serialize};

/// Engine configuration options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Table, tag and helper locations.
    pub paths: MountPaths,
    /// Block signals while the utab lock is held.
    pub block_signals: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            paths: MountPaths::new(),
            block_signals: true,
        }
    }
}

impl EngineConfig {
    /// Load a TOML configuration file.
    pub fn load(path: &Path) -> MountResult<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| MountError::Config {
            message: format!("{}: {e}", path.display()),
        })
    }

    /// Load the configuration file if it exists, else use defaults.
    pub fn load_or_default(path: &Path) -> MountResult<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Relocate every path under `root`.
    #[must_use]
    pub fn with_root(mut self, root: impl AsRef<Path>) -> Self {
        self.paths = MountPaths::with_root(root);
        self
    }

    /// Set the paths.
    #[must_use]
    pub fn with_paths(mut self, paths: MountPaths) -> Self {
        self.paths = paths;
        self
    }

    /// Set the userspace mount table.
    #[must_use]
    pub fn with_utab(mut self, utab: impl Into<PathBuf>) -> Self {
        self.paths.utab = utab.into();
        self
    }

    /// Set the helper search path.
    #[must_use]
    pub fn with_helper_search_path(mut self, search_path: impl Into<String>) -> Self {
        self.paths.helper_search_path = search_path.into();
        self
    }

    /// Enable or disable signal blocking while locked.
    #[must_use]
    pub const fn with_block_signals(mut self, enable: bool) -> Self {
        self.block_signals = enable;
        self
    }

    /// Whether the utab can be written: the file is writable, or its
    /// directory exists and is writable, or the directory can be created.
    #[must_use]
    pub fn utab_writable(&self) -> bool {
        let utab = &self.paths.utab;
        if utab.exists() {
            return is_writable(utab);
        }
        let Some(dir) = utab.parent() else {
            return false;
        };
        if dir.is_dir() {
            return is_writable(dir);
        }
        match std::fs::create_dir_all(dir) {
            Ok(()) => {
                tracing::debug!(dir = %dir.display(), "Created utab directory");
                true
            }
            Err(err) => {
                tracing::debug!(dir = %dir.display(), %err, "Cannot create utab directory");
                false
            }
        }
    }
}

fn is_writable(path: &Path) -> bool {
    rustix::fs::access(path, rustix::fs::Access::WRITE_OK).is_ok()
}
