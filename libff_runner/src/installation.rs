use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use super::constants::*;
use super::error::ConfigError;

/// Where the MIDAS toolchain lives. Paths may start with `~`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstallPaths {
    pub bin_dir: PathBuf,
    pub utils_dir: PathBuf,
    pub python: PathBuf,
    pub library_root: PathBuf,
}

impl Default for InstallPaths {
    fn default() -> Self {
        Self {
            bin_dir: PathBuf::from(DEFAULT_BIN_DIR),
            utils_dir: PathBuf::from(DEFAULT_UTILS_DIR),
            python: PathBuf::from(DEFAULT_PYTHON),
            library_root: PathBuf::from(DEFAULT_LIBRARY_ROOT),
        }
    }
}

/// The resolved toolchain: absolute paths plus the environment every child process gets.
///
/// Built once at start-up and shared by reference. The runner never touches its own
/// process environment; the library search path is handed to each child explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Installation {
    bin_dir: PathBuf,
    utils_dir: PathBuf,
    python: PathBuf,
    library_path: OsString,
    script_dir: PathBuf,
}

impl Installation {
    /// Resolve the install paths. `script_dir` is the top-level log directory handed to
    /// the helper scripts.
    pub fn resolve(paths: &InstallPaths, script_dir: &Path) -> Result<Self, ConfigError> {
        let library_root = expand_home(&paths.library_root);
        let library_path = std::env::join_paths(
            LIBRARY_SUBDIRS
                .iter()
                .map(|subdir| library_root.join(subdir)),
        )
        .map_err(|source| ConfigError::BadLibraryRoot {
            path: library_root.clone(),
            source,
        })?;
        Ok(Self {
            bin_dir: expand_home(&paths.bin_dir),
            utils_dir: expand_home(&paths.utils_dir),
            python: expand_home(&paths.python),
            library_path,
            script_dir: script_dir.to_path_buf(),
        })
    }

    pub fn binary(&self, name: &str) -> PathBuf {
        self.bin_dir.join(name)
    }

    pub fn script(&self, name: &str) -> PathBuf {
        self.utils_dir.join(name)
    }

    pub fn python(&self) -> &Path {
        &self.python
    }

    pub fn library_path(&self) -> &OsString {
        &self.library_path
    }

    /// Environment variables set on every child process
    pub fn environment(&self) -> Vec<(OsString, OsString)> {
        vec![
            (OsString::from(LIBRARY_PATH_VAR), self.library_path.clone()),
            (
                OsString::from(SCRIPT_DIR_VAR),
                self.script_dir.clone().into_os_string(),
            ),
        ]
    }
}

/// Expand a leading `~` to the user's home directory
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}
