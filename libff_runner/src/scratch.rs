use std::path::{Path, PathBuf};

use super::constants::{DEFAULT_SCRATCH_DIR, SCRATCH_EXTENSION};
use super::error::ScratchError;

/// The process-wide shared-memory scratch area: every `*.bin` file in one directory.
///
/// Binning fills it, indexing and refinement read it. It is not namespaced per layer, so
/// only one layer may use it at a time; the driver's sequential layer loop guarantees that.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedScratch {
    dir: PathBuf,
}

impl Default for SharedScratch {
    fn default() -> Self {
        Self::new(Path::new(DEFAULT_SCRATCH_DIR))
    }
}

impl SharedScratch {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Scratch files currently present
    pub fn files(&self) -> Result<Vec<PathBuf>, ScratchError> {
        let entries = match self.dir.read_dir() {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(source) => {
                return Err(ScratchError::IOError {
                    path: self.dir.clone(),
                    source,
                })
            }
        };
        let mut files = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|source| ScratchError::IOError {
                    path: self.dir.clone(),
                    source,
                })?
                .path();
            if path.extension().is_some_and(|ext| ext == SCRATCH_EXTENSION) {
                files.push(path);
            }
        }
        Ok(files)
    }

    /// Remove every scratch file. Returns how many were removed; an already empty (or
    /// missing) scratch area is not an error.
    pub fn clear(&self) -> Result<usize, ScratchError> {
        let mut removed = 0;
        for path in self.files()? {
            let result = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            match result {
                Ok(()) => removed += 1,
                // Someone else (the interrupt handler) got there first
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
                Err(source) => return Err(ScratchError::IOError { path, source }),
            }
        }
        Ok(removed)
    }

    /// Hold the scratch area until the guard is dropped, clearing it on every exit path
    pub fn guard(&self) -> ScratchGuard<'_> {
        ScratchGuard {
            scratch: self,
            released: false,
        }
    }
}

/// Clears the scratch area when dropped unless it was already released explicitly.
#[derive(Debug)]
pub struct ScratchGuard<'a> {
    scratch: &'a SharedScratch,
    released: bool,
}

impl ScratchGuard<'_> {
    /// Clear now and report errors, rather than leaving it to `Drop`
    pub fn release(mut self) -> Result<usize, ScratchError> {
        self.released = true;
        self.scratch.clear()
    }
}

impl Drop for ScratchGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match self.scratch.clear() {
            Ok(n) => log::info!("Cleared {n} scratch file(s) from {:?}", self.scratch.dir()),
            Err(e) => log::error!("Could not clear scratch: {e}"),
        }
    }
}
