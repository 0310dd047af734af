//! Scratch source files for local executions.
//!
//! Each local run gets its own `temp_<nanos>.<ext>` file. Names come from a
//! nanosecond timestamp; the file is created with `create_new` and the
//! timestamp is bumped on collision, so two runs in one process never share a
//! path. The names are predictable, which is fine for a per-user temp dir but
//! not for a shared, hostile one.

use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

/// Attempts before allocation gives up on collisions.
const MAX_ATTEMPTS: u32 = 64;

/// Directory scratch files are allocated in.
#[derive(Debug, Clone)]
pub struct ScratchDir {
    root: PathBuf,
}

impl ScratchDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Create a fresh, empty scratch file with the given extension.
    pub fn allocate(&self, extension: &str) -> std::io::Result<ScratchFile> {
        let mut stamp = now_nanos();

        for _ in 0..MAX_ATTEMPTS {
            let path = self.root.join(format!("temp_{stamp}.{extension}"));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => {
                    debug!(path = %path.display(), "Allocated scratch file");
                    return Ok(ScratchFile {
                        path,
                        extension: extension.to_string(),
                        armed: true,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => stamp += 1,
                Err(e) => return Err(e),
            }
        }

        Err(std::io::Error::new(
            ErrorKind::AlreadyExists,
            format!("no free scratch name in {}", self.root.display()),
        ))
    }
}

/// A scratch file owned by exactly one execution.
///
/// Released explicitly with [`ScratchFile::release`]; dropping an unreleased
/// file removes it as well.
#[derive(Debug)]
pub struct ScratchFile {
    path: PathBuf,
    extension: String,
    armed: bool,
}

impl ScratchFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Delete the file. Failures are logged and otherwise ignored.
    pub fn release(mut self) {
        self.armed = false;
        remove(&self.path);
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if self.armed {
            remove(&self.path);
        }
    }
}

fn remove(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "Removed scratch file"),
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove scratch file"),
    }
}

fn now_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default()
}
