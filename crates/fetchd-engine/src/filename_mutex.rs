use std::collections::HashSet;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::debug;

/// Registry of destination paths currently owned by a transfer.
///
/// One instance is shared by every transfer in the process and handed out
/// explicitly; reservations live in memory only.
#[derive(Debug, Default)]
pub struct FileNameMutex {
    locked: Mutex<HashSet<PathBuf>>,
}

impl FileNameMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves `desired` or, when it is taken (locked or already on disk),
    /// the first free `name (n).ext` sibling. Returns the reserved path.
    pub fn lock_file_name(&self, desired: &Path) -> PathBuf {
        let mut locked = self.locked.lock();
        let mut candidate = desired.to_path_buf();
        let mut n = 1u32;
        while locked.contains(&candidate) || candidate.exists() {
            candidate = numbered(desired, n);
            n += 1;
        }
        debug!("Locked file name {}", candidate.display());
        locked.insert(candidate.clone());
        candidate
    }

    /// Releases a reservation. Unknown paths are ignored.
    pub fn unlock_file_name(&self, path: &Path) {
        if self.locked.lock().remove(path) {
            debug!("Unlocked file name {}", path.display());
        }
    }

    pub fn is_locked(&self, path: &Path) -> bool {
        self.locked.lock().contains(path)
    }
}

fn numbered(path: &Path, n: u32) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem} ({n}).{}", ext.to_string_lossy()),
        None => format!("{stem} ({n})"),
    };
    path.with_file_name(name)
}
