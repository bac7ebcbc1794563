/// Advisory lock on a backup root
///
/// Held for the duration of a backup or restore so two operators cannot run
/// against the same backup root. The lock file records the owning pid and
/// is removed when the guard drops.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::core::error::{Result, StackError};
use crate::utils::constants::LOCK_FILE;

#[derive(Debug)]
pub struct BackupLock {
    path: PathBuf,
}

impl BackupLock {
    pub fn acquire(backup_root: &Path) -> Result<Self> {
        fs::create_dir_all(backup_root)
            .map_err(|e| StackError::io(format!("Failed to create {}", backup_root.display()), e))?;

        let path = backup_root.join(LOCK_FILE);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                let _ = writeln!(file, "{}", std::process::id());
                debug!(lock = %path.display(), "lock acquired");
                Ok(Self { path })
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(StackError::Locked { path }),
            Err(e) => Err(StackError::io(format!("Failed to create {}", path.display()), e)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for BackupLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(lock = %self.path.display(), error = %e, "failed to release lock");
        }
    }
}
