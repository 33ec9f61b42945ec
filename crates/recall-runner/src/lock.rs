use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::Result;

/// Zero-byte marker that a session ran to completion. Only its presence
/// is meaningful.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLock {
    path: PathBuf,
}

impl SessionLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_locked(&self) -> bool {
        self.path.exists()
    }

    /// Creating an existing lock leaves it as it is.
    pub fn create(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        info!(path = %self.path.display(), "session locked");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::fs;

    #[test]
    fn create_is_idempotent_and_empty() {
        let dir = std::env::temp_dir().join(format!(
            "recall_lock_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let lock = SessionLock::new(dir.join("session_lock.txt"));
        assert!(!lock.is_locked());
        lock.create().expect("create");
        lock.create().expect("create again");
        assert!(lock.is_locked());
        assert_eq!(fs::metadata(lock.path()).expect("metadata").len(), 0);
        let _ = fs::remove_dir_all(dir);
    }
}
