//! Advisory build lock.
//!
//! One lock file per work directory. Holding a [`BuildLockGuard`] is the
//! only way to start a build; dropping it releases the lock.

use crate::error::BuildError;
use crate::{logi, logw};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

pub const LOCK_FILE_NAME: &str = ".build.lock";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    acquired_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct BuildLockGuard {
    path: PathBuf,
}

impl BuildLockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for BuildLockGuard {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => logi(format!("Released build lock {}", self.path.display())),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => logw(format!("Could not release {}: {}", self.path.display(), err)),
        }
    }
}

/// Take the lock in `work_dir`, reclaiming it if the holder left it behind
/// for longer than `stale_after`.
pub fn acquire(work_dir: &Path, stale_after: Duration) -> Result<BuildLockGuard, BuildError> {
    fs::create_dir_all(work_dir)?;
    let path = work_dir.join(LOCK_FILE_NAME);

    for _ in 0..2 {
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                let info = LockInfo {
                    pid: std::process::id(),
                    acquired_at: Utc::now(),
                };
                file.write_all(serde_json::to_string(&info)?.as_bytes())?;
                logi(format!("Acquired build lock {}", path.display()));
                return Ok(BuildLockGuard { path });
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                if !is_stale(&path, stale_after) {
                    return Err(BuildError::Locked(path));
                }
                logw(format!("Reclaiming stale build lock {}", path.display()));
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(err) if err.kind() == ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
            }
            Err(err) => return Err(err.into()),
        }
    }
    Err(BuildError::Locked(path))
}

fn is_stale(path: &Path, stale_after: Duration) -> bool {
    let from_contents = fs::read_to_string(path)
        .ok()
        .and_then(|text| serde_json::from_str::<LockInfo>(&text).ok())
        .map(|info| {
            let age = Utc::now().signed_duration_since(info.acquired_at);
            age.to_std().map(|age| age > stale_after).unwrap_or(false)
        });
    if let Some(stale) = from_contents {
        return stale;
    }
    // Unreadable or half-written lock: fall back to the file's mtime.
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .map(|age| age > stale_after)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn second_acquire_is_refused_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let guard = acquire(dir.path(), HOUR).unwrap();
        assert!(guard.path().exists());

        let err = acquire(dir.path(), HOUR).unwrap_err();
        assert_eq!(err.code(), "BUILD_LOCKED");

        drop(guard);
        assert!(!dir.path().join(LOCK_FILE_NAME).exists());
        assert!(acquire(dir.path(), HOUR).is_ok());
    }

    #[test]
    fn stale_lock_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let old = LockInfo {
            pid: 1,
            acquired_at: Utc::now() - chrono::Duration::hours(7),
        };
        fs::write(
            dir.path().join(LOCK_FILE_NAME),
            serde_json::to_string(&old).unwrap(),
        )
        .unwrap();

        let guard = acquire(dir.path(), Duration::from_secs(6 * 3600)).unwrap();
        let text = fs::read_to_string(guard.path()).unwrap();
        let info: LockInfo = serde_json::from_str(&text).unwrap();
        assert_eq!(info.pid, std::process::id());
    }
}
