use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use crate::{StoreError, StoreResult};

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(15);
const LOCK_STALE_AFTER: Duration = Duration::from_secs(30);

/// Exclusive per-record lock backed by a `create_new` sidecar file.
///
/// Held only across one read-modify-replace, so a lock older than
/// `LOCK_STALE_AFTER` belongs to a process that died mid-update and is broken.
#[derive(Debug)]
pub(crate) struct RecordLock {
    path: PathBuf,
}

impl RecordLock {
    /// Waits for the lock on the calling thread.
    ///
    /// Async callers accept this: a live holder keeps the lock for one file
    /// replace, a dead holder's lock is broken once stale, and `timeout`
    /// bounds everything else.
    pub(crate) fn acquire(path: PathBuf, timeout: Duration) -> StoreResult<Self> {
        let deadline = Instant::now() + timeout;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let _ = writeln!(file, "{}", std::process::id());
                    return Ok(Self { path });
                }
                Err(error) if error.kind() == ErrorKind::AlreadyExists => {
                    if lock_is_stale(&path) {
                        tracing::warn!(lock = %path.display(), "breaking stale record lock");
                        let _ = std::fs::remove_file(&path);
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Err(StoreError::LockTimeout(path));
                    }
                    std::thread::sleep(LOCK_POLL_INTERVAL);
                }
                Err(error) => return Err(StoreError::Io(error)),
            }
        }
    }
}

impl Drop for RecordLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn lock_is_stale(path: &Path) -> bool {
    std::fs::metadata(path)
        .and_then(|metadata| metadata.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > LOCK_STALE_AFTER)
}
