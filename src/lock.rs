use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::error::{Result, WreckitError};
use crate::log_warn;

/// Polling interval while waiting for a contended lock.
const ACQUIRE_POLL_INTERVAL_MS: u64 = 50;

/// A lock guard that releases the lock file and removes its pid stamp on drop.
#[must_use = "lock is released when LockGuard is dropped"]
pub struct LockGuard {
    lock: fslock::LockFile,
    pid_path: PathBuf,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("pid_path", &self.pid_path)
            .finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.lock.unlock() {
            log_warn!("Warning: Failed to release lock: {}", e);
        }
        if let Err(e) = fs::remove_file(&self.pid_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log_warn!(
                    "Warning: Failed to remove pid stamp {}: {}",
                    self.pid_path.display(),
                    e
                );
            }
        }
    }
}

/// Pid stamp path for a lock file (`<lock>.pid`).
pub fn pid_path_for(lock_path: &Path) -> PathBuf {
    let mut name = lock_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    name.push_str(".pid");
    lock_path.with_file_name(name)
}

/// Acquire an advisory file lock, blocking up to `timeout`.
///
/// Acquires the OS-level lock first (atomic mutual exclusion), then writes a
/// pid stamp next to it so the doctor can identify stale holders after a
/// crash. Contention is polled; exceeding the timeout fails with
/// `ResourceBusy`.
pub fn acquire(lock_path: &Path, timeout: Duration) -> Result<LockGuard> {
    if let Some(parent) = lock_path.parent() {
        fs::create_dir_all(parent).map_err(|e| WreckitError::io(parent, e))?;
    }

    let mut lock =
        fslock::LockFile::open(lock_path).map_err(|e| WreckitError::io(lock_path, e))?;

    let deadline = Instant::now() + timeout;
    loop {
        let acquired = lock.try_lock().map_err(|e| WreckitError::io(lock_path, e))?;
        if acquired {
            break;
        }
        if Instant::now() >= deadline {
            return Err(WreckitError::ResourceBusy {
                path: lock_path.to_path_buf(),
                timeout,
            });
        }
        std::thread::sleep(Duration::from_millis(ACQUIRE_POLL_INTERVAL_MS));
    }

    // We hold the lock, so the pid stamp is safe to write
    let pid_path = pid_path_for(lock_path);
    fs::write(&pid_path, std::process::id().to_string())
        .map_err(|e| WreckitError::io(&pid_path, e))?;

    Ok(LockGuard { lock, pid_path })
}

/// Check whether a process with the given pid is alive.
pub fn is_pid_alive(pid: i32) -> bool {
    // signal 0 checks if the process exists without sending a signal
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

/// Read the pid stamp next to a lock file, if present and parseable.
pub fn read_pid_stamp(lock_path: &Path) -> Option<i32> {
    fs::read_to_string(pid_path_for(lock_path))
        .ok()
        .and_then(|s| s.trim().parse::<i32>().ok())
}

/// True when a lock file has a pid stamp whose owner is no longer alive.
///
/// Used by the doctor to find locks orphaned by a crash. A lock with no
/// stamp at all is not considered stale (it may be mid-acquisition).
pub fn is_stale(lock_path: &Path) -> bool {
    match read_pid_stamp(lock_path) {
        Some(pid) => !is_pid_alive(pid),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join(".lock");

        let guard = acquire(&lock_path, Duration::from_secs(1)).unwrap();
        assert_eq!(read_pid_stamp(&lock_path), Some(std::process::id() as i32));
        drop(guard);
        assert_eq!(read_pid_stamp(&lock_path), None);
    }

    #[test]
    fn contention_times_out_with_resource_busy() {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join(".lock");

        let _held = acquire(&lock_path, Duration::from_secs(1)).unwrap();
        let err = acquire(&lock_path, Duration::from_millis(150)).unwrap_err();
        assert!(matches!(err, WreckitError::ResourceBusy { .. }));
    }

    #[test]
    fn stale_detection() {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join(".lock");

        // No stamp: not stale
        assert!(!is_stale(&lock_path));

        // Dead pid: stale
        fs::write(pid_path_for(&lock_path), "99999999").unwrap();
        assert!(is_stale(&lock_path));

        // Live pid: not stale
        fs::write(pid_path_for(&lock_path), std::process::id().to_string()).unwrap();
        assert!(!is_stale(&lock_path));
    }

    #[test]
    fn pid_alive_checks() {
        assert!(is_pid_alive(std::process::id() as i32));
        assert!(!is_pid_alive(99_999_999));
    }
}
