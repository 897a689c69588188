//! Single-instance lock for the daemon.
//!
//! The lock is a PID file. A file whose pid no longer answers a zero signal
//! is stale and gets taken over. An empty or unreadable file is left alone
//! while it is fresh, since its creator may not have written the pid yet.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, warn};

/// How long a freshly created pid file may stay without a readable pid.
const PID_WRITE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub struct PidLock {
    path: PathBuf,
    pid: u32,
}

impl PidLock {
    /// Take the lock for the current process. `Ok(None)` when another live
    /// process holds it.
    pub fn acquire(path: &Path) -> io::Result<Option<PidLock>> {
        Self::acquire_as(path, std::process::id())
    }

    fn acquire_as(path: &Path, pid: u32) -> io::Result<Option<PidLock>> {
        Self::acquire_with_grace(path, pid, PID_WRITE_GRACE)
    }

    fn acquire_with_grace(
        path: &Path,
        pid: u32,
        grace: Duration,
    ) -> io::Result<Option<PidLock>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    writeln!(file, "{pid}")?;
                    file.sync_all()?;
                    return Ok(Some(PidLock {
                        path: path.to_path_buf(),
                        pid,
                    }));
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    match read_pid(path) {
                        Some(holder) if holder != pid && process_alive(holder) => {
                            return Ok(None);
                        }
                        None if written_within(path, grace)? => {
                            return Ok(None);
                        }
                        holder => {
                            info!(
                                component = "pid_lock",
                                event = "pid_lock.stale_taken_over",
                                path = %path.display(),
                                stale_pid = holder.unwrap_or(0),
                            );
                            match std::fs::remove_file(path) {
                                Ok(()) => {}
                                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                                Err(e) => return Err(e),
                            }
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }

        // Lost a race with another starter twice in a row.
        Ok(None)
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        if read_pid(&self.path) == Some(self.pid) {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!(
                    component = "pid_lock",
                    event = "pid_lock.release_failed",
                    path = %self.path.display(),
                    error = %e,
                );
            }
        }
    }
}

/// Whether `path` was modified less than `grace` ago. A file that vanished
/// counts as old so the caller retries the create.
fn written_within(path: &Path, grace: Duration) -> io::Result<bool> {
    let modified = match std::fs::metadata(path).and_then(|m| m.modified()) {
        Ok(modified) => modified,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) if e.kind() == io::ErrorKind::Unsupported => return Ok(false),
        Err(e) => return Err(e),
    };
    // A timestamp in the future reads as fresh.
    Ok(modified.elapsed().map_or(true, |age| age < grace))
}

pub fn read_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .filter(|pid| *pid > 0)
}

pub fn process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        let Ok(pid) = i32::try_from(pid) else {
            return false;
        };
        if pid <= 0 {
            return false;
        }
        // kill -0 checks if process exists without sending a signal
        let rc = unsafe { libc::kill(pid, 0) };
        rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}
