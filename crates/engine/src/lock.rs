//! The exclusive process lock.
//!
//! A pid file created with `O_EXCL` guards the engine's mutable state; a
//! second engine instance fails to start rather than corrupting the
//! history store or metadata cache. A lock left behind by a dead process
//! is taken over.

use std::io::Write as _;
use std::path::{Path, PathBuf};

use ignition_errors::{ErrorKind, Result, UpdateError};
use tracing::{debug, warn};

/// Held for the lifetime of the engine; releases the lock on drop.
#[derive(Debug)]
pub struct ProcessLock {
    path: PathBuf,
}

impl ProcessLock {
    /// Acquire the lock at `path`.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
            {
                Ok(mut file) => {
                    write!(file, "{}", std::process::id())?;
                    debug!(path = %path.display(), "acquired process lock");
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let holder = std::fs::read_to_string(path)
                        .ok()
                        .and_then(|pid| pid.trim().parse::<u32>().ok());
                    match holder {
                        Some(pid) if process_alive(pid) => {
                            return Err(UpdateError::new(
                                ErrorKind::AnotherInstanceRunning,
                                format!("engine already running as pid {pid}"),
                            ));
                        }
                        _ => {
                            warn!(path = %path.display(), "removing stale process lock");
                            std::fs::remove_file(path)?;
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn process_alive(pid: u32) -> bool {
    if pid == std::process::id() {
        return true;
    }
    Path::new(&format!("/proc/{pid}")).exists()
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to release process lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_reacquire() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("engine.lock");

        let lock = ProcessLock::acquire(&path)?;
        drop(lock);
        let _lock = ProcessLock::acquire(&path)?;
        Ok(())
    }

    #[test]
    fn test_second_instance_refused() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("engine.lock");

        let _lock = ProcessLock::acquire(&path)?;
        let err = ProcessLock::acquire(&path);
        assert!(err.is_err_and(|e| e.kind() == ErrorKind::AnotherInstanceRunning));
        Ok(())
    }

    #[test]
    fn test_stale_lock_taken_over() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("engine.lock");

        // no such pid on any sane system
        std::fs::write(&path, "4294967294")?;
        let _lock = ProcessLock::acquire(&path)?;
        Ok(())
    }
}
