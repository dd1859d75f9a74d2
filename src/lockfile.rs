//! Process lock file
//!
//! Two uplinks on one node would deliver every packet twice and fight over
//! the control socket, so only one instance may run per staging directory.

use anyhow::{bail, Context, Result};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Lock file holding the owner's PID. Removed on drop.
#[derive(Debug)]
pub struct ProcessLock {
    lock_path: PathBuf,
    owned: bool,
}

impl ProcessLock {
    const LOCK_FILE_NAME: &'static str = ".uplink.lock";

    /// Acquire the lock in `dir`, clearing a stale one left by a dead process.
    pub fn acquire<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).with_context(|| format!("Failed to create lock directory: {:?}", dir))?;

        let lock_path = dir.join(Self::LOCK_FILE_NAME);

        if lock_path.exists() {
            match Self::holder(&lock_path) {
                Ok(Some(pid)) => {
                    bail!(
                        "Another uplink instance is already running (PID: {})\n\
                         If it is not, remove the stale lock file: rm {:?}",
                        pid,
                        lock_path
                    );
                }
                Ok(None) => {
                    tracing::info!("Removing stale lock file from previous instance");
                    fs::remove_file(&lock_path).context("Failed to remove stale lock file")?;
                }
                Err(e) => {
                    tracing::warn!("Unreadable lock file, replacing it: {}", e);
                    let _ = fs::remove_file(&lock_path);
                }
            }
        }

        let pid = std::process::id();
        let mut file =
            File::create(&lock_path).with_context(|| format!("Failed to create lock file: {:?}", lock_path))?;
        writeln!(file, "{}", pid).context("Failed to write PID to lock file")?;

        tracing::debug!(pid, path = %lock_path.display(), "Acquired process lock");
        Ok(Self {
            lock_path,
            owned: true,
        })
    }

    /// PID of a live holder, `None` if the lock is stale.
    fn holder(lock_path: &Path) -> Result<Option<u32>> {
        let contents = fs::read_to_string(lock_path).context("Failed to read lock file")?;
        let pid: u32 = contents.trim().parse().context("Failed to parse PID from lock file")?;
        Ok(Self::is_uplink_process(pid).then_some(pid))
    }

    #[cfg(unix)]
    fn is_uplink_process(pid: u32) -> bool {
        fs::read_to_string(format!("/proc/{}/cmdline", pid))
            .map(|cmdline| cmdline.contains("fieldnode-uplink"))
            .unwrap_or(false)
    }

    #[cfg(not(unix))]
    fn is_uplink_process(_pid: u32) -> bool {
        true
    }

    pub fn path(&self) -> &Path {
        &self.lock_path
    }

    pub fn release(&mut self) {
        if self.owned {
            if let Err(e) = fs::remove_file(&self.lock_path) {
                tracing::warn!("Failed to remove lock file: {}", e);
            }
            self.owned = false;
        }
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_lock_written_and_released() {
        let dir = tempdir().unwrap();
        let lock_path;
        {
            let lock = ProcessLock::acquire(dir.path()).unwrap();
            lock_path = lock.path().to_path_buf();
            let pid: u32 = fs::read_to_string(&lock_path).unwrap().trim().parse().unwrap();
            assert_eq!(pid, std::process::id());
        }
        assert!(!lock_path.exists());
    }

    #[test]
    fn test_stale_lock_replaced() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(ProcessLock::LOCK_FILE_NAME), "999999999\n").unwrap();
        let lock = ProcessLock::acquire(dir.path()).unwrap();
        assert!(lock.path().exists());
    }

    #[test]
    fn test_garbage_lock_replaced() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(ProcessLock::LOCK_FILE_NAME), "not a pid").unwrap();
        assert!(ProcessLock::acquire(dir.path()).is_ok());
    }
}
