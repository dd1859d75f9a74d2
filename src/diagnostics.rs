//! Append-only diagnostic log
//!
//! Field units are unattended; this file is how an operator reconstructs what
//! the uplink did while nobody was watching. The producer and the dispatcher
//! both write to it, so access is serialized by a lock. Acquisition is
//! bounded: if the lock cannot be taken within the timeout the line goes to
//! the console only, and the caller moves on.

use chrono::Local;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Shared append-only diagnostic log.
pub struct DiagnosticLog {
    path: Option<PathBuf>,
    file: Mutex<Option<File>>,
    lock_timeout: Duration,
}

impl DiagnosticLog {
    /// Open (or create) the log at `path`, creating parent directories.
    pub async fn open<P: AsRef<Path>>(path: P, lock_timeout: Duration) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path).await?;
        debug!(path = %path.display(), "Diagnostic log opened");
        Ok(Self {
            path: Some(path),
            file: Mutex::new(Some(file)),
            lock_timeout,
        })
    }

    /// Log that only reaches the console. Used for dry runs and tests.
    pub fn console_only(lock_timeout: Duration) -> Self {
        Self {
            path: None,
            file: Mutex::new(None),
            lock_timeout,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append one timestamped line.
    ///
    /// Never fails and never waits longer than the lock timeout.
    pub async fn log(&self, message: &str) {
        let line = format!("{} {}\n", Local::now().format("%Y-%m-%d %H:%M:%S"), message);

        let mut guard = match tokio::time::timeout(self.lock_timeout, self.file.lock()).await {
            Ok(guard) => guard,
            Err(_) => {
                warn!(
                    timeout_secs = self.lock_timeout.as_secs(),
                    "Diagnostic log busy, console only: {}", message
                );
                return;
            }
        };

        let Some(file) = guard.as_mut() else {
            tracing::info!("{}", message);
            return;
        };

        let result = async {
            file.write_all(line.as_bytes()).await?;
            file.flush().await
        }
        .await;

        if let Err(e) = result {
            warn!(error = %e, "Diagnostic log write failed, console only: {}", message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lines_are_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/uplink.log");

        let log = DiagnosticLog::open(&path, Duration::from_secs(1)).await.unwrap();
        log.log("first").await;
        log.log("second").await;
        drop(log);

        // Reopening must append, not truncate
        let log = DiagnosticLog::open(&path, Duration::from_secs(1)).await.unwrap();
        log.log("third").await;

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with(" first"));
        assert!(lines[2].ends_with(" third"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_contended_lock_degrades_to_console() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("uplink.log");
        let log = DiagnosticLog::open(&path, Duration::from_secs(10)).await.unwrap();

        let held = log.file.lock().await;
        // Returns after the bounded wait instead of blocking forever.
        log.log("dropped to console").await;
        drop(held);

        log.log("written").await;
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(!contents.contains("dropped to console"));
        assert!(contents.contains("written"));
    }
}
