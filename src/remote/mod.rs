//! Remote archive access: session, directory provisioning, bulk sync
//!
//! ## Architecture
//!
//! - **RemoteConnector / RemoteChannel**: capability traits for one secure
//!   shell + file-transfer connection (OpenSSH in production)
//! - **SessionOpener / SessionHandle**: bounded-retry open and the
//!   `ABSENT → CONNECTING → READY → FAILED → ABSENT` lifecycle
//! - **RemoteDirectoryProvisioner**: idempotent `mkdir -p` on demand
//! - **BulkSync**: whole-file / whole-tree mirroring for high-res data

mod openssh;
mod provision;
mod session;

pub use openssh::{OpenSshConnector, RsyncSync, SshSettings};
pub use provision::{ProvisionOutcome, RemoteDirectoryProvisioner};
pub use session::{RemoteSession, SessionHandle, SessionOpen, SessionOpener, SessionState};

use async_trait::async_trait;
use std::path::Path;

/// Remote operation errors, classified for the dispatcher's recovery table.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("connect to {target} failed: {reason}")]
    Connect { target: String, reason: String },
    #[error("{op} timed out after {secs}s")]
    Timeout { op: &'static str, secs: u64 },
    #[error("remote path missing: {0}")]
    PathMissing(String),
    #[error("{op} failed: {reason}")]
    Transfer { op: &'static str, reason: String },
}

impl RemoteError {
    /// Classify a failed remote command from its stderr.
    pub fn from_stderr(op: &'static str, stderr: &str) -> Self {
        let lower = stderr.to_ascii_lowercase();
        if lower.contains("no such file")
            || lower.contains("not found")
            || lower.contains("does not exist")
        {
            RemoteError::PathMissing(stderr.trim().to_string())
        } else if lower.contains("timed out") || lower.contains("timeout") {
            RemoteError::Timeout { op, secs: 0 }
        } else {
            RemoteError::Transfer {
                op,
                reason: stderr.trim().to_string(),
            }
        }
    }
}

/// Where and as whom to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    pub host: String,
    pub user: String,
    pub port: u16,
}

impl std::fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// Opens connections to the archive server.
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn connect(&self, target: &RemoteTarget) -> Result<Box<dyn RemoteChannel>, RemoteError>;
}

/// An open shell + file-transfer connection.
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    /// Entries of a remote directory. `PathMissing` if it does not exist.
    async fn list_dir(&mut self, path: &str) -> Result<Vec<String>, RemoteError>;

    /// Create a remote directory including parents.
    async fn make_dirs(&mut self, path: &str) -> Result<(), RemoteError>;

    /// Write `data` to `remote_path` over the file-transfer channel.
    async fn put_bytes(&mut self, data: &[u8], remote_path: &str) -> Result<(), RemoteError>;

    /// Release both channels.
    async fn close(&mut self) -> Result<(), RemoteError>;
}

/// Directory-tree synchronisation utility (rsync in production).
#[async_trait]
pub trait BulkSync: Send + Sync {
    /// Mirror `local` (a file, or a directory's contents) into `remote_dir`.
    async fn sync(&self, local: &Path, remote_dir: &str) -> Result<(), RemoteError>;
}
