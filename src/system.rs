//! Host power control.
//!
//! The only action the uplink ever takes on the host is a reboot after a
//! sustained total outage.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum SystemError {
    #[error("failed to run systemctl: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("systemctl reboot exited with {0}")]
    Failed(String),
    #[error("systemctl reboot timed out")]
    Timeout,
}

#[async_trait]
pub trait SystemControl: Send + Sync {
    /// Ask the host to reboot. Returning does not mean the reboot happened.
    async fn reboot(&self) -> Result<(), SystemError>;
}

/// Reboots through systemd.
#[derive(Debug, Default)]
pub struct SystemdReboot;

#[async_trait]
impl SystemControl for SystemdReboot {
    async fn reboot(&self) -> Result<(), SystemError> {
        info!("Requesting host reboot");
        let status = tokio::time::timeout(
            Duration::from_secs(30),
            Command::new("systemctl")
                .arg("reboot")
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .status(),
        )
        .await
        .map_err(|_| SystemError::Timeout)??;

        if status.success() {
            Ok(())
        } else {
            warn!(%status, "Reboot request rejected");
            Err(SystemError::Failed(status.to_string()))
        }
    }
}
