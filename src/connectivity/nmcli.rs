//! NetworkManager-backed [`NetworkAdmin`]: `nmcli`, `ping`, `systemctl`.
//!
//! Commands are spawned directly with argument vectors; no shell is involved.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

use super::{AdminError, LinkKind, NetworkAdmin};

/// Upper bound for any single admin command.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

pub struct NmcliAdmin {
    /// Unit restarted by [`NetworkAdmin::restart_network_manager`]
    service: String,
}

impl Default for NmcliAdmin {
    fn default() -> Self {
        Self {
            service: "NetworkManager".to_string(),
        }
    }
}

impl NmcliAdmin {
    pub fn new() -> Self {
        Self::default()
    }

    async fn run(command: &'static str, args: &[&str]) -> Result<String, AdminError> {
        let output = tokio::time::timeout(
            COMMAND_TIMEOUT,
            Command::new(command)
                .args(args)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| AdminError::Timeout(command))?
        .map_err(|source| AdminError::Spawn { command, source })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(AdminError::Failed {
                command,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

/// Map an nmcli connection TYPE (terse output) to a transport class.
pub(crate) fn classify_link(kind: &str) -> LinkKind {
    match kind.trim() {
        "802-11-wireless" | "wifi" => LinkKind::Wifi,
        "802-3-ethernet" | "ethernet" => LinkKind::Ethernet,
        "gsm" | "cdma" => LinkKind::Gsm,
        _ => LinkKind::Other,
    }
}

#[async_trait]
impl NetworkAdmin for NmcliAdmin {
    async fn active_links(&self) -> Result<Vec<LinkKind>, AdminError> {
        let stdout = Self::run("nmcli", &["-t", "-f", "TYPE", "connection", "show", "--active"]).await?;
        let links: Vec<LinkKind> = stdout
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(classify_link)
            .collect();
        debug!(?links, "Active connections");
        Ok(links)
    }

    async fn ping(&self, target: &str, count: u32, timeout: Duration) -> bool {
        let count = count.to_string();
        let deadline = timeout.as_secs().max(1).to_string();
        let overall = timeout.saturating_mul(2).saturating_add(Duration::from_secs(1));

        let status = tokio::time::timeout(
            overall,
            Command::new("ping")
                .args(["-c", &count, "-W", &deadline, target])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .status(),
        )
        .await;

        matches!(status, Ok(Ok(s)) if s.success())
    }

    async fn restart_network_manager(&self) -> Result<(), AdminError> {
        info!(service = %self.service, "Restarting network manager");
        Self::run("systemctl", &["restart", &self.service]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_link() {
        assert_eq!(classify_link("802-11-wireless"), LinkKind::Wifi);
        assert_eq!(classify_link("802-3-ethernet\n"), LinkKind::Ethernet);
        assert_eq!(classify_link("gsm"), LinkKind::Gsm);
        assert_eq!(classify_link("loopback"), LinkKind::Other);
        assert_eq!(classify_link("bridge"), LinkKind::Other);
    }
}
