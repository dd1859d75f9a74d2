//! OpenSSH-backed remote access: `ssh`, `sftp`, `rsync`.
//!
//! One session is one `ssh -M` control master. Shell commands and SFTP
//! puts are multiplexed over its control socket, so a session costs a single
//! TCP connection and a single authentication. All binaries are spawned with
//! argument vectors; only the remote command line goes through the remote
//! shell, and every path in it is single-quoted.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::{BulkSync, RemoteChannel, RemoteConnector, RemoteError, RemoteTarget};
use crate::config::UplinkConfig;

/// Interval between control-socket checks while the master is coming up.
const MASTER_POLL_INTERVAL: Duration = Duration::from_millis(250);

static SESSION_SEQ: AtomicU64 = AtomicU64::new(0);

/// Transport options shared by the connector and the bulk sync.
#[derive(Debug, Clone)]
pub struct SshSettings {
    pub identity_file: Option<PathBuf>,
    /// Control sockets and outgoing payloads are staged here
    pub staging_dir: PathBuf,
    pub transfer_timeout: Duration,
    pub sync_io_timeout: Duration,
    pub sync_deadline: Duration,
}

impl SshSettings {
    pub fn from_config(config: &UplinkConfig) -> Self {
        Self {
            identity_file: config.server.identity_file.clone(),
            staging_dir: config.paths.staging_dir.clone(),
            transfer_timeout: config.timing.transfer_timeout(),
            sync_io_timeout: Duration::from_secs(config.timing.sync_io_timeout_secs),
            sync_deadline: Duration::from_secs(config.timing.sync_deadline_secs),
        }
    }

    /// Options common to every ssh invocation.
    fn ssh_options(&self, port: u16) -> Vec<String> {
        let mut opts = vec![
            "-p".to_string(),
            port.to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
        ];
        if let Some(id) = &self.identity_file {
            opts.push("-i".to_string());
            opts.push(id.display().to_string());
        }
        opts
    }
}

/// Quote `s` for a POSIX remote shell.
pub(crate) fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Quote `s` for an sftp batch line.
fn sftp_quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', r"\\").replace('"', "\\\""))
}

/// Run a command to completion under `limit`, optionally feeding stdin.
async fn run_bounded(
    mut cmd: Command,
    op: &'static str,
    limit: Duration,
    stdin: Option<Vec<u8>>,
) -> Result<Output, RemoteError> {
    cmd.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let run = async {
        let mut child = cmd.spawn().map_err(|e| RemoteError::Transfer {
            op,
            reason: format!("spawn failed: {}", e),
        })?;
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(&input).await.map_err(|e| RemoteError::Transfer {
                op,
                reason: format!("stdin write failed: {}", e),
            })?;
        }
        child.wait_with_output().await.map_err(|e| RemoteError::Transfer {
            op,
            reason: e.to_string(),
        })
    };

    tokio::time::timeout(limit, run)
        .await
        .map_err(|_| RemoteError::Timeout {
            op,
            secs: limit.as_secs(),
        })?
}

fn check(op: &'static str, output: Output) -> Result<Output, RemoteError> {
    if output.status.success() {
        Ok(output)
    } else {
        Err(RemoteError::from_stderr(op, &String::from_utf8_lossy(&output.stderr)))
    }
}

/// Opens control-master sessions with the system `ssh` client.
pub struct OpenSshConnector {
    settings: SshSettings,
}

impl OpenSshConnector {
    pub fn new(settings: SshSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl RemoteConnector for OpenSshConnector {
    async fn connect(&self, target: &RemoteTarget) -> Result<Box<dyn RemoteChannel>, RemoteError> {
        let connect_err = |reason: String| RemoteError::Connect {
            target: target.to_string(),
            reason,
        };

        tokio::fs::create_dir_all(&self.settings.staging_dir)
            .await
            .map_err(|e| connect_err(format!("staging dir: {}", e)))?;

        let seq = SESSION_SEQ.fetch_add(1, Ordering::Relaxed);
        let control = self
            .settings
            .staging_dir
            .join(format!("ssh-{}-{}.ctl", std::process::id(), seq));
        let _ = tokio::fs::remove_file(&control).await;

        let mut master = Command::new("ssh")
            .arg("-M")
            .arg("-N")
            .arg("-S")
            .arg(&control)
            .args(self.settings.ssh_options(target.port))
            .arg(format!("{}@{}", target.user, target.host))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| connect_err(format!("spawn ssh: {}", e)))?;

        // The caller bounds this loop with its connect timeout; dropping the
        // future kills the master.
        loop {
            if let Ok(Some(status)) = master.try_wait() {
                return Err(connect_err(format!("ssh master exited with {}", status)));
            }

            let status = Command::new("ssh")
                .arg("-S")
                .arg(&control)
                .args(["-O", "check"])
                .arg(format!("{}@{}", target.user, target.host))
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .status()
                .await;

            if matches!(status, Ok(s) if s.success()) {
                debug!(server = %target, control = %control.display(), "ssh control master up");
                return Ok(Box::new(OpenSshChannel {
                    master,
                    control,
                    target: target.clone(),
                    settings: self.settings.clone(),
                }));
            }
            tokio::time::sleep(MASTER_POLL_INTERVAL).await;
        }
    }
}

/// Shell and SFTP channel multiplexed over one control master.
struct OpenSshChannel {
    master: Child,
    control: PathBuf,
    target: RemoteTarget,
    settings: SshSettings,
}

impl OpenSshChannel {
    fn destination(&self) -> String {
        format!("{}@{}", self.target.user, self.target.host)
    }

    fn ssh(&self) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-S")
            .arg(&self.control)
            .args(self.settings.ssh_options(self.target.port))
            .arg(self.destination());
        cmd
    }

    async fn remote(&self, op: &'static str, command_line: String) -> Result<Output, RemoteError> {
        let mut cmd = self.ssh();
        cmd.arg("--").arg(command_line);
        let output = run_bounded(cmd, op, self.settings.transfer_timeout, None).await?;
        check(op, output)
    }
}

#[async_trait]
impl RemoteChannel for OpenSshChannel {
    async fn list_dir(&mut self, path: &str) -> Result<Vec<String>, RemoteError> {
        let output = self.remote("ls", format!("ls -1 -- {}", shell_quote(path))).await?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn make_dirs(&mut self, path: &str) -> Result<(), RemoteError> {
        self.remote("mkdir", format!("mkdir -p -- {}", shell_quote(path))).await?;
        Ok(())
    }

    async fn put_bytes(&mut self, data: &[u8], remote_path: &str) -> Result<(), RemoteError> {
        let name = Path::new(remote_path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "payload".to_string());
        let staged = self.settings.staging_dir.join(format!("{}.part", name));

        tokio::fs::write(&staged, data).await.map_err(|e| RemoteError::Transfer {
            op: "put",
            reason: format!("staging {}: {}", staged.display(), e),
        })?;

        let batch = format!(
            "put {} {}\n",
            sftp_quote(&staged.display().to_string()),
            sftp_quote(remote_path)
        );
        let mut cmd = Command::new("sftp");
        cmd.arg("-o")
            .arg(format!("ControlPath={}", self.control.display()))
            .arg("-P")
            .arg(self.target.port.to_string())
            .args(["-o", "StrictHostKeyChecking=accept-new", "-o", "BatchMode=yes"])
            .args(["-b", "-"])
            .arg(self.destination());

        let result = run_bounded(cmd, "put", self.settings.transfer_timeout, Some(batch.into_bytes()))
            .await
            .and_then(|output| check("put", output));

        if let Err(e) = tokio::fs::remove_file(&staged).await {
            debug!(path = %staged.display(), error = %e, "Could not remove staged payload");
        }
        result.map(|_| ())
    }

    async fn close(&mut self) -> Result<(), RemoteError> {
        let mut cmd = Command::new("ssh");
        cmd.arg("-S")
            .arg(&self.control)
            .args(["-O", "exit"])
            .arg(self.destination());
        let exit = run_bounded(cmd, "close", Duration::from_secs(10), None)
            .await
            .and_then(|output| check("close", output));

        if let Err(e) = self.master.kill().await {
            debug!(error = %e, "ssh master already gone");
        }
        let _ = tokio::fs::remove_file(&self.control).await;
        exit.map(|_| ())
    }
}

/// High-res mirroring via `rsync` over ssh.
pub struct RsyncSync {
    target: RemoteTarget,
    settings: SshSettings,
}

impl RsyncSync {
    pub fn new(target: RemoteTarget, settings: SshSettings) -> Self {
        Self { target, settings }
    }

    fn args(&self, local: &Path, is_dir: bool, remote_dir: &str) -> Vec<String> {
        let mut source = local.display().to_string();
        if is_dir && !source.ends_with('/') {
            source.push('/');
        }
        let remote_dir = remote_dir.trim_end_matches('/');
        vec![
            "-a".to_string(),
            format!("--timeout={}", self.settings.sync_io_timeout.as_secs().max(1)),
            "-e".to_string(),
            format!("ssh {}", self.settings.ssh_options(self.target.port).join(" ")),
            source,
            format!("{}@{}:{}/", self.target.user, self.target.host, remote_dir),
        ]
    }
}

#[async_trait]
impl BulkSync for RsyncSync {
    async fn sync(&self, local: &Path, remote_dir: &str) -> Result<(), RemoteError> {
        let meta = tokio::fs::metadata(local).await.map_err(|e| RemoteError::Transfer {
            op: "rsync",
            reason: format!("{}: {}", local.display(), e),
        })?;

        let mut cmd = Command::new("rsync");
        cmd.args(self.args(local, meta.is_dir(), remote_dir));
        let output = run_bounded(cmd, "rsync", self.settings.sync_deadline, None).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(local = %local.display(), remote_dir, stderr = %stderr.trim(), "rsync failed");
            return Err(RemoteError::from_stderr("rsync", &stderr));
        }
        Ok(())
    }
}
