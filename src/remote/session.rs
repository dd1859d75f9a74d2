//! Remote session lifecycle
//!
//! `SessionOpener` makes a bounded number of connect attempts and reports
//! `Unavailable` instead of failing; the node keeps queueing while the
//! server is unreachable. `SessionHandle` is the dispatcher-owned slot that
//! walks `ABSENT → CONNECTING → READY → FAILED → ABSENT`.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{RemoteChannel, RemoteConnector, RemoteError, RemoteTarget};
use crate::config::defaults::CONNECT_RETRY_DELAY_SECS;
use crate::config::UplinkConfig;
use crate::context::UplinkContext;

/// Lifecycle state of the dispatcher's session slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Absent,
    Connecting,
    Ready,
    Failed,
}

/// Result of an open attempt. `Unavailable` is an expected outcome.
pub enum SessionOpen {
    Ready(RemoteSession),
    Unavailable { attempts: u32 },
}

/// An open connection to the archive server.
pub struct RemoteSession {
    target: RemoteTarget,
    channel: Box<dyn RemoteChannel>,
}

impl RemoteSession {
    pub fn target(&self) -> &RemoteTarget {
        &self.target
    }

    pub async fn list_dir(&mut self, path: &str) -> Result<Vec<String>, RemoteError> {
        self.channel.list_dir(path).await
    }

    pub async fn make_dirs(&mut self, path: &str) -> Result<(), RemoteError> {
        self.channel.make_dirs(path).await
    }

    pub async fn put_bytes(&mut self, data: &[u8], remote_path: &str) -> Result<(), RemoteError> {
        self.channel.put_bytes(data, remote_path).await
    }

    /// Release the transfer and shell channels. Best effort: errors are logged.
    pub async fn close(mut self) {
        match self.channel.close().await {
            Ok(()) => debug!(server = %self.target, "Remote session closed"),
            Err(e) => warn!(server = %self.target, error = %e, "Error while closing remote session"),
        }
    }
}

/// Opens sessions with bounded retries.
#[derive(Clone)]
pub struct SessionOpener {
    connector: Arc<dyn RemoteConnector>,
    target: RemoteTarget,
    attempts: u32,
    connect_timeout: Duration,
    retry_delay: Duration,
}

impl SessionOpener {
    pub fn new(
        connector: Arc<dyn RemoteConnector>,
        target: RemoteTarget,
        attempts: u32,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            target,
            attempts: attempts.max(1),
            connect_timeout,
            retry_delay: Duration::from_secs(CONNECT_RETRY_DELAY_SECS),
        }
    }

    pub fn from_config(connector: Arc<dyn RemoteConnector>, config: &UplinkConfig) -> Self {
        Self::new(
            connector,
            RemoteTarget {
                host: config.server.host.clone(),
                user: config.server.user.clone(),
                port: config.server.port,
            },
            config.server.connect_attempts,
            config.timing.connect_timeout(),
        )
    }

    pub fn target(&self) -> &RemoteTarget {
        &self.target
    }

    /// Try to connect up to the configured number of times.
    pub async fn open(&self, ctx: &UplinkContext) -> SessionOpen {
        for attempt in 1..=self.attempts {
            let result = tokio::time::timeout(self.connect_timeout, self.connector.connect(&self.target)).await;

            let error = match result {
                Ok(Ok(channel)) => {
                    info!(server = %self.target, attempt, "Remote session ready");
                    return SessionOpen::Ready(RemoteSession {
                        target: self.target.clone(),
                        channel,
                    });
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("timed out after {}s", self.connect_timeout.as_secs()),
            };

            warn!(server = %self.target, attempt, max = self.attempts, error = %error, "Connect attempt failed");
            ctx.log()
                .log(&format!(
                    "connect attempt {}/{} to {} failed: {}",
                    attempt, self.attempts, self.target, error
                ))
                .await;

            if attempt < self.attempts {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        ctx.log()
            .log(&format!(
                "archive server {} unavailable after {} attempts",
                self.target, self.attempts
            ))
            .await;
        SessionOpen::Unavailable {
            attempts: self.attempts,
        }
    }
}

/// Dispatcher-owned session slot. Never shared across tasks.
pub struct SessionHandle {
    session: Option<RemoteSession>,
    state: SessionState,
}

impl Default for SessionHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionHandle {
    pub fn new() -> Self {
        Self {
            session: None,
            state: SessionState::Absent,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The ready session, opening one first if the slot is empty.
    ///
    /// `None` means the server is currently unavailable.
    pub async fn ensure(&mut self, opener: &SessionOpener, ctx: &UplinkContext) -> Option<&mut RemoteSession> {
        if self.session.is_none() {
            self.state = SessionState::Connecting;
            match opener.open(ctx).await {
                SessionOpen::Ready(session) => {
                    self.session = Some(session);
                    self.state = SessionState::Ready;
                }
                SessionOpen::Unavailable { .. } => {
                    self.state = SessionState::Absent;
                }
            }
        }
        self.session.as_mut()
    }

    /// Flag the current session as unusable; it is closed on the next teardown.
    pub fn mark_failed(&mut self) {
        if self.session.is_some() {
            self.state = SessionState::Failed;
        }
    }

    /// Close whatever is in the slot and return to `Absent`.
    pub async fn teardown(&mut self) {
        if let Some(session) = self.session.take() {
            session.close().await;
        }
        self.state = SessionState::Absent;
    }

    /// Tear down and reopen from scratch. No partial repair.
    pub async fn rebuild(&mut self, opener: &SessionOpener, ctx: &UplinkContext) -> bool {
        self.teardown().await;
        self.ensure(opener, ctx).await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::DiagnosticLog;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct NullChannel {
        closes: Arc<AtomicU32>,
    }

    #[async_trait]
    impl RemoteChannel for NullChannel {
        async fn list_dir(&mut self, _path: &str) -> Result<Vec<String>, RemoteError> {
            Ok(Vec::new())
        }
        async fn make_dirs(&mut self, _path: &str) -> Result<(), RemoteError> {
            Ok(())
        }
        async fn put_bytes(&mut self, _data: &[u8], _remote_path: &str) -> Result<(), RemoteError> {
            Ok(())
        }
        async fn close(&mut self) -> Result<(), RemoteError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Err(RemoteError::Transfer {
                op: "close",
                reason: "already gone".to_string(),
            })
        }
    }

    /// Fails the first `fail_first` connects, then succeeds.
    struct FlakyConnector {
        fail_first: u32,
        calls: AtomicU32,
        closes: Arc<AtomicU32>,
    }

    #[async_trait]
    impl RemoteConnector for FlakyConnector {
        async fn connect(&self, target: &RemoteTarget) -> Result<Box<dyn RemoteChannel>, RemoteError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(RemoteError::Connect {
                    target: target.to_string(),
                    reason: "connection refused".to_string(),
                });
            }
            Ok(Box::new(NullChannel {
                closes: Arc::clone(&self.closes),
            }))
        }
    }

    fn ctx() -> UplinkContext {
        UplinkContext::new("node", Arc::new(DiagnosticLog::console_only(Duration::from_secs(1))))
    }

    fn opener(connector: Arc<FlakyConnector>) -> SessionOpener {
        SessionOpener::new(
            connector,
            RemoteTarget {
                host: "archive".to_string(),
                user: "uplink".to_string(),
                port: 2222,
            },
            3,
            Duration::from_secs(5),
        )
    }

    fn flaky(fail_first: u32) -> Arc<FlakyConnector> {
        Arc::new(FlakyConnector {
            fail_first,
            calls: AtomicU32::new(0),
            closes: Arc::new(AtomicU32::new(0)),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_succeeds_on_third_attempt() {
        let connector = flaky(2);
        let outcome = opener(Arc::clone(&connector)).open(&ctx()).await;
        assert!(matches!(outcome, SessionOpen::Ready(_)));
        assert_eq!(connector.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_reports_unavailable_after_three_failures() {
        let connector = flaky(u32::MAX);
        let outcome = opener(Arc::clone(&connector)).open(&ctx()).await;
        assert!(matches!(outcome, SessionOpen::Unavailable { attempts: 3 }));
        assert_eq!(connector.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_lifecycle() {
        let connector = flaky(0);
        let opener = opener(Arc::clone(&connector));
        let ctx = ctx();
        let mut handle = SessionHandle::new();
        assert_eq!(handle.state(), SessionState::Absent);

        assert!(handle.ensure(&opener, &ctx).await.is_some());
        assert_eq!(handle.state(), SessionState::Ready);

        handle.mark_failed();
        assert_eq!(handle.state(), SessionState::Failed);

        // Close errors are swallowed
        handle.teardown().await;
        assert_eq!(handle.state(), SessionState::Absent);
        assert_eq!(connector.closes.load(Ordering::SeqCst), 1);

        assert!(handle.rebuild(&opener, &ctx).await);
        assert_eq!(connector.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mark_failed_without_session_stays_absent() {
        let mut handle = SessionHandle::new();
        handle.mark_failed();
        assert_eq!(handle.state(), SessionState::Absent);
    }
}
