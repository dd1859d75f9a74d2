//! Connectivity probe: which transports are up, and does anything answer
//!
//! The probe never talks to the OS directly. It goes through a
//! [`NetworkAdmin`] capability so that the dispatcher can be exercised
//! against a scripted network in tests; [`NmcliAdmin`] is the production
//! implementation for NetworkManager hosts.

mod nmcli;

pub use nmcli::NmcliAdmin;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::UplinkConfig;
use crate::types::{ConnectivityState, ConnectivityStatus, Reachability};

/// Network administration errors
#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{command} exited with {status}: {stderr}")]
    Failed {
        command: &'static str,
        status: String,
        stderr: String,
    },
    #[error("{0} timed out")]
    Timeout(&'static str),
}

/// Transport class of an active connection, as reported by the network manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Wifi,
    Ethernet,
    Gsm,
    Other,
}

/// OS network administration capability.
#[async_trait]
pub trait NetworkAdmin: Send + Sync {
    /// Transport classes of all currently active connections.
    async fn active_links(&self) -> Result<Vec<LinkKind>, AdminError>;

    /// Send `count` echo requests to `target`; true if any reply arrived.
    async fn ping(&self, target: &str, count: u32, timeout: Duration) -> bool;

    /// Bounce the network manager after a failed reachability check.
    async fn restart_network_manager(&self) -> Result<(), AdminError>;
}

/// Ping targets and bounds.
#[derive(Debug, Clone)]
pub struct ReachabilityTargets {
    pub public: String,
    pub server: String,
    pub count: u32,
    pub timeout: Duration,
}

impl ReachabilityTargets {
    pub fn from_config(config: &UplinkConfig) -> Self {
        Self {
            public: config.reachability.public_target.clone(),
            server: config.server.host.clone(),
            count: config.reachability.ping_count,
            timeout: Duration::from_secs(config.reachability.ping_timeout_secs),
        }
    }
}

/// Connectivity probe over a [`NetworkAdmin`].
#[derive(Clone)]
pub struct ConnectivityProbe {
    admin: Arc<dyn NetworkAdmin>,
    targets: ReachabilityTargets,
}

impl ConnectivityProbe {
    pub fn new(admin: Arc<dyn NetworkAdmin>, targets: ReachabilityTargets) -> Self {
        Self { admin, targets }
    }

    /// Active transport classes. A failed query reports nothing up.
    pub async fn status(&self) -> ConnectivityStatus {
        let links = match self.admin.active_links().await {
            Ok(links) => links,
            Err(e) => {
                warn!(error = %e, "Could not list active connections");
                return ConnectivityStatus::default();
            }
        };

        let status = ConnectivityStatus {
            wifi: links.contains(&LinkKind::Wifi),
            gsm: links.contains(&LinkKind::Gsm),
            ethernet: links.contains(&LinkKind::Ethernet),
        };
        debug!(wifi = status.wifi, ethernet = status.ethernet, gsm = status.gsm, "Connectivity status");
        status
    }

    /// Ping loopback, the public target, then the archive server.
    ///
    /// The server is only tried when the internet answered.
    pub async fn reachability(&self) -> Reachability {
        let t = &self.targets;
        let localhost = self.admin.ping("127.0.0.1", t.count, t.timeout).await;
        let internet = self.admin.ping(&t.public, t.count, t.timeout).await;
        let server = internet && self.admin.ping(&t.server, t.count, t.timeout).await;

        let reach = Reachability {
            localhost,
            internet,
            server,
        };
        debug!(localhost, internet, server, "Reachability");
        reach
    }

    /// Transport to use for the next delivery attempt.
    ///
    /// Ethernet without WiFi may be a bare cable with no gateway; it only
    /// counts when the internet is actually reachable over it.
    pub async fn usable_transport(&self) -> (ConnectivityState, ConnectivityStatus) {
        let mut status = self.status().await;

        if status.ethernet_only() {
            let reach = self.reachability().await;
            if !reach.internet {
                info!("Ethernet link has no internet route, treating it as down");
                status.ethernet = false;
            }
        }

        (status.state(), status)
    }

    /// Re-check reachability, restarting the network manager when the
    /// internet does not answer. Returns the pre-restart reachability.
    pub async fn reprobe(&self) -> Reachability {
        let reach = self.reachability().await;
        if !reach.internet {
            warn!(
                localhost = reach.localhost,
                "Internet unreachable, restarting network manager"
            );
            if let Err(e) = self.admin.restart_network_manager().await {
                warn!(error = %e, "Network manager restart failed");
            }
        }
        reach
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedAdmin {
        links: Vec<LinkKind>,
        internet: bool,
        server: bool,
        pings: Mutex<Vec<String>>,
        restarts: AtomicU32,
    }

    #[async_trait]
    impl NetworkAdmin for ScriptedAdmin {
        async fn active_links(&self) -> Result<Vec<LinkKind>, AdminError> {
            Ok(self.links.clone())
        }

        async fn ping(&self, target: &str, _count: u32, _timeout: Duration) -> bool {
            self.pings.lock().unwrap().push(target.to_string());
            match target {
                "127.0.0.1" => true,
                "public" => self.internet,
                _ => self.server,
            }
        }

        async fn restart_network_manager(&self) -> Result<(), AdminError> {
            self.restarts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn probe(admin: Arc<ScriptedAdmin>) -> ConnectivityProbe {
        ConnectivityProbe::new(
            admin,
            ReachabilityTargets {
                public: "public".to_string(),
                server: "archive".to_string(),
                count: 1,
                timeout: Duration::from_secs(1),
            },
        )
    }

    #[tokio::test]
    async fn test_status_matches_link_kinds() {
        let admin = Arc::new(ScriptedAdmin {
            links: vec![LinkKind::Gsm, LinkKind::Other],
            ..Default::default()
        });
        let status = probe(admin).status().await;
        assert_eq!(status, ConnectivityStatus { wifi: false, gsm: true, ethernet: false });
    }

    #[tokio::test]
    async fn test_server_ping_skipped_without_internet() {
        let admin = Arc::new(ScriptedAdmin { server: true, ..Default::default() });
        let reach = probe(Arc::clone(&admin)).reachability().await;

        assert!(reach.localhost);
        assert!(!reach.internet);
        assert!(!reach.server);
        assert_eq!(*admin.pings.lock().unwrap(), vec!["127.0.0.1", "public"]);
    }

    #[tokio::test]
    async fn test_local_only_ethernet_is_demoted() {
        let admin = Arc::new(ScriptedAdmin {
            links: vec![LinkKind::Ethernet],
            internet: false,
            ..Default::default()
        });
        let (state, status) = probe(admin).usable_transport().await;
        assert_eq!(state, ConnectivityState::None);
        assert!(!status.ethernet);
    }

    #[tokio::test]
    async fn test_routed_ethernet_is_kept() {
        let admin = Arc::new(ScriptedAdmin {
            links: vec![LinkKind::Ethernet],
            internet: true,
            server: true,
            ..Default::default()
        });
        let (state, _) = probe(admin).usable_transport().await;
        assert_eq!(state, ConnectivityState::Ethernet);
    }

    #[tokio::test]
    async fn test_wifi_skips_reachability_check() {
        let admin = Arc::new(ScriptedAdmin {
            links: vec![LinkKind::Wifi, LinkKind::Ethernet],
            ..Default::default()
        });
        let (state, _) = probe(Arc::clone(&admin)).usable_transport().await;
        assert_eq!(state, ConnectivityState::Wifi);
        assert!(admin.pings.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reprobe_restarts_only_on_failure() {
        let down = Arc::new(ScriptedAdmin::default());
        probe(Arc::clone(&down)).reprobe().await;
        assert_eq!(down.restarts.load(Ordering::SeqCst), 1);

        let up = Arc::new(ScriptedAdmin { internet: true, ..Default::default() });
        probe(Arc::clone(&up)).reprobe().await;
        assert_eq!(up.restarts.load(Ordering::SeqCst), 0);
    }
}
