//! Bench-test capabilities for `--dry-run`.
//!
//! The full dispatcher pipeline runs, but the network always reports WiFi,
//! remote writes are only logged, and a reboot request is only logged.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::connectivity::{AdminError, LinkKind, NetworkAdmin};
use crate::remote::{BulkSync, RemoteChannel, RemoteConnector, RemoteError, RemoteTarget};
use crate::system::{SystemControl, SystemError};
use crate::uplink::UplinkParts;

pub struct DryRunNetwork;

#[async_trait]
impl NetworkAdmin for DryRunNetwork {
    async fn active_links(&self) -> Result<Vec<LinkKind>, AdminError> {
        Ok(vec![LinkKind::Wifi])
    }

    async fn ping(&self, _target: &str, _count: u32, _timeout: Duration) -> bool {
        true
    }

    async fn restart_network_manager(&self) -> Result<(), AdminError> {
        info!("[dry-run] restart network manager");
        Ok(())
    }
}

pub struct DryRunRemote;

#[async_trait]
impl RemoteConnector for DryRunRemote {
    async fn connect(&self, target: &RemoteTarget) -> Result<Box<dyn RemoteChannel>, RemoteError> {
        info!(server = %target, "[dry-run] connect");
        Ok(Box::new(DryRunChannel))
    }
}

struct DryRunChannel;

#[async_trait]
impl RemoteChannel for DryRunChannel {
    async fn list_dir(&mut self, _path: &str) -> Result<Vec<String>, RemoteError> {
        Ok(Vec::new())
    }

    async fn make_dirs(&mut self, path: &str) -> Result<(), RemoteError> {
        info!(path, "[dry-run] mkdir -p");
        Ok(())
    }

    async fn put_bytes(&mut self, data: &[u8], remote_path: &str) -> Result<(), RemoteError> {
        info!(remote_path, bytes = data.len(), "[dry-run] put");
        Ok(())
    }

    async fn close(&mut self) -> Result<(), RemoteError> {
        Ok(())
    }
}

#[async_trait]
impl BulkSync for DryRunRemote {
    async fn sync(&self, local: &Path, remote_dir: &str) -> Result<(), RemoteError> {
        info!(local = %local.display(), remote_dir, "[dry-run] rsync");
        Ok(())
    }
}

pub struct DryRunSystem;

#[async_trait]
impl SystemControl for DryRunSystem {
    async fn reboot(&self) -> Result<(), SystemError> {
        info!("[dry-run] reboot");
        Ok(())
    }
}

/// Capabilities that touch nothing outside the process.
pub fn parts() -> UplinkParts {
    UplinkParts {
        admin: Arc::new(DryRunNetwork),
        connector: Arc::new(DryRunRemote),
        bulk: Arc::new(DryRunRemote),
        system: Arc::new(DryRunSystem),
    }
}
