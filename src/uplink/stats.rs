//! Delivery counters shared between the dispatcher and whoever reports on it.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Shared handle to [`UplinkStats`].
pub type StatsHandle = Arc<RwLock<UplinkStats>>;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UplinkStats {
    /// Packets whose delivery completed
    pub delivered: u64,
    /// Packets put back on the queue after a failed attempt
    pub requeued: u64,
    /// Packets dropped because they could not be encoded
    pub dropped: u64,
    /// Sessions torn down and reopened after a delivery error
    pub session_rebuilds: u64,
    /// Remote directories created by the provisioner
    pub dirs_created: u64,
    /// Successful high-res syncs, daily file and month trees together
    pub highres_syncs: u64,
    pub month_resyncs: u64,
    /// Start of the current continuous outage, if any
    pub outage_since: Option<DateTime<Local>>,
    pub last_delivery: Option<DateTime<Local>>,
    pub reboot_requested: bool,
}

impl UplinkStats {
    pub fn handle() -> StatsHandle {
        Arc::new(RwLock::new(Self::default()))
    }
}

impl std::fmt::Display for UplinkStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "delivered={} requeued={} dropped={} rebuilds={} dirs_created={} highres_syncs={} month_resyncs={}",
            self.delivered,
            self.requeued,
            self.dropped,
            self.session_rebuilds,
            self.dirs_created,
            self.highres_syncs,
            self.month_resyncs
        )
    }
}
