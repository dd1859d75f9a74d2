//! Uplink Dispatcher: the single consumer of the uplink queue
//!
//! One packet is in flight at a time. For each packet the dispatcher picks a
//! transport, delivers over the remote session, and on any failure puts the
//! packet back on the queue before acknowledging it, so `join` only returns
//! once every packet has actually been delivered (or deliberately dropped).
//!
//! ## Failure handling
//!
//! | Condition                 | Action                                              |
//! |---------------------------|-----------------------------------------------------|
//! | connect/transfer timeout  | requeue, re-probe connectivity, rebuild session     |
//! | remote path missing       | requeue, rebuild session, provision directories     |
//! | other transfer error      | requeue, re-probe connectivity, rebuild session     |
//! | server unavailable        | requeue, re-probe, idle sleep                       |
//! | unavailable, nothing up   | requeue, outage sleep, reboot after limit           |
//! | no transport              | requeue, re-probe, outage sleep, reboot after limit |
//!
//! The outage clock runs from the first pass with no way out (no usable
//! transport, or a link that reaches neither the internet nor the server)
//! and only stops once a session to the archive server actually opens.

use chrono::{Datelike, Local, NaiveDate};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::queue::UplinkQueue;
use super::stats::StatsHandle;
use super::UplinkParts;
use crate::codec::{CodecError, PacketCodec};
use crate::config::UplinkConfig;
use crate::connectivity::{ConnectivityProbe, ReachabilityTargets};
use crate::context::UplinkContext;
use crate::remote::{
    BulkSync, ProvisionOutcome, RemoteDirectoryProvisioner, RemoteError, RemoteSession, SessionHandle,
    SessionOpener,
};
use crate::system::SystemControl;
use crate::types::{highres_month_dir, ConnectivityState, DeliveryClass, DeliveryPacket};

/// Where the dispatcher currently is in its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Idle,
    SelectingTransport,
    Delivering,
    ErrorRecovery,
    OutageBackoff,
}

impl std::fmt::Display for DispatcherState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatcherState::Idle => write!(f, "IDLE"),
            DispatcherState::SelectingTransport => write!(f, "SELECTING_TRANSPORT"),
            DispatcherState::Delivering => write!(f, "DELIVERING"),
            DispatcherState::ErrorRecovery => write!(f, "ERROR_RECOVERY"),
            DispatcherState::OutageBackoff => write!(f, "OUTAGE_BACKOFF"),
        }
    }
}

/// Why the dispatcher loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherExit {
    /// Cancelled by the owner
    Shutdown,
    /// Total outage exceeded the limit and a reboot was requested
    RebootRequested,
    /// Total outage exceeded the limit but the reboot request itself failed
    RebootFailed,
}

/// Per-calendar-day bookkeeping, reset when `file_day` rolls over.
#[derive(Debug, Default)]
struct DailyFlags {
    day: Option<NaiveDate>,
    /// Delivery classes whose remote directories were checked today
    dir_checked: HashSet<DeliveryClass>,
    month_resync_done: bool,
    /// Day before the last rollover; its month tree is resynced once
    resync_day: Option<NaiveDate>,
}

impl DailyFlags {
    /// Track the packet's day. Returns true on a forward rollover.
    ///
    /// Requeued packets from an earlier day do not roll the flags back.
    fn observe(&mut self, day: NaiveDate) -> bool {
        match self.day {
            None => {
                self.day = Some(day);
                false
            }
            Some(current) if day > current => {
                self.day = Some(day);
                self.dir_checked.clear();
                self.month_resync_done = false;
                self.resync_day = Some(current);
                true
            }
            Some(_) => false,
        }
    }

    fn pending_resync(&self) -> Option<NaiveDate> {
        if self.month_resync_done {
            None
        } else {
            self.resync_day
        }
    }
}

/// Failure of one delivery attempt.
#[derive(Debug, thiserror::Error)]
enum DeliveryError {
    #[error("archive server unavailable")]
    SessionUnavailable,
    #[error("payload encoding failed: {0}")]
    Encode(#[from] CodecError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

/// What the loop does after handling one packet.
enum Step {
    Continue,
    Sleep(Duration),
    Exit(DispatcherExit),
}

pub struct UplinkDispatcher {
    ctx: UplinkContext,
    queue: Arc<UplinkQueue>,
    probe: ConnectivityProbe,
    opener: SessionOpener,
    session: SessionHandle,
    provisioner: RemoteDirectoryProvisioner,
    codec: PacketCodec,
    bulk: Arc<dyn BulkSync>,
    system: Arc<dyn SystemControl>,
    stats: StatsHandle,
    cancel: CancellationToken,

    remote_lowres_root: String,
    remote_highres_root: String,
    local_highres_root: PathBuf,
    idle_sleep: Duration,
    outage_sleep: Duration,
    outage_reboot_after: Duration,

    state: DispatcherState,
    flags: DailyFlags,
    provisioned_since_boot: bool,
    outage_start: Option<Instant>,
}

impl UplinkDispatcher {
    pub fn new(
        config: &UplinkConfig,
        ctx: UplinkContext,
        queue: Arc<UplinkQueue>,
        parts: UplinkParts,
        stats: StatsHandle,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            probe: ConnectivityProbe::new(parts.admin, ReachabilityTargets::from_config(config)),
            opener: SessionOpener::from_config(parts.connector, config),
            session: SessionHandle::new(),
            provisioner: RemoteDirectoryProvisioner::new(),
            codec: PacketCodec::default(),
            bulk: parts.bulk,
            system: parts.system,
            ctx,
            queue,
            stats,
            cancel,
            remote_lowres_root: config.paths.remote_lowres_root.clone(),
            remote_highres_root: config.paths.remote_highres_root.clone(),
            local_highres_root: config.paths.local_highres_root.clone(),
            idle_sleep: config.timing.idle_sleep(),
            outage_sleep: config.timing.outage_sleep(),
            outage_reboot_after: config.timing.outage_reboot_after(),
            state: DispatcherState::Idle,
            flags: DailyFlags::default(),
            provisioned_since_boot: false,
            outage_start: None,
        }
    }

    /// Consume the queue until cancelled or a reboot is requested.
    pub async fn run(mut self) -> DispatcherExit {
        info!(node = %self.ctx.node(), server = %self.opener.target(), "Uplink dispatcher started");

        let exit = loop {
            if self.cancel.is_cancelled() {
                break DispatcherExit::Shutdown;
            }
            self.enter(DispatcherState::Idle);

            let Some(packet) = self.queue.try_get() else {
                if !self.pause(self.idle_sleep).await {
                    break DispatcherExit::Shutdown;
                }
                continue;
            };

            let step = self.handle(packet).await;

            // Always after any requeue, so join() cannot return early
            if let Err(e) = self.queue.task_done() {
                error!(error = %e, "Queue accounting out of step");
            }

            match step {
                Step::Continue => {}
                Step::Sleep(d) => {
                    if !self.pause(d).await {
                        break DispatcherExit::Shutdown;
                    }
                }
                Step::Exit(exit) => break exit,
            }
        };

        self.session.teardown().await;
        info!(?exit, "Uplink dispatcher stopped");
        exit
    }

    fn enter(&mut self, state: DispatcherState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "Dispatcher state");
            self.state = state;
        }
    }

    /// Sleep unless cancelled first. Returns false on cancellation.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    async fn handle(&mut self, packet: DeliveryPacket) -> Step {
        self.enter(DispatcherState::SelectingTransport);
        let (transport, status) = self.probe.usable_transport().await;

        let Some(class) = transport.delivery_class() else {
            debug!(wifi = status.wifi, ethernet = status.ethernet, gsm = status.gsm, "No usable transport");
            return self.outage_backoff(packet).await;
        };

        if self.flags.observe(packet.file_day) {
            info!(day = %packet.file_day, "Day rollover, daily flags reset");
        }

        self.enter(DispatcherState::Delivering);
        debug!(%transport, %class, stamp = %packet.minute_stamp(), "Delivering packet");

        match self.deliver(&packet, class).await {
            Ok(()) => {
                self.end_outage(transport).await;
                let mut stats = self.stats.write().await;
                stats.delivered += 1;
                stats.last_delivery = Some(Local::now());
                drop(stats);
                info!(%transport, stamp = %packet.minute_stamp(), samples = packet.low_res_batch.len(), "Packet delivered");
                Step::Continue
            }
            Err(DeliveryError::SessionUnavailable) => {
                self.requeue(packet).await;
                self.server_unavailable(transport).await
            }
            Err(DeliveryError::Encode(e)) => {
                // Re-encoding the same batch fails the same way
                error!(error = %e, stamp = %packet.minute_stamp(), "Dropping packet that cannot be encoded");
                self.ctx
                    .log()
                    .log(&format!("dropped packet {}: {}", packet.minute_stamp(), e))
                    .await;
                self.stats.write().await.dropped += 1;
                Step::Continue
            }
            Err(DeliveryError::Remote(e)) => {
                // Remote errors only come from an open session
                self.end_outage(transport).await;
                self.recover(packet, class, e).await;
                Step::Continue
            }
        }
    }

    /// Remote directories a packet of `class` writes into.
    fn required_dirs(&self, packet: &DeliveryPacket, class: DeliveryClass) -> Vec<String> {
        let node = self.ctx.node();
        let mut dirs = vec![packet.lowres_dir(&self.remote_lowres_root, node)];
        if class == DeliveryClass::Full {
            dirs.push(highres_month_dir(&self.remote_highres_root, node, packet.file_day));
            if let Some(prev) = self.flags.pending_resync() {
                let prev_dir = highres_month_dir(&self.remote_highres_root, node, prev);
                if !dirs.contains(&prev_dir) {
                    dirs.push(prev_dir);
                }
            }
        }
        dirs
    }

    async fn deliver(&mut self, packet: &DeliveryPacket, class: DeliveryClass) -> Result<(), DeliveryError> {
        let payload = self.codec.encode(&packet.low_res_batch, &packet.site)?;
        let dirs = self.required_dirs(packet, class);
        let node = self.ctx.node().to_string();

        let Some(session) = self.session.ensure(&self.opener, &self.ctx).await else {
            return Err(DeliveryError::SessionUnavailable);
        };

        if !self.provisioned_since_boot || !self.flags.dir_checked.contains(&class) {
            let created = provision(&self.provisioner, session, &dirs, &self.ctx).await;
            self.stats.write().await.dirs_created += created;
            self.flags.dir_checked.insert(class);
            self.provisioned_since_boot = true;
        }

        let object = packet.lowres_object_path(&self.remote_lowres_root, &node);
        session.put_bytes(&payload, &object).await?;
        debug!(object = %object, bytes = payload.len(), "Low-res payload uploaded");

        if class == DeliveryClass::Reduced {
            return Ok(());
        }

        let high_res = packet.high_res_file();
        if tokio::fs::try_exists(&high_res).await.unwrap_or(false) {
            let remote_dir = highres_month_dir(&self.remote_highres_root, &node, packet.file_day);
            self.bulk.sync(&high_res, &remote_dir).await?;
            self.stats.write().await.highres_syncs += 1;
        } else {
            debug!(path = %high_res.display(), "No high-res file yet");
        }

        if let Some(prev) = self.flags.pending_resync() {
            let local_month = self
                .local_highres_root
                .join(format!("{:04}", prev.year()))
                .join(format!("{:02}", prev.month()));
            if tokio::fs::try_exists(&local_month).await.unwrap_or(false) {
                let remote_dir = highres_month_dir(&self.remote_highres_root, &node, prev);
                self.bulk.sync(&local_month, &remote_dir).await?;
                let mut stats = self.stats.write().await;
                stats.highres_syncs += 1;
                stats.month_resyncs += 1;
                drop(stats);
                info!(month = %local_month.display(), "Previous month resynced");
                self.ctx
                    .log()
                    .log(&format!("resynced {} to {}", local_month.display(), remote_dir))
                    .await;
            } else {
                warn!(month = %local_month.display(), "Month directory missing, skipping resync");
            }
            self.flags.month_resync_done = true;
        }

        Ok(())
    }

    async fn requeue(&mut self, packet: DeliveryPacket) {
        self.queue.put(packet);
        self.stats.write().await.requeued += 1;
    }

    async fn recover(&mut self, packet: DeliveryPacket, class: DeliveryClass, err: RemoteError) {
        self.enter(DispatcherState::ErrorRecovery);
        warn!(error = %err, stamp = %packet.minute_stamp(), "Delivery failed, requeueing");
        self.ctx
            .log()
            .log(&format!("delivery of {} failed: {}", packet.minute_stamp(), err))
            .await;

        let path_missing = matches!(err, RemoteError::PathMissing(_));
        let dirs = self.required_dirs(&packet, class);
        self.requeue(packet).await;

        self.session.mark_failed();
        self.session.teardown().await;
        if path_missing {
            self.flags.dir_checked.remove(&class);
        } else {
            self.probe.reprobe().await;
        }

        let rebuilt = self.session.rebuild(&self.opener, &self.ctx).await;
        self.stats.write().await.session_rebuilds += 1;

        if path_missing && rebuilt {
            if let Some(session) = self.session.ensure(&self.opener, &self.ctx).await {
                let created = provision(&self.provisioner, session, &dirs, &self.ctx).await;
                self.stats.write().await.dirs_created += created;
                self.flags.dir_checked.insert(class);
            }
        }
    }

    /// A transport is listed but no session could be opened.
    async fn server_unavailable(&mut self, transport: ConnectivityState) -> Step {
        self.enter(DispatcherState::ErrorRecovery);
        self.session.teardown().await;
        let reach = self.probe.reprobe().await;

        if !reach.all_down() {
            debug!(%transport, internet = reach.internet, server = reach.server, "Archive server unavailable");
            return Step::Sleep(self.idle_sleep);
        }

        self.enter(DispatcherState::OutageBackoff);
        let start = self.start_outage(&format!("{} link reaches nothing", transport)).await;
        self.check_outage_limit(start).await
    }

    async fn outage_backoff(&mut self, packet: DeliveryPacket) -> Step {
        self.enter(DispatcherState::OutageBackoff);
        let start = self.start_outage("no usable transport").await;

        self.session.teardown().await;
        let reach = self.probe.reprobe().await;
        debug!(localhost = reach.localhost, internet = reach.internet, server = reach.server, "Outage reprobe");
        self.requeue(packet).await;

        self.check_outage_limit(start).await
    }

    /// Start the outage clock unless it is already running.
    async fn start_outage(&mut self, reason: &str) -> Instant {
        if let Some(start) = self.outage_start {
            return start;
        }
        let now = Instant::now();
        self.outage_start = Some(now);
        self.stats.write().await.outage_since = Some(Local::now());
        warn!(reason, "Entering outage backoff");
        self.ctx.log().log(&format!("outage started: {}", reason)).await;
        now
    }

    async fn end_outage(&mut self, transport: ConnectivityState) {
        if let Some(start) = self.outage_start.take() {
            let secs = start.elapsed().as_secs();
            info!(%transport, outage_secs = secs, "Archive server reachable again");
            self.ctx
                .log()
                .log(&format!("session over {} opened after {}s outage", transport, secs))
                .await;
            self.stats.write().await.outage_since = None;
        }
    }

    async fn check_outage_limit(&mut self, start: Instant) -> Step {
        let elapsed = start.elapsed();
        if elapsed < self.outage_reboot_after {
            return Step::Sleep(self.outage_sleep);
        }

        error!(outage_secs = elapsed.as_secs(), "Total outage limit exceeded, forcing reboot");
        self.ctx
            .log()
            .log(&format!("no route out for {}s, forcing reboot", elapsed.as_secs()))
            .await;
        self.stats.write().await.reboot_requested = true;

        match self.system.reboot().await {
            Ok(()) => Step::Exit(DispatcherExit::RebootRequested),
            Err(e) => {
                error!(error = %e, "Reboot request failed");
                self.ctx.log().log(&format!("reboot request failed: {}", e)).await;
                Step::Exit(DispatcherExit::RebootFailed)
            }
        }
    }
}

/// Ensure every directory in `dirs`. Returns how many were created.
async fn provision(
    provisioner: &RemoteDirectoryProvisioner,
    session: &mut RemoteSession,
    dirs: &[String],
    ctx: &UplinkContext,
) -> u64 {
    let mut created = 0;
    for dir in dirs {
        if provisioner.ensure(session, dir, ctx).await == ProvisionOutcome::Created {
            created += 1;
        }
    }
    created
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, d).unwrap()
    }

    #[test]
    fn test_daily_flags_rollover() {
        let mut flags = DailyFlags::default();
        assert!(!flags.observe(day(17)));
        assert_eq!(flags.pending_resync(), None);

        flags.dir_checked.insert(DeliveryClass::Full);
        assert!(!flags.observe(day(17)));
        assert!(flags.dir_checked.contains(&DeliveryClass::Full));

        assert!(flags.observe(day(18)));
        assert!(flags.dir_checked.is_empty());
        assert_eq!(flags.pending_resync(), Some(day(17)));

        flags.month_resync_done = true;
        assert_eq!(flags.pending_resync(), None);
    }

    #[test]
    fn test_requeued_old_packet_does_not_roll_back() {
        let mut flags = DailyFlags::default();
        flags.observe(day(18));
        flags.dir_checked.insert(DeliveryClass::Reduced);

        assert!(!flags.observe(day(17)));
        assert_eq!(flags.day, Some(day(18)));
        assert!(flags.dir_checked.contains(&DeliveryClass::Reduced));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(DispatcherState::OutageBackoff.to_string(), "OUTAGE_BACKOFF");
        assert_eq!(DispatcherState::SelectingTransport.to_string(), "SELECTING_TRANSPORT");
    }
}
