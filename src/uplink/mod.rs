//! Store-and-forward uplink
//!
//! The measurement loop hands packets to [`Uplink::enqueue`] and carries on;
//! a single background dispatcher task drains the queue whenever a
//! transport and the archive server are available.
//!
//! ```text
//! producer ──put──▶ UplinkQueue ──get──▶ UplinkDispatcher ──▶ RemoteSession (sftp put)
//!                        ▲                     │           └─▶ BulkSync (rsync)
//!                        └──── requeue ◀───────┘
//! ```

mod dispatcher;
mod queue;
mod stats;

pub use dispatcher::{DispatcherExit, DispatcherState, UplinkDispatcher};
pub use queue::{QueueError, UplinkQueue};
pub use stats::{StatsHandle, UplinkStats};

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::UplinkConfig;
use crate::connectivity::NetworkAdmin;
use crate::context::UplinkContext;
use crate::remote::{BulkSync, RemoteConnector};
use crate::system::SystemControl;
use crate::types::DeliveryPacket;

/// OS and network capabilities the dispatcher runs against.
#[derive(Clone)]
pub struct UplinkParts {
    pub admin: Arc<dyn NetworkAdmin>,
    pub connector: Arc<dyn RemoteConnector>,
    pub bulk: Arc<dyn BulkSync>,
    pub system: Arc<dyn SystemControl>,
}

/// Handle to a running uplink.
pub struct Uplink {
    queue: Arc<UplinkQueue>,
    stats: StatsHandle,
    cancel: CancellationToken,
    /// Cancelled when the dispatcher task returns, for any reason
    stopped: CancellationToken,
    task: JoinHandle<DispatcherExit>,
}

impl Uplink {
    /// Spawn the dispatcher task.
    pub fn start(config: &UplinkConfig, ctx: UplinkContext, parts: UplinkParts) -> Self {
        let queue = Arc::new(UplinkQueue::new());
        let stats = UplinkStats::handle();
        let cancel = CancellationToken::new();

        let dispatcher = UplinkDispatcher::new(
            config,
            ctx,
            Arc::clone(&queue),
            parts,
            Arc::clone(&stats),
            cancel.clone(),
        );
        let stopped = CancellationToken::new();
        let task = tokio::spawn({
            let stopped = stopped.clone();
            async move {
                let exit = dispatcher.run().await;
                stopped.cancel();
                exit
            }
        });

        Self {
            queue,
            stats,
            cancel,
            stopped,
            task,
        }
    }

    /// Hand a packet to the uplink. Never blocks.
    ///
    /// Once the dispatcher has stopped nothing would consume the packet, so
    /// it is dropped with a warning instead of queued.
    pub fn enqueue(&self, packet: DeliveryPacket) {
        if self.stopped.is_cancelled() {
            warn!(stamp = %packet.minute_stamp(), "Dispatcher stopped, packet dropped");
            return;
        }
        self.queue.put(packet);
    }

    /// Packets waiting, not counting the one in flight.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn stats(&self) -> StatsHandle {
        Arc::clone(&self.stats)
    }

    /// Wait until every enqueued packet has been handled, then stop the
    /// dispatcher. Does not return while packets keep failing.
    pub async fn request_shutdown_drain(&self) {
        info!(pending = self.queue.unfinished(), "Draining uplink queue");
        self.queue.join().await;
        self.cancel.cancel();
    }

    /// Stop the dispatcher without draining.
    pub fn abort(&self) {
        if !self.cancel.is_cancelled() {
            warn!(pending = self.queue.unfinished(), "Stopping uplink without drain");
        }
        self.cancel.cancel();
    }

    /// True once the dispatcher task has ended.
    pub fn is_finished(&self) -> bool {
        self.stopped.is_cancelled() || self.task.is_finished()
    }

    /// Resolves once the dispatcher task has ended.
    pub async fn stopped(&self) {
        self.stopped.cancelled().await;
    }

    /// Wait for the dispatcher task to end.
    pub async fn wait(self) -> DispatcherExit {
        match self.task.await {
            Ok(exit) => exit,
            Err(e) => {
                warn!(error = %e, "Dispatcher task ended abnormally");
                DispatcherExit::Shutdown
            }
        }
    }
}
