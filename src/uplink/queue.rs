//! Uplink Queue: in-memory FIFO between the measurement loop and the dispatcher
//!
//! `put` never blocks, so the producer's sampling cadence is unaffected by
//! the network. Every `put` must eventually be matched by one `task_done`;
//! `join` waits for that, which is how shutdown drains pending packets.
//! Nothing is persisted: packets still queued at process exit are lost.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::types::DeliveryPacket;

#[derive(Default)]
struct QueueState {
    items: VecDeque<DeliveryPacket>,
    /// Puts not yet matched by a `task_done`
    unfinished: usize,
}

/// Queue errors
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("task_done called more times than items were put")]
    TaskDoneUnderflow,
}

/// Thread-safe packet FIFO with put / get / task_done / join.
#[derive(Default)]
pub struct UplinkQueue {
    state: Mutex<QueueState>,
    item_ready: Notify,
    all_done: Notify,
}

impl UplinkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // Queue state stays consistent across a panicking holder
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a packet at the back.
    pub fn put(&self, packet: DeliveryPacket) {
        let len = {
            let mut state = self.lock();
            state.items.push_back(packet);
            state.unfinished += 1;
            state.items.len()
        };
        debug!(queued = len, "Packet enqueued");
        self.item_ready.notify_one();
    }

    /// Pop the front packet if there is one.
    pub fn try_get(&self) -> Option<DeliveryPacket> {
        self.lock().items.pop_front()
    }

    /// Pop the front packet, waiting until one is available.
    pub async fn get(&self) -> DeliveryPacket {
        loop {
            let notified = self.item_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(packet) = self.try_get() {
                return packet;
            }
            notified.await;
        }
    }

    /// Mark one previously dequeued packet as handled.
    pub fn task_done(&self) -> Result<(), QueueError> {
        let finished = {
            let mut state = self.lock();
            if state.unfinished == 0 {
                warn!("task_done without a matching put");
                return Err(QueueError::TaskDoneUnderflow);
            }
            state.unfinished -= 1;
            state.unfinished == 0
        };
        if finished {
            self.all_done.notify_waiters();
        }
        Ok(())
    }

    /// Wait until every put has been matched by a `task_done`.
    pub async fn join(&self) {
        loop {
            let notified = self.all_done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.lock().unfinished == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    /// Puts not yet acknowledged, including the packet in flight.
    pub fn unfinished(&self) -> usize {
        self.lock().unfinished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LowResSample, SiteMetadata};
    use chrono::{Local, NaiveDate};
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    fn packet(tag: &str) -> DeliveryPacket {
        DeliveryPacket {
            created_at: Local::now(),
            local_high_res_path: PathBuf::from("/data/highres"),
            local_high_res_filename: format!("{}.csv", tag),
            file_day: NaiveDate::from_ymd_opt(2024, 5, 17).unwrap(),
            low_res_batch: vec![LowResSample::default()],
            site: SiteMetadata::default(),
        }
    }

    #[test]
    fn test_fifo_order() {
        let q = UplinkQueue::new();
        q.put(packet("a"));
        q.put(packet("b"));
        assert_eq!(q.len(), 2);
        assert_eq!(q.try_get().unwrap().local_high_res_filename, "a.csv");
        assert_eq!(q.try_get().unwrap().local_high_res_filename, "b.csv");
        assert!(q.try_get().is_none());
        assert!(q.is_empty());
    }

    #[test]
    fn test_task_done_underflow() {
        let q = UplinkQueue::new();
        assert!(matches!(q.task_done(), Err(QueueError::TaskDoneUnderflow)));
    }

    #[tokio::test]
    async fn test_get_waits_for_put() {
        let q = Arc::new(UplinkQueue::new());
        let consumer = tokio::spawn({
            let q = Arc::clone(&q);
            async move { q.get().await }
        });

        tokio::task::yield_now().await;
        q.put(packet("late"));

        let got = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.local_high_res_filename, "late.csv");
    }

    #[tokio::test]
    async fn test_join_waits_for_requeued_packet() {
        let q = Arc::new(UplinkQueue::new());
        q.put(packet("a"));

        // Requeue then acknowledge, as the dispatcher does on failure
        let p = q.try_get().unwrap();
        q.put(p);
        q.task_done().unwrap();
        assert_eq!(q.unfinished(), 1);

        let joiner = tokio::spawn({
            let q = Arc::clone(&q);
            async move { q.join().await }
        });
        tokio::task::yield_now().await;
        assert!(!joiner.is_finished());

        q.try_get().unwrap();
        q.task_done().unwrap();
        tokio::time::timeout(Duration::from_secs(1), joiner)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_put_wakes_pending_get() {
        use tokio_test::{assert_pending, assert_ready, task};

        let q = UplinkQueue::new();
        let mut get = task::spawn(q.get());
        assert_pending!(get.poll());

        q.put(packet("a"));
        assert!(get.is_woken());
        let p = assert_ready!(get.poll());
        assert_eq!(p.local_high_res_filename, "a.csv");
    }

    #[tokio::test]
    async fn test_join_on_empty_queue_returns() {
        UplinkQueue::new().join().await;
    }
}
