//! In-process work queue with the same lease semantics as the Redis queue.
//!
//! Used by single-node deployments and by the test suite. Leases are tracked
//! against the tokio clock; an expired lease is moved back to the head of the
//! queue the next time any consumer fetches.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use super::job::TrialRef;
use super::queue::{
    lease_deadline, Delivery, Lease, QueueError, QueueMessage, QueueStats, WorkQueue,
};

struct LeasedMessage {
    message: QueueMessage,
    deadline: Instant,
}

#[derive(Default)]
struct QueueState {
    visible: VecDeque<QueueMessage>,
    leased: HashMap<Uuid, LeasedMessage>,
}

impl QueueState {
    /// Moves every expired lease back to the head of the queue.
    fn reclaim_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<Uuid> = self
            .leased
            .iter()
            .filter(|(_, leased)| leased.deadline <= now)
            .map(|(token, _)| *token)
            .collect();

        for token in &expired {
            if let Some(leased) = self.leased.remove(token) {
                self.visible.push_front(leased.message);
            }
        }
        expired.len()
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.leased.values().map(|leased| leased.deadline).min()
    }
}

/// In-memory work queue.
pub struct MemoryWorkQueue {
    queue_name: String,
    visibility_timeout: Duration,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl MemoryWorkQueue {
    /// Creates an empty queue.
    pub fn new(queue_name: impl Into<String>, visibility_timeout: Duration) -> Self {
        Self {
            queue_name: queue_name.into(),
            visibility_timeout,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    /// Returns the queue name.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Returns the trial references currently waiting, head first.
    pub async fn visible_refs(&self) -> Vec<TrialRef> {
        let state = self.state.lock().await;
        state.visible.iter().map(|m| m.trial_ref).collect()
    }

    async fn try_fetch(&self) -> (Option<Delivery>, Option<Instant>) {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let reclaimed = state.reclaim_expired(now);
        if reclaimed > 0 {
            debug!(queue = %self.queue_name, reclaimed, "Reclaimed expired leases");
        }

        match state.visible.pop_front() {
            Some(mut message) => {
                message.delivery_count += 1;
                let token = Uuid::new_v4();
                let lease = Lease {
                    message_id: message.id,
                    token: token.to_string(),
                    expires_at: lease_deadline(self.visibility_timeout),
                };
                state.leased.insert(
                    token,
                    LeasedMessage {
                        message: message.clone(),
                        deadline: now + self.visibility_timeout,
                    },
                );
                (Some(Delivery { message, lease }), None)
            }
            None => (None, state.next_expiry()),
        }
    }
}

#[async_trait]
impl WorkQueue for MemoryWorkQueue {
    async fn enqueue(&self, trial_ref: TrialRef) -> Result<QueueMessage, QueueError> {
        let message = QueueMessage::new(trial_ref);
        self.state.lock().await.visible.push_back(message.clone());
        self.notify.notify_one();
        Ok(message)
    }

    async fn fetch(&self, max_wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = Instant::now() + max_wait;
        loop {
            let (delivery, next_expiry) = self.try_fetch().await;
            if delivery.is_some() {
                return Ok(delivery);
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }

            // Wake on a new message, the next lease expiry, or the caller's deadline.
            let wake_at = next_expiry.map_or(deadline, |expiry| expiry.min(deadline));
            let _ = tokio::time::timeout_at(wake_at, self.notify.notified()).await;
        }
    }

    async fn ack(&self, lease: &Lease) -> Result<bool, QueueError> {
        let Ok(token) = Uuid::parse_str(&lease.token) else {
            return Ok(false);
        };
        let mut state = self.state.lock().await;
        Ok(state.leased.remove(&token).is_some())
    }

    async fn depth(&self) -> Result<usize, QueueError> {
        Ok(self.state.lock().await.visible.len())
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let state = self.state.lock().await;
        Ok(QueueStats {
            queue_name: self.queue_name.clone(),
            visible: state.visible.len(),
            in_flight: state.leased.len(),
        })
    }

    fn visibility_timeout(&self) -> Duration {
        self.visibility_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trial(n: u32) -> TrialRef {
        TrialRef::new(Uuid::nil(), n)
    }

    #[tokio::test]
    async fn test_fetch_is_fifo() {
        let queue = MemoryWorkQueue::new("trials", Duration::from_secs(60));
        queue
            .enqueue_batch(&[trial(1), trial(2), trial(3)])
            .await
            .unwrap();

        for expected in 1..=3 {
            let delivery = queue
                .fetch(Duration::from_millis(10))
                .await
                .unwrap()
                .expect("message");
            assert_eq!(delivery.message.trial_ref.trial_number, expected);
            assert_eq!(delivery.message.delivery_count, 1);
        }
        assert!(queue.fetch(Duration::from_millis(10)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_leased_message_is_invisible_until_expiry() {
        let queue = MemoryWorkQueue::new("trials", Duration::from_millis(80));
        queue.enqueue(trial(1)).await.unwrap();

        let first = queue.fetch(Duration::from_millis(10)).await.unwrap().unwrap();
        assert!(queue.fetch(Duration::from_millis(10)).await.unwrap().is_none());

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.visible, 0);
        assert_eq!(stats.in_flight, 1);

        let second = queue
            .fetch(Duration::from_millis(500))
            .await
            .unwrap()
            .expect("redelivered after expiry");
        assert_eq!(second.message.id, first.message.id);
        assert_eq!(second.message.delivery_count, 2);

        // The first lease is stale now.
        assert!(!queue.ack(&first.lease).await.unwrap());
        assert!(queue.ack(&second.lease).await.unwrap());
        assert_eq!(queue.stats().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_ack_removes_message() {
        let queue = MemoryWorkQueue::new("trials", Duration::from_millis(50));
        queue.enqueue(trial(1)).await.unwrap();
        let delivery = queue.fetch(Duration::from_millis(10)).await.unwrap().unwrap();
        assert!(queue.ack(&delivery.lease).await.unwrap());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(queue.fetch(Duration::from_millis(10)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fetch_wakes_on_enqueue() {
        let queue = std::sync::Arc::new(MemoryWorkQueue::new("trials", Duration::from_secs(60)));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.fetch(Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue(trial(9)).await.unwrap();

        let delivery = consumer.await.unwrap().unwrap().expect("woken by enqueue");
        assert_eq!(delivery.message.trial_ref.trial_number, 9);
    }
}
