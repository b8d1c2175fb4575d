//! Work queue with visibility-timeout leases.
//!
//! A delivered message is hidden from other consumers until it is
//! acknowledged or its lease expires, at which point it becomes visible again
//! and is redelivered. This is the only cross-worker coordination primitive:
//! no distributed lock is taken anywhere else.
//!
//! # Redis layout
//!
//! The Redis implementation uses two keys:
//!
//! - `{queue_name}`: list of visible messages (LPUSH to enqueue, RPOP to fetch)
//! - `{queue_name}:leases`: sorted set of leased messages scored by lease deadline
//!
//! Fetching runs a Lua script that first moves expired leases back to the head
//! of the list, then pops one message, bumps its delivery count and records the
//! lease, all atomically. Lease deadlines use the Redis server clock so worker
//! clock skew cannot shorten a lease.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use super::job::TrialRef;

/// Default visibility timeout. Must exceed the longest trial execution.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to Redis.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    RedisError(#[from] redis::RedisError),

    /// Failed to serialize or parse a message.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// The queue has been closed.
    #[error("Queue {0} is closed")]
    Closed(String),
}

/// A message carrying one trial reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    /// Unique message identifier.
    pub id: Uuid,
    /// Trial this message asks a worker to execute.
    pub trial_ref: TrialRef,
    /// When the message was first published.
    pub enqueued_at: DateTime<Utc>,
    /// Number of times the message has been handed to a consumer.
    pub delivery_count: u32,
}

impl QueueMessage {
    /// Creates a fresh, never-delivered message.
    pub fn new(trial_ref: TrialRef) -> Self {
        Self {
            id: Uuid::new_v4(),
            trial_ref,
            enqueued_at: Utc::now(),
            delivery_count: 0,
        }
    }

    /// Returns whether this delivery is a redelivery.
    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }
}

/// Proof of a delivery, required to acknowledge it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// Message the lease was granted for.
    pub message_id: Uuid,
    /// Backend-specific handle identifying this particular delivery.
    pub(crate) token: String,
    /// Approximate time at which the message becomes visible again.
    pub expires_at: DateTime<Utc>,
}

/// A fetched message together with its lease.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: QueueMessage,
    pub lease: Lease,
}

/// Statistics about queue state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Name of the queue.
    pub queue_name: String,
    /// Messages waiting to be fetched.
    pub visible: usize,
    /// Messages currently leased to a consumer.
    pub in_flight: usize,
}

impl QueueStats {
    /// Returns the total number of messages held by the queue.
    pub fn total(&self) -> usize {
        self.visible + self.in_flight
    }
}

/// Queue contract used by the dispatcher, the worker pool and the scaler.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Publishes one message for a trial.
    async fn enqueue(&self, trial_ref: TrialRef) -> Result<QueueMessage, QueueError>;

    /// Publishes one message per trial, preserving slice order.
    async fn enqueue_batch(&self, refs: &[TrialRef]) -> Result<Vec<QueueMessage>, QueueError> {
        let mut messages = Vec::with_capacity(refs.len());
        for trial_ref in refs {
            messages.push(self.enqueue(*trial_ref).await?);
        }
        Ok(messages)
    }

    /// Waits up to `max_wait` for a visible message and leases it.
    async fn fetch(&self, max_wait: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Deletes a leased message. Returns `false` if the lease had already
    /// expired and the message was handed to someone else.
    async fn ack(&self, lease: &Lease) -> Result<bool, QueueError>;

    /// Number of messages waiting to be fetched.
    async fn depth(&self) -> Result<usize, QueueError>;

    /// Current queue statistics.
    async fn stats(&self) -> Result<QueueStats, QueueError>;

    /// How long a delivered message stays hidden.
    fn visibility_timeout(&self) -> Duration;
}

const FETCH_SCRIPT: &str = r#"
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
local expired = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', now)
for _, member in ipairs(expired) do
    redis.call('ZREM', KEYS[2], member)
    redis.call('RPUSH', KEYS[1], member)
end
local raw = redis.call('RPOP', KEYS[1])
if not raw then
    return false
end
local msg = cjson.decode(raw)
msg['delivery_count'] = (tonumber(msg['delivery_count']) or 0) + 1
local leased = cjson.encode(msg)
redis.call('ZADD', KEYS[2], now + tonumber(ARGV[1]), leased)
return leased
"#;

/// Redis-backed work queue.
pub struct RedisWorkQueue {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    /// Name of the visible list.
    queue_name: String,
    /// Name of the lease sorted set.
    lease_set: String,
    /// How long a delivered message stays hidden.
    visibility_timeout: Duration,
    /// Delay between empty fetch attempts.
    poll_interval: Duration,
    fetch_script: redis::Script,
}

impl RedisWorkQueue {
    /// Connects to Redis and creates a new work queue.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the connection fails.
    pub async fn connect(
        redis_url: &str,
        queue_name: &str,
        visibility_timeout: Duration,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(redis, queue_name, visibility_timeout))
    }

    /// Creates a queue from an existing ConnectionManager.
    pub fn from_connection(
        redis: ConnectionManager,
        queue_name: &str,
        visibility_timeout: Duration,
    ) -> Self {
        Self {
            redis,
            queue_name: queue_name.to_string(),
            lease_set: lease_set_key(queue_name),
            visibility_timeout,
            poll_interval: Duration::from_secs(1),
            fetch_script: redis::Script::new(FETCH_SCRIPT),
        }
    }

    /// Sets the delay between empty fetch attempts.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Returns the queue name.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    async fn try_fetch(&self) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.redis.clone();
        let leased: Option<String> = self
            .fetch_script
            .key(&self.queue_name)
            .key(&self.lease_set)
            .arg(self.visibility_timeout.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;

        match leased {
            Some(raw) => {
                let message: QueueMessage = serde_json::from_str(&raw)?;
                let lease = Lease {
                    message_id: message.id,
                    token: raw,
                    expires_at: lease_deadline(self.visibility_timeout),
                };
                Ok(Some(Delivery { message, lease }))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl WorkQueue for RedisWorkQueue {
    async fn enqueue(&self, trial_ref: TrialRef) -> Result<QueueMessage, QueueError> {
        let message = QueueMessage::new(trial_ref);
        let serialized = serde_json::to_string(&message)?;
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(&self.queue_name, serialized).await?;
        Ok(message)
    }

    async fn enqueue_batch(&self, refs: &[TrialRef]) -> Result<Vec<QueueMessage>, QueueError> {
        if refs.is_empty() {
            return Ok(Vec::new());
        }

        let messages: Vec<QueueMessage> = refs.iter().copied().map(QueueMessage::new).collect();
        let serialized: Result<Vec<String>, _> =
            messages.iter().map(serde_json::to_string).collect();
        let serialized = serialized?;

        let mut conn = self.redis.clone();

        // Pipelined LPUSHes keep trial-number order at the consuming end.
        let mut pipe = redis::pipe();
        for data in &serialized {
            pipe.lpush(&self.queue_name, data);
        }
        pipe.query_async::<_, ()>(&mut conn).await?;

        Ok(messages)
    }

    async fn fetch(&self, max_wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            if let Some(delivery) = self.try_fetch().await? {
                return Ok(Some(delivery));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                debug!(queue = %self.queue_name, "No messages available");
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn ack(&self, lease: &Lease) -> Result<bool, QueueError> {
        let mut conn = self.redis.clone();
        let removed: usize = conn.zrem(&self.lease_set, &lease.token).await?;
        Ok(removed > 0)
    }

    async fn depth(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(&self.queue_name).await?;
        Ok(len)
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut conn = self.redis.clone();
        let (visible, in_flight): (usize, usize) = redis::pipe()
            .llen(&self.queue_name)
            .zcard(&self.lease_set)
            .query_async(&mut conn)
            .await?;

        Ok(QueueStats {
            queue_name: self.queue_name.clone(),
            visible,
            in_flight,
        })
    }

    fn visibility_timeout(&self) -> Duration {
        self.visibility_timeout
    }
}

/// Name of the lease sorted set for a queue.
fn lease_set_key(queue_name: &str) -> String {
    format!("{}:leases", queue_name)
}

/// Approximate wall-clock expiry of a lease granted now.
pub(crate) fn lease_deadline(visibility_timeout: Duration) -> DateTime<Utc> {
    let ttl = chrono::Duration::from_std(visibility_timeout)
        .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
    Utc::now()
        .checked_add_signed(ttl)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_error_display() {
        let err = QueueError::ConnectionFailed("timeout".to_string());
        assert!(err.to_string().contains("timeout"));

        let err = QueueError::Closed("trials".to_string());
        assert!(err.to_string().contains("closed"));
    }

    #[test]
    fn test_queue_stats_total() {
        let stats = QueueStats {
            queue_name: "trials".to_string(),
            visible: 10,
            in_flight: 5,
        };

        assert_eq!(stats.total(), 15);
    }

    #[test]
    fn test_lease_set_key() {
        assert_eq!(lease_set_key("trials"), "trials:leases");
    }

    #[test]
    fn test_message_parses_after_lua_reencoding() {
        // cjson escapes forward slashes and reorders keys; serde must accept both.
        let message = QueueMessage::new(TrialRef::new(Uuid::new_v4(), 4));
        let reencoded = format!(
            r#"{{"delivery_count":2,"trial_ref":{{"trial_number":4,"job_id":"{}"}},"enqueued_at":"{}","id":"{}"}}"#,
            message.trial_ref.job_id,
            message.enqueued_at.to_rfc3339().replace('/', "\\/"),
            message.id
        );

        let parsed: QueueMessage = serde_json::from_str(&reencoded).expect("should parse");
        assert_eq!(parsed.id, message.id);
        assert_eq!(parsed.trial_ref, message.trial_ref);
        assert_eq!(parsed.delivery_count, 2);
        assert!(parsed.is_redelivery());
    }

    #[test]
    fn test_lease_deadline_is_in_the_future() {
        let deadline = lease_deadline(Duration::from_secs(60));
        assert!(deadline > Utc::now());
        assert!(lease_deadline(Duration::MAX) > Utc::now());
    }
}
