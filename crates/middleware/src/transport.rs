use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::error::TransportError;

/// Default window within which a retried `msg_id` is recognised as a duplicate
pub const DEFAULT_DUPLICATE_WINDOW: Duration = Duration::from_secs(120);

/// Client-level delivery options, fixed when the transport is constructed
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransportOptions {
    /// Retried publishes carrying the same `msg_id` are appended at most once
    pub idempotent: bool,
    pub duplicate_window: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            idempotent: true,
            duplicate_window: DEFAULT_DUPLICATE_WINDOW,
        }
    }
}

/// Record to append to a topic partition
#[derive(Debug, Clone)]
pub struct ProduceRecord {
    pub topic: String,
    pub partition: u32,
    pub key: Option<Bytes>,
    pub payload: Bytes,
    /// Idempotency key; only honoured when the transport is idempotent
    pub msg_id: Option<String>,
}

impl ProduceRecord {
    pub fn new(topic: impl Into<String>, partition: u32, payload: Bytes) -> Self {
        Self {
            topic: topic.into(),
            partition,
            key: None,
            payload,
            msg_id: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_msg_id(mut self, msg_id: impl Into<String>) -> Self {
        self.msg_id = Some(msg_id.into());
        self
    }
}

/// Acknowledgment that a record was durably appended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    /// The transport recognised a retried `msg_id` and did not append again
    pub duplicate: bool,
}

/// Record read back from the log
#[derive(Debug, Clone)]
pub struct TransportMessage {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub key: Option<Bytes>,
    pub payload: Bytes,
    /// Time the record was appended
    pub timestamp: DateTime<Utc>,
}

/// Consumer handle bound to a group and a set of partitions
#[async_trait]
pub trait Subscription: Send {
    /// Wait at most `timeout` for the next record. `Ok(None)` when nothing arrived.
    async fn next(&mut self, timeout: Duration) -> Result<Option<TransportMessage>, TransportError>;

    /// Advance the group checkpoint past `message`
    async fn commit(&mut self, message: &TransportMessage) -> Result<(), TransportError>;

    /// Hand `message` back so it is delivered again
    async fn rollback(&mut self, message: &TransportMessage) -> Result<(), TransportError>;

    /// Drop a record that can never be processed; the group does not see it again
    async fn discard(&mut self, message: &TransportMessage) -> Result<(), TransportError>;

    /// Unsubscribe and close
    async fn unsubscribe(self: Box<Self>) -> Result<(), TransportError>;
}

/// Partitioned append-only log
#[async_trait]
pub trait Transport: Send + Sync {
    /// Create a topic with the given partition count if it does not exist.
    /// An existing topic with a different count is a `PartitionMismatch`.
    async fn create_topic(&self, topic: &str, partitions: u32) -> Result<(), TransportError>;

    /// Number of partitions of an existing topic
    async fn partitions(&self, topic: &str) -> Result<u32, TransportError>;

    /// Append a record to its partition and wait for the acknowledgment
    async fn publish(&self, record: ProduceRecord) -> Result<Delivery, TransportError>;

    /// Subscribe `group` to `partitions` of `topic` (all partitions when empty).
    /// Reading resumes from the group's committed offsets.
    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        partitions: &[u32],
    ) -> Result<Box<dyn Subscription>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_produce_record_builder() {
        let record = ProduceRecord::new("trades", 2, Bytes::from(r#"{"price":100}"#))
            .with_key("AAPL")
            .with_msg_id("3f1c");

        assert_eq!(record.topic, "trades");
        assert_eq!(record.partition, 2);
        assert_eq!(record.key, Some(Bytes::from("AAPL")));
        assert_eq!(record.msg_id.as_deref(), Some("3f1c"));
    }

    #[test]
    fn test_default_options_are_idempotent() {
        let options = TransportOptions::default();
        assert!(options.idempotent);
        assert_eq!(options.duplicate_window, DEFAULT_DUPLICATE_WINDOW);
    }
}
