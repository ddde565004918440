use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Notify;

use crate::error::TransportError;
use crate::transport::{
    Delivery, ProduceRecord, Subscription, Transport, TransportMessage, TransportOptions,
};

struct TopicLog {
    partitions: Vec<Vec<TransportMessage>>,
    /// msg_id -> first delivery, for idempotent publish
    delivered: HashMap<String, (Delivery, Instant)>,
    /// Insertion order of `delivered`, oldest first
    expiries: VecDeque<(Instant, String)>,
}

impl TopicLog {
    fn new(partitions: u32) -> Self {
        Self {
            partitions: (0..partitions).map(|_| Vec::new()).collect(),
            delivered: HashMap::new(),
            expiries: VecDeque::new(),
        }
    }

    /// Forget msg_ids whose duplicate window has passed
    fn prune_delivered(&mut self, window: Duration) {
        while let Some((at, _)) = self.expiries.front() {
            if at.elapsed() < window {
                break;
            }
            if let Some((at, msg_id)) = self.expiries.pop_front() {
                // A msg_id re-published after expiry has a newer entry
                if self.delivered.get(&msg_id).is_some_and(|(_, seen)| *seen == at) {
                    self.delivered.remove(&msg_id);
                }
            }
        }
    }

    fn remember(&mut self, msg_id: String, delivery: Delivery) {
        let now = Instant::now();
        self.expiries.push_back((now, msg_id.clone()));
        self.delivered.insert(msg_id, (delivery, now));
    }

    fn partition_count(&self) -> u32 {
        self.partitions.len() as u32
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CommitKey {
    group: String,
    topic: String,
    partition: u32,
}

struct Shared {
    options: TransportOptions,
    topics: DashMap<String, TopicLog>,
    /// Next offset to read per (group, topic, partition)
    commits: DashMap<CommitKey, u64>,
    appended: Notify,
}

/// In-process partitioned log.
///
/// Commits are shared by every subscription of the same group, so dropping a
/// subscription and subscribing again behaves like a consumer restart.
#[derive(Clone)]
pub struct InMemoryTransport {
    shared: Arc<Shared>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::with_options(TransportOptions::default())
    }

    pub fn with_options(options: TransportOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                options,
                topics: DashMap::new(),
                commits: DashMap::new(),
                appended: Notify::new(),
            }),
        }
    }

    /// Snapshot of every record appended to a partition
    pub fn records(&self, topic: &str, partition: u32) -> Vec<TransportMessage> {
        self.shared
            .topics
            .get(topic)
            .and_then(|log| log.partitions.get(partition as usize).cloned())
            .unwrap_or_default()
    }

    /// Committed position (next offset to read) of a group on a partition
    pub fn committed(&self, group: &str, topic: &str, partition: u32) -> Option<u64> {
        self.shared
            .commits
            .get(&CommitKey {
                group: group.to_string(),
                topic: topic.to_string(),
                partition,
            })
            .map(|offset| *offset)
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

struct InMemorySubscription {
    shared: Arc<Shared>,
    group: String,
    topic: String,
    partitions: Vec<u32>,
    /// Next offset to deliver per partition
    positions: HashMap<u32, u64>,
    cursor: usize,
}

impl InMemorySubscription {
    fn try_next(&mut self) -> Result<Option<TransportMessage>, TransportError> {
        let log = self
            .shared
            .topics
            .get(&self.topic)
            .ok_or_else(|| TransportError::UnknownTopic(self.topic.clone()))?;

        let count = self.partitions.len();
        for step in 0..count {
            let idx = (self.cursor + step) % count;
            let partition = self.partitions[idx];
            let position = self.positions.get(&partition).copied().unwrap_or(0);

            if let Some(msg) = log.partitions[partition as usize].get(position as usize) {
                self.positions.insert(partition, position + 1);
                // Rotate so a busy partition cannot starve the others
                self.cursor = idx + 1;
                return Ok(Some(msg.clone()));
            }
        }
        Ok(None)
    }

    fn commit_key(&self, partition: u32) -> CommitKey {
        CommitKey {
            group: self.group.clone(),
            topic: self.topic.clone(),
            partition,
        }
    }
}

#[async_trait]
impl Subscription for InMemorySubscription {
    async fn next(&mut self, timeout: Duration) -> Result<Option<TransportMessage>, TransportError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let shared = Arc::clone(&self.shared);
        loop {
            // Register interest before checking so an append in between is not missed
            let appended = shared.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            if let Some(msg) = self.try_next()? {
                return Ok(Some(msg));
            }
            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn commit(&mut self, message: &TransportMessage) -> Result<(), TransportError> {
        if !self.partitions.contains(&message.partition) {
            return Err(TransportError::CommitFailed(format!(
                "partition {} not assigned to this subscription",
                message.partition
            )));
        }
        let next = message.offset + 1;
        self.shared
            .commits
            .entry(self.commit_key(message.partition))
            .and_modify(|committed| *committed = (*committed).max(next))
            .or_insert(next);
        Ok(())
    }

    async fn rollback(&mut self, message: &TransportMessage) -> Result<(), TransportError> {
        let position = self.positions.entry(message.partition).or_insert(0);
        *position = (*position).min(message.offset);
        Ok(())
    }

    async fn discard(&mut self, message: &TransportMessage) -> Result<(), TransportError> {
        // Offsets are positional, so skipping a record means moving the checkpoint past it
        self.commit(message).await
    }

    async fn unsubscribe(self: Box<Self>) -> Result<(), TransportError> {
        Ok(())
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn create_topic(&self, topic: &str, partitions: u32) -> Result<(), TransportError> {
        if partitions == 0 {
            return Err(TransportError::InvalidPartition {
                topic: topic.to_string(),
                partition: 0,
                count: 0,
            });
        }
        let log = self
            .shared
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicLog::new(partitions));
        let existing = log.partition_count();
        if existing != partitions {
            return Err(TransportError::PartitionMismatch {
                topic: topic.to_string(),
                existing,
                requested: partitions,
            });
        }
        Ok(())
    }

    async fn partitions(&self, topic: &str) -> Result<u32, TransportError> {
        self.shared
            .topics
            .get(topic)
            .map(|log| log.partition_count())
            .ok_or_else(|| TransportError::UnknownTopic(topic.to_string()))
    }

    async fn publish(&self, record: ProduceRecord) -> Result<Delivery, TransportError> {
        let delivery = {
            let mut log = self
                .shared
                .topics
                .get_mut(&record.topic)
                .ok_or_else(|| TransportError::UnknownTopic(record.topic.clone()))?;

            let count = log.partition_count();
            if record.partition >= count {
                return Err(TransportError::InvalidPartition {
                    topic: record.topic.clone(),
                    partition: record.partition,
                    count,
                });
            }

            let options = self.shared.options;
            if options.idempotent {
                log.prune_delivered(options.duplicate_window);
                if let Some(msg_id) = &record.msg_id {
                    if let Some((first, at)) = log.delivered.get(msg_id) {
                        if at.elapsed() < options.duplicate_window {
                            return Ok(Delivery {
                                duplicate: true,
                                ..first.clone()
                            });
                        }
                    }
                }
            }

            let partition = &mut log.partitions[record.partition as usize];
            let offset = partition.len() as u64;
            partition.push(TransportMessage {
                topic: record.topic.clone(),
                partition: record.partition,
                offset,
                key: record.key,
                payload: record.payload,
                timestamp: Utc::now(),
            });

            let delivery = Delivery {
                topic: record.topic,
                partition: record.partition,
                offset,
                duplicate: false,
            };
            if options.idempotent {
                if let Some(msg_id) = record.msg_id {
                    log.remember(msg_id, delivery.clone());
                }
            }
            delivery
        };

        self.shared.appended.notify_waiters();
        Ok(delivery)
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        partitions: &[u32],
    ) -> Result<Box<dyn Subscription>, TransportError> {
        let count = self.partitions(topic).await?;
        let partitions: Vec<u32> = if partitions.is_empty() {
            (0..count).collect()
        } else {
            partitions.to_vec()
        };
        if let Some(&partition) = partitions.iter().find(|&&p| p >= count) {
            return Err(TransportError::InvalidPartition {
                topic: topic.to_string(),
                partition,
                count,
            });
        }

        let mut subscription = InMemorySubscription {
            shared: Arc::clone(&self.shared),
            group: group.to_string(),
            topic: topic.to_string(),
            partitions: partitions.clone(),
            positions: HashMap::new(),
            cursor: 0,
        };
        for partition in partitions {
            let start = self.committed(group, topic, partition).unwrap_or(0);
            subscription.positions.insert(partition, start);
        }
        Ok(Box::new(subscription))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    const WAIT: Duration = Duration::from_millis(50);

    async fn transport_with_topic(partitions: u32) -> InMemoryTransport {
        let transport = InMemoryTransport::new();
        transport.create_topic("trades", partitions).await.unwrap();
        transport
    }

    fn record(partition: u32, payload: &'static str) -> ProduceRecord {
        ProduceRecord::new("trades", partition, Bytes::from(payload))
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let transport = transport_with_topic(1).await;
        let mut sub = transport.subscribe("trades", "csv-writer", &[]).await.unwrap();

        let delivery = transport.publish(record(0, "hello")).await.unwrap();
        assert_eq!(delivery.offset, 0);

        let msg = sub.next(WAIT).await.unwrap().unwrap();
        assert_eq!(msg.topic, "trades");
        assert_eq!(msg.payload, Bytes::from("hello"));
    }

    #[tokio::test]
    async fn test_offsets_are_per_partition() {
        let transport = transport_with_topic(2).await;
        assert_eq!(transport.publish(record(0, "a")).await.unwrap().offset, 0);
        assert_eq!(transport.publish(record(1, "b")).await.unwrap().offset, 0);
        assert_eq!(transport.publish(record(0, "c")).await.unwrap().offset, 1);
    }

    #[tokio::test]
    async fn test_publish_rejects_unknown_topic_and_partition() {
        let transport = transport_with_topic(2).await;

        let err = transport
            .publish(ProduceRecord::new("quotes", 0, Bytes::from("x")))
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::UnknownTopic("quotes".to_string()));

        let err = transport.publish(record(2, "x")).await.unwrap_err();
        assert!(matches!(err, TransportError::InvalidPartition { partition: 2, count: 2, .. }));
    }

    #[tokio::test]
    async fn test_idempotent_publish_deduplicates_msg_id() {
        let transport = transport_with_topic(1).await;

        let first = transport.publish(record(0, "a").with_msg_id("t-1")).await.unwrap();
        let retry = transport.publish(record(0, "a").with_msg_id("t-1")).await.unwrap();

        assert!(!first.duplicate);
        assert!(retry.duplicate);
        assert_eq!(retry.offset, first.offset);
        assert_eq!(transport.records("trades", 0).len(), 1);
    }

    #[tokio::test]
    async fn test_non_idempotent_publish_appends_retries() {
        let transport = InMemoryTransport::with_options(TransportOptions {
            idempotent: false,
            ..TransportOptions::default()
        });
        transport.create_topic("trades", 1).await.unwrap();

        transport.publish(record(0, "a").with_msg_id("t-1")).await.unwrap();
        transport.publish(record(0, "a").with_msg_id("t-1")).await.unwrap();

        assert_eq!(transport.records("trades", 0).len(), 2);
    }

    #[tokio::test]
    async fn test_next_times_out_with_none() {
        let transport = transport_with_topic(1).await;
        let mut sub = transport.subscribe("trades", "csv-writer", &[]).await.unwrap();
        assert!(sub.next(WAIT).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_next_wakes_on_publish() {
        let transport = transport_with_topic(1).await;
        let mut sub = transport.subscribe("trades", "csv-writer", &[]).await.unwrap();

        let publisher = transport.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish(record(0, "late")).await.unwrap();
        });

        let msg = sub.next(Duration::from_secs(2)).await.unwrap().unwrap();
        assert_eq!(msg.payload, Bytes::from("late"));
    }

    #[tokio::test]
    async fn test_subscription_only_reads_assigned_partitions() {
        let transport = transport_with_topic(3).await;
        transport.publish(record(0, "p0")).await.unwrap();
        transport.publish(record(2, "p2")).await.unwrap();

        let mut sub = transport.subscribe("trades", "csv-writer", &[2]).await.unwrap();
        let msg = sub.next(WAIT).await.unwrap().unwrap();
        assert_eq!(msg.partition, 2);
        assert!(sub.next(WAIT).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_restart_resumes_from_committed_offset() {
        let transport = transport_with_topic(1).await;
        for payload in ["a", "b", "c"] {
            transport.publish(record(0, payload)).await.unwrap();
        }

        let mut sub = transport.subscribe("trades", "csv-writer", &[]).await.unwrap();
        let first = sub.next(WAIT).await.unwrap().unwrap();
        sub.commit(&first).await.unwrap();
        let second = sub.next(WAIT).await.unwrap().unwrap();
        assert_eq!(second.offset, 1);
        // Crash before committing the second record
        drop(sub);

        let mut sub = transport.subscribe("trades", "csv-writer", &[]).await.unwrap();
        let redelivered = sub.next(WAIT).await.unwrap().unwrap();
        assert_eq!(redelivered.offset, 1);
        assert_eq!(redelivered.payload, Bytes::from("b"));
    }

    #[tokio::test]
    async fn test_commit_is_monotonic() {
        let transport = transport_with_topic(1).await;
        transport.publish(record(0, "a")).await.unwrap();
        transport.publish(record(0, "b")).await.unwrap();

        let mut sub = transport.subscribe("trades", "csv-writer", &[]).await.unwrap();
        let a = sub.next(WAIT).await.unwrap().unwrap();
        let b = sub.next(WAIT).await.unwrap().unwrap();
        sub.commit(&b).await.unwrap();
        sub.commit(&a).await.unwrap();

        assert_eq!(transport.committed("csv-writer", "trades", 0), Some(2));
    }

    #[tokio::test]
    async fn test_rollback_redelivers_on_next_poll() {
        let transport = transport_with_topic(1).await;
        transport.publish(record(0, "a")).await.unwrap();

        let mut sub = transport.subscribe("trades", "csv-writer", &[]).await.unwrap();
        let msg = sub.next(WAIT).await.unwrap().unwrap();
        sub.rollback(&msg).await.unwrap();

        let again = sub.next(WAIT).await.unwrap().unwrap();
        assert_eq!(again.offset, msg.offset);
        assert_eq!(transport.committed("csv-writer", "trades", 0), None);
    }

    #[tokio::test]
    async fn test_groups_track_commits_independently() {
        let transport = transport_with_topic(1).await;
        transport.publish(record(0, "a")).await.unwrap();

        let mut archiver = transport.subscribe("trades", "csv-writer", &[]).await.unwrap();
        let msg = archiver.next(WAIT).await.unwrap().unwrap();
        archiver.commit(&msg).await.unwrap();

        let mut audit = transport.subscribe("trades", "audit", &[]).await.unwrap();
        assert!(audit.next(WAIT).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expired_msg_ids_are_pruned() {
        let transport = InMemoryTransport::with_options(TransportOptions {
            idempotent: true,
            duplicate_window: Duration::from_millis(30),
        });
        transport.create_topic("trades", 1).await.unwrap();

        transport.publish(record(0, "a").with_msg_id("t-1")).await.unwrap();
        transport.publish(record(0, "b").with_msg_id("t-2")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        let late = transport.publish(record(0, "c").with_msg_id("t-3")).await.unwrap();
        assert!(!late.duplicate);
        {
            let log = transport.shared.topics.get("trades").unwrap();
            assert_eq!(log.delivered.len(), 1);
            assert_eq!(log.expiries.len(), 1);
            assert!(log.delivered.contains_key("t-3"));
        }

        // Past the window a retry is a new record
        let again = transport.publish(record(0, "a").with_msg_id("t-1")).await.unwrap();
        assert!(!again.duplicate);
        assert_eq!(transport.records("trades", 0).len(), 4);
    }

    #[tokio::test]
    async fn test_republished_msg_id_survives_pruning_of_old_entry() {
        let transport = InMemoryTransport::with_options(TransportOptions {
            idempotent: true,
            duplicate_window: Duration::from_millis(30),
        });
        transport.create_topic("trades", 1).await.unwrap();

        transport.publish(record(0, "a").with_msg_id("t-1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        // Prunes the stale t-1 entry, then records the new one
        transport.publish(record(0, "a").with_msg_id("t-1")).await.unwrap();

        let retry = transport.publish(record(0, "a").with_msg_id("t-1")).await.unwrap();
        assert!(retry.duplicate);
        assert_eq!(retry.offset, 1);
    }

    #[tokio::test]
    async fn test_create_topic_is_idempotent_for_same_count() {
        let transport = transport_with_topic(3).await;
        transport.create_topic("trades", 3).await.unwrap();
        assert_eq!(transport.partitions("trades").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_create_topic_rejects_different_count() {
        let transport = transport_with_topic(3).await;
        let err = transport.create_topic("trades", 5).await.unwrap_err();
        assert_eq!(
            err,
            TransportError::PartitionMismatch {
                topic: "trades".to_string(),
                existing: 3,
                requested: 5,
            }
        );
        assert_eq!(transport.partitions("trades").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_discarded_record_is_not_redelivered_after_restart() {
        let transport = transport_with_topic(1).await;
        transport.publish(record(0, "garbage")).await.unwrap();
        transport.publish(record(0, "b")).await.unwrap();

        let mut sub = transport.subscribe("trades", "csv-writer", &[]).await.unwrap();
        let poison = sub.next(WAIT).await.unwrap().unwrap();
        sub.discard(&poison).await.unwrap();
        drop(sub);
        assert_eq!(transport.committed("csv-writer", "trades", 0), Some(1));

        let mut sub = transport.subscribe("trades", "csv-writer", &[]).await.unwrap();
        let next = sub.next(WAIT).await.unwrap().unwrap();
        assert_eq!(next.offset, 1);
        assert_eq!(next.payload, Bytes::from("b"));
    }

    #[tokio::test]
    async fn test_subscribe_rejects_out_of_range_partition() {
        let transport = transport_with_topic(2).await;
        let result = transport.subscribe("trades", "csv-writer", &[5]).await;
        assert!(matches!(result, Err(TransportError::InvalidPartition { partition: 5, .. })));
    }
}
