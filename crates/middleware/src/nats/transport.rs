use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::consumer::{pull, AckPolicy, DeliverPolicy};
use async_nats::jetstream::stream::{Config, RetentionPolicy, StorageType};
use async_nats::jetstream::{self, AckKind, Context};
use async_nats::HeaderMap;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::StreamExt;
use tracing::{debug, info, warn};

use super::subjects::{sanitize_subject_token, PartitionSubjects};
use crate::error::TransportError;
use crate::transport::{
    Delivery, ProduceRecord, Subscription, Transport, TransportMessage, TransportOptions,
};

/// JetStream de-duplication header
const MSG_ID_HEADER: &str = "Nats-Msg-Id";
/// Partition key travels as a header; JetStream has no native record key
const KEY_HEADER: &str = "Stockflow-Key";

/// JetStream pull-consumer subscription
struct NatsSubscription {
    topic: String,
    messages: pull::Stream,
    /// Delivered but not yet acked/nacked, by (partition, stream sequence)
    pending: HashMap<(u32, u64), jetstream::Message>,
}

impl NatsSubscription {
    fn take_pending(&mut self, message: &TransportMessage) -> Result<jetstream::Message, TransportError> {
        self.pending
            .remove(&(message.partition, message.offset))
            .ok_or_else(|| {
                TransportError::CommitFailed(format!(
                    "no pending message at partition {} offset {}",
                    message.partition, message.offset
                ))
            })
    }
}

#[async_trait]
impl Subscription for NatsSubscription {
    async fn next(&mut self, timeout: Duration) -> Result<Option<TransportMessage>, TransportError> {
        let msg = match tokio::time::timeout(timeout, self.messages.next()).await {
            Err(_) => return Ok(None),
            Ok(None) => {
                return Err(TransportError::ConsumeFailed(
                    "consumer stream closed".to_string(),
                ))
            }
            Ok(Some(Err(e))) => return Err(TransportError::ConsumeFailed(e.to_string())),
            Ok(Some(Ok(msg))) => msg,
        };

        let partition = PartitionSubjects::parse_partition(msg.subject.as_str()).ok_or_else(|| {
            TransportError::ConsumeFailed(format!("unexpected subject: {}", msg.subject))
        })?;
        let (offset, timestamp) = match msg.info() {
            Ok(info) => (
                info.stream_sequence,
                DateTime::<Utc>::from_timestamp(
                    info.published.unix_timestamp(),
                    info.published.nanosecond(),
                )
                .unwrap_or_else(Utc::now),
            ),
            Err(e) => return Err(TransportError::ConsumeFailed(e.to_string())),
        };
        let key = msg
            .headers
            .as_ref()
            .and_then(|h| h.get(KEY_HEADER))
            .map(|v| Bytes::copy_from_slice(v.as_str().as_bytes()));

        let received = TransportMessage {
            topic: self.topic.clone(),
            partition,
            offset,
            key,
            payload: msg.payload.clone(),
            timestamp,
        };
        self.pending.insert((partition, offset), msg);
        Ok(Some(received))
    }

    async fn commit(&mut self, message: &TransportMessage) -> Result<(), TransportError> {
        let msg = self.take_pending(message)?;
        msg.ack()
            .await
            .map_err(|e| TransportError::CommitFailed(e.to_string()))
    }

    async fn rollback(&mut self, message: &TransportMessage) -> Result<(), TransportError> {
        let msg = self.take_pending(message)?;
        msg.ack_with(AckKind::Nak(None))
            .await
            .map_err(|e| TransportError::CommitFailed(e.to_string()))
    }

    async fn discard(&mut self, message: &TransportMessage) -> Result<(), TransportError> {
        let msg = self.take_pending(message)?;
        msg.ack_with(AckKind::Term)
            .await
            .map_err(|e| TransportError::CommitFailed(e.to_string()))
    }

    async fn unsubscribe(mut self: Box<Self>) -> Result<(), TransportError> {
        // Unacked messages are redelivered by the server after ack_wait
        for ((partition, offset), msg) in self.pending.drain() {
            if let Err(e) = msg.ack_with(AckKind::Nak(None)).await {
                warn!(partition, offset, error = %e, "Failed to nak pending message on close");
            }
        }
        Ok(())
    }
}

/// NATS JetStream transport: one stream per topic, one subject per partition
pub struct NatsTransport {
    jetstream: Context,
    options: TransportOptions,
    layouts: DashMap<String, Arc<PartitionSubjects>>,
}

impl NatsTransport {
    /// Create a new NatsTransport from an existing client
    pub fn new(client: async_nats::Client, options: TransportOptions) -> Self {
        Self {
            jetstream: jetstream::new(client),
            options,
            layouts: DashMap::new(),
        }
    }

    /// Connect to NATS server and create transport
    pub async fn connect(url: &str, options: TransportOptions) -> Result<Self, TransportError> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        info!(url, idempotent = options.idempotent, "Connected to NATS");
        Ok(Self::new(client, options))
    }

    async fn layout(&self, topic: &str) -> Result<Arc<PartitionSubjects>, TransportError> {
        if let Some(layout) = self.layouts.get(topic) {
            return Ok(Arc::clone(layout.value()));
        }

        let lookup = PartitionSubjects::new(topic, 0);
        let stream = self
            .jetstream
            .get_stream(lookup.stream_name())
            .await
            .map_err(|_| TransportError::UnknownTopic(topic.to_string()))?;
        let partitions = stream.cached_info().config.subjects.len() as u32;

        let layout = Arc::new(PartitionSubjects::new(topic, partitions));
        self.layouts.insert(topic.to_string(), Arc::clone(&layout));
        Ok(layout)
    }
}

#[async_trait]
impl Transport for NatsTransport {
    async fn create_topic(&self, topic: &str, partitions: u32) -> Result<(), TransportError> {
        let layout = PartitionSubjects::new(topic, partitions);
        let subjects = (0..partitions)
            .filter_map(|p| layout.partition(p))
            .map(|s| s.to_string())
            .collect();

        let config = Config {
            name: layout.stream_name().to_string(),
            subjects,
            retention: RetentionPolicy::Limits,
            storage: StorageType::File,
            duplicate_window: self.options.duplicate_window,
            max_age: Duration::from_secs(7 * 24 * 60 * 60),
            ..Default::default()
        };

        let stream = self
            .jetstream
            .get_or_create_stream(config)
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("stream creation failed: {}", e)))?;

        // An existing stream keeps its subjects; cache what the server has
        let existing = stream.cached_info().config.subjects.len() as u32;
        self.layouts.insert(
            topic.to_string(),
            Arc::new(PartitionSubjects::new(topic, existing)),
        );
        if existing != partitions {
            return Err(TransportError::PartitionMismatch {
                topic: topic.to_string(),
                existing,
                requested: partitions,
            });
        }

        debug!(topic, stream = layout.stream_name(), partitions, "Stream ready");
        Ok(())
    }

    async fn partitions(&self, topic: &str) -> Result<u32, TransportError> {
        Ok(self.layout(topic).await?.partitions())
    }

    async fn publish(&self, record: ProduceRecord) -> Result<Delivery, TransportError> {
        let layout = self.layout(&record.topic).await?;
        let subject = layout
            .partition(record.partition)
            .ok_or_else(|| TransportError::InvalidPartition {
                topic: record.topic.clone(),
                partition: record.partition,
                count: layout.partitions(),
            })?;

        let mut headers = HeaderMap::new();
        if self.options.idempotent {
            if let Some(msg_id) = &record.msg_id {
                headers.insert(MSG_ID_HEADER, msg_id.clone());
            }
        }
        if let Some(key) = &record.key {
            headers.insert(KEY_HEADER, String::from_utf8_lossy(key).into_owned());
        }

        let ack = self
            .jetstream
            .publish_with_headers(subject.to_string(), headers, record.payload)
            .await
            .map_err(|e| TransportError::PublishFailed(e.to_string()))?
            .await
            .map_err(|e| TransportError::PublishFailed(e.to_string()))?;

        Ok(Delivery {
            topic: record.topic,
            partition: record.partition,
            offset: ack.sequence,
            duplicate: ack.duplicate,
        })
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        partitions: &[u32],
    ) -> Result<Box<dyn Subscription>, TransportError> {
        let layout = self.layout(topic).await?;
        let selected: Vec<u32> = if partitions.is_empty() {
            (0..layout.partitions()).collect()
        } else {
            partitions.to_vec()
        };

        let mut filter_subjects = Vec::with_capacity(selected.len());
        for partition in selected {
            let subject = layout
                .partition(partition)
                .ok_or_else(|| TransportError::InvalidPartition {
                    topic: topic.to_string(),
                    partition,
                    count: layout.partitions(),
                })?;
            filter_subjects.push(subject.to_string());
        }

        let durable = sanitize_subject_token(group);
        let consumer = self
            .jetstream
            .get_stream(layout.stream_name())
            .await
            .map_err(|e| TransportError::SubscribeFailed(format!("stream not found: {}", e)))?
            .get_or_create_consumer(
                &durable,
                pull::Config {
                    durable_name: Some(durable.clone()),
                    filter_subjects,
                    ack_policy: AckPolicy::Explicit,
                    deliver_policy: DeliverPolicy::All,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| TransportError::SubscribeFailed(e.to_string()))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| TransportError::SubscribeFailed(e.to_string()))?;

        info!(topic, group, stream = layout.stream_name(), "Subscribed to JetStream consumer");

        Ok(Box::new(NatsSubscription {
            topic: topic.to_string(),
            messages,
            pending: HashMap::new(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Note: These tests require a running NATS server with JetStream
    // Run: docker run -p 4222:4222 nats:latest -js

    #[tokio::test]
    #[ignore] // Requires NATS server with JetStream
    async fn test_create_topic_and_partitions() {
        let transport = NatsTransport::connect("nats://localhost:4222", TransportOptions::default())
            .await
            .unwrap();
        transport.create_topic("stockflow-test", 3).await.unwrap();
        assert_eq!(transport.partitions("stockflow-test").await.unwrap(), 3);
    }

    #[tokio::test]
    #[ignore] // Requires NATS server with JetStream
    async fn test_create_topic_rejects_different_count() {
        let transport = NatsTransport::connect("nats://localhost:4222", TransportOptions::default())
            .await
            .unwrap();
        transport.create_topic("stockflow-layout", 3).await.unwrap();

        let err = transport.create_topic("stockflow-layout", 5).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::PartitionMismatch { existing: 3, requested: 5, .. }
        ));
        assert_eq!(transport.partitions("stockflow-layout").await.unwrap(), 3);
    }

    #[tokio::test]
    #[ignore] // Requires NATS server with JetStream
    async fn test_idempotent_publish() {
        let transport = NatsTransport::connect("nats://localhost:4222", TransportOptions::default())
            .await
            .unwrap();
        transport.create_topic("stockflow-dedupe", 1).await.unwrap();

        let record = ProduceRecord::new("stockflow-dedupe", 0, Bytes::from("x"))
            .with_key("AAPL")
            .with_msg_id(format!("dedupe-{}", Utc::now().timestamp_nanos_opt().unwrap_or(0)));
        let first = transport.publish(record.clone()).await.unwrap();
        let retry = transport.publish(record).await.unwrap();

        assert!(!first.duplicate);
        assert!(retry.duplicate);
        assert_eq!(first.offset, retry.offset);
    }

    #[tokio::test]
    #[ignore] // Requires NATS server with JetStream
    async fn test_publish_consume_commit() {
        let transport = NatsTransport::connect("nats://localhost:4222", TransportOptions::default())
            .await
            .unwrap();
        transport.create_topic("stockflow-roundtrip", 2).await.unwrap();
        transport
            .publish(ProduceRecord::new("stockflow-roundtrip", 1, Bytes::from("hello")).with_key("MSFT"))
            .await
            .unwrap();

        let mut sub = transport
            .subscribe("stockflow-roundtrip", "roundtrip-test", &[1])
            .await
            .unwrap();
        let msg = sub.next(Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(msg.partition, 1);
        assert_eq!(msg.key, Some(Bytes::from("MSFT")));
        sub.commit(&msg).await.unwrap();
        sub.unsubscribe().await.unwrap();
    }
}
