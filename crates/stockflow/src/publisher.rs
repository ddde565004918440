//! Batched publishing of trade events to the log transport
//!
//! Events accumulate in memory until the batch reaches its configured size
//! (or the owner flushes). A flush sends every event of the batch
//! concurrently and waits for all acknowledgments; each event gets exactly
//! one outcome. Publishing never retries; the transport's idempotence makes
//! a caller-level retry of the same event safe.

use std::num::NonZeroU32;
use std::sync::Arc;

use futures_util::future::join_all;
use stockflow_middleware::{Delivery, ProduceRecord, Transport};
use tracing::{debug, info, warn};

use crate::codec::EventCodec;
use crate::error::{PublishError, StockflowError};
use crate::event::TradeEvent;
use crate::metrics::PublisherMetrics;
use crate::partition;

pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Outcome of one event of a flushed batch
#[derive(Debug)]
pub struct DeliveryOutcome {
    pub event: TradeEvent,
    pub partition: u32,
    pub result: Result<Delivery, PublishError>,
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        self.result.is_ok()
    }
}

/// Per-event outcomes of a flush, in enqueue order
#[derive(Debug, Default)]
pub struct BatchResult {
    pub outcomes: Vec<DeliveryOutcome>,
}

impl BatchResult {
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn delivered(&self) -> impl Iterator<Item = &DeliveryOutcome> {
        self.outcomes.iter().filter(|o| o.is_delivered())
    }

    pub fn failed(&self) -> impl Iterator<Item = &DeliveryOutcome> {
        self.outcomes.iter().filter(|o| !o.is_delivered())
    }

    pub fn delivered_count(&self) -> usize {
        self.delivered().count()
    }

    pub fn failed_count(&self) -> usize {
        self.failed().count()
    }
}

pub struct Publisher {
    transport: Arc<dyn Transport>,
    codec: Arc<dyn EventCodec>,
    topic: String,
    partitions: NonZeroU32,
    batch_size: usize,
    batch: Vec<TradeEvent>,
    metrics: PublisherMetrics,
}

impl Publisher {
    pub fn new(
        transport: Arc<dyn Transport>,
        codec: Arc<dyn EventCodec>,
        topic: impl Into<String>,
        partitions: NonZeroU32,
        batch_size: usize,
    ) -> Self {
        let topic = topic.into();
        let batch_size = batch_size.max(1);
        Self {
            transport,
            codec,
            metrics: PublisherMetrics::new(topic.clone()),
            topic,
            partitions,
            batch_size,
            batch: Vec::with_capacity(batch_size),
        }
    }

    /// Create a publisher for an existing topic, reading its partition count
    pub async fn connect(
        transport: Arc<dyn Transport>,
        codec: Arc<dyn EventCodec>,
        topic: &str,
        batch_size: usize,
    ) -> Result<Self, StockflowError> {
        let count = transport.partitions(topic).await?;
        let partitions = NonZeroU32::new(count).ok_or_else(|| {
            StockflowError::Config(format!("topic {} has no partitions", topic))
        })?;
        info!(topic, partitions = count, batch_size, "Publisher ready");
        Ok(Self::new(transport, codec, topic, partitions, batch_size))
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partitions(&self) -> NonZeroU32 {
        self.partitions
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Events waiting for the next flush
    pub fn pending(&self) -> usize {
        self.batch.len()
    }

    /// Add an event to the batch. When this fills the batch it is flushed and
    /// the outcomes are returned.
    pub async fn enqueue(&mut self, event: TradeEvent) -> Option<BatchResult> {
        self.batch.push(event);
        if self.batch.len() >= self.batch_size {
            Some(self.flush().await)
        } else {
            None
        }
    }

    /// Send whatever is batched and wait for every acknowledgment
    pub async fn flush(&mut self) -> BatchResult {
        let batch = std::mem::take(&mut self.batch);
        self.publish_batch(batch).await
    }

    /// Send `events` concurrently; one outcome per event, in input order
    pub async fn publish_batch(&self, events: Vec<TradeEvent>) -> BatchResult {
        if events.is_empty() {
            return BatchResult::default();
        }

        let size = events.len();
        let outcomes = join_all(events.into_iter().map(|event| self.send(event))).await;
        let result = BatchResult { outcomes };

        debug!(
            topic = %self.topic,
            size,
            delivered = result.delivered_count(),
            failed = result.failed_count(),
            "Batch flushed"
        );
        result
    }

    async fn send(&self, event: TradeEvent) -> DeliveryOutcome {
        let partition = partition::assign(event.partition_key(), self.partitions);

        let result = match self.codec.encode(&event) {
            Ok(payload) => {
                let record = ProduceRecord::new(self.topic.as_str(), partition, payload)
                    .with_key(event.partition_key().to_string())
                    .with_msg_id(event.id().to_string());
                self.transport
                    .publish(record)
                    .await
                    .map_err(PublishError::from)
            }
            Err(e) => Err(PublishError::from(e)),
        };

        match &result {
            Ok(delivery) if delivery.duplicate => {
                self.metrics.inc_duplicate();
                debug!(
                    symbol = event.symbol(),
                    partition,
                    offset = delivery.offset,
                    "Duplicate publish recognised by transport"
                );
            }
            Ok(delivery) => {
                self.metrics.inc_delivered();
                info!(
                    symbol = event.symbol(),
                    side = %event.side(),
                    quantity = event.quantity(),
                    price = event.price(),
                    partition,
                    offset = delivery.offset,
                    "Delivered trade"
                );
            }
            Err(e) => {
                self.metrics.inc_failed();
                warn!(
                    symbol = event.symbol(),
                    id = %event.id(),
                    partition,
                    error = %e,
                    "Failed to deliver trade"
                );
            }
        }

        DeliveryOutcome {
            event,
            partition,
            result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::event::Side;
    use async_trait::async_trait;
    use stockflow_middleware::{InMemoryTransport, Subscription, TransportError};

    /// Fails every publish whose key matches `failing_key`
    struct FailingKeyTransport {
        inner: InMemoryTransport,
        failing_key: &'static str,
    }

    #[async_trait]
    impl Transport for FailingKeyTransport {
        async fn create_topic(&self, topic: &str, partitions: u32) -> Result<(), TransportError> {
            self.inner.create_topic(topic, partitions).await
        }

        async fn partitions(&self, topic: &str) -> Result<u32, TransportError> {
            self.inner.partitions(topic).await
        }

        async fn publish(&self, record: ProduceRecord) -> Result<Delivery, TransportError> {
            if record.key.as_deref() == Some(self.failing_key.as_bytes()) {
                return Err(TransportError::PublishFailed("broker unavailable".to_string()));
            }
            self.inner.publish(record).await
        }

        async fn subscribe(
            &self,
            topic: &str,
            group: &str,
            partitions: &[u32],
        ) -> Result<Box<dyn Subscription>, TransportError> {
            self.inner.subscribe(topic, group, partitions).await
        }
    }

    fn trade(symbol: &str) -> TradeEvent {
        TradeEvent::new(symbol, Side::Buy, 1, 10.0, None).unwrap()
    }

    async fn memory_publisher(batch_size: usize) -> (InMemoryTransport, Publisher) {
        let transport = InMemoryTransport::new();
        transport.create_topic("trades", 3).await.unwrap();
        let publisher = Publisher::connect(
            Arc::new(transport.clone()),
            Arc::new(JsonCodec),
            "trades",
            batch_size,
        )
        .await
        .unwrap();
        (transport, publisher)
    }

    #[tokio::test]
    async fn test_enqueue_flushes_when_full() {
        let (transport, mut publisher) = memory_publisher(3).await;

        assert!(publisher.enqueue(trade("AAPL")).await.is_none());
        assert!(publisher.enqueue(trade("MSFT")).await.is_none());
        assert_eq!(publisher.pending(), 2);

        let result = publisher.enqueue(trade("GOOG")).await.unwrap();
        assert_eq!(result.len(), 3);
        assert_eq!(result.delivered_count(), 3);
        assert_eq!(publisher.pending(), 0);

        let total: usize = (0..3).map(|p| transport.records("trades", p).len()).sum();
        assert_eq!(total, 3);
    }

    #[tokio::test]
    async fn test_records_land_on_assigned_partition() {
        let (transport, mut publisher) = memory_publisher(10).await;
        publisher.enqueue(trade("AAPL")).await;
        publisher.enqueue(trade("MSFT")).await;
        let result = publisher.flush().await;

        for outcome in &result.outcomes {
            let expected =
                partition::assign(outcome.event.symbol(), NonZeroU32::new(3).unwrap());
            assert_eq!(outcome.partition, expected);
            let delivery = outcome.result.as_ref().unwrap();
            assert_eq!(delivery.partition, expected);
            let stored = transport.records("trades", expected);
            assert!(stored
                .iter()
                .any(|m| m.key.as_deref() == Some(outcome.event.symbol().as_bytes())));
        }
    }

    #[tokio::test]
    async fn test_flush_empty_batch() {
        let (_transport, mut publisher) = memory_publisher(10).await;
        let result = publisher.flush().await;
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn test_partial_failure_reports_each_event() {
        let inner = InMemoryTransport::new();
        inner.create_topic("trades", 2).await.unwrap();
        let transport = Arc::new(FailingKeyTransport {
            inner: inner.clone(),
            failing_key: "TSLA",
        });
        let mut publisher = Publisher::new(
            transport,
            Arc::new(JsonCodec),
            "trades",
            NonZeroU32::new(2).unwrap(),
            4,
        );

        publisher.enqueue(trade("AAPL")).await;
        publisher.enqueue(trade("TSLA")).await;
        publisher.enqueue(trade("MSFT")).await;
        let result = publisher.enqueue(trade("TSLA")).await.unwrap();

        assert_eq!(result.len(), 4);
        assert_eq!(result.delivered_count(), 2);
        assert_eq!(result.failed_count(), 2);
        assert!(result.failed().all(|o| o.event.symbol() == "TSLA"));
        let symbols: Vec<&str> = result.outcomes.iter().map(|o| o.event.symbol()).collect();
        assert_eq!(symbols, vec!["AAPL", "TSLA", "MSFT", "TSLA"]);
    }

    #[tokio::test]
    async fn test_republishing_same_event_is_deduplicated() {
        let (transport, publisher) = memory_publisher(10).await;
        let event = trade("AAPL");

        let first = publisher.publish_batch(vec![event.clone()]).await;
        let retry = publisher.publish_batch(vec![event.clone()]).await;

        let first = first.outcomes[0].result.as_ref().unwrap();
        let retry = retry.outcomes[0].result.as_ref().unwrap();
        assert!(!first.duplicate);
        assert!(retry.duplicate);
        assert_eq!(first.offset, retry.offset);

        let p = partition::assign("AAPL", NonZeroU32::new(3).unwrap());
        assert_eq!(transport.records("trades", p).len(), 1);
    }

    #[tokio::test]
    async fn test_connect_unknown_topic_fails() {
        let transport = InMemoryTransport::new();
        let result =
            Publisher::connect(Arc::new(transport), Arc::new(JsonCodec), "missing", 10).await;
        assert!(matches!(result, Err(StockflowError::Transport(_))));
    }
}
