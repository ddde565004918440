//! Log subscriber: consume trade records, persist them, then commit.
//!
//! A record's offset is committed only after the sink reported it durable.
//! When persisting fails the record is rolled back and delivered again, so
//! every committed record is on disk and a crash between persist and commit
//! at worst writes a record twice.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use stockflow_middleware::{Subscription, Transport, TransportError, TransportMessage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::EventCodec;
use crate::metrics::SubscriberMetrics;
use crate::sink::Sink;

pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Pause after a transport read error before polling again
const CONSUME_ERROR_BACKOFF: Duration = Duration::from_millis(500);

/// Pause before a rolled-back record is tried again; the log hands it back at once
const PERSIST_FAILURE_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Idle,
    Polling,
    Processing,
    Committing,
}

/// Result of one poll-persist-commit step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Nothing arrived within the poll timeout
    NoRecord,
    Committed { partition: u32, offset: u64 },
    /// Sink failed; the record was rolled back for redelivery
    PersistFailed { partition: u32, offset: u64 },
    /// Payload is not a valid trade; discarded without persisting
    DecodeFailed { partition: u32, offset: u64 },
    /// Persisted, but the commit did not go through
    CommitFailed { partition: u32, offset: u64 },
    ConsumeFailed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriberStats {
    pub persisted: u64,
    pub committed: u64,
    pub persist_failures: u64,
    pub decode_failures: u64,
    pub commit_failures: u64,
}

pub struct Subscriber<S: Sink> {
    topic: String,
    subscription: Box<dyn Subscription>,
    codec: Arc<dyn EventCodec>,
    sink: S,
    poll_timeout: Duration,
    state: SubscriberState,
    stats: SubscriberStats,
    running: Arc<AtomicBool>,
    /// Unix timestamp (seconds) of the last persisted record, 0 if none
    last_persisted_epoch_secs: Arc<AtomicU64>,
    metrics: SubscriberMetrics,
}

impl<S: Sink> Subscriber<S> {
    pub fn new(
        topic: impl Into<String>,
        subscription: Box<dyn Subscription>,
        codec: Arc<dyn EventCodec>,
        sink: S,
        poll_timeout: Duration,
    ) -> Self {
        let topic = topic.into();
        Self {
            metrics: SubscriberMetrics::new(topic.clone()),
            topic,
            subscription,
            codec,
            sink,
            poll_timeout,
            state: SubscriberState::Idle,
            stats: SubscriberStats::default(),
            running: Arc::new(AtomicBool::new(false)),
            last_persisted_epoch_secs: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Subscribe `group` to `partitions` of `topic` (all when empty)
    pub async fn connect(
        transport: &dyn Transport,
        topic: &str,
        group: &str,
        partitions: &[u32],
        codec: Arc<dyn EventCodec>,
        sink: S,
        poll_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let subscription = transport.subscribe(topic, group, partitions).await?;
        info!(topic, group, ?partitions, "Subscriber connected");
        Ok(Self::new(topic, subscription, codec, sink, poll_timeout))
    }

    pub fn state(&self) -> SubscriberState {
        self.state
    }

    pub fn stats(&self) -> SubscriberStats {
        self.stats
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Returns a handle that is true while `run` is active
    pub fn running_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Returns a handle to the last persisted timestamp
    pub fn last_persisted_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.last_persisted_epoch_secs)
    }

    /// Poll once and process whatever arrived
    pub async fn step(&mut self) -> StepOutcome {
        self.state = SubscriberState::Polling;
        let polled = self.subscription.next(self.poll_timeout).await;
        self.process(polled).await
    }

    /// Consume until `shutdown` is cancelled, then release the subscription
    pub async fn run(mut self, shutdown: CancellationToken) -> SubscriberStats {
        self.running.store(true, Ordering::SeqCst);
        info!(topic = %self.topic, "Subscriber started");

        loop {
            self.state = SubscriberState::Polling;
            let polled = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                polled = self.subscription.next(self.poll_timeout) => polled,
            };

            let backoff = match self.process(polled).await {
                StepOutcome::ConsumeFailed => CONSUME_ERROR_BACKOFF,
                StepOutcome::PersistFailed { .. } => PERSIST_FAILURE_BACKOFF,
                _ => continue,
            };
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
        }

        self.state = SubscriberState::Idle;
        self.running.store(false, Ordering::SeqCst);
        let Subscriber {
            topic,
            subscription,
            stats,
            ..
        } = self;

        if let Err(e) = subscription.unsubscribe().await {
            warn!(topic = %topic, error = %e, "Failed to release subscription");
        }
        info!(
            topic = %topic,
            persisted = stats.persisted,
            committed = stats.committed,
            persist_failures = stats.persist_failures,
            decode_failures = stats.decode_failures,
            "Subscriber stopped"
        );
        stats
    }

    async fn process(
        &mut self,
        polled: Result<Option<TransportMessage>, TransportError>,
    ) -> StepOutcome {
        let message = match polled {
            Ok(Some(message)) => message,
            Ok(None) => return StepOutcome::NoRecord,
            Err(e) => {
                self.metrics.inc_failure("consume");
                error!(topic = %self.topic, error = %e, "Failed to read from log");
                return StepOutcome::ConsumeFailed;
            }
        };
        let (partition, offset) = (message.partition, message.offset);

        self.state = SubscriberState::Processing;
        let event = match self.codec.decode(&message.payload) {
            Ok(event) => event,
            Err(e) => {
                self.stats.decode_failures += 1;
                self.metrics.inc_failure("decode");
                error!(partition, offset, error = %e, "Discarding undecodable record");
                if let Err(e) = self.subscription.discard(&message).await {
                    warn!(partition, offset, error = %e, "Failed to discard record");
                }
                self.state = SubscriberState::Idle;
                return StepOutcome::DecodeFailed { partition, offset };
            }
        };

        if let Err(e) = self.sink.append(&event) {
            self.stats.persist_failures += 1;
            self.metrics.inc_failure("persist");
            error!(
                symbol = event.symbol(),
                partition,
                offset,
                error = %e,
                "Failed to persist trade, not committing"
            );
            if let Err(e) = self.subscription.rollback(&message).await {
                warn!(partition, offset, error = %e, "Failed to roll back record");
            }
            self.state = SubscriberState::Idle;
            return StepOutcome::PersistFailed { partition, offset };
        }

        self.stats.persisted += 1;
        self.metrics.inc_persisted(partition);
        let now = chrono::Utc::now().timestamp();
        self.last_persisted_epoch_secs
            .store(now.max(0) as u64, Ordering::SeqCst);
        self.metrics.set_last_persisted_timestamp(now as f64);
        info!(
            symbol = event.symbol(),
            side = %event.side(),
            quantity = event.quantity(),
            price = event.price(),
            partition,
            offset,
            "Persisted trade"
        );

        self.state = SubscriberState::Committing;
        match self.subscription.commit(&message).await {
            Ok(()) => {
                self.stats.committed += 1;
                self.metrics.inc_committed(partition);
                debug!(partition, offset, "Committed offset");
                self.state = SubscriberState::Polling;
                StepOutcome::Committed { partition, offset }
            }
            Err(e) => {
                self.stats.commit_failures += 1;
                self.metrics.inc_failure("commit");
                error!(partition, offset, error = %e, "Failed to commit offset");
                self.state = SubscriberState::Idle;
                StepOutcome::CommitFailed { partition, offset }
            }
        }
    }
}
