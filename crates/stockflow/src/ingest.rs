//! Ingestion loop: periodically fetch price samples, turn new ones into
//! trade events and publish them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::SourceError;
use crate::event::TradeEvent;
use crate::metrics::IngestMetrics;
use crate::publisher::{BatchResult, Publisher};
use crate::source::{PriceSample, SampleSource, TradeSynthesizer};

/// Free-tier provider limit
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Counts for one fetch cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub fetched: usize,
    pub new: usize,
    pub rejected: usize,
    pub delivered: usize,
    pub failed: usize,
}

/// Totals over the loop's lifetime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub cycles: u64,
    pub fetch_errors: u64,
    pub samples: u64,
    pub rejected: u64,
    pub delivered: u64,
    pub failed: u64,
}

pub struct IngestionLoop {
    symbol: String,
    interval: Duration,
    source: Arc<dyn SampleSource>,
    trades: Box<dyn TradeSynthesizer>,
    publisher: Publisher,
    /// Timestamp of the newest sample already turned into an event
    last_sample: Option<DateTime<Utc>>,
    stats: IngestStats,
    running: Arc<AtomicBool>,
    metrics: IngestMetrics,
}

impl IngestionLoop {
    pub fn new(
        symbol: impl Into<String>,
        interval: Duration,
        source: Arc<dyn SampleSource>,
        trades: Box<dyn TradeSynthesizer>,
        publisher: Publisher,
    ) -> Self {
        let symbol = symbol.into();
        Self {
            metrics: IngestMetrics::new(symbol.clone()),
            symbol,
            interval,
            source,
            trades,
            publisher,
            last_sample: None,
            stats: IngestStats::default(),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns a handle that is true while `run` is active
    pub fn running_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn stats(&self) -> IngestStats {
        self.stats
    }

    /// Fetch once and publish whatever is new
    pub async fn cycle(&mut self) -> CycleReport {
        let fetched = self.source.fetch(&self.symbol).await;
        self.process(fetched).await
    }

    /// Run cycles on the configured cadence until `shutdown` is cancelled.
    /// Cancellation interrupts both the wait and an in-flight fetch. A cycle
    /// that has started publishing runs to completion, and every cycle ends
    /// with a flush, so no batch is left behind.
    pub async fn run(mut self, shutdown: CancellationToken) -> IngestStats {
        self.running.store(true, Ordering::SeqCst);
        info!(symbol = %self.symbol, interval = ?self.interval, "Ingestion loop started");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let fetched = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                fetched = self.source.fetch(&self.symbol) => fetched,
            };
            self.process(fetched).await;
        }

        self.running.store(false, Ordering::SeqCst);
        info!(
            symbol = %self.symbol,
            cycles = self.stats.cycles,
            delivered = self.stats.delivered,
            failed = self.stats.failed,
            rejected = self.stats.rejected,
            "Ingestion loop stopped"
        );
        self.stats
    }

    async fn process(&mut self, fetched: Result<Vec<PriceSample>, SourceError>) -> CycleReport {
        self.stats.cycles += 1;
        let mut report = CycleReport::default();

        let samples = match fetched {
            Ok(samples) => samples,
            Err(e) => {
                self.stats.fetch_errors += 1;
                self.metrics.inc_cycle("error");
                error!(symbol = %self.symbol, error = %e, "Failed to fetch price samples");
                return report;
            }
        };
        report.fetched = samples.len();

        let last_sample = self.last_sample;
        let fresh: Vec<PriceSample> = samples
            .into_iter()
            .filter(|s| last_sample.map_or(true, |last| s.timestamp > last))
            .collect();
        report.new = fresh.len();

        if fresh.is_empty() {
            self.metrics.inc_cycle("no_data");
            info!(symbol = %self.symbol, fetched = report.fetched, "No new price samples");
            return report;
        }

        for sample in &fresh {
            let (side, quantity) = self.trades.next_trade();
            match TradeEvent::new(
                self.symbol.as_str(),
                side,
                quantity,
                sample.price,
                Some(sample.timestamp),
            ) {
                Ok(event) => {
                    if let Some(result) = self.publisher.enqueue(event).await {
                        self.record_batch(&result, &mut report);
                    }
                }
                Err(e) => {
                    report.rejected += 1;
                    self.stats.rejected += 1;
                    self.metrics.inc_rejected();
                    warn!(
                        symbol = %self.symbol,
                        timestamp = %sample.timestamp,
                        price = sample.price,
                        error = %e,
                        "Dropping invalid trade"
                    );
                }
            }
        }

        let result = self.publisher.flush().await;
        self.record_batch(&result, &mut report);

        self.last_sample = fresh.iter().map(|s| s.timestamp).max().or(self.last_sample);
        self.stats.samples += report.new as u64;
        self.metrics.inc_cycle("ok");
        info!(
            symbol = %self.symbol,
            fetched = report.fetched,
            new = report.new,
            rejected = report.rejected,
            delivered = report.delivered,
            failed = report.failed,
            "Ingestion cycle complete"
        );
        report
    }

    fn record_batch(&mut self, result: &BatchResult, report: &mut CycleReport) {
        let delivered = result.delivered_count();
        let failed = result.failed_count();
        report.delivered += delivered;
        report.failed += failed;
        self.stats.delivered += delivered as u64;
        self.stats.failed += failed as u64;
    }
}
