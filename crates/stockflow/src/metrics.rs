//! Prometheus metrics for the pipeline
//!
//! Handles are cheap to clone and carry their label values, so call sites
//! only name the event being counted.

use once_cell::sync::Lazy;
use prometheus::{
    register_gauge_vec, register_int_counter_vec, Encoder, GaugeVec, IntCounterVec, TextEncoder,
};

const LABEL_TOPIC: &str = "topic";
const LABEL_SYMBOL: &str = "symbol";
const LABEL_PARTITION: &str = "partition";
const LABEL_OUTCOME: &str = "outcome";

/// Publish attempts by outcome (delivered, duplicate, failed)
static EVENTS_PUBLISHED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "stockflow_events_published_total",
        "Trade events handed to the transport, by delivery outcome",
        &[LABEL_TOPIC, LABEL_OUTCOME]
    )
    .expect("Failed to register events_published_total metric")
});

/// Samples that failed trade validation
static EVENTS_REJECTED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "stockflow_events_rejected_total",
        "Price samples dropped by trade event validation",
        &[LABEL_SYMBOL]
    )
    .expect("Failed to register events_rejected_total metric")
});

/// Ingestion cycles by outcome (ok, no_data, error)
static INGEST_CYCLES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "stockflow_ingest_cycles_total",
        "Ingestion fetch cycles",
        &[LABEL_SYMBOL, LABEL_OUTCOME]
    )
    .expect("Failed to register ingest_cycles_total metric")
});

static RECORDS_PERSISTED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "stockflow_records_persisted_total",
        "Records written to the sink",
        &[LABEL_TOPIC, LABEL_PARTITION]
    )
    .expect("Failed to register records_persisted_total metric")
});

static COMMITS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "stockflow_commits_total",
        "Offsets committed after a successful persist",
        &[LABEL_TOPIC, LABEL_PARTITION]
    )
    .expect("Failed to register commits_total metric")
});

/// Subscriber failures by kind (persist, decode, commit, consume)
static SUBSCRIBER_FAILURES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "stockflow_subscriber_failures_total",
        "Subscriber failures by kind",
        &[LABEL_TOPIC, LABEL_OUTCOME]
    )
    .expect("Failed to register subscriber_failures_total metric")
});

/// Unix timestamp of the last persisted record
static LAST_PERSISTED_TIMESTAMP: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "stockflow_last_persisted_timestamp",
        "Unix timestamp of the last record persisted",
        &[LABEL_TOPIC]
    )
    .expect("Failed to register last_persisted_timestamp metric")
});

#[derive(Clone)]
pub struct PublisherMetrics {
    topic: String,
}

impl PublisherMetrics {
    pub fn new(topic: impl Into<String>) -> Self {
        Self { topic: topic.into() }
    }

    pub fn inc_delivered(&self) {
        self.inc("delivered");
    }

    pub fn inc_duplicate(&self) {
        self.inc("duplicate");
    }

    pub fn inc_failed(&self) {
        self.inc("failed");
    }

    fn inc(&self, outcome: &str) {
        EVENTS_PUBLISHED_TOTAL
            .with_label_values(&[&self.topic, outcome])
            .inc();
    }

    pub fn get(&self, outcome: &str) -> u64 {
        EVENTS_PUBLISHED_TOTAL
            .with_label_values(&[&self.topic, outcome])
            .get()
    }
}

#[derive(Clone)]
pub struct IngestMetrics {
    symbol: String,
}

impl IngestMetrics {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
        }
    }

    pub fn inc_cycle(&self, outcome: &str) {
        INGEST_CYCLES_TOTAL
            .with_label_values(&[&self.symbol, outcome])
            .inc();
    }

    pub fn inc_rejected(&self) {
        EVENTS_REJECTED_TOTAL
            .with_label_values(&[&self.symbol])
            .inc();
    }
}

#[derive(Clone)]
pub struct SubscriberMetrics {
    topic: String,
}

impl SubscriberMetrics {
    pub fn new(topic: impl Into<String>) -> Self {
        Self { topic: topic.into() }
    }

    pub fn inc_persisted(&self, partition: u32) {
        RECORDS_PERSISTED_TOTAL
            .with_label_values(&[&self.topic, &partition.to_string()])
            .inc();
    }

    pub fn inc_committed(&self, partition: u32) {
        COMMITS_TOTAL
            .with_label_values(&[&self.topic, &partition.to_string()])
            .inc();
    }

    pub fn inc_failure(&self, kind: &str) {
        SUBSCRIBER_FAILURES_TOTAL
            .with_label_values(&[&self.topic, kind])
            .inc();
    }

    pub fn set_last_persisted_timestamp(&self, epoch_secs: f64) {
        LAST_PERSISTED_TIMESTAMP
            .with_label_values(&[&self.topic])
            .set(epoch_secs);
    }
}

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| {
        prometheus::Error::Msg(format!("Failed to encode metrics as UTF-8: {}", e))
    })
}
