//! stockflow: price ticks into a partitioned trade log, and the log into daily CSV files
//!
//! The ingestion side polls a market data provider, turns new price samples
//! into validated [`TradeEvent`]s and publishes them in batches, keyed by
//! symbol. The subscriber side consumes the log, persists each trade to a
//! daily CSV file and commits its offset only after the write is durable.

pub mod codec;
pub mod config;
pub mod error;
pub mod event;
pub mod ingest;
pub mod metrics;
pub mod partition;
pub mod publisher;
pub mod server;
pub mod sink;
pub mod source;
pub mod subscriber;

pub use codec::{EventCodec, JsonCodec};
pub use config::Config;
pub use error::{CodecError, PublishError, SinkError, SourceError, StockflowError, ValidationError};
pub use event::{Side, TradeEvent};
pub use ingest::{IngestStats, IngestionLoop};
pub use publisher::{BatchResult, DeliveryOutcome, Publisher};
pub use sink::{DailyCsvSink, Sink};
pub use source::{AlphaVantageSource, PriceSample, SampleSource, SyntheticTrades, TradeSynthesizer};
pub use subscriber::{StepOutcome, Subscriber, SubscriberState, SubscriberStats};
