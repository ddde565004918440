use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use stockflow_middleware::TransportSettings;

use crate::error::StockflowError;
use crate::publisher::DEFAULT_BATCH_SIZE;
use crate::source::DEFAULT_ALPHAVANTAGE_URL;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub transport: TransportConfig,
    pub source: SourceConfig,
    #[serde(default)]
    pub publisher: PublisherConfig,
    pub subscriber: SubscriberConfig,
    pub sink: SinkConfig,
    #[serde(default)]
    pub server: Option<ServerConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TransportConfig {
    #[serde(flatten)]
    pub settings: TransportSettings,
    pub topic: String,
    #[serde(default = "default_partitions")]
    pub partitions: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub symbol: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Poll cadence, e.g. "60s" or "1m"
    #[serde(default = "default_interval")]
    pub interval: String,
    /// Seed for synthetic side/quantity; random when absent
    #[serde(default)]
    pub seed: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PublisherConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SubscriberConfig {
    pub group: String,
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout: String,
    /// Partitions to consume; all when empty
    #[serde(default)]
    pub partitions: Vec<u32>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SinkConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
}

fn default_partitions() -> u32 {
    3
}

fn default_base_url() -> String {
    DEFAULT_ALPHAVANTAGE_URL.to_string()
}

fn default_interval() -> String {
    "60s".to_string()
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_poll_timeout() -> String {
    "1s".to_string()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, StockflowError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config =
            serde_yaml::from_str(&content).map_err(|e| StockflowError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), StockflowError> {
        if self.transport.topic.trim().is_empty() {
            return Err(StockflowError::Config("transport.topic must not be empty".to_string()));
        }
        if self.transport.partitions == 0 {
            return Err(StockflowError::Config(
                "transport.partitions must be greater than zero".to_string(),
            ));
        }
        if self.source.symbol.trim().is_empty() {
            return Err(StockflowError::Config("source.symbol must not be empty".to_string()));
        }
        if self.publisher.batch_size == 0 {
            return Err(StockflowError::Config(
                "publisher.batch_size must be greater than zero".to_string(),
            ));
        }
        if self.subscriber.group.trim().is_empty() {
            return Err(StockflowError::Config("subscriber.group must not be empty".to_string()));
        }
        if let Some(p) = self
            .subscriber
            .partitions
            .iter()
            .find(|p| **p >= self.transport.partitions)
        {
            return Err(StockflowError::Config(format!(
                "subscriber partition {} out of range (topic has {})",
                p, self.transport.partitions
            )));
        }
        self.source.interval()?;
        self.subscriber.poll_timeout()?;
        Ok(())
    }
}

impl SourceConfig {
    pub fn interval(&self) -> Result<Duration, StockflowError> {
        parse_duration(&self.interval)
    }
}

impl SubscriberConfig {
    pub fn poll_timeout(&self) -> Result<Duration, StockflowError> {
        parse_duration(&self.poll_timeout)
    }
}

/// Parse a duration string like "500ms", "15s", "1m", "1h", "1d"
pub fn parse_duration(s: &str) -> Result<Duration, StockflowError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(StockflowError::Config("Empty duration".to_string()));
    }

    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| StockflowError::Config(format!("Missing unit: {}", s)))?;
    let (num_str, unit) = s.split_at(split);
    let num: u64 = num_str
        .parse()
        .map_err(|_| StockflowError::Config(format!("Invalid duration: {}", s)))?;

    if num == 0 {
        return Err(StockflowError::Config(
            "Duration must be greater than zero".to_string(),
        ));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(num)),
        "s" => Ok(Duration::from_secs(num)),
        "m" => Ok(Duration::from_secs(num * 60)),
        "h" => Ok(Duration::from_secs(num * 60 * 60)),
        "d" => Ok(Duration::from_secs(num * 60 * 60 * 24)),
        _ => Err(StockflowError::Config(format!("Unknown unit: {}", unit))),
    }
}
