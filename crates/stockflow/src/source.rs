//! Price sample sources
//!
//! The market data provider reports prices only. Side and quantity of the
//! resulting trade are synthetic and come from a [`TradeSynthesizer`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::SourceError;
use crate::event::Side;

pub const DEFAULT_ALPHAVANTAGE_URL: &str = "https://www.alphavantage.co";

const INTERVAL: &str = "1min";
const SERIES_KEY: &str = "Time Series (1min)";
const OPEN_KEY: &str = "1. open";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One observed price
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceSample {
    pub timestamp: DateTime<Utc>,
    pub price: f64,
}

#[async_trait]
pub trait SampleSource: Send + Sync {
    /// Latest samples for `symbol`, oldest first. Empty when the provider had no data.
    async fn fetch(&self, symbol: &str) -> Result<Vec<PriceSample>, SourceError>;
}

/// AlphaVantage `TIME_SERIES_INTRADAY` at 1-minute resolution
pub struct AlphaVantageSource {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl AlphaVantageSource {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }
}

#[async_trait]
impl SampleSource for AlphaVantageSource {
    async fn fetch(&self, symbol: &str) -> Result<Vec<PriceSample>, SourceError> {
        let url = format!("{}/query", self.base_url);
        let body: Value = self
            .client
            .get(&url)
            .query(&[
                ("function", "TIME_SERIES_INTRADAY"),
                ("symbol", symbol),
                ("interval", INTERVAL),
                ("apikey", self.api_key.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        parse_intraday(symbol, &body)
    }
}

/// Extract opening prices from an intraday response body
pub fn parse_intraday(symbol: &str, body: &Value) -> Result<Vec<PriceSample>, SourceError> {
    if let Some(message) = body.get("Error Message").and_then(Value::as_str) {
        return Err(SourceError::Api(message.to_string()));
    }

    let Some(series) = body.get(SERIES_KEY).and_then(Value::as_object) else {
        // Rate limiting is reported in-band with HTTP 200
        if let Some(note) = body
            .get("Note")
            .or_else(|| body.get("Information"))
            .and_then(Value::as_str)
        {
            warn!(symbol, note, "Provider returned no series");
        } else {
            debug!(symbol, "Response has no intraday series");
        }
        return Ok(Vec::new());
    };

    let mut samples = Vec::with_capacity(series.len());
    for (stamp, bar) in series {
        let timestamp = match NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT) {
            Ok(naive) => naive.and_utc(),
            Err(e) => {
                warn!(symbol, stamp, error = %e, "Skipping sample with bad timestamp");
                continue;
            }
        };
        let price = match bar
            .get(OPEN_KEY)
            .and_then(Value::as_str)
            .map(str::parse::<f64>)
        {
            Some(Ok(price)) => price,
            _ => {
                warn!(symbol, stamp, "Skipping sample with missing or bad open price");
                continue;
            }
        };
        samples.push(PriceSample { timestamp, price });
    }

    samples.sort_by_key(|s| s.timestamp);
    Ok(samples)
}

/// Supplies the side and quantity for a trade built from a price sample
pub trait TradeSynthesizer: Send {
    fn next_trade(&mut self) -> (Side, i64);
}

/// Synthetic trade attributes: side is a fair coin, quantity uniform in 1..100
pub struct SyntheticTrades {
    rng: StdRng,
}

impl SyntheticTrades {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self { rng }
    }
}

impl TradeSynthesizer for SyntheticTrades {
    fn next_trade(&mut self) -> (Side, i64) {
        let side = if self.rng.random_bool(0.5) {
            Side::Buy
        } else {
            Side::Sell
        };
        (side, self.rng.random_range(1..100))
    }
}
