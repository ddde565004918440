use thiserror::Error;

use stockflow_middleware::{FactoryError, TransportError};

/// Fatal errors surfaced at startup
#[derive(Error, Debug)]
pub enum StockflowError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Transport factory error: {0}")]
    Factory(#[from] FactoryError),

    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A trade event that may not enter the pipeline
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("symbol must not be empty")]
    EmptySymbol,

    #[error("invalid side: {0:?}")]
    InvalidSide(String),

    #[error("quantity must be positive, got {0}")]
    NonPositiveQuantity(i64),

    #[error("quantity {0} exceeds the supported maximum")]
    QuantityOutOfRange(i64),

    #[error("price must be a positive finite number, got {0}")]
    InvalidPrice(f64),
}

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("decode failed: {0}")]
    Decode(#[source] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum PublishError {
    #[error(transparent)]
    Encode(#[from] CodecError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error: {0}")]
    Api(String),
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}
