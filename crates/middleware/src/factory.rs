use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::error::TransportError;
use crate::memory::InMemoryTransport;
use crate::nats::NatsTransport;
use crate::transport::{Transport, TransportOptions, DEFAULT_DUPLICATE_WINDOW};

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Memory,
    Nats,
}

/// Transport section of the service configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TransportSettings {
    #[serde(rename = "type")]
    pub kind: TransportKind,
    /// Server URL, required for `nats`
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_idempotent")]
    pub idempotent: bool,
    #[serde(default = "default_duplicate_window_secs")]
    pub duplicate_window_secs: u64,
}

fn default_idempotent() -> bool {
    true
}

fn default_duplicate_window_secs() -> u64 {
    DEFAULT_DUPLICATE_WINDOW.as_secs()
}

impl TransportSettings {
    pub fn options(&self) -> TransportOptions {
        TransportOptions {
            idempotent: self.idempotent,
            duplicate_window: Duration::from_secs(self.duplicate_window_secs),
        }
    }
}

/// Error creating middleware
#[derive(Debug, thiserror::Error)]
pub enum FactoryError {
    #[error("configuration error: {0}")]
    ConfigError(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Create a transport based on configuration
pub async fn create_transport(settings: &TransportSettings) -> Result<Arc<dyn Transport>, FactoryError> {
    let options = settings.options();
    match settings.kind {
        TransportKind::Memory => Ok(Arc::new(InMemoryTransport::with_options(options))),
        TransportKind::Nats => {
            let url = settings
                .url
                .as_deref()
                .ok_or_else(|| FactoryError::ConfigError("nats transport requires url".to_string()))?;
            Ok(Arc::new(NatsTransport::connect(url, options).await?))
        }
    }
}
