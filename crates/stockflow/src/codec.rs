//! Trade event wire encoding

use bytes::Bytes;

use crate::error::CodecError;
use crate::event::TradeEvent;

/// Converts trade events to and from record payloads
pub trait EventCodec: Send + Sync {
    fn encode(&self, event: &TradeEvent) -> Result<Bytes, CodecError>;

    /// Decoding validates the event; a payload that fails validation is a `CodecError`
    fn decode(&self, payload: &[u8]) -> Result<TradeEvent, CodecError>;
}

/// JSON document `{"id","symbol","side","quantity","price","timestamp"}`
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl EventCodec for JsonCodec {
    fn encode(&self, event: &TradeEvent) -> Result<Bytes, CodecError> {
        serde_json::to_vec(event)
            .map(Bytes::from)
            .map_err(CodecError::Encode)
    }

    fn decode(&self, payload: &[u8]) -> Result<TradeEvent, CodecError> {
        serde_json::from_slice(payload).map_err(CodecError::Decode)
    }
}
