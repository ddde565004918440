//! Trade event model
//!
//! A `TradeEvent` is validated once, at construction, and is immutable
//! afterwards: fields are private and only readable through accessors.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "Buy",
            Side::Sell => "Sell",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buy" => Ok(Side::Buy),
            "sell" => Ok(Side::Sell),
            _ => Err(ValidationError::InvalidSide(s.to_string())),
        }
    }
}

/// One trade tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "WireTrade", try_from = "WireTrade")]
pub struct TradeEvent {
    id: Uuid,
    symbol: String,
    side: Side,
    quantity: u32,
    price: f64,
    timestamp: DateTime<Utc>,
}

impl TradeEvent {
    /// Validate fields and create an event with a fresh id.
    ///
    /// `timestamp` is the time the sample represents; `None` means now.
    pub fn new(
        symbol: impl Into<String>,
        side: Side,
        quantity: i64,
        price: f64,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<Self, ValidationError> {
        Self::with_id(
            Uuid::new_v4(),
            symbol.into(),
            side,
            quantity,
            price,
            timestamp.unwrap_or_else(Utc::now),
        )
    }

    /// Like [`TradeEvent::new`], with the side given as text (`"Buy"` / `"Sell"`)
    pub fn parse(
        symbol: impl Into<String>,
        side: &str,
        quantity: i64,
        price: f64,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<Self, ValidationError> {
        Self::new(symbol, side.parse()?, quantity, price, timestamp)
    }

    fn with_id(
        id: Uuid,
        symbol: String,
        side: Side,
        quantity: i64,
        price: f64,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        if symbol.trim().is_empty() {
            return Err(ValidationError::EmptySymbol);
        }
        if quantity <= 0 {
            return Err(ValidationError::NonPositiveQuantity(quantity));
        }
        let quantity =
            u32::try_from(quantity).map_err(|_| ValidationError::QuantityOutOfRange(quantity))?;
        if !price.is_finite() || price <= 0.0 {
            return Err(ValidationError::InvalidPrice(price));
        }

        Ok(Self {
            id,
            symbol,
            side,
            quantity,
            price,
            timestamp,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn quantity(&self) -> u32 {
        self.quantity
    }

    pub fn price(&self) -> f64 {
        self.price
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Key used for partition assignment
    #[inline]
    pub fn partition_key(&self) -> &str {
        &self.symbol
    }
}

/// Serialized shape of a trade; side travels as text and is re-validated on decode
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct WireTrade {
    id: Uuid,
    symbol: String,
    side: String,
    quantity: i64,
    price: f64,
    timestamp: DateTime<Utc>,
}

impl From<TradeEvent> for WireTrade {
    fn from(event: TradeEvent) -> Self {
        Self {
            id: event.id,
            side: event.side.as_str().to_string(),
            symbol: event.symbol,
            quantity: i64::from(event.quantity),
            price: event.price,
            timestamp: event.timestamp,
        }
    }
}

impl TryFrom<WireTrade> for TradeEvent {
    type Error = ValidationError;

    fn try_from(wire: WireTrade) -> Result<Self, Self::Error> {
        let side = wire.side.parse()?;
        TradeEvent::with_id(wire.id, wire.symbol, side, wire.quantity, wire.price, wire.timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 14, 30, 0).unwrap()
    }

    #[test]
    fn test_new_keeps_fields() {
        let event = TradeEvent::new("AAPL", Side::Buy, 10, 150.0, Some(at())).unwrap();
        assert_eq!(event.symbol(), "AAPL");
        assert_eq!(event.side(), Side::Buy);
        assert_eq!(event.quantity(), 10);
        assert_eq!(event.price(), 150.0);
        assert_eq!(event.timestamp(), at());
        assert_eq!(event.partition_key(), "AAPL");
    }

    #[test]
    fn test_timestamp_defaults_to_now() {
        let before = Utc::now();
        let event = TradeEvent::new("MSFT", Side::Sell, 5, 300.0, None).unwrap();
        assert!(event.timestamp() >= before && event.timestamp() <= Utc::now());
    }

    #[test]
    fn test_ids_are_unique() {
        let a = TradeEvent::new("AAPL", Side::Buy, 1, 1.0, Some(at())).unwrap();
        let b = TradeEvent::new("AAPL", Side::Buy, 1, 1.0, Some(at())).unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_rejects_empty_symbol() {
        assert_eq!(
            TradeEvent::new("", Side::Buy, 1, 1.0, None).unwrap_err(),
            ValidationError::EmptySymbol
        );
        assert_eq!(
            TradeEvent::new("   ", Side::Buy, 1, 1.0, None).unwrap_err(),
            ValidationError::EmptySymbol
        );
    }

    #[test]
    fn test_rejects_non_positive_quantity() {
        assert_eq!(
            TradeEvent::new("AAPL", Side::Buy, 0, 1.0, None).unwrap_err(),
            ValidationError::NonPositiveQuantity(0)
        );
        assert_eq!(
            TradeEvent::new("AAPL", Side::Buy, -3, 1.0, None).unwrap_err(),
            ValidationError::NonPositiveQuantity(-3)
        );
        assert!(matches!(
            TradeEvent::new("AAPL", Side::Buy, i64::from(u32::MAX) + 1, 1.0, None),
            Err(ValidationError::QuantityOutOfRange(_))
        ));
    }

    #[test]
    fn test_rejects_bad_price() {
        for price in [0.0, -1.5, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                TradeEvent::new("AAPL", Side::Buy, 1, price, None),
                Err(ValidationError::InvalidPrice(_))
            ));
        }
    }

    #[test]
    fn test_parse_side() {
        assert_eq!("Buy".parse::<Side>().unwrap(), Side::Buy);
        assert_eq!("sell".parse::<Side>().unwrap(), Side::Sell);
        assert_eq!(
            "".parse::<Side>().unwrap_err(),
            ValidationError::InvalidSide(String::new())
        );
        assert!(TradeEvent::parse("AAPL", "Hold", 1, 1.0, None).is_err());
        assert_eq!(
            TradeEvent::parse("AAPL", "Sell", 1, 1.0, None).unwrap().side(),
            Side::Sell
        );
    }

    proptest! {
        #[test]
        fn prop_valid_inputs_construct(
            symbol in "[A-Z]{1,5}",
            buy in any::<bool>(),
            quantity in 1i64..1_000_000,
            price in 0.0001f64..1_000_000.0,
        ) {
            let side = if buy { Side::Buy } else { Side::Sell };
            let event = TradeEvent::new(symbol.clone(), side, quantity, price, Some(at())).unwrap();
            prop_assert_eq!(event.symbol(), symbol.as_str());
            prop_assert_eq!(event.side(), side);
            prop_assert_eq!(i64::from(event.quantity()), quantity);
            prop_assert_eq!(event.price(), price);
        }

        #[test]
        fn prop_invalid_quantity_or_price_rejected(
            quantity in i64::MIN..=0,
            price in -1_000_000.0f64..=0.0,
        ) {
            prop_assert!(TradeEvent::new("AAPL", Side::Buy, quantity, 1.0, None).is_err());
            prop_assert!(TradeEvent::new("AAPL", Side::Buy, 1, price, None).is_err());
        }
    }
}
