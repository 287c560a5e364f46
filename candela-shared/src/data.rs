use bytestring::ByteString;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{DataResult, Symbol, TimestampMs, error::DataError, window::TimeWindow};

/// A validated trade event.
///
/// `Trade` only exists after ingress validation: deserialization routes
/// through [`RawTrade`], so a payload with non-positive numerics, an empty
/// symbol, or an unrepresentable timestamp never constructs one.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawTrade")]
pub struct Trade {
    pub trade_id: String,
    pub trader_id: Uuid,
    pub symbol: Symbol,
    pub price: f64,
    pub quantity: f64,
    pub volume: f64,
    pub timestamp: DateTime<Utc>,
    pub side: ByteString,
}

/// Wire mirror of [`Trade`]: `timestamp` arrives as integer milliseconds
/// since the unix epoch (UTC).
#[derive(Debug, Deserialize)]
pub struct RawTrade {
    pub trade_id: String,
    pub trader_id: Uuid,
    pub symbol: Symbol,
    pub price: f64,
    pub quantity: f64,
    pub volume: f64,
    pub timestamp: TimestampMs,
    pub side: ByteString,
}

impl TryFrom<RawTrade> for Trade {
    type Error = DataError;

    fn try_from(raw: RawTrade) -> DataResult<Self> {
        for (field, value) in [
            ("price", raw.price),
            ("quantity", raw.quantity),
            ("volume", raw.volume),
        ] {
            // The negated comparison also rejects NaN.
            if !(value > 0.0) {
                return Err(DataError::non_positive(field, value));
            }
        }

        if raw.symbol.trim().is_empty() {
            return Err(DataError::EmptySymbol);
        }

        let timestamp = DateTime::from_timestamp_millis(raw.timestamp)
            .ok_or(DataError::TimestampOutOfRange(raw.timestamp))?;

        Ok(Self {
            trade_id: raw.trade_id,
            trader_id: raw.trader_id,
            symbol: raw.symbol,
            price: raw.price,
            quantity: raw.quantity,
            volume: raw.volume,
            timestamp,
            side: raw.side,
        })
    }
}

/// One candle. `time` is the unix-second window start.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ohlc {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

/// Wire envelope published to the OHLC queue and forwarded verbatim to
/// WebSocket clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OhlcMessage {
    pub symbol: Symbol,
    pub timeframe: TimeWindow,
    pub ohlc: Ohlc,
}
