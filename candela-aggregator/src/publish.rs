use std::collections::HashSet;

use async_trait::async_trait;
use candela_shared::{Ohlc, OhlcMessage, Symbol, window::TimeWindow};
use eyre::Result;
use lapin::{BasicProperties, Channel, options::BasicPublishOptions};
use serde::Serialize;
use tracing::debug;

/// A sink for finalized candles.
///
/// Implementations filter on their own timeframe whitelist, silently dropping
/// anything else, and must tolerate duplicate deliveries per
/// `(symbol, timeframe, window start)` — redelivery after a nack is expected.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, symbol: &Symbol, timeframe: TimeWindow, ohlc: &Ohlc) -> Result<()>;
}

/// Publishes the JSON envelope to the OHLC queue, awaiting the broker
/// confirm so a lost message fails the originating trade.
pub struct BusPublisher {
    channel: Channel,
    queue: String,
    timeframes: HashSet<TimeWindow>,
}

impl BusPublisher {
    pub fn new(
        channel: Channel,
        queue: impl Into<String>,
        timeframes: impl IntoIterator<Item = TimeWindow>,
    ) -> Self {
        Self {
            channel,
            queue: queue.into(),
            timeframes: timeframes.into_iter().collect(),
        }
    }
}

#[async_trait]
impl Publisher for BusPublisher {
    async fn publish(&self, symbol: &Symbol, timeframe: TimeWindow, ohlc: &Ohlc) -> Result<()> {
        if !self.timeframes.contains(&timeframe) {
            return Ok(());
        }

        let message = OhlcMessage {
            symbol: symbol.clone(),
            timeframe,
            ohlc: *ohlc,
        };
        let payload = simd_json::to_vec(&message)?;

        self.channel
            .basic_publish(
                "",
                &self.queue,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default(),
            )
            .await?
            .await?;

        debug!(%symbol, %timeframe, "published candle to bus");
        Ok(())
    }
}

/// Inserts one row per candle into the analytical base table.
pub struct ClickhousePublisher {
    client: clickhouse::Client,
    table: String,
    timeframes: HashSet<TimeWindow>,
}

#[derive(clickhouse::Row, Serialize)]
struct OhlcRow {
    symbol: String,
    timeframe_size: u32,
    timeframe_unit: String,
    time: u64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
}

impl ClickhousePublisher {
    pub fn new(
        client: clickhouse::Client,
        table: impl Into<String>,
        timeframes: impl IntoIterator<Item = TimeWindow>,
    ) -> Self {
        Self {
            client,
            table: table.into(),
            timeframes: timeframes.into_iter().collect(),
        }
    }
}

#[async_trait]
impl Publisher for ClickhousePublisher {
    async fn publish(&self, symbol: &Symbol, timeframe: TimeWindow, ohlc: &Ohlc) -> Result<()> {
        if !self.timeframes.contains(&timeframe) {
            return Ok(());
        }

        let row = OhlcRow {
            symbol: symbol.to_string(),
            timeframe_size: timeframe.size,
            timeframe_unit: timeframe.unit.to_string(),
            time: ohlc.time as u64,
            open: ohlc.open,
            high: ohlc.high,
            low: ohlc.low,
            close: ohlc.close,
        };

        let mut insert = self.client.insert(&self.table)?;
        insert.write(&row).await?;
        insert.end().await?;

        debug!(%symbol, %timeframe, "inserted candle row");
        Ok(())
    }
}
