use candela_shared::Trade;
use eyre::Result;
use futures::future::try_join_all;

use crate::{aggregator::OhlcAggregator, publish::Publisher};

/// Parses, validates, aggregates, and fans out one trade payload.
pub struct TradeProcessor {
    aggregator: OhlcAggregator,
    publishers: Vec<Box<dyn Publisher>>,
}

impl TradeProcessor {
    pub fn new(aggregator: OhlcAggregator, publishers: Vec<Box<dyn Publisher>>) -> Self {
        Self {
            aggregator,
            publishers,
        }
    }

    pub fn aggregator_mut(&mut self) -> &mut OhlcAggregator {
        &mut self.aggregator
    }

    /// All publishers run concurrently per closed window and are joined
    /// before the next window is dispatched.
    ///
    /// # Error
    ///
    /// Anything — malformed payload, window arithmetic, sink failure —
    /// propagates so the caller can nack the message for redelivery.
    pub async fn process(&mut self, payload: &mut [u8]) -> Result<()> {
        let trade: Trade = simd_json::from_slice(payload)?;
        let closed = self.aggregator.add_trade(&trade)?;

        for (timeframe, ohlc) in closed {
            try_join_all(
                self.publishers
                    .iter()
                    .map(|publisher| publisher.publish(&trade.symbol, timeframe, &ohlc)),
            )
            .await?;
        }

        Ok(())
    }
}
