use std::collections::{HashMap, hash_map::Entry};

use candela_shared::{DataResult, Ohlc, Symbol, Trade, window::TimeWindow};
use chrono::{DateTime, Duration, Utc};

/// The open window for one `(symbol, timeframe)` pair.
#[derive(Debug, Clone, Copy)]
struct WindowState {
    start: DateTime<Utc>,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
}

impl WindowState {
    fn opening(start: DateTime<Utc>, open: f64, price: f64) -> Self {
        Self {
            start,
            open,
            high: price,
            low: price,
            close: price,
        }
    }

    fn to_ohlc(self) -> Ohlc {
        Ohlc {
            time: self.start.timestamp(),
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
        }
    }
}

/// Folds an unbounded stream of trades into finalized candles, one state
/// machine per `(symbol, timeframe)`.
///
/// Closure is event-driven: a window only closes when a later trade for the
/// same symbol proves it complete. Single-writer — the engine is owned by its
/// worker task and never shared.
pub struct OhlcAggregator {
    timeframes: Vec<TimeWindow>,
    smooth_gaps: bool,
    windows: HashMap<Symbol, HashMap<TimeWindow, WindowState>>,
    last_closes: HashMap<Symbol, HashMap<TimeWindow, f64>>,
    latest_event_time: Option<DateTime<Utc>>,
}

impl OhlcAggregator {
    pub fn new(timeframes: Vec<TimeWindow>, smooth_gaps: bool) -> Self {
        Self {
            timeframes,
            smooth_gaps,
            windows: HashMap::new(),
            last_closes: HashMap::new(),
            latest_event_time: None,
        }
    }

    /// Feeds one trade through every configured timeframe and returns the
    /// windows it closed, in configuration order.
    ///
    /// The very first trade for a pair never emits. With gap smoothing, a new
    /// window's `open` inherits the previous finalized close; `high`/`low`
    /// still seed from the trade itself so the emitted range stays the true
    /// traded range.
    ///
    /// # Error
    ///
    /// Window arithmetic failures propagate; the caller is expected to nack
    /// the originating message.
    pub fn add_trade(&mut self, trade: &Trade) -> DataResult<Vec<(TimeWindow, Ohlc)>> {
        let mut closed = Vec::new();

        self.latest_event_time = Some(match self.latest_event_time {
            Some(latest) => latest.max(trade.timestamp),
            None => trade.timestamp,
        });

        for i in 0..self.timeframes.len() {
            let tf = self.timeframes[i];
            let window_start = tf.window_start(trade.timestamp)?;
            let by_tf = self.windows.entry(trade.symbol.clone()).or_default();

            match by_tf.entry(tf) {
                Entry::Occupied(mut occupied) => {
                    let state = occupied.get_mut();
                    if state.start == window_start {
                        state.high = state.high.max(trade.price);
                        state.low = state.low.min(trade.price);
                        state.close = trade.price;
                    } else {
                        if tf.is_complete(state.start, trade.timestamp)? {
                            closed.push((tf, state.to_ohlc()));
                            self.last_closes
                                .entry(trade.symbol.clone())
                                .or_default()
                                .insert(tf, state.close);
                        }

                        let open = if self.smooth_gaps {
                            last_close(&self.last_closes, &trade.symbol, tf).unwrap_or(trade.price)
                        } else {
                            trade.price
                        };
                        *state = WindowState::opening(window_start, open, trade.price);
                    }
                }
                Entry::Vacant(vacant) => {
                    let open = if self.smooth_gaps {
                        last_close(&self.last_closes, &trade.symbol, tf).unwrap_or(trade.price)
                    } else {
                        trade.price
                    };
                    vacant.insert(WindowState::opening(window_start, open, trade.price));
                }
            }
        }

        Ok(closed)
    }

    /// Snapshot of the open (not yet finalized) windows for `symbol`.
    pub fn current_state(&self, symbol: &Symbol) -> HashMap<TimeWindow, Ohlc> {
        self.windows
            .get(symbol)
            .map(|by_tf| by_tf.iter().map(|(tf, state)| (*tf, state.to_ohlc())).collect())
            .unwrap_or_default()
    }

    /// Evicts window state whose start is older than `now - max_age` on the
    /// wall clock. Eviction never emits; it only reclaims memory for symbols
    /// that stopped trading.
    pub fn cleanup_old_windows(&mut self, max_age: Duration) {
        self.cleanup_windows_older_than(Utc::now() - max_age);
    }

    /// Event-time variant: the cutoff is measured from the newest trade
    /// timestamp the engine has seen, so a feed that lags wall-clock does not
    /// lose state for symbols that are still active.
    pub fn cleanup_stale_windows(&mut self, max_age: Duration) {
        if let Some(latest) = self.latest_event_time {
            self.cleanup_windows_older_than(latest - max_age);
        }
    }

    pub fn cleanup_windows_older_than(&mut self, cutoff: DateTime<Utc>) {
        for by_tf in self.windows.values_mut() {
            by_tf.retain(|_, state| state.start >= cutoff);
        }
        self.windows.retain(|_, by_tf| !by_tf.is_empty());
    }
}

fn last_close(
    last_closes: &HashMap<Symbol, HashMap<TimeWindow, f64>>,
    symbol: &Symbol,
    tf: TimeWindow,
) -> Option<f64> {
    last_closes.get(symbol).and_then(|by_tf| by_tf.get(&tf)).copied()
}
