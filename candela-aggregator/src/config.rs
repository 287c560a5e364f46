use eyre::Result;
use figment::providers::{Env, Format, Toml};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Settings {
    #[serde(default = "default_amqp_url")]
    pub amqp_url: String,
    #[serde(default = "default_trades_queue")]
    pub trades_queue: String,
    #[serde(default = "default_ohlc_queue")]
    pub ohlc_queue: String,
    #[serde(default = "default_consumer_tag")]
    pub consumer_tag: String,

    #[serde(default = "default_clickhouse_url")]
    pub clickhouse_url: String,
    pub clickhouse_username: String,
    pub clickhouse_password: String,
    #[serde(default = "default_clickhouse_db")]
    pub clickhouse_db: String,
    /// Write only 1-second rows to the base table and let the rollup views
    /// reconstruct the coarser timeframes.
    #[serde(default)]
    pub clickhouse_seconds_only: bool,

    #[serde(default)]
    pub smooth_gaps: bool,
    #[serde(default = "default_window_max_age_secs")]
    pub window_max_age_secs: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// Evict windows against the newest event timestamp instead of the wall
    /// clock, so a lagging feed keeps its active symbols.
    #[serde(default)]
    pub event_time_eviction: bool,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Settings {
    pub fn load() -> Result<Settings> {
        let settings: Settings = figment::Figment::new()
            .merge(Toml::file("aggregator.toml"))
            .merge(Env::prefixed("CANDELA_AGG_"))
            .extract()?;
        Ok(settings)
    }

    pub fn log_level(&self) -> tracing::Level {
        self.log_level.parse().unwrap_or(tracing::Level::INFO)
    }
}

fn default_amqp_url() -> String {
    "amqp://127.0.0.1:5672/%2f".to_owned()
}

fn default_trades_queue() -> String {
    "trades".to_owned()
}

fn default_ohlc_queue() -> String {
    "ohlc-trades".to_owned()
}

fn default_consumer_tag() -> String {
    "ohlc-aggregator".to_owned()
}

fn default_clickhouse_url() -> String {
    "http://clickhouse:8123".to_owned()
}

fn default_clickhouse_db() -> String {
    "ohlc_db".to_owned()
}

fn default_window_max_age_secs() -> u64 {
    86_400
}

fn default_cleanup_interval_secs() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_owned()
}
