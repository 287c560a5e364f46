use eyre::Result;
use figment::providers::{Env, Format, Toml};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Settings {
    #[serde(default = "default_amqp_url")]
    pub amqp_url: String,
    #[serde(default = "default_ohlc_queue")]
    pub ohlc_queue: String,
    #[serde(default = "default_consumer_tag")]
    pub consumer_tag: String,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Settings {
    pub fn load() -> Result<Settings> {
        let settings: Settings = figment::Figment::new()
            .merge(Toml::file("ws.toml"))
            .merge(Env::prefixed("CANDELA_WS_"))
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

fn default_ohlc_queue() -> String {
    "ohlc-trades".to_owned()
}

fn default_consumer_tag() -> String {
    "trade-data-ws".to_owned()
}

fn default_listen_addr() -> String {
    "0.0.0.0:8765".to_owned()
}

fn default_log_level() -> String {
    "info".to_owned()
}
