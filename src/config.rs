//! Operator configuration: a TOML file naming the database, the queue and
//! bus backends, which markets to run, and per-worker tunables.

use serde::Deserialize;

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_candle_flush_every() -> u32 {
    100
}

fn default_consumer_group() -> String {
    "engine".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database_url: String,
    pub queue_url: String,
    pub bus_url: String,
    /// Markets to run workers for. `None` means every row in the Market table.
    #[serde(default)]
    pub markets: Option<Vec<MarketSelector>>,
    #[serde(default)]
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarketSelector {
    pub base: String,
    pub quote: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_candle_flush_every")]
    pub candle_flush_every: u32,
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            candle_flush_every: default_candle_flush_every(),
            consumer_group: default_consumer_group(),
        }
    }
}

impl Config {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading config {}: {}", path.display(), e))?;
        let config: Config = toml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("parsing config {}: {}", path.display(), e))?;
        Ok(config)
    }
}
