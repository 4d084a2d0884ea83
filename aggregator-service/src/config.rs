use serde::{Deserialize, Deserializer};
use std::{fs, path::PathBuf, sync::Arc};
use time::{macros::format_description, Duration, UtcOffset};

use meter_client::store::{JsonFileStore, MemoryStore, StateStore};

use crate::aggregator::{
    Aggregator, AggregatorConfig, DEFAULT_MAX_FUTURE_SKEW, DEFAULT_NOISE_THRESHOLD_KWH,
};

fn de_utc_offset<'de, D>(deserializer: D) -> Result<UtcOffset, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_utc_offset(&raw).map_err(serde::de::Error::custom)
}

/// Parses `+05:30` / `-03:00` style offsets. `Z` and `UTC` mean zero.
pub fn parse_utc_offset(raw: &str) -> Result<UtcOffset, String> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("z") || raw.eq_ignore_ascii_case("utc") {
        return Ok(UtcOffset::UTC);
    }
    UtcOffset::parse(raw, format_description!("[offset_hour sign:mandatory]:[offset_minute]"))
        .map_err(|e| format!("invalid utc offset '{raw}': {e}"))
}

fn default_utc_offset() -> UtcOffset {
    UtcOffset::UTC
}

fn default_noise_threshold() -> f64 {
    DEFAULT_NOISE_THRESHOLD_KWH
}

fn default_max_future_skew_secs() -> i64 {
    DEFAULT_MAX_FUTURE_SKEW.whole_seconds()
}

fn default_max_request_records() -> usize {
    10_000
}

fn default_workers() -> usize {
    4
}

#[derive(Debug, Clone, Deserialize)]
pub struct AggregatorSection {
    #[serde(default = "default_utc_offset", deserialize_with = "de_utc_offset")]
    pub utc_offset: UtcOffset,
    #[serde(default = "default_noise_threshold")]
    pub noise_threshold_kwh: f64,
    /// Readings dated further ahead of the service clock are rejected.
    #[serde(default = "default_max_future_skew_secs")]
    pub max_future_skew_secs: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    Memory,
    JsonFile,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub kind: StoreKind,
    /// Directory for `json_file`; ignored for `memory`.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpSourceConfig {
    pub http_bind_addr: String,
    pub channel_capacity: usize,
    #[serde(default = "default_max_request_records")]
    pub max_request_records: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub aggregator: AggregatorSection,
    pub store: StoreConfig,
    pub source: HttpSourceConfig,
    pub sink: SinkConfig,
    pub api: ApiConfig,
    pub metrics: Option<MetricsConfig>,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        use std::env;

        let path = env::var("AGGREGATOR_CONFIG")
            .unwrap_or_else(|_| "aggregator-config.toml".to_string());
        let contents = fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("failed to read config file '{path}': {e}"))?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        let cfg: AppConfig = toml::from_str(contents)?;
        Ok(cfg)
    }

    pub fn aggregator_config(&self) -> AggregatorConfig {
        AggregatorConfig {
            utc_offset: self.aggregator.utc_offset,
            noise_threshold_kwh: self.aggregator.noise_threshold_kwh,
            max_future_skew: Duration::seconds(self.aggregator.max_future_skew_secs),
        }
    }

    pub fn metrics_enabled(&self) -> bool {
        self.metrics.as_ref().is_some_and(|m| m.enabled)
    }

    /// Builds the aggregator wired to the configured state store.
    pub fn build_aggregator(&self) -> anyhow::Result<Aggregator> {
        let store = self.store.build()?;
        Ok(Aggregator::new(self.aggregator_config()).with_store(store))
    }
}

impl StoreConfig {
    pub fn build(&self) -> anyhow::Result<Arc<dyn StateStore>> {
        match self.kind {
            StoreKind::Memory => Ok(Arc::new(MemoryStore::new())),
            StoreKind::JsonFile => {
                let path = self.path.as_ref().ok_or_else(|| {
                    anyhow::anyhow!("store.path is required for kind = \"json_file\"")
                })?;
                let store = JsonFileStore::new(path.clone())?;
                tracing::info!(path = %path.display(), "using json file state store");
                Ok(Arc::new(store))
            }
        }
    }
}
