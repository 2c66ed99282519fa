use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub monitor: MonitorConfig,
    pub detector: DetectorConfig,
    pub alerts: AlertConfig,
    pub notifications: NotificationConfig,
    pub database: DatabaseConfig,
    pub providers: ProvidersConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MonitorConfig {
    pub poll_interval_secs: u64,
    /// Maximum blocks processed in one catch-up; older excess is skipped with a logged gap.
    pub max_catchup_blocks: u64,
    /// Blocks re-fetched when the chain tip no longer links up.
    pub reorg_lookback: u64,
    /// Parallel address-detail fetches per block.
    pub detail_fetch_concurrency: usize,
    pub provider_timeout_secs: u64,
    pub commit_retry_limit: u32,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DetectorConfig {
    pub dormancy_threshold_days: i64,
    pub activity_window_minutes: i64,
    pub min_wallets_threshold: usize,
    pub value_threshold_btc: f64,
    /// Dispersion below this reads as coordination (amounts and timing).
    pub similarity_threshold: f64,
    pub zscore_threshold: f64,
    pub zscore_elevated: f64,
    /// Per-address volume samples kept for the statistical detector.
    pub stats_window: usize,
    pub stats_min_samples: usize,
    /// Sliding window over the event stream, in hours.
    pub window_hours: i64,
    pub value_cap_btc: f64,
    pub dormancy_cap_days: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AlertConfig {
    pub cooldown_minutes: i64,
    pub fingerprint_bucket_minutes: i64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct NotificationConfig {
    pub enabled: bool,
    pub webhook_url: Option<String>,
    pub max_per_minute: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ProvidersConfig {
    pub blockchair: ProviderConfig,
    pub blockcypher: ProviderConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ProviderConfig {
    pub enabled: bool,
    pub api_key: Option<String>,
    /// Token refill rate, requests per second.
    pub rate_limit: f64,
    /// Token bucket capacity.
    pub burst: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            max_catchup_blocks: 25,
            reorg_lookback: 6,
            detail_fetch_concurrency: 4,
            provider_timeout_secs: 30,
            commit_retry_limit: 4,
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            dormancy_threshold_days: 365,
            activity_window_minutes: 30,
            min_wallets_threshold: 5,
            value_threshold_btc: 100.0,
            similarity_threshold: 0.3,
            zscore_threshold: 3.0,
            zscore_elevated: 4.0,
            stats_window: 144,
            stats_min_samples: 8,
            window_hours: 24,
            value_cap_btc: 100.0,
            dormancy_cap_days: 3650.0,
        }
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            cooldown_minutes: 30,
            fingerprint_bucket_minutes: 30,
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            webhook_url: None,
            max_per_minute: 30,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "data/dormantwatch.db".into(),
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: None,
            rate_limit: 3.0,
            burst: 3.0,
        }
    }
}

impl ProvidersConfig {
    fn default_blockchair() -> ProviderConfig {
        ProviderConfig {
            rate_limit: 5.0,
            burst: 5.0,
            ..ProviderConfig::default()
        }
    }
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            blockchair: Self::default_blockchair(),
            blockcypher: ProviderConfig::default(),
        }
    }
}

impl Config {
    /// Load config from a TOML file. Falls back to defaults if file doesn't exist.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("Config file {} not found, using defaults", path.display());
            return Self::default();
        }
        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Config loaded from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {e}, using defaults", path.display());
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read {}: {e}, using defaults", path.display());
                Self::default()
            }
        }
    }
}
