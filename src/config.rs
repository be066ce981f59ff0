use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Telegram adapter; disabled when the section is absent
    #[serde(default)]
    pub telegram: Option<TelegramConfig>,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    /// Users allowed to run /link and /unlink
    #[serde(default)]
    pub admin_user_ids: Vec<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Token bucket parameters, applied per source endpoint.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RateLimitConfig {
    /// Bucket size, and the allowance of a source seen for the first time
    #[serde(default = "default_capacity")]
    pub capacity: f64,
    /// Tokens added per window, continuously
    #[serde(default = "default_refill")]
    pub refill: f64,
    #[serde(default = "default_window_secs")]
    pub window_secs: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            refill: default_refill(),
            window_secs: default_window_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct DispatchConfig {
    /// Deliveries queued per (destination, listener) before new ones are dropped
    #[serde(default = "default_lane_capacity")]
    pub lane_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            lane_capacity: default_lane_capacity(),
        }
    }
}

/// Prometheus exporter for the bus counters
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: default_metrics_addr(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("bridgebot.db")
}

/// One day; longer windows make the limiter meaningless.
const MAX_WINDOW_SECS: f64 = 86_400.0;

fn default_capacity() -> f64 {
    10.0
}

fn default_refill() -> f64 {
    10.0
}

fn default_window_secs() -> f64 {
    5.0
}

fn default_lane_capacity() -> usize {
    256
}

fn default_metrics_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9100))
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let rl = &self.rate_limit;
        if !(rl.capacity >= 1.0) {
            anyhow::bail!("rate_limit.capacity must be at least 1, got {}", rl.capacity);
        }
        if !(rl.refill > 0.0) {
            anyhow::bail!("rate_limit.refill must be positive, got {}", rl.refill);
        }
        if !(rl.window_secs > 0.0) || rl.window_secs > MAX_WINDOW_SECS {
            anyhow::bail!(
                "rate_limit.window_secs must be between 0 and {} seconds, got {}",
                MAX_WINDOW_SECS, rl.window_secs
            );
        }
        if self.dispatch.lane_capacity == 0 {
            anyhow::bail!("dispatch.lane_capacity must be at least 1");
        }
        Ok(())
    }
}
