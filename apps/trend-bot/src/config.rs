//! Configuration module for the trend bot.
//!
//! Loads YAML configuration, interpolates environment variables and
//! validates the result before anything talks to the broker.
//!
//! # Usage
//!
//! ```rust,ignore
//! use trend_bot::config::load_config;
//!
//! // config.yaml if present, else the built-in defaults
//! let config = load_config(None)?;
//!
//! // Custom path
//! let config = load_config(Some("deploy/spy.yaml"))?;
//! println!("trading {}", config.bot.symbol);
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::broker::alpaca::{AlpacaConfig, AlpacaEnvironment};
use crate::observability::{MetricsConfig, TracingConfig};
use crate::resilience::{CircuitBreakerConfig, PositionLockConfig, RetryPolicy};
use crate::strategy::{Preset, StrategyParams};

/// Configuration used when no file is given and `config.yaml` is absent.
const DEFAULT_CONFIG: &str = include_str!("../config.yaml");

/// Default config file looked up in the working directory.
const DEFAULT_CONFIG_PATH: &str = "config.yaml";

/// Broker calls one cycle can make: clock, account, position, bars, order.
const BROKER_CALLS_PER_CYCLE: u32 = 5;

/// Substrings that mark a credential as an unfilled template value.
const PLACEHOLDER_MARKERS: [&str; 7] = [
    "your_",
    "placeholder",
    "changeme",
    "example",
    "sample",
    "test_key",
    "demo_key",
];

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    ReadError {
        /// Path to the config file.
        path: String,
        /// The underlying IO error.
        source: std::io::Error,
    },

    /// Failed to parse YAML configuration.
    #[error("Failed to parse config YAML: {0}")]
    ParseError(#[from] serde_yaml_bw::Error),

    /// Configuration validation failed.
    #[error("Config validation failed: {0}")]
    ValidationError(String),

    /// Missing required environment variable.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// What to trade.
    pub bot: BotConfig,
    /// Overrides on top of the preset.
    #[serde(default)]
    pub strategy: StrategyOverrides,
    /// Broker connection.
    pub broker: BrokerConfig,
    /// Circuit breaker, retry and position lock settings.
    #[serde(default)]
    pub resilience: ResilienceConfig,
    /// Daily run time.
    #[serde(default)]
    pub schedule: ScheduleConfig,
    /// Directory for circuit breaker, lock and bot state files.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Status file export.
    #[serde(default)]
    pub status: StatusConfig,
    /// Logging, tracing and metrics.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}

/// Traded symbol and preset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    /// Symbol, e.g. `BTC/USD` or `SPY`.
    pub symbol: String,
    /// Parameter preset.
    pub preset: Preset,
}

/// Optional overrides of preset parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrategyOverrides {
    /// SMA window in bars.
    #[serde(default)]
    pub sma_window: Option<usize>,
    /// Stop-loss fraction.
    #[serde(default)]
    pub stop_loss_pct: Option<Decimal>,
    /// Volatility lookback in bars.
    #[serde(default)]
    pub volatility_lookback: Option<usize>,
    /// Volatility threshold.
    #[serde(default)]
    pub volatility_threshold: Option<Decimal>,
    /// Fraction of equity to allocate.
    #[serde(default)]
    pub allocation: Option<Decimal>,
    /// Minimum order quantity.
    #[serde(default)]
    pub min_trade_qty: Option<Decimal>,
    /// Days of history to fetch.
    #[serde(default)]
    pub history_days: Option<i64>,
}

/// Alpaca connection settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// API key ID.
    #[serde(default)]
    pub api_key: String,
    /// API secret key.
    #[serde(default)]
    pub api_secret: String,
    /// Paper trading when true.
    #[serde(default = "default_true")]
    pub paper: bool,
    /// HTTP timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Trading API URL override.
    #[serde(default)]
    pub trading_base_url: Option<String>,
    /// Data API URL override.
    #[serde(default)]
    pub data_base_url: Option<String>,
}

impl std::fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("api_key", &"***")
            .field("api_secret", &"***")
            .field("paper", &self.paper)
            .field("timeout_secs", &self.timeout_secs)
            .field("trading_base_url", &self.trading_base_url)
            .field("data_base_url", &self.data_base_url)
            .finish()
    }
}

const fn default_true() -> bool {
    true
}

const fn default_timeout_secs() -> u64 {
    30
}

/// Reliability layer settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// Broker circuit breaker.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,
    /// Retry policy for broker calls.
    #[serde(default)]
    pub retry: RetrySettings,
    /// Rebalance position lock.
    #[serde(default)]
    pub position_lock: PositionLockSettings,
}

/// Circuit breaker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    /// Name of the protected dependency; also names the state file.
    #[serde(default = "default_breaker_name")]
    pub name: String,
    /// Consecutive failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Seconds before an open circuit admits a probe.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            name: default_breaker_name(),
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

fn default_breaker_name() -> String {
    "alpaca".to_string()
}

const fn default_failure_threshold() -> u32 {
    5
}

const fn default_cooldown_secs() -> u64 {
    300
}

/// Retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First backoff delay in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Backoff cap in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Jitter as a fraction of the delay.
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_base_delay_ms() -> u64 {
    1_000
}

const fn default_max_delay_ms() -> u64 {
    30_000
}

const fn default_jitter_ratio() -> f64 {
    0.5
}

/// Position lock settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionLockSettings {
    /// Lock name; the file is `<state_dir>/<name>.lock`.
    #[serde(default = "default_lock_name")]
    pub name: String,
    /// Seconds after which a held lock may be reclaimed.
    #[serde(default = "default_max_hold_secs")]
    pub max_hold_secs: u64,
    /// Milliseconds between acquisition attempts.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Seconds to wait for the lock before skipping the cycle.
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

impl Default for PositionLockSettings {
    fn default() -> Self {
        Self {
            name: default_lock_name(),
            max_hold_secs: default_max_hold_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
        }
    }
}

fn default_lock_name() -> String {
    "position".to_string()
}

const fn default_max_hold_secs() -> u64 {
    900
}

const fn default_poll_interval_ms() -> u64 {
    100
}

const fn default_acquire_timeout_secs() -> u64 {
    30
}

/// Daily run time at a fixed UTC offset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Hour of day (0-23).
    #[serde(default = "default_hour")]
    pub hour: u32,
    /// Minute (0-59).
    #[serde(default)]
    pub minute: u32,
    /// Offset from UTC in hours (e.g. -8 for PST).
    #[serde(default = "default_utc_offset_hours")]
    pub utc_offset_hours: i32,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            hour: default_hour(),
            minute: 0,
            utc_offset_hours: default_utc_offset_hours(),
        }
    }
}

const fn default_hour() -> u32 {
    12
}

const fn default_utc_offset_hours() -> i32 {
    -8
}

/// Status file export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusConfig {
    /// Whether to write the status file.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Status file path; defaults to `<state_dir>/status.json`.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Prometheus exporter.
    #[serde(default)]
    pub metrics: MetricsSettings,
    /// Tracing export.
    #[serde(default)]
    pub tracing: TracingSettings,
}

/// Prometheus exporter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSettings {
    /// Start the exporter.
    #[serde(default)]
    pub enabled: bool,
    /// Listen address.
    #[serde(default = "default_metrics_addr")]
    pub listen_addr: String,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: default_metrics_addr(),
        }
    }
}

fn default_metrics_addr() -> String {
    "0.0.0.0:9090".to_string()
}

/// OTLP tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracingSettings {
    /// OTLP endpoint; empty disables export.
    #[serde(default)]
    pub otlp_endpoint: String,
    /// Service name.
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// Sampling ratio (0.0 to 1.0).
    #[serde(default = "default_sampling_ratio")]
    pub sampling_ratio: f64,
}

impl Default for TracingSettings {
    fn default() -> Self {
        Self {
            otlp_endpoint: String::new(),
            service_name: default_service_name(),
            sampling_ratio: default_sampling_ratio(),
        }
    }
}

fn default_service_name() -> String {
    "trend-bot".to_string()
}

const fn default_sampling_ratio() -> f64 {
    1.0
}

impl Config {
    /// Preset parameters with overrides applied.
    #[must_use]
    pub fn strategy_params(&self) -> StrategyParams {
        let mut params = self.bot.preset.params();
        let o = &self.strategy;
        if let Some(v) = o.sma_window {
            params.sma_window = v;
        }
        if let Some(v) = o.stop_loss_pct {
            params.stop_loss_pct = v;
        }
        if let Some(v) = o.volatility_lookback {
            params.volatility_lookback = v;
        }
        if let Some(v) = o.volatility_threshold {
            params.volatility_threshold = v;
        }
        if let Some(v) = o.allocation {
            params.allocation = v;
        }
        if let Some(v) = o.min_trade_qty {
            params.min_trade_qty = v;
        }
        if let Some(v) = o.history_days {
            params.history_days = v;
        }
        params
    }

    /// Alpaca adapter configuration.
    #[must_use]
    pub fn alpaca_config(&self) -> AlpacaConfig {
        let environment = if self.broker.paper {
            AlpacaEnvironment::Paper
        } else {
            AlpacaEnvironment::Live
        };
        let mut config = AlpacaConfig::new(
            self.broker.api_key.clone(),
            self.broker.api_secret.clone(),
            environment,
        )
        .with_timeout(Duration::from_secs(self.broker.timeout_secs));
        config.trading_base_url.clone_from(&self.broker.trading_base_url);
        config.data_base_url.clone_from(&self.broker.data_base_url);
        config
    }

    /// Circuit breaker configuration.
    #[must_use]
    pub const fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.resilience.circuit_breaker.failure_threshold,
            cooldown: Duration::from_secs(self.resilience.circuit_breaker.cooldown_secs),
        }
    }

    /// Retry policy.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        let retry = &self.resilience.retry;
        RetryPolicy {
            max_retries: retry.max_retries,
            base_delay: Duration::from_millis(retry.base_delay_ms),
            max_delay: Duration::from_millis(retry.max_delay_ms),
            jitter_ratio: retry.jitter_ratio,
        }
    }

    /// Position lock configuration.
    #[must_use]
    pub fn position_lock_config(&self) -> PositionLockConfig {
        let lock = &self.resilience.position_lock;
        PositionLockConfig {
            dir: self.state_dir.clone(),
            name: lock.name.clone(),
            max_hold: Duration::from_secs(lock.max_hold_secs),
            poll_interval: Duration::from_millis(lock.poll_interval_ms),
        }
    }

    /// Longest a cycle can spend in broker calls: every call timing out on
    /// every attempt, with the longest backoff between attempts.
    #[must_use]
    pub fn worst_case_cycle_duration(&self) -> Duration {
        let policy = self.retry_policy();
        let per_call = Duration::from_secs(self.broker.timeout_secs)
            .saturating_mul(policy.max_retries.saturating_add(1))
            .saturating_add(policy.worst_case_backoff());
        per_call.saturating_mul(BROKER_CALLS_PER_CYCLE)
    }

    /// How long a cycle waits for the position lock.
    #[must_use]
    pub const fn lock_acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.resilience.position_lock.acquire_timeout_secs)
    }

    /// Status file path, if export is enabled.
    #[must_use]
    pub fn status_path(&self) -> Option<PathBuf> {
        if !self.status.enabled {
            return None;
        }
        Some(
            self.status
                .path
                .clone()
                .unwrap_or_else(|| self.state_dir.join("status.json")),
        )
    }

    /// Tracing configuration.
    #[must_use]
    pub fn tracing_config(&self) -> TracingConfig {
        let settings = &self.observability.tracing;
        let mut config = TracingConfig {
            sampling_ratio: settings.sampling_ratio,
            ..TracingConfig::default()
        }
        .service_name(settings.service_name.clone());
        if !settings.otlp_endpoint.is_empty() {
            config = config.with_endpoint(settings.otlp_endpoint.clone());
        }
        config
    }

    /// Metrics exporter configuration, if enabled.
    ///
    /// The address was checked by validation.
    #[must_use]
    pub fn metrics_config(&self) -> Option<MetricsConfig> {
        let metrics = &self.observability.metrics;
        if !metrics.enabled {
            return None;
        }
        metrics
            .listen_addr
            .parse::<SocketAddr>()
            .ok()
            .map(MetricsConfig::with_addr)
    }
}

/// Load configuration from a YAML file.
///
/// With `None`, `config.yaml` in the working directory is used when present
/// and the built-in defaults otherwise.
///
/// # Errors
///
/// Returns a `ConfigError` if the file cannot be read, parsed or validated.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let contents = match path {
        Some(path) => read_file(path)?,
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => read_file(DEFAULT_CONFIG_PATH)?,
        None => {
            tracing::debug!("No config.yaml found, using built-in defaults");
            DEFAULT_CONFIG.to_string()
        }
    };
    load_config_from_string(&contents)
}

fn read_file(path: &str) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.to_string(),
        source: e,
    })
}

/// Load configuration from a YAML string (useful for testing).
///
/// # Errors
///
/// Returns a `ConfigError` if the YAML cannot be parsed or validated.
pub fn load_config_from_string(yaml: &str) -> Result<Config, ConfigError> {
    let interpolated = interpolate_env_vars(yaml);
    let config: Config = serde_yaml_bw::from_str(&interpolated)?;
    validate_config(&config)?;
    Ok(config)
}

/// Interpolate environment variables in a string.
///
/// Supports both `${VAR}` and `${VAR:-default}` syntax.
#[allow(clippy::expect_used)] // Regex is compile-time constant; expect() is safe here
fn interpolate_env_vars(input: &str) -> String {
    use std::sync::OnceLock;

    static ENV_VAR_REGEX: OnceLock<regex::Regex> = OnceLock::new();

    let re = ENV_VAR_REGEX.get_or_init(|| {
        regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
            .expect("env var regex is valid")
    });

    re.replace_all(input, |cap: &regex::Captures<'_>| {
        let default_value = cap.get(2).map_or("", |m| m.as_str());
        match std::env::var(&cap[1]) {
            Ok(v) if !v.is_empty() => v,
            _ => default_value.to_string(),
        }
    })
    .into_owned()
}

/// Validate configuration values.
fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.bot.symbol.trim().is_empty() {
        return Err(ConfigError::ValidationError(
            "bot.symbol must not be empty".to_string(),
        ));
    }

    validate_credentials(&config.broker)?;

    let params = config.strategy_params();
    if params.allocation <= Decimal::ZERO || params.allocation > Decimal::ONE {
        return Err(ConfigError::ValidationError(
            "allocation must be in (0, 1]".to_string(),
        ));
    }
    if params.stop_loss_pct <= Decimal::ZERO || params.stop_loss_pct >= Decimal::ONE {
        return Err(ConfigError::ValidationError(
            "stop_loss_pct must be in (0, 1)".to_string(),
        ));
    }
    if params.volatility_threshold <= Decimal::ZERO {
        return Err(ConfigError::ValidationError(
            "volatility_threshold must be positive".to_string(),
        ));
    }
    if params.sma_window < 2 {
        return Err(ConfigError::ValidationError(
            "sma_window must be at least 2".to_string(),
        ));
    }
    if params.volatility_lookback == 0 {
        return Err(ConfigError::ValidationError(
            "volatility_lookback must be at least 1".to_string(),
        ));
    }
    if params.min_trade_qty <= Decimal::ZERO {
        return Err(ConfigError::ValidationError(
            "min_trade_qty must be positive".to_string(),
        ));
    }
    if params.history_days <= 0 {
        return Err(ConfigError::ValidationError(
            "history_days must be positive".to_string(),
        ));
    }

    let resilience = &config.resilience;
    if resilience.circuit_breaker.failure_threshold == 0 {
        return Err(ConfigError::ValidationError(
            "circuit_breaker.failure_threshold must be at least 1".to_string(),
        ));
    }
    if resilience.circuit_breaker.name.trim().is_empty() {
        return Err(ConfigError::ValidationError(
            "circuit_breaker.name must not be empty".to_string(),
        ));
    }
    if resilience.retry.base_delay_ms > resilience.retry.max_delay_ms {
        return Err(ConfigError::ValidationError(
            "retry.base_delay_ms must not exceed retry.max_delay_ms".to_string(),
        ));
    }
    if !(0.0..=1.0).contains(&resilience.retry.jitter_ratio) {
        return Err(ConfigError::ValidationError(
            "retry.jitter_ratio must be between 0.0 and 1.0".to_string(),
        ));
    }
    if resilience.position_lock.max_hold_secs == 0 || resilience.position_lock.poll_interval_ms == 0
    {
        return Err(ConfigError::ValidationError(
            "position_lock.max_hold_secs and poll_interval_ms must be positive".to_string(),
        ));
    }
    let worst_case = config.worst_case_cycle_duration();
    if Duration::from_secs(resilience.position_lock.max_hold_secs) < worst_case {
        return Err(ConfigError::ValidationError(format!(
            "position_lock.max_hold_secs ({}) is shorter than a worst-case cycle ({}s): \
             raise it or lower broker.timeout_secs / retry.max_retries",
            resilience.position_lock.max_hold_secs,
            worst_case.as_secs_f64().ceil()
        )));
    }

    if config.schedule.hour > 23 || config.schedule.minute > 59 {
        return Err(ConfigError::ValidationError(format!(
            "schedule time {:02}:{:02} is not a valid time of day",
            config.schedule.hour, config.schedule.minute
        )));
    }
    if !(-12..=14).contains(&config.schedule.utc_offset_hours) {
        return Err(ConfigError::ValidationError(
            "schedule.utc_offset_hours must be between -12 and 14".to_string(),
        ));
    }

    let tracing = &config.observability.tracing;
    if !(0.0..=1.0).contains(&tracing.sampling_ratio) {
        return Err(ConfigError::ValidationError(
            "tracing.sampling_ratio must be between 0.0 and 1.0".to_string(),
        ));
    }
    let metrics = &config.observability.metrics;
    if metrics.enabled && metrics.listen_addr.parse::<SocketAddr>().is_err() {
        return Err(ConfigError::ValidationError(format!(
            "metrics.listen_addr '{}' is not a socket address",
            metrics.listen_addr
        )));
    }

    Ok(())
}

fn validate_credentials(broker: &BrokerConfig) -> Result<(), ConfigError> {
    for (name, value) in [
        ("broker.api_key", &broker.api_key),
        ("broker.api_secret", &broker.api_secret),
    ] {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingEnvVar(format!(
                "{name} (set ALPACA_API_KEY and ALPACA_SECRET_KEY)"
            )));
        }
        let lower = value.to_lowercase();
        if let Some(marker) = PLACEHOLDER_MARKERS.iter().find(|m| lower.contains(*m)) {
            return Err(ConfigError::ValidationError(format!(
                "{name} contains placeholder value '{marker}'"
            )));
        }
    }
    if broker.api_key == broker.api_secret {
        return Err(ConfigError::ValidationError(
            "broker.api_key and broker.api_secret are identical".to_string(),
        ));
    }
    Ok(())
}
