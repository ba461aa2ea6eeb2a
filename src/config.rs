// Configuration management for the grid bot

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Complete bot configuration structure matching config.toml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    pub exchange: ExchangeConfig,
    pub trading: TradingConfig,
    #[serde(default)]
    pub trend: TrendConfig,
    #[serde(default)]
    pub stop_loss: StopLossConfig,
    #[serde(default)]
    pub reinvestment: ReinvestmentConfig,
    #[serde(default)]
    pub rate_limits: RateLimitConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub errors: ErrorHandlerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    pub api_key: String,
    pub api_secret: String,
    #[serde(default = "default_rest_url")]
    pub rest_url: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    /// Balance key of the traded asset (Kraken's `XXRP`)
    #[serde(default = "default_base_asset")]
    pub base_asset: String,
    /// Balance key of the quote currency (Kraken's `ZGBP`)
    #[serde(default = "default_quote_asset")]
    pub quote_asset: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    #[serde(default = "default_trading_pair")]
    pub trading_pair: String,
    #[serde(default = "default_grid_range")]
    pub grid_range_percentage: f64,
    #[serde(default = "default_grid_levels")]
    pub grid_levels: usize,
    #[serde(default = "default_total_allocation")]
    pub total_allocation: f64,
    #[serde(default = "default_price_check_interval")]
    pub price_check_interval_minutes: u64,
    #[serde(default = "default_order_timeout")]
    pub order_timeout_hours: f64,
    #[serde(default = "default_trend_check_interval")]
    pub trend_check_interval_hours: f64,
    #[serde(default = "default_true")]
    pub dynamic_sizing: bool,
    /// Power-law exponent for level spacing (must be > 1)
    #[serde(default = "default_spacing_exponent")]
    pub spacing_exponent: f64,
    /// How strongly dynamic sizing skews allocation with distance
    #[serde(default = "default_sizing_strength")]
    pub sizing_strength: f64,
    /// Range multiplier applied while the market is trending
    #[serde(default = "default_trending_range_multiplier")]
    pub trending_range_multiplier: f64,
    #[serde(default = "default_price_decimals")]
    pub price_decimals: u32,
    #[serde(default = "default_volume_decimals")]
    pub volume_decimals: u32,
    #[serde(default = "default_min_order_volume")]
    pub min_order_volume: f64,
    #[serde(default = "default_tick_deadline")]
    pub tick_deadline_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_history_size")]
    pub price_history_size: usize,
    /// Percentage change across the window that counts as a trend
    #[serde(default = "default_trend_threshold")]
    pub trend_threshold_percent: f64,
    /// Standard deviation of returns (percent) above which volatility is high
    #[serde(default = "default_volatility_threshold")]
    pub volatility_threshold_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopLossConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_stop_loss")]
    pub stop_loss_percentage: f64,
    #[serde(default = "default_stop_loss_cooldown")]
    pub cooldown_minutes: u64,
    #[serde(default = "default_high_volatility_multiplier")]
    pub high_volatility_multiplier: f64,
    #[serde(default = "default_bearish_multiplier")]
    pub bearish_multiplier: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReinvestmentConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_reinvestment_fraction")]
    pub profit_reinvestment_fraction: f64,
    /// How far below market the reinvestment buy is placed
    #[serde(default = "default_reinvestment_discount")]
    pub price_discount_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_requests_per_second")]
    pub max_requests_per_second: f64,
    #[serde(default = "default_requests_per_minute")]
    pub max_requests_per_minute: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_size")]
    pub max_entries: usize,
    #[serde(default = "default_cache_ttl")]
    pub default_ttl_seconds: u64,
    /// Per-endpoint TTLs keyed by Kraken method name
    #[serde(default = "default_ttl_table")]
    pub ttl_seconds: HashMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_seconds: f64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_max_delay")]
    pub max_delay_seconds: f64,
    #[serde(default = "default_retryable_status_codes")]
    pub retryable_status_codes: Vec<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorHandlerConfig {
    #[serde(default = "default_max_log_size")]
    pub max_log_size: usize,
    #[serde(default)]
    pub error_log_path: Option<String>,
    /// Cooldown per error category, keyed by category name
    #[serde(default = "default_cooldown_table")]
    pub cooldown_minutes: HashMap<String, u64>,
    #[serde(default = "default_notification_table")]
    pub max_notifications_per_hour: HashMap<String, u32>,
    #[serde(default = "default_cooldown_fallback")]
    pub default_cooldown_minutes: u64,
    #[serde(default = "default_notification_fallback")]
    pub default_notifications_per_hour: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Where `grid-bot report` writes its JSON files
    #[serde(default = "default_report_dir")]
    pub report_dir: String,
}

// Default value functions
fn default_rest_url() -> String { "https://api.kraken.com".to_string() }
fn default_request_timeout() -> u64 { 30 }
fn default_base_asset() -> String { "XXRP".to_string() }
fn default_quote_asset() -> String { "ZGBP".to_string() }
fn default_trading_pair() -> String { "XRPGBP".to_string() }
fn default_grid_range() -> f64 { 4.0 }
fn default_grid_levels() -> usize { 16 }
fn default_total_allocation() -> f64 { 100.0 }
fn default_price_check_interval() -> u64 { 5 }
fn default_order_timeout() -> f64 { 24.0 }
fn default_trend_check_interval() -> f64 { 6.0 }
fn default_spacing_exponent() -> f64 { 1.5 }
fn default_sizing_strength() -> f64 { 1.0 }
fn default_trending_range_multiplier() -> f64 { 1.5 }
fn default_price_decimals() -> u32 { 5 }
fn default_volume_decimals() -> u32 { 1 }
fn default_min_order_volume() -> f64 { 1.0 }
fn default_tick_deadline() -> u64 { 120 }
fn default_history_size() -> usize { 12 }
fn default_trend_threshold() -> f64 { 2.0 }
fn default_volatility_threshold() -> f64 { 1.0 }
fn default_stop_loss() -> f64 { 12.0 }
fn default_stop_loss_cooldown() -> u64 { 60 }
fn default_high_volatility_multiplier() -> f64 { 1.25 }
fn default_bearish_multiplier() -> f64 { 0.8 }
fn default_reinvestment_fraction() -> f64 { 0.5 }
fn default_reinvestment_discount() -> f64 { 0.5 }
fn default_requests_per_second() -> f64 { 1.0 }
fn default_requests_per_minute() -> u32 { 15 }
fn default_cache_size() -> usize { 100 }
fn default_cache_ttl() -> u64 { 60 }
fn default_max_retries() -> u32 { 3 }
fn default_base_delay() -> f64 { 1.0 }
fn default_backoff_factor() -> f64 { 2.0 }
fn default_max_delay() -> f64 { 30.0 }
fn default_retryable_status_codes() -> Vec<u16> { vec![408, 429, 500, 502, 503, 504] }
fn default_max_log_size() -> usize { 1000 }
fn default_cooldown_fallback() -> u64 { 5 }
fn default_notification_fallback() -> u32 { 5 }
fn default_db_path() -> String { "data/grid_bot.db".to_string() }
fn default_report_dir() -> String { "data/reports".to_string() }
fn default_true() -> bool { true }

fn default_ttl_table() -> HashMap<String, u64> {
    [
        ("Time", 60),
        ("Assets", 3600),
        ("AssetPairs", 3600),
        ("Ticker", 15),
        ("Depth", 5),
        ("Trades", 30),
        ("Spread", 5),
        ("OHLC", 60),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

fn default_cooldown_table() -> HashMap<String, u64> {
    [
        ("api_timeout", 5),
        ("network_error", 10),
        ("data_processing_error", 15),
        ("exchange_error", 5),
        ("order_placement_error", 10),
        ("configuration_error", 60),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

fn default_notification_table() -> HashMap<String, u32> {
    [
        ("api_timeout", 3),
        ("network_error", 3),
        ("data_processing_error", 5),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            api_key: "YOUR_API_KEY".to_string(),
            api_secret: "YOUR_API_SECRET".to_string(),
            rest_url: default_rest_url(),
            request_timeout_seconds: default_request_timeout(),
            base_asset: default_base_asset(),
            quote_asset: default_quote_asset(),
        }
    }
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            trading_pair: default_trading_pair(),
            grid_range_percentage: default_grid_range(),
            grid_levels: default_grid_levels(),
            total_allocation: default_total_allocation(),
            price_check_interval_minutes: default_price_check_interval(),
            order_timeout_hours: default_order_timeout(),
            trend_check_interval_hours: default_trend_check_interval(),
            dynamic_sizing: true,
            spacing_exponent: default_spacing_exponent(),
            sizing_strength: default_sizing_strength(),
            trending_range_multiplier: default_trending_range_multiplier(),
            price_decimals: default_price_decimals(),
            volume_decimals: default_volume_decimals(),
            min_order_volume: default_min_order_volume(),
            tick_deadline_seconds: default_tick_deadline(),
        }
    }
}

impl Default for TrendConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            price_history_size: default_history_size(),
            trend_threshold_percent: default_trend_threshold(),
            volatility_threshold_percent: default_volatility_threshold(),
        }
    }
}

impl Default for StopLossConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            stop_loss_percentage: default_stop_loss(),
            cooldown_minutes: default_stop_loss_cooldown(),
            high_volatility_multiplier: default_high_volatility_multiplier(),
            bearish_multiplier: default_bearish_multiplier(),
        }
    }
}

impl Default for ReinvestmentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            profit_reinvestment_fraction: default_reinvestment_fraction(),
            price_discount_percent: default_reinvestment_discount(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests_per_second: default_requests_per_second(),
            max_requests_per_minute: default_requests_per_minute(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_cache_size(),
            default_ttl_seconds: default_cache_ttl(),
            ttl_seconds: default_ttl_table(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_seconds: default_base_delay(),
            backoff_factor: default_backoff_factor(),
            max_delay_seconds: default_max_delay(),
            retryable_status_codes: default_retryable_status_codes(),
        }
    }
}

impl Default for ErrorHandlerConfig {
    fn default() -> Self {
        Self {
            max_log_size: default_max_log_size(),
            error_log_path: None,
            cooldown_minutes: default_cooldown_table(),
            max_notifications_per_hour: default_notification_table(),
            default_cooldown_minutes: default_cooldown_fallback(),
            default_notifications_per_hour: default_notification_fallback(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            report_dir: default_report_dir(),
        }
    }
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            exchange: ExchangeConfig::default(),
            trading: TradingConfig::default(),
            trend: TrendConfig::default(),
            stop_loss: StopLossConfig::default(),
            reinvestment: ReinvestmentConfig::default(),
            rate_limits: RateLimitConfig::default(),
            cache: CacheConfig::default(),
            retry: RetryConfig::default(),
            errors: ErrorHandlerConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl TradingConfig {
    pub fn price_check_interval(&self) -> Duration {
        Duration::from_secs(self.price_check_interval_minutes * 60)
    }

    pub fn tick_deadline(&self) -> Duration {
        Duration::from_secs(self.tick_deadline_seconds)
    }

    pub fn order_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds((self.order_timeout_hours * 3600.0) as i64)
    }

    pub fn trend_check_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds((self.trend_check_interval_hours * 3600.0) as i64)
    }
}

impl BotConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        if !path_ref.exists() {
            return Err(ConfigError::FileNotFound(path_ref.display().to_string()));
        }

        let content = fs::read_to_string(path_ref)
            .map_err(|e| ConfigError::FileRead(e.to_string()))?;

        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: BotConfig = toml::from_str(content)
            .map_err(|e| ConfigError::Parse(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Serialize(e.to_string()))?;

        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::FileWrite(e.to_string()))?;
            }
        }

        fs::write(path, content)
            .map_err(|e| ConfigError::FileWrite(e.to_string()))?;

        Ok(())
    }

    /// Load configuration from file, or create default if file doesn't exist
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            let config = Self::default();
            config.to_file(&path)?;
            tracing::info!("📁 Created default config file: {}", path.as_ref().display());
            Ok(config)
        }
    }

    /// Check if API keys are configured
    pub fn has_valid_api_keys(&self) -> bool {
        !self.exchange.api_key.contains("YOUR_API_KEY")
            && !self.exchange.api_secret.contains("YOUR_API_SECRET")
            && !self.exchange.api_key.is_empty()
            && !self.exchange.api_secret.is_empty()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.trading;

        if t.trading_pair.trim().is_empty() {
            return Err(ConfigError::Validation("trading_pair must not be empty".to_string()));
        }

        if t.grid_levels < 2 {
            return Err(ConfigError::Validation("grid_levels must be at least 2".to_string()));
        }

        if t.grid_range_percentage <= 0.0 || t.grid_range_percentage >= 200.0 {
            return Err(ConfigError::Validation(
                "grid_range_percentage must be between 0 and 200".to_string(),
            ));
        }

        if t.total_allocation <= 0.0 {
            return Err(ConfigError::Validation("total_allocation must be positive".to_string()));
        }

        if t.price_check_interval_minutes == 0 {
            return Err(ConfigError::Validation(
                "price_check_interval_minutes must be greater than 0".to_string(),
            ));
        }

        if t.order_timeout_hours <= 0.0 {
            return Err(ConfigError::Validation("order_timeout_hours must be positive".to_string()));
        }

        if t.trend_check_interval_hours <= 0.0 {
            return Err(ConfigError::Validation(
                "trend_check_interval_hours must be positive".to_string(),
            ));
        }

        if t.spacing_exponent <= 1.0 {
            return Err(ConfigError::Validation("spacing_exponent must be greater than 1".to_string()));
        }

        if t.sizing_strength < 0.0 {
            return Err(ConfigError::Validation("sizing_strength must be non-negative".to_string()));
        }

        if t.trending_range_multiplier <= 0.0 {
            return Err(ConfigError::Validation(
                "trending_range_multiplier must be positive".to_string(),
            ));
        }

        if t.tick_deadline_seconds == 0 {
            return Err(ConfigError::Validation("tick_deadline_seconds must be greater than 0".to_string()));
        }

        if self.trend.price_history_size < 2 {
            return Err(ConfigError::Validation("price_history_size must be at least 2".to_string()));
        }

        if self.trend.trend_threshold_percent <= 0.0 || self.trend.volatility_threshold_percent <= 0.0 {
            return Err(ConfigError::Validation("trend thresholds must be positive".to_string()));
        }

        if self.stop_loss.stop_loss_percentage <= 0.0 || self.stop_loss.stop_loss_percentage >= 100.0 {
            return Err(ConfigError::Validation(
                "stop_loss_percentage must be between 0 and 100".to_string(),
            ));
        }

        let fraction = self.reinvestment.profit_reinvestment_fraction;
        if !(0.0..=1.0).contains(&fraction) {
            return Err(ConfigError::Validation(
                "profit_reinvestment_fraction must be between 0 and 1".to_string(),
            ));
        }

        if self.rate_limits.max_requests_per_second <= 0.0 || self.rate_limits.max_requests_per_minute == 0 {
            return Err(ConfigError::Validation("rate limits must be positive".to_string()));
        }

        if self.retry.backoff_factor < 1.0 {
            return Err(ConfigError::Validation("backoff_factor must be at least 1".to_string()));
        }

        if self.retry.base_delay_seconds < 0.0 || self.retry.max_delay_seconds < 0.0 {
            return Err(ConfigError::Validation("retry delays must be non-negative".to_string()));
        }

        if self.errors.max_log_size == 0 {
            return Err(ConfigError::Validation("max_log_size must be greater than 0".to_string()));
        }

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file: {0}")]
    FileRead(String),

    #[error("Failed to write config file: {0}")]
    FileWrite(String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Failed to serialize config: {0}")]
    Serialize(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),
}
