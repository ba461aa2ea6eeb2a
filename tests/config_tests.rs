// Integration tests for configuration loading and validation

mod common;

use common::create_test_config;
use std::fs;
use tempfile::TempDir;
use xrp_grid_bot::config::{BotConfig, ConfigError};

#[test]
fn test_default_config_values() {
    let config = BotConfig::default();

    assert_eq!(config.trading.trading_pair, "XRPGBP");
    assert_eq!(config.exchange.base_asset, "XXRP");
    assert_eq!(config.exchange.quote_asset, "ZGBP");
    assert_eq!(config.stop_loss.stop_loss_percentage, 12.0);
    assert_eq!(config.reinvestment.profit_reinvestment_fraction, 0.5);
    assert!(!config.has_valid_api_keys());
}

#[test]
fn test_config_file_roundtrip() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = temp_dir.path().join("nested").join("config.toml");

    let config = create_test_config();
    config.to_file(&config_path).expect("Failed to write config");

    let loaded = BotConfig::from_file(&config_path).expect("Failed to load config");
    assert_eq!(loaded.trading.grid_levels, 4);
    assert_eq!(loaded.trading.total_allocation, 1000.0);
    assert_eq!(loaded.cache.ttl_seconds.get("Ticker"), Some(&0));
    assert_eq!(loaded.retry.max_retries, 2);
    assert!(loaded.has_valid_api_keys());
}

#[test]
fn test_load_or_create_writes_defaults_once() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = temp_dir.path().join("config.toml");

    let created = BotConfig::load_or_create(&config_path).unwrap();
    assert!(config_path.exists());
    assert_eq!(created.trading.grid_levels, 16);

    // A second call reads what is on disk
    let edited = fs::read_to_string(&config_path)
        .unwrap()
        .replace("grid_levels = 16", "grid_levels = 10");
    fs::write(&config_path, edited).unwrap();
    assert_eq!(BotConfig::load_or_create(&config_path).unwrap().trading.grid_levels, 10);
}

#[test]
fn test_missing_file_is_reported() {
    let err = BotConfig::from_file("/nonexistent/grid-bot.toml").unwrap_err();
    assert!(matches!(err, ConfigError::FileNotFound(_)));
}

#[test]
fn test_malformed_toml_is_a_parse_error() {
    let err = BotConfig::from_toml_str("[trading\ngrid_levels = ").unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)));
}

#[test]
fn test_invalid_values_are_rejected_on_load() {
    let toml = r#"
        [exchange]
        api_key = "key"
        api_secret = "c2VjcmV0"

        [trading]
        grid_range_percentage = -4.0
    "#;
    assert!(matches!(BotConfig::from_toml_str(toml), Err(ConfigError::Validation(_))));

    let mut config = create_test_config();
    config.reinvestment.profit_reinvestment_fraction = 1.5;
    assert!(config.validate().is_err());

    let mut config = create_test_config();
    config.stop_loss.stop_loss_percentage = 0.0;
    assert!(config.validate().is_err());

    let mut config = create_test_config();
    config.trading.tick_deadline_seconds = 0;
    assert!(config.validate().is_err());
}

#[test]
fn test_interval_helpers() {
    let mut config = create_test_config();
    config.trading.price_check_interval_minutes = 5;
    config.trading.order_timeout_hours = 1.5;
    config.trading.trend_check_interval_hours = 0.25;

    assert_eq!(config.trading.price_check_interval().as_secs(), 300);
    assert_eq!(config.trading.order_timeout().num_minutes(), 90);
    assert_eq!(config.trading.trend_check_interval().num_minutes(), 15);
}
