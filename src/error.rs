//! Unified error type for the grid bot
//!
//! Layer-specific errors (`ConfigError`, `GatewayError`, `LedgerError`) convert
//! into `TradingError` so the binary and the orchestrator can reason about a
//! single type when deciding to skip, retry or halt.

use std::fmt;
use std::io;

use crate::config::ConfigError;
use crate::db::LedgerError;
use crate::gateway::GatewayError;

/// Main error type for the grid bot
#[derive(Debug)]
pub enum TradingError {
    // Configuration errors
    ConfigNotFound(String),
    ConfigParse(String),
    ConfigValidation(String),

    // Persistence errors
    Ledger(LedgerError),

    // Exchange errors
    Gateway(GatewayError),

    // Control errors
    Halted(String),

    // IO errors
    FileRead(String),
    FileWrite(String),

    // General errors
    Internal(String),
}

impl TradingError {
    /// Get a user-friendly error message with helpful context
    pub fn user_message(&self) -> String {
        match self {
            TradingError::ConfigNotFound(path) => {
                format!(
                    "Configuration file not found: {}\n\n\
                    💡 Quick fix:\n\
                    1. Run: grid-bot init\n\
                    2. Edit config.toml with your API keys\n\
                    3. Try again",
                    path
                )
            }
            TradingError::ConfigValidation(msg) => {
                format!(
                    "Configuration validation error: {}\n\n\
                    💡 Check config.toml for:\n\
                    - Valid API keys (not placeholders)\n\
                    - Positive numeric values\n\
                    - Proper range values",
                    msg
                )
            }
            TradingError::Gateway(GatewayError::RateLimited(msg)) => {
                format!(
                    "API rate limit exceeded: {}\n\n\
                    💡 Lower max_requests_per_minute in [rate_limits]\n\
                    Kraken counters typically decay within 1-5 minutes",
                    msg
                )
            }
            TradingError::Halted(reason) => {
                format!(
                    "Trading halted: {}\n\n\
                    💡 Inspect open orders on the exchange before restarting:\n\
                    1. Run: grid-bot status\n\
                    2. Cancel any orphaned orders manually\n\
                    3. Run: grid-bot resume",
                    reason
                )
            }
            _ => self.to_string(),
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            TradingError::Gateway(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            TradingError::ConfigNotFound(_)
            | TradingError::ConfigParse(_)
            | TradingError::ConfigValidation(_) => "config",

            TradingError::Ledger(_) => "database",

            TradingError::Gateway(_) => "api",

            TradingError::Halted(_) => "control",

            TradingError::FileRead(_) | TradingError::FileWrite(_) => "io",

            TradingError::Internal(_) => "internal",
        }
    }
}

impl fmt::Display for TradingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradingError::ConfigNotFound(path) => {
                write!(f, "Configuration file not found: {}", path)
            }
            TradingError::ConfigParse(msg) => {
                write!(f, "Configuration parse error: {}", msg)
            }
            TradingError::ConfigValidation(msg) => {
                write!(f, "Configuration validation error: {}", msg)
            }
            TradingError::Ledger(err) => {
                write!(f, "Ledger error: {}", err)
            }
            TradingError::Gateway(err) => {
                write!(f, "Exchange error: {}", err)
            }
            TradingError::Halted(reason) => {
                write!(f, "Trading halted: {}", reason)
            }
            TradingError::FileRead(msg) => {
                write!(f, "File read error: {}", msg)
            }
            TradingError::FileWrite(msg) => {
                write!(f, "File write error: {}", msg)
            }
            TradingError::Internal(msg) => {
                write!(f, "Internal error: {}", msg)
            }
        }
    }
}

impl std::error::Error for TradingError {}

impl From<io::Error> for TradingError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {
                TradingError::FileRead(err.to_string())
            }
            _ => TradingError::Internal(format!("IO error: {}", err)),
        }
    }
}

impl From<ConfigError> for TradingError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::FileNotFound(path) => TradingError::ConfigNotFound(path),
            ConfigError::FileRead(msg) => TradingError::FileRead(msg),
            ConfigError::FileWrite(msg) => TradingError::FileWrite(msg),
            ConfigError::Parse(msg) | ConfigError::Serialize(msg) => TradingError::ConfigParse(msg),
            ConfigError::Validation(msg) => TradingError::ConfigValidation(msg),
        }
    }
}

impl From<LedgerError> for TradingError {
    fn from(err: LedgerError) -> Self {
        TradingError::Ledger(err)
    }
}

impl From<rusqlite::Error> for TradingError {
    fn from(err: rusqlite::Error) -> Self {
        TradingError::Ledger(LedgerError::from(err))
    }
}

impl From<GatewayError> for TradingError {
    fn from(err: GatewayError) -> Self {
        TradingError::Gateway(err)
    }
}

impl From<serde_json::Error> for TradingError {
    fn from(err: serde_json::Error) -> Self {
        TradingError::Internal(format!("JSON error: {}", err))
    }
}

impl From<toml::de::Error> for TradingError {
    fn from(err: toml::de::Error) -> Self {
        TradingError::ConfigParse(format!("TOML parse error: {}", err))
    }
}

/// Result type alias using TradingError
pub type TradingResult<T> = Result<T, TradingError>;
