// XRP/GBP Grid Trading Bot Library
//
// Rate-limited exchange gateway, grid construction and regeneration, a SQLite
// trade ledger with margin matching, and the control loop that ties them together

pub mod config;  // TOML configuration
pub mod error;   // Unified error handling
pub mod clients; // Exchange transports
pub mod gateway; // Rate limiting, caching and retries
pub mod db;      // SQLite ledger and grid state
pub mod core;

// Re-export error types
pub use error::{TradingError, TradingResult};

// Re-export configuration
pub use config::{BotConfig, ConfigError, TradingConfig};

// Re-export client and gateway types
pub use clients::{ExchangeTransport, KrakenRestClient, TransportError};
pub use gateway::{ApiRequest, Endpoint, ExchangeGateway, GatewayError};

// Re-export database types
pub use db::{calculate_margins, Database, MarginReport, TradeLedger};

// Re-export core trading types
pub use crate::core::{
    BotEvent, ErrorCategory, ErrorHandler, EventSink, GridEngine, Orchestrator, OrchestratorState, Severity, Trade,
    TradeSide, TradeStatus,
};
