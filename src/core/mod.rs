// Core trading logic modules

pub mod types;
pub mod events;
pub mod error_handler;
pub mod order_desk;
pub mod grid_engine;
pub mod trend_analyzer;
pub mod stop_loss;
pub mod reinvestor;
pub mod orchestrator;
pub mod report;

// Re-export commonly used types
pub use types::{GridLevel, LevelSide, Margin, RegenerationTrigger, Trade, TradeSide, TradeStatus, Trend, Volatility};
pub use events::{BotEvent, EventSink};
pub use error_handler::{CategoryState, ErrorCategory, ErrorHandler, ErrorRecord, ErrorReport, Severity};
pub use order_desk::{CancelOutcome, OrderDesk, Placement};
pub use grid_engine::{compute_levels, grid_bounds, size_weight, GridBounds, GridEngine, GridParams, RegenerationOutcome, Staleness};
pub use trend_analyzer::{TrendAnalyzer, TrendSnapshot};
pub use stop_loss::{StopLossAction, StopLossController, StopLossState};
pub use reinvestor::{ProfitReinvestor, ReinvestDecision};
pub use orchestrator::{BotStatus, Orchestrator, OrchestratorState, TickReport};
pub use report::{MarketSummary, PerformanceReport};
