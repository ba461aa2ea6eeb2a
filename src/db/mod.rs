//! SQLite persistence for the trade ledger and grid state

use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub mod grid_state;
pub mod margin;
pub mod trade;

pub use grid_state::{GenerationStatus, GridGeneration, GridStateStore, NewGeneration};
pub use margin::{calculate_margins, MarginReport, UnmatchedSell};
pub use trade::{RecordOutcome, TradeLedger};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS trades (
    id                TEXT PRIMARY KEY,
    pair              TEXT NOT NULL,
    side              TEXT NOT NULL,
    requested_price   REAL NOT NULL,
    requested_volume  REAL NOT NULL,
    status            TEXT NOT NULL,
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL,
    filled_at         TEXT,
    external_order_id TEXT,
    filled_volume     REAL NOT NULL DEFAULT 0,
    actual_price      REAL,
    cost              REAL NOT NULL DEFAULT 0,
    fee               REAL NOT NULL DEFAULT 0,
    generation        INTEGER,
    level_index       INTEGER
);

CREATE INDEX IF NOT EXISTS idx_trades_status ON trades(status);
CREATE INDEX IF NOT EXISTS idx_trades_external ON trades(external_order_id);
CREATE INDEX IF NOT EXISTS idx_trades_generation ON trades(generation, level_index);

CREATE TABLE IF NOT EXISTS grid_generations (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    reference_price   REAL NOT NULL,
    range_percent     REAL NOT NULL,
    trigger_reason    TEXT NOT NULL,
    trend             TEXT NOT NULL,
    status            TEXT NOT NULL,
    placement_done    INTEGER NOT NULL DEFAULT 0,
    created_at        TEXT NOT NULL,
    activated_at      TEXT,
    retired_at        TEXT
);

CREATE TABLE IF NOT EXISTS grid_levels (
    generation     INTEGER NOT NULL REFERENCES grid_generations(id),
    level_index    INTEGER NOT NULL,
    target_price   REAL NOT NULL,
    side           TEXT NOT NULL,
    size_fraction  REAL NOT NULL,
    PRIMARY KEY (generation, level_index)
);

CREATE TABLE IF NOT EXISTS bot_state (
    key         TEXT PRIMARY KEY,
    value       TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
";

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("trade {id}: illegal status transition {from} -> {to}")]
    InvalidTransition { id: String, from: String, to: String },

    #[error("trade {0} is filled; execution fields are immutable")]
    ImmutableFill(String),

    #[error("grid generation conflict: {0}")]
    Conflict(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("storage io error: {0}")]
    Io(String),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Shared SQLite connection
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database file and bring the schema up to date
    pub fn new<P: AsRef<Path>>(path: P) -> LedgerResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| LedgerError::Io(e.to_string()))?;
            }
        }

        let conn = Connection::open(path)?;
        // journal_mode returns a row, so it cannot go through execute_batch
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        Self::configure(conn)
    }

    /// Create an in-memory database (for testing)
    pub fn new_in_memory() -> LedgerResult<Self> {
        Self::configure(Connection::open_in_memory()?)
    }

    fn configure(conn: Connection) -> LedgerResult<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    pub fn run_migrations(&self) -> LedgerResult<()> {
        self.conn.lock().execute_batch(SCHEMA)?;
        Ok(())
    }

    pub fn get_connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    pub fn health_check(&self) -> LedgerResult<bool> {
        let result: i32 = self.conn.lock().query_row("SELECT 1", [], |row| row.get(0))?;
        Ok(result == 1)
    }
}

pub(crate) fn to_db_time(time: &chrono::DateTime<chrono::Utc>) -> String {
    time.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

pub(crate) fn from_db_time(value: &str) -> rusqlite::Result<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&chrono::Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}
