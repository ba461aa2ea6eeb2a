//! Trade ledger: append/update store keyed by trade id

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::sync::Arc;
use tracing::debug;

use crate::core::types::{Trade, TradeSide, TradeStatus};
use crate::db::margin::{calculate_margins, MarginReport};
use crate::db::{from_db_time, to_db_time, Database, LedgerError, LedgerResult};

const TRADE_COLUMNS: &str = "id, pair, side, requested_price, requested_volume, status,
    created_at, updated_at, filled_at, external_order_id, filled_volume,
    actual_price, cost, fee, generation, level_index";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Inserted,
    Updated,
    /// A filled trade re-recorded with identical execution fields
    Unchanged,
}

#[derive(Clone)]
pub struct TradeLedger {
    conn: Arc<Mutex<Connection>>,
}

impl TradeLedger {
    pub fn new(db: &Database) -> Self {
        Self {
            conn: db.get_connection(),
        }
    }

    fn from_row(row: &Row) -> rusqlite::Result<Trade> {
        let side: String = row.get(2)?;
        let status: String = row.get(5)?;
        let filled_at: Option<String> = row.get(8)?;
        let level_index: Option<i64> = row.get(15)?;

        Ok(Trade {
            id: row.get(0)?,
            pair: row.get(1)?,
            side: TradeSide::parse(&side).ok_or_else(|| bad_enum(2, &side))?,
            requested_price: row.get(3)?,
            requested_volume: row.get(4)?,
            status: TradeStatus::parse(&status).ok_or_else(|| bad_enum(5, &status))?,
            created_at: from_db_time(&row.get::<_, String>(6)?)?,
            updated_at: from_db_time(&row.get::<_, String>(7)?)?,
            filled_at: filled_at.as_deref().map(from_db_time).transpose()?,
            external_order_id: row.get(9)?,
            filled_volume: row.get(10)?,
            actual_price: row.get(11)?,
            cost: row.get(12)?,
            fee: row.get(13)?,
            generation: row.get(14)?,
            level_index: level_index.map(|i| i as usize),
        })
    }

    /// Insert a new trade or apply a forward update to an existing one.
    ///
    /// Runs under `BEGIN IMMEDIATE` so a second writer on the same file
    /// waits for the lock instead of interleaving its read-modify-write.
    pub fn record(&self, trade: &Trade) -> LedgerResult<RecordOutcome> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing = tx
            .query_row(
                &format!("SELECT {} FROM trades WHERE id = ?1", TRADE_COLUMNS),
                params![trade.id],
                Self::from_row,
            )
            .optional()?;

        let outcome = match existing {
            None => {
                tx.execute(
                    &format!(
                        "INSERT INTO trades ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                        TRADE_COLUMNS
                    ),
                    params![
                        trade.id,
                        trade.pair,
                        trade.side.as_str(),
                        trade.requested_price,
                        trade.requested_volume,
                        trade.status.as_str(),
                        to_db_time(&trade.created_at),
                        to_db_time(&trade.updated_at),
                        trade.filled_at.as_ref().map(to_db_time),
                        trade.external_order_id,
                        trade.filled_volume,
                        trade.actual_price,
                        trade.cost,
                        trade.fee,
                        trade.generation,
                        trade.level_index.map(|i| i as i64),
                    ],
                )?;
                RecordOutcome::Inserted
            }
            Some(old) if old.status == TradeStatus::Filled => {
                if trade.status == TradeStatus::Filled && old.same_execution(trade) {
                    RecordOutcome::Unchanged
                } else {
                    return Err(LedgerError::ImmutableFill(trade.id.clone()));
                }
            }
            Some(old) => {
                if !old.status.can_transition_to(trade.status) {
                    return Err(LedgerError::InvalidTransition {
                        id: trade.id.clone(),
                        from: old.status.to_string(),
                        to: trade.status.to_string(),
                    });
                }

                tx.execute(
                    "UPDATE trades SET status = ?2, updated_at = ?3, filled_at = ?4,
                        external_order_id = ?5, filled_volume = ?6, actual_price = ?7,
                        cost = ?8, fee = ?9
                     WHERE id = ?1",
                    params![
                        trade.id,
                        trade.status.as_str(),
                        to_db_time(&trade.updated_at),
                        trade.filled_at.as_ref().map(to_db_time),
                        trade.external_order_id.as_ref().or(old.external_order_id.as_ref()),
                        trade.filled_volume,
                        trade.actual_price,
                        trade.cost,
                        trade.fee,
                    ],
                )?;
                RecordOutcome::Updated
            }
        };

        tx.commit()?;
        debug!("📒 Recorded trade {} ({}) -> {:?}", trade.id, trade.status, outcome);
        Ok(outcome)
    }

    pub fn find_by_id(&self, id: &str) -> LedgerResult<Option<Trade>> {
        let conn = self.conn.lock();
        let trade = conn
            .query_row(
                &format!("SELECT {} FROM trades WHERE id = ?1", TRADE_COLUMNS),
                params![id],
                Self::from_row,
            )
            .optional()?;
        Ok(trade)
    }

    pub fn find_by_external_id(&self, order_id: &str) -> LedgerResult<Option<Trade>> {
        let conn = self.conn.lock();
        let trade = conn
            .query_row(
                &format!("SELECT {} FROM trades WHERE external_order_id = ?1", TRADE_COLUMNS),
                params![order_id],
                Self::from_row,
            )
            .optional()?;
        Ok(trade)
    }

    fn query(&self, filter: &str, args: &[&dyn rusqlite::ToSql]) -> LedgerResult<Vec<Trade>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM trades {} ORDER BY created_at, id",
            TRADE_COLUMNS, filter
        ))?;
        let rows = stmt.query_map(args, Self::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Full history, oldest first
    pub fn list(&self) -> LedgerResult<Vec<Trade>> {
        self.query("", &[])
    }

    /// Trades that still have (or may have) an order on the book
    pub fn live_trades(&self) -> LedgerResult<Vec<Trade>> {
        self.query("WHERE status IN ('pending', 'open')", &[])
    }

    pub fn open_trades(&self) -> LedgerResult<Vec<Trade>> {
        self.query("WHERE status = 'open'", &[])
    }

    pub fn filled_trades(&self) -> LedgerResult<Vec<Trade>> {
        self.query("WHERE status = 'filled'", &[])
    }

    pub fn trades_for_generation(&self, generation: i64) -> LedgerResult<Vec<Trade>> {
        self.query("WHERE generation = ?1", &[&generation as &dyn rusqlite::ToSql])
    }

    pub fn count_by_status(&self, status: TradeStatus) -> LedgerResult<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM trades WHERE status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Margins recomputed from every filled trade
    pub fn margin_report(&self) -> LedgerResult<MarginReport> {
        Ok(calculate_margins(&self.filled_trades()?))
    }
}

fn bad_enum(column: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(LedgerError::Corrupt(format!("unknown value '{}'", value))),
    )
}
