//! Grid generations, their levels, and small pieces of bot state
//!
//! A generation is written as `pending` before any old order is touched,
//! becomes `active` once the previous generation's orders are all canceled,
//! and is `retired` when replaced. At most one generation of each of
//! `pending` and `active` exists at any time.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::sync::Arc;
use tracing::info;

use crate::core::types::{GridLevel, LevelSide, RegenerationTrigger, Trend};
use crate::db::{from_db_time, to_db_time, Database, LedgerError, LedgerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationStatus {
    Pending,
    Active,
    Retired,
}

impl GenerationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationStatus::Pending => "pending",
            GenerationStatus::Active => "active",
            GenerationStatus::Retired => "retired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(GenerationStatus::Pending),
            "active" => Some(GenerationStatus::Active),
            "retired" => Some(GenerationStatus::Retired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GridGeneration {
    pub id: i64,
    pub reference_price: f64,
    pub range_percent: f64,
    pub trigger: RegenerationTrigger,
    pub trend: Trend,
    pub status: GenerationStatus,
    /// Every level has had its order placed (or attempted)
    pub placement_done: bool,
    pub created_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub retired_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewGeneration<'a> {
    pub reference_price: f64,
    pub range_percent: f64,
    pub trigger: RegenerationTrigger,
    pub trend: Trend,
    pub levels: &'a [GridLevel],
}

const GENERATION_COLUMNS: &str = "id, reference_price, range_percent, trigger_reason, trend, status,
    placement_done, created_at, activated_at, retired_at";

#[derive(Clone)]
pub struct GridStateStore {
    conn: Arc<Mutex<Connection>>,
}

impl GridStateStore {
    pub fn new(db: &Database) -> Self {
        Self {
            conn: db.get_connection(),
        }
    }

    fn from_row(row: &Row) -> rusqlite::Result<GridGeneration> {
        let trigger: String = row.get(3)?;
        let trend: String = row.get(4)?;
        let status: String = row.get(5)?;
        let activated_at: Option<String> = row.get(8)?;
        let retired_at: Option<String> = row.get(9)?;

        Ok(GridGeneration {
            id: row.get(0)?,
            reference_price: row.get(1)?,
            range_percent: row.get(2)?,
            trigger: RegenerationTrigger::parse(&trigger).ok_or_else(|| corrupt(3, &trigger))?,
            trend: Trend::parse(&trend).ok_or_else(|| corrupt(4, &trend))?,
            status: GenerationStatus::parse(&status).ok_or_else(|| corrupt(5, &status))?,
            placement_done: row.get::<_, i64>(6)? != 0,
            created_at: from_db_time(&row.get::<_, String>(7)?)?,
            activated_at: activated_at.as_deref().map(from_db_time).transpose()?,
            retired_at: retired_at.as_deref().map(from_db_time).transpose()?,
        })
    }

    /// Persist a new generation and its levels as `pending`
    pub fn create_pending(&self, generation: &NewGeneration, now: DateTime<Utc>) -> LedgerResult<GridGeneration> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let pending: i64 = tx.query_row(
            "SELECT COUNT(*) FROM grid_generations WHERE status = 'pending'",
            [],
            |row| row.get(0),
        )?;
        if pending > 0 {
            return Err(LedgerError::Conflict("a pending generation already exists".to_string()));
        }

        tx.execute(
            "INSERT INTO grid_generations (reference_price, range_percent, trigger_reason, trend, status, created_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
            params![
                generation.reference_price,
                generation.range_percent,
                generation.trigger.as_str(),
                generation.trend.as_str(),
                to_db_time(&now),
            ],
        )?;
        let id = tx.last_insert_rowid();

        {
            let mut stmt = tx.prepare(
                "INSERT INTO grid_levels (generation, level_index, target_price, side, size_fraction)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for level in generation.levels {
                stmt.execute(params![
                    id,
                    level.index as i64,
                    level.target_price,
                    level.side.as_str(),
                    level.size_fraction,
                ])?;
            }
        }

        tx.commit()?;

        Ok(GridGeneration {
            id,
            reference_price: generation.reference_price,
            range_percent: generation.range_percent,
            trigger: generation.trigger,
            trend: generation.trend,
            status: GenerationStatus::Pending,
            placement_done: false,
            created_at: now,
            activated_at: None,
            retired_at: None,
        })
    }

    /// Retire the current active generation and promote `id`
    pub fn activate(&self, id: i64, now: DateTime<Utc>) -> LedgerResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let status: Option<String> = tx
            .query_row("SELECT status FROM grid_generations WHERE id = ?1", params![id], |row| row.get(0))
            .optional()?;
        if status.as_deref() != Some("pending") {
            return Err(LedgerError::Conflict(format!("generation {} is not pending", id)));
        }

        let stamp = to_db_time(&now);
        tx.execute(
            "UPDATE grid_generations SET status = 'retired', retired_at = ?1 WHERE status = 'active'",
            params![stamp],
        )?;
        tx.execute(
            "UPDATE grid_generations SET status = 'active', activated_at = ?2 WHERE id = ?1",
            params![id, stamp],
        )?;
        tx.commit()?;

        info!("🧱 Grid generation {} is now active", id);
        Ok(())
    }

    pub fn mark_placement_done(&self, id: i64) -> LedgerResult<()> {
        self.conn
            .lock()
            .execute("UPDATE grid_generations SET placement_done = 1 WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn find_by_status(&self, status: GenerationStatus) -> LedgerResult<Option<GridGeneration>> {
        let conn = self.conn.lock();
        let generation = conn
            .query_row(
                &format!(
                    "SELECT {} FROM grid_generations WHERE status = ?1 ORDER BY id DESC LIMIT 1",
                    GENERATION_COLUMNS
                ),
                params![status.as_str()],
                Self::from_row,
            )
            .optional()?;
        Ok(generation)
    }

    pub fn active(&self) -> LedgerResult<Option<GridGeneration>> {
        self.find_by_status(GenerationStatus::Active)
    }

    pub fn pending(&self) -> LedgerResult<Option<GridGeneration>> {
        self.find_by_status(GenerationStatus::Pending)
    }

    pub fn levels(&self, generation: i64) -> LedgerResult<Vec<GridLevel>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT level_index, target_price, side, size_fraction
             FROM grid_levels WHERE generation = ?1 ORDER BY level_index",
        )?;
        let rows = stmt.query_map(params![generation], |row| {
            let side: String = row.get(2)?;
            Ok(GridLevel {
                index: row.get::<_, i64>(0)? as usize,
                target_price: row.get(1)?,
                side: LevelSide::parse(&side).ok_or_else(|| corrupt(2, &side))?,
                size_fraction: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn set_state(&self, key: &str, value: &str, now: DateTime<Utc>) -> LedgerResult<()> {
        self.conn.lock().execute(
            "INSERT INTO bot_state (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, to_db_time(&now)],
        )?;
        Ok(())
    }

    pub fn get_state(&self, key: &str) -> LedgerResult<Option<String>> {
        let value = self
            .conn
            .lock()
            .query_row("SELECT value FROM bot_state WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    pub fn clear_state(&self, key: &str) -> LedgerResult<()> {
        self.conn.lock().execute("DELETE FROM bot_state WHERE key = ?1", params![key])?;
        Ok(())
    }
}

fn corrupt(column: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(LedgerError::Corrupt(format!("unknown value '{}'", value))),
    )
}
