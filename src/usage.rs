use crate::error::StoreError;
use chrono::Utc;
use rusqlite::{Connection, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use serde::Serialize;
use uuid::Uuid;

/// One durable row per successful generation.
#[derive(Debug, Clone, Serialize)]
pub struct UsageRecord {
    pub id: String,
    pub session_id: String,
    pub tokens: u64,
    pub created_at: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UsageSummary {
    pub total_tokens: u64,
    pub record_count: u64,
}

/// Durable token-usage log, persisted alongside the memory catalog.
///
/// The live per-session ledger answers "what has this conversation
/// cost"; this log answers the same across restarts.
pub struct UsageLog {
    conn: Mutex<Connection>,
}

impl UsageLog {
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS usage_records (
                 id         TEXT PRIMARY KEY,
                 session_id TEXT NOT NULL,
                 tokens     INTEGER NOT NULL,
                 created_at TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_usage_records_created
                 ON usage_records(created_at);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record(&self, session_id: &str, tokens: u64) -> Result<UsageRecord, StoreError> {
        let record = UsageRecord {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            tokens,
            created_at: Utc::now().to_rfc3339(),
        };
        let tokens_i64 = i64::try_from(record.tokens)
            .map_err(|e| StoreError::Query(format!("token count out of range: {e}")))?;
        self.lock().execute(
            "INSERT INTO usage_records (id, session_id, tokens, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![record.id, record.session_id, tokens_i64, record.created_at],
        )?;
        Ok(record)
    }

    pub fn summarize(&self, since: Option<&str>) -> Result<UsageSummary, StoreError> {
        let conn = self.lock();
        let (total, count): (i64, i64) = if let Some(since_ts) = since {
            let mut stmt = conn.prepare_cached(
                "SELECT COALESCE(SUM(tokens), 0), COUNT(*)
                 FROM usage_records WHERE created_at >= ?1",
            )?;
            stmt.query_row([since_ts], |row| Ok((row.get(0)?, row.get(1)?)))?
        } else {
            let mut stmt = conn
                .prepare_cached("SELECT COALESCE(SUM(tokens), 0), COUNT(*) FROM usage_records")?;
            stmt.query_row([], |row| Ok((row.get(0)?, row.get(1)?)))?
        };

        Ok(UsageSummary {
            total_tokens: u64::try_from(total).unwrap_or(0),
            record_count: u64::try_from(count).unwrap_or(0),
        })
    }

    /// Explicit user-triggered reset of the durable log.
    pub fn clear(&self) -> Result<(), StoreError> {
        self.lock().execute("DELETE FROM usage_records", [])?;
        Ok(())
    }
}
