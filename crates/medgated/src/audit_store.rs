//! Audit storage
//!
//! Append-only store for `ModelCallAudit` records. Appends are idempotent on
//! the record id: writing the same record twice leaves one row and reports
//! `AlreadyPresent`. Queries page by (timestamp, id) so callers can stream
//! arbitrarily large ranges.
//!
//! Schema (SQLite):
//! - model_call_audits: id, day (YYYY-MM-DD), ts_micros, user_id,
//!   model_used, outcome, record (JSON snapshot)
//! - indexes on day, (ts_micros, id), user and model

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use medgate_shared::audit::{day_key, AuditFilter, ModelCallAudit};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::RwLock;

/// Records per page when the caller does not say
pub const DEFAULT_PAGE_SIZE: usize = 500;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store task failed: {0}")]
    Task(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted,
    AlreadyPresent,
}

/// Position after the last record of a page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditCursor {
    pub ts_micros: i64,
    pub id: String,
}

impl AuditCursor {
    pub fn after(record: &ModelCallAudit) -> Self {
        Self {
            ts_micros: record.timestamp.timestamp_micros(),
            id: record.id.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditPage {
    pub records: Vec<ModelCallAudit>,
    /// `None` once the range is exhausted
    pub next: Option<AuditCursor>,
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, record: &ModelCallAudit) -> Result<AppendOutcome, StoreError>;

    /// Records matching `filter`, ordered by (timestamp, id), strictly after `after`
    async fn query_page(
        &self,
        filter: &AuditFilter,
        after: Option<&AuditCursor>,
        limit: usize,
    ) -> Result<AuditPage, StoreError>;

    /// Delete records older than `cutoff`; returns how many went
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;

    async fn count(&self) -> Result<u64, StoreError>;
}

fn page_from(mut records: Vec<ModelCallAudit>, limit: usize) -> AuditPage {
    let next = if records.len() > limit {
        records.truncate(limit);
        records.last().map(AuditCursor::after)
    } else {
        None
    };
    AuditPage { records, next }
}

// ============================================================================
// SQLite
// ============================================================================

pub struct SqliteAuditStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteAuditStore {
    pub fn open_at<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path_ref = path.as_ref();
        if let Some(parent) = path_ref.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let is_new = !path_ref.exists();
        let conn = Connection::open(path_ref)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init_schema(&conn)?;

        // Audit snapshots carry clinical context: owner only
        if is_new {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = std::fs::set_permissions(path_ref, std::fs::Permissions::from_mode(0o600));
            }
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS model_call_audits (
                id TEXT PRIMARY KEY,
                day TEXT NOT NULL,
                ts_micros INTEGER NOT NULL,
                user_id TEXT NOT NULL,
                model_used TEXT NOT NULL,
                outcome TEXT NOT NULL,
                record TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_audits_day ON model_call_audits(day);
            CREATE INDEX IF NOT EXISTS idx_audits_ts_id ON model_call_audits(ts_micros, id);
            CREATE INDEX IF NOT EXISTS idx_audits_user_ts ON model_call_audits(user_id, ts_micros);
            CREATE INDEX IF NOT EXISTS idx_audits_model_ts ON model_call_audits(model_used, ts_micros);
            "#,
        )?;
        Ok(())
    }

    /// Run `f` on the connection off the async runtime
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("connection lock poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

fn build_query(filter: &AuditFilter, after: Option<&AuditCursor>, limit: usize) -> (String, Vec<SqlValue>) {
    let mut clauses: Vec<String> = Vec::new();
    let mut args: Vec<SqlValue> = Vec::new();

    if let Some(user) = &filter.user_id {
        args.push(SqlValue::Text(user.clone()));
        clauses.push(format!("user_id = ?{}", args.len()));
    }
    if let Some(model) = &filter.model_name {
        args.push(SqlValue::Text(model.clone()));
        clauses.push(format!("model_used = ?{}", args.len()));
    }
    if let Some(start) = filter.start {
        // Day bound narrows the scan through the day index
        args.push(SqlValue::Text(day_key(&start)));
        clauses.push(format!("day >= ?{}", args.len()));
        args.push(SqlValue::Integer(start.timestamp_micros()));
        clauses.push(format!("ts_micros >= ?{}", args.len()));
    }
    if let Some(end) = filter.end {
        args.push(SqlValue::Text(day_key(&end)));
        clauses.push(format!("day <= ?{}", args.len()));
        args.push(SqlValue::Integer(end.timestamp_micros()));
        clauses.push(format!("ts_micros < ?{}", args.len()));
    }
    if let Some(cursor) = after {
        args.push(SqlValue::Integer(cursor.ts_micros));
        let ts = args.len();
        args.push(SqlValue::Text(cursor.id.clone()));
        let id = args.len();
        clauses.push(format!("(ts_micros > ?{ts} OR (ts_micros = ?{ts} AND id > ?{id}))"));
    }

    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };
    // One extra row tells us whether another page exists
    args.push(SqlValue::Integer(limit as i64 + 1));
    let sql = format!(
        "SELECT record FROM model_call_audits{} ORDER BY ts_micros, id LIMIT ?{}",
        where_sql,
        args.len()
    );
    (sql, args)
}

#[async_trait]
impl AuditStore for SqliteAuditStore {
    async fn append(&self, record: &ModelCallAudit) -> Result<AppendOutcome, StoreError> {
        let json = serde_json::to_string(record)?;
        let id = record.id.clone();
        let day = record.day_key();
        let ts = record.timestamp.timestamp_micros();
        let user = record.user_id.clone();
        let model = record.model_used.clone();
        let outcome = record.outcome.as_str();

        self.with_conn(move |conn| {
            let changed = conn.execute(
                "INSERT OR IGNORE INTO model_call_audits (id, day, ts_micros, user_id, model_used, outcome, record)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![id, day, ts, user, model, outcome, json],
            )?;
            Ok(if changed == 0 {
                AppendOutcome::AlreadyPresent
            } else {
                AppendOutcome::Inserted
            })
        })
        .await
    }

    async fn query_page(
        &self,
        filter: &AuditFilter,
        after: Option<&AuditCursor>,
        limit: usize,
    ) -> Result<AuditPage, StoreError> {
        let limit = limit.max(1);
        let (sql, args) = build_query(filter, after, limit);

        let rows: Vec<String> = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params_from_iter(args), |row| row.get::<_, String>(0))?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;

        let records = rows
            .iter()
            .map(|json| serde_json::from_str::<ModelCallAudit>(json))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(page_from(records, limit))
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let cutoff_micros = cutoff.timestamp_micros();
        self.with_conn(move |conn| {
            let n = conn.execute(
                "DELETE FROM model_call_audits WHERE ts_micros < ?1",
                params![cutoff_micros],
            )?;
            Ok(n)
        })
        .await
    }

    async fn count(&self) -> Result<u64, StoreError> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM model_call_audits", [], |row| row.get(0))?;
            Ok(n as u64)
        })
        .await
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// In-process store for tests and ephemeral deployments. Can be told to
/// fail upcoming appends to exercise the recorder's retry path.
#[derive(Default)]
pub struct MemoryAuditStore {
    records: RwLock<BTreeMap<(i64, String), ModelCallAudit>>,
    ids: RwLock<HashSet<String>>,
    failures_pending: AtomicUsize,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` appends fail
    pub fn fail_next(&self, n: usize) {
        self.failures_pending.store(n, Ordering::SeqCst);
    }

    fn take_failure(&self) -> bool {
        self.failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn append(&self, record: &ModelCallAudit) -> Result<AppendOutcome, StoreError> {
        if self.take_failure() {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        let mut ids = self.ids.write().await;
        if !ids.insert(record.id.clone()) {
            return Ok(AppendOutcome::AlreadyPresent);
        }
        let key = (record.timestamp.timestamp_micros(), record.id.clone());
        self.records.write().await.insert(key, record.clone());
        Ok(AppendOutcome::Inserted)
    }

    async fn query_page(
        &self,
        filter: &AuditFilter,
        after: Option<&AuditCursor>,
        limit: usize,
    ) -> Result<AuditPage, StoreError> {
        let limit = limit.max(1);
        let records = self.records.read().await;
        let matched: Vec<ModelCallAudit> = records
            .iter()
            .filter(|((ts, id), _)| match after {
                Some(c) => (*ts, id.as_str()) > (c.ts_micros, c.id.as_str()),
                None => true,
            })
            .map(|(_, r)| r)
            .filter(|r| filter.matches(r))
            .take(limit + 1)
            .cloned()
            .collect();
        Ok(page_from(matched, limit))
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let cutoff = cutoff.timestamp_micros();
        // Same lock order as append
        let mut ids = self.ids.write().await;
        let mut records = self.records.write().await;
        let expired: Vec<(i64, String)> = records.keys().filter(|(ts, _)| *ts < cutoff).cloned().collect();
        for key in &expired {
            records.remove(key);
            ids.remove(&key.1);
        }
        Ok(expired.len())
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.records.read().await.len() as u64)
    }
}
