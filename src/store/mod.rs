//! SQLite-backed activity log and bucket store
//!
//! # Architecture
//!
//! ```text
//! Collaborators ──→ append() ──→ activity_events
//!                                    │
//!             Aggregator ◄───────────┘ (unprocessed, per day window)
//!                 │
//!                 └──→ monthly_buckets (daily + weekly slots, totals)
//!                          │
//!             Promoter ◄───┘ (per month)
//!                 │
//!                 └──→ yearly_buckets (monthly slots, totals)
//!                          │
//!             Query engine ◄── reads buckets only
//! ```
//!
//! Buckets are stored as one JSON document per natural key. Every
//! read-modify-write of a bucket runs in an immediate transaction, so a
//! slot overwrite and its delta against the previous value are atomic per key.
//!
//! # WAL Mode Concurrency
//!
//! The database runs in WAL mode: readers never block the writer, and writers
//! wait on `busy_timeout` instead of failing outright. All access goes through
//! a small r2d2 pool.

mod activity;
mod buckets;

pub use activity::UnprocessedBatch;
pub use buckets::{DayFold, EntityFilter, MonthlyBucket, SlotWrite, WeekSlot, YearlyBucket};

use crate::error::Result;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::path::Path;

/// Current schema version (stored in `metadata`)
const SCHEMA_VERSION: i32 = 1;

/// Pooled SQLite store holding events and buckets
pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteStore {
    /// Open (or create) the database at `db_path` and run migrations
    ///
    /// # Errors
    /// Returns a storage error if the file cannot be opened or the schema
    /// cannot be applied.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    crate::error::RollupError::Storage(format!(
                        "cannot create {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.execute_batch(
                r#"
                PRAGMA busy_timeout=5000;
                PRAGMA synchronous=NORMAL;
                PRAGMA foreign_keys=OFF;
                "#,
            )
        });
        let pool = Pool::builder().max_size(4).build(manager)?;

        let store = Self { pool };
        {
            let conn = store.conn()?;
            Self::init_schema(&conn)?;
        }

        tracing::debug!("Opened rollup store at {}", db_path.display());
        Ok(store)
    }

    /// Get a connection from the pool
    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    /// Apply WAL mode and any pending migrations
    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA cache_size=-16000;  -- 16MB cache
            CREATE TABLE IF NOT EXISTS metadata (
                key TEXT PRIMARY KEY,
                value TEXT
            );
            "#,
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(
                    (SELECT CAST(value AS INTEGER) FROM metadata WHERE key = 'schema_version'),
                    0
                )",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < 1 {
            Self::apply_schema_v1(conn)?;
        }

        if current_version > SCHEMA_VERSION {
            tracing::warn!(
                "Database schema v{} is newer than this build (v{})",
                current_version,
                SCHEMA_VERSION
            );
        }

        Ok(())
    }

    /// Initial schema (v1)
    fn apply_schema_v1(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            BEGIN;

            -- Raw events, append-only apart from the processed flag
            CREATE TABLE IF NOT EXISTS activity_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_id TEXT NOT NULL,
                domain TEXT NOT NULL,        -- 'sales' | 'engagement'
                kind TEXT NOT NULL,
                payload TEXT NOT NULL DEFAULT '{}',
                occurred_at INTEGER NOT NULL, -- unix millis, UTC
                processed INTEGER NOT NULL DEFAULT 0,
                actor TEXT,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_pending
                ON activity_events(domain, processed, occurred_at);
            CREATE INDEX IF NOT EXISTS idx_events_entity
                ON activity_events(domain, entity_id, occurred_at);

            -- One document per (entity, domain, year, month)
            CREATE TABLE IF NOT EXISTS monthly_buckets (
                entity_id TEXT NOT NULL,
                domain TEXT NOT NULL,
                year INTEGER NOT NULL,
                month INTEGER NOT NULL,
                doc TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (entity_id, domain, year, month)
            );
            CREATE INDEX IF NOT EXISTS idx_monthly_period
                ON monthly_buckets(domain, year, month);

            -- One document per (entity, domain, year)
            CREATE TABLE IF NOT EXISTS yearly_buckets (
                entity_id TEXT NOT NULL,
                domain TEXT NOT NULL,
                year INTEGER NOT NULL,
                doc TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (entity_id, domain, year)
            );
            CREATE INDEX IF NOT EXISTS idx_yearly_period
                ON yearly_buckets(domain, year);

            INSERT OR REPLACE INTO metadata (key, value) VALUES ('schema_version', '1');

            COMMIT;
            "#,
        )?;

        tracing::info!("Rollup store schema v1 applied");
        Ok(())
    }

    /// Row counts for operator status output
    pub fn counts(&self) -> Result<StoreCounts> {
        let conn = self.conn()?;
        let (events, unprocessed): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(processed = 0), 0) FROM activity_events",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let monthly: i64 =
            conn.query_row("SELECT COUNT(*) FROM monthly_buckets", [], |row| row.get(0))?;
        let yearly: i64 =
            conn.query_row("SELECT COUNT(*) FROM yearly_buckets", [], |row| row.get(0))?;

        Ok(StoreCounts {
            events: events as u64,
            unprocessed_events: unprocessed as u64,
            monthly_buckets: monthly as u64,
            yearly_buckets: yearly as u64,
        })
    }
}

/// Snapshot of table sizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct StoreCounts {
    pub events: u64,
    pub unprocessed_events: u64,
    pub monthly_buckets: u64,
    pub yearly_buckets: u64,
}

/// Current wall-clock time as unix millis (for `created_at` / `updated_at`)
fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::SqliteStore;
    use tempfile::TempDir;

    /// Store backed by a throwaway directory (dropped with the guard)
    pub fn temp_store() -> (TempDir, SqliteStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::open(dir.path().join("rollstat.db")).expect("open store");
        (dir, store)
    }

    /// Run raw SQL against the store (fault injection, corrupt rows)
    pub fn exec(store: &SqliteStore, sql: &str, params: impl rusqlite::Params) {
        let conn = store.conn().expect("connection");
        conn.execute(sql, params).expect("raw sql");
    }

    /// Monthly bucket documents exactly as stored
    pub fn raw_monthly_docs(store: &SqliteStore) -> Vec<String> {
        let conn = store.conn().expect("connection");
        let mut stmt = conn
            .prepare("SELECT doc FROM monthly_buckets ORDER BY entity_id, domain, year, month")
            .expect("prepare");
        let rows = stmt.query_map([], |row| row.get(0)).expect("query");
        rows.map(|r| r.expect("row")).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::temp_store;
    use super::*;

    #[test]
    fn test_open_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("rollstat.db");
        drop(SqliteStore::open(&path).unwrap());
        let store = SqliteStore::open(&path).unwrap();

        let conn = store.conn().unwrap();
        let version: String = conn
            .query_row(
                "SELECT value FROM metadata WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(version, "1");
    }

    #[test]
    fn test_counts_on_empty_store() {
        let (_dir, store) = temp_store();
        let counts = store.counts().unwrap();
        assert_eq!(
            counts,
            StoreCounts {
                events: 0,
                unprocessed_events: 0,
                monthly_buckets: 0,
                yearly_buckets: 0,
            }
        );
    }
}
