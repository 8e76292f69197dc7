//! Database handle and schema.
//!
//! One SQLite database backs the whole platform: snapshot storage, the task
//! queue, and the result table. WAL mode allows concurrent readers during
//! writes; every connection carries a busy timeout so no statement blocks
//! indefinitely. Components hold a cloned `Database` and run short,
//! purpose-scoped transactions against it.

use chrono::Utc;
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Schema version for migrations.
/// Version history:
/// - v1: Initial schema
const SCHEMA_VERSION: u32 = 1;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS marketdata_snapshot (
    snapshot_id TEXT PRIMARY KEY,
    as_of_time TEXT NOT NULL,
    vendor TEXT NOT NULL,
    universe_id TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    dq_status TEXT NOT NULL,
    payload_hash TEXT NOT NULL,
    created_at TEXT NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS position_snapshot (
    position_snapshot_id TEXT PRIMARY KEY,
    as_of_time TEXT NOT NULL,
    portfolio_node_id TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    payload_hash TEXT NOT NULL,
    created_at TEXT NOT NULL
) WITHOUT ROWID;

-- Content-addressed deduplication key
CREATE UNIQUE INDEX IF NOT EXISTS idx_position_snapshot_dedup
    ON position_snapshot(portfolio_node_id, payload_hash);

-- Scope resolution: latest snapshot per node at or before as_of
CREATE INDEX IF NOT EXISTS idx_position_snapshot_node_asof
    ON position_snapshot(portfolio_node_id, as_of_time DESC);

CREATE TABLE IF NOT EXISTS run (
    run_id TEXT PRIMARY KEY,
    run_type TEXT NOT NULL,
    status TEXT NOT NULL,
    as_of_time TEXT NOT NULL,
    market_snapshot_id TEXT NOT NULL,
    measures_json TEXT NOT NULL,
    scenarios_json TEXT NOT NULL,
    portfolio_scope_json TEXT NOT NULL,
    hash_mod INTEGER NOT NULL,
    requested_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    summary_json TEXT,
    error TEXT
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_run_status_requested
    ON run(status, requested_at DESC);

CREATE TABLE IF NOT EXISTS run_task (
    task_id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL,
    portfolio_node_id TEXT NOT NULL,
    product_type TEXT NOT NULL,
    position_snapshot_id TEXT NOT NULL,
    hash_mod INTEGER NOT NULL,
    hash_bucket INTEGER NOT NULL,
    status TEXT NOT NULL,
    attempt INTEGER NOT NULL,
    max_attempts INTEGER NOT NULL,
    lease_owner TEXT,
    leased_until INTEGER,
    last_error TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
) WITHOUT ROWID;

-- Lease claim scan
CREATE INDEX IF NOT EXISTS idx_run_task_claim
    ON run_task(status, leased_until, updated_at);

-- Run/task enumeration and completion counting
CREATE INDEX IF NOT EXISTS idx_run_task_run
    ON run_task(run_id, status);

CREATE TABLE IF NOT EXISTS valuation_result (
    run_id TEXT NOT NULL,
    position_id TEXT NOT NULL,
    scenario_id TEXT NOT NULL,
    portfolio_node_id TEXT NOT NULL,
    product_type TEXT NOT NULL,
    base_currency TEXT NOT NULL,
    measures_json TEXT NOT NULL,
    compute_meta_json TEXT NOT NULL,
    input_hash TEXT NOT NULL,
    written_at INTEGER NOT NULL,
    PRIMARY KEY (run_id, position_id, scenario_id)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_valuation_result_node
    ON valuation_result(run_id, portfolio_node_id);

CREATE INDEX IF NOT EXISTS idx_valuation_result_product
    ON valuation_result(run_id, product_type);
"#;

#[derive(Debug)]
pub enum DbError {
    Sqlite(rusqlite::Error),
    SchemaVersion { expected: u32, found: u32 },
}

impl std::fmt::Display for DbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(e) => write!(f, "SQLite error: {}", e),
            Self::SchemaVersion { expected, found } => {
                write!(f, "schema version mismatch: expected {}, found {}", expected, found)
            }
        }
    }
}

impl std::error::Error for DbError {}

impl From<rusqlite::Error> for DbError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Sqlite(e)
    }
}

/// Shared handle to the platform database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database at `database_url`. Accepts a bare path,
    /// a `sqlite://` prefixed URL, or `:memory:`.
    pub fn open(database_url: &str) -> Result<Self, DbError> {
        let path = strip_sqlite_scheme(database_url);
        if path == ":memory:" {
            return Self::in_memory();
        }
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags)?;
        let db = Self { conn: Arc::new(Mutex::new(conn)) };
        db.initialize()?;
        info!("database initialized at {}", path);
        Ok(db)
    }

    /// In-memory database for tests. Clones share the same connection.
    pub fn in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn: Arc::new(Mutex::new(conn)) };
        db.initialize()?;
        Ok(db)
    }

    fn initialize(&self) -> Result<(), DbError> {
        let conn = self.conn.lock();
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -16000;
            PRAGMA temp_store = MEMORY;
            PRAGMA foreign_keys = ON;
        "#,
        )?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            // In-memory databases report "memory"; file databases should be WAL.
            debug!("journal_mode = {}", journal_mode);
        }

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
            [],
        )?;
        let current: Option<u32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
            .optional()?;

        match current {
            None => {
                conn.execute_batch(SCHEMA_SQL)?;
                conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [SCHEMA_VERSION])?;
                debug!("created schema v{}", SCHEMA_VERSION);
            }
            Some(v) if v == SCHEMA_VERSION => {
                debug!("schema at v{}", SCHEMA_VERSION);
            }
            Some(v) => {
                warn!("schema version mismatch: expected {}, found {}", SCHEMA_VERSION, v);
                return Err(DbError::SchemaVersion { expected: SCHEMA_VERSION, found: v });
            }
        }
        Ok(())
    }

    /// Lock the shared connection. Callers keep the guard for the shortest
    /// span that still forms one atomic unit of work.
    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    /// Wall clock in epoch milliseconds, the unit of lease arithmetic.
    pub fn now_millis() -> i64 {
        Utc::now().timestamp_millis()
    }
}

fn strip_sqlite_scheme(url: &str) -> &str {
    url.strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .unwrap_or(url)
}
