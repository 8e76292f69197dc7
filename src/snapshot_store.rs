//! Snapshot storage.
//!
//! Write-once, append-only persistence for market and position snapshots.
//! A market snapshot id can be re-submitted only with byte-identical content;
//! position snapshots are deduplicated by `(portfolio_node_id, payload_hash)`
//! so re-ingesting an unchanged portfolio returns the existing id.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::db::Database;
use crate::hashing::{self, HashError};
use crate::market::MarketPayload;
use crate::models::{format_timestamp, parse_timestamp, DqStatus, MarketSnapshot, Position, PositionSnapshot};

#[derive(Debug)]
pub enum SnapshotStoreError {
    Sqlite(rusqlite::Error),
    Serialization(serde_json::Error),
    Hash(HashError),
    /// Snapshot id already exists with different content.
    Conflict(String),
    NotFound(String),
    /// A stored row failed to parse back; the store only persists validated
    /// payloads, so this is an integrity breach, not bad input.
    Corrupt(String),
}

impl std::fmt::Display for SnapshotStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(e) => write!(f, "SQLite error: {}", e),
            Self::Serialization(e) => write!(f, "serialization error: {}", e),
            Self::Hash(e) => write!(f, "hash error: {}", e),
            Self::Conflict(id) => write!(f, "snapshot exists with different payload hash: {}", id),
            Self::NotFound(id) => write!(f, "snapshot not found: {}", id),
            Self::Corrupt(id) => write!(f, "stored snapshot is corrupt: {}", id),
        }
    }
}

impl std::error::Error for SnapshotStoreError {}

impl From<rusqlite::Error> for SnapshotStoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Sqlite(e)
    }
}

impl From<serde_json::Error> for SnapshotStoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e)
    }
}

impl From<HashError> for SnapshotStoreError {
    fn from(e: HashError) -> Self {
        Self::Hash(e)
    }
}

/// Outcome of a position snapshot put.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutPositionOutcome {
    pub position_snapshot_id: String,
    pub payload_hash: String,
    /// True when an identical snapshot already existed for the node.
    pub deduplicated: bool,
}

#[derive(Clone)]
pub struct SnapshotStore {
    db: Database,
}

impl SnapshotStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Store a market snapshot. Identical re-submission is a no-op; the same
    /// id with different content is a conflict.
    pub fn put_market_snapshot(
        &self,
        snapshot_id: &str,
        as_of_time: DateTime<Utc>,
        vendor: &str,
        universe_id: &str,
        payload: &MarketPayload,
        dq_status: DqStatus,
    ) -> Result<String, SnapshotStoreError> {
        let payload_json = serde_json::to_value(payload)?;
        let payload_hash = hashing::canonical_hash(&payload_json)?;

        let conn = self.db.conn();
        let existing: Option<String> = conn
            .query_row(
                "SELECT payload_hash FROM marketdata_snapshot WHERE snapshot_id = ?1",
                params![snapshot_id],
                |row| row.get(0),
            )
            .optional()?;
        match existing {
            Some(hash) if hash == payload_hash => return Ok(payload_hash),
            Some(_) => return Err(SnapshotStoreError::Conflict(snapshot_id.to_string())),
            None => {}
        }

        conn.execute(
            "INSERT INTO marketdata_snapshot \
             (snapshot_id, as_of_time, vendor, universe_id, payload_json, dq_status, payload_hash, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                snapshot_id,
                format_timestamp(as_of_time),
                vendor,
                universe_id,
                serde_json::to_string(&payload_json)?,
                dq_status.as_str(),
                payload_hash,
                format_timestamp(Utc::now()),
            ],
        )?;
        Ok(payload_hash)
    }

    pub fn get_market_snapshot(&self, snapshot_id: &str) -> Result<MarketSnapshot, SnapshotStoreError> {
        let conn = self.db.conn();
        let row: Option<(String, String, String, String, String, String)> = conn
            .query_row(
                "SELECT as_of_time, vendor, universe_id, payload_json, dq_status, payload_hash \
                 FROM marketdata_snapshot WHERE snapshot_id = ?1",
                params![snapshot_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                },
            )
            .optional()?;
        let (as_of, vendor, universe_id, payload_json, dq, payload_hash) =
            row.ok_or_else(|| SnapshotStoreError::NotFound(snapshot_id.to_string()))?;

        let payload: MarketPayload = serde_json::from_str(&payload_json)
            .map_err(|_| SnapshotStoreError::Corrupt(snapshot_id.to_string()))?;
        Ok(MarketSnapshot {
            snapshot_id: snapshot_id.to_string(),
            as_of_time: parse_timestamp(&as_of)
                .ok_or_else(|| SnapshotStoreError::Corrupt(snapshot_id.to_string()))?,
            vendor,
            universe_id,
            payload,
            dq_status: DqStatus::parse(&dq)
                .ok_or_else(|| SnapshotStoreError::Corrupt(snapshot_id.to_string()))?,
            payload_hash,
        })
    }

    /// Store a position snapshot, deduplicating on content. Returns the
    /// existing id when `(portfolio_node_id, payload_hash)` is already known.
    pub fn put_position_snapshot(
        &self,
        portfolio_node_id: &str,
        as_of_time: DateTime<Utc>,
        positions: &[Position],
    ) -> Result<PutPositionOutcome, SnapshotStoreError> {
        let payload_json = serde_json::to_value(positions)?;
        let payload_hash = hashing::canonical_hash(&payload_json)?;

        let conn = self.db.conn();
        let existing: Option<String> = conn
            .query_row(
                "SELECT position_snapshot_id FROM position_snapshot \
                 WHERE portfolio_node_id = ?1 AND payload_hash = ?2",
                params![portfolio_node_id, payload_hash],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            return Ok(PutPositionOutcome {
                position_snapshot_id: id,
                payload_hash,
                deduplicated: true,
            });
        }

        let position_snapshot_id = format!("psnap-{}", Uuid::new_v4());
        conn.execute(
            "INSERT INTO position_snapshot \
             (position_snapshot_id, as_of_time, portfolio_node_id, payload_json, payload_hash, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                position_snapshot_id,
                format_timestamp(as_of_time),
                portfolio_node_id,
                serde_json::to_string(&payload_json)?,
                payload_hash,
                format_timestamp(Utc::now()),
            ],
        )?;
        Ok(PutPositionOutcome { position_snapshot_id, payload_hash, deduplicated: false })
    }

    pub fn get_position_snapshot(&self, id: &str) -> Result<PositionSnapshot, SnapshotStoreError> {
        let conn = self.db.conn();
        let row: Option<(String, String, String, String)> = conn
            .query_row(
                "SELECT as_of_time, portfolio_node_id, payload_json, payload_hash \
                 FROM position_snapshot WHERE position_snapshot_id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;
        let (as_of, node, payload_json, payload_hash) =
            row.ok_or_else(|| SnapshotStoreError::NotFound(id.to_string()))?;
        parse_position_row(id, &as_of, node, &payload_json, payload_hash)
    }

    /// Latest snapshot for a portfolio node at or before `as_of`. Scope
    /// resolution for run admission goes through here.
    pub fn latest_position_snapshot(
        &self,
        portfolio_node_id: &str,
        as_of: DateTime<Utc>,
    ) -> Result<Option<PositionSnapshot>, SnapshotStoreError> {
        let conn = self.db.conn();
        let row: Option<(String, String, String, String)> = conn
            .query_row(
                "SELECT position_snapshot_id, as_of_time, payload_json, payload_hash \
                 FROM position_snapshot \
                 WHERE portfolio_node_id = ?1 AND as_of_time <= ?2 \
                 ORDER BY as_of_time DESC, created_at DESC LIMIT 1",
                params![portfolio_node_id, format_timestamp(as_of)],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some((id, as_of_time, payload_json, payload_hash)) => Ok(Some(parse_position_row(
                &id,
                &as_of_time,
                portfolio_node_id.to_string(),
                &payload_json,
                payload_hash,
            )?)),
        }
    }
}

fn parse_position_row(
    id: &str,
    as_of: &str,
    portfolio_node_id: String,
    payload_json: &str,
    payload_hash: String,
) -> Result<PositionSnapshot, SnapshotStoreError> {
    let positions: Vec<Position> = serde_json::from_str(payload_json)
        .map_err(|_| SnapshotStoreError::Corrupt(id.to_string()))?;
    Ok(PositionSnapshot {
        position_snapshot_id: id.to_string(),
        as_of_time: parse_timestamp(as_of).ok_or_else(|| SnapshotStoreError::Corrupt(id.to_string()))?,
        portfolio_node_id,
        positions,
        payload_hash,
    })
}
