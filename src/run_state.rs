//! Run state machine.
//!
//! Runs move `QUEUED -> RUNNING -> COMPLETED | FAILED | CANCELLED` driven by
//! aggregate task state. Finalization runs in a single transaction after any
//! task completion: it recounts the run's tasks and applies exactly one
//! transition, so concurrent workers finishing tasks of the same run cannot
//! race the run into an inconsistent terminal state.

use rusqlite::{params, OptionalExtension};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::info;

use crate::db::Database;
use crate::models::{format_timestamp, parse_timestamp, Run, RunStatus, RunType, TaskStatus};

/// Dead-task error digest kept in the run summary.
const DEAD_ERROR_DIGEST_LIMIT: usize = 5;

#[derive(Debug)]
pub enum RunStateError {
    Sqlite(rusqlite::Error),
    UnknownRun(String),
    Corrupt(String),
}

impl std::fmt::Display for RunStateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(e) => write!(f, "SQLite error: {}", e),
            Self::UnknownRun(id) => write!(f, "run not found: {}", id),
            Self::Corrupt(id) => write!(f, "stored run is corrupt: {}", id),
        }
    }
}

impl std::error::Error for RunStateError {}

impl From<rusqlite::Error> for RunStateError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Sqlite(e)
    }
}

/// Recompute the run's aggregate task state and transition it if warranted.
/// Returns the new status when a transition happened.
pub fn finalize_run(db: &Database, run_id: &str) -> Result<Option<RunStatus>, RunStateError> {
    let mut conn = db.conn();
    let tx = conn.transaction()?;

    let status_str: Option<String> = tx
        .query_row("SELECT status FROM run WHERE run_id = ?1", params![run_id], |row| row.get(0))
        .optional()?;
    let status_str = status_str.ok_or_else(|| RunStateError::UnknownRun(run_id.to_string()))?;
    let status = RunStatus::parse(&status_str)
        .ok_or_else(|| RunStateError::Corrupt(run_id.to_string()))?;
    if status.is_terminal() {
        return Ok(None);
    }

    let counts = count_tasks(&tx, run_id)?;
    let queued = *counts.get(&TaskStatus::Queued).unwrap_or(&0);
    let running = *counts.get(&TaskStatus::Running).unwrap_or(&0);
    let succeeded = *counts.get(&TaskStatus::Succeeded).unwrap_or(&0);
    let dead = *counts.get(&TaskStatus::Dead).unwrap_or(&0);

    let next = if status == RunStatus::Cancelling && running == 0 {
        // Drain: nothing in flight anymore; dead-letter what never started.
        tx.execute(
            "UPDATE run_task SET status = 'DEAD', lease_owner = NULL, leased_until = NULL, \
             last_error = CASE WHEN last_error IS NULL THEN 'Cancelled: run cancelled' \
                               ELSE last_error || ' | Cancelled: run cancelled' END, \
             updated_at = ?2 \
             WHERE run_id = ?1 AND status = 'QUEUED'",
            params![run_id, Database::now_millis()],
        )?;
        Some(RunStatus::Cancelled)
    } else if queued == 0 && running == 0 && succeeded >= 1 {
        Some(RunStatus::Completed)
    } else if queued == 0 && running == 0 && succeeded == 0 && dead > 0 {
        Some(RunStatus::Failed)
    } else {
        None
    };

    if let Some(next) = next {
        let final_counts = count_tasks(&tx, run_id)?;
        let dead_errors = dead_error_digest(&tx, run_id)?;
        let summary = json!({
            "tasks": final_counts
                .iter()
                .map(|(status, n)| (status.as_str().to_string(), *n))
                .collect::<BTreeMap<String, i64>>(),
            "dead_errors": dead_errors,
        });
        let error = match next {
            RunStatus::Failed => Some(format!(
                "all {} tasks dead; {}",
                final_counts.get(&TaskStatus::Dead).unwrap_or(&0),
                dead_errors.first().map(String::as_str).unwrap_or("no error recorded")
            )),
            RunStatus::Cancelled => Some("run cancelled".to_string()),
            _ => None,
        };
        tx.execute(
            "UPDATE run SET status = ?2, completed_at = ?3, summary_json = ?4, error = ?5 \
             WHERE run_id = ?1",
            params![
                run_id,
                next.as_str(),
                format_timestamp(chrono::Utc::now()),
                serde_json::to_string(&summary)
                    .map_err(|_| RunStateError::Corrupt(run_id.to_string()))?,
                error,
            ],
        )?;
        tx.commit()?;
        info!(run_id, status = next.as_str(), "run finalized");
        return Ok(Some(next));
    }

    tx.commit()?;
    Ok(None)
}

/// Move a QUEUED/RUNNING run to CANCELLING. Claims of its tasks stop
/// immediately; in-flight workers observe the flag at their next heartbeat.
/// Returns false when the run is already terminal or cancelling.
pub fn request_cancel(db: &Database, run_id: &str) -> Result<bool, RunStateError> {
    let transitioned = {
        let conn = db.conn();
        let changed = conn.execute(
            "UPDATE run SET status = 'CANCELLING' \
             WHERE run_id = ?1 AND status IN ('QUEUED', 'RUNNING')",
            params![run_id],
        )?;
        if changed == 0 {
            let exists: Option<i64> = conn
                .query_row("SELECT 1 FROM run WHERE run_id = ?1", params![run_id], |row| row.get(0))
                .optional()?;
            if exists.is_none() {
                return Err(RunStateError::UnknownRun(run_id.to_string()));
            }
            false
        } else {
            true
        }
    };
    if transitioned {
        // A fully idle run (nothing claimed) cancels right away.
        finalize_run(db, run_id)?;
    }
    Ok(transitioned)
}

pub fn get_run(db: &Database, run_id: &str) -> Result<Run, RunStateError> {
    let conn = db.conn();
    let run = conn
        .query_row(
            "SELECT run_id, run_type, status, as_of_time, market_snapshot_id, measures_json, \
                    scenarios_json, portfolio_scope_json, hash_mod, requested_at, started_at, \
                    completed_at, summary_json, error \
             FROM run WHERE run_id = ?1",
            params![run_id],
            run_from_row,
        )
        .optional()?;
    match run {
        Some(Some(run)) => Ok(run),
        Some(None) => Err(RunStateError::Corrupt(run_id.to_string())),
        None => Err(RunStateError::UnknownRun(run_id.to_string())),
    }
}

/// Most recent runs, optionally filtered by status.
pub fn list_runs(
    db: &Database,
    status: Option<RunStatus>,
    limit: usize,
) -> Result<Vec<Run>, RunStateError> {
    let conn = db.conn();
    let mut out = Vec::new();
    let mut push = |row: Option<Run>| match row {
        Some(run) => {
            out.push(run);
            Ok(())
        }
        None => Err(RunStateError::Corrupt("run listing".to_string())),
    };
    const BASE_SQL: &str = "SELECT run_id, run_type, status, as_of_time, market_snapshot_id, \
                            measures_json, scenarios_json, portfolio_scope_json, hash_mod, \
                            requested_at, started_at, completed_at, summary_json, error FROM run";
    if let Some(status) = status {
        let mut stmt =
            conn.prepare_cached(&format!("{} WHERE status = ?1 ORDER BY requested_at DESC LIMIT ?2", BASE_SQL))?;
        let rows = stmt.query_map(params![status.as_str(), limit as i64], run_from_row)?;
        for row in rows {
            push(row?)?;
        }
    } else {
        let mut stmt = conn.prepare_cached(&format!("{} ORDER BY requested_at DESC LIMIT ?1", BASE_SQL))?;
        let rows = stmt.query_map(params![limit as i64], run_from_row)?;
        for row in rows {
            push(row?)?;
        }
    }
    Ok(out)
}

/// Task counts per status for a run.
pub fn run_task_counts(db: &Database, run_id: &str) -> Result<BTreeMap<TaskStatus, i64>, RunStateError> {
    let conn = db.conn();
    let tx = conn.unchecked_transaction()?;
    let counts = count_tasks(&tx, run_id)?;
    tx.commit()?;
    Ok(counts)
}

fn count_tasks(
    tx: &rusqlite::Transaction<'_>,
    run_id: &str,
) -> Result<BTreeMap<TaskStatus, i64>, RunStateError> {
    let mut counts = BTreeMap::new();
    let mut stmt =
        tx.prepare_cached("SELECT status, COUNT(*) FROM run_task WHERE run_id = ?1 GROUP BY status")?;
    let rows = stmt.query_map(params![run_id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;
    for row in rows {
        let (status, n) = row?;
        let status =
            TaskStatus::parse(&status).ok_or_else(|| RunStateError::Corrupt(run_id.to_string()))?;
        counts.insert(status, n);
    }
    Ok(counts)
}

fn dead_error_digest(
    tx: &rusqlite::Transaction<'_>,
    run_id: &str,
) -> Result<Vec<String>, RunStateError> {
    let mut stmt = tx.prepare_cached(
        "SELECT last_error FROM run_task \
         WHERE run_id = ?1 AND status = 'DEAD' AND last_error IS NOT NULL \
         ORDER BY task_id LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![run_id, DEAD_ERROR_DIGEST_LIMIT as i64], |row| {
        row.get::<_, String>(0)
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Row mapper shared by run reads. Returns `Ok(None)` on rows that fail to
/// parse so callers can surface a corruption error with the run id.
fn run_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Option<Run>> {
    let run_id: String = row.get(0)?;
    let run_type: String = row.get(1)?;
    let status: String = row.get(2)?;
    let as_of: String = row.get(3)?;
    let market_snapshot_id: String = row.get(4)?;
    let measures_json: String = row.get(5)?;
    let scenarios_json: String = row.get(6)?;
    let scope_json: String = row.get(7)?;
    let hash_mod: i64 = row.get(8)?;
    let requested_at: String = row.get(9)?;
    let started_at: Option<String> = row.get(10)?;
    let completed_at: Option<String> = row.get(11)?;
    let summary_json: Option<String> = row.get(12)?;
    let error: Option<String> = row.get(13)?;

    let parsed = (|| {
        Some(Run {
            run_id,
            run_type: RunType::parse(&run_type)?,
            status: RunStatus::parse(&status)?,
            as_of_time: parse_timestamp(&as_of)?,
            market_snapshot_id,
            measures: serde_json::from_str(&measures_json).ok()?,
            scenarios: serde_json::from_str(&scenarios_json).ok()?,
            portfolio_scope: serde_json::from_str(&scope_json).ok()?,
            hash_mod: u32::try_from(hash_mod).ok()?,
            requested_at: parse_timestamp(&requested_at)?,
            started_at: match started_at {
                Some(s) => Some(parse_timestamp(&s)?),
                None => None,
            },
            completed_at: match completed_at {
                Some(s) => Some(parse_timestamp(&s)?),
                None => None,
            },
            summary: match summary_json {
                Some(s) => Some(serde_json::from_str(&s).ok()?),
                None => None,
            },
            error,
        })
    })();
    Ok(parsed)
}
