//! Durable task queue with a lease protocol.
//!
//! Tasks live in the `run_task` table. A claim atomically selects the oldest
//! eligible row (QUEUED, or RUNNING with an expired lease), stamps the worker
//! as lease owner and bumps the attempt counter, all in one
//! `UPDATE ... RETURNING` statement. SQLite serializes writers, so two
//! claimants can never take the same row; each simply gets the next eligible
//! one.
//!
//! Heartbeat, succeed and fail are all gated on `lease_owner = worker AND
//! leased_until > now`: once a lease lapses, the previous owner's writes to
//! the task row are rejected with `LeaseLost` and it must abandon the task
//! body. Result writes stay safe either way because they are idempotent on
//! the input hash.

use metrics::counter;
use rusqlite::{params, OptionalExtension, Transaction};
use tracing::{debug, warn};

use crate::db::Database;
use crate::models::{format_timestamp, RunTask, TaskStatus};
use crate::run_state;

#[derive(Debug)]
pub enum QueueError {
    Sqlite(rusqlite::Error),
    /// The lease no longer belongs to the calling worker.
    LeaseLost(String),
    Corrupt(String),
    RunState(Box<run_state::RunStateError>),
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(e) => write!(f, "SQLite error: {}", e),
            Self::LeaseLost(task_id) => write!(f, "lease lost for task: {}", task_id),
            Self::Corrupt(task_id) => write!(f, "stored task is corrupt: {}", task_id),
            Self::RunState(e) => write!(f, "run finalization failed: {}", e),
        }
    }
}

impl std::error::Error for QueueError {}

impl From<rusqlite::Error> for QueueError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Sqlite(e)
    }
}

impl From<run_state::RunStateError> for QueueError {
    fn from(e: run_state::RunStateError) -> Self {
        Self::RunState(Box::new(e))
    }
}

/// Lease confirmation returned by a successful heartbeat.
#[derive(Debug, Clone, Copy)]
pub struct LeaseStatus {
    /// The owning run has been asked to cancel; the worker should stop the
    /// task body and fail with `Cancelled`.
    pub cancelling: bool,
}

/// Terminal disposition of a `fail` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Requeued,
    Dead,
}

const TASK_COLUMNS: &str = "task_id, run_id, portfolio_node_id, product_type, \
    position_snapshot_id, hash_mod, hash_bucket, status, attempt, max_attempts, \
    lease_owner, leased_until, last_error, created_at, updated_at";

#[derive(Clone)]
pub struct TaskQueue {
    db: Database,
}

impl TaskQueue {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Claim one eligible task for `worker_id` with a lease of
    /// `lease_millis`. Reaps expired leases opportunistically first.
    pub fn claim(&self, worker_id: &str, lease_millis: i64) -> Result<Option<RunTask>, QueueError> {
        let now = Database::now_millis();
        let (claimed, finalize_runs) = {
            let mut conn = self.db.conn();
            let tx = conn.transaction()?;

            let dead_runs = reap_expired(&tx, now)?;

            let claim_sql = format!(
                "UPDATE run_task SET \
                     status = 'RUNNING', attempt = attempt + 1, lease_owner = ?1, \
                     leased_until = ?2, updated_at = ?3 \
                 WHERE task_id = ( \
                     SELECT t.task_id FROM run_task t \
                     JOIN run r ON r.run_id = t.run_id \
                     WHERE r.status NOT IN ('CANCELLING', 'CANCELLED') \
                       AND t.attempt < t.max_attempts \
                       AND (t.status = 'QUEUED' \
                            OR (t.status = 'RUNNING' AND t.leased_until <= ?3)) \
                     ORDER BY t.updated_at ASC, t.task_id ASC \
                     LIMIT 1) \
                 RETURNING {}",
                TASK_COLUMNS
            );
            let row: Option<Option<RunTask>> = tx
                .query_row(&claim_sql, params![worker_id, now + lease_millis, now], task_from_row)
                .optional()?;
            let task = match row {
                None => None,
                Some(None) => return Err(QueueError::Corrupt("claimed task".to_string())),
                Some(Some(task)) => Some(task),
            };

            if let Some(task) = &task {
                // First claim of any task moves the run out of QUEUED.
                tx.execute(
                    "UPDATE run SET status = 'RUNNING', started_at = ?2 \
                     WHERE run_id = ?1 AND status = 'QUEUED'",
                    params![task.run_id, format_timestamp(chrono::Utc::now())],
                )?;
            }
            tx.commit()?;
            (task, dead_runs)
        };

        for run_id in finalize_runs {
            run_state::finalize_run(&self.db, &run_id)?;
        }
        if let Some(task) = &claimed {
            counter!("riskrun_queue_claims_total", 1);
            debug!(task_id = %task.task_id, worker_id, attempt = task.attempt, "task claimed");
        }
        Ok(claimed)
    }

    /// Refresh the lease. Fails with `LeaseLost` if the lease is expired,
    /// reassigned, or the task left RUNNING.
    pub fn heartbeat(
        &self,
        task_id: &str,
        worker_id: &str,
        lease_millis: i64,
    ) -> Result<LeaseStatus, QueueError> {
        let now = Database::now_millis();
        let conn = self.db.conn();
        let changed = conn.execute(
            "UPDATE run_task SET leased_until = ?3, updated_at = ?4 \
             WHERE task_id = ?1 AND lease_owner = ?2 AND status = 'RUNNING' AND leased_until > ?4",
            params![task_id, worker_id, now + lease_millis, now],
        )?;
        if changed == 0 {
            return Err(QueueError::LeaseLost(task_id.to_string()));
        }
        let run_status: String = conn.query_row(
            "SELECT r.status FROM run r JOIN run_task t ON t.run_id = r.run_id \
             WHERE t.task_id = ?1",
            params![task_id],
            |row| row.get(0),
        )?;
        Ok(LeaseStatus {
            cancelling: matches!(run_status.as_str(), "CANCELLING" | "CANCELLED"),
        })
    }

    /// Mark the task SUCCEEDED. `note` carries task-local diagnostics
    /// (per-position error summary) into `last_error`.
    pub fn succeed(
        &self,
        task_id: &str,
        worker_id: &str,
        note: Option<&str>,
    ) -> Result<(), QueueError> {
        let now = Database::now_millis();
        let run_id = {
            let conn = self.db.conn();
            let run_id: Option<String> = conn
                .query_row(
                    "UPDATE run_task SET status = 'SUCCEEDED', lease_owner = NULL, \
                         leased_until = NULL, last_error = ?3, updated_at = ?4 \
                     WHERE task_id = ?1 AND lease_owner = ?2 AND status = 'RUNNING' \
                       AND leased_until > ?4 \
                     RETURNING run_id",
                    params![task_id, worker_id, note, now],
                    |row| row.get(0),
                )
                .optional()?;
            run_id.ok_or_else(|| QueueError::LeaseLost(task_id.to_string()))?
        };
        counter!("riskrun_tasks_succeeded_total", 1);
        run_state::finalize_run(&self.db, &run_id)?;
        Ok(())
    }

    /// Record a classified failure. Retriable failures requeue until the
    /// attempt budget is exhausted; everything else dead-letters.
    pub fn fail(
        &self,
        task_id: &str,
        worker_id: &str,
        error: &str,
        retriable: bool,
    ) -> Result<FailOutcome, QueueError> {
        let now = Database::now_millis();
        let (outcome, run_id) = {
            let conn = self.db.conn();
            let row: Option<(String, String)> = conn
                .query_row(
                    "UPDATE run_task SET \
                         status = CASE WHEN ?3 != 0 AND attempt < max_attempts \
                                       THEN 'QUEUED' ELSE 'DEAD' END, \
                         lease_owner = NULL, leased_until = NULL, \
                         last_error = CASE WHEN last_error IS NULL THEN ?4 \
                                           ELSE last_error || ' | ' || ?4 END, \
                         updated_at = ?5 \
                     WHERE task_id = ?1 AND lease_owner = ?2 AND status = 'RUNNING' \
                       AND leased_until > ?5 \
                     RETURNING status, run_id",
                    params![task_id, worker_id, i64::from(retriable), error, now],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let (status, run_id) = row.ok_or_else(|| QueueError::LeaseLost(task_id.to_string()))?;
            let outcome = if status == "DEAD" { FailOutcome::Dead } else { FailOutcome::Requeued };
            (outcome, run_id)
        };
        counter!("riskrun_tasks_failed_total", 1);
        if outcome == FailOutcome::Dead {
            warn!(task_id, error, "task dead-lettered");
            run_state::finalize_run(&self.db, &run_id)?;
        } else {
            debug!(task_id, error, "task requeued");
        }
        Ok(outcome)
    }

    /// All tasks of a run, for the status read-back endpoint.
    pub fn tasks_for_run(&self, run_id: &str) -> Result<Vec<RunTask>, QueueError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM run_task WHERE run_id = ?1 ORDER BY task_id",
            TASK_COLUMNS
        ))?;
        let rows = stmt.query_map(params![run_id], task_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.ok_or_else(|| QueueError::Corrupt(run_id.to_string()))?);
        }
        Ok(out)
    }

    pub fn get_task(&self, task_id: &str) -> Result<Option<RunTask>, QueueError> {
        let conn = self.db.conn();
        let row: Option<Option<RunTask>> = conn
            .query_row(
                &format!("SELECT {} FROM run_task WHERE task_id = ?1", TASK_COLUMNS),
                params![task_id],
                task_from_row,
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some(None) => Err(QueueError::Corrupt(task_id.to_string())),
            Some(Some(task)) => Ok(Some(task)),
        }
    }
}

/// Demote expired RUNNING rows. The lapse itself counts no progress, so the
/// attempt counter is untouched; rows that already spent their attempt
/// budget are dead-lettered instead of looping forever. Returns the run ids
/// that gained dead tasks and need finalization (after this transaction
/// commits).
fn reap_expired(tx: &Transaction<'_>, now: i64) -> Result<Vec<String>, QueueError> {
    let mut dead_runs = Vec::new();
    {
        let mut stmt = tx.prepare_cached(
            "SELECT DISTINCT run_id FROM run_task \
             WHERE status = 'RUNNING' AND leased_until <= ?1 AND attempt >= max_attempts",
        )?;
        let rows = stmt.query_map(params![now], |row| row.get::<_, String>(0))?;
        for row in rows {
            dead_runs.push(row?);
        }
    }
    let dead = tx.execute(
        "UPDATE run_task SET status = 'DEAD', lease_owner = NULL, leased_until = NULL, \
             last_error = CASE WHEN last_error IS NULL \
                               THEN 'lease expired after final attempt' \
                               ELSE last_error || ' | lease expired after final attempt' END, \
             updated_at = ?1 \
         WHERE status = 'RUNNING' AND leased_until <= ?1 AND attempt >= max_attempts",
        params![now],
    )?;
    let requeued = tx.execute(
        "UPDATE run_task SET status = 'QUEUED', lease_owner = NULL, leased_until = NULL, \
             updated_at = ?1 \
         WHERE status = 'RUNNING' AND leased_until <= ?1 AND attempt < max_attempts",
        params![now],
    )?;
    if dead + requeued > 0 {
        counter!("riskrun_queue_reaped_total", (dead + requeued) as u64);
        debug!(requeued, dead, "reaped expired leases");
    }
    Ok(dead_runs)
}

/// Shared task row mapper. `None` means the stored row fails to parse.
fn task_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Option<RunTask>> {
    let status: String = row.get(7)?;
    let parsed_status = TaskStatus::parse(&status);
    let hash_mod: i64 = row.get(5)?;
    let hash_bucket: i64 = row.get(6)?;
    let attempt: i64 = row.get(8)?;
    let max_attempts: i64 = row.get(9)?;

    let task = match (
        parsed_status,
        u32::try_from(hash_mod),
        u32::try_from(hash_bucket),
        u32::try_from(attempt),
        u32::try_from(max_attempts),
    ) {
        (Some(status), Ok(hash_mod), Ok(hash_bucket), Ok(attempt), Ok(max_attempts)) => {
            Some(RunTask {
                task_id: row.get(0)?,
                run_id: row.get(1)?,
                portfolio_node_id: row.get(2)?,
                product_type: row.get(3)?,
                position_snapshot_id: row.get(4)?,
                hash_mod,
                hash_bucket,
                status,
                attempt,
                max_attempts,
                lease_owner: row.get(10)?,
                leased_until_ms: row.get(11)?,
                last_error: row.get(12)?,
                created_at_ms: row.get(13)?,
                updated_at_ms: row.get(14)?,
            })
        }
        _ => None,
    };
    Ok(task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RunStatus;

    /// Insert a minimal run + tasks directly; queue tests do not need the
    /// orchestrator.
    fn seed_run(db: &Database, run_id: &str, task_ids: &[&str], max_attempts: u32) {
        let conn = db.conn();
        conn.execute(
            "INSERT INTO run (run_id, run_type, status, as_of_time, market_snapshot_id, \
                 measures_json, scenarios_json, portfolio_scope_json, hash_mod, requested_at) \
             VALUES (?1, 'SANDBOX', 'QUEUED', '2026-03-01T00:00:00.000000Z', 'mkt-1', \
                 '[\"PV\"]', '[\"BASE\"]', '[\"desk-a\"]', 1, '2026-03-01T00:00:00.000000Z')",
            params![run_id],
        )
        .unwrap();
        let now = Database::now_millis();
        for (i, task_id) in task_ids.iter().enumerate() {
            conn.execute(
                "INSERT INTO run_task (task_id, run_id, portfolio_node_id, product_type, \
                     position_snapshot_id, hash_mod, hash_bucket, status, attempt, max_attempts, \
                     created_at, updated_at) \
                 VALUES (?1, ?2, 'desk-a', 'FIXED_BOND', 'psnap-1', 1, 0, 'QUEUED', 0, ?3, ?4, ?4)",
                params![task_id, run_id, max_attempts, now + i as i64],
            )
            .unwrap();
        }
    }

    fn run_status(db: &Database, run_id: &str) -> RunStatus {
        run_state::get_run(db, run_id).unwrap().status
    }

    #[test]
    fn claim_takes_oldest_and_marks_run_running() {
        let db = Database::in_memory().unwrap();
        seed_run(&db, "r1", &["t-b", "t-a"], 3);
        let queue = TaskQueue::new(db.clone());

        let task = queue.claim("w1", 60_000).unwrap().unwrap();
        assert_eq!(task.task_id, "t-b"); // oldest updated_at wins over id order
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.attempt, 1);
        assert_eq!(task.lease_owner.as_deref(), Some("w1"));
        assert_eq!(run_status(&db, "r1"), RunStatus::Running);

        let second = queue.claim("w2", 60_000).unwrap().unwrap();
        assert_eq!(second.task_id, "t-a");
        assert!(queue.claim("w3", 60_000).unwrap().is_none());
    }

    #[test]
    fn expired_lease_is_reclaimable_and_original_owner_loses() {
        let db = Database::in_memory().unwrap();
        seed_run(&db, "r1", &["t1"], 3);
        let queue = TaskQueue::new(db);

        // zero-length lease expires immediately
        let first = queue.claim("worker-a", 0).unwrap().unwrap();
        assert_eq!(first.attempt, 1);

        let second = queue.claim("worker-b", 60_000).unwrap().unwrap();
        assert_eq!(second.task_id, first.task_id);
        assert_eq!(second.attempt, 2);

        // the usurped worker can neither heartbeat nor complete
        assert!(matches!(
            queue.heartbeat("t1", "worker-a", 60_000),
            Err(QueueError::LeaseLost(_))
        ));
        assert!(matches!(
            queue.succeed("t1", "worker-a", None),
            Err(QueueError::LeaseLost(_))
        ));

        queue.succeed("t1", "worker-b", None).unwrap();
        let task = queue.get_task("t1").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
    }

    #[test]
    fn heartbeat_extends_live_lease() {
        let db = Database::in_memory().unwrap();
        seed_run(&db, "r1", &["t1"], 3);
        let queue = TaskQueue::new(db);

        let task = queue.claim("w1", 60_000).unwrap().unwrap();
        let before = task.leased_until_ms.unwrap();
        let status = queue.heartbeat("t1", "w1", 120_000).unwrap();
        assert!(!status.cancelling);
        let after = queue.get_task("t1").unwrap().unwrap().leased_until_ms.unwrap();
        assert!(after >= before);
    }

    #[test]
    fn retriable_failures_requeue_then_dead_letter() {
        let db = Database::in_memory().unwrap();
        seed_run(&db, "r1", &["t1"], 3);
        let queue = TaskQueue::new(db.clone());

        for expected_attempt in 1..=2u32 {
            let task = queue.claim("w1", 60_000).unwrap().unwrap();
            assert_eq!(task.attempt, expected_attempt);
            let outcome = queue
                .fail("t1", "w1", &format!("TransientIO: boom {}", expected_attempt), true)
                .unwrap();
            assert_eq!(outcome, FailOutcome::Requeued);
        }
        let task = queue.claim("w1", 60_000).unwrap().unwrap();
        assert_eq!(task.attempt, 3);
        let outcome = queue.fail("t1", "w1", "TransientIO: boom 3", true).unwrap();
        assert_eq!(outcome, FailOutcome::Dead);

        let task = queue.get_task("t1").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Dead);
        let last_error = task.last_error.unwrap();
        assert!(last_error.contains("boom 1"));
        assert!(last_error.contains("boom 2"));
        assert!(last_error.contains("boom 3"));

        // only task is dead -> run failed
        assert_eq!(run_status(&db, "r1"), RunStatus::Failed);
        assert!(queue.claim("w1", 60_000).unwrap().is_none());
    }

    #[test]
    fn non_retriable_failure_dead_letters_immediately() {
        let db = Database::in_memory().unwrap();
        seed_run(&db, "r1", &["t1"], 3);
        let queue = TaskQueue::new(db);

        queue.claim("w1", 60_000).unwrap().unwrap();
        let outcome = queue.fail("t1", "w1", "UnknownProduct: CDS", false).unwrap();
        assert_eq!(outcome, FailOutcome::Dead);
    }

    #[test]
    fn claim_skips_cancelling_runs() {
        let db = Database::in_memory().unwrap();
        seed_run(&db, "r1", &["t1"], 3);
        let queue = TaskQueue::new(db.clone());

        run_state::request_cancel(&db, "r1").unwrap();
        assert!(queue.claim("w1", 60_000).unwrap().is_none());
        // idle run cancelled outright; queued task dead-lettered
        assert_eq!(run_status(&db, "r1"), RunStatus::Cancelled);
        let task = queue.get_task("t1").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Dead);
    }

    #[test]
    fn heartbeat_surfaces_cancellation() {
        let db = Database::in_memory().unwrap();
        seed_run(&db, "r1", &["t1", "t2"], 3);
        let queue = TaskQueue::new(db.clone());

        queue.claim("w1", 60_000).unwrap().unwrap();
        run_state::request_cancel(&db, "r1").unwrap();
        // run stays CANCELLING while t1 is in flight
        assert_eq!(run_status(&db, "r1"), RunStatus::Cancelling);

        let status = queue.heartbeat("t1", "w1", 60_000).unwrap();
        assert!(status.cancelling);

        queue.fail("t1", "w1", "Cancelled: run cancelled", false).unwrap();
        assert_eq!(run_status(&db, "r1"), RunStatus::Cancelled);
    }

    #[test]
    fn exhausted_expired_lease_dead_letters_on_reap() {
        let db = Database::in_memory().unwrap();
        seed_run(&db, "r1", &["t1"], 1);
        let queue = TaskQueue::new(db.clone());

        // single attempt, immediately-expiring lease
        queue.claim("w1", 0).unwrap().unwrap();
        // next claim reaps: attempt budget is spent, so the task dies
        assert!(queue.claim("w2", 60_000).unwrap().is_none());
        let task = queue.get_task("t1").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Dead);
        assert!(task.last_error.unwrap().contains("lease expired"));
        assert_eq!(run_status(&db, "r1"), RunStatus::Failed);
    }
}
