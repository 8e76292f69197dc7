//! Run orchestrator.
//!
//! Admission control and fan-out. A submitted run is validated against the
//! snapshot store and the scenario catalogue, its portfolio scope is
//! resolved to concrete position snapshots (latest per node at or before the
//! as-of time), and one task is created per `(node, product type, bucket)`
//! cell. Run row and task rows land in a single transaction, so a duplicate
//! run id leaves no partial writes behind.

use chrono::{DateTime, Utc};
use rusqlite::params;
use std::collections::BTreeSet;
use tracing::info;
use uuid::Uuid;

use crate::db::Database;
use crate::hashing;
use crate::models::{format_timestamp, valid_measure_tag, PositionSnapshot, RunType};
use crate::scenario::ScenarioId;
use crate::snapshot_store::{SnapshotStore, SnapshotStoreError};

#[derive(Debug)]
pub enum SubmitError {
    Validation(String),
    UnknownSnapshot(String),
    /// Run id already exists.
    Conflict(String),
    Store(SnapshotStoreError),
    Sqlite(rusqlite::Error),
}

impl std::fmt::Display for SubmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(m) => write!(f, "invalid run request: {}", m),
            Self::UnknownSnapshot(id) => write!(f, "unknown market snapshot: {}", id),
            Self::Conflict(id) => write!(f, "run already exists: {}", id),
            Self::Store(e) => write!(f, "snapshot store error: {}", e),
            Self::Sqlite(e) => write!(f, "SQLite error: {}", e),
        }
    }
}

impl std::error::Error for SubmitError {}

impl From<rusqlite::Error> for SubmitError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Sqlite(e)
    }
}

/// A validated run submission, independent of the wire shape.
#[derive(Debug, Clone)]
pub struct SubmitRunRequest {
    /// Client-supplied id; generated when absent.
    pub run_id: Option<String>,
    pub run_type: RunType,
    pub as_of_time: DateTime<Utc>,
    pub market_snapshot_id: String,
    pub portfolio_scope: Vec<String>,
    pub measures: Vec<String>,
    pub scenarios: Vec<String>,
    pub hash_mod: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct SubmittedRun {
    pub run_id: String,
    pub task_count: usize,
}

/// Fan-out defaults taken from the environment at startup.
#[derive(Debug, Clone, Copy)]
pub struct RunDefaults {
    pub hash_mod: u32,
    pub max_attempts: u32,
}

impl Default for RunDefaults {
    fn default() -> Self {
        Self { hash_mod: 1, max_attempts: 3 }
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    db: Database,
    snapshots: SnapshotStore,
    defaults: RunDefaults,
}

impl Orchestrator {
    pub fn new(db: Database, snapshots: SnapshotStore, defaults: RunDefaults) -> Self {
        Self { db, snapshots, defaults }
    }

    /// Validate and admit a run, fanning it out into tasks.
    pub fn submit_run(&self, request: &SubmitRunRequest) -> Result<SubmittedRun, SubmitError> {
        let hash_mod = request.hash_mod.unwrap_or(self.defaults.hash_mod);
        if hash_mod < 1 {
            return Err(SubmitError::Validation("hash_mod must be >= 1".to_string()));
        }
        if request.portfolio_scope.is_empty() {
            return Err(SubmitError::Validation("portfolio_scope is empty".to_string()));
        }
        if request.portfolio_scope.iter().any(|n| n.trim().is_empty()) {
            return Err(SubmitError::Validation("portfolio_scope contains a blank node id".to_string()));
        }
        if request.measures.is_empty() {
            return Err(SubmitError::Validation("measures is empty".to_string()));
        }
        for tag in &request.measures {
            if !valid_measure_tag(tag) {
                return Err(SubmitError::Validation(format!("invalid measure tag: {}", tag)));
            }
        }
        let scenarios = resolve_scenarios(&request.scenarios)?;

        let market = match self.snapshots.get_market_snapshot(&request.market_snapshot_id) {
            Ok(snapshot) => snapshot,
            Err(SnapshotStoreError::NotFound(id)) => return Err(SubmitError::UnknownSnapshot(id)),
            Err(e) => return Err(SubmitError::Store(e)),
        };
        if !market.dq_status.admissible() {
            return Err(SubmitError::Validation(format!(
                "market snapshot {} has dq_status FAIL",
                market.snapshot_id
            )));
        }

        // Scope resolution: latest snapshot per node at or before as-of.
        let mut resolved: Vec<PositionSnapshot> = Vec::with_capacity(request.portfolio_scope.len());
        for node_id in &request.portfolio_scope {
            let snapshot = self
                .snapshots
                .latest_position_snapshot(node_id, request.as_of_time)
                .map_err(SubmitError::Store)?
                .ok_or_else(|| {
                    SubmitError::Validation(format!(
                        "no position snapshot at or before {} for node {}",
                        format_timestamp(request.as_of_time),
                        node_id
                    ))
                })?;
            resolved.push(snapshot);
        }

        // One task per (node, product type present on that node, bucket).
        let mut tasks: Vec<(String, String, String, u32)> = Vec::new();
        for snapshot in &resolved {
            let product_types: BTreeSet<&str> =
                snapshot.positions.iter().map(|p| p.product_type.as_str()).collect();
            for product_type in product_types {
                for bucket in 0..hash_mod {
                    tasks.push((
                        snapshot.portfolio_node_id.clone(),
                        product_type.to_string(),
                        snapshot.position_snapshot_id.clone(),
                        bucket,
                    ));
                }
            }
        }
        if tasks.is_empty() {
            return Err(SubmitError::Validation(
                "portfolio scope resolves to no positions".to_string(),
            ));
        }

        let run_id = request
            .run_id
            .clone()
            .unwrap_or_else(|| format!("run-{}", Uuid::new_v4()));
        let scenario_tags: Vec<String> = scenarios.iter().map(|s| s.as_str().to_string()).collect();
        let measures = dedupe_ordered(&request.measures);
        let now = Utc::now();
        let now_ms = Database::now_millis();

        {
            let mut conn = self.db.conn();
            let tx = conn.transaction()?;
            let inserted = tx.execute(
                "INSERT INTO run (run_id, run_type, status, as_of_time, market_snapshot_id, \
                     measures_json, scenarios_json, portfolio_scope_json, hash_mod, requested_at) \
                 VALUES (?1, ?2, 'QUEUED', ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
                 ON CONFLICT (run_id) DO NOTHING",
                params![
                    run_id,
                    request.run_type.as_str(),
                    format_timestamp(request.as_of_time),
                    request.market_snapshot_id,
                    serde_json::to_string(&measures)
                        .map_err(|e| SubmitError::Validation(e.to_string()))?,
                    serde_json::to_string(&scenario_tags)
                        .map_err(|e| SubmitError::Validation(e.to_string()))?,
                    serde_json::to_string(&request.portfolio_scope)
                        .map_err(|e| SubmitError::Validation(e.to_string()))?,
                    hash_mod,
                    format_timestamp(now),
                ],
            )?;
            if inserted == 0 {
                // Run exists; the dropped transaction leaves nothing behind.
                return Err(SubmitError::Conflict(run_id));
            }
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO run_task (task_id, run_id, portfolio_node_id, product_type, \
                         position_snapshot_id, hash_mod, hash_bucket, status, attempt, \
                         max_attempts, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'QUEUED', 0, ?8, ?9, ?9)",
                )?;
                for (node_id, product_type, position_snapshot_id, bucket) in &tasks {
                    let task_id = hashing::task_id_for(&run_id, node_id, product_type, *bucket);
                    stmt.execute(params![
                        task_id,
                        run_id,
                        node_id,
                        product_type,
                        position_snapshot_id,
                        hash_mod,
                        bucket,
                        self.defaults.max_attempts,
                        now_ms,
                    ])?;
                }
            }
            tx.commit()?;
        }

        info!(
            run_id,
            task_count = tasks.len(),
            hash_mod,
            market_snapshot_id = %request.market_snapshot_id,
            "run admitted"
        );
        Ok(SubmittedRun { run_id, task_count: tasks.len() })
    }
}

/// Parse scenario ids, prepend the implicit BASE, drop duplicates while
/// preserving order.
fn resolve_scenarios(tags: &[String]) -> Result<Vec<ScenarioId>, SubmitError> {
    let mut out: Vec<ScenarioId> = Vec::with_capacity(tags.len() + 1);
    out.push(ScenarioId::Base);
    for tag in tags {
        let scenario =
            ScenarioId::parse(tag).map_err(|e| SubmitError::Validation(e.to_string()))?;
        if !out.contains(&scenario) {
            out.push(scenario);
        }
    }
    Ok(out)
}

fn dedupe_ordered(tags: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    tags.iter()
        .filter(|t| seen.insert(t.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::{CurveNode, MarketPayload, ZeroCurve};
    use crate::models::{parse_timestamp, DqStatus, Position, RunStatus};
    use crate::run_state;
    use serde_json::json;

    fn setup() -> (Database, SnapshotStore, Orchestrator) {
        let db = Database::in_memory().unwrap();
        let snapshots = SnapshotStore::new(db.clone());
        let orchestrator =
            Orchestrator::new(db.clone(), snapshots.clone(), RunDefaults::default());
        (db, snapshots, orchestrator)
    }

    fn seed_market(snapshots: &SnapshotStore, id: &str, dq: DqStatus) {
        let payload = MarketPayload {
            curves: vec![ZeroCurve {
                id: "USD-OIS".to_string(),
                nodes: vec![
                    CurveNode { tenor: "1Y".to_string(), rate: 0.05 },
                    CurveNode { tenor: "5Y".to_string(), rate: 0.05 },
                ],
            }],
            fx_spots: vec![],
        };
        snapshots
            .put_market_snapshot(id, parse_timestamp("2026-03-01T00:00:00Z").unwrap(), "vendor", "GLOBAL", &payload, dq)
            .unwrap();
    }

    fn bond(position_id: &str) -> Position {
        Position {
            position_id: position_id.to_string(),
            product_type: "FIXED_BOND".to_string(),
            instrument: Some(json!({"face": 100.0, "coupon": 0.05, "maturity": "5Y"})),
            instrument_id: None,
            attributes: json!({}),
            base_currency: "USD".to_string(),
        }
    }

    fn fx(position_id: &str) -> Position {
        Position {
            position_id: position_id.to_string(),
            product_type: "FX_FWD".to_string(),
            instrument: Some(json!({"pair": "EURUSD", "notional": 1e6, "strike": 1.05, "maturity": "1Y"})),
            instrument_id: None,
            attributes: json!({}),
            base_currency: "USD".to_string(),
        }
    }

    fn request(run_id: &str, hash_mod: u32) -> SubmitRunRequest {
        SubmitRunRequest {
            run_id: Some(run_id.to_string()),
            run_type: RunType::Intraday,
            as_of_time: parse_timestamp("2026-03-01T12:00:00Z").unwrap(),
            market_snapshot_id: "mkt-1".to_string(),
            portfolio_scope: vec!["desk-a".to_string()],
            measures: vec!["PV".to_string()],
            scenarios: vec![],
            hash_mod: Some(hash_mod),
        }
    }

    #[test]
    fn fan_out_covers_product_types_times_buckets() {
        let (db, snapshots, orchestrator) = setup();
        seed_market(&snapshots, "mkt-1", DqStatus::Pass);
        let positions: Vec<Position> = (0..8)
            .map(|i| bond(&format!("b{}", i)))
            .chain((0..2).map(|i| fx(&format!("f{}", i))))
            .collect();
        snapshots
            .put_position_snapshot("desk-a", parse_timestamp("2026-03-01T00:00:00Z").unwrap(), &positions)
            .unwrap();

        let submitted = orchestrator.submit_run(&request("r1", 4)).unwrap();
        // two product types x four buckets
        assert_eq!(submitted.task_count, 8);

        let run = run_state::get_run(&db, "r1").unwrap();
        assert_eq!(run.status, RunStatus::Queued);
        assert_eq!(run.scenarios, vec!["BASE".to_string()]);
        assert_eq!(run.hash_mod, 4);
    }

    #[test]
    fn task_ids_are_deterministic() {
        let (db, snapshots, orchestrator) = setup();
        seed_market(&snapshots, "mkt-1", DqStatus::Pass);
        snapshots
            .put_position_snapshot("desk-a", parse_timestamp("2026-03-01T00:00:00Z").unwrap(), &[bond("p1")])
            .unwrap();
        orchestrator.submit_run(&request("r1", 2)).unwrap();

        let conn = db.conn();
        let mut stmt = conn.prepare("SELECT task_id FROM run_task ORDER BY task_id").unwrap();
        let ids: Vec<String> =
            stmt.query_map([], |row| row.get(0)).unwrap().map(|r| r.unwrap()).collect();
        let expected: Vec<String> = {
            let mut v = vec![
                hashing::task_id_for("r1", "desk-a", "FIXED_BOND", 0),
                hashing::task_id_for("r1", "desk-a", "FIXED_BOND", 1),
            ];
            v.sort();
            v
        };
        assert_eq!(ids, expected);
    }

    #[test]
    fn duplicate_run_id_conflicts_without_partial_writes() {
        let (db, snapshots, orchestrator) = setup();
        seed_market(&snapshots, "mkt-1", DqStatus::Pass);
        snapshots
            .put_position_snapshot("desk-a", parse_timestamp("2026-03-01T00:00:00Z").unwrap(), &[bond("p1")])
            .unwrap();
        orchestrator.submit_run(&request("r1", 1)).unwrap();
        let err = orchestrator.submit_run(&request("r1", 4)).unwrap_err();
        assert!(matches!(err, SubmitError::Conflict(_)));

        // fan-out from the first submission is intact
        let n: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM run_task WHERE run_id = 'r1'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn rejects_bad_requests() {
        let (_db, snapshots, orchestrator) = setup();
        seed_market(&snapshots, "mkt-1", DqStatus::Pass);
        snapshots
            .put_position_snapshot("desk-a", parse_timestamp("2026-03-01T00:00:00Z").unwrap(), &[bond("p1")])
            .unwrap();

        let mut bad = request("r-bad", 0);
        bad.hash_mod = Some(0);
        assert!(matches!(orchestrator.submit_run(&bad).unwrap_err(), SubmitError::Validation(_)));

        let mut bad = request("r-bad", 1);
        bad.measures = vec!["pv".to_string()];
        assert!(matches!(orchestrator.submit_run(&bad).unwrap_err(), SubmitError::Validation(_)));

        let mut bad = request("r-bad", 1);
        bad.scenarios = vec!["RATES_PARALLEL_100BP".to_string()];
        assert!(matches!(orchestrator.submit_run(&bad).unwrap_err(), SubmitError::Validation(_)));

        let mut bad = request("r-bad", 1);
        bad.market_snapshot_id = "mkt-missing".to_string();
        assert!(matches!(
            orchestrator.submit_run(&bad).unwrap_err(),
            SubmitError::UnknownSnapshot(_)
        ));

        let mut bad = request("r-bad", 1);
        bad.portfolio_scope = vec!["desk-without-snapshots".to_string()];
        assert!(matches!(orchestrator.submit_run(&bad).unwrap_err(), SubmitError::Validation(_)));
    }

    #[test]
    fn rejects_failed_dq_snapshot() {
        let (_db, snapshots, orchestrator) = setup();
        seed_market(&snapshots, "mkt-1", DqStatus::Fail);
        snapshots
            .put_position_snapshot("desk-a", parse_timestamp("2026-03-01T00:00:00Z").unwrap(), &[bond("p1")])
            .unwrap();
        assert!(matches!(
            orchestrator.submit_run(&request("r1", 1)).unwrap_err(),
            SubmitError::Validation(_)
        ));
    }

    #[test]
    fn warn_dq_is_admissible_and_scenarios_deduplicate() {
        let (db, snapshots, orchestrator) = setup();
        seed_market(&snapshots, "mkt-1", DqStatus::Warn);
        snapshots
            .put_position_snapshot("desk-a", parse_timestamp("2026-03-01T00:00:00Z").unwrap(), &[bond("p1")])
            .unwrap();
        let mut req = request("r1", 1);
        req.scenarios = vec![
            "BASE".to_string(),
            "RATES_PARALLEL_1BP".to_string(),
            "RATES_PARALLEL_1BP".to_string(),
        ];
        orchestrator.submit_run(&req).unwrap();
        let run = run_state::get_run(&db, "r1").unwrap();
        assert_eq!(
            run.scenarios,
            vec!["BASE".to_string(), "RATES_PARALLEL_1BP".to_string()]
        );
    }
}
