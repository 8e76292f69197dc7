//! Worker loop.
//!
//! A worker is a sequential claim-execute loop; fleets are built by running
//! many workers as peers against the same database. Execution of one task:
//! load the run and both snapshots, resolve the pricer, precompute the
//! shocked payload per scenario (application is pure, so hoisting it out of
//! the position loop changes nothing), then price every in-bucket position
//! under every scenario, flushing each position's scenario rows as one
//! write batch.
//!
//! Failure handling is explicit per stage; there is no catch-all. Losing the
//! lease aborts the task body outright - another worker owns the task, and
//! any rows already written are safe because result writes are idempotent on
//! the input hash.

use metrics::{counter, histogram};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::db::Database;
use crate::hashing;
use crate::models::{
    ComputeMeta, FailureKind, MarketSnapshot, Position, Run, RunTask, TaskFailure,
};
use crate::pricing::{PricerError, PricerRegistry, RegistryError};
use crate::queue::{QueueError, TaskQueue};
use crate::result_store::{ResultRow, ResultStore, UpsertOutcome};
use crate::run_state::{self, RunStateError};
use crate::scenario::{self, ScenarioId};
use crate::snapshot_store::{SnapshotStore, SnapshotStoreError};

/// Heartbeat after this many positions, or after a third of the lease,
/// whichever comes first.
const HEARTBEAT_EVERY_POSITIONS: usize = 25;

/// Cap on per-position error samples carried into `last_error`.
const ERROR_SAMPLE_LIMIT: usize = 10;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub lease_seconds: u64,
    pub idle_sleep_seconds: f64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", uuid::Uuid::new_v4()),
            lease_seconds: 60,
            idle_sleep_seconds: 0.5,
        }
    }
}

/// Unrecoverable worker error; the daemon exits with code 2 so a supervisor
/// can restart it.
#[derive(Debug)]
pub struct FatalError(pub String);

impl std::fmt::Display for FatalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fatal worker error: {}", self.0)
    }
}

impl std::error::Error for FatalError {}

#[derive(Debug)]
pub enum InstrumentSourceError {
    NotFound(String),
    Io(String),
}

/// Optional external instrument lookup. Embedded instruments are canonical;
/// a missing source simply classifies reference-only positions as
/// `MissingInput`.
pub trait InstrumentSource: Send + Sync {
    fn get_instrument(&self, instrument_id: &str) -> Result<Value, InstrumentSourceError>;
}

/// Task-local diagnostics, surfaced through `run_task.last_error`.
#[derive(Debug, Default)]
struct TaskDiagnostics {
    priced: usize,
    position_errors: usize,
    samples: Vec<String>,
    conflicts: usize,
}

impl TaskDiagnostics {
    fn record_position_error(&mut self, position_id: &str, kind: FailureKind, message: &str) {
        self.position_errors += 1;
        if self.samples.len() < ERROR_SAMPLE_LIMIT {
            self.samples.push(format!("{}: {}: {}", position_id, kind, message));
        }
    }

    fn record_conflict(&mut self) {
        self.conflicts += 1;
    }

    fn summary(&self) -> Option<String> {
        if self.position_errors == 0 && self.conflicts == 0 {
            return None;
        }
        let mut parts = Vec::new();
        if self.position_errors > 0 {
            parts.push(format!(
                "{} position errors [{}]",
                self.position_errors,
                self.samples.join("; ")
            ));
        }
        if self.conflicts > 0 {
            parts.push(format!("{} result conflicts (overwritten)", self.conflicts));
        }
        Some(parts.join(" | "))
    }
}

/// Outcome of one position-loop stage that may abort the task body.
enum BodyOutcome {
    Completed(TaskDiagnostics),
    /// Task already reported (failed/cancelled) or lease lost; stop quietly.
    Aborted,
}

pub struct Worker {
    config: WorkerConfig,
    db: Database,
    queue: TaskQueue,
    snapshots: SnapshotStore,
    results: ResultStore,
    registry: Arc<PricerRegistry>,
    instruments: Option<Arc<dyn InstrumentSource>>,
    shutdown: Arc<AtomicBool>,
    /// Market snapshots are write-once, so the id pins the content.
    market_cache: HashMap<String, Arc<MarketSnapshot>>,
}

impl Worker {
    pub fn new(config: WorkerConfig, db: Database, registry: Arc<PricerRegistry>) -> Self {
        Self {
            config,
            queue: TaskQueue::new(db.clone()),
            snapshots: SnapshotStore::new(db.clone()),
            results: ResultStore::new(db.clone()),
            db,
            registry,
            instruments: None,
            shutdown: Arc::new(AtomicBool::new(false)),
            market_cache: HashMap::new(),
        }
    }

    pub fn with_instrument_source(mut self, source: Arc<dyn InstrumentSource>) -> Self {
        self.instruments = Some(source);
        self
    }

    /// Flag observed between tasks and at heartbeat boundaries.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Claim-execute until the shutdown flag is set.
    pub fn run(&mut self) -> Result<(), FatalError> {
        info!(worker_id = %self.config.worker_id, "worker started");
        while !self.shutdown.load(Ordering::Relaxed) {
            if !self.run_once()? {
                self.idle_sleep();
            }
        }
        info!(worker_id = %self.config.worker_id, "worker stopped on shutdown signal");
        Ok(())
    }

    /// One claim attempt. Returns whether a task was claimed and executed.
    pub fn run_once(&mut self) -> Result<bool, FatalError> {
        let lease_millis = self.lease_millis();
        let task = match self.queue.claim(&self.config.worker_id, lease_millis) {
            Ok(task) => task,
            Err(e) => {
                // Database trouble on claim is transient by definition; the
                // idle sleep is the backoff.
                warn!(error = %e, "claim failed, backing off");
                counter!("riskrun_claim_errors_total", 1);
                return Ok(false);
            }
        };
        let Some(task) = task else {
            return Ok(false);
        };
        let started = Instant::now();
        self.execute_task(&task)?;
        histogram!("riskrun_task_seconds", started.elapsed().as_secs_f64());
        Ok(true)
    }

    fn lease_millis(&self) -> i64 {
        (self.config.lease_seconds as i64).saturating_mul(1000)
    }

    fn idle_sleep(&self) {
        // Spread idle fleets out so empty claims do not arrive in lockstep.
        let jitter = 0.75 + 0.5 * rand::random::<f64>();
        std::thread::sleep(Duration::from_secs_f64(
            self.config.idle_sleep_seconds.max(0.0) * jitter,
        ));
    }

    fn execute_task(&mut self, task: &RunTask) -> Result<(), FatalError> {
        debug!(task_id = %task.task_id, product_type = %task.product_type, bucket = task.hash_bucket, "executing task");

        // Stage: load run.
        let run = match run_state::get_run(&self.db, &task.run_id) {
            Ok(run) => run,
            Err(RunStateError::UnknownRun(id)) => {
                self.fail_task(task, &TaskFailure::new(FailureKind::MissingInput, format!("run not found: {}", id)));
                return Ok(());
            }
            Err(RunStateError::Sqlite(e)) => {
                self.fail_task(task, &TaskFailure::new(FailureKind::TransientIo, e.to_string()));
                return Ok(());
            }
            Err(RunStateError::Corrupt(id)) => {
                return self.fatal(task, format!("corrupt run row: {}", id));
            }
        };

        // Stage: parse stored scenarios. Admission validated them, so a bad
        // tag here is an invariant break, not bad input.
        let mut scenarios = Vec::with_capacity(run.scenarios.len());
        for tag in &run.scenarios {
            match ScenarioId::parse(tag) {
                Ok(scenario) => scenarios.push(scenario),
                Err(e) => return self.fatal(task, format!("run {}: {}", run.run_id, e)),
            }
        }

        // Stage: load market snapshot (cached) and position snapshot.
        let market = match self.load_market(&run.market_snapshot_id) {
            Ok(snapshot) => snapshot,
            Err(SnapshotStoreError::NotFound(id)) => {
                self.fail_task(task, &TaskFailure::new(FailureKind::MissingInput, format!("market snapshot not found: {}", id)));
                return Ok(());
            }
            Err(SnapshotStoreError::Sqlite(e)) => {
                self.fail_task(task, &TaskFailure::new(FailureKind::TransientIo, e.to_string()));
                return Ok(());
            }
            Err(e) => return self.fatal(task, e.to_string()),
        };
        let position_snapshot = match self.snapshots.get_position_snapshot(&task.position_snapshot_id) {
            Ok(snapshot) => snapshot,
            Err(SnapshotStoreError::NotFound(id)) => {
                self.fail_task(task, &TaskFailure::new(FailureKind::MissingInput, format!("position snapshot not found: {}", id)));
                return Ok(());
            }
            Err(SnapshotStoreError::Sqlite(e)) => {
                self.fail_task(task, &TaskFailure::new(FailureKind::TransientIo, e.to_string()));
                return Ok(());
            }
            Err(e) => return self.fatal(task, e.to_string()),
        };

        // Stage: resolve pricer. Absence is a hard failure, never a silent
        // mis-dispatch.
        let pricer = match self.registry.get(&task.product_type) {
            Ok(pricer) => pricer,
            Err(RegistryError::UnknownProduct(product)) => {
                self.fail_task(task, &TaskFailure::new(FailureKind::UnknownProduct, product));
                return Ok(());
            }
            Err(e) => return self.fatal(task, e.to_string()),
        };

        // Stage: pure scenario application, hoisted out of the position loop.
        let shocked: Vec<(ScenarioId, crate::market::MarketPayload)> = scenarios
            .iter()
            .map(|s| (*s, scenario::apply(&market.payload, *s)))
            .collect();

        let outcome = self.price_positions(
            task,
            &run,
            market.as_ref(),
            &position_snapshot.positions,
            pricer.as_ref(),
            &shocked,
        )?;
        let diagnostics = match outcome {
            BodyOutcome::Completed(diagnostics) => diagnostics,
            BodyOutcome::Aborted => return Ok(()),
        };

        counter!("riskrun_positions_priced_total", diagnostics.priced as u64);
        let note = diagnostics.summary();
        match self.queue.succeed(&task.task_id, &self.config.worker_id, note.as_deref()) {
            Ok(()) => {
                debug!(task_id = %task.task_id, priced = diagnostics.priced, errors = diagnostics.position_errors, "task succeeded");
            }
            Err(QueueError::LeaseLost(_)) => {
                // Another worker owns the task now; its results supersede ours.
                debug!(task_id = %task.task_id, "lease lost at completion");
            }
            Err(e) => warn!(task_id = %task.task_id, error = %e, "failed to record task success"),
        }
        Ok(())
    }

    fn price_positions(
        &self,
        task: &RunTask,
        run: &Run,
        market: &MarketSnapshot,
        positions: &[Position],
        pricer: &dyn crate::pricing::Pricer,
        shocked: &[(ScenarioId, crate::market::MarketPayload)],
    ) -> Result<BodyOutcome, FatalError> {
        let lease_millis = self.lease_millis();
        let heartbeat_interval = Duration::from_millis((lease_millis / 3).max(1) as u64);
        let mut since_heartbeat = 0usize;
        let mut last_heartbeat = Instant::now();
        let mut diagnostics = TaskDiagnostics::default();

        let in_bucket = positions.iter().filter(|p| {
            p.product_type == task.product_type
                && hashing::bucket_for(&p.position_id, task.hash_mod) == task.hash_bucket
        });

        for position in in_bucket {
            let instrument = match self.resolve_instrument(position) {
                Ok(instrument) => instrument,
                Err(InstrumentSourceError::NotFound(id)) => {
                    diagnostics.record_position_error(
                        &position.position_id,
                        FailureKind::MissingInput,
                        &format!("instrument not found: {}", id),
                    );
                    continue;
                }
                Err(InstrumentSourceError::Io(message)) => {
                    self.fail_task(task, &TaskFailure::new(FailureKind::TransientIo, message));
                    return Ok(BodyOutcome::Aborted);
                }
            };

            let hashes = hashing::hash_of(position)
                .and_then(|p| hashing::hash_of(&instrument).map(|i| (p, i)));
            let (position_hash, instrument_hash) = match hashes {
                Ok(pair) => pair,
                Err(e) => {
                    diagnostics.record_position_error(
                        &position.position_id,
                        FailureKind::MissingInput,
                        &e.to_string(),
                    );
                    continue;
                }
            };

            let mut rows: Vec<ResultRow> = Vec::with_capacity(shocked.len());
            for (scenario, payload) in shocked {
                let started = Instant::now();
                match pricer.price(position, &instrument, payload, &run.measures, *scenario) {
                    Ok(measures) => {
                        let input_hash = hashing::input_fingerprint(
                            &market.payload_hash,
                            &position_hash,
                            &instrument_hash,
                            pricer.version(),
                            scenario.as_str(),
                        );
                        rows.push(ResultRow {
                            position_id: position.position_id.clone(),
                            scenario_id: scenario.as_str().to_string(),
                            measures,
                            compute_meta: ComputeMeta {
                                pricer: pricer.name().to_string(),
                                pricer_version: pricer.version().to_string(),
                                worker_id: self.config.worker_id.clone(),
                                elapsed_micros: started.elapsed().as_micros() as u64,
                            },
                            input_hash,
                        });
                    }
                    Err(PricerError::MissingInput(message)) => {
                        diagnostics.record_position_error(
                            &position.position_id,
                            FailureKind::MissingInput,
                            &message,
                        );
                        break;
                    }
                    Err(PricerError::Fault(message)) => {
                        diagnostics.record_position_error(
                            &position.position_id,
                            FailureKind::PricerFault,
                            &message,
                        );
                        break;
                    }
                }
            }

            // One write transaction per position covers all its scenario
            // rows, including those priced before a failing scenario.
            match self.results.upsert_position_batch(
                &run.run_id,
                &task.portfolio_node_id,
                &task.product_type,
                &position.base_currency,
                &rows,
            ) {
                Ok(outcomes) => {
                    diagnostics.priced += outcomes.len();
                    for outcome in &outcomes {
                        if matches!(outcome, UpsertOutcome::ConflictOverwritten { .. }) {
                            diagnostics.record_conflict();
                        }
                    }
                }
                Err(e) => {
                    self.fail_task(task, &TaskFailure::new(FailureKind::TransientIo, e.to_string()));
                    return Ok(BodyOutcome::Aborted);
                }
            }

            since_heartbeat += 1;
            if since_heartbeat >= HEARTBEAT_EVERY_POSITIONS
                || last_heartbeat.elapsed() >= heartbeat_interval
            {
                match self.queue.heartbeat(&task.task_id, &self.config.worker_id, lease_millis) {
                    Ok(status) if status.cancelling => {
                        self.fail_task(
                            task,
                            &TaskFailure::new(FailureKind::Cancelled, "run cancelled"),
                        );
                        return Ok(BodyOutcome::Aborted);
                    }
                    Ok(_) => {
                        since_heartbeat = 0;
                        last_heartbeat = Instant::now();
                    }
                    Err(QueueError::LeaseLost(_)) => {
                        // No writes after this point; the new owner re-prices.
                        warn!(task_id = %task.task_id, "lease lost mid-task, aborting");
                        counter!("riskrun_leases_lost_total", 1);
                        return Ok(BodyOutcome::Aborted);
                    }
                    Err(e) => {
                        self.fail_task(task, &TaskFailure::new(FailureKind::TransientIo, e.to_string()));
                        return Ok(BodyOutcome::Aborted);
                    }
                }
            }
        }
        Ok(BodyOutcome::Completed(diagnostics))
    }

    fn resolve_instrument(&self, position: &Position) -> Result<Value, InstrumentSourceError> {
        if let Some(instrument) = &position.instrument {
            return Ok(instrument.clone());
        }
        match (&position.instrument_id, &self.instruments) {
            (Some(id), Some(source)) => source.get_instrument(id),
            (Some(id), None) => Err(InstrumentSourceError::NotFound(format!(
                "{} (no instrument source configured)",
                id
            ))),
            (None, _) => Err(InstrumentSourceError::NotFound(
                "position carries no instrument".to_string(),
            )),
        }
    }

    fn load_market(&mut self, snapshot_id: &str) -> Result<Arc<MarketSnapshot>, SnapshotStoreError> {
        if let Some(cached) = self.market_cache.get(snapshot_id) {
            return Ok(cached.clone());
        }
        let snapshot = Arc::new(self.snapshots.get_market_snapshot(snapshot_id)?);
        self.market_cache.insert(snapshot_id.to_string(), snapshot.clone());
        Ok(snapshot)
    }

    fn fail_task(&self, task: &RunTask, failure: &TaskFailure) {
        warn!(task_id = %task.task_id, kind = %failure.kind, message = %failure.message, "task failed");
        match self.queue.fail(
            &task.task_id,
            &self.config.worker_id,
            &failure.to_string(),
            failure.kind.retriable(),
        ) {
            Ok(_) => {}
            Err(QueueError::LeaseLost(_)) => {
                debug!(task_id = %task.task_id, "lease lost while reporting failure");
            }
            Err(e) => warn!(task_id = %task.task_id, error = %e, "failed to record task failure"),
        }
    }

    /// Report the task dead and surface a fatal error so the daemon exits
    /// with code 2.
    fn fatal(&self, task: &RunTask, message: String) -> Result<(), FatalError> {
        error!(task_id = %task.task_id, message = %message, "fatal error");
        self.fail_task(task, &TaskFailure::new(FailureKind::Fatal, message.clone()));
        Err(FatalError(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::{CurveNode, FxSpot, MarketPayload, ZeroCurve};
    use crate::models::{parse_timestamp, DqStatus, RunStatus, TaskStatus};
    use crate::orchestrator::{Orchestrator, RunDefaults, SubmitRunRequest};
    use crate::models::RunType;
    use serde_json::json;

    struct Fixture {
        db: Database,
        snapshots: SnapshotStore,
        orchestrator: Orchestrator,
        queue: TaskQueue,
        results: ResultStore,
    }

    fn fixture() -> Fixture {
        let db = Database::in_memory().unwrap();
        let snapshots = SnapshotStore::new(db.clone());
        let orchestrator = Orchestrator::new(db.clone(), snapshots.clone(), RunDefaults::default());
        Fixture {
            queue: TaskQueue::new(db.clone()),
            results: ResultStore::new(db.clone()),
            db,
            snapshots,
            orchestrator,
        }
    }

    fn seed_market(f: &Fixture) {
        let payload = MarketPayload {
            curves: vec![ZeroCurve {
                id: "USD-OIS".to_string(),
                nodes: vec![
                    CurveNode { tenor: "1Y".to_string(), rate: 0.05 },
                    CurveNode { tenor: "5Y".to_string(), rate: 0.05 },
                ],
            }],
            fx_spots: vec![FxSpot { pair: "EURUSD".to_string(), rate: 1.1 }],
        };
        f.snapshots
            .put_market_snapshot(
                "mkt-1",
                parse_timestamp("2026-03-01T00:00:00Z").unwrap(),
                "vendor",
                "GLOBAL",
                &payload,
                DqStatus::Pass,
            )
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

    fn submit(f: &Fixture, run_id: &str, positions: &[Position], scenarios: &[&str]) {
        f.snapshots
            .put_position_snapshot("desk-a", parse_timestamp("2026-03-01T00:00:00Z").unwrap(), positions)
            .unwrap();
        f.orchestrator
            .submit_run(&SubmitRunRequest {
                run_id: Some(run_id.to_string()),
                run_type: RunType::Sandbox,
                as_of_time: parse_timestamp("2026-03-01T12:00:00Z").unwrap(),
                market_snapshot_id: "mkt-1".to_string(),
                portfolio_scope: vec!["desk-a".to_string()],
                measures: vec!["PV".to_string()],
                scenarios: scenarios.iter().map(|s| s.to_string()).collect(),
                hash_mod: Some(1),
            })
            .unwrap();
    }

    fn worker(f: &Fixture) -> Worker {
        Worker::new(
            WorkerConfig { worker_id: "w1".to_string(), lease_seconds: 60, idle_sleep_seconds: 0.0 },
            f.db.clone(),
            Arc::new(PricerRegistry::bootstrap().unwrap()),
        )
    }

    fn drain(f: &Fixture, worker: &mut Worker) {
        while worker.run_once().unwrap() {}
        let _ = f;
    }

    #[test]
    fn prices_a_single_bond_run_to_completion() {
        let f = fixture();
        seed_market(&f);
        submit(&f, "r1", &[bond("p1")], &[]);

        let mut worker = worker(&f);
        drain(&f, &mut worker);

        let run = run_state::get_run(&f.db, "r1").unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        let result = f.results.get("r1", "p1", "BASE").unwrap().unwrap();
        assert!((result.measures["PV"] - 100.0).abs() < 1e-4);
        assert_eq!(result.compute_meta.pricer_version, "1.0.0");
    }

    #[test]
    fn unknown_product_dead_letters_but_run_completes_on_other_tasks() {
        let f = fixture();
        seed_market(&f);
        let mut odd = bond("weird");
        odd.product_type = "CDS".to_string();
        submit(&f, "r1", &[bond("p1"), odd], &[]);

        let mut worker = worker(&f);
        drain(&f, &mut worker);

        let run = run_state::get_run(&f.db, "r1").unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        let tasks = f.queue.tasks_for_run("r1").unwrap();
        let statuses: Vec<TaskStatus> = tasks.iter().map(|t| t.status).collect();
        assert!(statuses.contains(&TaskStatus::Succeeded));
        assert!(statuses.contains(&TaskStatus::Dead));
        let dead = tasks.iter().find(|t| t.status == TaskStatus::Dead).unwrap();
        assert!(dead.last_error.as_deref().unwrap().contains("UnknownProduct"));
    }

    #[test]
    fn missing_instrument_is_a_per_position_error_not_a_task_failure() {
        let f = fixture();
        seed_market(&f);
        let mut orphan = bond("orphan");
        orphan.instrument = None;
        orphan.instrument_id = Some("inst-remote-1".to_string());
        submit(&f, "r1", &[bond("p1"), orphan], &[]);

        let mut worker = worker(&f);
        drain(&f, &mut worker);

        let run = run_state::get_run(&f.db, "r1").unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(f.results.get("r1", "p1", "BASE").unwrap().is_some());
        assert!(f.results.get("r1", "orphan", "BASE").unwrap().is_none());

        let tasks = f.queue.tasks_for_run("r1").unwrap();
        let note = tasks[0].last_error.as_deref().unwrap();
        assert!(note.contains("1 position errors"));
        assert!(note.contains("inst-remote-1"));
    }

    #[test]
    fn scenarios_produce_one_result_per_position_scenario_pair() {
        let f = fixture();
        seed_market(&f);
        submit(&f, "r1", &[bond("p1")], &["RATES_PARALLEL_1BP"]);

        let mut worker = worker(&f);
        drain(&f, &mut worker);

        assert_eq!(f.results.count_for_run("r1").unwrap(), 2);
        let base = f.results.get("r1", "p1", "BASE").unwrap().unwrap();
        let shocked = f.results.get("r1", "p1", "RATES_PARALLEL_1BP").unwrap().unwrap();
        // rates up, PV down
        assert!(shocked.measures["PV"] < base.measures["PV"]);
        assert_ne!(base.input_hash, shocked.input_hash);
    }

    #[test]
    fn reexecution_after_lease_loss_is_idempotent() {
        let f = fixture();
        seed_market(&f);
        submit(&f, "r1", &[bond("p1")], &[]);

        // First execution completes normally.
        let mut w1 = worker(&f);
        drain(&f, &mut w1);
        let first = f.results.get("r1", "p1", "BASE").unwrap().unwrap();

        // Re-run the same pricing directly; equal input hash leaves the row
        // untouched.
        let outcome = f
            .results
            .upsert(
                "r1",
                "p1",
                "BASE",
                "desk-a",
                "FIXED_BOND",
                "USD",
                &first.measures,
                &first.compute_meta,
                &first.input_hash,
            )
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Unchanged);
        assert_eq!(f.results.count_for_run("r1").unwrap(), 1);
    }
}
