//! Valuation result storage.
//!
//! One row per `(run_id, position_id, scenario_id)`. The input hash gates
//! every write: a row with an equal hash is left untouched (re-execution of
//! a lost-lease task becomes a no-op), a differing hash is surfaced as a
//! conflict and overwritten. Last-writer-wins is deliberate: a successful
//! retry supersedes a stale partial result from a leased-then-lost
//! predecessor, and the conflict diagnostic gives operators the anomaly.

use rusqlite::{params, OptionalExtension};
use tracing::warn;

use crate::db::Database;
use crate::models::{ComputeMeta, ValuationResult};
use crate::pricing::MeasureMap;

#[derive(Debug)]
pub enum ResultStoreError {
    Sqlite(rusqlite::Error),
    Serialization(serde_json::Error),
    Corrupt(String),
}

impl std::fmt::Display for ResultStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(e) => write!(f, "SQLite error: {}", e),
            Self::Serialization(e) => write!(f, "serialization error: {}", e),
            Self::Corrupt(key) => write!(f, "stored result is corrupt: {}", key),
        }
    }
}

impl std::error::Error for ResultStoreError {}

impl From<rusqlite::Error> for ResultStoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Sqlite(e)
    }
}

impl From<serde_json::Error> for ResultStoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// Row already present with the same input hash; nothing written.
    Unchanged,
    /// Row present with a different input hash; overwritten.
    ConflictOverwritten { previous_hash: String },
}

/// One scenario's result for a position, queued into a per-position batch.
#[derive(Debug, Clone)]
pub struct ResultRow {
    pub position_id: String,
    pub scenario_id: String,
    pub measures: MeasureMap,
    pub compute_meta: ComputeMeta,
    pub input_hash: String,
}

#[derive(Clone)]
pub struct ResultStore {
    db: Database,
}

impl ResultStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn upsert(
        &self,
        run_id: &str,
        position_id: &str,
        scenario_id: &str,
        portfolio_node_id: &str,
        product_type: &str,
        base_currency: &str,
        measures: &MeasureMap,
        compute_meta: &ComputeMeta,
        input_hash: &str,
    ) -> Result<UpsertOutcome, ResultStoreError> {
        let mut conn = self.db.conn();
        let tx = conn.transaction()?;
        let outcome = upsert_in_tx(
            &tx,
            run_id,
            position_id,
            scenario_id,
            portfolio_node_id,
            product_type,
            base_currency,
            measures,
            compute_meta,
            input_hash,
        )?;
        tx.commit()?;
        Ok(outcome)
    }

    /// All of one position's scenario rows in a single transaction - one
    /// write batch per position, the middle ground between lease pressure
    /// and write amplification. Outcomes align with `rows` by index.
    pub fn upsert_position_batch(
        &self,
        run_id: &str,
        portfolio_node_id: &str,
        product_type: &str,
        base_currency: &str,
        rows: &[ResultRow],
    ) -> Result<Vec<UpsertOutcome>, ResultStoreError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.db.conn();
        let tx = conn.transaction()?;
        let mut outcomes = Vec::with_capacity(rows.len());
        for row in rows {
            outcomes.push(upsert_in_tx(
                &tx,
                run_id,
                &row.position_id,
                &row.scenario_id,
                portfolio_node_id,
                product_type,
                base_currency,
                &row.measures,
                &row.compute_meta,
                &row.input_hash,
            )?);
        }
        tx.commit()?;
        Ok(outcomes)
    }

    pub fn get(
        &self,
        run_id: &str,
        position_id: &str,
        scenario_id: &str,
    ) -> Result<Option<ValuationResult>, ResultStoreError> {
        let conn = self.db.conn();
        let row: Option<(String, String, String, String, String, String)> = conn
            .query_row(
                "SELECT portfolio_node_id, product_type, base_currency, measures_json, \
                        compute_meta_json, input_hash \
                 FROM valuation_result \
                 WHERE run_id = ?1 AND position_id = ?2 AND scenario_id = ?3",
                params![run_id, position_id, scenario_id],
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
        match row {
            None => Ok(None),
            Some((node, product, ccy, measures_json, meta_json, input_hash)) => {
                let key = format!("{}/{}/{}", run_id, position_id, scenario_id);
                Ok(Some(ValuationResult {
                    run_id: run_id.to_string(),
                    position_id: position_id.to_string(),
                    scenario_id: scenario_id.to_string(),
                    portfolio_node_id: node,
                    product_type: product,
                    base_currency: ccy,
                    measures: serde_json::from_str(&measures_json)
                        .map_err(|_| ResultStoreError::Corrupt(key.clone()))?,
                    compute_meta: serde_json::from_str(&meta_json)
                        .map_err(|_| ResultStoreError::Corrupt(key))?,
                    input_hash,
                }))
            }
        }
    }

    pub fn count_for_run(&self, run_id: &str) -> Result<i64, ResultStoreError> {
        let conn = self.db.conn();
        let n = conn.query_row(
            "SELECT COUNT(*) FROM valuation_result WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )?;
        Ok(n)
    }
}

#[allow(clippy::too_many_arguments)]
fn upsert_in_tx(
    tx: &rusqlite::Transaction<'_>,
    run_id: &str,
    position_id: &str,
    scenario_id: &str,
    portfolio_node_id: &str,
    product_type: &str,
    base_currency: &str,
    measures: &MeasureMap,
    compute_meta: &ComputeMeta,
    input_hash: &str,
) -> Result<UpsertOutcome, ResultStoreError> {
    let measures_json = serde_json::to_string(measures)?;
    let meta_json = serde_json::to_string(compute_meta)?;
    let now = Database::now_millis();

    let existing: Option<String> = tx
        .query_row(
            "SELECT input_hash FROM valuation_result \
             WHERE run_id = ?1 AND position_id = ?2 AND scenario_id = ?3",
            params![run_id, position_id, scenario_id],
            |row| row.get(0),
        )
        .optional()?;

    match existing {
        None => {
            tx.execute(
                "INSERT INTO valuation_result \
                 (run_id, position_id, scenario_id, portfolio_node_id, product_type, \
                  base_currency, measures_json, compute_meta_json, input_hash, written_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    run_id,
                    position_id,
                    scenario_id,
                    portfolio_node_id,
                    product_type,
                    base_currency,
                    measures_json,
                    meta_json,
                    input_hash,
                    now,
                ],
            )?;
            Ok(UpsertOutcome::Inserted)
        }
        Some(previous) if previous == input_hash => Ok(UpsertOutcome::Unchanged),
        Some(previous) => {
            warn!(
                run_id,
                position_id,
                scenario_id,
                previous_hash = %previous,
                new_hash = %input_hash,
                "result input hash conflict, overwriting"
            );
            tx.execute(
                "UPDATE valuation_result SET portfolio_node_id = ?4, product_type = ?5, \
                     base_currency = ?6, measures_json = ?7, compute_meta_json = ?8, \
                     input_hash = ?9, written_at = ?10 \
                 WHERE run_id = ?1 AND position_id = ?2 AND scenario_id = ?3",
                params![
                    run_id,
                    position_id,
                    scenario_id,
                    portfolio_node_id,
                    product_type,
                    base_currency,
                    measures_json,
                    meta_json,
                    input_hash,
                    now,
                ],
            )?;
            Ok(UpsertOutcome::ConflictOverwritten { previous_hash: previous })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn meta() -> ComputeMeta {
        ComputeMeta {
            pricer: "fixed_bond_discounting".to_string(),
            pricer_version: "1.0.0".to_string(),
            worker_id: "w1".to_string(),
            elapsed_micros: 42,
        }
    }

    fn measures(pv: f64) -> MeasureMap {
        let mut m = BTreeMap::new();
        m.insert("PV".to_string(), pv);
        m
    }

    fn store() -> ResultStore {
        ResultStore::new(Database::in_memory().unwrap())
    }

    #[test]
    fn insert_then_equal_hash_is_noop() {
        let store = store();
        let first = store
            .upsert("r1", "p1", "BASE", "desk-a", "FIXED_BOND", "USD", &measures(100.0), &meta(), "hash-a")
            .unwrap();
        assert_eq!(first, UpsertOutcome::Inserted);

        let second = store
            .upsert("r1", "p1", "BASE", "desk-a", "FIXED_BOND", "USD", &measures(100.0), &meta(), "hash-a")
            .unwrap();
        assert_eq!(second, UpsertOutcome::Unchanged);

        let row = store.get("r1", "p1", "BASE").unwrap().unwrap();
        assert_eq!(row.measures["PV"], 100.0);
        assert_eq!(store.count_for_run("r1").unwrap(), 1);
    }

    #[test]
    fn differing_hash_is_conflict_with_last_writer_wins() {
        let store = store();
        store
            .upsert("r1", "p1", "BASE", "desk-a", "FIXED_BOND", "USD", &measures(100.0), &meta(), "hash-a")
            .unwrap();
        let outcome = store
            .upsert("r1", "p1", "BASE", "desk-a", "FIXED_BOND", "USD", &measures(101.0), &meta(), "hash-b")
            .unwrap();
        assert_eq!(
            outcome,
            UpsertOutcome::ConflictOverwritten { previous_hash: "hash-a".to_string() }
        );
        let row = store.get("r1", "p1", "BASE").unwrap().unwrap();
        assert_eq!(row.input_hash, "hash-b");
        assert_eq!(row.measures["PV"], 101.0);
        assert_eq!(store.count_for_run("r1").unwrap(), 1);
    }

    #[test]
    fn position_batch_commits_in_one_pass_with_per_row_outcomes() {
        let store = store();
        // pre-existing BASE row; the batch re-sends it plus a shocked row
        store
            .upsert("r1", "p1", "BASE", "desk-a", "FIXED_BOND", "USD", &measures(100.0), &meta(), "h-base")
            .unwrap();

        let rows = vec![
            ResultRow {
                position_id: "p1".to_string(),
                scenario_id: "BASE".to_string(),
                measures: measures(100.0),
                compute_meta: meta(),
                input_hash: "h-base".to_string(),
            },
            ResultRow {
                position_id: "p1".to_string(),
                scenario_id: "RATES_PARALLEL_1BP".to_string(),
                measures: measures(99.9),
                compute_meta: meta(),
                input_hash: "h-shocked".to_string(),
            },
        ];
        let outcomes = store
            .upsert_position_batch("r1", "desk-a", "FIXED_BOND", "USD", &rows)
            .unwrap();
        assert_eq!(outcomes, vec![UpsertOutcome::Unchanged, UpsertOutcome::Inserted]);
        assert_eq!(store.count_for_run("r1").unwrap(), 2);

        let empty = store
            .upsert_position_batch("r1", "desk-a", "FIXED_BOND", "USD", &[])
            .unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn keys_are_disjoint_per_scenario() {
        let store = store();
        store
            .upsert("r1", "p1", "BASE", "desk-a", "FIXED_BOND", "USD", &measures(100.0), &meta(), "h1")
            .unwrap();
        store
            .upsert("r1", "p1", "RATES_PARALLEL_1BP", "desk-a", "FIXED_BOND", "USD", &measures(99.9), &meta(), "h2")
            .unwrap();
        assert_eq!(store.count_for_run("r1").unwrap(), 2);
        assert!(store.get("r1", "p1", "FX_SPOT_1PCT").unwrap().is_none());
    }
}
