//! Core entities of the valuation platform.
//!
//! Snapshots are immutable after ingest; runs and tasks are state machines
//! owned by the orchestrator and the queue; results are effectively
//! immutable per `(run, position, scenario)` key.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::market::MarketPayload;

/// Canonical timestamp rendering for the store: RFC 3339, UTC, fixed
/// microsecond width so TEXT comparison orders correctly.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Data-quality verdict stamped on a market snapshot at ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DqStatus {
    Pass,
    Warn,
    Fail,
}

impl DqStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Warn => "WARN",
            Self::Fail => "FAIL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PASS" => Some(Self::Pass),
            "WARN" => Some(Self::Warn),
            "FAIL" => Some(Self::Fail),
            _ => None,
        }
    }

    /// Only PASS/WARN snapshots are admissible for runs.
    pub fn admissible(&self) -> bool {
        !matches!(self, Self::Fail)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunType {
    EodOfficial,
    Intraday,
    Sandbox,
}

impl RunType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EodOfficial => "EOD_OFFICIAL",
            Self::Intraday => "INTRADAY",
            Self::Sandbox => "SANDBOX",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "EOD_OFFICIAL" => Some(Self::EodOfficial),
            "INTRADAY" => Some(Self::Intraday),
            "SANDBOX" => Some(Self::Sandbox),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Queued,
    Running,
    Cancelling,
    Cancelled,
    Failed,
    Completed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Cancelling => "CANCELLING",
            Self::Cancelled => "CANCELLED",
            Self::Failed => "FAILED",
            Self::Completed => "COMPLETED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "QUEUED" => Some(Self::Queued),
            "RUNNING" => Some(Self::Running),
            "CANCELLING" => Some(Self::Cancelling),
            "CANCELLED" => Some(Self::Cancelled),
            "FAILED" => Some(Self::Failed),
            "COMPLETED" => Some(Self::Completed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Failed | Self::Completed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Dead,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Dead => "DEAD",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "QUEUED" => Some(Self::Queued),
            "RUNNING" => Some(Self::Running),
            "SUCCEEDED" => Some(Self::Succeeded),
            "FAILED" => Some(Self::Failed),
            "DEAD" => Some(Self::Dead),
            _ => None,
        }
    }
}

/// Immutable market data snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub snapshot_id: String,
    pub as_of_time: DateTime<Utc>,
    pub vendor: String,
    pub universe_id: String,
    pub payload: MarketPayload,
    pub dq_status: DqStatus,
    pub payload_hash: String,
}

/// One position inside a position snapshot. The instrument is either
/// embedded as a structured bag or referenced by id for external lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub position_id: String,
    pub product_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instrument: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instrument_id: Option<String>,
    #[serde(default)]
    pub attributes: Value,
    pub base_currency: String,
}

/// Immutable position snapshot, deduplicated by `(portfolio_node_id, payload_hash)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub position_snapshot_id: String,
    pub as_of_time: DateTime<Utc>,
    pub portfolio_node_id: String,
    pub positions: Vec<Position>,
    pub payload_hash: String,
}

/// A batch valuation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub run_type: RunType,
    pub status: RunStatus,
    pub as_of_time: DateTime<Utc>,
    pub market_snapshot_id: String,
    pub measures: Vec<String>,
    pub scenarios: Vec<String>,
    pub portfolio_scope: Vec<String>,
    pub hash_mod: u32,
    pub requested_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A unit of work: one `(portfolio node, product type, hash bucket)` cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunTask {
    pub task_id: String,
    pub run_id: String,
    pub portfolio_node_id: String,
    pub product_type: String,
    pub position_snapshot_id: String,
    pub hash_mod: u32,
    pub hash_bucket: u32,
    pub status: TaskStatus,
    pub attempt: u32,
    pub max_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_owner: Option<String>,
    #[serde(rename = "leased_until", skip_serializing_if = "Option::is_none")]
    pub leased_until_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(rename = "created_at")]
    pub created_at_ms: i64,
    #[serde(rename = "updated_at")]
    pub updated_at_ms: i64,
}

/// Provenance attached to each valuation result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeMeta {
    pub pricer: String,
    pub pricer_version: String,
    pub worker_id: String,
    pub elapsed_micros: u64,
}

/// Per-(run, position, scenario) measure record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValuationResult {
    pub run_id: String,
    pub position_id: String,
    pub scenario_id: String,
    pub portfolio_node_id: String,
    pub product_type: String,
    pub base_currency: String,
    pub measures: BTreeMap<String, f64>,
    pub compute_meta: ComputeMeta,
    pub input_hash: String,
}

/// Failure taxonomy for task execution. Every failure a worker reports is
/// classified into exactly one kind; the kind decides retriability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    UnknownProduct,
    MissingInput,
    PricerFault,
    LeaseLost,
    TransientIo,
    Cancelled,
    Fatal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnknownProduct => "UnknownProduct",
            Self::MissingInput => "MissingInput",
            Self::PricerFault => "PricerFault",
            Self::LeaseLost => "LeaseLost",
            Self::TransientIo => "TransientIO",
            Self::Cancelled => "Cancelled",
            Self::Fatal => "Fatal",
        }
    }

    /// Only transient I/O failures are worth another attempt; everything
    /// else is deterministic and would fail identically on retry.
    pub fn retriable(&self) -> bool {
        matches!(self, Self::TransientIo)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified task-level failure.
#[derive(Debug, Clone)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl TaskFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Syntactic check for measure tags (`PV`, `DV01`, `FX_DELTA`, ...).
pub fn valid_measure_tag(tag: &str) -> bool {
    let mut chars = tag.chars();
    match chars.next() {
        Some(c) if c.is_ascii_uppercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}
