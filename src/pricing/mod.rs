//! Pricer contract and registry.
//!
//! A pricer is a pure function from `(position, instrument, shocked market,
//! requested measures, scenario id)` to a measure map. Determinism is a hard
//! contract: byte-equal inputs must produce byte-equal outputs, because the
//! result writer treats an equal input hash as proof that a row needs no
//! rewrite.
//!
//! The registry is populated by an explicit `bootstrap()` call at process
//! start, before any task is claimed. Absence of a pricer at claim time is a
//! hard failure, never a silent mis-dispatch.

pub mod fixed_bond;
pub mod fx_forward;

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::market::MarketPayload;
use crate::models::Position;
use crate::scenario::ScenarioId;

pub use fixed_bond::FixedBondPricer;
pub use fx_forward::FxForwardPricer;

/// Measure-tag-to-value output of a single pricer call.
pub type MeasureMap = BTreeMap<String, f64>;

#[derive(Debug)]
pub enum PricerError {
    /// Required instrument attribute absent or unparseable.
    MissingInput(String),
    /// Deterministic numerical failure (overflow, non-finite result).
    Fault(String),
}

impl std::fmt::Display for PricerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingInput(m) => write!(f, "missing input: {}", m),
            Self::Fault(m) => write!(f, "pricer fault: {}", m),
        }
    }
}

impl std::error::Error for PricerError {}

/// The shared pricer contract.
///
/// Implementations must not mutate their inputs and must not read ambient
/// state (clocks, RNGs, environment); `version()` participates in the result
/// input hash so any behavioral change must bump it.
pub trait Pricer: Send + Sync {
    /// Registry key, e.g. `FIXED_BOND`.
    fn product_type(&self) -> &'static str;

    /// Stable pricer identity.
    fn name(&self) -> &'static str;

    /// Semantic version of the pricing behavior.
    fn version(&self) -> &'static str;

    /// Price one position under one scenario-shocked market.
    ///
    /// Returns values for the requested measures this pricer produces;
    /// requested tags it does not know are simply absent from the map.
    fn price(
        &self,
        position: &Position,
        instrument: &Value,
        market: &MarketPayload,
        measures: &[String],
        scenario: ScenarioId,
    ) -> Result<MeasureMap, PricerError>;
}

#[derive(Debug)]
pub enum RegistryError {
    /// A different pricer is already registered for the product type.
    Conflict(String),
    UnknownProduct(String),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Conflict(p) => write!(f, "conflicting pricer registration for product type: {}", p),
            Self::UnknownProduct(p) => write!(f, "no pricer registered for product type: {}", p),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Product-type to pricer mapping. Populated once at startup, read-only
/// thereafter.
pub struct PricerRegistry {
    pricers: BTreeMap<String, Arc<dyn Pricer>>,
}

impl PricerRegistry {
    pub fn new() -> Self {
        Self { pricers: BTreeMap::new() }
    }

    /// Register a pricer. Idempotent for the same `(product_type, name,
    /// version)` identity; a different identity under an existing product
    /// type is a conflict.
    pub fn register(&mut self, pricer: Arc<dyn Pricer>) -> Result<(), RegistryError> {
        let key = pricer.product_type().to_string();
        if let Some(existing) = self.pricers.get(&key) {
            if existing.name() == pricer.name() && existing.version() == pricer.version() {
                return Ok(());
            }
            return Err(RegistryError::Conflict(key));
        }
        self.pricers.insert(key, pricer);
        Ok(())
    }

    pub fn get(&self, product_type: &str) -> Result<Arc<dyn Pricer>, RegistryError> {
        self.pricers
            .get(product_type)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownProduct(product_type.to_string()))
    }

    /// Sorted registered product types.
    pub fn list(&self) -> Vec<String> {
        self.pricers.keys().cloned().collect()
    }

    /// Explicit boot sequence: every built-in pricer is registered here,
    /// before the worker loop claims anything.
    pub fn bootstrap() -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        registry.register(Arc::new(FixedBondPricer))?;
        registry.register(Arc::new(FxForwardPricer))?;
        Ok(registry)
    }
}

impl Default for PricerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
