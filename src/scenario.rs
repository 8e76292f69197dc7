//! Scenario engine.
//!
//! A scenario is a named, pure transformation from a base market payload to
//! a shocked one. The base is taken by shared reference and never written;
//! `apply` builds a fresh payload, cloning untouched curves and rebuilding
//! only the shocked series. No locks are taken, so concurrent application
//! against the same base is safe.

use crate::market::{FxSpot, MarketPayload, ZeroCurve};

/// The registered scenario set. Runs may only reference these ids.
/// `as_str`/`parse` are the wire contract; runs persist the string tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// Identity: structurally equal copy of the base.
    Base,
    /// +1 bp on every zero-curve node.
    RatesParallel1bp,
    /// +25 bp on every node of spread-tagged curves.
    Spread25bp,
    /// All FX spots scaled by 1.01.
    FxSpot1pct,
}

pub const ALL_SCENARIOS: [ScenarioId; 4] = [
    ScenarioId::Base,
    ScenarioId::RatesParallel1bp,
    ScenarioId::Spread25bp,
    ScenarioId::FxSpot1pct,
];

impl ScenarioId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Base => "BASE",
            Self::RatesParallel1bp => "RATES_PARALLEL_1BP",
            Self::Spread25bp => "SPREAD_25BP",
            Self::FxSpot1pct => "FX_SPOT_1PCT",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ScenarioError> {
        match s {
            "BASE" => Ok(Self::Base),
            "RATES_PARALLEL_1BP" => Ok(Self::RatesParallel1bp),
            "SPREAD_25BP" => Ok(Self::Spread25bp),
            "FX_SPOT_1PCT" => Ok(Self::FxSpot1pct),
            _ => Err(ScenarioError::InvalidScenario(s.to_string())),
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub enum ScenarioError {
    InvalidScenario(String),
}

impl std::fmt::Display for ScenarioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidScenario(id) => write!(f, "unknown scenario id: {}", id),
        }
    }
}

impl std::error::Error for ScenarioError {}

/// Apply `scenario` to `base`, returning a fresh shocked payload.
pub fn apply(base: &MarketPayload, scenario: ScenarioId) -> MarketPayload {
    match scenario {
        ScenarioId::Base => base.clone(),
        ScenarioId::RatesParallel1bp => MarketPayload {
            curves: base.curves.iter().map(|c| shift_curve(c, 0.0001)).collect(),
            fx_spots: base.fx_spots.clone(),
        },
        ScenarioId::Spread25bp => MarketPayload {
            curves: base
                .curves
                .iter()
                .map(|c| {
                    if c.is_spread_curve() {
                        shift_curve(c, 0.0025)
                    } else {
                        c.clone()
                    }
                })
                .collect(),
            fx_spots: base.fx_spots.clone(),
        },
        ScenarioId::FxSpot1pct => MarketPayload {
            curves: base.curves.clone(),
            fx_spots: base
                .fx_spots
                .iter()
                .map(|s| FxSpot { pair: s.pair.clone(), rate: s.rate * 1.01 })
                .collect(),
        },
    }
}

fn shift_curve(curve: &ZeroCurve, shift: f64) -> ZeroCurve {
    ZeroCurve {
        id: curve.id.clone(),
        nodes: curve
            .nodes
            .iter()
            .map(|n| crate::market::CurveNode { tenor: n.tenor.clone(), rate: n.rate + shift })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing;
    use crate::market::CurveNode;

    fn sample() -> MarketPayload {
        MarketPayload {
            curves: vec![
                ZeroCurve {
                    id: "USD-OIS".to_string(),
                    nodes: vec![
                        CurveNode { tenor: "1Y".to_string(), rate: 0.05 },
                        CurveNode { tenor: "5Y".to_string(), rate: 0.05 },
                    ],
                },
                ZeroCurve {
                    id: "USD-CORP-SPREAD".to_string(),
                    nodes: vec![CurveNode { tenor: "5Y".to_string(), rate: 0.01 }],
                },
            ],
            fx_spots: vec![FxSpot { pair: "EURUSD".to_string(), rate: 1.10 }],
        }
    }

    #[test]
    fn base_is_structurally_equal_copy() {
        let base = sample();
        let shocked = apply(&base, ScenarioId::Base);
        assert_eq!(shocked, base);
    }

    #[test]
    fn apply_never_mutates_the_base() {
        let base = sample();
        let hash_before = hashing::hash_of(&base).unwrap();
        for scenario in ALL_SCENARIOS {
            let _ = apply(&base, scenario);
        }
        let hash_after = hashing::hash_of(&base).unwrap();
        assert_eq!(hash_before, hash_after);
        assert_eq!(base, sample());
    }

    #[test]
    fn rates_parallel_shifts_every_node() {
        let shocked = apply(&sample(), ScenarioId::RatesParallel1bp);
        assert!((shocked.curves[0].nodes[0].rate - 0.0501).abs() < 1e-12);
        assert!((shocked.curves[0].nodes[1].rate - 0.0501).abs() < 1e-12);
        assert!((shocked.curves[1].nodes[0].rate - 0.0101).abs() < 1e-12);
        // FX untouched
        assert!((shocked.fx_spots[0].rate - 1.10).abs() < 1e-12);
    }

    #[test]
    fn spread_shock_only_hits_spread_curves() {
        let shocked = apply(&sample(), ScenarioId::Spread25bp);
        assert!((shocked.curves[0].nodes[0].rate - 0.05).abs() < 1e-12);
        assert!((shocked.curves[1].nodes[0].rate - 0.0125).abs() < 1e-12);
    }

    #[test]
    fn fx_shock_scales_spots_only() {
        let shocked = apply(&sample(), ScenarioId::FxSpot1pct);
        assert!((shocked.fx_spots[0].rate - 1.111).abs() < 1e-12);
        assert_eq!(shocked.curves, sample().curves);
    }

    #[test]
    fn unknown_id_is_rejected() {
        assert!(matches!(
            ScenarioId::parse("RATES_PARALLEL_100BP"),
            Err(ScenarioError::InvalidScenario(_))
        ));
        assert_eq!(ScenarioId::parse("BASE").unwrap(), ScenarioId::Base);
    }
}
