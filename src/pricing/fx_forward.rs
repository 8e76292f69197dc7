//! FX forward pricer.
//!
//! Values the payoff `notional * (spot - strike)` discounted to present at
//! the instrument's discount curve. FX_DELTA is the first-order sensitivity
//! to the spot, which for this payoff is just the discounted notional.

use serde::Deserialize;
use serde_json::Value;

use crate::market::{year_fraction, MarketPayload};
use crate::models::Position;
use crate::scenario::ScenarioId;

use super::{MeasureMap, Pricer, PricerError};

#[derive(Debug, Deserialize)]
struct FxForwardTerms {
    /// Currency pair in snapshot convention, e.g. `EURUSD`.
    pair: String,
    notional: f64,
    strike: f64,
    maturity: String,
    #[serde(default)]
    discount_curve: Option<String>,
}

pub struct FxForwardPricer;

impl Pricer for FxForwardPricer {
    fn product_type(&self) -> &'static str {
        "FX_FWD"
    }

    fn name(&self) -> &'static str {
        "fx_forward_spot_discounting"
    }

    fn version(&self) -> &'static str {
        "1.0.0"
    }

    fn price(
        &self,
        _position: &Position,
        instrument: &Value,
        market: &MarketPayload,
        measures: &[String],
        _scenario: ScenarioId,
    ) -> Result<MeasureMap, PricerError> {
        let terms: FxForwardTerms = serde_json::from_value(instrument.clone())
            .map_err(|e| PricerError::MissingInput(format!("fx forward terms: {}", e)))?;
        if !(terms.notional.is_finite() && terms.strike.is_finite()) {
            return Err(PricerError::Fault("non-finite fx forward terms".to_string()));
        }

        let spot = market
            .spot(&terms.pair)
            .ok_or_else(|| PricerError::MissingInput(format!("fx spot not in snapshot: {}", terms.pair)))?;
        let maturity = year_fraction(&terms.maturity)
            .map_err(|e| PricerError::MissingInput(e.to_string()))?;

        let df = match terms.discount_curve.as_deref() {
            Some(id) => market
                .curve(id)
                .ok_or_else(|| {
                    PricerError::MissingInput(format!("discount curve not in snapshot: {}", id))
                })?
                .discount_factor(maturity)
                .map_err(|e| PricerError::MissingInput(e.to_string()))?,
            None => match market.default_discount_curve() {
                Some(curve) => curve
                    .discount_factor(maturity)
                    .map_err(|e| PricerError::MissingInput(e.to_string()))?,
                None => 1.0,
            },
        };

        let mut out = MeasureMap::new();
        for tag in measures {
            match tag.as_str() {
                "PV" => {
                    let pv = terms.notional * (spot - terms.strike) * df;
                    if !pv.is_finite() {
                        return Err(PricerError::Fault("non-finite present value".to_string()));
                    }
                    out.insert(tag.clone(), pv);
                }
                "FX_DELTA" => {
                    out.insert(tag.clone(), terms.notional * df);
                }
                _ => {}
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::{CurveNode, FxSpot, ZeroCurve};
    use serde_json::json;

    fn market() -> MarketPayload {
        MarketPayload {
            curves: vec![ZeroCurve {
                id: "USD-OIS".to_string(),
                nodes: vec![CurveNode { tenor: "1Y".to_string(), rate: 0.05 }],
            }],
            fx_spots: vec![FxSpot { pair: "EURUSD".to_string(), rate: 1.10 }],
        }
    }

    fn position() -> Position {
        Position {
            position_id: "fx1".to_string(),
            product_type: "FX_FWD".to_string(),
            instrument: None,
            instrument_id: None,
            attributes: json!({}),
            base_currency: "USD".to_string(),
        }
    }

    fn measures(tags: &[&str]) -> Vec<String> {
        tags.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn pv_is_discounted_spot_minus_strike() {
        let instrument =
            json!({"pair": "EURUSD", "notional": 1_000_000.0, "strike": 1.05, "maturity": "1Y"});
        let out = FxForwardPricer
            .price(&position(), &instrument, &market(), &measures(&["PV", "FX_DELTA"]), ScenarioId::Base)
            .unwrap();
        let df = 1.05f64.powf(-1.0);
        assert!((out["PV"] - 1_000_000.0 * (1.10 - 1.05) * df).abs() < 1e-6);
        assert!((out["FX_DELTA"] - 1_000_000.0 * df).abs() < 1e-6);
    }

    #[test]
    fn missing_spot_is_missing_input() {
        let instrument =
            json!({"pair": "GBPUSD", "notional": 1_000_000.0, "strike": 1.2, "maturity": "1Y"});
        let err = FxForwardPricer
            .price(&position(), &instrument, &market(), &measures(&["PV"]), ScenarioId::Base)
            .unwrap_err();
        assert!(matches!(err, PricerError::MissingInput(_)));
    }

    #[test]
    fn shocked_spot_moves_pv() {
        let instrument =
            json!({"pair": "EURUSD", "notional": 1_000_000.0, "strike": 1.05, "maturity": "1Y"});
        let base = FxForwardPricer
            .price(&position(), &instrument, &market(), &measures(&["PV"]), ScenarioId::Base)
            .unwrap()["PV"];
        let shocked_market = crate::scenario::apply(&market(), crate::scenario::ScenarioId::FxSpot1pct);
        let shocked = FxForwardPricer
            .price(&position(), &instrument, &shocked_market, &measures(&["PV"]), ScenarioId::FxSpot1pct)
            .unwrap()["PV"];
        assert!(shocked > base);
    }
}
