//! Fixed-coupon bond pricer.
//!
//! Discounts the coupon schedule off the instrument's zero curve with
//! annual compounding, so a par bond on a flat curve prices to face. An
//! optional spread curve is added on top of the discount rate, which is what
//! makes spread scenarios bite for credit-linked bonds.

use serde::Deserialize;
use serde_json::Value;

use crate::market::{year_fraction, MarketPayload, ZeroCurve};
use crate::models::Position;
use crate::scenario::ScenarioId;

use super::{MeasureMap, Pricer, PricerError};

/// Instrument terms for a `FIXED_BOND` position.
#[derive(Debug, Deserialize)]
struct BondTerms {
    face: f64,
    /// Annual coupon as a fraction of face (0.05 = 5%).
    coupon: f64,
    /// Tenor from the snapshot as-of, e.g. `5Y`.
    maturity: String,
    /// Coupons per year; annual when absent.
    #[serde(default)]
    frequency: Option<u32>,
    #[serde(default)]
    discount_curve: Option<String>,
    #[serde(default)]
    spread_curve: Option<String>,
    /// Fraction of the current coupon period already accrued.
    #[serde(default)]
    accrued_fraction: Option<f64>,
}

pub struct FixedBondPricer;

impl FixedBondPricer {
    fn resolve_curve<'a>(
        market: &'a MarketPayload,
        named: Option<&str>,
    ) -> Result<&'a ZeroCurve, PricerError> {
        match named {
            Some(id) => market
                .curve(id)
                .ok_or_else(|| PricerError::MissingInput(format!("discount curve not in snapshot: {}", id))),
            None => market
                .default_discount_curve()
                .ok_or_else(|| PricerError::MissingInput("snapshot has no curves".to_string())),
        }
    }

    /// Present value with an additive shift on the discounting zero rate.
    /// DV01 falls out of pricing at zero shift and at +1 bp.
    fn present_value(
        terms: &BondTerms,
        discount: &ZeroCurve,
        spread: Option<&ZeroCurve>,
        rate_shift: f64,
    ) -> Result<f64, PricerError> {
        let maturity = year_fraction(&terms.maturity)
            .map_err(|e| PricerError::MissingInput(e.to_string()))?;
        if maturity <= 0.0 {
            return Err(PricerError::Fault(format!("non-positive maturity: {}", terms.maturity)));
        }
        let frequency = terms.frequency.unwrap_or(1);
        if frequency == 0 {
            return Err(PricerError::Fault("coupon frequency must be positive".to_string()));
        }
        let period = 1.0 / f64::from(frequency);
        let coupon_amount = terms.face * terms.coupon * period;

        let mut pv = 0.0;
        let mut t = maturity;
        while t > 1e-9 {
            let mut zero = discount
                .zero_rate(t)
                .map_err(|e| PricerError::MissingInput(e.to_string()))?;
            if let Some(spread_curve) = spread {
                zero += spread_curve
                    .zero_rate(t)
                    .map_err(|e| PricerError::MissingInput(e.to_string()))?;
            }
            let df = (1.0 + zero + rate_shift).powf(-t);
            pv += coupon_amount * df;
            if (t - maturity).abs() < 1e-9 {
                pv += terms.face * df;
            }
            t -= period;
        }
        if !pv.is_finite() {
            return Err(PricerError::Fault("non-finite present value".to_string()));
        }
        Ok(pv)
    }
}

impl Pricer for FixedBondPricer {
    fn product_type(&self) -> &'static str {
        "FIXED_BOND"
    }

    fn name(&self) -> &'static str {
        "fixed_bond_discounting"
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
        let terms: BondTerms = serde_json::from_value(instrument.clone())
            .map_err(|e| PricerError::MissingInput(format!("bond terms: {}", e)))?;
        if !(terms.face.is_finite() && terms.coupon.is_finite()) {
            return Err(PricerError::Fault("non-finite bond terms".to_string()));
        }

        let discount = Self::resolve_curve(market, terms.discount_curve.as_deref())?;
        let spread = match terms.spread_curve.as_deref() {
            Some(id) => Some(market.curve(id).ok_or_else(|| {
                PricerError::MissingInput(format!("spread curve not in snapshot: {}", id))
            })?),
            None => None,
        };

        let mut out = MeasureMap::new();
        for tag in measures {
            match tag.as_str() {
                "PV" => {
                    let pv = Self::present_value(&terms, discount, spread, 0.0)?;
                    out.insert(tag.clone(), pv);
                }
                "DV01" => {
                    let base = Self::present_value(&terms, discount, spread, 0.0)?;
                    let bumped = Self::present_value(&terms, discount, spread, 0.0001)?;
                    out.insert(tag.clone(), base - bumped);
                }
                "ACCRUED_INTEREST" => {
                    let frequency = f64::from(terms.frequency.unwrap_or(1));
                    let fraction = terms.accrued_fraction.unwrap_or(0.0);
                    if !(0.0..=1.0).contains(&fraction) {
                        return Err(PricerError::Fault(format!(
                            "accrued_fraction out of range: {}",
                            fraction
                        )));
                    }
                    out.insert(tag.clone(), terms.face * terms.coupon / frequency * fraction);
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
    use crate::market::{CurveNode, FxSpot};
    use serde_json::json;

    fn flat_market(rate: f64) -> MarketPayload {
        MarketPayload {
            curves: vec![ZeroCurve {
                id: "USD-OIS".to_string(),
                nodes: vec![
                    CurveNode { tenor: "1Y".to_string(), rate },
                    CurveNode { tenor: "5Y".to_string(), rate },
                ],
            }],
            fx_spots: vec![FxSpot { pair: "EURUSD".to_string(), rate: 1.1 }],
        }
    }

    fn position() -> Position {
        Position {
            position_id: "p1".to_string(),
            product_type: "FIXED_BOND".to_string(),
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
    fn par_bond_on_flat_curve_prices_to_face() {
        let instrument = json!({"face": 100.0, "coupon": 0.05, "maturity": "5Y"});
        let out = FixedBondPricer
            .price(&position(), &instrument, &flat_market(0.05), &measures(&["PV"]), ScenarioId::Base)
            .unwrap();
        assert!((out["PV"] - 100.0).abs() < 1e-4);
    }

    #[test]
    fn dv01_is_positive_for_a_long_bond() {
        let instrument = json!({"face": 100.0, "coupon": 0.05, "maturity": "5Y"});
        let out = FixedBondPricer
            .price(
                &position(),
                &instrument,
                &flat_market(0.05),
                &measures(&["PV", "DV01"]),
                ScenarioId::Base,
            )
            .unwrap();
        assert!(out["DV01"] > 0.0);
        // roughly 4.3 years of modified duration on a 5Y par bond
        assert!(out["DV01"] > 0.03 && out["DV01"] < 0.06);
    }

    #[test]
    fn determinism_byte_equal_inputs_byte_equal_outputs() {
        let instrument = json!({"face": 100.0, "coupon": 0.05, "maturity": "5Y"});
        let a = FixedBondPricer
            .price(
                &position(),
                &instrument,
                &flat_market(0.05),
                &measures(&["PV", "DV01", "ACCRUED_INTEREST"]),
                ScenarioId::Base,
            )
            .unwrap();
        let b = FixedBondPricer
            .price(
                &position(),
                &instrument,
                &flat_market(0.05),
                &measures(&["PV", "DV01", "ACCRUED_INTEREST"]),
                ScenarioId::Base,
            )
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn missing_terms_are_missing_input() {
        let err = FixedBondPricer
            .price(
                &position(),
                &json!({"face": 100.0}),
                &flat_market(0.05),
                &measures(&["PV"]),
                ScenarioId::Base,
            )
            .unwrap_err();
        assert!(matches!(err, PricerError::MissingInput(_)));
    }

    #[test]
    fn named_curve_must_exist() {
        let instrument =
            json!({"face": 100.0, "coupon": 0.05, "maturity": "5Y", "discount_curve": "EUR-OIS"});
        let err = FixedBondPricer
            .price(&position(), &instrument, &flat_market(0.05), &measures(&["PV"]), ScenarioId::Base)
            .unwrap_err();
        assert!(matches!(err, PricerError::MissingInput(_)));
    }

    #[test]
    fn spread_curve_lowers_pv() {
        let mut market = flat_market(0.05);
        market.curves.push(ZeroCurve {
            id: "USD-CORP-SPREAD".to_string(),
            nodes: vec![CurveNode { tenor: "5Y".to_string(), rate: 0.01 }],
        });
        let plain = json!({"face": 100.0, "coupon": 0.05, "maturity": "5Y"});
        let spready = json!({
            "face": 100.0, "coupon": 0.05, "maturity": "5Y",
            "spread_curve": "USD-CORP-SPREAD"
        });
        let pv_plain = FixedBondPricer
            .price(&position(), &plain, &market, &measures(&["PV"]), ScenarioId::Base)
            .unwrap()["PV"];
        let pv_spread = FixedBondPricer
            .price(&position(), &spready, &market, &measures(&["PV"]), ScenarioId::Base)
            .unwrap()["PV"];
        assert!(pv_spread < pv_plain);
    }

    #[test]
    fn semiannual_coupons_discount_each_period() {
        let instrument = json!({"face": 100.0, "coupon": 0.05, "maturity": "2Y", "frequency": 2});
        let out = FixedBondPricer
            .price(&position(), &instrument, &flat_market(0.05), &measures(&["PV"]), ScenarioId::Base)
            .unwrap();
        // 4 coupons of 2.5 + face at 2Y, all discounted at 5% annual comp
        let df = |t: f64| 1.05f64.powf(-t);
        let expected = 2.5 * (df(0.5) + df(1.0) + df(1.5) + df(2.0)) + 100.0 * df(2.0);
        assert!((out["PV"] - expected).abs() < 1e-9);
    }

    #[test]
    fn unknown_measures_are_skipped() {
        let instrument = json!({"face": 100.0, "coupon": 0.05, "maturity": "5Y"});
        let out = FixedBondPricer
            .price(
                &position(),
                &instrument,
                &flat_market(0.05),
                &measures(&["PV", "FX_DELTA"]),
                ScenarioId::Base,
            )
            .unwrap();
        assert!(out.contains_key("PV"));
        assert!(!out.contains_key("FX_DELTA"));
    }
}
