//! Market payload types and curve math.
//!
//! A market snapshot payload is an ordered set of zero curves plus a set of
//! FX spots. Rates are fractional (1 bp = 0.0001); tenors are compact strings
//! like `3M`, `1Y`, `10Y`. Discounting is annual-compounding with linear
//! interpolation of zero rates between nodes and flat extrapolation beyond
//! the ends, so a par bond on a flat curve prices back to face exactly.

use serde::{Deserialize, Serialize};

#[derive(Debug)]
pub enum CurveError {
    BadTenor(String),
    EmptyCurve(String),
}

impl std::fmt::Display for CurveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadTenor(t) => write!(f, "unparseable tenor: {}", t),
            Self::EmptyCurve(id) => write!(f, "curve has no nodes: {}", id),
        }
    }
}

impl std::error::Error for CurveError {}

/// Parse a tenor string (`7D`, `2W`, `6M`, `5Y`) into a year fraction.
pub fn year_fraction(tenor: &str) -> Result<f64, CurveError> {
    let trimmed = tenor.trim();
    let unit = match trimmed.chars().last() {
        Some(c) => c,
        None => return Err(CurveError::BadTenor(tenor.to_string())),
    };
    let digits = &trimmed[..trimmed.len() - unit.len_utf8()];
    if digits.is_empty() {
        return Err(CurveError::BadTenor(tenor.to_string()));
    }
    let count: f64 = digits
        .parse()
        .map_err(|_| CurveError::BadTenor(tenor.to_string()))?;
    if count < 0.0 {
        return Err(CurveError::BadTenor(tenor.to_string()));
    }
    match unit {
        'D' | 'd' => Ok(count / 365.0),
        'W' | 'w' => Ok(count * 7.0 / 365.0),
        'M' | 'm' => Ok(count / 12.0),
        'Y' | 'y' => Ok(count),
        _ => Err(CurveError::BadTenor(tenor.to_string())),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurveNode {
    pub tenor: String,
    pub rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZeroCurve {
    pub id: String,
    pub nodes: Vec<CurveNode>,
}

impl ZeroCurve {
    /// Spread curves are identified by a `SPREAD` token in the id; the wire
    /// format carries no separate curve-type field.
    pub fn is_spread_curve(&self) -> bool {
        self.id.to_ascii_uppercase().contains("SPREAD")
    }

    /// Zero rate at year fraction `t`: linear interpolation between nodes,
    /// flat beyond the first and last.
    pub fn zero_rate(&self, t: f64) -> Result<f64, CurveError> {
        if self.nodes.is_empty() {
            return Err(CurveError::EmptyCurve(self.id.clone()));
        }
        let mut points: Vec<(f64, f64)> = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            points.push((year_fraction(&node.tenor)?, node.rate));
        }
        points.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

        if t <= points[0].0 {
            return Ok(points[0].1);
        }
        if t >= points[points.len() - 1].0 {
            return Ok(points[points.len() - 1].1);
        }
        for pair in points.windows(2) {
            let (t0, r0) = pair[0];
            let (t1, r1) = pair[1];
            if t >= t0 && t <= t1 {
                if (t1 - t0).abs() < f64::EPSILON {
                    return Ok(r0);
                }
                let w = (t - t0) / (t1 - t0);
                return Ok(r0 + w * (r1 - r0));
            }
        }
        Ok(points[points.len() - 1].1)
    }

    /// Annual-compounding discount factor at year fraction `t`.
    pub fn discount_factor(&self, t: f64) -> Result<f64, CurveError> {
        let rate = self.zero_rate(t)?;
        Ok((1.0 + rate).powf(-t))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FxSpot {
    pub pair: String,
    pub rate: f64,
}

/// The structured bundle inside a market snapshot. Immutable after ingest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketPayload {
    pub curves: Vec<ZeroCurve>,
    #[serde(default)]
    pub fx_spots: Vec<FxSpot>,
}

impl MarketPayload {
    pub fn curve(&self, id: &str) -> Option<&ZeroCurve> {
        self.curves.iter().find(|c| c.id == id)
    }

    /// First non-spread curve, the default discounting curve when an
    /// instrument does not name one.
    pub fn default_discount_curve(&self) -> Option<&ZeroCurve> {
        self.curves
            .iter()
            .find(|c| !c.is_spread_curve())
            .or_else(|| self.curves.first())
    }

    pub fn spot(&self, pair: &str) -> Option<f64> {
        self.fx_spots.iter().find(|s| s.pair == pair).map(|s| s.rate)
    }
}
