//! Typed per-channel metadata.
//!
//! Operations communicate through these fields: an absent field means the
//! upstream step that produces it has not run, never "zero".

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelMetadata {
    /// Instrument range (maximum measurable value) of the channel.
    pub range: Option<f64>,
    /// Autofluorescence of blank cells, set by the autofluorescence correction.
    pub baseline: Option<Baseline>,
    /// Piecewise-linear bleedthrough correction for this channel.
    pub bleedthrough: Option<BleedthroughModel>,
    /// Mapping onto another channel's scale, set by the color translation.
    pub translation: Option<ChannelTranslation>,
}

impl ChannelMetadata {
    pub fn with_range(range: f64) -> Self {
        Self {
            range: Some(range),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub median: f64,
    pub stdev: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelTranslation {
    pub target: String,
    pub slope: f64,
    pub intercept: f64,
}

impl ChannelTranslation {
    /// `y = 10^intercept * x^slope`, the linear-space form of the log-log fit.
    pub fn map(&self, value: f64) -> f64 {
        10f64.powf(self.intercept) * value.powf(self.slope)
    }
}

/// Linear interpolation through sorted knots, clamped to the end values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PiecewiseLinear {
    pub knots: Vec<(f64, f64)>,
}

impl PiecewiseLinear {
    pub fn new(mut knots: Vec<(f64, f64)>) -> Self {
        knots.sort_by(|a, b| a.0.total_cmp(&b.0));
        Self { knots }
    }

    pub fn eval(&self, x: f64) -> f64 {
        let Some(first) = self.knots.first() else {
            return 0.0;
        };
        if x <= first.0 {
            return first.1;
        }
        for pair in self.knots.windows(2) {
            let (x0, y0) = pair[0];
            let (x1, y1) = pair[1];
            if x <= x1 {
                if x1 == x0 {
                    return y1;
                }
                return y0 + (y1 - y0) * (x - x0) / (x1 - x0);
            }
        }
        self.knots.last().map(|k| k.1).unwrap_or(0.0)
    }
}

/// Bleedthrough into one channel from a set of contributing channels.
///
/// The corrected value is the raw value of the channel minus the sum of
/// each contributor's spline evaluated at the contributor's raw value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BleedthroughModel {
    pub contributions: Vec<(String, PiecewiseLinear)>,
}

impl BleedthroughModel {
    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.contributions.iter().map(|(channel, _)| channel.as_str())
    }

    /// `contributors` is aligned with `contributions`.
    pub fn correct(&self, value: f64, contributors: &[f64]) -> f64 {
        self.contributions
            .iter()
            .zip(contributors)
            .fold(value, |acc, ((_, spline), &x)| acc - spline.eval(x))
    }
}
