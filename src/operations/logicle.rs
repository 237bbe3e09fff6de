//! Logicle display transform with the width parameter learned from data.

use super::OpContext;
use crate::{
    error::OpError,
    experiment::Experiment,
    logicle::{Logicle, LogicleParams},
    stats,
    subset::Subset,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicleOp {
    pub name: String,
    pub channels: Vec<String>,
    /// Quantile of the negative events used to size the linear region.
    #[serde(default = "default_r")]
    pub r: f64,
    /// Learned scale parameters per channel.
    #[serde(default)]
    pub params: BTreeMap<String, LogicleParams>,
}

fn default_r() -> f64 {
    0.05
}

impl Default for LogicleOp {
    fn default() -> Self {
        Self {
            name: String::new(),
            channels: vec![],
            r: default_r(),
            params: BTreeMap::new(),
        }
    }
}

impl LogicleOp {
    fn check_channels(&self, experiment: &Experiment) -> Result<(), OpError> {
        if self.channels.is_empty() {
            return Err(OpError::invalid("No channels specified"));
        }
        for channel in &self.channels {
            if !experiment.has_channel(channel) {
                return Err(OpError::not_found(format!(
                    "Channel '{channel}' isn't in the experiment"
                )));
            }
        }
        Ok(())
    }

    pub fn estimate(
        &mut self,
        experiment: &Experiment,
        subset: Option<&Subset>,
        ctx: &mut OpContext,
    ) -> Result<(), OpError> {
        if !(self.r > 0.0 && self.r < 1.0) {
            return Err(OpError::invalid(format!(
                "r must be between 0 and 1, got {}",
                self.r
            )));
        }
        self.check_channels(experiment)?;
        let selected;
        let data = match subset {
            Some(subset) => {
                selected = subset.select(experiment)?;
                &selected
            }
            None => experiment,
        };

        let m = ctx.params.logicle_decades;
        let mut learned = BTreeMap::new();
        for channel in &self.channels {
            let t = experiment
                .metadata(channel)
                .and_then(|meta| meta.range)
                .ok_or_else(|| {
                    OpError::not_found(format!(
                        "Channel '{channel}' has no range; import it with a range first"
                    ))
                })?;
            if !(t > 0.0) {
                return Err(OpError::invalid(format!(
                    "Channel '{channel}' has a non-positive range {t}"
                )));
            }

            let negative: Vec<f64> = data
                .channel_values(channel)?
                .iter()
                .copied()
                .filter(|v| *v < 0.0)
                .collect();
            let mut w = match stats::quantile(&negative, self.r) {
                Some(q) => (m - (t / q.abs()).log10()) / 2.0,
                None => 0.0,
            };
            if w < 0.0 {
                ctx.warn(format!(
                    "Channel '{channel}': logicle width {w:.3} is negative; using 0"
                ));
                w = 0.0;
            }
            if 2.0 * w > m {
                ctx.warn(format!(
                    "Channel '{channel}': logicle width {w:.3} is too large; using {}",
                    m / 2.0
                ));
                w = m / 2.0;
            }
            learned.insert(channel.clone(), LogicleParams { t, w, m, a: 0.0 });
        }
        self.params = learned;
        Ok(())
    }

    pub fn is_valid(&self, experiment: &Experiment) -> bool {
        self.check_channels(experiment).is_ok() && self.check_estimates().is_ok()
    }

    fn check_estimates(&self) -> Result<(), OpError> {
        if self.params.is_empty() {
            return Err(OpError::not_estimated(
                "Logicle parameters aren't set. Did you forget to run estimate()?",
            ));
        }
        let configured: BTreeSet<&String> = self.channels.iter().collect();
        let estimated: BTreeSet<&String> = self.params.keys().collect();
        if configured != estimated {
            return Err(OpError::not_estimated(
                "Estimated channels differ from the channels parameter. Did you forget to (re)run estimate()?",
            ));
        }
        Ok(())
    }

    pub fn apply(&self, experiment: &Experiment) -> Result<Experiment, OpError> {
        self.check_channels(experiment)?;
        self.check_estimates()?;
        let mut out = experiment.clone();
        for (channel, params) in &self.params {
            let scale = Logicle::new(*params)?;
            let scaled = experiment
                .channel_values(channel)?
                .iter()
                .map(|v| scale.scale(*v))
                .collect::<Result<Vec<_>, _>>()?;
            out.replace_channel(channel, scaled)?;
        }
        Ok(out)
    }
}
