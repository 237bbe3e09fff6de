//! Subtract the autofluorescence of unstained cells.
//!
//! The blank sample is pushed through every step that produced the
//! experiment before its per-channel median and spread are measured, so the
//! baseline is expressed in the same units as the data it is subtracted from.

use super::OpContext;
use crate::{
    error::OpError,
    experiment::Experiment,
    metadata::Baseline,
    stats,
    subset::Subset,
    tube::Tube,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AutofluorescenceOp {
    pub name: String,
    pub channels: Vec<String>,
    pub blank_file: Option<PathBuf>,
    #[serde(default)]
    pub af_median: BTreeMap<String, f64>,
    #[serde(default)]
    pub af_stdev: BTreeMap<String, f64>,
}

impl AutofluorescenceOp {
    fn check_channels(&self, experiment: &Experiment) -> Result<(), OpError> {
        if self.channels.is_empty() {
            return Err(OpError::invalid("No channels specified"));
        }
        if !self.channels.iter().all(|c| experiment.has_channel(c)) {
            return Err(OpError::not_found(
                "Specified channels that weren't found in the experiment.",
            ));
        }
        Ok(())
    }

    /// The blank sample after replaying `experiment`'s history onto it.
    pub fn blank_experiment(
        &self,
        experiment: &Experiment,
        ctx: &mut OpContext,
    ) -> Result<Experiment, OpError> {
        let path = self
            .blank_file
            .as_ref()
            .ok_or_else(|| OpError::invalid("No blank file specified"))?;
        let mut blank = Tube::load(path)?.to_experiment_like(experiment)?;
        for op in experiment.history() {
            if !op.replays_onto_controls() {
                continue;
            }
            blank = op.apply(Some(&blank), ctx).map_err(|e| {
                OpError::new(
                    e.code,
                    format!(
                        "Could not replay '{}' onto the blank sample: {}",
                        op.name(),
                        e.message
                    ),
                )
            })?;
        }
        Ok(blank)
    }

    pub fn estimate(
        &mut self,
        experiment: &Experiment,
        subset: Option<&Subset>,
        ctx: &mut OpContext,
    ) -> Result<(), OpError> {
        self.check_channels(experiment)?;
        let blank = self.blank_experiment(experiment, ctx)?;
        let blank = match subset {
            Some(subset) => subset.select(&blank)?,
            None => blank,
        };

        let mut af_median = BTreeMap::new();
        let mut af_stdev = BTreeMap::new();
        for channel in &self.channels {
            let values = blank.channel_values(channel)?;
            let (Some(median), Some(stdev)) = (stats::median(values), stats::stdev(values))
            else {
                return Err(OpError::invalid("The blank sample has no events"));
            };
            tracing::debug!(channel = %channel, median, stdev, "autofluorescence");
            af_median.insert(channel.clone(), median);
            af_stdev.insert(channel.clone(), stdev);
        }
        self.af_median = af_median;
        self.af_stdev = af_stdev;
        Ok(())
    }

    fn check_estimates(&self, experiment: &Experiment) -> Result<(), OpError> {
        let medians: BTreeSet<&String> = self.af_median.keys().collect();
        let stdevs: BTreeSet<&String> = self.af_stdev.keys().collect();
        let known = |keys: &BTreeSet<&String>| keys.iter().all(|c| experiment.has_channel(c));
        if medians.is_empty() || !known(&medians) || !known(&stdevs) {
            return Err(OpError::not_estimated(
                "Autofluorescence estimates aren't set, or are different than those in the experiment parameter. Did you forget to run estimate()?",
            ));
        }
        if medians != stdevs {
            return Err(OpError::internal("Median and stdev keys are different!"));
        }
        let configured: BTreeSet<&String> = self.channels.iter().collect();
        if configured != medians {
            return Err(OpError::not_estimated(
                "Estimated channels differ from the channels parameter. Did you forget to (re)run estimate()?",
            ));
        }
        Ok(())
    }

    pub fn is_valid(&self, experiment: &Experiment) -> bool {
        self.blank_file.is_some()
            && self.check_channels(experiment).is_ok()
            && self.check_estimates(experiment).is_ok()
    }

    pub fn apply(&self, experiment: &Experiment) -> Result<Experiment, OpError> {
        self.check_estimates(experiment)?;
        let mut out = experiment.clone();
        for channel in &self.channels {
            let (median, stdev) = (self.af_median[channel], self.af_stdev[channel]);
            let corrected = experiment
                .channel_values(channel)?
                .iter()
                .map(|v| v - median)
                .collect();
            out.replace_channel(channel, corrected)?;
            if let Some(meta) = out.metadata_mut(channel) {
                meta.baseline = Some(Baseline { median, stdev });
            }
        }
        Ok(out)
    }
}
