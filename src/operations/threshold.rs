//! Gate events above a threshold on one channel.

use crate::{
    error::OpError,
    experiment::{Column, Experiment},
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ThresholdOp {
    pub name: String,
    pub channel: String,
    pub threshold: f64,
}

impl ThresholdOp {
    fn check(&self, experiment: &Experiment) -> Result<(), OpError> {
        if self.name.trim().is_empty() {
            return Err(OpError::invalid("You have to set the gate's name"));
        }
        if experiment.has_column(&self.name) {
            return Err(OpError::invalid(format!(
                "Experiment already has a column named '{}'",
                self.name
            )));
        }
        if !experiment.has_channel(&self.channel) {
            return Err(OpError::not_found(format!(
                "Channel '{}' isn't in the experiment",
                self.channel
            )));
        }
        Ok(())
    }

    pub fn is_valid(&self, experiment: &Experiment) -> bool {
        self.check(experiment).is_ok()
    }

    /// Adds a bool condition named after the gate: `channel > threshold`.
    pub fn apply(&self, experiment: &Experiment) -> Result<Experiment, OpError> {
        self.check(experiment)?;
        let gate = experiment
            .channel_values(&self.channel)?
            .iter()
            .map(|v| *v > self.threshold)
            .collect();
        let mut out = experiment.clone();
        out.add_condition(&self.name, Column::Bool(gate))?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::tests::small_experiment;

    fn gate(name: &str, channel: &str) -> ThresholdOp {
        ThresholdOp {
            name: name.to_string(),
            channel: channel.to_string(),
            threshold: 2.0,
        }
    }

    #[test]
    fn test_threshold_adds_bool_condition() {
        let ex = small_experiment();
        let out = gate("Bright", "FITC-A").apply(&ex).unwrap();
        assert_eq!(
            out.column("Bright"),
            Some(&Column::Bool(vec![false, false, true, true]))
        );
        assert!(!ex.has_column("Bright"));
    }

    #[test]
    fn test_threshold_configuration_errors() {
        let ex = small_experiment();
        assert!(gate("", "FITC-A").apply(&ex).is_err());
        assert!(gate("Dox", "FITC-A").apply(&ex).is_err());
        let err = gate("Bright", "APC-A").apply(&ex).unwrap_err();
        assert!(err.message.contains("APC-A"));
        assert!(!gate("Bright", "APC-A").is_valid(&ex));
        assert!(gate("Bright", "PE-A").is_valid(&ex));
    }
}
