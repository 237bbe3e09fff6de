//! Loads tubes into a fresh experiment; the head of every workflow.

use crate::{
    error::OpError,
    experiment::{ConditionKind, ConditionValue, Experiment},
    tube::Tube,
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportTube {
    pub file: PathBuf,
    #[serde(default)]
    pub conditions: BTreeMap<String, ConditionValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportOp {
    #[serde(default = "default_import_name")]
    pub name: String,
    pub tubes: Vec<ImportTube>,
    #[serde(default)]
    pub conditions: BTreeMap<String, ConditionKind>,
    /// Keep only these channels; empty keeps every channel of the tubes.
    #[serde(default)]
    pub channels: Vec<String>,
    /// Instrument ranges; channels not listed use their largest value.
    #[serde(default)]
    pub ranges: BTreeMap<String, f64>,
}

fn default_import_name() -> String {
    "Import".to_string()
}

impl Default for ImportOp {
    fn default() -> Self {
        Self {
            name: default_import_name(),
            tubes: vec![],
            conditions: BTreeMap::new(),
            channels: vec![],
            ranges: BTreeMap::new(),
        }
    }
}

impl ImportOp {
    pub fn is_valid(&self) -> bool {
        !self.tubes.is_empty()
            && self
                .tubes
                .iter()
                .all(|t| self.conditions.keys().all(|c| t.conditions.contains_key(c)))
    }

    fn select_channels(&self, tube: Tube) -> Result<Tube, OpError> {
        if self.channels.is_empty() {
            return Ok(tube);
        }
        let mut columns = Vec::with_capacity(self.channels.len());
        for channel in &self.channels {
            let values = tube.channel(channel).ok_or_else(|| {
                OpError::not_found(format!(
                    "Tube '{}' has no channel '{channel}'",
                    tube.source()
                ))
            })?;
            columns.push((channel.clone(), values.to_vec()));
        }
        Tube::from_columns(tube.source(), columns)
    }

    pub fn apply(&self) -> Result<Experiment, OpError> {
        if self.tubes.is_empty() {
            return Err(OpError::invalid(
                "You have to specify at least one tube to import",
            ));
        }
        let mut experiment = Experiment::new();
        experiment.add_conditions(&self.conditions)?;
        for spec in &self.tubes {
            let tube = self.select_channels(Tube::load(&spec.file)?)?;
            experiment.add_tube(&tube, &spec.conditions)?;
        }

        for channel in self.ranges.keys() {
            if !experiment.has_channel(channel) {
                return Err(OpError::not_found(format!(
                    "A range was given for channel '{channel}', which wasn't imported"
                )));
            }
        }
        let channels = experiment.channels().to_vec();
        for channel in &channels {
            let range = match self.ranges.get(channel) {
                Some(range) => Some(*range),
                None => {
                    let max = experiment
                        .channel_values(channel)?
                        .iter()
                        .copied()
                        .fold(f64::NEG_INFINITY, f64::max);
                    max.is_finite().then_some(max)
                }
            };
            if let Some(meta) = experiment.metadata_mut(channel) {
                meta.range = range;
            }
        }
        tracing::info!(
            tubes = self.tubes.len(),
            events = experiment.len(),
            "imported experiment"
        );
        Ok(experiment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tube::tests::write_tube_csv;

    fn tube(file: &tempfile::NamedTempFile, dox: f64) -> ImportTube {
        let mut conditions = BTreeMap::new();
        conditions.insert("Dox".to_string(), ConditionValue::Float(dox));
        ImportTube {
            file: file.path().to_path_buf(),
            conditions,
        }
    }

    #[test]
    fn test_import_two_tubes_with_ranges() {
        let a = write_tube_csv(&["FITC-A", "PE-A"], &[vec![1.0, 2.0], vec![3.0, 4.0]]);
        let b = write_tube_csv(&["PE-A", "FITC-A"], &[vec![50.0, 5.0]]);
        let mut op = ImportOp {
            tubes: vec![tube(&a, 0.0), tube(&b, 10.0)],
            ..Default::default()
        };
        op.conditions.insert("Dox".to_string(), ConditionKind::Float);
        op.ranges.insert("FITC-A".to_string(), 1024.0);

        let ex = op.apply().unwrap();
        assert_eq!(ex.len(), 3);
        assert_eq!(ex.channel_values("FITC-A").unwrap(), &[1.0, 3.0, 5.0]);
        assert_eq!(ex.channel_values("PE-A").unwrap(), &[2.0, 4.0, 50.0]);
        assert_eq!(ex.metadata("FITC-A").unwrap().range, Some(1024.0));
        assert_eq!(ex.metadata("PE-A").unwrap().range, Some(50.0));
        assert!(op.is_valid());
    }

    #[test]
    fn test_import_channel_selection() {
        let a = write_tube_csv(&["FSC-A", "FITC-A"], &[vec![1.0, 2.0]]);
        let op = ImportOp {
            tubes: vec![ImportTube {
                file: a.path().to_path_buf(),
                conditions: BTreeMap::new(),
            }],
            channels: vec!["FITC-A".to_string()],
            ..Default::default()
        };
        let ex = op.apply().unwrap();
        assert_eq!(ex.channels(), &["FITC-A".to_string()]);
    }

    #[test]
    fn test_import_errors() {
        assert!(ImportOp::default().apply().is_err());
        assert!(!ImportOp::default().is_valid());

        let a = write_tube_csv(&["FITC-A"], &[vec![1.0]]);
        let mut op = ImportOp {
            tubes: vec![ImportTube {
                file: a.path().to_path_buf(),
                conditions: BTreeMap::new(),
            }],
            ..Default::default()
        };
        op.conditions.insert("Dox".to_string(), ConditionKind::Float);
        let err = op.apply().unwrap_err();
        assert!(err.message.contains("no value for condition 'Dox'"));

        op.conditions.clear();
        op.ranges.insert("APC-A".to_string(), 10.0);
        assert!(op.apply().is_err());
    }
}
