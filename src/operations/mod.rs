//! Operations: configured steps that turn one experiment into the next.
//!
//! Every operation kind is a variant of [`Operation`]. A variant that learns
//! parameters from data does so in `estimate`; `apply` never mutates its
//! input and records a snapshot of the operation in the output's history.

pub mod autofluorescence;
pub mod color_translation;
pub mod import;
pub mod kmeans;
pub mod logicle;
pub mod threshold;

pub use autofluorescence::AutofluorescenceOp;
pub use color_translation::ColorTranslationOp;
pub use import::{ImportOp, ImportTube};
pub use kmeans::KMeansOp;
pub use logicle::LogicleOp;
pub use threshold::ThresholdOp;

use crate::{
    config::AnalysisParameters,
    error::OpError,
    experiment::Experiment,
    subset::Subset,
    views::View,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const SUPPORTED_OPERATIONS: &[&str] = &[
    "import",
    "threshold",
    "logicle",
    "autofluorescence",
    "color_translation",
    "kmeans",
];

/// Per-call state shared by `estimate` and `apply`: the numeric parameters
/// and the non-fatal warnings raised so far.
#[derive(Debug)]
pub struct OpContext<'a> {
    pub params: &'a AnalysisParameters,
    warnings: Vec<String>,
}

impl<'a> OpContext<'a> {
    pub fn new(params: &'a AnalysisParameters) -> Self {
        Self {
            params,
            warnings: vec![],
        }
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!("{message}");
        self.warnings.push(message);
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn into_warnings(self) -> Vec<String> {
        self.warnings
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    Import(ImportOp),
    Threshold(ThresholdOp),
    Logicle(LogicleOp),
    Autofluorescence(AutofluorescenceOp),
    ColorTranslation(ColorTranslationOp),
    KMeans(KMeansOp),
}

impl Operation {
    pub fn name(&self) -> &str {
        match self {
            Self::Import(op) => &op.name,
            Self::Threshold(op) => &op.name,
            Self::Logicle(op) => &op.name,
            Self::Autofluorescence(op) => &op.name,
            Self::ColorTranslation(op) => &op.name,
            Self::KMeans(op) => &op.name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Import(_) => "import",
            Self::Threshold(_) => "threshold",
            Self::Logicle(_) => "logicle",
            Self::Autofluorescence(_) => "autofluorescence",
            Self::ColorTranslation(_) => "color_translation",
            Self::KMeans(_) => "kmeans",
        }
    }

    pub fn has_estimate(&self) -> bool {
        matches!(
            self,
            Self::Logicle(_) | Self::Autofluorescence(_) | Self::ColorTranslation(_)
        )
    }

    /// Whether this step is re-run when control samples are pushed through
    /// an experiment's history. Import loads data rather than transforming
    /// it, so it is skipped.
    pub fn replays_onto_controls(&self) -> bool {
        !matches!(self, Self::Import(_))
    }

    /// Learns parameters from `experiment`, optionally restricted to the rows
    /// matching `subset`. A no-op for operations without an estimate phase.
    pub fn estimate(
        &mut self,
        experiment: Option<&Experiment>,
        subset: Option<&Subset>,
        ctx: &mut OpContext,
    ) -> Result<(), OpError> {
        if !self.has_estimate() {
            return Ok(());
        }
        let experiment = experiment.ok_or_else(OpError::no_experiment)?;
        tracing::debug!(op = self.name(), kind = self.kind(), "estimate");
        match self {
            Self::Logicle(op) => op.estimate(experiment, subset, ctx),
            Self::Autofluorescence(op) => op.estimate(experiment, subset, ctx),
            Self::ColorTranslation(op) => op.estimate(experiment, subset, ctx),
            Self::Import(_) | Self::Threshold(_) | Self::KMeans(_) => Ok(()),
        }
    }

    /// Produces a new experiment; the input is left untouched.
    pub fn apply(
        &self,
        experiment: Option<&Experiment>,
        ctx: &mut OpContext,
    ) -> Result<Experiment, OpError> {
        tracing::debug!(op = self.name(), kind = self.kind(), "apply");
        let mut out = match (self, experiment) {
            (Self::Import(op), _) => op.apply()?,
            (_, None) => return Err(OpError::no_experiment()),
            (Self::Threshold(op), Some(ex)) => op.apply(ex)?,
            (Self::Logicle(op), Some(ex)) => op.apply(ex)?,
            (Self::Autofluorescence(op), Some(ex)) => op.apply(ex)?,
            (Self::ColorTranslation(op), Some(ex)) => op.apply(ex)?,
            (Self::KMeans(op), Some(ex)) => op.apply(ex, ctx)?,
        };
        out.push_history(self.clone());
        Ok(out)
    }

    /// Cheap check of whether `apply` would plausibly succeed on `experiment`.
    pub fn is_valid(&self, experiment: Option<&Experiment>) -> bool {
        match (self, experiment) {
            (Self::Import(op), _) => op.is_valid(),
            (_, None) => false,
            (Self::Threshold(op), Some(ex)) => op.is_valid(ex),
            (Self::Logicle(op), Some(ex)) => op.is_valid(ex),
            (Self::Autofluorescence(op), Some(ex)) => op.is_valid(ex),
            (Self::ColorTranslation(op), Some(ex)) => op.is_valid(ex),
            (Self::KMeans(op), Some(ex)) => op.is_valid(ex),
        }
    }

    /// The diagnostic view paired with this operation, if it has one.
    pub fn default_view(&self) -> Option<View> {
        match self {
            Self::Import(_) | Self::Logicle(_) => None,
            Self::Threshold(_) => Some(View::ThresholdSelection(Default::default())),
            Self::Autofluorescence(_) => Some(View::AutofluorescenceDiagnostic(Default::default())),
            Self::ColorTranslation(_) => Some(View::ColorTranslationDiagnostic(Default::default())),
            Self::KMeans(_) => Some(View::KMeansScatter(Default::default())),
        }
    }

    /// Resolves relative file references against `base`.
    pub fn rebase_paths(&mut self, base: &Path) {
        let rebase = |path: &mut std::path::PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };
        match self {
            Self::Import(op) => op.tubes.iter_mut().for_each(|t| rebase(&mut t.file)),
            Self::Autofluorescence(op) => {
                if let Some(path) = op.blank_file.as_mut() {
                    rebase(path);
                }
            }
            Self::ColorTranslation(op) => op.controls.values_mut().for_each(rebase),
            Self::Threshold(_) | Self::Logicle(_) | Self::KMeans(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::tests::small_experiment;

    fn threshold() -> Operation {
        Operation::Threshold(ThresholdOp {
            name: "High".to_string(),
            channel: "FITC-A".to_string(),
            threshold: 2.5,
        })
    }

    #[test]
    fn test_apply_records_frozen_history() {
        let ex = small_experiment();
        let params = AnalysisParameters::default();
        let mut ctx = OpContext::new(&params);
        let mut op = threshold();
        let out = op.apply(Some(&ex), &mut ctx).unwrap();
        assert_eq!(out.history().len(), ex.history().len() + 1);
        assert_eq!(out.history().last(), Some(&op));

        if let Operation::Threshold(t) = &mut op {
            t.threshold = 100.0;
        }
        assert_ne!(out.history().last(), Some(&op));
        assert!(ex.history().is_empty());
    }

    #[test]
    fn test_null_experiment_is_a_configuration_error() {
        let params = AnalysisParameters::default();
        let mut ctx = OpContext::new(&params);
        let err = threshold().apply(None, &mut ctx).unwrap_err();
        assert_eq!(err.message, "No experiment specified");
        assert!(!threshold().is_valid(None));
    }

    #[test]
    fn test_operation_json_round_trip() {
        let op = threshold();
        let json = serde_json::to_string(&op).unwrap();
        assert!(json.starts_with("{\"Threshold\""));
        let back: Operation = serde_json::from_str(&json).unwrap();
        assert_eq!(back, op);
        assert_eq!(back.kind(), "threshold");
        assert!(!back.has_estimate());
        assert!(back.default_view().is_some());
    }

    #[test]
    fn test_rebase_paths() {
        let mut op = Operation::Autofluorescence(AutofluorescenceOp {
            name: "AF".to_string(),
            channels: vec!["FITC-A".to_string()],
            blank_file: Some("blank.csv".into()),
            ..Default::default()
        });
        op.rebase_paths(Path::new("/data"));
        match op {
            Operation::Autofluorescence(af) => {
                assert_eq!(af.blank_file, Some("/data/blank.csv".into()))
            }
            _ => unreachable!(),
        }
    }
}
