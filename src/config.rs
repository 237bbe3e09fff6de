//! Numeric knobs shared by the estimators.
//!
//! Parameters are layered the same way everywhere they are loaded:
//! built-in defaults, then an optional TOML file, then `CYTOFLOW_`-prefixed
//! environment variables (`CYTOFLOW_KMEANS_MAX_ITERATIONS=50`).

use crate::error::{CytoflowError, OpError};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const ENV_PREFIX: &str = "CYTOFLOW_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisParameters {
    /// Iteration budget for k-means clustering.
    pub kmeans_max_iterations: usize,
    /// Iteration budget for the two-component mixture model fit.
    pub mixture_max_iterations: usize,
    /// Convergence threshold on the change of mean log-likelihood.
    pub mixture_tolerance: f64,
    /// Control events more than this many blank standard deviations below
    /// zero are dropped after autofluorescence subtraction.
    pub autofluorescence_outlier_sigma: f64,
    /// Number of decades `M` spanned by the logicle transform.
    pub logicle_decades: f64,
}

impl Default for AnalysisParameters {
    fn default() -> Self {
        Self {
            kmeans_max_iterations: 100,
            mixture_max_iterations: 100,
            mixture_tolerance: 1e-6,
            autofluorescence_outlier_sigma: 3.0,
            logicle_decades: 4.5,
        }
    }
}

impl AnalysisParameters {
    pub fn load(path: Option<&Path>) -> Result<Self, CytoflowError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        let params: Self = figment.merge(Env::prefixed(ENV_PREFIX)).extract()?;
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<(), OpError> {
        if self.kmeans_max_iterations == 0 {
            return Err(OpError::invalid("kmeans_max_iterations must be positive"));
        }
        if self.mixture_max_iterations == 0 {
            return Err(OpError::invalid("mixture_max_iterations must be positive"));
        }
        if !(self.mixture_tolerance > 0.0) {
            return Err(OpError::invalid("mixture_tolerance must be positive"));
        }
        if !(self.autofluorescence_outlier_sigma > 0.0) {
            return Err(OpError::invalid(
                "autofluorescence_outlier_sigma must be positive",
            ));
        }
        if !(self.logicle_decades > 0.0) {
            return Err(OpError::invalid("logicle_decades must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let params = AnalysisParameters::default();
        assert!(params.validate().is_ok());
        assert_eq!(params.kmeans_max_iterations, 100);
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "logicle_decades = 5.0").unwrap();
        writeln!(file, "mixture_max_iterations = 250").unwrap();
        let params = AnalysisParameters::load(Some(file.path())).unwrap();
        assert_eq!(params.logicle_decades, 5.0);
        assert_eq!(params.mixture_max_iterations, 250);
        assert_eq!(params.kmeans_max_iterations, 100);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "kmeans_max_iterations = 0").unwrap();
        let err = AnalysisParameters::load(Some(file.path())).unwrap_err();
        assert!(err.to_string().contains("kmeans_max_iterations"));
    }
}
