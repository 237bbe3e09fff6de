//! Two-channel k-means clustering from user-supplied starting centroids.

use super::OpContext;
use crate::{
    error::OpError,
    experiment::{Column, Experiment},
    stats,
};
use ndarray::{Array2, s};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct KMeansOp {
    pub name: String,
    pub xchannel: String,
    pub ychannel: String,
    /// One `[x, y]` starting point per cluster, in data units.
    #[serde(default)]
    pub initial_centroids: Vec<Vec<f64>>,
}

impl KMeansOp {
    fn check(&self, experiment: &Experiment) -> Result<(), OpError> {
        if self.name.trim().is_empty() {
            return Err(OpError::invalid("You have to set the operation's name"));
        }
        if let Some(bad) = self.initial_centroids.iter().find(|c| c.len() != 2) {
            return Err(OpError::invalid(format!(
                "Initial centroids must be 2-dimensional, got {bad:?}"
            )));
        }
        if self.xchannel.is_empty() || self.ychannel.is_empty() {
            return Err(OpError::invalid("Must specify both an x and a y channel"));
        }
        for channel in [&self.xchannel, &self.ychannel] {
            if !experiment.has_channel(channel) {
                return Err(OpError::not_found(format!(
                    "Channel '{channel}' isn't in the experiment"
                )));
            }
        }
        if self.initial_centroids.is_empty() {
            return Err(OpError::invalid("No initial centroids specified"));
        }
        if experiment.has_column(&self.name) {
            return Err(OpError::invalid(format!(
                "Experiment already has a column named '{}'",
                self.name
            )));
        }
        Ok(())
    }

    pub fn is_valid(&self, experiment: &Experiment) -> bool {
        self.check(experiment).is_ok()
    }

    /// Cluster labels for every event of `experiment`.
    pub fn labels(
        &self,
        experiment: &Experiment,
        ctx: &mut OpContext,
    ) -> Result<Vec<i64>, OpError> {
        self.check(experiment)?;
        let x = experiment.channel_values(&self.xchannel)?;
        let y = experiment.channel_values(&self.ychannel)?;
        let n = x.len();
        let k = self.initial_centroids.len();

        // data and centroids are whitened together so they share a scale
        let mut stacked = Array2::<f64>::zeros((n + k, 2));
        for (row, (a, b)) in x.iter().zip(y).enumerate() {
            stacked[[row, 0]] = *a;
            stacked[[row, 1]] = *b;
        }
        for (idx, centroid) in self.initial_centroids.iter().enumerate() {
            stacked[[n + idx, 0]] = centroid[0];
            stacked[[n + idx, 1]] = centroid[1];
        }
        let (whitened, flat) = stats::whiten(&stacked);
        if !flat.is_empty() {
            ctx.warn(
                "Some columns have standard deviation zero. The values of these columns will not change.",
            );
        }
        // the starting centroids stay in the clustered set and pull on the means
        let initial = whitened.slice(s![n.., ..]).to_owned();
        let fit = stats::kmeans(&whitened, &initial, ctx.params.kmeans_max_iterations)?;
        if !fit.empty_clusters.is_empty() {
            ctx.warn(
                "One of the clusters is empty. Re-run kmeans with a different initialization.",
            );
        }
        tracing::debug!(op = %self.name, iterations = fit.iterations, "k-means");
        Ok(fit.labels[..n].iter().map(|l| *l as i64).collect())
    }

    pub fn apply(
        &self,
        experiment: &Experiment,
        ctx: &mut OpContext,
    ) -> Result<Experiment, OpError> {
        let labels = self.labels(experiment, ctx)?;
        let mut out = experiment.clone();
        out.add_condition(&self.name, Column::Int(labels))?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::AnalysisParameters, experiment::tests::small_experiment};

    fn op(centroids: Vec<Vec<f64>>) -> KMeansOp {
        KMeansOp {
            name: "Cluster".to_string(),
            xchannel: "FITC-A".to_string(),
            ychannel: "PE-A".to_string(),
            initial_centroids: centroids,
        }
    }

    #[test]
    fn test_two_clusters() {
        let ex = small_experiment();
        let params = AnalysisParameters::default();
        let mut ctx = OpContext::new(&params);
        let out = op(vec![vec![1.0, 10.0], vec![4.0, 40.0]])
            .apply(&ex, &mut ctx)
            .unwrap();
        assert_eq!(out.column("Cluster"), Some(&Column::Int(vec![0, 0, 1, 1])));
        assert!(ctx.warnings().is_empty());
    }

    #[test]
    fn test_single_centroid_labels_everything_zero() {
        let ex = small_experiment();
        let params = AnalysisParameters::default();
        let mut ctx = OpContext::new(&params);
        let out = op(vec![vec![2.0, 2.0]]).apply(&ex, &mut ctx).unwrap();
        assert_eq!(out.column("Cluster"), Some(&Column::Int(vec![0; 4])));
    }

    #[test]
    fn test_wrong_dimensionality_rejected_first() {
        let ex = small_experiment();
        let params = AnalysisParameters::default();
        let mut ctx = OpContext::new(&params);
        let mut bad = op(vec![vec![1.0, 2.0], vec![1.0, 2.0, 3.0]]);
        bad.xchannel = "Missing".to_string();
        let err = bad.apply(&ex, &mut ctx).unwrap_err();
        assert!(err.message.contains("2-dimensional"));
    }

    #[test]
    fn test_far_centroid_keeps_only_itself() {
        let ex = small_experiment();
        let params = AnalysisParameters::default();
        let mut ctx = OpContext::new(&params);
        let out = op(vec![vec![2.0, 20.0], vec![1000.0, 10000.0]])
            .apply(&ex, &mut ctx)
            .unwrap();
        assert_eq!(out.column("Cluster"), Some(&Column::Int(vec![0; 4])));
        assert!(ctx.warnings().is_empty());
    }

    #[test]
    fn test_starting_centroids_take_part_in_clustering() {
        let mut ex = Experiment::new();
        ex.add_channel("FITC-A", vec![2.0, 8.0, 9.0], Default::default())
            .unwrap();
        ex.add_channel("PE-A", vec![2.0, 8.0, 6.0], Default::default())
            .unwrap();
        let params = AnalysisParameters::default();
        let mut ctx = OpContext::new(&params);
        let labels = op(vec![vec![10.0, 4.0], vec![9.0, 5.0]])
            .labels(&ex, &mut ctx)
            .unwrap();
        // clustering the events alone would put all three in cluster 1
        assert_eq!(labels, vec![1, 0, 0]);
        assert!(ctx.warnings().is_empty());
    }

    #[test]
    fn test_duplicate_centroids_warn_about_empty_cluster() {
        let ex = small_experiment();
        let params = AnalysisParameters::default();
        let mut ctx = OpContext::new(&params);
        let labels = op(vec![vec![2.0, 20.0], vec![2.0, 20.0]])
            .labels(&ex, &mut ctx)
            .unwrap();
        assert_eq!(labels.len(), 4);
        assert_eq!(ctx.warnings().len(), 1);
        assert!(ctx.warnings()[0].contains("empty"));
    }

    #[test]
    fn test_configuration_errors() {
        let ex = small_experiment();
        let params = AnalysisParameters::default();
        let mut ctx = OpContext::new(&params);
        assert!(op(vec![]).apply(&ex, &mut ctx).is_err());
        let mut collide = op(vec![vec![1.0, 1.0]]);
        collide.name = "Dox".to_string();
        assert!(collide.apply(&ex, &mut ctx).is_err());
        assert!(!collide.is_valid(&ex));
    }
}
