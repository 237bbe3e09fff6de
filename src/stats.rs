//! Small statistical estimators used by the operations.

use crate::error::OpError;
use itertools::izip;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

/// Linearly interpolated quantile of unsorted `values`, `q` in [0, 1].
pub fn quantile(values: &[f64], q: f64) -> Option<f64> {
    if values.is_empty() || !(0.0..=1.0).contains(&q) {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let pos = q * (sorted.len() - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    let frac = pos - lower as f64;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * frac)
}

pub fn median(values: &[f64]) -> Option<f64> {
    quantile(values, 0.5)
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Population standard deviation (divides by `n`).
pub fn stdev(values: &[f64]) -> Option<f64> {
    let m = mean(values)?;
    let var = values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / values.len() as f64;
    Some(var.sqrt())
}

/// Straight line `y = slope * x + intercept`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LineFit {
    pub slope: f64,
    pub intercept: f64,
}

impl LineFit {
    pub fn eval(&self, x: f64) -> f64 {
        self.slope * x + self.intercept
    }
}

/// Degree-one least squares fit minimizing `sum((w * (y - fit(x)))^2)`.
///
/// Weights scale residuals, not squared residuals; `None` is the ordinary
/// unweighted fit.
pub fn fit_line(x: &[f64], y: &[f64], weights: Option<&[f64]>) -> Result<LineFit, OpError> {
    if x.len() != y.len() || weights.is_some_and(|w| w.len() != x.len()) {
        return Err(OpError::internal("fit_line called with mismatched lengths"));
    }
    if x.len() < 2 {
        return Err(OpError::invalid(format!(
            "Need at least two events to fit a line, got {}",
            x.len()
        )));
    }
    let x = Array1::from_vec(x.to_vec());
    let y = Array1::from_vec(y.to_vec());
    let w2 = match weights {
        Some(w) => Array1::from_iter(w.iter().map(|w| w * w)),
        None => Array1::ones(x.len()),
    };
    let total = w2.sum();
    if !(total > 0.0) {
        return Err(OpError::invalid("All fit weights are zero"));
    }
    let mx = (&w2 * &x).sum() / total;
    let my = (&w2 * &y).sum() / total;
    let dx = &x - mx;
    let dy = &y - my;
    let sxx = (&w2 * &dx * &dx).sum();
    let sxy = (&w2 * &dx * &dy).sum();
    if !(sxx.abs() > f64::EPSILON * total) {
        return Err(OpError::invalid(
            "Cannot fit a line: all x values are identical",
        ));
    }
    let slope = sxy / sxx;
    Ok(LineFit {
        slope,
        intercept: my - slope * mx,
    })
}

/// Floor added to every mixture variance to keep components from collapsing
/// onto single points.
pub const MIXTURE_MIN_VARIANCE: f64 = 1e-3;

/// Two-component one-dimensional Gaussian mixture fitted by EM.
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianMixture {
    pub weights: [f64; 2],
    pub means: [f64; 2],
    pub variances: [f64; 2],
    pub iterations: usize,
    pub converged: bool,
}

impl GaussianMixture {
    pub fn fit(values: &[f64], max_iterations: usize, tolerance: f64) -> Result<Self, OpError> {
        if values.len() < 2 {
            return Err(OpError::invalid(format!(
                "Need at least two events to fit a mixture model, got {}",
                values.len()
            )));
        }
        let lo = quantile(values, 0.25).unwrap_or(0.0);
        let hi = quantile(values, 0.75).unwrap_or(0.0);
        let var = stdev(values).map(|s| s * s).unwrap_or(0.0) + MIXTURE_MIN_VARIANCE;
        let mut model = Self {
            weights: [0.5, 0.5],
            means: [lo, hi],
            variances: [var, var],
            iterations: 0,
            converged: false,
        };
        let mut previous = f64::NEG_INFINITY;
        for iteration in 1..=max_iterations {
            let (resp, log_likelihood) = model.e_step(values);
            model.m_step(values, &resp);
            model.iterations = iteration;
            if (log_likelihood - previous).abs() < tolerance {
                model.converged = true;
                break;
            }
            previous = log_likelihood;
        }
        Ok(model)
    }

    fn log_densities(&self, x: f64) -> [f64; 2] {
        let mut out = [0.0; 2];
        for (k, slot) in out.iter_mut().enumerate() {
            let var = self.variances[k];
            let d = x - self.means[k];
            *slot = self.weights[k].ln()
                - 0.5 * (2.0 * std::f64::consts::PI * var).ln()
                - d * d / (2.0 * var);
        }
        out
    }

    /// Returns per-event responsibilities and the mean log-likelihood.
    fn e_step(&self, values: &[f64]) -> (Vec<[f64; 2]>, f64) {
        let mut total = 0.0;
        let resp = values
            .iter()
            .map(|&x| {
                let [a, b] = self.log_densities(x);
                let m = a.max(b);
                let norm = m + ((a - m).exp() + (b - m).exp()).ln();
                total += norm;
                [(a - norm).exp(), (b - norm).exp()]
            })
            .collect();
        (resp, total / values.len() as f64)
    }

    fn m_step(&mut self, values: &[f64], resp: &[[f64; 2]]) {
        let n = values.len() as f64;
        for k in 0..2 {
            let nk: f64 = resp.iter().map(|r| r[k]).sum::<f64>() + 10.0 * f64::EPSILON;
            let mean = izip!(values, resp).map(|(x, r)| r[k] * x).sum::<f64>() / nk;
            let var = izip!(values, resp)
                .map(|(x, r)| r[k] * (x - mean) * (x - mean))
                .sum::<f64>()
                / nk;
            self.weights[k] = nk / n;
            self.means[k] = mean;
            self.variances[k] = var + MIXTURE_MIN_VARIANCE;
        }
    }

    pub fn predict_proba(&self, values: &[f64]) -> Vec<[f64; 2]> {
        self.e_step(values).0
    }

    /// Index of the component with the larger mean.
    pub fn upper_component(&self) -> usize {
        if self.means[0] > self.means[1] { 0 } else { 1 }
    }

    /// Describes why the fit looks unreliable, if it does.
    pub fn degeneracy(&self) -> Option<String> {
        if !self.converged {
            return Some(format!(
                "mixture model did not converge within {} iterations",
                self.iterations
            ));
        }
        if self.weights.iter().any(|w| *w < 0.01) {
            return Some(format!(
                "mixture model collapsed onto one population (weights {:.3}, {:.3})",
                self.weights[0], self.weights[1]
            ));
        }
        if self
            .variances
            .iter()
            .any(|v| *v <= MIXTURE_MIN_VARIANCE * (1.0 + 1e-6))
        {
            return Some("mixture model has a zero-width component".to_string());
        }
        None
    }
}

/// Scales every column to unit population standard deviation.
///
/// Columns with zero spread are left unscaled; their indices are returned.
pub fn whiten(obs: &Array2<f64>) -> (Array2<f64>, Vec<usize>) {
    let std = obs.std_axis(Axis(0), 0.0);
    let mut zero = vec![];
    let scale = Array1::from_iter(std.iter().enumerate().map(|(idx, &s)| {
        if s > 0.0 {
            s
        } else {
            zero.push(idx);
            1.0
        }
    }));
    (obs / &scale, zero)
}

#[derive(Debug, Clone, PartialEq)]
pub struct KMeansFit {
    pub centroids: Array2<f64>,
    pub labels: Vec<usize>,
    pub iterations: usize,
    /// Clusters that lost all members at some iteration; their centroid was
    /// kept in place.
    pub empty_clusters: Vec<usize>,
}

fn nearest(point: ndarray::ArrayView1<f64>, centroids: &ArrayView2<f64>) -> usize {
    let mut best = 0;
    let mut best_dist = f64::INFINITY;
    for (k, c) in centroids.rows().into_iter().enumerate() {
        let dist: f64 = izip!(point.iter(), c.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum();
        if dist < best_dist {
            best = k;
            best_dist = dist;
        }
    }
    best
}

fn assign(data: &Array2<f64>, centroids: &Array2<f64>) -> Vec<usize> {
    let view = centroids.view();
    data.rows().into_iter().map(|p| nearest(p, &view)).collect()
}

/// Lloyd's k-means started from `initial`, for at most `max_iterations`
/// centroid updates.
pub fn kmeans(
    data: &Array2<f64>,
    initial: &Array2<f64>,
    max_iterations: usize,
) -> Result<KMeansFit, OpError> {
    if initial.nrows() == 0 {
        return Err(OpError::invalid("k-means needs at least one initial centroid"));
    }
    if initial.ncols() != data.ncols() {
        return Err(OpError::invalid(format!(
            "Centroids have {} dimensions but the data has {}",
            initial.ncols(),
            data.ncols()
        )));
    }
    let k = initial.nrows();
    let mut centroids = initial.clone();
    let mut empty_clusters = vec![];
    let mut iterations = 0;
    for _ in 0..max_iterations {
        iterations += 1;
        let labels = assign(data, &centroids);
        let mut sums = Array2::<f64>::zeros(centroids.raw_dim());
        let mut counts = vec![0usize; k];
        for (row, &label) in data.rows().into_iter().zip(&labels) {
            let mut target = sums.row_mut(label);
            target += &row;
            counts[label] += 1;
        }
        let mut updated = centroids.clone();
        for (idx, &count) in counts.iter().enumerate() {
            if count == 0 {
                if !empty_clusters.contains(&idx) {
                    empty_clusters.push(idx);
                }
                continue;
            }
            let mean = &sums.row(idx) / count as f64;
            updated.row_mut(idx).assign(&mean);
        }
        let unchanged = updated == centroids;
        centroids = updated;
        if unchanged {
            break;
        }
    }
    let labels = assign(data, &centroids);
    Ok(KMeansFit {
        centroids,
        labels,
        iterations,
        empty_clusters,
    })
}
