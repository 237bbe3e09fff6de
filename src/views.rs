//! Read-only views: compute plot-ready series from an experiment.
//!
//! Drawing is left to the caller. A view either reads the result of the
//! item it belongs to, or (for diagnostic views of an operation) the input
//! that operation was applied to.

use crate::{
    config::AnalysisParameters,
    error::{OpError, ViewError},
    experiment::Experiment,
    operations::{OpContext, Operation},
    subset::Subset,
};
use serde::{Deserialize, Serialize};

pub const SUPPORTED_VIEWS: &[&str] = &[
    "histogram",
    "threshold_selection",
    "autofluorescence_diagnostic",
    "color_translation_diagnostic",
    "kmeans_scatter",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scale {
    #[default]
    Linear,
    Log,
}

fn default_bins() -> usize {
    100
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramView {
    pub channel: String,
    #[serde(default = "default_bins")]
    pub bins: usize,
    #[serde(default)]
    pub scale: Scale,
    #[serde(default)]
    pub subset: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSelectionView {
    #[serde(default = "default_bins")]
    pub bins: usize,
    #[serde(default)]
    pub scale: Scale,
}

impl Default for ThresholdSelectionView {
    fn default() -> Self {
        Self {
            bins: default_bins(),
            scale: Scale::Linear,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutofluorescenceDiagnosticView {
    #[serde(default = "default_bins")]
    pub bins: usize,
}

impl Default for AutofluorescenceDiagnosticView {
    fn default() -> Self {
        Self { bins: 200 }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ColorTranslationDiagnosticView {
    /// Points on each fitted line.
    #[serde(default)]
    pub line_points: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct KMeansScatterView {
    #[serde(default)]
    pub subset: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum View {
    Histogram(HistogramView),
    ThresholdSelection(ThresholdSelectionView),
    AutofluorescenceDiagnostic(AutofluorescenceDiagnosticView),
    ColorTranslationDiagnostic(ColorTranslationDiagnosticView),
    KMeansScatter(KMeansScatterView),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramPanel {
    pub title: String,
    pub channel: String,
    /// `counts.len() + 1` bin edges.
    pub edges: Vec<f64>,
    pub counts: Vec<usize>,
    /// Vertical marker positions, e.g. a threshold or a median.
    pub markers: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScatterPanel {
    pub title: String,
    pub x_channel: String,
    pub y_channel: String,
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    /// Group label per point, when points are coloured.
    pub groups: Option<Vec<i64>>,
    /// Overlaid polyline.
    pub line: Vec<(f64, f64)>,
    /// Vertical marker positions on the x axis.
    pub markers: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "panels", rename_all = "snake_case")]
pub enum Plot {
    Histograms(Vec<HistogramPanel>),
    Scatters(Vec<ScatterPanel>),
}

/// Bins `values` into `bins` equal-width bins (equal-width in log10 for
/// [`Scale::Log`], which ignores non-positive values).
pub fn histogram(
    values: &[f64],
    bins: usize,
    scale: Scale,
) -> Result<(Vec<f64>, Vec<usize>), ViewError> {
    if bins == 0 {
        return Err(ViewError::Invalid("bins must be positive".to_string()));
    }
    let transformed: Vec<f64> = match scale {
        Scale::Linear => values.iter().copied().filter(|v| v.is_finite()).collect(),
        Scale::Log => values
            .iter()
            .filter(|v| **v > 0.0 && v.is_finite())
            .map(|v| v.log10())
            .collect(),
    };
    let lo = transformed.iter().copied().fold(f64::INFINITY, f64::min);
    let hi = transformed.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let (lo, hi) = if transformed.is_empty() {
        (0.0, 1.0)
    } else if lo == hi {
        (lo - 0.5, hi + 0.5)
    } else {
        (lo, hi)
    };
    let width = (hi - lo) / bins as f64;
    let mut counts = vec![0usize; bins];
    for v in &transformed {
        let idx = (((v - lo) / width) as usize).min(bins - 1);
        counts[idx] += 1;
    }
    let edges = (0..=bins)
        .map(|i| {
            let edge = lo + width * i as f64;
            match scale {
                Scale::Linear => edge,
                Scale::Log => 10f64.powf(edge),
            }
        })
        .collect();
    Ok((edges, counts))
}

fn histogram_panel(
    title: String,
    channel: &str,
    values: &[f64],
    bins: usize,
    scale: Scale,
    markers: Vec<f64>,
) -> Result<HistogramPanel, ViewError> {
    let (edges, counts) = histogram(values, bins, scale)?;
    Ok(HistogramPanel {
        title,
        channel: channel.to_string(),
        edges,
        counts,
        markers,
    })
}

fn select(experiment: &Experiment, subset: Option<&str>) -> Result<Experiment, ViewError> {
    match subset {
        Some(source) => Ok(Subset::parse(source)?.select(experiment)?),
        None => Ok(experiment.clone()),
    }
}

fn wrong_operation(view: &str, op: Option<&Operation>) -> ViewError {
    ViewError::Invalid(format!(
        "{view} can't plot a {} operation",
        op.map(|o| o.kind()).unwrap_or("missing")
    ))
}

impl View {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Histogram(_) => "histogram",
            Self::ThresholdSelection(_) => "threshold_selection",
            Self::AutofluorescenceDiagnostic(_) => "autofluorescence_diagnostic",
            Self::ColorTranslationDiagnostic(_) => "color_translation_diagnostic",
            Self::KMeansScatter(_) => "kmeans_scatter",
        }
    }

    /// Diagnostic views plot the input of their operation rather than the
    /// item's own result.
    pub fn reads_predecessor(&self) -> bool {
        !matches!(self, Self::Histogram(_))
    }

    pub fn render(
        &self,
        experiment: &Experiment,
        operation: Option<&Operation>,
        params: &AnalysisParameters,
    ) -> Result<Plot, ViewError> {
        match self {
            Self::Histogram(view) => {
                let data = select(experiment, view.subset.as_deref())?;
                let values = data.channel_values(&view.channel)?;
                let panel = histogram_panel(
                    view.channel.clone(),
                    &view.channel,
                    values,
                    view.bins,
                    view.scale,
                    vec![],
                )?;
                Ok(Plot::Histograms(vec![panel]))
            }
            Self::ThresholdSelection(view) => {
                let Some(Operation::Threshold(op)) = operation else {
                    return Err(wrong_operation("Threshold selection", operation));
                };
                let values = experiment.channel_values(&op.channel)?;
                let panel = histogram_panel(
                    op.name.clone(),
                    &op.channel,
                    values,
                    view.bins,
                    view.scale,
                    vec![op.threshold],
                )?;
                Ok(Plot::Histograms(vec![panel]))
            }
            Self::AutofluorescenceDiagnostic(view) => {
                let Some(Operation::Autofluorescence(op)) = operation else {
                    return Err(wrong_operation("Autofluorescence diagnostic", operation));
                };
                if op.af_median.is_empty() {
                    return Err(OpError::not_estimated(
                        "Autofluorescence estimates aren't set. Did you forget to run estimate()?",
                    )
                    .into());
                }
                let mut ctx = OpContext::new(params);
                let blank = op.blank_experiment(experiment, &mut ctx)?;
                let panels = op
                    .channels
                    .iter()
                    .map(|channel| -> Result<HistogramPanel, ViewError> {
                        let markers = op.af_median.get(channel).copied().into_iter().collect();
                        histogram_panel(
                            channel.clone(),
                            channel,
                            blank.channel_values(channel)?,
                            view.bins,
                            Scale::Linear,
                            markers,
                        )
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Plot::Histograms(panels))
            }
            Self::ColorTranslationDiagnostic(view) => {
                let Some(Operation::ColorTranslation(op)) = operation else {
                    return Err(wrong_operation("Color translation diagnostic", operation));
                };
                let points = view.line_points.unwrap_or(100).max(2);
                let mut panels = vec![];
                for ((from, to), pair) in op.fit_all(experiment, params)? {
                    let lo = pair.from.iter().copied().fold(f64::INFINITY, f64::min).log10();
                    let hi = pair.from.iter().copied().fold(f64::NEG_INFINITY, f64::max).log10();
                    let line = (0..points)
                        .map(|i| {
                            let lx = lo + (hi - lo) * i as f64 / (points - 1) as f64;
                            (10f64.powf(lx), 10f64.powf(pair.fit.eval(lx)))
                        })
                        .collect();
                    let markers = pair
                        .mixture
                        .as_ref()
                        .map(|m| m.means.iter().map(|mean| 10f64.powf(*mean)).collect())
                        .unwrap_or_default();
                    panels.push(ScatterPanel {
                        title: format!("{from} --> {to}"),
                        x_channel: from,
                        y_channel: to,
                        x: pair.from,
                        y: pair.to,
                        groups: None,
                        line,
                        markers,
                    });
                }
                Ok(Plot::Scatters(panels))
            }
            Self::KMeansScatter(view) => {
                let Some(Operation::KMeans(op)) = operation else {
                    return Err(wrong_operation("K-means scatter", operation));
                };
                let mut ctx = OpContext::new(params);
                let labels = op.labels(experiment, &mut ctx)?;
                let (x, y, groups) = match view.subset.as_deref() {
                    Some(source) => {
                        let mask = Subset::parse(source)?.mask(experiment)?;
                        let keep = |values: &[f64]| -> Vec<f64> {
                            values
                                .iter()
                                .zip(&mask)
                                .filter(|(_, m)| **m)
                                .map(|(v, _)| *v)
                                .collect()
                        };
                        let groups = labels
                            .iter()
                            .zip(&mask)
                            .filter(|(_, m)| **m)
                            .map(|(l, _)| *l)
                            .collect();
                        (
                            keep(experiment.channel_values(&op.xchannel)?),
                            keep(experiment.channel_values(&op.ychannel)?),
                            groups,
                        )
                    }
                    None => (
                        experiment.channel_values(&op.xchannel)?.to_vec(),
                        experiment.channel_values(&op.ychannel)?.to_vec(),
                        labels,
                    ),
                };
                Ok(Plot::Scatters(vec![ScatterPanel {
                    title: op.name.clone(),
                    x_channel: op.xchannel.clone(),
                    y_channel: op.ychannel.clone(),
                    x,
                    y,
                    groups: Some(groups),
                    line: vec![],
                    markers: vec![],
                }]))
            }
        }
    }
}
