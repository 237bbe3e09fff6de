//! Translate one fluorescence channel onto the scale of another.
//!
//! A two-color control expressing both fluorophores is corrected for
//! autofluorescence and bleedthrough the same way the experiment was, then a
//! line is fit to `log10(to)` against `log10(from)`. Applying the fit maps
//! `from` values as `10^intercept * x^slope`.

use super::OpContext;
use crate::{
    config::AnalysisParameters,
    error::OpError,
    experiment::Experiment,
    metadata::ChannelTranslation,
    stats::{self, GaussianMixture, LineFit},
    subset::Subset,
    tube::Tube,
};
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, hash_map::Entry},
    path::PathBuf,
};

#[serde_as]
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ColorTranslationOp {
    pub name: String,
    /// `from` channel to `to` channel.
    pub translation: BTreeMap<String, String>,
    #[serde_as(as = "Vec<(_, _)>")]
    #[serde(default)]
    pub controls: BTreeMap<(String, String), PathBuf>,
    /// Weight the fit by membership in the brighter of two populations.
    #[serde(default)]
    pub mixture_model: bool,
    #[serde_as(as = "Vec<(_, _)>")]
    #[serde(default)]
    pub coefficients: BTreeMap<(String, String), LineFit>,
}

/// Corrected control events, keyed by channel.
pub type ControlData = HashMap<String, Vec<f64>>;

/// The events of one control a pair is fit on, and the fit itself.
#[derive(Debug, Clone)]
pub struct PairFit {
    pub from: Vec<f64>,
    pub to: Vec<f64>,
    pub fit: LineFit,
    pub mixture: Option<GaussianMixture>,
}

fn keep_rows(data: &mut ControlData, mask: &[bool]) {
    for values in data.values_mut() {
        *values = values
            .iter()
            .zip(mask)
            .filter(|(_, keep)| **keep)
            .map(|(v, _)| *v)
            .collect();
    }
}

/// Loads a control tube and applies the autofluorescence and bleedthrough
/// corrections recorded in `experiment`'s channel metadata.
pub fn load_control(
    path: &std::path::Path,
    experiment: &Experiment,
    params: &AnalysisParameters,
) -> Result<ControlData, OpError> {
    let tube = Tube::load(path)?;
    tube.check_against(experiment)?;
    let mut data: ControlData = experiment
        .channels()
        .iter()
        .filter_map(|c| tube.channel(c).map(|v| (c.clone(), v.to_vec())))
        .collect();

    for channel in experiment.channels() {
        let Some(baseline) = experiment.metadata(channel).and_then(|m| m.baseline) else {
            continue;
        };
        let cutoff = -params.autofluorescence_outlier_sigma * baseline.stdev;
        let mask: Vec<bool> = match data.get_mut(channel) {
            Some(values) => {
                values.iter_mut().for_each(|v| *v -= baseline.median);
                values.iter().map(|v| *v > cutoff).collect()
            }
            None => continue,
        };
        keep_rows(&mut data, &mask);
    }

    let raw = data.clone();
    for channel in experiment.channels() {
        let Some(model) = experiment
            .metadata(channel)
            .and_then(|m| m.bleedthrough.as_ref())
        else {
            continue;
        };
        let own = raw.get(channel).ok_or_else(|| {
            OpError::internal(format!("Control data lost channel '{channel}'"))
        })?;
        let contributors = model
            .channels()
            .map(|c| {
                raw.get(c).ok_or_else(|| {
                    OpError::not_found(format!(
                        "Bleedthrough into '{channel}' depends on unknown channel '{c}'"
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let corrected = own
            .iter()
            .enumerate()
            .map(|(row, v)| {
                let inputs: Vec<f64> = contributors.iter().map(|c| c[row]).collect();
                model.correct(*v, &inputs)
            })
            .collect();
        data.insert(channel.clone(), corrected);
    }
    Ok(data)
}

impl ColorTranslationOp {
    fn check_translation(&self, experiment: &Experiment) -> Result<(), OpError> {
        if self.translation.is_empty() {
            return Err(OpError::invalid("No translation specified"));
        }
        for (from, to) in &self.translation {
            for channel in [from, to] {
                if !experiment.has_channel(channel) {
                    return Err(OpError::not_found(format!(
                        "Channel '{channel}' isn't in the experiment"
                    )));
                }
            }
        }
        Ok(())
    }

    fn control_path(&self, from: &str, to: &str) -> Result<&PathBuf, OpError> {
        self.controls
            .get(&(from.to_string(), to.to_string()))
            .ok_or_else(|| {
                OpError::invalid(format!("Control file for {from} --> {to} not specified"))
            })
    }

    /// Fits one pair on already-corrected control data.
    pub fn fit_pair(
        &self,
        from: &str,
        to: &str,
        data: &ControlData,
        params: &AnalysisParameters,
    ) -> Result<PairFit, OpError> {
        let (Some(from_values), Some(to_values)) = (data.get(from), data.get(to)) else {
            return Err(OpError::not_found(format!(
                "Control for {from} --> {to} is missing a channel"
            )));
        };
        let (from_values, to_values): (Vec<f64>, Vec<f64>) = from_values
            .iter()
            .zip(to_values)
            .filter(|(x, y)| **x > 0.0 && **y > 0.0)
            .map(|(x, y)| (*x, *y))
            .unzip();
        if from_values.len() < 2 {
            return Err(OpError::invalid(format!(
                "Control for {from} --> {to} has too few events with positive values in both channels"
            )));
        }
        let log_from: Vec<f64> = from_values.iter().map(|v| v.log10()).collect();
        let log_to: Vec<f64> = to_values.iter().map(|v| v.log10()).collect();

        let (fit, mixture) = if self.mixture_model {
            let gmm = GaussianMixture::fit(
                &log_from,
                params.mixture_max_iterations,
                params.mixture_tolerance,
            )?;
            let upper = gmm.upper_component();
            let weights: Vec<f64> = gmm
                .predict_proba(&log_from)
                .iter()
                .map(|p| p[upper])
                .collect();
            (stats::fit_line(&log_from, &log_to, Some(&weights))?, Some(gmm))
        } else {
            (stats::fit_line(&log_from, &log_to, None)?, None)
        };
        Ok(PairFit {
            from: from_values,
            to: to_values,
            fit,
            mixture,
        })
    }

    /// Loads, corrects and fits every configured pair, reading each control
    /// file once.
    pub fn fit_all(
        &self,
        experiment: &Experiment,
        params: &AnalysisParameters,
    ) -> Result<Vec<((String, String), PairFit)>, OpError> {
        let mut tubes: HashMap<&PathBuf, ControlData> = HashMap::new();
        let mut fits = Vec::with_capacity(self.translation.len());
        for (from, to) in &self.translation {
            let path = self.control_path(from, to)?;
            let data = match tubes.entry(path) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => entry.insert(load_control(path, experiment, params)?),
            };
            let pair = self.fit_pair(from, to, data, params)?;
            fits.push(((from.clone(), to.clone()), pair));
        }
        Ok(fits)
    }

    pub fn estimate(
        &mut self,
        experiment: &Experiment,
        _subset: Option<&Subset>,
        ctx: &mut OpContext,
    ) -> Result<(), OpError> {
        self.check_translation(experiment)?;
        let fits = self.fit_all(experiment, ctx.params)?;
        let mut coefficients = BTreeMap::new();
        for ((from, to), pair) in fits {
            if let Some(why) = pair.mixture.as_ref().and_then(|m| m.degeneracy()) {
                ctx.warn(format!("{from} --> {to}: {why}"));
            }
            tracing::debug!(
                from = %from,
                to = %to,
                slope = pair.fit.slope,
                intercept = pair.fit.intercept,
                "color translation fit"
            );
            coefficients.insert((from, to), pair.fit);
        }
        self.coefficients = coefficients;
        Ok(())
    }

    fn check_estimates(&self) -> Result<(), OpError> {
        for (from, to) in &self.translation {
            if !self.coefficients.contains_key(&(from.clone(), to.clone())) {
                return Err(OpError::not_estimated(format!(
                    "Color translation coefficients aren't set for {from} --> {to}. Did you forget to run estimate()?"
                )));
            }
        }
        let configured: BTreeSet<(&String, &String)> = self.translation.iter().collect();
        let estimated: BTreeSet<(&String, &String)> =
            self.coefficients.keys().map(|(f, t)| (f, t)).collect();
        if configured != estimated {
            return Err(OpError::not_estimated(
                "Estimated channel pairs differ from the translation parameter. Did you forget to (re)run estimate()?",
            ));
        }
        Ok(())
    }

    pub fn is_valid(&self, experiment: &Experiment) -> bool {
        !self.name.trim().is_empty()
            && self.check_translation(experiment).is_ok()
            && self.check_estimates().is_ok()
    }

    pub fn apply(&self, experiment: &Experiment) -> Result<Experiment, OpError> {
        self.check_translation(experiment)?;
        self.check_estimates()?;
        let mut out = experiment.clone();
        for ((from, to), fit) in &self.coefficients {
            let translation = ChannelTranslation {
                target: to.clone(),
                slope: fit.slope,
                intercept: fit.intercept,
            };
            let mapped = experiment
                .channel_values(from)?
                .iter()
                .map(|v| translation.map(*v))
                .collect();
            out.replace_channel(from, mapped)?;
            if let Some(meta) = out.metadata_mut(from) {
                meta.translation = Some(translation);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        metadata::{Baseline, BleedthroughModel, ChannelMetadata, PiecewiseLinear},
        tube::tests::write_tube_csv,
    };
    use rand::{Rng, SeedableRng, rngs::StdRng};

    fn experiment() -> Experiment {
        let mut ex = Experiment::new();
        ex.add_channel("FITC-A", vec![10.0, 100.0], ChannelMetadata::with_range(1e5))
            .unwrap();
        ex.add_channel("PE-A", vec![1.0, 2.0], ChannelMetadata::with_range(1e5))
            .unwrap();
        ex
    }

    fn op(control: &tempfile::NamedTempFile) -> ColorTranslationOp {
        let mut op = ColorTranslationOp {
            name: "Translate".to_string(),
            ..Default::default()
        };
        op.translation
            .insert("FITC-A".to_string(), "PE-A".to_string());
        op.controls.insert(
            ("FITC-A".to_string(), "PE-A".to_string()),
            control.path().to_path_buf(),
        );
        op
    }

    /// Control where `PE = 10^0.5 * FITC^0.8`, plus a few events that must
    /// be dropped for being non-positive.
    fn control() -> tempfile::NamedTempFile {
        let mut rng = StdRng::seed_from_u64(7);
        let mut rows = vec![vec![-5.0, 10.0], vec![20.0, 0.0]];
        for _ in 0..200 {
            let x: f64 = 10f64.powf(rng.gen_range(1.0..4.0));
            rows.push(vec![x, 10f64.powf(0.5) * x.powf(0.8)]);
        }
        write_tube_csv(&["FITC-A", "PE-A"], &rows)
    }

    #[test]
    fn test_estimate_recovers_known_mapping() {
        let ex = experiment();
        let file = control();
        let params = AnalysisParameters::default();
        let mut ctx = OpContext::new(&params);
        let mut translate = op(&file);
        translate.estimate(&ex, None, &mut ctx).unwrap();
        let fit = translate.coefficients[&("FITC-A".to_string(), "PE-A".to_string())];
        assert!((fit.slope - 0.8).abs() < 1e-9);
        assert!((fit.intercept - 0.5).abs() < 1e-9);

        let out = translate.apply(&ex).unwrap();
        let mapped = out.channel_values("FITC-A").unwrap();
        assert!((mapped[0] - 10f64.powf(0.5) * 10f64.powf(0.8)).abs() < 1e-6);
        assert_eq!(out.channel_values("PE-A").unwrap(), &[1.0, 2.0]);
        let meta = out.metadata("FITC-A").unwrap().translation.as_ref().unwrap();
        assert_eq!(meta.target, "PE-A");
        assert!((meta.map(100.0) - mapped[1]).abs() < 1e-9);
    }

    #[test]
    fn test_mixture_model_weights_toward_bright_population() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut rows = vec![];
        // dim population off the line, bright population on it
        for _ in 0..300 {
            let x = 10f64.powf(rng.gen_range(0.9..1.1));
            rows.push(vec![x, 10f64.powf(rng.gen_range(2.0..2.5))]);
        }
        for _ in 0..300 {
            let x: f64 = 10f64.powf(rng.gen_range(2.8..3.6));
            rows.push(vec![x, 10f64.powf(0.2) * x.powf(1.1)]);
        }
        let file = write_tube_csv(&["FITC-A", "PE-A"], &rows);
        let ex = experiment();
        let params = AnalysisParameters::default();
        let mut ctx = OpContext::new(&params);
        let mut translate = op(&file);
        translate.mixture_model = true;
        translate.estimate(&ex, None, &mut ctx).unwrap();
        let fit = translate.coefficients[&("FITC-A".to_string(), "PE-A".to_string())];
        assert!((fit.slope - 1.1).abs() < 0.01, "{fit:?}");
        assert!((fit.intercept - 0.2).abs() < 0.05, "{fit:?}");
    }

    #[test]
    fn test_control_preprocessing() {
        let mut ex = experiment();
        ex.metadata_mut("FITC-A").unwrap().baseline = Some(Baseline {
            median: 10.0,
            stdev: 2.0,
        });
        ex.metadata_mut("PE-A").unwrap().bleedthrough = Some(BleedthroughModel {
            contributions: vec![(
                "FITC-A".to_string(),
                PiecewiseLinear::new(vec![(0.0, 0.0), (1000.0, 100.0)]),
            )],
        });
        // FITC-A after subtraction: 90, -10 (dropped), 1000, -5
        let file = write_tube_csv(
            &["FITC-A", "PE-A"],
            &[
                vec![100.0, 50.0],
                vec![0.0, 50.0],
                vec![1010.0, 500.0],
                vec![5.0, 7.0],
            ],
        );
        let data = load_control(file.path(), &ex, &AnalysisParameters::default()).unwrap();
        assert_eq!(data["FITC-A"], vec![90.0, 1000.0, -5.0]);
        assert_eq!(data["PE-A"], vec![41.0, 400.0, 7.0]);
    }

    #[test]
    fn test_errors() {
        let ex = experiment();
        let file = control();
        let params = AnalysisParameters::default();
        let mut ctx = OpContext::new(&params);

        let mut no_control = op(&file);
        no_control.controls.clear();
        let err = no_control.estimate(&ex, None, &mut ctx).unwrap_err();
        assert!(err.message.contains("Control file for FITC-A --> PE-A"));

        let err = op(&file).apply(&ex).unwrap_err();
        assert!(err.message.contains("estimate()"));

        let dark = write_tube_csv(&["FITC-A", "PE-A"], &[vec![-1.0, 5.0], vec![3.0, 0.0]]);
        let err = op(&dark).estimate(&ex, None, &mut ctx).unwrap_err();
        assert!(err.message.contains("positive"));

        let mut missing = op(&file);
        missing
            .translation
            .insert("APC-A".to_string(), "PE-A".to_string());
        assert!(missing.estimate(&ex, None, &mut ctx).is_err());
        assert!(!missing.is_valid(&ex));
    }

    #[test]
    fn test_unconverged_mixture_warns_but_still_fits() {
        let ex = experiment();
        let file = control();
        let params = AnalysisParameters {
            mixture_max_iterations: 1,
            ..Default::default()
        };
        let mut ctx = OpContext::new(&params);
        let mut translate = op(&file);
        translate.mixture_model = true;
        translate.estimate(&ex, None, &mut ctx).unwrap();
        assert_eq!(ctx.warnings().len(), 1);
        assert!(ctx.warnings()[0].starts_with("FITC-A --> PE-A: "));
        assert!(ctx.warnings()[0].contains("did not converge"));
        assert!(translate.is_valid(&ex));
        assert!(translate.apply(&ex).is_ok());
    }
}
