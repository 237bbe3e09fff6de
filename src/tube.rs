//! Post-parse tabular view of a single instrument tube.
//!
//! Instrument files are decoded by an external parser; the engine only
//! needs named numeric columns. Tubes are read from CSV exports whose header
//! row carries the channel names.

use crate::{
    error::OpError,
    experiment::Experiment,
    metadata::ChannelMetadata,
};
use std::path::Path;

pub const SUPPORTED_TUBE_FORMATS: &[&str] = &["csv"];

#[derive(Debug, Clone, PartialEq)]
pub struct Tube {
    source: String,
    channels: Vec<String>,
    columns: Vec<Vec<f64>>,
}

impl Tube {
    pub fn from_columns(source: &str, columns: Vec<(String, Vec<f64>)>) -> Result<Self, OpError> {
        let len = columns.first().map(|(_, v)| v.len()).unwrap_or(0);
        let mut channels = Vec::with_capacity(columns.len());
        let mut data = Vec::with_capacity(columns.len());
        for (name, values) in columns {
            if values.len() != len {
                return Err(OpError::invalid(format!(
                    "Tube '{source}': channel '{name}' has {} events, expected {len}",
                    values.len()
                )));
            }
            if channels.contains(&name) {
                return Err(OpError::invalid(format!(
                    "Tube '{source}': duplicate channel '{name}'"
                )));
            }
            channels.push(name);
            data.push(values);
        }
        Ok(Self {
            source: source.to_string(),
            channels,
            columns: data,
        })
    }

    pub fn load(path: &Path) -> Result<Self, OpError> {
        let source = path.to_string_lossy().replace('\\', "/");
        let is_csv = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("csv"))
            .unwrap_or(false);
        if !is_csv {
            return Err(OpError::invalid(format!(
                "Tube '{source}' is not in a supported format ({}); export the events to CSV first",
                SUPPORTED_TUBE_FORMATS.join(", ")
            )));
        }
        let mut reader = csv::Reader::from_path(path)
            .map_err(|e| OpError::io(format!("Could not read tube '{source}': {e}")))?;
        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| OpError::io(format!("Could not read header of tube '{source}': {e}")))?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();
        let mut columns: Vec<Vec<f64>> = vec![vec![]; headers.len()];
        for (row, record) in reader.records().enumerate() {
            let record = record
                .map_err(|e| OpError::io(format!("Could not read tube '{source}': {e}")))?;
            for (idx, field) in record.iter().enumerate() {
                let value = field.trim().parse::<f64>().map_err(|e| {
                    OpError::invalid(format!(
                        "Tube '{source}', event {}: could not parse '{field}' as a number: {e}",
                        row + 1
                    ))
                })?;
                columns[idx].push(value);
            }
        }
        tracing::debug!(
            tube = %source,
            events = columns.first().map(Vec::len).unwrap_or(0),
            "loaded tube"
        );
        Self::from_columns(&source, headers.into_iter().zip(columns).collect())
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    pub fn channel(&self, name: &str) -> Option<&[f64]> {
        self.channels
            .iter()
            .position(|c| c == name)
            .map(|idx| self.columns[idx].as_slice())
    }

    pub fn len(&self) -> usize {
        self.columns.first().map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checks that this tube measured every channel of `experiment`.
    pub fn check_against(&self, experiment: &Experiment) -> Result<(), OpError> {
        let missing: Vec<&str> = experiment
            .channels()
            .iter()
            .filter(|c| self.channel(c).is_none())
            .map(|c| c.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(OpError::invalid(format!(
                "Tube '{}' is missing channel(s) {} found in the experiment",
                self.source,
                missing.join(", ")
            )));
        }
        Ok(())
    }

    /// An experiment over the channels of `like`, carrying only their
    /// ranges; used to run control samples through prior operations.
    pub fn to_experiment_like(&self, like: &Experiment) -> Result<Experiment, OpError> {
        self.check_against(like)?;
        let mut ex = Experiment::new();
        for channel in like.channels() {
            let values = self.channel(channel).map(<[f64]>::to_vec).unwrap_or_default();
            let metadata = ChannelMetadata {
                range: like.metadata(channel).and_then(|m| m.range),
                ..ChannelMetadata::default()
            };
            ex.add_channel(channel, values, metadata)?;
        }
        Ok(ex)
    }

}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    pub(crate) fn write_tube_csv(header: &[&str], rows: &[Vec<f64>]) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        writeln!(file, "{}", header.join(",")).unwrap();
        for row in rows {
            let line: Vec<String> = row.iter().map(|v| v.to_string()).collect();
            writeln!(file, "{}", line.join(",")).unwrap();
        }
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_load_csv_tube() {
        let file = write_tube_csv(&["FSC-A", "FITC-A"], &[vec![1.0, 5.0], vec![2.0, -3.5]]);
        let tube = Tube::load(file.path()).unwrap();
        assert_eq!(tube.channels(), &["FSC-A".to_string(), "FITC-A".to_string()]);
        assert_eq!(tube.channel("FITC-A").unwrap(), &[5.0, -3.5]);
        assert_eq!(tube.len(), 2);
    }

    #[test]
    fn test_load_rejects_unparseable_values_and_formats() {
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        writeln!(file, "FSC-A\n1.0\nabc").unwrap();
        let err = Tube::load(file.path()).unwrap_err();
        assert!(err.message.contains("event 2"));

        let err = Tube::load(Path::new("blank.fcs")).unwrap_err();
        assert!(err.message.contains("supported format"));

        let err = Tube::load(Path::new("/nonexistent/blank.csv")).unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::Io);
    }

    #[test]
    fn test_to_experiment_like_follows_experiment_channels() {
        let tube = Tube::from_columns(
            "blank",
            vec![
                ("SSC-A".to_string(), vec![1.0]),
                ("FITC-A".to_string(), vec![2.0]),
                ("PE-A".to_string(), vec![3.0]),
            ],
        )
        .unwrap();
        let mut like = Experiment::new();
        like.add_channel("PE-A", vec![9.0], ChannelMetadata::with_range(100.0))
            .unwrap();
        like.add_channel("FITC-A", vec![9.0], ChannelMetadata::default())
            .unwrap();
        let ex = tube.to_experiment_like(&like).unwrap();
        assert_eq!(ex.channels(), like.channels());
        assert_eq!(ex.metadata("PE-A").unwrap().range, Some(100.0));

        like.add_channel("APC-A", vec![1.0], ChannelMetadata::default())
            .unwrap();
        assert!(tube.to_experiment_like(&like).is_err());
    }
}
