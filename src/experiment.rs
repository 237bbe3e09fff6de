//! The experiment table: measured channels, per-row conditions, per-channel
//! metadata and the history of operations that produced it.
//!
//! Columns are reference counted, so `clone()` is cheap and an operation
//! that replaces one column leaves every other holder of the original
//! experiment untouched.

use crate::{
    error::OpError,
    metadata::ChannelMetadata,
    operations::Operation,
    subset::Subset,
    tube::Tube,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionKind {
    Float,
    Int,
    Bool,
    Category,
}

impl fmt::Display for ConditionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Float => "float",
            Self::Int => "int",
            Self::Bool => "bool",
            Self::Category => "category",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Category(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub name: String,
    pub kind: ConditionKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    Float(Vec<f64>),
    Int(Vec<i64>),
    Bool(Vec<bool>),
    Category(Vec<String>),
}

impl Column {
    pub fn empty(kind: ConditionKind) -> Self {
        match kind {
            ConditionKind::Float => Self::Float(vec![]),
            ConditionKind::Int => Self::Int(vec![]),
            ConditionKind::Bool => Self::Bool(vec![]),
            ConditionKind::Category => Self::Category(vec![]),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Float(v) => v.len(),
            Self::Int(v) => v.len(),
            Self::Bool(v) => v.len(),
            Self::Category(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kind(&self) -> ConditionKind {
        match self {
            Self::Float(_) => ConditionKind::Float,
            Self::Int(_) => ConditionKind::Int,
            Self::Bool(_) => ConditionKind::Bool,
            Self::Category(_) => ConditionKind::Category,
        }
    }

    pub fn as_float(&self) -> Option<&[f64]> {
        match self {
            Self::Float(v) => Some(v),
            _ => None,
        }
    }

    pub fn value(&self, row: usize) -> Option<ConditionValue> {
        match self {
            Self::Float(v) => v.get(row).map(|&x| ConditionValue::Float(x)),
            Self::Int(v) => v.get(row).map(|&x| ConditionValue::Int(x)),
            Self::Bool(v) => v.get(row).map(|&x| ConditionValue::Bool(x)),
            Self::Category(v) => v.get(row).map(|x| ConditionValue::Category(x.clone())),
        }
    }

    /// Text form used when exporting tables.
    pub fn display_value(&self, row: usize) -> String {
        match self.value(row) {
            Some(ConditionValue::Float(x)) => x.to_string(),
            Some(ConditionValue::Int(x)) => x.to_string(),
            Some(ConditionValue::Bool(x)) => x.to_string(),
            Some(ConditionValue::Category(x)) => x,
            None => String::new(),
        }
    }

    pub fn filter(&self, mask: &[bool]) -> Self {
        fn keep<T: Clone>(values: &[T], mask: &[bool]) -> Vec<T> {
            values
                .iter()
                .zip(mask)
                .filter(|(_, keep)| **keep)
                .map(|(v, _)| v.clone())
                .collect()
        }
        match self {
            Self::Float(v) => Self::Float(keep(v, mask)),
            Self::Int(v) => Self::Int(keep(v, mask)),
            Self::Bool(v) => Self::Bool(keep(v, mask)),
            Self::Category(v) => Self::Category(keep(v, mask)),
        }
    }

    fn push_repeated(&mut self, value: &ConditionValue, count: usize) -> Result<(), String> {
        match (self, value) {
            (Self::Float(v), ConditionValue::Float(x)) => v.extend(std::iter::repeat_n(*x, count)),
            (Self::Float(v), ConditionValue::Int(x)) => {
                v.extend(std::iter::repeat_n(*x as f64, count))
            }
            (Self::Int(v), ConditionValue::Int(x)) => v.extend(std::iter::repeat_n(*x, count)),
            (Self::Bool(v), ConditionValue::Bool(x)) => v.extend(std::iter::repeat_n(*x, count)),
            (Self::Category(v), ConditionValue::Category(x)) => {
                v.extend(std::iter::repeat_n(x.clone(), count))
            }
            (Self::Category(v), other) => {
                let text = match other {
                    ConditionValue::Bool(x) => x.to_string(),
                    ConditionValue::Int(x) => x.to_string(),
                    ConditionValue::Float(x) => x.to_string(),
                    ConditionValue::Category(x) => x.clone(),
                };
                v.extend(std::iter::repeat_n(text, count))
            }
            (column, value) => {
                return Err(format!(
                    "value {value:?} does not fit a {} condition",
                    column.kind()
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Experiment {
    channels: Vec<String>,
    metadata: BTreeMap<String, ChannelMetadata>,
    conditions: Vec<Condition>,
    columns: HashMap<String, Arc<Column>>,
    rows: usize,
    history: Vec<Operation>,
}

impl Experiment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn condition(&self, name: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.name == name)
    }

    pub fn has_channel(&self, name: &str) -> bool {
        self.channels.iter().any(|c| c == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.get(name).map(|c| c.as_ref())
    }

    /// Channels first, then conditions, in insertion order.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.channels
            .iter()
            .map(|c| c.as_str())
            .chain(self.conditions.iter().map(|c| c.name.as_str()))
    }

    pub fn channel_values(&self, name: &str) -> Result<&[f64], OpError> {
        if !self.has_channel(name) {
            return Err(OpError::not_found(format!(
                "Channel '{name}' isn't in the experiment"
            )));
        }
        self.columns
            .get(name)
            .and_then(|c| c.as_float())
            .ok_or_else(|| OpError::internal(format!("Channel '{name}' has no float data")))
    }

    pub fn metadata(&self, channel: &str) -> Option<&ChannelMetadata> {
        self.metadata.get(channel)
    }

    pub fn metadata_mut(&mut self, channel: &str) -> Option<&mut ChannelMetadata> {
        self.metadata.get_mut(channel)
    }

    pub fn history(&self) -> &[Operation] {
        &self.history
    }

    pub fn push_history(&mut self, op: Operation) {
        self.history.push(op);
    }

    fn check_new_column(&self, name: &str, len: usize) -> Result<(), OpError> {
        if name.trim().is_empty() {
            return Err(OpError::invalid("Column names must not be empty"));
        }
        if self.has_column(name) {
            return Err(OpError::invalid(format!(
                "Experiment already has a column named '{name}'"
            )));
        }
        if !self.columns.is_empty() && len != self.rows {
            return Err(OpError::invalid(format!(
                "Column '{name}' has {len} values but the experiment has {} events",
                self.rows
            )));
        }
        Ok(())
    }

    pub fn add_channel(
        &mut self,
        name: &str,
        values: Vec<f64>,
        metadata: ChannelMetadata,
    ) -> Result<(), OpError> {
        self.check_new_column(name, values.len())?;
        self.rows = values.len();
        self.channels.push(name.to_string());
        self.metadata.insert(name.to_string(), metadata);
        self.columns
            .insert(name.to_string(), Arc::new(Column::Float(values)));
        Ok(())
    }

    pub fn add_condition(&mut self, name: &str, column: Column) -> Result<(), OpError> {
        self.check_new_column(name, column.len())?;
        self.rows = column.len();
        self.conditions.push(Condition {
            name: name.to_string(),
            kind: column.kind(),
        });
        self.columns.insert(name.to_string(), Arc::new(column));
        Ok(())
    }

    /// Declares conditions before any events have been added.
    pub fn add_conditions(
        &mut self,
        conditions: &BTreeMap<String, ConditionKind>,
    ) -> Result<(), OpError> {
        if !self.is_empty() {
            return Err(OpError::invalid(
                "Conditions must be declared before events are added",
            ));
        }
        for (name, kind) in conditions {
            self.add_condition(name, Column::empty(*kind))?;
        }
        Ok(())
    }

    /// Appends the events of `tube`, tagging every one with `values`.
    ///
    /// The first tube defines the channel set; later tubes must match it.
    pub fn add_tube(
        &mut self,
        tube: &Tube,
        values: &BTreeMap<String, ConditionValue>,
    ) -> Result<(), OpError> {
        for name in values.keys() {
            if self.condition(name).is_none() {
                return Err(OpError::invalid(format!(
                    "Tube '{}' sets undeclared condition '{name}'",
                    tube.source()
                )));
            }
        }
        if self.channels.is_empty() {
            for channel in tube.channels() {
                if self.has_column(channel) {
                    return Err(OpError::invalid(format!(
                        "Channel '{channel}' collides with a condition name"
                    )));
                }
                self.channels.push(channel.clone());
                self.metadata
                    .insert(channel.clone(), ChannelMetadata::default());
                self.columns
                    .insert(channel.clone(), Arc::new(Column::Float(vec![])));
            }
        } else {
            let mut ours = self.channels.clone();
            let mut theirs = tube.channels().to_vec();
            ours.sort();
            theirs.sort();
            if ours != theirs {
                return Err(OpError::invalid(format!(
                    "Tube '{}' doesn't have the same channels as the experiment",
                    tube.source()
                )));
            }
        }

        let count = tube.len();
        for condition in &self.conditions {
            let value = values.get(&condition.name).ok_or_else(|| {
                OpError::invalid(format!(
                    "Tube '{}' has no value for condition '{}'",
                    tube.source(),
                    condition.name
                ))
            })?;
            let column = self
                .columns
                .get_mut(&condition.name)
                .ok_or_else(|| OpError::internal("condition without column"))?;
            Arc::make_mut(column)
                .push_repeated(value, count)
                .map_err(|e| OpError::invalid(format!("Condition '{}': {e}", condition.name)))?;
        }
        for channel in &self.channels {
            let data = tube.channel(channel).ok_or_else(|| {
                OpError::invalid(format!(
                    "Tube '{}' has no channel '{channel}'",
                    tube.source()
                ))
            })?;
            let column = self
                .columns
                .get_mut(channel)
                .ok_or_else(|| OpError::internal("channel without column"))?;
            match Arc::make_mut(column) {
                Column::Float(v) => v.extend_from_slice(data),
                _ => return Err(OpError::internal("channel column is not float")),
            }
        }
        self.rows += count;
        Ok(())
    }

    pub fn replace_channel(&mut self, name: &str, values: Vec<f64>) -> Result<(), OpError> {
        if !self.has_channel(name) {
            return Err(OpError::not_found(format!(
                "Channel '{name}' isn't in the experiment"
            )));
        }
        if values.len() != self.rows {
            return Err(OpError::internal(format!(
                "Replacement for '{name}' has {} values, expected {}",
                values.len(),
                self.rows
            )));
        }
        self.columns
            .insert(name.to_string(), Arc::new(Column::Float(values)));
        Ok(())
    }

    /// A copy keeping only rows where `mask` is true.
    pub fn filter(&self, mask: &[bool]) -> Self {
        let columns = self
            .columns
            .iter()
            .map(|(name, column)| (name.clone(), Arc::new(column.filter(mask))))
            .collect();
        Self {
            channels: self.channels.clone(),
            metadata: self.metadata.clone(),
            conditions: self.conditions.clone(),
            columns,
            rows: mask.iter().take(self.rows).filter(|m| **m).count(),
            history: self.history.clone(),
        }
    }

    pub fn query(&self, subset: &Subset) -> Result<Self, OpError> {
        let mask = subset.mask(self)?;
        Ok(self.filter(&mask))
    }

    /// Writes the table with a header row, channels before conditions.
    pub fn write_csv<W: std::io::Write>(&self, writer: W) -> Result<(), csv::Error> {
        let mut out = csv::Writer::from_writer(writer);
        let names: Vec<&str> = self.column_names().collect();
        out.write_record(&names)?;
        for row in 0..self.rows {
            out.write_record(names.iter().map(|name| {
                self.columns
                    .get(*name)
                    .map(|column| column.display_value(row))
                    .unwrap_or_default()
            }))?;
        }
        out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn small_experiment() -> Experiment {
        let mut ex = Experiment::new();
        ex.add_channel(
            "FITC-A",
            vec![1.0, 2.0, 3.0, 4.0],
            ChannelMetadata::with_range(1024.0),
        )
        .unwrap();
        ex.add_channel(
            "PE-A",
            vec![10.0, 20.0, 30.0, 40.0],
            ChannelMetadata::with_range(1024.0),
        )
        .unwrap();
        ex.add_condition("Dox", Column::Float(vec![0.0, 0.0, 10.0, 10.0]))
            .unwrap();
        ex
    }

    #[test]
    fn test_clone_shares_until_replaced() {
        let ex = small_experiment();
        let mut copy = ex.clone();
        copy.replace_channel("FITC-A", vec![0.0; 4]).unwrap();
        assert_eq!(ex.channel_values("FITC-A").unwrap(), &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(copy.channel_values("FITC-A").unwrap(), &[0.0; 4]);
        assert_eq!(copy.channel_values("PE-A").unwrap(), ex.channel_values("PE-A").unwrap());
    }

    #[test]
    fn test_column_length_must_match() {
        let mut ex = small_experiment();
        let err = ex
            .add_channel("APC-A", vec![1.0], ChannelMetadata::default())
            .unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::InvalidInput);
        assert!(ex.add_condition("Dox", Column::Bool(vec![true; 4])).is_err());
    }

    #[test]
    fn test_add_tubes_with_conditions() {
        let mut ex = Experiment::new();
        let mut kinds = BTreeMap::new();
        kinds.insert("Dox".to_string(), ConditionKind::Float);
        kinds.insert("Well".to_string(), ConditionKind::Category);
        ex.add_conditions(&kinds).unwrap();

        let tube_a = Tube::from_columns("a", vec![("FSC-A".to_string(), vec![1.0, 2.0])]).unwrap();
        let tube_b = Tube::from_columns("b", vec![("FSC-A".to_string(), vec![3.0])]).unwrap();
        let mut values = BTreeMap::new();
        values.insert("Dox".to_string(), ConditionValue::Int(1));
        values.insert("Well".to_string(), ConditionValue::Category("A3".to_string()));
        ex.add_tube(&tube_a, &values).unwrap();
        values.insert("Dox".to_string(), ConditionValue::Float(10.0));
        values.insert("Well".to_string(), ConditionValue::Category("A4".to_string()));
        ex.add_tube(&tube_b, &values).unwrap();

        assert_eq!(ex.len(), 3);
        assert_eq!(ex.channel_values("FSC-A").unwrap(), &[1.0, 2.0, 3.0]);
        assert_eq!(
            ex.column("Dox"),
            Some(&Column::Float(vec![1.0, 1.0, 10.0]))
        );
        assert_eq!(ex.column("Well").unwrap().display_value(2), "A4");
        assert!(ex.add_conditions(&BTreeMap::new()).is_err());
    }

    #[test]
    fn test_add_tube_rejects_missing_condition_and_channel_mismatch() {
        let mut ex = Experiment::new();
        let mut kinds = BTreeMap::new();
        kinds.insert("Dox".to_string(), ConditionKind::Float);
        ex.add_conditions(&kinds).unwrap();
        let tube = Tube::from_columns("a", vec![("FSC-A".to_string(), vec![1.0])]).unwrap();
        assert!(ex.add_tube(&tube, &BTreeMap::new()).is_err());

        let mut values = BTreeMap::new();
        values.insert("Dox".to_string(), ConditionValue::Float(1.0));
        ex.add_tube(&tube, &values).unwrap();
        let other = Tube::from_columns("b", vec![("SSC-A".to_string(), vec![1.0])]).unwrap();
        assert!(ex.add_tube(&other, &values).is_err());
    }

    #[test]
    fn test_write_csv() {
        let ex = small_experiment().filter(&[true, false, false, true]);
        let mut buffer = vec![];
        ex.write_csv(&mut buffer).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert_eq!(text, "FITC-A,PE-A,Dox\n1,10,0\n4,40,10\n");
    }

    #[test]
    fn test_filter_keeps_masked_rows() {
        let ex = small_experiment();
        let filtered = ex.filter(&[false, true, false, true]);
        assert_eq!(filtered.len(), 2);
        assert_eq!(filtered.channel_values("PE-A").unwrap(), &[20.0, 40.0]);
        assert_eq!(filtered.column_names().count(), 3);
    }
}
