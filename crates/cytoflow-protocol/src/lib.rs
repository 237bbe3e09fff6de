//! Machine-readable contracts shared by the cytoflow engine and its front ends.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const WORKFLOW_SCHEMA: &str = "cytoflow.workflow.v1";
pub const SUMMARY_SCHEMA: &str = "cytoflow.workflow_summary.v1";

/// Evaluation state of one workflow item.
///
/// The first variant is the state of a freshly inserted or freshly loaded item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    #[default]
    Invalid,
    Estimating,
    Applying,
    Valid,
}

impl ItemStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Invalid => "invalid",
            Self::Estimating => "estimating",
            Self::Applying => "applying",
            Self::Valid => "valid",
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemSummary {
    pub index: usize,
    pub name: String,
    pub kind: String,
    pub status: ItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    pub channels: Vec<String>,
    pub conditions: Vec<String>,
    pub events: usize,
    pub history_len: usize,
    pub operation: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub schema: String,
    pub item_count: usize,
    pub valid_count: usize,
    pub items: Vec<ItemSummary>,
}

impl WorkflowSummary {
    pub fn new(items: Vec<ItemSummary>) -> Self {
        let valid_count = items
            .iter()
            .filter(|item| item.status == ItemStatus::Valid)
            .count();
        Self {
            schema: SUMMARY_SCHEMA.to_string(),
            item_count: items.len(),
            valid_count,
            items,
        }
    }

    pub fn is_fully_valid(&self) -> bool {
        self.valid_count == self.item_count
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub protocol_version: String,
    pub workflow_schema: String,
    pub supported_operations: Vec<String>,
    pub supported_views: Vec<String>,
    pub supported_tube_formats: Vec<String>,
}
