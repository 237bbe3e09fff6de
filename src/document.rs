//! Saved workflows: operations, views, subsets and parameters as JSON.
//!
//! Results are never stored; a loaded workflow starts with every item
//! invalid until it is evaluated.

use crate::{
    config::AnalysisParameters,
    error::CytoflowError,
    operations::Operation,
    views::View,
    workflow::{Workflow, WorkflowItem},
};
use cytoflow_protocol::WORKFLOW_SCHEMA;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemDocument {
    pub operation: Operation,
    #[serde(default)]
    pub views: Vec<View>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_view: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimate_subset: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDocument {
    #[serde(default = "default_schema")]
    pub schema: String,
    #[serde(default)]
    pub parameters: AnalysisParameters,
    pub items: Vec<ItemDocument>,
}

fn default_schema() -> String {
    WORKFLOW_SCHEMA.to_string()
}

fn display_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

impl WorkflowDocument {
    pub fn validate(&self) -> Result<(), CytoflowError> {
        if self.schema != WORKFLOW_SCHEMA {
            return Err(CytoflowError::Document(format!(
                "Unsupported schema '{}'; expected '{WORKFLOW_SCHEMA}'",
                self.schema
            )));
        }
        if self.items.is_empty() {
            return Err(CytoflowError::Document("Workflow has no items".to_string()));
        }
        for (index, item) in self.items.iter().enumerate() {
            if let Some(view) = item.current_view.filter(|v| *v >= item.views.len()) {
                return Err(CytoflowError::Document(format!(
                    "Item {index} selects view {view} but has {} view(s)",
                    item.views.len()
                )));
            }
            if item
                .estimate_subset
                .as_deref()
                .is_some_and(|s| s.trim().is_empty())
            {
                return Err(CytoflowError::Document(format!(
                    "Item {index} has a blank estimate subset"
                )));
            }
        }
        self.parameters.validate()?;
        Ok(())
    }

    /// Builds an unevaluated workflow from this document.
    pub fn into_workflow(self) -> Result<Workflow, CytoflowError> {
        self.validate()?;
        let mut workflow = Workflow::new(self.parameters);
        for item in self.items {
            let mut entry = WorkflowItem::new(item.operation);
            entry.set_views(item.views, item.current_view, item.estimate_subset);
            workflow.push_unevaluated(entry);
        }
        Ok(workflow)
    }
}

impl Workflow {
    pub fn to_document(&self) -> WorkflowDocument {
        WorkflowDocument {
            schema: WORKFLOW_SCHEMA.to_string(),
            parameters: self.params().clone(),
            items: self
                .items()
                .iter()
                .map(|item| ItemDocument {
                    operation: item.operation().clone(),
                    views: item.views().to_vec(),
                    current_view: item.current_view(),
                    estimate_subset: item.estimate_subset().map(str::to_string),
                })
                .collect(),
        }
    }
}

/// Reads a workflow document; relative file references inside it resolve
/// against the document's directory.
pub fn load_document(path: &Path) -> Result<WorkflowDocument, CytoflowError> {
    let raw = fs::read_to_string(path).map_err(|e| {
        CytoflowError::Document(format!("Could not read '{}': {e}", display_path(path)))
    })?;
    let mut document: WorkflowDocument = serde_json::from_str(&raw).map_err(|e| {
        CytoflowError::Document(format!("Could not parse '{}': {e}", display_path(path)))
    })?;
    if let Some(base) = path.parent() {
        for item in &mut document.items {
            item.operation.rebase_paths(base);
        }
    }
    document.validate()?;
    tracing::debug!(path = %display_path(path), items = document.items.len(), "loaded workflow");
    Ok(document)
}

pub fn save_document(workflow: &Workflow, path: &Path) -> Result<(), CytoflowError> {
    let text = serde_json::to_string_pretty(&workflow.to_document())?;
    fs::write(path, text)?;
    Ok(())
}
