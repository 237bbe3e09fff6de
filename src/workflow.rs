//! A linear chain of operations with cached results.
//!
//! Item `i` consumes the result of item `i - 1`. Re-evaluating an item first
//! invalidates everything downstream of it, so no item ever holds a result
//! computed from a stale predecessor.

use crate::{
    config::AnalysisParameters,
    error::{CytoflowError, OpError, ViewError},
    experiment::Experiment,
    operations::{OpContext, Operation, SUPPORTED_OPERATIONS},
    subset::Subset,
    tube::SUPPORTED_TUBE_FORMATS,
    views::{Plot, SUPPORTED_VIEWS, View},
};
use cytoflow_protocol::{Capabilities, ItemStatus, ItemSummary, WorkflowSummary, WORKFLOW_SCHEMA};
use std::{fmt, sync::Arc};

#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowEvent {
    StatusChanged { index: usize, status: ItemStatus },
    ItemInserted { index: usize },
    ItemRemoved { index: usize },
}

pub type Listener = Box<dyn FnMut(&WorkflowEvent)>;

#[derive(Debug, Clone)]
pub struct WorkflowItem {
    operation: Operation,
    views: Vec<View>,
    current_view: Option<usize>,
    estimate_subset: Option<String>,
    result: Option<Arc<Experiment>>,
    status: ItemStatus,
    error: Option<String>,
    warning: Option<String>,
}

impl WorkflowItem {
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            views: vec![],
            current_view: None,
            estimate_subset: None,
            result: None,
            status: ItemStatus::Invalid,
            error: None,
            warning: None,
        }
    }

    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    pub fn views(&self) -> &[View] {
        &self.views
    }

    pub fn current_view(&self) -> Option<usize> {
        self.current_view
    }

    pub fn estimate_subset(&self) -> Option<&str> {
        self.estimate_subset.as_deref()
    }

    pub fn result(&self) -> Option<&Arc<Experiment>> {
        self.result.as_ref()
    }

    pub fn status(&self) -> ItemStatus {
        self.status
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn warning(&self) -> Option<&str> {
        self.warning.as_deref()
    }

    /// Channels of the result; empty while the item is not valid.
    pub fn channels(&self) -> &[String] {
        self.result.as_ref().map(|r| r.channels()).unwrap_or(&[])
    }

    pub fn conditions(&self) -> Vec<String> {
        self.result
            .as_ref()
            .map(|r| r.conditions().iter().map(|c| c.name.clone()).collect())
            .unwrap_or_default()
    }

    pub(crate) fn set_views(
        &mut self,
        views: Vec<View>,
        current_view: Option<usize>,
        estimate_subset: Option<String>,
    ) {
        self.views = views;
        self.current_view = current_view.filter(|idx| *idx < self.views.len());
        self.estimate_subset = estimate_subset;
    }

    /// Drops the cached result. Returns whether anything changed.
    fn invalidate(&mut self) -> bool {
        let changed = self.status != ItemStatus::Invalid || self.result.is_some();
        self.result = None;
        self.status = ItemStatus::Invalid;
        changed
    }

    fn set_status(&mut self, status: ItemStatus, notify: &mut dyn FnMut(ItemStatus)) {
        self.status = status;
        notify(status);
    }

    fn run(
        &mut self,
        previous: Option<&Experiment>,
        ctx: &mut OpContext,
        notify: &mut dyn FnMut(ItemStatus),
    ) -> Result<Experiment, OpError> {
        let subset = self
            .estimate_subset
            .as_deref()
            .map(Subset::parse)
            .transpose()?;
        if self.operation.has_estimate() {
            self.set_status(ItemStatus::Estimating, notify);
            self.operation.estimate(previous, subset.as_ref(), ctx)?;
        }
        self.set_status(ItemStatus::Applying, notify);
        self.operation.apply(previous, ctx)
    }

    fn evaluate(
        &mut self,
        previous: Option<&Experiment>,
        params: &AnalysisParameters,
        notify: &mut dyn FnMut(ItemStatus),
    ) {
        self.result = None;
        self.error = None;
        self.warning = None;
        let mut ctx = OpContext::new(params);
        match self.run(previous, &mut ctx, notify) {
            Ok(experiment) => {
                self.warning = ctx.into_warnings().into_iter().next();
                tracing::info!(
                    op = self.operation.name(),
                    events = experiment.len(),
                    "operation applied"
                );
                self.result = Some(Arc::new(experiment));
                self.set_status(ItemStatus::Valid, notify);
            }
            Err(e) => {
                tracing::warn!(op = self.operation.name(), error = %e, "operation failed");
                self.error = Some(e.message);
                self.set_status(ItemStatus::Invalid, notify);
            }
        }
    }

    fn summary(&self, index: usize) -> ItemSummary {
        ItemSummary {
            index,
            name: self.operation.name().to_string(),
            kind: self.operation.kind().to_string(),
            status: self.status,
            error: self.error.clone(),
            warning: self.warning.clone(),
            channels: self.channels().to_vec(),
            conditions: self.conditions(),
            events: self.result.as_ref().map(|r| r.len()).unwrap_or(0),
            history_len: self.result.as_ref().map(|r| r.history().len()).unwrap_or(0),
            operation: serde_json::to_value(&self.operation).unwrap_or_default(),
        }
    }
}

#[derive(Default)]
pub struct Workflow {
    items: Vec<WorkflowItem>,
    params: AnalysisParameters,
    listeners: Vec<Listener>,
}

impl fmt::Debug for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workflow")
            .field("items", &self.items)
            .field("params", &self.params)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

fn emit(listeners: &mut [Listener], event: WorkflowEvent) {
    for listener in listeners.iter_mut() {
        listener(&event);
    }
}

impl Workflow {
    pub fn new(params: AnalysisParameters) -> Self {
        Self {
            items: vec![],
            params,
            listeners: vec![],
        }
    }

    pub fn capabilities() -> Capabilities {
        let owned = |list: &[&str]| -> Vec<String> { list.iter().map(|s| s.to_string()).collect() };
        Capabilities {
            protocol_version: env!("CARGO_PKG_VERSION").to_string(),
            workflow_schema: WORKFLOW_SCHEMA.to_string(),
            supported_operations: owned(SUPPORTED_OPERATIONS),
            supported_views: owned(SUPPORTED_VIEWS),
            supported_tube_formats: owned(SUPPORTED_TUBE_FORMATS),
        }
    }

    pub fn params(&self) -> &AnalysisParameters {
        &self.params
    }

    /// Replaces the parameters and re-evaluates the whole chain.
    pub fn set_params(&mut self, params: AnalysisParameters) {
        self.params = params;
        if !self.items.is_empty() {
            self.update_from(0);
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[WorkflowItem] {
        &self.items
    }

    pub fn item(&self, index: usize) -> Option<&WorkflowItem> {
        self.items.get(index)
    }

    pub fn subscribe(&mut self, listener: impl FnMut(&WorkflowEvent) + 'static) {
        self.listeners.push(Box::new(listener));
    }

    fn check_index(&self, index: usize) -> Result<(), CytoflowError> {
        if index >= self.items.len() {
            return Err(CytoflowError::IndexOutOfRange {
                index,
                len: self.items.len(),
            });
        }
        Ok(())
    }

    fn previous_result(&self, index: usize) -> Option<Arc<Experiment>> {
        index
            .checked_sub(1)
            .and_then(|prev| self.items.get(prev))
            .and_then(|item| item.result.clone())
    }

    /// Adds an item without evaluating it.
    pub(crate) fn push_unevaluated(&mut self, item: WorkflowItem) {
        let index = self.items.len();
        self.items.push(item);
        emit(&mut self.listeners, WorkflowEvent::ItemInserted { index });
    }

    /// Appends an operation and evaluates it.
    pub fn push(&mut self, operation: Operation) -> usize {
        let index = self.items.len();
        self.push_unevaluated(WorkflowItem::new(operation));
        self.update_from(index);
        index
    }

    pub fn insert(&mut self, index: usize, operation: Operation) -> Result<(), CytoflowError> {
        if index > self.items.len() {
            return Err(CytoflowError::IndexOutOfRange {
                index,
                len: self.items.len(),
            });
        }
        self.items.insert(index, WorkflowItem::new(operation));
        emit(&mut self.listeners, WorkflowEvent::ItemInserted { index });
        self.update_from(index);
        Ok(())
    }

    pub fn remove(&mut self, index: usize) -> Result<Operation, CytoflowError> {
        self.check_index(index)?;
        let item = self.items.remove(index);
        emit(&mut self.listeners, WorkflowEvent::ItemRemoved { index });
        if index < self.items.len() {
            self.update_from(index);
        }
        Ok(item.operation)
    }

    /// Clears the results of `index` and every item after it.
    pub fn invalidate_from(&mut self, index: usize) {
        for idx in index..self.items.len() {
            if self.items[idx].invalidate() {
                emit(
                    &mut self.listeners,
                    WorkflowEvent::StatusChanged {
                        index: idx,
                        status: ItemStatus::Invalid,
                    },
                );
            }
        }
    }

    /// Re-evaluates one item against its predecessor's current result.
    /// Downstream items are left invalid.
    pub fn update(&mut self, index: usize) -> Result<ItemStatus, CytoflowError> {
        self.check_index(index)?;
        self.invalidate_from(index + 1);
        let previous = self.previous_result(index);
        let Self {
            items,
            params,
            listeners,
        } = self;
        let item = &mut items[index];
        let mut notify = |status: ItemStatus| {
            emit(listeners, WorkflowEvent::StatusChanged { index, status });
        };
        tracing::debug!(index, op = item.operation.name(), "updating workflow item");
        item.evaluate(previous.as_deref(), params, &mut notify);
        Ok(item.status)
    }

    /// Re-evaluates `index` and then each downstream item in order.
    pub fn update_from(&mut self, index: usize) {
        self.invalidate_from(index);
        for idx in index..self.items.len() {
            // index is always in range here
            let _ = self.update(idx);
        }
    }

    /// Changes an item's operation and re-evaluates from there.
    pub fn configure(
        &mut self,
        index: usize,
        change: impl FnOnce(&mut Operation),
    ) -> Result<ItemStatus, CytoflowError> {
        self.check_index(index)?;
        change(&mut self.items[index].operation);
        self.update_from(index);
        Ok(self.items[index].status)
    }

    pub fn set_estimate_subset(
        &mut self,
        index: usize,
        subset: Option<String>,
    ) -> Result<ItemStatus, CytoflowError> {
        self.check_index(index)?;
        self.items[index].estimate_subset = subset;
        self.update_from(index);
        Ok(self.items[index].status)
    }

    /// Attaches a view to an item; views never change results.
    pub fn add_view(&mut self, index: usize, view: View) -> Result<usize, CytoflowError> {
        self.check_index(index)?;
        let item = &mut self.items[index];
        item.views.push(view);
        let view_index = item.views.len() - 1;
        item.current_view = Some(view_index);
        Ok(view_index)
    }

    pub fn set_current_view(
        &mut self,
        index: usize,
        view: Option<usize>,
    ) -> Result<(), CytoflowError> {
        self.check_index(index)?;
        let item = &mut self.items[index];
        if let Some(v) = view.filter(|v| *v >= item.views.len()) {
            return Err(CytoflowError::View(ViewError::Invalid(format!(
                "Item {index} has no view {v}"
            ))));
        }
        item.current_view = view;
        Ok(())
    }

    /// Renders view `view` of item `index`, or the operation's default view
    /// when `view` is `None`. Computed on demand; nothing is cached.
    pub fn render_view(&self, index: usize, view: Option<usize>) -> Result<Plot, CytoflowError> {
        self.check_index(index)?;
        let item = &self.items[index];
        let default_view;
        let view = match view {
            Some(v) => item.views.get(v).ok_or_else(|| {
                ViewError::Invalid(format!("Item {index} has no view {v}"))
            })?,
            None => {
                default_view = item.operation.default_view().ok_or_else(|| {
                    ViewError::Invalid(format!(
                        "A {} operation has no default view",
                        item.operation.kind()
                    ))
                })?;
                &default_view
            }
        };
        let experiment = if view.reads_predecessor() {
            self.previous_result(index)
        } else {
            item.result.clone()
        }
        .ok_or(ViewError::NoResult)?;
        Ok(view.render(&experiment, Some(&item.operation), &self.params)?)
    }

    pub fn summary(&self) -> WorkflowSummary {
        WorkflowSummary::new(
            self.items
                .iter()
                .enumerate()
                .map(|(index, item)| item.summary(index))
                .collect(),
        )
    }
}
