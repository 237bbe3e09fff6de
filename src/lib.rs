pub mod config;
pub mod document;
pub mod error;
pub mod experiment;
pub mod logicle;
pub mod metadata;
pub mod operations;
pub mod stats;
pub mod subset;
pub mod tube;
pub mod views;
pub mod workflow;

pub use cytoflow_protocol as protocol;
