//! Analyses over the polyhedral model.

pub mod dataflow;

pub use dataflow::{analyze, Dataflow, DataflowEdge};
