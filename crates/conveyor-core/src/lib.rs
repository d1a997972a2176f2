//! Core domain types and traits for the Conveyor deployment orchestrator.
//!
//! This crate contains:
//! - Resource identifiers and the error taxonomy
//! - Pipeline, stage and action definitions plus run results
//! - Static validation of the artifact graph
//! - Traits at the seams: artifact storage, source fetching,
//!   command running, deployment and approval

pub mod artifact;
pub mod deployer;
pub mod error;
pub mod executor;
pub mod graph;
pub mod id;
pub mod pipeline;
pub mod source;

pub use error::{Error, GraphError, Result};
pub use id::{ResourceId, RunId};
