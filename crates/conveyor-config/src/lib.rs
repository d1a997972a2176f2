//! KDL configuration parsing for Conveyor.
//!
//! This crate handles parsing of:
//! - Pipeline definitions (conveyor.kdl)
//! - Variable interpolation

pub mod error;
pub mod pipeline;
pub mod variables;

pub use error::{ConfigError, ConfigResult};
pub use pipeline::{parse_pipeline, parse_pipeline_file};
pub use variables::{
    ActionContext, EnvironmentContext, PipelineContext, RunContext, StageContext, UnitContext,
    VariableContext, VariableContextBuilder,
};
