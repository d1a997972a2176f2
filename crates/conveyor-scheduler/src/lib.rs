//! Pipeline execution for Conveyor.
//!
//! Runs stages in order, the actions of each stage concurrently, and
//! promotes deployable units through environments.

mod action;
pub mod images;
pub mod orchestrator;
pub mod promotion;

#[cfg(test)]
mod testing;

pub use action::DEPLOYMENT_RECORD;
pub use orchestrator::{CancelHandle, PipelineEvent, PipelineOrchestrator, RunHandle};
pub use promotion::{DeploymentOutcome, EnvironmentDeployment, Promoter};
