//! Command runner trait and build job types.
//!
//! Runners execute the command list of a build action inside a prepared
//! workspace directory, either on the host or in a container.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::mpsc::UnboundedSender;

use crate::{ResourceId, Result};

/// Specification for one build job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Unique identifier for this job.
    pub id: ResourceId,
    /// Action the job belongs to.
    pub action: String,
    /// Container image to run in; `None` runs on the host.
    pub image: Option<String>,
    /// Commands, run in order.
    pub commands: Vec<String>,
    /// Workspace directory holding the materialized inputs.
    pub workspace: PathBuf,
    /// Environment variables.
    pub env: HashMap<String, String>,
}

/// How a job ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandOutcome {
    /// Every command exited zero.
    Succeeded,
    /// The first command that failed; later commands did not run.
    Failed {
        command: String,
        exit_code: Option<i32>,
        message: String,
    },
}

impl CommandOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CommandOutcome::Succeeded)
    }
}

/// A line of log output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub content: String,
}

impl LogLine {
    pub fn new(stream: LogStream, content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            stream,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogStream {
    Stdout,
    Stderr,
    System,
}

/// Trait for build command runners.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Name of this runner.
    fn name(&self) -> &'static str;

    /// Check if this runner can handle the given spec.
    async fn can_run(&self, spec: &CommandSpec) -> bool;

    /// Run the commands in order, stopping at the first non-zero exit.
    /// Output lines are sent to `logs` as they are produced.
    async fn run(&self, spec: CommandSpec, logs: UnboundedSender<LogLine>)
    -> Result<CommandOutcome>;
}
