//! Pipeline, stage and action definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::RunId;
use crate::artifact::ArtifactRef;
use crate::deployer::{DeployableUnit, EnvironmentDescriptor};

/// Default file a deploy action reads the image reference from.
pub const DEFAULT_IMAGE_FILE: &str = "imagedefinitions.json";

/// A deployment pipeline definition. Immutable once built; every run of it
/// gets a fresh [`RunId`] and fresh artifacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    /// Pipeline name (e.g., "plan-apt").
    pub name: String,
    /// Stages, executed strictly in order.
    pub stages: Vec<Stage>,
    /// Target environments deploy actions may reference.
    pub environments: Vec<EnvironmentDescriptor>,
    /// Deployable units deploy actions may reference.
    pub units: Vec<DeployableUnit>,
    /// Global environment variables for build actions.
    pub env: HashMap<String, String>,
    /// Set when the pipeline's own definition is one of its artifacts.
    pub self_mutation: Option<SelfMutation>,
}

/// Where a self-mutating pipeline finds its own definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelfMutation {
    /// Artifact carrying the definition.
    pub artifact: String,
    /// Path of the definition file inside the artifact.
    pub file: String,
}

/// An ordered group of independent actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    pub actions: Vec<Action>,
}

/// A unit of work bound to one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Name, unique within its stage.
    pub name: String,
    /// What the action does.
    pub kind: ActionKind,
    /// Artifacts consumed.
    pub inputs: Vec<String>,
    /// Artifact produced, if any.
    pub output: Option<String>,
    /// Maximum time for one attempt.
    pub timeout: Option<Duration>,
    /// Extra attempts after a failed one.
    pub retries: u32,
}

/// What an action does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ActionKind {
    /// Fetch a branch from version control.
    Source { repository: String, branch: String },
    /// Run commands, optionally inside a container image.
    Build {
        image: Option<String>,
        commands: Vec<String>,
        env: HashMap<String, String>,
        /// Globs (relative to the workspace) collected into the output artifact.
        artifacts: Vec<String>,
    },
    /// Replace the running image of a unit in one environment.
    Deploy {
        unit: String,
        environment: String,
        image_file: String,
    },
}

impl ActionKind {
    pub fn label(&self) -> &'static str {
        match self {
            ActionKind::Source { .. } => "source",
            ActionKind::Build { .. } => "build",
            ActionKind::Deploy { .. } => "deploy",
        }
    }
}

impl Action {
    fn with_kind(name: impl Into<String>, kind: ActionKind) -> Self {
        Self {
            name: name.into(),
            kind,
            inputs: Vec::new(),
            output: None,
            timeout: None,
            retries: 0,
        }
    }

    pub fn source(
        name: impl Into<String>,
        repository: impl Into<String>,
        branch: impl Into<String>,
    ) -> Self {
        Self::with_kind(
            name,
            ActionKind::Source {
                repository: repository.into(),
                branch: branch.into(),
            },
        )
    }

    pub fn build<I, S>(name: impl Into<String>, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_kind(
            name,
            ActionKind::Build {
                image: None,
                commands: commands.into_iter().map(Into::into).collect(),
                env: HashMap::new(),
                artifacts: Vec::new(),
            },
        )
    }

    pub fn deploy(
        name: impl Into<String>,
        unit: impl Into<String>,
        environment: impl Into<String>,
    ) -> Self {
        Self::with_kind(
            name,
            ActionKind::Deploy {
                unit: unit.into(),
                environment: environment.into(),
                image_file: DEFAULT_IMAGE_FILE.to_string(),
            },
        )
    }

    pub fn input(mut self, artifact: impl Into<String>) -> Self {
        self.inputs.push(artifact.into());
        self
    }

    pub fn output(mut self, artifact: impl Into<String>) -> Self {
        self.output = Some(artifact.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Add a collected output glob. No-op for non-build actions.
    pub fn collect(mut self, pattern: impl Into<String>) -> Self {
        if let ActionKind::Build { artifacts, .. } = &mut self.kind {
            artifacts.push(pattern.into());
        }
        self
    }
}

impl Stage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            actions: Vec::new(),
        }
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }
}

impl Pipeline {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            environments: Vec::new(),
            units: Vec::new(),
            env: HashMap::new(),
            self_mutation: None,
        }
    }

    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn with_environment(mut self, environment: EnvironmentDescriptor) -> Self {
        self.environments.push(environment);
        self
    }

    pub fn with_unit(mut self, unit: DeployableUnit) -> Self {
        self.units.push(unit);
        self
    }

    pub fn with_self_mutation(mut self, artifact: impl Into<String>, file: impl Into<String>) -> Self {
        self.self_mutation = Some(SelfMutation {
            artifact: artifact.into(),
            file: file.into(),
        });
        self
    }

    /// Deploy `unit` into `environment` from the image reference carried by
    /// `input`, in the stage `Deploy-<environment>`. Units promoted through
    /// the same environment share that stage and deploy side by side.
    pub fn add_application_stage(&mut self, unit: &str, environment: &str, input: &str) {
        let action = Action::deploy(format!("deploy-{}", unit), unit, environment).input(input);
        let name = format!("Deploy-{}", environment);
        match self.stages.iter_mut().find(|s| s.name == name) {
            Some(stage) => stage.actions.push(action),
            None => self.stages.push(Stage::new(name).with_action(action)),
        }
    }

    /// Promote `unit` through `environments` as successive stages.
    pub fn promote_through<S: AsRef<str>>(&mut self, unit: &str, input: &str, environments: &[S]) {
        for environment in environments {
            self.add_application_stage(unit, environment.as_ref(), input);
        }
    }

    pub fn environment(&self, name: &str) -> Option<&EnvironmentDescriptor> {
        self.environments.iter().find(|e| e.name == name)
    }

    pub fn unit(&self, name: &str) -> Option<&DeployableUnit> {
        self.units.iter().find(|u| u.name == name)
    }

    /// Stage and action names in the order a run visits them.
    pub fn execution_order(&self) -> Vec<(String, String)> {
        self.stages
            .iter()
            .flat_map(|s| s.actions.iter().map(|a| (s.name.clone(), a.name.clone())))
            .collect()
    }
}

/// Final outcome of a pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunResult {
    /// Every stage completed.
    Success,
    /// The first failing stage and action, with the cause.
    Failed {
        stage: String,
        action: String,
        reason: String,
    },
    /// The run was cancelled while `stage` was executing.
    Cancelled { stage: Option<String> },
    /// The pipeline's definition changed; restart with the carried one.
    Mutated {
        stage: String,
        pipeline: Box<Pipeline>,
    },
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        matches!(self, RunResult::Success)
    }
}

/// Status of a stage after a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StageStatus {
    Succeeded,
    Failed { message: String },
    /// Never started because an earlier stage did not succeed.
    Skipped { reason: String },
    Cancelled,
}

/// Status of one action after a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ActionStatus {
    Succeeded,
    Failed {
        message: String,
        exit_code: Option<i32>,
    },
    Cancelled,
}

/// Result of one action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub name: String,
    pub status: ActionStatus,
    /// Stored output artifact.
    pub output: Option<ArtifactRef>,
    /// Attempts made, including the first.
    pub attempts: u32,
}

/// Result of a stage execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub name: String,
    pub status: StageStatus,
    pub actions: Vec<ActionResult>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Everything a caller learns about a finished run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: RunId,
    pub pipeline: String,
    pub result: RunResult,
    pub stages: Vec<StageResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.result.is_success()
    }

    pub fn stage(&self, name: &str) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Stage and action names that actually started, in declaration order.
    pub fn executed_actions(&self) -> Vec<(String, String)> {
        self.stages
            .iter()
            .flat_map(|s| s.actions.iter().map(|a| (s.name.clone(), a.name.clone())))
            .collect()
    }
}
