//! Error types for Conveyor.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(#[from] GraphError),

    #[error("action '{action}' failed: {message}")]
    ActionExecution {
        action: String,
        message: String,
        exit_code: Option<i32>,
    },

    #[error("environment '{environment}' unreachable: {message}")]
    EnvironmentUnreachable {
        environment: String,
        message: String,
    },

    #[error("deployment failed: {0}")]
    DeploymentFailed(String),

    #[error("artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("artifact already exists: {0}")]
    ArtifactExists(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build an action failure without an exit code.
    pub fn action(action: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ActionExecution {
            action: action.into(),
            message: message.into(),
            exit_code: None,
        }
    }

    /// Whether this error was raised before anything ran.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::Configuration(_))
    }
}

/// Problems found while validating a pipeline graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("pipeline '{0}' has no stages")]
    EmptyPipeline(String),

    #[error("stage '{0}' has no actions")]
    EmptyStage(String),

    #[error("duplicate stage name: {0}")]
    DuplicateStage(String),

    #[error("duplicate action '{action}' in stage '{stage}'")]
    DuplicateAction { stage: String, action: String },

    #[error("artifact '{artifact}' is produced by both '{first}' and '{second}'")]
    DuplicateProducer {
        artifact: String,
        first: String,
        second: String,
    },

    #[error("action '{action}' consumes unknown artifact '{artifact}'")]
    UnknownArtifact { action: String, artifact: String },

    #[error(
        "action '{action}' in stage '{stage}' consumes artifact '{artifact}' produced in stage '{producer_stage}', which does not run before it"
    )]
    ForwardReference {
        action: String,
        stage: String,
        artifact: String,
        producer_stage: String,
    },

    #[error("action '{action}': {message}")]
    InvalidAction { action: String, message: String },

    #[error("action '{action}' references unknown unit '{unit}'")]
    UnknownUnit { action: String, unit: String },

    #[error("action '{action}' references unknown environment '{environment}'")]
    UnknownEnvironment { action: String, environment: String },

    #[error("duplicate {kind} name: {name}")]
    DuplicateName { kind: &'static str, name: String },

    #[error("no deployer registered for runtime '{runtime}' (environment '{environment}')")]
    UnknownRuntime {
        environment: String,
        runtime: String,
    },

    #[error("self-mutation artifact '{0}' is not produced by any action")]
    UnknownMutationArtifact(String),
}

pub type Result<T> = std::result::Result<T, Error>;
