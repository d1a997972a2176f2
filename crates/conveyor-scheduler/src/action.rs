//! Execution of a single action: workspace preparation, the work itself,
//! timeouts, retries and storing the output artifact.

use conveyor_config::VariableContext;
use conveyor_core::artifact::{ArtifactKey, ArtifactRef, ArtifactStore, Bundle};
use conveyor_core::deployer::{DeployableUnit, EnvironmentDescriptor};
use conveyor_core::executor::{CommandOutcome, CommandRunner, CommandSpec};
use conveyor_core::pipeline::{Action, ActionKind, ActionResult, ActionStatus, Pipeline};
use conveyor_core::source::SourceProvider;
use conveyor_core::{Error, ResourceId, Result, RunId};
use conveyor_executor::Workspace;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::images::image_reference;
use crate::orchestrator::PipelineEvent;
use crate::promotion::Promoter;

/// File a deploy action writes into its output artifact.
pub const DEPLOYMENT_RECORD: &str = "deployment.json";

/// Everything an action needs from the orchestrator.
#[derive(Clone)]
pub(crate) struct Services {
    pub runners: Vec<Arc<dyn CommandRunner>>,
    pub source: Arc<dyn SourceProvider>,
    pub store: Arc<dyn ArtifactStore>,
    pub promoter: Arc<Promoter>,
    pub work_dir: PathBuf,
}

/// One action of one run.
pub(crate) struct ActionRun {
    pub services: Services,
    pub pipeline: Arc<Pipeline>,
    pub run_id: RunId,
    pub stage: String,
    pub action: Action,
    pub variables: VariableContext,
    pub events: mpsc::Sender<PipelineEvent>,
}

fn retryable(error: &Error) -> bool {
    !matches!(
        error,
        Error::Configuration(_) | Error::Cancelled | Error::ArtifactExists(_)
    )
}

fn failed_status(error: &Error) -> ActionStatus {
    let exit_code = match error {
        Error::ActionExecution { exit_code, .. } => *exit_code,
        _ => None,
    };
    ActionStatus::Failed {
        message: error.to_string(),
        exit_code,
    }
}

impl ActionRun {
    /// Run the action to completion, retrying failed attempts.
    pub async fn execute(self) -> ActionResult {
        let _ = self
            .events
            .send(PipelineEvent::ActionStarted {
                stage: self.stage.clone(),
                action: self.action.name.clone(),
            })
            .await;

        if let Err(e) = self.approve().await {
            return self.finish(failed_status(&e), None, 0).await;
        }

        let max_attempts = self.action.retries + 1;
        let mut attempts = 0;
        let (status, output) = loop {
            attempts += 1;
            match self.attempt_with_timeout().await {
                Ok(output) => break (ActionStatus::Succeeded, output),
                Err(e) if attempts < max_attempts && retryable(&e) => {
                    warn!(
                        stage = %self.stage,
                        action = %self.action.name,
                        attempt = attempts,
                        error = %e,
                        "Action attempt failed, retrying"
                    );
                }
                Err(e) => {
                    error!(stage = %self.stage, action = %self.action.name, error = %e, "Action failed");
                    break (failed_status(&e), None);
                }
            }
        };

        self.finish(status, output, attempts).await
    }

    async fn finish(
        &self,
        status: ActionStatus,
        output: Option<ArtifactRef>,
        attempts: u32,
    ) -> ActionResult {
        let _ = self
            .events
            .send(PipelineEvent::ActionCompleted {
                stage: self.stage.clone(),
                action: self.action.name.clone(),
                status: status.clone(),
            })
            .await;

        ActionResult {
            name: self.action.name.clone(),
            status,
            output,
            attempts,
        }
    }

    /// Deploys into gated environments are asked about once, before any attempt.
    async fn approve(&self) -> Result<()> {
        if let ActionKind::Deploy {
            unit, environment, ..
        } = &self.action.kind
        {
            let (unit, environment) = self.deploy_target(unit, environment)?;
            self.services
                .promoter
                .check_approval(unit, environment)
                .await?;
        }
        Ok(())
    }

    async fn attempt_with_timeout(&self) -> Result<Option<ArtifactRef>> {
        match self.action.timeout {
            Some(limit) => tokio::time::timeout(limit, self.attempt())
                .await
                .unwrap_or_else(|_| {
                    Err(Error::Timeout(format!(
                        "action '{}' exceeded {}s",
                        self.action.name,
                        limit.as_secs_f64()
                    )))
                }),
            None => self.attempt().await,
        }
    }

    async fn attempt(&self) -> Result<Option<ArtifactRef>> {
        let workspace =
            Workspace::create(&self.services.work_dir, &self.run_id, &self.action.name).await?;
        let bundle = self.work(&workspace).await;
        if let Err(e) = workspace.remove().await {
            debug!(action = %self.action.name, error = %e, "Failed to remove workspace");
        }

        match (bundle?, &self.action.output) {
            (Some(bundle), Some(name)) => Ok(Some(self.store(name, bundle).await?)),
            _ => Ok(None),
        }
    }

    /// Perform the action; the returned bundle is only produced when the
    /// action declares an output.
    async fn work(&self, workspace: &Workspace) -> Result<Option<Bundle>> {
        let wants_output = self.action.output.is_some();

        match &self.action.kind {
            ActionKind::Source { repository, branch } => {
                let repository = self.variables.interpolate(repository);
                let branch = self.variables.interpolate(branch);
                let revision = self
                    .services
                    .source
                    .fetch(&repository, &branch, workspace.path())
                    .await?;
                info!(
                    action = %self.action.name,
                    repository = %repository,
                    commit = ?revision.commit,
                    "Fetched source"
                );
                if wants_output {
                    Ok(Some(workspace.snapshot().await?))
                } else {
                    Ok(None)
                }
            }
            ActionKind::Build {
                image,
                commands,
                env,
                artifacts,
            } => {
                for input in &self.action.inputs {
                    workspace.materialize(&self.load(input).await?).await?;
                }

                let mut full_env = self.pipeline.env.clone();
                full_env.extend(env.clone());
                let spec = CommandSpec {
                    id: ResourceId::new(),
                    action: self.action.name.clone(),
                    image: image.as_ref().map(|i| self.variables.interpolate(i)),
                    commands: self.variables.interpolate_vec(commands),
                    workspace: workspace.path().to_path_buf(),
                    env: self.variables.interpolate_map(&full_env),
                };
                self.run_commands(spec).await?;

                if !wants_output {
                    Ok(None)
                } else if artifacts.is_empty() {
                    Ok(Some(workspace.snapshot().await?))
                } else {
                    Ok(Some(workspace.collect(artifacts.clone()).await?))
                }
            }
            ActionKind::Deploy {
                unit,
                environment,
                image_file,
            } => {
                let (unit, environment) = self.deploy_target(unit, environment)?;
                let image = self.read_image(image_file, &unit.container).await?;
                let handle = self
                    .services
                    .promoter
                    .apply(unit, environment, &image)
                    .await?;

                if wants_output {
                    let record = serde_json::to_vec_pretty(&handle)
                        .map_err(|e| Error::Internal(e.to_string()))?;
                    Ok(Some(Bundle::new().with_file(DEPLOYMENT_RECORD, record)))
                } else {
                    Ok(None)
                }
            }
        }
    }

    async fn run_commands(&self, spec: CommandSpec) -> Result<()> {
        let mut runner = None;
        for candidate in &self.services.runners {
            if candidate.can_run(&spec).await {
                runner = Some(candidate.clone());
                break;
            }
        }
        let runner = runner.ok_or_else(|| {
            Error::action(&self.action.name, "no command runner can execute this action")
        })?;
        debug!(action = %self.action.name, runner = runner.name(), "Selected runner");

        let (log_tx, mut log_rx) = mpsc::unbounded_channel();
        let events = self.events.clone();
        let stage = self.stage.clone();
        let action = self.action.name.clone();
        let forward = tokio::spawn(async move {
            while let Some(line) = log_rx.recv().await {
                let _ = events
                    .send(PipelineEvent::ActionLog {
                        stage: stage.clone(),
                        action: action.clone(),
                        line,
                    })
                    .await;
            }
        });

        let outcome = runner.run(spec, log_tx).await;
        let _ = forward.await;

        match outcome? {
            CommandOutcome::Succeeded => Ok(()),
            CommandOutcome::Failed {
                exit_code, message, ..
            } => Err(Error::ActionExecution {
                action: self.action.name.clone(),
                message,
                exit_code,
            }),
        }
    }

    fn deploy_target(
        &self,
        unit: &str,
        environment: &str,
    ) -> Result<(&DeployableUnit, &EnvironmentDescriptor)> {
        let unit = self
            .pipeline
            .unit(unit)
            .ok_or_else(|| Error::Internal(format!("unknown unit '{}'", unit)))?;
        let environment = self
            .pipeline
            .environment(environment)
            .ok_or_else(|| Error::Internal(format!("unknown environment '{}'", environment)))?;
        Ok((unit, environment))
    }

    /// The image reference from the first input carrying `image_file`.
    async fn read_image(&self, image_file: &str, container: &str) -> Result<String> {
        for input in &self.action.inputs {
            let bundle = self.load(input).await?;
            if let Some(contents) = bundle.get(image_file) {
                return image_reference(contents, container);
            }
        }
        Err(Error::ArtifactNotFound(format!(
            "no input of '{}' contains {}",
            self.action.name, image_file
        )))
    }

    async fn load(&self, artifact: &str) -> Result<Bundle> {
        let data = self
            .services
            .store
            .get(&ArtifactKey::new(self.run_id, artifact))
            .await?;
        Bundle::from_bytes(&data)
    }

    async fn store(&self, name: &str, bundle: Bundle) -> Result<ArtifactRef> {
        let reference = self
            .services
            .store
            .put(&ArtifactKey::new(self.run_id, name), bundle.to_bytes())
            .await?;
        info!(
            action = %self.action.name,
            artifact = %name,
            files = bundle.len(),
            size = reference.size,
            "Stored artifact"
        );
        let _ = self
            .events
            .send(PipelineEvent::ArtifactStored {
                stage: self.stage.clone(),
                action: self.action.name.clone(),
                artifact: reference.clone(),
            })
            .await;
        Ok(reference)
    }
}
