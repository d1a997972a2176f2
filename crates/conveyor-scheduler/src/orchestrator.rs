//! Pipeline orchestrator: runs stages in order and the actions of a stage
//! concurrently, passing artifacts forward through the artifact store.

use chrono::Utc;
use conveyor_config::{ConfigError, VariableContext};
use conveyor_core::artifact::{ArtifactKey, ArtifactRef, ArtifactStore, Bundle, RetentionPolicy};
use conveyor_core::deployer::{ApprovalGate, AutoApprove, Deployer};
use conveyor_core::executor::{CommandRunner, LogLine};
use conveyor_core::graph;
use conveyor_core::pipeline::{
    ActionResult, ActionStatus, Pipeline, RunReport, RunResult, Stage, StageResult, StageStatus,
};
use conveyor_core::source::SourceProvider;
use conveyor_core::{Error, Result, RunId};
use conveyor_deployer::DeployerRegistry;
use conveyor_executor::{GitSource, ShellRunner};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::action::{ActionRun, Services};
use crate::promotion::Promoter;

const EVENT_BUFFER: usize = 1024;

/// Event emitted during pipeline execution.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    RunStarted { run_id: RunId, pipeline: String },
    StageStarted { stage: String },
    ActionStarted { stage: String, action: String },
    ActionLog { stage: String, action: String, line: LogLine },
    ArtifactStored { stage: String, action: String, artifact: ArtifactRef },
    ActionCompleted { stage: String, action: String, status: ActionStatus },
    StageCompleted { stage: String, status: StageStatus },
    RunCompleted { result: RunResult },
}

/// Requests cancellation of a running pipeline.
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<watch::Sender<bool>>);

impl CancelHandle {
    /// Abort in-flight actions. Deployments already applied stay applied.
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

/// A started run.
pub struct RunHandle {
    pub run_id: RunId,
    /// Progress events. Keep draining it, or drop it; a full buffer stalls the run.
    pub events: mpsc::Receiver<PipelineEvent>,
    report: JoinHandle<RunReport>,
    cancel: CancelHandle,
}

impl RunHandle {
    pub fn canceller(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the report, discarding events.
    pub async fn wait(self) -> Result<RunReport> {
        let RunHandle { events, report, .. } = self;
        drop(events);
        report
            .await
            .map_err(|e| Error::Internal(format!("run task failed: {}", e)))
    }

    pub fn into_parts(self) -> (mpsc::Receiver<PipelineEvent>, JoinHandle<RunReport>, CancelHandle) {
        (self.events, self.report, self.cancel)
    }
}

/// Orchestrates the execution of a pipeline.
pub struct PipelineOrchestrator {
    runners: Vec<Arc<dyn CommandRunner>>,
    source: Arc<dyn SourceProvider>,
    store: Arc<dyn ArtifactStore>,
    deployers: DeployerRegistry,
    approval: Arc<dyn ApprovalGate>,
    work_dir: PathBuf,
    retention: Option<RetentionPolicy>,
    variables: VariableContext,
}

impl PipelineOrchestrator {
    /// Orchestrator with the host shell runner, git sources and the
    /// built-in deployers. Workspaces are created below `work_dir`.
    pub fn new(store: Arc<dyn ArtifactStore>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            runners: vec![Arc::new(ShellRunner::new())],
            source: Arc::new(GitSource::new()),
            store,
            deployers: conveyor_deployer::default_registry(),
            approval: Arc::new(AutoApprove),
            work_dir: work_dir.into(),
            retention: None,
            variables: VariableContext::default(),
        }
    }

    /// Add a runner. The first runner accepting a job runs it.
    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runners.push(runner);
        self
    }

    pub fn with_runners(mut self, runners: Vec<Arc<dyn CommandRunner>>) -> Self {
        self.runners = runners;
        self
    }

    pub fn with_source(mut self, source: Arc<dyn SourceProvider>) -> Self {
        self.source = source;
        self
    }

    /// Register a deployer, replacing any serving the same runtime kind.
    pub fn with_deployer(mut self, deployer: Arc<dyn Deployer>) -> Self {
        self.deployers.insert(deployer.name(), deployer);
        self
    }

    pub fn with_deployers(mut self, deployers: DeployerRegistry) -> Self {
        self.deployers = deployers;
        self
    }

    pub fn with_approval(mut self, approval: Arc<dyn ApprovalGate>) -> Self {
        self.approval = approval;
        self
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = Some(retention);
        self
    }

    /// Base variables (custom values, process env) for every run.
    pub fn with_variables(mut self, variables: VariableContext) -> Self {
        self.variables = variables;
        self
    }

    /// Validate `pipeline` and start a run of it.
    ///
    /// Validation failures are returned as [`Error::Configuration`] and
    /// nothing executes.
    pub fn execute(&self, pipeline: &Pipeline) -> Result<RunHandle> {
        graph::validate(pipeline)?;
        let kinds: Vec<&str> = self.deployers.keys().copied().collect();
        graph::validate_runtimes(pipeline, &kinds)?;

        let run_id = RunId::new();
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let mut variables = self.variables.clone();
        variables.pipeline.name = pipeline.name.clone();
        variables.run.id = run_id.to_string();

        let run = Run {
            services: Services {
                runners: self.runners.clone(),
                source: self.source.clone(),
                store: self.store.clone(),
                promoter: Arc::new(
                    Promoter::new(self.deployers.clone()).with_approval(self.approval.clone()),
                ),
                work_dir: self.work_dir.clone(),
            },
            mutation_stage: mutation_stage(pipeline),
            pipeline: Arc::new(pipeline.clone()),
            run_id,
            variables,
            retention: self.retention,
            events: tx,
            cancel: cancel_rx,
        };

        info!(pipeline = %pipeline.name, run_id = %run_id, "Starting pipeline run");
        let report = tokio::spawn(run.execute());

        Ok(RunHandle {
            run_id,
            events: rx,
            report,
            cancel: CancelHandle(Arc::new(cancel_tx)),
        })
    }
}

/// Index of the stage producing the self-mutation artifact.
fn mutation_stage(pipeline: &Pipeline) -> Option<usize> {
    let mutation = pipeline.self_mutation.as_ref()?;
    let producers = graph::producers(pipeline).ok()?;
    producers
        .get(mutation.artifact.as_str())
        .map(|p| p.stage_index)
}

/// Resolves once the cancel flag is set. Never resolves if every handle is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// State of one run.
struct Run {
    services: Services,
    pipeline: Arc<Pipeline>,
    run_id: RunId,
    variables: VariableContext,
    retention: Option<RetentionPolicy>,
    mutation_stage: Option<usize>,
    events: mpsc::Sender<PipelineEvent>,
    cancel: watch::Receiver<bool>,
}

/// Why the remaining stages do not run.
enum Halt {
    Failed(String),
    Cancelled,
    Mutated,
}

impl Run {
    async fn execute(self) -> RunReport {
        let started_at = Utc::now();
        self.emit(PipelineEvent::RunStarted {
            run_id: self.run_id,
            pipeline: self.pipeline.name.clone(),
        })
        .await;

        let mut result = RunResult::Success;
        let mut halt: Option<Halt> = None;
        let mut stages = Vec::with_capacity(self.pipeline.stages.len());

        for (index, stage) in self.pipeline.stages.iter().enumerate() {
            if halt.is_none() && *self.cancel.borrow() {
                result = RunResult::Cancelled { stage: None };
                halt = Some(Halt::Cancelled);
            }
            if let Some(halt) = &halt {
                let reason = match halt {
                    Halt::Failed(stage) => format!("stage '{}' did not succeed", stage),
                    Halt::Cancelled => "run cancelled".to_string(),
                    Halt::Mutated => "pipeline definition changed".to_string(),
                };
                stages.push(StageResult {
                    name: stage.name.clone(),
                    status: StageStatus::Skipped { reason },
                    actions: Vec::new(),
                    started_at: None,
                    finished_at: None,
                });
                continue;
            }

            info!(stage = %stage.name, index, "Starting stage");
            self.emit(PipelineEvent::StageStarted {
                stage: stage.name.clone(),
            })
            .await;

            let stage_started = Utc::now();
            let (actions, was_cancelled) = self.run_stage(index, stage).await;
            let failed = actions
                .iter()
                .find(|a| !matches!(a.status, ActionStatus::Succeeded));

            let status = if was_cancelled {
                warn!(stage = %stage.name, "Stage cancelled");
                result = RunResult::Cancelled {
                    stage: Some(stage.name.clone()),
                };
                halt = Some(Halt::Cancelled);
                StageStatus::Cancelled
            } else if let Some(failed) = failed {
                let reason = match &failed.status {
                    ActionStatus::Failed { message, .. } => message.clone(),
                    _ => "action did not complete".to_string(),
                };
                error!(stage = %stage.name, action = %failed.name, reason = %reason, "Stage failed");
                result = RunResult::Failed {
                    stage: stage.name.clone(),
                    action: failed.name.clone(),
                    reason: reason.clone(),
                };
                halt = Some(Halt::Failed(stage.name.clone()));
                StageStatus::Failed { message: reason }
            } else if self.mutation_stage == Some(index) {
                match self.mutated_definition().await {
                    Ok(None) => StageStatus::Succeeded,
                    Ok(Some(pipeline)) => {
                        info!(stage = %stage.name, "Pipeline definition changed, restart required");
                        result = RunResult::Mutated {
                            stage: stage.name.clone(),
                            pipeline: Box::new(pipeline),
                        };
                        halt = Some(Halt::Mutated);
                        StageStatus::Succeeded
                    }
                    Err(e) => {
                        error!(stage = %stage.name, error = %e, "Reading the pipeline definition failed");
                        let producer = stage
                            .actions
                            .iter()
                            .find(|a| {
                                a.output.as_deref()
                                    == self.pipeline.self_mutation.as_ref().map(|m| m.artifact.as_str())
                            })
                            .map(|a| a.name.clone())
                            .unwrap_or_default();
                        result = RunResult::Failed {
                            stage: stage.name.clone(),
                            action: producer,
                            reason: e.to_string(),
                        };
                        halt = Some(Halt::Failed(stage.name.clone()));
                        StageStatus::Failed {
                            message: e.to_string(),
                        }
                    }
                }
            } else {
                info!(stage = %stage.name, "Stage completed successfully");
                StageStatus::Succeeded
            };

            self.emit(PipelineEvent::StageCompleted {
                stage: stage.name.clone(),
                status: status.clone(),
            })
            .await;
            stages.push(StageResult {
                name: stage.name.clone(),
                status,
                actions,
                started_at: Some(stage_started),
                finished_at: Some(Utc::now()),
            });
        }

        self.cleanup().await;

        info!(
            pipeline = %self.pipeline.name,
            run_id = %self.run_id,
            success = result.is_success(),
            "Pipeline run finished"
        );
        self.emit(PipelineEvent::RunCompleted {
            result: result.clone(),
        })
        .await;

        RunReport {
            run_id: self.run_id,
            pipeline: self.pipeline.name.clone(),
            result,
            stages,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Spawn every action of the stage and wait for all of them. Returns the
    /// results in declaration order and whether the run was cancelled.
    async fn run_stage(&self, index: usize, stage: &Stage) -> (Vec<ActionResult>, bool) {
        let mut set = JoinSet::new();
        let mut positions = HashMap::new();

        for (position, action) in stage.actions.iter().enumerate() {
            let mut variables = self.variables.clone();
            variables.stage.name = stage.name.clone();
            variables.stage.index = index;
            variables.action.name = action.name.clone();

            let run = ActionRun {
                services: self.services.clone(),
                pipeline: self.pipeline.clone(),
                run_id: self.run_id,
                stage: stage.name.clone(),
                action: action.clone(),
                variables,
                events: self.events.clone(),
            };
            let handle = set.spawn(run.execute());
            positions.insert(handle.id(), position);
        }

        let mut slots: Vec<Option<ActionResult>> = vec![None; stage.actions.len()];
        let mut cancel = self.cancel.clone();
        let mut was_cancelled = false;

        loop {
            tokio::select! {
                joined = set.join_next_with_id() => match joined {
                    Some(joined) => record(&mut slots, &positions, stage, joined),
                    None => break,
                },
                _ = cancelled(&mut cancel), if !was_cancelled => {
                    warn!(stage = %stage.name, "Cancelling in-flight actions");
                    was_cancelled = true;
                    set.abort_all();
                }
            }
        }

        let results = slots
            .into_iter()
            .zip(&stage.actions)
            .map(|(slot, action)| {
                slot.unwrap_or_else(|| ActionResult {
                    name: action.name.clone(),
                    status: ActionStatus::Cancelled,
                    output: None,
                    attempts: 0,
                })
            })
            .collect();
        (results, was_cancelled)
    }

    /// The definition carried by the self-mutation artifact, if it differs
    /// from the running one.
    async fn mutated_definition(&self) -> Result<Option<Pipeline>> {
        let Some(mutation) = &self.pipeline.self_mutation else {
            return Ok(None);
        };

        let data = self
            .services
            .store
            .get(&ArtifactKey::new(self.run_id, &mutation.artifact))
            .await?;
        let bundle = Bundle::from_bytes(&data)?;
        let contents = bundle.get(&mutation.file).ok_or_else(|| {
            Error::ArtifactNotFound(format!("{} in artifact '{}'", mutation.file, mutation.artifact))
        })?;
        let text = std::str::from_utf8(contents)
            .map_err(|e| Error::Internal(format!("{} is not UTF-8: {}", mutation.file, e)))?;

        let candidate = conveyor_config::parse_pipeline(text).map_err(|e| match e {
            ConfigError::Graph(detail) => Error::Configuration(detail),
            other => Error::Internal(format!("invalid pipeline definition: {}", other)),
        })?;

        if candidate == *self.pipeline {
            debug!(file = %mutation.file, "Pipeline definition unchanged");
            Ok(None)
        } else {
            Ok(Some(candidate))
        }
    }

    async fn cleanup(&self) {
        let run_dir = self.services.work_dir.join(self.run_id.to_string());
        if let Err(e) = tokio::fs::remove_dir_all(&run_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!(path = %run_dir.display(), error = %e, "Failed to remove run directory");
            }
        }

        if let Some(policy) = self.retention {
            match self.services.store.prune(policy).await {
                Ok(stats) => debug!(
                    runs = stats.runs_deleted,
                    artifacts = stats.artifacts_deleted,
                    "Applied retention"
                ),
                Err(e) => warn!(error = %e, "Artifact retention failed"),
            }
        }
    }

    async fn emit(&self, event: PipelineEvent) {
        let _ = self.events.send(event).await;
    }
}

fn record(
    slots: &mut [Option<ActionResult>],
    positions: &HashMap<tokio::task::Id, usize>,
    stage: &Stage,
    joined: std::result::Result<(tokio::task::Id, ActionResult), JoinError>,
) {
    match joined {
        Ok((id, result)) => {
            if let Some(&position) = positions.get(&id) {
                slots[position] = Some(result);
            }
        }
        Err(e) => {
            let Some(&position) = positions.get(&e.id()) else {
                return;
            };
            let status = if e.is_cancelled() {
                ActionStatus::Cancelled
            } else {
                error!(stage = %stage.name, action = %stage.actions[position].name, "Action task panicked");
                ActionStatus::Failed {
                    message: "action task panicked".to_string(),
                    exit_code: None,
                }
            };
            slots[position] = Some(ActionResult {
                name: stage.actions[position].name.clone(),
                status,
                output: None,
                attempts: 0,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockDeployer, MockRunner, MockSource, command_environment};
    use conveyor_core::GraphError;
    use conveyor_core::deployer::{DeployableUnit, RejectAll};
    use conveyor_core::pipeline::{Action, Stage};
    use conveyor_executor::MemoryArtifactStore;
    use std::time::Duration;

    struct Harness {
        runner: MockRunner,
        source: MockSource,
        deployer: MockDeployer,
        store: Arc<MemoryArtifactStore>,
        dir: tempfile::TempDir,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_runner(MockRunner::new())
        }

        fn with_runner(runner: MockRunner) -> Self {
            Self {
                runner,
                source: MockSource::new().with_file("Dockerfile", "FROM scratch"),
                deployer: MockDeployer::new(),
                store: Arc::new(MemoryArtifactStore::new()),
                dir: tempfile::tempdir().unwrap(),
            }
        }

        fn orchestrator(&self) -> PipelineOrchestrator {
            PipelineOrchestrator::new(self.store.clone(), self.dir.path())
                .with_runners(vec![self.runner.shared()])
                .with_source(self.source.shared())
                .with_deployer(self.deployer.clone().shared())
        }

        async fn run(&self, pipeline: &Pipeline) -> RunReport {
            self.orchestrator()
                .execute(pipeline)
                .unwrap()
                .wait()
                .await
                .unwrap()
        }
    }

    /// Source -> Build -> Deploy of unit `web` into `dev`.
    fn delivery(build_command: &str) -> Pipeline {
        Pipeline::new("web-delivery")
            .with_environment(command_environment("dev"))
            .with_unit(DeployableUnit::new("web", "web"))
            .with_stage(
                Stage::new("Source")
                    .with_action(Action::source("fetch", "https://example.com/web.git", "main").output("source")),
            )
            .with_stage(
                Stage::new("Build").with_action(
                    Action::build("build", [build_command, "image registry/web:42"])
                        .input("source")
                        .output("image")
                        .collect("imagedefinitions.json"),
                ),
            )
            .with_stage(
                Stage::new("Deploy")
                    .with_action(Action::deploy("deploy-web", "web", "dev").input("image")),
            )
    }

    #[tokio::test]
    async fn test_source_build_deploy() {
        let harness = Harness::new();
        let pipeline = delivery("ok");

        let report = harness.run(&pipeline).await;

        assert_eq!(report.result, RunResult::Success);
        assert_eq!(report.executed_actions(), pipeline.execution_order());
        assert_eq!(harness.deployer.images(), vec!["registry/web:42"]);
        assert_eq!(harness.runner.calls(), vec!["build"]);

        let stored = harness.store.list(&report.run_id).await.unwrap();
        let names: Vec<_> = stored.iter().map(|a| a.key.name.as_str()).collect();
        assert_eq!(names, vec!["image", "source"]);

        let image = harness
            .store
            .get(&ArtifactKey::new(report.run_id, "image"))
            .await
            .unwrap();
        let bundle = Bundle::from_bytes(&image).unwrap();
        assert_eq!(bundle.len(), 1);
        assert!(bundle.get("imagedefinitions.json").is_some());
    }

    #[tokio::test]
    async fn test_build_failure_stops_the_run() {
        let harness = Harness::new();

        let report = harness.run(&delivery("fail")).await;

        match &report.result {
            RunResult::Failed { stage, action, reason } => {
                assert_eq!(stage, "Build");
                assert_eq!(action, "build");
                assert!(reason.contains("exited with code 2"));
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert!(harness.deployer.deployed_to().is_empty());
        assert!(matches!(
            report.stage("Deploy").unwrap().status,
            StageStatus::Skipped { .. }
        ));
        assert_eq!(
            report.stage("Build").unwrap().actions[0].status,
            ActionStatus::Failed {
                message: "action 'build' failed: command `fail` exited with code 2".to_string(),
                exit_code: Some(2),
            }
        );
    }

    #[tokio::test]
    async fn test_forward_reference_runs_nothing() {
        let harness = Harness::new();
        let pipeline = Pipeline::new("backwards")
            .with_stage(Stage::new("Source").with_action(
                Action::source("fetch", "repo", "main").input("image").output("source"),
            ))
            .with_stage(
                Stage::new("Build")
                    .with_action(Action::build("build", ["ok"]).input("source").output("image")),
            );

        let err = harness.orchestrator().execute(&pipeline).err().unwrap();

        assert!(err.is_configuration());
        assert_eq!(harness.source.fetches(), 0);
        assert!(harness.runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_runtime_is_rejected() {
        let harness = Harness::new();
        let orchestrator = harness.orchestrator().with_deployers(DeployerRegistry::new());

        let err = orchestrator.execute(&delivery("ok")).err().unwrap();

        assert!(matches!(
            err,
            Error::Configuration(GraphError::UnknownRuntime { ref environment, .. }) if environment == "dev"
        ));
    }

    #[tokio::test]
    async fn test_runs_are_deterministic() {
        let harness = Harness::new();
        let pipeline = delivery("ok");

        let first = harness.run(&pipeline).await;
        let second = harness.run(&pipeline).await;

        assert_ne!(first.run_id, second.run_id);
        assert_eq!(first.executed_actions(), second.executed_actions());
        assert_eq!(first.result, second.result);
    }

    #[tokio::test]
    async fn test_actions_of_a_stage_run_concurrently() {
        // Both actions wait on a two-party barrier, so a sequential
        // stage would never finish.
        let harness = Harness::with_runner(MockRunner::with_barrier(2));
        let pipeline = Pipeline::new("parallel").with_stage(
            Stage::new("Test")
                .with_action(Action::build("unit", ["rendezvous"]))
                .with_action(Action::build("lint", ["rendezvous"])),
        );

        let report = tokio::time::timeout(Duration::from_secs(10), harness.run(&pipeline))
            .await
            .unwrap();

        assert!(report.is_success());
        let mut calls = harness.runner.calls();
        calls.sort();
        assert_eq!(calls, vec!["lint", "unit"]);
    }

    #[tokio::test]
    async fn test_first_failure_in_declaration_order_is_reported() {
        let harness = Harness::new();
        let pipeline = Pipeline::new("parallel")
            .with_stage(
                Stage::new("Test")
                    .with_action(Action::build("unit", ["ok"]))
                    .with_action(Action::build("lint", ["fail"]))
                    .with_action(Action::build("audit", ["fail"])),
            )
            .with_stage(Stage::new("Package").with_action(Action::build("package", ["ok"])));

        let report = harness.run(&pipeline).await;

        assert!(matches!(
            &report.result,
            RunResult::Failed { stage, action, .. } if stage == "Test" && action == "lint"
        ));
        // Sibling actions still run to completion.
        assert_eq!(report.stage("Test").unwrap().actions.len(), 3);
        assert!(!harness.runner.calls().contains(&"package".to_string()));
    }

    #[tokio::test]
    async fn test_cancel_aborts_in_flight_actions() {
        let harness = Harness::new();
        let pipeline = Pipeline::new("slow")
            .with_stage(Stage::new("Build").with_action(Action::build("build", ["hang"])))
            .with_stage(Stage::new("Later").with_action(Action::build("later", ["ok"])));

        let handle = harness.orchestrator().execute(&pipeline).unwrap();
        let (mut events, report, cancel) = handle.into_parts();

        while let Some(event) = events.recv().await {
            if matches!(event, PipelineEvent::ActionStarted { .. }) {
                break;
            }
        }
        cancel.cancel();
        drop(events);

        let report = tokio::time::timeout(Duration::from_secs(10), report)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            report.result,
            RunResult::Cancelled {
                stage: Some("Build".to_string())
            }
        );
        assert_eq!(
            report.stage("Build").unwrap().actions[0].status,
            ActionStatus::Cancelled
        );
        assert!(matches!(
            report.stage("Later").unwrap().status,
            StageStatus::Skipped { .. }
        ));
    }

    #[tokio::test]
    async fn test_timeout_fails_the_action() {
        let harness = Harness::new();
        let pipeline = Pipeline::new("slow").with_stage(Stage::new("Build").with_action(
            Action::build("build", ["hang"]).timeout(Duration::from_millis(50)),
        ));

        let report = harness.run(&pipeline).await;

        assert!(matches!(
            &report.result,
            RunResult::Failed { reason, .. } if reason.starts_with("timeout")
        ));
    }

    #[tokio::test]
    async fn test_retries_recover_flaky_actions() {
        let harness = Harness::new();
        let pipeline = Pipeline::new("flaky").with_stage(
            Stage::new("Build").with_action(Action::build("build", ["flaky"]).retries(1)),
        );

        let report = harness.run(&pipeline).await;

        assert!(report.is_success());
        let action = &report.stage("Build").unwrap().actions[0];
        assert_eq!(action.attempts, 2);
        assert_eq!(harness.runner.calls(), vec!["build", "build"]);
    }

    #[tokio::test]
    async fn test_rejected_approval_fails_deploy() {
        let harness = Harness::new();
        let mut pipeline = delivery("ok");
        pipeline.environments[0].requires_approval = true;

        let report = harness
            .orchestrator()
            .with_approval(Arc::new(RejectAll))
            .execute(&pipeline)
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert!(matches!(
            &report.result,
            RunResult::Failed { stage, reason, .. } if stage == "Deploy" && reason.contains("not approved")
        ));
        assert_eq!(report.stage("Deploy").unwrap().actions[0].attempts, 0);
        assert!(harness.deployer.deployed_to().is_empty());
    }

    #[tokio::test]
    async fn test_promotion_stages_stop_at_first_failure() {
        let mut harness = Harness::new();
        harness.deployer = MockDeployer::new().failing_in("staging");
        let mut pipeline = delivery("ok");
        pipeline.stages.pop();
        pipeline.environments = ["dev", "staging", "prod"].map(command_environment).to_vec();
        pipeline.promote_through("web", "image", &["dev", "staging", "prod"]);

        let report = harness.run(&pipeline).await;

        assert!(matches!(
            &report.result,
            RunResult::Failed { stage, action, .. } if stage == "Deploy-staging" && action == "deploy-web"
        ));
        assert_eq!(harness.deployer.deployed_to(), vec!["dev"]);
        assert!(matches!(
            report.stage("Deploy-prod").unwrap().status,
            StageStatus::Skipped { .. }
        ));
    }

    #[tokio::test]
    async fn test_retention_keeps_newest_runs() {
        let harness = Harness::new();
        let orchestrator = harness
            .orchestrator()
            .with_retention(RetentionPolicy { keep_runs: 1 });
        let pipeline = delivery("ok");

        let first = orchestrator.execute(&pipeline).unwrap().wait().await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        let second = orchestrator.execute(&pipeline).unwrap().wait().await.unwrap();

        assert!(harness.store.list(&first.run_id).await.unwrap().is_empty());
        assert_eq!(harness.store.list(&second.run_id).await.unwrap().len(), 2);
    }

    const SELF_UPDATING: &str = r#"
        pipeline "self-updating"
        self-mutation artifact="source" file="conveyor.kdl"

        stage "Source" {
            source "fetch" repository="https://example.com/web.git" output="source"
        }
        stage "Build" {
            build "build" input="source" {
                run "ok"
            }
        }
    "#;

    #[tokio::test]
    async fn test_unchanged_definition_continues() {
        let harness = Harness::new();
        harness.source.set_file("conveyor.kdl", SELF_UPDATING);
        let pipeline = conveyor_config::parse_pipeline(SELF_UPDATING).unwrap();

        let report = harness.run(&pipeline).await;

        assert!(report.is_success());
        assert_eq!(harness.runner.calls(), vec!["build"]);
    }

    #[tokio::test]
    async fn test_changed_definition_restarts() {
        let harness = Harness::new();
        let updated = SELF_UPDATING.replace("run \"ok\"", "run \"ok\"\n                run \"ok\"");
        harness.source.set_file("conveyor.kdl", &updated);
        let pipeline = conveyor_config::parse_pipeline(SELF_UPDATING).unwrap();

        let report = harness.run(&pipeline).await;

        match &report.result {
            RunResult::Mutated { stage, pipeline } => {
                assert_eq!(stage, "Source");
                assert_eq!(**pipeline, conveyor_config::parse_pipeline(&updated).unwrap());
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert!(harness.runner.calls().is_empty());
        assert!(matches!(
            report.stage("Build").unwrap().status,
            StageStatus::Skipped { .. }
        ));
    }

    #[tokio::test]
    async fn test_events_follow_the_run() {
        let harness = Harness::new();
        let handle = harness.orchestrator().execute(&delivery("ok")).unwrap();
        let (mut events, report, _cancel) = handle.into_parts();

        let mut seen = Vec::new();
        while let Some(event) = events.recv().await {
            seen.push(event);
        }
        report.await.unwrap();

        assert!(matches!(seen.first(), Some(PipelineEvent::RunStarted { .. })));
        assert!(matches!(
            seen.last(),
            Some(PipelineEvent::RunCompleted { result: RunResult::Success })
        ));
        let stages: Vec<_> = seen
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::StageStarted { stage } => Some(stage.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(stages, vec!["Source", "Build", "Deploy"]);
        assert!(seen.iter().any(|e| matches!(
            e,
            PipelineEvent::ActionLog { action, .. } if action == "build"
        )));
        assert!(seen.iter().any(|e| matches!(
            e,
            PipelineEvent::ArtifactStored { artifact, .. } if artifact.key.name == "image"
        )));
    }
}
