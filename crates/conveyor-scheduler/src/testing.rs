//! Test doubles for the orchestrator seams.

use async_trait::async_trait;
use chrono::Utc;
use conveyor_core::deployer::{
    Deployer, DeploymentHandle, DeploymentSpec, EnvironmentDescriptor, RuntimeTarget,
};
use conveyor_core::executor::{CommandOutcome, CommandRunner, CommandSpec, LogLine, LogStream};
use conveyor_core::source::{SourceProvider, SourceRevision};
use conveyor_core::{Error, Result};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Barrier;
use tokio::sync::mpsc::UnboundedSender;

pub fn command_environment(name: &str) -> EnvironmentDescriptor {
    EnvironmentDescriptor::new(
        name,
        RuntimeTarget::Command {
            deploy: "true".to_string(),
            probe: None,
        },
    )
}

#[derive(Default)]
struct DeployerState {
    failing: HashSet<String>,
    unreachable: HashSet<String>,
    deployed: Vec<(String, String)>,
}

/// Serves `command` environments and remembers what it deployed.
#[derive(Clone, Default)]
pub struct MockDeployer {
    state: Arc<Mutex<DeployerState>>,
}

impl MockDeployer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_in(self, environment: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .failing
            .insert(environment.to_string());
        self
    }

    pub fn unreachable(self, environment: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .unreachable
            .insert(environment.to_string());
        self
    }

    pub fn shared(self) -> Arc<dyn Deployer> {
        Arc::new(self)
    }

    pub fn deployed_to(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.deployed.iter().map(|(env, _)| env.clone()).collect()
    }

    pub fn images(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.deployed.iter().map(|(_, image)| image.clone()).collect()
    }
}

#[async_trait]
impl Deployer for MockDeployer {
    fn name(&self) -> &'static str {
        "command"
    }

    async fn probe(&self, environment: &EnvironmentDescriptor) -> Result<()> {
        if self.state.lock().unwrap().unreachable.contains(&environment.name) {
            return Err(Error::EnvironmentUnreachable {
                environment: environment.name.clone(),
                message: "connection refused".to_string(),
            });
        }
        Ok(())
    }

    async fn deploy(&self, spec: DeploymentSpec) -> Result<DeploymentHandle> {
        let mut state = self.state.lock().unwrap();
        if state.failing.contains(&spec.environment.name) {
            return Err(Error::DeploymentFailed(format!(
                "{} rejected the rollout",
                spec.environment.name
            )));
        }
        state
            .deployed
            .push((spec.environment.name.clone(), spec.image.clone()));
        Ok(DeploymentHandle {
            id: spec.id,
            deployer_id: spec.unit.name.clone(),
            deployer_name: "command".to_string(),
            environment: spec.environment.name,
            image: spec.image,
            deployed_at: Utc::now(),
        })
    }
}

/// Interprets each command as a tiny instruction:
///
/// - `ok` succeeds
/// - `fail` exits 2
/// - `hang` sleeps for an hour
/// - `flaky` fails on the first call only
/// - `rendezvous` waits on the shared barrier
/// - `image <ref>` writes `imagedefinitions.json` for container `web`
#[derive(Clone)]
pub struct MockRunner {
    calls: Arc<Mutex<Vec<String>>>,
    flaky_seen: Arc<Mutex<HashSet<String>>>,
    barrier: Arc<Barrier>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::with_barrier(1)
    }

    pub fn with_barrier(parties: usize) -> Self {
        Self {
            calls: Arc::default(),
            flaky_seen: Arc::default(),
            barrier: Arc::new(Barrier::new(parties)),
        }
    }

    pub fn shared(&self) -> Arc<dyn CommandRunner> {
        Arc::new(self.clone())
    }

    /// Actions run so far, in start order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for MockRunner {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn can_run(&self, _spec: &CommandSpec) -> bool {
        true
    }

    async fn run(&self, spec: CommandSpec, logs: UnboundedSender<LogLine>) -> Result<CommandOutcome> {
        self.calls.lock().unwrap().push(spec.action.clone());

        for command in &spec.commands {
            let _ = logs.send(LogLine::new(LogStream::System, format!("$ {}", command)));
            let failed = |code: i32| CommandOutcome::Failed {
                command: command.clone(),
                exit_code: Some(code),
                message: format!("command `{}` exited with code {}", command, code),
            };

            match command.split_once(' ').unwrap_or((command.as_str(), "")) {
                ("ok", _) => {}
                ("fail", _) => return Ok(failed(2)),
                ("hang", _) => tokio::time::sleep(Duration::from_secs(3600)).await,
                ("flaky", _) => {
                    if self.flaky_seen.lock().unwrap().insert(spec.action.clone()) {
                        return Ok(failed(1));
                    }
                }
                ("rendezvous", _) => {
                    self.barrier.wait().await;
                }
                ("image", reference) => {
                    let definitions = format!(r#"[{{"name": "web", "imageUri": "{}"}}]"#, reference);
                    tokio::fs::write(spec.workspace.join("imagedefinitions.json"), definitions).await?;
                }
                (other, _) => panic!("unknown mock command {}", other),
            }
        }

        Ok(CommandOutcome::Succeeded)
    }
}

/// Checks out a fixed set of files.
#[derive(Clone, Default)]
pub struct MockSource {
    files: Arc<Mutex<BTreeMap<String, String>>>,
    fetches: Arc<Mutex<usize>>,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, path: &str, contents: &str) -> Self {
        self.set_file(path, contents);
        self
    }

    pub fn set_file(&self, path: &str, contents: &str) {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), contents.to_string());
    }

    pub fn shared(&self) -> Arc<dyn SourceProvider> {
        Arc::new(self.clone())
    }

    pub fn fetches(&self) -> usize {
        *self.fetches.lock().unwrap()
    }
}

#[async_trait]
impl SourceProvider for MockSource {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn fetch(&self, _repository: &str, _branch: &str, dest: &Path) -> Result<SourceRevision> {
        *self.fetches.lock().unwrap() += 1;
        let files = self.files.lock().unwrap().clone();
        for (path, contents) in files {
            tokio::fs::write(dest.join(path), contents).await?;
        }
        Ok(SourceRevision {
            commit: Some("abc123".to_string()),
        })
    }
}
