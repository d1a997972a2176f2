//! Local pipeline execution command.

use anyhow::{Context, Result};
use conveyor_config::VariableContext;
use conveyor_core::artifact::RetentionPolicy;
use conveyor_core::deployer::{ApprovalGate, AutoApprove};
use conveyor_core::executor::LogStream;
use conveyor_core::pipeline::{ActionStatus, Pipeline, RunReport, RunResult, StageStatus};
use conveyor_executor::{DockerRunner, FsArtifactStore};
use conveyor_scheduler::{PipelineEvent, PipelineOrchestrator};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use super::approval::ConsoleApproval;

pub struct RunOptions {
    pub approve: bool,
    pub vars: Vec<(String, String)>,
    pub keep_runs: Option<usize>,
    pub work_dir: PathBuf,
    pub max_restarts: u32,
}

pub fn approval_gate(approve: bool) -> Arc<dyn ApprovalGate> {
    if approve {
        Arc::new(AutoApprove)
    } else {
        Arc::new(ConsoleApproval::new())
    }
}

fn orchestrator(options: &RunOptions) -> PipelineOrchestrator {
    let mut variables = VariableContext::new();
    variables.populate_env();
    for (name, value) in &options.vars {
        variables.set(name, value.clone());
    }

    let store = Arc::new(FsArtifactStore::new(options.work_dir.join("artifacts")));
    let mut orchestrator = PipelineOrchestrator::new(store, options.work_dir.join("workspaces"))
        .with_variables(variables)
        .with_approval(approval_gate(options.approve));

    match DockerRunner::new() {
        Ok(docker) => orchestrator = orchestrator.with_runner(Arc::new(docker)),
        Err(e) => debug!(error = %e, "Docker unavailable, image builds will fail"),
    }
    if let Some(keep_runs) = options.keep_runs {
        orchestrator = orchestrator.with_retention(RetentionPolicy { keep_runs });
    }
    orchestrator
}

/// Create the work directory and resolve it to an absolute path. Docker
/// reads a relative bind source as a volume name.
fn prepare_work_dir(work_dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(work_dir)
        .with_context(|| format!("Failed to create work directory {}", work_dir.display()))?;
    work_dir
        .canonicalize()
        .with_context(|| format!("Failed to resolve work directory {}", work_dir.display()))
}

/// Run a pipeline, restarting it when it rewrites its own definition.
pub async fn run(path: &Path, mut options: RunOptions) -> Result<()> {
    let mut pipeline = super::load(path)?;
    options.work_dir = prepare_work_dir(&options.work_dir)?;
    let orchestrator = orchestrator(&options);
    println!("Working directory: {}", options.work_dir.display());

    let mut restarts = 0;
    loop {
        let report = execute(&orchestrator, &pipeline).await?;
        print_summary(&report);

        match report.result {
            RunResult::Success => {
                println!("\n✓ Pipeline succeeded!");
                return Ok(());
            }
            RunResult::Mutated {
                stage,
                pipeline: next,
            } => {
                restarts += 1;
                if restarts > options.max_restarts {
                    anyhow::bail!(
                        "Pipeline definition kept changing; gave up after {} restarts",
                        options.max_restarts
                    );
                }
                println!(
                    "\n↻ Stage '{}' changed the pipeline definition, restarting",
                    stage
                );
                pipeline = *next;
            }
            RunResult::Failed {
                stage,
                action,
                reason,
            } => {
                anyhow::bail!(
                    "Pipeline failed in stage '{}', action '{}': {}",
                    stage,
                    action,
                    reason
                );
            }
            RunResult::Cancelled { .. } => {
                anyhow::bail!("Pipeline cancelled");
            }
        }
    }
}

async fn execute(orchestrator: &PipelineOrchestrator, pipeline: &Pipeline) -> Result<RunReport> {
    println!("Running pipeline: {}", pipeline.name);
    println!("Stages: {}", pipeline.stages.len());

    let handle = orchestrator
        .execute(pipeline)
        .context("Pipeline definition is invalid")?;
    println!("Run: {}", handle.run_id);
    println!("\n--- Starting pipeline execution ---\n");

    let canceller = handle.canceller();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling run");
            canceller.cancel();
        }
    });

    let (mut events, report, _cancel) = handle.into_parts();
    while let Some(event) = events.recv().await {
        print_event(event);
    }

    let report = report.await.context("Pipeline execution task failed");
    interrupt.abort();
    report
}

fn print_event(event: PipelineEvent) {
    match event {
        PipelineEvent::StageStarted { stage } => {
            println!("▶ Stage '{}' started", stage);
        }
        PipelineEvent::ActionLog {
            stage,
            action,
            line,
        } => {
            let stream_marker = match line.stream {
                LogStream::Stdout => " ",
                LogStream::Stderr => "!",
                LogStream::System => "*",
            };
            println!("  [{}/{}]{} {}", stage, action, stream_marker, line.content);
        }
        PipelineEvent::ArtifactStored { action, artifact, .. } => {
            println!(
                "  [{}] stored artifact '{}' ({} bytes, sha256 {})",
                action, artifact.key.name, artifact.size, artifact.checksum
            );
        }
        PipelineEvent::ActionCompleted {
            stage,
            action,
            status,
        } => {
            if let ActionStatus::Failed { message, .. } = status {
                println!("  [{}/{}] failed: {}", stage, action, message);
            }
        }
        PipelineEvent::StageCompleted { stage, status } => match status {
            StageStatus::Succeeded => println!("✓ Stage '{}' completed successfully\n", stage),
            _ => println!("✗ Stage '{}' did not succeed\n", stage),
        },
        PipelineEvent::RunStarted { .. }
        | PipelineEvent::ActionStarted { .. }
        | PipelineEvent::RunCompleted { .. } => {}
    }
}

fn print_summary(report: &RunReport) {
    println!("\n--- Stage Summary ---");
    for stage in &report.stages {
        let status = match &stage.status {
            StageStatus::Succeeded => "✓ succeeded".to_string(),
            StageStatus::Failed { message } => format!("✗ failed: {}", message),
            StageStatus::Skipped { reason } => format!("⊘ skipped: {}", reason),
            StageStatus::Cancelled => "⊘ cancelled".to_string(),
        };
        println!("  {} - {}", stage.name, status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_work_dir_is_created_and_absolute() {
        let dir = tempfile::tempdir().unwrap();
        let requested = dir.path().join("runs").join("..").join("conveyor");

        let work_dir = prepare_work_dir(&requested).unwrap();

        assert!(work_dir.is_absolute());
        assert!(work_dir.is_dir());
        assert!(work_dir.ends_with("conveyor"));
        assert!(!work_dir.components().any(|c| c == std::path::Component::ParentDir));
    }

    #[test]
    fn test_relative_work_dir_becomes_absolute() {
        let work_dir = prepare_work_dir(Path::new(".")).unwrap();
        assert!(work_dir.is_absolute());
        assert_eq!(work_dir, std::env::current_dir().unwrap().canonicalize().unwrap());
    }
}
