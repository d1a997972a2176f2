//! CLI command implementations.

pub mod approval;
pub mod promote;
pub mod run;

use anyhow::{Context, Result};
use conveyor_core::pipeline::{ActionKind, Pipeline};
use std::path::{Path, PathBuf};

/// `$CONVEYOR_WORK_DIR` when unset.
pub fn default_work_dir() -> PathBuf {
    std::env::temp_dir().join("conveyor")
}

pub fn load(path: &Path) -> Result<Pipeline> {
    conveyor_config::parse_pipeline_file(path)
        .with_context(|| format!("Failed to load pipeline definition: {}", path.display()))
}

pub fn validate(path: &Path) -> Result<()> {
    let pipeline = load(path)?;
    println!(
        "Configuration is valid: pipeline '{}' with {} stages",
        pipeline.name,
        pipeline.stages.len()
    );
    Ok(())
}

pub fn plan(path: &Path) -> Result<()> {
    let pipeline = load(path)?;
    print!("{}", describe(&pipeline));
    Ok(())
}

/// Human-readable execution plan.
fn describe(pipeline: &Pipeline) -> String {
    let mut out = format!("Pipeline: {}\n", pipeline.name);
    if let Some(mutation) = &pipeline.self_mutation {
        out.push_str(&format!(
            "Self-mutating from {} in artifact '{}'\n",
            mutation.file, mutation.artifact
        ));
    }

    for (index, stage) in pipeline.stages.iter().enumerate() {
        out.push_str(&format!("{}. {}\n", index + 1, stage.name));
        for action in &stage.actions {
            let detail = match &action.kind {
                ActionKind::Source { repository, branch } => format!("{}@{}", repository, branch),
                ActionKind::Build { image, commands, .. } => match image {
                    Some(image) => format!("{} commands in {}", commands.len(), image),
                    None => format!("{} commands on host", commands.len()),
                },
                ActionKind::Deploy {
                    unit, environment, ..
                } => format!("{} -> {}", unit, environment),
            };
            out.push_str(&format!(
                "   - {} [{}] {}",
                action.name,
                action.kind.label(),
                detail
            ));
            if !action.inputs.is_empty() {
                out.push_str(&format!(" (in: {})", action.inputs.join(", ")));
            }
            if let Some(output) = &action.output {
                out.push_str(&format!(" (out: {})", output));
            }
            out.push('\n');
        }
    }
    out
}
