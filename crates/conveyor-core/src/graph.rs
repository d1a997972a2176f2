//! Static validation of the stage / action / artifact graph.
//!
//! A pipeline is only runnable when every consumed artifact has exactly one
//! producer and that producer sits in a strictly earlier stage. Stage order
//! is the only ordering, so this also rules out cycles.

use std::collections::{HashMap, HashSet};

use crate::error::GraphError;
use crate::pipeline::{ActionKind, Pipeline};

/// Where an artifact comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Producer<'a> {
    pub stage_index: usize,
    pub stage: &'a str,
    pub action: &'a str,
}

/// Map every produced artifact to its producer.
pub fn producers(pipeline: &Pipeline) -> Result<HashMap<&str, Producer<'_>>, GraphError> {
    let mut producers: HashMap<&str, Producer<'_>> = HashMap::new();
    for (stage_index, stage) in pipeline.stages.iter().enumerate() {
        for action in &stage.actions {
            let Some(artifact) = action.output.as_deref() else {
                continue;
            };
            if let Some(first) = producers.get(artifact) {
                return Err(GraphError::DuplicateProducer {
                    artifact: artifact.to_string(),
                    first: first.action.to_string(),
                    second: action.name.clone(),
                });
            }
            producers.insert(
                artifact,
                Producer {
                    stage_index,
                    stage: &stage.name,
                    action: &action.name,
                },
            );
        }
    }
    Ok(producers)
}

/// Validate a pipeline definition. Returns the first problem found, in
/// declaration order.
pub fn validate(pipeline: &Pipeline) -> Result<(), GraphError> {
    if pipeline.stages.is_empty() {
        return Err(GraphError::EmptyPipeline(pipeline.name.clone()));
    }

    unique("environment", pipeline.environments.iter().map(|e| e.name.as_str()))?;
    unique("unit", pipeline.units.iter().map(|u| u.name.as_str()))?;

    let mut stage_names = HashSet::new();
    for stage in &pipeline.stages {
        if !stage_names.insert(stage.name.as_str()) {
            return Err(GraphError::DuplicateStage(stage.name.clone()));
        }
        if stage.actions.is_empty() {
            return Err(GraphError::EmptyStage(stage.name.clone()));
        }
        let mut action_names = HashSet::new();
        for action in &stage.actions {
            if !action_names.insert(action.name.as_str()) {
                return Err(GraphError::DuplicateAction {
                    stage: stage.name.clone(),
                    action: action.name.clone(),
                });
            }
        }
    }

    let producers = producers(pipeline)?;

    for (stage_index, stage) in pipeline.stages.iter().enumerate() {
        for action in &stage.actions {
            check_action_kind(pipeline, &action.name, &action.kind, &action.inputs)?;

            for input in &action.inputs {
                let producer =
                    producers
                        .get(input.as_str())
                        .ok_or_else(|| GraphError::UnknownArtifact {
                            action: action.name.clone(),
                            artifact: input.clone(),
                        })?;
                if producer.stage_index >= stage_index {
                    return Err(GraphError::ForwardReference {
                        action: action.name.clone(),
                        stage: stage.name.clone(),
                        artifact: input.clone(),
                        producer_stage: producer.stage.to_string(),
                    });
                }
            }
        }
    }

    if let Some(mutation) = &pipeline.self_mutation {
        if !producers.contains_key(mutation.artifact.as_str()) {
            return Err(GraphError::UnknownMutationArtifact(mutation.artifact.clone()));
        }
    }

    Ok(())
}

/// Check that every environment's runtime is served by one of `deployers`.
pub fn validate_runtimes(pipeline: &Pipeline, deployers: &[&str]) -> Result<(), GraphError> {
    for environment in &pipeline.environments {
        let runtime = environment.runtime.kind();
        if !deployers.contains(&runtime) {
            return Err(GraphError::UnknownRuntime {
                environment: environment.name.clone(),
                runtime: runtime.to_string(),
            });
        }
    }
    Ok(())
}

fn check_action_kind(
    pipeline: &Pipeline,
    action: &str,
    kind: &ActionKind,
    inputs: &[String],
) -> Result<(), GraphError> {
    let invalid = |message: &str| GraphError::InvalidAction {
        action: action.to_string(),
        message: message.to_string(),
    };

    match kind {
        ActionKind::Source { repository, .. } => {
            if !inputs.is_empty() {
                return Err(invalid("source actions take no input artifacts"));
            }
            if repository.is_empty() {
                return Err(invalid("source repository is empty"));
            }
        }
        ActionKind::Build { commands, .. } => {
            if commands.is_empty() {
                return Err(invalid("build actions need at least one command"));
            }
        }
        ActionKind::Deploy {
            unit, environment, ..
        } => {
            if inputs.is_empty() {
                return Err(invalid(
                    "deploy actions need an input artifact carrying the image reference",
                ));
            }
            if pipeline.unit(unit).is_none() {
                return Err(GraphError::UnknownUnit {
                    action: action.to_string(),
                    unit: unit.clone(),
                });
            }
            if pipeline.environment(environment).is_none() {
                return Err(GraphError::UnknownEnvironment {
                    action: action.to_string(),
                    environment: environment.clone(),
                });
            }
        }
    }
    Ok(())
}

fn unique<'a>(kind: &'static str, names: impl Iterator<Item = &'a str>) -> Result<(), GraphError> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(GraphError::DuplicateName {
                kind,
                name: name.to_string(),
            });
        }
    }
    Ok(())
}
