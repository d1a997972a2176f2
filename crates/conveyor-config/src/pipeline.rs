//! Pipeline configuration parsing.
//!
//! ```kdl
//! pipeline "plan-apt"
//! self-mutation artifact="source" file="conveyor.kdl"
//!
//! environment "staging" account="123456789012" region="us-gov-west-1" {
//!     kubernetes namespace="staging"
//! }
//!
//! unit "apt-test" container="apttest" port=3000
//!
//! stage "Source" {
//!     source "fetch" repository="https://example.com/apt.git" branch="main" output="source"
//! }
//! stage "Build" {
//!     build "image" input="source" output="image" {
//!         run "make image"
//!         artifact "imagedefinitions.json"
//!     }
//! }
//! promote "apt-test" input="image" {
//!     environment "staging"
//! }
//! ```

use crate::{ConfigError, ConfigResult};
use conveyor_core::deployer::{DeployableUnit, EnvironmentDescriptor, RuntimeTarget};
use conveyor_core::graph;
use conveyor_core::pipeline::{Action, ActionKind, DEFAULT_IMAGE_FILE, Pipeline, SelfMutation, Stage};
use kdl::{KdlDocument, KdlNode};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Read and parse a pipeline definition file.
pub fn parse_pipeline_file(path: impl AsRef<Path>) -> ConfigResult<Pipeline> {
    let content = std::fs::read_to_string(path)?;
    parse_pipeline(&content)
}

/// Parse a pipeline configuration from KDL text. The result is validated.
pub fn parse_pipeline(kdl: &str) -> ConfigResult<Pipeline> {
    let doc: KdlDocument = kdl.parse()?;

    let mut name: Option<String> = None;
    let mut pipeline = Pipeline::new(String::new());

    for node in doc.nodes() {
        match node.name().value() {
            "pipeline" => {
                if name.is_some() {
                    return Err(ConfigError::Duplicate("pipeline".to_string()));
                }
                name = Some(
                    get_first_string_arg(node)
                        .ok_or_else(|| ConfigError::MissingField("pipeline name".to_string()))?,
                );
            }
            "self-mutation" => {
                pipeline.self_mutation = Some(SelfMutation {
                    artifact: require_string_prop(node, "artifact", "self-mutation")?,
                    file: require_string_prop(node, "file", "self-mutation")?,
                });
            }
            "env" => {
                pipeline.env.extend(parse_env_block(node));
            }
            "environment" => {
                pipeline.environments.push(parse_environment(node)?);
            }
            "unit" => {
                pipeline.units.push(parse_unit(node)?);
            }
            "stage" => {
                pipeline.stages.push(parse_stage(node)?);
            }
            "promote" => {
                let unit = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("promote unit".to_string()))?;
                let input = require_string_prop(node, "input", "promote")?;
                let environments = child_args(node, "environment");
                if environments.is_empty() {
                    return Err(ConfigError::MissingField(format!(
                        "environments for promotion of '{}'",
                        unit
                    )));
                }
                pipeline.promote_through(&unit, &input, &environments);
            }
            _ => {} // Ignore unknown nodes
        }
    }

    pipeline.name = name.ok_or_else(|| ConfigError::MissingField("pipeline name".to_string()))?;

    graph::validate(&pipeline)?;

    Ok(pipeline)
}

fn parse_environment(node: &KdlNode) -> ConfigResult<EnvironmentDescriptor> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("environment name".to_string()))?;

    let mut runtime: Option<RuntimeTarget> = None;
    let mut variables = HashMap::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            let target = match child.name().value() {
                "kubernetes" => RuntimeTarget::Kubernetes {
                    namespace: get_string_prop(child, "namespace")
                        .unwrap_or_else(|| "default".to_string()),
                    context: get_string_prop(child, "context"),
                },
                "command" => RuntimeTarget::Command {
                    deploy: get_first_string_arg(child).ok_or_else(|| {
                        ConfigError::MissingField(format!("deploy command for environment '{}'", name))
                    })?,
                    probe: get_string_prop(child, "probe"),
                },
                "variables" | "env" => {
                    variables.extend(parse_env_block(child));
                    continue;
                }
                _ => continue,
            };
            if runtime.replace(target).is_some() {
                return Err(ConfigError::Duplicate(format!(
                    "runtime for environment '{}'",
                    name
                )));
            }
        }
    }

    let runtime = runtime.ok_or_else(|| {
        ConfigError::MissingField(format!("runtime for environment '{}'", name))
    })?;

    Ok(EnvironmentDescriptor {
        account: get_string_prop(node, "account"),
        region: get_string_prop(node, "region"),
        network: get_string_prop(node, "network"),
        requires_approval: get_bool_prop(node, "approval").unwrap_or(false),
        runtime,
        variables,
        name,
    })
}

fn parse_unit(node: &KdlNode) -> ConfigResult<DeployableUnit> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("unit name".to_string()))?;
    let container = get_string_prop(node, "container").unwrap_or_else(|| name.clone());

    let mut unit = DeployableUnit::new(name, container);
    unit.port = get_int_prop(node, "port")?;
    unit.cpu = get_int_prop(node, "cpu")?;
    unit.memory_mib = get_int_prop(node, "memory")?;
    if let Some(count) = get_int_prop(node, "desired-count")? {
        unit.desired_count = count;
    }
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == "env" {
                unit.env.extend(parse_env_block(child));
            }
        }
    }
    Ok(unit)
}

fn parse_stage(node: &KdlNode) -> ConfigResult<Stage> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("stage name".to_string()))?;

    let mut stage = Stage::new(name);
    if let Some(children) = node.children() {
        for child in children.nodes() {
            stage.actions.push(parse_action(child, &stage.name)?);
        }
    }
    Ok(stage)
}

fn parse_action(node: &KdlNode, stage: &str) -> ConfigResult<Action> {
    let kind_name = node.name().value();
    let name = get_first_string_arg(node).ok_or_else(|| {
        ConfigError::MissingField(format!("{} action name in stage '{}'", kind_name, stage))
    })?;

    let kind = match kind_name {
        "source" => ActionKind::Source {
            repository: require_string_prop(node, "repository", &name)?,
            branch: get_string_prop(node, "branch").unwrap_or_else(|| "main".to_string()),
        },
        "build" => {
            let mut image = None;
            let mut commands = Vec::new();
            let mut artifacts = Vec::new();
            let mut env = HashMap::new();

            if let Some(children) = node.children() {
                for child in children.nodes() {
                    match child.name().value() {
                        "image" => image = get_first_string_arg(child),
                        "run" => {
                            if let Some(cmd) = get_first_string_arg(child) {
                                commands.push(cmd);
                            }
                        }
                        "artifact" | "artifacts" => artifacts.extend(get_all_string_args(child)),
                        "env" => env.extend(parse_env_block(child)),
                        _ => {}
                    }
                }
            }

            ActionKind::Build {
                image,
                commands,
                env,
                artifacts,
            }
        }
        "deploy" => ActionKind::Deploy {
            unit: require_string_prop(node, "unit", &name)?,
            environment: require_string_prop(node, "environment", &name)?,
            image_file: get_string_prop(node, "image-file")
                .unwrap_or_else(|| DEFAULT_IMAGE_FILE.to_string()),
        },
        other => {
            return Err(ConfigError::InvalidValue {
                field: format!("action kind in stage '{}'", stage),
                message: format!("unknown action kind: {}", other),
            });
        }
    };

    Ok(Action {
        inputs: get_string_list_prop(node, "input"),
        output: get_string_prop(node, "output"),
        timeout: get_int_prop::<u64>(node, "timeout")?.map(Duration::from_secs),
        retries: get_int_prop(node, "retries")?.unwrap_or(0),
        kind,
        name,
    })
}

fn parse_env_block(node: &KdlNode) -> HashMap<String, String> {
    let mut env = HashMap::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            let key = child.name().value().to_string();
            if let Some(val) = get_first_string_arg(child) {
                env.insert(key, val);
            }
        }
    }
    env
}

// Helper functions for extracting values from KDL nodes

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

/// First string argument of every child named `name`.
fn child_args(node: &KdlNode, name: &str) -> Vec<String> {
    node.children()
        .map(|children| {
            children
                .nodes()
                .iter()
                .filter(|c| c.name().value() == name)
                .filter_map(get_first_string_arg)
                .collect()
        })
        .unwrap_or_default()
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn require_string_prop(node: &KdlNode, name: &str, owner: &str) -> ConfigResult<String> {
    get_string_prop(node, name)
        .ok_or_else(|| ConfigError::MissingField(format!("{} of '{}'", name, owner)))
}

fn get_bool_prop(node: &KdlNode, name: &str) -> Option<bool> {
    node.get(name).and_then(|v| v.as_bool())
}

fn get_int_prop<T: TryFrom<i128>>(node: &KdlNode, name: &str) -> ConfigResult<Option<T>> {
    let Some(value) = node.get(name) else {
        return Ok(None);
    };
    let invalid = || ConfigError::InvalidValue {
        field: name.to_string(),
        message: format!("expected a non-negative integer, got {:?}", value),
    };
    let int = value.as_integer().ok_or_else(invalid)?;
    T::try_from(int).map(Some).map_err(|_| invalid())
}

fn get_string_list_prop(node: &KdlNode, name: &str) -> Vec<String> {
    let mut result = Vec::new();

    // Repeated properties (input="a" input="b")
    for entry in node.entries() {
        if let Some(entry_name) = entry.name() {
            if entry_name.value() == name {
                if let Some(s) = entry.value().as_string() {
                    result.push(s.to_string());
                }
            }
        }
    }

    if !result.is_empty() {
        return result;
    }

    // Block syntax: input "a" "b"
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == name {
                return get_all_string_args(child);
            }
        }
    }

    Vec::new()
}
