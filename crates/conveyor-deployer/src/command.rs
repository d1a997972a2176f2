//! Deployer that shells out to a user-supplied command.

use async_trait::async_trait;
use chrono::Utc;
use conveyor_config::VariableContextBuilder;
use conveyor_core::deployer::{Deployer, DeploymentHandle, DeploymentSpec, EnvironmentDescriptor, RuntimeTarget};
use conveyor_core::{Error, Result};
use std::collections::HashMap;
use std::process::{Output, Stdio};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Runs the environment's `deploy` command with `sh -c`.
///
/// Commands see `${image}`, `${unit.*}` and `${environment.*}` through
/// interpolation, and the unit's and environment's variables as process
/// environment.
pub struct CommandDeployer {
    shell: String,
}

impl CommandDeployer {
    pub fn new() -> Self {
        Self {
            shell: "/bin/sh".to_string(),
        }
    }

    async fn run(&self, command: &str, env: &HashMap<String, String>) -> Result<Output> {
        debug!(command = %command, "Running deploy command");
        let output = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;
        Ok(output)
    }
}

impl Default for CommandDeployer {
    fn default() -> Self {
        Self::new()
    }
}

fn failure(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    if stderr.is_empty() {
        format!("exited with {}", output.status)
    } else {
        format!("exited with {}: {}", output.status, stderr)
    }
}

#[async_trait]
impl Deployer for CommandDeployer {
    fn name(&self) -> &'static str {
        "command"
    }

    async fn probe(&self, environment: &EnvironmentDescriptor) -> Result<()> {
        let RuntimeTarget::Command { probe, .. } = &environment.runtime else {
            return Err(Error::Internal(format!(
                "environment '{}' is not a command target",
                environment.name
            )));
        };
        let Some(probe) = probe else {
            return Ok(());
        };

        let ctx = VariableContextBuilder::new()
            .with_environment(environment)
            .build();
        let output = self
            .run(&ctx.interpolate(probe), &environment.variables)
            .await
            .map_err(|e| Error::EnvironmentUnreachable {
                environment: environment.name.clone(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(Error::EnvironmentUnreachable {
                environment: environment.name.clone(),
                message: failure(&output),
            });
        }
        Ok(())
    }

    async fn deploy(&self, spec: DeploymentSpec) -> Result<DeploymentHandle> {
        let RuntimeTarget::Command { deploy, .. } = &spec.environment.runtime else {
            return Err(Error::Internal(format!(
                "environment '{}' is not a command target",
                spec.environment.name
            )));
        };

        let ctx = VariableContextBuilder::new()
            .with_environment(&spec.environment)
            .with_unit(&spec.unit)
            .with_image(&spec.image)
            .build();
        let command = ctx.interpolate(deploy);

        let mut env = spec.unit.env.clone();
        env.extend(spec.environment.variables.clone());
        env.insert("CONVEYOR_IMAGE".to_string(), spec.image.clone());

        info!(
            unit = %spec.unit.name,
            environment = %spec.environment.name,
            image = %spec.image,
            "Running deploy command"
        );
        let output = self.run(&command, &env).await?;
        if !output.status.success() {
            warn!(unit = %spec.unit.name, status = %output.status, "Deploy command failed");
            return Err(Error::DeploymentFailed(format!(
                "{} in {}: {}",
                spec.unit.name,
                spec.environment.name,
                failure(&output)
            )));
        }

        Ok(DeploymentHandle {
            id: spec.id,
            deployer_id: format!("{}@{}", spec.unit.name, spec.environment.name),
            deployer_name: self.name().to_string(),
            environment: spec.environment.name,
            image: spec.image,
            deployed_at: Utc::now(),
        })
    }
}
