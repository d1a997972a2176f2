//! Environment promotion: one unit, one image, an ordered list of
//! environments.

use conveyor_core::deployer::{
    ApprovalGate, AutoApprove, DeployableUnit, Deployer, DeploymentHandle, DeploymentSpec,
    EnvironmentDescriptor,
};
use conveyor_core::{Error, GraphError, Result};
use conveyor_deployer::DeployerRegistry;
use std::sync::Arc;
use tracing::{info, warn};

/// What happened in one environment.
#[derive(Debug)]
pub enum DeploymentOutcome {
    Deployed(DeploymentHandle),
    Failed(Error),
    /// Not attempted because an earlier environment failed.
    Skipped(String),
}

#[derive(Debug)]
pub struct EnvironmentDeployment {
    pub environment: String,
    pub outcome: DeploymentOutcome,
}

impl EnvironmentDeployment {
    pub fn is_deployed(&self) -> bool {
        matches!(self.outcome, DeploymentOutcome::Deployed(_))
    }
}

/// Applies deployments through the registered deployers.
pub struct Promoter {
    deployers: DeployerRegistry,
    approval: Arc<dyn ApprovalGate>,
}

impl Promoter {
    pub fn new(deployers: DeployerRegistry) -> Self {
        Self {
            deployers,
            approval: Arc::new(AutoApprove),
        }
    }

    pub fn with_approval(mut self, approval: Arc<dyn ApprovalGate>) -> Self {
        self.approval = approval;
        self
    }

    fn deployer(&self, environment: &EnvironmentDescriptor) -> Result<&Arc<dyn Deployer>> {
        let kind = environment.runtime.kind();
        self.deployers.get(kind).ok_or_else(|| {
            Error::Configuration(GraphError::UnknownRuntime {
                environment: environment.name.clone(),
                runtime: kind.to_string(),
            })
        })
    }

    /// Ask the approval gate when the environment requires it.
    pub async fn check_approval(
        &self,
        unit: &DeployableUnit,
        environment: &EnvironmentDescriptor,
    ) -> Result<()> {
        if !environment.requires_approval {
            return Ok(());
        }
        if self.approval.approve(unit, environment).await {
            info!(unit = %unit.name, environment = %environment.name, "Deployment approved");
            Ok(())
        } else {
            warn!(unit = %unit.name, environment = %environment.name, "Deployment rejected");
            Err(Error::DeploymentFailed(format!(
                "deployment of '{}' to '{}' was not approved",
                unit.name, environment.name
            )))
        }
    }

    /// Probe the environment, then replace the unit's running image.
    pub async fn apply(
        &self,
        unit: &DeployableUnit,
        environment: &EnvironmentDescriptor,
        image: &str,
    ) -> Result<DeploymentHandle> {
        let deployer = self.deployer(environment)?;
        deployer.probe(environment).await?;
        let handle = deployer
            .deploy(DeploymentSpec::new(unit.clone(), environment.clone(), image))
            .await?;
        info!(
            unit = %unit.name,
            environment = %environment.name,
            image = %image,
            deployer = %handle.deployer_name,
            "Deployed"
        );
        Ok(handle)
    }

    /// Deploy `image` of `unit` into each environment in order. The first
    /// failure stops the promotion; later environments are skipped and
    /// earlier deployments stay in place.
    pub async fn promote(
        &self,
        unit: &DeployableUnit,
        environments: &[EnvironmentDescriptor],
        image: &str,
    ) -> Vec<EnvironmentDeployment> {
        let mut stopped_at: Option<String> = None;
        let mut deployments = Vec::with_capacity(environments.len());

        for environment in environments {
            let outcome = match &stopped_at {
                Some(failed) => DeploymentOutcome::Skipped(format!(
                    "promotion stopped at '{}'",
                    failed
                )),
                None => match self.deploy(unit, environment, image).await {
                    Ok(handle) => DeploymentOutcome::Deployed(handle),
                    Err(e) => {
                        warn!(environment = %environment.name, error = %e, "Promotion stopped");
                        stopped_at = Some(environment.name.clone());
                        DeploymentOutcome::Failed(e)
                    }
                },
            };
            deployments.push(EnvironmentDeployment {
                environment: environment.name.clone(),
                outcome,
            });
        }

        deployments
    }

    async fn deploy(
        &self,
        unit: &DeployableUnit,
        environment: &EnvironmentDescriptor,
        image: &str,
    ) -> Result<DeploymentHandle> {
        self.check_approval(unit, environment).await?;
        self.apply(unit, environment, image).await
    }
}
