//! Deployment backends for Conveyor.
//!
//! Provides deployer implementations:
//! - Kubernetes (patches an existing Deployment)
//! - Command (runs a user-supplied shell command)

pub mod command;
pub mod kubernetes;

use std::collections::HashMap;
use std::sync::Arc;

pub use command::CommandDeployer;
pub use conveyor_core::deployer::{
    ApprovalGate, AutoApprove, DeployableUnit, Deployer, DeploymentHandle, DeploymentSpec,
    EnvironmentDescriptor, RejectAll, RuntimeTarget,
};
pub use kubernetes::KubernetesDeployer;

/// Deployers keyed by the runtime kind they serve.
pub type DeployerRegistry = HashMap<&'static str, Arc<dyn Deployer>>;

/// Registry with every built-in deployer.
pub fn default_registry() -> DeployerRegistry {
    registry([
        Arc::new(KubernetesDeployer::new()) as Arc<dyn Deployer>,
        Arc::new(CommandDeployer::new()),
    ])
}

pub fn registry(deployers: impl IntoIterator<Item = Arc<dyn Deployer>>) -> DeployerRegistry {
    deployers.into_iter().map(|d| (d.name(), d)).collect()
}
