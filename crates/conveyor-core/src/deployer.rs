//! Deployer trait and deployment types.
//!
//! A deployable unit is defined once and instantiated against any number of
//! environment descriptors. Nothing about the target is looked up
//! implicitly: account, region and network all travel in the descriptor.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{ResourceId, Result};

/// A target environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentDescriptor {
    /// Environment name (e.g., "staging").
    pub name: String,
    /// Cloud account identifier.
    pub account: Option<String>,
    /// Region identifier.
    pub region: Option<String>,
    /// Network identifier (VPC or similar).
    pub network: Option<String>,
    /// Which runtime receives deployments for this environment.
    pub runtime: RuntimeTarget,
    /// Whether a deploy must be approved before it is applied.
    pub requires_approval: bool,
    /// Variables available to deploy commands as `${env.NAME}`.
    pub variables: HashMap<String, String>,
}

impl EnvironmentDescriptor {
    pub fn new(name: impl Into<String>, runtime: RuntimeTarget) -> Self {
        Self {
            name: name.into(),
            account: None,
            region: None,
            network: None,
            runtime,
            requires_approval: false,
            variables: HashMap::new(),
        }
    }

    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.account = Some(account.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    pub fn with_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }
}

/// The container runtime behind an environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuntimeTarget {
    /// Patch a Deployment in a Kubernetes namespace.
    Kubernetes {
        namespace: String,
        context: Option<String>,
    },
    /// Run a shell command; `${image}` and friends are interpolated.
    Command {
        deploy: String,
        probe: Option<String>,
    },
}

impl RuntimeTarget {
    /// Name of the deployer that serves this target.
    pub fn kind(&self) -> &'static str {
        match self {
            RuntimeTarget::Kubernetes { .. } => "kubernetes",
            RuntimeTarget::Command { .. } => "command",
        }
    }
}

/// A containerized service definition, independent of any environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployableUnit {
    /// Service name; also the runtime object name.
    pub name: String,
    /// Container whose image is replaced.
    pub container: String,
    pub port: Option<u16>,
    /// CPU units.
    pub cpu: Option<u32>,
    /// Memory in MiB.
    pub memory_mib: Option<u32>,
    pub desired_count: u32,
    pub env: HashMap<String, String>,
}

impl DeployableUnit {
    pub fn new(name: impl Into<String>, container: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            container: container.into(),
            port: None,
            cpu: None,
            memory_mib: None,
            desired_count: 1,
            env: HashMap::new(),
        }
    }
}

/// One instantiation of a unit in an environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentSpec {
    pub id: ResourceId,
    pub unit: DeployableUnit,
    pub environment: EnvironmentDescriptor,
    /// Image reference to roll out.
    pub image: String,
}

impl DeploymentSpec {
    pub fn new(unit: DeployableUnit, environment: EnvironmentDescriptor, image: impl Into<String>) -> Self {
        Self {
            id: ResourceId::new(),
            unit,
            environment,
            image: image.into(),
        }
    }
}

/// Handle to an applied deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentHandle {
    pub id: ResourceId,
    /// Runtime-specific identifier (e.g., namespace/deployment).
    pub deployer_id: String,
    pub deployer_name: String,
    pub environment: String,
    pub image: String,
    pub deployed_at: DateTime<Utc>,
}

/// Trait for deployers.
///
/// `deploy` is at-least-once: callers may re-apply the same spec and the
/// runtime must tolerate it.
#[async_trait]
pub trait Deployer: Send + Sync {
    /// Name of this deployer, matched against [`RuntimeTarget::kind`].
    fn name(&self) -> &'static str;

    /// Check that the environment's runtime can be reached.
    async fn probe(&self, environment: &EnvironmentDescriptor) -> Result<()>;

    /// Replace the running image of the unit.
    async fn deploy(&self, spec: DeploymentSpec) -> Result<DeploymentHandle>;
}

/// Decides whether a deployment into a gated environment may proceed.
#[async_trait]
pub trait ApprovalGate: Send + Sync {
    async fn approve(&self, unit: &DeployableUnit, environment: &EnvironmentDescriptor) -> bool;
}

/// Approves everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoApprove;

#[async_trait]
impl ApprovalGate for AutoApprove {
    async fn approve(&self, _unit: &DeployableUnit, _environment: &EnvironmentDescriptor) -> bool {
        true
    }
}

/// Rejects everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct RejectAll;

#[async_trait]
impl ApprovalGate for RejectAll {
    async fn approve(&self, _unit: &DeployableUnit, _environment: &EnvironmentDescriptor) -> bool {
        false
    }
}
