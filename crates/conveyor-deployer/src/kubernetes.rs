//! Kubernetes deployer: rolls a new image into an existing Deployment.

use async_trait::async_trait;
use chrono::Utc;
use conveyor_core::deployer::{Deployer, DeploymentHandle, DeploymentSpec, EnvironmentDescriptor, RuntimeTarget};
use conveyor_core::{Error, Result};
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Patch, PatchParams};
use kube::config::{Config, KubeConfigOptions};
use kube::{Api, Client};
use serde_json::json;
use tracing::{info, warn};

const FIELD_MANAGER: &str = "conveyor";

/// Kubernetes-based deployer.
///
/// The Deployment named after the unit must already exist in the target
/// namespace; only its container image and replica count are patched.
pub struct KubernetesDeployer {
    client: Option<Client>,
}

impl KubernetesDeployer {
    /// Resolve a client per environment from the local kubeconfig.
    pub fn new() -> Self {
        Self { client: None }
    }

    /// Use one client for every environment, ignoring kubeconfig contexts.
    pub fn with_client(client: Client) -> Self {
        Self {
            client: Some(client),
        }
    }

    async fn client_for(&self, environment: &EnvironmentDescriptor) -> Result<(Client, String)> {
        let RuntimeTarget::Kubernetes { namespace, context } = &environment.runtime else {
            return Err(Error::Internal(format!(
                "environment '{}' is not a kubernetes target",
                environment.name
            )));
        };

        if let Some(client) = &self.client {
            return Ok((client.clone(), namespace.clone()));
        }

        let unreachable = |message: String| Error::EnvironmentUnreachable {
            environment: environment.name.clone(),
            message,
        };

        let client = match context {
            Some(context) => {
                let options = KubeConfigOptions {
                    context: Some(context.clone()),
                    ..Default::default()
                };
                let config = Config::from_kubeconfig(&options)
                    .await
                    .map_err(|e| unreachable(e.to_string()))?;
                Client::try_from(config).map_err(|e| unreachable(e.to_string()))?
            }
            None => Client::try_default()
                .await
                .map_err(|e| unreachable(e.to_string()))?,
        };
        Ok((client, namespace.clone()))
    }
}

impl Default for KubernetesDeployer {
    fn default() -> Self {
        Self::new()
    }
}

/// Strategic merge patch replacing one container's image. Containers merge
/// by name, so sidecars are left alone. Replica count is not touched; it
/// belongs to whatever scales the Deployment.
fn image_patch(spec: &DeploymentSpec) -> serde_json::Value {
    json!({
        "metadata": {
            "annotations": {
                "conveyor.dev/deployment-id": spec.id.to_string(),
            }
        },
        "spec": {
            "template": {
                "spec": {
                    "containers": [{
                        "name": spec.unit.container,
                        "image": spec.image,
                    }]
                }
            }
        }
    })
}

#[async_trait]
impl Deployer for KubernetesDeployer {
    fn name(&self) -> &'static str {
        "kubernetes"
    }

    async fn probe(&self, environment: &EnvironmentDescriptor) -> Result<()> {
        let (client, _) = self.client_for(environment).await?;
        client
            .apiserver_version()
            .await
            .map_err(|e| Error::EnvironmentUnreachable {
                environment: environment.name.clone(),
                message: e.to_string(),
            })?;
        Ok(())
    }

    async fn deploy(&self, spec: DeploymentSpec) -> Result<DeploymentHandle> {
        let (client, namespace) = self.client_for(&spec.environment).await?;
        let api: Api<Deployment> = Api::namespaced(client, &namespace);

        info!(
            unit = %spec.unit.name,
            environment = %spec.environment.name,
            namespace = %namespace,
            image = %spec.image,
            "Patching deployment"
        );

        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        api.patch(&spec.unit.name, &params, &Patch::Strategic(image_patch(&spec)))
            .await
            .map_err(|e| {
                warn!(unit = %spec.unit.name, error = %e, "Deployment patch failed");
                Error::DeploymentFailed(format!(
                    "{}/{} in {}: {}",
                    namespace, spec.unit.name, spec.environment.name, e
                ))
            })?;

        Ok(DeploymentHandle {
            id: spec.id,
            deployer_id: format!("{}/{}", namespace, spec.unit.name),
            deployer_name: self.name().to_string(),
            environment: spec.environment.name,
            image: spec.image,
            deployed_at: Utc::now(),
        })
    }
}
