//! Promote one image of a unit through environments.

use anyhow::{Context, Result};
use conveyor_scheduler::{DeploymentOutcome, Promoter};
use std::path::Path;

use super::run::approval_gate;

pub async fn promote(
    path: &Path,
    unit: &str,
    image: &str,
    environments: &[String],
    approve: bool,
) -> Result<()> {
    let pipeline = super::load(path)?;
    let unit = pipeline
        .unit(unit)
        .with_context(|| format!("Unknown unit '{}' in {}", unit, path.display()))?;

    let targets = if environments.is_empty() {
        pipeline.environments.clone()
    } else {
        environments
            .iter()
            .map(|name| {
                pipeline
                    .environment(name)
                    .cloned()
                    .with_context(|| format!("Unknown environment '{}'", name))
            })
            .collect::<Result<Vec<_>>>()?
    };
    if targets.is_empty() {
        anyhow::bail!("No environments to promote '{}' through", unit.name);
    }

    let promoter = Promoter::new(conveyor_deployer::default_registry())
        .with_approval(approval_gate(approve));

    println!("Promoting {} ({}) through {} environments", unit.name, image, targets.len());
    let results = promoter.promote(unit, &targets, image).await;

    let mut failed = None;
    for result in &results {
        match &result.outcome {
            DeploymentOutcome::Deployed(handle) => {
                println!("  ✓ {} - deployed via {} ({})", result.environment, handle.deployer_name, handle.deployer_id);
            }
            DeploymentOutcome::Failed(e) => {
                println!("  ✗ {} - {}", result.environment, e);
                failed.get_or_insert(result.environment.clone());
            }
            DeploymentOutcome::Skipped(reason) => {
                println!("  ⊘ {} - skipped: {}", result.environment, reason);
            }
        }
    }

    match failed {
        Some(environment) => anyhow::bail!("Promotion failed in '{}'", environment),
        None => {
            println!("\n✓ Promotion complete");
            Ok(())
        }
    }
}
