//! Interactive approval of gated deployments.

use async_trait::async_trait;
use conveyor_core::deployer::{ApprovalGate, DeployableUnit, EnvironmentDescriptor};
use std::io::{BufRead, Write};
use tokio::sync::Mutex;
use tracing::warn;

/// Asks on the terminal. Prompts are serialized so concurrent deploys do
/// not interleave.
#[derive(Default)]
pub struct ConsoleApproval {
    lock: Mutex<()>,
}

impl ConsoleApproval {
    pub fn new() -> Self {
        Self::default()
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

#[async_trait]
impl ApprovalGate for ConsoleApproval {
    async fn approve(&self, unit: &DeployableUnit, environment: &EnvironmentDescriptor) -> bool {
        let _guard = self.lock.lock().await;
        let prompt = format!(
            "Deploy '{}' to '{}'{}? [y/N] ",
            unit.name,
            environment.name,
            environment
                .account
                .as_deref()
                .map(|a| format!(" (account {})", a))
                .unwrap_or_default()
        );

        let answer = tokio::task::spawn_blocking(move || {
            let mut stdout = std::io::stdout();
            let _ = write!(stdout, "{}", prompt);
            let _ = stdout.flush();
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line).map(|_| line)
        })
        .await;

        match answer {
            Ok(Ok(line)) => is_yes(&line),
            Ok(Err(e)) => {
                warn!(error = %e, "Could not read approval answer");
                false
            }
            Err(e) => {
                warn!(error = %e, "Approval prompt failed");
                false
            }
        }
    }
}
