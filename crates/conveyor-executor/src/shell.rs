//! Host shell runner.

use async_trait::async_trait;
use conveyor_core::executor::{CommandOutcome, CommandRunner, CommandSpec, LogLine, LogStream};
use conveyor_core::{Error, Result};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};

/// Runs build commands with the host shell, one `sh -c` per command.
pub struct ShellRunner {
    shell: String,
}

impl ShellRunner {
    pub fn new() -> Self {
        Self::with_shell("/bin/sh")
    }

    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    fn name(&self) -> &'static str {
        "shell"
    }

    async fn can_run(&self, spec: &CommandSpec) -> bool {
        spec.image.is_none()
    }

    async fn run(
        &self,
        spec: CommandSpec,
        logs: UnboundedSender<LogLine>,
    ) -> Result<CommandOutcome> {
        info!(action = %spec.action, workspace = %spec.workspace.display(), "Running commands on host");

        for command in &spec.commands {
            let _ = logs.send(LogLine::new(LogStream::System, format!("$ {}", command)));

            let mut child = Command::new(&self.shell)
                .arg("-c")
                .arg(command)
                .current_dir(&spec.workspace)
                .envs(&spec.env)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| {
                    Error::action(&spec.action, format!("failed to spawn {}: {}", self.shell, e))
                })?;

            let stdout = child.stdout.take();
            let stderr = child.stderr.take();

            let (status, _, _) = tokio::join!(
                child.wait(),
                forward(stdout, LogStream::Stdout, &logs),
                forward(stderr, LogStream::Stderr, &logs),
            );
            let status = status?;
            debug!(command = %command, %status, "Command finished");

            if !status.success() {
                return Ok(CommandOutcome::Failed {
                    command: command.clone(),
                    exit_code: status.code(),
                    message: format!("command `{}` exited with {}", command, status),
                });
            }
        }

        Ok(CommandOutcome::Succeeded)
    }
}

async fn forward<R>(reader: Option<R>, stream: LogStream, logs: &UnboundedSender<LogLine>)
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return;
    };
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let _ = logs.send(LogLine::new(stream, line));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::ResourceId;
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    fn spec(dir: &std::path::Path, commands: &[&str]) -> CommandSpec {
        CommandSpec {
            id: ResourceId::new(),
            action: "build".to_string(),
            image: None,
            commands: commands.iter().map(|c| c.to_string()).collect(),
            workspace: dir.to_path_buf(),
            env: HashMap::from([("GREETING".to_string(), "hello".to_string())]),
        }
    }

    #[tokio::test]
    async fn test_runs_commands_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let outcome = ShellRunner::new()
            .run(
                spec(dir.path(), &["echo $GREETING > out.txt", "echo world >> out.txt"]),
                tx,
            )
            .await
            .unwrap();

        assert_eq!(outcome, CommandOutcome::Succeeded);
        let written = std::fs::read_to_string(dir.path().join("out.txt")).unwrap();
        assert_eq!(written, "hello\nworld\n");

        let mut system_lines = 0;
        while let Ok(line) = rx.try_recv() {
            if line.stream == LogStream::System {
                system_lines += 1;
            }
        }
        assert_eq!(system_lines, 2);
    }

    #[tokio::test]
    async fn test_first_failure_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();

        let outcome = ShellRunner::new()
            .run(spec(dir.path(), &["exit 3", "touch never.txt"]), tx)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            CommandOutcome::Failed {
                command: "exit 3".to_string(),
                exit_code: Some(3),
                message: "command `exit 3` exited with exit status: 3".to_string(),
            }
        );
        assert!(!dir.path().join("never.txt").exists());
    }

    #[tokio::test]
    async fn test_output_is_streamed() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        ShellRunner::new()
            .run(spec(dir.path(), &["echo out; echo err >&2"]), tx)
            .await
            .unwrap();

        let mut lines = Vec::new();
        while let Ok(line) = rx.try_recv() {
            lines.push((line.stream, line.content));
        }
        assert!(lines.contains(&(LogStream::Stdout, "out".to_string())));
        assert!(lines.contains(&(LogStream::Stderr, "err".to_string())));
    }

    #[tokio::test]
    async fn test_only_handles_host_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = spec(dir.path(), &["true"]);
        assert!(ShellRunner::new().can_run(&job).await);
        job.image = Some("alpine:3".to_string());
        assert!(!ShellRunner::new().can_run(&job).await);
    }
}
