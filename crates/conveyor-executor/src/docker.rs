//! Docker runner: build commands inside a container image with the
//! workspace bind-mounted at `/workspace`.

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use conveyor_core::executor::{CommandOutcome, CommandRunner, CommandSpec, LogLine, LogStream};
use conveyor_core::{Error, ResourceId, Result};
use futures::StreamExt;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

const WORKSPACE_MOUNT: &str = "/workspace";

/// Printed to stderr before each command so a failure can be attributed.
const STEP_MARKER: &str = "::conveyor-step::";

/// Runs build commands in a local Docker container.
pub struct DockerRunner {
    docker: Docker,
}

impl DockerRunner {
    /// Create a new DockerRunner connecting to the local Docker daemon.
    pub fn new() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Self { docker })
    }

    /// Create with a custom Docker client.
    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }

    fn container_name(job_id: &ResourceId) -> String {
        format!("conveyor-job-{}", job_id)
    }

    /// One shell script that runs every command in order and stops at the
    /// first non-zero exit.
    fn script(commands: &[String]) -> String {
        let mut script = String::new();
        for (index, command) in commands.iter().enumerate() {
            script.push_str(&format!(
                "echo '{}{}' >&2\n{}\nstatus=$?\nif [ $status -ne 0 ]; then exit $status; fi\n",
                STEP_MARKER, index, command
            ));
        }
        script
    }

    async fn pull(&self, image: &str) {
        info!(image = %image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut pull_stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = pull_stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(status = %status, "Pull progress");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Pull warning");
                }
            }
        }
    }

}

async fn remove_container(docker: &Docker, container_name: &str) {
    let options = RemoveContainerOptions {
        force: true,
        ..Default::default()
    };
    if let Err(e) = docker.remove_container(container_name, Some(options)).await {
        warn!(container = %container_name, error = %e, "Failed to remove container");
    }
}

/// Force-removes its container when dropped before [`ContainerGuard::remove`]
/// ran, i.e. when the run future is dropped by a timeout or cancellation.
struct ContainerGuard {
    docker: Docker,
    name: String,
    armed: bool,
}

impl ContainerGuard {
    fn new(docker: Docker, name: String) -> Self {
        Self {
            docker,
            name,
            armed: true,
        }
    }

    async fn remove(mut self) {
        self.armed = false;
        remove_container(&self.docker, &self.name).await;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(container = %self.name, "No runtime to remove abandoned container");
            return;
        };
        warn!(container = %self.name, "Run abandoned, removing container");
        let docker = self.docker.clone();
        let name = std::mem::take(&mut self.name);
        runtime.spawn(async move { remove_container(&docker, &name).await });
    }
}

#[async_trait]
impl CommandRunner for DockerRunner {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn can_run(&self, spec: &CommandSpec) -> bool {
        spec.image.is_some() && self.docker.ping().await.is_ok()
    }

    async fn run(
        &self,
        spec: CommandSpec,
        logs: UnboundedSender<LogLine>,
    ) -> Result<CommandOutcome> {
        let image = spec
            .image
            .clone()
            .ok_or_else(|| Error::action(&spec.action, "docker runner needs an image"))?;
        let container_name = Self::container_name(&spec.id);

        self.pull(&image).await;

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        // A relative bind source would be read as a volume name.
        let host_path = std::path::absolute(&spec.workspace)?;
        let host_config = HostConfig {
            binds: Some(vec![format!(
                "{}:{}:rw",
                host_path.to_string_lossy(),
                WORKSPACE_MOUNT
            )]),
            ..Default::default()
        };

        let config = Config {
            image: Some(image.clone()),
            cmd: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                Self::script(&spec.commands),
            ]),
            env: Some(env),
            working_dir: Some(WORKSPACE_MOUNT.to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            host_config: Some(host_config),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: container_name.clone(),
            platform: None,
        };

        info!(container = %container_name, image = %image, "Creating container");
        self.docker
            .create_container(Some(create_options), config)
            .await
            .map_err(|e| Error::action(&spec.action, format!("failed to create container: {}", e)))?;
        let container = ContainerGuard::new(self.docker.clone(), container_name.clone());

        info!(container = %container_name, "Starting container");
        if let Err(e) = self
            .docker
            .start_container(&container_name, None::<StartContainerOptions<String>>)
            .await
        {
            container.remove().await;
            return Err(Error::action(
                &spec.action,
                format!("failed to start container: {}", e),
            ));
        }

        let log_options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut log_stream = self.docker.logs(&container_name, Some(log_options));

        // Follow logs until the container stops, remembering the last step started.
        let mut current_step: Option<usize> = None;
        while let Some(result) = log_stream.next().await {
            let (stream, message) = match result {
                Ok(LogOutput::StdErr { message }) => (LogStream::Stderr, message),
                Ok(LogOutput::StdOut { message })
                | Ok(LogOutput::Console { message })
                | Ok(LogOutput::StdIn { message }) => (LogStream::Stdout, message),
                Err(e) => {
                    warn!(error = %e, "Log stream error");
                    break;
                }
            };
            for line in String::from_utf8_lossy(&message).lines() {
                if let Some(step) = line.strip_prefix(STEP_MARKER) {
                    current_step = step.trim().parse().ok();
                    if let Some(command) = current_step.and_then(|i| spec.commands.get(i)) {
                        let _ = logs.send(LogLine::new(LogStream::System, format!("$ {}", command)));
                    }
                    continue;
                }
                let _ = logs.send(LogLine::new(stream, line.trim_end()));
            }
        }

        let mut wait_stream = self.docker.wait_container(
            &container_name,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        );
        // Non-zero exits surface as errors here; the exit code is read below.
        let _ = wait_stream.next().await;

        let exit_code = self
            .docker
            .inspect_container(&container_name, None)
            .await
            .ok()
            .and_then(|inspect| inspect.state)
            .and_then(|state| state.exit_code)
            .map(|code| code as i32);

        container.remove().await;

        match exit_code {
            Some(0) => Ok(CommandOutcome::Succeeded),
            code => {
                let command = current_step
                    .and_then(|i| spec.commands.get(i))
                    .cloned()
                    .unwrap_or_default();
                Ok(CommandOutcome::Failed {
                    message: match code {
                        Some(code) => format!("command `{}` exited with code {}", command, code),
                        None => "container ended without an exit code".to_string(),
                    },
                    command,
                    exit_code: code,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_name_generation() {
        let id = ResourceId::new();
        let name = DockerRunner::container_name(&id);

        assert!(name.starts_with("conveyor-job-"));
        assert_eq!(name, DockerRunner::container_name(&id));
        assert_ne!(name, DockerRunner::container_name(&ResourceId::new()));
    }

    #[test]
    fn test_script_stops_at_first_failure() {
        let script = DockerRunner::script(&["make".to_string(), "make push".to_string()]);
        let lines: Vec<&str> = script.lines().collect();

        assert_eq!(lines[0], "echo '::conveyor-step::0' >&2");
        assert_eq!(lines[1], "make");
        assert!(lines[3].contains("exit $status"));
        assert_eq!(lines[4], "echo '::conveyor-step::1' >&2");
        assert_eq!(lines[5], "make push");
    }

    #[tokio::test]
    #[ignore]
    async fn test_job_lifecycle() {
        let runner = DockerRunner::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let spec = CommandSpec {
            id: ResourceId::new(),
            action: "build".to_string(),
            image: Some("alpine:latest".to_string()),
            commands: vec!["echo hi > out.txt".to_string(), "exit 4".to_string()],
            workspace: dir.path().to_path_buf(),
            env: Default::default(),
        };
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();

        let outcome = runner.run(spec, tx).await.unwrap();

        assert!(matches!(
            outcome,
            CommandOutcome::Failed { exit_code: Some(4), ref command, .. } if command == "exit 4"
        ));
        assert!(dir.path().join("out.txt").exists());
    }

    #[tokio::test]
    #[ignore]
    async fn test_timed_out_job_removes_container() {
        let runner = DockerRunner::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let spec = CommandSpec {
            id: ResourceId::new(),
            action: "build".to_string(),
            image: Some("alpine:latest".to_string()),
            commands: vec!["sleep 600".to_string()],
            workspace: dir.path().to_path_buf(),
            env: Default::default(),
        };
        let name = DockerRunner::container_name(&spec.id);
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();

        let timed_out =
            tokio::time::timeout(std::time::Duration::from_secs(20), runner.run(spec, tx)).await;
        assert!(timed_out.is_err());

        let mut removed = false;
        for _ in 0..50 {
            if runner.docker.inspect_container(&name, None).await.is_err() {
                removed = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }
        assert!(removed, "container {} still exists", name);
    }
}
