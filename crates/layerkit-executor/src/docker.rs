//! Docker executor implementation.
//!
//! Runs toolchain commands inside a builder image with the build workspace
//! bind-mounted at [`CONTAINER_WORKSPACE`].

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use chrono::Utc;
use futures::StreamExt;
use futures::stream::BoxStream;
use layerkit_core::executor::*;
use layerkit_core::{Error, ResourceId, Result};
use tracing::{debug, info, warn};

/// Mount point of the build workspace inside builder containers.
pub const CONTAINER_WORKSPACE: &str = "/workspace";

/// Docker executor for builds that must run in a pinned builder image.
pub struct LocalDockerExecutor {
    docker: Docker,
}

impl LocalDockerExecutor {
    /// Create a new LocalDockerExecutor connecting to the local Docker daemon.
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
        format!("layerkit-job-{}", job_id)
    }

    /// Bind mounts for a job: the workspace plus any named volumes.
    fn binds(spec: &JobSpec) -> Vec<String> {
        let mut binds = vec![format!(
            "{}:{}:rw",
            spec.workspace.display(),
            CONTAINER_WORKSPACE
        )];
        binds.extend(spec.volumes.iter().map(|v| {
            let mode = if v.read_only { "ro" } else { "rw" };
            format!("{}:{}:{}", v.name, v.mount_path, mode)
        }));
        binds
    }

    async fn stop(&self, container_name: &str) -> Result<()> {
        self.docker
            .stop_container(container_name, Some(StopContainerOptions { t: 5 }))
            .await
            .map_err(|e| Error::ExecutionFailed(format!("Failed to stop container: {}", e)))
    }

    async fn remove(&self, container_name: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(container_name, Some(options))
            .await
            .map_err(|e| Error::ExecutionFailed(format!("Failed to remove container: {}", e)))
    }
}

#[async_trait]
impl Executor for LocalDockerExecutor {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn can_execute(&self, spec: &JobSpec) -> bool {
        spec.image.is_some() && self.docker.ping().await.is_ok()
    }

    async fn spawn(&self, spec: JobSpec) -> Result<JobHandle> {
        let container_name = Self::container_name(&spec.id);
        let image = spec
            .image
            .clone()
            .ok_or_else(|| Error::ExecutionFailed("docker jobs need a builder image".to_string()))?;

        // Pull the image first
        info!(image = %image, "Pulling image");
        let create_image_options = CreateImageOptions {
            from_image: image.clone(),
            ..Default::default()
        };

        let mut pull_stream = self
            .docker
            .create_image(Some(create_image_options), None, None);
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

        let mut env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        env.sort();

        let cmd = if spec.command.is_empty() {
            None
        } else {
            Some(spec.command.clone())
        };

        let host_config = HostConfig {
            binds: Some(Self::binds(&spec)),
            ..Default::default()
        };

        let config = Config {
            image: Some(image),
            cmd,
            env: Some(env),
            working_dir: Some(CONTAINER_WORKSPACE.to_string()),
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

        info!(container = %container_name, "Creating container");
        let container = self
            .docker
            .create_container(Some(create_options), config)
            .await
            .map_err(|e| Error::ExecutionFailed(format!("Failed to create container: {}", e)))?;

        info!(container = %container_name, "Starting container");
        self.docker
            .start_container(&container_name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Error::ExecutionFailed(format!("Failed to start container: {}", e)))?;

        Ok(JobHandle {
            id: spec.id,
            executor_id: container.id,
            executor_name: self.name().to_string(),
        })
    }

    async fn logs(&self, handle: &JobHandle) -> Result<BoxStream<'static, LogLine>> {
        let container_name = Self::container_name(&handle.id);

        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        let stream = self.docker.logs(&container_name, Some(options));

        let mapped_stream = stream.filter_map(|result| async move {
            match result {
                Ok(output) => {
                    let (stream, message) = match output {
                        LogOutput::StdErr { message } => (LogStream::Stderr, message),
                        LogOutput::StdOut { message }
                        | LogOutput::Console { message }
                        | LogOutput::StdIn { message } => (LogStream::Stdout, message),
                    };
                    Some(LogLine::now(
                        stream,
                        String::from_utf8_lossy(&message).trim_end().to_string(),
                    ))
                }
                Err(e) => {
                    warn!(error = %e, "Log stream error");
                    None
                }
            }
        });

        Ok(Box::pin(mapped_stream))
    }

    async fn status(&self, handle: &JobHandle) -> Result<JobStatus> {
        let container_name = Self::container_name(&handle.id);

        let inspect = self
            .docker
            .inspect_container(&container_name, None)
            .await
            .map_err(|e| Error::NotFound(format!("Container not found: {}", e)))?;

        let state = inspect
            .state
            .ok_or_else(|| Error::Internal("No state".to_string()))?;

        let parse_time = |s: Option<String>| {
            s.and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.with_timezone(&Utc))
        };

        let status = if state.running.unwrap_or(false) {
            JobStatus::Running {
                started_at: parse_time(state.started_at).unwrap_or_else(Utc::now),
            }
        } else if state.paused.unwrap_or(false) {
            JobStatus::Pending
        } else {
            // Container has exited
            let exit_code = state.exit_code.map(|c| c as i32);
            let started_at = parse_time(state.started_at);
            let finished_at = parse_time(state.finished_at).unwrap_or_else(Utc::now);

            if exit_code == Some(0) {
                JobStatus::Succeeded {
                    started_at: started_at.unwrap_or(finished_at),
                    finished_at,
                }
            } else {
                JobStatus::Failed {
                    started_at,
                    finished_at,
                    exit_code,
                    message: state
                        .error
                        .filter(|e| !e.is_empty())
                        .unwrap_or_else(|| format!("container exited with {:?}", exit_code)),
                }
            }
        };

        Ok(status)
    }

    async fn wait(&self, handle: &JobHandle) -> Result<JobResult> {
        let container_name = Self::container_name(&handle.id);

        let current_status = self.status(handle).await?;
        if current_status.is_terminal() {
            let exit_code = match &current_status {
                JobStatus::Succeeded { .. } => Some(0),
                JobStatus::Failed { exit_code, .. } => *exit_code,
                _ => None,
            };
            return Ok(JobResult {
                status: current_status,
                exit_code,
            });
        }

        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(&container_name, Some(options));

        // Timeouts are enforced by the orchestrator, which cancels the job.
        let exit_code = match stream.next().await {
            Some(Ok(response)) => Some(response.status_code as i32),
            // bollard reports non-zero exits as errors; status() below
            // reads the real code.
            Some(Err(e)) => {
                debug!(error = %e, "Wait returned error");
                None
            }
            None => None,
        };

        let status = self.status(handle).await?;
        let exit_code = match &status {
            JobStatus::Failed { exit_code, .. } => *exit_code,
            _ => exit_code,
        };

        Ok(JobResult { status, exit_code })
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<()> {
        let container_name = Self::container_name(&handle.id);
        self.stop(&container_name).await?;
        self.remove(&container_name).await
    }

    async fn cleanup(&self, handle: &JobHandle) -> Result<()> {
        self.remove(&Self::container_name(&handle.id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use layerkit_core::executor::VolumeMount;
    use std::collections::HashMap;
    use std::path::PathBuf;

    fn make_test_spec() -> JobSpec {
        JobSpec {
            id: ResourceId::new(),
            image: Some("alpine:latest".to_string()),
            command: vec!["echo".to_string(), "hello".to_string()],
            workspace: PathBuf::from("/tmp/layerkit-ws"),
            env: HashMap::new(),
            timeout: None,
            volumes: vec![],
        }
    }

    #[test]
    fn test_container_name_generation() {
        let id = ResourceId::new();
        let name = LocalDockerExecutor::container_name(&id);

        assert!(name.starts_with("layerkit-job-"));
        assert_eq!(name, LocalDockerExecutor::container_name(&id));
        assert_ne!(name, LocalDockerExecutor::container_name(&ResourceId::new()));
    }

    #[test]
    fn test_workspace_is_always_bound() {
        let spec = make_test_spec();
        assert_eq!(
            LocalDockerExecutor::binds(&spec),
            vec!["/tmp/layerkit-ws:/workspace:rw".to_string()]
        );
    }

    #[test]
    fn test_named_volumes_follow_workspace() {
        let mut spec = make_test_spec();
        spec.volumes.push(VolumeMount {
            name: "layerkit-registry".to_string(),
            mount_path: "/usr/local/cargo/registry".to_string(),
            read_only: false,
        });
        spec.volumes.push(VolumeMount {
            name: "layerkit-git".to_string(),
            mount_path: "/usr/local/cargo/git".to_string(),
            read_only: true,
        });

        let binds = LocalDockerExecutor::binds(&spec);
        assert_eq!(binds.len(), 3);
        assert_eq!(binds[1], "layerkit-registry:/usr/local/cargo/registry:rw");
        assert_eq!(binds[2], "layerkit-git:/usr/local/cargo/git:ro");
    }
}

/// Integration tests that require Docker to be running.
/// Run with: cargo test -- --ignored
#[cfg(test)]
mod integration_tests {
    use super::*;
    use std::collections::HashMap;

    fn shell_spec(script: &str, workspace: &std::path::Path) -> JobSpec {
        JobSpec {
            id: ResourceId::new(),
            image: Some("alpine:latest".to_string()),
            command: vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()],
            workspace: workspace.to_path_buf(),
            env: HashMap::new(),
            timeout: None,
            volumes: vec![],
        }
    }

    #[tokio::test]
    #[ignore]
    async fn test_job_writes_into_workspace() {
        let executor = LocalDockerExecutor::new().unwrap();
        let dir = tempfile::tempdir().unwrap();

        let handle = executor
            .spawn(shell_spec("echo built > artifact.txt", dir.path()))
            .await
            .expect("Should spawn container");
        let result = executor.wait(&handle).await.expect("Should wait");
        executor.cleanup(&handle).await.unwrap();

        assert_eq!(result.exit_code, Some(0));
        let written = std::fs::read_to_string(dir.path().join("artifact.txt")).unwrap();
        assert_eq!(written.trim(), "built");
    }

    #[tokio::test]
    #[ignore]
    async fn test_failing_job() {
        let executor = LocalDockerExecutor::new().unwrap();
        let dir = tempfile::tempdir().unwrap();

        let handle = executor
            .spawn(shell_spec("exit 42", dir.path()))
            .await
            .expect("Should spawn container");
        let result = executor.wait(&handle).await.expect("Should wait");
        executor.cleanup(&handle).await.unwrap();

        assert_eq!(result.exit_code, Some(42));
        assert!(matches!(result.status, JobStatus::Failed { .. }));
    }

    #[tokio::test]
    #[ignore]
    async fn test_log_streaming() {
        let executor = LocalDockerExecutor::new().unwrap();
        let dir = tempfile::tempdir().unwrap();

        let handle = executor
            .spawn(shell_spec("echo line1; echo line2 1>&2", dir.path()))
            .await
            .expect("Should spawn container");
        let _ = executor.wait(&handle).await;

        let logs: Vec<LogLine> = executor.logs(&handle).await.unwrap().collect().await;
        executor.cleanup(&handle).await.unwrap();

        assert!(logs.iter().any(|l| l.content.contains("line1")));
        assert!(
            logs.iter()
                .any(|l| l.content.contains("line2") && l.stream == LogStream::Stderr)
        );
    }
}
