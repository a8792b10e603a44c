//! Local process executor.
//!
//! Runs toolchain commands directly on the host with the build workspace as
//! the working directory. This is the default executor.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream};
use layerkit_core::executor::*;
use layerkit_core::{Error, ResourceId, Result};
use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

struct LocalJob {
    /// Present until `wait` takes it.
    child: Option<Child>,
    logs: Option<mpsc::UnboundedReceiver<LogLine>>,
    cancel: Option<oneshot::Sender<()>>,
    cancel_rx: Option<oneshot::Receiver<()>>,
    started_at: DateTime<Utc>,
    timeout: Option<Duration>,
    outcome: Option<JobStatus>,
}

enum Ending {
    Exited(std::io::Result<ExitStatus>),
    TimedOut(Duration),
    Cancelled,
}

/// Executor that runs jobs as child processes of the current process.
#[derive(Default)]
pub struct LocalProcessExecutor {
    jobs: Mutex<HashMap<ResourceId, LocalJob>>,
}

impl LocalProcessExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn result_for(status: JobStatus) -> JobResult {
        let exit_code = match &status {
            JobStatus::Succeeded { .. } => Some(0),
            JobStatus::Failed { exit_code, .. } => *exit_code,
            _ => None,
        };
        JobResult { status, exit_code }
    }

    fn status_from_exit(started_at: DateTime<Utc>, exit: ExitStatus) -> JobStatus {
        let finished_at = Utc::now();
        if exit.success() {
            JobStatus::Succeeded {
                started_at,
                finished_at,
            }
        } else {
            JobStatus::Failed {
                started_at: Some(started_at),
                finished_at,
                exit_code: exit.code(),
                message: format!("process exited with {}", exit),
            }
        }
    }
}

async fn forward_lines<R>(reader: R, stream: LogStream, tx: mpsc::UnboundedSender<LogLine>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(LogLine::now(stream, line)).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Log read error");
                break;
            }
        }
    }
}

#[async_trait]
impl Executor for LocalProcessExecutor {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn can_execute(&self, spec: &JobSpec) -> bool {
        !spec.command.is_empty() && spec.workspace.is_dir()
    }

    async fn spawn(&self, spec: JobSpec) -> Result<JobHandle> {
        let (program, args) = spec
            .command
            .split_first()
            .ok_or_else(|| Error::ExecutionFailed("empty command".to_string()))?;

        let mut child = Command::new(program)
            .args(args)
            .current_dir(&spec.workspace)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::ExecutionFailed(format!("Failed to start '{}': {}", program, e)))?;

        let pid = child.id().map(|p| p.to_string()).unwrap_or_default();
        info!(job = %spec.id, pid = %pid, command = ?spec.command, "Spawned process");

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, LogStream::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, LogStream::Stderr, tx));
        }

        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.jobs.lock().await.insert(
            spec.id,
            LocalJob {
                child: Some(child),
                logs: Some(rx),
                cancel: Some(cancel_tx),
                cancel_rx: Some(cancel_rx),
                started_at: Utc::now(),
                timeout: spec.timeout,
                outcome: None,
            },
        );

        Ok(JobHandle {
            id: spec.id,
            executor_id: pid,
            executor_name: self.name().to_string(),
        })
    }

    async fn logs(&self, handle: &JobHandle) -> Result<BoxStream<'static, LogLine>> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(&handle.id)
            .ok_or_else(|| Error::NotFound(format!("job {}", handle.id)))?;
        match job.logs.take() {
            Some(rx) => Ok(Box::pin(UnboundedReceiverStream::new(rx))),
            None => {
                debug!(job = %handle.id, "Logs already consumed");
                Ok(Box::pin(stream::empty()))
            }
        }
    }

    async fn status(&self, handle: &JobHandle) -> Result<JobStatus> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(&handle.id)
            .ok_or_else(|| Error::NotFound(format!("job {}", handle.id)))?;

        if let Some(outcome) = &job.outcome {
            return Ok(outcome.clone());
        }
        let started_at = job.started_at;
        match job.child.as_mut() {
            Some(child) => match child.try_wait()? {
                Some(exit) => {
                    let status = Self::status_from_exit(started_at, exit);
                    job.outcome = Some(status.clone());
                    Ok(status)
                }
                None => Ok(JobStatus::Running { started_at }),
            },
            // Being waited on.
            None => Ok(JobStatus::Running { started_at }),
        }
    }

    async fn wait(&self, handle: &JobHandle) -> Result<JobResult> {
        let (mut child, mut cancel_rx, timeout, started_at) = {
            let mut jobs = self.jobs.lock().await;
            let job = jobs
                .get_mut(&handle.id)
                .ok_or_else(|| Error::NotFound(format!("job {}", handle.id)))?;
            if let Some(outcome) = &job.outcome {
                return Ok(Self::result_for(outcome.clone()));
            }
            let child = job
                .child
                .take()
                .ok_or_else(|| Error::Internal(format!("job {} is already awaited", handle.id)))?;
            let cancel_rx = job
                .cancel_rx
                .take()
                .ok_or_else(|| Error::Internal(format!("job {} is already awaited", handle.id)))?;
            (child, cancel_rx, job.timeout, job.started_at)
        };

        let deadline = async {
            match timeout {
                Some(limit) => {
                    tokio::time::sleep(limit).await;
                    limit
                }
                None => std::future::pending().await,
            }
        };

        let ending = tokio::select! {
            exit = child.wait() => Ending::Exited(exit),
            limit = deadline => Ending::TimedOut(limit),
            Ok(()) = &mut cancel_rx => Ending::Cancelled,
        };

        let status = match ending {
            Ending::Exited(Ok(exit)) => Self::status_from_exit(started_at, exit),
            Ending::Exited(Err(e)) => JobStatus::Failed {
                started_at: Some(started_at),
                finished_at: Utc::now(),
                exit_code: None,
                message: format!("failed to wait for process: {}", e),
            },
            Ending::TimedOut(limit) => {
                warn!(job = %handle.id, timeout_secs = limit.as_secs(), "Job timed out");
                if let Err(e) = child.kill().await {
                    warn!(job = %handle.id, error = %e, "Failed to kill timed out process");
                }
                JobStatus::Failed {
                    started_at: Some(started_at),
                    finished_at: Utc::now(),
                    exit_code: None,
                    message: format!("timed out after {}s", limit.as_secs_f64()),
                }
            }
            Ending::Cancelled => {
                if let Err(e) = child.kill().await {
                    warn!(job = %handle.id, error = %e, "Failed to kill cancelled process");
                }
                JobStatus::Cancelled {
                    started_at: Some(started_at),
                    cancelled_at: Utc::now(),
                }
            }
        };

        if let Some(job) = self.jobs.lock().await.get_mut(&handle.id) {
            job.outcome = Some(status.clone());
        }
        Ok(Self::result_for(status))
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(&handle.id)
            .ok_or_else(|| Error::NotFound(format!("job {}", handle.id)))?;

        if job.outcome.as_ref().is_some_and(JobStatus::is_terminal) {
            return Ok(());
        }

        match job.child.as_mut() {
            // Nobody is waiting yet; kill directly.
            Some(child) => {
                child.start_kill()?;
                job.outcome = Some(JobStatus::Cancelled {
                    started_at: Some(job.started_at),
                    cancelled_at: Utc::now(),
                });
            }
            None => {
                if let Some(cancel) = job.cancel.take() {
                    let _ = cancel.send(());
                }
            }
        }
        info!(job = %handle.id, "Cancelled job");
        Ok(())
    }

    async fn cleanup(&self, handle: &JobHandle) -> Result<()> {
        self.jobs.lock().await.remove(&handle.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::sync::Arc;

    fn shell(script: &str, workspace: &std::path::Path) -> JobSpec {
        JobSpec {
            id: ResourceId::new(),
            image: None,
            command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            workspace: workspace.to_path_buf(),
            env: HashMap::new(),
            timeout: None,
            volumes: vec![],
        }
    }

    async fn collect_logs(executor: &LocalProcessExecutor, handle: &JobHandle) -> Vec<LogLine> {
        executor.logs(handle).await.unwrap().collect().await
    }

    #[tokio::test]
    async fn test_successful_job_streams_both_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let executor = LocalProcessExecutor::new();
        let handle = executor
            .spawn(shell("echo hello; echo oops 1>&2", dir.path()))
            .await
            .unwrap();
        assert_eq!(handle.executor_name, "local");

        let result = executor.wait(&handle).await.unwrap();
        assert_eq!(result.exit_code, Some(0));
        assert!(matches!(result.status, JobStatus::Succeeded { .. }));

        let logs = collect_logs(&executor, &handle).await;
        assert!(
            logs.iter()
                .any(|l| l.content == "hello" && l.stream == LogStream::Stdout)
        );
        assert!(
            logs.iter()
                .any(|l| l.content == "oops" && l.stream == LogStream::Stderr)
        );
    }

    #[tokio::test]
    async fn test_failing_job_reports_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let executor = LocalProcessExecutor::new();
        let handle = executor.spawn(shell("exit 42", dir.path())).await.unwrap();

        let result = executor.wait(&handle).await.unwrap();
        assert_eq!(result.exit_code, Some(42));
        match result.status {
            JobStatus::Failed { exit_code, .. } => assert_eq!(exit_code, Some(42)),
            other => panic!("Expected Failed, got {:?}", other),
        }
        // A finished job keeps reporting its outcome.
        assert!(executor.status(&handle).await.unwrap().is_terminal());
    }

    #[tokio::test]
    async fn test_env_and_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let executor = LocalProcessExecutor::new();
        let mut spec = shell("echo $GREETING; pwd -P", dir.path());
        spec.env
            .insert("GREETING".to_string(), "hello_world".to_string());

        let handle = executor.spawn(spec).await.unwrap();
        executor.wait(&handle).await.unwrap();
        let logs = collect_logs(&executor, &handle).await;

        let expected_dir = dir.path().canonicalize().unwrap();
        assert!(logs.iter().any(|l| l.content == "hello_world"));
        assert!(
            logs.iter()
                .any(|l| l.content == expected_dir.to_string_lossy())
        );
    }

    #[tokio::test]
    async fn test_timeout_kills_the_process() {
        let dir = tempfile::tempdir().unwrap();
        let executor = LocalProcessExecutor::new();
        let mut spec = shell("sleep 5", dir.path());
        spec.timeout = Some(Duration::from_millis(200));

        let handle = executor.spawn(spec).await.unwrap();
        let result = executor.wait(&handle).await.unwrap();
        match result.status {
            JobStatus::Failed { message, .. } => assert!(message.contains("timed out")),
            other => panic!("Expected Failed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_while_waiting() {
        let dir = tempfile::tempdir().unwrap();
        let executor = Arc::new(LocalProcessExecutor::new());
        let handle = executor.spawn(shell("sleep 5", dir.path())).await.unwrap();

        let waiter = {
            let executor = executor.clone();
            let handle = handle.clone();
            tokio::spawn(async move { executor.wait(&handle).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        executor.cancel(&handle).await.unwrap();

        let result = waiter.await.unwrap().unwrap();
        assert!(matches!(result.status, JobStatus::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_cancel_before_waiting() {
        let dir = tempfile::tempdir().unwrap();
        let executor = LocalProcessExecutor::new();
        let handle = executor.spawn(shell("sleep 5", dir.path())).await.unwrap();

        executor.cancel(&handle).await.unwrap();
        let result = executor.wait(&handle).await.unwrap();
        assert!(matches!(result.status, JobStatus::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_empty_command_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let executor = LocalProcessExecutor::new();
        let mut spec = shell("true", dir.path());
        spec.command.clear();

        assert!(!executor.can_execute(&spec).await);
        assert!(matches!(
            executor.spawn(spec).await,
            Err(Error::ExecutionFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_program_is_an_execution_failure() {
        let dir = tempfile::tempdir().unwrap();
        let executor = LocalProcessExecutor::new();
        let mut spec = shell("true", dir.path());
        spec.command = vec!["layerkit-definitely-not-a-program".to_string()];

        assert!(matches!(
            executor.spawn(spec).await,
            Err(Error::ExecutionFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_cleanup_forgets_the_job() {
        let dir = tempfile::tempdir().unwrap();
        let executor = LocalProcessExecutor::new();
        let handle = executor.spawn(shell("true", dir.path())).await.unwrap();
        executor.wait(&handle).await.unwrap();
        executor.cleanup(&handle).await.unwrap();

        assert!(matches!(
            executor.status(&handle).await,
            Err(Error::NotFound(_))
        ));
    }
}
