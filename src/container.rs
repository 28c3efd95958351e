//! Container runtime backend: one short-lived `docker run` per request.
//!
//! The container has no network, a read-only root filesystem, no capabilities,
//! a non-root user, and the dataset directory mounted read-only. The request is
//! written to the runner's stdin; the runner's stdout is the result.

use crate::{
    config::{ContainerConfig, ResourceLimits, RetryPolicy, RunnerConfig, SandboxConfig},
    engine::{Executor, ExecutorCapabilities},
    errors::{Result, SandboxError},
    paths::validate_dataset_id,
    protocol::{normalize_output, ExecutionRequest, ExecutionResult},
};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// `docker run` exit codes meaning the runtime, not the container, failed
const RUNTIME_EXIT_CODES: [i32; 3] = [125, 126, 127];
/// SIGKILL from inside the container, usually the OOM killer
const KILLED_EXIT_CODE: i32 = 137;

pub struct ContainerExecutor {
    image: String,
    host_data_root: PathBuf,
    sandbox_data_root: PathBuf,
    limits: ResourceLimits,
    container: ContainerConfig,
    retry: RetryPolicy,
    runner: RunnerConfig,
}

impl ContainerExecutor {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            image: config.runner_image.clone(),
            host_data_root: config.host_data_root.clone(),
            sandbox_data_root: config.sandbox_data_root.clone(),
            limits: config.limits.clone(),
            container: config.container.clone(),
            retry: config.retry.clone(),
            runner: RunnerConfig::for_sandbox(config),
        }
    }

    /// Arguments for `docker run`, excluding the binary itself
    pub(crate) fn run_args(&self, name: &str, request: &ExecutionRequest) -> Result<Vec<String>> {
        validate_dataset_id(&request.dataset_id)?;
        let host_dir = self.host_data_root.join(&request.dataset_id);
        let sandbox_dir = self.sandbox_data_root.join(&request.dataset_id);

        let mut args: Vec<String> = vec![
            "run".into(),
            "--rm".into(),
            "-i".into(),
            "--name".into(),
            name.into(),
            "--network".into(),
            "none".into(),
            "--read-only".into(),
            "--user".into(),
            self.container.user.clone(),
            "--cap-drop".into(),
            "ALL".into(),
            "--security-opt".into(),
            "no-new-privileges".into(),
            "--pids-limit".into(),
            self.limits.max_processes.to_string(),
            "--memory".into(),
            format!("{}m", self.limits.memory_mb),
            "--memory-swap".into(),
            format!("{}m", self.limits.memory_mb),
            "--cpus".into(),
            self.limits.cpus.to_string(),
            "--tmpfs".into(),
            format!("/tmp:rw,noexec,nosuid,size={}m", self.container.tmpfs_mb),
            "-v".into(),
            format!("{}:{}:ro", host_dir.display(), sandbox_dir.display()),
        ];
        for (key, value) in self.runner.to_env_vars()? {
            args.push("-e".into());
            args.push(format!("{}={}", key, value));
        }
        args.push(self.image.clone());
        Ok(args)
    }

    async fn kill_container(&self, name: &str) {
        let result = Command::new(&self.container.docker_path)
            .args(["kill", name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(e) = result {
            warn!("[EXECUTOR] Failed to kill container {}: {}", name, e);
        }
    }

    fn interpret(&self, name: &str, output: Output) -> Result<ExecutionResult> {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let code = output.status.code();

        match code {
            Some(c) if RUNTIME_EXIT_CODES.contains(&c) => {
                return Err(SandboxError::ExecutorDispatch(format!(
                    "container runtime exited {} for {}: {}",
                    c,
                    name,
                    stderr.trim()
                )));
            }
            Some(KILLED_EXIT_CODE) => {
                return Err(SandboxError::ResourceLimitExceeded(format!(
                    "container {} was killed (memory limit {}m)",
                    name, self.limits.memory_mb
                )));
            }
            None => {
                return Err(SandboxError::ExecutorDispatch(format!(
                    "container runtime for {} terminated by signal",
                    name
                )));
            }
            _ => {}
        }

        match normalize_output(&stdout) {
            Ok(result) => Ok(result),
            Err(e) if !output.status.success() => Err(SandboxError::RunnerProtocol(format!(
                "runner exited {:?} ({}); stderr: {}",
                code,
                e,
                stderr.trim()
            ))),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Executor for ContainerExecutor {
    fn backend(&self) -> &str {
        "container"
    }

    async fn dispatch(&self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        let name = format!("sqlsandbox-{}", uuid::Uuid::new_v4().simple());
        let args = self.run_args(&name, request)?;
        let payload = request.to_json()?;
        debug!(
            "[EXECUTOR] {} {}",
            self.container.docker_path.display(),
            args.join(" ")
        );

        let deadline = Instant::now() + Duration::from_secs(request.timeout_seconds);
        let mut child = Command::new(&self.container.docker_path)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SandboxError::ExecutorDispatch(format!(
                    "failed to start {}: {}",
                    self.container.docker_path.display(),
                    e
                ))
            })?;

        // The runtime may never read stdin, so the write must not hold up the deadline.
        let writer = child.stdin.take().map(|mut stdin| {
            let name = name.clone();
            tokio::spawn(async move {
                // A runtime that failed early shows up in the exit code below.
                if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                    debug!("[EXECUTOR] Could not write request to {}: {}", name, e);
                }
            })
        });

        let waited = tokio::time::timeout_at(deadline, child.wait_with_output()).await;
        if let Some(writer) = writer {
            writer.abort();
        }
        match waited {
            Ok(Ok(output)) => {
                let result = self.interpret(&name, output)?;
                info!(
                    "[EXECUTOR] Container {} finished: {:?}, {} rows",
                    name, result.status, result.row_count
                );
                Ok(result)
            }
            Ok(Err(e)) => Err(SandboxError::ExecutorDispatch(format!(
                "waiting on container {}: {}",
                name, e
            ))),
            Err(_) => {
                warn!(
                    "[EXECUTOR] Container {} exceeded {}s, killing",
                    name, request.timeout_seconds
                );
                self.kill_container(&name).await;
                Err(SandboxError::RunTimeout(request.timeout_seconds))
            }
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.retry.clone()
    }

    fn capabilities(&self) -> ExecutorCapabilities {
        ExecutorCapabilities {
            backend: self.backend().to_string(),
            network_isolated: true,
            read_only_data: true,
            read_only_root: true,
            max_memory_mb: self.limits.memory_mb,
            max_cpus: self.limits.cpus,
            security_level: 8,
        }
    }
}
