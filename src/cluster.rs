//! Cluster job backend: one single-run Job per request, driven through `kubectl`.
//!
//! Each Job runs the runner image with no retries, a deadline, a non-root
//! read-only container, and the dataset claim mounted read-only. A deny-all
//! NetworkPolicy selects every runner pod. The request travels in an
//! environment variable and the result comes back through the pod log.

use crate::{
    config::{ClusterConfig, ResourceLimits, RetryPolicy, RunnerConfig, SandboxConfig},
    engine::{Executor, ExecutorCapabilities},
    errors::{Result, SandboxError},
    paths::validate_dataset_id,
    protocol::{normalize_output, ExecutionRequest, ExecutionResult},
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const RUNNER_LABEL_KEY: &str = "app.kubernetes.io/component";
pub const RUNNER_LABEL_VALUE: &str = "sqlsandbox-runner";
pub const REQUEST_ENV: &str = "SQLSANDBOX_REQUEST";
const NETWORK_POLICY_NAME: &str = "sqlsandbox-runner-deny-all";
const CONTAINER_NAME: &str = "runner";
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, PartialEq)]
enum JobPhase {
    Active,
    Succeeded,
    Failed(Option<String>),
}

pub struct ClusterJobExecutor {
    image: String,
    sandbox_data_root: PathBuf,
    limits: ResourceLimits,
    cluster: ClusterConfig,
    tmpfs_mb: u64,
    retry: RetryPolicy,
    runner: RunnerConfig,
    network_policy: OnceCell<()>,
}

impl ClusterJobExecutor {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            image: config.runner_image.clone(),
            sandbox_data_root: config.sandbox_data_root.clone(),
            limits: config.limits.clone(),
            cluster: config.cluster.clone(),
            tmpfs_mb: config.container.tmpfs_mb,
            retry: config.retry.clone(),
            runner: RunnerConfig::for_sandbox(config),
            network_policy: OnceCell::new(),
        }
    }

    async fn kubectl(&self, args: &[&str], stdin: Option<&str>) -> Result<String> {
        let mut cmd = Command::new(&self.cluster.kubectl_path);
        cmd.arg("--namespace")
            .arg(&self.cluster.namespace)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            SandboxError::ExecutorDispatch(format!(
                "failed to start {}: {}",
                self.cluster.kubectl_path.display(),
                e
            ))
        })?;
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).await.map_err(|e| {
                SandboxError::ExecutorDispatch(format!("writing to kubectl: {}", e))
            })?;
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| SandboxError::ExecutorDispatch(format!("waiting on kubectl: {}", e)))?;

        if !output.status.success() {
            return Err(SandboxError::ExecutorDispatch(format!(
                "kubectl {} failed: {}",
                args.first().copied().unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn network_policy_manifest(&self) -> Value {
        json!({
            "apiVersion": "networking.k8s.io/v1",
            "kind": "NetworkPolicy",
            "metadata": {
                "name": NETWORK_POLICY_NAME,
                "namespace": self.cluster.namespace,
            },
            "spec": {
                "podSelector": { "matchLabels": { RUNNER_LABEL_KEY: RUNNER_LABEL_VALUE } },
                "policyTypes": ["Ingress", "Egress"],
                "ingress": [],
                "egress": [],
            }
        })
    }

    async fn ensure_network_policy(&self) -> Result<()> {
        self.network_policy
            .get_or_try_init(|| async {
                self.kubectl(
                    &["apply", "-f", "-"],
                    Some(&self.network_policy_manifest().to_string()),
                )
                .await?;
                info!(
                    "[CLUSTER] Ensured deny-all NetworkPolicy in namespace {}",
                    self.cluster.namespace
                );
                Ok::<(), SandboxError>(())
            })
            .await?;
        Ok(())
    }

    pub(crate) fn job_manifest(&self, name: &str, request: &ExecutionRequest) -> Result<Value> {
        validate_dataset_id(&request.dataset_id)?;
        let mount_path = self.sandbox_data_root.join(&request.dataset_id);

        let mut env = vec![json!({ "name": REQUEST_ENV, "value": request.to_json()? })];
        for (key, value) in self.runner.to_env_vars()? {
            env.push(json!({ "name": key, "value": value }));
        }

        let resources = json!({
            "memory": format!("{}Mi", self.limits.memory_mb),
            "cpu": format!("{}m", (self.limits.cpus * 1000.0).round() as u64),
        });
        let labels = json!({
            RUNNER_LABEL_KEY: RUNNER_LABEL_VALUE,
            "sqlsandbox/dataset": request.dataset_id,
        });

        Ok(json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {
                "name": name,
                "namespace": self.cluster.namespace,
                "labels": labels,
            },
            "spec": {
                "backoffLimit": 0,
                "activeDeadlineSeconds": request.timeout_seconds,
                "ttlSecondsAfterFinished": self.cluster.ttl_seconds_after_finished,
                "template": {
                    "metadata": { "labels": labels },
                    "spec": {
                        "restartPolicy": "Never",
                        "automountServiceAccountToken": false,
                        "enableServiceLinks": false,
                        "securityContext": {
                            "runAsNonRoot": true,
                            "runAsUser": self.cluster.run_as_user,
                            "runAsGroup": self.cluster.run_as_group,
                            "seccompProfile": { "type": "RuntimeDefault" },
                        },
                        "containers": [{
                            "name": CONTAINER_NAME,
                            "image": self.image,
                            "args": ["--request-env", REQUEST_ENV],
                            "env": env,
                            "resources": { "limits": resources, "requests": resources },
                            "securityContext": {
                                "allowPrivilegeEscalation": false,
                                "readOnlyRootFilesystem": true,
                                "capabilities": { "drop": ["ALL"] },
                            },
                            "volumeMounts": [
                                {
                                    "name": "datasets",
                                    "mountPath": mount_path.display().to_string(),
                                    "subPath": request.dataset_id,
                                    "readOnly": true,
                                },
                                { "name": "tmp", "mountPath": "/tmp" },
                            ],
                        }],
                        "volumes": [
                            {
                                "name": "datasets",
                                "persistentVolumeClaim": {
                                    "claimName": self.cluster.data_claim,
                                    "readOnly": true,
                                },
                            },
                            {
                                "name": "tmp",
                                "emptyDir": {
                                    "medium": "Memory",
                                    "sizeLimit": format!("{}Mi", self.tmpfs_mb),
                                },
                            },
                        ],
                    }
                }
            }
        }))
    }

    async fn job_phase(&self, name: &str) -> Result<JobPhase> {
        let raw = self.kubectl(&["get", "job", name, "-o", "json"], None).await?;
        let job: Value = serde_json::from_str(&raw)
            .map_err(|e| SandboxError::ExecutorDispatch(format!("unreadable job status: {}", e)))?;
        Ok(parse_job_phase(&job))
    }

    async fn was_oom_killed(&self, name: &str) -> bool {
        let selector = format!("job-name={}", name);
        match self
            .kubectl(&["get", "pods", "-l", &selector, "-o", "json"], None)
            .await
        {
            Ok(raw) => serde_json::from_str::<Value>(&raw)
                .map(|pods| pods_oom_killed(&pods))
                .unwrap_or(false),
            Err(e) => {
                debug!("[CLUSTER] Could not inspect pods of {}: {}", name, e);
                false
            }
        }
    }

    async fn delete_job(&self, name: &str, force: bool) {
        let mut args = vec![
            "delete",
            "job",
            name,
            "--ignore-not-found",
            "--wait=false",
            "--cascade=background",
        ];
        if force {
            args.extend(["--grace-period=0", "--force"]);
        }
        if let Err(e) = self.kubectl(&args, None).await {
            warn!("[CLUSTER] Failed to delete job {}: {}", name, e);
        }
    }

    async fn wait_for_job(&self, name: &str) -> Result<JobPhase> {
        let interval = Duration::from_millis(self.cluster.poll_interval_ms.max(1));
        loop {
            match self.job_phase(name).await? {
                JobPhase::Active => tokio::time::sleep(interval).await,
                done => return Ok(done),
            }
        }
    }

    /// Submit the Job and read its result. The caller bounds this with the run deadline.
    async fn run_job(
        &self,
        name: &str,
        manifest: &Value,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResult> {
        self.ensure_network_policy().await?;
        self.kubectl(&["apply", "-f", "-"], Some(&manifest.to_string()))
            .await?;
        info!(
            "[CLUSTER] Submitted job {} in {} for dataset {}",
            name, self.cluster.namespace, request.dataset_id
        );

        let phase = self.wait_for_job(name).await?;
        if let JobPhase::Failed(reason) = &phase {
            if reason.as_deref() == Some("DeadlineExceeded") {
                return Err(SandboxError::RunTimeout(request.timeout_seconds));
            }
            if self.was_oom_killed(name).await {
                return Err(SandboxError::ResourceLimitExceeded(format!(
                    "job {} was OOM-killed (memory limit {}Mi)",
                    name, self.limits.memory_mb
                )));
            }
        }

        let job_ref = format!("job/{}", name);
        let logs = self
            .kubectl(&["logs", &job_ref, "-c", CONTAINER_NAME], None)
            .await?;
        match normalize_output(&logs) {
            Ok(result) => Ok(result),
            Err(e) if phase != JobPhase::Succeeded => Err(SandboxError::RunnerProtocol(format!(
                "job {} failed ({:?}): {}",
                name, phase, e
            ))),
            Err(e) => Err(e),
        }
    }
}

fn parse_job_phase(job: &Value) -> JobPhase {
    let status = &job["status"];
    let conditions = status["conditions"].as_array().cloned().unwrap_or_default();
    let is_true = |c: &Value| c["status"].as_str().map_or(true, |s| s == "True");

    if let Some(failed) = conditions
        .iter()
        .find(|c| c["type"] == "Failed" && is_true(c))
    {
        return JobPhase::Failed(failed["reason"].as_str().map(str::to_string));
    }
    if conditions
        .iter()
        .any(|c| c["type"] == "Complete" && is_true(c))
        || status["succeeded"].as_u64().unwrap_or(0) > 0
    {
        return JobPhase::Succeeded;
    }
    if status["failed"].as_u64().unwrap_or(0) > 0 {
        return JobPhase::Failed(None);
    }
    JobPhase::Active
}

fn pods_oom_killed(pods: &Value) -> bool {
    pods["items"]
        .as_array()
        .into_iter()
        .flatten()
        .flat_map(|pod| {
            pod["status"]["containerStatuses"]
                .as_array()
                .cloned()
                .unwrap_or_default()
        })
        .any(|cs| {
            cs["state"]["terminated"]["reason"] == "OOMKilled"
                || cs["lastState"]["terminated"]["reason"] == "OOMKilled"
        })
}

#[async_trait]
impl Executor for ClusterJobExecutor {
    fn backend(&self) -> &str {
        "cluster-job"
    }

    async fn dispatch(&self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        let name = format!("sqlsandbox-{}", uuid::Uuid::new_v4().simple());
        let manifest = self.job_manifest(&name, request)?;
        let deadline = Instant::now() + Duration::from_secs(request.timeout_seconds);

        let outcome =
            match tokio::time::timeout_at(deadline, self.run_job(&name, &manifest, request)).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(
                        "[CLUSTER] Job {} exceeded {}s, deleting",
                        name, request.timeout_seconds
                    );
                    Err(SandboxError::RunTimeout(request.timeout_seconds))
                }
            };

        let force = matches!(outcome, Err(SandboxError::RunTimeout(_)));
        if tokio::time::timeout(CLEANUP_TIMEOUT, self.delete_job(&name, force))
            .await
            .is_err()
        {
            warn!("[CLUSTER] Deleting job {} did not finish in {:?}", name, CLEANUP_TIMEOUT);
        }

        if let Ok(result) = &outcome {
            info!(
                "[CLUSTER] Job {} finished: {:?}, {} rows",
                name, result.status, result.row_count
            );
        }
        outcome
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
