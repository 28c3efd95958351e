use crate::errors::{Result, SandboxError};
use crate::policy::BudgetPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Execution mode determines which backend dispatches sandboxed runs
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One short-lived container per run on the local container runtime
    #[default]
    Container,

    /// One single-run Job per run on the cluster scheduler
    ClusterJob,
}

impl ExecutionMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "container" | "docker" => Some(Self::Container),
            "cluster_job" | "cluster-job" | "cluster" | "kubernetes" | "k8s" => {
                Some(Self::ClusterJob)
            }
            _ => None,
        }
    }

    /// Description for logging/debugging
    pub fn description(&self) -> &'static str {
        match self {
            ExecutionMode::Container => "Container runtime (network none, read-only root)",
            ExecutionMode::ClusterJob => "Cluster job (deny-egress policy, read-only root)",
        }
    }
}

/// Resource ceilings applied to every sandboxed runner
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResourceLimits {
    /// Maximum memory in MB
    pub memory_mb: usize,
    /// CPU quota in cores
    pub cpus: f64,
    /// Maximum number of processes inside the sandbox
    pub max_processes: u64,
    /// Maximum CPU time in seconds (script runs, enforced with rlimits)
    pub cpu_seconds: u64,
    /// Maximum number of threads for the engine and scientific libraries
    pub max_threads: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 1024,
            cpus: 1.0,
            max_processes: 64,
            cpu_seconds: 60,
            max_threads: 2,
        }
    }
}

/// Import control policy for script runs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ImportPolicy {
    /// Block specific modules
    Blacklist(HashSet<String>),
    /// Only allow specific modules
    Whitelist(HashSet<String>),
    /// Both whitelist and blacklist
    Both {
        whitelist: HashSet<String>,
        blacklist: HashSet<String>,
    },
}

impl Default for ImportPolicy {
    fn default() -> Self {
        Self::data_science_whitelist()
    }
}

impl ImportPolicy {
    /// Check if an import is allowed
    pub fn is_allowed(&self, module: &str) -> bool {
        let root_module = module.split('.').next().unwrap_or(module);

        match self {
            ImportPolicy::Blacklist(blacklist) => !blacklist.contains(root_module),
            ImportPolicy::Whitelist(whitelist) => whitelist.contains(root_module),
            ImportPolicy::Both {
                whitelist,
                blacklist,
            } => whitelist.contains(root_module) && !blacklist.contains(root_module),
        }
    }

    /// Sorted allow-list roots, or `None` when any non-denied module is allowed
    pub fn allowed_roots(&self) -> Option<Vec<String>> {
        match self {
            ImportPolicy::Blacklist(_) => None,
            ImportPolicy::Whitelist(whitelist) | ImportPolicy::Both { whitelist, .. } => {
                Some(sorted(whitelist))
            }
        }
    }

    pub fn denied_roots(&self) -> Vec<String> {
        match self {
            ImportPolicy::Blacklist(blacklist) | ImportPolicy::Both { blacklist, .. } => {
                sorted(blacklist)
            }
            ImportPolicy::Whitelist(_) => Vec::new(),
        }
    }

    /// Analysis-only modules: dataframes, numerics and pure-Python helpers
    pub fn data_science_whitelist() -> Self {
        let whitelist = [
            "pandas", "numpy", "scipy", "statsmodels", "math", "statistics", "decimal",
            "fractions", "numbers", "random", "datetime", "time", "calendar", "collections",
            "itertools", "functools", "operator", "re", "string", "textwrap", "json", "typing",
            "dataclasses", "enum", "heapq", "bisect", "copy",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        ImportPolicy::Whitelist(whitelist)
    }
}

fn sorted(set: &HashSet<String>) -> Vec<String> {
    let mut v: Vec<String> = set.iter().cloned().collect();
    v.sort();
    v
}

/// Settings for the local container runtime backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ContainerConfig {
    /// Container CLI (`docker` or a compatible drop-in such as `podman`)
    pub docker_path: PathBuf,
    /// Numeric `uid:gid` the runner executes as
    pub user: String,
    /// Size of the writable `/tmp` tmpfs in MB
    pub tmpfs_mb: u64,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            docker_path: PathBuf::from("docker"),
            user: "65534:65534".to_string(),
            tmpfs_mb: 64,
        }
    }
}

/// Settings for the cluster job backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClusterConfig {
    pub kubectl_path: PathBuf,
    pub namespace: String,
    /// Persistent volume claim holding the dataset directories
    pub data_claim: String,
    pub run_as_user: u32,
    pub run_as_group: u32,
    pub poll_interval_ms: u64,
    pub ttl_seconds_after_finished: u32,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            kubectl_path: PathBuf::from("kubectl"),
            namespace: "sqlsandbox".to_string(),
            data_claim: "sqlsandbox-datasets".to_string(),
            run_as_user: 65534,
            run_as_group: 65534,
            poll_interval_ms: 500,
            ttl_seconds_after_finished: 300,
        }
    }
}

/// Bounded retry with exponential backoff for infrastructure failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 2_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(
            self.initial_backoff_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }
}

/// Process-wide sandbox configuration, passed to executors at construction
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SandboxConfig {
    pub mode: ExecutionMode,
    /// Image containing the `sqlsandbox-runner` binary
    pub runner_image: String,
    /// Host directory holding one sub-directory per dataset
    pub host_data_root: PathBuf,
    /// Where datasets appear inside the sandbox
    pub sandbox_data_root: PathBuf,
    pub limits: ResourceLimits,
    pub container: ContainerConfig,
    pub cluster: ClusterConfig,
    pub retry: RetryPolicy,
    pub budget: BudgetPolicy,
    /// Ceiling for `limit` in query plans
    pub max_plan_limit: u64,
    /// Whether `script` submissions are accepted at all
    pub script_enabled: bool,
    pub import_policy: ImportPolicy,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::default(),
            runner_image: "sqlsandbox-runner:latest".to_string(),
            host_data_root: PathBuf::from("/srv/sqlsandbox/datasets"),
            sandbox_data_root: PathBuf::from("/data"),
            limits: ResourceLimits::default(),
            container: ContainerConfig::default(),
            cluster: ClusterConfig::default(),
            retry: RetryPolicy::default(),
            budget: BudgetPolicy::default(),
            max_plan_limit: 10_000,
            script_enabled: false,
            import_policy: ImportPolicy::default(),
        }
    }
}

impl SandboxConfig {
    /// Load from a JSON file; missing fields take their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SandboxError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|e| {
            SandboxError::Config(format!("failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `SQLSANDBOX_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var("SQLSANDBOX_CONFIG") {
            Ok(path) if !path.trim().is_empty() => Self::load(Path::new(path.trim()))?,
            _ => Self::default(),
        };

        if let Ok(v) = std::env::var("SQLSANDBOX_MODE") {
            config.mode = ExecutionMode::parse(&v)
                .ok_or_else(|| SandboxError::Config(format!("unknown execution mode '{}'", v)))?;
        }
        if let Ok(v) = std::env::var("SQLSANDBOX_RUNNER_IMAGE") {
            config.runner_image = v;
        }
        if let Ok(v) = std::env::var("SQLSANDBOX_HOST_DATA_ROOT") {
            config.host_data_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SQLSANDBOX_DOCKER") {
            config.container.docker_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SQLSANDBOX_KUBECTL") {
            config.cluster.kubectl_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SQLSANDBOX_NAMESPACE") {
            config.cluster.namespace = v;
        }
        if let Ok(v) = std::env::var("SQLSANDBOX_SCRIPT_ENABLED") {
            config.script_enabled = matches!(v.trim(), "1" | "true" | "yes");
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.runner_image.trim().is_empty() {
            return Err(SandboxError::Config("runner_image is empty".to_string()));
        }
        if !self.sandbox_data_root.is_absolute() {
            return Err(SandboxError::Config(format!(
                "sandbox_data_root {} must be absolute",
                self.sandbox_data_root.display()
            )));
        }
        if self.limits.memory_mb == 0 || self.limits.cpus <= 0.0 || self.limits.max_processes == 0 {
            return Err(SandboxError::Config(
                "resource limits must be positive".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(SandboxError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.max_plan_limit == 0 {
            return Err(SandboxError::Config("max_plan_limit must be positive".to_string()));
        }
        Ok(())
    }
}

/// Settings the runner reads inside the sandbox.
///
/// Executors derive it from [`SandboxConfig`] and hand it over as
/// `SQLSANDBOX_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerConfig {
    pub data_root: PathBuf,
    /// Interpreter for script runs; looked up on PATH when unset
    pub python_path: Option<PathBuf>,
    pub script_enabled: bool,
    pub import_policy: ImportPolicy,
    pub limits: ResourceLimits,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("/data"),
            python_path: None,
            script_enabled: false,
            import_policy: ImportPolicy::default(),
            limits: ResourceLimits::default(),
        }
    }
}

impl RunnerConfig {
    pub fn for_sandbox(config: &SandboxConfig) -> Self {
        Self {
            data_root: config.sandbox_data_root.clone(),
            python_path: None,
            script_enabled: config.script_enabled,
            import_policy: config.import_policy.clone(),
            limits: config.limits.clone(),
        }
    }

    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(v) = std::env::var("SQLSANDBOX_DATA_ROOT") {
            config.data_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SQLSANDBOX_PYTHON") {
            if !v.trim().is_empty() {
                config.python_path = Some(PathBuf::from(v.trim()));
            }
        }
        if let Ok(v) = std::env::var("SQLSANDBOX_SCRIPT_ENABLED") {
            config.script_enabled = matches!(v.trim(), "1" | "true" | "yes");
        }
        if let Ok(v) = std::env::var("SQLSANDBOX_IMPORT_POLICY") {
            config.import_policy = serde_json::from_str(&v).map_err(|e| {
                SandboxError::Config(format!("invalid SQLSANDBOX_IMPORT_POLICY: {}", e))
            })?;
        }
        if let Ok(v) = std::env::var("SQLSANDBOX_LIMITS") {
            config.limits = serde_json::from_str(&v)
                .map_err(|e| SandboxError::Config(format!("invalid SQLSANDBOX_LIMITS: {}", e)))?;
        }
        Ok(config)
    }

    /// Environment variables that reproduce this config in the runner
    pub fn to_env_vars(&self) -> Result<Vec<(String, String)>> {
        let mut vars = vec![
            (
                "SQLSANDBOX_DATA_ROOT".to_string(),
                self.data_root.display().to_string(),
            ),
            (
                "SQLSANDBOX_SCRIPT_ENABLED".to_string(),
                self.script_enabled.to_string(),
            ),
            (
                "SQLSANDBOX_IMPORT_POLICY".to_string(),
                serde_json::to_string(&self.import_policy)?,
            ),
            (
                "SQLSANDBOX_LIMITS".to_string(),
                serde_json::to_string(&self.limits)?,
            ),
        ];
        if let Some(python) = &self.python_path {
            vars.push(("SQLSANDBOX_PYTHON".to_string(), python.display().to_string()));
        }
        Ok(vars)
    }
}
