use crate::{
    capsule::{CapsuleStore, FileCapsuleStore, MemoryCapsuleStore},
    cluster::ClusterJobExecutor,
    config::{ExecutionMode, SandboxConfig},
    container::ContainerExecutor,
    engine::Executor,
    sandbox::QuerySandbox,
    Result,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Where capsules are kept
#[derive(Debug, Clone, Default)]
pub enum CapsuleBackend {
    /// Lost on restart; suitable for tests and single-process tools
    #[default]
    Memory,
    /// One JSON document per run under this directory
    Directory(PathBuf),
}

/// Options for creating a sandbox
#[derive(Debug, Clone, Default)]
pub struct SandboxOptions {
    pub config: SandboxConfig,
    pub capsules: CapsuleBackend,
}

impl SandboxOptions {
    pub fn with_capsule_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.capsules = CapsuleBackend::Directory(dir.into());
        self
    }
}

/// Build the executor selected by `config.mode`
pub fn create_executor(config: &SandboxConfig) -> Result<Arc<dyn Executor>> {
    config.validate()?;
    info!("[SANDBOX] Execution mode: {}", config.mode.description());
    let executor: Arc<dyn Executor> = match config.mode {
        ExecutionMode::Container => Arc::new(ContainerExecutor::new(config)),
        ExecutionMode::ClusterJob => Arc::new(ClusterJobExecutor::new(config)),
    };
    Ok(executor)
}

pub fn create_capsule_store(backend: &CapsuleBackend) -> Result<Arc<dyn CapsuleStore>> {
    let store: Arc<dyn CapsuleStore> = match backend {
        CapsuleBackend::Memory => Arc::new(MemoryCapsuleStore::new()),
        CapsuleBackend::Directory(dir) => Arc::new(FileCapsuleStore::new(dir)?),
    };
    Ok(store)
}

/// Create sandbox with custom options
pub fn create_sandbox_with_options(options: SandboxOptions) -> Result<QuerySandbox> {
    let executor = create_executor(&options.config)?;
    let store = create_capsule_store(&options.capsules)?;
    QuerySandbox::new(&options.config, executor, store)
}

/// Create a sandbox from `SQLSANDBOX_*` environment variables, capsules in memory
pub fn create_default_sandbox() -> Result<QuerySandbox> {
    create_sandbox_with_options(SandboxOptions {
        config: SandboxConfig::from_env()?,
        capsules: CapsuleBackend::Memory,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SandboxError;

    #[test]
    fn test_mode_selects_backend() {
        let container = create_executor(&SandboxConfig::default()).unwrap();
        assert_eq!(container.backend(), "container");

        let cluster = create_executor(&SandboxConfig {
            mode: ExecutionMode::ClusterJob,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(cluster.backend(), "cluster-job");
        assert!(cluster.capabilities().network_isolated);
    }

    #[test]
    fn test_invalid_config_is_refused() {
        let config = SandboxConfig {
            runner_image: " ".to_string(),
            ..Default::default()
        };
        assert!(matches!(create_executor(&config), Err(SandboxError::Config(_))));
    }

    #[test]
    fn test_sandbox_with_capsule_directory() {
        let dir = tempfile::tempdir().unwrap();
        let options = SandboxOptions::default().with_capsule_dir(dir.path().join("capsules"));
        let sandbox = create_sandbox_with_options(options).unwrap();
        assert_eq!(sandbox.backend(), "container");
        assert!(dir.path().join("capsules").is_dir());
    }
}
