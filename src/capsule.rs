//! Run capsules: the immutable record of one submission.
//!
//! A capsule is created `Pending` before dispatch and finalized exactly once.
//! After that every read returns the same record.

use crate::{
    errors::{Result, SandboxError},
    plan::QueryPlan,
    policy::ExecutionBudget,
    protocol::{ExecutionResult, QueryType},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CapsuleStatus {
    Pending,
    Succeeded,
    Failed,
    TimedOut,
}

impl CapsuleStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CapsuleStatus::Pending)
    }
}

/// What was asked for, as the sandbox saw it after validation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestRecord {
    pub dataset_id: String,
    pub query_type: QueryType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<QueryPlan>,
    /// Caller-supplied statement or script, verbatim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_text: Option<String>,
    /// The statement actually dispatched
    pub compiled: String,
    pub budget: ExecutionBudget,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunCapsule {
    pub run_id: String,
    pub backend: String,
    pub request: RequestRecord,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub final_status: CapsuleStatus,
    pub result: Option<ExecutionResult>,
    pub error: Option<String>,
}

impl RunCapsule {
    pub fn pending(backend: &str, request: RequestRecord) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4().to_string(),
            backend: backend.to_string(),
            request,
            created_at: now,
            started_at: Some(now),
            finished_at: None,
            final_status: CapsuleStatus::Pending,
            result: None,
            error: None,
        }
    }
}

/// Terminal outcome handed to [`CapsuleStore::finalize`]
#[derive(Debug, Clone)]
pub struct CapsuleOutcome {
    pub status: CapsuleStatus,
    pub result: Option<ExecutionResult>,
    pub error: Option<String>,
}

impl CapsuleOutcome {
    fn apply(self, pending: &RunCapsule) -> Result<RunCapsule> {
        if !self.status.is_terminal() {
            return Err(SandboxError::InternalError(
                "cannot finalize a capsule as pending".to_string(),
            ));
        }
        Ok(RunCapsule {
            finished_at: Some(Utc::now()),
            final_status: self.status,
            result: self.result,
            error: self.error,
            ..pending.clone()
        })
    }
}

/// Capsule persistence. `finalize` succeeds at most once per run id.
pub trait CapsuleStore: Send + Sync {
    fn create(&self, capsule: RunCapsule) -> Result<RunCapsule>;
    fn finalize(&self, run_id: &str, outcome: CapsuleOutcome) -> Result<RunCapsule>;
    fn get(&self, run_id: &str) -> Result<RunCapsule>;
}

/// In-process store
#[derive(Default)]
pub struct MemoryCapsuleStore {
    capsules: RwLock<HashMap<String, Arc<RunCapsule>>>,
}

impl MemoryCapsuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> SandboxError {
        SandboxError::InternalError("capsule store lock poisoned".to_string())
    }
}

impl CapsuleStore for MemoryCapsuleStore {
    fn create(&self, capsule: RunCapsule) -> Result<RunCapsule> {
        let mut capsules = self.capsules.write().map_err(|_| Self::poisoned())?;
        if capsules.contains_key(&capsule.run_id) {
            return Err(SandboxError::InternalError(format!(
                "duplicate run id {}",
                capsule.run_id
            )));
        }
        capsules.insert(capsule.run_id.clone(), Arc::new(capsule.clone()));
        debug!("[CAPSULE] Created {}", capsule.run_id);
        Ok(capsule)
    }

    fn finalize(&self, run_id: &str, outcome: CapsuleOutcome) -> Result<RunCapsule> {
        let mut capsules = self.capsules.write().map_err(|_| Self::poisoned())?;
        let current = capsules
            .get(run_id)
            .ok_or_else(|| SandboxError::CapsuleNotFound(run_id.to_string()))?;
        if current.final_status.is_terminal() {
            return Err(SandboxError::CapsuleAlreadyFinalized(run_id.to_string()));
        }
        let finalized = outcome.apply(current)?;
        capsules.insert(run_id.to_string(), Arc::new(finalized.clone()));
        info!(
            "[CAPSULE] Finalized {} as {:?}",
            run_id, finalized.final_status
        );
        Ok(finalized)
    }

    fn get(&self, run_id: &str) -> Result<RunCapsule> {
        let capsules = self.capsules.read().map_err(|_| Self::poisoned())?;
        capsules
            .get(run_id)
            .map(|c| c.as_ref().clone())
            .ok_or_else(|| SandboxError::CapsuleNotFound(run_id.to_string()))
    }
}

/// One JSON document per run under a directory, replaced atomically
pub struct FileCapsuleStore {
    dir: PathBuf,
    // Serializes finalize so the pending check and the rename cannot interleave.
    write_lock: std::sync::Mutex<()>,
}

impl FileCapsuleStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            write_lock: std::sync::Mutex::new(()),
        })
    }

    fn path_for(&self, run_id: &str) -> Result<PathBuf> {
        let id = Uuid::parse_str(run_id)
            .map_err(|_| SandboxError::CapsuleNotFound(run_id.to_string()))?;
        Ok(self.dir.join(format!("{}.json", id)))
    }

    fn write_atomic(&self, path: &Path, capsule: &RunCapsule) -> Result<()> {
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        serde_json::to_writer_pretty(&mut tmp, capsule)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| SandboxError::IoError(e.error))?;
        Ok(())
    }

    fn read(&self, path: &Path, run_id: &str) -> Result<RunCapsule> {
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SandboxError::CapsuleNotFound(run_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| SandboxError::InternalError("capsule store lock poisoned".to_string()))
    }
}

impl CapsuleStore for FileCapsuleStore {
    fn create(&self, capsule: RunCapsule) -> Result<RunCapsule> {
        let path = self.path_for(&capsule.run_id)?;
        let _guard = self.lock()?;
        if path.exists() {
            return Err(SandboxError::InternalError(format!(
                "duplicate run id {}",
                capsule.run_id
            )));
        }
        self.write_atomic(&path, &capsule)?;
        debug!("[CAPSULE] Created {} at {}", capsule.run_id, path.display());
        Ok(capsule)
    }

    fn finalize(&self, run_id: &str, outcome: CapsuleOutcome) -> Result<RunCapsule> {
        let path = self.path_for(run_id)?;
        let _guard = self.lock()?;
        let current = self.read(&path, run_id)?;
        if current.final_status.is_terminal() {
            return Err(SandboxError::CapsuleAlreadyFinalized(run_id.to_string()));
        }
        let finalized = outcome.apply(&current)?;
        self.write_atomic(&path, &finalized)?;
        info!(
            "[CAPSULE] Finalized {} as {:?}",
            run_id, finalized.final_status
        );
        Ok(finalized)
    }

    fn get(&self, run_id: &str) -> Result<RunCapsule> {
        let path = self.path_for(run_id)?;
        self.read(&path, run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pending() -> RunCapsule {
        RunCapsule::pending(
            "container",
            RequestRecord {
                dataset_id: "support".to_string(),
                query_type: QueryType::Sql,
                plan: None,
                raw_text: Some("SELECT COUNT(*) FROM tickets".to_string()),
                compiled: "SELECT COUNT(*) FROM tickets".to_string(),
                budget: ExecutionBudget::default(),
            },
        )
    }

    fn succeeded() -> CapsuleOutcome {
        CapsuleOutcome {
            status: CapsuleStatus::Succeeded,
            result: Some(ExecutionResult::success(
                vec!["count".to_string()],
                vec![vec![json!(3)]],
                4,
            )),
            error: None,
        }
    }

    fn exercise(store: &dyn CapsuleStore) {
        let created = store.create(pending()).unwrap();
        assert_eq!(store.get(&created.run_id).unwrap().final_status, CapsuleStatus::Pending);

        let finalized = store.finalize(&created.run_id, succeeded()).unwrap();
        assert_eq!(finalized.final_status, CapsuleStatus::Succeeded);
        assert!(finalized.finished_at.is_some());

        let failed = CapsuleOutcome {
            status: CapsuleStatus::Failed,
            result: None,
            error: Some("late".to_string()),
        };
        assert!(matches!(
            store.finalize(&created.run_id, failed),
            Err(SandboxError::CapsuleAlreadyFinalized(_))
        ));

        let first = store.get(&created.run_id).unwrap();
        let second = store.get(&created.run_id).unwrap();
        assert_eq!(first, finalized);
        assert_eq!(first, second);

        let missing = Uuid::new_v4().to_string();
        assert!(matches!(store.get(&missing), Err(SandboxError::CapsuleNotFound(_))));
        assert!(matches!(
            store.finalize(&missing, succeeded()),
            Err(SandboxError::CapsuleNotFound(_))
        ));
    }

    #[test]
    fn test_memory_store_finalizes_once() {
        exercise(&MemoryCapsuleStore::new());
    }

    #[test]
    fn test_file_store_finalizes_once() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&FileCapsuleStore::new(dir.path()).unwrap());
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let run_id = {
            let store = FileCapsuleStore::new(dir.path()).unwrap();
            let created = store.create(pending()).unwrap();
            store.finalize(&created.run_id, succeeded()).unwrap();
            created.run_id
        };
        let reopened = FileCapsuleStore::new(dir.path()).unwrap();
        let capsule = reopened.get(&run_id).unwrap();
        assert_eq!(capsule.final_status, CapsuleStatus::Succeeded);
        assert_eq!(capsule.result.unwrap().rows, vec![vec![json!(3)]]);
        assert!(matches!(
            reopened.get("../../etc/passwd"),
            Err(SandboxError::CapsuleNotFound(_))
        ));
    }

    #[test]
    fn test_pending_outcome_is_rejected() {
        let store = MemoryCapsuleStore::new();
        let created = store.create(pending()).unwrap();
        let outcome = CapsuleOutcome {
            status: CapsuleStatus::Pending,
            result: None,
            error: None,
        };
        assert!(store.finalize(&created.run_id, outcome).is_err());
        assert_eq!(store.get(&created.run_id).unwrap().final_status, CapsuleStatus::Pending);
    }
}
