//! The public entry point: validate, compile, dispatch, record.
//!
//! Everything up to dispatch is checked synchronously and failures return to
//! the caller without a capsule. Once a capsule exists, every outcome ends in
//! exactly one terminal update.

use crate::{
    analyzer::{ScriptPolicy, SqlPolicy},
    capsule::{CapsuleOutcome, CapsuleStatus, CapsuleStore, RequestRecord, RunCapsule},
    compiler::compile,
    config::SandboxConfig,
    engine::{Executor, ExecutorCapabilities},
    errors::{Result, SandboxError},
    paths::{derive_table_names, validate_dataset_id, validate_sandbox_path},
    plan::{validate_plan, Dataset, QueryPlan},
    policy::{BudgetPolicy, ExecutionBudget},
    protocol::{ExecutionRequest, ExecutionResult, FileRef, QueryBody, QueryType, RunStatus},
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Caller-written statement or script
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawQuery {
    pub query_type: QueryType,
    pub text: String,
}

impl RawQuery {
    pub fn sql(text: &str) -> Self {
        Self {
            query_type: QueryType::Sql,
            text: text.to_string(),
        }
    }

    pub fn script(text: &str) -> Self {
        Self {
            query_type: QueryType::Script,
            text: text.to_string(),
        }
    }
}

/// One unit of work. Carries exactly one of `plan` or `raw`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub dataset: Dataset,
    #[serde(default)]
    pub plan: Option<QueryPlan>,
    #[serde(default)]
    pub raw: Option<RawQuery>,
    #[serde(default)]
    pub budget: ExecutionBudget,
}

impl Submission {
    pub fn plan(dataset: Dataset, plan: QueryPlan) -> Self {
        Self {
            dataset,
            plan: Some(plan),
            raw: None,
            budget: ExecutionBudget::default(),
        }
    }

    pub fn raw(dataset: Dataset, raw: RawQuery) -> Self {
        Self {
            dataset,
            plan: None,
            raw: Some(raw),
            budget: ExecutionBudget::default(),
        }
    }

    pub fn with_budget(mut self, budget: ExecutionBudget) -> Self {
        self.budget = budget;
        self
    }
}

pub struct QuerySandbox {
    executor: Arc<dyn Executor>,
    store: Arc<dyn CapsuleStore>,
    budget_policy: BudgetPolicy,
    sql_policy: SqlPolicy,
    script_policy: Option<ScriptPolicy>,
    sandbox_data_root: PathBuf,
    max_plan_limit: u64,
}

impl QuerySandbox {
    /// Script submissions are accepted only when `config.script_enabled`
    /// and a Python interpreter is available for static analysis.
    pub fn new(
        config: &SandboxConfig,
        executor: Arc<dyn Executor>,
        store: Arc<dyn CapsuleStore>,
    ) -> Result<Self> {
        let script_policy = if config.script_enabled {
            Some(ScriptPolicy::from_path_lookup(config.import_policy.clone())?)
        } else {
            None
        };
        Ok(Self {
            executor,
            store,
            budget_policy: config.budget.clone(),
            sql_policy: SqlPolicy::default(),
            script_policy,
            sandbox_data_root: config.sandbox_data_root.clone(),
            max_plan_limit: config.max_plan_limit,
        })
    }

    pub fn backend(&self) -> &str {
        self.executor.backend()
    }

    pub fn capabilities(&self) -> ExecutorCapabilities {
        self.executor.capabilities()
    }

    /// Look up a capsule. Never re-executes.
    ///
    /// Unknown ids give `Ok(None)`; store failures are errors.
    pub fn get(&self, run_id: &str) -> Result<Option<RunCapsule>> {
        match self.store.get(run_id) {
            Ok(capsule) => Ok(Some(capsule)),
            Err(SandboxError::CapsuleNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Validate and run one submission, returning its terminal capsule.
    pub async fn submit(&self, submission: Submission) -> Result<RunCapsule> {
        let (request, record) = match self.prepare(submission).await {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!("[SANDBOX] Rejected before dispatch: {}", e);
                return Err(e);
            }
        };

        let capsule = self
            .store
            .create(RunCapsule::pending(self.executor.backend(), record))?;
        info!(
            "[SANDBOX] Dispatching run {} on {} ({:?}, dataset {})",
            capsule.run_id,
            capsule.backend,
            request.query.query_type(),
            request.dataset_id
        );

        let outcome = outcome_of(self.executor.execute(&request).await, &request);
        self.record(&capsule.run_id, outcome)
    }

    /// Write the terminal update, retrying once on a store failure.
    fn record(&self, run_id: &str, outcome: CapsuleOutcome) -> Result<RunCapsule> {
        match self.store.finalize(run_id, outcome.clone()) {
            Err(e @ SandboxError::CapsuleAlreadyFinalized(_)) => Err(e),
            Err(e) => {
                warn!("[SANDBOX] Finalizing run {} failed, retrying: {}", run_id, e);
                let status = outcome.status;
                self.store.finalize(run_id, outcome).map_err(|e| {
                    error!(
                        "[SANDBOX] Run {} left pending, terminal status was {:?}: {}",
                        run_id, status, e
                    );
                    e
                })
            }
            ok => ok,
        }
    }

    async fn prepare(&self, submission: Submission) -> Result<(ExecutionRequest, RequestRecord)> {
        let budget = self.budget_policy.apply(submission.budget)?;
        let dataset = submission.dataset;
        validate_dataset_id(&dataset.id)?;

        let (query, plan, raw_text) = match (submission.plan, submission.raw) {
            (Some(plan), None) => {
                validate_plan(&plan, &dataset, self.max_plan_limit)?;
                let compiled = compile(&plan)?;
                self.sql_policy.check(&compiled.sql)?;
                (
                    QueryBody::Sql {
                        statement: compiled.sql,
                    },
                    Some(plan),
                    None,
                )
            }
            (None, Some(raw)) => {
                let body = match raw.query_type {
                    QueryType::Sql => {
                        self.sql_policy.check(&raw.text)?;
                        QueryBody::Sql {
                            statement: raw.text.clone(),
                        }
                    }
                    QueryType::Script => {
                        self.check_script(&raw.text).await?;
                        QueryBody::Script {
                            code: raw.text.clone(),
                        }
                    }
                };
                (body, None, Some(raw.text))
            }
            _ => return Err(SandboxError::Conflict),
        };

        let files = self.dataset_files(&dataset)?;
        let record = RequestRecord {
            dataset_id: dataset.id.clone(),
            query_type: query.query_type(),
            plan,
            raw_text,
            compiled: query.text().to_string(),
            budget,
        };
        let request = ExecutionRequest {
            dataset_id: dataset.id,
            files,
            query,
            timeout_seconds: budget.timeout_seconds,
            max_rows: budget.max_rows,
            max_output_bytes: budget.max_output_bytes,
        };
        Ok((request, record))
    }

    async fn check_script(&self, code: &str) -> Result<()> {
        let policy = self.script_policy.clone().ok_or_else(|| {
            SandboxError::SqlPolicyViolation("script submissions are disabled".to_string())
        })?;
        let code = code.to_string();
        tokio::task::spawn_blocking(move || policy.check(&code))
            .await
            .map_err(|e| SandboxError::InternalError(format!("script analysis aborted: {}", e)))?
    }

    /// Sandbox-side paths for every table, confined to the dataset directory
    fn dataset_files(&self, dataset: &Dataset) -> Result<Vec<FileRef>> {
        derive_table_names(dataset.tables.iter().map(|t| t.file.as_str()))?;
        let dataset_root = self.sandbox_data_root.join(&dataset.id);
        dataset
            .tables
            .iter()
            .map(|table| {
                let path = dataset_root.join(&table.file).display().to_string();
                validate_sandbox_path(&dataset_root, &path)?;
                Ok(FileRef {
                    name: table.file.clone(),
                    path,
                })
            })
            .collect()
    }
}

/// Map an executor outcome onto the capsule's terminal state
fn outcome_of(outcome: Result<ExecutionResult>, request: &ExecutionRequest) -> CapsuleOutcome {
    match outcome {
        Ok(result) => {
            let status = match result.status {
                RunStatus::Success => CapsuleStatus::Succeeded,
                RunStatus::Error => CapsuleStatus::Failed,
                RunStatus::Timeout => CapsuleStatus::TimedOut,
            };
            CapsuleOutcome {
                status,
                error: result.error.clone(),
                result: Some(result),
            }
        }
        Err(SandboxError::RunTimeout(secs)) => {
            let message = format!("run exceeded its {}s timeout", secs);
            CapsuleOutcome {
                status: CapsuleStatus::TimedOut,
                result: Some(ExecutionResult::timeout(
                    message.clone(),
                    request.timeout_seconds * 1000,
                )),
                error: Some(message),
            }
        }
        Err(e) => CapsuleOutcome {
            status: CapsuleStatus::Failed,
            result: None,
            error: Some(e.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capsule::MemoryCapsuleStore;
    use crate::plan::{AggregateFunc, ColumnSchema, ColumnType, TableSchema};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Executor that records requests and answers from a closure
    struct ScriptedExecutor {
        calls: AtomicUsize,
        seen: Mutex<Vec<ExecutionRequest>>,
        respond: fn(&ExecutionRequest) -> Result<ExecutionResult>,
    }

    impl ScriptedExecutor {
        fn new(respond: fn(&ExecutionRequest) -> Result<ExecutionResult>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
                respond,
            })
        }
    }

    #[async_trait]
    impl Executor for ScriptedExecutor {
        fn backend(&self) -> &str {
            "scripted"
        }

        async fn dispatch(&self, request: &ExecutionRequest) -> Result<ExecutionResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(request.clone());
            tokio::task::yield_now().await;
            (self.respond)(request)
        }

        fn retry_policy(&self) -> crate::config::RetryPolicy {
            crate::config::RetryPolicy {
                max_attempts: 2,
                initial_backoff_ms: 1,
                max_backoff_ms: 1,
            }
        }

        fn capabilities(&self) -> ExecutorCapabilities {
            ExecutorCapabilities {
                backend: "scripted".to_string(),
                network_isolated: true,
                read_only_data: true,
                read_only_root: true,
                max_memory_mb: 0,
                max_cpus: 0.0,
                security_level: 0,
            }
        }
    }

    fn count_rows(request: &ExecutionRequest) -> Result<ExecutionResult> {
        let n = if request.query.text().contains("priority") { 7 } else { 42 };
        Ok(ExecutionResult::success(
            vec!["ticket_count".to_string()],
            vec![vec![json!(n)]],
            5,
        ))
    }

    fn support() -> Dataset {
        Dataset::new(
            "support",
            vec![TableSchema::new(
                "tickets.csv",
                vec![
                    ColumnSchema::new("id", ColumnType::Integer),
                    ColumnSchema::new("priority", ColumnType::String),
                ],
            )],
        )
    }

    fn sandbox(executor: Arc<ScriptedExecutor>) -> QuerySandbox {
        QuerySandbox::new(
            &SandboxConfig::default(),
            executor,
            Arc::new(MemoryCapsuleStore::new()),
        )
        .unwrap()
    }

    fn count_plan() -> QueryPlan {
        QueryPlan::new("tickets").aggregate(AggregateFunc::Count, None, "ticket_count")
    }

    #[tokio::test]
    async fn test_plan_submission_succeeds() {
        let executor = ScriptedExecutor::new(count_rows);
        let sandbox = sandbox(executor.clone());

        let capsule = sandbox
            .submit(Submission::plan(support(), count_plan()))
            .await
            .unwrap();

        assert_eq!(capsule.final_status, CapsuleStatus::Succeeded);
        assert_eq!(capsule.backend, "scripted");
        let result = capsule.result.as_ref().unwrap();
        assert_eq!(result.rows, vec![vec![json!(42)]]);
        assert!(capsule.request.plan.is_some());
        assert!(capsule.request.compiled.starts_with("SELECT COUNT(*)"));

        let seen = executor.seen.lock().unwrap();
        assert_eq!(seen[0].files[0].path, "/data/support/tickets.csv");
        assert_eq!(seen[0].files[0].name, "tickets.csv");

        assert_eq!(sandbox.get(&capsule.run_id).unwrap(), Some(capsule.clone()));
        assert_eq!(sandbox.get(&capsule.run_id).unwrap(), Some(capsule));
        assert_eq!(sandbox.get(&uuid::Uuid::new_v4().to_string()).unwrap(), None);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pre_dispatch_failures_never_reach_the_executor() {
        let executor = ScriptedExecutor::new(count_rows);
        let sandbox = sandbox(executor.clone());

        let bad_plan = QueryPlan::new("tickets").column("nope");
        let cases = vec![
            Submission::plan(support(), bad_plan),
            Submission::raw(support(), RawQuery::sql("DELETE FROM tickets")),
            Submission::raw(support(), RawQuery::sql("SELECT 1; DROP TABLE tickets")),
            Submission::raw(support(), RawQuery::script("result = 1")),
            Submission {
                dataset: support(),
                plan: Some(count_plan()),
                raw: Some(RawQuery::sql("SELECT 1")),
                budget: ExecutionBudget::default(),
            },
            Submission {
                dataset: support(),
                plan: None,
                raw: None,
                budget: ExecutionBudget::default(),
            },
            Submission::plan(
                Dataset::new(
                    "support",
                    vec![TableSchema::new("../../etc/passwd", vec![])],
                ),
                QueryPlan::new("passwd").aggregate(AggregateFunc::Count, None, "n"),
            ),
            Submission::plan(Dataset::new("../etc", support().tables), count_plan()),
        ];

        for submission in cases {
            let err = sandbox.submit(submission).await.unwrap_err();
            assert!(err.is_pre_dispatch(), "unexpected error kind: {err}");
        }
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_plan_and_raw_together_conflict() {
        let sandbox = sandbox(ScriptedExecutor::new(count_rows));
        let submission = Submission {
            dataset: support(),
            plan: Some(count_plan()),
            raw: Some(RawQuery::sql("SELECT COUNT(*) FROM tickets")),
            budget: ExecutionBudget::default(),
        };
        assert!(matches!(
            sandbox.submit(submission).await,
            Err(SandboxError::Conflict)
        ));
    }

    #[tokio::test]
    async fn test_table_name_collision_is_rejected() {
        let sandbox = sandbox(ScriptedExecutor::new(count_rows));
        let dataset = Dataset::new(
            "support",
            vec![
                TableSchema::new("Tickets.csv", vec![]),
                TableSchema::new("tickets.CSV", vec![]),
            ],
        );
        let result = sandbox
            .submit(Submission::raw(dataset, RawQuery::sql("SELECT 1")))
            .await;
        assert!(matches!(result, Err(SandboxError::Validation { .. })));
    }

    #[tokio::test]
    async fn test_budget_is_clamped_into_the_request() {
        let executor = ScriptedExecutor::new(count_rows);
        let sandbox = sandbox(executor.clone());
        let budget = ExecutionBudget {
            timeout_seconds: 10_000,
            max_rows: 5,
            max_output_bytes: 100,
        };
        let capsule = sandbox
            .submit(Submission::plan(support(), count_plan()).with_budget(budget))
            .await
            .unwrap();
        assert_eq!(capsule.request.budget.timeout_seconds, 120);
        let seen = executor.seen.lock().unwrap();
        assert_eq!(seen[0].timeout_seconds, 120);
        assert_eq!(seen[0].max_rows, 5);
    }

    #[tokio::test]
    async fn test_timeout_yields_timed_out_capsule_without_rows() {
        let sandbox = sandbox(ScriptedExecutor::new(|_| Err(SandboxError::RunTimeout(30))));
        let capsule = sandbox
            .submit(Submission::plan(support(), count_plan()))
            .await
            .unwrap();
        assert_eq!(capsule.final_status, CapsuleStatus::TimedOut);
        let result = capsule.result.unwrap();
        assert_eq!(result.status, RunStatus::Timeout);
        assert!(result.rows.is_empty());
    }

    #[tokio::test]
    async fn test_post_dispatch_failures_finalize_the_capsule() {
        type Respond = fn(&ExecutionRequest) -> Result<ExecutionResult>;
        let cases: [(Respond, CapsuleStatus); 5] = [
            (
                |_| Err(SandboxError::ExecutorDispatch("no daemon".into())),
                CapsuleStatus::Failed,
            ),
            (
                |_| Err(SandboxError::RunnerProtocol("garbage".into())),
                CapsuleStatus::Failed,
            ),
            (
                |_| Err(SandboxError::ResourceLimitExceeded("oom".into())),
                CapsuleStatus::Failed,
            ),
            (
                |_| Ok(ExecutionResult::error("no such column: nope", 3)),
                CapsuleStatus::Failed,
            ),
            (
                |_| Ok(ExecutionResult::timeout("inner deadline", 3)),
                CapsuleStatus::TimedOut,
            ),
        ];
        for (respond, expected) in cases {
            let sandbox = sandbox(ScriptedExecutor::new(respond));
            let capsule = sandbox
                .submit(Submission::plan(support(), count_plan()))
                .await
                .unwrap();
            assert_eq!(capsule.final_status, expected);
            assert!(capsule.error.is_some());
            assert!(capsule.finished_at.is_some());
        }
    }

    #[tokio::test]
    async fn test_concurrent_runs_get_independent_capsules() {
        let executor = ScriptedExecutor::new(count_rows);
        let sandbox = Arc::new(sandbox(executor.clone()));

        let by_priority = QueryPlan::new("tickets")
            .column("priority")
            .aggregate(AggregateFunc::Count, None, "ticket_count")
            .group_by("priority");

        let a = {
            let sandbox = sandbox.clone();
            tokio::spawn(async move { sandbox.submit(Submission::plan(support(), count_plan())).await })
        };
        let b = {
            let sandbox = sandbox.clone();
            tokio::spawn(async move { sandbox.submit(Submission::plan(support(), by_priority)).await })
        };
        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();

        assert_ne!(a.run_id, b.run_id);
        assert_eq!(a.result.unwrap().rows, vec![vec![json!(42)]]);
        assert_eq!(b.result.unwrap().rows, vec![vec![json!(7)]]);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
    }

    /// Memory store whose first `failures` finalize calls hit an I/O error
    struct FailingFinalizeStore {
        inner: MemoryCapsuleStore,
        failures: AtomicUsize,
    }

    impl CapsuleStore for FailingFinalizeStore {
        fn create(&self, capsule: RunCapsule) -> Result<RunCapsule> {
            self.inner.create(capsule)
        }

        fn finalize(&self, run_id: &str, outcome: CapsuleOutcome) -> Result<RunCapsule> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(SandboxError::IoError(std::io::Error::other("disk full")));
            }
            self.inner.finalize(run_id, outcome)
        }

        fn get(&self, run_id: &str) -> Result<RunCapsule> {
            self.inner.get(run_id)
        }
    }

    fn sandbox_with_store(store: Arc<FailingFinalizeStore>) -> QuerySandbox {
        QuerySandbox::new(
            &SandboxConfig::default(),
            ScriptedExecutor::new(count_rows),
            store,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_finalize_is_retried_once() {
        let store = Arc::new(FailingFinalizeStore {
            inner: MemoryCapsuleStore::new(),
            failures: AtomicUsize::new(1),
        });
        let sandbox = sandbox_with_store(store.clone());

        let capsule = sandbox
            .submit(Submission::plan(support(), count_plan()))
            .await
            .unwrap();
        assert_eq!(capsule.final_status, CapsuleStatus::Succeeded);
        assert_eq!(sandbox.get(&capsule.run_id).unwrap(), Some(capsule));
    }

    #[tokio::test]
    async fn test_persistent_finalize_failure_is_reported() {
        let store = Arc::new(FailingFinalizeStore {
            inner: MemoryCapsuleStore::new(),
            failures: AtomicUsize::new(2),
        });
        let sandbox = sandbox_with_store(store.clone());

        let err = sandbox
            .submit(Submission::plan(support(), count_plan()))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::IoError(_)));
        assert_eq!(store.failures.load(Ordering::SeqCst), 0);
    }
}
