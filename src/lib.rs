//! Sandboxed execution of untrusted analytical queries over CSV datasets.
//!
//! A caller submits either a structured [`QueryPlan`] or raw SQL (or, when
//! enabled, a Python script) together with an [`ExecutionBudget`]. The
//! [`QuerySandbox`] validates and compiles it, dispatches it through an
//! [`Executor`] backend to an isolated runner, and records the outcome in an
//! immutable [`RunCapsule`].
//!
//! ```rust,ignore
//! use sqlsandbox::{create_default_sandbox, AggregateFunc, Dataset, QueryPlan, Submission};
//!
//! let sandbox = create_default_sandbox()?;
//! let plan = QueryPlan::new("tickets").aggregate(AggregateFunc::Count, None, "ticket_count");
//! let capsule = sandbox.submit(Submission::plan(dataset, plan)).await?;
//! println!("{:?}: {:?}", capsule.final_status, capsule.result);
//! ```

pub mod analyzer;
pub mod capsule;
pub mod cluster;
pub mod compiler;
pub mod config;
pub mod container;
pub mod engine;
pub mod errors;
pub mod paths;
pub mod plan;
pub mod policy;
pub mod protocol;
pub mod runner;
pub mod sandbox;
pub mod sandbox_builder;
pub mod script;

#[cfg(test)]
mod test_support;

pub use analyzer::{ScriptPolicy, SqlPolicy};
pub use capsule::{
    CapsuleOutcome, CapsuleStatus, CapsuleStore, FileCapsuleStore, MemoryCapsuleStore,
    RequestRecord, RunCapsule,
};
pub use cluster::ClusterJobExecutor;
pub use compiler::{compile, CompiledQuery};
pub use config::{
    ClusterConfig, ContainerConfig, ExecutionMode, ImportPolicy, ResourceLimits, RetryPolicy,
    RunnerConfig, SandboxConfig,
};
pub use container::ContainerExecutor;
pub use engine::{Executor, ExecutorCapabilities};
pub use errors::{Result, SandboxError};
pub use plan::{
    validate_plan, AggregateFunc, ColumnSchema, ColumnType, CompareOp, Dataset, Literal,
    OrderBy, Predicate, QueryPlan, SelectItem, TableSchema,
};
pub use policy::{BudgetPolicy, ExecutionBudget};
pub use protocol::{
    normalize_output, ExecutionRequest, ExecutionResult, FileRef, QueryBody, QueryType,
    RunStatus,
};
pub use runner::Runner;
pub use sandbox::{QuerySandbox, RawQuery, Submission};
pub use sandbox_builder::{
    create_capsule_store, create_default_sandbox, create_executor, create_sandbox_with_options,
    CapsuleBackend, SandboxOptions,
};
