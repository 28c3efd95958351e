use thiserror::Error;

pub type Result<T> = std::result::Result<T, SandboxError>;

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Invalid query plan at {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Cannot compile query plan: {0}")]
    Compile(String),

    #[error("Statement rejected by policy: {0}")]
    SqlPolicyViolation(String),

    #[error("Syntax error in script: {0}")]
    SyntaxError(String),

    #[error("Path rejected: {path}: {reason}")]
    PathValidation { path: String, reason: String },

    #[error("Submission must carry exactly one of a query plan or a raw statement")]
    Conflict,

    #[error("Executor dispatch failed: {0}")]
    ExecutorDispatch(String),

    #[error("Run exceeded its {0}s timeout")]
    RunTimeout(u64),

    #[error("Runner output could not be normalized: {0}")]
    RunnerProtocol(String),

    #[error("Sandbox killed by resource ceiling: {0}")]
    ResourceLimitExceeded(String),

    #[error("Query execution failed: {0}")]
    Execution(String),

    #[error("Python not installed or not found in PATH")]
    PythonNotFound,

    #[error("Capsule {0} already holds a terminal result")]
    CapsuleAlreadyFinalized(String),

    #[error("Capsule {0} not found")]
    CapsuleNotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl SandboxError {
    pub(crate) fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        SandboxError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub(crate) fn path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        SandboxError::PathValidation {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Errors raised before any executor is invoked.
    pub fn is_pre_dispatch(&self) -> bool {
        matches!(
            self,
            SandboxError::Validation { .. }
                | SandboxError::Compile(_)
                | SandboxError::SqlPolicyViolation(_)
                | SandboxError::SyntaxError(_)
                | SandboxError::PathValidation { .. }
                | SandboxError::Conflict
        )
    }

    /// Only infrastructure failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SandboxError::ExecutorDispatch(_))
    }
}
