//! Execution budgets and the ceilings that bound them.
//!
//! Callers ask for a budget per submission; the operator configures a
//! [`BudgetPolicy`] once. The effective budget is the caller's request with
//! every dimension clamped to the policy ceiling, the same way an org-wide
//! policy overrides a user's template.

use crate::errors::{Result, SandboxError};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Per-submission execution budget
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutionBudget {
    /// Wall-clock timeout, enforced by the executor and (shorter) by the runner
    pub timeout_seconds: u64,
    /// Maximum rows returned
    pub max_rows: u64,
    /// Maximum bytes of captured stdout/stderr each
    pub max_output_bytes: u64,
}

impl Default for ExecutionBudget {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            max_rows: 1_000,
            max_output_bytes: 64 * 1024,
        }
    }
}

/// Operator-configured ceilings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BudgetPolicy {
    pub max_timeout_seconds: u64,
    pub max_rows: u64,
    pub max_output_bytes: u64,
}

impl Default for BudgetPolicy {
    fn default() -> Self {
        Self {
            max_timeout_seconds: 120,
            max_rows: 10_000,
            max_output_bytes: 1024 * 1024,
        }
    }
}

impl BudgetPolicy {
    /// Reject non-positive budgets, clamp the rest to the ceilings.
    pub fn apply(&self, requested: ExecutionBudget) -> Result<ExecutionBudget> {
        for (field, value) in [
            ("budget.timeout_seconds", requested.timeout_seconds),
            ("budget.max_rows", requested.max_rows),
            ("budget.max_output_bytes", requested.max_output_bytes),
        ] {
            if value == 0 {
                return Err(SandboxError::validation(field, "must be positive"));
            }
        }

        let effective = ExecutionBudget {
            timeout_seconds: requested.timeout_seconds.min(self.max_timeout_seconds),
            max_rows: requested.max_rows.min(self.max_rows),
            max_output_bytes: requested.max_output_bytes.min(self.max_output_bytes),
        };
        if effective != requested {
            info!(
                "[POLICY] Budget clamped: requested {:?}, effective {:?}",
                requested, effective
            );
        }
        Ok(effective)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_within_ceilings_is_unchanged() {
        let budget = ExecutionBudget {
            timeout_seconds: 10,
            max_rows: 200,
            max_output_bytes: 4096,
        };
        assert_eq!(BudgetPolicy::default().apply(budget).unwrap(), budget);
    }

    #[test]
    fn test_budget_is_clamped() {
        let policy = BudgetPolicy {
            max_timeout_seconds: 15,
            max_rows: 100,
            max_output_bytes: 1024,
        };
        let effective = policy
            .apply(ExecutionBudget {
                timeout_seconds: 600,
                max_rows: 1_000_000,
                max_output_bytes: 10,
            })
            .unwrap();
        assert_eq!(effective.timeout_seconds, 15);
        assert_eq!(effective.max_rows, 100);
        assert_eq!(effective.max_output_bytes, 10);
    }

    #[test]
    fn test_zero_budget_is_rejected() {
        let result = BudgetPolicy::default().apply(ExecutionBudget {
            max_rows: 0,
            ..Default::default()
        });
        assert!(matches!(
            result,
            Err(SandboxError::Validation { ref field, .. }) if field == "budget.max_rows"
        ));
    }
}
