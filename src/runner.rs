//! The in-sandbox half of the contract: one request in, one result out.
//!
//! SQL runs on an embedded polars context with every dataset file registered
//! as a table. Scripts are handed to [`ScriptRunner`]. Whatever happens, the
//! runner produces an [`ExecutionResult`]; it never surfaces an error.

use crate::{
    analyzer::SqlPolicy,
    config::RunnerConfig,
    errors::{Result, SandboxError},
    paths::{derive_table_names, resolve_under_root, validate_dataset_id},
    protocol::{ExecutionRequest, ExecutionResult, QueryBody},
    script::{ScriptBudget, ScriptRunner},
};
use polars::prelude::*;
use polars::sql::SQLContext;
use serde_json::{Number, Value};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How much earlier than the executor's deadline the runner gives up
pub const RUNNER_MARGIN: Duration = Duration::from_millis(500);
/// Floor for the runner's own deadline on very short budgets
pub const MIN_RUNNER_DEADLINE: Duration = Duration::from_millis(250);

/// The runner's deadline, strictly inside the executor's.
pub fn inner_deadline(timeout_seconds: u64) -> Duration {
    Duration::from_secs(timeout_seconds)
        .saturating_sub(RUNNER_MARGIN)
        .max(MIN_RUNNER_DEADLINE)
}

pub struct Runner {
    config: RunnerConfig,
    sql_policy: SqlPolicy,
}

impl Runner {
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            config,
            sql_policy: SqlPolicy::default(),
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub async fn run(&self, request: &ExecutionRequest) -> ExecutionResult {
        let started = Instant::now();
        let deadline = inner_deadline(request.timeout_seconds);
        info!(
            "[RUNNER] {:?} run on dataset {} ({} files, deadline {:?})",
            request.query.query_type(),
            request.dataset_id,
            request.files.len(),
            deadline
        );

        let tables = match self.resolve_tables(request) {
            Ok(tables) => tables,
            Err(e) => {
                warn!("[RUNNER] Rejected dataset files: {}", e);
                return ExecutionResult::error(e.to_string(), elapsed_ms(started));
            }
        };

        let result = match &request.query {
            QueryBody::Sql { statement } => {
                self.run_sql(tables, statement, request.max_rows, deadline, started)
                    .await
            }
            QueryBody::Script { code } => {
                if !self.config.script_enabled {
                    return ExecutionResult::error(
                        "script execution is disabled in this runner",
                        elapsed_ms(started),
                    );
                }
                match ScriptRunner::from_config(&self.config) {
                    Ok(script) => {
                        let budget = ScriptBudget {
                            deadline,
                            max_rows: request.max_rows,
                            max_output_bytes: request.max_output_bytes,
                        };
                        script.run(&tables, code, budget).await
                    }
                    Err(e) => ExecutionResult::error(e.to_string(), elapsed_ms(started)),
                }
            }
        };

        debug!(
            "[RUNNER] Finished with {:?} in {}ms",
            result.status,
            elapsed_ms(started)
        );
        result
    }

    /// Confine every file to the dataset directory and name its table
    fn resolve_tables(&self, request: &ExecutionRequest) -> Result<Vec<(String, PathBuf)>> {
        validate_dataset_id(&request.dataset_id)?;
        let dataset_root = self.config.data_root.join(&request.dataset_id);
        let names = derive_table_names(request.files.iter().map(|f| f.name.as_str()))?;

        request
            .files
            .iter()
            .zip(names)
            .map(|(file, name)| Ok((name, resolve_under_root(&dataset_root, &file.path)?)))
            .collect()
    }

    async fn run_sql(
        &self,
        tables: Vec<(String, PathBuf)>,
        statement: &str,
        max_rows: u64,
        deadline: Duration,
        started: Instant,
    ) -> ExecutionResult {
        if let Err(e) = self.sql_policy.check(statement) {
            return ExecutionResult::error(e.to_string(), elapsed_ms(started));
        }

        let sql = statement.to_string();
        let task = tokio::task::spawn_blocking(move || execute_sql(&tables, &sql, max_rows));

        match tokio::time::timeout(deadline, task).await {
            Ok(Ok(Ok((columns, rows)))) => {
                ExecutionResult::success(columns, rows, elapsed_ms(started)).limit_rows(max_rows)
            }
            Ok(Ok(Err(e))) => ExecutionResult::error(e.to_string(), elapsed_ms(started)),
            Ok(Err(e)) => ExecutionResult::error(
                format!("query task aborted: {}", e),
                elapsed_ms(started),
            ),
            Err(_) => {
                warn!("[RUNNER] Query exceeded {:?}", deadline);
                ExecutionResult::timeout(
                    format!("query exceeded {}ms", deadline.as_millis()),
                    elapsed_ms(started),
                )
            }
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn engine_error(e: PolarsError) -> SandboxError {
    SandboxError::Execution(e.to_string())
}

/// Run one statement, fetching at most `max_rows + 1` rows so truncation shows.
fn execute_sql(
    tables: &[(String, PathBuf)],
    statement: &str,
    max_rows: u64,
) -> Result<(Vec<String>, Vec<Vec<Value>>)> {
    let mut ctx = SQLContext::new();
    for (name, path) in tables {
        let frame = LazyCsvReader::new(path)
            .with_has_header(true)
            .with_infer_schema_length(Some(1000))
            .finish()
            .map_err(engine_error)?;
        ctx.register(name, frame);
    }

    let fetch = max_rows.saturating_add(1).min(IdxSize::MAX as u64) as IdxSize;
    let df = ctx
        .execute(statement)
        .map_err(engine_error)?
        .limit(fetch)
        .collect()
        .map_err(engine_error)?;

    let columns: Vec<String> = df.get_column_names().iter().map(|s| s.to_string()).collect();
    let series = df.get_columns();
    let mut rows = Vec::with_capacity(df.height());
    for idx in 0..df.height() {
        let row = series
            .iter()
            .map(|s| s.get(idx).map(cell_to_json).map_err(engine_error))
            .collect::<Result<Vec<Value>>>()?;
        rows.push(row);
    }
    Ok((columns, rows))
}

fn float(f: f64) -> Value {
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

fn cell_to_json(value: AnyValue) -> Value {
    match value {
        AnyValue::Null => Value::Null,
        AnyValue::Boolean(b) => Value::Bool(b),
        AnyValue::String(s) => Value::String(s.to_string()),
        AnyValue::Int8(i) => Value::Number(i.into()),
        AnyValue::Int16(i) => Value::Number(i.into()),
        AnyValue::Int32(i) => Value::Number(i.into()),
        AnyValue::Int64(i) => Value::Number(i.into()),
        AnyValue::UInt8(u) => Value::Number(u.into()),
        AnyValue::UInt16(u) => Value::Number(u.into()),
        AnyValue::UInt32(u) => Value::Number(u.into()),
        AnyValue::UInt64(u) => Value::Number(u.into()),
        AnyValue::Float32(f) => float(f as f64),
        AnyValue::Float64(f) => float(f),
        other => Value::String(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FileRef, RunStatus};
    use serde_json::json;

    struct Fixture {
        _dir: tempfile::TempDir,
        runner: Runner,
        root: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("data");
        let dataset = root.join("support");
        std::fs::create_dir_all(&dataset).unwrap();

        let mut csv = String::from("id,priority,hours\n");
        for i in 1..=42 {
            let priority = if i % 3 == 0 { "high" } else { "low" };
            csv.push_str(&format!("{},{},{}.5\n", i, priority, i));
        }
        std::fs::write(dataset.join("tickets.csv"), csv).unwrap();

        let runner = Runner::new(RunnerConfig {
            data_root: root.clone(),
            ..Default::default()
        });
        Fixture {
            _dir: dir,
            runner,
            root,
        }
    }

    fn sql_request(fx: &Fixture, statement: &str, max_rows: u64) -> ExecutionRequest {
        ExecutionRequest {
            dataset_id: "support".to_string(),
            files: vec![FileRef {
                name: "tickets.csv".to_string(),
                path: fx.root.join("support/tickets.csv").display().to_string(),
            }],
            query: QueryBody::Sql {
                statement: statement.to_string(),
            },
            timeout_seconds: 30,
            max_rows,
            max_output_bytes: 4096,
        }
    }

    #[test]
    fn test_inner_deadline_is_inside_outer() {
        assert_eq!(inner_deadline(30), Duration::from_millis(29_500));
        assert_eq!(inner_deadline(1), Duration::from_millis(500));
        assert_eq!(inner_deadline(0), MIN_RUNNER_DEADLINE);
        for secs in 1..=120 {
            assert!(inner_deadline(secs) < Duration::from_secs(secs));
        }
    }

    #[tokio::test]
    async fn test_blocked_query_times_out_without_rows() {
        let fx = fixture();
        let path = fx.root.join("support/events.csv");
        let mut csv = String::from("id,kind\n");
        for i in 0..3000 {
            csv.push_str(&format!("{},k{}\n", i, i % 7));
        }
        std::fs::write(&path, csv).unwrap();

        let result = fx
            .runner
            .run_sql(
                vec![("events".to_string(), path)],
                "SELECT COUNT(*) AS n FROM events a CROSS JOIN events b",
                10,
                Duration::from_millis(1),
                Instant::now(),
            )
            .await;

        assert_eq!(result.status, RunStatus::Timeout, "{:?}", result.error);
        assert!(result.rows.is_empty());
        assert_eq!(result.row_count, 0);
        assert!(result.error.unwrap().contains("exceeded"));
    }

    #[tokio::test]
    async fn test_count_tickets() {
        let fx = fixture();
        let request = sql_request(&fx, "SELECT COUNT(*) AS ticket_count FROM tickets", 200);
        let result = fx.runner.run(&request).await;

        assert_eq!(result.status, RunStatus::Success, "{:?}", result.error);
        assert_eq!(result.columns, vec!["ticket_count"]);
        assert_eq!(result.rows, vec![vec![json!(42)]]);
        assert_eq!(result.row_count, 1);
        assert!(!result.truncated);
    }

    #[tokio::test]
    async fn test_grouped_query_types() {
        let fx = fixture();
        let request = sql_request(
            &fx,
            "SELECT priority, SUM(hours) AS total FROM tickets WHERE id <= 6 GROUP BY priority ORDER BY priority",
            200,
        );
        let result = fx.runner.run(&request).await;
        assert_eq!(result.status, RunStatus::Success, "{:?}", result.error);
        assert_eq!(
            result.rows,
            vec![
                vec![json!("high"), json!(10.0)],
                vec![json!("low"), json!(14.0)],
            ]
        );
    }

    #[tokio::test]
    async fn test_rows_are_capped_at_max_rows() {
        let fx = fixture();
        let result = fx.runner.run(&sql_request(&fx, "SELECT id FROM tickets", 5)).await;
        assert_eq!(result.status, RunStatus::Success);
        assert_eq!(result.row_count, 5);
        assert_eq!(result.rows.len(), 5);
        assert!(result.truncated);
    }

    #[tokio::test]
    async fn test_statement_policy_is_rechecked() {
        let fx = fixture();
        for statement in ["DROP TABLE tickets", "SELECT 1; SELECT 2", "SELECT * FROM read_csv('/etc/passwd')"] {
            let result = fx.runner.run(&sql_request(&fx, statement, 5)).await;
            assert_eq!(result.status, RunStatus::Error, "{statement}");
            assert!(result.rows.is_empty());
        }
    }

    #[tokio::test]
    async fn test_paths_outside_the_dataset_are_rejected() {
        let fx = fixture();
        std::fs::write(fx.root.join("other.csv"), "a\n1\n").unwrap();
        for path in [
            "/etc/passwd".to_string(),
            fx.root.join("support/../other.csv").display().to_string(),
            fx.root.join("other.csv").display().to_string(),
            fx.root.join("support/missing.csv").display().to_string(),
        ] {
            let mut request = sql_request(&fx, "SELECT COUNT(*) FROM tickets", 5);
            request.files[0].path = path.clone();
            let result = fx.runner.run(&request).await;
            assert_eq!(result.status, RunStatus::Error, "{path}");
        }
    }

    #[tokio::test]
    async fn test_table_name_collision_is_an_error() {
        let fx = fixture();
        let mut request = sql_request(&fx, "SELECT COUNT(*) FROM tickets", 5);
        request.files.push(FileRef {
            name: "Tickets.CSV".to_string(),
            path: request.files[0].path.clone(),
        });
        let result = fx.runner.run(&request).await;
        assert_eq!(result.status, RunStatus::Error);
        assert!(result.error.unwrap().contains("tickets"));
    }

    #[tokio::test]
    async fn test_engine_errors_become_error_results() {
        let fx = fixture();
        let result = fx
            .runner
            .run(&sql_request(&fx, "SELECT no_such_column FROM tickets", 5))
            .await;
        assert_eq!(result.status, RunStatus::Error);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn test_scripts_need_an_enabled_runner() {
        let fx = fixture();
        let mut request = sql_request(&fx, "", 5);
        request.query = QueryBody::Script {
            code: "result = tickets.shape[0]".to_string(),
        };
        let result = fx.runner.run(&request).await;
        assert_eq!(result.status, RunStatus::Error);
        assert!(result.error.unwrap().contains("disabled"));
    }
}
