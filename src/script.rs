//! Script runs: user Python code over pandas DataFrames, inside the runner.
//!
//! The interpreter is a child process with rlimits applied before exec and
//! its own process group so a timeout can kill everything it spawned. The
//! wrapper below is constant; user code, table paths and the import policy
//! travel on stdin as JSON.

use crate::{
    config::{ImportPolicy, ResourceLimits, RunnerConfig},
    errors::{Result, SandboxError},
    protocol::{truncate_output, ExecutionResult},
};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

const OUTPUT_START: &str = "OUTPUT_JSON_START";
const OUTPUT_END: &str = "OUTPUT_JSON_END";

const SCRIPT_WRAPPER: &str = r#"
import builtins
import io
import json
import sys

_payload = json.load(sys.stdin)
_real_stdout = sys.stdout

def _emit(doc):
    _real_stdout.write("OUTPUT_JSON_START\n")
    _real_stdout.write(json.dumps(doc, default=str))
    _real_stdout.write("\nOUTPUT_JSON_END\n")
    _real_stdout.flush()

try:
    import pandas as pd
except Exception as e:
    _emit({"columns": [], "rows": [], "error": f"pandas unavailable: {e}", "stdout": "", "stderr": ""})
    sys.exit(0)

_namespace = {"__name__": "__sandbox__", "pd": pd}
for _name, _path in _payload["tables"]:
    _namespace[_name] = pd.read_csv(_path)

_allowed = _payload["allowed"]
_allowed = None if _allowed is None else set(_allowed)
_denied = set(_payload["denied"])
_original_import = builtins.__import__

def _guarded_import(name, globals=None, locals=None, fromlist=(), level=0):
    if globals is not None and globals.get("__name__") == "__sandbox__":
        if level > 0:
            raise ImportError("relative imports are not allowed")
        root = name.split(".")[0]
        if root in _denied or (_allowed is not None and root not in _allowed):
            raise ImportError(f"Module '{root}' is not allowed")
    return _original_import(name, globals, locals, fromlist, level)

builtins.__import__ = _guarded_import

_original_open = builtins.open
def _read_only_open(file, mode="r", *args, **kwargs):
    if any(flag in mode for flag in "wax+"):
        raise PermissionError("Write access is not allowed")
    return _original_open(file, mode, *args, **kwargs)
builtins.open = _read_only_open

def _frame_to_table(df, limit):
    if not isinstance(df.index, pd.RangeIndex):
        df = df.reset_index()
    columns = [str(c) for c in df.columns]
    rows = json.loads(df.head(limit).to_json(orient="values", date_format="iso"))
    return columns, rows

def _to_table(value, limit):
    if value is None:
        return [], []
    if isinstance(value, pd.DataFrame):
        return _frame_to_table(value, limit)
    if isinstance(value, pd.Series):
        return _frame_to_table(value.to_frame(name=value.name or "value"), limit)
    if isinstance(value, dict):
        try:
            return _frame_to_table(pd.DataFrame(value), limit)
        except ValueError:
            return _frame_to_table(pd.DataFrame([value]), limit)
    if isinstance(value, (list, tuple)):
        return _frame_to_table(pd.DataFrame(list(value)), limit)
    return ["result"], [[json.loads(json.dumps(value, default=str))]]

_out, _err = io.StringIO(), io.StringIO()
sys.stdout, sys.stderr = _out, _err
_error = None
_columns, _rows = [], []
try:
    exec(compile(_payload["code"], "<script>", "exec"), _namespace)
    _columns, _rows = _to_table(_namespace.get("result"), _payload["max_rows"] + 1)
except MemoryError:
    _error = "MemoryError: memory limit exceeded"
except BaseException as e:
    import traceback
    traceback.print_exc()
    _error = f"{type(e).__name__}: {e}"
finally:
    sys.stdout, sys.stderr = _real_stdout, sys.__stderr__

_emit({"columns": _columns, "rows": _rows, "error": _error,
       "stdout": _out.getvalue(), "stderr": _err.getvalue()})
"#;

/// What the wrapper reports between the output markers
#[derive(Debug, serde::Deserialize)]
struct ScriptOutput {
    #[serde(default)]
    columns: Vec<String>,
    #[serde(default)]
    rows: Vec<Vec<serde_json::Value>>,
    error: Option<String>,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
}

/// Limits for one script run
#[derive(Debug, Clone, Copy)]
pub struct ScriptBudget {
    pub deadline: Duration,
    pub max_rows: u64,
    pub max_output_bytes: u64,
}

pub struct ScriptRunner {
    python_path: PathBuf,
    limits: ResourceLimits,
    import_policy: ImportPolicy,
}

impl ScriptRunner {
    pub fn new(python_path: PathBuf, limits: ResourceLimits, import_policy: ImportPolicy) -> Self {
        Self {
            python_path,
            limits,
            import_policy,
        }
    }

    /// Use the configured interpreter, or find `python3` on PATH
    pub fn from_config(config: &RunnerConfig) -> Result<Self> {
        let python_path = match &config.python_path {
            Some(path) if path.exists() => path.clone(),
            Some(_) => return Err(SandboxError::PythonNotFound),
            None => which::which("python3")
                .or_else(|_| which::which("python"))
                .map_err(|_| SandboxError::PythonNotFound)?,
        };
        Ok(Self::new(
            python_path,
            config.limits.clone(),
            config.import_policy.clone(),
        ))
    }

    /// Apply resource limits to the command
    #[cfg(unix)]
    fn apply_resource_limits(&self, cmd: &mut Command) {
        let cpu_seconds = self.limits.cpu_seconds;
        #[cfg(not(target_os = "macos"))]
        let memory_bytes = self.limits.memory_mb * 1024 * 1024;
        #[cfg(not(target_os = "macos"))]
        let max_processes = self.limits.max_processes;

        unsafe {
            cmd.pre_exec(move || {
                // Own process group, so the timeout path can kill the whole tree
                libc::setpgid(0, 0);

                #[cfg(not(target_os = "macos"))]
                {
                    let rlimit = libc::rlimit {
                        rlim_cur: memory_bytes as libc::rlim_t,
                        rlim_max: memory_bytes as libc::rlim_t,
                    };
                    if libc::setrlimit(libc::RLIMIT_AS, &rlimit) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }

                let rlimit = libc::rlimit {
                    rlim_cur: cpu_seconds as libc::rlim_t,
                    rlim_max: cpu_seconds as libc::rlim_t,
                };
                if libc::setrlimit(libc::RLIMIT_CPU, &rlimit) != 0 {
                    return Err(std::io::Error::last_os_error());
                }

                #[cfg(not(target_os = "macos"))]
                {
                    let rlimit = libc::rlimit {
                        rlim_cur: max_processes as libc::rlim_t,
                        rlim_max: max_processes as libc::rlim_t,
                    };
                    if libc::setrlimit(libc::RLIMIT_NPROC, &rlimit) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }

                Ok(())
            });
        }
    }

    #[cfg(not(unix))]
    fn apply_resource_limits(&self, _cmd: &mut Command) {}

    #[cfg(unix)]
    fn kill_group(pid: Option<u32>) {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = pid {
            if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                debug!("[RUNNER] killpg({}) failed: {}", pid, e);
            }
        }
    }

    #[cfg(not(unix))]
    fn kill_group(_pid: Option<u32>) {}

    /// Run `code` with each table loaded as a DataFrame under its name.
    ///
    /// Never fails: every outcome, including a missing interpreter, becomes
    /// an [`ExecutionResult`].
    pub async fn run(
        &self,
        tables: &[(String, PathBuf)],
        code: &str,
        budget: ScriptBudget,
    ) -> ExecutionResult {
        let started = Instant::now();
        match self.run_inner(tables, code, budget, started).await {
            Ok(result) => result,
            Err(e) => ExecutionResult::error(e.to_string(), started.elapsed().as_millis() as u64),
        }
    }

    async fn run_inner(
        &self,
        tables: &[(String, PathBuf)],
        code: &str,
        budget: ScriptBudget,
        started: Instant,
    ) -> Result<ExecutionResult> {
        let payload = serde_json::json!({
            "code": code,
            "tables": tables
                .iter()
                .map(|(name, path)| (name.clone(), path.display().to_string()))
                .collect::<Vec<_>>(),
            "max_rows": budget.max_rows,
            "allowed": self.import_policy.allowed_roots(),
            "denied": self.import_policy.denied_roots(),
        });

        let threads = self.limits.max_threads.to_string();
        let mut cmd = Command::new(&self.python_path);
        cmd.arg("-I")
            .arg("-c")
            .arg(SCRIPT_WRAPPER)
            .env_clear()
            .env("PYTHONIOENCODING", "utf-8")
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .env("HOME", "/tmp")
            .env("MPLCONFIGDIR", "/tmp")
            .env("OMP_NUM_THREADS", &threads)
            .env("OPENBLAS_NUM_THREADS", &threads)
            .env("MKL_NUM_THREADS", &threads)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        self.apply_resource_limits(&mut cmd);

        let deadline = tokio::time::Instant::from_std(started + budget.deadline);
        let mut child = cmd.spawn()?;
        let pid = child.id();
        let writer = child.stdin.take().map(|mut stdin| {
            let payload = payload.to_string();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                    debug!("[RUNNER] Could not write script payload: {}", e);
                }
            })
        });

        let waited = tokio::time::timeout_at(deadline, child.wait_with_output()).await;
        if let Some(writer) = writer {
            writer.abort();
        }
        let output = match waited {
            Ok(output) => output?,
            Err(_) => {
                warn!(
                    "[RUNNER] Script exceeded {:?}, killing process group",
                    budget.deadline
                );
                Self::kill_group(pid);
                return Ok(ExecutionResult::timeout(
                    format!("script exceeded {}ms", budget.deadline.as_millis()),
                    started.elapsed().as_millis() as u64,
                ));
            }
        };

        let elapsed = started.elapsed().as_millis() as u64;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        let Some(report) = extract_report(&stdout) else {
            let message = if stderr.contains("MemoryError") {
                "memory limit exceeded".to_string()
            } else if !output.status.success() && output.status.code().is_none() {
                "interpreter killed by signal (CPU or memory limit)".to_string()
            } else {
                let (tail, _) = truncate_output(stderr.trim(), 2048);
                format!("interpreter exited {:?}: {}", output.status.code(), tail)
            };
            return Ok(ExecutionResult::error(message, elapsed).with_output(
                "",
                &stderr,
                budget.max_output_bytes,
            ));
        };

        let result = match report.error {
            Some(error) => ExecutionResult::error(error, elapsed),
            None => {
                let width = report.columns.len();
                if report.rows.iter().any(|r| r.len() != width) {
                    ExecutionResult::error("script result has ragged rows", elapsed)
                } else {
                    ExecutionResult::success(report.columns, report.rows, elapsed)
                        .limit_rows(budget.max_rows)
                }
            }
        };
        Ok(result.with_output(&report.stdout, &report.stderr, budget.max_output_bytes))
    }
}

fn extract_report(stdout: &str) -> Option<ScriptOutput> {
    let start = stdout.rfind(OUTPUT_START)?;
    let end = stdout[start..].find(OUTPUT_END)? + start;
    serde_json::from_str(stdout[start + OUTPUT_START.len()..end].trim()).ok()
}
