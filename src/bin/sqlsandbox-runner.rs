use anyhow::Context;
use sqlsandbox::{ExecutionRequest, ExecutionResult, Runner, RunnerConfig};
use std::path::PathBuf;
use tokio::io::{self, AsyncReadExt, AsyncWriteExt};

#[derive(Debug, Clone, Default)]
struct RunnerArgs {
    /// Read the request from this environment variable instead of stdin
    request_env: Option<String>,
    data_root: Option<PathBuf>,
    python_path: Option<PathBuf>,
}

impl RunnerArgs {
    fn from_args() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let mut parsed = Self::default();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--request-env" => {
                    parsed.request_env = args.get(i + 1).cloned();
                    i += 2;
                }
                "--data-root" => {
                    parsed.data_root = args.get(i + 1).map(PathBuf::from);
                    i += 2;
                }
                "--python-path" => {
                    parsed.python_path = args.get(i + 1).map(PathBuf::from);
                    i += 2;
                }
                other => {
                    tracing::warn!("ignoring unknown argument {}", other);
                    i += 1;
                }
            }
        }
        parsed
    }
}

async fn load(args: &RunnerArgs) -> anyhow::Result<(RunnerConfig, ExecutionRequest)> {
    let mut config = RunnerConfig::from_env()?;
    if let Some(root) = &args.data_root {
        config.data_root = root.clone();
    }
    if let Some(python) = &args.python_path {
        config.python_path = Some(python.clone());
    }

    let raw = match &args.request_env {
        Some(var) => std::env::var(var).with_context(|| format!("{} is not set", var))?,
        None => {
            let mut buf = String::new();
            io::stdin()
                .read_to_string(&mut buf)
                .await
                .context("reading request from stdin")?;
            buf
        }
    };
    let request: ExecutionRequest =
        serde_json::from_str(raw.trim()).context("malformed execution request")?;
    Ok((config, request))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries the result document; logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "sqlsandbox_runner=warn,sqlsandbox=warn".to_string()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = RunnerArgs::from_args();
    let result = match load(&args).await {
        Ok((config, request)) => {
            tracing::info!(
                "sqlsandbox-runner starting (data_root={})",
                config.data_root.display()
            );
            Runner::new(config).run(&request).await
        }
        Err(e) => ExecutionResult::error(format!("{:#}", e), 0),
    };

    let mut stdout = io::stdout();
    stdout
        .write_all(serde_json::to_string(&result)?.as_bytes())
        .await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await?;

    // A timed-out query may still hold a blocking thread; do not wait for it.
    std::process::exit(0);
}
