use std::path::{Path, PathBuf};

/// Write an executable `/bin/sh` script standing in for a CLI.
#[cfg(unix)]
pub(crate) fn fake_cli(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

pub(crate) fn success_json(columns: &[&str], rows: serde_json::Value) -> String {
    let row_count = rows.as_array().map(|r| r.len()).unwrap_or(0);
    serde_json::json!({
        "status": "success",
        "columns": columns,
        "rows": rows,
        "row_count": row_count,
        "exec_time_ms": 3,
        "stdout_trunc": "",
        "stderr_trunc": "",
        "error": null
    })
    .to_string()
}
