//! Path confinement and table-name derivation for dataset files.
//!
//! The core checks paths lexically before dispatch; the runner repeats the
//! lexical check and then canonicalizes, so symlinks inside the data root cannot
//! point outside it.

use crate::errors::{Result, SandboxError};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

/// Lexical check: absolute, no `..`, and rooted under `root`.
pub fn validate_sandbox_path(root: &Path, path: &str) -> Result<PathBuf> {
    if path.is_empty() {
        return Err(SandboxError::path(path, "empty path"));
    }
    if path.contains('\0') {
        return Err(SandboxError::path(path, "embedded NUL byte"));
    }
    let candidate = Path::new(path);
    if !candidate.is_absolute() {
        return Err(SandboxError::path(path, "path must be absolute"));
    }
    if candidate
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(SandboxError::path(path, "parent-directory traversal"));
    }
    if !candidate.starts_with(root) || candidate == root {
        return Err(SandboxError::path(
            path,
            format!("not under data root {}", root.display()),
        ));
    }
    Ok(candidate.to_path_buf())
}

/// Dataset ids become directory names and mount labels, so they must be a
/// single plain segment.
pub fn validate_dataset_id(id: &str) -> Result<()> {
    let ok = !id.is_empty()
        && id.len() <= 63
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        && !id.starts_with('-');
    if ok {
        Ok(())
    } else {
        Err(SandboxError::validation(
            "dataset.id",
            format!("'{}' is not a plain identifier", id),
        ))
    }
}

/// Lexical check followed by canonicalization against the canonical root.
pub fn resolve_under_root(root: &Path, path: &str) -> Result<PathBuf> {
    let candidate = validate_sandbox_path(root, path)?;
    let canonical_root = root
        .canonicalize()
        .map_err(|e| SandboxError::path(root.display().to_string(), e.to_string()))?;
    let canonical = candidate
        .canonicalize()
        .map_err(|e| SandboxError::path(path, e.to_string()))?;
    if !canonical.starts_with(&canonical_root) {
        return Err(SandboxError::path(path, "resolves outside the data root"));
    }
    if !canonical.is_file() {
        return Err(SandboxError::path(path, "not a regular file"));
    }
    Ok(canonical)
}

/// Derive the SQL identifier a file is registered under.
///
/// Takes the final path segment, drops the extension, lowercases, and maps
/// every run of non-alphanumeric characters to a single `_`. A leading digit
/// gets a `t_` prefix; an empty result becomes `t`.
pub fn sanitize_identifier(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let stem = match base.rfind('.') {
        Some(idx) if idx > 0 => &base[..idx],
        _ => base,
    };

    let mut out = String::with_capacity(stem.len());
    let mut last_underscore = false;
    for c in stem.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_underscore = false;
        } else if !last_underscore {
            out.push('_');
            last_underscore = true;
        }
    }
    let trimmed = out.trim_matches('_').to_string();

    match trimmed.chars().next() {
        None => "t".to_string(),
        Some(c) if c.is_ascii_digit() => format!("t_{}", trimmed),
        Some(_) => trimmed,
    }
}

/// Sanitize every declared name, failing if two collapse to the same identifier.
pub fn derive_table_names<'a, I>(names: I) -> Result<Vec<String>>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut seen: HashMap<String, &'a str> = HashMap::new();
    let mut derived = Vec::new();
    for name in names {
        let ident = sanitize_identifier(name);
        if let Some(previous) = seen.insert(ident.clone(), name) {
            return Err(SandboxError::validation(
                "files",
                format!(
                    "'{}' and '{}' both map to table '{}'",
                    previous, name, ident
                ),
            ));
        }
        derived.push(ident);
    }
    Ok(derived)
}
