//! Static policy checks applied to every statement before it reaches a sandbox.
//!
//! Both checkers follow the same shape: parse, walk, accept or reject. Nothing
//! is ever rewritten; a statement either passes as-is or is refused.

use crate::config::ImportPolicy;
use crate::errors::{Result, SandboxError};
use sqlparser::ast::Statement;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer, Whitespace};
use std::collections::HashSet;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tracing::debug;

const DENIED_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "MERGE", "UPSERT", "DROP", "CREATE", "ALTER", "TRUNCATE",
    "RENAME", "ATTACH", "DETACH", "COPY", "EXPORT", "IMPORT", "LOAD", "INSTALL", "PRAGMA",
    "SET", "RESET", "GRANT", "REVOKE", "CALL", "EXEC", "EXECUTE", "PREPARE", "DEALLOCATE",
    "VACUUM", "BEGIN", "COMMIT", "ROLLBACK", "SAVEPOINT", "LOCK", "UNLOCK", "INTO", "OUTFILE",
];

/// Table functions that would let a statement reach the filesystem directly.
const DENIED_FUNCTIONS: &[&str] = &[
    "read_csv", "read_csv_auto", "read_parquet", "read_json", "read_json_auto",
    "read_ndjson", "read_ipc", "read_text", "read_blob", "scan_csv", "scan_parquet",
    "scan_ndjson", "glob", "system", "shell",
];

const ALLOWED_PUNCTUATION: &str = "_,.()*+-/%<>=!|:";

/// Restrictive grammar for SQL that will run inside the sandbox
#[derive(Debug, Clone)]
pub struct SqlPolicy {
    denied_keywords: HashSet<String>,
    denied_functions: HashSet<String>,
    max_statement_bytes: usize,
}

impl Default for SqlPolicy {
    fn default() -> Self {
        Self {
            denied_keywords: DENIED_KEYWORDS.iter().map(|s| s.to_string()).collect(),
            denied_functions: DENIED_FUNCTIONS.iter().map(|s| s.to_string()).collect(),
            max_statement_bytes: 64 * 1024,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum LexState {
    Code,
    StringLiteral,
    QuotedIdent,
}

impl SqlPolicy {
    /// Accept exactly one read-only `SELECT`, or fail with `SqlPolicyViolation`.
    pub fn check(&self, sql: &str) -> Result<()> {
        if sql.trim().is_empty() {
            return Err(violation("empty statement"));
        }
        if sql.len() > self.max_statement_bytes {
            return Err(violation(format!(
                "statement is {} bytes, limit is {}",
                sql.len(),
                self.max_statement_bytes
            )));
        }

        self.scan(sql)?;
        self.check_tokens(sql)?;

        let statements = Parser::parse_sql(&GenericDialect {}, sql)
            .map_err(|e| violation(format!("unparseable statement: {}", e)))?;
        match statements.as_slice() {
            [Statement::Query(_)] => {
                debug!("[POLICY] Accepted statement ({} bytes)", sql.len());
                Ok(())
            }
            [_] => Err(violation("only SELECT queries are allowed")),
            _ => Err(violation(format!(
                "expected exactly one statement, found {}",
                statements.len()
            ))),
        }
    }

    /// Character-level pass that runs before any parsing.
    fn scan(&self, sql: &str) -> Result<()> {
        let chars: Vec<char> = sql.chars().collect();
        let mut state = LexState::Code;
        let mut word = String::new();
        let mut quoted = String::new();
        let mut i = 0;

        while i < chars.len() {
            let c = chars[i];
            if is_hidden_char(c) {
                return Err(violation(format!(
                    "control or invisible character U+{:04X}",
                    c as u32
                )));
            }
            match state {
                LexState::Code => {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        word.push(c);
                        i += 1;
                        continue;
                    }
                    if c == '\'' && word.eq_ignore_ascii_case("e") {
                        return Err(violation("escape string literals are not allowed"));
                    }
                    self.check_word(&word)?;
                    word.clear();

                    match c {
                        '\'' => state = LexState::StringLiteral,
                        '"' => state = LexState::QuotedIdent,
                        ';' => return Err(violation("statement separator ';' is not allowed")),
                        '-' if chars.get(i + 1) == Some(&'-') => {
                            return Err(violation("comments are not allowed"))
                        }
                        '/' if chars.get(i + 1) == Some(&'*') => {
                            return Err(violation("comments are not allowed"))
                        }
                        c if c.is_ascii_whitespace() || ALLOWED_PUNCTUATION.contains(c) => {}
                        c if !c.is_ascii() => {
                            return Err(violation(format!(
                                "non-ASCII character U+{:04X} outside a literal",
                                c as u32
                            )))
                        }
                        c => return Err(violation(format!("character '{}' is not allowed", c))),
                    }
                }
                LexState::StringLiteral => {
                    if c == '\\' {
                        return Err(violation("backslash is not allowed in SQL text"));
                    }
                    if c == '\'' {
                        if chars.get(i + 1) == Some(&'\'') {
                            i += 1;
                        } else {
                            state = LexState::Code;
                        }
                    }
                }
                LexState::QuotedIdent => {
                    if c == '\\' {
                        return Err(violation("backslash is not allowed in SQL text"));
                    }
                    if c == '"' {
                        if chars.get(i + 1) == Some(&'"') {
                            quoted.push('"');
                            i += 1;
                        } else {
                            if self.denied_functions.contains(&quoted.to_ascii_lowercase()) {
                                return Err(violation(format!("function '{}' is not allowed", quoted)));
                            }
                            quoted.clear();
                            state = LexState::Code;
                        }
                    } else {
                        quoted.push(c);
                    }
                }
            }
            i += 1;
        }

        match state {
            LexState::Code => self.check_word(&word),
            LexState::StringLiteral => Err(violation("unterminated string literal")),
            LexState::QuotedIdent => Err(violation("unterminated quoted identifier")),
        }
    }

    /// Repeat the structural checks on the parser's own tokens, so a literal
    /// boundary the scanner misjudges cannot hide anything from the parser.
    fn check_tokens(&self, sql: &str) -> Result<()> {
        let tokens = Tokenizer::new(&GenericDialect {}, sql)
            .tokenize()
            .map_err(|e| violation(format!("unparseable statement: {}", e)))?;
        for token in &tokens {
            match token {
                Token::SemiColon => {
                    return Err(violation("statement separator ';' is not allowed"))
                }
                Token::Whitespace(Whitespace::SingleLineComment { .. })
                | Token::Whitespace(Whitespace::MultiLineComment(_)) => {
                    return Err(violation("comments are not allowed"))
                }
                Token::EscapedStringLiteral(_) | Token::DollarQuotedString(_) => {
                    return Err(violation("escape string literals are not allowed"))
                }
                Token::Word(w) => {
                    if w.quote_style.is_none() {
                        self.check_word(&w.value)?;
                    } else if self.denied_functions.contains(&w.value.to_ascii_lowercase()) {
                        return Err(violation(format!("function '{}' is not allowed", w.value)));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn check_word(&self, word: &str) -> Result<()> {
        if word.is_empty() {
            return Ok(());
        }
        if self.denied_keywords.contains(&word.to_ascii_uppercase()) {
            return Err(violation(format!("keyword '{}' is not allowed", word)));
        }
        if self.denied_functions.contains(&word.to_ascii_lowercase()) {
            return Err(violation(format!("function '{}' is not allowed", word)));
        }
        Ok(())
    }
}

fn violation(message: impl Into<String>) -> SandboxError {
    SandboxError::SqlPolicyViolation(message.into())
}

/// Characters that can hide structure from a reader: C0/C1 controls other than
/// ordinary whitespace, zero-width and bidi-override code points, BOM.
fn is_hidden_char(c: char) -> bool {
    (c.is_control() && !matches!(c, '\n' | '\r' | '\t'))
        || matches!(c as u32, 0x200B..=0x200F | 0x202A..=0x202E | 0x2060..=0x2069 | 0xFEFF)
}

const SCRIPT_ANALYZER: &str = r#"
import ast
import json
import sys

def check(code, policy):
    allowed = policy.get("allowed")
    allowed = set(allowed) if allowed is not None else None
    denied = set(policy.get("denied_modules", []))
    calls = set(policy.get("denied_calls", []))

    try:
        tree = ast.parse(code)
    except SyntaxError as e:
        return {"ok": False, "kind": "syntax", "message": str(e)}

    def module_ok(name):
        root = name.split(".")[0]
        if root in denied:
            return False
        return allowed is None or root in allowed

    for node in ast.walk(tree):
        if isinstance(node, ast.Import):
            for alias in node.names:
                if not module_ok(alias.name):
                    return {"ok": False, "kind": "policy", "message": f"import of '{alias.name}' is not allowed"}
        elif isinstance(node, ast.ImportFrom):
            if node.level:
                return {"ok": False, "kind": "policy", "message": "relative imports are not allowed"}
            if not module_ok(node.module or ""):
                return {"ok": False, "kind": "policy", "message": f"import from '{node.module}' is not allowed"}
        elif isinstance(node, ast.Call):
            func = node.func
            name = None
            if isinstance(func, ast.Name):
                name = func.id
            elif isinstance(func, ast.Attribute):
                name = func.attr
            if name in calls:
                return {"ok": False, "kind": "policy", "message": f"call to '{name}' is not allowed"}
        elif isinstance(node, ast.Attribute):
            if node.attr.startswith("__") and node.attr.endswith("__"):
                return {"ok": False, "kind": "policy", "message": f"access to '{node.attr}' is not allowed"}
        elif isinstance(node, ast.Name):
            if node.id.startswith("__") and node.id.endswith("__"):
                return {"ok": False, "kind": "policy", "message": f"access to '{node.id}' is not allowed"}
    return {"ok": True}

print(json.dumps(check(sys.stdin.read(), json.loads(sys.argv[1]))))
"#;

const DENIED_CALLS: &[&str] = &[
    "open", "eval", "exec", "compile", "__import__", "globals", "locals", "vars", "getattr",
    "setattr", "delattr", "input", "breakpoint", "to_csv", "to_parquet", "to_pickle",
    "to_sql", "read_pickle", "system", "popen",
];

/// Allow-list policy over a Python script's syntax tree
#[derive(Debug, Clone)]
pub struct ScriptPolicy {
    python_path: PathBuf,
    import_policy: ImportPolicy,
    denied_calls: HashSet<String>,
    max_script_bytes: usize,
}

impl ScriptPolicy {
    pub fn new(python_path: PathBuf, import_policy: ImportPolicy) -> Self {
        Self {
            python_path,
            import_policy,
            denied_calls: DENIED_CALLS.iter().map(|s| s.to_string()).collect(),
            max_script_bytes: 256 * 1024,
        }
    }

    /// Locate `python3` (or `python`) on PATH
    pub fn from_path_lookup(import_policy: ImportPolicy) -> Result<Self> {
        let python_path = which::which("python3")
            .or_else(|_| which::which("python"))
            .map_err(|_| SandboxError::PythonNotFound)?;
        Ok(Self::new(python_path, import_policy))
    }

    /// Parse the script with the interpreter's own `ast` module and walk it.
    pub fn check(&self, code: &str) -> Result<()> {
        if code.trim().is_empty() {
            return Err(violation("empty script"));
        }
        if code.len() > self.max_script_bytes {
            return Err(violation(format!(
                "script is {} bytes, limit is {}",
                code.len(),
                self.max_script_bytes
            )));
        }

        let mut denied_calls: Vec<&String> = self.denied_calls.iter().collect();
        denied_calls.sort();
        let policy = serde_json::json!({
            "allowed": self.import_policy.allowed_roots(),
            "denied_modules": self.import_policy.denied_roots(),
            "denied_calls": denied_calls,
        });

        let mut child = Command::new(&self.python_path)
            .arg("-I")
            .arg("-c")
            .arg(SCRIPT_ANALYZER)
            .arg(policy.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(code.as_bytes())?;
        }
        let output = child.wait_with_output()?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let verdict: serde_json::Value = serde_json::from_str(stdout.trim()).map_err(|_| {
            SandboxError::InternalError(format!(
                "script analyzer produced no verdict: {}",
                String::from_utf8_lossy(&output.stderr)
            ))
        })?;

        if verdict.get("ok").and_then(|v| v.as_bool()) == Some(true) {
            return Ok(());
        }
        let message = verdict
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("rejected")
            .to_string();
        match verdict.get("kind").and_then(|v| v.as_str()) {
            Some("syntax") => Err(SandboxError::SyntaxError(message)),
            _ => Err(violation(message)),
        }
    }
}
