//! Wire contract between executors and the sandboxed runner.
//!
//! The runner reads one [`ExecutionRequest`] and writes one [`ExecutionResult`].
//! Executors never shape results themselves: whatever text the backend hands
//! back goes through [`normalize_output`], which tries the strict JSON encoding
//! first and a Python literal mapping second.

use crate::errors::{Result, SandboxError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

pub const DEFAULT_MAX_OUTPUT_BYTES: u64 = 64 * 1024;
pub const TRUNCATION_MARKER: &str = "…[truncated]";

fn default_max_output_bytes() -> u64 {
    DEFAULT_MAX_OUTPUT_BYTES
}

/// A dataset file as declared to the runner
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileRef {
    /// Logical name before sanitization (usually the file name)
    pub name: String,
    /// Absolute path under the sandbox data root
    pub path: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    Sql,
    Script,
}

/// Statement text, selected by `query_type` on the wire
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "query_type", rename_all = "lowercase")]
pub enum QueryBody {
    Sql { statement: String },
    Script { code: String },
}

impl QueryBody {
    pub fn query_type(&self) -> QueryType {
        match self {
            QueryBody::Sql { .. } => QueryType::Sql,
            QueryBody::Script { .. } => QueryType::Script,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            QueryBody::Sql { statement } => statement,
            QueryBody::Script { code } => code,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub dataset_id: String,
    pub files: Vec<FileRef>,
    #[serde(flatten)]
    pub query: QueryBody,
    pub timeout_seconds: u64,
    pub max_rows: u64,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: u64,
}

impl ExecutionRequest {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Error,
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionResult {
    pub status: RunStatus,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub rows: Vec<Vec<Value>>,
    #[serde(default)]
    pub row_count: u64,
    #[serde(default)]
    pub exec_time_ms: u64,
    #[serde(default)]
    pub stdout_trunc: String,
    #[serde(default)]
    pub stderr_trunc: String,
    #[serde(default)]
    pub error: Option<String>,
    /// Set when rows or captured output were cut to fit the budget
    #[serde(default)]
    pub truncated: bool,
}

impl ExecutionResult {
    pub fn success(columns: Vec<String>, rows: Vec<Vec<Value>>, exec_time_ms: u64) -> Self {
        Self {
            status: RunStatus::Success,
            columns,
            row_count: rows.len() as u64,
            rows,
            exec_time_ms,
            stdout_trunc: String::new(),
            stderr_trunc: String::new(),
            error: None,
            truncated: false,
        }
    }

    pub fn error(message: impl Into<String>, exec_time_ms: u64) -> Self {
        Self {
            status: RunStatus::Error,
            columns: Vec::new(),
            rows: Vec::new(),
            row_count: 0,
            exec_time_ms,
            stdout_trunc: String::new(),
            stderr_trunc: String::new(),
            error: Some(message.into()),
            truncated: false,
        }
    }

    /// Timeouts never carry rows, partial or otherwise.
    pub fn timeout(message: impl Into<String>, exec_time_ms: u64) -> Self {
        Self {
            status: RunStatus::Timeout,
            ..Self::error(message, exec_time_ms)
        }
    }

    /// Cut rows to `max_rows`, flagging the cut.
    pub fn limit_rows(mut self, max_rows: u64) -> Self {
        if self.rows.len() as u64 > max_rows {
            self.rows.truncate(max_rows as usize);
            self.truncated = true;
        }
        self.row_count = self.rows.len() as u64;
        self
    }

    /// Attach captured output, each stream cut to `max_bytes`.
    pub fn with_output(mut self, stdout: &str, stderr: &str, max_bytes: u64) -> Self {
        let (out, out_cut) = truncate_output(stdout, max_bytes as usize);
        let (err, err_cut) = truncate_output(stderr, max_bytes as usize);
        self.stdout_trunc = out;
        self.stderr_trunc = err;
        self.truncated |= out_cut || err_cut;
        self
    }

    fn check_shape(self) -> Result<Self> {
        if self.row_count != self.rows.len() as u64 {
            return Err(SandboxError::RunnerProtocol(format!(
                "row_count {} disagrees with {} rows",
                self.row_count,
                self.rows.len()
            )));
        }
        match self.status {
            RunStatus::Success => {
                if let Some(bad) = self.rows.iter().find(|r| r.len() != self.columns.len()) {
                    return Err(SandboxError::RunnerProtocol(format!(
                        "row of width {} under {} columns",
                        bad.len(),
                        self.columns.len()
                    )));
                }
                Ok(self)
            }
            RunStatus::Timeout => Ok(Self {
                rows: Vec::new(),
                row_count: 0,
                ..self
            }),
            RunStatus::Error => Ok(self),
        }
    }
}

/// Cut `text` to at most `max_bytes` on a char boundary, ending with a marker.
pub fn truncate_output(text: &str, max_bytes: usize) -> (String, bool) {
    if text.len() <= max_bytes {
        return (text.to_string(), false);
    }
    let keep = max_bytes.saturating_sub(TRUNCATION_MARKER.len());
    let mut cut = keep;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut out = text[..cut].to_string();
    if max_bytes >= TRUNCATION_MARKER.len() {
        out.push_str(TRUNCATION_MARKER);
    }
    (out, true)
}

/// Turn raw runner output into an [`ExecutionResult`].
///
/// Candidates are the whole text and then each line that opens a mapping,
/// last line first, since runtimes may interleave log lines. Every candidate
/// is tried as JSON before any is tried as a Python literal.
pub fn normalize_output(text: &str) -> Result<ExecutionResult> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(SandboxError::RunnerProtocol("runner produced no output".to_string()));
    }

    let candidates: Vec<&str> = std::iter::once(trimmed)
        .chain(
            trimmed
                .lines()
                .rev()
                .map(str::trim)
                .filter(|line| line.starts_with('{')),
        )
        .collect();

    let mut last_problem = String::from("no result mapping found");

    for candidate in &candidates {
        if let Ok(value) = serde_json::from_str::<Value>(candidate) {
            match result_from_value(value) {
                Ok(result) => return Ok(result),
                Err(e) => last_problem = e.to_string(),
            }
        }
    }

    for candidate in &candidates {
        if let Ok(value) = parse_literal(candidate) {
            match result_from_value(value) {
                Ok(result) => return Ok(result),
                Err(e) => last_problem = e.to_string(),
            }
        }
    }

    let (preview, _) = truncate_output(trimmed, 512);
    Err(SandboxError::RunnerProtocol(format!(
        "{} in {} bytes of output: {}",
        last_problem,
        trimmed.len(),
        preview
    )))
}

fn result_from_value(value: Value) -> Result<ExecutionResult> {
    if value.get("status").is_none() {
        return Err(SandboxError::RunnerProtocol("mapping has no status".to_string()));
    }
    let result: ExecutionResult = serde_json::from_value(value)
        .map_err(|e| SandboxError::RunnerProtocol(format!("malformed result: {}", e)))?;
    result.check_shape()
}

/// Parse a Python literal (dict, list, tuple, str, int, float, True/False/None).
pub fn parse_literal(text: &str) -> Result<Value> {
    let mut parser = LiteralParser {
        chars: text.chars().collect(),
        pos: 0,
        depth: 0,
    };
    let value = parser.value()?;
    parser.skip_ws();
    if parser.pos != parser.chars.len() {
        return Err(parser.fail("trailing characters"));
    }
    Ok(value)
}

/// Same nesting bound serde_json applies to the strict encoding
const MAX_LITERAL_DEPTH: usize = 128;

struct LiteralParser {
    chars: Vec<char>,
    pos: usize,
    depth: usize,
}

impl LiteralParser {
    fn fail(&self, what: &str) -> SandboxError {
        SandboxError::RunnerProtocol(format!("literal parse error at {}: {}", self.pos, what))
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, c: char) -> Result<()> {
        self.skip_ws();
        if self.peek() == Some(c) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.fail(&format!("expected '{}'", c)))
        }
    }

    fn value(&mut self) -> Result<Value> {
        self.skip_ws();
        match self.peek() {
            Some(open @ ('{' | '[' | '(')) => {
                if self.depth >= MAX_LITERAL_DEPTH {
                    return Err(self.fail("nesting too deep"));
                }
                self.depth += 1;
                let nested = match open {
                    '{' => self.mapping(),
                    '[' => self.sequence(']').map(Value::Array),
                    _ => self.sequence(')').map(Value::Array),
                };
                self.depth -= 1;
                nested
            }
            Some('\'') | Some('"') => self.string().map(Value::String),
            Some(c) if c == '-' || c == '+' || c.is_ascii_digit() => self.number(),
            Some(c) if c.is_ascii_alphabetic() => {
                let start = self.pos;
                while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == '_') {
                    self.pos += 1;
                }
                let word: String = self.chars[start..self.pos].iter().collect();
                match word.as_str() {
                    "True" => Ok(Value::Bool(true)),
                    "False" => Ok(Value::Bool(false)),
                    "None" => Ok(Value::Null),
                    "nan" | "inf" => Ok(Value::Null),
                    _ => Err(self.fail(&format!("unknown name '{}'", word))),
                }
            }
            _ => Err(self.fail("expected a value")),
        }
    }

    fn mapping(&mut self) -> Result<Value> {
        self.expect('{')?;
        let mut map = Map::new();
        loop {
            self.skip_ws();
            if self.peek() == Some('}') {
                self.pos += 1;
                return Ok(Value::Object(map));
            }
            let key = match self.value()? {
                Value::String(s) => s,
                _ => return Err(self.fail("mapping keys must be strings")),
            };
            self.expect(':')?;
            let value = self.value()?;
            map.insert(key, value);
            self.skip_ws();
            match self.peek() {
                Some(',') => self.pos += 1,
                Some('}') => {}
                _ => return Err(self.fail("expected ',' or '}'")),
            }
        }
    }

    fn sequence(&mut self, close: char) -> Result<Vec<Value>> {
        self.pos += 1;
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() == Some(close) {
                self.pos += 1;
                return Ok(items);
            }
            items.push(self.value()?);
            self.skip_ws();
            match self.peek() {
                Some(',') => self.pos += 1,
                Some(c) if c == close => {}
                _ => return Err(self.fail("expected ',' or closing bracket")),
            }
        }
    }

    fn string(&mut self) -> Result<String> {
        let quote = self.peek().ok_or_else(|| self.fail("expected a string"))?;
        self.pos += 1;
        let mut out = String::new();
        loop {
            let c = self.peek().ok_or_else(|| self.fail("unterminated string"))?;
            self.pos += 1;
            if c == quote {
                return Ok(out);
            }
            if c != '\\' {
                out.push(c);
                continue;
            }
            let esc = self.peek().ok_or_else(|| self.fail("dangling escape"))?;
            self.pos += 1;
            match esc {
                'n' => out.push('\n'),
                't' => out.push('\t'),
                'r' => out.push('\r'),
                '0' => out.push('\0'),
                '\\' | '\'' | '"' => out.push(esc),
                'x' => out.push(self.hex_escape(2)?),
                'u' => out.push(self.hex_escape(4)?),
                'U' => out.push(self.hex_escape(8)?),
                other => {
                    out.push('\\');
                    out.push(other);
                }
            }
        }
    }

    fn hex_escape(&mut self, digits: usize) -> Result<char> {
        if self.pos + digits > self.chars.len() {
            return Err(self.fail("short hex escape"));
        }
        let hex: String = self.chars[self.pos..self.pos + digits].iter().collect();
        self.pos += digits;
        u32::from_str_radix(&hex, 16)
            .ok()
            .and_then(char::from_u32)
            .ok_or_else(|| self.fail("invalid hex escape"))
    }

    fn number(&mut self) -> Result<Value> {
        let start = self.pos;
        if matches!(self.peek(), Some('-') | Some('+')) {
            self.pos += 1;
        }
        while let Some(c) = self.peek() {
            if !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '+' | '-')) {
                break;
            }
            if (c == '+' || c == '-')
                && !matches!(self.chars.get(self.pos - 1), Some('e') | Some('E'))
            {
                break;
            }
            self.pos += 1;
        }
        let text: String = self.chars[start..self.pos]
            .iter()
            .filter(|c| **c != '_')
            .collect();
        if let Ok(i) = text.parse::<i64>() {
            return Ok(Value::Number(i.into()));
        }
        match text.parse::<f64>() {
            Ok(f) => Ok(Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)),
            Err(_) => Err(self.fail(&format!("invalid number '{}'", text))),
        }
    }
}
