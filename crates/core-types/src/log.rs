//! Captured console output from sandboxed code execution.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Unique identifier for one captured console line.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct LogEntryId(pub Uuid);

impl LogEntryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LogEntryId {
    fn default() -> Self {
        Self::new()
    }
}

/// Severity class of a captured console line.
///
/// Only the four standard output severities are intercepted; everything else
/// the console API can emit (debug, trace, table, ...) passes through
/// unobserved.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSeverity {
    Log,
    Error,
    Warn,
    Info,
}

impl LogSeverity {
    /// Map a CDP `Runtime.consoleAPICalled` type string onto a severity.
    ///
    /// Returns `None` for console call types outside the intercepted set.
    pub fn from_console_type(kind: &str) -> Option<Self> {
        match kind {
            "log" => Some(Self::Log),
            "error" => Some(Self::Error),
            "warning" => Some(Self::Warn),
            "info" => Some(Self::Info),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
        }
    }
}

/// One captured output line from sandboxed code execution.
///
/// Entries are streamed to the host as they are generated, never batched;
/// ordering is preserved within one execution.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: LogEntryId,
    pub severity: LogSeverity,
    /// Serialized argument values of the console call, in call order.
    pub values: Vec<Value>,
}

impl LogEntry {
    pub fn new(severity: LogSeverity, values: Vec<Value>) -> Self {
        Self {
            id: LogEntryId::new(),
            severity,
            values,
        }
    }

    /// Render the entry values as a single display line.
    pub fn render(&self) -> String {
        self.values
            .iter()
            .map(|value| match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}
