use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// High-level error categories surfaced by the browser layer.
#[derive(Clone, Debug, Eq, PartialEq, Error, Serialize, Deserialize)]
pub enum BrowserErrorKind {
    /// No open page matched the surface marker. Recoverable: retry on next use.
    #[error("no page resolved for surface")]
    PageNotFound,
    /// The page existed but its CDP session is gone (closed or detached).
    #[error("page unavailable")]
    PageUnavailable,
    /// Sandboxed code threw inside the page. Recoverable: recorded as a tool
    /// failure so the oracle can adapt.
    #[error("code execution failed")]
    ExecutionFailed,
    /// Screenshot or tree capture failed. Degrades the observation, never
    /// fatal to the loop.
    #[error("observation capture failed")]
    ObservationFailed,
    #[error("cdp i/o failure")]
    CdpIo,
    #[error("command timed out")]
    Timeout,
    #[error("internal error")]
    Internal,
}

/// Enriched error passed back to higher layers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BrowserError {
    pub kind: BrowserErrorKind,
    pub hint: Option<String>,
    pub retriable: bool,
    pub data: Option<serde_json::Value>,
}

impl fmt::Display for BrowserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(hint) = &self.hint {
            write!(f, ": {}", hint)?;
        }
        Ok(())
    }
}

impl std::error::Error for BrowserError {}

impl BrowserError {
    pub fn new(kind: BrowserErrorKind) -> Self {
        Self {
            kind,
            hint: None,
            retriable: false,
            data: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn retriable(mut self, flag: bool) -> Self {
        self.retriable = flag;
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn is_page_not_found(&self) -> bool {
        matches!(self.kind, BrowserErrorKind::PageNotFound)
    }

    pub fn is_execution_failure(&self) -> bool {
        matches!(self.kind, BrowserErrorKind::ExecutionFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_hint() {
        let err = BrowserError::new(BrowserErrorKind::PageNotFound)
            .with_hint("surface not yet attached");
        assert_eq!(
            err.to_string(),
            "no page resolved for surface: surface not yet attached"
        );
        assert!(err.is_page_not_found());
    }
}
