//! Sandboxed execution of oracle-authored automation code.
//!
//! "Sandbox" here means lifecycle and output capture, not privilege
//! containment. Code runs in the page's main world with a small driver
//! object in scope, and everything it logs to the console during the run
//! is forwarded to the caller's sink.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use autosurf_core_types::{LogEntry, LogSeverity, PageId};

use crate::errors::{BrowserError, BrowserErrorKind};
use crate::session::BrowserSession;

/// How long to keep draining console traffic after the script settles.
/// Console events race the evaluate response over the same connection.
const DRAIN_AFTER_MS: u64 = 25;

/// Driver object handed to automation code as its single argument. Covers
/// the common moves so generated code does not have to re-derive them:
/// navigation, reading url/title, clicking, typing with input events, text
/// extraction, and polling for a selector.
const PAGE_DRIVER_JS: &str = r#"(() => {
  const $ = (selector) => {
    const el = document.querySelector(selector);
    if (!el) throw new Error("no element matches selector: " + selector);
    return el;
  };
  return {
    goto: (url) => { location.assign(url); },
    url: () => location.href,
    title: () => document.title,
    click: (selector) => { $(selector).click(); },
    type: (selector, text) => {
      const el = $(selector);
      el.focus();
      el.value = text;
      el.dispatchEvent(new Event("input", { bubbles: true }));
      el.dispatchEvent(new Event("change", { bubbles: true }));
    },
    text: (selector) => $(selector).innerText,
    waitForSelector: (selector, timeoutMs = 5000) => new Promise((resolve, reject) => {
      const started = Date.now();
      const poll = () => {
        const el = document.querySelector(selector);
        if (el) return resolve(el.tagName.toLowerCase());
        if (Date.now() - started > timeoutMs) {
          return reject(new Error("timed out waiting for selector: " + selector));
        }
        setTimeout(poll, 100);
      };
      poll();
    }),
  };
})()"#;

/// Executes automation code on a page, streaming its console output.
pub struct CodeSandbox {
    session: Arc<BrowserSession>,
}

/// Aborts the console forwarder when the execution scope ends, on every
/// return path.
struct ForwarderGuard(JoinHandle<()>);

impl Drop for ForwarderGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl CodeSandbox {
    pub fn new(session: Arc<BrowserSession>) -> Self {
        Self { session }
    }

    /// Run `code` on `page`, forwarding console output to `sink` for the
    /// duration of the run.
    ///
    /// The code is wrapped in an async function receiving the page driver,
    /// so `await` and early `return` both work. A thrown exception surfaces
    /// as `ExecutionFailed` and is mirrored into the sink as a final
    /// error-severity entry so the log stream tells the whole story.
    pub async fn execute(
        &self,
        page: PageId,
        code: &str,
        sink: mpsc::UnboundedSender<LogEntry>,
    ) -> Result<(), BrowserError> {
        if !self.session.has_page(page) {
            return Err(BrowserError::new(BrowserErrorKind::PageUnavailable)
                .with_hint(format!("page {page} is not open"))
                .retriable(true));
        }

        let mut console_rx = self.session.subscribe_console();
        let forwarder_sink = sink.clone();
        let _guard = ForwarderGuard(tokio::spawn(async move {
            while let Ok(message) = console_rx.recv().await {
                if message.page != page {
                    continue;
                }
                let entry = LogEntry::new(message.severity, message.values);
                debug!(target: "browser-host", %page, severity = ?entry.severity, "console: {}", entry.render());
                if forwarder_sink.send(entry).is_err() {
                    break;
                }
            }
        }));

        let wrapped = wrap_code(code);
        let outcome = self.session.evaluate(page, &wrapped).await;

        // Let in-flight console events land before the forwarder dies.
        tokio::time::sleep(Duration::from_millis(DRAIN_AFTER_MS)).await;

        match outcome {
            Ok(_) => Ok(()),
            Err(err) if err.is_execution_failure() => {
                let detail = err
                    .hint
                    .clone()
                    .unwrap_or_else(|| "code execution failed".to_string());
                let _ = sink.send(LogEntry::new(
                    LogSeverity::Error,
                    vec![serde_json::Value::String(detail)],
                ));
                Err(err)
            }
            Err(err) => Err(err),
        }
    }
}

fn wrap_code(code: &str) -> String {
    format!("(async (page) => {{\n{code}\n}})({PAGE_DRIVER_JS})")
}
