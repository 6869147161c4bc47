//! Orchestrates one instruction at a time: observe, consult the oracle,
//! dispatch its actions, repeat until completion, stop, or failure.

use std::sync::Arc;

use base64::Engine;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use autosurf_browser::{
    format_outline, BrowserSession, CodeSandbox, ObservationCollector, PageResolver,
};
use autosurf_core_types::{Instruction, LogEntry, SurfaceId};
use autosurf_oracle::{
    actions::TOOL_TASK_COMPLETED, AgentAction, ContentPart, DecidedAction, OracleClient,
};

use crate::config::AgentConfig;
use crate::errors::AgentError;
use crate::events::{AgentEvent, EventRole};

const FIND_ELEMENT_JS: &str = r##"((query) => {
  const q = query.toLowerCase();
  const path = (el) => {
    if (el.id) return "#" + CSS.escape(el.id);
    const parts = [];
    while (el && el.nodeType === 1 && el !== document.documentElement) {
      let idx = 1, sib = el;
      while ((sib = sib.previousElementSibling)) {
        if (sib.tagName === el.tagName) idx++;
      }
      parts.unshift(el.tagName.toLowerCase() + ":nth-of-type(" + idx + ")");
      el = el.parentElement;
    }
    return parts.length ? "html > " + parts.join(" > ") : "html";
  };
  const haystack = (el) => [
    el.innerText,
    el.getAttribute("aria-label"),
    el.getAttribute("placeholder"),
    el.getAttribute("title"),
    typeof el.value === "string" ? el.value : "",
  ].filter(Boolean).join(" ").toLowerCase();
  const out = [];
  for (const el of document.querySelectorAll("a, button, input, select, textarea, [role], [onclick]")) {
    if (!haystack(el).includes(q)) continue;
    out.push({
      selector: path(el),
      tag: el.tagName.toLowerCase(),
      text: (el.innerText || el.value || "").trim().slice(0, 80),
    });
    if (out.length >= 5) break;
  }
  return out;
})"##;

const ELEMENT_DETAILS_JS: &str = r#"((selector) => {
  const el = document.querySelector(selector);
  if (!el) return null;
  const rect = el.getBoundingClientRect();
  const attrs = {};
  for (const a of el.attributes) attrs[a.name] = a.value;
  return {
    tag: el.tagName.toLowerCase(),
    attrs,
    value: typeof el.value === "string" ? el.value.slice(0, 200) : null,
    text: (el.innerText || "").trim().slice(0, 200),
    visible: rect.width > 0 && rect.height > 0,
    disabled: el.disabled === true,
  };
})"#;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RunState {
    Idle,
    Running,
    WaitingForUser,
}

/// What a dispatched action means for the rest of the loop.
enum Flow {
    Continue,
    Completed,
    Stopped,
}

pub struct AgentOrchestrator {
    session: Arc<BrowserSession>,
    resolver: PageResolver,
    sandbox: CodeSandbox,
    collector: ObservationCollector,
    oracle: Arc<OracleClient>,
    surface: SurfaceId,
    config: AgentConfig,
    state: Mutex<RunState>,
    events: mpsc::UnboundedSender<AgentEvent>,
    cancel: std::sync::Mutex<CancellationToken>,
    pending_answer: std::sync::Mutex<Option<oneshot::Sender<String>>>,
}

impl AgentOrchestrator {
    pub fn new(
        session: Arc<BrowserSession>,
        oracle: Arc<OracleClient>,
        surface: SurfaceId,
        config: AgentConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<AgentEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let orchestrator = Arc::new(Self {
            resolver: PageResolver::new(session.clone()),
            sandbox: CodeSandbox::new(session.clone()),
            collector: ObservationCollector::new(session.clone()),
            session,
            oracle,
            surface,
            config,
            state: Mutex::new(RunState::Idle),
            events,
            cancel: std::sync::Mutex::new(CancellationToken::new()),
            pending_answer: std::sync::Mutex::new(None),
        });
        (orchestrator, events_rx)
    }

    /// Run one instruction to completion. Only one instruction may run at a
    /// time; a second call while busy returns `AgentError::Busy` immediately.
    pub async fn run(&self, instruction_text: &str) -> Result<(), AgentError> {
        {
            let mut state = self.state.lock().await;
            if *state != RunState::Idle {
                return Err(AgentError::Busy);
            }
            *state = RunState::Running;
        }

        let cancel = CancellationToken::new();
        if let Ok(mut guard) = self.cancel.lock() {
            *guard = cancel.clone();
        }

        let instruction = Instruction::new(instruction_text);
        info!(target: "agent-loop", id = %instruction.id, "instruction started: {}", instruction.text);
        self.oracle
            .append_user_message(instruction.text.as_str())
            .await;

        let outcome = self.run_loop(&cancel).await;
        *self.state.lock().await = RunState::Idle;
        if let Ok(mut pending) = self.pending_answer.lock() {
            pending.take();
        }

        match &outcome {
            Ok(()) => info!(target: "agent-loop", id = %instruction.id, "instruction finished"),
            Err(err) => warn!(target: "agent-loop", id = %instruction.id, %err, "instruction ended with error"),
        }
        outcome
    }

    async fn run_loop(&self, cancel: &CancellationToken) -> Result<(), AgentError> {
        let mut steps = 0u32;

        loop {
            if cancel.is_cancelled() {
                self.emit_stopped();
                return Ok(());
            }
            if steps >= self.config.max_steps {
                let err = AgentError::MaxSteps { steps };
                self.emit(AgentEvent::Error {
                    message: err.to_string(),
                });
                return Err(err);
            }
            steps += 1;

            let observation = self.collect_observation().await;
            let (decided, _assistant_text) = match self.oracle.next_actions(observation).await {
                Ok(turn) => turn,
                Err(err) => {
                    self.emit(AgentEvent::Error {
                        message: err.to_string(),
                    });
                    return Err(err.into());
                }
            };

            if decided.is_empty() {
                // Nothing to do this turn; give the page a beat and look again.
                sleep(Duration::from_millis(self.config.idle_poll_ms)).await;
                continue;
            }

            for action in decided {
                match self.dispatch(action, cancel).await {
                    Flow::Continue => {}
                    Flow::Completed => {
                        self.emit(AgentEvent::Completed);
                        return Ok(());
                    }
                    Flow::Stopped => {
                        self.emit_stopped();
                        return Ok(());
                    }
                }
                sleep(Duration::from_millis(self.config.wait_between_actions_ms)).await;
            }
        }
    }

    /// Build the observation message for the oracle. Never fails: when the
    /// surface cannot be resolved the oracle is told so in plain text and
    /// can decide to wait or ask the user.
    async fn collect_observation(&self) -> Vec<ContentPart> {
        let page = match self.resolver.resolve(self.surface).await {
            Ok(page) => page,
            Err(err) => {
                debug!(target: "agent-loop", surface = %self.surface, %err, "surface did not resolve");
                return vec![ContentPart::Text(
                    "No page is currently attached to the surface. It may still be loading; \
                     wait and try again, or tell the user if this persists."
                        .to_string(),
                )];
            }
        };

        let snapshot = self.collector.snapshot(page).await;
        let outline = snapshot
            .tree
            .as_ref()
            .map(|tree| format_outline(tree, self.config.outline_max_nodes))
            .unwrap_or_else(|| "(page outline unavailable)".to_string());

        let mut parts = vec![ContentPart::Text(format!(
            "Current page:\nURL: {}\nTitle: {}\n\nPage outline:\n{}",
            snapshot.url, snapshot.title, outline
        ))];

        if self.config.enable_vision {
            if let Some(bytes) = &snapshot.screenshot_jpeg {
                parts.push(ContentPart::ImageJpeg(
                    base64::engine::general_purpose::STANDARD.encode(bytes),
                ));
            }
        }
        parts
    }

    async fn dispatch(&self, decided: DecidedAction, cancel: &CancellationToken) -> Flow {
        let call_id = decided.call_id;
        let action = match decided.action {
            Ok(action) => action,
            Err(err) => {
                // Malformed calls are reported back instead of killing the run.
                warn!(target: "agent-loop", %err, "unparseable tool call");
                self.oracle
                    .append_tool_result(call_id, format!("Error: {err}"))
                    .await;
                return Flow::Continue;
            }
        };

        match action {
            AgentAction::ExecuteCode { code, feedback } => {
                let succeeded = self.execute_code(&call_id, &code).await;
                // The progress note is only truthful once the code ran.
                if succeeded {
                    if let Some(feedback) = feedback {
                        self.emit(AgentEvent::Message {
                            role: EventRole::Assistant,
                            content: feedback,
                        });
                    }
                }
                Flow::Continue
            }
            AgentAction::AskUser { question } => self.ask_user(&call_id, question, cancel).await,
            AgentAction::NotifyUser { message } => {
                self.emit(AgentEvent::Message {
                    role: EventRole::Assistant,
                    content: message,
                });
                self.oracle
                    .append_tool_result(call_id, "Message delivered.")
                    .await;
                Flow::Continue
            }
            AgentAction::TaskComplete { summary } => {
                self.oracle
                    .append_tool_result(call_id, "Completion acknowledged.")
                    .await;
                self.emit(AgentEvent::Message {
                    role: EventRole::Assistant,
                    content: summary,
                });
                debug!(target: "agent-loop", tool = TOOL_TASK_COMPLETED, "run complete");
                Flow::Completed
            }
            AgentAction::FindElement { query } => {
                self.page_query(&call_id, FIND_ELEMENT_JS, &query, "no matching elements")
                    .await;
                Flow::Continue
            }
            AgentAction::GetElementDetails { selector } => {
                self.page_query(
                    &call_id,
                    ELEMENT_DETAILS_JS,
                    &selector,
                    "no element matches that selector",
                )
                .await;
                Flow::Continue
            }
        }
    }

    /// Returns whether the code ran without error. Console output is
    /// forwarded to the event stream entry by entry while the code is still
    /// running; the accumulated text also lands in the tool result.
    async fn execute_code(&self, call_id: &str, code: &str) -> bool {
        let page = match self.resolver.resolve(self.surface).await {
            Ok(page) => page,
            Err(err) => {
                self.oracle
                    .append_tool_result(call_id, format!("Error: {err}"))
                    .await;
                return false;
            }
        };

        let (sink, mut log_rx) = mpsc::unbounded_channel::<LogEntry>();
        let events = self.events.clone();
        let forwarder = tokio::spawn(async move {
            let mut rendered = Vec::new();
            while let Some(entry) = log_rx.recv().await {
                rendered.push(format!("[{}] {}", entry.severity.as_str(), entry.render()));
                let _ = events.send(AgentEvent::Log(entry));
            }
            rendered
        });

        // `execute` owns the only sender; the forwarder drains dry and
        // finishes as soon as it returns.
        let outcome = self.sandbox.execute(page, code, sink).await;
        let rendered = forwarder.await.unwrap_or_default();

        let console = if rendered.is_empty() {
            "(no console output)".to_string()
        } else {
            rendered.join("\n")
        };

        let succeeded = outcome.is_ok();
        let result = match outcome {
            Ok(()) => format!("Code executed successfully.\nConsole output:\n{console}"),
            Err(err) => format!("Code execution failed: {err}\nConsole output:\n{console}"),
        };
        self.oracle.append_tool_result(call_id, result).await;
        succeeded
    }

    async fn ask_user(&self, call_id: &str, question: String, cancel: &CancellationToken) -> Flow {
        let (answer_tx, answer_rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending_answer.lock() {
            *pending = Some(answer_tx);
        }
        *self.state.lock().await = RunState::WaitingForUser;
        self.emit(AgentEvent::Question { content: question });

        let flow = tokio::select! {
            answer = answer_rx => match answer {
                Ok(answer) => {
                    self.oracle
                        .append_tool_result(call_id, format!("User answered: {answer}"))
                        .await;
                    Flow::Continue
                }
                Err(_) => {
                    self.oracle
                        .append_tool_result(call_id, "Error: the answer channel closed.")
                        .await;
                    Flow::Stopped
                }
            },
            _ = cancel.cancelled() => {
                // Stop wins over the wait; the question is abandoned.
                self.oracle
                    .append_tool_result(call_id, "The run was stopped before the user answered.")
                    .await;
                Flow::Stopped
            }
        };

        if let Ok(mut pending) = self.pending_answer.lock() {
            pending.take();
        }
        *self.state.lock().await = RunState::Running;
        flow
    }

    async fn page_query(&self, call_id: &str, script: &str, argument: &str, empty_note: &str) {
        let page = match self.resolver.resolve(self.surface).await {
            Ok(page) => page,
            Err(err) => {
                self.oracle
                    .append_tool_result(call_id, format!("Error: {err}"))
                    .await;
                return;
            }
        };

        let encoded = match serde_json::to_string(argument) {
            Ok(encoded) => encoded,
            Err(err) => {
                self.oracle
                    .append_tool_result(call_id, format!("Error: {err}"))
                    .await;
                return;
            }
        };

        let expression = format!("{script}({encoded})");
        let result = match self.session.evaluate(page, &expression).await {
            Ok(Value::Null) => empty_note.to_string(),
            Ok(value) if value.as_array().map(|a| a.is_empty()).unwrap_or(false) => {
                empty_note.to_string()
            }
            Ok(value) => value.to_string(),
            Err(err) => format!("Error: {err}"),
        };
        self.oracle.append_tool_result(call_id, result).await;
    }

    /// Deliver the user's answer to a pending question. A warning is logged
    /// when nothing is waiting; the answer is dropped.
    pub fn provide_user_response(&self, answer: impl Into<String>) {
        let sender = self
            .pending_answer
            .lock()
            .ok()
            .and_then(|mut pending| pending.take());
        match sender {
            Some(sender) => {
                let _ = sender.send(answer.into());
            }
            None => warn!(target: "agent-loop", "user response arrived with no pending question"),
        }
    }

    /// Request the current run to stop. Idempotent; safe to call when idle.
    /// A run waiting on a question is unblocked and stopped as well.
    pub fn stop(&self) {
        if let Ok(guard) = self.cancel.lock() {
            guard.cancel();
        }
    }

    /// Forget the oracle conversation. Refused while a run is active.
    pub async fn clear_context(&self) -> Result<(), AgentError> {
        if *self.state.lock().await != RunState::Idle {
            return Err(AgentError::Busy);
        }
        self.oracle.clear_context().await;
        Ok(())
    }

    fn emit_stopped(&self) {
        self.emit(AgentEvent::Message {
            role: EventRole::System,
            content: "Instruction stopped.".to_string(),
        });
    }

    fn emit(&self, event: AgentEvent) {
        if self.events.send(event).is_err() {
            debug!(target: "agent-loop", "event receiver dropped");
        }
    }
}
