//! End-to-end loop tests against a scriptable in-memory browser transport
//! and a recording oracle.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use autosurf_agent::{AgentConfig, AgentError, AgentEvent, AgentOrchestrator, EventRole};
use autosurf_browser::{
    BrowserConfig, BrowserError, BrowserSession, CdpTransport, CommandTarget, TransportEvent,
};
use autosurf_core_types::{PageId, SurfaceId};
use autosurf_oracle::{
    actions::{
        TOOL_ASK_USER, TOOL_ELEMENT_DETAILS, TOOL_EXECUTE_CODE, TOOL_FIND_ELEMENT,
        TOOL_NOTIFY_USER, TOOL_TASK_COMPLETED,
    },
    DecisionOracle, OracleClient, OracleError, OracleTurn, ToolCallWire, TranscriptMessage,
};

/// Browser transport that answers every command from a fixed playbook:
/// marker resolution always matches the single registered page, page state
/// reads return canned values, and injected automation code succeeds unless
/// the playbook says otherwise.
struct FakeBrowser {
    marker: Mutex<Option<String>>,
    fail_code_execution: bool,
}

impl FakeBrowser {
    fn new() -> Self {
        Self {
            marker: Mutex::new(None),
            fail_code_execution: false,
        }
    }

    fn failing_execution() -> Self {
        Self {
            marker: Mutex::new(None),
            fail_code_execution: true,
        }
    }
}

#[async_trait]
impl CdpTransport for FakeBrowser {
    async fn start(&self) -> Result<(), BrowserError> {
        Ok(())
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        None
    }

    async fn send_command(
        &self,
        _target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, BrowserError> {
        match method {
            "Page.captureScreenshot" => Ok(json!({ "data": "aGk=" })),
            "Runtime.evaluate" => {
                let expr = params["expression"].as_str().unwrap_or_default();
                if expr.contains("__autosurf_surface_marker__ = ") {
                    let start = expr.find('"').unwrap() + 1;
                    let end = expr.rfind('"').unwrap();
                    *self.marker.lock().unwrap() = Some(expr[start..end].to_string());
                    return Ok(json!({ "result": { "value": true } }));
                }
                if expr.contains("delete window.") {
                    return Ok(json!({ "result": { "value": true } }));
                }
                if expr.trim() == "window.__autosurf_surface_marker__" {
                    let marker = self.marker.lock().unwrap().clone();
                    return Ok(json!({ "result": { "value": marker } }));
                }
                if expr == "location.href" {
                    return Ok(json!({ "result": { "value": "https://shop.test/" } }));
                }
                if expr == "document.title" {
                    return Ok(json!({ "result": { "value": "Shop" } }));
                }
                if expr.contains("ownText") {
                    // page outline capture
                    return Ok(json!({ "result": { "value": {
                        "tag": "html", "attrs": {}, "text": "",
                        "children": [ { "tag": "h1", "attrs": {}, "text": "Shop", "children": [] } ],
                    } } }));
                }
                if expr.starts_with("(async (page)") {
                    if self.fail_code_execution {
                        return Ok(json!({
                            "result": { "type": "object" },
                            "exceptionDetails": {
                                "text": "Uncaught",
                                "exception": { "description": "Error: button missing" },
                            },
                        }));
                    }
                    return Ok(json!({ "result": { "value": null } }));
                }
                if expr.contains("nth-of-type") || expr.contains("getBoundingClientRect") {
                    return Ok(json!({ "result": { "value": [] } }));
                }
                Ok(json!({ "result": { "value": null } }))
            }
            _ => Ok(json!({})),
        }
    }
}

/// FakeBrowser variant for streaming assertions: automation code blocks on
/// a gate until the test releases it, and transport events are fed from a
/// channel so console traffic can be injected mid-run.
struct GatedBrowser {
    inner: FakeBrowser,
    gate: Arc<tokio::sync::Notify>,
    feed: tokio::sync::Mutex<tokio::sync::mpsc::UnboundedReceiver<TransportEvent>>,
}

#[async_trait]
impl CdpTransport for GatedBrowser {
    async fn start(&self) -> Result<(), BrowserError> {
        Ok(())
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        self.feed.lock().await.recv().await
    }

    async fn send_command(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, BrowserError> {
        if method == "Runtime.evaluate"
            && params["expression"]
                .as_str()
                .unwrap_or_default()
                .starts_with("(async (page)")
        {
            self.gate.notified().await;
            return Ok(json!({ "result": { "value": null } }));
        }
        self.inner.send_command(target, method, params).await
    }
}

fn console_event(text: &str) -> TransportEvent {
    TransportEvent {
        method: "Runtime.consoleAPICalled".to_string(),
        params: json!({
            "type": "log",
            "args": [ { "type": "string", "value": text } ],
        }),
        session_id: Some("S-surface".to_string()),
    }
}

/// Oracle that replays canned turns and records every transcript it was
/// shown, so tests can assert on tool results.
struct RecordingOracle {
    turns: Mutex<VecDeque<OracleTurn>>,
    transcripts: Mutex<Vec<Vec<TranscriptMessage>>>,
}

impl RecordingOracle {
    fn new(turns: Vec<OracleTurn>) -> Arc<Self> {
        Arc::new(Self {
            turns: Mutex::new(turns.into()),
            transcripts: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.transcripts.lock().unwrap().len()
    }

    fn last_transcript(&self) -> Vec<TranscriptMessage> {
        self.transcripts
            .lock()
            .unwrap()
            .last()
            .cloned()
            .unwrap_or_default()
    }

    fn tool_result_texts(&self) -> Vec<String> {
        self.last_transcript()
            .iter()
            .filter(|message| message.tool_call_id.is_some())
            .map(|message| message.text_content())
            .collect()
    }
}

#[async_trait]
impl DecisionOracle for RecordingOracle {
    async fn complete(
        &self,
        messages: &[TranscriptMessage],
        _tools: &[Value],
    ) -> Result<OracleTurn, OracleError> {
        self.transcripts.lock().unwrap().push(messages.to_vec());
        self.turns
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| OracleError::Unavailable("script exhausted".to_string()))
    }
}

fn call(id: &str, name: &str, arguments: Value) -> ToolCallWire {
    ToolCallWire {
        id: id.to_string(),
        name: name.to_string(),
        arguments,
    }
}

fn turn(tool_calls: Vec<ToolCallWire>) -> OracleTurn {
    OracleTurn {
        assistant_text: None,
        tool_calls,
    }
}

fn fast_config() -> AgentConfig {
    AgentConfig::default()
        .with_vision(false)
        .with_wait_between_actions_ms(1)
        .with_idle_poll_ms(1)
}

fn harness(
    transport: FakeBrowser,
    oracle: Arc<RecordingOracle>,
    config: AgentConfig,
) -> (
    Arc<AgentOrchestrator>,
    tokio::sync::mpsc::UnboundedReceiver<AgentEvent>,
    Arc<OracleClient>,
) {
    let session = BrowserSession::new(BrowserConfig::default(), Arc::new(transport));
    let page = PageId::new();
    session.register_page(page, "T-surface", Some("S-surface"));
    let surface = SurfaceId::new();
    session.bind_surface(surface, "T-surface");

    let client = Arc::new(OracleClient::new(oracle, "You drive a web browser."));
    let (orchestrator, events) = AgentOrchestrator::new(session, client.clone(), surface, config);
    (orchestrator, events, client)
}

async fn drain_until_completed(
    events: &mut tokio::sync::mpsc::UnboundedReceiver<AgentEvent>,
) -> Vec<AgentEvent> {
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for events")
            .expect("event channel closed early");
        let done = matches!(event, AgentEvent::Completed);
        seen.push(event);
        if done {
            return seen;
        }
    }
}

#[tokio::test]
async fn completes_and_dispatches_actions_in_order() {
    let oracle = RecordingOracle::new(vec![turn(vec![
        call("c1", TOOL_NOTIFY_USER, json!({ "message": "working on it" })),
        call("c2", TOOL_TASK_COMPLETED, json!({ "summary": "All done." })),
    ])]);
    let (orchestrator, mut events, _client) = harness(FakeBrowser::new(), oracle.clone(), fast_config());

    orchestrator.run("buy oat milk").await.unwrap();

    let seen = drain_until_completed(&mut events).await;
    match &seen[..] {
        [AgentEvent::Message {
            role: EventRole::Assistant,
            content: first,
        }, AgentEvent::Message {
            role: EventRole::Assistant,
            content: second,
        }, AgentEvent::Completed] => {
            assert_eq!(first, "working on it");
            assert_eq!(second, "All done.");
        }
        other => panic!("unexpected event sequence: {other:?}"),
    }
    assert_eq!(oracle.calls(), 1);
}

#[tokio::test]
async fn executes_code_and_reports_the_outcome() {
    let oracle = RecordingOracle::new(vec![
        turn(vec![call(
            "c1",
            TOOL_EXECUTE_CODE,
            json!({ "code": "await page.click('#buy')", "feedback": "Clicking buy" }),
        )]),
        turn(vec![call("c2", TOOL_TASK_COMPLETED, json!({}))]),
    ]);
    let (orchestrator, mut events, _client) = harness(FakeBrowser::new(), oracle.clone(), fast_config());

    orchestrator.run("buy the thing").await.unwrap();
    let seen = drain_until_completed(&mut events).await;
    assert!(matches!(
        &seen[0],
        AgentEvent::Message { role: EventRole::Assistant, content } if content == "Clicking buy"
    ));

    let results = oracle.tool_result_texts();
    assert!(
        results[0].contains("Code executed successfully"),
        "got: {}",
        results[0]
    );
}

#[tokio::test]
async fn execution_failures_are_reported_not_fatal() {
    let oracle = RecordingOracle::new(vec![
        turn(vec![call(
            "c1",
            TOOL_EXECUTE_CODE,
            json!({ "code": "await page.click('#missing')" }),
        )]),
        turn(vec![call("c2", TOOL_TASK_COMPLETED, json!({}))]),
    ]);
    let (orchestrator, mut events, _client) =
        harness(FakeBrowser::failing_execution(), oracle.clone(), fast_config());

    orchestrator.run("click it").await.unwrap();
    let seen = drain_until_completed(&mut events).await;
    assert!(seen
        .iter()
        .any(|event| matches!(event, AgentEvent::Completed)));

    let results = oracle.tool_result_texts();
    assert!(
        results[0].contains("Code execution failed") && results[0].contains("button missing"),
        "got: {}",
        results[0]
    );
}

#[tokio::test]
async fn console_output_streams_while_code_is_still_running() {
    let oracle = RecordingOracle::new(vec![
        turn(vec![call(
            "c1",
            TOOL_EXECUTE_CODE,
            json!({ "code": "console.log('step 1')" }),
        )]),
        turn(vec![call("c2", TOOL_TASK_COMPLETED, json!({}))]),
    ]);
    let gate = Arc::new(tokio::sync::Notify::new());
    let (feed_tx, feed_rx) = tokio::sync::mpsc::unbounded_channel();
    let transport = GatedBrowser {
        inner: FakeBrowser::new(),
        gate: gate.clone(),
        feed: tokio::sync::Mutex::new(feed_rx),
    };

    let session = BrowserSession::new(BrowserConfig::default(), Arc::new(transport));
    session.start().await.unwrap();
    let page = PageId::new();
    session.register_page(page, "T-surface", Some("S-surface"));
    let surface = SurfaceId::new();
    session.bind_surface(surface, "T-surface");
    let client = Arc::new(OracleClient::new(oracle.clone(), "You drive a web browser."));
    let (orchestrator, mut events) = AgentOrchestrator::new(session, client, surface, fast_config());

    let runner = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.run("narrate progress").await })
    };

    // The sandbox subscribes to console traffic before evaluating, so keep
    // injecting until an entry comes out the host side. The evaluate stays
    // gated the whole time.
    let mut streamed = None;
    for _ in 0..100 {
        feed_tx.send(console_event("step 1")).unwrap();
        match tokio::time::timeout(Duration::from_millis(50), events.recv()).await {
            Ok(Some(AgentEvent::Log(entry))) => {
                streamed = Some(entry);
                break;
            }
            Ok(Some(other)) => panic!("unexpected event before the log: {other:?}"),
            Ok(None) => panic!("event channel closed"),
            Err(_) => {}
        }
    }
    let entry = streamed.expect("console entry never reached the host while code ran");
    assert_eq!(entry.render(), "step 1");
    assert!(!runner.is_finished(), "execution had already returned");

    gate.notify_one();
    runner.await.unwrap().unwrap();
    drain_until_completed(&mut events).await;
}

#[tokio::test]
async fn feedback_is_withheld_when_execution_fails() {
    let oracle = RecordingOracle::new(vec![
        turn(vec![call(
            "c1",
            TOOL_EXECUTE_CODE,
            json!({ "code": "await page.click('#x')", "feedback": "Clicking the button" }),
        )]),
        turn(vec![call("c2", TOOL_TASK_COMPLETED, json!({}))]),
    ]);
    let (orchestrator, mut events, _client) =
        harness(FakeBrowser::failing_execution(), oracle.clone(), fast_config());

    orchestrator.run("click it").await.unwrap();
    let seen = drain_until_completed(&mut events).await;
    assert!(
        !seen.iter().any(|event| matches!(
            event,
            AgentEvent::Message { content, .. } if content == "Clicking the button"
        )),
        "progress note leaked for failed execution"
    );
    assert!(oracle.tool_result_texts()[0].contains("Code execution failed"));
}

#[tokio::test]
async fn asks_the_user_and_resumes_with_the_answer() {
    let oracle = RecordingOracle::new(vec![
        turn(vec![call(
            "c1",
            TOOL_ASK_USER,
            json!({ "question": "Which color?" }),
        )]),
        turn(vec![call("c2", TOOL_TASK_COMPLETED, json!({}))]),
    ]);
    let (orchestrator, mut events, _client) = harness(FakeBrowser::new(), oracle.clone(), fast_config());

    let runner = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.run("buy a shirt").await })
    };

    let question = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(
        matches!(&question, AgentEvent::Question { content } if content == "Which color?"),
        "expected exactly one question first, got {question:?}"
    );

    orchestrator.provide_user_response("blue");
    runner.await.unwrap().unwrap();

    let seen = drain_until_completed(&mut events).await;
    assert!(!seen
        .iter()
        .any(|event| matches!(event, AgentEvent::Question { .. })));
    assert!(oracle
        .tool_result_texts()
        .iter()
        .any(|text| text == "User answered: blue"));
}

#[tokio::test]
async fn stop_during_question_abandons_the_wait() {
    let oracle = RecordingOracle::new(vec![turn(vec![call(
        "c1",
        TOOL_ASK_USER,
        json!({ "question": "Proceed?" }),
    )])]);
    let (orchestrator, mut events, client) =
        harness(FakeBrowser::new(), oracle.clone(), fast_config());

    let runner = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.run("dangerous thing").await })
    };

    let question = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(question, AgentEvent::Question { .. }));

    orchestrator.stop();
    runner.await.unwrap().unwrap();

    let stopped = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(
        matches!(&stopped, AgentEvent::Message { role: EventRole::System, content }
            if content == "Instruction stopped."),
        "got {stopped:?}"
    );

    // The abandonment lands in the transcript after the oracle's last call,
    // so inspect the client directly.
    let transcript = client.transcript_snapshot().await;
    assert!(transcript
        .iter()
        .filter(|message| message.tool_call_id.is_some())
        .any(|message| message
            .text_content()
            .contains("stopped before the user answered")));
}

#[tokio::test]
async fn empty_turns_poll_again_instead_of_ending() {
    let oracle = RecordingOracle::new(vec![
        turn(Vec::new()),
        turn(vec![call("c1", TOOL_TASK_COMPLETED, json!({}))]),
    ]);
    let (orchestrator, mut events, _client) = harness(FakeBrowser::new(), oracle.clone(), fast_config());

    orchestrator.run("wait for the page").await.unwrap();
    drain_until_completed(&mut events).await;
    assert_eq!(oracle.calls(), 2);
}

#[tokio::test]
async fn second_run_while_busy_is_rejected() {
    let oracle = RecordingOracle::new(vec![turn(vec![call(
        "c1",
        TOOL_ASK_USER,
        json!({ "question": "Still there?" }),
    )])]);
    let (orchestrator, mut events, _client) = harness(FakeBrowser::new(), oracle, fast_config());

    let runner = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.run("first").await })
    };
    let _question = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();

    let err = orchestrator.run("second").await.unwrap_err();
    assert!(matches!(err, AgentError::Busy));

    let err = orchestrator.clear_context().await.unwrap_err();
    assert!(matches!(err, AgentError::Busy));

    orchestrator.stop();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn oracle_failure_emits_error_and_returns_it() {
    let oracle = RecordingOracle::new(Vec::new());
    let (orchestrator, mut events, _client) = harness(FakeBrowser::new(), oracle, fast_config());

    let err = orchestrator.run("anything").await.unwrap_err();
    assert!(matches!(err, AgentError::Oracle(_)));

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(event, AgentEvent::Error { .. }));
}

#[tokio::test]
async fn runs_out_of_steps_without_completion() {
    let oracle = RecordingOracle::new(vec![turn(vec![call(
        "c1",
        TOOL_NOTIFY_USER,
        json!({ "message": "still going" }),
    )])]);
    let (orchestrator, _events, _client) = harness(
        FakeBrowser::new(),
        oracle,
        fast_config().with_max_steps(1),
    );

    let err = orchestrator.run("never finishes").await.unwrap_err();
    assert!(matches!(err, AgentError::MaxSteps { steps: 1 }));
}

#[tokio::test]
async fn unknown_tool_calls_become_error_tool_results() {
    let oracle = RecordingOracle::new(vec![
        turn(vec![call("c1", "teleport_home", json!({}))]),
        turn(vec![call("c2", TOOL_TASK_COMPLETED, json!({}))]),
    ]);
    let (orchestrator, mut events, _client) = harness(FakeBrowser::new(), oracle.clone(), fast_config());

    orchestrator.run("weird model day").await.unwrap();
    drain_until_completed(&mut events).await;

    assert!(oracle
        .tool_result_texts()
        .iter()
        .any(|text| text.contains("unknown tool") && text.contains("teleport_home")));
}

#[tokio::test]
async fn element_lookups_append_descriptive_results() {
    let oracle = RecordingOracle::new(vec![
        turn(vec![
            call("c1", TOOL_FIND_ELEMENT, json!({ "query": "buy now" })),
            call("c2", TOOL_ELEMENT_DETAILS, json!({ "selector": "#buy" })),
        ]),
        turn(vec![call("c3", TOOL_TASK_COMPLETED, json!({}))]),
    ]);
    let (orchestrator, mut events, _client) =
        harness(FakeBrowser::new(), oracle.clone(), fast_config());

    orchestrator.run("find the buy button").await.unwrap();
    drain_until_completed(&mut events).await;

    let results = oracle.tool_result_texts();
    assert!(results[0].contains("no matching elements"), "got: {}", results[0]);
    assert!(
        results[1].contains("no element matches that selector"),
        "got: {}",
        results[1]
    );
}

#[tokio::test]
async fn stop_is_idempotent_and_orchestrator_is_reusable() {
    let oracle = RecordingOracle::new(vec![turn(vec![call(
        "c1",
        TOOL_TASK_COMPLETED,
        json!({ "summary": "done" }),
    )])]);
    let (orchestrator, mut events, _client) = harness(FakeBrowser::new(), oracle, fast_config());

    orchestrator.stop();
    orchestrator.stop();

    // A cancelled token from before must not poison the next run.
    orchestrator.run("quick task").await.unwrap();
    let seen = drain_until_completed(&mut events).await;
    assert!(matches!(seen.last(), Some(AgentEvent::Completed)));

    orchestrator.clear_context().await.unwrap();
}
