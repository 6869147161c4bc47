//! Live browser session: page registry, surface bindings, script evaluation,
//! screenshots, and console capture.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use autosurf_core_types::{LogSeverity, PageId, SurfaceId};

use crate::config::BrowserConfig;
use crate::errors::{BrowserError, BrowserErrorKind};
use crate::transport::{CdpTransport, CommandTarget, TransportEvent};

/// A console call captured from some page, fanned out to subscribers.
#[derive(Clone, Debug)]
pub struct ConsoleMessage {
    pub page: PageId,
    pub severity: LogSeverity,
    pub values: Vec<Value>,
}

#[derive(Clone, Debug)]
struct PageContext {
    target_id: String,
    cdp_session: Option<String>,
    recent_url: String,
    opened_seq: u64,
}

/// Owns the transport plus all bookkeeping for open pages and bound surfaces.
///
/// One session per browser process. All registries are concurrent maps so
/// the event pump and callers never contend on a single lock.
pub struct BrowserSession {
    cfg: BrowserConfig,
    transport: Arc<dyn CdpTransport>,
    pages: DashMap<PageId, PageContext>,
    targets: DashMap<String, PageId>,
    sessions: DashMap<String, PageId>,
    surfaces: DashMap<SurfaceId, String>,
    console_tx: broadcast::Sender<ConsoleMessage>,
    open_seq: AtomicU64,
    shutdown: CancellationToken,
    pump: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl BrowserSession {
    pub fn new(cfg: BrowserConfig, transport: Arc<dyn CdpTransport>) -> Arc<Self> {
        let (console_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            cfg,
            transport,
            pages: DashMap::new(),
            targets: DashMap::new(),
            sessions: DashMap::new(),
            surfaces: DashMap::new(),
            console_tx,
            open_seq: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            pump: std::sync::Mutex::new(None),
        })
    }

    pub fn config(&self) -> &BrowserConfig {
        &self.cfg
    }

    /// Connect the transport and start pumping CDP events into the registry.
    pub async fn start(self: &Arc<Self>) -> Result<(), BrowserError> {
        self.transport.start().await?;

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = this.shutdown.cancelled() => break,
                    event = this.transport.next_event() => {
                        match event {
                            Some(event) => this.handle_event(event).await,
                            None => {
                                debug!(target: "browser-host", "event stream ended");
                                break;
                            }
                        }
                    }
                }
            }
        });

        if let Ok(mut guard) = self.pump.lock() {
            *guard = Some(handle);
        }
        Ok(())
    }

    pub(crate) async fn handle_event(&self, event: TransportEvent) {
        match event.method.as_str() {
            "Target.targetCreated" | "Target.targetInfoChanged" => {
                self.upsert_target(&event.params);
            }
            "Target.attachedToTarget" => {
                self.handle_attached(&event.params).await;
            }
            "Target.detachedFromTarget" => {
                if let Some(session_id) = event.params.get("sessionId").and_then(Value::as_str) {
                    if let Some((_, page)) = self.sessions.remove(session_id) {
                        if let Some(mut ctx) = self.pages.get_mut(&page) {
                            ctx.cdp_session = None;
                        }
                    }
                }
            }
            "Target.targetDestroyed" => {
                if let Some(target_id) = event.params.get("targetId").and_then(Value::as_str) {
                    if let Some((_, page)) = self.targets.remove(target_id) {
                        self.pages.remove(&page);
                        self.sessions.retain(|_, mapped| *mapped != page);
                        debug!(target: "browser-host", %page, "page closed");
                    }
                }
            }
            "Runtime.consoleAPICalled" => {
                self.handle_console(&event);
            }
            _ => {}
        }
    }

    fn upsert_target(&self, params: &Value) {
        let Some(info) = params.get("targetInfo") else {
            return;
        };
        if info.get("type").and_then(Value::as_str) != Some("page") {
            return;
        }
        let Some(target_id) = info.get("targetId").and_then(Value::as_str) else {
            return;
        };
        let url = info
            .get("url")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        if let Some(page) = self.targets.get(target_id) {
            if let Some(mut ctx) = self.pages.get_mut(&page) {
                ctx.recent_url = url;
            }
            return;
        }

        let page = PageId::new();
        let seq = self.open_seq.fetch_add(1, Ordering::Relaxed);
        self.targets.insert(target_id.to_string(), page);
        self.pages.insert(
            page,
            PageContext {
                target_id: target_id.to_string(),
                cdp_session: None,
                recent_url: url,
                opened_seq: seq,
            },
        );
        debug!(target: "browser-host", %page, target_id, "page registered");
    }

    async fn handle_attached(&self, params: &Value) {
        self.upsert_target(params);

        let Some(session_id) = params.get("sessionId").and_then(Value::as_str) else {
            return;
        };
        let Some(target_id) = params
            .pointer("/targetInfo/targetId")
            .and_then(Value::as_str)
        else {
            return;
        };
        let Some(page) = self.targets.get(target_id).map(|entry| *entry) else {
            return;
        };

        self.sessions.insert(session_id.to_string(), page);
        if let Some(mut ctx) = self.pages.get_mut(&page) {
            ctx.cdp_session = Some(session_id.to_string());
        }

        // Console capture and page lifecycle events need these domains on.
        for method in ["Runtime.enable", "Page.enable"] {
            if let Err(err) = self
                .transport
                .send_command(
                    CommandTarget::Session(session_id.to_string()),
                    method,
                    json!({}),
                )
                .await
            {
                warn!(target: "browser-host", %page, method, ?err, "failed to enable domain");
            }
        }
    }

    fn handle_console(&self, event: &TransportEvent) {
        let Some(session_id) = event.session_id.as_deref() else {
            return;
        };
        let Some(page) = self.sessions.get(session_id).map(|entry| *entry) else {
            return;
        };
        let kind = event
            .params
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("log");
        let Some(severity) = LogSeverity::from_console_type(kind) else {
            return;
        };

        let values = event
            .params
            .get("args")
            .and_then(Value::as_array)
            .map(|args| args.iter().map(remote_object_value).collect())
            .unwrap_or_default();

        // No receivers means no instruction is running; drop the entry.
        let _ = self.console_tx.send(ConsoleMessage {
            page,
            severity,
            values,
        });
    }

    pub fn subscribe_console(&self) -> broadcast::Receiver<ConsoleMessage> {
        self.console_tx.subscribe()
    }

    /// Open pages in the order they were created.
    pub fn pages(&self) -> Vec<PageId> {
        let mut entries: Vec<(u64, PageId)> = self
            .pages
            .iter()
            .map(|entry| (entry.opened_seq, *entry.key()))
            .collect();
        entries.sort();
        entries.into_iter().map(|(_, page)| page).collect()
    }

    pub fn has_page(&self, page: PageId) -> bool {
        self.pages.contains_key(&page)
    }

    pub fn recent_url(&self, page: PageId) -> Option<String> {
        self.pages.get(&page).map(|ctx| ctx.recent_url.clone())
    }

    fn session_for(&self, page: PageId) -> Result<String, BrowserError> {
        let ctx = self.pages.get(&page).ok_or_else(|| {
            BrowserError::new(BrowserErrorKind::PageUnavailable)
                .with_hint(format!("unknown page {page}"))
        })?;
        ctx.cdp_session.clone().ok_or_else(|| {
            BrowserError::new(BrowserErrorKind::PageUnavailable)
                .with_hint(format!("page {page} has no attached cdp session"))
                .retriable(true)
        })
    }

    /// Evaluate an expression in the page's main world and return its value.
    ///
    /// Promises are awaited. A thrown exception maps to `ExecutionFailed`
    /// with the exception description as the hint.
    pub async fn evaluate(&self, page: PageId, expression: &str) -> Result<Value, BrowserError> {
        let session = self.session_for(page)?;
        self.evaluate_in_session(&session, expression).await
    }

    /// Evaluate an expression in the browsing context bound to a surface.
    pub async fn evaluate_on_surface(
        &self,
        surface: SurfaceId,
        expression: &str,
    ) -> Result<Value, BrowserError> {
        let target_id = self
            .surfaces
            .get(&surface)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                BrowserError::new(BrowserErrorKind::Internal)
                    .with_hint(format!("surface {surface} is not bound"))
            })?;
        let page = self.targets.get(&target_id).map(|entry| *entry).ok_or_else(|| {
            BrowserError::new(BrowserErrorKind::PageUnavailable)
                .with_hint(format!("surface {surface} target is gone"))
                .retriable(true)
        })?;
        let session = self.session_for(page)?;
        self.evaluate_in_session(&session, expression).await
    }

    async fn evaluate_in_session(
        &self,
        session: &str,
        expression: &str,
    ) -> Result<Value, BrowserError> {
        let result = self
            .transport
            .send_command(
                CommandTarget::Session(session.to_string()),
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "awaitPromise": true,
                    "returnByValue": true,
                    "userGesture": true,
                }),
            )
            .await?;

        if let Some(details) = result.get("exceptionDetails") {
            let description = details
                .pointer("/exception/description")
                .or_else(|| details.get("text"))
                .and_then(Value::as_str)
                .unwrap_or("script threw an exception")
                .to_string();
            return Err(BrowserError::new(BrowserErrorKind::ExecutionFailed)
                .with_hint(description)
                .with_data(details.clone()));
        }

        Ok(result
            .pointer("/result/value")
            .cloned()
            .unwrap_or(Value::Null))
    }

    /// Capture a JPEG screenshot of the whole page, not just the viewport.
    pub async fn screenshot_jpeg(
        &self,
        page: PageId,
        quality: u8,
    ) -> Result<Vec<u8>, BrowserError> {
        let session = self.session_for(page)?;
        let result = self
            .transport
            .send_command(
                CommandTarget::Session(session),
                "Page.captureScreenshot",
                json!({
                    "format": "jpeg",
                    "quality": quality.min(100),
                    "captureBeyondViewport": true,
                }),
            )
            .await
            .map_err(|err| {
                BrowserError::new(BrowserErrorKind::ObservationFailed)
                    .with_hint(err.to_string())
                    .retriable(err.retriable)
            })?;

        let encoded = result
            .get("data")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                BrowserError::new(BrowserErrorKind::ObservationFailed)
                    .with_hint("screenshot response missing data")
            })?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|err| {
                BrowserError::new(BrowserErrorKind::ObservationFailed)
                    .with_hint(format!("screenshot base64 decode failed: {err}"))
            })
    }

    /// Open a new page (tab) and wait for it to attach.
    pub async fn create_page(&self, url: &str) -> Result<(PageId, String), BrowserError> {
        let result = self
            .transport
            .send_command(
                CommandTarget::Browser,
                "Target.createTarget",
                json!({ "url": url }),
            )
            .await?;
        let target_id = result
            .get("targetId")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                BrowserError::new(BrowserErrorKind::Internal)
                    .with_hint("createTarget response missing targetId")
            })?
            .to_string();

        // Attachment arrives over the event stream; auto-attach is on.
        let page = self.wait_for_target(&target_id).await?;
        self.wait_for_page_session(page).await?;
        Ok((page, target_id))
    }

    /// Associate a surface handle with the target that hosts it.
    pub fn bind_surface(&self, surface: SurfaceId, target_id: impl Into<String>) {
        self.surfaces.insert(surface, target_id.into());
    }

    /// Register a page directly, bypassing the event stream.
    pub fn register_page(&self, page: PageId, target_id: &str, session_id: Option<&str>) {
        let seq = self.open_seq.fetch_add(1, Ordering::Relaxed);
        self.targets.insert(target_id.to_string(), page);
        if let Some(session_id) = session_id {
            self.sessions.insert(session_id.to_string(), page);
        }
        self.pages.insert(
            page,
            PageContext {
                target_id: target_id.to_string(),
                cdp_session: session_id.map(str::to_string),
                recent_url: String::new(),
                opened_seq: seq,
            },
        );
    }

    async fn wait_for_target(&self, target_id: &str) -> Result<PageId, BrowserError> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(page) = self.targets.get(target_id).map(|entry| *entry) {
                return Ok(page);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(BrowserError::new(BrowserErrorKind::Timeout)
                    .with_hint(format!("target {target_id} never appeared"))
                    .retriable(true));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Wait until the page has an attached CDP session.
    pub async fn wait_for_page_session(&self, page: PageId) -> Result<String, BrowserError> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            match self.session_for(page) {
                Ok(session) => return Ok(session),
                Err(err) if !matches!(err.kind, BrowserErrorKind::PageUnavailable) => {
                    return Err(err)
                }
                Err(err) => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(err);
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Stop the event pump and ask the browser to shut down.
    pub async fn close(&self) {
        self.shutdown.cancel();
        if let Err(err) = self
            .transport
            .send_command(CommandTarget::Browser, "Browser.close", json!({}))
            .await
        {
            debug!(target: "browser-host", ?err, "browser close command failed");
        }
        let handle = self.pump.lock().ok().and_then(|mut guard| guard.take());
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

/// Collapse a CDP RemoteObject into a plain JSON value for log capture.
fn remote_object_value(arg: &Value) -> Value {
    if let Some(value) = arg.get("value") {
        return value.clone();
    }
    if let Some(description) = arg.get("description").and_then(Value::as_str) {
        return Value::String(description.to_string());
    }
    if let Some(kind) = arg.get("type").and_then(Value::as_str) {
        return Value::String(format!("<{kind}>"));
    }
    Value::Null
}
