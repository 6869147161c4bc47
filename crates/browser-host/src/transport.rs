//! CDP transport: owns the websocket connection and an optional launched
//! Chromium child, and multiplexes commands/events over it.

use std::collections::HashMap;
use std::convert::TryInto;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::async_process::Child;
use chromiumoxide::browser::BrowserConfig as OxideBrowserConfig;
use chromiumoxide::cdp::browser_protocol::target::SessionId as CdpSessionId;
use chromiumoxide::cdp::events::CdpEventMessage;
use chromiumoxide::conn::Connection;
use chromiumoxide::error::CdpError;
use chromiumoxide_types::{CallId, CdpJsonEventMessage, Message, Response};
use futures::io::{AsyncBufReadExt, BufReader};
use futures::stream::StreamExt;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::BrowserConfig;
use crate::errors::{BrowserError, BrowserErrorKind};

/// How long a freshly launched Chromium gets to announce its devtools url.
const LAUNCH_DEADLINE: Duration = Duration::from_secs(20);

/// Raw CDP event as it came off the wire.
#[derive(Clone, Debug)]
pub struct TransportEvent {
    pub method: String,
    pub params: Value,
    pub session_id: Option<String>,
}

/// Whether a command is addressed to the browser itself or a flat session.
#[derive(Clone, Debug)]
pub enum CommandTarget {
    Browser,
    Session(String),
}

#[async_trait]
pub trait CdpTransport: Send + Sync {
    async fn start(&self) -> Result<(), BrowserError>;
    async fn next_event(&self) -> Option<TransportEvent>;
    async fn send_command(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, BrowserError>;
}

/// Transport that is never connected. Useful as a placeholder in wiring code.
#[derive(Default)]
pub struct NoopTransport;

#[async_trait]
impl CdpTransport for NoopTransport {
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
        _params: Value,
    ) -> Result<Value, BrowserError> {
        Err(BrowserError::new(BrowserErrorKind::Internal)
            .with_hint(format!("transport not available for method {method}")))
    }
}

/// Production transport backed by chromiumoxide's low-level connection.
///
/// The wire (driver task, launched child) comes up lazily on first use and is
/// rebuilt if the driver dies.
pub struct ChromiumTransport {
    cfg: BrowserConfig,
    wire: Mutex<Option<Arc<Wire>>>,
}

impl ChromiumTransport {
    pub fn new(cfg: BrowserConfig) -> Self {
        Self {
            cfg,
            wire: Mutex::new(None),
        }
    }

    async fn wire(&self) -> Result<Arc<Wire>, BrowserError> {
        let mut guard = self.wire.lock().await;
        if let Some(wire) = guard.as_ref() {
            if wire.is_alive() {
                return Ok(wire.clone());
            }
            debug!(target: "browser-host", "cdp wire is dead, reconnecting");
        }

        let wire = Arc::new(Wire::connect(&self.cfg).await?);
        *guard = Some(wire.clone());
        Ok(wire)
    }

    fn deadline(&self) -> Duration {
        Duration::from_millis(self.cfg.command_deadline_ms)
    }
}

#[async_trait]
impl CdpTransport for ChromiumTransport {
    async fn start(&self) -> Result<(), BrowserError> {
        let wire = self.wire().await?;
        let setup = [
            ("Target.setDiscoverTargets", json!({ "discover": true })),
            (
                "Target.setAutoAttach",
                json!({
                    "autoAttach": true,
                    "waitForDebuggerOnStart": false,
                    "flatten": true,
                }),
            ),
        ];
        for (method, params) in setup {
            wire.send(None, method, params, self.deadline()).await?;
        }
        Ok(())
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        match self.wire().await {
            Ok(wire) => wire.next_event().await,
            Err(err) => {
                warn!(target: "browser-host", ?err, "transport not ready");
                None
            }
        }
    }

    async fn send_command(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, BrowserError> {
        let session = match target {
            CommandTarget::Browser => None,
            CommandTarget::Session(id) => Some(id),
        };
        let wire = self.wire().await?;
        wire.send(session, method, params, self.deadline()).await
    }
}

struct WireCommand {
    session: Option<String>,
    method: String,
    params: Value,
    reply: oneshot::Sender<Result<Value, BrowserError>>,
}

/// One live connection: the driver task plus the channels into it.
struct Wire {
    commands: mpsc::UnboundedSender<WireCommand>,
    events: Mutex<mpsc::UnboundedReceiver<TransportEvent>>,
    driver: JoinHandle<()>,
    child: std::sync::Mutex<Option<Child>>,
    alive: Arc<AtomicBool>,
}

impl Wire {
    async fn connect(cfg: &BrowserConfig) -> Result<Self, BrowserError> {
        let (child, ws_url) = match cfg.websocket_url.clone() {
            Some(url) => (None, url),
            None => {
                let mut child = launch_config(cfg)?.launch().map_err(|err| {
                    BrowserError::new(BrowserErrorKind::Internal)
                        .with_hint(format!("failed to launch chromium: {err}"))
                })?;
                let url = devtools_ws_url(&mut child).await?;
                (Some(child), url)
            }
        };

        let conn = Connection::<CdpEventMessage>::connect(&ws_url)
            .await
            .map_err(|err| BrowserError::new(BrowserErrorKind::CdpIo).with_hint(err.to_string()))?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let alive = Arc::new(AtomicBool::new(true));

        let ping_every = match cfg.heartbeat_interval_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };
        let driver_alive = alive.clone();
        let driver = tokio::spawn(async move {
            drive(conn, command_rx, event_tx, ping_every).await;
            driver_alive.store(false, Ordering::Relaxed);
        });

        info!(target: "browser-host", url = %ws_url, "chromium connection established");

        Ok(Self {
            commands: command_tx,
            events: Mutex::new(event_rx),
            driver,
            child: std::sync::Mutex::new(child),
            alive,
        })
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    async fn send(
        &self,
        session: Option<String>,
        method: &str,
        params: Value,
        deadline: Duration,
    ) -> Result<Value, BrowserError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(WireCommand {
                session,
                method: method.to_string(),
                params,
                reply: reply_tx,
            })
            .map_err(|_| {
                BrowserError::new(BrowserErrorKind::CdpIo).with_hint("cdp wire has shut down")
            })?;

        match tokio::time::timeout(deadline, reply_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(BrowserError::new(BrowserErrorKind::CdpIo)
                .with_hint("command dropped while the wire was closing")),
            Err(_) => Err(BrowserError::new(BrowserErrorKind::Timeout)
                .with_hint(format!("{method} timed out"))
                .retriable(true)),
        }
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        self.events.lock().await.recv().await
    }
}

impl Drop for Wire {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Relaxed);
        self.driver.abort();

        let child = self.child.lock().ok().and_then(|mut guard| guard.take());
        if let Some(mut child) = child {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(err) = child.kill().await {
                            warn!(target: "browser-host", ?err, "failed to kill chromium child");
                        }
                    });
                }
                Err(_) => {
                    debug!(target: "browser-host", "no runtime left to kill chromium child");
                }
            }
        }
    }
}

/// Single-owner loop over the connection. Routes responses back to waiting
/// callers, forwards events, and sends a periodic keep-alive ping so an idle
/// browser does not drop the socket.
async fn drive(
    mut conn: Connection<CdpEventMessage>,
    mut commands: mpsc::UnboundedReceiver<WireCommand>,
    events: mpsc::UnboundedSender<TransportEvent>,
    ping_every: Option<Duration>,
) {
    let mut pending: HashMap<CallId, oneshot::Sender<Result<Value, BrowserError>>> = HashMap::new();
    let mut pings: Vec<CallId> = Vec::new();

    let mut ping = interval(ping_every.unwrap_or(Duration::from_secs(86_400)));
    ping.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let exit_error = loop {
        tokio::select! {
            cmd = commands.recv() => {
                let Some(cmd) = cmd else {
                    break None;
                };
                let session = cmd.session.map(CdpSessionId::from);
                match conn.submit_command(cmd.method.into(), session, cmd.params) {
                    Ok(call_id) => {
                        pending.insert(call_id, cmd.reply);
                    }
                    Err(err) => {
                        let _ = cmd.reply.send(Err(map_cdp_error(CdpError::Serde(err))));
                    }
                }
            }
            _ = ping.tick(), if ping_every.is_some() => {
                match conn.submit_command("Browser.getVersion".into(), None, json!({})) {
                    Ok(call_id) => pings.push(call_id),
                    Err(err) => {
                        break Some(map_cdp_error(CdpError::Serde(err)));
                    }
                }
            }
            frame = conn.next() => {
                match frame {
                    Some(Ok(Message::Response(resp))) => {
                        if let Some(at) = pings.iter().position(|id| *id == resp.id) {
                            pings.swap_remove(at);
                            debug!(target: "browser-host", "keep-alive acknowledged");
                        } else if let Some(reply) = pending.remove(&resp.id) {
                            let _ = reply.send(unpack_response(resp));
                        }
                    }
                    Some(Ok(Message::Event(event))) => {
                        match decode_event(event) {
                            Ok(payload) => {
                                if events.send(payload).is_err() {
                                    break None;
                                }
                            }
                            Err(err) => {
                                warn!(target: "browser-host", ?err, "undecodable cdp event");
                            }
                        }
                    }
                    Some(Err(err)) => {
                        break Some(map_cdp_error(err));
                    }
                    None => {
                        break Some(
                            BrowserError::new(BrowserErrorKind::CdpIo)
                                .with_hint("cdp connection closed"),
                        );
                    }
                }
            }
        }
    };

    if let Some(err) = exit_error {
        warn!(target: "browser-host", %err, "cdp wire shut down");
        for (_, reply) in pending.drain() {
            let _ = reply.send(Err(err.clone()));
        }
    }
}

fn decode_event(event: CdpEventMessage) -> Result<TransportEvent, BrowserError> {
    let raw: CdpJsonEventMessage = event.try_into().map_err(|err| {
        BrowserError::new(BrowserErrorKind::Internal)
            .with_hint(format!("failed to decode cdp event: {err}"))
    })?;
    Ok(TransportEvent {
        method: raw.method.into_owned(),
        params: raw.params,
        session_id: raw.session_id,
    })
}

fn unpack_response(resp: Response) -> Result<Value, BrowserError> {
    match (resp.result, resp.error) {
        (Some(result), _) => Ok(result),
        (None, Some(error)) => Err(BrowserError::new(BrowserErrorKind::CdpIo)
            .with_hint(format!("cdp error {}: {}", error.code, error.message))
            .retriable(error.code >= 500)),
        (None, None) => {
            Err(BrowserError::new(BrowserErrorKind::Internal).with_hint("empty cdp response"))
        }
    }
}

fn map_cdp_error(err: CdpError) -> BrowserError {
    let hint = err.to_string();
    match err {
        CdpError::Timeout => BrowserError::new(BrowserErrorKind::Timeout)
            .with_hint(hint)
            .retriable(true),
        CdpError::FrameNotFound(_) | CdpError::JavascriptException(_) | CdpError::Serde(_) => {
            BrowserError::new(BrowserErrorKind::Internal).with_hint(hint)
        }
        _ => BrowserError::new(BrowserErrorKind::CdpIo)
            .with_hint(hint)
            .retriable(true),
    }
}

/// Build the chromiumoxide launch config: verified executable, a writable
/// profile dir, and only the launch flags autosurf actually needs.
fn launch_config(cfg: &BrowserConfig) -> Result<OxideBrowserConfig, BrowserError> {
    if !cfg.executable.as_os_str().is_empty() && !cfg.executable.exists() {
        return Err(BrowserError::new(BrowserErrorKind::CdpIo)
            .with_hint(format!(
                "chrome executable not found at {}",
                cfg.executable.display()
            ))
            .with_data(json!({
                "expected": cfg.executable,
                "hint": "Set AUTOSURF_CHROME to the full path of chrome/chromium.",
            })));
    }

    let profile_dir = match cfg.user_data_dir.is_absolute() {
        true => cfg.user_data_dir.clone(),
        false => std::env::current_dir()
            .map_err(|err| {
                BrowserError::new(BrowserErrorKind::Internal)
                    .with_hint(format!("failed to resolve cwd for user-data-dir: {err}"))
            })?
            .join(&cfg.user_data_dir),
    };
    fs::create_dir_all(&profile_dir).map_err(|err| {
        BrowserError::new(BrowserErrorKind::Internal)
            .with_hint(format!("failed to ensure user-data-dir: {err}"))
    })?;

    let mut args = vec![
        "--no-first-run",
        "--no-default-browser-check",
        "--disable-extensions",
        "--disable-popup-blocking",
        "--disable-dev-shm-usage",
        "--remote-allow-origins=*",
    ];
    if cfg.headless {
        args.extend(["--headless=new", "--hide-scrollbars", "--mute-audio"]);
    }

    let mut builder = OxideBrowserConfig::builder()
        .request_timeout(Duration::from_millis(cfg.command_deadline_ms))
        .launch_timeout(LAUNCH_DEADLINE)
        .user_data_dir(profile_dir)
        .args(args);
    if !cfg.headless {
        builder = builder.with_head();
    }
    if std::env::var("AUTOSURF_NO_SANDBOX")
        .map(|v| v != "0" && !v.is_empty())
        .unwrap_or(false)
    {
        builder = builder.no_sandbox();
    }
    if !cfg.executable.as_os_str().is_empty() {
        builder = builder.chrome_executable(cfg.executable.clone());
    }

    builder.build().map_err(|err| {
        BrowserError::new(BrowserErrorKind::Internal)
            .with_hint(format!("browser config error: {err}"))
    })
}

/// Wait for the launched child to print its devtools websocket url.
async fn devtools_ws_url(child: &mut Child) -> Result<String, BrowserError> {
    let stderr = child.stderr.take().ok_or_else(|| {
        BrowserError::new(BrowserErrorKind::Internal)
            .with_hint("launched chromium has no stderr handle")
    })?;
    let mut lines = BufReader::new(stderr).lines();

    let scan = async {
        let mut last = String::new();
        while let Some(line) = lines.next().await {
            let line = line.map_err(|err| {
                BrowserError::new(BrowserErrorKind::CdpIo).with_hint(err.to_string())
            })?;
            if let Some(url) = parse_ws_url_line(&line) {
                return Ok(url);
            }
            last = line;
        }
        Err(BrowserError::new(BrowserErrorKind::CdpIo).with_hint(format!(
            "chromium exited without announcing a devtools url (last stderr line: {last:?})"
        )))
    };

    tokio::time::timeout(LAUNCH_DEADLINE, scan)
        .await
        .map_err(|_| {
            BrowserError::new(BrowserErrorKind::Timeout)
                .with_hint("timed out waiting for chromium devtools websocket url")
        })?
}

fn parse_ws_url_line(line: &str) -> Option<String> {
    let (_, ws) = line.rsplit_once("listening on ")?;
    let ws = ws.trim();
    if ws.starts_with("ws") && ws.contains("devtools/browser") {
        Some(ws.to_string())
    } else {
        None
    }
}
