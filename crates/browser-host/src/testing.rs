//! Shared test doubles for the browser layer.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::errors::BrowserError;
use crate::transport::{CdpTransport, CommandTarget, TransportEvent};

#[derive(Clone, Debug)]
pub(crate) struct RecordedCommand {
    pub target: CommandTarget,
    pub method: String,
    pub params: Value,
}

type CommandHandler =
    Box<dyn Fn(&RecordedCommand) -> Result<Value, BrowserError> + Send + Sync>;

/// Transport that replays queued responses in FIFO order and records every
/// command it sees. When the queue runs dry it answers with an empty object.
/// A handler can be installed instead for tests that need to react to the
/// command contents.
#[derive(Default)]
pub(crate) struct MockTransport {
    responses: Mutex<VecDeque<Result<Value, BrowserError>>>,
    commands: Mutex<Vec<RecordedCommand>>,
    events: Mutex<VecDeque<TransportEvent>>,
    handler: Mutex<Option<CommandHandler>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handler(
        handler: impl Fn(&RecordedCommand) -> Result<Value, BrowserError> + Send + Sync + 'static,
    ) -> Self {
        let transport = Self::default();
        *transport.handler.lock().expect("mock transport poisoned") = Some(Box::new(handler));
        transport
    }

    pub fn push_response(&self, response: Result<Value, BrowserError>) {
        self.responses
            .lock()
            .expect("mock transport poisoned")
            .push_back(response);
    }

    pub fn push_event(&self, event: TransportEvent) {
        self.events
            .lock()
            .expect("mock transport poisoned")
            .push_back(event);
    }

    pub fn recorded(&self) -> Vec<RecordedCommand> {
        self.commands
            .lock()
            .expect("mock transport poisoned")
            .clone()
    }
}

#[async_trait]
impl CdpTransport for MockTransport {
    async fn start(&self) -> Result<(), BrowserError> {
        Ok(())
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        self.events
            .lock()
            .expect("mock transport poisoned")
            .pop_front()
    }

    async fn send_command(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, BrowserError> {
        let command = RecordedCommand {
            target,
            method: method.to_string(),
            params,
        };
        self.commands
            .lock()
            .expect("mock transport poisoned")
            .push(command.clone());
        if let Some(handler) = self.handler.lock().expect("mock transport poisoned").as_ref() {
            return handler(&command);
        }
        self.responses
            .lock()
            .expect("mock transport poisoned")
            .pop_front()
            .unwrap_or_else(|| Ok(json!({})))
    }
}
