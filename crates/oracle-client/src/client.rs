//! Oracle-facing client: owns the transcript and the decide round-trip.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::actions::{parse_tool_call, tool_specs, ActionParseError, AgentAction, ToolCallWire};
use crate::errors::OracleError;
use crate::transcript::{ContentPart, MessageRole, Transcript, TranscriptMessage};

/// One assistant turn as returned by the backend.
#[derive(Clone, Debug, Default)]
pub struct OracleTurn {
    pub assistant_text: Option<String>,
    pub tool_calls: Vec<ToolCallWire>,
}

/// Backend seam. Production uses the OpenAI-compatible client, tests use a
/// scripted oracle.
#[async_trait]
pub trait DecisionOracle: Send + Sync {
    async fn complete(
        &self,
        messages: &[TranscriptMessage],
        tools: &[Value],
    ) -> Result<OracleTurn, OracleError>;
}

/// A tool call paired with its parse outcome. Parsing failures are kept so
/// the caller can report them back to the oracle as tool results instead of
/// aborting the run.
#[derive(Clone, Debug)]
pub struct DecidedAction {
    pub call_id: String,
    pub action: Result<AgentAction, ActionParseError>,
}

pub struct OracleClient {
    oracle: Arc<dyn DecisionOracle>,
    transcript: Mutex<Transcript>,
}

impl OracleClient {
    pub fn new(oracle: Arc<dyn DecisionOracle>, system_framing: impl Into<String>) -> Self {
        Self {
            oracle,
            transcript: Mutex::new(Transcript::new(system_framing)),
        }
    }

    /// Record the user's instruction at the start of a run.
    pub async fn append_user_message(&self, text: impl Into<String>) {
        let mut transcript = self.transcript.lock().await;
        transcript.push(TranscriptMessage::text(MessageRole::User, text));
    }

    /// Record the outcome of a dispatched tool call.
    pub async fn append_tool_result(&self, call_id: impl Into<String>, content: impl Into<String>) {
        let mut transcript = self.transcript.lock().await;
        transcript.push(TranscriptMessage::tool_result(call_id, content));
    }

    /// Feed the current observation to the oracle and get the next actions.
    ///
    /// The observation and the assistant's reply both land in the transcript
    /// before this returns, so a crashed dispatch never loses the exchange.
    pub async fn next_actions(
        &self,
        observation: Vec<ContentPart>,
    ) -> Result<(Vec<DecidedAction>, Option<String>), OracleError> {
        let mut transcript = self.transcript.lock().await;
        transcript.push(TranscriptMessage::with_parts(MessageRole::User, observation));

        let turn = self
            .oracle
            .complete(transcript.messages(), &tool_specs())
            .await?;

        transcript.push(TranscriptMessage::assistant_turn(
            turn.assistant_text.clone(),
            turn.tool_calls.clone(),
        ));
        debug!(
            target: "oracle",
            calls = turn.tool_calls.len(),
            transcript_len = transcript.len(),
            "oracle turn recorded"
        );

        let decided = turn
            .tool_calls
            .iter()
            .map(|call| DecidedAction {
                call_id: call.id.clone(),
                action: parse_tool_call(call),
            })
            .collect();

        Ok((decided, turn.assistant_text))
    }

    /// Forget the conversation, keeping only the system framing.
    pub async fn clear_context(&self) {
        let mut transcript = self.transcript.lock().await;
        transcript.clear();
    }

    pub async fn context_len(&self) -> usize {
        self.transcript.lock().await.len()
    }

    /// Copy of the current transcript, for inspection and persistence.
    pub async fn transcript_snapshot(&self) -> Vec<TranscriptMessage> {
        self.transcript.lock().await.messages().to_vec()
    }
}
