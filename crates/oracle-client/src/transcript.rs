//! Conversation transcript kept across one instruction run.

use serde::{Deserialize, Serialize};

use crate::actions::ToolCallWire;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
        }
    }
}

/// One piece of message content. Observations mix text with an optional
/// viewport screenshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ContentPart {
    Text(String),
    /// Base64-encoded JPEG.
    ImageJpeg(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TranscriptMessage {
    pub role: MessageRole,
    pub parts: Vec<ContentPart>,
    /// Set on tool-result messages, echoing the call being answered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Set on assistant messages that requested tool calls.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tool_calls: Vec<ToolCallWire>,
}

impl TranscriptMessage {
    pub fn text(role: MessageRole, text: impl Into<String>) -> Self {
        Self {
            role,
            parts: vec![ContentPart::Text(text.into())],
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn with_parts(role: MessageRole, parts: Vec<ContentPart>) -> Self {
        Self {
            role,
            parts,
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Tool,
            parts: vec![ContentPart::Text(content.into())],
            tool_call_id: Some(call_id.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn assistant_turn(text: Option<String>, tool_calls: Vec<ToolCallWire>) -> Self {
        Self {
            role: MessageRole::Assistant,
            parts: text.map(ContentPart::Text).into_iter().collect(),
            tool_call_id: None,
            tool_calls,
        }
    }

    /// Concatenated text content, ignoring images.
    pub fn text_content(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text(text) => Some(text.as_str()),
                ContentPart::ImageJpeg(_) => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// The running conversation. The leading system framing is the anchor and
/// survives `clear`, everything after it is per-instruction history.
#[derive(Clone, Debug)]
pub struct Transcript {
    messages: Vec<TranscriptMessage>,
    anchor: usize,
}

impl Transcript {
    pub fn new(system_framing: impl Into<String>) -> Self {
        Self {
            messages: vec![TranscriptMessage::text(MessageRole::System, system_framing)],
            anchor: 1,
        }
    }

    pub fn push(&mut self, message: TranscriptMessage) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[TranscriptMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Drop all history, keeping the system framing.
    pub fn clear(&mut self) {
        self.messages.truncate(self.anchor);
    }
}
