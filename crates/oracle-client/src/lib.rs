//! Decision oracle client.
//!
//! The oracle is the model that looks at page observations and decides what
//! the agent does next. This crate keeps the conversation transcript, turns
//! raw tool calls into typed actions, and talks to an OpenAI-compatible
//! chat-completions backend.

pub mod actions;
pub mod client;
pub mod errors;
pub mod openai;
pub mod scripted;
pub mod transcript;

pub use actions::{parse_tool_call, tool_specs, ActionParseError, AgentAction, ToolCallWire};
pub use client::{DecidedAction, DecisionOracle, OracleClient, OracleTurn};
pub use errors::OracleError;
pub use openai::{OpenAiConfig, OpenAiOracle};
pub use scripted::ScriptedOracle;
pub use transcript::{ContentPart, MessageRole, Transcript, TranscriptMessage};
