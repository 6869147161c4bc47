//! Typed actions the oracle can request, and the wire-level tool calls they
//! are parsed from.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

pub const TOOL_EXECUTE_CODE: &str = "execute_code";
pub const TOOL_ASK_USER: &str = "ask_question_to_user";
pub const TOOL_NOTIFY_USER: &str = "notify_user";
pub const TOOL_TASK_COMPLETED: &str = "task_completed";
pub const TOOL_FIND_ELEMENT: &str = "find_element";
pub const TOOL_ELEMENT_DETAILS: &str = "get_element_details";

/// A tool call exactly as the backend emitted it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCallWire {
    pub id: String,
    pub name: String,
    /// Either a JSON object or a string holding encoded JSON; backends vary.
    pub arguments: Value,
}

#[derive(Clone, Debug, PartialEq)]
pub enum AgentAction {
    /// Run automation code on the page behind the surface.
    ExecuteCode {
        code: String,
        /// Short progress note for the user, shown before the code runs.
        feedback: Option<String>,
    },
    /// Pause the run until the user answers.
    AskUser { question: String },
    /// One-way progress message to the user.
    NotifyUser { message: String },
    /// The instruction is done.
    TaskComplete { summary: String },
    /// Look up elements by a natural-language query.
    FindElement { query: String },
    /// Inspect a specific element by selector.
    GetElementDetails { selector: String },
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum ActionParseError {
    #[error("unknown tool {0:?}")]
    UnknownTool(String),
    #[error("bad arguments for {tool}: {reason}")]
    BadArguments { tool: String, reason: String },
}

/// Parse a wire tool call into a typed action.
pub fn parse_tool_call(call: &ToolCallWire) -> Result<AgentAction, ActionParseError> {
    let args = decode_arguments(&call.name, &call.arguments)?;
    let required = |key: &str| -> Result<String, ActionParseError> {
        args.get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ActionParseError::BadArguments {
                tool: call.name.clone(),
                reason: format!("missing string field {key:?}"),
            })
    };
    let optional = |key: &str| -> Option<String> {
        args.get(key)
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };

    match call.name.as_str() {
        TOOL_EXECUTE_CODE => Ok(AgentAction::ExecuteCode {
            code: required("code")?,
            feedback: optional("feedback"),
        }),
        TOOL_ASK_USER => Ok(AgentAction::AskUser {
            question: required("question")?,
        }),
        TOOL_NOTIFY_USER => Ok(AgentAction::NotifyUser {
            message: required("message")?,
        }),
        TOOL_TASK_COMPLETED => Ok(AgentAction::TaskComplete {
            summary: optional("summary").unwrap_or_else(|| "Task completed.".to_string()),
        }),
        TOOL_FIND_ELEMENT => Ok(AgentAction::FindElement {
            query: required("query")?,
        }),
        TOOL_ELEMENT_DETAILS => Ok(AgentAction::GetElementDetails {
            selector: required("selector")?,
        }),
        other => Err(ActionParseError::UnknownTool(other.to_string())),
    }
}

fn decode_arguments(tool: &str, raw: &Value) -> Result<Value, ActionParseError> {
    match raw {
        Value::Object(_) => Ok(raw.clone()),
        // Some backends double-encode arguments as a JSON string.
        Value::String(encoded) => {
            serde_json::from_str(encoded).map_err(|err| ActionParseError::BadArguments {
                tool: tool.to_string(),
                reason: format!("arguments are not valid JSON: {err}"),
            })
        }
        Value::Null => Ok(json!({})),
        _ => Err(ActionParseError::BadArguments {
            tool: tool.to_string(),
            reason: "arguments must be an object".to_string(),
        }),
    }
}

/// Tool declarations sent with every completion request.
pub fn tool_specs() -> Vec<Value> {
    vec![
        json!({
            "type": "function",
            "function": {
                "name": TOOL_EXECUTE_CODE,
                "description": "Run JavaScript automation code against the current page. The code runs in an async function receiving a `page` driver object (goto, url, title, click, type, text, waitForSelector). Console output is captured and returned.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "code": { "type": "string", "description": "JavaScript body to execute." },
                        "feedback": { "type": "string", "description": "One short sentence telling the user what this step does." },
                    },
                    "required": ["code"],
                },
            },
        }),
        json!({
            "type": "function",
            "function": {
                "name": TOOL_ASK_USER,
                "description": "Ask the user a question and wait for their answer before continuing. Use for missing credentials, ambiguous choices, or confirmation of risky steps.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "question": { "type": "string" },
                    },
                    "required": ["question"],
                },
            },
        }),
        json!({
            "type": "function",
            "function": {
                "name": TOOL_NOTIFY_USER,
                "description": "Send the user a progress update without pausing.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "message": { "type": "string" },
                    },
                    "required": ["message"],
                },
            },
        }),
        json!({
            "type": "function",
            "function": {
                "name": TOOL_TASK_COMPLETED,
                "description": "Declare the instruction finished. Always the last call of a run.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "summary": { "type": "string", "description": "What was accomplished." },
                    },
                },
            },
        }),
        json!({
            "type": "function",
            "function": {
                "name": TOOL_FIND_ELEMENT,
                "description": "Search the page for elements matching a natural-language description. Returns candidate selectors.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "query": { "type": "string" },
                    },
                    "required": ["query"],
                },
            },
        }),
        json!({
            "type": "function",
            "function": {
                "name": TOOL_ELEMENT_DETAILS,
                "description": "Inspect one element by CSS selector: tag, attributes, value, visibility.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "selector": { "type": "string" },
                    },
                    "required": ["selector"],
                },
            },
        }),
    ]
}
