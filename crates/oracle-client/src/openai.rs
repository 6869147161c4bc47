//! OpenAI-compatible chat-completions backend with tool calling.

use std::env;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::actions::ToolCallWire;
use crate::client::{DecisionOracle, OracleTurn};
use crate::errors::OracleError;
use crate::transcript::{ContentPart, MessageRole, TranscriptMessage};

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    /// Tried in order; rotation happens on HTTP 429.
    pub api_keys: Vec<String>,
    pub model: String,
    pub api_base: String,
    pub temperature: f32,
    pub timeout: Duration,
}

impl OpenAiConfig {
    /// Read configuration from `AUTOSURF_API_KEY` (comma-separated),
    /// `AUTOSURF_MODEL`, and `AUTOSURF_API_BASE`.
    pub fn from_env() -> Result<Self, OracleError> {
        let raw_keys = env::var("AUTOSURF_API_KEY").map_err(|_| {
            OracleError::Unavailable("AUTOSURF_API_KEY is not set".to_string())
        })?;
        let api_keys: Vec<String> = raw_keys
            .split(',')
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(str::to_string)
            .collect();
        if api_keys.is_empty() {
            return Err(OracleError::Unavailable(
                "AUTOSURF_API_KEY is empty".to_string(),
            ));
        }
        Ok(Self {
            api_keys,
            model: env::var("AUTOSURF_MODEL").unwrap_or_else(|_| "gpt-4o".to_string()),
            api_base: env::var("AUTOSURF_API_BASE")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            temperature: 0.2,
            timeout: Duration::from_secs(120),
        })
    }
}

pub struct OpenAiOracle {
    client: Client,
    config: OpenAiConfig,
}

impl OpenAiOracle {
    pub fn new(config: OpenAiConfig) -> Result<Self, OracleError> {
        if config.api_keys.is_empty() {
            return Err(OracleError::Unavailable(
                "missing API key for decision oracle".to_string(),
            ));
        }
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| {
                OracleError::Unavailable(format!("failed to build HTTP client: {err}"))
            })?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl DecisionOracle for OpenAiOracle {
    async fn complete(
        &self,
        messages: &[TranscriptMessage],
        tools: &[Value],
    ) -> Result<OracleTurn, OracleError> {
        let url = format!(
            "{}/chat/completions",
            self.config.api_base.trim_end_matches('/')
        );
        let body = build_body(&self.config, messages, tools);

        let mut last_error: Option<OracleError> = None;
        for (index, key) in self.config.api_keys.iter().enumerate() {
            let response = self
                .client
                .post(&url)
                .bearer_auth(key)
                .json(&body)
                .send()
                .await;

            let response = match response {
                Ok(resp) => resp,
                Err(err) => {
                    last_error = Some(OracleError::Unavailable(format!(
                        "oracle request failed: {err}"
                    )));
                    continue;
                }
            };

            if !response.status().is_success() {
                let status = response.status();
                let text = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "<response unavailable>".to_string());
                if status.as_u16() == 429 && index + 1 < self.config.api_keys.len() {
                    let friendly = rate_limit_message(&text);
                    warn!(
                        target: "oracle",
                        message = %friendly,
                        attempt = index + 1,
                        remaining = self.config.api_keys.len() - index - 1,
                        "oracle rate limited; switching API key"
                    );
                    last_error = Some(OracleError::Unavailable(friendly));
                    continue;
                }
                return Err(OracleError::Unavailable(format!(
                    "oracle returned {status}: {text}"
                )));
            }

            let response: ChatCompletionResponse = response.json().await.map_err(|err| {
                OracleError::InvalidResponse(format!("oracle response invalid: {err}"))
            })?;

            let choice = response.choices.into_iter().next().ok_or_else(|| {
                OracleError::InvalidResponse("oracle response has no choices".to_string())
            })?;

            let assistant_text = choice.message.content.and_then(|content| content.as_text());
            let tool_calls = choice
                .message
                .tool_calls
                .unwrap_or_default()
                .into_iter()
                .map(|call| ToolCallWire {
                    id: call.id,
                    name: call.function.name,
                    arguments: Value::String(call.function.arguments),
                })
                .collect();

            return Ok(OracleTurn {
                assistant_text,
                tool_calls,
            });
        }

        Err(last_error.unwrap_or_else(|| {
            OracleError::Unavailable("oracle request exhausted all API keys".to_string())
        }))
    }
}

/// Assemble the request body. Split out so transcripts-to-wire mapping is
/// testable without a live endpoint.
pub fn build_body(
    config: &OpenAiConfig,
    messages: &[TranscriptMessage],
    tools: &[Value],
) -> Value {
    let wire_messages: Vec<Value> = messages.iter().map(wire_message).collect();
    let mut body = json!({
        "model": config.model,
        "temperature": config.temperature,
        "messages": wire_messages,
    });
    if !tools.is_empty() {
        body["tools"] = Value::Array(tools.to_vec());
    }
    body
}

fn wire_message(message: &TranscriptMessage) -> Value {
    let mut out = json!({ "role": message.role.as_str() });

    let has_image = message
        .parts
        .iter()
        .any(|part| matches!(part, ContentPart::ImageJpeg(_)));

    if has_image {
        let parts: Vec<Value> = message
            .parts
            .iter()
            .map(|part| match part {
                ContentPart::Text(text) => json!({ "type": "text", "text": text }),
                ContentPart::ImageJpeg(encoded) => json!({
                    "type": "image_url",
                    "image_url": { "url": format!("data:image/jpeg;base64,{encoded}") },
                }),
            })
            .collect();
        out["content"] = Value::Array(parts);
    } else {
        out["content"] = Value::String(message.text_content());
    }

    if message.role == MessageRole::Tool {
        if let Some(call_id) = &message.tool_call_id {
            out["tool_call_id"] = Value::String(call_id.clone());
        }
    }

    if !message.tool_calls.is_empty() {
        let calls: Vec<Value> = message
            .tool_calls
            .iter()
            .map(|call| {
                let arguments = match &call.arguments {
                    Value::String(encoded) => encoded.clone(),
                    other => other.to_string(),
                };
                json!({
                    "id": call.id,
                    "type": "function",
                    "function": { "name": call.name, "arguments": arguments },
                })
            })
            .collect();
        out["tool_calls"] = Value::Array(calls);
    }

    out
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatCompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChoice {
    message: ChatCompletionMessage,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionMessage {
    #[serde(default)]
    content: Option<ChatCompletionContent>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ChatCompletionContent {
    Text(String),
    Parts(Vec<ChatCompletionPart>),
}

impl ChatCompletionContent {
    fn as_text(self) -> Option<String> {
        match self {
            ChatCompletionContent::Text(value) => {
                if value.is_empty() {
                    None
                } else {
                    Some(value)
                }
            }
            ChatCompletionContent::Parts(parts) => {
                let text = parts
                    .into_iter()
                    .filter_map(|part| part.text)
                    .collect::<Vec<_>>()
                    .join("\n");
                if text.is_empty() {
                    None
                } else {
                    Some(text)
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionPart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunctionCall,
}

#[derive(Debug, Deserialize)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorMessage,
}

#[derive(Debug, Deserialize)]
struct ErrorMessage {
    message: Option<String>,
}

fn rate_limit_message(raw: &str) -> String {
    if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(raw) {
        if let Some(message) = envelope.error.message {
            return format!("oracle rate limit exceeded: {}", message.trim());
        }
    }
    "oracle rate limit exceeded; retry later or add API keys".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::tool_specs;

    fn test_config() -> OpenAiConfig {
        OpenAiConfig {
            api_keys: vec!["k".to_string()],
            model: "gpt-4o".to_string(),
            api_base: "https://api.openai.com/v1".to_string(),
            temperature: 0.2,
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn text_only_messages_use_string_content() {
        let messages = vec![TranscriptMessage::text(MessageRole::System, "frame")];
        let body = build_body(&test_config(), &messages, &tool_specs());
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], "frame");
        assert!(body["tools"].as_array().is_some());
    }

    #[test]
    fn image_parts_become_data_urls() {
        let messages = vec![TranscriptMessage::with_parts(
            MessageRole::User,
            vec![
                ContentPart::Text("page state".to_string()),
                ContentPart::ImageJpeg("aGk=".to_string()),
            ],
        )];
        let body = build_body(&test_config(), &messages, &[]);
        let parts = body["messages"][0]["content"].as_array().unwrap();
        assert_eq!(parts[0]["type"], "text");
        assert_eq!(parts[1]["type"], "image_url");
        assert_eq!(
            parts[1]["image_url"]["url"],
            "data:image/jpeg;base64,aGk="
        );
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn assistant_tool_calls_round_trip_to_wire_shape() {
        let messages = vec![
            TranscriptMessage::assistant_turn(
                None,
                vec![ToolCallWire {
                    id: "call_1".to_string(),
                    name: "notify_user".to_string(),
                    arguments: json!({ "message": "hi" }),
                }],
            ),
            TranscriptMessage::tool_result("call_1", "delivered"),
        ];
        let body = build_body(&test_config(), &messages, &[]);

        let call = &body["messages"][0]["tool_calls"][0];
        assert_eq!(call["id"], "call_1");
        assert_eq!(call["type"], "function");
        assert_eq!(call["function"]["name"], "notify_user");
        assert_eq!(
            call["function"]["arguments"],
            "{\"message\":\"hi\"}"
        );

        assert_eq!(body["messages"][1]["role"], "tool");
        assert_eq!(body["messages"][1]["tool_call_id"], "call_1");
        assert_eq!(body["messages"][1]["content"], "delivered");
    }

    #[test]
    fn parses_tool_call_responses() {
        let raw = json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_7",
                        "type": "function",
                        "function": {
                            "name": "execute_code",
                            "arguments": "{\"code\": \"await page.click('#go')\"}",
                        },
                    }],
                },
            }],
        });
        let parsed: ChatCompletionResponse = serde_json::from_value(raw).unwrap();
        let message = &parsed.choices[0].message;
        assert!(message.content.is_none());
        let calls = message.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].id, "call_7");
        assert_eq!(calls[0].function.name, "execute_code");
    }
}
