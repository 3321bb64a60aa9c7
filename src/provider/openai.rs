//! OpenAI-compatible chat-completions adapter.
//!
//! The reference implementation of the [`Provider`](super::Provider)
//! contract. Works against any endpoint speaking the OpenAI chat API
//! (OpenAI itself, Groq, Together, local inference servers). Translates the
//! uniform request into the vendor wire format, parses stringified tool-call
//! arguments back into JSON, and normalizes reasoning-token accounting.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::{ChatMessage, ChatRole, FinishReason, ToolCall, UsageDetails};

use super::{Provider, ProviderRequest, ProviderResponse};

/// Configuration for the HTTP adapter.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Registry name ("openai", "groq", ...).
    pub name: String,
    pub api_key: String,
    /// Base URL override for compatible endpoints.
    pub base_url: Option<String>,
    /// Default request timeout in seconds, overridable per request.
    pub timeout_secs: u64,
}

impl ProviderConfig {
    pub fn new(name: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            api_key: api_key.into(),
            base_url: None,
            timeout_secs: 30,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

fn build_http_client(timeout_secs: u64) -> Client {
    let timeout = Duration::from_secs(timeout_secs);

    // Some sandboxed macOS environments can panic during proxy auto-detection
    // in reqwest's default client builder. Fall back to no-proxy in that case.
    match catch_unwind(AssertUnwindSafe(|| {
        Client::builder().timeout(timeout).build()
    })) {
        Ok(Ok(client)) => client,
        Ok(Err(_)) | Err(_) => Client::builder()
            .no_proxy()
            .timeout(timeout)
            .build()
            .expect("Failed to create HTTP client"),
    }
}

/// OpenAI-compatible provider adapter.
pub struct OpenAiCompatProvider {
    config: ProviderConfig,
    http: Client,
}

impl OpenAiCompatProvider {
    const DEFAULT_BASE_URL: &'static str = "https://api.openai.com";

    pub fn new(config: ProviderConfig) -> Self {
        let http = build_http_client(config.timeout_secs);
        Self { config, http }
    }

    fn base_url(&self) -> &str {
        self.config
            .base_url
            .as_deref()
            .unwrap_or(Self::DEFAULT_BASE_URL)
    }
}

// Wire types.

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: WireFunction,
}

#[derive(Debug, Serialize)]
struct WireFunction {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: String,
    function: WireCallFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireCallFunction {
    name: String,
    /// Stringified JSON on the wire; parsed into a `Value` on the way in.
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    model: String,
    choices: Vec<WireChoice>,
    usage: WireUsage,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
    #[serde(default)]
    completion_tokens_details: Option<WireCompletionDetails>,
}

#[derive(Debug, Deserialize)]
struct WireCompletionDetails {
    #[serde(default)]
    reasoning_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    error: WireErrorDetail,
}

#[derive(Debug, Deserialize)]
struct WireErrorDetail {
    message: String,
}

fn role_name(role: ChatRole) -> &'static str {
    match role {
        ChatRole::System => "system",
        ChatRole::User => "user",
        ChatRole::Assistant => "assistant",
        ChatRole::Tool => "tool",
    }
}

fn to_wire_messages(system: Option<&str>, messages: &[ChatMessage]) -> Vec<WireMessage> {
    let mut wire = Vec::with_capacity(messages.len() + 1);
    if let Some(system) = system {
        wire.push(WireMessage {
            role: "system".to_string(),
            content: Some(system.to_string()),
            tool_call_id: None,
            tool_calls: None,
        });
    }
    for m in messages {
        wire.push(WireMessage {
            role: role_name(m.role).to_string(),
            content: Some(m.content.clone()),
            tool_call_id: m.tool_call_id.clone(),
            tool_calls: m.tool_calls.as_ref().map(|calls| {
                calls
                    .iter()
                    .map(|c| WireToolCall {
                        id: c.id.clone(),
                        call_type: "function".to_string(),
                        function: WireCallFunction {
                            name: c.name.clone(),
                            arguments: c.arguments.to_string(),
                        },
                    })
                    .collect()
            }),
        });
    }
    wire
}

fn parse_finish_reason(raw: Option<&str>) -> FinishReason {
    match raw {
        Some("stop") => FinishReason::Stop,
        Some("length") => FinishReason::Length,
        Some("tool_calls") => FinishReason::ToolCalls,
        Some("content_filter") => FinishReason::ContentFilter,
        _ => FinishReason::Other,
    }
}

fn parse_tool_calls(wire: Option<Vec<WireToolCall>>) -> Vec<ToolCall> {
    wire.unwrap_or_default()
        .into_iter()
        .map(|c| ToolCall {
            id: c.id,
            name: c.function.name,
            // Malformed argument strings survive as a JSON string; the
            // executor's schema validation rejects them downstream.
            arguments: serde_json::from_str(&c.function.arguments)
                .unwrap_or(Value::String(c.function.arguments)),
        })
        .collect()
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    async fn generate(&self, request: ProviderRequest) -> Result<ProviderResponse> {
        let name = self.config.name.clone();

        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(
                request
                    .tools
                    .iter()
                    .map(|t| WireTool {
                        tool_type: "function",
                        function: WireFunction {
                            name: t.name.clone(),
                            description: t.description.clone(),
                            parameters: t.parameters.clone(),
                        },
                    })
                    .collect(),
            )
        };

        let api_request = WireRequest {
            model: request.model.clone(),
            messages: to_wire_messages(request.system.as_deref(), &request.messages),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            tools,
        };

        let url = format!("{}/v1/chat/completions", self.base_url());
        let mut builder = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("content-type", "application/json")
            .json(&api_request);
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await.map_err(|e| {
            // Connection-level failures and client timeouts are transient.
            Error::transient(&name, format!("HTTP request failed: {e}"))
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::transient(&name, format!("failed to read response: {e}")))?;

        if !status.is_success() {
            let message = serde_json::from_str::<WireError>(&body)
                .map(|e| e.error.message)
                .unwrap_or_else(|_| body.clone());
            let message = format!("{status}: {message}");
            // 429 and 5xx are transient; the remaining 4xx are permanent.
            return if status.as_u16() == 429 || status.is_server_error() {
                Err(Error::transient(&name, message))
            } else {
                Err(Error::permanent(&name, message))
            };
        }

        let raw: Value = serde_json::from_str(&body)
            .map_err(|e| Error::permanent(&name, format!("unparseable response body: {e}")))?;
        let api_response: WireResponse = serde_json::from_value(raw.clone())
            .map_err(|e| Error::permanent(&name, format!("unexpected response shape: {e}")))?;

        let choice = api_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::permanent(&name, "no choices in response"))?;

        let mut usage = UsageDetails::new(
            api_response.usage.prompt_tokens,
            api_response.usage.completion_tokens,
        );
        if let Some(details) = api_response.usage.completion_tokens_details {
            if let Some(reasoning) = details.reasoning_tokens {
                usage = usage.with_reasoning(reasoning);
            }
        }

        Ok(ProviderResponse {
            content: choice.message.content.unwrap_or_default(),
            model: api_response.model,
            usage,
            finish_reason: parse_finish_reason(choice.finish_reason.as_deref()),
            tool_calls: parse_tool_calls(choice.message.tool_calls),
            raw,
        })
    }

    fn name(&self) -> &str {
        &self.config.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_wire_messages_include_system_first() {
        let messages = vec![ChatMessage::user("hi")];
        let wire = to_wire_messages(Some("be terse"), &messages);
        assert_eq!(wire.len(), 2);
        assert_eq!(wire[0].role, "system");
        assert_eq!(wire[1].role, "user");
    }

    #[test]
    fn test_tool_result_message_round_trip() {
        let messages = vec![ChatMessage::tool_result("call_9", "72F and sunny")];
        let wire = to_wire_messages(None, &messages);
        assert_eq!(wire[0].role, "tool");
        assert_eq!(wire[0].tool_call_id.as_deref(), Some("call_9"));
    }

    #[test]
    fn test_tool_call_arguments_parsed_to_json() {
        let calls = parse_tool_calls(Some(vec![WireToolCall {
            id: "call_1".to_string(),
            call_type: "function".to_string(),
            function: WireCallFunction {
                name: "weather".to_string(),
                arguments: r#"{"city": "Lisbon"}"#.to_string(),
            },
        }]));
        assert_eq!(calls[0].arguments, json!({"city": "Lisbon"}));
    }

    #[test]
    fn test_malformed_arguments_survive_as_string() {
        let calls = parse_tool_calls(Some(vec![WireToolCall {
            id: "call_1".to_string(),
            call_type: "function".to_string(),
            function: WireCallFunction {
                name: "weather".to_string(),
                arguments: "{not json".to_string(),
            },
        }]));
        assert_eq!(calls[0].arguments, Value::String("{not json".to_string()));
    }

    #[test]
    fn test_finish_reason_mapping() {
        assert_eq!(parse_finish_reason(Some("stop")), FinishReason::Stop);
        assert_eq!(parse_finish_reason(Some("length")), FinishReason::Length);
        assert_eq!(
            parse_finish_reason(Some("tool_calls")),
            FinishReason::ToolCalls
        );
        assert_eq!(parse_finish_reason(None), FinishReason::Other);
    }

    #[test]
    fn test_reasoning_tokens_normalized() {
        let usage: WireUsage = serde_json::from_value(json!({
            "prompt_tokens": 100,
            "completion_tokens": 50,
            "completion_tokens_details": {"reasoning_tokens": 30}
        }))
        .unwrap();
        let mut details = UsageDetails::new(usage.prompt_tokens, usage.completion_tokens);
        if let Some(d) = usage.completion_tokens_details {
            if let Some(r) = d.reasoning_tokens {
                details = details.with_reasoning(r);
            }
        }
        assert_eq!(details.total_tokens, 150);
        assert_eq!(details.reasoning_tokens, Some(30));
    }

    #[test]
    fn test_config_builder() {
        let config = ProviderConfig::new("groq", "key")
            .with_base_url("https://api.groq.com/openai")
            .with_timeout(10);
        assert_eq!(config.name, "groq");
        assert_eq!(config.timeout_secs, 10);
        let provider = OpenAiCompatProvider::new(config);
        assert_eq!(provider.base_url(), "https://api.groq.com/openai");
        assert_eq!(provider.name(), "groq");
    }
}
