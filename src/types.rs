//! Core data model: queries, tools, model handles, messages, and usage.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    /// A tool-result message produced by the host after executing a tool call.
    Tool,
}

/// A message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    /// Set on `Tool` messages: the id of the tool call this result answers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Set on `Assistant` messages that requested tool invocations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
            tool_call_id: None,
            tool_calls: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
            tool_call_id: None,
            tool_calls: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
            tool_call_id: None,
            tool_calls: None,
        }
    }

    /// An assistant turn that requested tool invocations.
    pub fn assistant_tool_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
            tool_call_id: None,
            tool_calls: Some(calls),
        }
    }

    /// A tool-result message answering a specific tool call.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Tool,
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            tool_calls: None,
        }
    }
}

/// A tool the model may call. The host executes it; the core only validates
/// and routes the call.
///
/// `parameters` is a JSON-Schema object (`type: object`, `properties`,
/// `required`). Model-emitted calls carry `arguments`; the two field names
/// are deliberately distinct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    pub description: String,
    /// JSON-Schema-shaped parameter schema.
    pub parameters: Value,
    /// Names that must be present in a call's arguments.
    #[serde(default)]
    pub required: Vec<String>,
}

impl Tool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
    ) -> Self {
        let required = parameters
            .get("required")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            required,
        }
    }
}

/// A model-generated request to invoke a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned call id; each id is answered by at most one
    /// tool-result message within a query.
    pub id: String,
    pub name: String,
    /// JSON object of arguments, validated against the tool's `parameters`.
    pub arguments: Value,
}

/// Model capability flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCapabilities {
    pub supports_tools: bool,
    pub supports_streaming: bool,
    pub supports_system_messages: bool,
    /// Reasoning-capable models report separate reasoning-token usage.
    pub is_reasoning: bool,
}

/// Logical model handle, stable for the process lifetime.
///
/// Costs are stored in USD **per token**. Constructors take the per-million
/// rates vendors publish and convert once; every downstream computation is
/// per-token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider name this model is served by (registry key).
    pub provider: String,
    /// Model identifier (e.g. "gpt-4o-mini").
    pub id: String,
    /// USD per input token.
    pub input_cost: f64,
    /// USD per output token.
    pub output_cost: f64,
    /// Maximum context window in tokens.
    pub context_window: u32,
    pub capabilities: ModelCapabilities,
    /// Per-call timeout override in milliseconds; the executor default
    /// applies when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_timeout_ms: Option<u64>,
}

impl ModelConfig {
    /// Create a model handle from per-million-token USD rates.
    pub fn new(
        provider: impl Into<String>,
        id: impl Into<String>,
        input_per_million: f64,
        output_per_million: f64,
    ) -> Self {
        Self {
            provider: provider.into(),
            id: id.into(),
            input_cost: input_per_million / 1_000_000.0,
            output_cost: output_per_million / 1_000_000.0,
            context_window: 128_000,
            capabilities: ModelCapabilities {
                supports_tools: true,
                supports_streaming: true,
                supports_system_messages: true,
                is_reasoning: false,
            },
            call_timeout_ms: None,
        }
    }

    pub fn with_call_timeout_ms(mut self, ms: u64) -> Self {
        self.call_timeout_ms = Some(ms);
        self
    }

    pub fn with_context_window(mut self, tokens: u32) -> Self {
        self.context_window = tokens;
        self
    }

    pub fn with_capabilities(mut self, capabilities: ModelCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Cost in USD for the given token counts.
    pub fn cost_of(&self, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        prompt_tokens as f64 * self.input_cost + completion_tokens as f64 * self.output_cost
    }

    /// Blended per-token rate used for cheapest/most-expensive ordering.
    /// Output tokens dominate real spend, so they are weighted heavier.
    pub fn blended_rate(&self) -> f64 {
        self.input_cost + 3.0 * self.output_cost
    }
}

/// Token usage for one model call.
///
/// `reasoning_tokens`, when present, is already included in
/// `completion_tokens`; it is broken out for accounting only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageDetails {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_tokens: Option<u64>,
}

impl UsageDetails {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            reasoning_tokens: None,
        }
    }

    pub fn with_reasoning(mut self, reasoning_tokens: u64) -> Self {
        self.reasoning_tokens = Some(reasoning_tokens);
        self
    }
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Other,
}

/// Per-query caller options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryOptions {
    /// Caller identity for budget accounting.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Tier name for model filtering.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_tier: Option<String>,
    /// Per-query budget override in USD, tighter of this and the tier cap wins.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_cost: Option<f64>,
    /// Caller-asserted complexity; invalid hints are ignored and logged.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub complexity_hint: Option<String>,
    /// Caller-asserted domain; invalid hints are ignored and logged.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain_hint: Option<String>,
    /// Skip the cascade and go straight to the best model.
    #[serde(default)]
    pub force_direct: bool,
    /// Per-query wall-clock timeout in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Opaque caller metadata, echoed into events.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

/// An immutable query entering the router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub id: Uuid,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Tool>,
    #[serde(default)]
    pub options: QueryOptions,
}

impl Query {
    /// Build a query, validating the tool list.
    ///
    /// A query consisting only of tools (no prompt) is a configuration
    /// error, as are duplicate tool names.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: text.into(),
            tools: Vec::new(),
            options: QueryOptions::default(),
        }
    }

    pub fn with_tools(mut self, tools: Vec<Tool>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }

    /// Validate the query shape before any routing work.
    pub fn validate(&self) -> Result<()> {
        if self.text.trim().is_empty() && !self.tools.is_empty() {
            return Err(Error::configuration(
                "query supplies tools but no prompt text",
            ));
        }
        let mut seen = HashSet::new();
        for tool in &self.tools {
            if !seen.insert(tool.name.as_str()) {
                return Err(Error::configuration(format!(
                    "duplicate tool name '{}'",
                    tool.name
                )));
            }
        }
        Ok(())
    }
}

/// Deterministic token estimate for budget pre-checks, used when no
/// provider-side count exists yet. Roughly four characters per token.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64 / 4).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_model_cost_is_per_token() {
        // $0.15 / $0.60 per million
        let model = ModelConfig::new("openai", "gpt-4o-mini", 0.15, 0.60);
        let cost = model.cost_of(1_000_000, 500_000);
        assert!((cost - 0.45).abs() < 1e-9);
        assert!((model.input_cost - 0.000_000_15).abs() < 1e-15);
    }

    #[test]
    fn test_blended_rate_orders_models() {
        let cheap = ModelConfig::new("openai", "mini", 0.15, 0.60);
        let premium = ModelConfig::new("anthropic", "big", 3.0, 15.0);
        assert!(cheap.blended_rate() < premium.blended_rate());
    }

    #[test]
    fn test_duplicate_tool_names_rejected() {
        let schema = json!({"type": "object", "properties": {}});
        let query = Query::new("call something").with_tools(vec![
            Tool::new("lookup", "a", schema.clone()),
            Tool::new("lookup", "b", schema),
        ]);
        let err = query.validate().unwrap_err();
        assert_eq!(err.kind(), "configuration_error");
    }

    #[test]
    fn test_tools_without_prompt_rejected() {
        let schema = json!({"type": "object", "properties": {}});
        let query = Query::new("   ").with_tools(vec![Tool::new("lookup", "a", schema)]);
        assert!(query.validate().is_err());
    }

    #[test]
    fn test_empty_query_without_tools_is_valid() {
        // Blank queries still route (to trivial/general); only tools-only
        // queries are malformed.
        assert!(Query::new("").validate().is_ok());
    }

    #[test]
    fn test_tool_required_extracted_from_schema() {
        let tool = Tool::new(
            "weather",
            "get weather",
            json!({
                "type": "object",
                "properties": {"city": {"type": "string"}},
                "required": ["city"]
            }),
        );
        assert_eq!(tool.required, vec!["city".to_string()]);
    }

    #[test]
    fn test_usage_total() {
        let usage = UsageDetails::new(100, 40).with_reasoning(10);
        assert_eq!(usage.total_tokens, 140);
        assert_eq!(usage.reasoning_tokens, Some(10));
    }

    #[test]
    fn test_estimate_tokens_floor() {
        assert_eq!(estimate_tokens(""), 1);
        assert_eq!(estimate_tokens("abcdefgh"), 2);
    }

    #[test]
    fn test_tool_result_message_shape() {
        let msg = ChatMessage::tool_result("call_1", "42");
        assert_eq!(msg.role, ChatRole::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_1"));
    }
}
