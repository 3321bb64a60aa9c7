//! Provider abstraction.
//!
//! Every concrete LLM backend implements [`Provider`]: `generate` for one
//! request/response exchange, an optional `stream` of chunks, `cost_of` for
//! pricing, and `is_available` for health. Adapters translate the uniform
//! `messages / tools / system` representation to their vendor's wire format
//! and back, and normalize reasoning-token accounting. Registration is
//! explicit: an adapter either implements this trait or is rejected.

mod openai;
mod scripted;

pub use openai::{OpenAiCompatProvider, ProviderConfig};
pub use scripted::{ScriptedFailure, ScriptedProvider, ScriptedReply};

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::{ChatMessage, FinishReason, ModelConfig, Tool, ToolCall, UsageDetails};

/// One model invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRequest {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Tool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Per-call timeout; the executor sets this from the model config.
    #[serde(skip)]
    pub timeout: Option<Duration>,
}

impl ProviderRequest {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system: None,
            messages: Vec::new(),
            tools: Vec::new(),
            max_tokens: None,
            temperature: None,
            timeout: None,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_message(mut self, message: ChatMessage) -> Self {
        self.messages.push(message);
        self
    }

    pub fn with_messages(mut self, messages: Vec<ChatMessage>) -> Self {
        self.messages = messages;
        self
    }

    pub fn with_tools(mut self, tools: Vec<Tool>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature.clamp(0.0, 1.0));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// One model response, normalized across vendors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub content: String,
    pub model: String,
    pub usage: UsageDetails,
    pub finish_reason: FinishReason,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// The vendor's raw response body, for hosts that need it.
    #[serde(default)]
    pub raw: Value,
}

impl ProviderResponse {
    /// A plain text response; the common case in tests and adapters.
    pub fn text(model: impl Into<String>, content: impl Into<String>, usage: UsageDetails) -> Self {
        Self {
            content: content.into(),
            model: model.into(),
            usage,
            finish_reason: FinishReason::Stop,
            tool_calls: Vec::new(),
            raw: Value::Null,
        }
    }
}

/// One streamed chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub content: String,
    pub done: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    /// Carried by the closing chunk.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageDetails>,
}

/// A boxed stream of response chunks.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// Uniform interface over concrete LLM providers.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Execute one request.
    async fn generate(&self, request: ProviderRequest) -> Result<ProviderResponse>;

    /// Stream a response chunk by chunk. Optional; the default rejects.
    async fn stream(&self, _request: ProviderRequest) -> Result<ChunkStream> {
        Err(Error::configuration(format!(
            "provider '{}' does not support streaming",
            self.name()
        )))
    }

    /// Cost in USD for the given token counts against a model.
    fn cost_of(&self, prompt_tokens: u64, completion_tokens: u64, model: &ModelConfig) -> f64 {
        model.cost_of(prompt_tokens, completion_tokens)
    }

    /// Whether the provider is currently reachable.
    async fn is_available(&self) -> bool {
        true
    }

    /// Registry name.
    fn name(&self) -> &str;
}

/// Registry of provider adapters, keyed by name.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter. Duplicate names are rejected.
    pub fn register(&mut self, provider: Arc<dyn Provider>) -> Result<()> {
        let name = provider.name().to_string();
        if self.providers.contains_key(&name) {
            return Err(Error::configuration(format!(
                "provider '{name}' already registered"
            )));
        }
        self.providers.insert(name, provider);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
