//! Deterministic scripted provider.
//!
//! Replays a programmed sequence of replies, failures, and latencies. The
//! test suite is built on it, and hosts use it for offline development:
//! no network, no keys, fully reproducible.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::{FinishReason, ToolCall, UsageDetails};

use super::{Provider, ProviderRequest, ProviderResponse};

/// One scripted outcome.
#[derive(Debug, Clone)]
pub struct ScriptedReply {
    pub content: String,
    pub usage: UsageDetails,
    pub tool_calls: Vec<ToolCall>,
    pub delay: Option<Duration>,
    /// When set, the call fails with this error instead of responding.
    pub failure: Option<ScriptedFailure>,
}

#[derive(Debug, Clone, Copy)]
pub enum ScriptedFailure {
    Transient,
    Permanent,
}

impl ScriptedReply {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            usage: UsageDetails::new(20, 10),
            tool_calls: Vec::new(),
            delay: None,
            failure: None,
        }
    }

    pub fn tool_call(call: ToolCall) -> Self {
        Self {
            content: String::new(),
            usage: UsageDetails::new(20, 10),
            tool_calls: vec![call],
            delay: None,
            failure: None,
        }
    }

    pub fn transient_failure() -> Self {
        Self {
            content: String::new(),
            usage: UsageDetails::default(),
            tool_calls: Vec::new(),
            delay: None,
            failure: Some(ScriptedFailure::Transient),
        }
    }

    pub fn permanent_failure() -> Self {
        Self {
            content: String::new(),
            usage: UsageDetails::default(),
            tool_calls: Vec::new(),
            delay: None,
            failure: Some(ScriptedFailure::Permanent),
        }
    }

    pub fn with_usage(mut self, usage: UsageDetails) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Provider that replays a script, then echoes a default reply.
pub struct ScriptedProvider {
    name: String,
    script: Mutex<VecDeque<ScriptedReply>>,
    default_reply: ScriptedReply,
    calls: AtomicUsize,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(VecDeque::new()),
            default_reply: ScriptedReply::text("scripted reply"),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue the next outcome.
    pub fn push(&self, reply: ScriptedReply) {
        self.script.lock().expect("script poisoned").push_back(reply);
    }

    pub fn with_reply(self, reply: ScriptedReply) -> Self {
        self.push(reply);
        self
    }

    /// Reply used once the script runs dry.
    pub fn with_default_reply(mut self, reply: ScriptedReply) -> Self {
        self.default_reply = reply;
        self
    }

    /// Number of `generate` calls made so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The requests received, in order.
    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().expect("requests poisoned").clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    async fn generate(&self, request: ProviderRequest) -> Result<ProviderResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .expect("requests poisoned")
            .push(request.clone());

        let reply = self
            .script
            .lock()
            .expect("script poisoned")
            .pop_front()
            .unwrap_or_else(|| self.default_reply.clone());

        if let Some(delay) = reply.delay {
            tokio::time::sleep(delay).await;
        }

        match reply.failure {
            Some(ScriptedFailure::Transient) => {
                Err(Error::transient(&self.name, "scripted 429 rate limit"))
            }
            Some(ScriptedFailure::Permanent) => {
                Err(Error::permanent(&self.name, "scripted 400 bad request"))
            }
            None => {
                let finish_reason = if reply.tool_calls.is_empty() {
                    FinishReason::Stop
                } else {
                    FinishReason::ToolCalls
                };
                Ok(ProviderResponse {
                    content: reply.content,
                    model: request.model,
                    usage: reply.usage,
                    finish_reason,
                    tool_calls: reply.tool_calls,
                    raw: serde_json::Value::Null,
                })
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[tokio::test]
    async fn test_script_replays_in_order() {
        let provider = ScriptedProvider::new("mock")
            .with_reply(ScriptedReply::text("first"))
            .with_reply(ScriptedReply::text("second"));

        let a = provider.generate(ProviderRequest::new("m")).await.unwrap();
        let b = provider.generate(ProviderRequest::new("m")).await.unwrap();
        assert_eq!(a.content, "first");
        assert_eq!(b.content, "second");
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn test_default_reply_after_script() {
        let provider = ScriptedProvider::new("mock");
        let response = provider.generate(ProviderRequest::new("m")).await.unwrap();
        assert_eq!(response.content, "scripted reply");
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let provider = ScriptedProvider::new("mock")
            .with_reply(ScriptedReply::transient_failure())
            .with_reply(ScriptedReply::permanent_failure());

        let transient = provider.generate(ProviderRequest::new("m")).await.unwrap_err();
        assert!(transient.is_transient());
        let permanent = provider.generate(ProviderRequest::new("m")).await.unwrap_err();
        assert_eq!(permanent.kind(), "provider_permanent");
    }

    #[tokio::test]
    async fn test_tool_call_reply_sets_finish_reason() {
        let provider = ScriptedProvider::new("mock").with_reply(ScriptedReply::tool_call(
            ToolCall {
                id: "call_1".to_string(),
                name: "lookup".to_string(),
                arguments: json!({"q": "x"}),
            },
        ));
        let response = provider.generate(ProviderRequest::new("m")).await.unwrap();
        assert_eq!(response.finish_reason, FinishReason::ToolCalls);
        assert_eq!(response.tool_calls.len(), 1);
    }

    #[tokio::test]
    async fn test_request_log() {
        let provider = ScriptedProvider::new("mock");
        provider
            .generate(ProviderRequest::new("model-a").with_system("sys"))
            .await
            .unwrap();
        let requests = provider.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].model, "model-a");
    }
}
