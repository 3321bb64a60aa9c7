//! # cascade-core
//!
//! A cost-optimizing cascade router for LLM inference: cheap models handle
//! the queries they can answer competently, expensive models are reserved
//! for the queries that demand them.
//!
//! ## Core Components
//!
//! - **Complexity / Domain**: deterministic query classification
//! - **PreRouter**: strategy selection with a fixed rule priority chain
//! - **TierRouter / BudgetManager**: caller-tier filtering and per-user
//!   budget gating
//! - **CascadeExecutor**: draft, validate, escalate; pipelines; tool loops
//! - **CallbackBus**: typed lifecycle events for observability
//!
//! ## Example
//!
//! ```rust,ignore
//! use cascade_core::{CascadeExecutor, ModelConfig, Query};
//! use std::sync::Arc;
//!
//! let executor = CascadeExecutor::builder()
//!     .with_provider(Arc::new(my_provider))
//!     .with_model(ModelConfig::new("openai", "gpt-4o-mini", 0.15, 0.60))
//!     .with_model(ModelConfig::new("openai", "gpt-4o", 2.50, 10.00))
//!     .build()?;
//!
//! let result = executor.run(Query::new("What is 2+2?")).await?;
//! println!("{} (cost ${:.6})", result.response, result.total_cost);
//! ```

pub mod budget;
pub mod complexity;
pub mod domain;
pub mod error;
pub mod events;
pub mod executor;
pub mod provider;
pub mod router;
pub mod strategy;
pub mod tier;
pub mod types;
pub mod validate;

// Re-exports for convenience
pub use budget::{
    BudgetLimit, BudgetManager, BudgetVerdict, BudgetWarning, BudgetWindow, WindowState,
    DEFAULT_BLOCK_FRACTION, DEFAULT_WARN_FRACTION,
};
pub use complexity::{Complexity, ComplexityClassifier, ComplexityResult, ScoreVector};
pub use domain::{Domain, DomainResult, DomainRouter};
pub use error::{Error, Result};
pub use events::{sse_frame, CallbackBus, CascadeEvent, EventKind, SubscriptionId, SSE_DONE};
pub use executor::{
    CascadeExecutor, CascadeExecutorBuilder, ExecutionResult, ExecutorConfig, StepResult,
    StepStatus, ToolHandler,
};
pub use provider::{
    ChunkStream, OpenAiCompatProvider, Provider, ProviderConfig, ProviderRegistry,
    ProviderRequest, ProviderResponse, ScriptedFailure, ScriptedProvider, ScriptedReply,
    StreamChunk,
};
pub use router::{
    PreRouter, RouteInput, RouterStatsSnapshot, RoutingDecision, RoutingRule, RoutingStrategy,
};
pub use strategy::{CascadeStep, DomainStrategy};
pub use tier::{TierConstraints, TierFilterOutcome, TierPolicy, TierRouter, ALLOW_ALL};
pub use types::{
    estimate_tokens, ChatMessage, ChatRole, FinishReason, ModelCapabilities, ModelConfig, Query,
    QueryOptions, Tool, ToolCall, UsageDetails,
};
pub use validate::{
    CustomCheck, QualityValidator, ResponseScorer, ValidationMethod, ValidationReport,
};
