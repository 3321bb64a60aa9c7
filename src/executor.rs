//! The cascade executor.
//!
//! Drives a query end to end: classification, pre-routing, tier filtering,
//! budget gating, then the selected execution strategy (direct, cascade,
//! domain pipeline, or parallel race), publishing lifecycle events at every
//! decision point. Many queries run concurrently; each query is one logical
//! task whose work is serial apart from explicit parallel strategies.

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::budget::BudgetManager;
use crate::complexity::{Complexity, ComplexityClassifier, ComplexityResult};
use crate::domain::{Domain, DomainResult, DomainRouter};
use crate::error::{Error, Result};
use crate::events::{CallbackBus, CascadeEvent, EventKind};
use crate::provider::{ChunkStream, Provider, ProviderRegistry, ProviderRequest, ProviderResponse, StreamChunk};
use crate::router::{PreRouter, RouteInput, RouterStatsSnapshot, RoutingDecision, RoutingStrategy};
use crate::strategy::DomainStrategy;
use crate::tier::TierRouter;
use crate::types::{estimate_tokens, ChatMessage, ModelConfig, Query, Tool, ToolCall, UsageDetails};
use crate::validate::{QualityValidator, ValidationMethod, ValidationReport};

/// Completion-token estimate used by the budget pre-check before any
/// provider-side count exists.
const ESTIMATED_COMPLETION_TOKENS: u64 = 256;

/// Host-side tool execution. The core validates and routes tool calls; the
/// host runs them and returns the result text.
#[async_trait::async_trait]
pub trait ToolHandler: Send + Sync {
    async fn execute(&self, call: &ToolCall) -> Result<String>;
}

/// Status of one executed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    FailedQuality,
    FailedError,
    Skipped,
}

/// One leg of the execution trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_name: String,
    pub model_used: String,
    pub provider: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationReport>,
    pub cost: f64,
    pub latency_ms: u64,
    pub usage: UsageDetails,
    /// Tool-execution rounds this step went through.
    pub tool_calls: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Final result of one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub query_id: Uuid,
    /// Final response text.
    pub response: String,
    /// Model that produced the final response.
    pub model_used: String,
    pub complexity: Complexity,
    pub domain: Domain,
    /// Routing confidence, in [0, 1].
    pub confidence: f64,
    pub strategy: RoutingStrategy,
    pub total_cost: f64,
    pub total_tokens: u64,
    pub total_latency_ms: u64,
    /// The query ran a cascade strategy.
    pub cascaded: bool,
    /// The drafter's response was accepted without escalation.
    pub draft_accepted: bool,
    /// A fallback leg produced the final response.
    pub fallback_used: bool,
    /// Executed steps, in execution order.
    pub trace: Vec<StepResult>,
    pub routing_reason: String,
    /// USD saved versus sending the same tokens to the best candidate.
    pub estimated_savings: f64,
}

impl ExecutionResult {
    fn from_trace(
        query_id: Uuid,
        response: String,
        model_used: String,
        prepared: &Prepared,
        trace: Vec<StepResult>,
        started: Instant,
        cascaded: bool,
        draft_accepted: bool,
        fallback_used: bool,
    ) -> Self {
        let total_cost: f64 = trace.iter().map(|s| s.cost).sum();
        let total_tokens: u64 = trace.iter().map(|s| s.usage.total_tokens).sum();
        let prompt_tokens: u64 = trace.iter().map(|s| s.usage.prompt_tokens).sum();
        let completion_tokens: u64 = trace.iter().map(|s| s.usage.completion_tokens).sum();
        let best = best_model(&prepared.candidates);
        let estimated_savings =
            (best.cost_of(prompt_tokens, completion_tokens) - total_cost).max(0.0);

        Self {
            query_id,
            response,
            model_used,
            complexity: prepared.complexity.complexity,
            domain: prepared.domain.domain,
            confidence: prepared.decision.confidence,
            strategy: prepared.decision.strategy,
            total_cost,
            total_tokens,
            total_latency_ms: started.elapsed().as_millis() as u64,
            cascaded,
            draft_accepted,
            fallback_used,
            trace,
            routing_reason: prepared.decision.reason.clone(),
            estimated_savings,
        }
    }
}

/// Executor tunables.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum queries executing at once.
    pub max_in_flight: usize,
    /// Queries allowed to queue for admission before `overloaded`.
    pub admission_queue_limit: usize,
    /// Concurrent calls per provider.
    pub provider_concurrency: usize,
    /// Calls allowed to queue per provider before `overloaded`.
    pub provider_queue_limit: usize,
    /// Default per-model-call timeout.
    pub call_timeout: Duration,
    /// Per-query wall-clock timeout.
    pub query_timeout: Duration,
    /// Tool-execution rounds before the loop is cut off.
    pub max_tool_iterations: u32,
    /// Regenerate via the verifier on malformed tool calls.
    pub strict_tool_validation: bool,
    /// Base delay for the single transient retry.
    pub retry_base_delay: Duration,
    /// Tool names that hand the conversation off to the verifier after
    /// executing.
    pub handoff_tools: HashSet<String>,
    /// System prompt prepended to every request.
    pub system_prompt: Option<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 64,
            admission_queue_limit: 128,
            provider_concurrency: 8,
            provider_queue_limit: 64,
            call_timeout: Duration::from_secs(30),
            query_timeout: Duration::from_secs(120),
            max_tool_iterations: 3,
            strict_tool_validation: true,
            retry_base_delay: Duration::from_millis(200),
            handoff_tools: HashSet::new(),
            system_prompt: None,
        }
    }
}

/// Semaphore with a bounded wait queue: exceeding the permit count queues,
/// overflowing the queue fails fast.
struct BoundedLimiter {
    semaphore: Arc<Semaphore>,
    waiting: AtomicUsize,
    queue_limit: usize,
    label: String,
}

impl BoundedLimiter {
    fn new(permits: usize, queue_limit: usize, label: impl Into<String>) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(permits.max(1))),
            waiting: AtomicUsize::new(0),
            queue_limit,
            label: label.into(),
        }
    }

    async fn acquire(&self, cancel: &CancellationToken) -> Result<OwnedSemaphorePermit> {
        if let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() {
            return Ok(permit);
        }
        if self.waiting.fetch_add(1, Ordering::SeqCst) >= self.queue_limit {
            self.waiting.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::Overloaded(format!(
                "{} queue is full",
                self.label
            )));
        }
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            permit = Arc::clone(&self.semaphore).acquire_owned() => {
                permit.map_err(|_| Error::internal("limiter semaphore closed"))
            }
        };
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Builder for [`CascadeExecutor`].
pub struct CascadeExecutorBuilder {
    providers: Vec<Arc<dyn Provider>>,
    models: Vec<ModelConfig>,
    strategies: Vec<DomainStrategy>,
    tiers: TierRouter,
    prerouter: PreRouter,
    validator: QualityValidator,
    budget: BudgetManager,
    tool_handler: Option<Arc<dyn ToolHandler>>,
    config: ExecutorConfig,
}

impl CascadeExecutorBuilder {
    pub fn new() -> Self {
        Self {
            providers: Vec::new(),
            models: Vec::new(),
            strategies: Vec::new(),
            tiers: TierRouter::new(),
            prerouter: PreRouter::new(),
            validator: QualityValidator::new(),
            budget: BudgetManager::new(),
            tool_handler: None,
            config: ExecutorConfig::default(),
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn with_model(mut self, model: ModelConfig) -> Self {
        self.models.push(model);
        self
    }

    pub fn with_domain_strategy(mut self, strategy: DomainStrategy) -> Self {
        self.strategies.push(strategy);
        self
    }

    pub fn with_tiers(mut self, tiers: TierRouter) -> Self {
        self.tiers = tiers;
        self
    }

    pub fn with_prerouter(mut self, prerouter: PreRouter) -> Self {
        self.prerouter = prerouter;
        self
    }

    pub fn with_validator(mut self, validator: QualityValidator) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_budget(mut self, budget: BudgetManager) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_tool_handler(mut self, handler: Arc<dyn ToolHandler>) -> Self {
        self.tool_handler = Some(handler);
        self
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Validate the configuration and build the executor.
    pub fn build(self) -> Result<CascadeExecutor> {
        let mut registry = ProviderRegistry::new();
        for provider in self.providers {
            registry.register(provider)?;
        }

        for model in &self.models {
            if registry.get(&model.provider).is_none() {
                return Err(Error::configuration(format!(
                    "model '{}' references unregistered provider '{}'",
                    model.id, model.provider
                )));
            }
        }

        let mut strategies: HashMap<Domain, DomainStrategy> = HashMap::new();
        for strategy in self.strategies {
            for step in &strategy.steps {
                if registry.get(&step.provider).is_none() {
                    return Err(Error::configuration(format!(
                        "step '{}' references unregistered provider '{}'",
                        step.name, step.provider
                    )));
                }
                if !self.models.iter().any(|m| m.id == step.model) {
                    return Err(Error::configuration(format!(
                        "step '{}' references unknown model '{}'",
                        step.name, step.model
                    )));
                }
            }
            if strategies.insert(strategy.domain, strategy.clone()).is_some() {
                return Err(Error::configuration(format!(
                    "duplicate domain strategy for '{}'",
                    strategy.domain
                )));
            }
        }

        let provider_limits = registry
            .names()
            .into_iter()
            .map(|name| {
                let limiter = BoundedLimiter::new(
                    self.config.provider_concurrency,
                    self.config.provider_queue_limit,
                    format!("provider '{name}'"),
                );
                (name, limiter)
            })
            .collect();

        let admission = BoundedLimiter::new(
            self.config.max_in_flight,
            self.config.admission_queue_limit,
            "admission",
        );

        Ok(CascadeExecutor {
            providers: registry,
            models: StdRwLock::new(Arc::new(self.models)),
            strategies: StdRwLock::new(Arc::new(strategies)),
            tiers: self.tiers,
            classifier: ComplexityClassifier::new(),
            domains: DomainRouter::new(),
            prerouter: self.prerouter,
            validator: self.validator,
            budget: Arc::new(self.budget),
            bus: Arc::new(CallbackBus::new()),
            tool_handler: self.tool_handler,
            config: self.config,
            admission,
            provider_limits,
            closed: AtomicBool::new(false),
        })
    }
}

impl Default for CascadeExecutorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Pre-flight output shared by `run` and `run_streaming`.
struct Prepared {
    complexity: ComplexityResult,
    domain: DomainResult,
    decision: RoutingDecision,
    candidates: Vec<ModelConfig>,
    strategy: Option<DomainStrategy>,
    max_cost: Option<f64>,
}

/// Outcome of one model loop (a step), tool iterations included.
struct LoopOutcome {
    content: String,
    usage: UsageDetails,
    cost: f64,
    latency_ms: u64,
    tool_rounds: u32,
    model_used: String,
    provider: String,
    /// A non-cancellation failure that ended the loop.
    error: Option<Error>,
}

/// The cost-optimizing cascade router.
///
/// Owns every registry (providers, models, tiers, strategies, budgets, the
/// event bus) with an explicit `build`/`close` lifecycle; nothing is
/// process-global, so tests construct as many instances as they like.
pub struct CascadeExecutor {
    providers: ProviderRegistry,
    models: StdRwLock<Arc<Vec<ModelConfig>>>,
    strategies: StdRwLock<Arc<HashMap<Domain, DomainStrategy>>>,
    tiers: TierRouter,
    classifier: ComplexityClassifier,
    domains: DomainRouter,
    prerouter: PreRouter,
    validator: QualityValidator,
    budget: Arc<BudgetManager>,
    bus: Arc<CallbackBus>,
    tool_handler: Option<Arc<dyn ToolHandler>>,
    config: ExecutorConfig,
    admission: BoundedLimiter,
    provider_limits: HashMap<String, BoundedLimiter>,
    closed: AtomicBool,
}

impl std::fmt::Debug for CascadeExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CascadeExecutor").finish_non_exhaustive()
    }
}

impl CascadeExecutor {
    pub fn builder() -> CascadeExecutorBuilder {
        CascadeExecutorBuilder::new()
    }

    /// The lifecycle event bus.
    pub fn bus(&self) -> &Arc<CallbackBus> {
        &self.bus
    }

    /// The budget gate.
    pub fn budget(&self) -> &Arc<BudgetManager> {
        &self.budget
    }

    /// Routing counters snapshot.
    pub fn router_stats(&self) -> RouterStatsSnapshot {
        self.prerouter.stats()
    }

    /// Register an additional model at runtime (write-rare snapshot swap).
    pub fn register_model(&self, model: ModelConfig) -> Result<()> {
        if self.providers.get(&model.provider).is_none() {
            return Err(Error::configuration(format!(
                "model '{}' references unregistered provider '{}'",
                model.id, model.provider
            )));
        }
        let mut guard = self.models.write().expect("model table poisoned");
        let mut next = guard.as_ref().clone();
        next.push(model);
        *guard = Arc::new(next);
        Ok(())
    }

    /// Replace the strategy for a domain at runtime.
    pub fn register_strategy(&self, strategy: DomainStrategy) -> Result<()> {
        for step in &strategy.steps {
            if self.providers.get(&step.provider).is_none() {
                return Err(Error::configuration(format!(
                    "step '{}' references unregistered provider '{}'",
                    step.name, step.provider
                )));
            }
        }
        let mut guard = self.strategies.write().expect("strategy table poisoned");
        let mut next = guard.as_ref().clone();
        next.insert(strategy.domain, strategy);
        *guard = Arc::new(next);
        Ok(())
    }

    /// Shut down: subsequent `run` calls fail. In-flight queries finish.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn models_snapshot(&self) -> Arc<Vec<ModelConfig>> {
        Arc::clone(&self.models.read().expect("model table poisoned"))
    }

    fn strategies_snapshot(&self) -> Arc<HashMap<Domain, DomainStrategy>> {
        Arc::clone(&self.strategies.read().expect("strategy table poisoned"))
    }

    /// Execute a query to completion.
    pub async fn run(&self, query: Query) -> Result<ExecutionResult> {
        self.run_with_cancel(query, CancellationToken::new()).await
    }

    /// Execute a query with caller-controlled cancellation.
    ///
    /// On cancel or per-query timeout, partial results are discarded but
    /// partial costs are still recorded against the budget.
    #[instrument(skip_all, fields(query_id = %query.id))]
    pub async fn run_with_cancel(
        &self,
        query: Query,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::configuration("executor is closed"));
        }
        query.validate()?;

        let _permit = self.admission.acquire(&cancel).await?;
        self.bus.publish(&CascadeEvent::query_start(query.id, &query.text));

        let query_timeout = query
            .options
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.config.query_timeout);
        let partial_cost = Arc::new(StdMutex::new(0.0f64));

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            timed = tokio::time::timeout(
                query_timeout,
                self.execute(&query, &cancel, &partial_cost),
            ) => match timed {
                Ok(inner) => inner,
                Err(_) => Err(Error::Timeout {
                    duration_ms: query_timeout.as_millis() as u64,
                }),
            },
        };

        // Truth in accounting: whatever was spent is recorded, even on
        // cancellation or timeout.
        if let Some(user) = &query.options.user_id {
            let spent = *partial_cost.lock().expect("cost cell poisoned");
            if spent > 0.0 {
                self.budget.record(user, spent).await;
            }
        }

        match outcome {
            Ok(result) => {
                self.bus.publish(&CascadeEvent::new(
                    EventKind::QueryComplete,
                    query.id,
                    json!({
                        "model_used": result.model_used,
                        "strategy": result.strategy.as_str(),
                        "cascaded": result.cascaded,
                        "draft_accepted": result.draft_accepted,
                        "total_cost": result.total_cost,
                        "total_tokens": result.total_tokens,
                    }),
                ));
                Ok(result)
            }
            Err(err) => {
                self.bus
                    .publish(&CascadeEvent::query_error(query.id, err.kind(), &err.to_string()));
                Err(err)
            }
        }
    }

    /// Execute a query, forwarding provider chunks when the strategy is
    /// direct and the provider can stream.
    ///
    /// Cascade strategies buffer the full draft for validation, so they
    /// collapse to a single content chunk followed by the closing frame.
    pub async fn run_streaming(
        &self,
        query: Query,
        cancel: CancellationToken,
    ) -> Result<ChunkStream> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::configuration("executor is closed"));
        }
        query.validate()?;

        let permit = self.admission.acquire(&cancel).await?;
        self.bus.publish(&CascadeEvent::query_start(query.id, &query.text));

        let partial_cost = Arc::new(StdMutex::new(0.0f64));
        let prepared = match self.prepare(&query).await {
            Ok(prepared) => prepared,
            Err(err) => {
                self.bus
                    .publish(&CascadeEvent::query_error(query.id, err.kind(), &err.to_string()));
                return Err(err);
            }
        };

        let direct_model = match prepared.decision.strategy {
            RoutingStrategy::DirectCheap => Some(cheapest_model(&prepared.candidates).clone()),
            RoutingStrategy::DirectBest => Some(best_model(&prepared.candidates).clone()),
            _ => None,
        };

        if let Some(model) = direct_model {
            if model.capabilities.supports_streaming {
                if let Some(provider) = self.providers.get(&model.provider) {
                    let request = self.base_request(&query, &model);
                    if let Ok(inner) = provider.stream(request).await {
                        return Ok(self.forward_stream(
                            inner,
                            model,
                            provider,
                            query.id,
                            query.options.user_id.clone(),
                            permit,
                        ));
                    }
                }
            }
        }

        // Collapse: run to completion, then emit content + closing frame.
        let result = self
            .dispatch(&query, &prepared, &cancel, &partial_cost)
            .await;
        if let Some(user) = &query.options.user_id {
            let spent = *partial_cost.lock().expect("cost cell poisoned");
            if spent > 0.0 {
                self.budget.record(user, spent).await;
            }
        }
        let result = match result {
            Ok(result) => result,
            Err(err) => {
                self.bus
                    .publish(&CascadeEvent::query_error(query.id, err.kind(), &err.to_string()));
                return Err(err);
            }
        };
        self.bus.publish(&CascadeEvent::new(
            EventKind::QueryComplete,
            query.id,
            json!({
                "model_used": result.model_used,
                "streamed": false,
                "total_cost": result.total_cost,
                "total_tokens": result.total_tokens,
            }),
        ));

        let usage: UsageDetails = UsageDetails {
            prompt_tokens: result.trace.iter().map(|s| s.usage.prompt_tokens).sum(),
            completion_tokens: result.trace.iter().map(|s| s.usage.completion_tokens).sum(),
            total_tokens: result.total_tokens,
            reasoning_tokens: None,
        };
        let frames = vec![
            Ok(StreamChunk {
                content: result.response.clone(),
                done: false,
                finish_reason: None,
                usage: None,
            }),
            Ok(StreamChunk {
                content: String::new(),
                done: true,
                finish_reason: Some(crate::types::FinishReason::Stop),
                usage: Some(usage),
            }),
        ];
        drop(permit);
        Ok(Box::pin(futures::stream::iter(frames)))
    }

    /// Wrap a provider chunk stream: account cost from the closing chunk and
    /// publish completion events, holding the admission permit until done.
    fn forward_stream(
        &self,
        inner: ChunkStream,
        model: ModelConfig,
        provider: Arc<dyn Provider>,
        query_id: Uuid,
        user_id: Option<String>,
        permit: OwnedSemaphorePermit,
    ) -> ChunkStream {
        let bus = Arc::clone(&self.bus);
        let budget = Arc::clone(&self.budget);

        struct ForwardState {
            inner: ChunkStream,
            model: ModelConfig,
            provider: Arc<dyn Provider>,
            bus: Arc<CallbackBus>,
            budget: Arc<BudgetManager>,
            query_id: Uuid,
            user_id: Option<String>,
            _permit: OwnedSemaphorePermit,
        }

        let state = ForwardState {
            inner,
            model,
            provider,
            bus,
            budget,
            query_id,
            user_id,
            _permit: permit,
        };

        Box::pin(futures::stream::unfold(Some(state), |state| async move {
            let mut state = state?;
            match state.inner.next().await {
                Some(Ok(chunk)) => {
                    if chunk.done {
                        if let Some(usage) = &chunk.usage {
                            let cost = state.provider.cost_of(
                                usage.prompt_tokens,
                                usage.completion_tokens,
                                &state.model,
                            );
                            if let Some(user) = &state.user_id {
                                state.budget.record(user, cost).await;
                            }
                            state.bus.publish(&CascadeEvent::new(
                                EventKind::QueryComplete,
                                state.query_id,
                                json!({
                                    "model_used": state.model.id,
                                    "streamed": true,
                                    "total_cost": cost,
                                    "total_tokens": usage.total_tokens,
                                }),
                            ));
                        }
                        Some((Ok(chunk), None))
                    } else {
                        Some((Ok(chunk), Some(state)))
                    }
                }
                Some(Err(err)) => {
                    state.bus.publish(&CascadeEvent::query_error(
                        state.query_id,
                        err.kind(),
                        &err.to_string(),
                    ));
                    Some((Err(err), None))
                }
                None => None,
            }
        }))
    }

    /// Classification, tier filtering, routing, and budget gating.
    async fn prepare(&self, query: &Query) -> Result<Prepared> {
        let complexity = self
            .classifier
            .classify(&query.text, query.options.complexity_hint.as_deref());
        self.bus.publish(&CascadeEvent::new(
            EventKind::ComplexityDetected,
            query.id,
            json!({
                "complexity": complexity.complexity.as_str(),
                "confidence": complexity.confidence,
                "score": complexity.score,
            }),
        ));

        let domain = self
            .domains
            .classify(&query.text, query.options.domain_hint.as_deref());
        self.bus.publish(&CascadeEvent::new(
            EventKind::DomainDetected,
            query.id,
            json!({
                "domain": domain.domain.as_str(),
                "confidence": domain.confidence,
                "is_mcq": domain.is_mcq,
            }),
        ));

        let all_models = self.models_snapshot();
        if all_models.is_empty() {
            return Err(Error::configuration("no models registered"));
        }

        // Tier filtering, active only when the caller names a tier and
        // policies exist.
        let mut tier_metadata: Vec<(String, String)> = Vec::new();
        let mut tier_max_cost = None;
        let candidates = match &query.options.user_tier {
            Some(tier) if !self.tiers.is_empty() => {
                let outcome = self.tiers.filter(tier, &all_models)?;
                tier_metadata.push(("tier_models".to_string(), outcome.models.len().to_string()));
                if outcome.degraded {
                    tier_metadata.push(("tier_degraded".to_string(), "true".to_string()));
                }
                if let Some(warning) = outcome.warning {
                    tier_metadata.push(("tier_warning".to_string(), warning));
                }
                tier_max_cost = outcome.constraints.max_cost;
                if let Some(min_quality) = outcome.constraints.min_quality {
                    tier_metadata.push(("tier_min_quality".to_string(), min_quality.to_string()));
                }
                if let Some(max_latency) = outcome.constraints.max_latency_ms {
                    tier_metadata.push(("tier_max_latency_ms".to_string(), max_latency.to_string()));
                }
                outcome.models
            }
            _ => all_models.as_ref().clone(),
        };

        // A domain strategy is usable only if its first step's model
        // survived tier filtering; otherwise routing must not reference it.
        let strategies = self.strategies_snapshot();
        let strategy = strategies
            .get(&domain.domain)
            .filter(|s| {
                s.steps
                    .first()
                    .is_some_and(|step| candidates.iter().any(|m| m.id == step.model))
            })
            .cloned();

        let input = RouteInput {
            complexity: complexity.complexity,
            complexity_confidence: complexity.confidence,
            domain: domain.domain,
            domain_confidence: domain.confidence.clamp(0.0, 1.0),
            force_direct: query.options.force_direct,
            user_tier: query.options.user_tier.clone(),
            metadata: query.options.metadata.clone(),
        };
        let mut decision = self.prerouter.route(&input, strategy.as_ref())?;
        for (key, value) in tier_metadata {
            decision.metadata.insert(key, value);
        }

        // Budget gate.
        if let Some(user) = &query.options.user_id {
            if self.budget.has_budget(user) {
                let projected = cheapest_model(&candidates)
                    .cost_of(estimate_tokens(&query.text), ESTIMATED_COMPLETION_TOKENS);
                match self.budget.precheck(user, projected).await {
                    Ok(verdict) => {
                        for warning in verdict.warnings {
                            self.bus.publish(&CascadeEvent::new(
                                EventKind::BudgetWarning,
                                query.id,
                                json!({
                                    "user_id": warning.user_id,
                                    "window": warning.window.as_str(),
                                    "consumed": warning.consumed,
                                    "projected": warning.projected,
                                    "cap": warning.cap,
                                }),
                            ));
                        }
                    }
                    Err(err) => {
                        self.bus.publish(&CascadeEvent::new(
                            EventKind::BudgetExceeded,
                            query.id,
                            json!({
                                "user_id": user,
                                "error": err.to_string(),
                            }),
                        ));
                        return Err(err);
                    }
                }
            }
        }

        let max_cost = match (query.options.max_cost, tier_max_cost) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        Ok(Prepared {
            complexity,
            domain,
            decision,
            candidates,
            strategy,
            max_cost,
        })
    }

    async fn execute(
        &self,
        query: &Query,
        cancel: &CancellationToken,
        partial_cost: &Arc<StdMutex<f64>>,
    ) -> Result<ExecutionResult> {
        let prepared = self.prepare(query).await?;
        self.dispatch(query, &prepared, cancel, partial_cost).await
    }

    async fn dispatch(
        &self,
        query: &Query,
        prepared: &Prepared,
        cancel: &CancellationToken,
        partial_cost: &Arc<StdMutex<f64>>,
    ) -> Result<ExecutionResult> {
        let started = Instant::now();
        match prepared.decision.strategy {
            RoutingStrategy::DirectCheap => {
                let model = cheapest_model(&prepared.candidates).clone();
                self.run_direct(query, prepared, model, started, cancel, partial_cost)
                    .await
            }
            RoutingStrategy::DirectBest => {
                let model = best_model(&prepared.candidates).clone();
                self.run_direct(query, prepared, model, started, cancel, partial_cost)
                    .await
            }
            RoutingStrategy::Cascade => {
                if prepared.strategy.as_ref().is_some_and(|s| s.steps.len() > 1) {
                    self.run_pipeline(query, prepared, started, cancel, partial_cost)
                        .await
                } else {
                    self.run_cascade(query, prepared, started, cancel, partial_cost)
                        .await
                }
            }
            RoutingStrategy::Parallel => {
                self.run_parallel(query, prepared, started, cancel, partial_cost)
                    .await
            }
        }
    }

    /// Single-model strategies: exactly one leg, no validation-driven
    /// escalation.
    async fn run_direct(
        &self,
        query: &Query,
        prepared: &Prepared,
        model: ModelConfig,
        started: Instant,
        cancel: &CancellationToken,
        partial_cost: &Arc<StdMutex<f64>>,
    ) -> Result<ExecutionResult> {
        let verifier = best_model(&prepared.candidates).clone();
        let regen = (verifier.id != model.id).then_some(&verifier);
        let outcome = self
            .run_model_loop(query, "direct", &model, self.user_messages(query, None), cancel, partial_cost, regen)
            .await?;

        if let Some(err) = outcome.error {
            let cost_incurred = outcome.cost > 0.0;
            return match err {
                Error::Validation(m) => Err(Error::Validation(m)),
                err => Err(Error::model_error("direct", err.to_string(), cost_incurred)),
            };
        }

        let step = step_from_outcome("direct", &outcome, StepStatus::Success, None, None);
        Ok(ExecutionResult::from_trace(
            query.id,
            outcome.content,
            outcome.model_used,
            prepared,
            vec![step],
            started,
            false,
            false,
            false,
        ))
    }

    /// The drafter/verifier cascade.
    async fn run_cascade(
        &self,
        query: &Query,
        prepared: &Prepared,
        started: Instant,
        cancel: &CancellationToken,
        partial_cost: &Arc<StdMutex<f64>>,
    ) -> Result<ExecutionResult> {
        let strategy = prepared.strategy.as_ref();
        let single_step = strategy.and_then(|s| s.steps.first());

        let drafter = single_step
            .and_then(|step| prepared.candidates.iter().find(|m| m.id == step.model))
            .unwrap_or_else(|| cheapest_model(&prepared.candidates))
            .clone();
        let verifier = best_model(&prepared.candidates).clone();

        let threshold = strategy
            .map(|s| s.threshold_for(prepared.complexity.complexity))
            .unwrap_or_else(|| prepared.complexity.complexity.default_threshold());
        let method = single_step
            .map(|s| s.validation.clone())
            .unwrap_or(ValidationMethod::QualityCheck);

        let collapsed = drafter.id == verifier.id;
        let draft_out = self
            .run_model_loop(
                query,
                "draft",
                &drafter,
                self.user_messages(query, None),
                cancel,
                partial_cost,
                (!collapsed).then_some(&verifier),
            )
            .await?;

        let mut trace: Vec<StepResult> = Vec::new();

        // A model set of size one collapses the pair: the single response is
        // accepted regardless of quality, since escalation could only repeat
        // the same model.
        if collapsed {
            if let Some(err) = draft_out.error {
                let cost_incurred = draft_out.cost > 0.0;
                return match err {
                    Error::Validation(m) => Err(Error::Validation(m)),
                    err => Err(Error::model_error("draft", err.to_string(), cost_incurred)),
                };
            }
            let report = self.validator.validate(&method, &query.text, &draft_out.content).await;
            self.bus.publish(&CascadeEvent::cascade_decision(
                query.id,
                true,
                "single candidate model",
                report.score,
            ));
            let step = step_from_outcome(
                "draft",
                &draft_out,
                StepStatus::Success,
                Some(report.score),
                Some(report),
            );
            trace.push(step);
            return Ok(ExecutionResult::from_trace(
                query.id,
                draft_out.content,
                draft_out.model_used,
                prepared,
                trace,
                started,
                true,
                true,
                false,
            ));
        }

        let escalate_reason = match draft_out.error {
            Some(Error::Validation(m)) => return Err(Error::Validation(m)),
            Some(ref err) => {
                trace.push(step_from_outcome(
                    "draft",
                    &draft_out,
                    StepStatus::FailedError,
                    None,
                    None,
                ));
                format!("drafter failed: {err}")
            }
            None => {
                let report = self
                    .validator
                    .validate(&method, &query.text, &draft_out.content)
                    .await;
                if report.score >= threshold {
                    self.bus.publish(&CascadeEvent::cascade_decision(
                        query.id,
                        true,
                        &format!("quality {:.2} meets threshold {:.2}", report.score, threshold),
                        report.score,
                    ));
                    let step = step_from_outcome(
                        "draft",
                        &draft_out,
                        StepStatus::Success,
                        Some(report.score),
                        Some(report),
                    );
                    trace.push(step);
                    return Ok(ExecutionResult::from_trace(
                        query.id,
                        draft_out.content,
                        draft_out.model_used,
                        prepared,
                        trace,
                        started,
                        true,
                        true,
                        false,
                    ));
                }
                let reason =
                    format!("quality {:.2} below threshold {:.2}", report.score, threshold);
                trace.push(step_from_outcome(
                    "draft",
                    &draft_out,
                    StepStatus::FailedQuality,
                    Some(report.score),
                    Some(report),
                ));
                reason
            }
        };

        // Cost cap: when escalating would have nothing left to spend,
        // return the draft if it exists at all.
        if let Some(cap) = prepared.max_cost {
            let spent: f64 = trace.iter().map(|s| s.cost).sum();
            if spent >= cap {
                if draft_out.error.is_none() {
                    warn!(query_id = %query.id, "cost cap reached; keeping draft despite low quality");
                    return Ok(ExecutionResult::from_trace(
                        query.id,
                        draft_out.content,
                        draft_out.model_used,
                        prepared,
                        trace,
                        started,
                        true,
                        false,
                        false,
                    ));
                }
                return Err(Error::model_error(
                    "draft",
                    "drafter failed and cost cap forbids escalation",
                    spent > 0.0,
                ));
            }
        }

        self.bus.publish(&CascadeEvent::cascade_decision(
            query.id,
            false,
            &escalate_reason,
            trace.last().and_then(|s| s.quality_score).unwrap_or(0.0),
        ));

        // Escalate: same messages, optionally with the draft as context.
        let draft_context = strategy
            .filter(|s| s.draft_as_context && draft_out.error.is_none())
            .map(|_| draft_out.content.clone());
        let verify_out = self
            .run_model_loop(
                query,
                "verify",
                &verifier,
                self.user_messages(query, draft_context.as_deref()),
                cancel,
                partial_cost,
                None,
            )
            .await?;

        match verify_out.error {
            Some(Error::Validation(m)) => Err(Error::Validation(m)),
            Some(ref err) => {
                let err_string = err.to_string();
                trace.push(step_from_outcome(
                    "verify",
                    &verify_out,
                    StepStatus::FailedError,
                    None,
                    None,
                ));
                let cost_incurred = trace.iter().map(|s| s.cost).sum::<f64>() > 0.0;
                Err(Error::model_error("verify", err_string, cost_incurred))
            }
            None => {
                trace.push(step_from_outcome(
                    "verify",
                    &verify_out,
                    StepStatus::Success,
                    None,
                    None,
                ));
                Ok(ExecutionResult::from_trace(
                    query.id,
                    verify_out.content,
                    verify_out.model_used,
                    prepared,
                    trace,
                    started,
                    true,
                    false,
                    true,
                ))
            }
        }
    }

    /// Multi-step domain pipeline with fallback-only legs.
    async fn run_pipeline(
        &self,
        query: &Query,
        prepared: &Prepared,
        started: Instant,
        cancel: &CancellationToken,
        partial_cost: &Arc<StdMutex<f64>>,
    ) -> Result<ExecutionResult> {
        let strategy = prepared
            .strategy
            .as_ref()
            .ok_or_else(|| Error::internal("pipeline dispatched without a strategy"))?;

        let mut trace: Vec<StepResult> = Vec::new();
        let mut prior_failed = false;
        let mut fallback_used = false;
        let mut last_success: Option<(String, String)> = None;
        let mut context: Option<String> = None;
        let mut last_step_name = String::new();

        for step in &strategy.steps {
            if step.fallback_only && !prior_failed {
                debug!(step = %step.name, "skipping fallback step; no prior failure");
                continue;
            }
            let Some(model) = prepared.candidates.iter().find(|m| m.id == step.model) else {
                warn!(step = %step.name, model = %step.model, "step model not in candidate set; skipping");
                continue;
            };
            last_step_name = step.name.clone();

            let outcome = self
                .run_model_loop(
                    query,
                    &step.name,
                    model,
                    self.user_messages(query, context.as_deref()),
                    cancel,
                    partial_cost,
                    None,
                )
                .await?;

            match outcome.error {
                Some(Error::Validation(m)) => return Err(Error::Validation(m)),
                Some(_) => {
                    trace.push(step_from_outcome(
                        &step.name,
                        &outcome,
                        StepStatus::FailedError,
                        None,
                        None,
                    ));
                    prior_failed = true;
                }
                None => {
                    let report = self
                        .validator
                        .validate(&step.validation, &query.text, &outcome.content)
                        .await;
                    let passed = report.score >= step.threshold;
                    self.bus.publish(&CascadeEvent::cascade_decision(
                        query.id,
                        passed,
                        &format!(
                            "step '{}' quality {:.2} vs threshold {:.2}",
                            step.name, report.score, step.threshold
                        ),
                        report.score,
                    ));
                    let status = if passed {
                        StepStatus::Success
                    } else {
                        StepStatus::FailedQuality
                    };
                    if passed {
                        if step.fallback_only {
                            fallback_used = true;
                        }
                        last_success = Some((outcome.content.clone(), outcome.model_used.clone()));
                    } else {
                        prior_failed = true;
                    }
                    trace.push(step_from_outcome(
                        &step.name,
                        &outcome,
                        status,
                        Some(report.score),
                        Some(report),
                    ));
                    context = Some(outcome.content);
                }
            }
        }

        match last_success {
            Some((response, model_used)) => {
                let executed = trace.len();
                let draft_accepted = executed == 1 && trace[0].status == StepStatus::Success;
                Ok(ExecutionResult::from_trace(
                    query.id,
                    response,
                    model_used,
                    prepared,
                    trace,
                    started,
                    true,
                    draft_accepted,
                    fallback_used,
                ))
            }
            None => {
                let cost_incurred = trace.iter().map(|s| s.cost).sum::<f64>() > 0.0;
                Err(Error::model_error(
                    last_step_name,
                    "every pipeline step failed",
                    cost_incurred,
                ))
            }
        }
    }

    /// Drafter and verifier race; the verifier's answer is preferred when
    /// both succeed.
    async fn run_parallel(
        &self,
        query: &Query,
        prepared: &Prepared,
        started: Instant,
        cancel: &CancellationToken,
        partial_cost: &Arc<StdMutex<f64>>,
    ) -> Result<ExecutionResult> {
        let drafter = cheapest_model(&prepared.candidates).clone();
        let verifier = best_model(&prepared.candidates).clone();

        if drafter.id == verifier.id {
            return self
                .run_direct(query, prepared, drafter, started, cancel, partial_cost)
                .await;
        }

        let (draft_out, verify_out) = tokio::join!(
            self.run_model_loop(
                query,
                "parallel-draft",
                &drafter,
                self.user_messages(query, None),
                cancel,
                partial_cost,
                None,
            ),
            self.run_model_loop(
                query,
                "parallel-verify",
                &verifier,
                self.user_messages(query, None),
                cancel,
                partial_cost,
                None,
            ),
        );
        let draft_out = draft_out?;
        let verify_out = verify_out?;

        let mut trace = Vec::new();
        trace.push(step_from_outcome(
            "parallel-draft",
            &draft_out,
            if draft_out.error.is_none() {
                StepStatus::Success
            } else {
                StepStatus::FailedError
            },
            None,
            None,
        ));
        trace.push(step_from_outcome(
            "parallel-verify",
            &verify_out,
            if verify_out.error.is_none() {
                StepStatus::Success
            } else {
                StepStatus::FailedError
            },
            None,
            None,
        ));

        let chosen = if verify_out.error.is_none() {
            Some((verify_out.content.clone(), verify_out.model_used.clone()))
        } else if draft_out.error.is_none() {
            Some((draft_out.content.clone(), draft_out.model_used.clone()))
        } else {
            None
        };

        match chosen {
            Some((response, model_used)) => Ok(ExecutionResult::from_trace(
                query.id,
                response,
                model_used,
                prepared,
                trace,
                started,
                false,
                false,
                false,
            )),
            None => {
                let cost_incurred = trace.iter().map(|s| s.cost).sum::<f64>() > 0.0;
                Err(Error::model_error(
                    "parallel-verify",
                    "both parallel legs failed",
                    cost_incurred,
                ))
            }
        }
    }

    fn user_messages(&self, query: &Query, context: Option<&str>) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::user(&query.text)];
        if let Some(context) = context {
            messages.push(ChatMessage::user(format!(
                "Context from previous step:\n{context}"
            )));
        }
        messages
    }

    fn base_request(&self, query: &Query, model: &ModelConfig) -> ProviderRequest {
        let mut request = ProviderRequest::new(&model.id)
            .with_messages(self.user_messages(query, None))
            .with_timeout(self.call_timeout(model));
        if model.capabilities.supports_system_messages {
            if let Some(system) = &self.config.system_prompt {
                request = request.with_system(system);
            }
        }
        if model.capabilities.supports_tools && !query.tools.is_empty() {
            request = request.with_tools(query.tools.clone());
        }
        request
    }

    fn call_timeout(&self, model: &ModelConfig) -> Duration {
        model
            .call_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.config.call_timeout)
    }

    /// One step's model loop: invoke, execute tool calls through the host,
    /// re-invoke, up to the iteration cap. Provider failures end the loop in
    /// `outcome.error`; cancellation propagates as `Err`.
    #[allow(clippy::too_many_arguments)]
    async fn run_model_loop(
        &self,
        query: &Query,
        step_name: &str,
        model: &ModelConfig,
        mut messages: Vec<ChatMessage>,
        cancel: &CancellationToken,
        partial_cost: &Arc<StdMutex<f64>>,
        regen_model: Option<&ModelConfig>,
    ) -> Result<LoopOutcome> {
        let mut current = model.clone();
        let mut outcome = LoopOutcome {
            content: String::new(),
            usage: UsageDetails::default(),
            cost: 0.0,
            latency_ms: 0,
            tool_rounds: 0,
            model_used: model.id.clone(),
            provider: model.provider.clone(),
            error: None,
        };
        let tools: Vec<Tool> = if model.capabilities.supports_tools {
            query.tools.clone()
        } else {
            Vec::new()
        };
        let mut answered: HashSet<String> = HashSet::new();
        let mut regenerated = false;
        let mut handoff_final = false;

        loop {
            let request = {
                let mut request = ProviderRequest::new(&current.id)
                    .with_messages(messages.clone())
                    .with_timeout(self.call_timeout(&current));
                if current.capabilities.supports_system_messages {
                    if let Some(system) = &self.config.system_prompt {
                        request = request.with_system(system);
                    }
                }
                if !tools.is_empty() {
                    request = request.with_tools(tools.clone());
                }
                request
            };

            let record = match self
                .call_model(query.id, step_name, &current, request, cancel, partial_cost)
                .await
            {
                Ok(record) => record,
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(err) => {
                    outcome.error = Some(err);
                    return Ok(outcome);
                }
            };

            outcome.cost += record.cost;
            outcome.latency_ms += record.latency_ms;
            accumulate_usage(&mut outcome.usage, &record.response.usage);
            outcome.model_used = current.id.clone();
            outcome.provider = current.provider.clone();
            outcome.content = record.response.content.clone();

            let response = record.response;
            if response.tool_calls.is_empty()
                || tools.is_empty()
                || handoff_final
                || outcome.tool_rounds >= self.config.max_tool_iterations
            {
                return Ok(outcome);
            }

            // Validate each call's arguments against its schema; ids must be
            // fresh within this query step.
            let mut valid = Vec::new();
            let mut invalid = Vec::new();
            for call in response.tool_calls {
                if tool_call_is_valid(&call, &tools, &answered) {
                    valid.push(call);
                } else {
                    invalid.push(call);
                }
            }

            if !invalid.is_empty() && self.config.strict_tool_validation {
                match regen_model {
                    Some(regen) if !regenerated => {
                        // Regenerate the whole response on the verifier.
                        warn!(step = step_name, "malformed tool call; regenerating via verifier");
                        regenerated = true;
                        current = regen.clone();
                        continue;
                    }
                    _ => {
                        outcome.error = Some(Error::Validation(format!(
                            "malformed tool call '{}' on step '{step_name}'",
                            invalid[0].name
                        )));
                        return Ok(outcome);
                    }
                }
            }

            if valid.is_empty() {
                // Nothing executable; the text response is the answer.
                return Ok(outcome);
            }

            messages.push(ChatMessage::assistant_tool_calls(
                response.content.clone(),
                valid.clone(),
            ));

            let mut handoff = false;
            for call in valid {
                answered.insert(call.id.clone());
                if self.config.handoff_tools.contains(&call.name) {
                    handoff = true;
                }
                // Host tool failures are propagated as tool-result messages;
                // the model decides how to recover.
                let result_text = match &self.tool_handler {
                    Some(handler) => handler
                        .execute(&call)
                        .await
                        .unwrap_or_else(|e| format!("tool error: {e}")),
                    None => "tool error: no tool handler configured".to_string(),
                };
                messages.push(ChatMessage::tool_result(call.id, result_text));
            }
            outcome.tool_rounds += 1;

            if handoff {
                if let Some(regen) = regen_model {
                    debug!(step = step_name, "tool handoff: final invocation on verifier");
                    current = regen.clone();
                    handoff_final = true;
                }
            }
        }
    }

    /// One provider invocation with the single transient retry and the
    /// per-call timeout. Publishes model-call events and accumulates the
    /// partial-cost cell for truth-in-accounting.
    async fn call_model(
        &self,
        query_id: Uuid,
        step_name: &str,
        model: &ModelConfig,
        request: ProviderRequest,
        cancel: &CancellationToken,
        partial_cost: &Arc<StdMutex<f64>>,
    ) -> Result<CallRecord> {
        let provider = self.providers.get(&model.provider).ok_or_else(|| {
            Error::configuration(format!("provider '{}' not registered", model.provider))
        })?;
        let limiter = self
            .provider_limits
            .get(&model.provider)
            .ok_or_else(|| Error::internal("provider limiter missing"))?;
        let _permit = limiter.acquire(cancel).await?;

        self.bus.publish(&CascadeEvent::model_call_start(
            query_id,
            &model.id,
            &model.provider,
            step_name,
        ));

        let timeout = request.timeout.unwrap_or(self.config.call_timeout);
        let mut attempt: u32 = 0;
        loop {
            let started = Instant::now();
            let result = tokio::select! {
                _ = cancel.cancelled() => Err(Error::Cancelled),
                timed = tokio::time::timeout(timeout, provider.generate(request.clone())) => {
                    match timed {
                        Ok(inner) => inner,
                        // A per-call timeout is a transient failure.
                        Err(_) => Err(Error::transient(
                            &model.provider,
                            format!("model call timed out after {}ms", timeout.as_millis()),
                        )),
                    }
                }
            };

            match result {
                Ok(response) => {
                    let latency_ms = started.elapsed().as_millis() as u64;
                    let cost = provider.cost_of(
                        response.usage.prompt_tokens,
                        response.usage.completion_tokens,
                        model,
                    );
                    *partial_cost.lock().expect("cost cell poisoned") += cost;
                    self.bus.publish(&CascadeEvent::model_call_complete(
                        query_id, &model.id, step_name, cost, latency_ms,
                    ));
                    return Ok(CallRecord {
                        response,
                        cost,
                        latency_ms,
                    });
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(err) if err.is_transient() && attempt == 0 => {
                    attempt += 1;
                    let jitter = 1.0 + rand::random::<f64>();
                    let delay = self.config.retry_base_delay.mul_f64(jitter);
                    debug!(step = step_name, error = %err, delay_ms = delay.as_millis() as u64, "transient provider error; retrying once");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    self.bus.publish(&CascadeEvent::model_call_error(
                        query_id,
                        &model.id,
                        step_name,
                        &err.to_string(),
                    ));
                    return Err(err);
                }
            }
        }
    }
}

struct CallRecord {
    response: ProviderResponse,
    cost: f64,
    latency_ms: u64,
}

fn accumulate_usage(total: &mut UsageDetails, delta: &UsageDetails) {
    total.prompt_tokens += delta.prompt_tokens;
    total.completion_tokens += delta.completion_tokens;
    total.total_tokens += delta.total_tokens;
    if let Some(reasoning) = delta.reasoning_tokens {
        *total.reasoning_tokens.get_or_insert(0) += reasoning;
    }
}

fn step_from_outcome(
    name: &str,
    outcome: &LoopOutcome,
    status: StepStatus,
    quality_score: Option<f64>,
    validation: Option<ValidationReport>,
) -> StepResult {
    StepResult {
        step_name: name.to_string(),
        model_used: outcome.model_used.clone(),
        provider: outcome.provider.clone(),
        status,
        response: (!outcome.content.is_empty()).then(|| outcome.content.clone()),
        quality_score,
        validation,
        cost: outcome.cost,
        latency_ms: outcome.latency_ms,
        usage: outcome.usage.clone(),
        tool_calls: outcome.tool_rounds,
        error: outcome.error.as_ref().map(|e| e.to_string()),
    }
}

/// Cheapest candidate by blended per-token rate.
fn cheapest_model(models: &[ModelConfig]) -> &ModelConfig {
    models
        .iter()
        .min_by(|a, b| {
            a.blended_rate()
                .partial_cmp(&b.blended_rate())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .expect("candidate set is never empty")
}

/// Best candidate: cost as the primary sort, capability count as the
/// tie-break.
fn best_model(models: &[ModelConfig]) -> &ModelConfig {
    models
        .iter()
        .max_by(|a, b| {
            a.blended_rate()
                .partial_cmp(&b.blended_rate())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| capability_count(a).cmp(&capability_count(b)))
        })
        .expect("candidate set is never empty")
}

fn capability_count(model: &ModelConfig) -> u8 {
    u8::from(model.capabilities.supports_tools)
        + u8::from(model.capabilities.supports_streaming)
        + u8::from(model.capabilities.supports_system_messages)
        + u8::from(model.capabilities.is_reasoning)
}

/// A tool call is valid when it names a known tool, carries a JSON object
/// for arguments, satisfies the tool's required list, and reuses no
/// previously answered call id.
fn tool_call_is_valid(call: &ToolCall, tools: &[Tool], answered: &HashSet<String>) -> bool {
    if answered.contains(&call.id) {
        return false;
    }
    let Some(tool) = tools.iter().find(|t| t.name == call.name) else {
        return false;
    };
    let Some(args) = call.arguments.as_object() else {
        return false;
    };
    tool.required.iter().all(|field| args.contains_key(field))
}
