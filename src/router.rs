//! Strategy pre-routing.
//!
//! The PreRouter maps `(complexity, domain, context)` to a routing strategy
//! through a fixed priority chain; the first rule that fires wins:
//!
//! 1. caller `force_direct`
//! 2. cascade disabled globally
//! 3. caller rule-engine decision
//! 4. domain strategy demanding the verifier
//! 5. domain strategy whose complexity set matches
//! 6. domain strategy with no complexity restriction
//! 7. trivial/simple/moderate complexity
//! 8. hard/expert complexity
//!
//! Routing is a pure function of its inputs; the only mutation is a set of
//! monotonic statistics counters safe for concurrent reads.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::complexity::Complexity;
use crate::domain::Domain;
use crate::error::{Error, Result};
use crate::strategy::DomainStrategy;

/// Execution strategy for one query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingStrategy {
    /// Single call to the cheapest candidate.
    DirectCheap,
    /// Single call to the best candidate.
    DirectBest,
    /// Drafter, validate, escalate to verifier if needed.
    Cascade,
    /// Drafter and verifier race concurrently.
    Parallel,
}

impl RoutingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DirectCheap => "direct-cheap",
            Self::DirectBest => "direct-best",
            Self::Cascade => "cascade",
            Self::Parallel => "parallel",
        }
    }
}

impl std::fmt::Display for RoutingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the PreRouter looks at for one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteInput {
    pub complexity: Complexity,
    pub complexity_confidence: f64,
    pub domain: Domain,
    pub domain_confidence: f64,
    #[serde(default)]
    pub force_direct: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_tier: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

/// The routing verdict handed to the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub strategy: RoutingStrategy,
    pub reason: String,
    /// In [0, 1]; a value outside the range is a programming error.
    pub confidence: f64,
    pub metadata: HashMap<String, String>,
}

impl RoutingDecision {
    pub fn new(
        strategy: RoutingStrategy,
        reason: impl Into<String>,
        confidence: f64,
        metadata: HashMap<String, String>,
    ) -> Result<Self> {
        if !(0.0..=1.0).contains(&confidence) {
            return Err(Error::internal(format!(
                "routing confidence {confidence} outside [0, 1]"
            )));
        }
        Ok(Self {
            strategy,
            reason: reason.into(),
            confidence,
            metadata,
        })
    }
}

/// Caller-supplied routing rule: first rule returning `Some` wins at
/// priority 3.
pub type RoutingRule = Arc<dyn Fn(&RouteInput) -> Option<RoutingStrategy> + Send + Sync>;

/// Monotonic routing counters. Plain atomics: increments on the hot path,
/// reads from anywhere.
#[derive(Debug, Default)]
pub struct RouterStats {
    total_queries: AtomicU64,
    by_complexity: [AtomicU64; 5],
    by_strategy: [AtomicU64; 4],
    forced_direct: AtomicU64,
    cascade_disabled: AtomicU64,
}

impl RouterStats {
    fn record(&self, complexity: Complexity, strategy: RoutingStrategy) {
        self.total_queries.fetch_add(1, Ordering::Relaxed);
        self.by_complexity[complexity as usize].fetch_add(1, Ordering::Relaxed);
        self.by_strategy[strategy_index(strategy)].fetch_add(1, Ordering::Relaxed);
    }

    /// Consistent-enough snapshot for dashboards; individual counters are
    /// exact, cross-counter skew is bounded by in-flight queries.
    pub fn snapshot(&self) -> RouterStatsSnapshot {
        RouterStatsSnapshot {
            total_queries: self.total_queries.load(Ordering::Relaxed),
            by_complexity: COMPLEXITIES
                .iter()
                .enumerate()
                .map(|(i, c)| (c.as_str().to_string(), self.by_complexity[i].load(Ordering::Relaxed)))
                .collect(),
            by_strategy: STRATEGIES
                .iter()
                .enumerate()
                .map(|(i, s)| (s.as_str().to_string(), self.by_strategy[i].load(Ordering::Relaxed)))
                .collect(),
            forced_direct: self.forced_direct.load(Ordering::Relaxed),
            cascade_disabled: self.cascade_disabled.load(Ordering::Relaxed),
        }
    }
}

const COMPLEXITIES: [Complexity; 5] = [
    Complexity::Trivial,
    Complexity::Simple,
    Complexity::Moderate,
    Complexity::Hard,
    Complexity::Expert,
];

const STRATEGIES: [RoutingStrategy; 4] = [
    RoutingStrategy::DirectCheap,
    RoutingStrategy::DirectBest,
    RoutingStrategy::Cascade,
    RoutingStrategy::Parallel,
];

fn strategy_index(strategy: RoutingStrategy) -> usize {
    STRATEGIES.iter().position(|s| *s == strategy).unwrap_or(0)
}

/// Serializable view of the routing counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterStatsSnapshot {
    pub total_queries: u64,
    pub by_complexity: HashMap<String, u64>,
    pub by_strategy: HashMap<String, u64>,
    pub forced_direct: u64,
    pub cascade_disabled: u64,
}

/// The strategy pre-router.
pub struct PreRouter {
    cascade_enabled: bool,
    rules: Vec<(String, RoutingRule)>,
    stats: RouterStats,
}

impl PreRouter {
    pub fn new() -> Self {
        Self {
            cascade_enabled: true,
            rules: Vec::new(),
            stats: RouterStats::default(),
        }
    }

    /// Disable the cascade globally: every query routes `direct-best`.
    pub fn with_cascade_enabled(mut self, enabled: bool) -> Self {
        self.cascade_enabled = enabled;
        self
    }

    /// Register a named rule-engine predicate, evaluated in registration
    /// order at priority 3.
    pub fn with_rule(mut self, name: impl Into<String>, rule: RoutingRule) -> Self {
        self.rules.push((name.into(), rule));
        self
    }

    pub fn stats(&self) -> RouterStatsSnapshot {
        self.stats.snapshot()
    }

    /// Pick a strategy for one query.
    ///
    /// Pure apart from counter increments: the same `(input, strategy)`
    /// always yields the same decision.
    pub fn route(
        &self,
        input: &RouteInput,
        domain_strategy: Option<&DomainStrategy>,
    ) -> Result<RoutingDecision> {
        let mut metadata = HashMap::from([
            ("complexity".to_string(), input.complexity.as_str().to_string()),
            ("domain".to_string(), input.domain.as_str().to_string()),
            (
                "cascade_enabled".to_string(),
                self.cascade_enabled.to_string(),
            ),
        ]);
        if let Some(tier) = &input.user_tier {
            metadata.insert("tier".to_string(), tier.clone());
        }

        // 1. Caller override.
        if input.force_direct {
            self.stats.forced_direct.fetch_add(1, Ordering::Relaxed);
            metadata.insert("router_type".to_string(), "forced".to_string());
            return self.decide(
                RoutingStrategy::DirectBest,
                "caller forced direct execution",
                1.0,
                metadata,
                input,
            );
        }

        // 2. Global cascade switch.
        if !self.cascade_enabled {
            self.stats.cascade_disabled.fetch_add(1, Ordering::Relaxed);
            metadata.insert("router_type".to_string(), "cascade_disabled".to_string());
            return self.decide(
                RoutingStrategy::DirectBest,
                "cascade disabled globally",
                1.0,
                metadata,
                input,
            );
        }

        // 3. Rule engine.
        for (name, rule) in &self.rules {
            if let Some(strategy) = rule(input) {
                metadata.insert("router_type".to_string(), "rule_engine".to_string());
                metadata.insert("matched_rule".to_string(), name.clone());
                return self.decide(
                    strategy,
                    format!("rule '{name}' matched"),
                    1.0,
                    metadata,
                    input,
                );
            }
        }

        // 4-6. Domain strategy.
        if let Some(cfg) = domain_strategy {
            if cfg.require_verifier {
                metadata.insert("router_type".to_string(), "domain_strategy".to_string());
                return self.decide(
                    RoutingStrategy::DirectBest,
                    format!("domain '{}' strategy requires the verifier", cfg.domain),
                    input.domain_confidence,
                    metadata,
                    input,
                );
            }
            if cfg.cascades_at(input.complexity) {
                let restricted = cfg.cascade_complexities.is_some();
                metadata.insert(
                    "router_type".to_string(),
                    if restricted {
                        "domain_complexity".to_string()
                    } else {
                        "domain_strategy".to_string()
                    },
                );
                let reason = if restricted {
                    format!(
                        "domain '{}' strategy cascades at {} complexity",
                        cfg.domain, input.complexity
                    )
                } else {
                    format!("domain '{}' strategy configured", cfg.domain)
                };
                return self.decide(
                    RoutingStrategy::Cascade,
                    reason,
                    input.domain_confidence,
                    metadata,
                    input,
                );
            }
            // Restricted strategy that does not match falls through to the
            // complexity rules.
        }

        // 7-8. Complexity bands.
        metadata.insert("router_type".to_string(), "complexity".to_string());
        if input.complexity <= Complexity::Moderate {
            self.decide(
                RoutingStrategy::Cascade,
                format!("{} complexity suits the cascade", input.complexity),
                input.complexity_confidence,
                metadata,
                input,
            )
        } else {
            self.decide(
                RoutingStrategy::DirectBest,
                format!("{} complexity demands the best model", input.complexity),
                input.complexity_confidence,
                metadata,
                input,
            )
        }
    }

    fn decide(
        &self,
        strategy: RoutingStrategy,
        reason: impl Into<String>,
        confidence: f64,
        metadata: HashMap<String, String>,
        input: &RouteInput,
    ) -> Result<RoutingDecision> {
        self.stats.record(input.complexity, strategy);
        RoutingDecision::new(strategy, reason, confidence, metadata)
    }
}

impl Default for PreRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::CascadeStep;
    use pretty_assertions::assert_eq;

    fn input(complexity: Complexity) -> RouteInput {
        RouteInput {
            complexity,
            complexity_confidence: 0.8,
            domain: Domain::General,
            domain_confidence: 0.6,
            force_direct: false,
            user_tier: None,
            metadata: HashMap::new(),
        }
    }

    fn code_strategy() -> DomainStrategy {
        DomainStrategy::new(
            Domain::Code,
            vec![CascadeStep::new("draft", "cheap", "prov")],
        )
        .unwrap()
    }

    #[test]
    fn test_force_direct_wins() {
        let router = PreRouter::new();
        let mut i = input(Complexity::Trivial);
        i.force_direct = true;
        let decision = router.route(&i, Some(&code_strategy())).unwrap();
        assert_eq!(decision.strategy, RoutingStrategy::DirectBest);
        assert_eq!(decision.metadata["router_type"], "forced");
    }

    #[test]
    fn test_cascade_disabled_routes_direct() {
        let router = PreRouter::new().with_cascade_enabled(false);
        let decision = router.route(&input(Complexity::Trivial), None).unwrap();
        assert_eq!(decision.strategy, RoutingStrategy::DirectBest);
        assert_eq!(decision.metadata["router_type"], "cascade_disabled");
    }

    #[test]
    fn test_rule_engine_beats_domain_strategy() {
        let router = PreRouter::new().with_rule(
            "tool-queries-parallel",
            Arc::new(|i: &RouteInput| {
                (i.domain == Domain::Tool).then_some(RoutingStrategy::Parallel)
            }),
        );
        let mut i = input(Complexity::Simple);
        i.domain = Domain::Tool;
        let decision = router.route(&i, None).unwrap();
        assert_eq!(decision.strategy, RoutingStrategy::Parallel);
        assert_eq!(decision.metadata["matched_rule"], "tool-queries-parallel");
    }

    #[test]
    fn test_require_verifier_routes_direct() {
        let router = PreRouter::new();
        let strategy = code_strategy().require_verifier();
        let decision = router
            .route(&input(Complexity::Trivial), Some(&strategy))
            .unwrap();
        assert_eq!(decision.strategy, RoutingStrategy::DirectBest);
    }

    #[test]
    fn test_domain_strategy_complexity_match() {
        let router = PreRouter::new();
        let strategy = code_strategy()
            .with_cascade_complexities([Complexity::Simple, Complexity::Moderate]);

        let hit = router.route(&input(Complexity::Simple), Some(&strategy)).unwrap();
        assert_eq!(hit.strategy, RoutingStrategy::Cascade);
        assert_eq!(hit.metadata["router_type"], "domain_complexity");

        // Outside the set, the complexity rules take over.
        let miss = router.route(&input(Complexity::Expert), Some(&strategy)).unwrap();
        assert_eq!(miss.strategy, RoutingStrategy::DirectBest);
        assert_eq!(miss.metadata["router_type"], "complexity");
    }

    #[test]
    fn test_unrestricted_domain_strategy_cascades() {
        let router = PreRouter::new();
        let decision = router
            .route(&input(Complexity::Expert), Some(&code_strategy()))
            .unwrap();
        assert_eq!(decision.strategy, RoutingStrategy::Cascade);
    }

    #[test]
    fn test_complexity_split() {
        let router = PreRouter::new();
        for c in [Complexity::Trivial, Complexity::Simple, Complexity::Moderate] {
            assert_eq!(
                router.route(&input(c), None).unwrap().strategy,
                RoutingStrategy::Cascade
            );
        }
        for c in [Complexity::Hard, Complexity::Expert] {
            assert_eq!(
                router.route(&input(c), None).unwrap().strategy,
                RoutingStrategy::DirectBest
            );
        }
    }

    #[test]
    fn test_routing_is_pure() {
        let router = PreRouter::new();
        let a = router.route(&input(Complexity::Moderate), None).unwrap();
        let b = router.route(&input(Complexity::Moderate), None).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_counters_accumulate() {
        let router = PreRouter::new();
        router.route(&input(Complexity::Trivial), None).unwrap();
        router.route(&input(Complexity::Expert), None).unwrap();
        let mut forced = input(Complexity::Simple);
        forced.force_direct = true;
        router.route(&forced, None).unwrap();

        let stats = router.stats();
        assert_eq!(stats.total_queries, 3);
        assert_eq!(stats.by_complexity["trivial"], 1);
        assert_eq!(stats.by_strategy["cascade"], 1);
        assert_eq!(stats.by_strategy["direct-best"], 2);
        assert_eq!(stats.forced_direct, 1);
    }

    #[test]
    fn test_confidence_out_of_range_is_internal_error() {
        let err = RoutingDecision::new(RoutingStrategy::Cascade, "r", 1.2, HashMap::new())
            .unwrap_err();
        assert_eq!(err.kind(), "internal_error");
    }

    #[test]
    fn test_decision_metadata_explains_rule() {
        let router = PreRouter::new();
        let decision = router.route(&input(Complexity::Hard), None).unwrap();
        assert_eq!(decision.metadata["complexity"], "hard");
        assert_eq!(decision.metadata["domain"], "general");
        assert_eq!(decision.metadata["cascade_enabled"], "true");
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn decisions_are_pure_with_confidence_in_range(
                c_idx in 0usize..COMPLEXITIES.len(),
                conf in 0.0f64..=1.0,
                force in proptest::bool::ANY,
            ) {
                let router = PreRouter::new();
                let input = RouteInput {
                    complexity: COMPLEXITIES[c_idx],
                    complexity_confidence: conf,
                    domain: Domain::General,
                    domain_confidence: conf,
                    force_direct: force,
                    user_tier: None,
                    metadata: HashMap::new(),
                };
                let a = router.route(&input, None).unwrap();
                let b = router.route(&input, None).unwrap();
                prop_assert_eq!(&a, &b);
                prop_assert!((0.0..=1.0).contains(&a.confidence));
            }
        }
    }
}
