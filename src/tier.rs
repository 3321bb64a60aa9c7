//! Caller-tier model filtering.
//!
//! Tiers constrain which models a caller may reach and attach hard caps
//! (cost, quality floor, latency) that the executor enforces downstream.
//! With no tier on the query the router is inert and adds zero overhead.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::types::ModelConfig;

/// Allow-list wildcard.
pub const ALLOW_ALL: &str = "*";

/// Policy for one caller tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierPolicy {
    pub name: String,
    /// Model names this tier may use; `["*"]` allows everything.
    pub allow: Vec<String>,
    /// Model names this tier may never use; checked before the allow-list.
    #[serde(default)]
    pub deny: Vec<String>,
    /// Hard per-query cost cap in USD.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost: Option<f64>,
    /// Minimum acceptable quality score.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_quality: Option<f64>,
    /// Hard latency cap in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_latency_ms: Option<u64>,
    /// When filtering empties the candidate set, fall back to the single
    /// cheapest model instead of failing with `tier_no_models`.
    #[serde(default = "default_true")]
    pub fallback_to_cheapest: bool,
}

fn default_true() -> bool {
    true
}

impl TierPolicy {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            allow: vec![ALLOW_ALL.to_string()],
            deny: Vec::new(),
            max_cost: None,
            min_quality: None,
            max_latency_ms: None,
            fallback_to_cheapest: true,
        }
    }

    pub fn with_allow(mut self, allow: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.allow = allow.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_deny(mut self, deny: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.deny = deny.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_cost(mut self, usd: f64) -> Self {
        self.max_cost = Some(usd);
        self
    }

    pub fn with_min_quality(mut self, quality: f64) -> Self {
        self.min_quality = Some(quality);
        self
    }

    pub fn with_max_latency_ms(mut self, ms: u64) -> Self {
        self.max_latency_ms = Some(ms);
        self
    }

    pub fn without_fallback(mut self) -> Self {
        self.fallback_to_cheapest = false;
        self
    }

    fn allows(&self, model: &str) -> bool {
        if self.deny.iter().any(|d| d == model) {
            return false;
        }
        self.allow.iter().any(|a| a == ALLOW_ALL) || self.allow.iter().any(|a| a == model)
    }
}

/// Hard caps a tier attaches to the routing decision.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TierConstraints {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_cost: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_quality: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_latency_ms: Option<u64>,
}

/// Result of tier-filtering the candidate model set.
#[derive(Debug, Clone, PartialEq)]
pub struct TierFilterOutcome {
    pub models: Vec<ModelConfig>,
    pub constraints: TierConstraints,
    /// The allow/deny filter emptied the set and the cheapest-model
    /// fallback kicked in.
    pub degraded: bool,
    pub warning: Option<String>,
}

/// Registry of tier policies.
#[derive(Debug, Clone, Default)]
pub struct TierRouter {
    policies: HashMap<String, TierPolicy>,
}

impl TierRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(mut self, policy: TierPolicy) -> Self {
        self.policies.insert(policy.name.clone(), policy);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Filter the candidate models for a named tier.
    ///
    /// An unknown tier is a configuration error. An emptied set falls back
    /// to the single cheapest model of the original list when the policy
    /// permits, otherwise fails with `tier_no_models`.
    pub fn filter(&self, tier: &str, models: &[ModelConfig]) -> Result<TierFilterOutcome> {
        let policy = self
            .policies
            .get(tier)
            .ok_or_else(|| Error::configuration(format!("unknown tier '{tier}'")))?;

        let constraints = TierConstraints {
            max_cost: policy.max_cost,
            min_quality: policy.min_quality,
            max_latency_ms: policy.max_latency_ms,
        };

        let filtered: Vec<ModelConfig> = models
            .iter()
            .filter(|m| policy.allows(&m.id))
            .cloned()
            .collect();

        if !filtered.is_empty() {
            return Ok(TierFilterOutcome {
                models: filtered,
                constraints,
                degraded: false,
                warning: None,
            });
        }

        if policy.fallback_to_cheapest {
            let cheapest = models
                .iter()
                .min_by(|a, b| {
                    a.blended_rate()
                        .partial_cmp(&b.blended_rate())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .cloned()
                .ok_or_else(|| Error::TierNoModels { tier: tier.to_string() })?;
            let warning = format!(
                "tier '{tier}' filtered out every model; falling back to cheapest '{}'",
                cheapest.id
            );
            tracing::warn!(tier, model = %cheapest.id, "tier filter emptied the model set");
            return Ok(TierFilterOutcome {
                models: vec![cheapest],
                constraints,
                degraded: true,
                warning: Some(warning),
            });
        }

        Err(Error::TierNoModels { tier: tier.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn models() -> Vec<ModelConfig> {
        vec![
            ModelConfig::new("openai", "cheap", 0.05, 0.2),
            ModelConfig::new("openai", "mid", 0.5, 2.0),
            ModelConfig::new("anthropic", "premium", 3.0, 15.0),
        ]
    }

    #[test]
    fn test_wildcard_allows_everything_minus_deny() {
        let router = TierRouter::new()
            .with_policy(TierPolicy::new("pro").with_deny(["premium"]));
        let outcome = router.filter("pro", &models()).unwrap();
        let ids: Vec<&str> = outcome.models.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["cheap", "mid"]);
        assert!(!outcome.degraded);
    }

    #[test]
    fn test_allow_list_restricts() {
        let router = TierRouter::new()
            .with_policy(TierPolicy::new("free").with_allow(["cheap"]));
        let outcome = router.filter("free", &models()).unwrap();
        assert_eq!(outcome.models.len(), 1);
        assert_eq!(outcome.models[0].id, "cheap");
    }

    #[test]
    fn test_deny_beats_allow() {
        let router = TierRouter::new()
            .with_policy(TierPolicy::new("odd").with_allow(["cheap"]).with_deny(["cheap"]));
        let outcome = router.filter("odd", &models()).unwrap();
        // Everything filtered out: cheapest fallback with a warning.
        assert!(outcome.degraded);
        assert_eq!(outcome.models[0].id, "cheap");
        assert!(outcome.warning.is_some());
    }

    #[test]
    fn test_empty_allow_list_falls_back_to_cheapest() {
        let router = TierRouter::new()
            .with_policy(TierPolicy::new("none").with_allow(Vec::<String>::new()));
        let outcome = router.filter("none", &models()).unwrap();
        assert!(outcome.degraded);
        assert_eq!(outcome.models[0].id, "cheap");
    }

    #[test]
    fn test_empty_allow_list_without_fallback_fails() {
        let router = TierRouter::new().with_policy(
            TierPolicy::new("strict")
                .with_allow(Vec::<String>::new())
                .without_fallback(),
        );
        let err = router.filter("strict", &models()).unwrap_err();
        assert_eq!(err.kind(), "tier_no_models");
    }

    #[test]
    fn test_unknown_tier_is_configuration_error() {
        let router = TierRouter::new();
        let err = router.filter("ghost", &models()).unwrap_err();
        assert_eq!(err.kind(), "configuration_error");
    }

    #[test]
    fn test_constraints_are_attached() {
        let router = TierRouter::new().with_policy(
            TierPolicy::new("capped")
                .with_max_cost(0.05)
                .with_min_quality(0.6)
                .with_max_latency_ms(5_000),
        );
        let outcome = router.filter("capped", &models()).unwrap();
        assert_eq!(outcome.constraints.max_cost, Some(0.05));
        assert_eq!(outcome.constraints.min_quality, Some(0.6));
        assert_eq!(outcome.constraints.max_latency_ms, Some(5_000));
    }

    #[test]
    fn test_no_models_at_all() {
        let router = TierRouter::new().with_policy(TierPolicy::new("any"));
        let err = router.filter("any", &[]).unwrap_err();
        assert_eq!(err.kind(), "tier_no_models");
    }
}
