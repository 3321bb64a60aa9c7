//! Domain strategies: validated multi-step cascade pipelines.
//!
//! A `DomainStrategy` is an ordered, non-empty list of `CascadeStep`s tagged
//! with a domain. Configuration is validated once at construction; the hot
//! path only ever sees immutable, well-formed strategies.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::complexity::Complexity;
use crate::domain::Domain;
use crate::error::{Error, Result};
use crate::validate::ValidationMethod;

/// One leg of a domain pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CascadeStep {
    /// Step name, unique within its strategy.
    pub name: String,
    /// Model id the step invokes.
    pub model: String,
    /// Provider name serving the model.
    pub provider: String,
    /// How the step's response is validated.
    pub validation: ValidationMethod,
    /// Quality score the response must reach, in [0, 1].
    pub threshold: f64,
    /// The step runs only if a prior step ended in `failed-quality`.
    #[serde(default)]
    pub fallback_only: bool,
}

impl CascadeStep {
    pub fn new(
        name: impl Into<String>,
        model: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            provider: provider.into(),
            validation: ValidationMethod::QualityCheck,
            threshold: 0.5,
            fallback_only: false,
        }
    }

    pub fn with_validation(mut self, validation: ValidationMethod) -> Self {
        self.validation = validation;
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn fallback_only(mut self) -> Self {
        self.fallback_only = true;
        self
    }
}

/// An ordered pipeline of cascade steps for one domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainStrategy {
    pub domain: Domain,
    pub steps: Vec<CascadeStep>,
    /// Demand the verifier outright: routes the domain `direct-best`.
    #[serde(default)]
    pub require_verifier: bool,
    /// Complexities the cascade applies to; `None` means no restriction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cascade_complexities: Option<HashSet<Complexity>>,
    /// Feed the drafter's output to the verifier as context on escalation.
    #[serde(default)]
    pub draft_as_context: bool,
    /// Strategy-level acceptance threshold; falls back to the
    /// per-complexity default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
}

impl DomainStrategy {
    /// Build and validate a strategy.
    ///
    /// Rules: at least one step; the first step must be unconditional (a
    /// pipeline opening with `fallback_only` could never start); step names
    /// unique; all thresholds in [0, 1].
    pub fn new(domain: Domain, steps: Vec<CascadeStep>) -> Result<Self> {
        if steps.is_empty() {
            return Err(Error::configuration(format!(
                "domain strategy for '{domain}' has no steps"
            )));
        }
        if steps[0].fallback_only {
            return Err(Error::configuration(format!(
                "domain strategy for '{domain}': first step '{}' cannot be fallback-only",
                steps[0].name
            )));
        }
        let mut names = HashSet::new();
        for step in &steps {
            if !names.insert(step.name.as_str()) {
                return Err(Error::configuration(format!(
                    "domain strategy for '{domain}': duplicate step name '{}'",
                    step.name
                )));
            }
            if !(0.0..=1.0).contains(&step.threshold) {
                return Err(Error::configuration(format!(
                    "step '{}' threshold {} outside [0, 1]",
                    step.name, step.threshold
                )));
            }
        }
        Ok(Self {
            domain,
            steps,
            require_verifier: false,
            cascade_complexities: None,
            draft_as_context: false,
            threshold: None,
        })
    }

    pub fn require_verifier(mut self) -> Self {
        self.require_verifier = true;
        self
    }

    pub fn with_cascade_complexities(
        mut self,
        complexities: impl IntoIterator<Item = Complexity>,
    ) -> Self {
        self.cascade_complexities = Some(complexities.into_iter().collect());
        self
    }

    pub fn with_draft_as_context(mut self) -> Self {
        self.draft_as_context = true;
        self
    }

    /// Set the strategy-level acceptance threshold.
    pub fn with_threshold(mut self, threshold: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(Error::configuration(format!(
                "strategy threshold {threshold} outside [0, 1]"
            )));
        }
        self.threshold = Some(threshold);
        Ok(self)
    }

    /// Whether the cascade applies at this complexity.
    pub fn cascades_at(&self, complexity: Complexity) -> bool {
        match &self.cascade_complexities {
            Some(set) => set.contains(&complexity),
            None => true,
        }
    }

    /// The acceptance threshold for this strategy at a given complexity.
    pub fn threshold_for(&self, complexity: Complexity) -> f64 {
        self.threshold
            .unwrap_or_else(|| complexity.default_threshold())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn step(name: &str) -> CascadeStep {
        CascadeStep::new(name, "model-a", "prov")
    }

    #[test]
    fn test_empty_strategy_rejected() {
        let err = DomainStrategy::new(Domain::Code, vec![]).unwrap_err();
        assert_eq!(err.kind(), "configuration_error");
    }

    #[test]
    fn test_first_step_fallback_only_rejected() {
        let err =
            DomainStrategy::new(Domain::Code, vec![step("draft").fallback_only()]).unwrap_err();
        assert_eq!(err.kind(), "configuration_error");
    }

    #[test]
    fn test_duplicate_step_names_rejected() {
        let err =
            DomainStrategy::new(Domain::Code, vec![step("draft"), step("draft")]).unwrap_err();
        assert_eq!(err.kind(), "configuration_error");
    }

    #[test]
    fn test_threshold_range_enforced() {
        let err = DomainStrategy::new(Domain::Code, vec![step("a").with_threshold(1.5)])
            .unwrap_err();
        assert_eq!(err.kind(), "configuration_error");

        let strategy = DomainStrategy::new(Domain::Code, vec![step("a")]).unwrap();
        assert!(strategy.with_threshold(-0.1).is_err());
    }

    #[test]
    fn test_cascades_at_defaults_to_all() {
        let strategy = DomainStrategy::new(Domain::Code, vec![step("a")]).unwrap();
        assert!(strategy.cascades_at(Complexity::Trivial));
        assert!(strategy.cascades_at(Complexity::Expert));
    }

    #[test]
    fn test_cascade_complexity_restriction() {
        let strategy = DomainStrategy::new(Domain::Code, vec![step("a")])
            .unwrap()
            .with_cascade_complexities([Complexity::Trivial, Complexity::Simple]);
        assert!(strategy.cascades_at(Complexity::Simple));
        assert!(!strategy.cascades_at(Complexity::Hard));
    }

    #[test]
    fn test_threshold_fallback_to_complexity_default() {
        let plain = DomainStrategy::new(Domain::Code, vec![step("a")]).unwrap();
        assert_eq!(plain.threshold_for(Complexity::Moderate), 0.55);

        let pinned = plain.with_threshold(0.9).unwrap();
        assert_eq!(pinned.threshold_for(Complexity::Moderate), 0.9);
    }

    #[test]
    fn test_valid_two_step_pipeline() {
        let strategy = DomainStrategy::new(
            Domain::Code,
            vec![
                step("draft").with_threshold(0.7),
                step("verify").fallback_only(),
            ],
        )
        .unwrap();
        assert_eq!(strategy.steps.len(), 2);
        assert!(strategy.steps[1].fallback_only);
    }
}
