//! Error types for cascade-core.

use thiserror::Error;

/// Result type alias using cascade-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during routing and cascade execution.
///
/// The variants are stable: hosts match on them to distinguish user-visible
/// failures (budget, tier, model exhaustion) from transient provider noise
/// that the cascade absorbs internally.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration: unknown tier, duplicate tool, missing model, etc.
    /// Fatal at request time.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The budget pre-check denied the query. No provider calls were made.
    #[error("budget exceeded for user {user_id}: consumed ${consumed:.6} + projected ${projected:.6} over {window} cap ${cap:.6}")]
    BudgetExceeded {
        user_id: String,
        window: String,
        consumed: f64,
        projected: f64,
        cap: f64,
    },

    /// Tier filtering produced an empty model set and no fallback exists.
    #[error("tier '{tier}' leaves no usable models")]
    TierNoModels { tier: String },

    /// Transient provider failure: timeout, rate-limit, 5xx. Retried once
    /// internally; escalated to the verifier inside a cascade.
    #[error("transient provider error from {provider}: {message}")]
    ProviderTransient { provider: String, message: String },

    /// Permanent provider failure: 4xx not covered by the transient set.
    /// Never retried.
    #[error("permanent provider error from {provider}: {message}")]
    ProviderPermanent { provider: String, message: String },

    /// Both the drafter and the verifier are exhausted.
    #[error("model error on step '{step}': {message}")]
    ModelError {
        step: String,
        message: String,
        cost_incurred: bool,
    },

    /// Malformed tool call or schema violation under strict validation,
    /// surviving one verifier regeneration.
    #[error("validation error: {0}")]
    Validation(String),

    /// The caller cancelled the query. Partial costs are still recorded.
    #[error("query cancelled")]
    Cancelled,

    /// Per-query wall-clock timeout elapsed.
    #[error("query timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// The executor's in-flight or per-provider queue overflowed.
    #[error("executor overloaded: {0}")]
    Overloaded(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Programming invariant violation (e.g. confidence outside [0,1]).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Create a transient provider error.
    pub fn transient(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProviderTransient {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create a permanent provider error.
    pub fn permanent(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProviderPermanent {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create a model-exhaustion error.
    pub fn model_error(
        step: impl Into<String>,
        message: impl Into<String>,
        cost_incurred: bool,
    ) -> Self {
        Self::ModelError {
            step: step.into(),
            message: message.into(),
            cost_incurred,
        }
    }

    /// Create an internal invariant-violation error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Whether this error is retryable at the provider-call level.
    ///
    /// Per-call timeouts count as transient; everything else that is not a
    /// `ProviderTransient` must not be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ProviderTransient { .. })
    }

    /// Stable machine-readable kind string, used in event payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration_error",
            Self::BudgetExceeded { .. } => "budget_exceeded",
            Self::TierNoModels { .. } => "tier_no_models",
            Self::ProviderTransient { .. } => "provider_transient",
            Self::ProviderPermanent { .. } => "provider_permanent",
            Self::ModelError { .. } => "model_error",
            Self::Validation(_) => "validation_error",
            Self::Cancelled => "cancelled",
            Self::Timeout { .. } => "timeout",
            Self::Overloaded(_) => "overloaded",
            Self::Serialization(_) => "internal_error",
            Self::Internal(_) => "internal_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::transient("openai", "429 rate limited").is_transient());
        assert!(!Error::permanent("openai", "400 bad request").is_transient());
        assert!(!Error::Cancelled.is_transient());
        assert!(!Error::Timeout { duration_ms: 120_000 }.is_transient());
    }

    #[test]
    fn test_kind_strings_are_stable() {
        assert_eq!(Error::configuration("dup tool").kind(), "configuration_error");
        assert_eq!(
            Error::BudgetExceeded {
                user_id: "u1".into(),
                window: "daily".into(),
                consumed: 0.0099,
                projected: 0.001,
                cap: 0.01,
            }
            .kind(),
            "budget_exceeded"
        );
        assert_eq!(
            Error::TierNoModels { tier: "free".into() }.kind(),
            "tier_no_models"
        );
        assert_eq!(
            Error::model_error("verify", "boom", true).kind(),
            "model_error"
        );
    }

    #[test]
    fn test_display_carries_context() {
        let err = Error::BudgetExceeded {
            user_id: "alice".into(),
            window: "daily".into(),
            consumed: 0.0099,
            projected: 0.001,
            cap: 0.01,
        };
        let text = err.to_string();
        assert!(text.contains("alice"));
        assert!(text.contains("daily"));
    }
}
