//! Query complexity classification.
//!
//! Deterministic, rule-based difficulty scoring. The classifier extracts a
//! weighted indicator vector from the query text (keyword batteries plus
//! structural features), sums it into a numeric score, and maps score ranges
//! to one of five bands. It never fails: blank or pathological input maps to
//! `Trivial` with low confidence.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use tracing::warn;

/// Query difficulty band. The ordering is total; `Hard > Moderate` etc.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Trivial,
    Simple,
    Moderate,
    Hard,
    Expert,
}

impl Complexity {
    /// Default acceptance threshold applied when no domain strategy
    /// overrides it.
    pub fn default_threshold(&self) -> f64 {
        match self {
            Self::Trivial => 0.25,
            Self::Simple => 0.40,
            Self::Moderate => 0.55,
            Self::Hard => 0.70,
            Self::Expert => 0.80,
        }
    }

    /// Parse a caller hint. Unknown strings are `None`.
    pub fn parse(hint: &str) -> Option<Self> {
        match hint.trim().to_lowercase().as_str() {
            "trivial" => Some(Self::Trivial),
            "simple" => Some(Self::Simple),
            "moderate" => Some(Self::Moderate),
            "hard" => Some(Self::Hard),
            "expert" => Some(Self::Expert),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trivial => "trivial",
            Self::Simple => "simple",
            Self::Moderate => "moderate",
            Self::Hard => "hard",
            Self::Expert => "expert",
        }
    }
}

impl std::fmt::Display for Complexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The weighted indicator vector behind a classification.
///
/// Each field is the contribution of one feature to the total score, so a
/// host can see exactly why a query landed in a band.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreVector {
    /// Word-volume contribution (longer prompts carry more constraints).
    pub word_volume: f64,
    /// Fenced code blocks present.
    pub code_blocks: f64,
    /// Math notation (operators, LaTeX fragments, equations).
    pub math_notation: f64,
    /// More than one question mark.
    pub multi_question: f64,
    /// Chain-of-reasoning cues ("prove", "derive", "step by step").
    pub reasoning_cues: f64,
    /// Rare-domain jargon hits.
    pub jargon: f64,
    /// Distinct-constraint connectors ("and also", "then", "additionally").
    pub constraints: f64,
    /// Output-structure demands ("as JSON", "in a table").
    pub structured_output: f64,
}

impl ScoreVector {
    /// Total complexity score.
    pub fn total(&self) -> f64 {
        self.word_volume
            + self.code_blocks
            + self.math_notation
            + self.multi_question
            + self.reasoning_cues
            + self.jargon
            + self.constraints
            + self.structured_output
    }
}

/// Result of classifying one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplexityResult {
    pub complexity: Complexity,
    /// In [0, 1].
    pub confidence: f64,
    /// Raw numeric score the band was derived from.
    pub score: f64,
    /// The indicator vector used.
    pub signals: ScoreVector,
    /// Whether a caller hint overrode detection.
    #[serde(default)]
    pub hinted: bool,
}

// Band boundaries over the raw score. Upper bound exclusive; Expert is open.
const BAND_BOUNDS: [(Complexity, f64, f64); 5] = [
    (Complexity::Trivial, 0.0, 2.0),
    (Complexity::Simple, 2.0, 5.0),
    (Complexity::Moderate, 5.0, 8.0),
    (Complexity::Hard, 8.0, 13.0),
    (Complexity::Expert, 13.0, 19.0),
];

/// Scores within this distance above a boundary fall to the cheaper band.
const BAND_EPSILON: f64 = 0.05;

static CODE_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```").expect("invalid regex"));

static MATH_NOTATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?x)
        [=+*^]|\d\s*/\s*\d|\\frac|\\sum|\\int|\\sqrt|
        \b(?:equation|integral|derivative|matrix|polynomial)\b
    ")
    .expect("invalid regex")
});

static REASONING_CUES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?ix)
        \b(?:prove|derive|deduce|demonstrate|justify|formal\s+proof)\b|
        step\s+by\s+step|chain\s+of\s+thought|from\s+first\s+principles
    ")
    .expect("invalid regex")
});

static CONSTRAINT_CONNECTORS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:and\s+also|then|additionally|furthermore|as\s+well\s+as|afterwards|make\s+sure)\b")
        .expect("invalid regex")
});

static STRUCTURED_OUTPUT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:as\s+json|in\s+json|as\s+yaml|as\s+xml|as\s+a\s+table|in\s+a\s+table|as\s+csv|formatted\s+as|in\s+markdown)\b")
        .expect("invalid regex")
});

// Rare jargon, a small battery per specialized field. Hits push queries out
// of the cheap bands because cheap models answer them poorly.
static JARGON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?ix)\b(?:
        hypothesis|theorem|lemma|eigenvalue|manifold|homomorphism|
        pharmacokinetic|etiology|differential\s+diagnosis|contraindication|
        tort|estoppel|indemnification|fiduciary|
        amortization|derivatives?\s+pricing|securitization|basis\s+points|
        idempotent|mutex|memoization|borrow\s+checker|race\s+condition
    )\b")
    .expect("invalid regex")
});

/// Deterministic five-band complexity classifier.
///
/// `classify` is a pure function of the query text and hint: identical input
/// always produces an identical result.
#[derive(Debug, Clone, Default)]
pub struct ComplexityClassifier;

impl ComplexityClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify a query, with an optional caller hint.
    ///
    /// A valid hint overrides detection entirely (confidence 1.0). An
    /// invalid hint is ignored and logged.
    pub fn classify(&self, text: &str, hint: Option<&str>) -> ComplexityResult {
        if let Some(raw) = hint {
            match Complexity::parse(raw) {
                Some(complexity) => {
                    return ComplexityResult {
                        complexity,
                        confidence: 1.0,
                        score: band_floor(complexity),
                        signals: ScoreVector::default(),
                        hinted: true,
                    };
                }
                None => {
                    warn!(hint = raw, "ignoring invalid complexity hint");
                }
            }
        }

        let trimmed = text.trim();
        if trimmed.is_empty() {
            return ComplexityResult {
                complexity: Complexity::Trivial,
                confidence: 0.1,
                score: 0.0,
                signals: ScoreVector::default(),
                hinted: false,
            };
        }

        let signals = self.analyze(trimmed);
        let score = signals.total();
        let complexity = band_for(score);
        let confidence = band_confidence(complexity, score);

        ComplexityResult {
            complexity,
            confidence,
            score,
            signals,
            hinted: false,
        }
    }

    /// Extract the weighted indicator vector.
    fn analyze(&self, text: &str) -> ScoreVector {
        let lower = text.to_lowercase();
        let words = lower.split_whitespace().count();

        let mut signals = ScoreVector::default();

        signals.word_volume = (words as f64 / 30.0).min(4.0);

        if CODE_FENCE.is_match(text) {
            signals.code_blocks = 2.0;
        }
        if MATH_NOTATION.is_match(&lower) {
            signals.math_notation = 1.5;
        }

        let questions = text.matches('?').count();
        if questions > 1 {
            signals.multi_question = ((questions - 1) as f64).min(3.0);
        }

        signals.reasoning_cues = (REASONING_CUES.find_iter(&lower).count() as f64 * 5.0).min(10.0);
        signals.jargon = (JARGON.find_iter(&lower).count() as f64 * 3.0).min(6.0);
        signals.constraints =
            (CONSTRAINT_CONNECTORS.find_iter(&lower).count() as f64 * 1.5).min(4.5);
        if STRUCTURED_OUTPUT.is_match(&lower) {
            signals.structured_output = 1.0;
        }

        signals
    }
}

fn band_floor(complexity: Complexity) -> f64 {
    BAND_BOUNDS
        .iter()
        .find(|(band, _, _)| *band == complexity)
        .map(|(_, lo, _)| *lo)
        .unwrap_or(0.0)
}

fn band_for(score: f64) -> Complexity {
    // A score within epsilon above a boundary prefers the cheaper band.
    let effective = (score - BAND_EPSILON).max(0.0);
    for (band, lo, hi) in BAND_BOUNDS {
        if effective >= lo && effective < hi {
            return band;
        }
    }
    Complexity::Expert
}

/// Confidence is 1 minus the normalized gap to the next band, clamped into
/// [0.05, 1.0]: a score at the floor of its band has barely cleared the
/// previous one, a score near the ceiling has consolidated.
fn band_confidence(complexity: Complexity, score: f64) -> f64 {
    let (_, lo, hi) = BAND_BOUNDS
        .iter()
        .find(|(band, _, _)| *band == complexity)
        .copied()
        .unwrap_or((Complexity::Expert, 13.0, 19.0));
    let width = hi - lo;
    let gap_to_next = ((hi - score) / width).clamp(0.0, 1.0);
    (1.0 - gap_to_next).clamp(0.05, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn classify(text: &str) -> ComplexityResult {
        ComplexityClassifier::new().classify(text, None)
    }

    #[test]
    fn test_blank_query_is_trivial_low_confidence() {
        let result = classify("");
        assert_eq!(result.complexity, Complexity::Trivial);
        assert!(result.confidence > 0.0 && result.confidence < 0.3);

        let ws = classify("   \n\t ");
        assert_eq!(ws.complexity, Complexity::Trivial);
    }

    #[test]
    fn test_arithmetic_question_is_trivial() {
        let result = classify("What is 2+2?");
        assert_eq!(result.complexity, Complexity::Trivial);
        assert!(result.signals.math_notation > 0.0);
    }

    #[test]
    fn test_proof_request_is_expert() {
        let result = classify("Prove the Riemann hypothesis step by step.");
        assert_eq!(result.complexity, Complexity::Expert);
        assert!(result.signals.reasoning_cues >= 10.0);
        assert!(result.signals.jargon > 0.0);
    }

    #[test]
    fn test_code_fence_raises_score() {
        let plain = classify("Fix this function");
        let fenced = classify("Fix this function\n```rust\nfn broken() {}\n```");
        assert!(fenced.score > plain.score);
    }

    #[test]
    fn test_constraint_connectors_accumulate() {
        let result = classify(
            "Summarize the report, and also list the risks, then additionally \
             draft an email, and as well as that produce a title",
        );
        assert!(result.signals.constraints >= 4.5);
    }

    #[test]
    fn test_classification_is_pure() {
        let a = classify("Why does this test fail? And how do I fix it?");
        let b = classify("Why does this test fail? And how do I fix it?");
        assert_eq!(a, b);
    }

    #[test]
    fn test_valid_hint_overrides_detection() {
        let classifier = ComplexityClassifier::new();
        let result = classifier.classify("What is 2+2?", Some("expert"));
        assert_eq!(result.complexity, Complexity::Expert);
        assert!(result.hinted);
        assert_eq!(result.confidence, 1.0);
    }

    #[test]
    fn test_invalid_hint_ignored() {
        let classifier = ComplexityClassifier::new();
        let result = classifier.classify("What is 2+2?", Some("galactic"));
        assert_eq!(result.complexity, Complexity::Trivial);
        assert!(!result.hinted);
    }

    #[test]
    fn test_band_tie_break_prefers_cheaper() {
        // Just above the simple/moderate boundary, inside epsilon.
        assert_eq!(band_for(5.0 + BAND_EPSILON / 2.0), Complexity::Simple);
        assert_eq!(band_for(5.0 + BAND_EPSILON * 2.0), Complexity::Moderate);
    }

    #[test]
    fn test_confidence_in_range() {
        for text in ["", "hi", "What is 2+2?", "Prove P != NP step by step"] {
            let result = classify(text);
            assert!(
                (0.0..=1.0).contains(&result.confidence),
                "confidence out of range for {text:?}"
            );
        }
    }

    #[test]
    fn test_ordering_is_total() {
        assert!(Complexity::Trivial < Complexity::Simple);
        assert!(Complexity::Simple < Complexity::Moderate);
        assert!(Complexity::Moderate < Complexity::Hard);
        assert!(Complexity::Hard < Complexity::Expert);
    }

    #[test]
    fn test_default_thresholds() {
        assert_eq!(Complexity::Trivial.default_threshold(), 0.25);
        assert_eq!(Complexity::Expert.default_threshold(), 0.80);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn classification_is_a_pure_function(text in ".{0,400}") {
                let classifier = ComplexityClassifier::new();
                prop_assert_eq!(
                    classifier.classify(&text, None),
                    classifier.classify(&text, None)
                );
            }

            #[test]
            fn confidence_and_score_stay_in_range(text in ".{0,400}") {
                let result = ComplexityClassifier::new().classify(&text, None);
                prop_assert!((0.0..=1.0).contains(&result.confidence));
                prop_assert!(result.score >= 0.0);
                prop_assert!((result.signals.total() - result.score).abs() < 1e-9
                    || result.score == 0.0);
            }
        }
    }
}
