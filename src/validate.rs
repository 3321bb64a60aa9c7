//! Response quality validation.
//!
//! The validator computes a single `score ∈ [0, 1]` for a model response
//! plus a details object explaining the checks that ran. Thresholds are
//! applied by the executor, never here. Methods that depend on optional
//! plug-in scorers degrade to the heuristic quality check when the scorer is
//! missing or failing; the degradation is always logged, never silent.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// How a step's response is validated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMethod {
    /// Always pass.
    None,
    /// Parse code/JSON/SQL; pass if well-formed.
    SyntaxCheck,
    /// Heuristic length/refusal/alignment scoring.
    QualityCheck,
    /// Quality check plus structural checks (lists, counts).
    FullQuality,
    /// Plug-in factuality scorer; degrades to quality check when absent.
    FactCheck,
    /// Plug-in safety scorer; degrades to quality check when absent.
    SafetyCheck,
    /// Plug-in ML scorer; degrades to quality check when absent.
    Semantic,
    /// Caller-registered predicate, addressed by name.
    Custom(String),
}

/// Outcome of validating one response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// In [0, 1].
    pub score: f64,
    /// The method that actually ran (after any degradation).
    pub method: ValidationMethod,
    /// Whether the requested method degraded to the quality heuristic.
    pub degraded: bool,
    /// Per-check breakdown.
    pub details: Value,
}

/// Pluggable response scorer (semantic, factuality, safety).
///
/// Implementations are explicit: an adapter either implements this trait or
/// is rejected at registration. `score` returns a value in [0, 1]; the
/// validator clamps defensively.
#[async_trait]
pub trait ResponseScorer: Send + Sync {
    async fn score(&self, query: &str, response: &str) -> crate::error::Result<f64>;

    fn name(&self) -> &str;
}

/// Caller-supplied synchronous predicate: `(query, response) -> score`.
pub type CustomCheck = Arc<dyn Fn(&str, &str) -> f64 + Send + Sync>;

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "that", "this", "with", "from", "what", "which", "when", "where",
    "who", "how", "why", "are", "was", "were", "will", "would", "could", "should", "can",
    "you", "your", "its", "has", "have", "had", "but", "not", "all", "any", "into", "about",
    "please",
];

const REFUSAL_MARKERS: &[&str] = &[
    "i can't help",
    "i cannot help",
    "i can't assist",
    "i cannot assist",
    "i am unable to",
    "i'm unable to",
    "as an ai language model",
    "i won't be able to",
];

/// Quality validator with optional plug-in scorers.
pub struct QualityValidator {
    semantic: Option<Arc<dyn ResponseScorer>>,
    fact: Option<Arc<dyn ResponseScorer>>,
    safety: Option<Arc<dyn ResponseScorer>>,
    custom: HashMap<String, CustomCheck>,
}

impl QualityValidator {
    pub fn new() -> Self {
        Self {
            semantic: None,
            fact: None,
            safety: None,
            custom: HashMap::new(),
        }
    }

    /// Attach the optional semantic scorer (loaded lazily by the host).
    pub fn with_semantic_scorer(mut self, scorer: Arc<dyn ResponseScorer>) -> Self {
        self.semantic = Some(scorer);
        self
    }

    pub fn with_fact_scorer(mut self, scorer: Arc<dyn ResponseScorer>) -> Self {
        self.fact = Some(scorer);
        self
    }

    pub fn with_safety_scorer(mut self, scorer: Arc<dyn ResponseScorer>) -> Self {
        self.safety = Some(scorer);
        self
    }

    /// Register a named custom check.
    pub fn with_custom_check(mut self, name: impl Into<String>, check: CustomCheck) -> Self {
        self.custom.insert(name.into(), check);
        self
    }

    /// Whether a named custom check is registered.
    pub fn has_custom_check(&self, name: &str) -> bool {
        self.custom.contains_key(name)
    }

    /// Validate a response with the given method.
    pub async fn validate(
        &self,
        method: &ValidationMethod,
        query: &str,
        response: &str,
    ) -> ValidationReport {
        match method {
            ValidationMethod::None => ValidationReport {
                score: 1.0,
                method: ValidationMethod::None,
                degraded: false,
                details: json!({ "check": "none" }),
            },
            ValidationMethod::SyntaxCheck => self.syntax_check(query, response),
            ValidationMethod::QualityCheck => self.quality_check(query, response, false),
            ValidationMethod::FullQuality => self.full_quality(query, response),
            ValidationMethod::Semantic => {
                self.scored(&self.semantic, ValidationMethod::Semantic, query, response)
                    .await
            }
            ValidationMethod::FactCheck => {
                self.scored(&self.fact, ValidationMethod::FactCheck, query, response)
                    .await
            }
            ValidationMethod::SafetyCheck => {
                self.scored(&self.safety, ValidationMethod::SafetyCheck, query, response)
                    .await
            }
            ValidationMethod::Custom(name) => match self.custom.get(name) {
                Some(check) => {
                    let score = check(query, response).clamp(0.0, 1.0);
                    ValidationReport {
                        score,
                        method: ValidationMethod::Custom(name.clone()),
                        degraded: false,
                        details: json!({ "check": "custom", "name": name }),
                    }
                }
                None => {
                    warn!(name, "custom check not registered; degrading to quality check");
                    let mut report = self.quality_check(query, response, true);
                    report.method = ValidationMethod::Custom(name.clone());
                    report
                }
            },
        }
    }

    async fn scored(
        &self,
        scorer: &Option<Arc<dyn ResponseScorer>>,
        method: ValidationMethod,
        query: &str,
        response: &str,
    ) -> ValidationReport {
        if let Some(scorer) = scorer {
            match scorer.score(query, response).await {
                Ok(score) => {
                    return ValidationReport {
                        score: score.clamp(0.0, 1.0),
                        method,
                        degraded: false,
                        details: json!({ "check": "scorer", "scorer": scorer.name() }),
                    };
                }
                Err(err) => {
                    warn!(scorer = scorer.name(), error = %err, "scorer failed; degrading to quality check");
                }
            }
        } else {
            warn!(method = ?method, "no scorer registered; degrading to quality check");
        }
        let mut report = self.quality_check(query, response, true);
        report.method = method;
        report
    }

    /// Heuristic quality score: non-empty, length, refusal markers, and
    /// alignment between query content words and the response.
    fn quality_check(&self, query: &str, response: &str, degraded: bool) -> ValidationReport {
        let trimmed = response.trim();
        if trimmed.is_empty() {
            return ValidationReport {
                score: 0.0,
                method: ValidationMethod::QualityCheck,
                degraded,
                details: json!({ "check": "quality", "empty": true }),
            };
        }

        let lower = trimmed.to_lowercase();
        if REFUSAL_MARKERS.iter().any(|m| lower.contains(m)) {
            return ValidationReport {
                score: 0.15,
                method: ValidationMethod::QualityCheck,
                degraded,
                details: json!({ "check": "quality", "refusal": true }),
            };
        }

        let length_score = (trimmed.chars().count() as f64 / 160.0).min(1.0);
        let alignment = alignment_score(query, &lower);
        let qa_bonus = if query.trim_end().ends_with('?') { 0.1 } else { 0.0 };
        let score = (0.2 + 0.3 * length_score + 0.4 * alignment + qa_bonus).clamp(0.0, 1.0);

        ValidationReport {
            score,
            method: ValidationMethod::QualityCheck,
            degraded,
            details: json!({
                "check": "quality",
                "length_score": length_score,
                "alignment": alignment,
                "qa_bonus": qa_bonus,
            }),
        }
    }

    /// Quality check plus structural demands found in the query.
    fn full_quality(&self, query: &str, response: &str) -> ValidationReport {
        let base = self.quality_check(query, response, false);
        let query_lower = query.to_lowercase();
        let mut score = base.score;
        let mut checks = base.details;

        let wants_list = ["list", "enumerate", "bullet points"]
            .iter()
            .any(|k| query_lower.contains(k));
        if wants_list {
            let has_list = response.lines().any(|line| {
                let t = line.trim_start();
                t.starts_with('-')
                    || t.starts_with('*')
                    || t.chars().next().is_some_and(|c| c.is_ascii_digit())
            });
            checks["list_requested"] = json!(true);
            checks["list_returned"] = json!(has_list);
            if !has_list {
                score *= 0.6;
            }
        }

        let wants_count = ["how many", "count the", "number of"]
            .iter()
            .any(|k| query_lower.contains(k));
        if wants_count {
            let has_number = response.chars().any(|c| c.is_ascii_digit());
            checks["count_requested"] = json!(true);
            checks["number_returned"] = json!(has_number);
            if !has_number {
                score *= 0.6;
            }
        }

        ValidationReport {
            score,
            method: ValidationMethod::FullQuality,
            degraded: false,
            details: checks,
        }
    }

    /// Parse whatever structured payload the response carries.
    ///
    /// JSON bodies and fenced blocks are parsed strictly; code fences are
    /// checked for balance; bare SQL gets a crude shape check. A response
    /// with no recognizable structured payload falls back to the quality
    /// heuristic.
    fn syntax_check(&self, query: &str, response: &str) -> ValidationReport {
        let trimmed = response.trim();

        if let Some(body) = extract_json_candidate(trimmed) {
            let ok = serde_json::from_str::<Value>(body).is_ok();
            return ValidationReport {
                score: if ok { 1.0 } else { 0.2 },
                method: ValidationMethod::SyntaxCheck,
                degraded: false,
                details: json!({ "check": "syntax", "kind": "json", "well_formed": ok }),
            };
        }

        if trimmed.contains("```") {
            let balanced = trimmed.matches("```").count() % 2 == 0;
            let braces = balanced_braces(trimmed);
            let ok = balanced && braces;
            return ValidationReport {
                score: if ok { 1.0 } else { 0.2 },
                method: ValidationMethod::SyntaxCheck,
                degraded: false,
                details: json!({
                    "check": "syntax",
                    "kind": "code",
                    "fences_balanced": balanced,
                    "braces_balanced": braces,
                }),
            };
        }

        let upper = trimmed.to_uppercase();
        if upper.starts_with("SELECT")
            || upper.starts_with("INSERT")
            || upper.starts_with("UPDATE")
            || upper.starts_with("DELETE")
        {
            let ok = (!upper.starts_with("SELECT") || upper.contains(" FROM "))
                && trimmed.matches('\'').count() % 2 == 0
                && balanced_parens(trimmed);
            return ValidationReport {
                score: if ok { 1.0 } else { 0.2 },
                method: ValidationMethod::SyntaxCheck,
                degraded: false,
                details: json!({ "check": "syntax", "kind": "sql", "well_formed": ok }),
            };
        }

        let mut report = self.quality_check(query, response, true);
        report.method = ValidationMethod::SyntaxCheck;
        report
    }
}

impl Default for QualityValidator {
    fn default() -> Self {
        Self::new()
    }
}

/// Fraction of the query's content words that appear in the response.
/// Short queries cannot overlap meaningfully, so they get a neutral score.
fn alignment_score(query: &str, response_lower: &str) -> f64 {
    let content_words: Vec<String> = query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= 3 && !STOPWORDS.contains(w))
        .map(str::to_string)
        .collect();

    if content_words.len() < 3 {
        return 0.7;
    }

    let hits = content_words
        .iter()
        .filter(|w| response_lower.contains(w.as_str()))
        .count();
    hits as f64 / content_words.len() as f64
}

fn extract_json_candidate(text: &str) -> Option<&str> {
    if let Some(start) = text.find("```json") {
        let rest = &text[start + 7..];
        let end = rest.find("```")?;
        return Some(rest[..end].trim());
    }
    if text.starts_with('{') || text.starts_with('[') {
        return Some(text);
    }
    None
}

fn balanced_braces(text: &str) -> bool {
    let mut depth: i64 = 0;
    for c in text.chars() {
        match c {
            '{' => depth += 1,
            '}' => depth -= 1,
            _ => {}
        }
        if depth < 0 {
            return false;
        }
    }
    depth == 0
}

fn balanced_parens(text: &str) -> bool {
    let mut depth: i64 = 0;
    for c in text.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            _ => {}
        }
        if depth < 0 {
            return false;
        }
    }
    depth == 0
}
