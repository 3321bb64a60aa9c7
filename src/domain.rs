//! Query domain classification.
//!
//! Deterministic keyword-weighted scoring across fifteen domains plus
//! `general`. Keywords come in four weight tiers; the highest-scoring domain
//! wins and ties fall back to `general`. A small regex battery detects
//! multiple-choice-question framing, strips the instruction wrapper before
//! scoring, and applies a subject-derived boost.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Query domain tag used by routing and strategy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Code,
    Data,
    Structured,
    Rag,
    Conversation,
    Tool,
    Creative,
    Summary,
    Translation,
    Math,
    Medical,
    Legal,
    Financial,
    Multimodal,
    General,
}

impl Domain {
    /// All scored domains (everything except `General`, which is the
    /// fallback rather than a lexicon).
    pub const SCORED: [Domain; 14] = [
        Domain::Code,
        Domain::Data,
        Domain::Structured,
        Domain::Rag,
        Domain::Conversation,
        Domain::Tool,
        Domain::Creative,
        Domain::Summary,
        Domain::Translation,
        Domain::Math,
        Domain::Medical,
        Domain::Legal,
        Domain::Financial,
        Domain::Multimodal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::Data => "data",
            Self::Structured => "structured",
            Self::Rag => "rag",
            Self::Conversation => "conversation",
            Self::Tool => "tool",
            Self::Creative => "creative",
            Self::Summary => "summary",
            Self::Translation => "translation",
            Self::Math => "math",
            Self::Medical => "medical",
            Self::Legal => "legal",
            Self::Financial => "financial",
            Self::Multimodal => "multimodal",
            Self::General => "general",
        }
    }

    /// Parse a caller hint. Unknown strings are `None`.
    pub fn parse(hint: &str) -> Option<Self> {
        match hint.trim().to_lowercase().as_str() {
            "code" => Some(Self::Code),
            "data" => Some(Self::Data),
            "structured" => Some(Self::Structured),
            "rag" => Some(Self::Rag),
            "conversation" => Some(Self::Conversation),
            "tool" => Some(Self::Tool),
            "creative" => Some(Self::Creative),
            "summary" => Some(Self::Summary),
            "translation" => Some(Self::Translation),
            "math" => Some(Self::Math),
            "medical" => Some(Self::Medical),
            "legal" => Some(Self::Legal),
            "financial" => Some(Self::Financial),
            "multimodal" => Some(Self::Multimodal),
            "general" => Some(Self::General),
            _ => None,
        }
    }
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Keyword weight tiers.
const VERY_STRONG: f64 = 1.5;
const STRONG: f64 = 1.0;
const MODERATE: f64 = 0.7;
const WEAK: f64 = 0.3;

/// One domain's weighted keyword battery.
struct Lexicon {
    domain: Domain,
    keywords: &'static [(&'static str, f64)],
}

static LEXICONS: &[Lexicon] = &[
    Lexicon {
        domain: Domain::Code,
        keywords: &[
            ("stack trace", VERY_STRONG),
            ("compile error", VERY_STRONG),
            ("unit test", VERY_STRONG),
            ("pull request", VERY_STRONG),
            ("refactor", STRONG),
            ("debug", STRONG),
            ("function", STRONG),
            ("syntax", STRONG),
            ("regex", STRONG),
            ("exception", STRONG),
            ("code", MODERATE),
            ("script", MODERATE),
            ("library", MODERATE),
            ("class", MODERATE),
            ("loop", MODERATE),
            ("variable", MODERATE),
            ("build", WEAK),
            ("bug", WEAK),
        ],
    },
    Lexicon {
        domain: Domain::Data,
        keywords: &[
            ("data pipeline", VERY_STRONG),
            ("dataframe", VERY_STRONG),
            ("etl", VERY_STRONG),
            ("dataset", STRONG),
            ("csv", STRONG),
            ("correlation", STRONG),
            ("aggregate", STRONG),
            ("median", STRONG),
            ("rows", MODERATE),
            ("columns", MODERATE),
            ("statistics", MODERATE),
            ("chart", MODERATE),
            ("data", WEAK),
            ("table", WEAK),
        ],
    },
    Lexicon {
        domain: Domain::Structured,
        keywords: &[
            ("json schema", VERY_STRONG),
            ("valid json", VERY_STRONG),
            ("json", STRONG),
            ("yaml", STRONG),
            ("xml", STRONG),
            ("schema", STRONG),
            ("serialize", STRONG),
            ("key-value", MODERATE),
            ("fields", MODERATE),
            ("output format", MODERATE),
            ("structure", WEAK),
        ],
    },
    Lexicon {
        domain: Domain::Rag,
        keywords: &[
            ("according to the document", VERY_STRONG),
            ("based on the passage", VERY_STRONG),
            ("in the context provided", VERY_STRONG),
            ("passage", STRONG),
            ("document", STRONG),
            ("cite", STRONG),
            ("source", STRONG),
            ("knowledge base", MODERATE),
            ("retrieval", MODERATE),
            ("excerpt", MODERATE),
            ("reference", WEAK),
        ],
    },
    Lexicon {
        domain: Domain::Conversation,
        keywords: &[
            ("how are you", VERY_STRONG),
            ("nice to meet", VERY_STRONG),
            ("hello", STRONG),
            ("hi there", STRONG),
            ("thanks", STRONG),
            ("chat", STRONG),
            ("your opinion", MODERATE),
            ("tell me about yourself", MODERATE),
            ("you think", WEAK),
        ],
    },
    Lexicon {
        domain: Domain::Tool,
        keywords: &[
            ("call the function", VERY_STRONG),
            ("use the tool", VERY_STRONG),
            ("function call", VERY_STRONG),
            ("invoke", STRONG),
            ("tool", STRONG),
            ("api call", STRONG),
            ("search the web", MODERATE),
            ("look up", MODERATE),
            ("fetch", WEAK),
        ],
    },
    Lexicon {
        domain: Domain::Creative,
        keywords: &[
            ("write a poem", VERY_STRONG),
            ("short story", VERY_STRONG),
            ("song lyrics", VERY_STRONG),
            ("story", STRONG),
            ("poem", STRONG),
            ("fiction", STRONG),
            ("imagine", STRONG),
            ("character", MODERATE),
            ("plot", MODERATE),
            ("rhyme", MODERATE),
            ("creative", WEAK),
        ],
    },
    Lexicon {
        domain: Domain::Summary,
        keywords: &[
            ("tl;dr", VERY_STRONG),
            ("summarize the following", VERY_STRONG),
            ("summarize", STRONG),
            ("summary", STRONG),
            ("condense", STRONG),
            ("key points", STRONG),
            ("main ideas", MODERATE),
            ("brief overview", MODERATE),
            ("shorten", WEAK),
        ],
    },
    Lexicon {
        domain: Domain::Translation,
        keywords: &[
            ("translate to", VERY_STRONG),
            ("translate into", VERY_STRONG),
            ("translate", STRONG),
            ("translation", STRONG),
            ("in french", MODERATE),
            ("in spanish", MODERATE),
            ("in german", MODERATE),
            ("in japanese", MODERATE),
            ("in mandarin", MODERATE),
            ("language", WEAK),
        ],
    },
    Lexicon {
        domain: Domain::Math,
        keywords: &[
            ("solve for x", VERY_STRONG),
            ("evaluate the integral", VERY_STRONG),
            ("equation", STRONG),
            ("calculate", STRONG),
            ("integral", STRONG),
            ("derivative", STRONG),
            ("theorem", STRONG),
            ("probability", STRONG),
            ("fraction", MODERATE),
            ("geometry", MODERATE),
            ("percent", MODERATE),
            ("sum", MODERATE),
            ("number", WEAK),
        ],
    },
    Lexicon {
        domain: Domain::Medical,
        keywords: &[
            ("differential diagnosis", VERY_STRONG),
            ("contraindication", VERY_STRONG),
            ("symptom", STRONG),
            ("diagnosis", STRONG),
            ("patient", STRONG),
            ("dosage", STRONG),
            ("treatment", STRONG),
            ("medication", MODERATE),
            ("clinical", MODERATE),
            ("disease", MODERATE),
            ("health", WEAK),
        ],
    },
    Lexicon {
        domain: Domain::Legal,
        keywords: &[
            ("breach of contract", VERY_STRONG),
            ("statute of limitations", VERY_STRONG),
            ("contract", STRONG),
            ("liability", STRONG),
            ("clause", STRONG),
            ("plaintiff", STRONG),
            ("statute", STRONG),
            ("lawsuit", MODERATE),
            ("court", MODERATE),
            ("legal", MODERATE),
            ("law", WEAK),
        ],
    },
    Lexicon {
        domain: Domain::Financial,
        keywords: &[
            ("discounted cash flow", VERY_STRONG),
            ("balance sheet", VERY_STRONG),
            ("portfolio", STRONG),
            ("interest rate", STRONG),
            ("revenue", STRONG),
            ("valuation", STRONG),
            ("invest", STRONG),
            ("stock", MODERATE),
            ("loan", MODERATE),
            ("tax", MODERATE),
            ("money", WEAK),
        ],
    },
    Lexicon {
        domain: Domain::Multimodal,
        keywords: &[
            ("in this image", VERY_STRONG),
            ("attached image", VERY_STRONG),
            ("screenshot", STRONG),
            ("image", STRONG),
            ("photo", STRONG),
            ("picture", STRONG),
            ("diagram", MODERATE),
            ("figure", MODERATE),
            ("visual", WEAK),
        ],
    },
];

// Multiple-choice framing battery.
static MCQ_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)which of the following",
        r"(?i)select\s+(?:one|the\s+correct|the\s+best)",
        r"(?i)answer\s+with\s+(?:the\s+letter|a,\s*b,\s*c)",
        r"(?i)multiple[-\s]choice",
        r"(?m)^\s*\(?[A-D][).]\s+\S",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("invalid regex"))
    .collect()
});

// Instruction wrapper lines stripped before scoring an MCQ body.
static MCQ_WRAPPER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?im)^\s*(?:the following (?:is|are) multiple[-\s]choice questions?[^\n]*|answer with (?:the letter|a, b, c)[^\n]*|select (?:one|the correct)[^\n]*)$",
    )
    .expect("invalid regex")
});

// "questions (with answers) about <subject>" framing used by benchmark-style
// prompts; the captured subject feeds the domain boost.
static MCQ_SUBJECT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)questions?\s+(?:\(with answers\)\s+)?about\s+([a-z ]{3,40}?)(?:[.:,\n]|$)")
        .expect("invalid regex")
});

fn subject_to_domain(subject: &str) -> Option<Domain> {
    let s = subject.trim().to_lowercase();
    let table: &[(&str, Domain)] = &[
        ("math", Domain::Math),
        ("algebra", Domain::Math),
        ("calculus", Domain::Math),
        ("statistics", Domain::Math),
        ("computer science", Domain::Code),
        ("programming", Domain::Code),
        ("machine learning", Domain::Code),
        ("medicine", Domain::Medical),
        ("clinical", Domain::Medical),
        ("anatomy", Domain::Medical),
        ("law", Domain::Legal),
        ("jurisprudence", Domain::Legal),
        ("accounting", Domain::Financial),
        ("economics", Domain::Financial),
        ("finance", Domain::Financial),
    ];
    table
        .iter()
        .find(|(needle, _)| s.contains(needle))
        .map(|(_, domain)| *domain)
}

/// Result of classifying one query's domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainResult {
    pub domain: Domain,
    /// In [0, 1]: `min(max_score / 5.0, 1.0)`.
    pub confidence: f64,
    /// Top-3 raw scores, highest first.
    pub top_scores: Vec<(Domain, f64)>,
    /// Whether multiple-choice framing was detected.
    pub is_mcq: bool,
    /// The subject extracted from MCQ framing, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_hint: Option<String>,
}

/// Deterministic keyword-weighted domain router.
#[derive(Debug, Clone, Default)]
pub struct DomainRouter;

impl DomainRouter {
    pub fn new() -> Self {
        Self
    }

    /// Classify a query's domain. Pure function of the text and hint; a
    /// valid hint short-circuits detection.
    pub fn classify(&self, text: &str, hint: Option<&str>) -> DomainResult {
        if let Some(raw) = hint {
            if let Some(domain) = Domain::parse(raw) {
                return DomainResult {
                    domain,
                    confidence: 1.0,
                    top_scores: vec![(domain, 5.0)],
                    is_mcq: false,
                    subject_hint: None,
                };
            }
            tracing::warn!(hint = raw, "ignoring invalid domain hint");
        }

        let is_mcq = MCQ_PATTERNS.iter().any(|p| p.is_match(text));
        let subject_hint = if is_mcq {
            MCQ_SUBJECT
                .captures(text)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().trim().to_string())
        } else {
            None
        };

        // Strip the instruction wrapper so benchmark boilerplate does not
        // dominate the lexicon scores.
        let scored_text = if is_mcq {
            MCQ_WRAPPER.replace_all(text, "").to_string()
        } else {
            text.to_string()
        };
        let lower = scored_text.to_lowercase();

        let mut scores: Vec<(Domain, f64)> = LEXICONS
            .iter()
            .map(|lexicon| {
                let score: f64 = lexicon
                    .keywords
                    .iter()
                    .filter(|(keyword, _)| lower.contains(keyword))
                    .map(|(_, weight)| *weight)
                    .sum();
                (lexicon.domain, score)
            })
            .collect();

        if is_mcq {
            let boost = subject_hint.as_deref().and_then(subject_to_domain);
            for (domain, score) in &mut scores {
                if Some(*domain) == boost {
                    *score += 0.5;
                }
                if *domain == Domain::Conversation {
                    *score = (*score - 0.5).max(0.0);
                }
            }
        }

        scores.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.as_str().cmp(b.0.as_str()))
        });

        let top_scores: Vec<(Domain, f64)> = scores.iter().take(3).copied().collect();
        let max_score = top_scores.first().map_or(0.0, |(_, s)| *s);
        let runner_up = top_scores.get(1).map_or(0.0, |(_, s)| *s);

        // A zero score or an exact tie between distinct domains falls back
        // to general.
        let domain = if max_score <= 0.0 || (max_score - runner_up).abs() < f64::EPSILON {
            Domain::General
        } else {
            top_scores[0].0
        };

        DomainResult {
            domain,
            confidence: (max_score / 5.0).min(1.0),
            top_scores,
            is_mcq,
            subject_hint,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn classify(text: &str) -> DomainResult {
        DomainRouter::new().classify(text, None)
    }

    #[test]
    fn test_code_query() {
        let result = classify("This unit test throws an exception, help me debug the stack trace");
        assert_eq!(result.domain, Domain::Code);
        assert!(result.confidence > 0.5);
    }

    #[test]
    fn test_legal_query() {
        let result = classify("Is this clause a breach of contract under the statute?");
        assert_eq!(result.domain, Domain::Legal);
    }

    #[test]
    fn test_no_keywords_is_general() {
        let result = classify("zzz qqq www");
        assert_eq!(result.domain, Domain::General);
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn test_empty_query_is_general() {
        let result = classify("");
        assert_eq!(result.domain, Domain::General);
    }

    #[test]
    fn test_confidence_is_capped() {
        let result = classify(
            "debug the stack trace, fix the compile error in this unit test, \
             refactor the function, check the syntax of the regex, the pull request \
             has a bug in the build script and the class library loop variable",
        );
        assert_eq!(result.domain, Domain::Code);
        assert_eq!(result.confidence, 1.0);
    }

    #[test]
    fn test_mcq_detection_and_subject_boost() {
        let result = classify(
            "The following are multiple-choice questions (with answers) about law.\n\
             Which of the following is a valid defense to breach?\n\
             (A) estoppel\n(B) novation\n(C) waiver\n(D) all of the above",
        );
        assert!(result.is_mcq);
        assert_eq!(result.subject_hint.as_deref(), Some("law"));
        assert_eq!(result.domain, Domain::Legal);
    }

    #[test]
    fn test_mcq_penalizes_conversation() {
        let with_mcq = classify(
            "Which of the following greetings is most formal?\n(A) hello\n(B) hi there\n(C) hey\n(D) yo",
        );
        assert!(with_mcq.is_mcq);
        // hello + hi there would score conversation 2.0; the MCQ penalty
        // knocks it down by 0.5.
        let conv = with_mcq
            .top_scores
            .iter()
            .find(|(d, _)| *d == Domain::Conversation)
            .map(|(_, s)| *s);
        if let Some(score) = conv {
            assert!(score <= 1.5);
        }
    }

    #[test]
    fn test_top_scores_are_descending() {
        let result = classify("Summarize this document and cite the passage");
        assert_eq!(result.top_scores.len(), 3);
        assert!(result.top_scores[0].1 >= result.top_scores[1].1);
        assert!(result.top_scores[1].1 >= result.top_scores[2].1);
    }

    #[test]
    fn test_hint_short_circuits() {
        let result = DomainRouter::new().classify("hello there", Some("math"));
        assert_eq!(result.domain, Domain::Math);
        assert_eq!(result.confidence, 1.0);
    }

    #[test]
    fn test_invalid_hint_falls_through() {
        let result = DomainRouter::new().classify("translate to french", Some("galaxy"));
        assert_eq!(result.domain, Domain::Translation);
    }

    #[test]
    fn test_classification_is_pure() {
        let text = "Calculate the derivative of x^2 and solve for x";
        assert_eq!(classify(text), classify(text));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn classification_is_a_pure_function(text in ".{0,400}") {
                let router = DomainRouter::new();
                prop_assert_eq!(router.classify(&text, None), router.classify(&text, None));
            }

            #[test]
            fn confidence_in_range_and_scores_sorted(text in ".{0,400}") {
                let result = DomainRouter::new().classify(&text, None);
                prop_assert!((0.0..=1.0).contains(&result.confidence));
                for pair in result.top_scores.windows(2) {
                    prop_assert!(pair[0].1 >= pair[1].1);
                }
            }
        }
    }
}
