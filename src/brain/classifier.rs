//! Query classification
//!
//! Scores a user utterance plus recent history for orchestration complexity
//! and recommends a backend. The scoring function is deliberately explicit:
//! named pattern categories with fixed weights, a history-depth component,
//! and a length component, summed and clamped to [0, 1]. Thresholds come
//! from `[classifier]` configuration:
//!
//! - `complexity_threshold` (default 0.45): scores at or above it route to
//!   the agent backend;
//! - `confidence_threshold` (default 0.60): decisions below it route to the
//!   agent backend regardless of the recommendation.
//!
//! `classify` never fails. Internal problems (no user utterance in the
//! history) produce a conservative default: agent backend, confidence 0.5.
//! Low-confidence and tie cases also land on the agent backend, the
//! superset-capability engine, so functionality is never silently dropped.
//! Pattern tags are recorded for observability only; control flow depends
//! solely on the score and thresholds.

use crate::brain::messages::NormalizedTurn;
use crate::config::ClassifierConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Neutral starting complexity before any component is applied
const BASE_COMPLEXITY: f64 = 0.15;

/// Confidence grows with distance from the threshold at this rate
const CONFIDENCE_SIGNAL_SCALE: f64 = 0.9;

/// Each matched category adds this much confidence
const CONFIDENCE_CATEGORY_BONUS: f64 = 0.05;

/// Heuristic scores never claim certainty
const CONFIDENCE_CAP: f64 = 0.95;

struct PatternCategory {
    tag: &'static str,
    weight: f64,
    markers: &'static [&'static str],
}

/// Pattern table. Markers are matched against a lowercased,
/// punctuation-stripped, space-padded rendering of the utterance, so
/// leading/trailing spaces in a marker act as word boundaries.
const CATEGORIES: &[PatternCategory] = &[
    PatternCategory {
        tag: "tool-intent",
        weight: 0.50,
        markers: &[
            "create a task",
            "create task",
            "add a task",
            "new task",
            "update the task",
            "update task",
            "complete the task",
            "close the task",
            "delete the task",
            " assign ",
            " reassign ",
            " schedule ",
            " reschedule ",
            "set a reminder",
            "remind me",
            "due date",
            "add to project",
            "in project",
            "create a project",
            "move task",
            "mark as done",
            "mark as complete",
            " archive ",
        ],
    },
    PatternCategory {
        tag: "multi-step",
        weight: 0.30,
        markers: &[
            " and then ",
            " after that ",
            " followed by ",
            " for each ",
            "step by step",
            " one by one ",
            " and assign ",
            " and add ",
            " and create ",
            " and move ",
            " and set ",
            " and schedule ",
            " and update ",
            " and delete ",
        ],
    },
    PatternCategory {
        tag: "integration",
        weight: 0.30,
        markers: &[
            " jira ",
            " github ",
            " gitlab ",
            " slack ",
            " notion ",
            " salesforce ",
            " hubspot ",
            " calendar ",
            " gmail ",
            " outlook ",
            " email ",
            " crm ",
            " zapier ",
        ],
    },
    PatternCategory {
        tag: "analytical",
        weight: 0.25,
        markers: &[
            " analyze ",
            " analyse ",
            " compare ",
            "summarize all",
            "summarise all",
            "report on",
            "across all",
            "breakdown of",
            " trend ",
            " forecast ",
        ],
    },
    PatternCategory {
        tag: "simple-conversational",
        weight: -0.35,
        markers: &[
            " hi ",
            " hey ",
            " hello ",
            " thanks ",
            " thank you ",
            " good morning ",
            " good evening ",
            " what is ",
            " what's ",
            " who is ",
            " who's ",
            " when is ",
            " when's ",
            " where is ",
            " where's ",
            " how far ",
            " how old ",
            " weather ",
            " define ",
            " meaning of ",
            " joke ",
            " translate ",
        ],
    },
];

/// Routing recommendation with supporting metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationResult {
    #[serde(rename = "routeToAgentBackend")]
    route_to_agent: bool,
    confidence: f64,
    reasoning: String,
    #[serde(rename = "complexityScore")]
    complexity_score: f64,
    #[serde(rename = "detectedPatterns")]
    detected_patterns: BTreeSet<String>,
    #[serde(rename = "recommendedModel")]
    recommended_model: String,
}

impl ClassificationResult {
    /// Build a result, clamping both scores into [0, 1]
    pub fn new(
        route_to_agent: bool,
        confidence: f64,
        reasoning: String,
        complexity_score: f64,
        detected_patterns: BTreeSet<String>,
        recommended_model: String,
    ) -> Self {
        Self {
            route_to_agent,
            confidence: clamp01(confidence),
            reasoning,
            complexity_score: clamp01(complexity_score),
            detected_patterns,
            recommended_model,
        }
    }

    /// The safe fallback: agent backend, confidence 0.5
    pub fn conservative_default(reason: &str, recommended_model: String) -> Self {
        Self::new(
            true,
            0.5,
            format!("conservative default: {reason}"),
            0.5,
            BTreeSet::new(),
            recommended_model,
        )
    }

    pub fn route_to_agent(&self) -> bool {
        self.route_to_agent
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    pub fn complexity_score(&self) -> f64 {
        self.complexity_score
    }

    pub fn detected_patterns(&self) -> &BTreeSet<String> {
        &self.detected_patterns
    }

    pub fn recommended_model(&self) -> &str {
        &self.recommended_model
    }
}

fn clamp01(value: f64) -> f64 {
    if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) }
}

/// Rough token count, one token per four characters
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 4
}

#[derive(Debug)]
struct ScoreBreakdown {
    complexity: f64,
    matched: Vec<&'static str>,
}

/// Scores utterances and recommends a backend
#[derive(Debug, Clone)]
pub struct QueryClassifier {
    complexity_threshold: f64,
    confidence_threshold: f64,
    agent_model: String,
    direct_model: String,
}

impl QueryClassifier {
    pub fn new(config: &ClassifierConfig, agent_model: String, direct_model: String) -> Self {
        Self {
            complexity_threshold: config.complexity_threshold(),
            confidence_threshold: config.confidence_threshold(),
            agent_model,
            direct_model,
        }
    }

    /// Classify an utterance in the context of its history
    ///
    /// Infallible: a missing or blank utterance yields the conservative
    /// default instead of an error.
    pub fn classify(
        &self,
        utterance: Option<&str>,
        history: &[NormalizedTurn],
        system_prompt: &str,
    ) -> ClassificationResult {
        let Some(utterance) = utterance.map(str::trim).filter(|u| !u.is_empty()) else {
            tracing::warn!("No user utterance available; applying conservative default");
            return ClassificationResult::conservative_default(
                "no user utterance in history",
                self.agent_model.clone(),
            );
        };

        let breakdown = self.score(utterance, history, system_prompt);

        let above_threshold = breakdown.complexity >= self.complexity_threshold;
        let signal = (breakdown.complexity - self.complexity_threshold).abs();
        let confidence = clamp01(
            0.5 + signal * CONFIDENCE_SIGNAL_SCALE
                + breakdown.matched.len() as f64 * CONFIDENCE_CATEGORY_BONUS,
        )
        .min(CONFIDENCE_CAP);

        let low_confidence = confidence < self.confidence_threshold;
        let route_to_agent = above_threshold || low_confidence;

        let mut reasoning = format!(
            "complexity {:.2} {} threshold {:.2}",
            breakdown.complexity,
            if above_threshold { "at or above" } else { "below" },
            self.complexity_threshold,
        );
        if breakdown.matched.is_empty() {
            reasoning.push_str("; no patterns matched");
        } else {
            reasoning.push_str("; matched ");
            reasoning.push_str(&breakdown.matched.join(", "));
        }
        if low_confidence {
            reasoning.push_str(&format!(
                "; confidence {:.2} below threshold {:.2}, defaulting to agent backend",
                confidence, self.confidence_threshold,
            ));
        }

        let recommended_model = if route_to_agent {
            self.agent_model.clone()
        } else {
            self.direct_model.clone()
        };

        ClassificationResult::new(
            route_to_agent,
            confidence,
            reasoning,
            breakdown.complexity,
            breakdown.matched.iter().map(|s| s.to_string()).collect(),
            recommended_model,
        )
    }

    fn score(
        &self,
        utterance: &str,
        history: &[NormalizedTurn],
        system_prompt: &str,
    ) -> ScoreBreakdown {
        let haystack = normalize_for_matching(utterance);

        let mut complexity = BASE_COMPLEXITY;
        let mut matched = Vec::new();

        for category in CATEGORIES {
            if category.markers.iter().any(|m| haystack.contains(m)) {
                complexity += category.weight;
                matched.push(category.tag);
            }
        }

        complexity += match history.len() {
            0..=2 => 0.0,
            3..=5 => 0.05,
            6..=11 => 0.10,
            _ => 0.15,
        };

        complexity += match estimate_tokens(utterance) {
            0..=30 => 0.0,
            31..=50 => 0.05,
            51..=100 => 0.10,
            _ => 0.15,
        };

        // A heavily customized tenant prompt usually means tool wiring.
        if estimate_tokens(system_prompt) > 500 {
            complexity += 0.05;
        }

        ScoreBreakdown {
            complexity: clamp01(complexity),
            matched,
        }
    }
}

/// Lowercase, strip punctuation to spaces (apostrophes survive so
/// contractions match), collapse runs, pad with spaces for word-boundary
/// markers.
fn normalize_for_matching(utterance: &str) -> String {
    let lowered: String = utterance
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '\'' {
                c
            } else {
                ' '
            }
        })
        .collect();
    let collapsed = lowered.split_whitespace().collect::<Vec<_>>().join(" ");
    format!(" {collapsed} ")
}
