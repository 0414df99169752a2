//! Intent classification (`keyword_scoring_v2`) and strategy templates.
//!
//! Four intents are scored from keyword and regex signals; the winner selects
//! a strategy template that parameterizes the rest of the pipeline. A strong
//! winner must lead by `intent_strong_margin`; when every score sits below
//! `intent_floor` the query defaults to factual; weak, closely-tied signals
//! route to `unknown` and the default template.

use serde::Serialize;

use crate::config::RetrievalConfig;
use crate::retrieval::preprocess::tokenize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Factual,
    Exploratory,
    Temporal,
    Causal,
    Unknown,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Factual => "factual",
            Self::Exploratory => "exploratory",
            Self::Temporal => "temporal",
            Self::Causal => "causal",
            Self::Unknown => "unknown",
        }
    }
}

/// A named parameter bundle for the retrieval pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct StrategyTemplate {
    pub name: &'static str,
    pub candidate_multiplier_floor: usize,
    pub candidate_multiplier_cap: usize,
    pub keyword_weight: f64,
    pub semantic_weight: f64,
    pub rerank_weight_scale: f64,
    /// Only results updated within the window survive (temporal routing).
    pub time_window_days: Option<i64>,
    pub min_score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct IntentProfile {
    pub intent: Intent,
    pub strategy_template: &'static str,
    pub method: &'static str,
    pub confidence: f64,
    pub signals: Vec<String>,
}

const TEMPORAL_KEYWORDS: &[&str] = &[
    "when", "timeline", "history", "before", "after", "recent", "latest", "yesterday", "today",
    "last", "week", "month", "ago", "昨天", "最近", "之前", "之后", "时间",
];
const CAUSAL_KEYWORDS: &[&str] = &[
    "why", "cause", "because", "reason", "root", "导致", "原因", "因果", "为什么",
];
const EXPLORATORY_KEYWORDS: &[&str] = &[
    "explore", "brainstorm", "ideas", "compare", "alternatives", "options", "list", "kinds",
    "examples", "tradeoff", "可能", "探索", "方案", "对比", "建议",
];

fn keyword_hits(source: &str, tokens: &[String], keywords: &[&str]) -> Vec<String> {
    let mut hits = Vec::new();
    for keyword in keywords {
        let matched = if keyword.is_ascii() {
            tokens.iter().any(|t| t == keyword)
        } else {
            source.contains(keyword)
        };
        if matched && !hits.iter().any(|h| h == keyword) {
            hits.push(keyword.to_string());
        }
    }
    hits
}

/// Classify a query into a retrieval intent with its routing signals.
pub fn classify_intent(
    config: &RetrievalConfig,
    query: &str,
    query_effective: &str,
) -> IntentProfile {
    let source = format!("{} {}", query, query_effective).to_lowercase();
    let tokens = tokenize(&source);

    let scored = [
        (Intent::Temporal, keyword_hits(&source, &tokens, TEMPORAL_KEYWORDS)),
        (Intent::Causal, keyword_hits(&source, &tokens, CAUSAL_KEYWORDS)),
        (
            Intent::Exploratory,
            keyword_hits(&source, &tokens, EXPLORATORY_KEYWORDS),
        ),
    ];

    let mut ranked: Vec<(Intent, usize, &Vec<String>)> = scored
        .iter()
        .map(|(intent, hits)| (*intent, hits.len(), hits))
        .filter(|(_, score, _)| *score > 0)
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1));

    // Everything below the floor: factual by default.
    if ranked.is_empty() || ranked[0].1 < config.intent_floor {
        return IntentProfile {
            intent: Intent::Factual,
            strategy_template: "factual_high_precision",
            method: "keyword_scoring_v2",
            confidence: 0.55,
            signals: vec!["default_factual".to_string()],
        };
    }

    let (top_intent, top_score, top_hits) = (ranked[0].0, ranked[0].1, ranked[0].2);
    let runner_score = ranked.get(1).map(|r| r.1).unwrap_or(0);
    let margin = top_score.saturating_sub(runner_score);

    // Exact ties, and weak leads within the ambiguous margin, are unknown.
    let ambiguous = if ranked.len() > 1 {
        top_score == runner_score
            || (top_score <= 2 && margin <= config.intent_ambiguous_margin)
    } else {
        false
    };
    if ambiguous && margin < config.intent_strong_margin.max(1) {
        let mut signals: Vec<String> = Vec::new();
        for (intent, _, hits) in ranked.iter().take(2) {
            for hit in hits.iter().take(2) {
                signals.push(format!("{}:{}", intent.as_str(), hit));
            }
        }
        if signals.is_empty() {
            signals.push("ambiguous_keyword_overlap".to_string());
        }
        return IntentProfile {
            intent: Intent::Unknown,
            strategy_template: "default",
            method: "keyword_scoring_v2",
            confidence: 0.42,
            signals,
        };
    }

    let confidence =
        (0.58 + top_score as f64 * 0.07 + margin as f64 * 0.04).min(0.96);
    let signals: Vec<String> = top_hits
        .iter()
        .take(5)
        .map(|hit| format!("{}:{}", top_intent.as_str(), hit))
        .collect();

    IntentProfile {
        intent: top_intent,
        strategy_template: template_for(top_intent).name,
        method: "keyword_scoring_v2",
        confidence,
        signals,
    }
}

/// Strategy template for an intent.
pub fn template_for(intent: Intent) -> StrategyTemplate {
    match intent {
        Intent::Factual => StrategyTemplate {
            name: "factual_high_precision",
            candidate_multiplier_floor: 1,
            candidate_multiplier_cap: 2,
            keyword_weight: 0.58,
            semantic_weight: 0.22,
            rerank_weight_scale: 1.0,
            time_window_days: None,
            min_score: 0.05,
        },
        Intent::Exploratory => StrategyTemplate {
            name: "exploratory_high_recall",
            candidate_multiplier_floor: 6,
            candidate_multiplier_cap: 20,
            keyword_weight: 0.24,
            semantic_weight: 0.58,
            rerank_weight_scale: 1.0,
            time_window_days: None,
            min_score: 0.0,
        },
        Intent::Temporal => StrategyTemplate {
            name: "temporal_time_filtered",
            candidate_multiplier_floor: 5,
            candidate_multiplier_cap: 20,
            keyword_weight: 0.3,
            semantic_weight: 0.32,
            rerank_weight_scale: 1.0,
            time_window_days: Some(30),
            min_score: 0.0,
        },
        Intent::Causal => StrategyTemplate {
            name: "causal_wide_pool",
            candidate_multiplier_floor: 8,
            candidate_multiplier_cap: 20,
            keyword_weight: 0.28,
            semantic_weight: 0.52,
            rerank_weight_scale: 1.0,
            time_window_days: None,
            min_score: 0.0,
        },
        Intent::Unknown => StrategyTemplate {
            name: "default",
            candidate_multiplier_floor: 1,
            candidate_multiplier_cap: 20,
            keyword_weight: 0.3,
            semantic_weight: 0.7,
            rerank_weight_scale: 1.0,
            time_window_days: None,
            min_score: 0.0,
        },
    }
}

/// Compute the temporal window in days from relative-time phrases, falling
/// back to the template (then config) default.
pub fn temporal_window_days(config: &RetrievalConfig, query: &str) -> i64 {
    let lowered = query.to_lowercase();
    if lowered.contains("today") || lowered.contains("yesterday") || lowered.contains("昨天") {
        return 2;
    }
    if lowered.contains("last week") || lowered.contains("this week") {
        return 7;
    }
    if lowered.contains("last month") || lowered.contains("this month") {
        return 31;
    }
    config.temporal_window_days.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetrievalConfig;

    fn cfg() -> RetrievalConfig {
        RetrievalConfig::default()
    }

    #[test]
    fn temporal_queries_route_to_time_filtered() {
        let profile = classify_intent(&cfg(), "meetings last week", "meetings last week");
        assert_eq!(profile.intent, Intent::Temporal);
        assert_eq!(profile.strategy_template, "temporal_time_filtered");
        assert!(profile.signals.iter().any(|s| s.starts_with("temporal:")));
    }

    #[test]
    fn causal_queries_route_to_wide_pool() {
        let profile = classify_intent(&cfg(), "why did the deploy fail", "why deploy fail");
        assert_eq!(profile.intent, Intent::Causal);
        assert_eq!(profile.strategy_template, "causal_wide_pool");
    }

    #[test]
    fn exploratory_queries_route_to_high_recall() {
        let profile = classify_intent(
            &cfg(),
            "list some options and alternatives",
            "list options alternatives",
        );
        assert_eq!(profile.intent, Intent::Exploratory);
        assert_eq!(profile.strategy_template, "exploratory_high_recall");
    }

    #[test]
    fn plain_queries_default_to_factual() {
        let profile = classify_intent(&cfg(), "database schema", "database schema");
        assert_eq!(profile.intent, Intent::Factual);
        assert_eq!(profile.strategy_template, "factual_high_precision");
        assert_eq!(profile.signals, vec!["default_factual"]);
    }

    #[test]
    fn exact_ties_are_unknown() {
        // One temporal hit and one causal hit: tied weak signals.
        let profile = classify_intent(&cfg(), "why yesterday", "why yesterday");
        assert_eq!(profile.intent, Intent::Unknown);
        assert_eq!(profile.strategy_template, "default");
        assert!(profile.confidence < 0.5);
    }

    #[test]
    fn strong_margin_beats_mixed_signals() {
        let profile = classify_intent(
            &cfg(),
            "when was the timeline history before recent changes yesterday, and why",
            "",
        );
        assert_eq!(profile.intent, Intent::Temporal);
        assert!(profile.confidence > 0.8);
    }

    #[test]
    fn temporal_window_parses_relative_phrases() {
        let cfg = cfg();
        assert_eq!(temporal_window_days(&cfg, "meetings last week"), 7);
        assert_eq!(temporal_window_days(&cfg, "notes from yesterday"), 2);
        assert_eq!(temporal_window_days(&cfg, "plans last month"), 31);
        assert_eq!(
            temporal_window_days(&cfg, "recent work"),
            cfg.temporal_window_days
        );
    }

    #[test]
    fn templates_cover_all_intents() {
        for intent in [
            Intent::Factual,
            Intent::Exploratory,
            Intent::Temporal,
            Intent::Causal,
            Intent::Unknown,
        ] {
            let template = template_for(intent);
            assert!(template.keyword_weight >= 0.0 && template.semantic_weight >= 0.0);
        }
        assert_eq!(template_for(Intent::Unknown).name, "default");
    }
}
