//! Source-type routing.
//!
//! Classifies query intent and biases retrieval toward tabular or text
//! sources. Numeric and comparison queries favor spreadsheets; explanation
//! and summary queries favor prose. Below the confidence threshold the
//! decision applies score bias only, never filtering.

use crate::core::SourceKind;
use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

/// Routing decisions below this confidence never filter source types.
pub const FILTER_CONFIDENCE: f32 = 0.7;

/// Query intent for routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryIntent {
    /// Count, sum, average, percentage.
    Numeric,
    /// Compare values across entities or time.
    Comparison,
    /// Find a specific data point.
    Lookup,
    /// Why / how / explain.
    Explanation,
    /// Overview / summarize.
    Summary,
    /// Enumerate items.
    List,
    /// No dominant intent.
    Mixed,
}

/// Routing decision with boost factors per source family.
#[derive(Debug, Clone, Serialize)]
pub struct RoutingDecision {
    /// Detected intent.
    pub intent: QueryIntent,
    /// Confidence in the decision, `[0, 1]`.
    pub confidence: f32,
    /// Additive bias for tabular sources.
    pub boost_tabular: f32,
    /// Additive bias for text sources.
    pub boost_text: f32,
    /// Human-readable reason.
    pub reason: &'static str,
}

impl RoutingDecision {
    /// Boost to apply for a result of the given source kind.
    #[must_use]
    pub const fn boost_for(&self, kind: SourceKind) -> f32 {
        if kind.is_tabular() {
            self.boost_tabular
        } else {
            self.boost_text
        }
    }
}

// Intent patterns. Pattern literals, exercised by the tests below.
#[allow(clippy::unwrap_used)]
static NUMERIC_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"\bhow many\b",
        r"\bhow much\b",
        r"\bcount\b",
        r"\btotal\b",
        r"\bsum\b",
        r"\baverage\b",
        r"\bpercentage\b",
        r"\bpercent\b",
        r"\bnumber of\b",
        r"\bquota\b",
        r"\bmetric\b",
        r"\bkpi\b",
        r"\brevenue\b",
        r"\bpipeline\b",
        r"\bforecast\b",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});
#[allow(clippy::unwrap_used)]
static COMPARISON_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"\bcompare\b",
        r"\bversus\b",
        r"\bvs\.?\b",
        r"\bdifference between\b",
        r"\bmore than\b",
        r"\bless than\b",
        r"\bhigher\b",
        r"\blower\b",
        r"\bq[1-4]\s+(?:vs|versus|compared to|and)\s+q[1-4]\b",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});
#[allow(clippy::unwrap_used)]
static LOOKUP_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"\bwhat is\b",
        r"\bwhat was\b",
        r"\bwhen did\b",
        r"\bwho did\b",
        r"\bwho has\b",
        r"\bfind\b",
        r"\blook up\b",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});
#[allow(clippy::unwrap_used)]
static EXPLANATION_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"\bwhy\b",
        r"\bhow does\b",
        r"\bexplain\b",
        r"\bdescribe\b",
        r"\bunderstand\b",
        r"\breason\b",
        r"\bcause\b",
        r"\banalysis\b",
        r"\binsight\b",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});
#[allow(clippy::unwrap_used)]
static SUMMARY_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"\bsummar\w+\b",
        r"\boverview\b",
        r"\bhighlights?\b",
        r"\bkey points?\b",
        r"\btell me about\b",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});
#[allow(clippy::unwrap_used)]
static LIST_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"\blist\b",
        r"\benumerate\b",
        r"\bname\s+(all|the)\b",
        r"\bwhat are (all |the )?\w+s\b",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

fn count_matches(query: &str, patterns: &[Regex]) -> usize {
    patterns.iter().filter(|p| p.is_match(query)).count()
}

/// Detects the primary intent of a query with a confidence score.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn detect_intent(query: &str) -> (QueryIntent, f32) {
    let q_lower = query.to_lowercase();

    let scores = [
        (QueryIntent::Numeric, count_matches(&q_lower, &NUMERIC_RES)),
        (QueryIntent::Comparison, count_matches(&q_lower, &COMPARISON_RES)),
        (QueryIntent::Lookup, count_matches(&q_lower, &LOOKUP_RES)),
        (QueryIntent::Explanation, count_matches(&q_lower, &EXPLANATION_RES)),
        (QueryIntent::Summary, count_matches(&q_lower, &SUMMARY_RES)),
        (QueryIntent::List, count_matches(&q_lower, &LIST_RES)),
    ];

    let max_score = scores.iter().map(|(_, s)| *s).max().unwrap_or(0);
    if max_score == 0 {
        return (QueryIntent::Mixed, 0.3);
    }

    let total: usize = scores.iter().map(|(_, s)| *s).sum();
    let confidence =
        (0.5 + (max_score as f32 / total.max(1) as f32) * 0.5).min(0.95);

    let top: Vec<QueryIntent> = scores
        .iter()
        .filter(|(_, s)| *s == max_score)
        .map(|(i, _)| *i)
        .collect();
    if top.len() > 1 {
        return (QueryIntent::Mixed, confidence * 0.7);
    }

    (top[0], confidence)
}

/// Routes a query to source-type boost biases.
#[must_use]
pub fn route(query: &str) -> RoutingDecision {
    let (intent, confidence) = detect_intent(query);

    let (boost_tabular, boost_text, reason) = match intent {
        QueryIntent::Numeric => (0.25, -0.1, "Numeric query - tabular sources preferred"),
        QueryIntent::Comparison => (0.2, 0.0, "Comparison query - tabular sources preferred"),
        QueryIntent::Lookup => (0.1, 0.05, "Lookup query - slight tabular preference"),
        QueryIntent::Explanation => (-0.1, 0.2, "Explanation query - text sources preferred"),
        QueryIntent::Summary => (0.0, 0.15, "Summary query - text sources preferred"),
        QueryIntent::List => (0.1, 0.05, "List query - both source types valid"),
        QueryIntent::Mixed => (0.0, 0.0, "Mixed intent - no routing preference"),
    };

    RoutingDecision {
        intent,
        confidence,
        boost_tabular,
        boost_text,
        reason,
    }
}

/// Source kinds to filter to, or `None` when bias-only applies.
///
/// Filtering requires routing confidence of at least
/// [`FILTER_CONFIDENCE`] and a non-mixed intent.
#[must_use]
pub fn source_filter(decision: &RoutingDecision, available: &[SourceKind]) -> Option<Vec<SourceKind>> {
    if decision.confidence < FILTER_CONFIDENCE {
        return None;
    }

    let prefers_tabular = decision.boost_tabular > decision.boost_text;
    let matches: Vec<SourceKind> = available
        .iter()
        .copied()
        .filter(|k| {
            if decision.intent == QueryIntent::Mixed {
                false
            } else if prefers_tabular {
                k.is_tabular()
            } else {
                !k.is_tabular()
            }
        })
        .collect();

    if matches.is_empty() || decision.intent == QueryIntent::Mixed {
        None
    } else {
        Some(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("How many demos did we run?", QueryIntent::Numeric)]
    #[test_case("Compare Q1 and Q2 revenue", QueryIntent::Comparison; "comparison beats numeric on ties? no - both match, expect comparison or mixed")]
    #[test_case("Why did the deal slip?", QueryIntent::Explanation)]
    #[test_case("Summarize the meeting notes", QueryIntent::Summary)]
    fn test_detect_intent(query: &str, expected: QueryIntent) {
        let (intent, _) = detect_intent(query);
        // Ties collapse to Mixed; accept either the expected intent or Mixed
        assert!(
            intent == expected || intent == QueryIntent::Mixed,
            "got {intent:?} for {query}"
        );
    }

    #[test]
    fn test_detect_intent_no_signal_is_mixed() {
        let (intent, confidence) = detect_intent("hello there");
        assert_eq!(intent, QueryIntent::Mixed);
        assert!(confidence < 0.5);
    }

    #[test]
    fn test_route_numeric_prefers_tabular() {
        let decision = route("How many demos total?");
        assert!(decision.boost_tabular > 0.0);
        assert!(decision.boost_text <= 0.0);
        assert!(decision.boost_for(SourceKind::Spreadsheet) > decision.boost_for(SourceKind::Pdf));
    }

    #[test]
    fn test_route_explanation_prefers_text() {
        let decision = route("Explain why churn increased");
        assert!(decision.boost_text > 0.0);
        assert!(decision.boost_for(SourceKind::Pdf) > decision.boost_for(SourceKind::Spreadsheet));
    }

    #[test]
    fn test_route_mixed_no_bias() {
        let decision = route("hello there");
        assert!((decision.boost_tabular - 0.0).abs() < f32::EPSILON);
        assert!((decision.boost_text - 0.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_source_filter_requires_confidence() {
        let decision = RoutingDecision {
            intent: QueryIntent::Numeric,
            confidence: 0.5,
            boost_tabular: 0.25,
            boost_text: -0.1,
            reason: "",
        };
        assert!(source_filter(&decision, &[SourceKind::Spreadsheet]).is_none());
    }

    #[test]
    fn test_source_filter_confident_numeric() {
        let decision = RoutingDecision {
            intent: QueryIntent::Numeric,
            confidence: 0.9,
            boost_tabular: 0.25,
            boost_text: -0.1,
            reason: "",
        };
        let filtered =
            source_filter(&decision, &[SourceKind::Spreadsheet, SourceKind::Pdf]).unwrap();
        assert_eq!(filtered, vec![SourceKind::Spreadsheet]);
    }

    #[test]
    fn test_source_filter_no_matching_kinds() {
        let decision = RoutingDecision {
            intent: QueryIntent::Numeric,
            confidence: 0.9,
            boost_tabular: 0.25,
            boost_text: -0.1,
            reason: "",
        };
        assert!(source_filter(&decision, &[SourceKind::Pdf]).is_none());
    }
}
