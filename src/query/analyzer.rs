//! Query analysis.
//!
//! Pure, side-effect-free string analysis: classification, format
//! detection, entity and temporal extraction, expansion, variant
//! generation, and the retrieval quality gate. Everything here is
//! deterministic so the analyzer doubles as the degraded-mode path when
//! the LLM misbehaves.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Classified query type, driving prompt and model selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    /// Asks for a specific fact, count, date, or name.
    Factual,
    /// Default: asks for grounded prose.
    Synthesis,
    /// Comparison, multi-clause, or long-form analysis.
    Complex,
}

impl QueryType {
    /// Wire string for this type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Factual => "factual",
            Self::Synthesis => "synthesis",
            Self::Complex => "complex",
        }
    }
}

const FACTUAL_PATTERNS: [&str; 16] = [
    "how many",
    "how much",
    "what is the",
    "what was the",
    "when did",
    "when was",
    "who is",
    "who was",
    "who did",
    "what date",
    "what time",
    "what number",
    "what percentage",
    "list the",
    "name the",
    "count of",
];

const COMPLEX_PATTERNS: [&str; 18] = [
    "compare",
    "contrast",
    "analyze",
    "explain why",
    "explain how",
    "what are the differences",
    "what are the similarities",
    "synthesize",
    "evaluate",
    "assess",
    "pros and cons",
    "advantages and disadvantages",
    "step by step",
    "walk me through",
    "break down",
    "relationship between",
    "implications",
    "consequences",
];

/// Classifies a query as factual, synthesis, or complex.
#[must_use]
pub fn classify(question: &str) -> QueryType {
    let q_lower = question.to_lowercase();

    for pattern in FACTUAL_PATTERNS {
        if q_lower.contains(pattern) {
            return QueryType::Factual;
        }
    }

    for pattern in COMPLEX_PATTERNS {
        if q_lower.contains(pattern) {
            return QueryType::Complex;
        }
    }

    if question.len() > 100 || question.matches('?').count() > 1 {
        return QueryType::Complex;
    }

    QueryType::Synthesis
}

// Format-detection patterns. Pattern literals, exercised by the tests below.
#[allow(clippy::unwrap_used)]
static LIST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(\d+|top|key|main|major|all)\s+(things?|items?|points?|reasons?|ways?|tips?|examples?|factors?|features?|benefits?|risks?|issues?|steps?|ideas?|recommendations?|priorities?|strengths?|weaknesses?|areas?)\b").unwrap()
});
#[allow(clippy::unwrap_used)]
static LIST_VERB_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\blist\s+(the|all|every|my|our|their)\b").unwrap());
#[allow(clippy::unwrap_used)]
static LIST_WHAT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bwhat are (the |all )?(key|main|top|biggest|most)\b").unwrap());
#[allow(clippy::unwrap_used)]
static CODE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(write|show|give|create|generate)\s+(me\s+)?(the\s+)?(code|script|function|implementation|snippet|class|method|query|sql|regex)\b").unwrap()
});
#[allow(clippy::unwrap_used)]
static CODE_VERB_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(implement|code|program|script)\s+(a|an|the|this|that)\b").unwrap());
#[allow(clippy::unwrap_used)]
static TABLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(table|comparison|matrix|grid)\b.*\b(of|for|showing|comparing)\b").unwrap()
});
#[allow(clippy::unwrap_used)]
static STEPS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(step.by.step|walk me through|how do i|how to|process for|guide to|instructions for)\b").unwrap()
});

const LIST_FORMAT: &str = "\nFORMAT: Respond using a numbered or bulleted markdown list. Each item should be concise (1-2 sentences). Place citations INLINE at the end of each item like [1], NOT grouped at the top.";
const CODE_FORMAT: &str = "\nFORMAT: Include code in fenced markdown code blocks (```language). Add brief explanations outside the code blocks.";
const TABLE_FORMAT: &str = "\nFORMAT: Use a markdown table for structured comparison. Add a brief summary below the table.";
const STEPS_FORMAT: &str = "\nFORMAT: Respond with numbered steps. Each step should have a clear action and brief explanation.";

/// Detects the ideal response format. Returns an instruction suffix for the
/// system prompt, or an empty string for default prose.
#[must_use]
pub fn detect_format(question: &str) -> &'static str {
    let q_lower = question.to_lowercase();

    if LIST_RE.is_match(&q_lower) || LIST_VERB_RE.is_match(&q_lower) || LIST_WHAT_RE.is_match(&q_lower)
    {
        return LIST_FORMAT;
    }
    if CODE_RE.is_match(&q_lower) || CODE_VERB_RE.is_match(&q_lower) {
        return CODE_FORMAT;
    }
    if TABLE_RE.is_match(&q_lower) {
        return TABLE_FORMAT;
    }
    if STEPS_RE.is_match(&q_lower) {
        return STEPS_FORMAT;
    }
    ""
}

#[allow(clippy::unwrap_used)]
static CAP_PHRASE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([A-Z][a-z]+(?:\s+[A-Z][a-z]+)*)\b").unwrap());
#[allow(clippy::unwrap_used)]
static DOUBLE_QUOTED_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#""([^"]+)""#).unwrap());
#[allow(clippy::unwrap_used)]
static SINGLE_QUOTED_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"'([^']+)'").unwrap());

/// Extracts named entities from a query: capitalized phrases and quoted
/// strings, deduplicated preserving order.
#[must_use]
pub fn extract_entities(question: &str) -> Vec<String> {
    let mut entities: Vec<String> = Vec::new();

    for caps in CAP_PHRASE_RE.captures_iter(question) {
        if let Some(m) = caps.get(1) {
            entities.push(m.as_str().to_string());
        }
    }
    for re in [&*DOUBLE_QUOTED_RE, &*SINGLE_QUOTED_RE] {
        for caps in re.captures_iter(question) {
            if let Some(m) = caps.get(1) {
                entities.push(m.as_str().to_string());
            }
        }
    }

    let mut seen = std::collections::HashSet::new();
    entities.retain(|e| e.len() > 1 && seen.insert(e.to_lowercase()));
    entities
}

/// Temporal references extracted from a query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemporalFilter {
    /// Quarter digits ("1".."4").
    pub quarters: Vec<String>,
    /// Calendar years ("2020"..).
    pub years: Vec<String>,
    /// Fiscal years, normalized to 4 digits.
    pub fiscal_years: Vec<String>,
}

impl TemporalFilter {
    /// Searchable surface forms for boosting (q1, q 1, quarter 1, fy 2026...).
    #[must_use]
    pub fn patterns(&self) -> Vec<String> {
        let mut patterns = Vec::new();
        for q in &self.quarters {
            patterns.push(format!("q{q}"));
            patterns.push(format!("q {q}"));
            patterns.push(format!("quarter {q}"));
        }
        for y in &self.years {
            patterns.push(y.clone());
        }
        for fy in &self.fiscal_years {
            patterns.push(format!("fy {fy}"));
            patterns.push(format!("fy{fy}"));
            patterns.push(fy.clone());
        }
        patterns
    }
}

#[allow(clippy::unwrap_used)]
static QUARTER_DIGIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:q\s*|quarter\s*)([1-4])\b").unwrap());
#[allow(clippy::unwrap_used)]
static QUARTER_WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(first|second|third|fourth)\s+quarter\b").unwrap());
#[allow(clippy::unwrap_used)]
static YEAR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(20[2-3][0-9])\b").unwrap());
#[allow(clippy::unwrap_used)]
static FY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bfy\s*(\d{4}|\d{2})\b").unwrap());

/// Extracts temporal references. Returns `None` when the query has none.
#[must_use]
pub fn extract_temporal_filter(question: &str) -> Option<TemporalFilter> {
    let q_lower = question.to_lowercase();
    let mut filter = TemporalFilter::default();

    for caps in QUARTER_DIGIT_RE.captures_iter(&q_lower) {
        if let Some(m) = caps.get(1) {
            let digit = m.as_str().to_string();
            if !filter.quarters.contains(&digit) {
                filter.quarters.push(digit);
            }
        }
    }
    for caps in QUARTER_WORD_RE.captures_iter(&q_lower) {
        if let Some(m) = caps.get(1) {
            let digit = match m.as_str() {
                "first" => "1",
                "second" => "2",
                "third" => "3",
                _ => "4",
            }
            .to_string();
            if !filter.quarters.contains(&digit) {
                filter.quarters.push(digit);
            }
        }
    }

    for caps in YEAR_RE.captures_iter(question) {
        if let Some(m) = caps.get(1) {
            let year = m.as_str().to_string();
            if !filter.years.contains(&year) {
                filter.years.push(year);
            }
        }
    }

    for caps in FY_RE.captures_iter(&q_lower) {
        if let Some(m) = caps.get(1) {
            let fy = if m.as_str().len() == 2 {
                format!("20{}", m.as_str())
            } else {
                m.as_str().to_string()
            };
            if !filter.fiscal_years.contains(&fy) {
                filter.fiscal_years.push(fy);
            }
        }
    }

    if filter.quarters.is_empty() && filter.years.is_empty() && filter.fiscal_years.is_empty() {
        None
    } else {
        Some(filter)
    }
}

const TERM_EXPANSIONS: [(&str, &str); 15] = [
    ("demo", "demo demonstration \"record count\""),
    ("demos", "demos demonstrations \"record count\""),
    ("trial", "trial pilot"),
    ("trials", "trials pilots"),
    ("q1", "q1 \"q 1\" \"quarter 1\" \"first quarter\" \"Q 1 FY\""),
    ("q2", "q2 \"q 2\" \"quarter 2\" \"second quarter\" \"Q 2 FY\""),
    ("q3", "q3 \"q 3\" \"quarter 3\" \"third quarter\" \"Q 3 FY\""),
    ("q4", "q4 \"q 4\" \"quarter 4\" \"fourth quarter\" \"Q 4 FY\""),
    ("fy", "fy \"fiscal year\""),
    ("revenue", "revenue sales income"),
    ("customer", "customer client account"),
    ("customers", "customers clients accounts"),
    ("meeting", "meeting call conversation"),
    ("meetings", "meetings calls conversations"),
    ("forecast", "forecast projection outlook"),
];

const NAME_EXPANSIONS: [(&str, &str); 17] = [
    ("chris", "chris christopher"),
    ("mike", "mike michael"),
    ("dan", "dan daniel"),
    ("bill", "bill william"),
    ("bob", "bob robert"),
    ("jim", "jim james"),
    ("tom", "tom thomas"),
    ("steve", "steve stephen steven"),
    ("pat", "pat patrick patricia"),
    ("jen", "jen jennifer"),
    ("liz", "liz elizabeth"),
    ("alex", "alex alexander alexandra"),
    ("matt", "matt matthew"),
    ("nick", "nick nicholas"),
    ("sam", "sam samuel samantha"),
    ("joe", "joe joseph"),
    ("will", "will william"),
];

/// Expands a query with synonyms and nickname -> full-name variants.
#[must_use]
pub fn expand_query(question: &str) -> String {
    let mut expanded = question.to_string();
    let q_lower = question.to_lowercase();

    for (term, expansion) in TERM_EXPANSIONS {
        if q_lower.contains(term) && !q_lower.contains(&expansion.to_lowercase()) {
            expanded.push(' ');
            expanded.push_str(expansion);
        }
    }

    let words: Vec<&str> = q_lower.split_whitespace().collect();
    for (nick, full) in NAME_EXPANSIONS {
        if words.contains(&nick) {
            expanded.push(' ');
            expanded.push_str(full);
        }
    }

    expanded
}

#[allow(clippy::unwrap_used)]
static VARIANT_QUARTER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bq([1-4])\b").unwrap());

/// Generates up to 3 variant queries for corrective retrieval.
#[must_use]
pub fn generate_query_variants(question: &str) -> Vec<String> {
    let mut variants = vec![question.to_string()];
    let q_lower = question.to_lowercase();

    // Expand quarter abbreviations into spelled-out forms
    if let Some(caps) = VARIANT_QUARTER_RE.captures(question)
        && let (Some(full), Some(digit)) = (caps.get(0), caps.get(1))
    {
        let spelled = match digit.as_str() {
            "1" => "first quarter Q1",
            "2" => "second quarter Q2",
            "3" => "third quarter Q3",
            _ => "fourth quarter Q4",
        };
        let expanded = question.replacen(full.as_str(), spelled, 1);
        if expanded != question {
            variants.push(expanded);
        }
    }

    // Reverse direction: spelled-out quarters compressed to Q-n form
    if variants.len() == 1 {
        for (word, compact) in [
            ("first quarter", "Q1"),
            ("second quarter", "Q2"),
            ("third quarter", "Q3"),
            ("fourth quarter", "Q4"),
        ] {
            if q_lower.contains(word) {
                let mut compressed = q_lower.replacen(word, compact, 1);
                if compressed.contains("fiscal") {
                    compressed = compressed.replace("of fiscal", "FY").replace("fiscal", "FY");
                }
                variants.push(compressed);
                break;
            }
        }
    }

    if ["how many", "how much", "total", "count"]
        .iter()
        .any(|w| q_lower.contains(w))
    {
        variants.push(format!("{question} total count number"));
    }

    if let Some(entity) = extract_entities(question).into_iter().next() {
        variants.push(format!("{entity} {question}"));
    }

    variants.truncate(3);
    variants
}

/// Deterministic query analysis used when the LLM analyzer is unavailable
/// or misbehaving.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryAnalysis {
    /// Search terms derived from the question.
    pub search_terms: Vec<String>,
    /// Entities required in the retrieved text.
    pub entities: Vec<String>,
    /// Time periods required in the retrieved text.
    pub time_periods: Vec<String>,
    /// count | explanation.
    pub data_type: String,
    /// Key metric term, when detected.
    pub key_metric: Option<String>,
}

#[allow(clippy::unwrap_used)]
static FALLBACK_QUARTER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"q\s*([1-4])\s*(?:fy)?\s*(\d{4})?").unwrap());

/// Deterministic analysis: quarters, capitalized entities, split terms.
#[must_use]
pub fn fallback_query_analysis(question: &str) -> QueryAnalysis {
    let q_lower = question.to_lowercase();

    let mut time_periods = Vec::new();
    if let Some(caps) = FALLBACK_QUARTER_RE.captures(&q_lower) {
        let quarter = caps.get(1).map_or("1", |m| m.as_str());
        let year = caps.get(2).map_or("2026", |m| m.as_str());
        time_periods.push(format!("Q {quarter} FY {year}"));
    } else if let Some(filter) = extract_temporal_filter(question) {
        for q in &filter.quarters {
            time_periods.push(format!("Q {q}"));
        }
        for y in &filter.years {
            time_periods.push(y.clone());
        }
    }

    // Interrogative lead words are not retrieval requirements
    const INTERROGATIVES: [&str; 12] = [
        "what", "how", "who", "when", "where", "why", "which", "did", "does", "is", "are",
        "compare",
    ];
    let entities: Vec<String> = extract_entities(question)
        .into_iter()
        .filter(|e| !INTERROGATIVES.contains(&e.to_lowercase().as_str()))
        .collect();

    let mut seen = std::collections::HashSet::new();
    let search_terms: Vec<String> = q_lower
        .split_whitespace()
        .filter(|w| seen.insert((*w).to_string()))
        .map(String::from)
        .collect();

    let data_type = if ["how many", "count", "number"]
        .iter()
        .any(|w| q_lower.contains(w))
    {
        "count"
    } else {
        "explanation"
    }
    .to_string();

    let key_metric = ["demos", "demo", "meetings", "revenue", "deals", "trials"]
        .iter()
        .find(|m| q_lower.contains(*m))
        .map(|m| (*m).to_string());

    QueryAnalysis {
        search_terms,
        entities,
        time_periods,
        data_type,
        key_metric,
    }
}

/// Verifies that retrieved chunks actually contain the query's required
/// entities, time periods, and key metric.
///
/// Returns `(ok, reason)`.
#[must_use]
pub fn verify_retrieval_quality(result_texts: &[&str], analysis: &QueryAnalysis) -> (bool, String) {
    if result_texts.is_empty() {
        return (false, "No results retrieved".to_string());
    }

    let combined: String = result_texts
        .iter()
        .take(4)
        .copied()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();

    if !analysis.entities.is_empty() {
        let entity_found = analysis
            .entities
            .iter()
            .any(|e| combined.contains(&e.to_lowercase()));
        if !entity_found {
            return (
                false,
                format!("Entity '{}' not found in top results", analysis.entities[0]),
            );
        }
    }

    if !analysis.time_periods.is_empty() {
        let mut time_found = false;
        for period in &analysis.time_periods {
            let period_lower = period.to_lowercase();
            if combined.contains(&period_lower) {
                time_found = true;
                break;
            }
            // Variant forms: "q 1" / "q1" plus the year separately
            let quarter = FALLBACK_QUARTER_RE
                .captures(&period_lower)
                .and_then(|caps| caps.get(1))
                .and_then(|m| m.as_str().chars().next());
            let year = YEAR_RE
                .find(&period_lower)
                .map(|m| m.as_str().to_string());
            if let Some(q) = quarter {
                let year_ok = year.as_ref().is_none_or(|y| combined.contains(y));
                if year_ok
                    && (combined.contains(&format!("q {q}")) || combined.contains(&format!("q{q}")))
                {
                    time_found = true;
                    break;
                }
            }
        }
        if !time_found {
            return (
                false,
                format!(
                    "Time period '{}' not found in top results",
                    analysis.time_periods[0]
                ),
            );
        }
    }

    if let Some(metric) = &analysis.key_metric {
        let metric_lower = metric.to_lowercase();
        let singular = metric_lower.trim_end_matches('s');
        let found = combined.contains(&metric_lower)
            || combined.contains(singular)
            || combined.contains(&format!("{metric_lower}s"));
        if !found {
            return (false, format!("Metric '{metric}' not found in top results"));
        }
    }

    (true, "Retrieval looks good".to_string())
}

/// Lightweight post-generation answer check - heuristics only, no LLM call.
#[must_use]
pub fn check_answer_quality(answer: &str, query_type: QueryType) -> (bool, String) {
    if answer.trim().len() < 15 {
        return (false, "Answer too short".to_string());
    }

    const FAILURE_PHRASES: [&str; 9] = [
        "i cannot find",
        "not in the sources",
        "no information",
        "unable to find",
        "don't have",
        "doesn't contain",
        "not mentioned",
        "no data",
        "cannot determine",
    ];
    let answer_lower = answer.to_lowercase();
    for phrase in FAILURE_PHRASES {
        if answer_lower.contains(phrase) {
            return (false, format!("Answer indicates failure: '{phrase}'"));
        }
    }

    if query_type == QueryType::Factual && !answer.chars().any(|c| c.is_ascii_digit()) {
        return (false, "Factual query but no number in answer".to_string());
    }

    if answer.contains("[N]") || answer.contains("[Summary]") {
        return (false, "Answer contains placeholder artifacts".to_string());
    }

    (true, "Answer looks good".to_string())
}

/// Interleaves results by source id so adjacent results come from
/// different sources where possible.
#[must_use]
pub fn interleave_by_source<T, F>(results: Vec<T>, source_of: F) -> Vec<T>
where
    F: Fn(&T) -> String,
{
    if results.len() <= 2 {
        return results;
    }

    let mut by_source: Vec<(String, std::collections::VecDeque<T>)> = Vec::new();
    for result in results {
        let source = source_of(&result);
        match by_source.iter_mut().find(|(s, _)| *s == source) {
            Some((_, bucket)) => bucket.push_back(result),
            None => by_source.push((source, std::collections::VecDeque::from([result]))),
        }
    }

    if by_source.len() <= 1 {
        return by_source
            .into_iter()
            .flat_map(|(_, bucket)| bucket)
            .collect();
    }

    let mut interleaved = Vec::new();
    loop {
        let mut added = false;
        for (_, bucket) in &mut by_source {
            if let Some(result) = bucket.pop_front() {
                interleaved.push(result);
                added = true;
            }
        }
        if !added {
            break;
        }
    }
    interleaved
}
