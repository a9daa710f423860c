//! Query decomposition.
//!
//! Breaks comparison, multi-part, multi-entity, and multi-temporal
//! questions into 2-5 self-contained sub-questions via the fast model.
//! Any failure falls back to the original question unchanged.

use crate::llm::json::extract_string_array;
use crate::llm::{GenerateOptions, LlmClient};
use regex::Regex;
use std::sync::LazyLock;
use tracing::{debug, warn};

/// Maximum sub-questions produced.
pub const MAX_SUB_QUERIES: usize = 5;
/// Minimum sub-questions for decomposition to be worth using.
const MIN_SUB_QUERIES: usize = 2;

/// Why a query was considered complex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComplexityKind {
    /// Joins two distinct questions.
    MultiPart,
    /// Compares items.
    Comparison,
    /// Asks about several entities.
    MultiEntity,
    /// Spans several time periods.
    MultiTemporal,
    /// Long with multiple clauses.
    ComplexStructure,
}

impl ComplexityKind {
    const fn instruction(self) -> &'static str {
        match self {
            Self::MultiPart => "Break this into separate questions, one for each distinct part.",
            Self::Comparison => {
                "Create separate questions to gather info about each item being compared, then one for the comparison itself."
            }
            Self::MultiEntity => "Create a question for each entity mentioned.",
            Self::MultiTemporal => "Create a question for each time period mentioned.",
            Self::ComplexStructure => {
                "Simplify into focused sub-questions that together answer the original."
            }
        }
    }
}

// Pattern literals, exercised by the tests below.
#[allow(clippy::unwrap_used)]
static MULTI_PART_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(and|as well as|along with|plus)\b.*\?").unwrap());
#[allow(clippy::unwrap_used)]
static DOUBLE_WH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(what|how|who|when|where|why)\b.*\b(what|how|who|when|where|why)\b").unwrap()
});
#[allow(clippy::unwrap_used)]
static COMPARISON_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"\b(compare|contrast|difference|similarities|versus|vs\.?)\b",
        r"\b(better|worse|more|less|higher|lower)\s+than\b",
        r"\bbetween .+ and\b",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});
#[allow(clippy::unwrap_used)]
static MULTI_ENTITY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(each|all|every|both)\b.*(\band\b|,)").unwrap());
#[allow(clippy::unwrap_used)]
static TIME_TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(q[1-4]|2\d{3}|january|february|march|april|may|june|july|august|september|october|november|december)\b").unwrap()
});

/// Determines whether a query should be decomposed, and why.
#[must_use]
pub fn complexity_kind(question: &str) -> Option<ComplexityKind> {
    let q_lower = question.to_lowercase();

    if MULTI_PART_RE.is_match(&q_lower) {
        let end = crate::chunking::semantic::floor_char_boundary(
            question,
            question.len().saturating_sub(1),
        );
        if question[..end].contains('?') || DOUBLE_WH_RE.is_match(&q_lower) {
            return Some(ComplexityKind::MultiPart);
        }
    }

    for re in COMPARISON_RES.iter() {
        if re.is_match(&q_lower) {
            return Some(ComplexityKind::Comparison);
        }
    }

    if MULTI_ENTITY_RE.is_match(&q_lower) {
        return Some(ComplexityKind::MultiEntity);
    }

    if TIME_TOKEN_RE.find_iter(&q_lower).count() >= 2 {
        return Some(ComplexityKind::MultiTemporal);
    }

    if question.len() > 100 && question.matches(',').count() >= 2 {
        return Some(ComplexityKind::ComplexStructure);
    }

    None
}

/// Decomposes a complex question into sub-questions.
///
/// Returns the original question alone when the query is simple, the LLM
/// fails, or decomposition yields fewer than 2 usable sub-questions.
pub async fn decompose(llm: &dyn LlmClient, question: &str) -> Vec<String> {
    let Some(kind) = complexity_kind(question) else {
        return vec![question.to_string()];
    };

    debug!(?kind, "decomposing query");

    match decompose_with_llm(llm, question, kind).await {
        Ok(sub_questions) if sub_questions.len() >= MIN_SUB_QUERIES => {
            debug!(count = sub_questions.len(), "query decomposed");
            sub_questions
                .into_iter()
                .take(MAX_SUB_QUERIES)
                .collect()
        }
        Ok(_) => vec![question.to_string()],
        Err(e) => {
            warn!(error = %e, "decomposition failed");
            vec![question.to_string()]
        }
    }
}

async fn decompose_with_llm(
    llm: &dyn LlmClient,
    question: &str,
    kind: ComplexityKind,
) -> crate::Result<Vec<String>> {
    let user = format!(
        "Break this complex question into simpler sub-questions that together will answer the original.\n\n\
         Question: {question}\n\n\
         Instructions: {}\n\n\
         Rules:\n\
         1. Each sub-question should be self-contained and answerable independently\n\
         2. Together, the sub-questions should cover all aspects of the original\n\
         3. Keep sub-questions focused and specific\n\
         4. Return 2-4 sub-questions\n\n\
         Output as a JSON array of strings. Example:\n\
         [\"What is X?\", \"What is Y?\", \"How do X and Y compare?\"]\n\nJSON array:",
        kind.instruction()
    );

    let raw = llm
        .generate("You decompose questions.", &user, &GenerateOptions::fast(200))
        .await?;
    let sub_questions = extract_string_array(&raw)?;
    Ok(sub_questions
        .into_iter()
        .map(|q| q.trim().to_string())
        .filter(|q| q.len() > 10)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedLlm;
    use test_case::test_case;

    #[test_case("Compare the 2024 revenue of product A and product B.", Some(ComplexityKind::Comparison))]
    #[test_case("Is A better than B?", Some(ComplexityKind::Comparison))]
    #[test_case("What did each of Alice, Bob, and Carol deliver?", Some(ComplexityKind::MultiEntity))]
    #[test_case("How did Q1 and Q2 trend?", Some(ComplexityKind::MultiTemporal))]
    #[test_case("How many demos did Chris run?", None)]
    fn test_complexity_kind(question: &str, expected: Option<ComplexityKind>) {
        assert_eq!(complexity_kind(question), expected);
    }

    #[test]
    fn test_multi_part_detection() {
        let q = "What did Alice do? And what did Bob deliver as well as report?";
        assert!(complexity_kind(q).is_some());
    }

    #[test]
    fn test_long_clause_heavy_structure() {
        let q = format!(
            "Given the pipeline, the churn data, and the hiring plan, {} what should we do?",
            "considering everything else we know, ".repeat(3)
        );
        assert!(complexity_kind(&q).is_some());
    }

    #[tokio::test]
    async fn test_decompose_simple_passthrough() {
        let llm = ScriptedLlm::new(["should not be called"]);
        let subs = decompose(&llm, "How many demos did Chris run?").await;
        assert_eq!(subs, vec!["How many demos did Chris run?"]);
    }

    #[tokio::test]
    async fn test_decompose_complex() {
        let llm = ScriptedLlm::new([
            r#"["What was product A revenue in 2024?", "What was product B revenue in 2024?", "How do they compare?"]"#,
        ]);
        let subs = decompose(&llm, "Compare the 2024 revenue of product A and product B.").await;
        assert_eq!(subs.len(), 3);
        assert!(subs[0].contains("product A"));
    }

    #[tokio::test]
    async fn test_decompose_llm_garbage_falls_back() {
        let llm = ScriptedLlm::new(["total nonsense"]);
        let question = "Compare A and B revenue.";
        let subs = decompose(&llm, question).await;
        assert_eq!(subs, vec![question.to_string()]);
    }

    #[tokio::test]
    async fn test_decompose_caps_at_five() {
        let llm = ScriptedLlm::new([
            r#"["What is one thing?", "What is two thing?", "What is three thing?", "What is four thing?", "What is five thing?", "What is six thing?"]"#,
        ]);
        let subs = decompose(&llm, "Compare everything against everything else.").await;
        assert!(subs.len() <= MAX_SUB_QUERIES);
    }

    #[tokio::test]
    async fn test_decompose_single_result_falls_back() {
        let llm = ScriptedLlm::new([r#"["Only one usable sub-question here?"]"#]);
        let question = "Compare A and B revenue.";
        let subs = decompose(&llm, question).await;
        assert_eq!(subs, vec![question.to_string()]);
    }
}
