//! Citation verification (CaRR scoring).
//!
//! Verifies that factual claims in an answer are supported by the cited
//! sources. Claims backed by evidence raise the score; uncited or
//! unsupported claims lower it. The report is attached to every response
//! for display and logging.

use crate::core::Citation;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Key-term match ratio for a fully supported claim.
const FULL_SUPPORT_RATIO: f32 = 0.7;
/// Key-term match ratio for a partially supported claim.
const PARTIAL_SUPPORT_RATIO: f32 = 0.3;

/// How well a claim is supported by its citations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimSupport {
    /// 70%+ of the claim's key terms appear in cited sources.
    FullySupported,
    /// 30%+ of key terms appear.
    PartiallySupported,
    /// Citations present but key terms absent.
    Unsupported,
    /// Claim carries no citation marker at all.
    NoCitation,
}

/// Hallucination risk band for the whole answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HallucinationRisk {
    /// Under 25% problematic claims.
    Low,
    /// 25%+ problematic claims.
    Medium,
    /// 50%+ problematic claims.
    High,
}

/// A factual claim extracted from an answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    /// The claim sentence.
    pub text: String,
    /// Citation numbers referenced by the claim (`[1]`, `[2]`, ...).
    pub citation_refs: Vec<usize>,
    /// Support classification.
    pub support: ClaimSupport,
    /// Evidence snippets found in cited sources (up to 3).
    pub evidence: Vec<String>,
    /// Key-term match ratio.
    pub confidence: f32,
}

/// Verification report for an answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationReport {
    /// CaRR score in `[0, 1]`.
    pub score: f32,
    /// Per-claim details.
    pub claims: Vec<Claim>,
    /// Count of fully supported claims.
    pub fully_supported: usize,
    /// Count of partially supported claims.
    pub partially_supported: usize,
    /// Count of unsupported claims.
    pub unsupported: usize,
    /// Count of claims with no citation.
    pub no_citation: usize,
    /// Overall hallucination risk.
    pub risk: HallucinationRisk,
    /// Short human-readable feedback.
    pub feedback: String,
}

impl VerificationReport {
    /// Report for an answer with no verifiable claims.
    #[must_use]
    fn empty() -> Self {
        Self {
            score: 1.0,
            claims: Vec::new(),
            fully_supported: 0,
            partially_supported: 0,
            unsupported: 0,
            no_citation: 0,
            risk: HallucinationRisk::Low,
            feedback: "No specific factual claims detected in answer.".to_string(),
        }
    }

    /// Suggestions for improving answer quality based on this report.
    #[must_use]
    pub fn improvement_suggestions(&self) -> Vec<String> {
        let mut suggestions = Vec::new();
        if self.no_citation > 0 {
            suggestions.push(format!(
                "Add citations to {} factual claims that currently lack source references.",
                self.no_citation
            ));
        }
        if self.unsupported > 0 {
            suggestions.push(format!(
                "Verify or remove {} claims that aren't supported by the cited sources.",
                self.unsupported
            ));
        }
        if self.risk == HallucinationRisk::High {
            suggestions.push(
                "Consider rewriting the answer to more closely follow the source material."
                    .to_string(),
            );
        }
        suggestions
    }
}

// Indicators of factual claims needing citation support. Pattern literals,
// exercised by the tests below.
#[allow(clippy::unwrap_used)]
static CLAIM_INDICATOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\d+(?:\.\d+)?%|\$[\d,]+(?:\.\d+)?|\d{4}|(?:increased|decreased|grew|fell|rose|dropped)\s+(?:by|to)|(?:according to|based on|shows that|indicates that)|(?:first|second|third|largest|smallest|highest|lowest)|(?:always|never|every|all|none)",
    )
    .unwrap()
});
#[allow(clippy::unwrap_used)]
static CITATION_REF: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[(\d+)\]").unwrap());
#[allow(clippy::unwrap_used)]
static NUMBER_TERM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+(?:\.\d+)?%?").unwrap());
#[allow(clippy::unwrap_used)]
static MONEY_TERM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$[\d,]+(?:\.\d+)?[MBK]?").unwrap());
#[allow(clippy::unwrap_used)]
static QUOTED_TERM: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#""([^"]+)""#).unwrap());
#[allow(clippy::unwrap_used)]
static PROPER_NOUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Z][a-z]+(?:\s+[A-Z][a-z]+)*\b").unwrap());

static ATTRIBUTION_WORDS: [&str; 9] = [
    "said",
    "stated",
    "reported",
    "announced",
    "revealed",
    "found",
    "discovered",
    "showed",
    "demonstrated",
];

/// Verifies an answer against its citations.
#[must_use]
pub fn verify(answer: &str, citations: &[Citation]) -> VerificationReport {
    let claims = extract_claims(answer);
    if claims.is_empty() {
        return VerificationReport::empty();
    }

    let verified: Vec<Claim> = claims
        .into_iter()
        .map(|claim| verify_claim(claim, citations))
        .collect();

    let fully = verified
        .iter()
        .filter(|c| c.support == ClaimSupport::FullySupported)
        .count();
    let partial = verified
        .iter()
        .filter(|c| c.support == ClaimSupport::PartiallySupported)
        .count();
    let unsupported = verified
        .iter()
        .filter(|c| c.support == ClaimSupport::Unsupported)
        .count();
    let no_cite = verified
        .iter()
        .filter(|c| c.support == ClaimSupport::NoCitation)
        .count();
    let total = verified.len();

    // CaRR weighting: full 1.0, partial 0.5, unsupported 0.0, uncited -0.2
    #[allow(clippy::cast_precision_loss)]
    let score = ((fully as f32).mul_add(1.0, (partial as f32) * 0.5)
        + (no_cite as f32) * -0.2)
        / total as f32;
    let score = score.clamp(0.0, 1.0);

    #[allow(clippy::cast_precision_loss)]
    let problem_ratio = (unsupported + no_cite) as f32 / total as f32;
    let risk = if problem_ratio >= 0.5 {
        HallucinationRisk::High
    } else if problem_ratio >= 0.25 {
        HallucinationRisk::Medium
    } else {
        HallucinationRisk::Low
    };

    let mut feedback_parts = Vec::new();
    if fully > 0 {
        feedback_parts.push(format!("{fully} claims fully supported"));
    }
    if partial > 0 {
        feedback_parts.push(format!("{partial} partially supported"));
    }
    if unsupported > 0 {
        feedback_parts.push(format!("{unsupported} need better citations"));
    }
    if no_cite > 0 {
        feedback_parts.push(format!("{no_cite} missing citations"));
    }

    VerificationReport {
        score,
        claims: verified,
        fully_supported: fully,
        partially_supported: partial,
        unsupported,
        no_citation: no_cite,
        risk,
        feedback: if feedback_parts.is_empty() {
            "Answer verified".to_string()
        } else {
            feedback_parts.join("; ")
        },
    }
}

/// Extracts claim sentences from an answer.
///
/// A sentence is a claim if it carries a claim indicator, any digit, or an
/// attribution verb. Citation markers that sentence splitting pushed onto
/// the start of the following sentence are attributed to the claim they
/// actually terminate.
#[must_use]
pub fn extract_claims(answer: &str) -> Vec<Claim> {
    let mut claims: Vec<Claim> = Vec::new();

    for sentence in crate::chunking::semantic::split_sentences(answer) {
        // Leading markers like "[1][2]" belong to the previous sentence
        let mut rest = sentence.trim_start();
        let mut leading_refs: Vec<usize> = Vec::new();
        while let Some(caps) = CITATION_REF.captures(rest) {
            let Some(full) = caps.get(0) else { break };
            if full.start() != 0 {
                break;
            }
            if let Some(n) = caps.get(1).and_then(|m| m.as_str().parse().ok()) {
                leading_refs.push(n);
            }
            rest = rest[full.end()..].trim_start();
        }
        if !leading_refs.is_empty()
            && let Some(last) = claims.last_mut()
        {
            last.citation_refs.extend(leading_refs);
            if last.support == ClaimSupport::NoCitation {
                last.support = ClaimSupport::Unsupported;
            }
        }

        if rest.len() < 20 {
            continue;
        }

        let has_indicator = CLAIM_INDICATOR.is_match(rest);
        let has_number = rest.chars().any(|c| c.is_ascii_digit());
        let rest_lower = rest.to_lowercase();
        let has_attribution = ATTRIBUTION_WORDS
            .iter()
            .any(|word| rest_lower.contains(word));

        if !(has_indicator || has_number || has_attribution) {
            continue;
        }

        let citation_refs: Vec<usize> = CITATION_REF
            .captures_iter(rest)
            .filter_map(|caps| caps.get(1)?.as_str().parse().ok())
            .collect();

        let support = if citation_refs.is_empty() {
            ClaimSupport::NoCitation
        } else {
            ClaimSupport::Unsupported
        };

        claims.push(Claim {
            text: rest.to_string(),
            citation_refs,
            support,
            evidence: Vec::new(),
            confidence: 0.0,
        });
    }

    claims
}

/// Verifies one claim against the cited source snippets.
fn verify_claim(mut claim: Claim, citations: &[Citation]) -> Claim {
    if claim.citation_refs.is_empty() {
        claim.support = ClaimSupport::NoCitation;
        return claim;
    }

    let relevant: Vec<&Citation> = citations
        .iter()
        .filter(|c| claim.citation_refs.contains(&c.number))
        .collect();

    if relevant.is_empty() {
        claim.support = ClaimSupport::Unsupported;
        return claim;
    }

    let key_terms = extract_key_terms(&claim.text);
    if key_terms.is_empty() {
        // Nothing verifiable; call it partial
        claim.support = ClaimSupport::PartiallySupported;
        claim.confidence = 0.5;
        return claim;
    }

    let mut matched = 0usize;
    let mut evidence = Vec::new();
    for citation in &relevant {
        let source_text = citation.snippet.to_lowercase();
        for term in &key_terms {
            if let Some(idx) = source_text.find(&term.to_lowercase()) {
                matched += 1;
                let start =
                    crate::chunking::semantic::floor_char_boundary(&source_text, idx.saturating_sub(50));
                let end = crate::chunking::semantic::floor_char_boundary(
                    &source_text,
                    (idx + term.len() + 50).min(source_text.len()),
                );
                evidence.push(source_text[start..end].trim().to_string());
            }
        }
    }

    #[allow(clippy::cast_precision_loss)]
    let ratio = (matched as f32 / key_terms.len() as f32).min(1.0);
    claim.confidence = ratio;
    claim.support = if ratio >= FULL_SUPPORT_RATIO {
        ClaimSupport::FullySupported
    } else if ratio >= PARTIAL_SUPPORT_RATIO {
        ClaimSupport::PartiallySupported
    } else {
        ClaimSupport::Unsupported
    };
    evidence.truncate(3);
    claim.evidence = evidence;
    claim
}

/// Key terms that should be verifiable in sources: numbers, money, quoted
/// phrases, proper nouns.
#[must_use]
pub fn extract_key_terms(text: &str) -> Vec<String> {
    const STOP: [&str; 9] = ["the", "a", "an", "is", "are", "was", "were", "be", "been"];

    let mut terms: Vec<String> = Vec::new();
    for re in [&*NUMBER_TERM, &*MONEY_TERM] {
        terms.extend(re.find_iter(text).map(|m| m.as_str().to_string()));
    }
    terms.extend(
        QUOTED_TERM
            .captures_iter(text)
            .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string())),
    );
    terms.extend(PROPER_NOUN.find_iter(text).map(|m| m.as_str().to_string()));

    let mut seen = std::collections::HashSet::new();
    terms.retain(|t| {
        t.len() > 2 && !STOP.contains(&t.to_lowercase().as_str()) && seen.insert(t.clone())
    });
    terms
}

#[cfg(test)]
mod tests {
    use super::*;

    fn citation(number: usize, text: &str) -> Citation {
        Citation::new(number, "s1", text)
    }

    #[test]
    fn test_supported_claim_scores_high() {
        let answer = "Chris ran 7 demos in Q1 FY2026. [1]";
        let citations = vec![citation(1, "Chris ran 7 demos in Q1 FY2026. Alice ran 3.")];

        let report = verify(answer, &citations);
        assert!(report.score >= 0.5, "score was {}", report.score);
        assert_eq!(report.fully_supported, 1);
        assert_eq!(report.risk, HallucinationRisk::Low);
    }

    #[test]
    fn test_uncited_claim_penalized() {
        let answer = "Revenue grew to $5M in 2024 with no citation anywhere.";
        let report = verify(answer, &[]);
        assert_eq!(report.no_citation, 1);
        assert!(report.score < 0.5);
        assert_eq!(report.risk, HallucinationRisk::High);
    }

    #[test]
    fn test_unsupported_claim_detected() {
        let answer = "The company earned $99M in 1999. [1]";
        let citations = vec![citation(1, "A completely unrelated sentence about weather.")];
        let report = verify(answer, &citations);
        assert_eq!(report.unsupported, 1);
    }

    #[test]
    fn test_no_claims_is_clean_report() {
        let report = verify("Certainly, happy to help with that topic.", &[]);
        assert!((report.score - 1.0).abs() < f32::EPSILON);
        assert!(report.claims.is_empty());
        assert_eq!(report.risk, HallucinationRisk::Low);
    }

    #[test]
    fn test_score_clamped() {
        // All uncited: raw score would be negative
        let answer = "It grew by 50% in 2020. It fell by 30% in 2021. It rose to 80% in 2022.";
        let report = verify(answer, &[]);
        assert!(report.score >= 0.0);
    }

    #[test]
    fn test_extract_claims_finds_citation_refs() {
        let claims = extract_claims("Revenue was $1.2M in 2024 [1][2]. Plain chatter follows here.");
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].citation_refs, vec![1, 2]);
    }

    #[test]
    fn test_detached_markers_attach_to_previous_claim() {
        let claims = extract_claims("Revenue was $1.2M in 2024. [1][2] Plain chatter follows here.");
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].citation_refs, vec![1, 2]);
    }

    #[test]
    fn test_extract_claims_attribution_verbs() {
        let claims = extract_claims("The report stated that margins were stable overall.");
        assert_eq!(claims.len(), 1);
    }

    #[test]
    fn test_extract_key_terms() {
        let terms = extract_key_terms("Chris Norman reported $1.2M revenue, a 15% rise.");
        assert!(terms.iter().any(|t| t == "Chris Norman"));
        assert!(terms.iter().any(|t| t.contains("15%")));
        assert!(terms.iter().any(|t| t.starts_with('$')));
    }

    #[test]
    fn test_medium_risk_band() {
        let answer = "Alpha earned $10 in 2020. [1] Beta earned $20 in 2021. [1] \
                      Gamma earned $30 in 2022. [1] Delta earned $99 in 2099 uncited.";
        let citations = vec![citation(
            1,
            "Alpha earned $10 in 2020. Beta earned $20 in 2021. Gamma earned $30 in 2022.",
        )];
        let report = verify(answer, &citations);
        assert_eq!(report.risk, HallucinationRisk::Medium);
    }

    #[test]
    fn test_improvement_suggestions() {
        let answer = "Something cost $55 in 2021 without any citation.";
        let report = verify(answer, &[]);
        let suggestions = report.improvement_suggestions();
        assert!(!suggestions.is_empty());
    }
}
