//! Auto-tagging for sources at ingestion.
//!
//! The LLM picks from a fixed vocabulary (plus at most two custom tags) so
//! tags stay consistent across sources. A keyword fallback covers degraded
//! operation. LLM calls are bounded by a two-permit semaphore.

use crate::llm::json::extract_string_array;
use crate::llm::{GenerateOptions, LlmClient};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::warn;

/// Standard tag vocabulary the LLM picks from.
pub const TAG_VOCABULARY: [&str; 29] = [
    // Content type
    "financials",
    "strategy",
    "leadership",
    "product",
    "legal",
    "marketing",
    "operations",
    "technology",
    "research",
    "policy",
    "earnings",
    "sustainability",
    "innovation",
    "risk",
    "governance",
    "culture",
    "supply-chain",
    "partnerships",
    "regulation",
    // Entity relationship
    "competitor",
    "partner",
    "subsidiary",
    "regulator",
    "customer",
    "supplier",
    // Topical
    "quarterly-results",
    "annual-report",
    "forecast",
    "press-release",
];

/// Maximum tags attached per source.
const MAX_TAGS: usize = 8;

/// LLM-based auto-tagger with a keyword fallback.
pub struct AutoTagger {
    semaphore: Arc<Semaphore>,
}

impl Default for AutoTagger {
    fn default() -> Self {
        Self::new()
    }
}

impl AutoTagger {
    /// Creates a tagger bounded at two concurrent LLM calls.
    #[must_use]
    pub fn new() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(2)),
        }
    }

    /// Generates normalized lowercase tags for a source.
    ///
    /// Falls back to keyword scanning when no LLM is available or the call
    /// fails.
    pub async fn generate_tags(
        &self,
        llm: Option<&dyn LlmClient>,
        title: &str,
        content: &str,
    ) -> Vec<String> {
        if let Some(client) = llm {
            let _permit = self.semaphore.acquire().await;
            match self.tag_with_llm(client, title, content).await {
                Ok(tags) if !tags.is_empty() => return tags,
                Ok(_) => {}
                Err(e) => warn!(error = %e, "LLM tagging failed, using fallback"),
            }
        }
        Self::fallback_tags(title, content)
    }

    async fn tag_with_llm(
        &self,
        llm: &dyn LlmClient,
        title: &str,
        content: &str,
    ) -> crate::Result<Vec<String>> {
        let preview_end =
            crate::chunking::semantic::floor_char_boundary(content, content.len().min(2000));
        let preview = &content[..preview_end];
        let vocabulary = TAG_VOCABULARY.join(", ");

        let user = format!(
            "Tag this document for a research notebook.\n\n\
             Title: {title}\nContent preview: {preview}\n\n\
             Pick 3-8 tags from this list that best describe the document:\n{vocabulary}\n\n\
             You may also add 1-2 custom tags if the document covers something not in the list. \
             Custom tags must be lowercase, hyphenated, 1-3 words (e.g., \"market-share\").\n\n\
             Return ONLY a JSON array of tag strings, nothing else.\n\
             Example: [\"financials\", \"competitor\", \"quarterly-results\"]\n\nTags:"
        );

        let raw = llm
            .generate("You tag documents.", &user, &GenerateOptions::fast(100))
            .await?;
        let tags = extract_string_array(&raw)?;

        Ok(tags
            .into_iter()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| is_valid_tag(t))
            .take(MAX_TAGS)
            .collect())
    }

    /// Keyword fallback: vocabulary terms present in the title or content.
    fn fallback_tags(title: &str, content: &str) -> Vec<String> {
        let searchable = format!("{} {}", title.to_lowercase(), content.to_lowercase());
        TAG_VOCABULARY
            .iter()
            .filter(|tag| searchable.contains(&tag.replace('-', " ")) || searchable.contains(*tag))
            .map(|t| (*t).to_string())
            .take(MAX_TAGS)
            .collect()
    }
}

/// Tag shape rule: lowercase, hyphenated, at most three words.
fn is_valid_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag.len() <= 40
        && tag.split('-').count() <= 3
        && tag
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}
