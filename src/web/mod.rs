//! Web search fallback.
//!
//! Engaged by the retrieval engine when local confidence is too low. The
//! search API and scraper are dependency contracts; no HTTP client ships
//! in the core. Web context is merged with local context under a rule that
//! local sources take precedence, and local citations are left unchanged.

use crate::core::WebSource;
use crate::error::{DependencyError, Result};
use crate::llm::{GenerateOptions, LlmClient};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

/// A raw web search result.
#[derive(Debug, Clone)]
pub struct SearchResult {
    /// Result title.
    pub title: String,
    /// Result URL.
    pub url: String,
    /// Search-engine snippet.
    pub snippet: String,
}

/// External search API contract.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Searches the web, returning up to `k` results.
    ///
    /// # Errors
    ///
    /// Returns a dependency error if the API is unreachable or rejects the
    /// request.
    async fn search(&self, query: &str, k: usize) -> Result<Vec<SearchResult>>;
}

/// URL scraper contract.
#[async_trait]
pub trait Scraper: Send + Sync {
    /// Fetches and extracts readable text from a URL.
    ///
    /// # Errors
    ///
    /// Returns a dependency error on fetch or extraction failure.
    async fn scrape(&self, url: &str) -> Result<String>;
}

/// Web context assembled for a query.
#[derive(Debug, Clone, Default)]
pub struct WebContext {
    /// Prompt-ready context with `[Web k]` markers.
    pub context: String,
    /// Sources backing the context.
    pub sources: Vec<WebSource>,
}

/// Confidence threshold below which the fallback engages.
pub const WEB_FALLBACK_CONFIDENCE: f32 = 0.20;

/// Web fallback service over the search and scrape contracts.
pub struct WebFallback {
    search: std::sync::Arc<dyn SearchProvider>,
    scraper: std::sync::Arc<dyn Scraper>,
    search_timeout: Duration,
    scrape_timeout: Duration,
    max_results: usize,
    scrape_top_n: usize,
}

impl WebFallback {
    /// Creates a fallback service with the given dependency contracts.
    #[must_use]
    pub fn new(
        search: std::sync::Arc<dyn SearchProvider>,
        scraper: std::sync::Arc<dyn Scraper>,
        search_timeout: Duration,
        scrape_timeout: Duration,
    ) -> Self {
        Self {
            search,
            scraper,
            search_timeout,
            scrape_timeout,
            max_results: 5,
            scrape_top_n: 2,
        }
    }

    /// Whether the fallback should engage for these retrieval stats.
    #[must_use]
    pub fn should_engage(max_confidence: f32, citation_count: usize) -> bool {
        citation_count == 0 || max_confidence < WEB_FALLBACK_CONFIDENCE
    }

    /// Searches and scrapes the top results into prompt context.
    ///
    /// Scrape failures degrade individual results to their snippets; a
    /// search failure returns an empty context.
    pub async fn gather_context(&self, query: &str) -> WebContext {
        let results = match tokio::time::timeout(
            self.search_timeout,
            self.search.search(query, self.max_results),
        )
        .await
        {
            Ok(Ok(results)) => results,
            Ok(Err(e)) => {
                warn!(error = %e, "web search failed");
                return WebContext::default();
            }
            Err(_) => {
                warn!(seconds = self.search_timeout.as_secs(), "web search timed out");
                return WebContext::default();
            }
        };

        if results.is_empty() {
            return WebContext::default();
        }

        let mut context_parts = Vec::new();
        let mut sources = Vec::new();

        // Scrape the top N for full content
        for (i, result) in results.iter().take(self.scrape_top_n).enumerate() {
            let content = match tokio::time::timeout(
                self.scrape_timeout,
                self.scraper.scrape(&result.url),
            )
            .await
            {
                Ok(Ok(text)) if !text.trim().is_empty() => {
                    let end = crate::chunking::semantic::floor_char_boundary(
                        &text,
                        text.len().min(2000),
                    );
                    let mut clipped = text[..end].to_string();
                    if text.len() > 2000 {
                        clipped.push_str("...");
                    }
                    Some(clipped)
                }
                Ok(Ok(_)) => None,
                Ok(Err(e)) => {
                    debug!(url = %result.url, error = %e, "scrape failed, using snippet");
                    None
                }
                Err(_) => {
                    debug!(url = %result.url, "scrape timed out, using snippet");
                    None
                }
            };

            let scraped = content.is_some();
            context_parts.push(format!(
                "[Web {}] {}\nSource: {}\n{}",
                i + 1,
                result.title,
                result.url,
                content.unwrap_or_else(|| result.snippet.clone())
            ));
            sources.push(WebSource {
                title: result.title.clone(),
                url: result.url.clone(),
                scraped,
            });
        }

        // Remaining results contribute snippets only
        for (i, result) in results.iter().enumerate().skip(self.scrape_top_n) {
            context_parts.push(format!(
                "[Web {}] {}\nSource: {}\n{}",
                i + 1,
                result.title,
                result.url,
                result.snippet
            ));
            sources.push(WebSource {
                title: result.title.clone(),
                url: result.url.clone(),
                scraped: false,
            });
        }

        WebContext {
            context: context_parts.join("\n\n"),
            sources,
        }
    }

    /// Re-asks the LLM with combined local + web context.
    ///
    /// Local sources take precedence; `[Web k]` markers cite web sources.
    ///
    /// # Errors
    ///
    /// Returns the LLM error; callers keep the local answer and attach a
    /// `web_error` note.
    pub async fn augment_answer(
        &self,
        llm: &dyn LlmClient,
        question: &str,
        local_context: &str,
        web_context: &str,
        opts: &GenerateOptions,
    ) -> Result<String> {
        let mut combined = String::new();
        if !local_context.is_empty() {
            combined.push_str(&format!("LOCAL SOURCES:\n{local_context}\n\n"));
        }
        combined.push_str(&format!("WEB SOURCES:\n{web_context}"));

        let system = "Answer the question using BOTH local sources and web sources provided. \
                      Prioritize local sources when they have relevant information. \
                      Use web sources to fill in gaps or provide additional context. \
                      Cite sources with [1], [2], etc. for local sources and \
                      [Web 1], [Web 2], etc. for web sources.";
        let user = format!("Question: {question}\n\n{combined}\n\nAnswer:");

        llm.generate(system, &user, opts).await
    }
}

/// A search provider that always fails. Default when no API is configured.
pub struct DisabledSearch;

#[async_trait]
impl SearchProvider for DisabledSearch {
    async fn search(&self, _query: &str, _k: usize) -> Result<Vec<SearchResult>> {
        Err(DependencyError::Unavailable {
            name: "search".to_string(),
            reason: "no search provider configured".to_string(),
        }
        .into())
    }
}

#[async_trait]
impl Scraper for DisabledSearch {
    async fn scrape(&self, _url: &str) -> Result<String> {
        Err(DependencyError::Unavailable {
            name: "scrape".to_string(),
            reason: "no scraper configured".to_string(),
        }
        .into())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::CannedWeb;
    use super::*;
    use crate::llm::testing::ScriptedLlm;
    use std::sync::Arc;

    fn canned() -> Arc<CannedWeb> {
        Arc::new(CannedWeb {
            results: vec![
                SearchResult {
                    title: "ExampleCorp leadership".to_string(),
                    url: "https://example.com/about".to_string(),
                    snippet: "About the company".to_string(),
                },
                SearchResult {
                    title: "ExampleCorp news".to_string(),
                    url: "https://example.com/news".to_string(),
                    snippet: "Latest news".to_string(),
                },
                SearchResult {
                    title: "Third result".to_string(),
                    url: "https://example.com/third".to_string(),
                    snippet: "Snippet only".to_string(),
                },
            ],
            page_text: "Jane Doe is the CEO of ExampleCorp.".to_string(),
        })
    }

    fn fallback() -> WebFallback {
        let web = canned();
        WebFallback::new(
            web.clone(),
            web,
            Duration::from_secs(10),
            Duration::from_secs(15),
        )
    }

    #[test]
    fn test_should_engage() {
        assert!(WebFallback::should_engage(0.1, 5));
        assert!(WebFallback::should_engage(0.9, 0));
        assert!(!WebFallback::should_engage(0.5, 3));
    }

    #[tokio::test]
    async fn test_gather_context_scrapes_top_two() {
        let context = fallback().gather_context("who is the ceo").await;
        assert!(context.context.contains("[Web 1]"));
        assert!(context.context.contains("[Web 2]"));
        assert!(context.context.contains("[Web 3]"));
        assert!(context.context.contains("Jane Doe is the CEO"));
        assert_eq!(context.sources.len(), 3);
        assert!(context.sources[0].scraped);
        assert!(!context.sources[2].scraped);
    }

    #[tokio::test]
    async fn test_disabled_search_yields_empty_context() {
        let disabled = Arc::new(DisabledSearch);
        let fallback = WebFallback::new(
            disabled.clone(),
            disabled,
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        let context = fallback.gather_context("anything").await;
        assert!(context.context.is_empty());
        assert!(context.sources.is_empty());
    }

    #[tokio::test]
    async fn test_augment_answer_combines_contexts() {
        let llm = ScriptedLlm::new(["Jane Doe is the CEO [Web 1]."]);
        let answer = fallback()
            .augment_answer(
                &llm,
                "Who is the CEO of ExampleCorp?",
                "",
                "[Web 1] content",
                &GenerateOptions::default(),
            )
            .await
            .unwrap();
        assert!(answer.contains("[Web 1]"));
    }
}
