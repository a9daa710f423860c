//! LLM dependency contract.
//!
//! The core never ships a provider. Callers hand in any [`LlmClient`]
//! implementation; the core only relies on `generate` (and optionally
//! `stream`) plus a model-speed hint. Tests use scripted stub clients.

pub mod json;

use crate::Result;
use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use std::time::Duration;

/// Model-speed hint attached to a request.
///
/// Decomposition, entity extraction, tagging, and community summaries use
/// `Fast`; answer synthesis uses `Main`. Providers may ignore the hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModelHint {
    /// Low-latency model for auxiliary calls.
    Fast,
    /// Primary model for answer generation.
    #[default]
    Main,
}

/// Options for a generation request.
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    /// Sampling temperature.
    pub temperature: f32,
    /// Maximum tokens to generate.
    pub max_tokens: usize,
    /// Model-speed hint.
    pub model_hint: ModelHint,
    /// Per-call timeout budget.
    pub timeout: Duration,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            max_tokens: 1000,
            model_hint: ModelHint::Main,
            timeout: Duration::from_secs(60),
        }
    }
}

impl GenerateOptions {
    /// Options tuned for short auxiliary calls on the fast model.
    #[must_use]
    pub fn fast(max_tokens: usize) -> Self {
        Self {
            temperature: 0.2,
            max_tokens,
            model_hint: ModelHint::Fast,
            timeout: Duration::from_secs(30),
        }
    }

    /// Sets the temperature.
    #[must_use]
    pub const fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Sets the timeout budget.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Trait for LLM providers.
///
/// The core treats the model as a text function and never inspects
/// internals.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Generates a completion for the system + user prompt pair.
    ///
    /// # Errors
    ///
    /// Returns a dependency error if the provider is unreachable, times
    /// out, or rejects the request.
    async fn generate(&self, system: &str, user: &str, opts: &GenerateOptions) -> Result<String>;

    /// Streams token deltas for the system + user prompt pair.
    ///
    /// The default implementation yields the full `generate` result as one
    /// delta; providers with true streaming should override it.
    ///
    /// # Errors
    ///
    /// Returns a dependency error if the provider fails.
    async fn stream(
        &self,
        system: &str,
        user: &str,
        opts: &GenerateOptions,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let full = self.generate(system, user, opts).await?;
        Ok(futures_util::stream::once(async move { Ok(full) }).boxed())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedLlm;
    use super::*;

    #[tokio::test]
    async fn test_scripted_llm_pops_in_order() {
        let llm = ScriptedLlm::new(["first", "second"]);
        let opts = GenerateOptions::default();
        assert_eq!(llm.generate("", "", &opts).await.unwrap(), "first");
        assert_eq!(llm.generate("", "", &opts).await.unwrap(), "second");
        // Exhausted: repeats the last response
        assert_eq!(llm.generate("", "", &opts).await.unwrap(), "second");
    }

    #[tokio::test]
    async fn test_default_stream_yields_full_answer() {
        let llm = ScriptedLlm::new(["whole answer"]);
        let opts = GenerateOptions::default();
        let mut stream = llm.stream("", "", &opts).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first, "whole answer");
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn test_fast_options() {
        let opts = GenerateOptions::fast(300);
        assert_eq!(opts.model_hint, ModelHint::Fast);
        assert_eq!(opts.max_tokens, 300);
    }
}
