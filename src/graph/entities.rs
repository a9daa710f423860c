//! Entity extraction and storage.
//!
//! Two extraction modes: LLM-based for text of 500+ chars (falling back on
//! any dependency failure), and regex-based for short text or degraded
//! operation. Entities with the same `(type, lowercased name)` merge on
//! upsert, accumulating mentions and source ids; they never fork.

use crate::error::Result;
use crate::graph::entity_key;
use crate::llm::json::extract_json;
use crate::llm::{GenerateOptions, LlmClient};
use crate::persist::{load_json_or_default, save_json_atomic};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::LazyLock;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Context snippets kept per entity.
const MAX_SNIPPETS: usize = 5;

/// Text below this length always uses regex extraction.
const LLM_MIN_CHARS: usize = 500;

/// Entity classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    /// A person.
    Person,
    /// A company or organization.
    Company,
    /// A place.
    Location,
    /// A product, tool, or piece of software.
    Product,
    /// A date, quarter, or time period.
    Date,
    /// A number with context (revenue, count, percentage).
    Metric,
}

impl EntityType {
    /// Wire string for this type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Person => "person",
            Self::Company => "company",
            Self::Location => "location",
            Self::Product => "product",
            Self::Date => "date",
            Self::Metric => "metric",
        }
    }

    /// Parses a type from its wire string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "person" => Some(Self::Person),
            "company" | "organization" | "org" => Some(Self::Company),
            "location" | "place" => Some(Self::Location),
            "product" | "tool" | "software" => Some(Self::Product),
            "date" | "time" | "period" => Some(Self::Date),
            "metric" | "number" => Some(Self::Metric),
            _ => None,
        }
    }
}

/// A named entity extracted from source text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    /// Entity surface name (normalized by the extractor, e.g. full names).
    pub name: String,
    /// Entity classification.
    pub entity_type: EntityType,
    /// Total mention count across sources.
    pub mentions: u64,
    /// Sources in which this entity appears.
    pub source_ids: Vec<String>,
    /// Up to [`MAX_SNIPPETS`] context snippets.
    pub context_snippets: Vec<String>,
}

impl Entity {
    fn new(name: &str, entity_type: EntityType, snippet: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            entity_type,
            mentions: 1,
            source_ids: Vec::new(),
            context_snippets: snippet.into_iter().collect(),
        }
    }
}

type NotebookEntities = HashMap<String, HashMap<String, Entity>>;

/// Arena of entities per notebook with JSON persistence.
pub struct EntityStore {
    state: Mutex<NotebookEntities>,
    persist_path: Option<PathBuf>,
}

impl EntityStore {
    /// Creates a store backed by `path` (`None` for memory-only).
    #[must_use]
    pub fn new(persist_path: Option<PathBuf>) -> Self {
        let state: NotebookEntities = persist_path
            .as_deref()
            .map(load_json_or_default)
            .unwrap_or_default();
        Self {
            state: Mutex::new(state),
            persist_path,
        }
    }

    /// Extracts entities from text and merges them into the notebook arena.
    ///
    /// Uses the LLM for text of 500+ chars when a client is provided,
    /// degrading to regex extraction on any failure.
    ///
    /// # Errors
    ///
    /// Returns an error only on persistence failure; extraction itself
    /// always degrades rather than failing.
    pub async fn extract_and_store(
        &self,
        llm: Option<&dyn LlmClient>,
        text: &str,
        notebook_id: &str,
        source_id: &str,
    ) -> Result<Vec<Entity>> {
        let extracted = match llm {
            Some(client) if text.len() >= LLM_MIN_CHARS => {
                match extract_with_llm(client, text).await {
                    Ok(entities) => entities,
                    Err(e) => {
                        warn!(error = %e, "LLM entity extraction failed, using regex fallback");
                        extract_with_regex(text)
                    }
                }
            }
            _ => extract_with_regex(text),
        };

        if extracted.is_empty() {
            return Ok(Vec::new());
        }

        let mut state = self.state.lock().await;
        let notebook = state.entry(notebook_id.to_string()).or_default();

        let mut stored = Vec::with_capacity(extracted.len());
        for entity in extracted {
            let key = entity_key(&entity.name, entity.entity_type);
            match notebook.get_mut(&key) {
                Some(existing) => {
                    existing.mentions += entity.mentions;
                    if !existing.source_ids.iter().any(|s| s == source_id) {
                        existing.source_ids.push(source_id.to_string());
                    }
                    for snippet in entity.context_snippets.into_iter().take(2) {
                        if !existing.context_snippets.contains(&snippet) {
                            existing.context_snippets.push(snippet);
                        }
                    }
                    existing.context_snippets.truncate(MAX_SNIPPETS);
                    stored.push(existing.clone());
                }
                None => {
                    let mut entity = entity;
                    entity.source_ids = vec![source_id.to_string()];
                    notebook.insert(key, entity.clone());
                    stored.push(entity);
                }
            }
        }

        self.save_locked(&state);
        debug!(count = stored.len(), source_id, "entities stored");
        Ok(stored)
    }

    /// Returns all entities for a notebook, most-mentioned first.
    pub async fn entities(&self, notebook_id: &str) -> Vec<Entity> {
        let state = self.state.lock().await;
        let mut entities: Vec<Entity> = state
            .get(notebook_id)
            .map(|nb| nb.values().cloned().collect())
            .unwrap_or_default();
        entities.sort_by(|a, b| b.mentions.cmp(&a.mentions));
        entities
    }

    /// Searches entities by name substring, exact matches first.
    pub async fn search(&self, notebook_id: &str, query: &str, limit: usize) -> Vec<Entity> {
        let query_lower = query.to_lowercase();
        let state = self.state.lock().await;
        let mut matches: Vec<Entity> = state
            .get(notebook_id)
            .map(|nb| {
                nb.values()
                    .filter(|e| e.name.to_lowercase().contains(&query_lower))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        matches.sort_by(|a, b| {
            let exact_a = a.name.to_lowercase() == query_lower;
            let exact_b = b.name.to_lowercase() == query_lower;
            exact_b
                .cmp(&exact_a)
                .then_with(|| b.mentions.cmp(&a.mentions))
        });
        matches.truncate(limit);
        matches
    }

    /// Finds known entities mentioned in a query.
    ///
    /// Person entities also match on first name alone (3+ chars).
    pub async fn find_in_query(&self, notebook_id: &str, query: &str) -> Vec<Entity> {
        let query_lower = query.to_lowercase();
        let query_words: Vec<&str> = query_lower.split_whitespace().collect();
        let state = self.state.lock().await;

        let mut found: Vec<Entity> = state
            .get(notebook_id)
            .map(|nb| {
                nb.values()
                    .filter(|entity| {
                        let name_lower = entity.name.to_lowercase();
                        if query_lower.contains(&name_lower) {
                            return true;
                        }
                        if entity.entity_type == EntityType::Person
                            && let Some(first) = name_lower.split_whitespace().next()
                            && first.len() > 2
                        {
                            return query_words.contains(&first);
                        }
                        false
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        found.sort_by(|a, b| b.mentions.cmp(&a.mentions));
        found
    }

    /// Per-source boost scores derived from entity mentions in the query.
    ///
    /// Scores are in `[0, 1]`; sources evidencing more (and more-mentioned)
    /// query entities score higher.
    pub async fn source_boosts(&self, notebook_id: &str, query: &str) -> HashMap<String, f32> {
        let entities = self.find_in_query(notebook_id, query).await;
        if entities.is_empty() {
            return HashMap::new();
        }

        let mut scores: HashMap<String, f32> = HashMap::new();
        for entity in entities {
            #[allow(clippy::cast_precision_loss)]
            let weight = (entity.mentions as f32 / 10.0).min(1.0);
            for source_id in &entity.source_ids {
                let score = scores.entry(source_id.clone()).or_insert(0.0);
                *score = if *score > 0.0 {
                    (*score + weight * 0.3).min(1.0)
                } else {
                    weight * 0.5
                };
            }
        }
        scores
    }

    /// Entity context block prepended to LLM prompts.
    pub async fn context_for_query(
        &self,
        notebook_id: &str,
        query: &str,
        max_entities: usize,
    ) -> String {
        let entities = self.find_in_query(notebook_id, query).await;
        if entities.is_empty() {
            return String::new();
        }

        let parts: Vec<String> = entities
            .iter()
            .take(max_entities)
            .map(|entity| {
                let context = entity
                    .context_snippets
                    .iter()
                    .take(2)
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(" | ");
                if context.is_empty() {
                    format!(
                        "- {} ({}): mentioned {} times",
                        entity.name,
                        entity.entity_type.as_str(),
                        entity.mentions
                    )
                } else {
                    format!("- {} ({}): {}", entity.name, entity.entity_type.as_str(), context)
                }
            })
            .collect();

        format!("KNOWN ENTITIES:\n{}\n\n", parts.join("\n"))
    }

    /// Removes a source from all entity references; entities left with no
    /// sources are deleted.
    pub async fn delete_source(&self, notebook_id: &str, source_id: &str) {
        let mut state = self.state.lock().await;
        if let Some(notebook) = state.get_mut(notebook_id) {
            notebook.retain(|_, entity| {
                entity.source_ids.retain(|s| s != source_id);
                !entity.source_ids.is_empty()
            });
        }
        self.save_locked(&state);
    }

    /// Removes every entity for a notebook (cascade on notebook deletion).
    pub async fn delete_notebook(&self, notebook_id: &str) {
        let mut state = self.state.lock().await;
        state.remove(notebook_id);
        self.save_locked(&state);
    }

    fn save_locked(&self, state: &NotebookEntities) {
        if let Some(path) = &self.persist_path
            && let Err(e) = save_json_atomic(path, state)
        {
            warn!(error = %e, "entity store save failed");
        }
    }
}

/// LLM extraction prompt and parse.
async fn extract_with_llm(llm: &dyn LlmClient, text: &str) -> Result<Vec<Entity>> {
    let sample_end = crate::chunking::semantic::floor_char_boundary(text, text.len().min(4000));
    let sample = &text[..sample_end];

    let user = format!(
        "Extract named entities from this text. Output ONLY valid JSON.\n\n\
         Text:\n{sample}\n\n\
         Extract entities of these types:\n\
         - person: Names of people\n\
         - company: Company/organization names\n\
         - location: Places, cities, countries\n\
         - product: Product names, tools, software\n\
         - date: Specific dates, time periods, quarters (Q1 2025, etc.)\n\
         - metric: Numbers with context (revenue, count, percentage)\n\n\
         For each entity, provide:\n\
         - name: The entity name (normalized, e.g., \"Chris Norman\" not \"Chris\")\n\
         - type: One of the types above\n\
         - context: A brief phrase showing how it's used\n\n\
         Output as JSON array:\n\
         [{{\"name\": \"...\", \"type\": \"...\", \"context\": \"...\"}}]\n\nJSON:"
    );

    let raw = llm
        .generate("You extract structured data.", &user, &GenerateOptions::fast(500))
        .await?;
    let value = extract_json(&raw)?;

    let mut entities = Vec::new();
    if let Some(items) = value.as_array() {
        for item in items {
            let (Some(name), Some(type_str)) = (
                item.get("name").and_then(|v| v.as_str()),
                item.get("type").and_then(|v| v.as_str()),
            ) else {
                continue;
            };
            let Some(entity_type) = EntityType::parse(type_str) else {
                continue;
            };
            if name.trim().is_empty() {
                continue;
            }
            let snippet = item
                .get("context")
                .and_then(|v| v.as_str())
                .map(String::from);
            entities.push(Entity::new(name.trim(), entity_type, snippet));
        }
    }
    Ok(entities)
}

// Pattern literals, exercised by the tests below.
#[allow(clippy::unwrap_used)]
static PERSON_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([A-Z][a-z]+(?:\s+[A-Z][a-z]+){1,2})\b").unwrap());
#[allow(clippy::unwrap_used)]
static QUARTER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(Q\s*[1-4]\s*(?:FY\s*)?\d{4})\b").unwrap());
#[allow(clippy::unwrap_used)]
static SLASH_DATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{1,2}/\d{1,2}/\d{2,4})\b").unwrap());
#[allow(clippy::unwrap_used)]
static METRIC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d+(?:,\d{3})*(?:\.\d+)?)\s*(percent|%|dollars?|\$|demos?|meetings?|calls?|revenue)\b")
        .unwrap()
});

/// Fast regex-based extraction, also the degraded-mode path.
#[must_use]
pub fn extract_with_regex(text: &str) -> Vec<Entity> {
    let mut entities = Vec::new();

    let snippet_around = |start: usize, end: usize, pad: usize| -> String {
        let s = crate::chunking::semantic::floor_char_boundary(text, start.saturating_sub(pad));
        let e = crate::chunking::semantic::floor_char_boundary(text, (end + pad).min(text.len()));
        text[s..e].trim().to_string()
    };

    // Capitalized bigrams/trigrams as person candidates
    for caps in PERSON_RE.captures_iter(text) {
        if let Some(m) = caps.get(1) {
            let name = m.as_str();
            if !matches!(
                name.to_lowercase().as_str(),
                "the company" | "the project" | "new york" | "los angeles"
            ) {
                entities.push(Entity::new(
                    name,
                    EntityType::Person,
                    Some(snippet_around(m.start(), m.end(), 30)),
                ));
            }
        }
    }

    // Quarters and slash dates
    for re in [&*QUARTER_RE, &*SLASH_DATE_RE] {
        for caps in re.captures_iter(text) {
            if let Some(m) = caps.get(1) {
                entities.push(Entity::new(
                    m.as_str(),
                    EntityType::Date,
                    Some(snippet_around(m.start(), m.end(), 20)),
                ));
            }
        }
    }

    // Numbers with units
    for caps in METRIC_RE.captures_iter(text) {
        if let Some(m) = caps.get(0) {
            entities.push(Entity::new(
                m.as_str(),
                EntityType::Metric,
                Some(snippet_around(m.start(), m.end(), 30)),
            ));
        }
    }

    // Dedupe by (lowercased name, type)
    let mut seen = std::collections::HashSet::new();
    entities.retain(|e| seen.insert((e.name.to_lowercase(), e.entity_type)));
    entities
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedLlm;

    #[test]
    fn test_regex_extracts_persons() {
        let entities = extract_with_regex("Chris Norman ran 7 demos in Q1 FY2026.");
        assert!(
            entities
                .iter()
                .any(|e| e.name == "Chris Norman" && e.entity_type == EntityType::Person)
        );
    }

    #[test]
    fn test_regex_extracts_quarters_and_metrics() {
        let entities = extract_with_regex("Revenue hit 1,200 dollars in Q1 2026.");
        assert!(entities.iter().any(|e| e.entity_type == EntityType::Date));
        assert!(entities.iter().any(|e| e.entity_type == EntityType::Metric));
    }

    #[test]
    fn test_regex_dedupes() {
        let entities = extract_with_regex("Alice Smith met Alice Smith.");
        let alice_count = entities.iter().filter(|e| e.name == "Alice Smith").count();
        assert_eq!(alice_count, 1);
    }

    #[tokio::test]
    async fn test_merge_on_upsert_never_forks() {
        let store = EntityStore::new(None);
        store
            .extract_and_store(None, "Alice Smith did things.", "nb", "s1")
            .await
            .unwrap();
        store
            .extract_and_store(None, "Alice Smith did more things.", "nb", "s2")
            .await
            .unwrap();

        let entities = store.entities("nb").await;
        let alice: Vec<&Entity> = entities.iter().filter(|e| e.name == "Alice Smith").collect();
        assert_eq!(alice.len(), 1);
        assert_eq!(alice[0].mentions, 2);
        assert_eq!(alice[0].source_ids, vec!["s1", "s2"]);
    }

    #[tokio::test]
    async fn test_snippets_bounded_at_five() {
        let store = EntityStore::new(None);
        for i in 0..10 {
            store
                .extract_and_store(
                    None,
                    &format!("Alice Smith appearance number {i} in context."),
                    "nb",
                    &format!("s{i}"),
                )
                .await
                .unwrap();
        }
        let entities = store.entities("nb").await;
        let alice = entities.iter().find(|e| e.name == "Alice Smith").unwrap();
        assert!(alice.context_snippets.len() <= 5);
    }

    #[tokio::test]
    async fn test_llm_extraction_parses_json() {
        let llm = ScriptedLlm::new([
            r#"[{"name": "Acme Corp", "type": "company", "context": "employer"}]"#,
        ]);
        let long_text = "word ".repeat(150);
        let store = EntityStore::new(None);
        let stored = store
            .extract_and_store(Some(&llm), &long_text, "nb", "s1")
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].name, "Acme Corp");
        assert_eq!(stored[0].entity_type, EntityType::Company);
    }

    #[tokio::test]
    async fn test_llm_garbage_degrades_to_regex() {
        let llm = ScriptedLlm::new(["not json at all"]);
        let text = format!("Bob Jones spoke. {}", "filler ".repeat(100));
        let store = EntityStore::new(None);
        let stored = store
            .extract_and_store(Some(&llm), &text, "nb", "s1")
            .await
            .unwrap();
        assert!(stored.iter().any(|e| e.name == "Bob Jones"));
    }

    #[tokio::test]
    async fn test_find_in_query_first_name() {
        let store = EntityStore::new(None);
        store
            .extract_and_store(None, "Chris Norman ran the demos.", "nb", "s1")
            .await
            .unwrap();

        let found = store.find_in_query("nb", "how many demos did chris run?").await;
        assert!(found.iter().any(|e| e.name == "Chris Norman"));
    }

    #[tokio::test]
    async fn test_delete_source_drops_empty_entities() {
        let store = EntityStore::new(None);
        store
            .extract_and_store(None, "Dana White reported results.", "nb", "s1")
            .await
            .unwrap();
        store.delete_source("nb", "s1").await;
        assert!(store.entities("nb").await.is_empty());
    }

    #[tokio::test]
    async fn test_source_boosts_bounded() {
        let store = EntityStore::new(None);
        store
            .extract_and_store(None, "Eve Adams everywhere.", "nb", "s1")
            .await
            .unwrap();
        let boosts = store.source_boosts("nb", "what about Eve Adams?").await;
        for score in boosts.values() {
            assert!((0.0..=1.0).contains(score));
        }
    }

    #[tokio::test]
    async fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entities.json");
        {
            let store = EntityStore::new(Some(path.clone()));
            store
                .extract_and_store(None, "Frank Moore presented.", "nb", "s1")
                .await
                .unwrap();
        }
        let store = EntityStore::new(Some(path));
        assert!(!store.entities("nb").await.is_empty());
    }
}
