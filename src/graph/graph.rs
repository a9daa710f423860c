//! Entity relationship graph.
//!
//! Relationships are undirected edges keyed by the ordered entity pair plus
//! verb. Co-occurrence at sentence granularity contributes 0.5 strength,
//! LLM-extracted verb edges contribute 0.8, and repeated evidence adds 0.1
//! saturating at 1.0. Traversal is plain BFS over an adjacency map of
//! string keys.

use crate::error::Result;
use crate::graph::entities::{Entity, EntityType};
use crate::graph::entity_key;
use crate::llm::json::extract_json;
use crate::llm::{GenerateOptions, LlmClient};
use crate::persist::{load_json_or_default, save_json_atomic};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Strength contributed by sentence co-occurrence.
const CO_OCCURRENCE_STRENGTH: f32 = 0.5;
/// Strength contributed by LLM-extracted semantic edges.
const SEMANTIC_STRENGTH: f32 = 0.8;
/// Strength added by repeated evidence for an existing edge.
const REPEAT_INCREMENT: f32 = 0.1;
/// Context snippets kept per relationship.
const MAX_SNIPPETS: usize = 5;

/// An undirected relationship between two entities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    /// First entity surface name.
    pub source_entity: String,
    /// First entity type.
    pub source_type: EntityType,
    /// Relationship verb (e.g. `works_with`, `reported`, `mentioned_with`).
    pub relationship: String,
    /// Second entity surface name.
    pub target_entity: String,
    /// Second entity type.
    pub target_type: EntityType,
    /// Accumulated strength in `(0, 1]`.
    pub strength: f32,
    /// Up to [`MAX_SNIPPETS`] evidence snippets.
    pub context_snippets: Vec<String>,
    /// Sources that evidenced this edge.
    pub source_ids: Vec<String>,
}

/// A node in the adjacency map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct GraphNode {
    name: String,
    entity_type: Option<EntityType>,
    /// Neighbor entity key -> accumulated connection strength.
    connections: HashMap<String, f32>,
    total_mentions: u64,
}

/// An entity reached by graph traversal.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectedEntity {
    /// Entity surface name.
    pub name: String,
    /// Entity type, when known.
    pub entity_type: Option<EntityType>,
    /// BFS depth from the starting entity.
    pub depth: usize,
    /// Direct connection strength to the starting entity (0 beyond depth 1).
    pub connection_strength: f32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct GraphState {
    /// notebook -> edge key -> relationship.
    relationships: HashMap<String, HashMap<String, Relationship>>,
    /// notebook -> entity key -> node.
    nodes: HashMap<String, HashMap<String, GraphNode>>,
}

/// Per-notebook relationship graph with JSON persistence.
pub struct EntityGraph {
    state: Mutex<GraphState>,
    persist_path: Option<std::path::PathBuf>,
}

impl EntityGraph {
    /// Creates a graph backed by `path` (`None` for memory-only).
    #[must_use]
    pub fn new(persist_path: Option<std::path::PathBuf>) -> Self {
        let state: GraphState = persist_path
            .as_deref()
            .map(load_json_or_default)
            .unwrap_or_default();
        Self {
            state: Mutex::new(state),
            persist_path,
        }
    }

    /// Edge key: ordered pair of entity keys plus verb.
    fn relationship_key(a: &str, b: &str, verb: &str) -> String {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        format!("{first}|{verb}|{second}")
    }

    /// Extracts relationships from text and merges them into the graph.
    ///
    /// Co-occurrence edges come from every entity pair co-mentioned in one
    /// sentence; semantic verb edges come from the LLM when available and
    /// the text is long enough.
    ///
    /// # Errors
    ///
    /// Never fails on extraction; LLM failures degrade to co-occurrence
    /// only.
    pub async fn extract_relationships(
        &self,
        llm: Option<&dyn LlmClient>,
        text: &str,
        notebook_id: &str,
        source_id: &str,
        entities: &[Entity],
    ) -> Result<Vec<Relationship>> {
        if entities.len() < 2 {
            return Ok(Vec::new());
        }

        let mut relationships = co_occurrences(text, entities);

        if let Some(client) = llm
            && text.len() > 200
        {
            match extract_with_llm(client, text, entities).await {
                Ok(mut semantic) => relationships.append(&mut semantic),
                Err(e) => warn!(error = %e, "LLM relationship extraction failed"),
            }
        }

        if !relationships.is_empty() {
            self.store(notebook_id, source_id, &relationships).await;
        }
        Ok(relationships)
    }

    async fn store(&self, notebook_id: &str, source_id: &str, relationships: &[Relationship]) {
        let mut state = self.state.lock().await;

        for rel in relationships {
            let key = Self::relationship_key(
                &rel.source_entity.to_lowercase(),
                &rel.target_entity.to_lowercase(),
                &rel.relationship,
            );

            let edges = state.relationships.entry(notebook_id.to_string()).or_default();
            match edges.get_mut(&key) {
                Some(existing) => {
                    existing.strength = (existing.strength + REPEAT_INCREMENT).min(1.0);
                    if !existing.source_ids.iter().any(|s| s == source_id) {
                        existing.source_ids.push(source_id.to_string());
                    }
                    for snippet in &rel.context_snippets {
                        if !existing.context_snippets.contains(snippet) {
                            existing.context_snippets.push(snippet.clone());
                        }
                    }
                    existing.context_snippets.truncate(MAX_SNIPPETS);
                }
                None => {
                    let mut rel = rel.clone();
                    rel.source_ids = vec![source_id.to_string()];
                    edges.insert(key, rel);
                }
            }

            // Update adjacency for both endpoints
            let nodes = state.nodes.entry(notebook_id.to_string()).or_default();
            for (name, entity_type, other_name, other_type) in [
                (
                    &rel.source_entity,
                    rel.source_type,
                    &rel.target_entity,
                    rel.target_type,
                ),
                (
                    &rel.target_entity,
                    rel.target_type,
                    &rel.source_entity,
                    rel.source_type,
                ),
            ] {
                let node_key = entity_key(name, entity_type);
                let other_key = entity_key(other_name, other_type);
                let node = nodes.entry(node_key).or_insert_with(|| GraphNode {
                    name: name.clone(),
                    entity_type: Some(entity_type),
                    ..GraphNode::default()
                });
                node.total_mentions += 1;
                *node.connections.entry(other_key).or_insert(0.0) += rel.strength;
            }
        }

        self.save_locked(&state);
        debug!(
            notebook_id,
            count = relationships.len(),
            "relationships stored"
        );
    }

    /// BFS up to `max_depth`, sorted by connection strength then depth.
    pub async fn connected_entities(
        &self,
        notebook_id: &str,
        entity_name: &str,
        max_depth: usize,
        limit: usize,
    ) -> Vec<ConnectedEntity> {
        let state = self.state.lock().await;
        let Some(nodes) = state.nodes.get(notebook_id) else {
            return Vec::new();
        };

        let Some(start_key) = find_node_key(nodes, entity_name) else {
            return Vec::new();
        };

        let mut visited: HashSet<String> = HashSet::from([start_key.clone()]);
        let mut queue: VecDeque<(String, usize)> = VecDeque::from([(start_key.clone(), 0)]);
        let mut connected = Vec::new();

        while let Some((current_key, depth)) = queue.pop_front() {
            if connected.len() >= limit {
                break;
            }

            if depth > 0
                && let Some(node) = nodes.get(&current_key)
            {
                connected.push(ConnectedEntity {
                    name: node.name.clone(),
                    entity_type: node.entity_type,
                    depth,
                    connection_strength: node.connections.get(&start_key).copied().unwrap_or(0.0),
                });
            }

            if depth < max_depth
                && let Some(node) = nodes.get(&current_key)
            {
                for neighbor_key in node.connections.keys() {
                    if nodes.contains_key(neighbor_key) && visited.insert(neighbor_key.clone()) {
                        queue.push_back((neighbor_key.clone(), depth + 1));
                    }
                }
            }
        }

        connected.sort_by(|a, b| {
            b.connection_strength
                .partial_cmp(&a.connection_strength)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.depth.cmp(&b.depth))
        });
        connected
    }

    /// All relationships involving an entity, strongest first.
    pub async fn relationships_for(&self, notebook_id: &str, entity_name: &str) -> Vec<Relationship> {
        let entity_lower = entity_name.to_lowercase();
        let state = self.state.lock().await;
        let mut results: Vec<Relationship> = state
            .relationships
            .get(notebook_id)
            .map(|edges| {
                edges
                    .values()
                    .filter(|rel| {
                        rel.source_entity.to_lowercase() == entity_lower
                            || rel.target_entity.to_lowercase() == entity_lower
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        results.sort_by(|a, b| {
            b.strength
                .partial_cmp(&a.strength)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        results
    }

    /// BFS shortest path between two entities; `None` if disconnected.
    pub async fn path_between(
        &self,
        notebook_id: &str,
        entity1: &str,
        entity2: &str,
        max_depth: usize,
    ) -> Option<Vec<String>> {
        let state = self.state.lock().await;
        let nodes = state.nodes.get(notebook_id)?;

        let start_key = find_node_key(nodes, entity1)?;
        let end_key = find_node_key(nodes, entity2)?;

        let mut visited: HashSet<String> = HashSet::from([start_key.clone()]);
        let mut queue: VecDeque<(String, Vec<String>)> =
            VecDeque::from([(start_key, vec![entity1.to_string()])]);

        while let Some((current_key, path)) = queue.pop_front() {
            if current_key == end_key {
                return Some(path);
            }
            if path.len() > max_depth {
                continue;
            }
            if let Some(node) = nodes.get(&current_key) {
                for neighbor_key in node.connections.keys() {
                    if let Some(neighbor) = nodes.get(neighbor_key)
                        && visited.insert(neighbor_key.clone())
                    {
                        let mut next_path = path.clone();
                        next_path.push(neighbor.name.clone());
                        queue.push_back((neighbor_key.clone(), next_path));
                    }
                }
            }
        }

        None
    }

    /// Relationship context block for LLM prompts, bounded by `max_chars`.
    pub async fn context_for_query(
        &self,
        notebook_id: &str,
        entities: &[String],
        max_chars: usize,
    ) -> String {
        let mut parts = Vec::new();
        for entity_name in entities.iter().take(3) {
            for rel in self
                .relationships_for(notebook_id, entity_name)
                .await
                .into_iter()
                .take(3)
            {
                parts.push(format!(
                    "- {} {} {}",
                    rel.source_entity, rel.relationship, rel.target_entity
                ));
            }
        }

        if parts.is_empty() {
            return String::new();
        }

        parts.truncate(5);
        let context = format!("ENTITY RELATIONSHIPS:\n{}\n\n", parts.join("\n"));
        let end = crate::chunking::semantic::floor_char_boundary(&context, max_chars.min(context.len()));
        context[..end].to_string()
    }

    /// Adjacency map (entity name -> neighbor names) for community
    /// detection.
    pub async fn adjacency(&self, notebook_id: &str) -> HashMap<String, HashSet<String>> {
        let state = self.state.lock().await;
        let Some(nodes) = state.nodes.get(notebook_id) else {
            return HashMap::new();
        };

        let mut adjacency: HashMap<String, HashSet<String>> = HashMap::new();
        for node in nodes.values() {
            let neighbors = adjacency.entry(node.name.clone()).or_default();
            for conn_key in node.connections.keys() {
                if let Some(neighbor) = nodes.get(conn_key) {
                    neighbors.insert(neighbor.name.clone());
                }
            }
        }
        adjacency
    }

    /// Source ids evidencing relationships that involve an entity.
    pub async fn sources_for_entity(&self, notebook_id: &str, entity_name: &str) -> Vec<String> {
        let mut sources = Vec::new();
        for rel in self.relationships_for(notebook_id, entity_name).await {
            for source_id in rel.source_ids {
                if !sources.contains(&source_id) {
                    sources.push(source_id);
                }
            }
        }
        sources
    }

    /// Node and edge counts plus the most connected entities.
    pub async fn stats(&self, notebook_id: &str) -> (usize, usize, Vec<(String, usize)>) {
        let state = self.state.lock().await;
        let node_count = state.nodes.get(notebook_id).map_or(0, HashMap::len);
        let edge_count = state.relationships.get(notebook_id).map_or(0, HashMap::len);

        let mut top: Vec<(String, usize)> = state
            .nodes
            .get(notebook_id)
            .map(|nodes| {
                nodes
                    .values()
                    .map(|n| (n.name.clone(), n.connections.len()))
                    .collect()
            })
            .unwrap_or_default();
        top.sort_by(|a, b| b.1.cmp(&a.1));
        top.truncate(10);

        (node_count, edge_count, top)
    }

    /// Removes a source's evidence; edges with no remaining sources are
    /// dropped (nodes are left for the next full rebuild).
    pub async fn delete_source(&self, notebook_id: &str, source_id: &str) {
        let mut state = self.state.lock().await;
        if let Some(edges) = state.relationships.get_mut(notebook_id) {
            edges.retain(|_, rel| {
                rel.source_ids.retain(|s| s != source_id);
                !rel.source_ids.is_empty()
            });
        }
        self.save_locked(&state);
    }

    /// Removes the whole graph for a notebook (cascade on notebook
    /// deletion).
    pub async fn delete_notebook(&self, notebook_id: &str) {
        let mut state = self.state.lock().await;
        state.relationships.remove(notebook_id);
        state.nodes.remove(notebook_id);
        self.save_locked(&state);
    }

    fn save_locked(&self, state: &GraphState) {
        if let Some(path) = &self.persist_path
            && let Err(e) = save_json_atomic(path, state)
        {
            warn!(error = %e, "entity graph save failed");
        }
    }
}

fn find_node_key(nodes: &HashMap<String, GraphNode>, entity_name: &str) -> Option<String> {
    let name_lower = entity_name.to_lowercase();
    nodes
        .iter()
        .find(|(_, node)| node.name.to_lowercase() == name_lower)
        .map(|(key, _)| key.clone())
}

/// Sentence-granularity co-occurrence edges: every pair of entities
/// co-mentioned in one sentence.
fn co_occurrences(text: &str, entities: &[Entity]) -> Vec<Relationship> {
    let mut relationships = Vec::new();

    for sentence in text.split(['.', '!', '?', '\n']) {
        let sentence_lower = sentence.to_lowercase();
        if sentence_lower.len() < 20 {
            continue;
        }

        let present: Vec<&Entity> = entities
            .iter()
            .filter(|e| sentence_lower.contains(&e.name.to_lowercase()))
            .collect();

        for (i, e1) in present.iter().enumerate() {
            for e2 in present.iter().skip(i + 1) {
                let snippet_end = crate::chunking::semantic::floor_char_boundary(
                    sentence.trim(),
                    sentence.trim().len().min(200),
                );
                relationships.push(Relationship {
                    source_entity: e1.name.clone(),
                    source_type: e1.entity_type,
                    relationship: "mentioned_with".to_string(),
                    target_entity: e2.name.clone(),
                    target_type: e2.entity_type,
                    strength: CO_OCCURRENCE_STRENGTH,
                    context_snippets: vec![sentence.trim()[..snippet_end].to_string()],
                    source_ids: Vec::new(),
                });
            }
        }
    }

    relationships
}

/// LLM verb-typed edges between the supplied entities.
async fn extract_with_llm(
    llm: &dyn LlmClient,
    text: &str,
    entities: &[Entity],
) -> Result<Vec<Relationship>> {
    let sample_end = crate::chunking::semantic::floor_char_boundary(text, text.len().min(2000));
    let sample = &text[..sample_end];
    let entity_names: Vec<&str> = entities.iter().take(10).map(|e| e.name.as_str()).collect();

    let user = format!(
        "Extract relationships between these entities from the text.\n\n\
         Entities: {}\n\nText:\n{sample}\n\n\
         For each relationship found, output JSON with:\n\
         - source: entity name\n\
         - relationship: verb/action (e.g., \"works_with\", \"reported\", \"manages\", \"created\", \"discussed\")\n\
         - target: entity name\n\n\
         Output as JSON array. Only output relationships you find, empty array if none.\n\nJSON:",
        entity_names.join(", ")
    );

    let raw = llm
        .generate("You extract structured data.", &user, &GenerateOptions::fast(300))
        .await?;
    let value = extract_json(&raw)?;

    let type_lookup: HashMap<String, EntityType> = entities
        .iter()
        .map(|e| (e.name.to_lowercase(), e.entity_type))
        .collect();

    let mut relationships = Vec::new();
    if let Some(items) = value.as_array() {
        for item in items {
            let (Some(source), Some(target)) = (
                item.get("source").and_then(|v| v.as_str()),
                item.get("target").and_then(|v| v.as_str()),
            ) else {
                continue;
            };
            // Only keep edges whose endpoints are known entities
            let (Some(source_type), Some(target_type)) = (
                type_lookup.get(&source.to_lowercase()).copied(),
                type_lookup.get(&target.to_lowercase()).copied(),
            ) else {
                continue;
            };
            let verb = item
                .get("relationship")
                .and_then(|v| v.as_str())
                .unwrap_or("related_to");

            let snippet_end =
                crate::chunking::semantic::floor_char_boundary(sample, sample.len().min(150));
            relationships.push(Relationship {
                source_entity: source.to_string(),
                source_type,
                relationship: verb.to_string(),
                target_entity: target.to_string(),
                target_type,
                strength: SEMANTIC_STRENGTH,
                context_snippets: vec![sample[..snippet_end].to_string()],
                source_ids: Vec::new(),
            });
        }
    }

    Ok(relationships)
}
