//! Community detection over the entity graph.
//!
//! Connected components first; components over 10 nodes are split into
//! denser sub-communities by greedy hub selection (the highest-degree node
//! claims its neighbors, unassigned nodes join the community with highest
//! overlap). Only communities of size 2+ are persisted.

use crate::error::Result;
use crate::graph::EntityGraph;
use crate::llm::{GenerateOptions, LlmClient};
use crate::persist::{load_json_or_default, save_json_atomic};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Components larger than this are split by hub selection.
const SPLIT_THRESHOLD: usize = 10;
/// Minimum hub community size during splitting.
const HUB_MIN_SIZE: usize = 3;

/// A community of related entities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Community {
    /// Community identifier.
    pub id: String,
    /// Auto-generated descriptive name.
    pub name: String,
    /// Entity names in this community (2+).
    pub entities: Vec<String>,
    /// LLM-generated summary, empty until summarization runs.
    #[serde(default)]
    pub summary: String,
    /// actual edges / max possible edges within the community.
    pub density: f32,
    /// Sources contributing evidence for this community.
    pub source_ids: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CommunityState {
    /// notebook -> community id -> community.
    communities: HashMap<String, HashMap<String, Community>>,
    /// notebook -> lowercased entity name -> community id.
    entity_to_community: HashMap<String, HashMap<String, String>>,
}

/// Detects and stores entity communities per notebook.
pub struct CommunityDetector {
    state: Mutex<CommunityState>,
    persist_path: Option<std::path::PathBuf>,
}

impl CommunityDetector {
    /// Creates a detector backed by `path` (`None` for memory-only).
    #[must_use]
    pub fn new(persist_path: Option<std::path::PathBuf>) -> Self {
        let state: CommunityState = persist_path
            .as_deref()
            .map(load_json_or_default)
            .unwrap_or_default();
        Self {
            state: Mutex::new(state),
            persist_path,
        }
    }

    /// Recomputes communities for a notebook from the graph's adjacency.
    ///
    /// # Errors
    ///
    /// Never fails; returns the persisted communities.
    pub async fn detect(&self, notebook_id: &str, graph: &EntityGraph) -> Result<Vec<Community>> {
        let adjacency = graph.adjacency(notebook_id).await;
        if adjacency.is_empty() {
            return Ok(Vec::new());
        }

        let raw_communities = cluster(&adjacency);

        let mut state = self.state.lock().await;
        let communities_map = state.communities.entry(notebook_id.to_string()).or_default();
        communities_map.clear();
        let mut membership: HashMap<String, String> = HashMap::new();

        let notebook_prefix: String = notebook_id.chars().take(8).collect();
        let mut communities = Vec::new();

        for (i, members) in raw_communities.into_iter().enumerate() {
            if members.len() < 2 {
                continue;
            }

            let comm_id = format!("comm_{notebook_prefix}_{i}");

            // Density: actual_edges / max_edges within the member set
            let total_edges: usize = members
                .iter()
                .map(|m| {
                    adjacency
                        .get(m)
                        .map_or(0, |neighbors| neighbors.intersection(&members).count())
                })
                .sum::<usize>()
                / 2;
            let max_edges = members.len() * (members.len() - 1) / 2;
            #[allow(clippy::cast_precision_loss)]
            let density = if max_edges > 0 {
                total_edges as f32 / max_edges as f32
            } else {
                0.0
            };

            // Contributing sources come from the members' relationships
            let mut source_ids: Vec<String> = Vec::new();
            for member in &members {
                for source_id in graph.sources_for_entity(notebook_id, member).await {
                    if !source_ids.contains(&source_id) {
                        source_ids.push(source_id);
                    }
                }
            }
            source_ids.truncate(20);

            let mut entities: Vec<String> = members.iter().cloned().collect();
            entities.sort();

            let community = Community {
                id: comm_id.clone(),
                name: format!("Community {}", i + 1),
                entities,
                summary: String::new(),
                density,
                source_ids,
            };

            for entity in &members {
                membership.insert(entity.to_lowercase(), comm_id.clone());
            }
            communities_map.insert(comm_id, community.clone());
            communities.push(community);
        }

        state
            .entity_to_community
            .insert(notebook_id.to_string(), membership);
        self.save_locked(&state);

        debug!(notebook_id, count = communities.len(), "communities detected");
        Ok(communities)
    }

    /// Generates an LLM name and summary for a community and persists both.
    ///
    /// # Errors
    ///
    /// Returns the LLM error if generation fails; the community is left
    /// unchanged in that case.
    pub async fn summarize(
        &self,
        notebook_id: &str,
        community_id: &str,
        graph: &EntityGraph,
        llm: &dyn LlmClient,
    ) -> Result<String> {
        let community = {
            let state = self.state.lock().await;
            state
                .communities
                .get(notebook_id)
                .and_then(|c| c.get(community_id))
                .cloned()
        };
        let Some(community) = community else {
            return Ok(String::new());
        };

        let mut relationships = Vec::new();
        for entity in community.entities.iter().take(10) {
            for rel in graph
                .relationships_for(notebook_id, entity)
                .await
                .into_iter()
                .take(3)
            {
                relationships.push(format!(
                    "{} {} {}",
                    rel.source_entity, rel.relationship, rel.target_entity
                ));
            }
        }
        if relationships.is_empty() {
            return Ok(String::new());
        }
        relationships.truncate(10);

        let entity_list: Vec<&str> = community
            .entities
            .iter()
            .take(15)
            .map(String::as_str)
            .collect();
        let user = format!(
            "Summarize this group of related entities in 2-3 sentences.\n\n\
             Entities: {}\n\nRelationships found:\n{}\n\n\
             Provide:\n\
             1. A short descriptive name for this group (3-5 words)\n\
             2. A summary of what connects these entities\n\n\
             Format:\nNAME: [group name]\nSUMMARY: [2-3 sentence summary]",
            entity_list.join(", "),
            relationships.join("\n")
        );

        let raw = llm
            .generate("You summarize entity groups.", &user, &GenerateOptions::fast(150))
            .await?;

        let mut name = String::new();
        let mut summary = String::new();
        for line in raw.lines() {
            if let Some(rest) = line.strip_prefix("NAME:") {
                name = rest.trim().to_string();
            } else if let Some(rest) = line.strip_prefix("SUMMARY:") {
                summary = rest.trim().to_string();
            }
        }

        let mut state = self.state.lock().await;
        if let Some(community) = state
            .communities
            .get_mut(notebook_id)
            .and_then(|c| c.get_mut(community_id))
        {
            if !name.is_empty() {
                community.name = name;
            }
            if !summary.is_empty() {
                community.summary = summary.clone();
            }
        }
        self.save_locked(&state);

        Ok(summary)
    }

    /// All communities for a notebook.
    pub async fn communities(&self, notebook_id: &str) -> Vec<Community> {
        let state = self.state.lock().await;
        state
            .communities
            .get(notebook_id)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default()
    }

    /// The community containing an entity, if any.
    pub async fn community_for_entity(
        &self,
        notebook_id: &str,
        entity_name: &str,
    ) -> Option<Community> {
        let state = self.state.lock().await;
        let comm_id = state
            .entity_to_community
            .get(notebook_id)?
            .get(&entity_name.to_lowercase())?;
        state.communities.get(notebook_id)?.get(comm_id).cloned()
    }

    /// Community context block for LLM prompts covering query entities.
    pub async fn context_for_query(
        &self,
        notebook_id: &str,
        entity_names: &[String],
        max_chars: usize,
    ) -> String {
        let mut seen: HashSet<String> = HashSet::new();
        let mut parts = Vec::new();

        for entity in entity_names.iter().take(3) {
            if let Some(community) = self.community_for_entity(notebook_id, entity).await
                && seen.insert(community.id.clone())
            {
                if community.summary.is_empty() {
                    let members: Vec<&str> = community
                        .entities
                        .iter()
                        .take(5)
                        .map(String::as_str)
                        .collect();
                    parts.push(format!("- {}: includes {}", community.name, members.join(", ")));
                } else {
                    parts.push(format!("- {}: {}", community.name, community.summary));
                }
            }
        }

        if parts.is_empty() {
            return String::new();
        }

        parts.truncate(3);
        let context = format!("RELATED TOPICS:\n{}\n\n", parts.join("\n"));
        let end =
            crate::chunking::semantic::floor_char_boundary(&context, max_chars.min(context.len()));
        context[..end].to_string()
    }

    /// Removes every community for a notebook (cascade on notebook
    /// deletion).
    pub async fn delete_notebook(&self, notebook_id: &str) {
        let mut state = self.state.lock().await;
        state.communities.remove(notebook_id);
        state.entity_to_community.remove(notebook_id);
        self.save_locked(&state);
    }

    fn save_locked(&self, state: &CommunityState) {
        if let Some(path) = &self.persist_path
            && let Err(e) = save_json_atomic(path, state)
        {
            warn!(error = %e, "community store save failed");
        }
    }
}

/// Detects whether a query asks for holistic/overview information that
/// benefits from community-level context.
#[must_use]
pub fn is_holistic_query(query: &str) -> bool {
    const HOLISTIC_PATTERNS: [&str; 10] = [
        "tell me about",
        "everything about",
        "overview of",
        "what do you know about",
        "summarize",
        "all about",
        "related to",
        "connected to",
        "who is involved",
        "what's the story",
    ];
    let query_lower = query.to_lowercase();
    HOLISTIC_PATTERNS.iter().any(|p| query_lower.contains(p))
}

/// Connected components, with large components split by hub selection.
fn cluster(adjacency: &HashMap<String, HashSet<String>>) -> Vec<HashSet<String>> {
    let mut visited: HashSet<String> = HashSet::new();
    let mut communities = Vec::new();

    for node in adjacency.keys() {
        if visited.contains(node) {
            continue;
        }

        // BFS component
        let mut component: HashSet<String> = HashSet::new();
        let mut queue: Vec<&str> = vec![node];
        while let Some(current) = queue.pop() {
            if !component.insert(current.to_string()) {
                continue;
            }
            if let Some(neighbors) = adjacency.get(current) {
                for neighbor in neighbors {
                    if !component.contains(neighbor) && adjacency.contains_key(neighbor) {
                        queue.push(neighbor);
                    }
                }
            }
        }

        visited.extend(component.iter().cloned());

        if component.len() > SPLIT_THRESHOLD {
            communities.extend(split_by_density(&component, adjacency));
        } else {
            communities.push(component);
        }
    }

    communities
}

/// Splits a large component into denser sub-communities around hub nodes.
fn split_by_density(
    component: &HashSet<String>,
    adjacency: &HashMap<String, HashSet<String>>,
) -> Vec<HashSet<String>> {
    // Degree within the component
    let mut degrees: Vec<(&String, usize)> = component
        .iter()
        .map(|node| {
            let degree = adjacency
                .get(node)
                .map_or(0, |neighbors| neighbors.intersection(component).count());
            (node, degree)
        })
        .collect();
    degrees.sort_by(|a, b| b.1.cmp(&a.1));

    let mut assigned: HashSet<String> = HashSet::new();
    let mut communities: Vec<HashSet<String>> = Vec::new();

    // Greedy: each hub claims its unassigned neighbors
    for (hub, _) in &degrees {
        if assigned.contains(*hub) {
            continue;
        }
        let mut community: HashSet<String> = HashSet::from([(*hub).clone()]);
        if let Some(neighbors) = adjacency.get(*hub) {
            for neighbor in neighbors {
                if component.contains(neighbor) && !assigned.contains(neighbor) {
                    community.insert(neighbor.clone());
                }
            }
        }
        if community.len() >= HUB_MIN_SIZE {
            assigned.extend(community.iter().cloned());
            communities.push(community);
        }
    }

    // Leftovers join the community with highest overlap, else singleton
    for node in component {
        if assigned.contains(node) {
            continue;
        }
        let neighbors = adjacency.get(node).cloned().unwrap_or_default();
        let best = communities
            .iter_mut()
            .map(|c| {
                let overlap = neighbors.intersection(c).count();
                (overlap, c)
            })
            .max_by_key(|(overlap, _)| *overlap);

        match best {
            Some((overlap, community)) if overlap > 0 => {
                community.insert(node.clone());
            }
            _ => communities.push(HashSet::from([node.clone()])),
        }
    }

    communities
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::entities::{Entity, EntityType};
    use crate::llm::testing::ScriptedLlm;

    fn adjacency(edges: &[(&str, &str)]) -> HashMap<String, HashSet<String>> {
        let mut adj: HashMap<String, HashSet<String>> = HashMap::new();
        for (a, b) in edges {
            adj.entry((*a).to_string())
                .or_default()
                .insert((*b).to_string());
            adj.entry((*b).to_string())
                .or_default()
                .insert((*a).to_string());
        }
        adj
    }

    #[test]
    fn test_cluster_connected_components() {
        let adj = adjacency(&[("a", "b"), ("b", "c"), ("x", "y")]);
        let communities = cluster(&adj);
        assert_eq!(communities.len(), 2);
        let sizes: Vec<usize> = {
            let mut s: Vec<usize> = communities.iter().map(HashSet::len).collect();
            s.sort_unstable();
            s
        };
        assert_eq!(sizes, vec![2, 3]);
    }

    #[test]
    fn test_large_component_split() {
        // Two dense hubs joined by one bridge edge, 12 nodes total
        let mut edges = Vec::new();
        for i in 1..=5 {
            edges.push(("hub1".to_string(), format!("a{i}")));
            edges.push(("hub2".to_string(), format!("b{i}")));
        }
        edges.push(("hub1".to_string(), "hub2".to_string()));
        let edge_refs: Vec<(&str, &str)> = edges
            .iter()
            .map(|(a, b)| (a.as_str(), b.as_str()))
            .collect();
        let adj = adjacency(&edge_refs);

        let communities = cluster(&adj);
        assert!(communities.len() >= 2, "expected a split, got {communities:?}");
    }

    async fn seeded_graph() -> EntityGraph {
        let graph = EntityGraph::new(None);
        let entities: Vec<Entity> = ["Alice Smith", "Bob Jones", "Carol White"]
            .iter()
            .map(|n| Entity {
                name: (*n).to_string(),
                entity_type: EntityType::Person,
                mentions: 1,
                source_ids: Vec::new(),
                context_snippets: Vec::new(),
            })
            .collect();
        graph
            .extract_relationships(
                None,
                "Alice Smith met Bob Jones and Carol White to plan the launch together.",
                "nb",
                "s1",
                &entities,
            )
            .await
            .unwrap();
        graph
    }

    #[tokio::test]
    async fn test_detect_persists_communities() {
        let graph = seeded_graph().await;
        let detector = CommunityDetector::new(None);
        let communities = detector.detect("nb", &graph).await.unwrap();

        assert_eq!(communities.len(), 1);
        assert_eq!(communities[0].entities.len(), 3);
        assert!(communities[0].density > 0.0);
        assert!(communities[0].source_ids.contains(&"s1".to_string()));

        let found = detector.community_for_entity("nb", "alice smith").await;
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn test_singletons_not_persisted() {
        let graph = EntityGraph::new(None);
        let detector = CommunityDetector::new(None);
        let communities = detector.detect("nb", &graph).await.unwrap();
        assert!(communities.is_empty());
    }

    #[tokio::test]
    async fn test_summarize_updates_name_and_summary() {
        let graph = seeded_graph().await;
        let detector = CommunityDetector::new(None);
        let communities = detector.detect("nb", &graph).await.unwrap();
        let comm_id = communities[0].id.clone();

        let llm = ScriptedLlm::new([
            "NAME: Launch Planning Team\nSUMMARY: Three people planning the launch together.",
        ]);
        let summary = detector.summarize("nb", &comm_id, &graph, &llm).await.unwrap();
        assert!(summary.contains("launch"));

        let updated = detector.communities("nb").await;
        assert_eq!(updated[0].name, "Launch Planning Team");
    }

    #[tokio::test]
    async fn test_context_for_query() {
        let graph = seeded_graph().await;
        let detector = CommunityDetector::new(None);
        detector.detect("nb", &graph).await.unwrap();

        let context = detector
            .context_for_query("nb", &["Alice Smith".to_string()], 400)
            .await;
        assert!(context.starts_with("RELATED TOPICS:"));
    }

    #[test]
    fn test_is_holistic_query() {
        assert!(is_holistic_query("Tell me about the launch team"));
        assert!(is_holistic_query("summarize everything"));
        assert!(!is_holistic_query("How many demos in Q1?"));
    }
}
