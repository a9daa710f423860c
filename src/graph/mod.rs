//! Entity extraction, relationship graph, and community detection.
//!
//! Entities are stored in an arena keyed by `(type, normalized name)`;
//! relationships live in a separate table keyed by the ordered entity pair
//! plus verb. References between them are string keys, never pointers, so
//! the whole graph serializes cleanly to JSON.

mod community;
mod entities;
mod graph;

pub use community::{Community, CommunityDetector, is_holistic_query};
pub use entities::{Entity, EntityStore, EntityType};
pub use graph::{ConnectedEntity, EntityGraph, Relationship};

/// Builds the arena key for an entity: `{type}:{lowercased name}`.
#[must_use]
pub fn entity_key(name: &str, entity_type: EntityType) -> String {
    format!("{}:{}", entity_type.as_str(), name.trim().to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_key_normalizes() {
        assert_eq!(
            entity_key(" Chris Norman ", EntityType::Person),
            "person:chris norman"
        );
    }
}
