//! Entities - the nodes of the knowledge graph

use serde::{Deserialize, Serialize};

/// Type tag for entities created only to keep relations referentially intact
pub const UNKNOWN_ENTITY_TYPE: &str = "UNKNOWN";

/// How often a type tag has been observed for an entity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TypeVote {
    pub entity_type: String,
    pub count: u32,
}

/// A merged entity record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entity {
    /// Canonical name; the graph node id
    pub id: String,

    /// Display name as first extracted
    #[serde(default)]
    pub name: String,

    /// Most frequently observed type
    #[serde(default)]
    pub entity_type: String,

    /// Merged (possibly summarized) description
    #[serde(default)]
    pub description: String,

    /// Provenance chunk ids, sorted and unique
    #[serde(default)]
    pub source_ids: Vec<String>,

    /// Observed types in first-seen order
    #[serde(default)]
    pub type_votes: Vec<TypeVote>,
}

impl Entity {
    /// Create an empty entity for `name`
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let id = Self::canonicalize(&name);
        Self {
            id,
            name,
            entity_type: UNKNOWN_ENTITY_TYPE.to_string(),
            description: String::new(),
            source_ids: Vec::new(),
            type_votes: Vec::new(),
        }
    }

    /// Canonicalize a name for deduplication
    pub fn canonicalize(name: &str) -> String {
        name.trim()
            .trim_matches(|c| c == '"' || c == '\'')
            .to_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Record one observation of `entity_type`.
    pub fn vote_type(&mut self, entity_type: &str) {
        let entity_type = entity_type.trim();
        if entity_type.is_empty() || entity_type.eq_ignore_ascii_case(UNKNOWN_ENTITY_TYPE) {
            return;
        }
        let entity_type = entity_type.to_uppercase();
        match self.type_votes.iter_mut().find(|v| v.entity_type == entity_type) {
            Some(vote) => vote.count += 1,
            None => self.type_votes.push(TypeVote {
                entity_type,
                count: 1,
            }),
        }
        self.entity_type = self.resolved_type();
    }

    /// Most frequent type; ties go to the first seen.
    pub fn resolved_type(&self) -> String {
        let mut best: Option<&TypeVote> = None;
        for vote in &self.type_votes {
            if best.map_or(true, |b| vote.count > b.count) {
                best = Some(vote);
            }
        }
        best.map(|v| v.entity_type.clone())
            .unwrap_or_else(|| UNKNOWN_ENTITY_TYPE.to_string())
    }

    /// Text embedded into the entity vector index
    pub fn embedding_text(&self) -> String {
        format!("{} {}", self.name, self.description)
    }
}

/// One entity as extracted from one chunk
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityMention {
    pub name: String,
    pub entity_type: String,
    pub description: String,
    pub source_id: String,
}

impl EntityMention {
    pub fn id(&self) -> String {
        Entity::canonicalize(&self.name)
    }
}
