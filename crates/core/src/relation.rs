//! Relations - undirected weighted edges between entities

use crate::entity::Entity;
use serde::{Deserialize, Serialize};

/// A merged relation between two entities. Endpoints are stored in sorted
/// order so that `(a, b)` and `(b, a)` are the same relation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Relation {
    pub src_id: String,
    pub tgt_id: String,

    /// Merged (possibly summarized) description
    #[serde(default)]
    pub description: String,

    /// Accumulated mention weight
    #[serde(default)]
    pub weight: f64,

    /// Provenance chunk ids, sorted and unique
    #[serde(default)]
    pub source_ids: Vec<String>,
}

impl Relation {
    /// Create an empty relation; endpoint order is normalized.
    pub fn new(a: impl Into<String>, b: impl Into<String>) -> Self {
        let (src_id, tgt_id) = pair_key(&a.into(), &b.into());
        Self {
            src_id,
            tgt_id,
            description: String::new(),
            weight: 0.0,
            source_ids: Vec::new(),
        }
    }

    pub fn key(&self) -> (String, String) {
        (self.src_id.clone(), self.tgt_id.clone())
    }

    /// The endpoint that is not `node`
    pub fn other(&self, node: &str) -> &str {
        if self.src_id == node {
            &self.tgt_id
        } else {
            &self.src_id
        }
    }
}

/// Sorted endpoint pair
pub fn pair_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// One relation as extracted from one chunk
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelationMention {
    pub source: String,
    pub target: String,
    pub description: String,
    pub weight: f64,
    pub source_id: String,
}

impl RelationMention {
    /// Canonical endpoint ids in sorted order
    pub fn key(&self) -> (String, String) {
        pair_key(
            &Entity::canonicalize(&self.source),
            &Entity::canonicalize(&self.target),
        )
    }

    pub fn is_self_loop(&self) -> bool {
        let (a, b) = self.key();
        a == b
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relation_endpoints_are_sorted() {
        let r = Relation::new("bob", "acme corp");
        assert_eq!(r.src_id, "acme corp");
        assert_eq!(r.tgt_id, "bob");
        assert_eq!(r.other("bob"), "acme corp");
    }

    #[test]
    fn test_mention_key_is_canonical() {
        let m = RelationMention {
            source: "Bob".into(),
            target: " ACME  Corp ".into(),
            description: "works at".into(),
            weight: 1.0,
            source_id: "chunk-1".into(),
        };
        assert_eq!(m.key(), ("acme corp".to_string(), "bob".to_string()));
        assert!(!m.is_self_loop());
    }
}
