//! Core domain types for the knowledge-graph RAG engine
//!
//! This crate holds everything that does not talk to a model or a store:
//! documents and chunking, entity and relation merge rules, the graph
//! arena, hierarchical clustering, communities and context packing.

pub mod chunker;
pub mod clustering;
pub mod community;
pub mod context;
pub mod document;
pub mod entity;
pub mod error;
pub mod graph;
pub mod hashing;
pub mod merge;
pub mod relation;
pub mod tokenizer;

pub use chunker::Chunker;
pub use clustering::{hierarchical_clusters, Cluster, ClusteringConfig};
pub use community::{build_communities, Community, CommunityReport, Finding};
pub use document::{Document, TextChunk};
pub use entity::{Entity, EntityMention, UNKNOWN_ENTITY_TYPE};
pub use error::{CoreError, Result};
pub use graph::GraphView;
pub use merge::GRAPH_FIELD_SEP;
pub use relation::{Relation, RelationMention};
pub use tokenizer::Tokenizer;
