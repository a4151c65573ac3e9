//! Storage collaborator interfaces
//!
//! Every store is namespaced, shareable behind `Arc<dyn ..>`, and exposes
//! `flush` so callers can persist after a batch.

use crate::Result;
use async_trait::async_trait;
use kgrag_core::{hierarchical_clusters, Cluster, ClusteringConfig, Community, Entity, GraphView, Relation};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Namespaced key-value store of JSON values
#[async_trait]
pub trait KvStore: Send + Sync {
    fn namespace(&self) -> &str;

    async fn get(&self, key: &str) -> Result<Option<Value>>;

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Value>>> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.get(key).await?);
        }
        Ok(out)
    }

    async fn set(&self, key: &str, value: Value) -> Result<()>;

    async fn upsert(&self, entries: Vec<(String, Value)>) -> Result<()> {
        for (key, value) in entries {
            self.set(&key, value).await?;
        }
        Ok(())
    }

    /// Keys from `keys` that are not yet stored, in input order
    async fn filter_keys(&self, keys: &[String]) -> Result<Vec<String>>;

    async fn all_keys(&self) -> Result<Vec<String>>;

    async fn remove(&self, key: &str) -> Result<()>;

    async fn drop_all(&self) -> Result<()>;

    async fn flush(&self) -> Result<()>;
}

/// Typed helpers over any [`KvStore`]
#[async_trait]
pub trait KvStoreExt: KvStore {
    async fn get_as<T: DeserializeOwned + Send>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn set_as<T: Serialize + Sync>(&self, key: &str, value: &T) -> Result<()> {
        self.set(key, serde_json::to_value(value)?).await
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.all_keys().await?.len())
    }
}

impl<S: KvStore + ?Sized> KvStoreExt for S {}

/// A vector to be indexed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VectorRecord {
    pub id: String,
    pub vector: Vec<f32>,
    #[serde(default)]
    pub payload: Value,
}

/// One similarity search hit
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VectorHit {
    pub id: String,
    pub score: f32,
    #[serde(default)]
    pub payload: Value,
}

/// Namespaced cosine-similarity vector index
#[async_trait]
pub trait VectorStore: Send + Sync {
    fn namespace(&self) -> &str;

    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<()>;

    /// Up to `top_k` hits, highest score first; ties broken by id
    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<VectorHit>>;

    async fn len(&self) -> Result<usize>;

    async fn drop_all(&self) -> Result<()>;

    async fn flush(&self) -> Result<()>;
}

/// Entity/relation graph with community state
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn upsert_node(&self, entity: Entity) -> Result<()>;

    async fn upsert_edge(&self, relation: Relation) -> Result<()>;

    async fn get_node(&self, id: &str) -> Result<Option<Entity>>;

    async fn get_nodes(&self, ids: &[String]) -> Result<Vec<Option<Entity>>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            out.push(self.get_node(id).await?);
        }
        Ok(out)
    }

    /// Edge between `a` and `b` in either order
    async fn get_edge(&self, a: &str, b: &str) -> Result<Option<Relation>>;

    /// Edges incident to `node`, sorted by endpoint pair
    async fn get_edges(&self, node: &str) -> Result<Vec<Relation>>;

    async fn node_degree(&self, node: &str) -> Result<usize> {
        Ok(self.get_edges(node).await?.len())
    }

    async fn all_nodes(&self) -> Result<Vec<Entity>>;

    async fn all_edges(&self) -> Result<Vec<Relation>>;

    /// Hierarchical community assignment over the current graph
    async fn cluster(&self, config: &ClusteringConfig) -> Result<Vec<Cluster>> {
        let nodes = self.all_nodes().await?;
        let edges = self.all_edges().await?;
        let view = GraphView::new(
            nodes.into_iter().map(|n| n.id),
            edges.into_iter().map(|e| (e.src_id, e.tgt_id, e.weight)),
        );
        Ok(hierarchical_clusters(&view, config)?)
    }

    /// Atomically swap the whole community state
    async fn replace_communities(&self, communities: Vec<Community>) -> Result<()>;

    async fn get_community(&self, id: &str) -> Result<Option<Community>>;

    /// All communities, sorted by id
    async fn communities(&self) -> Result<Vec<Community>>;

    async fn drop_all(&self) -> Result<()>;

    async fn flush(&self) -> Result<()>;
}

/// Cosine similarity; zero when either vector has no magnitude
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}
