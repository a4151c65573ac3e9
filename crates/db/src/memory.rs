//! In-memory stores with optional JSON snapshots
//!
//! Each store loads its snapshot file from the working directory on open and
//! rewrites it on `flush`. Without a directory the stores are purely
//! in-memory.

use crate::storage::{cosine_similarity, GraphStore, KvStore, VectorHit, VectorRecord, VectorStore};
use crate::{DbError, Result};
use async_trait::async_trait;
use kgrag_core::relation::pair_key;
use kgrag_core::{Community, Entity, Relation};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, instrument};

async fn load_snapshot<T: DeserializeOwned + Default>(path: Option<&Path>) -> Result<T> {
    let Some(path) = path else {
        return Ok(T::default());
    };
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let value = serde_json::from_slice(&bytes)?;
            debug!("Loaded snapshot {}", path.display());
            Ok(value)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(source) => Err(DbError::Snapshot {
            path: path.display().to_string(),
            source,
        }),
    }
}

async fn write_snapshot<T: Serialize>(path: Option<&Path>, value: &T) -> Result<()> {
    let Some(path) = path else {
        return Ok(());
    };
    let io_err = |source| DbError::Snapshot {
        path: path.display().to_string(),
        source,
    };
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    let bytes = serde_json::to_vec_pretty(value)?;
    tokio::fs::write(path, bytes).await.map_err(io_err)?;
    debug!("Wrote snapshot {}", path.display());
    Ok(())
}

/// Key-value store persisted as `kv_store_{namespace}.json`
#[derive(Debug)]
pub struct JsonKvStore {
    namespace: String,
    path: Option<PathBuf>,
    data: RwLock<BTreeMap<String, Value>>,
}

impl JsonKvStore {
    pub fn in_memory(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            path: None,
            data: RwLock::new(BTreeMap::new()),
        }
    }

    pub async fn open(dir: impl AsRef<Path>, namespace: impl Into<String>) -> Result<Self> {
        let namespace = namespace.into();
        let path = dir.as_ref().join(format!("kv_store_{}.json", namespace));
        let data = load_snapshot(Some(&path)).await?;
        Ok(Self {
            namespace,
            path: Some(path),
            data: RwLock::new(data),
        })
    }
}

#[async_trait]
impl KvStore for JsonKvStore {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.data.read().await.get(key).cloned())
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Value>>> {
        let data = self.data.read().await;
        Ok(keys.iter().map(|k| data.get(k).cloned()).collect())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.data.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn upsert(&self, entries: Vec<(String, Value)>) -> Result<()> {
        self.data.write().await.extend(entries);
        Ok(())
    }

    async fn filter_keys(&self, keys: &[String]) -> Result<Vec<String>> {
        let data = self.data.read().await;
        Ok(keys.iter().filter(|k| !data.contains_key(*k)).cloned().collect())
    }

    async fn all_keys(&self) -> Result<Vec<String>> {
        Ok(self.data.read().await.keys().cloned().collect())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.data.write().await.remove(key);
        Ok(())
    }

    async fn drop_all(&self) -> Result<()> {
        self.data.write().await.clear();
        Ok(())
    }

    #[instrument(skip(self), fields(namespace = %self.namespace))]
    async fn flush(&self) -> Result<()> {
        let data = self.data.read().await;
        write_snapshot(self.path.as_deref(), &*data).await
    }
}

/// Brute-force cosine index persisted as `vdb_{namespace}.json`
#[derive(Debug)]
pub struct JsonVectorStore {
    namespace: String,
    path: Option<PathBuf>,
    records: RwLock<BTreeMap<String, VectorRecord>>,
}

impl JsonVectorStore {
    pub fn in_memory(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            path: None,
            records: RwLock::new(BTreeMap::new()),
        }
    }

    pub async fn open(dir: impl AsRef<Path>, namespace: impl Into<String>) -> Result<Self> {
        let namespace = namespace.into();
        let path = dir.as_ref().join(format!("vdb_{}.json", namespace));
        let records: Vec<VectorRecord> = load_snapshot(Some(&path)).await?;
        Ok(Self {
            namespace,
            path: Some(path),
            records: RwLock::new(records.into_iter().map(|r| (r.id.clone(), r)).collect()),
        })
    }
}

/// Sort hits by descending score, then id, and keep `top_k`.
pub(crate) fn rank_hits(mut hits: Vec<VectorHit>, top_k: usize) -> Vec<VectorHit> {
    hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
    hits.truncate(top_k);
    hits
}

#[async_trait]
impl VectorStore for JsonVectorStore {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<()> {
        let mut store = self.records.write().await;
        for record in records {
            store.insert(record.id.clone(), record);
        }
        Ok(())
    }

    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<VectorHit>> {
        let store = self.records.read().await;
        let hits = store
            .values()
            .map(|r| VectorHit {
                id: r.id.clone(),
                score: cosine_similarity(vector, &r.vector),
                payload: r.payload.clone(),
            })
            .collect();
        Ok(rank_hits(hits, top_k))
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.records.read().await.len())
    }

    async fn drop_all(&self) -> Result<()> {
        self.records.write().await.clear();
        Ok(())
    }

    #[instrument(skip(self), fields(namespace = %self.namespace))]
    async fn flush(&self) -> Result<()> {
        let records: Vec<VectorRecord> = self.records.read().await.values().cloned().collect();
        write_snapshot(self.path.as_deref(), &records).await
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct GraphSnapshot {
    #[serde(default)]
    nodes: Vec<Entity>,
    #[serde(default)]
    edges: Vec<Relation>,
    #[serde(default)]
    communities: Vec<Community>,
}

#[derive(Debug, Default)]
struct GraphState {
    nodes: BTreeMap<String, Entity>,
    edges: BTreeMap<(String, String), Relation>,
    communities: BTreeMap<String, Community>,
}

/// Graph store persisted as `graph_{namespace}.json`
#[derive(Debug)]
pub struct JsonGraphStore {
    path: Option<PathBuf>,
    state: RwLock<GraphState>,
}

impl JsonGraphStore {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: RwLock::new(GraphState::default()),
        }
    }

    pub async fn open(dir: impl AsRef<Path>, namespace: &str) -> Result<Self> {
        let path = dir.as_ref().join(format!("graph_{}.json", namespace));
        let snapshot: GraphSnapshot = load_snapshot(Some(&path)).await?;
        let state = GraphState {
            nodes: snapshot.nodes.into_iter().map(|n| (n.id.clone(), n)).collect(),
            edges: snapshot.edges.into_iter().map(|e| (e.key(), e)).collect(),
            communities: snapshot
                .communities
                .into_iter()
                .map(|c| (c.id.clone(), c))
                .collect(),
        };
        Ok(Self {
            path: Some(path),
            state: RwLock::new(state),
        })
    }
}

#[async_trait]
impl GraphStore for JsonGraphStore {
    async fn upsert_node(&self, entity: Entity) -> Result<()> {
        self.state.write().await.nodes.insert(entity.id.clone(), entity);
        Ok(())
    }

    async fn upsert_edge(&self, relation: Relation) -> Result<()> {
        let key = pair_key(&relation.src_id, &relation.tgt_id);
        self.state.write().await.edges.insert(key, relation);
        Ok(())
    }

    async fn get_node(&self, id: &str) -> Result<Option<Entity>> {
        Ok(self.state.read().await.nodes.get(id).cloned())
    }

    async fn get_nodes(&self, ids: &[String]) -> Result<Vec<Option<Entity>>> {
        let state = self.state.read().await;
        Ok(ids.iter().map(|id| state.nodes.get(id).cloned()).collect())
    }

    async fn get_edge(&self, a: &str, b: &str) -> Result<Option<Relation>> {
        Ok(self.state.read().await.edges.get(&pair_key(a, b)).cloned())
    }

    async fn get_edges(&self, node: &str) -> Result<Vec<Relation>> {
        let state = self.state.read().await;
        Ok(state
            .edges
            .values()
            .filter(|e| e.src_id == node || e.tgt_id == node)
            .cloned()
            .collect())
    }

    async fn all_nodes(&self) -> Result<Vec<Entity>> {
        Ok(self.state.read().await.nodes.values().cloned().collect())
    }

    async fn all_edges(&self) -> Result<Vec<Relation>> {
        Ok(self.state.read().await.edges.values().cloned().collect())
    }

    async fn replace_communities(&self, communities: Vec<Community>) -> Result<()> {
        let next = communities.into_iter().map(|c| (c.id.clone(), c)).collect();
        self.state.write().await.communities = next;
        Ok(())
    }

    async fn get_community(&self, id: &str) -> Result<Option<Community>> {
        Ok(self.state.read().await.communities.get(id).cloned())
    }

    async fn communities(&self) -> Result<Vec<Community>> {
        Ok(self.state.read().await.communities.values().cloned().collect())
    }

    async fn drop_all(&self) -> Result<()> {
        *self.state.write().await = GraphState::default();
        Ok(())
    }

    #[instrument(skip(self))]
    async fn flush(&self) -> Result<()> {
        let state = self.state.read().await;
        let snapshot = GraphSnapshot {
            nodes: state.nodes.values().cloned().collect(),
            edges: state.edges.values().cloned().collect(),
            communities: state.communities.values().cloned().collect(),
        };
        write_snapshot(self.path.as_deref(), &snapshot).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::KvStoreExt;
    use kgrag_core::ClusteringConfig;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_kv_filter_keys_and_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = JsonKvStore::open(dir.path(), "text_chunks").await.unwrap();
        store.set("a", json!({"content": "x"})).await.unwrap();

        let missing = store
            .filter_keys(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(missing, vec!["b".to_string()]);

        store.flush().await.unwrap();
        assert!(dir.path().join("kv_store_text_chunks.json").exists());

        let reopened = JsonKvStore::open(dir.path(), "text_chunks").await.unwrap();
        assert_eq!(reopened.get("a").await.unwrap(), Some(json!({"content": "x"})));
        assert_eq!(reopened.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_vector_query_orders_by_score() {
        let store = JsonVectorStore::in_memory("entities");
        store
            .upsert(vec![
                VectorRecord {
                    id: "a".into(),
                    vector: vec![1.0, 0.0],
                    payload: json!({}),
                },
                VectorRecord {
                    id: "b".into(),
                    vector: vec![0.7, 0.7],
                    payload: json!({}),
                },
                VectorRecord {
                    id: "c".into(),
                    vector: vec![0.0, 1.0],
                    payload: json!({}),
                },
            ])
            .await
            .unwrap();
        let hits = store.query(&[1.0, 0.1], 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "a");
        assert_eq!(hits[1].id, "b");
    }

    #[tokio::test]
    async fn test_graph_edges_are_unordered() {
        let dir = TempDir::new().unwrap();
        let graph = JsonGraphStore::open(dir.path(), "chunk_entity_relation").await.unwrap();
        graph.upsert_node(Entity::new("alice")).await.unwrap();
        graph.upsert_node(Entity::new("acme")).await.unwrap();
        let mut rel = Relation::new("alice", "acme");
        rel.weight = 1.0;
        graph.upsert_edge(rel).await.unwrap();

        assert!(graph.get_edge("alice", "acme").await.unwrap().is_some());
        assert!(graph.get_edge("acme", "alice").await.unwrap().is_some());
        assert_eq!(graph.node_degree("alice").await.unwrap(), 1);

        let clusters = graph.cluster(&ClusteringConfig::default()).await.unwrap();
        assert_eq!(clusters.iter().filter(|c| c.level == 0).count(), 1);

        graph.flush().await.unwrap();
        let reopened = JsonGraphStore::open(dir.path(), "chunk_entity_relation").await.unwrap();
        assert_eq!(reopened.all_nodes().await.unwrap().len(), 2);
        assert_eq!(reopened.all_edges().await.unwrap().len(), 1);
    }
}
