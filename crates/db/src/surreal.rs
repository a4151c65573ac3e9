//! SurrealDB-backed stores
//!
//! Records carry an explicit `key` field next to their SurrealDB id, and
//! domain values are stored as JSON strings so that reads deserialize into
//! plain structs without going through record-id types.

use crate::memory::rank_hits;
use crate::storage::{GraphStore, KvStore, VectorHit, VectorRecord, VectorStore};
use crate::{DbConnection, Result};
use async_trait::async_trait;
use kgrag_core::relation::pair_key;
use kgrag_core::{Community, Entity, Relation};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use tracing::instrument;

#[derive(Debug, Deserialize)]
struct KeyRow {
    key: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ValueRow {
    key: String,
    value: String,
}

fn decode<T: DeserializeOwned>(value: &str) -> Result<T> {
    Ok(serde_json::from_str(value)?)
}

fn edge_key(a: &str, b: &str) -> String {
    let (src, tgt) = pair_key(a, b);
    format!("{}\u{1f}{}", src, tgt)
}

/// Key-value namespace stored in table `kv_{namespace}`
#[derive(Clone)]
pub struct SurrealKvStore {
    db: DbConnection,
    namespace: String,
    table: String,
}

impl SurrealKvStore {
    pub fn new(db: DbConnection, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        let table = format!("kv_{}", namespace);
        Self { db, namespace, table }
    }
}

#[async_trait]
impl KvStore for SurrealKvStore {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    #[instrument(skip(self), fields(table = %self.table))]
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let rows: Vec<ValueRow> = self
            .db
            .query("SELECT key, value FROM type::thing($tb, $key)")
            .bind(("tb", self.table.clone()))
            .bind(("key", key.to_string()))
            .await?
            .take(0)?;
        match rows.into_iter().next() {
            Some(row) => Ok(Some(decode(&row.value)?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self, value), fields(table = %self.table))]
    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.db
            .query("UPSERT type::thing($tb, $key) SET key = $key, value = $value")
            .bind(("tb", self.table.clone()))
            .bind(("key", key.to_string()))
            .bind(("value", serde_json::to_string(&value)?))
            .await?
            .check()?;
        Ok(())
    }

    #[instrument(skip(self, keys), fields(table = %self.table, count = keys.len()))]
    async fn filter_keys(&self, keys: &[String]) -> Result<Vec<String>> {
        let rows: Vec<KeyRow> = self
            .db
            .query("SELECT key FROM type::table($tb) WHERE key IN $keys")
            .bind(("tb", self.table.clone()))
            .bind(("keys", keys.to_vec()))
            .await?
            .take(0)?;
        let present: BTreeSet<String> = rows.into_iter().map(|r| r.key).collect();
        Ok(keys.iter().filter(|k| !present.contains(*k)).cloned().collect())
    }

    async fn all_keys(&self) -> Result<Vec<String>> {
        let rows: Vec<KeyRow> = self
            .db
            .query("SELECT key FROM type::table($tb) ORDER BY key")
            .bind(("tb", self.table.clone()))
            .await?
            .take(0)?;
        Ok(rows.into_iter().map(|r| r.key).collect())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.db
            .query("DELETE type::thing($tb, $key)")
            .bind(("tb", self.table.clone()))
            .bind(("key", key.to_string()))
            .await?
            .check()?;
        Ok(())
    }

    async fn drop_all(&self) -> Result<()> {
        self.db
            .query("DELETE type::table($tb)")
            .bind(("tb", self.table.clone()))
            .await?
            .check()?;
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct HitRow {
    key: String,
    payload: String,
    score: Option<f64>,
}

/// Vector index stored in table `vdb_{namespace}`
#[derive(Clone)]
pub struct SurrealVectorStore {
    db: DbConnection,
    namespace: String,
    table: String,
}

impl SurrealVectorStore {
    pub fn new(db: DbConnection, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        let table = format!("vdb_{}", namespace);
        Self { db, namespace, table }
    }
}

#[async_trait]
impl VectorStore for SurrealVectorStore {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    #[instrument(skip(self, records), fields(table = %self.table, count = records.len()))]
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<()> {
        for record in records {
            self.db
                .query(
                    "UPSERT type::thing($tb, $key) SET key = $key, embedding = $embedding, payload = $payload",
                )
                .bind(("tb", self.table.clone()))
                .bind(("key", record.id))
                .bind(("embedding", record.vector))
                .bind(("payload", serde_json::to_string(&record.payload)?))
                .await?
                .check()?;
        }
        Ok(())
    }

    #[instrument(skip(self, vector), fields(table = %self.table))]
    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<VectorHit>> {
        let rows: Vec<HitRow> = self
            .db
            .query(
                r#"
                SELECT
                    key,
                    payload,
                    vector::similarity::cosine(embedding, $embedding) AS score
                FROM type::table($tb)
                ORDER BY score DESC
                LIMIT $limit
            "#,
            )
            .bind(("tb", self.table.clone()))
            .bind(("embedding", vector.to_vec()))
            .bind(("limit", top_k))
            .await?
            .take(0)?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in rows {
            hits.push(VectorHit {
                id: row.key,
                score: row.score.unwrap_or(0.0) as f32,
                payload: serde_json::from_str(&row.payload)?,
            });
        }
        Ok(rank_hits(hits, top_k))
    }

    async fn len(&self) -> Result<usize> {
        let rows: Vec<KeyRow> = self
            .db
            .query("SELECT key FROM type::table($tb)")
            .bind(("tb", self.table.clone()))
            .await?
            .take(0)?;
        Ok(rows.len())
    }

    async fn drop_all(&self) -> Result<()> {
        self.db
            .query("DELETE type::table($tb)")
            .bind(("tb", self.table.clone()))
            .await?
            .check()?;
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct CommunityRow {
    key: String,
    level: usize,
    value: String,
}

/// Graph store over the `graph_node`, `graph_edge` and `community` tables
#[derive(Clone)]
pub struct SurrealGraphStore {
    db: DbConnection,
}

impl SurrealGraphStore {
    pub fn new(db: DbConnection) -> Self {
        Self { db }
    }

    async fn values(&self, query: &'static str) -> Result<Vec<String>> {
        let rows: Vec<ValueRow> = self.db.query(query).await?.take(0)?;
        Ok(rows.into_iter().map(|r| r.value).collect())
    }
}

#[async_trait]
impl GraphStore for SurrealGraphStore {
    #[instrument(skip(self, entity), fields(id = %entity.id))]
    async fn upsert_node(&self, entity: Entity) -> Result<()> {
        self.db
            .query("UPSERT type::thing('graph_node', $key) SET key = $key, value = $value")
            .bind(("key", entity.id.clone()))
            .bind(("value", serde_json::to_string(&entity)?))
            .await?
            .check()?;
        Ok(())
    }

    #[instrument(skip(self, relation), fields(src = %relation.src_id, tgt = %relation.tgt_id))]
    async fn upsert_edge(&self, relation: Relation) -> Result<()> {
        let (src, tgt) = pair_key(&relation.src_id, &relation.tgt_id);
        self.db
            .query(
                "UPSERT type::thing('graph_edge', $key) SET key = $key, src = $src, tgt = $tgt, value = $value",
            )
            .bind(("key", edge_key(&src, &tgt)))
            .bind(("src", src))
            .bind(("tgt", tgt))
            .bind(("value", serde_json::to_string(&relation)?))
            .await?
            .check()?;
        Ok(())
    }

    async fn get_node(&self, id: &str) -> Result<Option<Entity>> {
        let rows: Vec<ValueRow> = self
            .db
            .query("SELECT key, value FROM type::thing($tb, $key)")
            .bind(("tb", "graph_node"))
            .bind(("key", id.to_string()))
            .await?
            .take(0)?;
        match rows.into_iter().next() {
            Some(row) => Ok(Some(decode(&row.value)?)),
            None => Ok(None),
        }
    }

    async fn get_edge(&self, a: &str, b: &str) -> Result<Option<Relation>> {
        let rows: Vec<ValueRow> = self
            .db
            .query("SELECT key, value FROM type::thing($tb, $key)")
            .bind(("tb", "graph_edge"))
            .bind(("key", edge_key(a, b)))
            .await?
            .take(0)?;
        match rows.into_iter().next() {
            Some(row) => Ok(Some(decode(&row.value)?)),
            None => Ok(None),
        }
    }

    async fn get_edges(&self, node: &str) -> Result<Vec<Relation>> {
        let rows: Vec<ValueRow> = self
            .db
            .query("SELECT key, value FROM graph_edge WHERE src = $node OR tgt = $node ORDER BY key")
            .bind(("node", node.to_string()))
            .await?
            .take(0)?;
        rows.iter().map(|r| decode(&r.value)).collect()
    }

    async fn all_nodes(&self) -> Result<Vec<Entity>> {
        self.values("SELECT key, value FROM graph_node ORDER BY key")
            .await?
            .iter()
            .map(|v| decode(v))
            .collect()
    }

    async fn all_edges(&self) -> Result<Vec<Relation>> {
        self.values("SELECT key, value FROM graph_edge ORDER BY key")
            .await?
            .iter()
            .map(|v| decode(v))
            .collect()
    }

    #[instrument(skip(self, communities), fields(count = communities.len()))]
    async fn replace_communities(&self, communities: Vec<Community>) -> Result<()> {
        let mut rows = Vec::with_capacity(communities.len());
        for community in &communities {
            rows.push(CommunityRow {
                key: community.id.clone(),
                level: community.level,
                value: serde_json::to_string(community)?,
            });
        }
        let query = if rows.is_empty() {
            "BEGIN TRANSACTION; DELETE community; COMMIT TRANSACTION;"
        } else {
            "BEGIN TRANSACTION; DELETE community; INSERT INTO community $rows; COMMIT TRANSACTION;"
        };
        self.db.query(query).bind(("rows", rows)).await?.check()?;
        Ok(())
    }

    async fn get_community(&self, id: &str) -> Result<Option<Community>> {
        let rows: Vec<ValueRow> = self
            .db
            .query("SELECT key, value FROM community WHERE key = $key")
            .bind(("key", id.to_string()))
            .await?
            .take(0)?;
        match rows.into_iter().next() {
            Some(row) => Ok(Some(decode(&row.value)?)),
            None => Ok(None),
        }
    }

    async fn communities(&self) -> Result<Vec<Community>> {
        self.values("SELECT key, value FROM community ORDER BY key")
            .await?
            .iter()
            .map(|v| decode(v))
            .collect()
    }

    async fn drop_all(&self) -> Result<()> {
        self.db
            .query("DELETE graph_node; DELETE graph_edge; DELETE community;")
            .await?
            .check()?;
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init_memory;
    use kgrag_core::community::CommunityReport;
    use serde_json::json;

    #[tokio::test]
    async fn test_kv_roundtrip_and_filter() {
        let db = init_memory().await.unwrap();
        let store = SurrealKvStore::new(db, "full_docs");

        store.set("doc-1", json!({"content": "hello"})).await.unwrap();
        assert_eq!(
            store.get("doc-1").await.unwrap(),
            Some(json!({"content": "hello"}))
        );
        assert_eq!(store.get("doc-2").await.unwrap(), None);

        let missing = store
            .filter_keys(&["doc-1".to_string(), "doc-2".to_string()])
            .await
            .unwrap();
        assert_eq!(missing, vec!["doc-2".to_string()]);

        store.drop_all().await.unwrap();
        assert!(store.all_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_vector_search() {
        let db = init_memory().await.unwrap();
        let store = SurrealVectorStore::new(db, "entities");
        store
            .upsert(vec![
                VectorRecord {
                    id: "near".into(),
                    vector: vec![1.0, 0.0, 0.0],
                    payload: json!({"entity_name": "near"}),
                },
                VectorRecord {
                    id: "far".into(),
                    vector: vec![0.0, 0.0, 1.0],
                    payload: json!({"entity_name": "far"}),
                },
            ])
            .await
            .unwrap();

        let hits = store.query(&[0.9, 0.1, 0.0], 1).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "near");
        assert_eq!(store.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_graph_and_community_swap() {
        let db = init_memory().await.unwrap();
        let graph = SurrealGraphStore::new(db);

        graph.upsert_node(Entity::new("Alice")).await.unwrap();
        graph.upsert_node(Entity::new("Acme Corp")).await.unwrap();
        let mut rel = Relation::new("alice", "acme corp");
        rel.weight = 2.0;
        graph.upsert_edge(rel).await.unwrap();

        assert_eq!(graph.get_node("alice").await.unwrap().unwrap().name, "Alice");
        assert_eq!(graph.get_edges("acme corp").await.unwrap().len(), 1);
        assert!(graph.get_edge("acme corp", "alice").await.unwrap().is_some());
        assert!(graph.get_node("bob").await.unwrap().is_none());
        assert!(graph.get_edge("alice", "bob").await.unwrap().is_none());

        let mut community = Community {
            id: "0-0".into(),
            level: 0,
            title: "Cluster 0-0".into(),
            nodes: vec!["acme corp".into(), "alice".into()],
            edges: vec![],
            chunk_ids: vec![],
            occurrence: 1.0,
            rank: 1.0,
            sub_communities: vec![],
            report_key: "k".into(),
            report: None,
            report_string: String::new(),
        };
        community.attach_report(CommunityReport {
            title: "Acme".into(),
            ..Default::default()
        });
        graph.replace_communities(vec![community]).await.unwrap();
        assert_eq!(graph.communities().await.unwrap().len(), 1);
        assert_eq!(
            graph.get_community("0-0").await.unwrap().unwrap().report.unwrap().title,
            "Acme"
        );

        assert!(graph.get_community("0-1").await.unwrap().is_none());

        graph.replace_communities(Vec::new()).await.unwrap();
        assert!(graph.communities().await.unwrap().is_empty());
    }
}
