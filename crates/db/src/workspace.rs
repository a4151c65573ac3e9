//! All stores of one working directory, opened together

use crate::memory::{JsonGraphStore, JsonKvStore, JsonVectorStore};
use crate::storage::{GraphStore, KvStore, VectorStore};
use crate::surreal::{SurrealGraphStore, SurrealKvStore, SurrealVectorStore};
use crate::{DbConnection, Result};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, instrument};

pub const FULL_DOCS: &str = "full_docs";
pub const TEXT_CHUNKS: &str = "text_chunks";
pub const LLM_RESPONSE_CACHE: &str = "llm_response_cache";
pub const COMMUNITY_REPORTS: &str = "community_reports";
pub const VECTOR_BACKLOG: &str = "vector_backlog";
pub const ENTITIES_VDB: &str = "entities";
pub const CHUNKS_VDB: &str = "chunks";
pub const GRAPH: &str = "chunk_entity_relation";

/// Storage handles shared by every pipeline component
#[derive(Clone)]
pub struct Workspace {
    pub full_docs: Arc<dyn KvStore>,
    pub text_chunks: Arc<dyn KvStore>,
    pub llm_response_cache: Arc<dyn KvStore>,
    pub community_reports: Arc<dyn KvStore>,
    pub vector_backlog: Arc<dyn KvStore>,
    pub graph: Arc<dyn GraphStore>,
    pub entities_vdb: Arc<dyn VectorStore>,
    pub chunks_vdb: Arc<dyn VectorStore>,
}

/// Record counts across a workspace
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkspaceStats {
    pub documents: usize,
    pub chunks: usize,
    pub entities: usize,
    pub relations: usize,
    pub communities: usize,
    pub entity_vectors: usize,
    pub chunk_vectors: usize,
    pub cached_responses: usize,
    pub vector_backlog: usize,
}

impl Workspace {
    /// Purely in-memory stores; nothing is written on flush.
    pub fn open_memory() -> Self {
        Self {
            full_docs: Arc::new(JsonKvStore::in_memory(FULL_DOCS)),
            text_chunks: Arc::new(JsonKvStore::in_memory(TEXT_CHUNKS)),
            llm_response_cache: Arc::new(JsonKvStore::in_memory(LLM_RESPONSE_CACHE)),
            community_reports: Arc::new(JsonKvStore::in_memory(COMMUNITY_REPORTS)),
            vector_backlog: Arc::new(JsonKvStore::in_memory(VECTOR_BACKLOG)),
            graph: Arc::new(JsonGraphStore::in_memory()),
            entities_vdb: Arc::new(JsonVectorStore::in_memory(ENTITIES_VDB)),
            chunks_vdb: Arc::new(JsonVectorStore::in_memory(CHUNKS_VDB)),
        }
    }

    /// JSON snapshot stores under `dir`, loading whatever is already there.
    #[instrument(skip(dir), fields(dir = %dir.as_ref().display()))]
    pub async fn open_json(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        info!("Opening JSON workspace");
        Ok(Self {
            full_docs: Arc::new(JsonKvStore::open(dir, FULL_DOCS).await?),
            text_chunks: Arc::new(JsonKvStore::open(dir, TEXT_CHUNKS).await?),
            llm_response_cache: Arc::new(JsonKvStore::open(dir, LLM_RESPONSE_CACHE).await?),
            community_reports: Arc::new(JsonKvStore::open(dir, COMMUNITY_REPORTS).await?),
            vector_backlog: Arc::new(JsonKvStore::open(dir, VECTOR_BACKLOG).await?),
            graph: Arc::new(JsonGraphStore::open(dir, GRAPH).await?),
            entities_vdb: Arc::new(JsonVectorStore::open(dir, ENTITIES_VDB).await?),
            chunks_vdb: Arc::new(JsonVectorStore::open(dir, CHUNKS_VDB).await?),
        })
    }

    /// SurrealDB stores on an initialized connection
    pub fn open_surreal(db: DbConnection) -> Self {
        Self {
            full_docs: Arc::new(SurrealKvStore::new(db.clone(), FULL_DOCS)),
            text_chunks: Arc::new(SurrealKvStore::new(db.clone(), TEXT_CHUNKS)),
            llm_response_cache: Arc::new(SurrealKvStore::new(db.clone(), LLM_RESPONSE_CACHE)),
            community_reports: Arc::new(SurrealKvStore::new(db.clone(), COMMUNITY_REPORTS)),
            vector_backlog: Arc::new(SurrealKvStore::new(db.clone(), VECTOR_BACKLOG)),
            graph: Arc::new(SurrealGraphStore::new(db.clone())),
            entities_vdb: Arc::new(SurrealVectorStore::new(db.clone(), ENTITIES_VDB)),
            chunks_vdb: Arc::new(SurrealVectorStore::new(db, CHUNKS_VDB)),
        }
    }

    fn kv_stores(&self) -> [&Arc<dyn KvStore>; 5] {
        [
            &self.full_docs,
            &self.text_chunks,
            &self.llm_response_cache,
            &self.community_reports,
            &self.vector_backlog,
        ]
    }

    /// Persist every store.
    #[instrument(skip(self))]
    pub async fn flush_all(&self) -> Result<()> {
        for kv in self.kv_stores() {
            kv.flush().await?;
        }
        self.graph.flush().await?;
        self.entities_vdb.flush().await?;
        self.chunks_vdb.flush().await?;
        Ok(())
    }

    /// Remove every record from every store and persist the empty state.
    #[instrument(skip(self))]
    pub async fn drop_all(&self) -> Result<()> {
        for kv in self.kv_stores() {
            kv.drop_all().await?;
        }
        self.graph.drop_all().await?;
        self.entities_vdb.drop_all().await?;
        self.chunks_vdb.drop_all().await?;
        self.flush_all().await
    }

    pub async fn stats(&self) -> Result<WorkspaceStats> {
        Ok(WorkspaceStats {
            documents: self.full_docs.all_keys().await?.len(),
            chunks: self.text_chunks.all_keys().await?.len(),
            entities: self.graph.all_nodes().await?.len(),
            relations: self.graph.all_edges().await?.len(),
            communities: self.graph.communities().await?.len(),
            entity_vectors: self.entities_vdb.len().await?,
            chunk_vectors: self.chunks_vdb.len().await?,
            cached_responses: self.llm_response_cache.all_keys().await?.len(),
            vector_backlog: self.vector_backlog.all_keys().await?.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init_memory;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_json_workspace_persists_across_open() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::open_json(dir.path()).await.unwrap();
        ws.full_docs.set("doc-1", json!({"content": "x"})).await.unwrap();
        ws.flush_all().await.unwrap();

        let reopened = Workspace::open_json(dir.path()).await.unwrap();
        let stats = reopened.stats().await.unwrap();
        assert_eq!(stats.documents, 1);
        assert_eq!(stats.chunks, 0);

        reopened.drop_all().await.unwrap();
        let again = Workspace::open_json(dir.path()).await.unwrap();
        assert_eq!(again.stats().await.unwrap().documents, 0);
    }

    #[tokio::test]
    async fn test_surreal_workspace_stats() {
        let db = init_memory().await.unwrap();
        let ws = Workspace::open_surreal(db);
        ws.text_chunks.set("chunk-1", json!({"content": "y"})).await.unwrap();
        let stats = ws.stats().await.unwrap();
        assert_eq!(stats.chunks, 1);
        assert_eq!(stats.entities, 0);
    }
}
