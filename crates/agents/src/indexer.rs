//! Keeps the entity and chunk vector indices in step with the graph
//!
//! Embedding failures never fail an insert: the affected ids are parked in
//! the backlog store and retried at the start of the next indexing pass.
//! Storage failures still propagate.

use crate::llm::EmbeddingPool;
use crate::Result;
use futures::stream::{self, StreamExt};
use kgrag_core::hashing::{compute_id, ENTITY_PREFIX};
use kgrag_core::{Entity, TextChunk, Tokenizer};
use kgrag_db::{GraphStore, KvStore, VectorRecord, VectorStore};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

const KIND_ENTITY: &str = "entity";
const KIND_CHUNK: &str = "chunk";

/// Counts from one indexing call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexOutcome {
    pub indexed: usize,
    /// Parked in the backlog after the embedding call failed
    pub deferred: usize,
}

impl IndexOutcome {
    fn add(&mut self, other: IndexOutcome) {
        self.indexed += other.indexed;
        self.deferred += other.deferred;
    }
}

/// Vector id of an entity record
pub fn entity_vector_id(entity_id: &str) -> String {
    compute_id(ENTITY_PREFIX, entity_id)
}

struct Pending {
    id: String,
    text: String,
    payload: Value,
    backlog: Value,
}

impl Pending {
    fn entity(entity: &Entity) -> Self {
        Self {
            id: entity_vector_id(&entity.id),
            text: entity.embedding_text(),
            payload: json!({ "entity_name": entity.id }),
            backlog: json!({ "kind": KIND_ENTITY, "target": entity.id }),
        }
    }

    fn chunk(id: &str, content: &str, full_doc_id: &str) -> Self {
        Self {
            id: id.to_string(),
            text: content.to_string(),
            payload: json!({ "content": content, "full_doc_id": full_doc_id }),
            backlog: json!({
                "kind": KIND_CHUNK,
                "target": id,
                "content": content,
                "full_doc_id": full_doc_id,
            }),
        }
    }
}

pub struct VectorIndexer {
    embedder: Arc<EmbeddingPool>,
    tokenizer: Tokenizer,
    graph: Arc<dyn GraphStore>,
    entities_vdb: Arc<dyn VectorStore>,
    chunks_vdb: Option<Arc<dyn VectorStore>>,
    backlog: Arc<dyn KvStore>,
}

impl VectorIndexer {
    pub fn new(
        embedder: Arc<EmbeddingPool>,
        tokenizer: Tokenizer,
        graph: Arc<dyn GraphStore>,
        entities_vdb: Arc<dyn VectorStore>,
        backlog: Arc<dyn KvStore>,
    ) -> Self {
        Self {
            embedder,
            tokenizer,
            graph,
            entities_vdb,
            chunks_vdb: None,
            backlog,
        }
    }

    /// Also maintain a chunk index for naive retrieval.
    pub fn with_chunks(mut self, chunks_vdb: Arc<dyn VectorStore>) -> Self {
        self.chunks_vdb = Some(chunks_vdb);
        self
    }

    #[instrument(skip(self, entities), fields(entities = entities.len()))]
    pub async fn index_entities(&self, entities: &[Entity]) -> Result<IndexOutcome> {
        let pending = entities.iter().map(Pending::entity).collect();
        let outcome = self.index(&self.entities_vdb, pending).await?;
        info!(
            "Indexed {} entity vectors ({} deferred)",
            outcome.indexed, outcome.deferred
        );
        Ok(outcome)
    }

    #[instrument(skip(self, chunks), fields(chunks = chunks.len()))]
    pub async fn index_chunks(&self, chunks: &[TextChunk]) -> Result<IndexOutcome> {
        let Some(store) = &self.chunks_vdb else {
            return Ok(IndexOutcome::default());
        };
        let pending = chunks
            .iter()
            .map(|c| Pending::chunk(&c.id, &c.content, &c.full_doc_id))
            .collect();
        let outcome = self.index(store, pending).await?;
        info!(
            "Indexed {} chunk vectors ({} deferred)",
            outcome.indexed, outcome.deferred
        );
        Ok(outcome)
    }

    /// Re-attempt every parked id. Entities are re-read from the graph so the
    /// latest description is embedded; ids that no longer exist are dropped.
    #[instrument(skip(self))]
    pub async fn retry_backlog(&self) -> Result<IndexOutcome> {
        let keys = self.backlog.all_keys().await?;
        if keys.is_empty() {
            return Ok(IndexOutcome::default());
        }
        info!("Retrying {} backlogged vectors", keys.len());

        let mut entities = Vec::new();
        let mut chunks = Vec::new();
        for key in &keys {
            let Some(entry) = self.backlog.get(key).await? else {
                continue;
            };
            let target = entry.get("target").and_then(Value::as_str).unwrap_or_default();
            match entry.get("kind").and_then(Value::as_str) {
                Some(KIND_ENTITY) => match self.graph.get_node(target).await? {
                    Some(entity) => entities.push(Pending::entity(&entity)),
                    None => self.backlog.remove(key).await?,
                },
                Some(KIND_CHUNK) if self.chunks_vdb.is_some() => {
                    let content = entry.get("content").and_then(Value::as_str).unwrap_or_default();
                    let doc = entry
                        .get("full_doc_id")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    chunks.push(Pending::chunk(target, content, doc));
                }
                _ => {
                    debug!("Discarding backlog entry {}", key);
                    self.backlog.remove(key).await?;
                }
            }
        }

        let mut outcome = self.index(&self.entities_vdb, entities).await?;
        if let Some(store) = &self.chunks_vdb {
            outcome.add(self.index(store, chunks).await?);
        }
        Ok(outcome)
    }

    async fn index(&self, store: &Arc<dyn VectorStore>, items: Vec<Pending>) -> Result<IndexOutcome> {
        let mut outcome = IndexOutcome::default();
        if items.is_empty() {
            return Ok(outcome);
        }
        let parked: BTreeSet<String> = self.backlog.all_keys().await?.into_iter().collect();
        let max_tokens = self.embedder.max_token_size();

        let mut batches: Vec<Vec<Pending>> = Vec::new();
        let mut items = items.into_iter().peekable();
        while items.peek().is_some() {
            batches.push(items.by_ref().take(self.embedder.batch_size()).collect());
        }

        let results: Vec<(Vec<Pending>, Result<Vec<Vec<f32>>>)> = stream::iter(batches)
            .map(|batch| async move {
                let texts: Vec<String> = batch
                    .iter()
                    .map(|p| self.tokenizer.truncate(&p.text, max_tokens))
                    .collect();
                let vectors = self.embedder.embed_batch(&texts).await;
                (batch, vectors)
            })
            .buffer_unordered(self.embedder.max_async())
            .collect()
            .await;

        for (batch, vectors) in results {
            match vectors {
                Ok(vectors) => {
                    let records: Vec<VectorRecord> = batch
                        .iter()
                        .zip(vectors)
                        .map(|(p, vector)| VectorRecord {
                            id: p.id.clone(),
                            vector,
                            payload: p.payload.clone(),
                        })
                        .collect();
                    outcome.indexed += records.len();
                    store.upsert(records).await?;
                    for p in &batch {
                        if parked.contains(&p.id) {
                            self.backlog.remove(&p.id).await?;
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        "Embedding {} {} vectors failed, deferring: {}",
                        batch.len(),
                        store.namespace(),
                        e
                    );
                    outcome.deferred += batch.len();
                    self.backlog
                        .upsert(batch.into_iter().map(|p| (p.id, p.backlog)).collect())
                        .await?;
                }
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{EmbeddingModel, RetryPolicy};
    use crate::AgentError;
    use async_trait::async_trait;
    use kgrag_db::{JsonGraphStore, JsonKvStore, JsonVectorStore};
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Switchable {
        down: AtomicBool,
    }

    #[async_trait]
    impl EmbeddingModel for Switchable {
        fn dimension(&self) -> usize {
            2
        }

        fn max_token_size(&self) -> usize {
            512
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            if self.down.load(Ordering::SeqCst) {
                return Err(AgentError::Embedding("service unavailable".into()));
            }
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }
    }

    #[tokio::test]
    async fn test_failed_embeddings_are_backlogged_and_retried() {
        let model = Arc::new(Switchable {
            down: AtomicBool::new(true),
        });
        let pool = Arc::new(EmbeddingPool::new(model.clone(), 2, 8, RetryPolicy::none()));
        let graph = Arc::new(JsonGraphStore::in_memory());
        let vdb = Arc::new(JsonVectorStore::in_memory("entities"));
        let backlog = Arc::new(JsonKvStore::in_memory("vector_backlog"));
        let indexer = VectorIndexer::new(
            pool,
            Tokenizer::shared().unwrap(),
            graph.clone(),
            vdb.clone(),
            backlog.clone(),
        );

        let mut alice = Entity::new("Alice");
        alice.description = "engineer".into();
        graph.upsert_node(alice.clone()).await.unwrap();

        let outcome = indexer.index_entities(&[alice]).await.unwrap();
        assert_eq!(outcome, IndexOutcome { indexed: 0, deferred: 1 });
        assert_eq!(backlog.all_keys().await.unwrap().len(), 1);
        assert_eq!(vdb.len().await.unwrap(), 0);

        model.down.store(false, Ordering::SeqCst);
        let outcome = indexer.retry_backlog().await.unwrap();
        assert_eq!(outcome.indexed, 1);
        assert!(backlog.all_keys().await.unwrap().is_empty());

        let hits = vdb.query(&[8.0, 1.0], 1).await.unwrap();
        assert_eq!(hits[0].id, entity_vector_id("alice"));
        assert_eq!(hits[0].payload["entity_name"], "alice");
    }

    #[tokio::test]
    async fn test_chunks_skipped_without_chunk_index() {
        let model = Arc::new(Switchable {
            down: AtomicBool::new(false),
        });
        let pool = Arc::new(EmbeddingPool::new(model, 1, 8, RetryPolicy::none()));
        let indexer = VectorIndexer::new(
            pool,
            Tokenizer::shared().unwrap(),
            Arc::new(JsonGraphStore::in_memory()),
            Arc::new(JsonVectorStore::in_memory("entities")),
            Arc::new(JsonKvStore::in_memory("vector_backlog")),
        );
        let chunk = TextChunk::new("text", 1, "doc-1", 0);
        assert_eq!(indexer.index_chunks(&[chunk]).await.unwrap(), IndexOutcome::default());
    }
}
