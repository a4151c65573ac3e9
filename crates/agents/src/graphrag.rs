//! The insert/query facade over one workspace

use crate::community::{CommunityOutcome, CommunityReporter};
use crate::config::{GraphRagConfig, QueryParam};
use crate::extraction::ExtractionOrchestrator;
use crate::indexer::VectorIndexer;
use crate::llm::{CompletionModel, EmbeddingModel, EmbeddingPool, ModelPool};
use crate::merger::GraphMerger;
use crate::query::{QueryAnswer, QueryEngine};
use crate::{AgentError, Result};
use kgrag_core::{Chunker, Document, TextChunk, Tokenizer};
use kgrag_db::{Workspace, WorkspaceStats};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

/// Summary of one insertion batch
#[derive(Debug, Clone, Default, Serialize)]
pub struct InsertReport {
    pub new_documents: usize,
    pub new_chunks: usize,
    /// Chunks extracted and committed
    pub processed_chunks: usize,
    /// Chunks whose extraction failed; they are retried on the next insert
    pub failed_chunks: Vec<String>,
    pub entities: usize,
    pub relations: usize,
    pub placeholders: usize,
    /// Descriptions condensed by the summarization model
    pub summarized: usize,
    pub vectors_indexed: usize,
    pub vectors_deferred: usize,
    pub communities: usize,
    pub reports_generated: usize,
    pub reports_failed: usize,
}

impl InsertReport {
    fn record_communities(&mut self, outcome: CommunityOutcome) {
        self.communities = outcome.communities;
        self.reports_generated = outcome.generated;
        self.reports_failed = outcome.failed;
    }
}

pub struct GraphRag {
    config: GraphRagConfig,
    workspace: Workspace,
    chunker: Chunker,
    extractor: ExtractionOrchestrator,
    merger: GraphMerger,
    indexer: VectorIndexer,
    reporter: CommunityReporter,
    engine: QueryEngine,
    insert_lock: Mutex<()>,
}

impl GraphRag {
    /// Wire every component over `workspace`. `best` serves extraction,
    /// reports and answers; `cheap` serves gleaning and summaries.
    pub fn new(
        config: GraphRagConfig,
        workspace: Workspace,
        best: Arc<dyn CompletionModel>,
        cheap: Arc<dyn CompletionModel>,
        embedding: Arc<dyn EmbeddingModel>,
    ) -> Result<Self> {
        config.validate()?;
        let tokenizer = Tokenizer::shared()?;

        let mut best_pool = ModelPool::new(best, config.best_model_max_async, config.retry.clone());
        let mut cheap_pool =
            ModelPool::new(cheap, config.cheap_model_max_async, config.retry.clone());
        if config.enable_llm_cache {
            best_pool = best_pool.with_cache(workspace.llm_response_cache.clone());
            cheap_pool = cheap_pool.with_cache(workspace.llm_response_cache.clone());
        }
        let best_pool = Arc::new(best_pool);
        let cheap_pool = Arc::new(cheap_pool);
        let embedder = Arc::new(EmbeddingPool::new(
            embedding,
            config.embedding_func_max_async,
            config.embedding_batch_num,
            config.retry.clone(),
        ));

        let chunker = Chunker::new(
            tokenizer.clone(),
            config.chunk_token_size,
            config.chunk_overlap_token_size,
        )?;
        let extractor = ExtractionOrchestrator::new(
            best_pool.clone(),
            cheap_pool.clone(),
            config.entity_extract_max_gleaning,
            config.entity_types.clone(),
        );
        let merger = GraphMerger::new(
            workspace.graph.clone(),
            cheap_pool,
            tokenizer.clone(),
            config.entity_summary_to_max_tokens,
            config.best_model_max_token_size,
        );
        let mut indexer = VectorIndexer::new(
            embedder.clone(),
            tokenizer.clone(),
            workspace.graph.clone(),
            workspace.entities_vdb.clone(),
            workspace.vector_backlog.clone(),
        );
        if config.enable_naive_rag {
            indexer = indexer.with_chunks(workspace.chunks_vdb.clone());
        }
        let reporter = CommunityReporter::new(
            workspace.graph.clone(),
            workspace.community_reports.clone(),
            best_pool.clone(),
            tokenizer.clone(),
            config.clustering(),
            config.best_model_max_token_size,
        );
        let engine = QueryEngine::new(workspace.clone(), best_pool, embedder, tokenizer)
            .with_modes(config.enable_local, config.enable_naive_rag)
            .with_similarity_threshold(config.query_better_than_threshold);

        Ok(Self {
            config,
            workspace,
            chunker,
            extractor,
            merger,
            indexer,
            reporter,
            engine,
            insert_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &GraphRagConfig {
        &self.config
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub async fn stats(&self) -> Result<WorkspaceStats> {
        Ok(self.workspace.stats().await?)
    }

    /// Insert a batch of documents.
    ///
    /// Documents and chunks already stored are skipped. New chunks are
    /// extracted, merged into the graph and indexed, then communities are
    /// recomputed once for the whole batch. Only chunks that extracted
    /// successfully are committed, and a document only when all of its chunks
    /// did, so re-inserting retries exactly the failed work.
    #[instrument(skip(self, texts))]
    pub async fn insert<I, S>(&self, texts: I) -> Result<InsertReport>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let _guard = self.insert_lock.lock().await;
        let mut report = InsertReport::default();

        let mut docs: BTreeMap<String, Document> = texts
            .into_iter()
            .map(Document::new)
            .filter(|d| !d.is_empty())
            .map(|d| (d.id.clone(), d))
            .collect();
        let doc_ids: Vec<String> = docs.keys().cloned().collect();
        let new_doc_ids: BTreeSet<String> = self
            .workspace
            .full_docs
            .filter_keys(&doc_ids)
            .await?
            .into_iter()
            .collect();
        docs.retain(|id, _| new_doc_ids.contains(id));
        if docs.is_empty() {
            info!("All documents are already stored");
            return Ok(report);
        }
        report.new_documents = docs.len();
        info!("Inserting {} new documents", docs.len());

        let mut owners: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut chunks: BTreeMap<String, TextChunk> = BTreeMap::new();
        for doc in docs.values() {
            for chunk in self.chunker.chunk(doc) {
                owners
                    .entry(chunk.id.clone())
                    .or_default()
                    .insert(doc.id.clone());
                chunks.entry(chunk.id.clone()).or_insert(chunk);
            }
        }
        let chunk_ids: Vec<String> = chunks.keys().cloned().collect();
        let new_chunk_ids: BTreeSet<String> = self
            .workspace
            .text_chunks
            .filter_keys(&chunk_ids)
            .await?
            .into_iter()
            .collect();
        let new_chunks: Vec<TextChunk> = chunks
            .into_values()
            .filter(|c| new_chunk_ids.contains(&c.id))
            .collect();
        report.new_chunks = new_chunks.len();

        if new_chunks.is_empty() {
            info!("All chunks are already stored");
            self.commit(&docs, &[], &BTreeSet::new()).await?;
            self.workspace.flush_all().await?;
            return Ok(report);
        }
        info!("Extracting {} new chunks", new_chunks.len());

        let extraction = self.extractor.extract_chunks(&new_chunks).await;
        let failed_ids: BTreeSet<String> =
            extraction.failed.iter().map(|(id, _)| id.clone()).collect();
        let failed_docs: BTreeSet<String> = failed_ids
            .iter()
            .filter_map(|id| owners.get(id))
            .flatten()
            .cloned()
            .collect();
        let succeeded: Vec<TextChunk> = new_chunks
            .into_iter()
            .filter(|c| !failed_ids.contains(&c.id))
            .collect();
        report.processed_chunks = succeeded.len();
        report.failed_chunks = failed_ids.into_iter().collect();

        if !extraction.extractions.is_empty() {
            let merged = self.merger.merge(&extraction.extractions).await?;
            report.entities = merged.entities.len();
            report.relations = merged.relations.len();
            report.placeholders = merged.placeholders;
            report.summarized = merged.summarized;

            let backlog = self.indexer.retry_backlog().await?;
            let entities = self.indexer.index_entities(&merged.entities).await?;
            let chunk_vectors = self.indexer.index_chunks(&succeeded).await?;
            report.vectors_indexed = backlog.indexed + entities.indexed + chunk_vectors.indexed;
            report.vectors_deferred = entities.deferred + chunk_vectors.deferred;

            let communities = self.reporter.refresh().await?;
            report.record_communities(communities);
        }

        if !report.failed_chunks.is_empty() {
            warn!(
                "{} chunks failed extraction and were not committed",
                report.failed_chunks.len()
            );
        }
        self.commit(&docs, &succeeded, &failed_docs).await?;
        self.workspace.flush_all().await?;
        Ok(report)
    }

    async fn commit(
        &self,
        docs: &BTreeMap<String, Document>,
        chunks: &[TextChunk],
        failed_docs: &BTreeSet<String>,
    ) -> Result<()> {
        let chunk_entries = chunks
            .iter()
            .map(|c| Ok((c.id.clone(), serde_json::to_value(c)?)))
            .collect::<Result<Vec<_>>>()?;
        self.workspace.text_chunks.upsert(chunk_entries).await?;

        let doc_entries = docs
            .values()
            .filter(|d| !failed_docs.contains(&d.id))
            .map(|d| Ok((d.id.clone(), serde_json::to_value(d)?)))
            .collect::<Result<Vec<_>>>()?;
        self.workspace.full_docs.upsert(doc_entries).await?;
        Ok(())
    }

    /// Answer `query`; the response cache is flushed afterwards.
    pub async fn query(&self, query: &str, param: &QueryParam) -> Result<QueryAnswer> {
        let answer = self.engine.query(query, param).await?;
        self.workspace.llm_response_cache.flush().await?;
        Ok(answer)
    }

    /// [`GraphRag::insert`] on a private current-thread runtime. Must not be
    /// called from inside an async context.
    pub fn insert_blocking<I, S>(&self, texts: I) -> Result<InsertReport>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        block_on(self.insert(texts))?
    }

    /// [`GraphRag::query`] on a private current-thread runtime.
    pub fn query_blocking(&self, query: &str, param: &QueryParam) -> Result<QueryAnswer> {
        block_on(self.query(query, param))?
    }
}

fn block_on<F: Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| AgentError::Processing(format!("failed to start runtime: {}", e)))?;
    Ok(runtime.block_on(future))
}
