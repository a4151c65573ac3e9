//! Folds extracted mentions into the persistent graph

use crate::extraction::ChunkExtraction;
use crate::llm::{CompletionRequest, ModelPool, RequestKind};
use crate::prompts;
use crate::Result;
use futures::stream::{self, StreamExt};
use kgrag_core::merge::{
    group_entity_mentions, group_relation_mentions, merge_entity, merge_relation,
    placeholder_entity, split_descriptions,
};
use kgrag_core::{Entity, Relation, Tokenizer};
use kgrag_db::GraphStore;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Records written by one merge
#[derive(Debug, Default)]
pub struct MergeOutcome {
    /// New or updated entities, placeholders included, sorted by id
    pub entities: Vec<Entity>,
    pub relations: Vec<Relation>,
    pub placeholders: usize,
    /// Descriptions compressed by the summarization model
    pub summarized: usize,
}

pub struct GraphMerger {
    graph: Arc<dyn GraphStore>,
    cheap: Arc<ModelPool>,
    tokenizer: Tokenizer,
    summary_max_tokens: usize,
    input_max_tokens: usize,
}

impl GraphMerger {
    pub fn new(
        graph: Arc<dyn GraphStore>,
        cheap: Arc<ModelPool>,
        tokenizer: Tokenizer,
        summary_max_tokens: usize,
        input_max_tokens: usize,
    ) -> Self {
        Self {
            graph,
            cheap,
            tokenizer,
            summary_max_tokens,
            input_max_tokens,
        }
    }

    /// Merge a whole batch. Mentions are grouped per entity and per endpoint
    /// pair before anything is written, so the result does not depend on the
    /// order chunks finished extracting.
    #[instrument(skip(self, extractions), fields(chunks = extractions.len()))]
    pub async fn merge(&self, extractions: &[ChunkExtraction]) -> Result<MergeOutcome> {
        let entity_groups = group_entity_mentions(
            extractions.iter().flat_map(|e| e.entities.iter().cloned()),
        );
        let relation_groups = group_relation_mentions(
            extractions.iter().flat_map(|e| e.relations.iter().cloned()),
        );

        let ids: Vec<String> = entity_groups.keys().cloned().collect();
        let stored = self.graph.get_nodes(&ids).await?;
        let mut entities: BTreeMap<String, Entity> = BTreeMap::new();
        for ((id, mentions), existing) in entity_groups.iter().zip(stored) {
            if let Some(entity) = merge_entity(existing.as_ref(), mentions) {
                entities.insert(id.clone(), entity);
            }
        }

        let mut relations = Vec::with_capacity(relation_groups.len());
        for ((a, b), mentions) in &relation_groups {
            let existing = self.graph.get_edge(a, b).await?;
            if let Some(relation) = merge_relation(existing.as_ref(), mentions) {
                relations.push(relation);
            }
        }

        let mut summarized = 0;
        let labels: Vec<String> = entities.values().map(|e| e.name.clone()).collect();
        let condensed = self
            .condense_all(labels, entities.values().map(|e| e.description.clone()).collect())
            .await;
        for (entity, (description, was_summarized)) in entities.values_mut().zip(condensed) {
            entity.description = description;
            summarized += usize::from(was_summarized);
        }

        let labels: Vec<String> = relations
            .iter()
            .map(|r| format!("({}, {})", r.src_id, r.tgt_id))
            .collect();
        let condensed = self
            .condense_all(labels, relations.iter().map(|r| r.description.clone()).collect())
            .await;
        for (relation, (description, was_summarized)) in relations.iter_mut().zip(condensed) {
            relation.description = description;
            summarized += usize::from(was_summarized);
        }

        let mut missing: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for relation in &relations {
            for endpoint in [&relation.src_id, &relation.tgt_id] {
                if !entities.contains_key(endpoint) {
                    missing
                        .entry(endpoint.clone())
                        .or_default()
                        .extend(relation.source_ids.iter().cloned());
                }
            }
        }
        let mut placeholders = 0;
        for (id, source_ids) in missing {
            if self.graph.get_node(&id).await?.is_some() {
                continue;
            }
            let source_ids: Vec<String> = source_ids.into_iter().collect();
            debug!("Creating placeholder entity {}", id);
            entities.insert(id.clone(), placeholder_entity(&id, &source_ids));
            placeholders += 1;
        }

        for entity in entities.values() {
            self.graph.upsert_node(entity.clone()).await?;
        }
        for relation in &relations {
            self.graph.upsert_edge(relation.clone()).await?;
        }

        info!(
            "Merged {} entities ({} placeholders) and {} relations",
            entities.len(),
            placeholders,
            relations.len()
        );
        Ok(MergeOutcome {
            entities: entities.into_values().collect(),
            relations,
            placeholders,
            summarized,
        })
    }

    async fn condense_all(&self, labels: Vec<String>, descriptions: Vec<String>) -> Vec<(String, bool)> {
        stream::iter(labels.into_iter().zip(descriptions))
            .map(|(label, description)| async move { self.condense(&label, description).await })
            .buffered(self.cheap.max_async())
            .collect()
            .await
    }

    /// Summarize `description` when it is over budget. Falls back to token
    /// truncation when the model call fails.
    async fn condense(&self, label: &str, description: String) -> (String, bool) {
        if self.tokenizer.count(&description) <= self.summary_max_tokens {
            return (description, false);
        }
        let fragments = split_descriptions(&description);
        let prompt = prompts::summarize_descriptions(
            label,
            &[self.tokenizer.truncate(&fragments.join("\n"), self.input_max_tokens)],
        );
        let request = CompletionRequest::new(RequestKind::Summarize, prompt)
            .with_max_tokens(self.summary_max_tokens as u32);
        match self.cheap.complete(request).await {
            Ok(summary) if !summary.trim().is_empty() => (summary.trim().to_string(), true),
            Ok(_) => {
                warn!("Empty summary for {}, truncating", label);
                (self.tokenizer.truncate(&description, self.summary_max_tokens), false)
            }
            Err(e) => {
                warn!("Summarizing {} failed, truncating: {}", label, e);
                (self.tokenizer.truncate(&description, self.summary_max_tokens), false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{CompletionModel, RetryPolicy};
    use async_trait::async_trait;
    use kgrag_core::{EntityMention, RelationMention, UNKNOWN_ENTITY_TYPE};
    use kgrag_db::JsonGraphStore;

    struct Summarizer;

    #[async_trait]
    impl CompletionModel for Summarizer {
        fn name(&self) -> &str {
            "summarizer"
        }

        async fn complete(&self, _request: &CompletionRequest) -> Result<String> {
            Ok("A short summary.".to_string())
        }
    }

    fn merger(graph: Arc<JsonGraphStore>, summary_max_tokens: usize) -> GraphMerger {
        let pool = Arc::new(ModelPool::new(Arc::new(Summarizer), 2, RetryPolicy::none()));
        GraphMerger::new(
            graph,
            pool,
            Tokenizer::shared().unwrap(),
            summary_max_tokens,
            4096,
        )
    }

    fn extraction(chunk: &str, entities: &[(&str, &str, &str)], relations: &[(&str, &str, f64)]) -> ChunkExtraction {
        ChunkExtraction {
            chunk_id: chunk.to_string(),
            entities: entities
                .iter()
                .map(|(name, ty, desc)| EntityMention {
                    name: name.to_string(),
                    entity_type: ty.to_string(),
                    description: desc.to_string(),
                    source_id: chunk.to_string(),
                })
                .collect(),
            relations: relations
                .iter()
                .map(|(s, t, w)| RelationMention {
                    source: s.to_string(),
                    target: t.to_string(),
                    description: format!("{} and {}", s, t),
                    weight: *w,
                    source_id: chunk.to_string(),
                })
                .collect(),
            dropped: 0,
        }
    }

    #[tokio::test]
    async fn test_merge_creates_placeholders_and_accumulates_weight() {
        let graph = Arc::new(JsonGraphStore::in_memory());
        let merger = merger(graph.clone(), 500);

        let first = extraction("chunk-1", &[("Alice", "PERSON", "engineer")], &[("Alice", "Acme", 1.0)]);
        let outcome = merger.merge(&[first]).await.unwrap();
        assert_eq!(outcome.placeholders, 1);
        let acme = graph.get_node("acme").await.unwrap().unwrap();
        assert_eq!(acme.entity_type, UNKNOWN_ENTITY_TYPE);
        assert!(acme.description.is_empty());
        assert_eq!(acme.source_ids, vec!["chunk-1".to_string()]);

        let second = extraction("chunk-2", &[("ALICE", "PERSON", "manager")], &[("acme", "alice", 2.0)]);
        let outcome = merger.merge(&[second]).await.unwrap();
        assert_eq!(outcome.placeholders, 0);

        let edge = graph.get_edge("alice", "acme").await.unwrap().unwrap();
        assert_eq!(edge.weight, 3.0);
        assert_eq!(edge.source_ids, vec!["chunk-1".to_string(), "chunk-2".to_string()]);

        let alice = graph.get_node("alice").await.unwrap().unwrap();
        assert_eq!(alice.name, "Alice");
        assert_eq!(alice.description, "engineer<SEP>manager");
    }

    #[tokio::test]
    async fn test_long_descriptions_are_summarized() {
        let graph = Arc::new(JsonGraphStore::in_memory());
        let merger = merger(graph.clone(), 3);
        let batch = extraction(
            "chunk-1",
            &[
                ("Alice", "PERSON", "a very long description of an engineer"),
                ("Alice", "PERSON", "another lengthy note about the same person"),
            ],
            &[],
        );
        let outcome = merger.merge(&[batch]).await.unwrap();
        assert_eq!(outcome.summarized, 1);
        let alice = graph.get_node("alice").await.unwrap().unwrap();
        assert_eq!(alice.description, "A short summary.");
    }

    #[tokio::test]
    async fn test_merge_is_order_independent() {
        let a = extraction("chunk-a", &[("Acme", "ORGANIZATION", "maker")], &[("Bob", "Acme", 1.0)]);
        let b = extraction("chunk-b", &[("acme", "ORGANIZATION", "employer")], &[("acme", "bob", 4.0)]);

        let g1 = Arc::new(JsonGraphStore::in_memory());
        merger(g1.clone(), 500).merge(&[a.clone(), b.clone()]).await.unwrap();
        let g2 = Arc::new(JsonGraphStore::in_memory());
        merger(g2.clone(), 500).merge(&[b, a]).await.unwrap();

        assert_eq!(g1.all_nodes().await.unwrap(), g2.all_nodes().await.unwrap());
        assert_eq!(g1.all_edges().await.unwrap(), g2.all_edges().await.unwrap());
    }
}
