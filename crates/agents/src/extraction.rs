//! Per-chunk entity/relation extraction with gleaning

use crate::json::{array_field, number_field, parse_object, string_field};
use crate::llm::{ChatMessage, CompletionRequest, ModelPool, RequestKind};
use crate::prompts;
use crate::{AgentError, Result};
use futures::stream::{self, StreamExt};
use kgrag_core::{EntityMention, RelationMention, TextChunk};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Everything extracted from one chunk
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkExtraction {
    pub chunk_id: String,
    pub entities: Vec<EntityMention>,
    pub relations: Vec<RelationMention>,
    /// Malformed records skipped while parsing
    pub dropped: usize,
}

impl ChunkExtraction {
    fn absorb(&mut self, other: ChunkExtraction) {
        self.entities.extend(other.entities);
        self.relations.extend(other.relations);
        self.dropped += other.dropped;
    }
}

/// Result of extracting a batch of chunks
#[derive(Debug, Default)]
pub struct ExtractionOutcome {
    /// Successful chunks, sorted by chunk id
    pub extractions: Vec<ChunkExtraction>,
    /// `(chunk_id, reason)` for chunks that could not be extracted
    pub failed: Vec<(String, String)>,
}

impl ExtractionOutcome {
    pub fn entity_count(&self) -> usize {
        self.extractions.iter().map(|e| e.entities.len()).sum()
    }

    pub fn relation_count(&self) -> usize {
        self.extractions.iter().map(|e| e.relations.len()).sum()
    }
}

/// Drives extraction calls for new chunks. The first pass runs on the
/// primary model, gleaning rounds and loop checks on the cheap one.
pub struct ExtractionOrchestrator {
    primary: Arc<ModelPool>,
    cheap: Arc<ModelPool>,
    max_gleaning: usize,
    entity_types: Vec<String>,
}

impl ExtractionOrchestrator {
    pub fn new(
        primary: Arc<ModelPool>,
        cheap: Arc<ModelPool>,
        max_gleaning: usize,
        entity_types: Vec<String>,
    ) -> Self {
        Self {
            primary,
            cheap,
            max_gleaning,
            entity_types,
        }
    }

    /// Extract every chunk concurrently. A failing chunk is reported in
    /// `failed` and never aborts the batch.
    #[instrument(skip(self, chunks), fields(chunks = chunks.len()))]
    pub async fn extract_chunks(&self, chunks: &[TextChunk]) -> ExtractionOutcome {
        let results: Vec<(String, Result<ChunkExtraction>)> = stream::iter(chunks)
            .map(|chunk| async move { (chunk.id.clone(), self.extract_chunk(chunk).await) })
            .buffer_unordered(self.primary.max_async())
            .collect()
            .await;

        let mut outcome = ExtractionOutcome::default();
        for (chunk_id, result) in results {
            match result {
                Ok(extraction) => outcome.extractions.push(extraction),
                Err(e) => {
                    warn!("Skipping chunk {}: {}", chunk_id, e);
                    outcome.failed.push((chunk_id, e.to_string()));
                }
            }
        }
        outcome.extractions.sort_by(|a, b| a.chunk_id.cmp(&b.chunk_id));
        outcome.failed.sort();

        info!(
            "Extracted {} entity and {} relation mentions from {} chunks ({} failed)",
            outcome.entity_count(),
            outcome.relation_count(),
            outcome.extractions.len(),
            outcome.failed.len()
        );
        outcome
    }

    /// First pass plus up to `max_gleaning` follow-up rounds.
    pub async fn extract_chunk(&self, chunk: &TextChunk) -> Result<ChunkExtraction> {
        let prompt = prompts::entity_extraction(&chunk.content, &self.entity_types);
        let parse = |reply: &str| {
            parse_extraction(reply, &chunk.id).map(|extraction| (reply.to_string(), extraction))
        };
        let (first, mut extraction) = self
            .primary
            .complete_with(
                CompletionRequest::new(RequestKind::Extraction, prompt.clone())
                    .with_system_prompt(prompts::EXTRACTION_SYSTEM)
                    .with_json_response(),
                parse,
            )
            .await?;
        let mut history = vec![ChatMessage::user(prompt), ChatMessage::assistant(first)];

        for round in 0..self.max_gleaning {
            let (reply, more) = match self
                .cheap
                .complete_with(
                    CompletionRequest::new(RequestKind::Gleaning, prompts::GLEANING_CONTINUE)
                        .with_system_prompt(prompts::EXTRACTION_SYSTEM)
                        .with_history(history.clone())
                        .with_json_response(),
                    parse,
                )
                .await
            {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!("Gleaning round {} failed for {}: {}", round + 1, chunk.id, e);
                    break;
                }
            };
            debug!(
                "Gleaning round {} for {} added {} entities",
                round + 1,
                chunk.id,
                more.entities.len()
            );
            extraction.absorb(more);
            history.push(ChatMessage::user(prompts::GLEANING_CONTINUE));
            history.push(ChatMessage::assistant(reply));

            if round + 1 == self.max_gleaning {
                break;
            }
            let answer = self
                .cheap
                .complete(
                    CompletionRequest::new(RequestKind::GleaningCheck, prompts::GLEANING_IF_LOOP)
                        .with_history(history.clone()),
                )
                .await;
            match answer {
                Ok(answer) if wants_more(&answer) => continue,
                Ok(_) => break,
                Err(e) => {
                    warn!("Gleaning check failed for {}: {}", chunk.id, e);
                    break;
                }
            }
        }

        if extraction.dropped > 0 {
            warn!(
                "Dropped {} malformed records from {}",
                extraction.dropped, chunk.id
            );
        }
        Ok(extraction)
    }
}

fn wants_more(answer: &str) -> bool {
    answer
        .trim()
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '.')
        .eq_ignore_ascii_case("yes")
}

/// Trim, strip quotes and collapse inner whitespace of a display name.
fn clean_name(raw: &str) -> String {
    raw.trim()
        .trim_matches(|c: char| c == '"' || c == '\'')
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse one model reply. Fails only when the reply holds no JSON object at
/// all; individual malformed records are counted in `dropped`.
pub fn parse_extraction(reply: &str, chunk_id: &str) -> Result<ChunkExtraction> {
    let object = parse_object(reply).ok_or_else(|| {
        AgentError::ExtractionParse(format!(
            "no JSON object in reply for {}: {}",
            chunk_id,
            reply.chars().take(120).collect::<String>()
        ))
    })?;
    let value = Value::Object(object);
    let mut extraction = ChunkExtraction {
        chunk_id: chunk_id.to_string(),
        ..Default::default()
    };

    for item in array_field(&value, &["entities", "nodes"]).into_iter().flatten() {
        match parse_entity(item, chunk_id) {
            Some(mention) => extraction.entities.push(mention),
            None => extraction.dropped += 1,
        }
    }

    for item in array_field(&value, &["relationships", "relations", "edges"])
        .into_iter()
        .flatten()
    {
        match parse_relation(item, chunk_id) {
            Some(mention) => extraction.relations.push(mention),
            None => extraction.dropped += 1,
        }
    }

    Ok(extraction)
}

fn parse_entity(item: &Value, chunk_id: &str) -> Option<EntityMention> {
    let (name, entity_type, description) = match item {
        Value::String(name) => (name.clone(), String::new(), String::new()),
        Value::Object(_) => (
            string_field(item, &["name", "entity_name", "entity"])?,
            string_field(item, &["type", "entity_type", "label"]).unwrap_or_default(),
            string_field(item, &["description", "entity_description"]).unwrap_or_default(),
        ),
        _ => return None,
    };
    let name = clean_name(&name);
    if name.is_empty() {
        return None;
    }
    Some(EntityMention {
        name,
        entity_type: clean_name(&entity_type).to_uppercase(),
        description,
        source_id: chunk_id.to_string(),
    })
}

fn parse_relation(item: &Value, chunk_id: &str) -> Option<RelationMention> {
    let source = clean_name(&string_field(item, &["source", "src_id", "from", "entity1"])?);
    let target = clean_name(&string_field(item, &["target", "tgt_id", "to", "entity2"])?);
    if source.is_empty() || target.is_empty() {
        return None;
    }
    let weight = number_field(item, &["weight", "strength"])
        .filter(|w| w.is_finite() && *w >= 0.0)
        .unwrap_or(1.0);
    let mention = RelationMention {
        source,
        target,
        description: string_field(
            item,
            &["description", "relationship_description", "relationship_type"],
        )
        .unwrap_or_default(),
        weight,
        source_id: chunk_id.to_string(),
    };
    if mention.is_self_loop() {
        return None;
    }
    Some(mention)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{CompletionModel, RetryPolicy};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_parse_extraction_is_lenient() {
        let reply = r#"```json
{"entities": [
    {"name": "  Alice ", "type": "person", "description": "An engineer"},
    {"type": "person"},
    "Acme   Corp"
 ],
 "relationships": [
    {"source": "Alice", "target": "Acme Corp", "description": "works at", "weight": "3"},
    {"source": "Alice", "target": "alice"},
    {"source": "Alice"}
 ]}
```"#;
        let extraction = parse_extraction(reply, "chunk-1").unwrap();
        assert_eq!(extraction.entities.len(), 2);
        assert_eq!(extraction.entities[0].name, "Alice");
        assert_eq!(extraction.entities[0].entity_type, "PERSON");
        assert_eq!(extraction.entities[1].name, "Acme Corp");
        assert_eq!(extraction.relations.len(), 1);
        assert_eq!(extraction.relations[0].weight, 3.0);
        assert_eq!(extraction.dropped, 3);
    }

    #[test]
    fn test_parse_extraction_rejects_prose() {
        let err = parse_extraction("I could not find anything.", "chunk-1").unwrap_err();
        assert!(matches!(err, AgentError::ExtractionParse(_)));
    }

    #[test]
    fn test_wants_more() {
        assert!(wants_more(" YES."));
        assert!(wants_more("\"yes\""));
        assert!(!wants_more("no"));
        assert!(!wants_more("yes, maybe"));
    }

    /// Replies to the first pass and to each gleaning round with a new entity
    /// and always asks for another round.
    struct Gleaner {
        gleanings: AtomicUsize,
        checks: AtomicUsize,
    }

    #[async_trait]
    impl CompletionModel for Gleaner {
        fn name(&self) -> &str {
            "gleaner"
        }

        async fn complete(&self, request: &CompletionRequest) -> Result<String> {
            Ok(match request.kind {
                RequestKind::Extraction => {
                    r#"{"entities":[{"name":"Alice","type":"person","description":"a"}]}"#
                        .to_string()
                }
                RequestKind::Gleaning => {
                    let n = self.gleanings.fetch_add(1, Ordering::SeqCst);
                    format!(r#"{{"entities":[{{"name":"Extra {}","type":"event"}}]}}"#, n)
                }
                RequestKind::GleaningCheck => {
                    self.checks.fetch_add(1, Ordering::SeqCst);
                    "yes".to_string()
                }
                _ => String::new(),
            })
        }
    }

    #[tokio::test]
    async fn test_gleaning_is_bounded_by_max_rounds() {
        let model = Arc::new(Gleaner {
            gleanings: AtomicUsize::new(0),
            checks: AtomicUsize::new(0),
        });
        let pool = Arc::new(ModelPool::new(model.clone(), 4, RetryPolicy::none()));
        let orchestrator = ExtractionOrchestrator::new(pool.clone(), pool, 3, vec!["person".into()]);
        let chunk = TextChunk::new("Alice went somewhere.", 4, "doc-1", 0);

        let extraction = orchestrator.extract_chunk(&chunk).await.unwrap();
        assert_eq!(extraction.entities.len(), 4);
        assert_eq!(model.gleanings.load(Ordering::SeqCst), 3);
        // no check after the final round
        assert_eq!(model.checks.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_chunk_is_isolated() {
        struct Picky;

        #[async_trait]
        impl CompletionModel for Picky {
            fn name(&self) -> &str {
                "picky"
            }

            async fn complete(&self, request: &CompletionRequest) -> Result<String> {
                if request.prompt.contains("broken") {
                    Ok("not json".into())
                } else {
                    Ok(r#"{"entities":[{"name":"Bob"}],"relationships":[]}"#.into())
                }
            }
        }

        let pool = Arc::new(ModelPool::new(Arc::new(Picky), 2, RetryPolicy::none()));
        let orchestrator = ExtractionOrchestrator::new(pool.clone(), pool, 0, vec![]);
        let chunks = vec![
            TextChunk::new("Bob is fine.", 3, "doc-1", 0),
            TextChunk::new("This one is broken.", 4, "doc-1", 1),
        ];
        let outcome = orchestrator.extract_chunks(&chunks).await;
        assert_eq!(outcome.extractions.len(), 1);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].0, chunks[1].id);
    }
}
