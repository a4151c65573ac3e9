use super::{AnswerKind, QueryAnswer, QueryEngine};
use crate::config::QueryParam;
use crate::llm::{CompletionRequest, RequestKind};
use crate::prompts;
use crate::Result;
use kgrag_core::context::truncate_by_tokens;
use serde_json::Value;
use tracing::debug;

const CHUNK_SEPARATOR: &str = "--New Chunk--\n";

impl QueryEngine {
    pub(crate) async fn naive_query(&self, query: &str, param: &QueryParam) -> Result<QueryAnswer> {
        let Some(context) = self.naive_context(query, param).await? else {
            return Ok(QueryAnswer::no_context());
        };
        if param.only_need_context {
            return Ok(QueryAnswer {
                text: context,
                kind: AnswerKind::Context,
            });
        }
        let text = self
            .best
            .complete(
                CompletionRequest::new(RequestKind::Answer, query)
                    .with_system_prompt(prompts::naive_rag_system(&context, &param.response_type)),
            )
            .await?;
        Ok(QueryAnswer {
            text,
            kind: AnswerKind::Answer,
        })
    }

    /// Most similar chunks above the similarity threshold, best first.
    pub async fn naive_context(&self, query: &str, param: &QueryParam) -> Result<Option<String>> {
        let vector = self.embed_query(query).await?;
        let hits = self.workspace.chunks_vdb.query(&vector, param.top_k).await?;
        let hits: Vec<_> = hits
            .into_iter()
            .filter(|hit| hit.score >= self.similarity_threshold)
            .collect();
        let ids: Vec<String> = hits.iter().map(|hit| hit.id.clone()).collect();
        let stored = self.workspace.text_chunks.get_many(&ids).await?;
        let mut chunks = Vec::new();
        for (hit, stored) in hits.iter().zip(stored) {
            let content = stored
                .as_ref()
                .and_then(|v| v.get("content"))
                .or_else(|| hit.payload.get("content"))
                .and_then(Value::as_str)
                .map(str::to_string);
            if let Some(content) = content {
                chunks.push(content);
            }
        }
        debug!("Naive retrieval kept {} chunks", chunks.len());
        if chunks.is_empty() {
            return Ok(None);
        }

        let budget = param.naive_max_token_for_text_unit.min(param.max_context_tokens);
        let chunks = truncate_by_tokens(&self.tokenizer, chunks, budget, |c| {
            format!("{}{}", CHUNK_SEPARATOR, c)
        });
        let text = self.fit_parts(chunks, CHUNK_SEPARATOR, budget);
        if text.is_empty() {
            return Ok(None);
        }
        Ok(Some(text))
    }
}
