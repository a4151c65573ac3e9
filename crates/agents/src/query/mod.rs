//! Query engine: local, global and naive retrieval modes

mod global;
mod local;
mod naive;

use crate::config::{QueryMode, QueryParam};
use crate::llm::{EmbeddingPool, ModelPool};
use crate::prompts::FAIL_RESPONSE;
use crate::{AgentError, Result};
use kgrag_core::Tokenizer;
use kgrag_db::Workspace;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument};

/// What a query returned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerKind {
    /// Generated by the answer model
    Answer,
    /// The assembled context, returned without generation
    Context,
    /// Retrieval found nothing; `text` is the fixed fail response
    NoContext,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryAnswer {
    pub text: String,
    pub kind: AnswerKind,
}

impl QueryAnswer {
    pub fn no_context() -> Self {
        Self {
            text: FAIL_RESPONSE.to_string(),
            kind: AnswerKind::NoContext,
        }
    }

    pub fn is_no_context(&self) -> bool {
        self.kind == AnswerKind::NoContext
    }
}

pub struct QueryEngine {
    workspace: Workspace,
    best: Arc<ModelPool>,
    embedder: Arc<EmbeddingPool>,
    tokenizer: Tokenizer,
    enable_local: bool,
    enable_naive: bool,
    similarity_threshold: f32,
}

impl QueryEngine {
    pub fn new(
        workspace: Workspace,
        best: Arc<ModelPool>,
        embedder: Arc<EmbeddingPool>,
        tokenizer: Tokenizer,
    ) -> Self {
        Self {
            workspace,
            best,
            embedder,
            tokenizer,
            enable_local: true,
            enable_naive: false,
            similarity_threshold: 0.2,
        }
    }

    pub fn with_modes(mut self, enable_local: bool, enable_naive: bool) -> Self {
        self.enable_local = enable_local;
        self.enable_naive = enable_naive;
        self
    }

    pub fn with_similarity_threshold(mut self, threshold: f32) -> Self {
        self.similarity_threshold = threshold;
        self
    }

    #[instrument(skip(self, param), fields(mode = %param.mode))]
    pub async fn query(&self, query: &str, param: &QueryParam) -> Result<QueryAnswer> {
        let answer = match param.mode {
            QueryMode::Local => {
                if !self.enable_local {
                    return Err(AgentError::InvalidMode(QueryMode::Local.to_string()));
                }
                self.local_query(query, param).await?
            }
            QueryMode::Global => self.global_query(query, param).await?,
            QueryMode::Naive => {
                if !self.enable_naive {
                    return Err(AgentError::InvalidMode(QueryMode::Naive.to_string()));
                }
                self.naive_query(query, param).await?
            }
        };
        info!("Query answered ({:?}, {} chars)", answer.kind, answer.text.len());
        Ok(answer)
    }

    async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        self.embedder
            .embed(&[query.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AgentError::Embedding("no vector returned for query".into()))
    }

    /// Drop trailing parts until the joined text fits `budget`.
    fn fit_parts(&self, mut parts: Vec<String>, separator: &str, budget: usize) -> String {
        loop {
            let text = parts.join(separator);
            if parts.is_empty() || self.tokenizer.count(&text) <= budget {
                return text;
            }
            parts.pop();
        }
    }
}
