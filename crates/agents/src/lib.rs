//! Incremental GraphRAG pipeline
//!
//! Documents are chunked, mined for entities and relations by a language
//! model, merged into a knowledge graph, embedded, and clustered into
//! communities with generated reports. [`GraphRag`] ties the stages together
//! and answers questions in local, global or naive mode.

pub mod community;
pub mod config;
pub mod error;
pub mod extraction;
pub mod graphrag;
pub mod indexer;
pub mod inference;
pub mod json;
pub mod llm;
pub mod merger;
pub mod prompts;
pub mod query;

pub use community::{CommunityOutcome, CommunityReporter};
pub use config::{GraphRagConfig, QueryMode, QueryParam};
pub use error::{AgentError, Result};
pub use extraction::{ChunkExtraction, ExtractionOrchestrator, ExtractionOutcome};
pub use graphrag::{GraphRag, InsertReport};
pub use indexer::{IndexOutcome, VectorIndexer};
pub use inference::{TeiClient, TgiClient};
pub use llm::{
    ChatMessage, CompletionModel, CompletionRequest, EmbeddingModel, EmbeddingPool, ModelPool,
    RequestKind, RetryPolicy,
};
pub use merger::{GraphMerger, MergeOutcome};
pub use query::{AnswerKind, QueryAnswer, QueryEngine};
