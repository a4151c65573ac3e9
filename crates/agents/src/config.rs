//! Pipeline and query configuration

use crate::llm::RetryPolicy;
use crate::{AgentError, Result};
use kgrag_core::chunker::{DEFAULT_CHUNK_OVERLAP_TOKEN_SIZE, DEFAULT_CHUNK_TOKEN_SIZE};
use kgrag_core::ClusteringConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|value| value.trim().parse().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key).ok().map(|value| {
        let value = value.trim().to_ascii_lowercase();
        matches!(value.as_str(), "1" | "true" | "yes" | "on")
    })
}

/// Tunables of the insertion pipeline and the model pools
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GraphRagConfig {
    pub chunk_token_size: usize,
    pub chunk_overlap_token_size: usize,

    /// Follow-up extraction rounds per chunk
    pub entity_extract_max_gleaning: usize,
    /// Merged descriptions longer than this are summarized
    pub entity_summary_to_max_tokens: usize,
    pub entity_types: Vec<String>,

    pub max_graph_cluster_size: usize,
    pub max_cluster_levels: usize,
    pub cluster_resolution: f64,

    pub embedding_batch_num: usize,
    pub embedding_func_max_async: usize,
    /// Minimum similarity for naive-mode chunk hits
    pub query_better_than_threshold: f32,

    pub best_model_max_async: usize,
    pub cheap_model_max_async: usize,
    pub best_model_max_token_size: usize,

    pub enable_local: bool,
    pub enable_naive_rag: bool,
    pub enable_llm_cache: bool,

    pub retry: RetryPolicy,
}

impl Default for GraphRagConfig {
    fn default() -> Self {
        Self {
            chunk_token_size: DEFAULT_CHUNK_TOKEN_SIZE,
            chunk_overlap_token_size: DEFAULT_CHUNK_OVERLAP_TOKEN_SIZE,
            entity_extract_max_gleaning: 1,
            entity_summary_to_max_tokens: 500,
            entity_types: ["organization", "person", "geo", "event"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            max_graph_cluster_size: 10,
            max_cluster_levels: 4,
            cluster_resolution: 1.0,
            embedding_batch_num: 32,
            embedding_func_max_async: 16,
            query_better_than_threshold: 0.2,
            best_model_max_async: 16,
            cheap_model_max_async: 16,
            best_model_max_token_size: 32768,
            enable_local: true,
            enable_naive_rag: false,
            enable_llm_cache: true,
            retry: RetryPolicy::default(),
        }
    }
}

impl GraphRagConfig {
    /// Defaults overlaid with `KGRAG_*` environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        macro_rules! overlay {
            ($field:ident, $key:literal) => {
                if let Some(value) = env_parse(concat!("KGRAG_", $key)) {
                    config.$field = value;
                }
            };
        }
        overlay!(chunk_token_size, "CHUNK_TOKEN_SIZE");
        overlay!(chunk_overlap_token_size, "CHUNK_OVERLAP_TOKEN_SIZE");
        overlay!(entity_extract_max_gleaning, "MAX_GLEANING");
        overlay!(entity_summary_to_max_tokens, "SUMMARY_MAX_TOKENS");
        overlay!(max_graph_cluster_size, "MAX_CLUSTER_SIZE");
        overlay!(max_cluster_levels, "MAX_CLUSTER_LEVELS");
        overlay!(cluster_resolution, "CLUSTER_RESOLUTION");
        overlay!(embedding_batch_num, "EMBEDDING_BATCH_NUM");
        overlay!(embedding_func_max_async, "EMBEDDING_MAX_ASYNC");
        overlay!(query_better_than_threshold, "QUERY_THRESHOLD");
        overlay!(best_model_max_async, "BEST_MODEL_MAX_ASYNC");
        overlay!(cheap_model_max_async, "CHEAP_MODEL_MAX_ASYNC");
        overlay!(best_model_max_token_size, "BEST_MODEL_MAX_TOKEN_SIZE");

        if let Some(value) = env_flag("KGRAG_ENABLE_LOCAL") {
            config.enable_local = value;
        }
        if let Some(value) = env_flag("KGRAG_ENABLE_NAIVE_RAG") {
            config.enable_naive_rag = value;
        }
        if let Some(value) = env_flag("KGRAG_ENABLE_LLM_CACHE") {
            config.enable_llm_cache = value;
        }
        if let Ok(types) = std::env::var("KGRAG_ENTITY_TYPES") {
            let types: Vec<String> = types
                .split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect();
            if !types.is_empty() {
                config.entity_types = types;
            }
        }
        if let Some(value) = env_parse("KGRAG_RETRY_MAX_ATTEMPTS") {
            config.retry.max_attempts = value;
        }
        config
    }

    pub fn clustering(&self) -> ClusteringConfig {
        ClusteringConfig {
            max_cluster_size: self.max_graph_cluster_size,
            max_levels: self.max_cluster_levels,
            resolution: self.cluster_resolution,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_overlap_token_size >= self.chunk_token_size {
            return Err(AgentError::Config(format!(
                "chunk_overlap_token_size ({}) must be smaller than chunk_token_size ({})",
                self.chunk_overlap_token_size, self.chunk_token_size
            )));
        }
        if self.best_model_max_async == 0 || self.cheap_model_max_async == 0 {
            return Err(AgentError::Config(
                "model concurrency limits must be at least 1".into(),
            ));
        }
        self.clustering().validate()?;
        Ok(())
    }
}

/// Retrieval strategy of a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueryMode {
    Local,
    #[default]
    Global,
    Naive,
}

impl fmt::Display for QueryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueryMode::Local => "local",
            QueryMode::Global => "global",
            QueryMode::Naive => "naive",
        };
        f.write_str(name)
    }
}

impl FromStr for QueryMode {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(QueryMode::Local),
            "global" => Ok(QueryMode::Global),
            "naive" => Ok(QueryMode::Naive),
            other => Err(AgentError::InvalidMode(other.to_string())),
        }
    }
}

/// Per-query options
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueryParam {
    pub mode: QueryMode,
    /// Return the assembled context instead of an answer
    pub only_need_context: bool,
    pub response_type: String,
    /// Highest community level considered
    pub level: usize,
    pub top_k: usize,
    /// Overall token budget of any assembled context
    pub max_context_tokens: usize,

    pub naive_max_token_for_text_unit: usize,

    pub local_max_token_for_text_unit: usize,
    pub local_max_token_for_local_context: usize,
    pub local_max_token_for_community_report: usize,
    pub local_community_single_one: bool,

    pub global_min_community_rating: f64,
    pub global_max_consider_community: usize,
    pub global_max_token_for_community_report: usize,
}

impl Default for QueryParam {
    fn default() -> Self {
        Self {
            mode: QueryMode::Global,
            only_need_context: false,
            response_type: "Multiple Paragraphs".to_string(),
            level: 2,
            top_k: 20,
            max_context_tokens: 12000,
            naive_max_token_for_text_unit: 12000,
            local_max_token_for_text_unit: 4000,
            local_max_token_for_local_context: 4800,
            local_max_token_for_community_report: 3200,
            local_community_single_one: false,
            global_min_community_rating: 0.0,
            global_max_consider_community: 512,
            global_max_token_for_community_report: 16384,
        }
    }
}

impl QueryParam {
    pub fn new(mode: QueryMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_max_context_tokens(mut self, max_context_tokens: usize) -> Self {
        self.max_context_tokens = max_context_tokens;
        self
    }

    pub fn with_max_consider_community(mut self, max: usize) -> Self {
        self.global_max_consider_community = max;
        self
    }

    pub fn only_context(mut self) -> Self {
        self.only_need_context = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = GraphRagConfig::default();
        assert_eq!(config.chunk_token_size, 1200);
        assert_eq!(config.chunk_overlap_token_size, 100);
        assert_eq!(config.entity_summary_to_max_tokens, 500);
        assert!(!config.enable_naive_rag);
        assert!(config.validate().is_ok());

        let param = QueryParam::default();
        assert_eq!(param.mode, QueryMode::Global);
        assert_eq!(param.top_k, 20);
        assert_eq!(param.global_max_consider_community, 512);
    }

    #[test]
    fn test_query_mode_parse() {
        assert_eq!("LOCAL".parse::<QueryMode>().unwrap(), QueryMode::Local);
        assert_eq!(QueryMode::Naive.to_string(), "naive");
        assert!("hybrid".parse::<QueryMode>().is_err());
    }

    #[test]
    fn test_invalid_overlap_rejected() {
        let config = GraphRagConfig {
            chunk_overlap_token_size: 2000,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(AgentError::Config(_))));
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: GraphRagConfig =
            serde_json::from_str(r#"{"chunk_token_size": 600}"#).unwrap();
        assert_eq!(config.chunk_token_size, 600);
        assert_eq!(config.max_cluster_levels, 4);
    }
}
