//! Local inference clients for embeddings (TEI) and completions (TGI), each
//! with an Ollama variant.

use crate::llm::{ChatMessage, CompletionModel, CompletionRequest, EmbeddingModel};
use crate::{AgentError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

const DEFAULT_TEI_URL: &str = "http://localhost:8081";
const DEFAULT_TEI_PROVIDER: &str = "tei";
const DEFAULT_OLLAMA_EMBED_MODEL: &str = "nomic-embed-text:latest";
const DEFAULT_TEI_DIMENSION: usize = 1024;
const DEFAULT_TEI_MAX_TOKENS: usize = 8192;
const DEFAULT_TEI_MAX_BATCH: usize = 32;
const DEFAULT_TGI_URL: &str = "http://localhost:8082";
const DEFAULT_TGI_PROVIDER: &str = "tgi";
const DEFAULT_OLLAMA_MODEL: &str = "phi4-mini:latest";
const DEFAULT_MAX_NEW_TOKENS: u32 = 2048;
const DEFAULT_TIMEOUT_SECS: u64 = 120;

fn env_or_default(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .filter(|value| *value > 0)
}

fn timeout() -> Duration {
    let secs = std::env::var("TGI_TIMEOUT_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_TIMEOUT_SECS);
    Duration::from_secs(secs)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Provider {
    Native,
    Ollama,
}

impl Provider {
    fn from_env(key: &str, default: &str) -> Self {
        if env_or_default(key, default).eq_ignore_ascii_case("ollama") {
            Provider::Ollama
        } else {
            Provider::Native
        }
    }
}

/// Embedding client for a text-embeddings-inference server or Ollama
#[derive(Clone)]
pub struct TeiClient {
    client: Client,
    base_url: String,
    provider: Provider,
    model: String,
    dimension: usize,
    max_tokens: usize,
    max_batch: usize,
}

impl TeiClient {
    /// Configure from `TEI_PROVIDER`, `TEI_URL`, `TEI_MODEL`, `TEI_DIMENSION`,
    /// `TEI_MAX_TOKENS` and `TEI_MAX_BATCH`.
    pub fn from_env() -> Self {
        let provider = Provider::from_env("TEI_PROVIDER", DEFAULT_TEI_PROVIDER);
        let default_url = match provider {
            Provider::Ollama => "http://localhost:11434",
            Provider::Native => DEFAULT_TEI_URL,
        };
        Self {
            client: Client::new(),
            base_url: env_or_default("TEI_URL", default_url),
            provider,
            model: env_or_default("TEI_MODEL", DEFAULT_OLLAMA_EMBED_MODEL),
            dimension: env_usize("TEI_DIMENSION").unwrap_or(DEFAULT_TEI_DIMENSION),
            max_tokens: env_usize("TEI_MAX_TOKENS").unwrap_or(DEFAULT_TEI_MAX_TOKENS),
            max_batch: env_usize("TEI_MAX_BATCH").unwrap_or(DEFAULT_TEI_MAX_BATCH),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn health(&self) -> Result<bool> {
        let url = match self.provider {
            Provider::Native => format!("{}/health", self.base_url),
            Provider::Ollama => format!("{}/api/tags", self.base_url),
        };
        let response = self.client.get(&url).send().await?;
        Ok(response.status().is_success())
    }

    async fn tei_embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embed", self.base_url);
        let prompt_name = std::env::var("TEI_PROMPT_NAME").ok();
        let mut results = Vec::with_capacity(texts.len());

        for chunk in texts.chunks(self.max_batch) {
            let request = TeiEmbedBatchRequest {
                inputs: chunk,
                truncate: true,
                prompt_name: prompt_name.as_deref(),
            };

            let response = self
                .client
                .post(&url)
                .json(&request)
                .send()
                .await?
                .error_for_status()?
                .json::<Value>()
                .await?;

            results.extend(parse_embeddings_response(response)?);
        }

        Ok(results)
    }

    async fn ollama_embed(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/api/embeddings", self.base_url);
        let request = OllamaEmbedRequest {
            model: self.model.clone(),
            prompt: text.to_string(),
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json::<OllamaEmbedResponse>()
            .await?;

        Ok(response.embedding)
    }
}

#[async_trait]
impl EmbeddingModel for TeiClient {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn max_token_size(&self) -> usize {
        self.max_tokens
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        match self.provider {
            Provider::Native => self.tei_embed(texts).await,
            Provider::Ollama => {
                let mut results = Vec::with_capacity(texts.len());
                for text in texts {
                    results.push(self.ollama_embed(text).await?);
                }
                Ok(results)
            }
        }
    }
}

/// Completion client for a text-generation-inference server or Ollama
#[derive(Clone)]
pub struct TgiClient {
    client: Client,
    base_url: String,
    provider: Provider,
    model: String,
    max_new_tokens: u32,
}

impl TgiClient {
    /// Configure from `TGI_PROVIDER`, `TGI_URL` and the model variable
    /// `model_var` (`TGI_MODEL` for the best model, `TGI_CHEAP_MODEL` for the
    /// cheap one, which falls back to `TGI_MODEL`).
    pub fn from_env(model_var: &str) -> Self {
        let provider = Provider::from_env("TGI_PROVIDER", DEFAULT_TGI_PROVIDER);
        let default_url = match provider {
            Provider::Ollama => "http://localhost:11434",
            Provider::Native => DEFAULT_TGI_URL,
        };
        let model = std::env::var(model_var)
            .or_else(|_| std::env::var("TGI_MODEL"))
            .unwrap_or_else(|_| match provider {
                Provider::Ollama => DEFAULT_OLLAMA_MODEL.to_string(),
                Provider::Native => "tgi".to_string(),
            });
        Self {
            client: Client::new(),
            base_url: env_or_default("TGI_URL", default_url),
            provider,
            model,
            max_new_tokens: std::env::var("TGI_MAX_NEW_TOKENS")
                .ok()
                .and_then(|value| value.parse::<u32>().ok())
                .filter(|value| *value > 0)
                .unwrap_or(DEFAULT_MAX_NEW_TOKENS),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn health(&self) -> Result<bool> {
        let url = match self.provider {
            Provider::Native => format!("{}/health", self.base_url),
            Provider::Ollama => format!("{}/api/tags", self.base_url),
        };
        let response = self.client.get(&url).send().await?;
        Ok(response.status().is_success())
    }

    async fn tgi_generate(&self, request: &CompletionRequest) -> Result<String> {
        let url = format!("{}/generate", self.base_url);
        let body = TgiGenerateRequest {
            inputs: transcript(&request.messages()),
            parameters: TgiParameters {
                max_new_tokens: Some(request.max_tokens.unwrap_or(self.max_new_tokens)),
                return_full_text: Some(false),
                grammar: json_grammar(request),
            },
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .timeout(timeout())
            .send()
            .await?
            .error_for_status()?
            .json::<Value>()
            .await?;

        extract_generated_text(response)
    }

    async fn ollama_chat(&self, request: &CompletionRequest) -> Result<String> {
        let url = format!("{}/api/chat", self.base_url);
        let body = OllamaChatRequest {
            model: self.model.clone(),
            messages: request.messages(),
            stream: false,
            format: request.json_response.then(|| "json".to_string()),
            options: request
                .max_tokens
                .map(|n| serde_json::json!({ "num_predict": n })),
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .timeout(timeout())
            .send()
            .await?
            .error_for_status()?
            .json::<OllamaChatResponse>()
            .await?;

        if let Some(done_reason) = response.done_reason.as_deref() {
            debug!("Ollama chat done_reason={}", done_reason);
        }
        if let Some(total_ms) = response.total_duration.map(|ns| ns as f64 / 1_000_000.0) {
            debug!("Ollama chat total_duration_ms={:.2}", total_ms);
        }

        Ok(response.message.content)
    }
}

#[async_trait]
impl CompletionModel for TgiClient {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        match self.provider {
            Provider::Native => self.tgi_generate(request).await,
            Provider::Ollama => self.ollama_chat(request).await,
        }
    }
}

/// TGI guided-decoding grammar constraining the reply to a JSON object
fn json_grammar(request: &CompletionRequest) -> Option<Value> {
    request
        .json_response
        .then(|| serde_json::json!({ "type": "json", "value": { "type": "object" } }))
}

/// Flatten a chat into a single prompt for plain-generation endpoints.
fn transcript(messages: &[ChatMessage]) -> String {
    let mut out = String::new();
    for message in messages {
        out.push_str(&format!("<|{}|>\n{}\n", message.role, message.content));
    }
    out.push_str("<|assistant|>\n");
    out
}

#[derive(Serialize)]
struct TeiEmbedBatchRequest<'a> {
    inputs: &'a [String],
    truncate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    prompt_name: Option<&'a str>,
}

#[derive(Serialize)]
struct TgiGenerateRequest {
    inputs: String,
    parameters: TgiParameters,
}

#[derive(Serialize)]
struct TgiParameters {
    #[serde(skip_serializing_if = "Option::is_none")]
    max_new_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    return_full_text: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    grammar: Option<Value>,
}

#[derive(Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<Value>,
}

#[derive(Serialize)]
struct OllamaEmbedRequest {
    model: String,
    prompt: String,
}

#[derive(Deserialize)]
struct OllamaChatResponse {
    message: OllamaChatMessageResponse,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    total_duration: Option<u64>,
}

#[derive(Deserialize)]
struct OllamaChatMessageResponse {
    content: String,
}

#[derive(Deserialize)]
struct OllamaEmbedResponse {
    embedding: Vec<f32>,
}

fn parse_embeddings_response(value: Value) -> Result<Vec<Vec<f32>>> {
    match value {
        Value::Array(items) => {
            if items.is_empty() {
                return Ok(Vec::new());
            }
            if items.first().map(|v| v.is_array()).unwrap_or(false) {
                serde_json::from_value(Value::Array(items)).map_err(|e| {
                    AgentError::Embedding(format!("Invalid TEI embeddings response: {}", e))
                })
            } else {
                let single: Vec<f32> =
                    serde_json::from_value(Value::Array(items)).map_err(|e| {
                        AgentError::Embedding(format!("Invalid TEI embedding array: {}", e))
                    })?;
                Ok(vec![single])
            }
        }
        other => Err(AgentError::Embedding(format!(
            "Unexpected TEI response format: {}",
            other
        ))),
    }
}

fn extract_generated_text(value: Value) -> Result<String> {
    match value {
        Value::Array(mut items) => {
            let first = items
                .pop()
                .ok_or_else(|| AgentError::Llm("Empty TGI response array".to_string()))?;
            extract_generated_text(first)
        }
        Value::Object(mut obj) => {
            if let Some(Value::String(text)) = obj.remove("generated_text") {
                Ok(text)
            } else if let Some(Value::String(text)) = obj.remove("response") {
                Ok(text)
            } else {
                Err(AgentError::Llm(
                    "TGI response missing generated text field".to_string(),
                ))
            }
        }
        other => Err(AgentError::Llm(format!(
            "Unexpected TGI response format: {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::RequestKind;
    use serde_json::json;

    #[test]
    fn test_parse_embeddings_batch_and_single() {
        let batch = parse_embeddings_response(json!([[0.1, 0.2], [0.3, 0.4]])).unwrap();
        assert_eq!(batch.len(), 2);
        let single = parse_embeddings_response(json!([0.5, 0.6])).unwrap();
        assert_eq!(single, vec![vec![0.5, 0.6]]);
        assert!(parse_embeddings_response(json!({"error": "x"})).is_err());
    }

    #[test]
    fn test_extract_generated_text_shapes() {
        assert_eq!(
            extract_generated_text(json!([{"generated_text": "hi"}])).unwrap(),
            "hi"
        );
        assert_eq!(extract_generated_text(json!({"response": "yo"})).unwrap(), "yo");
        let err = extract_generated_text(json!({})).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_transcript_ends_with_assistant_turn() {
        let request = CompletionRequest::new(RequestKind::Answer, "question")
            .with_system_prompt("be brief");
        let text = transcript(&request.messages());
        assert!(text.starts_with("<|system|>\nbe brief\n"));
        assert!(text.contains("<|user|>\nquestion\n"));
        assert!(text.ends_with("<|assistant|>\n"));
    }

    #[test]
    fn test_generate_request_carries_json_grammar() {
        let plain = CompletionRequest::new(RequestKind::Answer, "question");
        assert!(json_grammar(&plain).is_none());

        let request = CompletionRequest::new(RequestKind::Extraction, "text").with_json_response();
        let body = serde_json::to_value(TgiGenerateRequest {
            inputs: transcript(&request.messages()),
            parameters: TgiParameters {
                max_new_tokens: Some(64),
                return_full_text: Some(false),
                grammar: json_grammar(&request),
            },
        })
        .unwrap();
        assert_eq!(body["parameters"]["grammar"]["type"], "json");
        assert_eq!(body["parameters"]["grammar"]["value"]["type"], "object");
    }
}
