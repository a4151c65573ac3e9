//! Deterministic stand-ins for the language and embedding models

#![allow(dead_code)]

use async_trait::async_trait;
use kgrag_agents::{
    AgentError, CompletionModel, CompletionRequest, EmbeddingModel, GraphRag, GraphRagConfig,
    RequestKind, Result, RetryPolicy,
};
use kgrag_db::Workspace;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

const VERBS: [&str; 3] = [" works at ", " knows ", " manages "];

/// Reads "X works at Y." style sentences as a relation from X to Y.
/// Extraction fails for any text containing `POISON` while `poisoned` is set.
/// While `garbled` is set the same texts, and every community report, get a
/// prose reply instead of JSON.
#[derive(Default)]
pub struct ScriptedModel {
    calls: Mutex<HashMap<RequestKind, usize>>,
    map_prompts: Mutex<Vec<String>>,
    pub poisoned: AtomicBool,
    pub garbled: AtomicBool,
}

impl ScriptedModel {
    pub fn calls(&self, kind: RequestKind) -> usize {
        self.calls.lock().unwrap().get(&kind).copied().unwrap_or(0)
    }

    /// Report tables sent to map calls so far, header row stripped
    pub fn map_tables(&self) -> Vec<Vec<String>> {
        self.map_prompts
            .lock()
            .unwrap()
            .iter()
            .map(|prompt| {
                let table = prompt.rsplit("---Data tables---\n").next().unwrap_or_default();
                table
                    .lines()
                    .skip(1)
                    .filter(|line| !line.trim().is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .collect()
    }

    pub fn clear_map_tables(&self) {
        self.map_prompts.lock().unwrap().clear();
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    fn extract(text: &str) -> String {
        let mut entities = Vec::new();
        let mut relations = Vec::new();
        for sentence in text.split('.').map(str::trim) {
            let Some((verb, source, target)) = VERBS.iter().find_map(|verb| {
                let (source, target) = sentence.split_once(*verb)?;
                Some((*verb, source.trim(), target.trim()))
            }) else {
                continue;
            };
            if source.is_empty() || target.is_empty() {
                continue;
            }
            let (target_type, target_description) = if verb == " works at " {
                ("organization", format!("{} is an organization", target))
            } else {
                ("person", format!("{} is a person", target))
            };
            entities.push(serde_json::json!({
                "name": source,
                "type": "person",
                "description": format!("{} is a person", source),
            }));
            entities.push(serde_json::json!({
                "name": target,
                "type": target_type,
                "description": target_description,
            }));
            relations.push(serde_json::json!({
                "source": source,
                "target": target,
                "description": sentence,
                "weight": 2,
            }));
        }
        serde_json::json!({"entities": entities, "relationships": relations}).to_string()
    }
}

#[async_trait]
impl CompletionModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        *self.calls.lock().unwrap().entry(request.kind).or_default() += 1;
        let system = request.system_prompt.clone().unwrap_or_default();
        Ok(match request.kind {
            RequestKind::Extraction => {
                let text = request.prompt.rsplit("-Text-\n").next().unwrap_or_default();
                if text.contains("POISON") && self.poisoned.load(Ordering::SeqCst) {
                    return Err(AgentError::Llm("model unavailable".into()));
                }
                if text.contains("POISON") && self.garbled.load(Ordering::SeqCst) {
                    return Ok("Sorry, I found nothing worth listing here.".to_string());
                }
                Self::extract(text)
            }
            RequestKind::Gleaning => r#"{"entities": [], "relationships": []}"#.to_string(),
            RequestKind::GleaningCheck => "NO".to_string(),
            RequestKind::Summarize => "A condensed description.".to_string(),
            RequestKind::CommunityReport if self.garbled.load(Ordering::SeqCst) => {
                "This community is about several people.".to_string()
            }
            RequestKind::CommunityReport => {
                let data = request.prompt.rsplit("-Data-\n").next().unwrap_or_default();
                let summary: String = data.chars().take(400).collect();
                serde_json::json!({
                    "title": "Community report",
                    "summary": summary,
                    "rating": 6.0,
                    "rating_explanation": "Moderate impact",
                    "findings": [{"summary": "Members", "explanation": "Listed in the data"}],
                })
                .to_string()
            }
            RequestKind::GlobalMap => {
                self.map_prompts.lock().unwrap().push(system.clone());
                let point = if system.to_lowercase().contains("acme") {
                    serde_json::json!({"description": "Acme employs people", "score": 60})
                } else {
                    serde_json::json!({"description": "Nothing relevant", "score": 0})
                };
                serde_json::json!({"points": [point]}).to_string()
            }
            RequestKind::GlobalReduce => format!(
                "Global answer from {} analyst points",
                system.matches("----Analyst").count()
            ),
            RequestKind::Answer => "Local answer".to_string(),
        })
    }
}

/// Bag-of-words vectors hashed into a fixed number of buckets
#[derive(Default)]
pub struct HashEmbedder {
    pub offline: AtomicBool,
}

pub const EMBEDDING_DIM: usize = 64;

fn bucket(word: &str) -> usize {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in word.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    (hash % EMBEDDING_DIM as u64) as usize
}

pub fn embed_text(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0f32; EMBEDDING_DIM];
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        vector[bucket(&word.to_lowercase())] += 1.0;
    }
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        vector.iter_mut().for_each(|v| *v /= norm);
    }
    vector
}

#[async_trait]
impl EmbeddingModel for HashEmbedder {
    fn dimension(&self) -> usize {
        EMBEDDING_DIM
    }

    fn max_token_size(&self) -> usize {
        8192
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(AgentError::Embedding("embedding service offline".into()));
        }
        Ok(texts.iter().map(|t| embed_text(t)).collect())
    }
}

pub fn test_config() -> GraphRagConfig {
    GraphRagConfig {
        retry: RetryPolicy::none(),
        best_model_max_async: 4,
        cheap_model_max_async: 4,
        embedding_func_max_async: 2,
        ..GraphRagConfig::default()
    }
}

pub struct Harness {
    pub rag: GraphRag,
    pub model: Arc<ScriptedModel>,
    pub embedder: Arc<HashEmbedder>,
}

pub fn harness(config: GraphRagConfig) -> Harness {
    harness_over(config, Workspace::open_memory())
}

pub fn harness_over(config: GraphRagConfig, workspace: Workspace) -> Harness {
    let model = Arc::new(ScriptedModel::default());
    let embedder = Arc::new(HashEmbedder::default());
    let rag = GraphRag::new(
        config,
        workspace,
        model.clone(),
        model.clone(),
        embedder.clone(),
    )
    .unwrap();
    Harness {
        rag,
        model,
        embedder,
    }
}
