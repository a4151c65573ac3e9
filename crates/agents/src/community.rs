//! Community detection and report generation
//!
//! Runs once per insertion batch over the fully merged graph. Reports are
//! cached by a key over member ids and description hashes, so only
//! communities whose membership or content changed hit the model.

use crate::json::{array_field, number_field, parse_object, string_field};
use crate::llm::{CompletionRequest, ModelPool, RequestKind};
use crate::prompts;
use crate::{AgentError, Result};
use futures::stream::{self, StreamExt};
use kgrag_core::context::{csv_table, truncate_by_tokens};
use kgrag_core::{
    build_communities, ClusteringConfig, Community, CommunityReport, Entity, Finding, Relation,
    Tokenizer,
};
use kgrag_db::{GraphStore, KvStore, KvStoreExt};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Counts from one refresh
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommunityOutcome {
    pub communities: usize,
    pub generated: usize,
    pub cached: usize,
    pub failed: usize,
}

pub struct CommunityReporter {
    graph: Arc<dyn GraphStore>,
    reports: Arc<dyn KvStore>,
    best: Arc<ModelPool>,
    tokenizer: Tokenizer,
    clustering: ClusteringConfig,
    max_context_tokens: usize,
}

impl CommunityReporter {
    pub fn new(
        graph: Arc<dyn GraphStore>,
        reports: Arc<dyn KvStore>,
        best: Arc<ModelPool>,
        tokenizer: Tokenizer,
        clustering: ClusteringConfig,
        max_context_tokens: usize,
    ) -> Self {
        Self {
            graph,
            reports,
            best,
            tokenizer,
            clustering,
            max_context_tokens,
        }
    }

    /// Recluster the graph, attach cached or freshly generated reports and
    /// swap the result in as the new community state.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<CommunityOutcome> {
        let clusters = self.graph.cluster(&self.clustering).await?;
        let entities: BTreeMap<String, Entity> = self
            .graph
            .all_nodes()
            .await?
            .into_iter()
            .map(|e| (e.id.clone(), e))
            .collect();
        let relations = self.graph.all_edges().await?;
        if clusters.is_empty() {
            warn!("Graph produced no communities");
        }

        let mut communities = build_communities(&clusters, &entities, &relations);
        let mut degrees: HashMap<&str, usize> = HashMap::new();
        for relation in &relations {
            *degrees.entry(relation.src_id.as_str()).or_default() += 1;
            *degrees.entry(relation.tgt_id.as_str()).or_default() += 1;
        }
        let relation_index: BTreeMap<(String, String), &Relation> =
            relations.iter().map(|r| (r.key(), r)).collect();

        let mut by_level: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (idx, community) in communities.iter().enumerate() {
            by_level.entry(community.level).or_default().push(idx);
        }

        let mut outcome = CommunityOutcome {
            communities: communities.len(),
            ..Default::default()
        };
        let mut rendered: BTreeMap<String, String> = BTreeMap::new();

        for (level, indices) in by_level {
            let mut pending = Vec::new();
            for idx in indices {
                let key = communities[idx].report_key.clone();
                match self.reports.get_as::<CommunityReport>(&key).await? {
                    Some(report) => {
                        communities[idx].attach_report(report);
                        outcome.cached += 1;
                    }
                    None => {
                        let context = self.report_context(
                            &communities[idx],
                            &entities,
                            &degrees,
                            &relation_index,
                            &rendered,
                        );
                        pending.push((idx, context));
                    }
                }
            }
            debug!("Level {}: generating {} reports", level, pending.len());

            let results: Vec<(usize, Result<CommunityReport>)> = stream::iter(pending)
                .map(|(idx, context)| async move { (idx, self.generate(&context).await) })
                .buffer_unordered(self.best.max_async())
                .collect()
                .await;

            for (idx, result) in results {
                match result {
                    Ok(report) => {
                        self.reports
                            .set_as(&communities[idx].report_key, &report)
                            .await?;
                        communities[idx].attach_report(report);
                        outcome.generated += 1;
                    }
                    Err(e) => {
                        warn!("Report for community {} failed: {}", communities[idx].id, e);
                        outcome.failed += 1;
                    }
                }
            }

            for community in communities.iter().filter(|c| c.level == level) {
                if community.report.is_some() {
                    rendered.insert(community.id.clone(), community.report_string.clone());
                }
            }
        }

        for community in &mut communities {
            if let Some(report) = &community.report {
                if !report.title.trim().is_empty() {
                    community.title = report.title.clone();
                }
            }
        }

        self.graph.replace_communities(communities).await?;
        info!(
            "Communities: {} total, {} generated, {} cached, {} failed",
            outcome.communities, outcome.generated, outcome.cached, outcome.failed
        );
        Ok(outcome)
    }

    async fn generate(&self, context: &str) -> Result<CommunityReport> {
        self.best
            .complete_with(
                CompletionRequest::new(RequestKind::CommunityReport, prompts::community_report(context))
                    .with_json_response(),
                parse_report,
            )
            .await
    }

    /// CSV entity and relation tables for one community, highest degree
    /// first. When the tables overflow the budget, reports of the
    /// sub-communities are packed first and the rest is filled with rows.
    fn report_context(
        &self,
        community: &Community,
        entities: &BTreeMap<String, Entity>,
        degrees: &HashMap<&str, usize>,
        relations: &BTreeMap<(String, String), &Relation>,
        sub_reports: &BTreeMap<String, String>,
    ) -> String {
        let degree = |id: &str| degrees.get(id).copied().unwrap_or(0);

        let mut members: Vec<&Entity> = community
            .nodes
            .iter()
            .filter_map(|id| entities.get(id))
            .collect();
        members.sort_by(|a, b| degree(&b.id).cmp(&degree(&a.id)).then_with(|| a.id.cmp(&b.id)));
        let entity_rows: Vec<Vec<String>> = members
            .iter()
            .enumerate()
            .map(|(i, e)| {
                vec![
                    i.to_string(),
                    e.name.clone(),
                    e.entity_type.clone(),
                    e.description.clone(),
                    degree(&e.id).to_string(),
                ]
            })
            .collect();

        let mut edges: Vec<&Relation> = community
            .edges
            .iter()
            .filter_map(|key| relations.get(key).copied())
            .collect();
        edges.sort_by(|a, b| {
            let ra = degree(&a.src_id) + degree(&a.tgt_id);
            let rb = degree(&b.src_id) + degree(&b.tgt_id);
            rb.cmp(&ra).then_with(|| a.key().cmp(&b.key()))
        });
        let relation_rows: Vec<Vec<String>> = edges
            .iter()
            .enumerate()
            .map(|(i, r)| {
                vec![
                    i.to_string(),
                    r.src_id.clone(),
                    r.tgt_id.clone(),
                    r.description.clone(),
                    (degree(&r.src_id) + degree(&r.tgt_id)).to_string(),
                ]
            })
            .collect();

        let full = render_report_context(&[], &entity_rows, &relation_rows);
        if self.tokenizer.count(&full) <= self.max_context_tokens {
            return full;
        }

        let row_text = |row: &Vec<String>| row.join(",\t");
        let mut budget = self.max_context_tokens;
        let subs: Vec<Vec<String>> = community
            .sub_communities
            .iter()
            .filter_map(|id| sub_reports.get(id).map(|r| vec![id.clone(), r.clone()]))
            .collect();
        let subs = if subs.is_empty() {
            subs
        } else {
            let kept = truncate_by_tokens(&self.tokenizer, subs, budget / 2, row_text);
            budget -= kept.iter().map(|r| self.tokenizer.count(&row_text(r))).sum::<usize>();
            kept
        };
        let entity_rows = truncate_by_tokens(&self.tokenizer, entity_rows, budget / 2, row_text);
        budget -= entity_rows
            .iter()
            .map(|r| self.tokenizer.count(&row_text(r)))
            .sum::<usize>();
        let relation_rows = truncate_by_tokens(&self.tokenizer, relation_rows, budget, row_text);
        render_report_context(&subs, &entity_rows, &relation_rows)
    }
}

fn render_report_context(
    reports: &[Vec<String>],
    entities: &[Vec<String>],
    relations: &[Vec<String>],
) -> String {
    let mut sections = Vec::new();
    if !reports.is_empty() {
        sections.push(format!(
            "-----Reports-----\n```csv\n{}\n```",
            csv_table(&["id", "content"], reports)
        ));
    }
    sections.push(format!(
        "-----Entities-----\n```csv\n{}\n```",
        csv_table(&["id", "entity", "type", "description", "degree"], entities)
    ));
    sections.push(format!(
        "-----Relationships-----\n```csv\n{}\n```",
        csv_table(&["id", "source", "target", "description", "rank"], relations)
    ));
    sections.join("\n\n")
}

/// Parse a community report reply. The title is the only required field.
pub fn parse_report(reply: &str) -> Result<CommunityReport> {
    let object = parse_object(reply)
        .ok_or_else(|| AgentError::ExtractionParse("community report is not a JSON object".into()))?;
    let value = Value::Object(object);
    let title = string_field(&value, &["title", "name"])
        .ok_or_else(|| AgentError::ExtractionParse("community report has no title".into()))?;
    let findings = array_field(&value, &["findings", "insights"])
        .map(|items| {
            items
                .iter()
                .filter_map(|item| match item {
                    Value::String(s) => Some(Finding {
                        summary: s.trim().to_string(),
                        explanation: String::new(),
                    }),
                    Value::Object(_) => Some(Finding {
                        summary: string_field(item, &["summary", "title"])?,
                        explanation: string_field(item, &["explanation", "description"])
                            .unwrap_or_default(),
                    }),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(CommunityReport {
        title,
        summary: string_field(&value, &["summary"]).unwrap_or_default(),
        rating: number_field(&value, &["rating", "impact_rating"])
            .filter(|r| r.is_finite())
            .map(|r| r.clamp(0.0, 10.0))
            .unwrap_or(0.0),
        rating_explanation: string_field(&value, &["rating_explanation"]).unwrap_or_default(),
        findings,
    })
}
