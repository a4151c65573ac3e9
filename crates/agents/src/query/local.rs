use super::{AnswerKind, QueryAnswer, QueryEngine};
use crate::config::QueryParam;
use crate::llm::{CompletionRequest, RequestKind};
use crate::prompts;
use crate::Result;
use kgrag_core::context::{csv_table, truncate_by_tokens, CSV_SEPARATOR};
use kgrag_core::{Entity, Relation};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

const SIMILARITY_WEIGHT: f64 = 0.6;
const PROXIMITY_WEIGHT: f64 = 0.4;

fn normalize(value: f64, max: f64) -> f64 {
    if max > 0.0 {
        value / max
    } else {
        0.0
    }
}

fn blend(similarity: f64, proximity: f64) -> f64 {
    SIMILARITY_WEIGHT * similarity + PROXIMITY_WEIGHT * proximity
}

/// One candidate row of the local context
#[derive(Debug, Clone)]
struct Piece {
    score: f64,
    key: String,
    cells: Vec<String>,
}

impl Piece {
    fn text(&self) -> String {
        self.cells.join(CSV_SEPARATOR)
    }
}

fn rank_pieces(mut pieces: Vec<Piece>) -> Vec<Piece> {
    pieces.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.key.cmp(&b.key)));
    pieces
}

#[derive(Debug, Default)]
struct LocalContext {
    reports: Vec<Piece>,
    entities: Vec<Piece>,
    relations: Vec<Piece>,
    sources: Vec<Piece>,
}

impl LocalContext {
    fn is_empty(&self) -> bool {
        self.reports.is_empty()
            && self.entities.is_empty()
            && self.relations.is_empty()
            && self.sources.is_empty()
    }

    fn render(&self) -> String {
        fn section(title: &str, header: &[&str], pieces: &[Piece]) -> String {
            let rows: Vec<Vec<String>> = pieces
                .iter()
                .enumerate()
                .map(|(i, p)| {
                    let mut row = vec![i.to_string()];
                    row.extend(p.cells.iter().cloned());
                    row
                })
                .collect();
            format!("-----{}-----\n```csv\n{}\n```", title, csv_table(header, &rows))
        }

        [
            section("Reports", &["id", "content"], &self.reports),
            section(
                "Entities",
                &["id", "entity", "type", "description", "rank"],
                &self.entities,
            ),
            section(
                "Relationships",
                &["id", "source", "target", "description", "weight", "rank"],
                &self.relations,
            ),
            section("Sources", &["id", "content"], &self.sources),
        ]
        .join("\n\n")
    }

    /// Remove the lowest-scored piece across all sections. Each section is
    /// sorted best first, so candidates are the section tails.
    fn pop_lowest(&mut self) -> bool {
        let sections = [
            &mut self.reports,
            &mut self.entities,
            &mut self.relations,
            &mut self.sources,
        ];
        let mut lowest: Option<(usize, f64)> = None;
        for (i, section) in sections.iter().enumerate() {
            if let Some(last) = section.last() {
                if lowest.map_or(true, |(_, score)| last.score < score) {
                    lowest = Some((i, last.score));
                }
            }
        }
        match lowest {
            Some((i, _)) => {
                let [reports, entities, relations, sources] = sections;
                match i {
                    0 => reports.pop(),
                    1 => entities.pop(),
                    2 => relations.pop(),
                    _ => sources.pop(),
                };
                true
            }
            None => false,
        }
    }
}

impl QueryEngine {
    pub(crate) async fn local_query(&self, query: &str, param: &QueryParam) -> Result<QueryAnswer> {
        let Some(context) = self.local_context(query, param).await? else {
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
                    .with_system_prompt(prompts::local_rag_system(&context, &param.response_type)),
            )
            .await?;
        Ok(QueryAnswer {
            text,
            kind: AnswerKind::Answer,
        })
    }

    /// Entities similar to the query plus their relations, source chunks and
    /// community reports, ranked by similarity and graph proximity and packed
    /// into the token budget.
    pub async fn local_context(&self, query: &str, param: &QueryParam) -> Result<Option<String>> {
        let graph = &self.workspace.graph;
        let vector = self.embed_query(query).await?;
        let hits = self.workspace.entities_vdb.query(&vector, param.top_k).await?;

        let mut matched: Vec<Entity> = Vec::new();
        let mut similarity: HashMap<String, f64> = HashMap::new();
        for hit in hits {
            let Some(name) = hit.payload.get("entity_name").and_then(Value::as_str) else {
                continue;
            };
            if similarity.contains_key(name) {
                continue;
            }
            if let Some(entity) = graph.get_node(name).await? {
                similarity.insert(entity.id.clone(), f64::from(hit.score));
                matched.push(entity);
            }
        }
        debug!("Local retrieval matched {} entities", matched.len());
        if matched.is_empty() {
            return Ok(None);
        }
        let sim = |id: &str| similarity.get(id).copied().unwrap_or(0.0);

        let mut relations: BTreeMap<(String, String), Relation> = BTreeMap::new();
        for entity in &matched {
            for relation in graph.get_edges(&entity.id).await? {
                relations.entry(relation.key()).or_insert(relation);
            }
        }

        let mut degrees: HashMap<String, usize> = HashMap::new();
        let endpoints: BTreeSet<&str> = matched
            .iter()
            .map(|e| e.id.as_str())
            .chain(relations.keys().flat_map(|(a, b)| [a.as_str(), b.as_str()]))
            .collect();
        for id in endpoints {
            degrees.insert(id.to_string(), graph.node_degree(id).await?);
        }
        let degree = |id: &str| degrees.get(id).copied().unwrap_or(0);

        let max_degree = matched.iter().map(|e| degree(&e.id)).max().unwrap_or(0) as f64;
        let entities = rank_pieces(
            matched
                .iter()
                .map(|e| Piece {
                    score: blend(sim(&e.id), normalize(degree(&e.id) as f64, max_degree)),
                    key: e.id.clone(),
                    cells: vec![
                        e.name.clone(),
                        e.entity_type.clone(),
                        e.description.clone(),
                        degree(&e.id).to_string(),
                    ],
                })
                .collect(),
        );

        let max_weight = relations.values().map(|r| r.weight).fold(0.0, f64::max);
        let relation_pieces = rank_pieces(
            relations
                .values()
                .map(|r| Piece {
                    score: blend(
                        sim(&r.src_id).max(sim(&r.tgt_id)),
                        normalize(r.weight, max_weight),
                    ),
                    key: format!("{}|{}", r.src_id, r.tgt_id),
                    cells: vec![
                        r.src_id.clone(),
                        r.tgt_id.clone(),
                        r.description.clone(),
                        format!("{}", r.weight),
                        (degree(&r.src_id) + degree(&r.tgt_id)).to_string(),
                    ],
                })
                .collect(),
        );

        // chunk id -> (best similarity of a referencing entity, references)
        let mut chunk_refs: BTreeMap<&str, (f64, usize)> = BTreeMap::new();
        for entity in &matched {
            for chunk_id in &entity.source_ids {
                let entry = chunk_refs.entry(chunk_id.as_str()).or_insert((0.0, 0));
                entry.0 = entry.0.max(sim(&entity.id));
                entry.1 += 1;
            }
        }
        for relation in relations.values() {
            for chunk_id in &relation.source_ids {
                if let Some(entry) = chunk_refs.get_mut(chunk_id.as_str()) {
                    entry.1 += 1;
                }
            }
        }
        let max_refs = chunk_refs.values().map(|(_, n)| *n).max().unwrap_or(0) as f64;
        let chunk_ids: Vec<String> = chunk_refs.keys().map(|id| id.to_string()).collect();
        let stored = self.workspace.text_chunks.get_many(&chunk_ids).await?;
        let mut sources = Vec::new();
        for ((chunk_id, (best, refs)), stored) in chunk_refs.iter().zip(stored) {
            let Some(content) = stored
                .as_ref()
                .and_then(|v| v.get("content"))
                .and_then(Value::as_str)
            else {
                continue;
            };
            sources.push(Piece {
                score: blend(*best, normalize(*refs as f64, max_refs)),
                key: chunk_id.to_string(),
                cells: vec![content.to_string()],
            });
        }
        let sources = rank_pieces(sources);

        let mut reports = Vec::new();
        let mut overlaps = Vec::new();
        for community in graph.communities().await? {
            if community.level > param.level || community.report.is_none() {
                continue;
            }
            let members: Vec<&String> = community
                .nodes
                .iter()
                .filter(|n| similarity.contains_key(n.as_str()))
                .collect();
            if members.is_empty() {
                continue;
            }
            let best = members.iter().map(|n| sim(n.as_str())).fold(0.0, f64::max);
            let overlap = members.len();
            overlaps.push((community, overlap, best));
        }
        let max_overlap = overlaps.iter().map(|(_, n, _)| *n).max().unwrap_or(0) as f64;
        for (community, overlap, best) in overlaps {
            let proximity = 0.5 * normalize(overlap as f64, max_overlap)
                + 0.5 * (community.rating() / 10.0).clamp(0.0, 1.0);
            reports.push(Piece {
                score: blend(best, proximity),
                key: community.id.clone(),
                cells: vec![community.report_string.clone()],
            });
        }
        let mut reports = rank_pieces(reports);
        if param.local_community_single_one {
            reports.truncate(1);
        }

        let text = |p: &Piece| p.text();
        let mut context = LocalContext {
            reports: truncate_by_tokens(
                &self.tokenizer,
                reports,
                param.local_max_token_for_community_report,
                text,
            ),
            entities: truncate_by_tokens(
                &self.tokenizer,
                entities,
                param.local_max_token_for_local_context,
                text,
            ),
            relations: truncate_by_tokens(
                &self.tokenizer,
                relation_pieces,
                param.local_max_token_for_local_context,
                text,
            ),
            sources: truncate_by_tokens(
                &self.tokenizer,
                sources,
                param.local_max_token_for_text_unit,
                text,
            ),
        };

        loop {
            if context.is_empty() {
                return Ok(None);
            }
            let rendered = context.render();
            if self.tokenizer.count(&rendered) <= param.max_context_tokens {
                return Ok(Some(rendered));
            }
            context.pop_lowest();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn piece(score: f64, key: &str) -> Piece {
        Piece {
            score,
            key: key.to_string(),
            cells: vec![key.to_string()],
        }
    }

    #[test]
    fn test_pop_lowest_takes_global_minimum() {
        let mut context = LocalContext {
            reports: vec![piece(0.9, "r1"), piece(0.5, "r2")],
            entities: vec![piece(0.8, "e1"), piece(0.2, "e2")],
            relations: vec![],
            sources: vec![piece(0.3, "s1")],
        };
        assert!(context.pop_lowest());
        assert_eq!(context.entities.len(), 1);
        assert!(context.pop_lowest());
        assert!(context.sources.is_empty());
        assert!(context.pop_lowest());
        assert_eq!(context.reports.len(), 1);
    }

    #[test]
    fn test_render_has_all_sections() {
        let context = LocalContext {
            entities: vec![piece(1.0, "alice")],
            ..Default::default()
        };
        let rendered = context.render();
        for title in ["-----Reports-----", "-----Entities-----", "-----Relationships-----", "-----Sources-----"] {
            assert!(rendered.contains(title));
        }
        assert!(rendered.contains("0,\talice"));
    }

    #[test]
    fn test_rank_pieces_breaks_ties_by_key() {
        let ranked = rank_pieces(vec![piece(0.5, "b"), piece(0.5, "a"), piece(0.9, "c")]);
        let keys: Vec<&str> = ranked.iter().map(|p| p.key.as_str()).collect();
        assert_eq!(keys, vec!["c", "a", "b"]);
    }
}
