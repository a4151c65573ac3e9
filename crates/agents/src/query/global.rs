use super::{AnswerKind, QueryAnswer, QueryEngine};
use crate::config::QueryParam;
use crate::json::{array_field, number_field, parse_object, string_field};
use crate::llm::{CompletionRequest, RequestKind};
use crate::prompts;
use crate::Result;
use futures::stream::{self, StreamExt};
use kgrag_core::context::{csv_table, group_by_tokens, truncate_by_tokens, CSV_SEPARATOR};
use kgrag_core::Community;
use serde_json::Value;
use tracing::{debug, info, warn};

const REPORT_HEADER: [&str; 4] = ["id", "content", "rating", "importance"];

/// One key point returned by a map call
#[derive(Debug, Clone, PartialEq)]
pub struct AnalystPoint {
    pub analyst: usize,
    pub description: String,
    pub score: f64,
}

impl AnalystPoint {
    fn render(&self) -> String {
        format!(
            "----Analyst {}----\nImportance Score: {}\n{}\n",
            self.analyst, self.score, self.description
        )
    }
}

/// Map-call output: `{"points": [{"description", "score"}]}`
pub fn parse_points(reply: &str, analyst: usize) -> Vec<AnalystPoint> {
    let Some(object) = parse_object(reply) else {
        return Vec::new();
    };
    let value = Value::Object(object);
    array_field(&value, &["points"])
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    Some(AnalystPoint {
                        analyst,
                        description: string_field(item, &["description"])?,
                        score: number_field(item, &["score"]).unwrap_or(1.0),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn report_row(community: &Community) -> Vec<String> {
    vec![
        community.id.clone(),
        community.report_string.clone(),
        format!("{}", community.rating()),
        format!("{:.3}", community.occurrence),
    ]
}

impl QueryEngine {
    pub(crate) async fn global_query(&self, query: &str, param: &QueryParam) -> Result<QueryAnswer> {
        let communities = self.select_communities(param).await?;
        if communities.is_empty() {
            debug!("No community reports to consult");
            return Ok(QueryAnswer::no_context());
        }

        let points = self.map_communities(query, param, communities).await;
        let budget = param
            .global_max_token_for_community_report
            .min(param.max_context_tokens);
        let packed = truncate_by_tokens(&self.tokenizer, points, budget, AnalystPoint::render);
        let context = self.fit_parts(
            packed.iter().map(AnalystPoint::render).collect(),
            "",
            budget,
        );
        if context.is_empty() {
            return Ok(QueryAnswer::no_context());
        }

        if param.only_need_context {
            return Ok(QueryAnswer {
                text: context,
                kind: AnswerKind::Context,
            });
        }
        let text = self
            .best
            .complete(
                CompletionRequest::new(RequestKind::GlobalReduce, query).with_system_prompt(
                    prompts::global_reduce_system(&context, &param.response_type),
                ),
            )
            .await?;
        Ok(QueryAnswer {
            text,
            kind: AnswerKind::Answer,
        })
    }

    /// Reported communities up to `param.level`, best ranked first, capped at
    /// `global_max_consider_community` and filtered by minimum rating.
    pub async fn select_communities(&self, param: &QueryParam) -> Result<Vec<Community>> {
        let mut communities: Vec<Community> = self
            .workspace
            .graph
            .communities()
            .await?
            .into_iter()
            .filter(|c| c.level <= param.level && c.report.is_some())
            .collect();
        communities.sort_by(|a, b| {
            b.rank
                .total_cmp(&a.rank)
                .then_with(|| b.rating().total_cmp(&a.rating()))
                .then_with(|| a.id.cmp(&b.id))
        });
        communities.truncate(param.global_max_consider_community);
        communities.retain(|c| c.rating() >= param.global_min_community_rating);
        Ok(communities)
    }

    /// Ask each group of reports for scored key points. Failed groups are
    /// skipped; points with a non-positive score are discarded.
    async fn map_communities(
        &self,
        query: &str,
        param: &QueryParam,
        communities: Vec<Community>,
    ) -> Vec<AnalystPoint> {
        let budget = param
            .global_max_token_for_community_report
            .min(param.max_context_tokens);
        let header_tokens = self.tokenizer.count(&REPORT_HEADER.join(CSV_SEPARATOR)) + 1;
        let row_budget = budget.saturating_sub(header_tokens);

        let rows: Vec<Vec<String>> = communities
            .iter()
            .map(|c| {
                let mut row = report_row(c);
                row[1] = self.tokenizer.truncate(&row[1], row_budget / 2);
                row
            })
            .collect();
        let groups = group_by_tokens(&self.tokenizer, rows, row_budget, |row| {
            format!("{}\n", row.join(CSV_SEPARATOR))
        });
        info!(
            "Global query over {} communities in {} map calls",
            communities.len(),
            groups.len()
        );

        let replies: Vec<(usize, Result<String>)> = stream::iter(groups.into_iter().enumerate())
            .map(|(analyst, rows)| async move {
                let context = csv_table(&REPORT_HEADER, &rows);
                let reply = self
                    .best
                    .complete(
                        CompletionRequest::new(RequestKind::GlobalMap, query)
                            .with_system_prompt(prompts::global_map_system(&context))
                            .with_json_response(),
                    )
                    .await;
                (analyst, reply)
            })
            .buffer_unordered(self.best.max_async())
            .collect()
            .await;

        let mut points = Vec::new();
        for (analyst, reply) in replies {
            match reply {
                Ok(reply) => points.extend(parse_points(&reply, analyst)),
                Err(e) => warn!("Map call {} failed: {}", analyst, e),
            }
        }
        points.retain(|p| p.score > 0.0);
        points.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.analyst.cmp(&b.analyst))
                .then_with(|| a.description.cmp(&b.description))
        });
        points
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_points() {
        let points = parse_points(
            r#"{"points":[{"description":"Acme employs Alice","score":80},{"score":10},{"description":"nothing","score":0}]}"#,
            2,
        );
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].score, 80.0);
        assert_eq!(points[0].analyst, 2);
        assert!(parse_points("no idea", 0).is_empty());
    }

    #[test]
    fn test_point_render() {
        let point = AnalystPoint {
            analyst: 0,
            description: "d".into(),
            score: 5.0,
        };
        assert_eq!(point.render(), "----Analyst 0----\nImportance Score: 5\nd\n");
    }
}
