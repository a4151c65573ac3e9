//! Communities and their generated reports

use crate::clustering::Cluster;
use crate::entity::Entity;
use crate::hashing::{hash_hex, hash_parts};
use crate::relation::Relation;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One supporting finding of a community report
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Finding {
    pub summary: String,
    #[serde(default)]
    pub explanation: String,
}

/// Structured report generated for one community
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CommunityReport {
    pub title: String,
    #[serde(default)]
    pub summary: String,
    /// Importance score, 0 to 10
    #[serde(default)]
    pub rating: f64,
    #[serde(default)]
    pub rating_explanation: String,
    #[serde(default)]
    pub findings: Vec<Finding>,
}

impl CommunityReport {
    /// Render the report as markdown, the form fed back into prompts.
    pub fn to_markdown(&self) -> String {
        let mut out = format!("# {}\n\n{}\n", self.title, self.summary);
        for finding in &self.findings {
            out.push_str(&format!("\n## {}\n\n{}\n", finding.summary, finding.explanation));
        }
        out
    }
}

/// A community at one level of the hierarchy, with its cached report
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Community {
    /// `"{level}-{index}"`
    pub id: String,
    pub level: usize,
    pub title: String,
    /// Member entity ids, sorted
    pub nodes: Vec<String>,
    /// Relations with both endpoints inside the community
    #[serde(default)]
    pub edges: Vec<(String, String)>,
    /// Union of the members' provenance chunks
    #[serde(default)]
    pub chunk_ids: Vec<String>,
    /// Chunk count normalized to the largest community
    #[serde(default)]
    pub occurrence: f64,
    /// Size plus internal edge weight, normalized to the largest community
    #[serde(default)]
    pub rank: f64,
    #[serde(default)]
    pub sub_communities: Vec<String>,
    /// Key of the cached report; changes when membership or descriptions change
    #[serde(default)]
    pub report_key: String,
    #[serde(default)]
    pub report: Option<CommunityReport>,
    #[serde(default)]
    pub report_string: String,
}

impl Community {
    pub fn rating(&self) -> f64 {
        self.report.as_ref().map(|r| r.rating).unwrap_or(0.0)
    }

    pub fn attach_report(&mut self, report: CommunityReport) {
        self.report_string = report.to_markdown();
        self.report = Some(report);
    }
}

/// Cache key over the sorted member ids and a hash of each member's description.
pub fn report_cache_key<'a, I>(members: I) -> String
where
    I: IntoIterator<Item = &'a Entity>,
{
    let sorted: BTreeMap<&str, String> = members
        .into_iter()
        .map(|e| (e.id.as_str(), hash_hex(&e.description)))
        .collect();
    hash_parts(sorted.into_iter().flat_map(|(id, h)| [id.to_string(), h]))
}

/// Turn clusters into community records with rank, occurrence and report keys.
/// Reports are not attached here.
pub fn build_communities(
    clusters: &[Cluster],
    entities: &BTreeMap<String, Entity>,
    relations: &[Relation],
) -> Vec<Community> {
    let mut communities: Vec<Community> = clusters
        .iter()
        .map(|cluster| {
            let members: BTreeSet<&str> = cluster.members.iter().map(String::as_str).collect();
            let mut edges = Vec::new();
            let mut internal_weight = 0.0;
            for relation in relations {
                if members.contains(relation.src_id.as_str())
                    && members.contains(relation.tgt_id.as_str())
                {
                    edges.push(relation.key());
                    internal_weight += relation.weight;
                }
            }
            let chunk_ids: BTreeSet<String> = cluster
                .members
                .iter()
                .filter_map(|m| entities.get(m))
                .flat_map(|e| e.source_ids.iter().cloned())
                .collect();

            Community {
                id: cluster.id.clone(),
                level: cluster.level,
                title: format!("Cluster {}", cluster.id),
                nodes: cluster.members.clone(),
                edges,
                chunk_ids: chunk_ids.into_iter().collect(),
                occurrence: 0.0,
                rank: cluster.members.len() as f64 + internal_weight,
                sub_communities: cluster.children.clone(),
                report_key: report_cache_key(
                    cluster.members.iter().filter_map(|m| entities.get(m)),
                ),
                report: None,
                report_string: String::new(),
            }
        })
        .collect();

    let max_rank = communities.iter().map(|c| c.rank).fold(0.0, f64::max);
    let max_chunks = communities.iter().map(|c| c.chunk_ids.len()).max().unwrap_or(0);
    for community in &mut communities {
        if max_rank > 0.0 {
            community.rank /= max_rank;
        }
        if max_chunks > 0 {
            community.occurrence = community.chunk_ids.len() as f64 / max_chunks as f64;
        }
    }
    communities
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(name: &str, desc: &str, chunks: &[&str]) -> Entity {
        let mut e = Entity::new(name);
        e.description = desc.to_string();
        e.source_ids = chunks.iter().map(|c| c.to_string()).collect();
        e
    }

    #[test]
    fn test_report_key_tracks_descriptions() {
        let a = entity("alice", "engineer", &[]);
        let b = entity("bob", "manager", &[]);
        let k1 = report_cache_key([&a, &b]);
        let k2 = report_cache_key([&b, &a]);
        assert_eq!(k1, k2);

        let b2 = entity("bob", "director", &[]);
        assert_ne!(k1, report_cache_key([&a, &b2]));
    }

    #[test]
    fn test_build_communities_rank_and_occurrence() {
        let mut entities = BTreeMap::new();
        for e in [
            entity("alice", "a", &["c1"]),
            entity("bob", "b", &["c1", "c2"]),
            entity("carol", "c", &["c3"]),
        ] {
            entities.insert(e.id.clone(), e);
        }
        let mut rel = Relation::new("alice", "bob");
        rel.weight = 2.0;
        let clusters = vec![
            Cluster {
                id: "0-0".into(),
                level: 0,
                members: vec!["alice".into(), "bob".into()],
                children: vec![],
            },
            Cluster {
                id: "0-1".into(),
                level: 0,
                members: vec!["carol".into()],
                children: vec![],
            },
        ];
        let communities = build_communities(&clusters, &entities, &[rel]);
        assert_eq!(communities[0].rank, 1.0);
        assert_eq!(communities[1].rank, 0.25);
        assert_eq!(communities[0].chunk_ids, vec!["c1", "c2"]);
        assert_eq!(communities[0].occurrence, 1.0);
        assert_eq!(communities[1].occurrence, 0.5);
        assert_eq!(communities[0].edges, vec![("alice".to_string(), "bob".to_string())]);
    }

    #[test]
    fn test_report_markdown() {
        let report = CommunityReport {
            title: "Acme".into(),
            summary: "Employees of Acme".into(),
            rating: 5.0,
            rating_explanation: "moderate".into(),
            findings: vec![Finding {
                summary: "Alice".into(),
                explanation: "works there".into(),
            }],
        };
        let md = report.to_markdown();
        assert!(md.starts_with("# Acme"));
        assert!(md.contains("## Alice"));
    }
}
