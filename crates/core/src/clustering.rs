//! Deterministic hierarchical community detection
//!
//! Louvain-style local moving on a weighted graph, followed by a refinement
//! step that splits every community into its connected components, then
//! aggregation into a coarser graph. Each aggregation yields one more level;
//! level 0 is the finest partition.
//!
//! Determinism: nodes are visited in index order, candidate communities in
//! ascending label order, and a move happens only on a strictly positive gain.

use crate::graph::GraphView;
use crate::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

const MAX_PASSES: usize = 64;
const GAIN_EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusteringConfig {
    /// Upper bound on the size of finest-level communities
    pub max_cluster_size: usize,
    /// Maximum number of hierarchy levels
    pub max_levels: usize,
    /// Modularity resolution; higher values give smaller communities
    pub resolution: f64,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            max_cluster_size: 10,
            max_levels: 4,
            resolution: 1.0,
        }
    }
}

impl ClusteringConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_cluster_size == 0 {
            return Err(CoreError::InvalidClustering(
                "max_cluster_size must be at least 1".into(),
            ));
        }
        if self.max_levels == 0 {
            return Err(CoreError::InvalidClustering(
                "max_levels must be at least 1".into(),
            ));
        }
        if !(self.resolution.is_finite() && self.resolution > 0.0) {
            return Err(CoreError::InvalidClustering(format!(
                "resolution must be positive, got {}",
                self.resolution
            )));
        }
        Ok(())
    }
}

/// One community at one level of the hierarchy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Cluster {
    /// `"{level}-{index}"`
    pub id: String,
    pub level: usize,
    /// Member node ids, sorted
    pub members: Vec<String>,
    /// Ids of the level below that this cluster aggregates
    pub children: Vec<String>,
}

pub fn cluster_id(level: usize, index: usize) -> String {
    format!("{}-{}", level, index)
}

/// Weighted graph over dense indices; used for every level.
struct LevelGraph {
    adjacency: Vec<Vec<(usize, f64)>>,
    self_loops: Vec<f64>,
    sizes: Vec<usize>,
}

impl LevelGraph {
    fn len(&self) -> usize {
        self.adjacency.len()
    }

    fn strength(&self, i: usize) -> f64 {
        self.adjacency[i].iter().map(|(_, w)| w).sum::<f64>() + 2.0 * self.self_loops[i]
    }

    /// Collapse communities into single nodes.
    fn aggregate(&self, labels: &[usize], count: usize) -> LevelGraph {
        let mut rows: Vec<BTreeMap<usize, f64>> = vec![BTreeMap::new(); count];
        let mut self_loops = vec![0.0; count];
        let mut sizes = vec![0; count];
        for i in 0..self.len() {
            let ci = labels[i];
            sizes[ci] += self.sizes[i];
            self_loops[ci] += self.self_loops[i];
            for &(j, w) in &self.adjacency[i] {
                let cj = labels[j];
                if ci == cj {
                    // Each internal edge is seen from both ends.
                    if i < j {
                        self_loops[ci] += w;
                    }
                } else {
                    *rows[ci].entry(cj).or_insert(0.0) += w;
                }
            }
        }
        LevelGraph {
            adjacency: rows.into_iter().map(|r| r.into_iter().collect()).collect(),
            self_loops,
            sizes,
        }
    }
}

/// Local moving phase. Returns community labels renumbered by first member.
fn local_moving(graph: &LevelGraph, resolution: f64, size_cap: Option<usize>) -> Vec<usize> {
    let n = graph.len();
    let strengths: Vec<f64> = (0..n).map(|i| graph.strength(i)).collect();
    let two_m: f64 = strengths.iter().sum();
    let mut labels: Vec<usize> = (0..n).collect();
    if two_m <= 0.0 {
        return labels;
    }

    let mut totals = strengths.clone();
    let mut sizes = graph.sizes.clone();

    for _ in 0..MAX_PASSES {
        let mut moved = false;
        for i in 0..n {
            let current = labels[i];
            let k_i = strengths[i];

            let mut links: BTreeMap<usize, f64> = BTreeMap::new();
            for &(j, w) in &graph.adjacency[i] {
                if j != i {
                    *links.entry(labels[j]).or_insert(0.0) += w;
                }
            }

            totals[current] -= k_i;
            sizes[current] -= graph.sizes[i];

            let gain = |c: usize, w: f64| w - resolution * totals[c] * k_i / two_m;
            let mut best = current;
            let mut best_gain = gain(current, links.get(&current).copied().unwrap_or(0.0));
            for (&c, &w) in &links {
                if c == current {
                    continue;
                }
                if let Some(cap) = size_cap {
                    if sizes[c] + graph.sizes[i] > cap {
                        continue;
                    }
                }
                let g = gain(c, w);
                if g > best_gain + GAIN_EPSILON {
                    best = c;
                    best_gain = g;
                }
            }

            totals[best] += k_i;
            sizes[best] += graph.sizes[i];
            if best != current {
                labels[i] = best;
                moved = true;
            }
        }
        if !moved {
            break;
        }
    }

    renumber(&labels)
}

/// Split each community into connected components of its induced subgraph.
fn refine(graph: &LevelGraph, labels: &[usize]) -> Vec<usize> {
    let n = graph.len();
    let mut component = vec![usize::MAX; n];
    let mut next = 0;
    for start in 0..n {
        if component[start] != usize::MAX {
            continue;
        }
        component[start] = next;
        let mut queue = VecDeque::from([start]);
        while let Some(i) = queue.pop_front() {
            for &(j, _) in &graph.adjacency[i] {
                if component[j] == usize::MAX && labels[j] == labels[i] {
                    component[j] = next;
                    queue.push_back(j);
                }
            }
        }
        next += 1;
    }
    renumber(&component)
}

/// Relabel so that communities are numbered by their smallest member.
fn renumber(labels: &[usize]) -> Vec<usize> {
    let mut mapping: BTreeMap<usize, usize> = BTreeMap::new();
    labels
        .iter()
        .map(|l| {
            let fresh = mapping.len();
            *mapping.entry(*l).or_insert(fresh)
        })
        .collect()
}

fn label_count(labels: &[usize]) -> usize {
    labels.iter().max().map(|m| m + 1).unwrap_or(0)
}

/// Partition `graph` into a hierarchy of communities.
///
/// Every level is a covering of the node set. Level 0 always exists for a
/// non-empty graph; coarser levels are added while aggregation still merges
/// communities, up to `max_levels`.
pub fn hierarchical_clusters(graph: &GraphView, config: &ClusteringConfig) -> Result<Vec<Cluster>> {
    config.validate()?;
    if graph.is_empty() {
        return Ok(Vec::new());
    }

    let node_ids: Vec<String> = graph.node_ids().map(str::to_string).collect();
    let mut level_graph = LevelGraph {
        adjacency: graph.adjacency(),
        self_loops: vec![0.0; node_ids.len()],
        sizes: vec![1; node_ids.len()],
    };

    // Members of each node of the current level graph, as original node indices.
    let mut node_members: Vec<Vec<usize>> = (0..node_ids.len()).map(|i| vec![i]).collect();
    let mut clusters = Vec::new();

    for level in 0..config.max_levels {
        let cap = (level == 0).then_some(config.max_cluster_size);
        let labels = refine(&level_graph, &local_moving(&level_graph, config.resolution, cap));
        let count = label_count(&labels);
        if level > 0 && count == level_graph.len() {
            break;
        }

        let mut members: Vec<Vec<usize>> = vec![Vec::new(); count];
        let mut children: Vec<Vec<String>> = vec![Vec::new(); count];
        for (node, &label) in labels.iter().enumerate() {
            members[label].extend(&node_members[node]);
            if level > 0 {
                children[label].push(cluster_id(level - 1, node));
            }
        }

        for (index, (member_idx, children)) in members.iter_mut().zip(children).enumerate() {
            member_idx.sort_unstable();
            clusters.push(Cluster {
                id: cluster_id(level, index),
                level,
                members: member_idx.iter().map(|&i| node_ids[i].clone()).collect(),
                children,
            });
        }

        level_graph = level_graph.aggregate(&labels, count);
        node_members = members;

        if count == 1 {
            break;
        }
    }

    Ok(clusters)
}
