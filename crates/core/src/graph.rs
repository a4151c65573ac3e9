//! Arena view of the entity graph
//!
//! Nodes live in a `petgraph` arena and are addressed by index; the id map
//! is a `BTreeMap` so node indices follow sorted entity-id order.

use petgraph::graph::{NodeIndex, UnGraph};
use petgraph::visit::EdgeRef;
use std::collections::{BTreeMap, BTreeSet};

/// Read-only, weighted, undirected snapshot of the entity graph
#[derive(Debug, Clone, Default)]
pub struct GraphView {
    graph: UnGraph<String, f64>,
    index: BTreeMap<String, NodeIndex>,
}

impl GraphView {
    /// Build a view from node ids and weighted edges. Unknown endpoints are
    /// added as nodes, parallel edges are summed, self-loops and negative
    /// weights are ignored.
    pub fn new<N, E>(nodes: N, edges: E) -> Self
    where
        N: IntoIterator<Item = String>,
        E: IntoIterator<Item = (String, String, f64)>,
    {
        let edges: Vec<_> = edges.into_iter().collect();
        let mut ids: BTreeSet<String> = nodes.into_iter().collect();
        for (a, b, _) in &edges {
            ids.insert(a.clone());
            ids.insert(b.clone());
        }

        let mut graph = UnGraph::with_capacity(ids.len(), edges.len());
        let mut index = BTreeMap::new();
        for id in ids {
            let idx = graph.add_node(id.clone());
            index.insert(id, idx);
        }

        for (a, b, weight) in edges {
            if a == b {
                continue;
            }
            let (ia, ib) = (index[&a], index[&b]);
            let weight = weight.max(0.0);
            match graph.find_edge(ia, ib) {
                Some(e) => graph[e] += weight,
                None => {
                    graph.add_edge(ia, ib, weight);
                }
            }
        }

        Self { graph, index }
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Node ids in index (sorted) order
    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.graph.node_indices().map(move |i| self.graph[i].as_str())
    }

    /// Adjacency lists by node index, each sorted by neighbor index
    pub(crate) fn adjacency(&self) -> Vec<Vec<(usize, f64)>> {
        self.graph
            .node_indices()
            .map(|i| {
                let mut row: Vec<(usize, f64)> = self
                    .graph
                    .edges(i)
                    .map(|e| {
                        let other = if e.source() == i { e.target() } else { e.source() };
                        (other.index(), *e.weight())
                    })
                    .collect();
                row.sort_by_key(|(j, _)| *j);
                row
            })
            .collect()
    }
}
