// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Read-only introspection surface (§4.8), grounded in the teacher's
//! `admin` module (`AdminApi`, `MeshSnapshot`, `MetricsSnapshot`).
//!
//! `snapshot()` takes no lock beyond whatever guard the caller already holds
//! on the `Graph` it's handed — it never reaches into sockets or the submit
//! queue, so a CLI or status page can poll it as often as it likes.

use crate::graph::{EdgeOptions, Graph, NodeIndex};

/// One node's routing and link-health state, as seen by this instance.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSnapshot {
    pub name: String,
    pub reachable: bool,
    pub validkey: bool,
    pub udp_confirmed: bool,
    pub minmtu: usize,
    pub maxmtu: usize,
    pub rtt_ms: f32,
    pub bandwidth_bytes_per_sec: f32,
    pub loss: f32,
}

/// One directed adjacency, as advertised over a MetaChannel and currently
/// held in the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeSnapshot {
    pub from: String,
    pub to: String,
    pub weight: u32,
    pub options: EdgeOptions,
    pub mst: bool,
}

/// A point-in-time view of this instance's routing state (§4.8).
#[derive(Debug, Clone, PartialEq)]
pub struct MeshSnapshot {
    pub self_name: String,
    pub nodes: Vec<NodeSnapshot>,
    pub edges: Vec<EdgeSnapshot>,
}

/// Builds a `MeshSnapshot` from the current graph state.
pub fn snapshot(graph: &Graph) -> MeshSnapshot {
    let self_name = graph
        .node(graph.self_index())
        .map(|n| n.name.clone())
        .unwrap_or_default();

    let mut nodes = Vec::with_capacity(graph.node_count());
    let mut edges = Vec::new();
    for i in 0..graph.node_count() {
        let idx = NodeIndex(u32::try_from(i).expect("node arena index fits in u32"));
        let Some(node) = graph.node(idx) else { continue };
        nodes.push(NodeSnapshot {
            name: node.name.clone(),
            reachable: node.reachable,
            validkey: node.validkey,
            udp_confirmed: node.udp_confirmed,
            minmtu: node.mtu.minmtu(),
            maxmtu: node.mtu.maxmtu(),
            rtt_ms: node.mtu.rtt_ms(),
            bandwidth_bytes_per_sec: node.mtu.bandwidth_bytes_per_sec(),
            loss: node.mtu.loss(),
        });

        for edge_idx in graph.edges_of(idx) {
            let Some(edge) = graph.edge(edge_idx) else { continue };
            let from = graph.node(edge.from).map(|n| n.name.clone()).unwrap_or_default();
            let to = graph.node(edge.to).map(|n| n.name.clone()).unwrap_or_default();
            edges.push(EdgeSnapshot {
                from,
                to,
                weight: edge.weight,
                options: edge.options,
                mst: edge.mst,
            });
        }
    }

    MeshSnapshot { self_name, nodes, edges }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;

    fn graph_with(names: &[&str]) -> Graph {
        let mut names = names.iter();
        let self_name = names.next().unwrap();
        let mut g = Graph::new(Node::new_self((*self_name).into(), vec![]));
        for name in names {
            g.get_or_insert_node(Node::new((*name).to_string(), vec![]));
        }
        g
    }

    #[test]
    fn snapshot_reports_self_name_and_every_node() {
        let g = graph_with(&["self", "a", "b"]);
        let snap = snapshot(&g);
        assert_eq!(snap.self_name, "self");
        assert_eq!(snap.nodes.len(), 3);
        assert!(snap.nodes.iter().any(|n| n.name == "a" && !n.reachable));
    }

    #[test]
    fn snapshot_lists_edges_with_weight_and_mst_flag() {
        let mut g = graph_with(&["self", "a"]);
        let a = g.find_by_name("a").unwrap();
        g.add_edge(g.self_index(), a, 7, 0);
        let snap = snapshot(&g);
        assert_eq!(snap.edges.len(), 2); // forward + reverse half
        assert!(snap.edges.iter().all(|e| e.weight == 7 && e.mst));
    }
}
