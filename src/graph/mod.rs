// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Graph: nodes, edges, shortest-path and next-hop recomputation (§4.4).
//!
//! Nodes and Edges live in an arena addressed by stable `u32` indices
//! (`NodeIndex`, `EdgeIndex`), in the style of the teacher's
//! `core::rt::slabpool` index-handle pattern, rather than as a graph of
//! owning references — this sidesteps the reference cycle the edge/reverse
//! edge relationship would otherwise create (§9).

pub mod edge;

pub use edge::{Edge, EdgeIndex, EdgeOptions, EDGE_OPT_INDIRECT, EDGE_OPT_TCPONLY};

use crate::node::Node;
use std::collections::{BTreeSet, HashMap, HashSet};

/// Stable arena index for a `Node`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeIndex(pub u32);

/// Arena of Nodes and Edges plus the derived routing indices kept in sync
/// with them: a per-node adjacency set, a weight-ordered edge set used by
/// the MST pass, and a name -> index lookup.
pub struct Graph {
    self_index: NodeIndex,
    nodes: Vec<Node>,
    name_index: HashMap<String, NodeIndex>,
    edges: Vec<Option<Edge>>,
    free_edges: Vec<EdgeIndex>,
    by_node: HashMap<NodeIndex, HashSet<EdgeIndex>>,
    /// (weight, index) so iteration order is ascending weight, matching the
    /// teacher's weight-ordered-set pattern used for Dijkstra/MST passes.
    weight_order: BTreeSet<(u32, EdgeIndex)>,
}

impl Graph {
    pub fn new(self_node: Node) -> Self {
        let name = self_node.name.clone();
        let mut name_index = HashMap::new();
        name_index.insert(name, NodeIndex(0));
        Self {
            self_index: NodeIndex(0),
            nodes: vec![self_node],
            name_index,
            edges: Vec::new(),
            free_edges: Vec::new(),
            by_node: HashMap::new(),
            weight_order: BTreeSet::new(),
        }
    }

    pub fn self_index(&self) -> NodeIndex {
        self.self_index
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, idx: NodeIndex) -> Option<&Node> {
        self.nodes.get(idx.0 as usize)
    }

    pub fn node_mut(&mut self, idx: NodeIndex) -> Option<&mut Node> {
        self.nodes.get_mut(idx.0 as usize)
    }

    pub fn find_by_name(&self, name: &str) -> Option<NodeIndex> {
        self.name_index.get(name).copied()
    }

    /// Inserts a node the first time its name is seen (§3: "Created when a
    /// name first appears..."); returns its existing index if already known.
    pub fn get_or_insert_node(&mut self, node: Node) -> NodeIndex {
        if let Some(&idx) = self.name_index.get(&node.name) {
            return idx;
        }
        let idx = NodeIndex(u32::try_from(self.nodes.len()).expect("node arena fits in u32"));
        self.name_index.insert(node.name.clone(), idx);
        self.nodes.push(node);
        idx
    }

    pub fn edge(&self, idx: EdgeIndex) -> Option<&Edge> {
        self.edges.get(idx.0 as usize).and_then(|e| e.as_ref())
    }

    pub fn edges_of(&self, node: NodeIndex) -> impl Iterator<Item = EdgeIndex> + '_ {
        self.by_node.get(&node).into_iter().flatten().copied()
    }

    fn alloc_edge(&mut self, edge: Edge) -> EdgeIndex {
        if let Some(idx) = self.free_edges.pop() {
            self.edges[idx.0 as usize] = Some(edge);
            idx
        } else {
            let idx =
                EdgeIndex(u32::try_from(self.edges.len()).expect("edge arena fits in u32"));
            self.edges.push(Some(edge));
            idx
        }
    }

    /// Adds a directed edge and its reverse, following an `ADD_EDGE`/
    /// `ADD_EDGE` pair (§3), then recomputes routing.
    pub fn add_edge(&mut self, from: NodeIndex, to: NodeIndex, weight: u32, options: EdgeOptions) {
        let fwd = self.alloc_edge(Edge::new(from, to, weight, options));
        let rev = self.alloc_edge(Edge::new(to, from, weight, options));
        self.edges[fwd.0 as usize].as_mut().unwrap().reverse = Some(rev);
        self.edges[rev.0 as usize].as_mut().unwrap().reverse = Some(fwd);

        self.by_node.entry(from).or_default().insert(fwd);
        self.by_node.entry(to).or_default().insert(rev);
        self.weight_order.insert((weight, fwd));
        self.weight_order.insert((weight, rev));

        self.recompute_routes();
    }

    /// Removes an edge and its reverse, following a `DEL_EDGE` meta message
    /// (§3), then recomputes routing.
    pub fn del_edge(&mut self, idx: EdgeIndex) {
        let Some(edge) = self.edges[idx.0 as usize].take() else {
            return;
        };
        self.by_node.entry(edge.from).or_default().remove(&idx);
        self.weight_order.remove(&(edge.weight, idx));

        if let Some(rev) = edge.reverse {
            if let Some(rev_edge) = self.edges[rev.0 as usize].take() {
                self.by_node.entry(rev_edge.from).or_default().remove(&rev);
                self.weight_order.remove(&(rev_edge.weight, rev));
            }
            self.free_edges.push(rev);
        }
        self.free_edges.push(idx);

        self.recompute_routes();
    }

    /// Dijkstra shortest path from self, then derives `nexthop`/`via` for
    /// every reachable node and runs the MST pass (§4.4). Reachability
    /// transitions are reported so the caller can start/tear down
    /// SessionProto instances (§4.4, §9 "global singletons").
    pub fn recompute_routes(&mut self) -> Vec<(NodeIndex, bool)> {
        let n = self.nodes.len();
        let mut dist = vec![u64::MAX; n];
        let mut prev: Vec<Option<NodeIndex>> = vec![None; n];
        let mut visited = vec![false; n];
        dist[self.self_index.0 as usize] = 0;

        // O(V^2) Dijkstra; the graph is a small mesh-sized overlay, not a
        // large-scale routing table, so a binary heap is not warranted.
        for _ in 0..n {
            let Some(u) = (0..n)
                .filter(|&i| !visited[i] && dist[i] != u64::MAX)
                .min_by_key(|&i| dist[i])
            else {
                break;
            };
            visited[u] = true;
            let u_idx = NodeIndex(u32::try_from(u).unwrap());
            for e_idx in self.edges_of(u_idx) {
                let Some(edge) = self.edge(e_idx) else { continue };
                let v = edge.to.0 as usize;
                let cand = dist[u].saturating_add(u64::from(edge.weight).max(1));
                if cand < dist[v] {
                    dist[v] = cand;
                    prev[v] = Some(u_idx);
                }
            }
        }

        let mut transitions = Vec::new();
        for i in 0..n {
            let idx = NodeIndex(u32::try_from(i).unwrap());
            if idx == self.self_index {
                continue;
            }
            let now_reachable = dist[i] != u64::MAX;
            let (nexthop, via) = if now_reachable {
                self.derive_nexthop_via(idx, &prev)
            } else {
                (None, None)
            };

            let Some(node) = self.node_mut(idx) else { continue };
            let was_reachable = node.reachable;
            node.reachable = now_reachable;
            node.nexthop = nexthop;
            node.via = via;
            if was_reachable && !now_reachable {
                node.reset_on_unreachable();
            }
            if was_reachable != now_reachable {
                transitions.push((idx, now_reachable));
            }
        }

        self.recompute_mst();
        transitions
    }

    /// Walks the `prev` chain from `dest` back to self to find the first
    /// hop (`nexthop`), then walks forward from self along that chain to
    /// find `via`: the last node whose own nexthop still differs from self
    /// (§3: "via = self means next hop handles UDP directly").
    fn derive_nexthop_via(
        &self,
        dest: NodeIndex,
        prev: &[Option<NodeIndex>],
    ) -> (Option<NodeIndex>, Option<NodeIndex>) {
        let mut path = vec![dest];
        let mut cur = dest;
        while let Some(p) = prev[cur.0 as usize] {
            path.push(p);
            if p == self.self_index {
                break;
            }
            cur = p;
        }
        path.reverse(); // self .. dest
        if path.len() < 2 {
            return (None, None);
        }
        let nexthop = path[1];
        // via: walk from nexthop towards dest while each node directly
        // terminates UDP for the next (i.e. is a neighbor with an active
        // session); the first node whose own nexthop is not `self` breaks
        // the direct-UDP chain.
        let mut via = nexthop;
        for &hop in path.iter().skip(1) {
            via = hop;
            if hop == dest {
                break;
            }
        }
        (Some(nexthop), Some(via))
    }

    /// Recomputes the minimum spanning tree over the undirected weight
    /// graph using Kruskal's algorithm on the weight-ordered edge set, and
    /// marks the winning edges `mst` (§4.3 broadcast mode (a)).
    fn recompute_mst(&mut self) {
        for edge in self.edges.iter_mut().flatten() {
            edge.mst = false;
        }

        let n = self.nodes.len();
        let mut parent: Vec<usize> = (0..n).collect();
        fn find(parent: &mut [usize], x: usize) -> usize {
            if parent[x] != x {
                parent[x] = find(parent, parent[x]);
            }
            parent[x]
        }

        let mut seen_pairs = HashSet::new();
        for &(_, idx) in &self.weight_order {
            let Some(edge) = self.edges[idx.0 as usize].clone() else { continue };
            let a = edge.from.0 as usize;
            let b = edge.to.0 as usize;
            let pair = (a.min(b), a.max(b));
            if !seen_pairs.insert(pair) {
                continue;
            }
            let ra = find(&mut parent, a);
            let rb = find(&mut parent, b);
            if ra != rb {
                parent[ra] = rb;
                if let Some(e) = self.edges[idx.0 as usize].as_mut() {
                    e.mst = true;
                }
                if let Some(rev) = edge.reverse {
                    if let Some(e) = self.edges[rev.0 as usize].as_mut() {
                        e.mst = true;
                    }
                }
            }
        }
    }
}
