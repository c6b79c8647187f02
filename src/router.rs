// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Destination lookup and dispatch decision (§4.3).
//!
//! Grounded in the teacher's `engine::router`/`engine::unicast_router` split
//! between "resolve a destination" and "hand the packet to a transport";
//! the RTPS-specific GUID/topic lookup is replaced with the mesh's
//! name -> `NodeIndex` -> nexthop/via chain that `Graph::recompute_routes`
//! already maintains.

use crate::error::{Error, Result};
use crate::graph::{Graph, NodeIndex};
use std::net::SocketAddr;

/// Length of each fixed name field in the on-wire mesh header (§4.3:
/// "source-name:16B, destination-name:16B, zero-padded"). A node's
/// validated name may be up to 64 chars (§3); only names that fit in 16
/// bytes can be addressed on the wire, which `encode_header` enforces.
pub const NAME_FIELD_LEN: usize = 16;

/// Total size of the mesh header that precedes every routed payload.
pub const HEADER_SIZE: usize = NAME_FIELD_LEN * 2;

/// Encodes the fixed-width, zero-padded mesh header (§4.3). Names longer
/// than `NAME_FIELD_LEN` cannot be represented on the wire even though
/// they pass `node::is_valid_name`; callers that only ever address
/// directly-configured short names never hit this.
pub fn encode_header(source: &str, destination: &str) -> Result<[u8; HEADER_SIZE]> {
    let mut header = [0u8; HEADER_SIZE];
    write_name_field(&mut header[0..NAME_FIELD_LEN], source)?;
    write_name_field(&mut header[NAME_FIELD_LEN..HEADER_SIZE], destination)?;
    Ok(header)
}

fn write_name_field(field: &mut [u8], name: &str) -> Result<()> {
    let bytes = name.as_bytes();
    if bytes.len() > field.len() {
        return Err(Error::NameInvalid(format!(
            "'{name}' does not fit in the {}-byte wire header field",
            field.len()
        )));
    }
    field[..bytes.len()].copy_from_slice(bytes);
    Ok(())
}

/// Decodes `(source, destination)` out of a buffer's leading
/// `HEADER_SIZE` bytes (§4.3 step 1: "Reject if len < header_size").
pub fn decode_header(buf: &[u8]) -> Result<(String, String)> {
    if buf.len() < HEADER_SIZE {
        return Err(Error::Protocol(format!(
            "packet shorter than header size ({} < {HEADER_SIZE})",
            buf.len()
        )));
    }
    let source = read_name_field(&buf[0..NAME_FIELD_LEN])?;
    let destination = read_name_field(&buf[NAME_FIELD_LEN..HEADER_SIZE])?;
    Ok((source, destination))
}

fn read_name_field(field: &[u8]) -> Result<String> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8(field[..end].to_vec())
        .map_err(|_| Error::Protocol("mesh header name field is not valid UTF-8".into()))
}

/// Outcome of routing one fully-formed packet (§4.3 steps 1-6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Destination is self; hand this payload to the application callback.
    DeliverLocal(Vec<u8>),
    /// Forward the payload toward `nexthop` using `decision` to pick the
    /// transport (the caller still needs `validkey`/session state from
    /// `nexthop` to actually seal and send it).
    Forward {
        nexthop: NodeIndex,
        decision: RouteDecision,
        payload: Vec<u8>,
    },
    /// Dropped, with a short reason for logging.
    Dropped(&'static str),
}

/// Runs the full §4.3 pipeline over one mesh-header-prefixed buffer:
/// length check, destination lookup, self-delivery, reachability check,
/// loop detection, and route resolution. Does not touch crypto or
/// sockets — `mesh.rs` turns a `Dispatch::Forward` into an actual send.
pub fn route_packet(graph: &Graph, source: NodeIndex, buf: &[u8]) -> Result<Dispatch> {
    if buf.len() < HEADER_SIZE {
        return Ok(Dispatch::Dropped("packet shorter than header size"));
    }
    let (_src_name, dest_name) = decode_header(buf)?;
    let payload = buf[HEADER_SIZE..].to_vec();

    let Some(dest_idx) = graph.find_by_name(&dest_name) else {
        return Ok(Dispatch::Dropped("unknown destination name"));
    };

    if dest_idx == graph.self_index() {
        return Ok(Dispatch::DeliverLocal(payload));
    }

    let dest = graph
        .node(dest_idx)
        .ok_or_else(|| Error::Internal("dangling destination index".into()))?;
    if !dest.reachable {
        return Ok(Dispatch::Dropped("destination unreachable"));
    }

    // A packet arriving from the very node we'd forward it back to is a
    // routing loop (§4.3, mirroring route.c's `via == source` check).
    if dest.nexthop == Some(source) {
        return Ok(Dispatch::Dropped("routing loop detected"));
    }

    match resolve(graph, &dest_name)? {
        RouteDecision::Unreachable => Ok(Dispatch::Dropped("destination unreachable")),
        decision => {
            let nexthop = dest
                .nexthop
                .ok_or_else(|| Error::Internal("reachable destination missing nexthop".into()))?;
            Ok(Dispatch::Forward { nexthop, decision, payload })
        }
    }
}

/// Minimum-spanning-tree broadcast fan-out (§4.3 broadcast mode (a)):
/// every active neighbor marked `mst`, except the one the packet arrived
/// from. `received_from` is `None` for locally-originated broadcasts.
pub fn mst_broadcast_targets(graph: &Graph, received_from: Option<NodeIndex>) -> Vec<NodeIndex> {
    let mut targets = Vec::new();
    for edge_idx in graph.edges_of(graph.self_index()) {
        let Some(edge) = graph.edge(edge_idx) else { continue };
        if !edge.mst || Some(edge.to) == received_from {
            continue;
        }
        if graph.node(edge.to).is_some_and(|n| n.reachable) {
            targets.push(edge.to);
        }
    }
    targets
}

/// Direct-mode broadcast fan-out (§4.3 broadcast mode (b)): every
/// reachable non-self node this instance can reach without a relay, i.e.
/// either it terminates UDP for itself (`via == nexthop == self`) or it is
/// itself the `via` for some other destination.
pub fn direct_broadcast_targets(graph: &Graph) -> Vec<NodeIndex> {
    let mut targets = Vec::new();
    for i in 0..graph.node_count() {
        let idx = NodeIndex(u32::try_from(i).unwrap());
        if idx == graph.self_index() {
            continue;
        }
        let Some(node) = graph.node(idx) else { continue };
        if !node.reachable {
            continue;
        }
        let direct_self = node.via == Some(graph.self_index()) && node.nexthop == Some(graph.self_index());
        let is_via_for_someone = node.via == Some(idx);
        if direct_self || is_via_for_someone {
            targets.push(idx);
        }
    }
    targets
}

/// Where an outgoing packet for a destination should go (§4.3, §4.6/§4.5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// Send the SPTPS datagram directly over UDP to this confirmed direct
    /// neighbor; the caller resolves the actual destination address via
    /// `udp::choose_address` rather than a fixed address stashed here.
    Udp(NodeIndex),
    /// No confirmed UDP path (yet); tunnel the record through the
    /// MetaChannel of this direct neighbor instead (§4.6 "UDP lost ->
    /// fall through to TCP tunneling").
    Tunnel(NodeIndex),
    /// Destination is known but currently unreachable in the graph.
    Unreachable,
}

/// Outcome of `route_data_packet` in the teacher's router; kept here purely
/// as the mesh-scoped analogue so call sites read the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteStatus {
    Delivered,
    Dropped,
}

/// Resolves a destination name to a `RouteDecision`, walking the nexthop
/// chain defensively to catch a corrupted graph before it becomes an
/// infinite loop (§8 "Routing loop-freedom": terminates in <= |nodes| hops).
pub fn resolve(graph: &Graph, dest_name: &str) -> Result<RouteDecision> {
    let dest_idx = graph
        .find_by_name(dest_name)
        .ok_or_else(|| Error::PeerUnreachable(dest_name.to_string()))?;

    let dest = graph
        .node(dest_idx)
        .ok_or_else(|| Error::Internal(format!("dangling node index for '{dest_name}'")))?;

    if !dest.reachable {
        return Ok(RouteDecision::Unreachable);
    }

    verify_loop_free(graph, dest_idx)?;

    match (dest.nexthop, dest.via) {
        (Some(nexthop), Some(via)) if via == dest_idx => {
            let via_node = graph
                .node(via)
                .ok_or_else(|| Error::Internal("dangling via index".into()))?;
            if via_node.udp_confirmed && via_node.address.is_some() {
                Ok(RouteDecision::Udp(via))
            } else {
                Ok(RouteDecision::Tunnel(nexthop))
            }
        }
        (Some(nexthop), _) => Ok(RouteDecision::Tunnel(nexthop)),
        _ => Ok(RouteDecision::Unreachable),
    }
}

/// Candidate addresses harvested from edges pointing back at `peer`, for
/// `udp::choose_address`'s unconfirmed-peer probing (§4.6). For each of
/// `peer`'s own advertised edges (`peer -> neighbor`), the paired reverse
/// edge (`neighbor -> peer`) carries the neighbor's advertised address for
/// reaching `peer` — that is the "reverse address" the heuristic probes.
pub fn reverse_addresses(graph: &Graph, peer: NodeIndex) -> Vec<SocketAddr> {
    let mut addrs = Vec::new();
    for edge_idx in graph.edges_of(peer) {
        let Some(edge) = graph.edge(edge_idx) else { continue };
        let Some(rev_idx) = edge.reverse else { continue };
        let Some(rev_edge) = graph.edge(rev_idx) else { continue };
        if let Some(addr) = rev_edge.address {
            addrs.push(addr);
        }
    }
    addrs
}

/// Walks `nexthop` from self toward `dest`, erroring instead of spinning if
/// a cycle is present. A correct `recompute_routes` never produces one;
/// this is a defensive bound, not the primary loop-freedom guarantee.
fn verify_loop_free(graph: &Graph, dest: NodeIndex) -> Result<()> {
    let max_hops = graph.node_count();
    let mut cur = graph.self_index();
    let mut hops = 0;
    while cur != dest {
        let Some(node) = graph.node(cur) else {
            return Err(Error::Internal("dangling node index while routing".into()));
        };
        let Some(next) = node.nexthop else {
            return Err(Error::PeerUnreachable("no nexthop toward destination".into()));
        };
        cur = next;
        hops += 1;
        if hops > max_hops {
            return Err(Error::Protocol("routing loop detected".into()));
        }
        if cur == graph.self_index() {
            return Err(Error::Protocol("routing loop returned to self".into()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;
    use std::net::{IpAddr, Ipv4Addr};

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
    fn unknown_name_is_peer_unreachable_error() {
        let g = graph_with(&["self"]);
        assert!(matches!(resolve(&g, "nobody"), Err(Error::PeerUnreachable(_))));
    }

    #[test]
    fn unreachable_known_node_resolves_to_unreachable_decision() {
        let g = graph_with(&["self", "a"]);
        let decision = resolve(&g, "a").unwrap();
        assert_eq!(decision, RouteDecision::Unreachable);
    }

    #[test]
    fn direct_neighbor_with_confirmed_udp_routes_over_udp() {
        let mut g = graph_with(&["self", "a"]);
        let a = g.find_by_name("a").unwrap();
        g.add_edge(g.self_index(), a, 1, 0);
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 655);
        {
            let node = g.node_mut(a).unwrap();
            node.address = Some(addr);
            node.udp_confirmed = true;
        }
        assert_eq!(resolve(&g, "a").unwrap(), RouteDecision::Udp(a));
    }

    #[test]
    fn direct_neighbor_without_confirmed_udp_falls_back_to_tunnel() {
        let mut g = graph_with(&["self", "a"]);
        let a = g.find_by_name("a").unwrap();
        g.add_edge(g.self_index(), a, 1, 0);
        assert_eq!(resolve(&g, "a").unwrap(), RouteDecision::Tunnel(a));
    }

    #[test]
    fn two_hop_destination_tunnels_through_the_nexthop() {
        let mut g = graph_with(&["self", "a", "b"]);
        let a = g.find_by_name("a").unwrap();
        let b = g.find_by_name("b").unwrap();
        g.add_edge(g.self_index(), a, 1, 0);
        g.add_edge(a, b, 1, 0);
        assert_eq!(resolve(&g, "b").unwrap(), RouteDecision::Tunnel(a));
    }

    #[test]
    fn header_round_trips_through_encode_and_decode() {
        let header = encode_header("alice", "bob").unwrap();
        assert_eq!(header.len(), HEADER_SIZE);
        let (source, destination) = decode_header(&header).unwrap();
        assert_eq!(source, "alice");
        assert_eq!(destination, "bob");
    }

    #[test]
    fn encode_header_rejects_a_name_too_long_for_the_wire_field() {
        let too_long = "a".repeat(NAME_FIELD_LEN + 1);
        assert!(matches!(
            encode_header(&too_long, "bob"),
            Err(Error::NameInvalid(_))
        ));
    }

    #[test]
    fn decode_header_rejects_a_short_buffer() {
        assert!(matches!(
            decode_header(&[0u8; HEADER_SIZE - 1]),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn route_packet_delivers_locally_addressed_payload() {
        let g = graph_with(&["self"]);
        let header = encode_header("self", "self").unwrap();
        let mut buf = header.to_vec();
        buf.extend_from_slice(b"hello");
        match route_packet(&g, g.self_index(), &buf).unwrap() {
            Dispatch::DeliverLocal(payload) => assert_eq!(payload, b"hello"),
            other => panic!("expected DeliverLocal, got {other:?}"),
        }
    }

    #[test]
    fn route_packet_drops_unknown_destination() {
        let g = graph_with(&["self"]);
        let header = encode_header("self", "nobody").unwrap();
        let dispatch = route_packet(&g, g.self_index(), &header).unwrap();
        assert_eq!(dispatch, Dispatch::Dropped("unknown destination name"));
    }

    #[test]
    fn route_packet_drops_short_buffer_without_erroring() {
        let g = graph_with(&["self"]);
        let dispatch = route_packet(&g, g.self_index(), &[0u8; 4]).unwrap();
        assert_eq!(dispatch, Dispatch::Dropped("packet shorter than header size"));
    }

    #[test]
    fn route_packet_forwards_toward_a_reachable_neighbor() {
        let mut g = graph_with(&["self", "a"]);
        let a = g.find_by_name("a").unwrap();
        g.add_edge(g.self_index(), a, 1, 0);
        let header = encode_header("self", "a").unwrap();
        let mut buf = header.to_vec();
        buf.extend_from_slice(b"payload");
        match route_packet(&g, g.self_index(), &buf).unwrap() {
            Dispatch::Forward { nexthop, payload, .. } => {
                assert_eq!(nexthop, a);
                assert_eq!(payload, b"payload");
            }
            other => panic!("expected Forward, got {other:?}"),
        }
    }

    #[test]
    fn route_packet_detects_a_routing_loop() {
        let mut g = graph_with(&["self", "a", "b"]);
        let a = g.find_by_name("a").unwrap();
        let b = g.find_by_name("b").unwrap();
        g.add_edge(g.self_index(), a, 1, 0);
        g.add_edge(a, b, 1, 0);
        // `b`'s via/nexthop is `a`; a packet claiming to arrive *from* `a`
        // addressed to `b` would bounce straight back to its own sender.
        let header = encode_header("self", "b").unwrap();
        let dispatch = route_packet(&g, a, &header).unwrap();
        assert_eq!(dispatch, Dispatch::Dropped("routing loop detected"));
    }

    #[test]
    fn mst_broadcast_targets_excludes_the_receive_edge() {
        let mut g = graph_with(&["self", "a", "b"]);
        let a = g.find_by_name("a").unwrap();
        let b = g.find_by_name("b").unwrap();
        g.add_edge(g.self_index(), a, 1, 0);
        g.add_edge(g.self_index(), b, 1, 0);
        let targets = mst_broadcast_targets(&g, Some(a));
        assert_eq!(targets, vec![b]);
    }

    #[test]
    fn direct_broadcast_targets_includes_every_reachable_non_self_node() {
        let mut g = graph_with(&["self", "a", "b"]);
        let a = g.find_by_name("a").unwrap();
        let b = g.find_by_name("b").unwrap();
        g.add_edge(g.self_index(), a, 1, 0);
        g.add_edge(a, b, 1, 0);
        let mut targets = direct_broadcast_targets(&g);
        targets.sort_by_key(|idx| idx.0);
        let mut expected = vec![a, b];
        expected.sort_by_key(|idx| idx.0);
        assert_eq!(targets, expected);
    }
}
