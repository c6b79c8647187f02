// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Node: a mesh participant and its per-peer mutable state (§3).

use crate::config::MTU_CEILING;
use crate::graph::{EdgeIndex, NodeIndex};
use crate::mtu::MtuProbe;
use crate::session::SessionProto;
use std::net::SocketAddr;
use std::time::Instant;

/// 1-64 chars, alphanumerics and underscore only (§3).
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// A participant identified by a stable name and a long-term ECDSA public key.
pub struct Node {
    pub name: String,
    pub pubkey: Vec<u8>,

    /// Set once a live Connection/Session makes this node reachable.
    pub reachable: bool,
    pub validkey: bool,
    pub waitingforkey: bool,
    pub udp_confirmed: bool,
    pub broadcast: bool,

    /// Primary remote socket address and the listening-socket index it
    /// pairs with (§3, §4.6).
    pub address: Option<SocketAddr>,
    pub sock: usize,

    pub mtu: MtuProbe,

    pub packets_in: u64,
    pub packets_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,

    /// Direct neighbor packets addressed to this node are forwarded through.
    pub nexthop: Option<NodeIndex>,
    /// Node that terminates UDP for this destination; `via == self_index`
    /// means the next hop handles UDP directly (§3, glossary).
    pub via: Option<NodeIndex>,
    /// Edge this node's reachability was last derived from.
    pub prevedge: Option<EdgeIndex>,

    pub session: SessionProto,

    /// Compression level last negotiated with this peer (§9 design notes;
    /// `None` until ANS_KEY advertises one).
    pub compression: Option<u8>,

    pub last_key_request: Option<Instant>,
}

impl Node {
    pub fn new(name: String, pubkey: Vec<u8>) -> Self {
        Self {
            name,
            pubkey,
            reachable: false,
            validkey: false,
            waitingforkey: false,
            udp_confirmed: false,
            broadcast: false,
            address: None,
            sock: 0,
            mtu: MtuProbe::new(MTU_CEILING),
            packets_in: 0,
            packets_out: 0,
            bytes_in: 0,
            bytes_out: 0,
            nexthop: None,
            via: None,
            prevedge: None,
            session: SessionProto::new(),
            compression: None,
            last_key_request: None,
        }
    }

    /// Constructs the always-reachable node representing this mesh instance.
    pub fn new_self(name: String, pubkey: Vec<u8>) -> Self {
        let mut node = Self::new(name, pubkey);
        node.reachable = true;
        node
    }

    /// Resets per-peer MTU/session state after a reachable -> unreachable
    /// transition (§4.4).
    pub fn reset_on_unreachable(&mut self) {
        self.udp_confirmed = false;
        self.validkey = false;
        self.waitingforkey = false;
        self.mtu = MtuProbe::new(MTU_CEILING);
        self.session.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_validation_rejects_bad_chars_and_empty() {
        assert!(is_valid_name("foo_bar1"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("has space"));
        assert!(!is_valid_name("has-dash"));
        assert!(!is_valid_name(&"a".repeat(65)));
        assert!(is_valid_name(&"a".repeat(64)));
    }

    #[test]
    fn new_self_is_reachable_by_construction() {
        let me = Node::new_self("foo".into(), vec![1, 2, 3]);
        assert!(me.reachable);
    }

    #[test]
    fn reset_on_unreachable_clears_session_flags() {
        let mut n = Node::new("bar".into(), vec![]);
        n.validkey = true;
        n.waitingforkey = true;
        n.udp_confirmed = true;
        n.reset_on_unreachable();
        assert!(!n.validkey);
        assert!(!n.waitingforkey);
        assert!(!n.udp_confirmed);
    }
}
