// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # meshwire
//!
//! A self-organizing, authenticated mesh overlay: every node holds a stable
//! name and a long-term ECDSA keypair, learns of peers through an
//! invitation export/import bootstrap, and maintains a fully-connected
//! routing view by gossiping edge state over authenticated meta-connections.
//! Application datagrams travel peer-to-peer over a forward-secret session
//! protocol (SPTPS), falling back to a TCP tunnel when UDP is blocked.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use meshwire::{Callbacks, Mesh, Severity};
//!
//! fn main() -> meshwire::Result<()> {
//!     let mesh = Mesh::open("/etc/meshwire", "foo".to_string(), "myapp".to_string(), 0)?;
//!     let callbacks = Callbacks {
//!         receive: Box::new(|from, data| println!("{from}: {} bytes", data.len())),
//!         node_status: Box::new(|name, reachable| println!("{name} reachable={reachable}")),
//!         channel_accept: Box::new(|_name, port, _data| port == 7),
//!         log: Box::new(|level, text| println!("[{level:?}] {text}")),
//!     };
//!     mesh.start(callbacks, Severity::Info)?;
//!     mesh.send("bar", b"hello");
//!     mesh.stop();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +-----------------------------------------------------------------+
//! |                      Application (host process)                 |
//! |        send/channel_open     <-     receive/node_status/log     |
//! +-----------------------------------------------------------------+
//! |                       Mesh (event loop, §5)                     |
//! |   Router -> SessionProto -> UDPTransport / MetaChannel (TCP)     |
//! |   Graph (Dijkstra/MST)        KeyExchange (REQ_KEY/ANS_KEY)      |
//! |   MTUProbe (per-peer PMTU)    MetaChannel (control protocol)     |
//! +-----------------------------------------------------------------+
//! ```
//!
//! ## Modules overview
//!
//! - [`mesh`] - event loop, lifecycle, and the public library surface (start here)
//! - [`router`] - destination-name lookup, next-hop selection, dispatch
//! - [`graph`] - node/edge arena, shortest paths, minimum spanning tree
//! - [`session`] - SPTPS: the authenticated/encrypted per-peer record stream
//! - [`mtu`] - per-peer path-MTU discovery and RTT/bandwidth/loss estimation
//! - [`meta`] - the line-oriented control-connection protocol
//! - [`keyexchange`] - bridges `meta` to `session` via REQ_KEY/ANS_KEY
//! - [`transport`] - UDP/TCP sockets and local-broadcast discovery
//! - [`crypto`] - ECDSA identity, ephemeral ECDH, AEAD record sealing
//! - [`config`] - `tinc.conf`/`hosts/` directory parsing and runtime config
//! - [`admin`] - read-only mesh/node/edge introspection snapshots
//! - [`compression`] - pluggable per-record compression (level 0 = identity)

pub mod admin;
pub mod compression;
pub mod config;
pub mod congestion;
pub mod crypto;
pub mod error;
pub mod graph;
pub mod keyexchange;
pub mod logging;
pub mod mesh;
pub mod meta;
pub mod mtu;
pub mod node;
pub mod packet;
pub mod router;
pub mod transport;

pub use admin::{EdgeSnapshot, MeshSnapshot, NodeSnapshot};
pub use error::{Error, Result, Severity};
pub use mesh::{Callbacks, Channel, Mesh};
pub use node::Node;
pub use packet::{PacketBuffer, Priority};
