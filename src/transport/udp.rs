// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-address-family UDP listening sockets and outbound address selection
//! (§4.6).
//!
//! Socket construction keeps the teacher's `socket2`-based builder
//! (`SO_REUSEADDR`, explicit bind before handing the socket to `std`); what
//! changes is everything downstream of "which address do I send this
//! datagram to", since a mesh peer has no RTPS submessage-ID-driven
//! multicast routing to decide that — it has `Node::broadcast`/
//! `udp_confirmed` and a handful of candidate addresses instead.

use crate::node::Node;
use crate::transport::multicast::{discovery_address, enable_broadcast, AddrFamily};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, UdpSocket};

/// One bound, non-blocking listening socket for a single address family.
pub struct ListeningSocket {
    pub socket: UdpSocket,
    pub family: AddrFamily,
}

/// The set of listening sockets this instance owns, one per configured
/// address family (§4.6: "Maintains one listening socket per configured
/// address family").
pub struct UdpTransport {
    sockets: Vec<ListeningSocket>,
}

impl UdpTransport {
    /// Binds one socket per address in `binds`, each with `SO_REUSEADDR`,
    /// `SO_BROADCAST` (harmless on v6) and non-blocking mode set, ready for
    /// `mio::net::UdpSocket::from_std` registration by the caller's event
    /// loop.
    pub fn bind(binds: &[SocketAddr]) -> io::Result<Self> {
        let mut sockets = Vec::with_capacity(binds.len());
        for addr in binds {
            let domain = match addr {
                SocketAddr::V4(_) => Domain::IPV4,
                SocketAddr::V6(_) => Domain::IPV6,
            };
            let raw = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
            raw.set_reuse_address(true)?;
            raw.set_nonblocking(true)?;
            raw.bind(&(*addr).into())?;
            let socket: UdpSocket = raw.into();
            enable_broadcast(&socket).ok();
            log::debug!("[udp] bound listening socket on {addr}");
            sockets.push(ListeningSocket {
                socket,
                family: AddrFamily::of(addr),
            });
        }
        Ok(Self { sockets })
    }

    pub fn sockets(&self) -> &[ListeningSocket] {
        &self.sockets
    }

    /// Sends `data` using the address selection already computed by
    /// `choose_address`, translating `EMSGSIZE` into the maxmtu-shrinking
    /// signal callers need (§4.6: "On send, EMSGSIZE lowers maxmtu and mtu
    /// to len-1; EWOULDBLOCK is not an error; other errors are logged").
    pub fn send(&self, choice: &AddressChoice, data: &[u8]) -> SendOutcome {
        let Some(sock) = self.sockets.get(choice.socket_index) else {
            return SendOutcome::Error;
        };
        match sock.socket.send_to(data, choice.destination) {
            Ok(_) => SendOutcome::Sent,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => SendOutcome::WouldBlock,
            Err(e) if e.raw_os_error() == Some(libc::EMSGSIZE) => {
                log::debug!("[udp] EMSGSIZE sending {} bytes to {}", data.len(), choice.destination);
                SendOutcome::TooLarge { new_mtu: data.len().saturating_sub(1) }
            }
            Err(e) => {
                log::debug!("[udp] send to {} failed: {e}", choice.destination);
                SendOutcome::Error
            }
        }
    }
}

/// Result of one `UdpTransport::send` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    WouldBlock,
    /// Caller must lower `maxmtu`/`mtu` to `new_mtu` (§4.6).
    TooLarge { new_mtu: usize },
    Error,
}

/// Which socket to send from and which address to send to, the output of
/// `choose_address` (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressChoice {
    pub socket_index: usize,
    pub destination: SocketAddr,
}

/// Small xorshift PRNG for the probabilistic address-selection heuristic
/// below; same justification as `mtu::MtuProbe`'s internal RNG (a single,
/// non-security-sensitive call site doesn't earn a `rand` dependency).
struct Rng(u64);

impl Rng {
    fn new(seed: u64) -> Self {
        Self(seed | 1)
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    fn below(&mut self, n: usize) -> usize {
        if n == 0 {
            0
        } else {
            (self.next_u64() % n as u64) as usize
        }
    }

    /// True with probability `1/n`.
    fn one_in(&mut self, n: u64) -> bool {
        self.next_u64() % n == 0
    }
}

/// Picks which listening socket and destination address to use for `peer`'s
/// next outbound datagram (§4.6).
///
/// `reverse_addresses` are candidate addresses harvested from edges
/// pointing back at `peer` (the teacher's router calls this the reverse
/// address of an edge); `configured_discovery` is an operator-set local
/// discovery address from `tinc.conf`, consulted before falling back to the
/// generic broadcast/multicast constants; `prevedge_port` is the port to
/// stamp on a broadcast destination when one is known.
pub fn choose_address(
    peer: &Node,
    reverse_addresses: &[SocketAddr],
    prevedge_port: Option<u16>,
    configured_discovery: Option<SocketAddr>,
    sockets: &[ListeningSocket],
    seed: u64,
) -> Option<AddressChoice> {
    if sockets.is_empty() {
        return None;
    }
    let mut rng = Rng::new(seed);

    if peer.broadcast {
        let socket_index = rng.below(sockets.len());
        let family = sockets[socket_index].family;
        let port = prevedge_port?;
        let destination = match configured_discovery {
            Some(addr) if AddrFamily::of(&addr) == family => addr,
            _ => discovery_address(family, port),
        };
        return Some(AddressChoice { socket_index, destination });
    }

    if peer.udp_confirmed {
        let destination = peer.address?;
        let socket_index = matching_family_socket(sockets, destination, peer.sock);
        return Some(AddressChoice { socket_index, destination });
    }

    // Not yet confirmed: two in three outbound packets probe an
    // alternative (a random reverse edge address paired with a random
    // socket); one in three falls back to the peer's last-known address
    // (§4.6 "two out of three ... one in three goes to p.address").
    let probe_alternative = !rng.one_in(3);
    if probe_alternative && !reverse_addresses.is_empty() {
        let destination = reverse_addresses[rng.below(reverse_addresses.len())];
        let socket_index = rng.below(sockets.len());
        let socket_index = if sockets[socket_index].family == AddrFamily::of(&destination) {
            socket_index
        } else {
            matching_family_socket(sockets, destination, socket_index)
        };
        return Some(AddressChoice { socket_index, destination });
    }

    let destination = peer.address?;
    let socket_index = matching_family_socket(sockets, destination, peer.sock);
    Some(AddressChoice { socket_index, destination })
}

/// Returns `preferred` if its family matches `destination`, else the first
/// socket of the matching family, else `preferred` unchanged (no socket of
/// that family exists, so the send will fail and get logged by the caller).
fn matching_family_socket(sockets: &[ListeningSocket], destination: SocketAddr, preferred: usize) -> usize {
    let wanted = AddrFamily::of(&destination);
    if sockets.get(preferred).map(|s| s.family) == Some(wanted) {
        return preferred;
    }
    sockets
        .iter()
        .position(|s| s.family == wanted)
        .unwrap_or(preferred)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn listening_sockets() -> Vec<ListeningSocket> {
        vec![
            ListeningSocket {
                socket: UdpSocket::bind("127.0.0.1:0").unwrap(),
                family: AddrFamily::V4,
            },
        ]
    }

    #[test]
    fn broadcast_peer_uses_discovery_address_with_prevedge_port() {
        let mut peer = Node::new("p".into(), vec![]);
        peer.broadcast = true;
        let sockets = listening_sockets();
        let choice = choose_address(&peer, &[], Some(7777), None, &sockets, 1).unwrap();
        assert_eq!(choice.destination.port(), 7777);
        assert_eq!(choice.destination.ip(), IpAddr::V4(crate::transport::multicast::BROADCAST_V4));
    }

    #[test]
    fn broadcast_peer_without_prevedge_port_yields_none() {
        let mut peer = Node::new("p".into(), vec![]);
        peer.broadcast = true;
        let sockets = listening_sockets();
        assert!(choose_address(&peer, &[], None, None, &sockets, 1).is_none());
    }

    #[test]
    fn configured_discovery_address_wins_when_family_matches() {
        let mut peer = Node::new("p".into(), vec![]);
        peer.broadcast = true;
        let sockets = listening_sockets();
        let configured: SocketAddr = "10.0.0.5:9000".parse().unwrap();
        let choice = choose_address(&peer, &[], Some(1), Some(configured), &sockets, 1).unwrap();
        assert_eq!(choice.destination, configured);
    }

    #[test]
    fn udp_confirmed_peer_uses_its_stored_address() {
        let mut peer = Node::new("p".into(), vec![]);
        peer.udp_confirmed = true;
        peer.address = Some("1.2.3.4:500".parse().unwrap());
        let sockets = listening_sockets();
        let choice = choose_address(&peer, &[], None, None, &sockets, 1).unwrap();
        assert_eq!(choice.destination, peer.address.unwrap());
    }

    #[test]
    fn unconfirmed_peer_without_candidates_falls_back_to_stored_address() {
        let mut peer = Node::new("p".into(), vec![]);
        peer.address = Some("1.2.3.4:500".parse().unwrap());
        let sockets = listening_sockets();
        let choice = choose_address(&peer, &[], None, None, &sockets, 1).unwrap();
        assert_eq!(choice.destination, peer.address.unwrap());
    }

    #[test]
    fn unconfirmed_peer_with_no_addresses_at_all_yields_none() {
        let peer = Node::new("p".into(), vec![]);
        let sockets = listening_sockets();
        assert!(choose_address(&peer, &[], None, None, &sockets, 1).is_none());
    }

    #[test]
    fn emsgsize_reports_shrunk_mtu() {
        let transport = UdpTransport::bind(&["127.0.0.1:0".parse().unwrap()]).unwrap();
        let huge = vec![0u8; 70_000];
        let choice = AddressChoice {
            socket_index: 0,
            destination: "127.0.0.1:1".parse().unwrap(),
        };
        match transport.send(&choice, &huge) {
            SendOutcome::TooLarge { new_mtu } => assert_eq!(new_mtu, huge.len() - 1),
            other => panic!("expected TooLarge for an oversized UDP datagram, got {other:?}"),
        }
    }

    #[test]
    fn bind_enables_nonblocking_and_broadcast() {
        let transport = UdpTransport::bind(&["127.0.0.1:0".parse().unwrap()]).unwrap();
        assert_eq!(transport.sockets().len(), 1);
        // A non-blocking recv on an empty socket must not block the test.
        let mut buf = [0u8; 16];
        let res = transport.sockets()[0].socket.recv_from(&mut buf);
        assert!(matches!(res, Err(e) if e.kind() == io::ErrorKind::WouldBlock));
    }
}
