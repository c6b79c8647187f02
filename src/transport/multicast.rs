// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Local-discovery broadcast helper (§4.2, §4.6).
//!
//! The teacher's RTPS transport joins a fixed multicast group
//! (239.255.0.1/239.255.0.2) and discovers every interface worth joining it
//! on. A mesh has no group to join: local discovery here is a single
//! limited-broadcast (or all-nodes multicast, for v6) datagram per address
//! family, so this module shrinks to "enable SO_BROADCAST" and "what address
//! do I broadcast to", keeping the teacher's interface-discovery fallback
//! chain (`ip` command, then `local_ip_address` crate) for finding a usable
//! source address to advertise.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};

/// IPv4 limited broadcast address (§4.6: "255.255.255.255 for v4").
pub const BROADCAST_V4: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 255);

/// All-nodes link-local multicast address used as the v6 discovery
/// destination (§4.6: "ff02::1 for v6" — there is no v6 broadcast).
pub const DISCOVERY_V6: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1);

/// Address family of a listening socket, mirroring `p.status.broadcast`'s
/// family-match check in §4.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddrFamily {
    V4,
    V6,
}

impl AddrFamily {
    pub fn of(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => Self::V4,
            SocketAddr::V6(_) => Self::V6,
        }
    }
}

/// Enables `SO_BROADCAST` so the socket may send to `BROADCAST_V4`. A no-op
/// requirement for v6 sockets, which reach `DISCOVERY_V6` via multicast and
/// never need this flag.
pub fn enable_broadcast(socket: &UdpSocket) -> io::Result<()> {
    socket.set_broadcast(true)
}

/// The family-appropriate local-discovery destination for `port`, with the
/// caller's `sin_port` already applied (§4.6: "sin_port copied from
/// p.prevedge").
pub fn discovery_address(family: AddrFamily, port: u16) -> SocketAddr {
    match family {
        AddrFamily::V4 => SocketAddr::new(IpAddr::V4(BROADCAST_V4), port),
        AddrFamily::V6 => SocketAddr::new(IpAddr::V6(DISCOVERY_V6), port),
    }
}

/// Non-loopback IPv4 interfaces on this host, for picking a source address
/// to advertise. Linux parses `ip -4 addr show`; everywhere else (and as a
/// Linux fallback when the `ip` binary is missing, e.g. inside a minimal
/// container) falls back to the `local_ip_address` crate.
pub fn local_interfaces() -> io::Result<Vec<Ipv4Addr>> {
    if let Ok(var) = std::env::var("MESHWIRE_INTERFACE") {
        if let Ok(addr) = var.parse::<Ipv4Addr>() {
            log::debug!("[multicast] using MESHWIRE_INTERFACE override: {addr}");
            return Ok(vec![addr]);
        }
    }
    local_interfaces_platform()
}

#[cfg(target_os = "linux")]
fn local_interfaces_platform() -> io::Result<Vec<Ipv4Addr>> {
    use std::process::Command;

    let output = match Command::new("ip").args(["-4", "addr", "show"]).output() {
        Ok(o) => o,
        Err(_) => {
            log::debug!("[multicast] 'ip' command not found, using local_ip_address crate");
            return local_interfaces_crate();
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut interfaces = Vec::new();
    for line in stdout.lines() {
        if line.contains("127.0.0.1") || line.contains("host lo") {
            continue;
        }
        if let Some(inet_part) = line.trim().strip_prefix("inet ") {
            if let Some(addr_str) = inet_part.split('/').next() {
                if let Ok(addr) = addr_str.trim().parse::<Ipv4Addr>() {
                    interfaces.push(addr);
                }
            }
        }
    }
    Ok(interfaces)
}

#[cfg(not(target_os = "linux"))]
fn local_interfaces_platform() -> io::Result<Vec<Ipv4Addr>> {
    local_interfaces_crate()
}

fn local_interfaces_crate() -> io::Result<Vec<Ipv4Addr>> {
    let interfaces = match local_ip_address::list_afinet_netifas() {
        Ok(ifs) => ifs,
        Err(e) => {
            log::debug!("[multicast] failed to list network interfaces: {e}");
            return Ok(Vec::new());
        }
    };

    let mut addrs = Vec::new();
    for (_name, ip) in interfaces {
        if let IpAddr::V4(ipv4) = ip {
            if !ipv4.is_loopback() {
                addrs.push(ipv4);
            }
        }
    }
    log::debug!("[multicast] discovered {} non-loopback interfaces", addrs.len());
    Ok(addrs)
}

/// Best-effort local source address to report in `ID`/`ADD_EDGE`
/// advertisements when no explicit `Address =` is configured. Falls back to
/// `UNSPECIFIED` the same way the teacher's multicast interface discovery
/// degrades to an empty interface list rather than failing hard.
pub fn primary_interface_ip() -> io::Result<Ipv4Addr> {
    let interfaces = local_interfaces()?;
    match interfaces.first() {
        Some(&ip) => {
            log::debug!("[multicast] primary interface ip={ip}");
            Ok(ip)
        }
        None => {
            log::debug!("[multicast] no suitable interface found, using UNSPECIFIED");
            Ok(Ipv4Addr::UNSPECIFIED)
        }
    }
}
