// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TCP listener and outbound connector backing the MetaChannel control
//! plane (§4.5).
//!
//! Socket construction follows `transport::udp`'s `socket2` builder
//! (`SO_REUSEADDR`, non-blocking before handoff); the difference is that
//! `mio::net::TcpListener`/`TcpStream` already implement `mio::event::Source`
//! once built from the non-blocking `std` socket, so the event loop in
//! `mesh.rs` registers them directly rather than going through a
//! teacher-style intermediate handle.

use mio::net::{TcpListener, TcpStream};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;

/// Binds a non-blocking TCP listener for inbound meta-connections, with a
/// backlog generous enough for a mesh with a few hundred direct peers.
pub fn bind(addr: SocketAddr) -> io::Result<TcpListener> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let raw = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    raw.set_reuse_address(true)?;
    raw.set_nonblocking(true)?;
    raw.bind(&addr.into())?;
    raw.listen(128)?;
    let std_listener: std::net::TcpListener = raw.into();
    log::debug!("[tcp] listening on {addr}");
    Ok(TcpListener::from_std(std_listener))
}

/// Starts a non-blocking outbound connection toward a configured peer
/// address (§4.5 "TCP-connect"). Completion (or failure) is signalled by a
/// writable-readiness event on the returned stream, per `mio`'s usual
/// connect-in-progress convention.
pub fn connect(addr: SocketAddr) -> io::Result<TcpStream> {
    log::debug!("[tcp] connecting to {addr}");
    TcpStream::connect(addr)
}
