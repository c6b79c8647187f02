// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Crate-wide error taxonomy.
//!
//! Mirrors the containment rule in §7: per-peer errors never escape the
//! event loop, they are logged and turned into a `node_status` transition.
//! Only startup-time configuration/storage errors propagate out of `open()`.

use std::fmt;
use std::io;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// All fallible outcomes produced by this crate.
#[derive(Debug)]
pub enum Error {
    /// Missing or malformed `tinc.conf` / `hosts/` entry.
    Config(String),
    /// A node or channel name failed the charset/length check.
    NameInvalid(String),
    /// I/O failure against the configuration directory.
    Storage(io::Error),
    /// Socket-level failure (bind, send, recv).
    Network(io::Error),
    /// Malformed meta line, MAC failure, or unexpected record type.
    Protocol(String),
    /// Destination node exists but is not currently reachable.
    PeerUnreachable(String),
    /// Operation needs a session key that has not been established yet.
    NoKey(String),
    /// A bounded operation (handshake, key request, MTU probe) ran out the clock.
    Timeout(String),
    /// Invariant violation that should not be reachable in correct operation.
    Internal(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::NameInvalid(name) => write!(f, "invalid name: {name}"),
            Self::Storage(err) => write!(f, "storage error: {err}"),
            Self::Network(err) => write!(f, "network error: {err}"),
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Self::PeerUnreachable(name) => write!(f, "peer unreachable: {name}"),
            Self::NoKey(name) => write!(f, "no session key for {name}"),
            Self::Timeout(what) => write!(f, "timed out waiting for {what}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(err) | Self::Network(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Network(err)
    }
}

/// Severity levels surfaced through the host `log` callback (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
}

impl Error {
    /// Severity this error would be logged at if routed through the host
    /// `log` callback rather than returned directly.
    pub fn severity(&self) -> Severity {
        match self {
            Self::Config(_) | Self::Storage(_) => Severity::Error,
            Self::NameInvalid(_) | Self::Protocol(_) | Self::Internal(_) => Severity::Error,
            Self::Network(_) | Self::Timeout(_) => Severity::Warning,
            Self::PeerUnreachable(_) | Self::NoKey(_) => Severity::Info,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_are_human_readable() {
        assert_eq!(
            Error::NameInvalid("a b".into()).to_string(),
            "invalid name: a b"
        );
        assert_eq!(
            Error::PeerUnreachable("bar".into()).to_string(),
            "peer unreachable: bar"
        );
    }

    #[test]
    fn io_error_converts_to_network() {
        let io_err = io::Error::other("boom");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Network(_)));
    }

    #[test]
    fn severity_buckets_match_containment_rule() {
        assert_eq!(Error::Config("x".into()).severity(), Severity::Error);
        assert_eq!(Error::PeerUnreachable("x".into()).severity(), Severity::Info);
        assert_eq!(Error::Timeout("x".into()).severity(), Severity::Warning);
    }
}
