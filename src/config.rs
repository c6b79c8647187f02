// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Mesh Configuration - Single Source of Truth
//!
//! # Architecture
//!
//! - **Level 1 (Static)**: Compile-time constants (MTU ceiling, timer defaults)
//! - **Level 2 (Dynamic)**: `RuntimeConfig` for the `tinc.conf`/`hosts/` key-value
//!   store plus the atomically swappable listen-port state.
//!
//! # Performance
//!
//! - **Lock-free**: `DashMap` for the config store (no RwLock contention)
//! - **Atomic swap**: `ArcSwap` for `ListenPorts` (no lock)

use crate::error::{Error, Result};
use arc_swap::ArcSwap;
use dashmap::DashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

// =======================================================================
// Static constants (Level 1)
// =======================================================================

/// Default meta/control listening port, used when `tinc.conf` omits `Port =`.
pub const DEFAULT_PORT: u16 = 655;

/// Largest `maxmtu` this crate will grow a session to, absent jumbo-frame
/// configuration (§3: "maxmtu <= MTU_CEILING").
pub const MTU_CEILING: usize = 1500;

/// Default replay window width in records (§3a, §4.1). 0 disables the
/// window entirely.
pub const REPLAY_WINDOW_DEFAULT: u32 = 16;

/// Default interval, in seconds, between MetaChannel keepalive pings (§4.5).
pub const PING_INTERVAL_DEFAULT: u64 = 60;

/// Default time, in seconds, to wait for a PONG before closing a MetaChannel
/// (§4.5) and the same bound used for the MTU recheck state (§4.2).
pub const PING_TIMEOUT_DEFAULT: u64 = 5;

/// Seconds between REQ_KEY retries while `waitingforkey` is set (§4.7).
pub const KEY_REQUEST_RETRY_SECS: u64 = 10;

/// Records after which SessionProto forces a rekey (§3, §4.1).
pub const REKEY_AFTER_RECORDS: u64 = 1 << 30;

/// Minimum outgoing probe size accepted during MTU discovery (§4.2).
pub const MTU_PROBE_MIN_SIZE: usize = 64;

// =======================================================================
// Host-directory layout
// =======================================================================

/// Paths making up one mesh instance's on-disk configuration directory
/// (§6: `tinc.conf`, `hosts/<name>`, `ecdsa_key.priv`).
#[derive(Debug, Clone)]
pub struct ConfDir {
    root: PathBuf,
}

impl ConfDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn main_conf(&self) -> PathBuf {
        self.root.join("tinc.conf")
    }

    pub fn hosts_dir(&self) -> PathBuf {
        self.root.join("hosts")
    }

    pub fn host_file(&self, name: &str) -> PathBuf {
        self.hosts_dir().join(name)
    }

    pub fn private_key_file(&self) -> PathBuf {
        self.root.join("ecdsa_key.priv")
    }

    /// Ensures `root` and `root/hosts` exist, creating them with default
    /// permissions if necessary. Called by `open()` before anything else
    /// touches the directory.
    pub fn ensure_layout(&self) -> Result<()> {
        fs::create_dir_all(self.hosts_dir()).map_err(Error::Storage)
    }
}

// =======================================================================
// Line-oriented key/value parser shared by tinc.conf and hosts/*
// =======================================================================

/// One `Key = Value` line. Comments (`#` or `;` to end of line) and blank
/// lines are skipped; this is the full grammar, there is no nesting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfLine {
    pub key: String,
    pub value: String,
}

/// Parses the closed `Key = Value` grammar used by both `tinc.conf` and
/// `hosts/<name>` files. Keys are case-sensitive and may repeat (e.g.
/// multiple `Address =` lines in a host file); callers filter by key.
pub fn parse_conf_lines(text: &str) -> Vec<ConfLine> {
    let mut out = Vec::new();
    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        out.push(ConfLine {
            key: key.trim().to_string(),
            value: value.trim().to_string(),
        });
    }
    out
}

/// Reads and parses one conf-grammar file.
pub fn read_conf_file(path: &Path) -> Result<Vec<ConfLine>> {
    let text = fs::read_to_string(path).map_err(Error::Storage)?;
    Ok(parse_conf_lines(&text))
}

// =======================================================================
// hosts/<name> file parsing (§6)
// =======================================================================

/// One `Address = host [port]` line from a `hosts/<name>` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostAddress {
    pub host: String,
    pub port: Option<u16>,
}

/// Everything a `hosts/<name>` file declares about one peer: its
/// base64-encoded long-term public key plus zero or more addresses to try
/// (§6: "`ECDSAPublicKey = <base64>`, zero or more `Address = host [port]`
/// lines, and optional `Port`").
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HostConfig {
    pub pubkey_base64: Option<String>,
    pub addresses: Vec<HostAddress>,
    pub port: Option<u16>,
}

/// Parses the `ECDSAPublicKey =` / `Address =` / `Port =` lines of a
/// `hosts/<name>` file. Unknown keys are ignored rather than rejected, so a
/// host file may carry additional vendor-specific lines without breaking
/// this parser.
pub fn parse_host_lines(text: &str) -> HostConfig {
    let mut host = HostConfig::default();
    for line in parse_conf_lines(text) {
        match line.key.as_str() {
            "ECDSAPublicKey" => host.pubkey_base64 = Some(line.value),
            "Address" => {
                let mut parts = line.value.split_whitespace();
                let Some(addr) = parts.next() else { continue };
                let port = parts.next().and_then(|p| p.parse::<u16>().ok());
                host.addresses.push(HostAddress {
                    host: addr.to_string(),
                    port,
                });
            }
            "Port" => host.port = line.value.parse::<u16>().ok(),
            _ => {}
        }
    }
    host
}

/// Reads and parses one `hosts/<name>` file.
pub fn read_host_file(path: &Path) -> Result<HostConfig> {
    let text = fs::read_to_string(path).map_err(Error::Storage)?;
    Ok(parse_host_lines(&text))
}

/// Renders a `HostConfig` back to the `Key = Value` grammar, the inverse of
/// `parse_host_lines`, used by `export()`/`hosts/<self>` bootstrap (§6,
/// §8 "Name-parse idempotence").
pub fn render_host_file(host: &HostConfig) -> String {
    let mut out = String::new();
    if let Some(key) = &host.pubkey_base64 {
        out.push_str("ECDSAPublicKey = ");
        out.push_str(key);
        out.push('\n');
    }
    for addr in &host.addresses {
        out.push_str("Address = ");
        out.push_str(&addr.host);
        if let Some(port) = addr.port {
            out.push(' ');
            out.push_str(&port.to_string());
        }
        out.push('\n');
    }
    if let Some(port) = host.port {
        out.push_str("Port = ");
        out.push_str(&port.to_string());
        out.push('\n');
    }
    out
}

// =======================================================================
// Runtime Configuration (Dynamic, Lock-Free)
// =======================================================================

/// Atomically swappable listen-port state (mirrors the teacher's
/// `ArcSwap<PortMapping>` slot, generalized from per-domain RTPS ports to
/// this crate's single meta/control port plus optional secondary ports).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenPorts {
    pub meta: u16,
}

impl ListenPorts {
    pub fn new(meta: u16) -> Self {
        Self { meta }
    }
}

impl Default for ListenPorts {
    fn default() -> Self {
        Self { meta: DEFAULT_PORT }
    }
}

/// Shared runtime configuration (thread-safe, lock-free).
///
/// Backs the arbitrary `Name = Value` lines loaded from `tinc.conf` in a
/// lock-free `DashMap`, plus the atomically swappable listen-port state.
#[derive(Clone)]
pub struct RuntimeConfig {
    listen_ports: Arc<ArcSwap<ListenPorts>>,
    store: Arc<DashMap<Arc<str>, Arc<str>>>,
}

impl RuntimeConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            listen_ports: Arc::new(ArcSwap::new(Arc::new(ListenPorts::default()))),
            store: Arc::new(DashMap::new()),
        }
    }

    /// Loads `tinc.conf`, applying any `Port =` line to the listen-port
    /// state and storing every other key verbatim.
    pub fn load_main_conf(&self, confdir: &ConfDir) -> Result<()> {
        let lines = read_conf_file(&confdir.main_conf())?;
        for line in lines {
            if line.key.eq_ignore_ascii_case("Port") {
                if let Ok(port) = line.value.parse::<u16>() {
                    self.set_listen_port(port);
                }
            }
            self.set(&line.key, &line.value);
        }
        Ok(())
    }

    #[inline]
    pub fn set_listen_port(&self, meta: u16) {
        self.listen_ports.store(Arc::new(ListenPorts::new(meta)));
    }

    #[inline]
    #[must_use]
    pub fn listen_ports(&self) -> ListenPorts {
        **self.listen_ports.load()
    }

    #[inline]
    pub fn set(&self, key: &str, value: &str) {
        self.store.insert(Arc::from(key), Arc::from(value));
    }

    #[inline]
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Arc<str>> {
        self.store.get(key).map(|v| Arc::clone(&v))
    }

    #[inline]
    #[must_use]
    pub fn get_string(&self, key: &str) -> Option<String> {
        self.get(key).map(|v| v.to_string())
    }

    #[inline]
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.store.contains_key(key)
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.store.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}
