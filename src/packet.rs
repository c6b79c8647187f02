// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! PacketBuffer: fixed-capacity datagram container (§2, §3).

use crate::config::MTU_CEILING;

/// Priority hint carried alongside a packet; higher values are serviced
/// first when the submit queue backs up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Normal,
    High,
}

/// A single datagram plus the metadata the session/router layers need to
/// route and account for it. Capacity is bounded by `MTU_CEILING` so a
/// buffer never needs to grow past what any session will ever send.
#[derive(Debug, Clone)]
pub struct PacketBuffer {
    data: Vec<u8>,
    pub priority: Priority,
    /// Set for MTU-discovery probes (§4.2, record type `PKT_PROBE`) so the
    /// router and SessionProto can special-case them instead of delivering
    /// to the application.
    pub is_probe: bool,
}

impl PacketBuffer {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            priority: Priority::Normal,
            is_probe: false,
        }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            data: Vec::with_capacity(cap.min(MTU_CEILING)),
            priority: Priority::Normal,
            is_probe: false,
        }
    }

    pub fn from_slice(bytes: &[u8]) -> Self {
        Self {
            data: bytes.to_vec(),
            priority: Priority::Normal,
            is_probe: false,
        }
    }

    pub fn probe(bytes: &[u8]) -> Self {
        Self {
            data: bytes.to_vec(),
            priority: Priority::High,
            is_probe: true,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Appends bytes, refusing to grow the buffer past `MTU_CEILING` (§3:
    /// "maxmtu <= MTU_CEILING").
    pub fn extend(&mut self, bytes: &[u8]) -> crate::Result<()> {
        if self.data.len() + bytes.len() > MTU_CEILING {
            return Err(crate::Error::Protocol(format!(
                "packet would exceed MTU ceiling ({} + {} > {})",
                self.data.len(),
                bytes.len(),
                MTU_CEILING
            )));
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }
}

impl Default for PacketBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_slice_roundtrips_bytes() {
        let p = PacketBuffer::from_slice(b"hello");
        assert_eq!(p.as_slice(), b"hello");
        assert_eq!(p.len(), 5);
    }

    #[test]
    fn probe_sets_flag_and_high_priority() {
        let p = PacketBuffer::probe(&[0u8; 64]);
        assert!(p.is_probe);
        assert_eq!(p.priority, Priority::High);
    }

    #[test]
    fn extend_rejects_past_mtu_ceiling() {
        let mut p = PacketBuffer::with_capacity(MTU_CEILING);
        p.extend(&vec![0u8; MTU_CEILING]).unwrap();
        assert!(p.extend(&[0u8]).is_err());
    }
}
