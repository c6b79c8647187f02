// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Pluggable payload compression (§9 design notes).
//!
//! `compress`/`decompress` are keyed by a single-byte level, matching the
//! field `ANS_KEY` negotiates and `Node::compression` stores. Level 0 is
//! always identity so a build without the `compression` feature still
//! interoperates with peers that advertise it: it just never offers
//! anything above 0 and silently downgrades anything it receives.

use crate::error::{Error, Result};

/// Identity level: payload passes through unchanged. Always available.
pub const LEVEL_IDENTITY: u8 = 0;

/// Highest DEFLATE level this build will ever advertise or accept above
/// identity (only meaningful when the `compression` feature is enabled).
#[cfg(feature = "compression")]
pub const LEVEL_MAX: u8 = 9;
#[cfg(not(feature = "compression"))]
pub const LEVEL_MAX: u8 = LEVEL_IDENTITY;

/// Clamps a peer-advertised level to what this build can actually produce
/// or consume (§9: "the peer's advertised level must be accepted or
/// renegotiated downward").
pub fn negotiate(requested: u8) -> u8 {
    requested.min(LEVEL_MAX)
}

/// Compresses `data` at `level`. `level` must already be the negotiated
/// value (see `negotiate`); a level this build cannot produce is an
/// internal error, not a protocol one.
pub fn compress(level: u8, data: &[u8]) -> Result<Vec<u8>> {
    if level == LEVEL_IDENTITY {
        return Ok(data.to_vec());
    }
    compress_deflate(level, data)
}

/// Decompresses `data` that was compressed at `level`.
pub fn decompress(level: u8, data: &[u8]) -> Result<Vec<u8>> {
    if level == LEVEL_IDENTITY {
        return Ok(data.to_vec());
    }
    decompress_deflate(data)
}

#[cfg(feature = "compression")]
fn compress_deflate(level: u8, data: &[u8]) -> Result<Vec<u8>> {
    use flate2::write::DeflateEncoder;
    use flate2::Compression;
    use std::io::Write;

    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::new(u32::from(level)));
    encoder
        .write_all(data)
        .map_err(|e| Error::Internal(format!("compression failed: {e}")))?;
    encoder
        .finish()
        .map_err(|e| Error::Internal(format!("compression failed: {e}")))
}

#[cfg(feature = "compression")]
fn decompress_deflate(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::write::DeflateDecoder;
    use std::io::Write;

    let mut decoder = DeflateDecoder::new(Vec::new());
    decoder
        .write_all(data)
        .map_err(|e| Error::Protocol(format!("decompression failed: {e}")))?;
    decoder
        .finish()
        .map_err(|e| Error::Protocol(format!("decompression failed: {e}")))
}

#[cfg(not(feature = "compression"))]
fn compress_deflate(_level: u8, _data: &[u8]) -> Result<Vec<u8>> {
    Err(Error::Internal(
        "compression level > 0 requested but the compression feature is disabled".into(),
    ))
}

#[cfg(not(feature = "compression"))]
fn decompress_deflate(_data: &[u8]) -> Result<Vec<u8>> {
    Err(Error::Protocol(
        "received compressed payload but the compression feature is disabled".into(),
    ))
}
