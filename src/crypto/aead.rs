// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! ChaCha20-Poly1305 record sealing/opening (§4.1, §4.1a).
//!
//! Adapted from the teacher's `security::crypto::aes_gcm::AesGcmCipher`:
//! same `BoundKey`/`NonceSequence`/`Zeroize` shape, the AEAD algorithm
//! swapped and the nonce derived deterministically from the record
//! sequence number rather than drawn from the system RNG, per §4.1's
//! "nonce = 32-bit seqno || 64-bit zero pad".

use crate::error::{Error, Result};
use ring::aead::{
    Aad, BoundKey, Nonce, NonceSequence, OpeningKey, SealingKey, UnboundKey, CHACHA20_POLY1305,
};
use ring::error::Unspecified;
use zeroize::Zeroize;

/// ChaCha20-Poly1305 cipher bound to one directional session key.
pub struct ChaChaCipher {
    key: [u8; 32],
}

impl ChaChaCipher {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Seals `plaintext` under `seqno`. The nonce is `seqno` as a
    /// little-endian `u32` followed by eight zero bytes (§4.1); callers
    /// send the cleartext `seqno` alongside the returned ciphertext for
    /// datagram records as the record framing requires.
    pub fn seal(&self, seqno: u32, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let unbound = UnboundKey::new(&CHACHA20_POLY1305, &self.key)
            .map_err(|_| Error::Internal("failed to construct ChaCha20-Poly1305 key".into()))?;
        let mut sealing_key = SealingKey::new(unbound, SeqNonceSequence::new(seqno));

        let mut in_out = plaintext.to_vec();
        sealing_key
            .seal_in_place_append_tag(Aad::from(aad), &mut in_out)
            .map_err(|_| Error::Internal("AEAD seal failed".into()))?;
        Ok(in_out)
    }

    /// Opens a record sealed with `seal` at the same `seqno`. A failure
    /// here (bad MAC) is the "drop silently, increment counter" path of
    /// §4.1 — callers must not propagate this as a hard error up the
    /// per-peer boundary, just count and discard.
    pub fn open(&self, seqno: u32, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let unbound = UnboundKey::new(&CHACHA20_POLY1305, &self.key)
            .map_err(|_| Error::Internal("failed to construct ChaCha20-Poly1305 key".into()))?;
        let mut opening_key = OpeningKey::new(unbound, SeqNonceSequence::new(seqno));

        let mut in_out = ciphertext.to_vec();
        let plaintext = opening_key
            .open_in_place(Aad::from(aad), &mut in_out)
            .map_err(|_| Error::Protocol("AEAD authentication failed".into()))?;
        Ok(plaintext.to_vec())
    }
}

impl Drop for ChaChaCipher {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Single-use nonce built from a record sequence number: low 4 bytes carry
/// `seqno` little-endian, high 8 bytes are zero, matching §4.1.
struct SeqNonceSequence {
    bytes: Option<[u8; 12]>,
}

impl SeqNonceSequence {
    fn new(seqno: u32) -> Self {
        let mut bytes = [0u8; 12];
        bytes[..4].copy_from_slice(&seqno.to_le_bytes());
        Self { bytes: Some(bytes) }
    }
}

impl NonceSequence for SeqNonceSequence {
    fn advance(&mut self) -> std::result::Result<Nonce, Unspecified> {
        let bytes = self.bytes.take().ok_or(Unspecified)?;
        Nonce::try_assume_unique_for_key(&bytes)
    }
}
