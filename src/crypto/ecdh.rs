// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-session ephemeral ECDH (§4.1 step 1/4, §4.1a).
//!
//! Adapted near-verbatim from the teacher's
//! `security::crypto::key_exchange::EcdhKeyExchange`: same P-256 curve,
//! same uncompressed-point wire format, generalized from a static helper
//! into a handshake-scoped keypair consumed exactly once (ephemeral keys
//! are never reused, §4.1's forward-secrecy requirement).

use crate::error::{Error, Result};
use ring::agreement::{agree_ephemeral, EphemeralPrivateKey, UnparsedPublicKey, ECDH_P256};
use ring::rand::SystemRandom;

/// P-256 uncompressed public key length: `0x04 || X || Y`.
pub const ECDH_P256_PUBLIC_KEY_LEN: usize = 65;

/// An ephemeral ECDH keypair for one handshake attempt. `EphemeralPrivateKey`
/// is not `Clone` and `agree_ephemeral` consumes it, enforcing single-use at
/// the type level.
pub struct EphemeralKeyExchange {
    private: EphemeralPrivateKey,
    public: Vec<u8>,
}

impl EphemeralKeyExchange {
    pub fn generate() -> Result<Self> {
        let rng = SystemRandom::new();
        let private = EphemeralPrivateKey::generate(&ECDH_P256, &rng)
            .map_err(|_| Error::Internal("failed to generate ephemeral ECDH keypair".into()))?;
        let public = private
            .compute_public_key()
            .map_err(|_| Error::Internal("failed to compute ephemeral ECDH public key".into()))?
            .as_ref()
            .to_vec();
        Ok(Self { private, public })
    }

    /// Uncompressed P-256 public key to place in the outgoing KEX record.
    pub fn public_bytes(&self) -> &[u8] {
        &self.public
    }

    /// Consumes this keypair to derive the raw ECDH shared secret against a
    /// peer's KEX public key. The caller must pass the result through HKDF
    /// (`crypto::kdf`) before using it as a cipher key (§4.1a).
    pub fn agree(self, peer_public: &[u8]) -> Result<Vec<u8>> {
        validate_public_key(peer_public)?;
        let peer_key = UnparsedPublicKey::new(&ECDH_P256, peer_public);
        agree_ephemeral(self.private, &peer_key, |shared| shared.to_vec())
            .map_err(|_| Error::Protocol("ECDH agreement failed".into()))
    }
}

/// Validates that `raw` is a well-formed uncompressed P-256 point before it
/// is handed to `agree_ephemeral`.
pub fn validate_public_key(raw: &[u8]) -> Result<()> {
    if raw.len() != ECDH_P256_PUBLIC_KEY_LEN {
        return Err(Error::Protocol(format!(
            "invalid ECDH public key length: expected {ECDH_P256_PUBLIC_KEY_LEN}, got {}",
            raw.len()
        )));
    }
    if raw[0] != 0x04 {
        return Err(Error::Protocol(
            "invalid ECDH public key: expected uncompressed point".into(),
        ));
    }
    Ok(())
}
