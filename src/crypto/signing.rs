// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Long-term ECDSA P-256 node identity (§4.1a, §4.1 SIG records).
//!
//! New relative to the teacher (which only binds ECDH, not signing), but
//! structured the same way as `crypto::ecdh`: a thin wrapper around the
//! matching `ring::signature` API, generate-once / use-many instead of the
//! ECDH module's consume-on-use (§4.1: the long-term key signs a SIG record
//! per handshake, but is never discarded).

use crate::error::{Error, Result};
use ring::rand::SystemRandom;
use ring::signature::{
    EcdsaKeyPair, KeyPair, UnparsedPublicKey, ECDSA_P256_SHA256_FIXED,
    ECDSA_P256_SHA256_FIXED_SIGNING,
};

/// A node's long-term ECDSA P-256 signing key, loaded from
/// `ecdsa_key.priv` (§6) and held for the lifetime of the `Mesh`.
pub struct NodeKeyPair {
    inner: EcdsaKeyPair,
}

impl NodeKeyPair {
    /// Builds a keypair from PKCS#8 bytes (the format `ecdsa_key.priv`
    /// stores, PEM-wrapped at rest per §6).
    pub fn from_pkcs8(pkcs8: &[u8]) -> Result<Self> {
        let rng = SystemRandom::new();
        let inner = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8, &rng)
            .map_err(|_| Error::Config("malformed ECDSA private key".into()))?;
        Ok(Self { inner })
    }

    /// Generates a fresh PKCS#8 document for first-time `hosts/<self>`
    /// bootstrap; the caller persists the returned bytes to
    /// `ecdsa_key.priv` before constructing the keypair from them.
    pub fn generate_pkcs8() -> Result<Vec<u8>> {
        let rng = SystemRandom::new();
        let doc = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
            .map_err(|_| Error::Internal("failed to generate ECDSA keypair".into()))?;
        Ok(doc.as_ref().to_vec())
    }

    pub fn public_key_bytes(&self) -> &[u8] {
        self.inner.public_key().as_ref()
    }

    /// Signs a SIG record payload (§4.1 step 2/3: "signature ... over
    /// (initiator-KEX || responder-KEX || label)").
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let rng = SystemRandom::new();
        self.inner
            .sign(&rng, message)
            .map(|sig| sig.as_ref().to_vec())
            .map_err(|_| Error::Internal("ECDSA signing failed".into()))
    }
}

/// A peer's long-term public key, loaded from `hosts/<name>`'s
/// `ECDSAPublicKey =` line, used to verify incoming SIG records.
pub struct NodeVerifyingKey {
    raw: Vec<u8>,
}

impl NodeVerifyingKey {
    pub fn from_bytes(raw: &[u8]) -> Self {
        Self { raw: raw.to_vec() }
    }

    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        let key = UnparsedPublicKey::new(&ECDSA_P256_SHA256_FIXED, &self.raw);
        key.verify(message, signature)
            .map_err(|_| Error::Protocol("SIG record signature verification failed".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_roundtrip() {
        let pkcs8 = NodeKeyPair::generate_pkcs8().unwrap();
        let pair = NodeKeyPair::from_pkcs8(&pkcs8).unwrap();
        let verifying = NodeVerifyingKey::from_bytes(pair.public_key_bytes());

        let msg = b"initiator-kex || responder-kex || label";
        let sig = pair.sign(msg).unwrap();
        assert!(verifying.verify(msg, &sig).is_ok());
    }

    #[test]
    fn tampered_message_fails_verification() {
        let pkcs8 = NodeKeyPair::generate_pkcs8().unwrap();
        let pair = NodeKeyPair::from_pkcs8(&pkcs8).unwrap();
        let verifying = NodeVerifyingKey::from_bytes(pair.public_key_bytes());

        let sig = pair.sign(b"original").unwrap();
        assert!(verifying.verify(b"tampered", &sig).is_err());
    }

    #[test]
    fn wrong_key_fails_verification() {
        let pkcs8_a = NodeKeyPair::generate_pkcs8().unwrap();
        let pair_a = NodeKeyPair::from_pkcs8(&pkcs8_a).unwrap();
        let pkcs8_b = NodeKeyPair::generate_pkcs8().unwrap();
        let pair_b = NodeKeyPair::from_pkcs8(&pkcs8_b).unwrap();

        let verifying_b = NodeVerifyingKey::from_bytes(pair_b.public_key_bytes());
        let sig = pair_a.sign(b"message").unwrap();
        assert!(verifying_b.verify(b"message", &sig).is_err());
    }
}
