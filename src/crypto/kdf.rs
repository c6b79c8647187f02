// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! HKDF-SHA256 session key derivation (§4.1 step 4, §4.1a).
//!
//! Adapted from the teacher's
//! `security::crypto::session_keys::SessionKeyManager::derive_session_key`:
//! same HKDF-Extract/Expand shape, generalized to derive a *pair* of
//! directionally distinct keys from one shared secret by expanding twice
//! under different `info` labels, so that A's send key is B's receive key
//! and vice versa (§4.1, §8 "Handshake symmetry").

use crate::error::{Error, Result};
use ring::hkdf::{Salt, HKDF_SHA256};

const LABEL_INITIATOR_TO_RESPONDER: &[u8] = b"meshwire sptps initiator-to-responder";
const LABEL_RESPONDER_TO_INITIATOR: &[u8] = b"meshwire sptps responder-to-initiator";

/// The two directional keys derived from one completed KEX. Both peers
/// derive the same pair; each picks `initiator_to_responder` as its send
/// key if it initiated the handshake, `responder_to_initiator` otherwise
/// (and the receive key is whichever one it didn't pick).
pub struct SessionKeys {
    pub initiator_to_responder: [u8; 32],
    pub responder_to_initiator: [u8; 32],
}

/// Derives both directional session keys from the raw ECDH shared secret
/// and the two handshake nonces (§4.1: "HKDF(ECDH-shared, label || nonces)").
/// `initiator_nonce`/`responder_nonce` are the 32-byte random values each
/// side contributed to its KEX record.
pub fn derive_session_keys(
    shared_secret: &[u8],
    initiator_nonce: &[u8],
    responder_nonce: &[u8],
) -> Result<SessionKeys> {
    let mut salt_material = Vec::with_capacity(initiator_nonce.len() + responder_nonce.len());
    salt_material.extend_from_slice(initiator_nonce);
    salt_material.extend_from_slice(responder_nonce);

    let salt = Salt::new(HKDF_SHA256, &salt_material);
    let prk = salt.extract(shared_secret);

    let mut initiator_to_responder = [0u8; 32];
    prk.expand(&[LABEL_INITIATOR_TO_RESPONDER], HKDF_SHA256)
        .map_err(|_| Error::Internal("HKDF expand failed".into()))?
        .fill(&mut initiator_to_responder)
        .map_err(|_| Error::Internal("HKDF fill failed".into()))?;

    let mut responder_to_initiator = [0u8; 32];
    prk.expand(&[LABEL_RESPONDER_TO_INITIATOR], HKDF_SHA256)
        .map_err(|_| Error::Internal("HKDF expand failed".into()))?
        .fill(&mut responder_to_initiator)
        .map_err(|_| Error::Internal("HKDF fill failed".into()))?;

    Ok(SessionKeys {
        initiator_to_responder,
        responder_to_initiator,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic() {
        let secret = vec![0x42; 32];
        let a = derive_session_keys(&secret, b"nonce-a", b"nonce-b").unwrap();
        let b = derive_session_keys(&secret, b"nonce-a", b"nonce-b").unwrap();
        assert_eq!(a.initiator_to_responder, b.initiator_to_responder);
        assert_eq!(a.responder_to_initiator, b.responder_to_initiator);
    }

    #[test]
    fn the_two_directional_keys_differ() {
        let secret = vec![0x42; 32];
        let keys = derive_session_keys(&secret, b"nonce-a", b"nonce-b").unwrap();
        assert_ne!(keys.initiator_to_responder, keys.responder_to_initiator);
    }

    #[test]
    fn different_nonces_produce_different_keys() {
        let secret = vec![0x42; 32];
        let a = derive_session_keys(&secret, b"nonce-a", b"nonce-b").unwrap();
        let b = derive_session_keys(&secret, b"nonce-x", b"nonce-y").unwrap();
        assert_ne!(a.initiator_to_responder, b.initiator_to_responder);
    }

    #[test]
    fn both_sides_agree_on_the_send_recv_pair() {
        let secret = vec![0x11; 32];
        let initiator_view = derive_session_keys(&secret, b"n1", b"n2").unwrap();
        let responder_view = derive_session_keys(&secret, b"n1", b"n2").unwrap();

        let initiator_send = initiator_view.initiator_to_responder;
        let responder_recv = responder_view.initiator_to_responder;
        assert_eq!(initiator_send, responder_recv);
    }
}
