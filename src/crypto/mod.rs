// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Crypto primitives binding (§4.1a).
//!
//! The ECDSA/ECDH/ChaCha20-Poly1305 primitives SessionProto treats as an
//! external library are bound here to `ring`, the teacher's crypto
//! dependency: `ring::signature` for long-term node identity, `ring::agreement`
//! for per-session ephemeral ECDH, `ring::hkdf` for session key derivation,
//! and `ring::aead::CHACHA20_POLY1305` via the same `BoundKey`/`NonceSequence`
//! pattern the teacher uses for its AES-256-GCM transform.

pub mod aead;
pub mod ecdh;
pub mod kdf;
pub mod signing;

pub use aead::ChaChaCipher;
pub use ecdh::EphemeralKeyExchange;
pub use kdf::derive_session_keys;
pub use signing::{NodeKeyPair, NodeVerifyingKey};
