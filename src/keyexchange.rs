// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! REQ_KEY/ANS_KEY bridge between the MetaChannel control plane and a
//! destination's per-peer `SessionProto` (§4.7).
//!
//! The wire only gives us two opcodes for this, but `SessionProto`'s
//! mutual handshake needs up to four handshake sub-message flights to
//! fully settle. We get away with it the way real mesh VPNs do: `ANS_KEY`
//! is reused in both directions for the same `(source, target)` pair
//! (whoever currently owes a reply sends the next one), and each side
//! marks its key usable via `SessionProto::has_keys` the moment its own
//! ciphers are derived — which happens mid-handshake, not only once the
//! formal `Established` phase is reached on both ends (§3 `validkey`).

use crate::compression;
use crate::config::KEY_REQUEST_RETRY_SECS;
use crate::crypto::{NodeKeyPair, NodeVerifyingKey};
use crate::error::{Error, Result};
use crate::node::Node;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Effect the driver (mesh.rs) must carry out: send a line, or deliver a
/// previously-blocked datagram now that keys are ready.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyExchangeAction {
    SendReqKey {
        source: String,
        target: String,
        payload: Vec<u8>,
    },
    SendAnsKey {
        source: String,
        target: String,
        payload: Vec<u8>,
        compression: Option<u8>,
    },
    KeyEstablished {
        peer: String,
        flush_datagram: Option<Vec<u8>>,
    },
}

/// Tracks at most one queued datagram per destination, released once that
/// destination's key exchange completes (§9: "the packet that triggered
/// the request is retried once keys land, nothing older is kept").
#[derive(Default)]
pub struct KeyExchange {
    queued: HashMap<String, Vec<u8>>,
}

impl KeyExchange {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts (or retries) a key request toward `dest`. No-op if a request
    /// is already outstanding and the retry interval hasn't elapsed
    /// (§4.7: "retried every `KEY_REQUEST_RETRY_SECS` while waitingforkey").
    pub fn request(
        &mut self,
        self_name: &str,
        dest: &mut Node,
        now: Instant,
        datagram: Option<&[u8]>,
    ) -> Result<Option<KeyExchangeAction>> {
        if let Some(bytes) = datagram {
            self.queued.insert(dest.name.clone(), bytes.to_vec());
        }

        let retry_due = match dest.last_key_request {
            None => true,
            Some(sent_at) => now.duration_since(sent_at) >= Duration::from_secs(KEY_REQUEST_RETRY_SECS),
        };
        if dest.waitingforkey && !retry_due {
            return Ok(None);
        }

        dest.waitingforkey = true;
        dest.last_key_request = Some(now);
        let kex = dest.session.start_handshake()?;
        Ok(Some(KeyExchangeAction::SendReqKey {
            source: self_name.to_string(),
            target: dest.name.clone(),
            payload: kex.payload,
        }))
    }

    /// Handles an inbound `REQ_KEY` addressed to us as `target`. `peer` is
    /// this node's view of `source`.
    pub fn on_req_key(
        &mut self,
        source: &str,
        target: &str,
        peer: &mut Node,
        self_key: &NodeKeyPair,
        payload: &[u8],
    ) -> Result<KeyExchangeAction> {
        let peer_key = NodeVerifyingKey::from_bytes(&peer.pubkey);
        let reply = peer
            .session
            .receive_handshake(payload, self_key, &peer_key)?
            .ok_or_else(|| Error::Protocol("REQ_KEY handshake produced no reply".into()))?;

        Ok(KeyExchangeAction::SendAnsKey {
            source: source.to_string(),
            target: target.to_string(),
            payload: reply.payload,
            compression: Some(compression::negotiate(compression::LEVEL_MAX)),
        })
    }

    /// Handles an inbound `ANS_KEY` for the `(source, target)` transaction
    /// we're a party to. `peer` is this node's view of whichever of
    /// `source`/`target` is not us. May produce a further `ANS_KEY` to send
    /// back, a `KeyEstablished` once our own ciphers land, or both.
    pub fn on_ans_key(
        &mut self,
        source: &str,
        target: &str,
        peer: &mut Node,
        self_key: &NodeKeyPair,
        payload: &[u8],
        peer_compression: Option<u8>,
    ) -> Result<Vec<KeyExchangeAction>> {
        let peer_key = NodeVerifyingKey::from_bytes(&peer.pubkey);
        let had_keys = peer.session.has_keys();
        let reply = peer.session.receive_handshake(payload, self_key, &peer_key)?;

        let mut actions = Vec::new();
        if let Some(record) = reply {
            actions.push(KeyExchangeAction::SendAnsKey {
                source: source.to_string(),
                target: target.to_string(),
                payload: record.payload,
                compression: Some(compression::negotiate(compression::LEVEL_MAX)),
            });
        }

        if !had_keys && peer.session.has_keys() {
            peer.validkey = true;
            peer.waitingforkey = false;
            if let Some(level) = peer_compression {
                peer.compression = Some(compression::negotiate(level));
            }
            actions.push(KeyExchangeAction::KeyEstablished {
                peer: peer.name.clone(),
                flush_datagram: self.queued.remove(&peer.name),
            });
        }
        Ok(actions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> NodeKeyPair {
        let pkcs8 = NodeKeyPair::generate_pkcs8().unwrap();
        NodeKeyPair::from_pkcs8(&pkcs8).unwrap()
    }

    #[test]
    fn request_sets_waitingforkey_and_returns_req_key() {
        let mut kx = KeyExchange::new();
        let mut dest = Node::new("bob".into(), vec![]);
        let now = Instant::now();

        let action = kx.request("alice", &mut dest, now, Some(b"hello")).unwrap();
        assert!(dest.waitingforkey);
        match action {
            Some(KeyExchangeAction::SendReqKey { source, target, payload }) => {
                assert_eq!(source, "alice");
                assert_eq!(target, "bob");
                assert!(!payload.is_empty());
            }
            other => panic!("expected SendReqKey, got {other:?}"),
        }
    }

    #[test]
    fn request_is_a_no_op_before_retry_interval_elapses() {
        let mut kx = KeyExchange::new();
        let mut dest = Node::new("bob".into(), vec![]);
        let now = Instant::now();
        assert!(kx.request("alice", &mut dest, now, None).unwrap().is_some());
        let retried = kx.request("alice", &mut dest, now + Duration::from_secs(1), None).unwrap();
        assert!(retried.is_none());
    }

    #[test]
    fn request_retries_after_interval_elapses() {
        let mut kx = KeyExchange::new();
        let mut dest = Node::new("bob".into(), vec![]);
        let now = Instant::now();
        assert!(kx.request("alice", &mut dest, now, None).unwrap().is_some());
        let later = now + Duration::from_secs(KEY_REQUEST_RETRY_SECS + 1);
        assert!(kx.request("alice", &mut dest, later, None).unwrap().is_some());
    }

    #[test]
    fn three_message_exchange_establishes_keys_on_both_sides_and_flushes_queued_datagram() {
        let source_key = keypair();
        let target_key = keypair();

        let mut source_kx = KeyExchange::new();
        let mut target_kx = KeyExchange::new();
        // Each side's Node-for-the-other-party holds that party's long-term
        // key and the per-peer SessionProto for this transaction.
        let mut source_view_of_target = Node::new("target".into(), target_key.public_key_bytes().to_vec());
        let mut target_view_of_source = Node::new("source".into(), source_key.public_key_bytes().to_vec());

        let now = Instant::now();
        let req = source_kx
            .request("source", &mut source_view_of_target, now, Some(b"payload"))
            .unwrap()
            .unwrap();
        let (source, target, req_payload) = match req {
            KeyExchangeAction::SendReqKey { source, target, payload } => (source, target, payload),
            other => panic!("expected SendReqKey, got {other:?}"),
        };

        let ans1 = target_kx
            .on_req_key(&source, &target, &mut target_view_of_source, &target_key, &req_payload)
            .unwrap();
        let (ans1_payload, ans1_compression) = match ans1 {
            KeyExchangeAction::SendAnsKey { payload, compression, .. } => (payload, compression),
            other => panic!("expected SendAnsKey, got {other:?}"),
        };
        assert!(!target_view_of_source.validkey);

        let source_actions = source_kx
            .on_ans_key(
                &source,
                &target,
                &mut source_view_of_target,
                &source_key,
                &ans1_payload,
                ans1_compression,
            )
            .unwrap();
        assert!(source_view_of_target.validkey, "source must have keys after the first ANS_KEY");
        let flushed = source_actions.iter().find_map(|a| match a {
            KeyExchangeAction::KeyEstablished { flush_datagram, .. } => Some(flush_datagram.clone()),
            _ => None,
        });
        assert_eq!(flushed, Some(Some(b"payload".to_vec())));

        let ans2 = source_actions
            .into_iter()
            .find_map(|a| match a {
                KeyExchangeAction::SendAnsKey { payload, compression, .. } => Some((payload, compression)),
                _ => None,
            })
            .expect("source owes a second ANS_KEY carrying its SIG+ACK");

        let target_actions = target_kx
            .on_ans_key(
                &source,
                &target,
                &mut target_view_of_source,
                &target_key,
                &ans2.0,
                ans2.1,
            )
            .unwrap();
        assert!(target_view_of_source.validkey, "target must have keys after the second ANS_KEY");
        assert!(target_actions
            .iter()
            .any(|a| matches!(a, KeyExchangeAction::KeyEstablished { .. })));

        let (seqno, ciphertext, _) = source_view_of_target.session.seal(1, b"datagram").unwrap();
        let opened = target_view_of_source.session.open(1, seqno, &ciphertext);
        assert_eq!(opened, Some(b"datagram".to_vec()));
    }
}
