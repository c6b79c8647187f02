// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SessionProto (SPTPS): authenticated, encrypted per-peer record stream
//! with forward-secret rekey (§4.1, §4.1a).

pub mod replay;

pub use replay::{ReplayOutcome, ReplayWindow};

use crate::config::{REKEY_AFTER_RECORDS, REPLAY_WINDOW_DEFAULT};
use crate::crypto::{derive_session_keys, ChaChaCipher, EphemeralKeyExchange, NodeKeyPair, NodeVerifyingKey};
use crate::error::{Error, Result};
use ring::rand::{SecureRandom, SystemRandom};

/// Wire record type tags (§4.1). Values < `HANDSHAKE` are application
/// record types and may combine `PKT_COMPRESSED`/`PKT_MAC` as flag bits.
pub const REC_HANDSHAKE: u8 = 128;
pub const REC_ALERT: u8 = 129;
pub const REC_CLOSE: u8 = 130;

pub const PKT_PROBE: u8 = 0;
pub const PKT_COMPRESSED: u8 = 0x02;
pub const PKT_MAC: u8 = 0x04;

const HS_KEX: u8 = 1;
const HS_SIG: u8 = 2;
const HS_ACK: u8 = 3;

const NONCE_LEN: usize = 32;

/// Handshake phase (§3 `SessionState`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Kex,
    SecondaryKex,
    Sig,
    Ack,
    Established,
}

/// Which side of the handshake this instance played; determines which of
/// the two HKDF-derived keys is the send key versus the receive key
/// (§4.1 step 4, §8 "Handshake symmetry").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// One fully-framed outgoing record: `(type, payload)`. Streamed-mode
/// callers prefix `length:u16` themselves (§4.1 "In streamed mode length
/// prefixes the payload"); datagram-mode callers send `payload` as-is and
/// let the UDP datagram boundary delimit the record.
pub struct OutgoingRecord {
    pub record_type: u8,
    pub payload: Vec<u8>,
}

struct HandshakeState {
    role: Role,
    local_nonce: [u8; NONCE_LEN],
    local_ephemeral: Option<EphemeralKeyExchange>,
    local_kex_bytes: Vec<u8>,
    peer_kex_bytes: Option<Vec<u8>>,
    peer_sig_verified: bool,
    shared_secret: Option<Vec<u8>>,
}

/// Per-peer authenticated/encrypted record stream (§3 `SessionState`,
/// §4.1). Datagram and streamed modes share this state machine; the
/// caller decides per-send whether to go out over UDP or the MetaChannel.
pub struct SessionProto {
    phase: Phase,
    handshake: Option<HandshakeState>,

    send_cipher: Option<ChaChaCipher>,
    recv_cipher: Option<ChaChaCipher>,

    out_seqno: u32,
    records_sent_this_epoch: u64,

    replay: ReplayWindow,
    dropped_mac_failures: u64,
}

impl SessionProto {
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            handshake: None,
            send_cipher: None,
            recv_cipher: None,
            out_seqno: 0,
            records_sent_this_epoch: 0,
            replay: ReplayWindow::new(REPLAY_WINDOW_DEFAULT),
            dropped_mac_failures: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_established(&self) -> bool {
        self.phase == Phase::Established
    }

    /// Whether `seal`/`open` will actually work right now. `finish_key_derivation`
    /// runs partway through the handshake (inside `on_peer_sig`), so traffic can
    /// flow a message or two before `phase` formally reaches `Established`
    /// (§4.7: REQ_KEY/ANS_KEY only round-trips enough messages for both sides
    /// to derive keys, not necessarily to finish the symmetric ACK exchange).
    pub fn has_keys(&self) -> bool {
        self.send_cipher.is_some() && self.recv_cipher.is_some()
    }

    pub fn dropped_mac_failures(&self) -> u64 {
        self.dropped_mac_failures
    }

    /// Tears the session down to `Idle`, discarding all cryptographic
    /// state (§4.4: reachable -> unreachable transition).
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Starts a handshake as the initiator (§4.1 step 1): generates a
    /// fresh ephemeral keypair and nonce and returns the KEX record to send.
    pub fn start_handshake(&mut self) -> Result<OutgoingRecord> {
        self.begin_kex(Role::Initiator)
    }

    /// Begins (or restarts, for rekey) the KEX exchange for either role.
    fn begin_kex(&mut self, role: Role) -> Result<OutgoingRecord> {
        let ephemeral = EphemeralKeyExchange::generate()?;
        let mut nonce = [0u8; NONCE_LEN];
        SystemRandom::new()
            .fill(&mut nonce)
            .map_err(|_| Error::Internal("RNG failure generating handshake nonce".into()))?;

        let mut kex_bytes = Vec::with_capacity(NONCE_LEN + ephemeral.public_bytes().len());
        kex_bytes.extend_from_slice(&nonce);
        kex_bytes.extend_from_slice(ephemeral.public_bytes());

        self.phase = if self.phase == Phase::Established {
            Phase::SecondaryKex
        } else {
            Phase::Kex
        };
        self.handshake = Some(HandshakeState {
            role,
            local_nonce: nonce,
            local_ephemeral: Some(ephemeral),
            local_kex_bytes: kex_bytes.clone(),
            peer_kex_bytes: None,
            peer_sig_verified: false,
            shared_secret: None,
        });

        Ok(OutgoingRecord {
            record_type: REC_HANDSHAKE,
            payload: frame_handshake(HS_KEX, &kex_bytes),
        })
    }

    /// Processes one incoming HANDSHAKE record and returns the next record
    /// to send, if any (§4.1 steps 1-4). `self_key` signs outgoing SIG
    /// records; `peer_key` verifies the peer's.
    pub fn receive_handshake(
        &mut self,
        payload: &[u8],
        self_key: &NodeKeyPair,
        peer_key: &NodeVerifyingKey,
    ) -> Result<Option<OutgoingRecord>> {
        let mut remaining = payload;
        let mut out_frames: Vec<(u8, Vec<u8>)> = Vec::new();

        while !remaining.is_empty() {
            let (msg_type, body, rest) = unframe_handshake_one(remaining)?;
            remaining = rest;

            let produced = match msg_type {
                HS_KEX => self.on_peer_kex(body, self_key)?,
                HS_SIG => self.on_peer_sig(body, peer_key, self_key)?,
                HS_ACK => self.on_peer_ack()?,
                other => return Err(Error::Protocol(format!("unknown handshake message type {other}"))),
            };
            out_frames.extend(produced);
        }

        if out_frames.is_empty() {
            return Ok(None);
        }
        let mut payload_out = Vec::new();
        for (msg_type, body) in &out_frames {
            payload_out.extend(frame_handshake(*msg_type, body));
        }
        Ok(Some(OutgoingRecord {
            record_type: REC_HANDSHAKE,
            payload: payload_out,
        }))
    }

    /// Processes one peer KEX sub-message, returning the handshake
    /// sub-messages (type, body) this side now owes in reply — zero, one,
    /// or (for the responder's first reply) two, collapsed by the caller
    /// into a single record (§4.1 step 2).
    fn on_peer_kex(&mut self, body: &[u8], self_key: &NodeKeyPair) -> Result<Vec<(u8, Vec<u8>)>> {
        if body.len() <= NONCE_LEN {
            return Err(Error::Protocol("KEX record too short".into()));
        }

        let responder_initiated = self.handshake.is_none();
        if responder_initiated {
            // We are the responder: generate our own KEX reply before
            // continuing (§4.1 step 2: "Responder replies KEX then SIG").
            self.begin_kex(Role::Responder)?;
        }

        let hs = self
            .handshake
            .as_mut()
            .ok_or_else(|| Error::Internal("handshake state missing after begin_kex".into()))?;
        hs.peer_kex_bytes = Some(body.to_vec());

        let ephemeral = hs
            .local_ephemeral
            .take()
            .ok_or_else(|| Error::Internal("ephemeral key already consumed".into()))?;
        let peer_pub = &body[NONCE_LEN..];
        let shared = ephemeral.agree(peer_pub)?;
        hs.shared_secret = Some(shared);

        self.phase = Phase::Sig;

        if !responder_initiated {
            // We are the initiator reacting to the responder's KEX+SIG
            // reply: the accompanying SIG sub-message in this same record
            // is handled by `on_peer_sig` right after this call returns, so
            // there is nothing to send yet.
            return Ok(Vec::new());
        }

        // Responder: reply with our own KEX then immediately our SIG
        // (§4.1 step 2 collapses KEX+SIG into a single flight here). We
        // haven't seen the initiator's SIG yet, so this is the only place
        // that produces our half of the mutual proof.
        let role = hs.role;
        let (initiator_kex, responder_kex) = match role {
            Role::Initiator => (hs.local_kex_bytes.clone(), body.to_vec()),
            Role::Responder => (body.to_vec(), hs.local_kex_bytes.clone()),
        };

        let mut sig_message = Vec::with_capacity(initiator_kex.len() + responder_kex.len() + 5);
        sig_message.extend_from_slice(&initiator_kex);
        sig_message.extend_from_slice(&responder_kex);
        sig_message.extend_from_slice(b"sptps");

        let signature = self_key.sign(&sig_message)?;
        Ok(vec![(HS_KEX, hs.local_kex_bytes.clone()), (HS_SIG, signature)])
    }

    fn on_peer_sig(
        &mut self,
        signature: &[u8],
        peer_key: &NodeVerifyingKey,
        self_key: &NodeKeyPair,
    ) -> Result<Vec<(u8, Vec<u8>)>> {
        let hs = self
            .handshake
            .as_mut()
            .ok_or_else(|| Error::Protocol("SIG received before KEX".into()))?;
        let peer_kex = hs
            .peer_kex_bytes
            .clone()
            .ok_or_else(|| Error::Protocol("SIG received before peer KEX".into()))?;

        let (initiator_kex, responder_kex) = match hs.role {
            Role::Initiator => (hs.local_kex_bytes.clone(), peer_kex),
            Role::Responder => (peer_kex, hs.local_kex_bytes.clone()),
        };
        let mut sig_message = Vec::with_capacity(initiator_kex.len() + responder_kex.len() + 5);
        sig_message.extend_from_slice(&initiator_kex);
        sig_message.extend_from_slice(&responder_kex);
        sig_message.extend_from_slice(b"sptps");

        peer_key.verify(&sig_message, signature)?;
        hs.peer_sig_verified = true;

        let role = hs.role;
        match role {
            Role::Initiator => {
                // Initiator verified responder's SIG; now send our own SIG
                // then ACK (§4.1 step 3).
                let our_signature = self_key.sign(&sig_message)?;
                self.phase = Phase::Ack;
                self.finish_key_derivation()?;
                Ok(vec![(HS_SIG, our_signature), (HS_ACK, Vec::new())])
            }
            Role::Responder => {
                // Responder received initiator's SIG; handshake completes
                // on our side once we also send ACK.
                self.phase = Phase::Ack;
                self.finish_key_derivation()?;
                Ok(vec![(HS_ACK, Vec::new())])
            }
        }
    }

    fn on_peer_ack(&mut self) -> Result<Vec<(u8, Vec<u8>)>> {
        if self.send_cipher.is_none() || self.recv_cipher.is_none() {
            self.finish_key_derivation()?;
        }
        self.phase = Phase::Established;
        self.handshake = None;
        Ok(Vec::new())
    }

    fn finish_key_derivation(&mut self) -> Result<()> {
        let hs = self
            .handshake
            .as_ref()
            .ok_or_else(|| Error::Internal("handshake state missing at key derivation".into()))?;
        if !hs.peer_sig_verified {
            return Err(Error::Protocol("key derivation attempted before SIG verified".into()));
        }
        let shared = hs
            .shared_secret
            .as_ref()
            .ok_or_else(|| Error::Internal("no shared secret at key derivation".into()))?;
        let peer_kex = hs
            .peer_kex_bytes
            .as_ref()
            .ok_or_else(|| Error::Internal("no peer KEX at key derivation".into()))?;

        let local_nonce = &hs.local_nonce[..];
        let peer_nonce = &peer_kex[..NONCE_LEN];
        let (initiator_nonce, responder_nonce): (&[u8], &[u8]) = match hs.role {
            Role::Initiator => (local_nonce, peer_nonce),
            Role::Responder => (peer_nonce, local_nonce),
        };

        let keys = derive_session_keys(shared, initiator_nonce, responder_nonce)?;
        let (send_key, recv_key) = match hs.role {
            Role::Initiator => (keys.initiator_to_responder, keys.responder_to_initiator),
            Role::Responder => (keys.responder_to_initiator, keys.initiator_to_responder),
        };

        self.send_cipher = Some(ChaChaCipher::new(send_key));
        self.recv_cipher = Some(ChaChaCipher::new(recv_key));
        self.out_seqno = 0;
        self.records_sent_this_epoch = 0;
        Ok(())
    }

    /// Seals an application payload for the current epoch (§4.1
    /// "Encryption"). Returns the cleartext seqno alongside the ciphertext
    /// for datagram framing and whether a rekey should now be initiated
    /// (§4.1 "Rekey": "After 2^30 outgoing records ... issues SECONDARY_KEX").
    pub fn seal(&mut self, record_type: u8, plaintext: &[u8]) -> Result<(u32, Vec<u8>, bool)> {
        let cipher = self
            .send_cipher
            .as_ref()
            .ok_or_else(|| Error::NoKey("session not established".into()))?;
        let seqno = self.out_seqno;
        self.out_seqno = self.out_seqno.wrapping_add(1);
        self.records_sent_this_epoch += 1;

        let ciphertext = cipher.seal(seqno, plaintext, &[record_type])?;
        let needs_rekey = self.records_sent_this_epoch >= REKEY_AFTER_RECORDS;
        Ok((seqno, ciphertext, needs_rekey))
    }

    /// Opens an incoming application record. Runs the replay check first
    /// (§3: "dropped without MAC check") then the AEAD open; MAC failures
    /// are counted, never propagated (§4.1 "Failure").
    pub fn open(&mut self, record_type: u8, seqno: u32, ciphertext: &[u8]) -> Option<Vec<u8>> {
        if self.replay.check(seqno) == ReplayOutcome::Reject {
            return None;
        }
        let cipher = self.recv_cipher.as_ref()?;
        match cipher.open(seqno, ciphertext, &[record_type]) {
            Ok(plaintext) => Some(plaintext),
            Err(_) => {
                self.dropped_mac_failures += 1;
                None
            }
        }
    }
}

impl Default for SessionProto {
    fn default() -> Self {
        Self::new()
    }
}

/// Frames one handshake sub-message as `[type:u8][len:u16 BE][body]`. The
/// explicit length lets `receive_handshake` walk several sub-messages
/// concatenated into one record (responder's KEX+SIG, initiator's SIG+ACK)
/// without the KEX body's trailing bytes bleeding into the next sub-message.
fn frame_handshake(msg_type: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(3 + body.len());
    out.push(msg_type);
    out.extend_from_slice(&(body.len() as u16).to_be_bytes());
    out.extend_from_slice(body);
    out
}

/// Strips one `[type][len][body]` sub-message off the front of `payload`,
/// returning it alongside whatever bytes remain for the next call.
fn unframe_handshake_one(payload: &[u8]) -> Result<(u8, &[u8], &[u8])> {
    if payload.len() < 3 {
        return Err(Error::Protocol("truncated handshake sub-message header".into()));
    }
    let msg_type = payload[0];
    let len = u16::from_be_bytes([payload[1], payload[2]]) as usize;
    let body_start = 3;
    let body_end = body_start
        .checked_add(len)
        .ok_or_else(|| Error::Protocol("handshake sub-message length overflow".into()))?;
    if payload.len() < body_end {
        return Err(Error::Protocol("truncated handshake sub-message body".into()));
    }
    Ok((msg_type, &payload[body_start..body_end], &payload[body_end..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> NodeKeyPair {
        let pkcs8 = NodeKeyPair::generate_pkcs8().unwrap();
        NodeKeyPair::from_pkcs8(&pkcs8).unwrap()
    }

    #[test]
    fn full_handshake_establishes_directionally_matched_keys() {
        let initiator_key = keypair();
        let responder_key = keypair();
        let initiator_verifying = NodeVerifyingKey::from_bytes(initiator_key.public_key_bytes());
        let responder_verifying = NodeVerifyingKey::from_bytes(responder_key.public_key_bytes());

        let mut initiator = SessionProto::new();
        let mut responder = SessionProto::new();

        let kex = initiator.start_handshake().unwrap();
        let kex_sig = responder
            .receive_handshake(&kex.payload, &responder_key, &initiator_verifying)
            .unwrap()
            .expect("responder replies with KEX+SIG");

        let sig_ack = initiator
            .receive_handshake(&kex_sig.payload, &initiator_key, &responder_verifying)
            .unwrap()
            .expect("initiator replies with SIG+ACK");

        let responder_ack = responder
            .receive_handshake(&sig_ack.payload, &responder_key, &initiator_verifying)
            .unwrap()
            .expect("responder replies with ACK");

        let ack_result = initiator
            .receive_handshake(&responder_ack.payload, &initiator_key, &responder_verifying)
            .unwrap();
        assert!(ack_result.is_none());

        assert!(initiator.is_established());
        assert!(responder.is_established());

        let (seqno, ciphertext, _) = initiator.seal(1, b"hello mesh").unwrap();
        let plaintext = responder.open(1, seqno, &ciphertext).unwrap();
        assert_eq!(plaintext, b"hello mesh");

        let (seqno, ciphertext, _) = responder.seal(1, b"reply").unwrap();
        let plaintext = initiator.open(1, seqno, &ciphertext).unwrap();
        assert_eq!(plaintext, b"reply");
    }

    #[test]
    fn combined_kex_sig_reply_is_not_mistaken_for_a_single_oversized_kex() {
        // Regression: the responder's first reply packs KEX+SIG into one
        // record. Before length-prefixed sub-framing, the initiator's KEX
        // parser treated the trailing SIG bytes as part of the ECDH public
        // key and `agree()` rejected it for having the wrong length.
        let initiator_key = keypair();
        let responder_key = keypair();
        let initiator_verifying = NodeVerifyingKey::from_bytes(initiator_key.public_key_bytes());
        let responder_verifying = NodeVerifyingKey::from_bytes(responder_key.public_key_bytes());

        let mut initiator = SessionProto::new();
        let mut responder = SessionProto::new();
        let kex = initiator.start_handshake().unwrap();
        let kex_sig = responder
            .receive_handshake(&kex.payload, &responder_key, &initiator_verifying)
            .unwrap()
            .unwrap();
        assert!(kex_sig.payload.len() > NONCE_LEN + 65);

        let sig_ack = initiator
            .receive_handshake(&kex_sig.payload, &initiator_key, &responder_verifying)
            .unwrap()
            .expect("initiator must parse both the KEX and SIG sub-messages");
        assert_eq!(initiator.phase(), Phase::Ack);

        responder
            .receive_handshake(&sig_ack.payload, &responder_key, &initiator_verifying)
            .unwrap();
        assert!(responder.is_established());
    }

    #[test]
    fn seal_before_established_fails() {
        let mut session = SessionProto::new();
        assert!(session.seal(1, b"x").is_err());
    }

    #[test]
    fn tampered_record_is_dropped_and_counted() {
        let initiator_key = keypair();
        let responder_key = keypair();
        let initiator_verifying = NodeVerifyingKey::from_bytes(initiator_key.public_key_bytes());
        let responder_verifying = NodeVerifyingKey::from_bytes(responder_key.public_key_bytes());

        let mut initiator = SessionProto::new();
        let mut responder = SessionProto::new();
        let kex = initiator.start_handshake().unwrap();
        let kex_sig = responder
            .receive_handshake(&kex.payload, &responder_key, &initiator_verifying)
            .unwrap()
            .unwrap();
        let sig_ack = initiator
            .receive_handshake(&kex_sig.payload, &initiator_key, &responder_verifying)
            .unwrap()
            .unwrap();
        responder
            .receive_handshake(&sig_ack.payload, &responder_key, &initiator_verifying)
            .unwrap();

        let (seqno, mut ciphertext, _) = initiator.seal(1, b"payload").unwrap();
        ciphertext[0] ^= 0xFF;
        assert!(responder.open(1, seqno, &ciphertext).is_none());
        assert_eq!(responder.dropped_mac_failures(), 1);
    }

    #[test]
    fn replayed_record_is_rejected_before_mac_check() {
        let initiator_key = keypair();
        let responder_key = keypair();
        let initiator_verifying = NodeVerifyingKey::from_bytes(initiator_key.public_key_bytes());
        let responder_verifying = NodeVerifyingKey::from_bytes(responder_key.public_key_bytes());

        let mut initiator = SessionProto::new();
        let mut responder = SessionProto::new();
        let kex = initiator.start_handshake().unwrap();
        let kex_sig = responder
            .receive_handshake(&kex.payload, &responder_key, &initiator_verifying)
            .unwrap()
            .unwrap();
        let sig_ack = initiator
            .receive_handshake(&kex_sig.payload, &initiator_key, &responder_verifying)
            .unwrap()
            .unwrap();
        responder
            .receive_handshake(&sig_ack.payload, &responder_key, &initiator_verifying)
            .unwrap();

        let (seqno, ciphertext, _) = initiator.seal(1, b"payload").unwrap();
        assert!(responder.open(1, seqno, &ciphertext).is_some());
        assert!(responder.open(1, seqno, &ciphertext).is_none());
        assert_eq!(responder.dropped_mac_failures(), 0);
    }
}
