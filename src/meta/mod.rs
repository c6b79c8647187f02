// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MetaChannel: the TCP control-plane connection state machine (§4.5).
//!
//! Grounded in the teacher's `discovery_server` request/reply state machine
//! (a connect -> handshake -> steady-state loop driving application-level
//! actions off a byte stream) but replacing its JSON framing with the
//! line-oriented `OP ARGS\n` grammar from `meta::protocol` and its transport
//! security with `session::SessionProto` reused a second time here: once per
//! peer for the UDP datagram tunnel (`Node::session`), and once per
//! MetaChannel for this TCP connection's own confidentiality. The meta-level
//! `ID`/`META_KEY`/`CHALLENGE`/`CHAL_REPLY`/`ACK` opcodes in §4.5 carry
//! exactly the KEX/SIG/ACK sub-messages `SessionProto` already produces, so
//! authentication IS the SPTPS handshake rather than a second scheme.
//!
//! `MetaChannel` itself never touches a socket. It is fed raw bytes via
//! `feed` and produces `MetaEvent`s (lines to write, edges to add, keys to
//! forward); the event loop in `mesh.rs` owns the actual `mio` registration.

pub mod protocol;

use crate::config::{PING_INTERVAL_DEFAULT, PING_TIMEOUT_DEFAULT};
use crate::crypto::{NodeKeyPair, NodeVerifyingKey};
use crate::error::{Error, Result};
use crate::graph::EdgeOptions;
use crate::session::{Role, SessionProto};
use protocol::{LineSplitter, Message, Op};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Edge weight this side advertises for its direct connections. A future
/// `Weight =` host-file override would plug in here; nothing in §3/§4.4
/// names a different default.
const DIRECT_EDGE_WEIGHT: u32 = 1;

/// Effect a `MetaChannel` wants the driver (mesh.rs) to carry out. Actions
/// that need data the channel doesn't own (a peer's long-term key, the
/// `Graph`, `keyexchange` state) are surfaced as events instead of being
/// performed in place.
#[derive(Debug, Clone, PartialEq)]
pub enum MetaEvent {
    /// Write this line to the peer verbatim.
    Send(String),
    /// The peer identified as `peer_name`; the driver must look up (or
    /// learn) its long-term key and call `supply_peer_key` before the
    /// handshake can continue.
    NeedPeerKey { peer_name: String },
    /// Mutual authentication completed; the driver should mark this node
    /// reachable and start its direct edge.
    Authenticated {
        peer_name: String,
        weight: u32,
        options: EdgeOptions,
    },
    EdgeAdd {
        from: String,
        to: String,
        weight: u32,
        options: EdgeOptions,
    },
    EdgeDel {
        from: String,
        to: String,
    },
    ReqKey {
        source: String,
        target: String,
        payload: Vec<u8>,
    },
    AnsKey {
        source: String,
        target: String,
        payload: Vec<u8>,
        compression: Option<u8>,
    },
    /// A PONG arrived; clears the driver's outstanding-ping deadline.
    Pong,
    /// A UDP datagram arrived tunneled over this MetaChannel (§4.6 "UDP
    /// blocked -> fall through to TCP tunneling"). Still sealed under the
    /// sending peer's own `Node::session`; the driver opens and routes it
    /// exactly like a UDP-delivered record.
    Tunnel(Vec<u8>),
    /// The channel must be torn down; `reason` is for logging only.
    Close(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitingId,
    AwaitingPeerKey,
    Handshaking,
    Active,
    Closed,
}

/// One TCP meta-connection's protocol state, independent of the socket that
/// carries it (§4.5, §5: the event loop owns the `mio` side).
pub struct MetaChannel {
    role: Role,
    state: State,
    self_name: String,
    self_key: Arc<NodeKeyPair>,
    peer_name: Option<String>,
    peer_key: Option<NodeVerifyingKey>,
    session: SessionProto,
    splitter: LineSplitter,
    ping_interval: Duration,
    ping_timeout: Duration,
    last_activity: Instant,
    ping_outstanding_since: Option<Instant>,
}

impl MetaChannel {
    /// Constructs a channel for a connection this side dialed out itself
    /// (§4.5 "TCP-connect"). The caller already knows `peer_name` and its
    /// key from `hosts/<name>` before dialing.
    pub fn new_initiator(
        self_name: String,
        self_key: Arc<NodeKeyPair>,
        peer_name: String,
        peer_key: NodeVerifyingKey,
        now: Instant,
    ) -> Self {
        Self {
            role: Role::Initiator,
            state: State::Handshaking,
            self_name,
            self_key,
            peer_name: Some(peer_name),
            peer_key: Some(peer_key),
            session: SessionProto::new(),
            splitter: LineSplitter::new(),
            ping_interval: Duration::from_secs(PING_INTERVAL_DEFAULT),
            ping_timeout: Duration::from_secs(PING_TIMEOUT_DEFAULT),
            last_activity: now,
            ping_outstanding_since: None,
        }
    }

    /// Constructs a channel for an inbound connection accepted before the
    /// peer has identified itself.
    pub fn new_responder(self_name: String, self_key: Arc<NodeKeyPair>, now: Instant) -> Self {
        Self {
            role: Role::Responder,
            state: State::AwaitingId,
            self_name,
            self_key,
            peer_name: None,
            peer_key: None,
            session: SessionProto::new(),
            splitter: LineSplitter::new(),
            ping_interval: Duration::from_secs(PING_INTERVAL_DEFAULT),
            ping_timeout: Duration::from_secs(PING_TIMEOUT_DEFAULT),
            last_activity: now,
            ping_outstanding_since: None,
        }
    }

    pub fn peer_name(&self) -> Option<&str> {
        self.peer_name.as_deref()
    }

    pub fn is_active(&self) -> bool {
        self.state == State::Active
    }

    /// The first line(s) this side must send before anything arrives
    /// (§4.5 step 1: "ID exchange"; the initiator also already knows the
    /// peer's key, so it can launch straight into META_KEY).
    pub fn start(&mut self) -> Result<Vec<MetaEvent>> {
        let mut events = vec![MetaEvent::Send(
            Message::new(Op::Id, vec![self.self_name.clone()]).encode(),
        )];
        if self.role == Role::Initiator {
            let kex = self.session.start_handshake()?;
            events.push(MetaEvent::Send(
                Message::new(Op::MetaKey, vec![protocol::encode_binary(&kex.payload)]).encode(),
            ));
        }
        Ok(events)
    }

    /// Supplies the peer's long-term key once the driver has resolved it
    /// (from `hosts/<name>` or a first-contact learn policy), unblocking a
    /// responder channel that returned `MetaEvent::NeedPeerKey`.
    pub fn supply_peer_key(&mut self, key: NodeVerifyingKey) -> Result<Vec<MetaEvent>> {
        if self.state != State::AwaitingPeerKey {
            return Err(Error::Protocol("peer key supplied out of sequence".into()));
        }
        self.peer_key = Some(key);
        self.state = State::Handshaking;
        Ok(Vec::new())
    }

    /// Feeds newly-read bytes in and returns every event they produced, in
    /// order. A malformed line or handshake failure yields a trailing
    /// `MetaEvent::Close` and the caller should drop the connection.
    pub fn feed(&mut self, bytes: &[u8], now: Instant) -> Vec<MetaEvent> {
        self.last_activity = now;
        self.ping_outstanding_since = None;
        let lines = self.splitter.feed(bytes);
        let mut events = Vec::new();
        for line in lines {
            match self.handle_line(&line) {
                Ok(mut produced) => events.append(&mut produced),
                Err(e) => {
                    events.push(MetaEvent::Close(e.to_string()));
                    self.state = State::Closed;
                    break;
                }
            }
            if self.state == State::Closed {
                break;
            }
        }
        events
    }

    /// Periodic tick: emits a PING when idle past `ping_interval`, and a
    /// `Close` if a PING went unanswered past `ping_timeout` (§4.5).
    pub fn tick(&mut self, now: Instant) -> Vec<MetaEvent> {
        if self.state != State::Active {
            return Vec::new();
        }
        if let Some(sent_at) = self.ping_outstanding_since {
            if now.duration_since(sent_at) >= self.ping_timeout {
                self.state = State::Closed;
                return vec![MetaEvent::Close("PONG timeout".into())];
            }
            return Vec::new();
        }
        if now.duration_since(self.last_activity) >= self.ping_interval {
            self.ping_outstanding_since = Some(now);
            return vec![MetaEvent::Send(Message::new(Op::Ping, Vec::new()).encode())];
        }
        Vec::new()
    }

    /// Encodes a message for the caller to send once `is_active()` (used by
    /// `keyexchange.rs` to emit REQ_KEY/ANS_KEY and by `mesh.rs` for
    /// ADD_EDGE/DEL_EDGE propagation).
    pub fn encode(&self, op: Op, args: Vec<String>) -> String {
        Message::new(op, args).encode()
    }

    fn handle_line(&mut self, line: &str) -> Result<Vec<MetaEvent>> {
        let msg = Message::decode(line)?;
        match (self.state, msg.op) {
            (State::AwaitingId, Op::Id) => self.on_id(msg),
            (State::Handshaking, Op::MetaKey | Op::Challenge | Op::ChalReply | Op::Ack) => {
                self.on_handshake_message(msg)
            }
            (State::Active, Op::Ping) => {
                Ok(vec![MetaEvent::Send(Message::new(Op::Pong, Vec::new()).encode())])
            }
            (State::Active, Op::Pong) => Ok(vec![MetaEvent::Pong]),
            (State::Active, Op::AddEdge) => self.on_add_edge(msg),
            (State::Active, Op::DelEdge) => self.on_del_edge(msg),
            (State::Active, Op::AddSubnet | Op::DelSubnet) => Ok(Vec::new()),
            (State::Active, Op::ReqKey) => self.on_req_key(msg),
            (State::Active, Op::AnsKey) => self.on_ans_key(msg),
            (State::Active, Op::KeyChanged) => Ok(Vec::new()),
            (State::Active, Op::Status) => self.on_status(msg),
            (_, Op::Status) => Ok(Vec::new()),
            (_, Op::Error) => Err(Error::Protocol(format!("peer reported ERROR: {:?}", msg.args))),
            (_, Op::Terminal) => Err(Error::Protocol("peer sent TERMINAL".into())),
            (state, op) => Err(Error::Protocol(format!("unexpected {op:?} in state {state:?}"))),
        }
    }

    fn on_id(&mut self, msg: Message) -> Result<Vec<MetaEvent>> {
        let name = msg
            .args
            .first()
            .ok_or_else(|| Error::Protocol("ID with no name".into()))?
            .clone();
        self.peer_name = Some(name.clone());
        if self.peer_key.is_some() {
            self.state = State::Handshaking;
            Ok(Vec::new())
        } else {
            self.state = State::AwaitingPeerKey;
            Ok(vec![MetaEvent::NeedPeerKey { peer_name: name }])
        }
    }

    fn on_handshake_message(&mut self, msg: Message) -> Result<Vec<MetaEvent>> {
        let token = msg
            .args
            .first()
            .ok_or_else(|| Error::Protocol(format!("{:?} with no payload", msg.op)))?;
        let payload = protocol::decode_binary(token)?;

        let self_key = Arc::clone(&self.self_key);
        let peer_key = self
            .peer_key
            .as_ref()
            .ok_or_else(|| Error::Protocol("handshake message before peer key known".into()))?;
        let reply = self.session.receive_handshake(&payload, &self_key, peer_key)?;

        let mut events = Vec::new();
        if let Some(record) = reply {
            let op = match msg.op {
                Op::MetaKey => Op::Challenge,
                Op::Challenge => Op::ChalReply,
                Op::ChalReply => Op::Ack,
                Op::Ack => unreachable!("ACK never produces a further reply"),
                other => other,
            };
            let token = protocol::encode_binary(&record.payload);
            let args = if op == Op::Ack {
                vec![
                    token,
                    DIRECT_EDGE_WEIGHT.to_string(),
                    "0".to_string(),
                ]
            } else {
                vec![token]
            };
            events.push(MetaEvent::Send(Message::new(op, args).encode()));
        }

        if self.session.is_established() && self.state != State::Active {
            self.state = State::Active;
            let peer_name = self
                .peer_name
                .clone()
                .ok_or_else(|| Error::Internal("established session with no peer name".into()))?;
            events.push(MetaEvent::Authenticated {
                peer_name,
                weight: DIRECT_EDGE_WEIGHT,
                options: 0,
            });
        }
        Ok(events)
    }

    fn on_add_edge(&mut self, msg: Message) -> Result<Vec<MetaEvent>> {
        let [from, to, weight, options] = take4(&msg.args)?;
        Ok(vec![MetaEvent::EdgeAdd {
            from,
            to,
            weight: weight
                .parse()
                .map_err(|_| Error::Protocol("ADD_EDGE weight is not a number".into()))?,
            options: options
                .parse()
                .map_err(|_| Error::Protocol("ADD_EDGE options is not a number".into()))?,
        }])
    }

    fn on_del_edge(&mut self, msg: Message) -> Result<Vec<MetaEvent>> {
        let mut args = msg.args.into_iter();
        let from = args.next().ok_or_else(|| Error::Protocol("DEL_EDGE missing from".into()))?;
        let to = args.next().ok_or_else(|| Error::Protocol("DEL_EDGE missing to".into()))?;
        Ok(vec![MetaEvent::EdgeDel { from, to }])
    }

    /// Decodes a tunneled SPTPS datagram carried in a STATUS line (§4.6).
    /// `STATUS` has no other use in this protocol, so its one payload
    /// argument is always a base64 datagram.
    fn on_status(&mut self, msg: Message) -> Result<Vec<MetaEvent>> {
        let token = msg.args.first().ok_or_else(|| Error::Protocol("STATUS with no payload".into()))?;
        let payload = protocol::decode_binary(token)?;
        Ok(vec![MetaEvent::Tunnel(payload)])
    }

    fn on_req_key(&mut self, msg: Message) -> Result<Vec<MetaEvent>> {
        let mut args = msg.args.into_iter();
        let source = args.next().ok_or_else(|| Error::Protocol("REQ_KEY missing source".into()))?;
        let target = args.next().ok_or_else(|| Error::Protocol("REQ_KEY missing target".into()))?;
        let _op_tag = args.next(); // "REQ_SPTPS"; only one kind exists today
        let token = args.next().ok_or_else(|| Error::Protocol("REQ_KEY missing payload".into()))?;
        let payload = protocol::decode_binary(&token)?;
        Ok(vec![MetaEvent::ReqKey { source, target, payload }])
    }

    fn on_ans_key(&mut self, msg: Message) -> Result<Vec<MetaEvent>> {
        let mut args = msg.args.into_iter();
        let source = args.next().ok_or_else(|| Error::Protocol("ANS_KEY missing source".into()))?;
        let target = args.next().ok_or_else(|| Error::Protocol("ANS_KEY missing target".into()))?;
        let compression_token =
            args.next().ok_or_else(|| Error::Protocol("ANS_KEY missing compression".into()))?;
        let token = args.next().ok_or_else(|| Error::Protocol("ANS_KEY missing payload".into()))?;
        let payload = protocol::decode_binary(&token)?;
        let compression = match compression_token.as_str() {
            "-" => None,
            level => Some(
                level
                    .parse()
                    .map_err(|_| Error::Protocol("ANS_KEY compression is not a number".into()))?,
            ),
        };
        Ok(vec![MetaEvent::AnsKey { source, target, payload, compression }])
    }
}

fn take4(args: &[String]) -> Result<[String; 4]> {
    if args.len() < 4 {
        return Err(Error::Protocol("expected 4 arguments".into()));
    }
    Ok([args[0].clone(), args[1].clone(), args[2].clone(), args[3].clone()])
}
