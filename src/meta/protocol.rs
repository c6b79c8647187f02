// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! `OP ARGS\n` line protocol encode/decode (§4.5, §6).
//!
//! Hand-rolled wire parsing in the same spirit as the teacher's Discovery
//! Server JSON field extraction: a closed, tiny grammar doesn't earn a
//! generic parser combinator or serde dependency. Binary arguments
//! (signatures, KEX payloads, edge addresses) are carried as base64 tokens
//! (§6: "Base64 encoding RFC 4648 with no padding suppression").

use crate::error::{Error, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// One meta-protocol opcode (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Id,
    MetaKey,
    Challenge,
    ChalReply,
    Ack,
    Ping,
    Pong,
    AddEdge,
    DelEdge,
    AddSubnet,
    DelSubnet,
    ReqKey,
    AnsKey,
    KeyChanged,
    Status,
    Error,
    Terminal,
}

impl Op {
    fn as_str(self) -> &'static str {
        match self {
            Self::Id => "ID",
            Self::MetaKey => "META_KEY",
            Self::Challenge => "CHALLENGE",
            Self::ChalReply => "CHAL_REPLY",
            Self::Ack => "ACK",
            Self::Ping => "PING",
            Self::Pong => "PONG",
            Self::AddEdge => "ADD_EDGE",
            Self::DelEdge => "DEL_EDGE",
            Self::AddSubnet => "ADD_SUBNET",
            Self::DelSubnet => "DEL_SUBNET",
            Self::ReqKey => "REQ_KEY",
            Self::AnsKey => "ANS_KEY",
            Self::KeyChanged => "KEY_CHANGED",
            Self::Status => "STATUS",
            Self::Error => "ERROR",
            Self::Terminal => "TERMINAL",
        }
    }

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "ID" => Self::Id,
            "META_KEY" => Self::MetaKey,
            "CHALLENGE" => Self::Challenge,
            "CHAL_REPLY" => Self::ChalReply,
            "ACK" => Self::Ack,
            "PING" => Self::Ping,
            "PONG" => Self::Pong,
            "ADD_EDGE" => Self::AddEdge,
            "DEL_EDGE" => Self::DelEdge,
            "ADD_SUBNET" => Self::AddSubnet,
            "DEL_SUBNET" => Self::DelSubnet,
            "REQ_KEY" => Self::ReqKey,
            "ANS_KEY" => Self::AnsKey,
            "KEY_CHANGED" => Self::KeyChanged,
            "STATUS" => Self::Status,
            "ERROR" => Self::Error,
            "TERMINAL" => Self::Terminal,
            other => return Err(Error::Protocol(format!("unknown meta opcode '{other}'"))),
        })
    }
}

/// One decoded meta-protocol line: an opcode plus its space-delimited
/// argument tokens (already split, not yet interpreted by the caller).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub op: Op,
    pub args: Vec<String>,
}

impl Message {
    pub fn new(op: Op, args: Vec<String>) -> Self {
        Self { op, args }
    }

    /// Encodes this message as one `OP ARGS\n` line ready to write to the
    /// MetaChannel's SessionProto-wrapped stream.
    pub fn encode(&self) -> String {
        let mut line = self.op.as_str().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line.push('\n');
        line
    }

    /// Decodes one line (without its trailing `\n`, if any).
    pub fn decode(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut tokens = line.split(' ').filter(|t| !t.is_empty());
        let op_token = tokens
            .next()
            .ok_or_else(|| Error::Protocol("empty meta line".into()))?;
        let op = Op::from_str(op_token)?;
        let args = tokens.map(str::to_string).collect();
        Ok(Self { op, args })
    }
}

/// Encodes binary payload as a base64 token (RFC 4648, standard alphabet,
/// padded — §6 "no padding suppression").
pub fn encode_binary(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decodes a base64 token back to bytes.
pub fn decode_binary(token: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(token)
        .map_err(|e| Error::Protocol(format!("malformed base64 token: {e}")))
}

/// Incrementally splits a byte stream into complete `\n`-terminated lines,
/// holding back any partial trailing line for the next `feed` call. Used
/// by the MetaChannel's read path where TCP delivers arbitrary chunking.
#[derive(Debug, Default)]
pub struct LineSplitter {
    buf: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `bytes` and returns every complete line now available,
    /// in arrival order.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line_bytes: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line_bytes).into_owned();
            lines.push(line);
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trips_for_every_opcode() {
        let ops = [
            Op::Id,
            Op::MetaKey,
            Op::Challenge,
            Op::ChalReply,
            Op::Ack,
            Op::Ping,
            Op::Pong,
            Op::AddEdge,
            Op::DelEdge,
            Op::AddSubnet,
            Op::DelSubnet,
            Op::ReqKey,
            Op::AnsKey,
            Op::KeyChanged,
            Op::Status,
            Op::Error,
            Op::Terminal,
        ];
        for op in ops {
            let msg = Message::new(op, vec!["a".into(), "b".into()]);
            let encoded = msg.encode();
            assert!(encoded.ends_with('\n'));
            let decoded = Message::decode(&encoded).unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn decode_rejects_unknown_opcode() {
        assert!(Message::decode("NOT_REAL a b\n").is_err());
    }

    #[test]
    fn decode_handles_zero_args() {
        let msg = Message::decode("PING\n").unwrap();
        assert_eq!(msg.op, Op::Ping);
        assert!(msg.args.is_empty());
    }

    #[test]
    fn binary_token_round_trips() {
        let payload = vec![0u8, 255, 1, 2, 3, 254];
        let token = encode_binary(&payload);
        assert_eq!(decode_binary(&token).unwrap(), payload);
    }

    #[test]
    fn req_key_line_matches_the_spec_shape() {
        let kex = encode_binary(&[1, 2, 3, 4]);
        let msg = Message::new(
            Op::ReqKey,
            vec!["foo".into(), "bar".into(), "REQ_SPTPS".into(), kex.clone()],
        );
        let encoded = msg.encode();
        assert_eq!(encoded, format!("REQ_KEY foo bar REQ_SPTPS {kex}\n"));
    }

    #[test]
    fn line_splitter_holds_back_partial_trailing_line() {
        let mut splitter = LineSplitter::new();
        let lines = splitter.feed(b"PING\nPON");
        assert_eq!(lines, vec!["PING\n".to_string()]);
        let lines = splitter.feed(b"G\n");
        assert_eq!(lines, vec!["PONG\n".to_string()]);
    }

    #[test]
    fn line_splitter_handles_multiple_lines_in_one_feed() {
        let mut splitter = LineSplitter::new();
        let lines = splitter.feed(b"PING\nPING\nPING\n");
        assert_eq!(lines.len(), 3);
    }
}
