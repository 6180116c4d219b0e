// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of ravelin.
//
// ravelin is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// ravelin is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with ravelin.  If not,
// see <http://www.gnu.org/licenses/>.

//! # The ravelin wire layer
//!
//! Requests & responses travel as JSON-RPC 2.0-shaped envelopes in one of two framings: textual
//! JSON or MessagePack. Clients don't announce which one they're speaking; we sniff it off the
//! first byte (a JSON object can only open with `{`, and no MessagePack map of interest begins
//! with 0x7b... well, a fixstr of length 27 does, but then it wouldn't be a map, and we insist on
//! maps). This module owns framing detection, the symmetric encode/decode between
//! [serde_json::Value] and bytes, the envelope field names, the wire error codes, and the
//! response builders.

use serde_json::{json, Value};
use snafu::{Backtrace, ResultExt, Snafu};
use tap::Pipe;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       envelope vocabulary                                      //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The JSON-RPC version we speak; anything else is rejected outright
pub const RPC_VERSION: &str = "2.0";

pub const JSON_RPC: &str = "jsonrpc";
pub const ID: &str = "id";
pub const METHOD: &str = "method";
pub const PARAMS: &str = "params";
pub const READONLY: &str = "readonly";
pub const SIG: &str = "sig";
pub const REQ: &str = "req";
pub const RAW_REQ: &str = "raw_req";
pub const MD: &str = "md";
pub const RESULT: &str = "result";
pub const ERROR: &str = "error";
pub const CODE: &str = "code";
pub const MESSAGE: &str = "message";
pub const COMMIT: &str = "commit";
pub const TERM: &str = "term";
pub const GLOBAL_COMMIT: &str = "global_commit";

/// Wire error codes: the JSON-RPC 2.0 pre-defined range plus our application range
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(i64)]
pub enum ErrorCode {
    ParseError = -32_700,
    InvalidRequest = -32_600,
    MethodNotFound = -32_601,
    InvalidParams = -32_602,
    InternalError = -32_603,
    TxNotLeader = -32_001,
    TxFailedToReplicate = -32_002,
    TxLeaderUnknown = -32_005,
    InvalidClientSignature = -32_007,
    InvalidCallerId = -32_008,
}

impl From<ErrorCode> for i64 {
    fn from(code: ErrorCode) -> i64 {
        code as i64
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCode::ParseError => write!(f, "PARSE_ERROR"),
            ErrorCode::InvalidRequest => write!(f, "INVALID_REQUEST"),
            ErrorCode::MethodNotFound => write!(f, "METHOD_NOT_FOUND"),
            ErrorCode::InvalidParams => write!(f, "INVALID_PARAMS"),
            ErrorCode::InternalError => write!(f, "INTERNAL_ERROR"),
            ErrorCode::TxNotLeader => write!(f, "TX_NOT_LEADER"),
            ErrorCode::TxFailedToReplicate => write!(f, "TX_FAILED_TO_REPLICATE"),
            ErrorCode::TxLeaderUnknown => write!(f, "TX_LEADER_UNKNOWN"),
            ErrorCode::InvalidClientSignature => write!(f, "INVALID_CLIENT_SIGNATURE"),
            ErrorCode::InvalidCallerId => write!(f, "INVALID_CALLER_ID"),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to encode to textual JSON: {source}"))]
    TextEncode {
        source: serde_json::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to decode textual JSON: {source}"))]
    TextDecode {
        source: serde_json::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to encode to MessagePack: {source}"))]
    BinaryEncode {
        source: rmp_serde::encode::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to decode MessagePack: {source}"))]
    BinaryDecode {
        source: rmp_serde::decode::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            framing                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The byte-level encoding of an envelope
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Framing {
    /// Textual JSON
    Text,
    /// MessagePack
    Binary,
}

/// Sniff the framing off the first byte of a request. Empty input is undetectable.
pub fn detect(input: &[u8]) -> Option<Framing> {
    match input.first() {
        None => None,
        Some(b'{') => Some(Framing::Text),
        Some(_) => Some(Framing::Binary),
    }
}

/// Serialize a JSON value into the given framing
pub fn encode(value: &Value, framing: Framing) -> Result<Vec<u8>> {
    match framing {
        Framing::Text => serde_json::to_vec(value).context(TextEncodeSnafu),
        Framing::Binary => rmp_serde::to_vec(value).context(BinaryEncodeSnafu),
    }
}

/// Deserialize a JSON value out of the given framing
pub fn decode(input: &[u8], framing: Framing) -> Result<Value> {
    match framing {
        Framing::Text => serde_json::from_slice(input).context(TextDecodeSnafu),
        Framing::Binary => rmp_serde::from_slice(input).context(BinaryDecodeSnafu),
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       response builders                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Build a success response echoing the request id
pub fn result_response(id: u64, result: Value) -> Value {
    json!({ JSON_RPC: RPC_VERSION, ID: id, RESULT: result })
}

/// Build a bare error member (no envelope); this is also the shape handlers hand back on failure
pub fn error_value(code: ErrorCode, message: impl Into<String>) -> Value {
    json!({ CODE: i64::from(code), MESSAGE: message.into() })
}

/// Build a complete error response echoing the request id
pub fn error_response(id: u64, code: ErrorCode, message: impl Into<String>) -> Value {
    error_response_with(id, error_value(code, message))
}

/// Build a complete error response around an already-built error member
pub fn error_response_with(id: u64, error: Value) -> Value {
    json!({ JSON_RPC: RPC_VERSION, ID: id, ERROR: error })
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                    byte-valued JSON members                                    //
////////////////////////////////////////////////////////////////////////////////////////////////////

// Byte strings (signatures, raw request bodies) travel as arrays of integers in both framings;
// [serde_json::Value] has no bytes variant, so anything richer would decode asymmetrically.

/// Read a byte string out of a JSON value; None if the value isn't an array of bytes
pub fn value_to_bytes(value: &Value) -> Option<Vec<u8>> {
    value
        .as_array()?
        .iter()
        .map(|element| element.as_u64().and_then(|n| u8::try_from(n).ok()))
        .collect()
}

/// Render a byte string as a JSON value
pub fn bytes_to_value(bytes: &[u8]) -> Value {
    bytes.iter().map(|b| json!(b)).collect::<Vec<Value>>().pipe(Value::Array)
}

#[cfg(test)]
mod jsonrpc_tests {
    use super::*;

    #[test]
    fn detection() {
        assert_eq!(detect(b""), None);
        assert_eq!(detect(b"{\"jsonrpc\":\"2.0\"}"), Some(Framing::Text));
        assert_eq!(detect(&[0x82, 0xa2]), Some(Framing::Binary));
    }

    #[test]
    fn round_trips() {
        let value = json!({"jsonrpc": "2.0", "id": 7, "method": "listMethods", "params": {"a": [1, 2, 3]}});
        for framing in [Framing::Text, Framing::Binary] {
            let bytes = encode(&value, framing).unwrap(/* known good */);
            assert_eq!(decode(&bytes, framing).unwrap(/* known good */), value);
        }
    }

    #[test]
    fn text_framing_opens_with_a_brace() {
        let bytes = encode(&json!({"id": 1}), Framing::Text).unwrap(/* known good */);
        assert_eq!(detect(&bytes), Some(Framing::Text));
    }

    #[test]
    fn error_responses_carry_the_id_and_code() {
        let rsp = error_response(42, ErrorCode::TxNotLeader, "host:port");
        assert_eq!(rsp[ID], json!(42));
        assert_eq!(rsp[ERROR][CODE], json!(-32_001));
        assert_eq!(rsp[ERROR][MESSAGE], json!("host:port"));
        assert_eq!(rsp[JSON_RPC], json!(RPC_VERSION));
    }

    #[test]
    fn byte_members() {
        let bytes = vec![0u8, 1, 254, 255];
        assert_eq!(value_to_bytes(&bytes_to_value(&bytes)), Some(bytes));
        assert_eq!(value_to_bytes(&json!([1, 256])), None);
        assert_eq!(value_to_bytes(&json!("nope")), None);
    }
}
