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

//! # Basic types used throughout [ravelin](crate)
//!
//! I'm not ordinarily a fan of grab-bag "types" modules, but nearly every one of these appears in
//! at least three other modules (the dispatcher, the collaborator traits, the test harness), so
//! collecting them here beats an import cycle.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};

use crate::jsonrpc::{self, Framing};

/// Type for naming nodes in the cluster
pub type NodeId = u64;

/// Type for naming client sessions on this node
pub type SessionId = u64;

/// Monotonically increasing version assigned by the KV to each committed transaction
///
/// 0 is reserved for "unset"; a real commit always lands at 1 or above.
pub type Version = u64;

/// Monotonically increasing consensus epoch reported by the replicator
pub type Term = u64;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("The signature wrapper has no `req` member"))]
    MissingSignedBody { backtrace: Backtrace },
    #[snafu(display("The signature wrapper has no usable `sig` member"))]
    MissingSignature { backtrace: Backtrace },
    #[snafu(display("Failed to pack the signed body: {source}"))]
    PackSignedBody { source: jsonrpc::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        caller identity                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Stable identifier assigned to a client certificate by an external registration process
///
/// Two values are reserved: [INVALID] marks "unknown caller", and [OPEN] marks "this node has no
/// certs table configured, accept everyone". Neither will ever be handed out by registration.
///
/// [INVALID]: CallerId::INVALID
/// [OPEN]: CallerId::OPEN
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct CallerId(pub u64);

impl CallerId {
    /// "Unknown caller"
    pub const INVALID: CallerId = CallerId(u64::MAX);
    /// "No certs table configured; accept all"
    pub const OPEN: CallerId = CallerId(u64::MAX - 1);
}

impl std::fmt::Display for CallerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            CallerId::INVALID => write!(f, "caller:invalid"),
            CallerId::OPEN => write!(f, "caller:open"),
            CallerId(id) => write!(f, "caller:{}", id),
        }
    }
}

/// The channel on which a request arrived
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Actor {
    Users,
    Members,
    Nodes,
}

/// Identifies one logical request for the history: who asked, on which session, with which
/// envelope id
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct RequestId {
    pub caller: CallerId,
    pub session: SessionId,
    pub seq: u64,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        cluster members                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Lifecycle status of a node in the nodes table
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Trusted,
    Retired,
}

/// What the nodes table records about a cluster member
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct NodeInfo {
    /// Advertised host clients should redirect to
    pub host: String,
    /// Advertised TLS port
    pub port: u16,
    pub status: NodeStatus,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       handler attributes                                       //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Whether a handler reads, writes, or decides per-request (via the envelope's `readonly` member)
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ReadWrite {
    Read,
    Write,
    MayWrite,
}

/// Whether a follower may forward a request for this handler to the leader, or must redirect the
/// client instead
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Forwardable {
    CanForward,
    DoNotForward,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         signed requests                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The hashing algorithm named by a signature wrapper's `md` member
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlg {
    #[default]
    None,
    Sha256,
    Sha384,
    Sha512,
}

/// A client-signed request, as stored in the client-signatures table
///
/// Invariant: if `sig` is non-empty, `req` is the exact byte sequence that was signed (the
/// binary-framed packing of the inner envelope).
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct SignedRequest {
    /// The signature itself
    pub sig: Vec<u8>,
    /// The signed content: the inner envelope, packed in binary framing
    pub req: Vec<u8>,
    /// The request body as it arrived on the wire, if the client chose to include it
    pub raw_req: Vec<u8>,
    /// The hashing algorithm used
    pub md: DigestAlg,
}

impl SignedRequest {
    /// Build a [SignedRequest] from a parsed signature wrapper (an envelope with `sig` & `req`
    /// members at top level)
    pub fn from_envelope(rpc: &Value) -> Result<SignedRequest> {
        let sig = rpc
            .get(jsonrpc::SIG)
            .and_then(jsonrpc::value_to_bytes)
            .context(MissingSignatureSnafu)?;
        let body = rpc.get(jsonrpc::REQ).context(MissingSignedBodySnafu)?;
        let req = jsonrpc::encode(body, Framing::Binary).context(PackSignedBodySnafu)?;
        let raw_req = rpc
            .get(jsonrpc::RAW_REQ)
            .and_then(jsonrpc::value_to_bytes)
            .unwrap_or_default();
        let md = rpc
            .get(jsonrpc::MD)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        Ok(SignedRequest { sig, req, raw_req, md })
    }

    pub fn is_empty(&self) -> bool {
        self.sig.is_empty() && self.req.is_empty() && self.raw_req.is_empty()
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        request context                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// What a forwarding follower tells the leader about a request it couldn't execute itself
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ForwardedInfo {
    /// The caller id as resolved by the forwarding follower
    pub caller_id: CallerId,
    /// The leader the follower believes it is talking to; stamped by the receiving node
    pub leader_id: Option<NodeId>,
}

/// Per-request context threaded through the pipeline
#[derive(Clone, Debug)]
pub struct RpcContext {
    pub session_id: SessionId,
    pub actor: Actor,
    /// The peer certificate presented on this session; empty if none
    pub caller_cert: Vec<u8>,
    /// The framing sniffed off the request, once known
    pub framing: Option<Framing>,
    /// Present iff this request was forwarded from another node
    pub forwarded: Option<ForwardedInfo>,
    /// The envelope id, once known; echoed in the response
    pub seq_no: u64,
    /// Set when the response will be produced by a later continuation rather than the current
    /// entry point
    pub is_pending: bool,
}

impl RpcContext {
    /// Context for a request arriving on a client session
    pub fn new(session_id: SessionId, actor: Actor, caller_cert: impl Into<Vec<u8>>) -> RpcContext {
        RpcContext {
            session_id,
            actor,
            caller_cert: caller_cert.into(),
            framing: None,
            forwarded: None,
            seq_no: 0,
            is_pending: false,
        }
    }

    /// Context for a request forwarded from another node; there is no certificate (the forwarding
    /// follower resolved the caller already)
    pub fn forwarded(session_id: SessionId, actor: Actor, caller_id: CallerId) -> RpcContext {
        RpcContext {
            session_id,
            actor,
            caller_cert: Vec::new(),
            framing: None,
            forwarded: Some(ForwardedInfo { caller_id, leader_id: None }),
            seq_no: 0,
            is_pending: false,
        }
    }
}

#[cfg(test)]
mod types_tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn signed_request_equality_is_over_all_four_fields() {
        let base = SignedRequest {
            sig: vec![1, 2],
            req: vec![3, 4],
            raw_req: vec![5],
            md: DigestAlg::Sha256,
        };
        assert_eq!(base, base.clone());
        assert_ne!(base, SignedRequest { sig: vec![9, 9], ..base.clone() });
        assert_ne!(base, SignedRequest { req: vec![9, 9], ..base.clone() });
        assert_ne!(base, SignedRequest { raw_req: vec![9, 9], ..base.clone() });
        assert_ne!(base, SignedRequest { md: DigestAlg::None, ..base.clone() });
    }

    #[test]
    fn signed_request_packs_the_inner_envelope_as_binary() {
        let inner = json!({"jsonrpc": "2.0", "id": 11, "method": "getCommit"});
        let wrapper = json!({"sig": [1, 2, 3], "req": inner.clone(), "md": "sha256"});
        let signed = SignedRequest::from_envelope(&wrapper).unwrap(/* known good */);
        assert_eq!(signed.sig, vec![1, 2, 3]);
        assert_eq!(signed.md, DigestAlg::Sha256);
        assert_eq!(
            jsonrpc::decode(&signed.req, Framing::Binary).unwrap(/* known good */),
            inner
        );
    }

    #[test]
    fn signed_request_requires_both_members() {
        assert!(SignedRequest::from_envelope(&json!({"req": {"id": 1}})).is_err());
        assert!(SignedRequest::from_envelope(&json!({"sig": [1]})).is_err());
    }
}
