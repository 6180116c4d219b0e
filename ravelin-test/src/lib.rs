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

//! # The ravelin test harness
//!
//! Scripted stand-ins for the front-end's collaborators -- a replicator whose answers the test
//! controls, a history & forwarder that record what they're handed -- plus helpers for minting
//! envelopes (plain and signed, in either framing) over the in-memory reference store.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Mutex,
};

use ed25519_dalek::{Signer, SigningKey};
use serde_json::{json, Value};

use ravelin::{
    jsonrpc, store::tables, Actor, CallerId, Forwarder, Framing, History, NodeId, NodeInfo,
    NodeStatus, Replicator, RequestId, RpcContext, Term, Version,
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                     scripted collaborators                                     //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A [Replicator] whose every answer is set by the test
pub struct ScriptedReplicator {
    is_leader: AtomicBool,
    id: NodeId,
    leader: Mutex<Option<NodeId>>,
    term: Term,
    commit_index: AtomicUsize,
}

impl ScriptedReplicator {
    /// A leader with id 0, term 2
    pub fn leader() -> ScriptedReplicator {
        ScriptedReplicator {
            is_leader: AtomicBool::new(true),
            id: 0,
            leader: Mutex::new(Some(0)),
            term: 2,
            commit_index: AtomicUsize::new(0),
        }
    }

    /// A follower with id 1 that believes `leader` leads
    pub fn follower(leader: Option<NodeId>) -> ScriptedReplicator {
        ScriptedReplicator {
            is_leader: AtomicBool::new(false),
            id: 1,
            leader: Mutex::new(leader),
            term: 2,
            commit_index: AtomicUsize::new(0),
        }
    }

    pub fn set_leader(&self, is_leader: bool) {
        self.is_leader.store(is_leader, Ordering::Relaxed);
    }
}

impl Replicator for ScriptedReplicator {
    fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Relaxed)
    }
    fn id(&self) -> NodeId {
        self.id
    }
    fn leader(&self) -> Option<NodeId> {
        *self.leader.lock().expect("Poisoned mutex!")
    }
    fn term(&self) -> Term {
        self.term
    }
    fn term_of(&self, _version: Version) -> Term {
        self.term
    }
    fn commit_index(&self) -> Version {
        self.commit_index.load(Ordering::Relaxed) as Version
    }
}

/// A [History] that counts signature requests & keeps every recorded request
#[derive(Default)]
pub struct RecordingHistory {
    requests: Mutex<Vec<(RequestId, Actor, Vec<u8>)>>,
    signatures: AtomicUsize,
}

impl RecordingHistory {
    pub fn new() -> RecordingHistory {
        RecordingHistory::default()
    }
    pub fn requests(&self) -> Vec<(RequestId, Actor, Vec<u8>)> {
        self.requests.lock().expect("Poisoned mutex!").clone()
    }
    pub fn signatures(&self) -> usize {
        self.signatures.load(Ordering::Relaxed)
    }
}

impl History for RecordingHistory {
    fn add_request(&self, reqid: RequestId, actor: Actor, raw: &[u8]) {
        self.requests
            .lock()
            .expect("Poisoned mutex!")
            .push((reqid, actor, raw.to_vec()));
    }
    fn emit_signature(&self) {
        self.signatures.fetch_add(1, Ordering::Relaxed);
    }
}

/// A [Forwarder] that records what it's asked to forward
#[derive(Default)]
pub struct RecordingForwarder {
    forwarded: Mutex<Vec<(CallerId, Vec<u8>)>>,
}

impl RecordingForwarder {
    pub fn new() -> RecordingForwarder {
        RecordingForwarder::default()
    }
    pub fn forwarded(&self) -> Vec<(CallerId, Vec<u8>)> {
        self.forwarded.lock().expect("Poisoned mutex!").clone()
    }
}

impl Forwarder for RecordingForwarder {
    fn forward(&self, _ctx: &RpcContext, caller_id: CallerId, raw: &[u8]) -> bool {
        self.forwarded
            .lock()
            .expect("Poisoned mutex!")
            .push((caller_id, raw.to_vec()));
        true
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            fixtures                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A deterministic Ed25519 keypair; the "certificate" is the raw verifying key
pub fn keypair(seed: u8) -> (SigningKey, Vec<u8>) {
    let signing = SigningKey::from_bytes(&[seed; 32]);
    let cert = signing.verifying_key().to_bytes().to_vec();
    (signing, cert)
}

/// Seed the nodes table
pub fn seed_node(store: &ravelin::memstore::MemStore, id: NodeId, host: &str, port: u16) {
    store
        .seed(
            tables::NODES,
            &id,
            &NodeInfo { host: host.to_owned(), port, status: NodeStatus::Trusted },
        )
        .expect("seeding the nodes table");
}

/// Seed the certs table
pub fn seed_cert(store: &ravelin::memstore::MemStore, cert: &[u8], caller: CallerId) {
    store
        .seed(tables::CERTS, &cert.to_vec(), &caller)
        .expect("seeding the certs table");
}

/// A plain (unsigned) envelope
pub fn envelope(id: u64, method: &str) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "method": method })
}

/// A plain envelope with params
pub fn envelope_with_params(id: u64, method: &str, params: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params })
}

/// Wrap an inner envelope in a signature wrapper, signing the binary-framed packing of the inner
/// envelope with `signing`
pub fn sign_envelope(signing: &SigningKey, inner: &Value) -> Value {
    let packed = jsonrpc::encode(inner, Framing::Binary).expect("packing the inner envelope");
    let sig = signing.sign(&packed).to_vec();
    json!({ "sig": jsonrpc::bytes_to_value(&sig), "req": inner })
}

/// Serialize an envelope in the given framing
pub fn pack(envelope: &Value, framing: Framing) -> Vec<u8> {
    jsonrpc::encode(envelope, framing).expect("packing an envelope")
}

/// Deserialize a response in the given framing
pub fn unpack(bytes: &[u8], framing: Framing) -> Value {
    jsonrpc::decode(bytes, framing).expect("unpacking a response")
}

/// The `error.code` member of a response, for terse assertions
pub fn error_code(response: &Value) -> Option<i64> {
    response
        .get(jsonrpc::ERROR)
        .and_then(|error| error.get(jsonrpc::CODE))
        .and_then(Value::as_i64)
}
