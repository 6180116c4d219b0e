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

//! # ravelin
//!
//! A [ravelin] is a detached outwork placed in front of a fortress' curtain wall; this crate is
//! the outwork in front of a replicated, byzantine-tolerant transactional service. It is the RPC
//! front-end of one node: it decodes client requests (textual JSON or MessagePack, sniffed off
//! the wire), authenticates callers against a certificate table, verifies client signatures,
//! dispatches each request to a registered handler under an optimistic transaction, retries on
//! conflict, routes writes arriving on a follower to the leader (forwarding or redirecting), and
//! keeps the ledger's signature cadence ticking.
//!
//! [ravelin]: https://en.wikipedia.org/wiki/Ravelin
//!
//! The store, replicator, history & forwarder are *collaborators*, reached through the traits in
//! [store]; a reference in-memory store ships in [memstore]. The front-end proper lives in
//! [frontend].

pub mod frontend;
pub mod jsonrpc;
pub mod memstore;
pub mod metrics;
pub mod registry;
pub mod store;
pub mod types;
pub mod verify;

pub use frontend::{Dispatch, Frontend, Outcome};
pub use jsonrpc::{ErrorCode, Framing};
pub use registry::{HandlerError, HandlerResult, RequestArgs};
pub use store::{CommitOutcome, Forwarder, History, Replicator, Store, Transaction};
pub use types::{
    Actor, CallerId, Forwardable, NodeId, NodeInfo, NodeStatus, ReadWrite, RequestId, RpcContext,
    SessionId, SignedRequest, Term, Version,
};
pub use verify::{Ed25519Verifier, Verifier};
