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

//! # ravelin collaborator contracts
//!
//! The front-end sits on top of a replicated key-value store, a consensus replicator, an
//! append-only history, and (optionally) a request forwarder. None of those live in this crate;
//! this module defines the *traits* through which the front-end reaches them, and the application
//! provides implementations (a reference in-memory KV ships in [crate::memstore]).
//!
//! A note on lifetimes: the front-end never keeps long-lived references into the store. The
//! replicator & history handles are re-fetched from the [Store] at every dispatch, and tables are
//! only ever touched through the views of a [Transaction] whose lifetime is a single dispatch.

use std::{marker::PhantomData, sync::Arc};

use serde::{de::DeserializeOwned, Serialize};
use snafu::{Backtrace, ResultExt, Snafu};

use crate::types::{Actor, CallerId, NodeId, RequestId, RpcContext, Term, Version};

/// Names of the tables the front-end itself touches
pub mod tables {
    /// certificate bytes → [CallerId](crate::types::CallerId)
    pub const CERTS: &str = "certs";
    /// [CallerId](crate::types::CallerId) → latest [SignedRequest](crate::types::SignedRequest)
    pub const CLIENT_SIGNATURES: &str = "client_signatures";
    /// [NodeId](crate::types::NodeId) → [NodeInfo](crate::types::NodeInfo)
    pub const NODES: &str = "nodes";
}

/// What became of an attempt to commit a transaction
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CommitOutcome {
    /// Committed; the transaction's writes (if any) are durable at its commit version
    Ok,
    /// Another transaction committed a conflicting change; the transaction has been reset against
    /// fresh state and the work should be re-executed
    Conflict,
    /// The write could not be replicated; fatal for this request
    NoReplicate,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Failed to encode a key: {source}"))]
    KeyEncode {
        source: rmp_serde::encode::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to decode a key: {source}"))]
    KeyDecode {
        source: rmp_serde::decode::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to encode a value: {source}"))]
    ValueEncode {
        source: rmp_serde::encode::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to decode a value: {source}"))]
    ValueDecode {
        source: rmp_serde::decode::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          table views                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// An untyped view over one table within one transaction
///
/// Keys & values are raw byte strings; reads go through the transaction's conflict tracking, and
/// writes are buffered until commit.
pub trait RawView {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
    fn put(&mut self, key: &[u8], value: &[u8]);
    /// Visit every entry; stop early when the visitor returns false
    fn for_each(&self, f: &mut dyn FnMut(&[u8], &[u8]) -> bool);
}

/// A typed view over a [RawView]; keys & values are MessagePack-encoded at the boundary
pub struct View<'a, K, V> {
    raw: &'a mut dyn RawView,
    marker: PhantomData<(K, V)>,
}

impl<'a, K, V> View<'a, K, V>
where
    K: Serialize + DeserializeOwned,
    V: Serialize + DeserializeOwned,
{
    pub fn new(raw: &'a mut dyn RawView) -> View<'a, K, V> {
        View { raw, marker: PhantomData }
    }

    pub fn get(&self, key: &K) -> Result<Option<V>> {
        let key = rmp_serde::to_vec(key).context(KeyEncodeSnafu)?;
        self.raw
            .get(&key)
            .map(|bytes| rmp_serde::from_slice(&bytes).context(ValueDecodeSnafu))
            .transpose()
    }

    pub fn put(&mut self, key: &K, value: &V) -> Result<()> {
        let key = rmp_serde::to_vec(key).context(KeyEncodeSnafu)?;
        let value = rmp_serde::to_vec(value).context(ValueEncodeSnafu)?;
        self.raw.put(&key, &value);
        Ok(())
    }

    /// Visit every entry; stop early when the visitor returns false
    pub fn for_each(&self, mut f: impl FnMut(K, V) -> bool) -> Result<()> {
        let mut failure = None;
        self.raw.for_each(&mut |key, value| {
            let key = match rmp_serde::from_slice(key).context(KeyDecodeSnafu) {
                Ok(key) => key,
                Err(err) => {
                    failure = Some(err);
                    return false;
                }
            };
            let value = match rmp_serde::from_slice(value).context(ValueDecodeSnafu) {
                Ok(value) => value,
                Err(err) => {
                    failure = Some(err);
                    return false;
                }
            };
            f(key, value)
        });
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                    the store & transactions                                    //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// One optimistic transaction against the KV
///
/// The dispatcher holds a transaction for exactly one dispatch, including every conflict-retry
/// iteration; handlers see it through [RequestArgs](crate::registry::RequestArgs).
pub trait Transaction {
    /// The view over `table` within this transaction, created on first use
    fn raw_view(&mut self, table: &str) -> &mut dyn RawView;
    /// Attempt to commit. On [CommitOutcome::Conflict] the transaction resets against fresh state
    /// so the caller can re-execute.
    fn commit(&mut self) -> CommitOutcome;
    /// The version this transaction committed at; 0 until (and unless) a write commits
    fn commit_version(&self) -> Version;
    /// The version this transaction reads at; 0 if the store was empty when it began
    fn read_version(&self) -> Version;
    /// Associate this transaction with the request that spawned it
    fn set_request_id(&mut self, reqid: RequestId);
}

/// The replicated KV, as the front-end sees it
///
/// `replicator` & `history` are optional because a node runs solo before it joins a network; the
/// dispatcher treats "no replicator" as "I am the leader".
pub trait Store: Send + Sync + 'static {
    type Tx: Transaction;

    /// Open a fresh transaction
    fn begin(&self) -> Self::Tx;
    /// The store's current (latest committed) version
    fn current_version(&self) -> Version;
    /// How many committed versions have yet to be covered by a ledger signature
    fn commit_gap(&self) -> u64;
    /// The consensus replicator, if one is attached; re-fetched at every dispatch
    fn replicator(&self) -> Option<Arc<dyn Replicator>>;
    /// The history/ledger, if one is attached; re-fetched at every dispatch
    fn history(&self) -> Option<Arc<dyn History>>;
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                     consensus collaborators                                    //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The consensus replicator: leadership, terms, and commit indices
pub trait Replicator: Send + Sync {
    fn is_leader(&self) -> bool;
    /// This node's id
    fn id(&self) -> NodeId;
    /// The current leader, when known
    fn leader(&self) -> Option<NodeId>;
    /// The current term
    fn term(&self) -> Term;
    /// The term in which `version` was committed
    fn term_of(&self, version: Version) -> Term;
    /// The highest version known to be durably replicated
    fn commit_index(&self) -> Version;
}

/// The append-only request history / ledger
pub trait History: Send + Sync {
    /// Record an incoming request
    fn add_request(&self, reqid: RequestId, actor: Actor, raw: &[u8]);
    /// Ask the ledger to emit a signature over everything committed so far
    fn emit_signature(&self);
}

/// Sends a serialized request to another node (in practice, the leader) for execution
///
/// Trust note: a forwarded request's client signature is verified by the forwarding follower at
/// admission, and the leader strips the signature wrapper *without* re-verifying. Implementations
/// must only forward requests that have passed through
/// [Frontend::process](crate::frontend::Frontend::process).
pub trait Forwarder: Send + Sync {
    /// Hand off `raw` for execution elsewhere; true on success. The reply travels back out of
    /// band, through the transport that owns `ctx`.
    fn forward(&self, ctx: &RpcContext, caller_id: CallerId, raw: &[u8]) -> bool;
}
