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

//! # The ravelin front-end
//!
//! This is the heart of the crate: the pipeline standing between client sessions and the node's
//! replicated state machine. A request comes in as bytes; we sniff the framing, resolve the
//! caller from its certificate, parse the envelope, check any client signature, and record the
//! request in the history ([Frontend::process]). Execution happens in a later continuation: once
//! consensus hands the request back ([Frontend::process_ordered]), or once a peer forwards it to
//! us ([Frontend::process_forwarded]), the dispatcher ([Frontend::process_json]) routes on
//! leadership & the handler's read/write tag, runs the handler under an optimistic transaction,
//! and retries on conflict until the store accepts the commit.
//!
//! Everything here runs on one logical execution context: every entry point takes `&mut self`,
//! and there are no suspension points inside a dispatch. The asynchronous aspect lives outside --
//! [Frontend::process] answers [Outcome::Pending] and the transport wires the eventual response
//! back to the session.

use std::{
    num::NonZeroUsize,
    sync::{Arc, Mutex},
    time::Duration,
};

use lru::LruCache;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::{
    jsonrpc::{self, error_response, error_response_with, result_response, ErrorCode, Framing},
    metrics::Metrics,
    registry::{
        minimal, parse_params, schema, Handler, HandlerError, HandlerFn, HandlerResult, Registry,
        RequestArgs,
    },
    store::{tables, CommitOutcome, Forwarder, Store, Transaction, View},
    types::{
        CallerId, Forwardable, NodeId, NodeInfo, NodeStatus, ReadWrite, RequestId, RpcContext,
        SignedRequest, Term, Version,
    },
    verify::{Ed25519Verifier, Verifier},
};

pub type StdResult<T, E> = std::result::Result<T, E>;

/// Method names installed at construction
pub mod methods {
    pub const GET_COMMIT: &str = "getCommit";
    pub const GET_METRICS: &str = "getMetrics";
    pub const MK_SIGN: &str = "mkSign";
    pub const GET_LEADER_INFO: &str = "getLeaderInfo";
    pub const GET_NETWORK_INFO: &str = "getNetworkInfo";
    pub const LIST_METHODS: &str = "listMethods";
    pub const GET_SCHEMA: &str = "getSchema";
}

/// Transactions between mid-window signature piggybacks
pub const DEFAULT_SIG_MAX_TX: u64 = 1_000;
/// Interval between periodic signature emissions
pub const DEFAULT_SIG_MAX_MS: Duration = Duration::from_millis(1_000);
/// Per-caller verifiers retained before LRU eviction
pub const DEFAULT_VERIFIER_CACHE: usize = 256;

/// What became of a client-facing entry point
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// Here are the response bytes; send them back on the session
    Responded(Vec<u8>),
    /// The response will be produced by a later continuation (consensus ordering the request, or
    /// the forwarding reply path); `ctx.is_pending` has been set
    Pending,
}

/// What the dispatcher decided to do with one request
#[derive(Clone, Debug, PartialEq)]
pub enum Dispatch {
    /// The response envelope
    Reply(Value),
    /// This node can't execute the request; hand the serialized request to the forwarder
    Forward,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                   built-in method in/out shapes                                //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Deserialize, Serialize)]
pub struct GetCommitIn {
    pub commit: Option<Version>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct GetCommitOut {
    pub term: Term,
    pub commit: Version,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct GetLeaderInfoOut {
    pub leader_id: NodeId,
    pub leader_host: String,
    pub leader_port: u16,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct NetworkNode {
    pub node_id: NodeId,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct GetNetworkInfoOut {
    pub leader_id: Option<NodeId>,
    pub nodes: Vec<NetworkNode>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ListMethodsOut {
    pub methods: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct GetSchemaIn {
    pub method: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct GetSchemaOut {
    pub params_schema: Value,
    pub result_schema: Value,
}

fn render<T: Serialize>(out: T) -> HandlerResult {
    serde_json::to_value(out).map_err(|err| HandlerError::Internal { message: err.to_string() })
}

fn internal(err: impl std::fmt::Display) -> HandlerError {
    HandlerError::Internal { message: err.to_string() }
}

fn rpc_error(code: ErrorCode, message: impl Into<String>) -> HandlerError {
    HandlerError::Rpc { code, message: message.into() }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         the front-end                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The RPC front-end for one node
///
/// Generic over the [Store] it sits on and the [Verifier] it checks client signatures with (the
/// stock [Ed25519Verifier] by default). Collaborator handles (replicator, history) are re-fetched
/// from the store at every dispatch rather than held here.
pub struct Frontend<S: Store, V: Verifier = Ed25519Verifier> {
    store: Arc<S>,
    registry: Arc<Mutex<Registry>>,
    metrics: Arc<Mutex<Metrics>>,
    /// Name of the certificate table; None means "no caller authentication, accept everyone"
    certs_table: Option<String>,
    /// Name of the client-signatures table; None means "client signatures unsupported"
    client_sigs_table: Option<String>,
    verifiers: LruCache<CallerId, V>,
    forwarder: Option<Arc<dyn Forwarder>>,
    sig_max_tx: u64,
    sig_max_ms: Duration,
    ms_to_sig: Duration,
    tx_count: u64,
    request_storing_disabled: bool,
    max_commit_retries: Option<u32>,
}

impl<S: Store, V: Verifier> Frontend<S, V> {
    /// A front-end with neither caller authentication nor client-signature support
    pub fn new(store: Arc<S>) -> Frontend<S, V> {
        Frontend::with_tables(store, None, None)
    }

    /// A front-end resolving callers through `certs_table` and recording signed requests in
    /// `client_signatures_table` (either may be absent)
    pub fn with_tables(
        store: Arc<S>,
        certs_table: Option<&str>,
        client_signatures_table: Option<&str>,
    ) -> Frontend<S, V> {
        let registry = Arc::new(Mutex::new(Registry::new()));
        let metrics = Arc::new(Mutex::new(Metrics::default()));

        let store_ = Arc::clone(&store);
        let get_commit = minimal(move |_tx, params| {
            let input: GetCommitIn = parse_params(params)?;
            let commit = input.commit.unwrap_or_else(|| store_.current_version());
            match store_.replicator() {
                Some(replicator) => {
                    render(GetCommitOut { term: replicator.term_of(commit), commit })
                }
                None => Err(rpc_error(
                    ErrorCode::InternalError,
                    "Failed to get commit info from the replicator",
                )),
            }
        });

        let metrics_ = Arc::clone(&metrics);
        let get_metrics = minimal(move |_tx, _params| {
            render(metrics_.lock().expect("Poisoned mutex!").snapshot())
        });

        let store_ = Arc::clone(&store);
        let make_signature = minimal(move |_tx, _params| match store_.history() {
            Some(history) => {
                history.emit_signature();
                Ok(json!(true))
            }
            None => Err(rpc_error(ErrorCode::InternalError, "Failed to trigger signature")),
        });

        let store_ = Arc::clone(&store);
        let get_leader_info = minimal(move |tx, _params| {
            if let Some(replicator) = store_.replicator() {
                if let Some(leader_id) = replicator.leader() {
                    let view = View::<NodeId, NodeInfo>::new(tx.raw_view(tables::NODES));
                    if let Some(info) = view.get(&leader_id).map_err(internal)? {
                        return render(GetLeaderInfoOut {
                            leader_id,
                            leader_host: info.host,
                            leader_port: info.port,
                        });
                    }
                }
            }
            Err(rpc_error(ErrorCode::TxLeaderUnknown, "Leader unknown."))
        });

        let store_ = Arc::clone(&store);
        let get_network_info = minimal(move |tx, _params| {
            let leader_id = store_.replicator().and_then(|replicator| replicator.leader());
            let mut nodes = Vec::new();
            let view = View::<NodeId, NodeInfo>::new(tx.raw_view(tables::NODES));
            view.for_each(|node_id, info: NodeInfo| {
                if info.status == NodeStatus::Trusted {
                    nodes.push(NetworkNode { node_id, host: info.host, port: info.port });
                }
                true
            })
            .map_err(internal)?;
            render(GetNetworkInfoOut { leader_id, nodes })
        });

        let registry_ = Arc::clone(&registry);
        let list_methods = minimal(move |_tx, _params| {
            render(ListMethodsOut {
                methods: registry_.lock().expect("Poisoned mutex!").list(),
            })
        });

        let registry_ = Arc::clone(&registry);
        let get_schema = minimal(move |_tx, params| {
            let input: GetSchemaIn = parse_params(params)?;
            match registry_.lock().expect("Poisoned mutex!").schema(&input.method) {
                Some((params_schema, result_schema)) => {
                    render(GetSchemaOut { params_schema, result_schema })
                }
                None => Err(rpc_error(
                    ErrorCode::InvalidParams,
                    format!("Method {} not recognised", input.method),
                )),
            }
        });

        {
            let mut guard = registry.lock().expect("Poisoned mutex!");
            guard.install(
                methods::GET_COMMIT,
                get_commit,
                ReadWrite::Read,
                schema::object(&[("commit", schema::integer())], &[]),
                schema::object(
                    &[("term", schema::integer()), ("commit", schema::integer())],
                    &["term", "commit"],
                ),
                Forwardable::CanForward,
            );
            guard.install(
                methods::GET_METRICS,
                get_metrics,
                ReadWrite::Read,
                json!({}),
                schema::object(
                    &[
                        ("total_tx", schema::integer()),
                        ("peak_tx_per_sec", schema::number()),
                        ("avg_tx_per_sec", schema::number()),
                        ("rates", schema::array_of(schema::number())),
                    ],
                    &["total_tx", "peak_tx_per_sec", "avg_tx_per_sec", "rates"],
                ),
                Forwardable::CanForward,
            );
            guard.install(
                methods::MK_SIGN,
                make_signature,
                ReadWrite::Write,
                json!({}),
                schema::boolean(),
                Forwardable::CanForward,
            );
            guard.install(
                methods::GET_LEADER_INFO,
                get_leader_info,
                ReadWrite::Read,
                json!({}),
                schema::object(
                    &[
                        ("leader_id", schema::integer()),
                        ("leader_host", schema::string()),
                        ("leader_port", schema::integer()),
                    ],
                    &["leader_id", "leader_host", "leader_port"],
                ),
                Forwardable::CanForward,
            );
            guard.install(
                methods::GET_NETWORK_INFO,
                get_network_info,
                ReadWrite::Read,
                json!({}),
                schema::object(
                    &[
                        ("leader_id", schema::integer()),
                        (
                            "nodes",
                            schema::array_of(schema::object(
                                &[
                                    ("node_id", schema::integer()),
                                    ("host", schema::string()),
                                    ("port", schema::integer()),
                                ],
                                &["node_id", "host", "port"],
                            )),
                        ),
                    ],
                    &["nodes"],
                ),
                Forwardable::CanForward,
            );
            guard.install(
                methods::LIST_METHODS,
                list_methods,
                ReadWrite::Read,
                json!({}),
                schema::object(
                    &[("methods", schema::array_of(schema::string()))],
                    &["methods"],
                ),
                Forwardable::CanForward,
            );
            guard.install(
                methods::GET_SCHEMA,
                get_schema,
                ReadWrite::Read,
                schema::object(&[("method", schema::string())], &["method"]),
                schema::object(
                    &[("params_schema", json!({})), ("result_schema", json!({}))],
                    &["params_schema", "result_schema"],
                ),
                Forwardable::CanForward,
            );
        }

        Frontend {
            store,
            registry,
            metrics,
            certs_table: certs_table.map(str::to_owned),
            client_sigs_table: client_signatures_table.map(str::to_owned),
            verifiers: LruCache::new(
                NonZeroUsize::new(DEFAULT_VERIFIER_CACHE).unwrap(/* known good */),
            ),
            forwarder: None,
            sig_max_tx: DEFAULT_SIG_MAX_TX,
            sig_max_ms: DEFAULT_SIG_MAX_MS,
            ms_to_sig: DEFAULT_SIG_MAX_MS,
            tx_count: 0,
            request_storing_disabled: false,
            max_commit_retries: None,
        }
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    //                                       configuration                                        //
    ////////////////////////////////////////////////////////////////////////////////////////////////

    /// Install a handler for a method name, replacing any previous entry
    pub fn install(
        &mut self,
        method: impl Into<String>,
        func: HandlerFn,
        rw: ReadWrite,
        params_schema: Value,
        result_schema: Value,
        forwardable: Forwardable,
    ) {
        self.registry.lock().expect("Poisoned mutex!").install(
            method,
            func,
            rw,
            params_schema,
            result_schema,
            forwardable,
        );
    }

    /// [install](Frontend::install) with empty schemas & [Forwardable::CanForward]
    pub fn install_minimal(&mut self, method: impl Into<String>, func: HandlerFn, rw: ReadWrite) {
        self.registry
            .lock()
            .expect("Poisoned mutex!")
            .install_minimal(method, func, rw);
    }

    /// Register a fallback handler for unknown methods
    pub fn set_default(&mut self, func: HandlerFn, rw: ReadWrite) {
        self.registry.lock().expect("Poisoned mutex!").set_default(func, rw);
    }

    /// Attach a forwarder; without one, writes arriving on a follower are redirected
    pub fn set_forwarder(&mut self, forwarder: Arc<dyn Forwarder>) {
        self.forwarder = Some(forwarder);
    }

    /// Tune the signature cadence: `sig_max_tx` transactions between mid-window piggybacks,
    /// `sig_max_ms` between periodic emissions. Resets the running countdown.
    pub fn set_sig_intervals(&mut self, sig_max_tx: u64, sig_max_ms: Duration) {
        self.sig_max_tx = sig_max_tx;
        self.sig_max_ms = sig_max_ms;
        self.ms_to_sig = sig_max_ms;
    }

    /// Store only signatures, not request bodies
    pub fn disable_request_storing(&mut self) {
        self.request_storing_disabled = true;
    }

    /// Bound the conflict-retry loop; None (the default) retries indefinitely
    pub fn set_max_commit_retries(&mut self, max: Option<u32>) {
        self.max_commit_retries = max;
    }

    /// Resize the per-caller verifier cache
    pub fn set_verifier_cache_capacity(&mut self, capacity: NonZeroUsize) {
        self.verifiers.resize(capacity);
    }

    /// The latest signed request stored for `caller`, if any
    pub fn signed_request_for(&self, caller: CallerId) -> Option<SignedRequest> {
        let table = self.client_sigs_table.as_ref()?;
        let mut tx = self.store.begin();
        View::<CallerId, SignedRequest>::new(tx.raw_view(table))
            .get(&caller)
            .unwrap_or_else(|err| {
                warn!("Failed to read the signed request for {caller}: {err}");
                None
            })
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    //                                        entry points                                        //
    ////////////////////////////////////////////////////////////////////////////////////////////////

    /// Admit a serialized request arriving on a client session
    ///
    /// Framing, caller identity, and any client signature are checked here; a failure of any of
    /// those is answered immediately. A request that passes is recorded in the history and left
    /// pending -- execution happens when consensus hands it back ([Frontend::process_ordered]) or
    /// when the forwarding reply path answers for it.
    pub fn process(&mut self, ctx: &mut RpcContext, input: &[u8]) -> Outcome {
        let mut tx = self.store.begin();

        ctx.framing = jsonrpc::detect(input);
        let framing = match ctx.framing {
            Some(framing) => framing,
            None => {
                return Outcome::Responded(self.pack(
                    &error_response(0, ErrorCode::InvalidRequest, "Empty request."),
                    Framing::Text,
                ))
            }
        };

        let caller_id = match self.resolve_caller(&mut tx, &ctx.caller_cert) {
            Some(caller_id) => caller_id,
            None => {
                return Outcome::Responded(self.pack(
                    &error_response(
                        0,
                        ErrorCode::InvalidCallerId,
                        "No corresponding caller entry exists.",
                    ),
                    framing,
                ))
            }
        };

        let mut rpc = match self.unpack_object(input, framing) {
            Ok(rpc) => rpc,
            Err(response) => return Outcome::Responded(self.pack(&response, framing)),
        };

        let unsigned = if rpc.get(jsonrpc::SIG).is_some() {
            let inner_id = rpc
                .get(jsonrpc::REQ)
                .and_then(|req| req.get(jsonrpc::ID))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            let pre_verified = ctx.forwarded.is_some();
            if self
                .verify_client_signature(&mut tx, &ctx.caller_cert, caller_id, &rpc, pre_verified)
                .is_none()
            {
                return Outcome::Responded(self.pack(
                    &error_response(
                        inner_id,
                        ErrorCode::InvalidClientSignature,
                        "Failed to verify client signature.",
                    ),
                    framing,
                ));
            }
            rpc.get_mut(jsonrpc::REQ).map(Value::take).unwrap_or(Value::Null)
        } else {
            rpc
        };

        let seq = unsigned.get(jsonrpc::ID).and_then(Value::as_u64).unwrap_or(0);
        let reqid = RequestId { caller: caller_id, session: ctx.session_id, seq };
        if let Some(history) = self.store.history() {
            history.add_request(reqid, ctx.actor, input);
            tx.set_request_id(reqid);
        }

        // Nb. the admission transaction is discarded here, uncommitted; the execution
        // continuation opens its own.
        ctx.is_pending = true;
        Outcome::Pending
    }

    /// Execute a previously-admitted request once consensus has ordered it
    ///
    /// The signature wrapper, if present, is stripped *without* re-verification (it was verified
    /// at admission) but the signed-request record is written through this transaction, so it
    /// lands in the client-signatures table on commit.
    pub fn process_ordered(&mut self, ctx: &mut RpcContext, input: &[u8]) -> Outcome {
        let mut tx = self.store.begin();

        ctx.framing = jsonrpc::detect(input);
        let framing = match ctx.framing {
            Some(framing) => framing,
            None => {
                return Outcome::Responded(self.pack(
                    &error_response(0, ErrorCode::InvalidRequest, "Empty request."),
                    Framing::Text,
                ))
            }
        };

        let caller_id = match self.resolve_caller(&mut tx, &ctx.caller_cert) {
            Some(caller_id) => caller_id,
            None => {
                return Outcome::Responded(self.pack(
                    &error_response(
                        0,
                        ErrorCode::InvalidCallerId,
                        "No corresponding caller entry exists.",
                    ),
                    framing,
                ))
            }
        };

        let rpc = match self.unpack_object(input, framing) {
            Ok(rpc) => rpc,
            Err(response) => return Outcome::Responded(self.pack(&response, framing)),
        };

        let (unsigned, signed_request) = match self.strip_signature(&mut tx, caller_id, rpc) {
            Ok(stripped) => stripped,
            Err(response) => return Outcome::Responded(self.pack(&response, framing)),
        };

        match self.process_json(ctx, &mut tx, caller_id, &unsigned, &signed_request) {
            Dispatch::Reply(response) => Outcome::Responded(self.pack(&response, framing)),
            Dispatch::Forward => match self.forwarder.clone() {
                Some(forwarder) if forwarder.forward(ctx, caller_id, input) => {
                    ctx.is_pending = true;
                    Outcome::Pending
                }
                _ => Outcome::Responded(self.pack(
                    &error_response(
                        ctx.seq_no,
                        ErrorCode::InternalError,
                        "Failed to forward the request.",
                    ),
                    framing,
                )),
            },
        }
    }

    /// Execute a request forwarded from another node
    ///
    /// The context must carry the caller id as resolved by the forwarding follower; the follower
    /// also verified any client signature, so the wrapper is stripped without re-verification.
    /// This entry point always produces a response -- a forwarded request is never forwarded
    /// again.
    pub fn process_forwarded(&mut self, ctx: &mut RpcContext, input: &[u8]) -> Vec<u8> {
        let forwarded_caller = ctx
            .forwarded
            .as_ref()
            .map(|fwd| fwd.caller_id)
            .expect("process_forwarded requires a forwarded context");

        if let Some(replicator) = self.store.replicator() {
            if let Some(fwd) = ctx.forwarded.as_mut() {
                fwd.leader_id = Some(replicator.id());
            }
        }

        ctx.framing = jsonrpc::detect(input);
        let framing = match ctx.framing {
            Some(framing) => framing,
            None => {
                return self.pack(
                    &error_response(0, ErrorCode::InvalidRequest, "Empty forwarded request."),
                    Framing::Text,
                )
            }
        };

        // The forwarding follower resolved the caller already; all we can check is that it
        // actually did.
        if self.certs_table.is_some() && forwarded_caller == CallerId::INVALID {
            return self.pack(
                &error_response(
                    0,
                    ErrorCode::InvalidCallerId,
                    "No corresponding caller entry exists (forwarded).",
                ),
                framing,
            );
        }

        let mut tx = self.store.begin();

        let rpc = match self.unpack_object(input, framing) {
            Ok(rpc) => rpc,
            Err(response) => return self.pack(&response, framing),
        };

        let (unsigned, signed_request) =
            match self.strip_signature(&mut tx, forwarded_caller, rpc) {
                Ok(stripped) => stripped,
                Err(response) => return self.pack(&response, framing),
            };

        match self.process_json(ctx, &mut tx, forwarded_caller, &unsigned, &signed_request) {
            Dispatch::Reply(response) => self.pack(&response, framing),
            // forward_or_redirect never forwards a request whose context is already forwarded
            Dispatch::Forward => unreachable!("a forwarded request cannot be forwarded again"),
        }
    }

    /// Route & execute one parsed envelope under `tx`
    pub fn process_json(
        &mut self,
        ctx: &mut RpcContext,
        tx: &mut S::Tx,
        caller_id: CallerId,
        rpc: &Value,
        signed_request: &SignedRequest,
    ) -> Dispatch {
        ctx.seq_no = rpc.get(jsonrpc::ID).and_then(Value::as_u64).unwrap_or(0);
        let seq = ctx.seq_no;

        if rpc.get(jsonrpc::JSON_RPC).and_then(Value::as_str) != Some(jsonrpc::RPC_VERSION) {
            return Dispatch::Reply(error_response(
                seq,
                ErrorCode::InvalidRequest,
                "Wrong JSON-RPC version.",
            ));
        }

        let params = match rpc.get(jsonrpc::PARAMS) {
            None => Value::Null,
            Some(params) if params.is_array() || params.is_object() => params.clone(),
            Some(_) => {
                return Dispatch::Reply(error_response(
                    seq,
                    ErrorCode::InvalidRequest,
                    "If present, parameters must be an array or object",
                ))
            }
        };

        let method = match rpc.get(jsonrpc::METHOD).and_then(Value::as_str) {
            Some(method) => method.to_owned(),
            None => {
                return Dispatch::Reply(error_response(
                    seq,
                    ErrorCode::InvalidRequest,
                    "Missing method.",
                ))
            }
        };

        let handler: Option<Handler> = {
            let registry = self.registry.lock().expect("Poisoned mutex!");
            registry.lookup(&method).or_else(|| registry.default_handler())
        };
        let handler = match handler {
            Some(handler) => handler,
            None => {
                warn!("Method {} not found", method);
                return Dispatch::Reply(error_response(seq, ErrorCode::MethodNotFound, method));
            }
        };

        // Fresh handles every dispatch; never cached across requests
        let replicator = self.store.replicator();
        let history = self.store.history();

        let is_leader = replicator.as_ref().map(|r| r.is_leader()).unwrap_or(true);
        if !is_leader {
            let must_route = match handler.rw {
                ReadWrite::Read => false,
                ReadWrite::Write => true,
                ReadWrite::MayWrite => {
                    !rpc.get(jsonrpc::READONLY).and_then(Value::as_bool).unwrap_or(true)
                }
            };
            if must_route {
                return self.forward_or_redirect(ctx, handler.forwardable);
            }
        }

        // Counted once per logical request, not once per commit attempt
        self.tx_count += 1;

        let mut attempts: u32 = 0;
        loop {
            let outcome = {
                let mut args = RequestArgs {
                    ctx: &mut *ctx,
                    tx: &mut *tx,
                    caller_id,
                    method: &method,
                    params: &params,
                    signed_request,
                };
                (handler.func)(&mut args)
            };

            let value = match outcome {
                Ok(value) => value,
                Err(fault) => return Dispatch::Reply(self.fault_response(seq, fault)),
            };

            match tx.commit() {
                CommitOutcome::Conflict => {
                    attempts += 1;
                    if let Some(max) = self.max_commit_retries {
                        if attempts > max {
                            warn!("{} conflicted {} times; giving up", method, attempts);
                            return Dispatch::Reply(error_response(
                                seq,
                                ErrorCode::InternalError,
                                format!("Transaction conflicted {} times.", attempts),
                            ));
                        }
                    }
                    debug!("Commit conflict on {}; re-executing", method);
                    continue;
                }
                CommitOutcome::NoReplicate => {
                    return Dispatch::Reply(error_response(
                        seq,
                        ErrorCode::TxFailedToReplicate,
                        "Transaction failed to replicate.",
                    ))
                }
                CommitOutcome::Ok => {
                    let mut response = result_response(seq, value);
                    let mut cv = tx.commit_version();
                    if cv == 0 {
                        cv = tx.read_version();
                    }
                    if cv == 0 {
                        cv = self.store.current_version();
                    }
                    response[jsonrpc::COMMIT] = json!(cv);
                    if let Some(replicator) = &replicator {
                        response[jsonrpc::TERM] = json!(replicator.term());
                        response[jsonrpc::GLOBAL_COMMIT] = json!(replicator.commit_index());

                        // Piggyback a signature at the middle of each sig_max_tx window; commits
                        // cluster at window edges, so mid-window spreads the emissions out
                        if replicator.is_leader() && cv % self.sig_max_tx == self.sig_max_tx / 2 {
                            if let Some(history) = &history {
                                history.emit_signature();
                            }
                        }
                    }
                    return Dispatch::Reply(response);
                }
            }
        }
    }

    /// Roll up metrics and, on the leader, drive the periodic signature countdown
    ///
    /// The countdown is saturating: however large `elapsed`, one tick emits at most one
    /// signature.
    pub fn tick(&mut self, elapsed: Duration) {
        let tx_count = std::mem::take(&mut self.tx_count);
        self.metrics
            .lock()
            .expect("Poisoned mutex!")
            .track_tx_rate(elapsed, tx_count);

        let replicator = match self.store.replicator() {
            Some(replicator) => replicator,
            None => return,
        };
        if !replicator.is_leader() {
            return;
        }

        if elapsed < self.ms_to_sig {
            self.ms_to_sig -= elapsed;
            return;
        }

        self.ms_to_sig = self.sig_max_ms;
        if self.store.commit_gap() > 0 {
            if let Some(history) = self.store.history() {
                history.emit_signature();
            }
        }
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    //                                         internals                                          //
    ////////////////////////////////////////////////////////////////////////////////////////////////

    /// Map a peer certificate to a caller id through the certs view of `tx`
    ///
    /// The same transaction the handler will run under, so the lookup sees the same snapshot.
    fn resolve_caller(&self, tx: &mut S::Tx, cert: &[u8]) -> Option<CallerId> {
        let table = match &self.certs_table {
            None => return Some(CallerId::OPEN),
            Some(table) => table,
        };
        if cert.is_empty() {
            return None;
        }
        View::<Vec<u8>, CallerId>::new(tx.raw_view(table))
            .get(&cert.to_vec())
            .unwrap_or_else(|err| {
                warn!("Failed to look up a caller certificate: {err}");
                None
            })
    }

    /// Check a signature wrapper against the caller's certificate and record it
    ///
    /// None means "reject". `pre_verified` skips the cryptographic check -- set when the request
    /// was already verified (at admission, or by a forwarding follower) -- but the record is
    /// still written through `tx`.
    fn verify_client_signature(
        &mut self,
        tx: &mut S::Tx,
        cert: &[u8],
        caller_id: CallerId,
        rpc: &Value,
        pre_verified: bool,
    ) -> Option<SignedRequest> {
        self.client_sigs_table.as_ref()?;

        let signed = match SignedRequest::from_envelope(rpc) {
            Ok(signed) => signed,
            Err(err) => {
                warn!("Rejecting a malformed signature wrapper: {err}");
                return None;
            }
        };

        if !pre_verified {
            if !self.verifiers.contains(&caller_id) {
                match V::from_cert(cert) {
                    Ok(verifier) => {
                        self.verifiers.put(caller_id, verifier);
                    }
                    Err(err) => {
                        warn!("Failed to build a verifier for {caller_id}: {err}");
                        return None;
                    }
                }
            }
            let verifier = self.verifiers.get(&caller_id)?;
            if !verifier.verify(&signed.req, &signed.sig) {
                debug!("Signature mismatch for {caller_id}");
                return None;
            }
        }

        Some(self.store_signed_request(tx, caller_id, signed))
    }

    /// Record a signed request in the client-signatures view, honoring the storing knob
    fn store_signed_request(
        &self,
        tx: &mut S::Tx,
        caller_id: CallerId,
        mut signed: SignedRequest,
    ) -> SignedRequest {
        if let Some(table) = &self.client_sigs_table {
            if self.request_storing_disabled {
                // Retain only the signature, not the body
                signed.req.clear();
            }
            let mut view = View::<CallerId, SignedRequest>::new(tx.raw_view(table));
            if let Err(err) = view.put(&caller_id, &signed) {
                warn!("Failed to record the signed request for {caller_id}: {err}");
            }
        }
        signed
    }

    /// Strip a signature wrapper without re-verifying, recording it through `tx`; returns the
    /// inner envelope and the signed-request record (both trivial if the request wasn't signed)
    fn strip_signature(
        &self,
        tx: &mut S::Tx,
        caller_id: CallerId,
        mut rpc: Value,
    ) -> StdResult<(Value, SignedRequest), Value> {
        if rpc.get(jsonrpc::SIG).is_none() {
            return Ok((rpc, SignedRequest::default()));
        }
        let signed = match SignedRequest::from_envelope(&rpc) {
            Ok(signed) => signed,
            Err(err) => {
                warn!("Malformed signature wrapper: {err}");
                let inner_id = rpc
                    .get(jsonrpc::REQ)
                    .and_then(|req| req.get(jsonrpc::ID))
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                return Err(error_response(
                    inner_id,
                    ErrorCode::InvalidRequest,
                    "Malformed signature wrapper.",
                ));
            }
        };
        let signed = self.store_signed_request(tx, caller_id, signed);
        let inner = rpc.get_mut(jsonrpc::REQ).map(Value::take).unwrap_or(Value::Null);
        Ok((inner, signed))
    }

    /// A follower can't execute this request: hand it to the forwarder when allowed, else tell
    /// the client where the leader is
    fn forward_or_redirect(&self, ctx: &RpcContext, forwardable: Forwardable) -> Dispatch {
        if self.forwarder.is_some()
            && forwardable == Forwardable::CanForward
            && ctx.forwarded.is_none()
        {
            return Dispatch::Forward;
        }

        if let Some(replicator) = self.store.replicator() {
            if let Some(leader_id) = replicator.leader() {
                let mut tx = self.store.begin();
                let view = View::<NodeId, NodeInfo>::new(tx.raw_view(tables::NODES));
                match view.get(&leader_id) {
                    Ok(Some(info)) => {
                        return Dispatch::Reply(error_response(
                            ctx.seq_no,
                            ErrorCode::TxNotLeader,
                            format!("{}:{}", info.host, info.port),
                        ))
                    }
                    Ok(None) => (),
                    Err(err) => warn!("Failed to look up the leader's address: {err}"),
                }
            }
        }
        Dispatch::Reply(error_response(
            ctx.seq_no,
            ErrorCode::TxNotLeader,
            "Not leader, leader unknown.",
        ))
    }

    /// Map a handler failure onto a wire error response
    fn fault_response(&self, seq: u64, fault: HandlerError) -> Value {
        match fault {
            HandlerError::Rpc { code, message } => error_response(seq, code, message),
            HandlerError::Payload { value } => error_response_with(seq, value),
            HandlerError::Parse { pointer, message } => error_response(
                seq,
                ErrorCode::ParseError,
                format!("At {}:\n\t{}", pointer, message),
            ),
            HandlerError::Internal { message } => {
                error_response(seq, ErrorCode::InternalError, message)
            }
        }
    }

    /// Decode `input` into an envelope object, or build the error response saying why not
    fn unpack_object(&self, input: &[u8], framing: Framing) -> StdResult<Value, Value> {
        match jsonrpc::decode(input, framing) {
            Ok(value) if value.is_object() => Ok(value),
            Ok(_) => Err(error_response(0, ErrorCode::InvalidRequest, "Non-object.")),
            Err(err) => Err(error_response(
                0,
                ErrorCode::InvalidRequest,
                format!("Failed to decode the request: {err}"),
            )),
        }
    }

    /// Serialize a response; this must not fail, so a response that won't encode degrades to a
    /// hand-rolled textual INTERNAL_ERROR
    fn pack(&self, value: &Value, framing: Framing) -> Vec<u8> {
        jsonrpc::encode(value, framing).unwrap_or_else(|err| {
            tracing::error!("Failed to encode a response: {err}");
            format!(
                r#"{{"jsonrpc":"2.0","id":0,"error":{{"code":{},"message":"Failed to encode the response."}}}}"#,
                i64::from(ErrorCode::InternalError)
            )
            .into_bytes()
        })
    }
}

#[cfg(test)]
mod frontend_tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use crate::{
        memstore::MemStore,
        store::{History, Replicator},
        types::Actor,
    };

    struct FlagReplicator {
        leader: AtomicBool,
    }

    impl FlagReplicator {
        fn new(leader: bool) -> FlagReplicator {
            FlagReplicator { leader: AtomicBool::new(leader) }
        }
    }

    impl Replicator for FlagReplicator {
        fn is_leader(&self) -> bool {
            self.leader.load(Ordering::Relaxed)
        }
        fn id(&self) -> NodeId {
            0
        }
        fn leader(&self) -> Option<NodeId> {
            None
        }
        fn term(&self) -> Term {
            2
        }
        fn term_of(&self, _version: Version) -> Term {
            2
        }
        fn commit_index(&self) -> Version {
            0
        }
    }

    #[derive(Default)]
    struct CountingHistory {
        requests: AtomicUsize,
        signatures: AtomicUsize,
    }

    impl History for CountingHistory {
        fn add_request(&self, _reqid: RequestId, _actor: Actor, _raw: &[u8]) {
            self.requests.fetch_add(1, Ordering::Relaxed);
        }
        fn emit_signature(&self) {
            self.signatures.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn frontend() -> (Frontend<MemStore>, Arc<MemStore>) {
        let store = Arc::new(MemStore::new());
        (Frontend::new(Arc::clone(&store)), store)
    }

    fn ordered(
        frontend: &mut Frontend<MemStore>,
        envelope: Value,
    ) -> Value {
        let mut ctx = RpcContext::new(1, Actor::Users, Vec::new());
        let input = jsonrpc::encode(&envelope, Framing::Text).unwrap(/* known good */);
        match frontend.process_ordered(&mut ctx, &input) {
            Outcome::Responded(bytes) => {
                jsonrpc::decode(&bytes, Framing::Text).unwrap(/* known good */)
            }
            Outcome::Pending => panic!("expected a response"),
        }
    }

    #[test]
    fn list_methods_is_sorted_and_carries_a_commit() {
        let (mut frontend, store) = frontend();
        // A success response's commit falls back to the store's current version; give it one
        store.seed("app", &"boot".to_string(), &1u64).unwrap(/* known good */);

        let response = ordered(
            &mut frontend,
            json!({"jsonrpc": "2.0", "id": 7, "method": "listMethods"}),
        );
        assert_eq!(response[jsonrpc::ID], json!(7));
        let methods: Vec<String> =
            serde_json::from_value(response[jsonrpc::RESULT]["methods"].clone())
                .unwrap(/* known good */);
        let mut sorted = methods.clone();
        sorted.sort();
        assert_eq!(methods, sorted);
        assert!(methods.contains(&"mkSign".to_string()));
        assert!(response[jsonrpc::COMMIT].as_u64().unwrap(/* known good */) >= 1);
    }

    #[test]
    fn unknown_methods_fall_through_to_the_default_handler() {
        let (mut frontend, _store) = frontend();

        let response =
            ordered(&mut frontend, json!({"jsonrpc": "2.0", "id": 1, "method": "nope"}));
        assert_eq!(
            response[jsonrpc::ERROR][jsonrpc::CODE],
            json!(i64::from(ErrorCode::MethodNotFound))
        );

        frontend.set_default(
            Arc::new(|args: &mut RequestArgs<'_>| Ok(json!({"echoed": args.method}))),
            ReadWrite::Read,
        );
        let response =
            ordered(&mut frontend, json!({"jsonrpc": "2.0", "id": 2, "method": "nope"}));
        assert_eq!(response[jsonrpc::RESULT]["echoed"], json!("nope"));
    }

    #[test]
    fn the_version_and_params_are_validated() {
        let (mut frontend, _store) = frontend();

        let response =
            ordered(&mut frontend, json!({"jsonrpc": "1.0", "id": 3, "method": "listMethods"}));
        assert_eq!(
            response[jsonrpc::ERROR][jsonrpc::CODE],
            json!(i64::from(ErrorCode::InvalidRequest))
        );

        let response = ordered(
            &mut frontend,
            json!({"jsonrpc": "2.0", "id": 4, "method": "listMethods", "params": 17}),
        );
        assert_eq!(
            response[jsonrpc::ERROR][jsonrpc::CODE],
            json!(i64::from(ErrorCode::InvalidRequest))
        );
        assert_eq!(response[jsonrpc::ID], json!(4));
    }

    #[test]
    fn empty_input_is_answered_in_text_framing() {
        let (mut frontend, _store) = frontend();
        let mut ctx = RpcContext::new(1, Actor::Users, Vec::new());
        match frontend.process(&mut ctx, b"") {
            Outcome::Responded(bytes) => {
                let response =
                    jsonrpc::decode(&bytes, Framing::Text).unwrap(/* known good */);
                assert_eq!(
                    response[jsonrpc::ERROR][jsonrpc::CODE],
                    json!(i64::from(ErrorCode::InvalidRequest))
                );
                assert_eq!(response[jsonrpc::ID], json!(0));
            }
            Outcome::Pending => panic!("expected a response"),
        }
    }

    #[test]
    fn admission_records_the_request_and_pends() {
        let (mut frontend, store) = frontend();
        let history = Arc::new(CountingHistory::default());
        store.set_history(Arc::clone(&history) as Arc<dyn History>);

        let mut ctx = RpcContext::new(1, Actor::Users, Vec::new());
        let input = jsonrpc::encode(
            &json!({"jsonrpc": "2.0", "id": 9, "method": "listMethods"}),
            Framing::Text,
        )
        .unwrap(/* known good */);
        assert_eq!(frontend.process(&mut ctx, &input), Outcome::Pending);
        assert!(ctx.is_pending);
        assert_eq!(history.requests.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn a_huge_tick_emits_at_most_one_signature() {
        let (mut frontend, store) = frontend();
        let history = Arc::new(CountingHistory::default());
        store.set_history(Arc::clone(&history) as Arc<dyn History>);
        store.set_replicator(Arc::new(FlagReplicator::new(true)));
        store.seed("app", &"k".to_string(), &1u64).unwrap(/* known good */);

        frontend.set_sig_intervals(1_000, Duration::from_millis(100));
        frontend.tick(Duration::from_secs(3_600));
        assert_eq!(history.signatures.load(Ordering::Relaxed), 1);

        // ...and the countdown was reset, so a small tick doesn't emit
        frontend.tick(Duration::from_millis(10));
        assert_eq!(history.signatures.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn followers_do_not_run_the_signature_countdown() {
        let (mut frontend, store) = frontend();
        let history = Arc::new(CountingHistory::default());
        store.set_history(Arc::clone(&history) as Arc<dyn History>);
        store.set_replicator(Arc::new(FlagReplicator::new(false)));
        store.seed("app", &"k".to_string(), &1u64).unwrap(/* known good */);

        frontend.set_sig_intervals(1_000, Duration::from_millis(100));
        frontend.tick(Duration::from_secs(10));
        assert_eq!(history.signatures.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn ticks_roll_the_request_count_into_metrics() {
        let (mut frontend, store) = frontend();
        store.seed("app", &"boot".to_string(), &1u64).unwrap(/* known good */);

        ordered(&mut frontend, json!({"jsonrpc": "2.0", "id": 1, "method": "listMethods"}));
        ordered(&mut frontend, json!({"jsonrpc": "2.0", "id": 2, "method": "listMethods"}));
        frontend.tick(Duration::from_millis(1_000));

        let response =
            ordered(&mut frontend, json!({"jsonrpc": "2.0", "id": 3, "method": "getMetrics"}));
        assert_eq!(response[jsonrpc::RESULT]["total_tx"], json!(2));
    }
}
