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

//! # The method registry
//!
//! Maps method names to handlers. A handler is a callback over [RequestArgs] together with three
//! attributes the dispatcher routes on: its read/write tag, its forwardability, and a pair of
//! opaque JSON schemas describing its params & result (served by `getSchema`, never enforced
//! here). Installation replaces; an optional default handler catches unknown methods.

use std::{collections::HashMap, sync::Arc};

use itertools::Itertools;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use snafu::Snafu;

use crate::{
    jsonrpc::ErrorCode,
    store::Transaction,
    types::{CallerId, Forwardable, ReadWrite, RpcContext, SignedRequest},
};

pub type StdResult<T, E> = std::result::Result<T, E>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         handler errors                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The ways a handler can fail
///
/// Rust has no exceptions, so the original's exception bands travel in the error variant instead:
/// the dispatcher maps each of these onto a wire error response carrying the request id.
#[derive(Debug, Snafu)]
pub enum HandlerError {
    /// A domain failure with its own wire code
    #[snafu(display("{message}"))]
    Rpc { code: ErrorCode, message: String },
    /// A pre-built error member, wrapped into the response verbatim
    #[snafu(display("handler error payload"))]
    Payload { value: Value },
    /// A structural decoding failure, annotated with a JSON pointer
    #[snafu(display("At {pointer}: {message}"))]
    Parse { pointer: String, message: String },
    /// Anything else
    #[snafu(display("{message}"))]
    Internal { message: String },
}

pub type HandlerResult = StdResult<Value, HandlerError>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       handler callbacks                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Everything a handler can see of the request it's serving
pub struct RequestArgs<'a> {
    pub ctx: &'a mut RpcContext,
    /// The dispatch's transaction; reads & writes here commit (or conflict) together
    pub tx: &'a mut dyn Transaction,
    pub caller_id: CallerId,
    pub method: &'a str,
    /// The envelope's `params` member; [Value::Null] when absent
    pub params: &'a Value,
    /// The signed-request record; empty if the request wasn't signed
    pub signed_request: &'a SignedRequest,
}

pub type HandlerFn = Arc<dyn Fn(&mut RequestArgs<'_>) -> HandlerResult + Send + Sync>;

/// Adapt a handler that only needs the transaction & params, which is most of them
pub fn minimal<F>(f: F) -> HandlerFn
where
    F: Fn(&mut dyn Transaction, &Value) -> HandlerResult + Send + Sync + 'static,
{
    Arc::new(move |args: &mut RequestArgs<'_>| f(args.tx, args.params))
}

/// Parse a handler's params into a typed shape
///
/// An absent `params` member arrives as [Value::Null]; we treat that the same as `{}` so that
/// all-optional shapes don't force clients to send an empty object.
pub fn parse_params<T: DeserializeOwned>(params: &Value) -> StdResult<T, HandlerError> {
    let params = match params {
        Value::Null => json!({}),
        other => other.clone(),
    };
    serde_json::from_value(params).map_err(|err| {
        ParseSnafu {
            pointer: "/params".to_string(),
            message: err.to_string(),
        }
        .build()
    })
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          the registry                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A method handler and its routing attributes
#[derive(Clone)]
pub struct Handler {
    pub func: HandlerFn,
    pub rw: ReadWrite,
    pub params_schema: Value,
    pub result_schema: Value,
    pub forwardable: Forwardable,
}

/// Maps method names to [Handler]s
#[derive(Default)]
pub struct Registry {
    handlers: HashMap<String, Handler>,
    default_handler: Option<Handler>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

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
        self.handlers.insert(
            method.into(),
            Handler { func, rw, params_schema, result_schema, forwardable },
        );
    }

    /// [install](Registry::install) with empty schemas & [Forwardable::CanForward]
    pub fn install_minimal(&mut self, method: impl Into<String>, func: HandlerFn, rw: ReadWrite) {
        self.install(method, func, rw, json!({}), json!({}), Forwardable::CanForward);
    }

    /// Register a fallback, invoked only when no named handler matches
    pub fn set_default(&mut self, func: HandlerFn, rw: ReadWrite) {
        self.default_handler = Some(Handler {
            func,
            rw,
            params_schema: json!({}),
            result_schema: json!({}),
            forwardable: Forwardable::CanForward,
        });
    }

    pub fn lookup(&self, method: &str) -> Option<Handler> {
        self.handlers.get(method).cloned()
    }

    pub fn default_handler(&self) -> Option<Handler> {
        self.default_handler.clone()
    }

    /// Both schemas for a method, params first; None if the method isn't recognised
    pub fn schema(&self, method: &str) -> Option<(Value, Value)> {
        self.handlers
            .get(method)
            .map(|handler| (handler.params_schema.clone(), handler.result_schema.clone()))
    }

    /// All registered method names, in lexicographic order
    pub fn list(&self) -> Vec<String> {
        self.handlers.keys().cloned().sorted().collect()
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         schema helpers                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Tiny builders for the JSON schemas served by `getSchema`
///
/// The registry treats schemas as opaque; these just cut down on the repetition of declaring the
/// built-in methods' shapes.
pub mod schema {
    use serde_json::{json, Value};

    pub fn object(properties: &[(&str, Value)], required: &[&str]) -> Value {
        let mut props = serde_json::Map::new();
        for (name, schema) in properties {
            props.insert(name.to_string(), schema.clone());
        }
        json!({ "type": "object", "properties": props, "required": required })
    }

    pub fn integer() -> Value {
        json!({ "type": "integer" })
    }

    pub fn string() -> Value {
        json!({ "type": "string" })
    }

    pub fn boolean() -> Value {
        json!({ "type": "boolean" })
    }

    pub fn number() -> Value {
        json!({ "type": "number" })
    }

    pub fn array_of(items: Value) -> Value {
        json!({ "type": "array", "items": items })
    }
}

#[cfg(test)]
mod registry_tests {
    use super::*;

    use serde::Deserialize;

    fn nop() -> HandlerFn {
        Arc::new(|_args: &mut RequestArgs<'_>| Ok(json!(true)))
    }

    #[test]
    fn installation_replaces() {
        let mut registry = Registry::new();
        registry.install_minimal("frob", nop(), ReadWrite::Read);
        registry.install(
            "frob",
            nop(),
            ReadWrite::Write,
            json!({}),
            json!({}),
            Forwardable::DoNotForward,
        );
        let handler = registry.lookup("frob").unwrap(/* known good */);
        assert_eq!(handler.rw, ReadWrite::Write);
        assert_eq!(handler.forwardable, Forwardable::DoNotForward);
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn listing_is_sorted() {
        let mut registry = Registry::new();
        for name in ["zeta", "alpha", "mu"] {
            registry.install_minimal(name, nop(), ReadWrite::Read);
        }
        assert_eq!(registry.list(), vec!["alpha", "mu", "zeta"]);
    }

    #[test]
    fn the_default_handler_is_distinct_from_the_named_ones() {
        let mut registry = Registry::new();
        assert!(registry.default_handler().is_none());
        registry.set_default(nop(), ReadWrite::Read);
        assert!(registry.default_handler().is_some());
        assert!(registry.lookup("anything").is_none());
        assert!(registry.list().is_empty());
    }

    #[test]
    fn schemas_come_back_params_first() {
        let mut registry = Registry::new();
        registry.install(
            "frob",
            nop(),
            ReadWrite::Read,
            schema::object(&[("knob", schema::integer())], &["knob"]),
            schema::boolean(),
            Forwardable::CanForward,
        );
        let (params, result) = registry.schema("frob").unwrap(/* known good */);
        assert_eq!(params["properties"]["knob"]["type"], json!("integer"));
        assert_eq!(result["type"], json!("boolean"));
        assert!(registry.schema("nope").is_none());
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Shape {
        commit: Option<u64>,
    }

    #[test]
    fn absent_params_parse_as_empty() {
        assert_eq!(
            parse_params::<Shape>(&Value::Null).unwrap(/* known good */),
            Shape { commit: None }
        );
        assert_eq!(
            parse_params::<Shape>(&json!({"commit": 42})).unwrap(/* known good */),
            Shape { commit: Some(42) }
        );
        let err = parse_params::<Shape>(&json!({"commit": "nope"})).unwrap_err();
        assert!(matches!(err, HandlerError::Parse { .. }));
    }
}
