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

//! # An in-memory [Store]
//!
//! A reference implementation of the KV collaborator: versioned tables with optimistic
//! concurrency. Each read records the version of the entry it observed; commit validates the
//! whole read set against the current table state and, on mismatch, resets the transaction
//! against fresh state and reports [CommitOutcome::Conflict] so the dispatcher can re-execute.
//! There is no persistence and no replication here -- production deployments provide their own
//! [Store] -- but the conflict behavior is real, which is what the dispatcher's retry loop needs
//! out of a test double.

use std::{
    cell::RefCell,
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};

use serde::Serialize;
use snafu::ResultExt;

use crate::{
    store::{
        CommitOutcome, History, KeyEncodeSnafu, RawView, Replicator, Result, Store, Transaction,
        ValueEncodeSnafu,
    },
    types::{RequestId, Version},
};

#[derive(Clone, Debug)]
struct Versioned {
    data: Vec<u8>,
    version: Version,
}

#[derive(Default)]
struct StoreInner {
    tables: HashMap<String, BTreeMap<Vec<u8>, Versioned>>,
    version: Version,
    /// The highest version known to be durably replicated; `commit_gap` is measured against this
    replicated: Version,
    fail_replication: bool,
    replicator: Option<Arc<dyn Replicator>>,
    history: Option<Arc<dyn History>>,
}

/// An in-memory [Store]; cheap to clone, clones share state
#[derive(Clone, Default)]
pub struct MemStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl MemStore {
    pub fn new() -> MemStore {
        MemStore::default()
    }

    /// Attach a replicator; [Store::replicator] hands out clones of this handle
    pub fn set_replicator(&self, replicator: Arc<dyn Replicator>) {
        self.inner.lock().expect("Poisoned mutex!").replicator = Some(replicator);
    }

    /// Attach a history; [Store::history] hands out clones of this handle
    pub fn set_history(&self, history: Arc<dyn History>) {
        self.inner.lock().expect("Poisoned mutex!").history = Some(history);
    }

    /// Make every subsequent commit report [CommitOutcome::NoReplicate] (until turned off again)
    pub fn fail_replication(&self, fail: bool) {
        self.inner.lock().expect("Poisoned mutex!").fail_replication = fail;
    }

    /// Mark everything committed so far as durably replicated, zeroing the commit gap
    pub fn mark_replicated(&self) {
        let mut guard = self.inner.lock().expect("Poisoned mutex!");
        guard.replicated = guard.version;
    }

    /// Write one entry directly, outside any transaction; returns the version it committed at
    ///
    /// Handy for seeding the certs/nodes tables before the front-end comes up.
    pub fn seed<K: Serialize, V: Serialize>(
        &self,
        table: &str,
        key: &K,
        value: &V,
    ) -> Result<Version> {
        let key = rmp_serde::to_vec(key).context(KeyEncodeSnafu)?;
        let data = rmp_serde::to_vec(value).context(ValueEncodeSnafu)?;
        let mut guard = self.inner.lock().expect("Poisoned mutex!");
        guard.version += 1;
        let version = guard.version;
        guard
            .tables
            .entry(table.to_owned())
            .or_default()
            .insert(key, Versioned { data, version });
        Ok(version)
    }
}

impl Store for MemStore {
    type Tx = MemTransaction;

    fn begin(&self) -> MemTransaction {
        let snapshot = self.inner.lock().expect("Poisoned mutex!").version;
        MemTransaction {
            inner: Arc::clone(&self.inner),
            snapshot,
            commit_version: 0,
            request_id: None,
            views: HashMap::new(),
        }
    }

    fn current_version(&self) -> Version {
        self.inner.lock().expect("Poisoned mutex!").version
    }

    fn commit_gap(&self) -> u64 {
        let guard = self.inner.lock().expect("Poisoned mutex!");
        guard.version.saturating_sub(guard.replicated)
    }

    fn replicator(&self) -> Option<Arc<dyn Replicator>> {
        self.inner.lock().expect("Poisoned mutex!").replicator.clone()
    }

    fn history(&self) -> Option<Arc<dyn History>> {
        self.inner.lock().expect("Poisoned mutex!").history.clone()
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          transactions                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// One optimistic transaction against a [MemStore]
pub struct MemTransaction {
    inner: Arc<Mutex<StoreInner>>,
    snapshot: Version,
    commit_version: Version,
    request_id: Option<RequestId>,
    views: HashMap<String, MemView>,
}

impl MemTransaction {
    /// The request this transaction was stamped with, if any
    pub fn request_id(&self) -> Option<RequestId> {
        self.request_id
    }
}

/// A [RawView] over one table within a [MemTransaction]: buffered writes plus a recorded read set
pub struct MemView {
    inner: Arc<Mutex<StoreInner>>,
    table: String,
    // key -> version observed (0 for "absent"); RefCell because reads mutate tracking state
    // behind RawView's &self
    reads: RefCell<HashMap<Vec<u8>, Version>>,
    writes: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl RawView for MemView {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        if let Some(buffered) = self.writes.get(key) {
            return Some(buffered.clone());
        }
        let guard = self.inner.lock().expect("Poisoned mutex!");
        let entry = guard.tables.get(&self.table).and_then(|table| table.get(key));
        self.reads
            .borrow_mut()
            .insert(key.to_vec(), entry.map(|e| e.version).unwrap_or(0));
        entry.map(|e| e.data.clone())
    }

    fn put(&mut self, key: &[u8], value: &[u8]) {
        self.writes.insert(key.to_vec(), value.to_vec());
    }

    fn for_each(&self, f: &mut dyn FnMut(&[u8], &[u8]) -> bool) {
        // Committed state overlaid with this transaction's buffered writes
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        {
            let guard = self.inner.lock().expect("Poisoned mutex!");
            if let Some(table) = guard.tables.get(&self.table) {
                let mut reads = self.reads.borrow_mut();
                for (key, entry) in table.iter() {
                    reads.insert(key.clone(), entry.version);
                    merged.insert(key.clone(), entry.data.clone());
                }
            }
        }
        for (key, value) in self.writes.iter() {
            merged.insert(key.clone(), value.clone());
        }
        for (key, value) in merged.iter() {
            if !f(key, value) {
                break;
            }
        }
    }
}

impl Transaction for MemTransaction {
    fn raw_view(&mut self, table: &str) -> &mut dyn RawView {
        let inner = Arc::clone(&self.inner);
        self.views.entry(table.to_owned()).or_insert_with(|| MemView {
            inner,
            table: table.to_owned(),
            reads: RefCell::new(HashMap::new()),
            writes: BTreeMap::new(),
        })
    }

    fn commit(&mut self) -> CommitOutcome {
        let mut guard = self.inner.lock().expect("Poisoned mutex!");

        if guard.fail_replication {
            return CommitOutcome::NoReplicate;
        }

        // Validate the read set: every entry we observed must still be at the version we saw
        let conflicted = self.views.iter().any(|(table, view)| {
            let committed = guard.tables.get(table);
            view.reads.borrow().iter().any(|(key, seen)| {
                let current = committed
                    .and_then(|t| t.get(key))
                    .map(|e| e.version)
                    .unwrap_or(0);
                current != *seen
            })
        });
        if conflicted {
            // Reset against fresh state; the caller is expected to re-execute
            self.snapshot = guard.version;
            drop(guard);
            for view in self.views.values_mut() {
                view.reads.borrow_mut().clear();
                view.writes.clear();
            }
            return CommitOutcome::Conflict;
        }

        // A read-only transaction commits without claiming a version
        if self.views.values().all(|view| view.writes.is_empty()) {
            return CommitOutcome::Ok;
        }

        guard.version += 1;
        let version = guard.version;
        for (table, view) in self.views.iter_mut() {
            if view.writes.is_empty() {
                continue;
            }
            let committed = guard.tables.entry(table.clone()).or_default();
            for (key, data) in std::mem::take(&mut view.writes) {
                committed.insert(key, Versioned { data, version });
            }
            view.reads.borrow_mut().clear();
        }
        self.commit_version = version;
        CommitOutcome::Ok
    }

    fn commit_version(&self) -> Version {
        self.commit_version
    }

    fn read_version(&self) -> Version {
        self.snapshot
    }

    fn set_request_id(&mut self, reqid: RequestId) {
        self.request_id = Some(reqid);
    }
}

#[cfg(test)]
mod memstore_tests {
    use super::*;

    use crate::store::View;

    #[test]
    fn writes_commit_and_read_back() {
        let store = MemStore::new();
        let mut tx = store.begin();
        View::<String, u64>::new(tx.raw_view("app"))
            .put(&"k".to_string(), &1)
            .unwrap(/* known good */);
        assert_eq!(tx.commit(), CommitOutcome::Ok);
        assert_eq!(tx.commit_version(), 1);
        assert_eq!(store.current_version(), 1);

        let mut tx = store.begin();
        let view = View::<String, u64>::new(tx.raw_view("app"));
        assert_eq!(view.get(&"k".to_string()).unwrap(/* known good */), Some(1));
    }

    #[test]
    fn a_conflicting_read_set_resets_and_retries_clean() {
        let store = MemStore::new();
        store.seed("app", &"k".to_string(), &1u64).unwrap(/* known good */);

        let mut tx = store.begin();
        {
            let view = View::<String, u64>::new(tx.raw_view("app"));
            assert_eq!(view.get(&"k".to_string()).unwrap(/* known good */), Some(1));
        }
        // Someone else commits over the key we read
        store.seed("app", &"k".to_string(), &2u64).unwrap(/* known good */);
        assert_eq!(tx.commit(), CommitOutcome::Conflict);

        // The transaction has been reset; re-execution sees the fresh value and commits
        {
            let view = View::<String, u64>::new(tx.raw_view("app"));
            assert_eq!(view.get(&"k".to_string()).unwrap(/* known good */), Some(2));
        }
        assert_eq!(tx.commit(), CommitOutcome::Ok);
    }

    #[test]
    fn read_only_transactions_claim_no_version() {
        let store = MemStore::new();
        store.seed("app", &"k".to_string(), &1u64).unwrap(/* known good */);
        let mut tx = store.begin();
        {
            let view = View::<String, u64>::new(tx.raw_view("app"));
            let _ = view.get(&"k".to_string()).unwrap(/* known good */);
        }
        assert_eq!(tx.commit(), CommitOutcome::Ok);
        assert_eq!(tx.commit_version(), 0);
        assert_eq!(tx.read_version(), 1);
        assert_eq!(store.current_version(), 1);
    }

    #[test]
    fn replication_failure_is_reported() {
        let store = MemStore::new();
        store.fail_replication(true);
        let mut tx = store.begin();
        View::<String, u64>::new(tx.raw_view("app"))
            .put(&"k".to_string(), &1)
            .unwrap(/* known good */);
        assert_eq!(tx.commit(), CommitOutcome::NoReplicate);
    }

    #[test]
    fn the_commit_gap_tracks_replication() {
        let store = MemStore::new();
        assert_eq!(store.commit_gap(), 0);
        store.seed("app", &"a".to_string(), &1u64).unwrap(/* known good */);
        store.seed("app", &"b".to_string(), &2u64).unwrap(/* known good */);
        assert_eq!(store.commit_gap(), 2);
        store.mark_replicated();
        assert_eq!(store.commit_gap(), 0);
    }
}
