// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Keyed handler tables backing the node's dispatch paths.
//!
//! Two shapes exist: [HandlerTable], a generic map of key to persistent
//! handler (interface handlers by message name, transport command handlers
//! by command code), and [PendingCalls], the one-shot callback table for
//! outstanding calls keyed by generated correlation id.
//!
//! Correlation ids come from a monotonically increasing counter owned by
//! [PendingCalls]; an id is unique while its call is outstanding, so an
//! entry is always consumed (or expired) before the id could recycle.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::time::Instant;

use bytes::Bytes;

use crate::{CorrelationId, HandlerResult};

/// A generic keyed table of persistent handlers
pub struct HandlerTable<K, H> {
    handlers: HashMap<K, H>,
}

impl<K, H> Default for HandlerTable<K, H>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, H> HandlerTable<K, H>
where
    K: Eq + Hash,
{
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Bind a handler to a key, displacing and returning any previous
    /// binding for that key
    pub fn bind(&mut self, key: K, handler: H) -> Option<H> {
        self.handlers.insert(key, handler)
    }

    /// Look up the handler bound to a key
    pub fn get<Q>(&self, key: &Q) -> Option<&H>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.handlers.get(key)
    }

    /// Remove and return the handler bound to a key
    pub fn remove<Q>(&mut self, key: &Q) -> Option<H>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.handlers.remove(key)
    }

    /// Whether a handler is bound to the key
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.handlers.contains_key(key)
    }

    /// Iterate the bound keys
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.handlers.keys()
    }

    /// Number of bound handlers
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Why a pending call completed without a reply body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallError {
    /// The call's deadline elapsed before a matching reply arrived
    TimedOut,
}

impl Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TimedOut => write!(f, "pending call timed out before a reply arrived"),
        }
    }
}

impl std::error::Error for CallError {}

/// The one-shot callback invoked with the reply body of a call, or with a
/// [CallError] should the call expire first
pub type ReplyCallback = Box<dyn FnOnce(Result<Bytes, CallError>) -> HandlerResult + Send + 'static>;

struct PendingEntry {
    callback: ReplyCallback,
    deadline: Option<Instant>,
}

/// The table of outstanding calls: correlation id to one-shot reply
/// callback, with an optional per-entry deadline
#[derive(Default)]
pub struct PendingCalls {
    next_id: CorrelationId,
    entries: HashMap<CorrelationId, PendingEntry>,
}

impl PendingCalls {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            next_id: 0,
            entries: HashMap::new(),
        }
    }

    /// Register a one-shot callback, returning the correlation id allocated
    /// for it
    pub fn insert(
        &mut self,
        callback: ReplyCallback,
        deadline: Option<Instant>,
    ) -> CorrelationId {
        self.next_id += 1;
        let id = self.next_id;
        self.entries.insert(id, PendingEntry { callback, deadline });
        id
    }

    /// Consume the callback registered under a correlation id. Late or
    /// duplicate replies observe [None] here.
    pub fn take(&mut self, id: CorrelationId) -> Option<ReplyCallback> {
        self.entries.remove(&id).map(|entry| entry.callback)
    }

    /// Discard an entry without invoking it, reporting whether it existed
    pub fn remove(&mut self, id: CorrelationId) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Drain every entry whose deadline is at or before `now`
    pub fn expired(&mut self, now: Instant) -> Vec<(CorrelationId, ReplyCallback)> {
        let ids = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.deadline.map_or(false, |deadline| deadline <= now))
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        ids.into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|entry| (id, entry.callback)))
            .collect()
    }

    /// Number of outstanding calls
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no outstanding calls
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
