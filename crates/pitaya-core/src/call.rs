//! In-flight requests and notifies.
//!
//! Calls are keyed by the caller-chosen [`CallId`]. On the wire every call
//! travels under an internal sequence number instead, allocated fresh for each
//! call. A response that arrives after its call timed out therefore cannot be
//! matched to a newer call that reused the same caller id.
//!
//! Every accessor that resolves a call removes it and hands it back by value,
//! so the completion can only run once and runs after the entry is gone.

use std::{
    collections::{HashMap, hash_map::Entry},
    fmt,
};

use crate::error::CallError;

/// Caller-chosen call identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallId(pub u32);

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Call type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    /// Resolved by the server's response
    Request,
    /// Resolved once the transport wrote the message
    Notify,
}

/// One in-flight call.
#[derive(Debug)]
pub struct PendingCall<I, C> {
    /// Caller id
    pub id: CallId,
    /// Call type
    pub kind: CallKind,
    /// Route the call was sent on
    pub route: String,
    /// Wire sequence number
    pub seq: u32,
    /// Instant after which the call times out
    pub deadline: I,
    /// Caller's completion
    pub completion: C,
}

/// Registry of in-flight calls.
///
/// # Invariants
///
/// - A caller id maps to at most one pending call
/// - A sequence number maps to at most one pending call and is never 0
#[derive(Debug)]
pub struct CallRegistry<I, C> {
    calls: HashMap<CallId, PendingCall<I, C>>,
    by_seq: HashMap<u32, CallId>,
    next_seq: u32,
}

impl<I, C> Default for CallRegistry<I, C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I, C> CallRegistry<I, C> {
    /// Empty registry.
    pub fn new() -> Self {
        Self { calls: HashMap::new(), by_seq: HashMap::new(), next_seq: 1 }
    }

    /// Number of pending calls.
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Whether no call is pending.
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Whether `id` has a pending call.
    pub fn contains(&self, id: CallId) -> bool {
        self.calls.contains_key(&id)
    }

    /// Register a call and allocate its wire sequence number.
    ///
    /// # Errors
    ///
    /// - `CallError::DuplicateCallId` if `id` already has a pending call; the
    ///   registry is left unchanged and `completion` is dropped
    pub fn register(
        &mut self,
        id: CallId,
        kind: CallKind,
        route: impl Into<String>,
        deadline: I,
        completion: C,
    ) -> Result<u32, CallError> {
        let seq = self.allocate_seq();
        match self.calls.entry(id) {
            Entry::Occupied(_) => Err(CallError::DuplicateCallId(id)),
            Entry::Vacant(slot) => {
                slot.insert(PendingCall { id, kind, route: route.into(), seq, deadline, completion });
                self.by_seq.insert(seq, id);
                Ok(seq)
            },
        }
    }

    /// Remove the request answered by the response with `seq`.
    ///
    /// Returns `None` for unknown sequence numbers (late responses) and for
    /// notifies.
    pub fn take_response(&mut self, seq: u32) -> Option<PendingCall<I, C>> {
        self.take_seq(seq, CallKind::Request)
    }

    /// Remove the notify whose write completed.
    pub fn take_written(&mut self, seq: u32) -> Option<PendingCall<I, C>> {
        self.take_seq(seq, CallKind::Notify)
    }

    /// Remove the call registered under `id`.
    pub fn take(&mut self, id: CallId) -> Option<PendingCall<I, C>> {
        let call = self.calls.remove(&id)?;
        self.by_seq.remove(&call.seq);
        Some(call)
    }

    /// Remove every call, ordered by sequence number.
    pub fn drain(&mut self) -> Vec<PendingCall<I, C>> {
        self.by_seq.clear();
        let mut calls: Vec<_> = self.calls.drain().map(|(_, call)| call).collect();
        calls.sort_by_key(|call| call.seq);
        calls
    }

    fn take_seq(&mut self, seq: u32, kind: CallKind) -> Option<PendingCall<I, C>> {
        let id = *self.by_seq.get(&seq)?;
        if self.calls.get(&id).is_none_or(|call| call.kind != kind) {
            return None;
        }
        self.take(id)
    }

    fn allocate_seq(&mut self) -> u32 {
        loop {
            let seq = self.next_seq;
            self.next_seq = self.next_seq.wrapping_add(1);
            if seq != 0 && !self.by_seq.contains_key(&seq) {
                return seq;
            }
        }
    }
}

impl<I: Copy + Ord, C> CallRegistry<I, C> {
    /// Remove every call whose deadline is at or before `now`, earliest first.
    pub fn expire(&mut self, now: I) -> Vec<PendingCall<I, C>> {
        let expired: Vec<CallId> =
            self.calls.values().filter(|call| call.deadline <= now).map(|call| call.id).collect();

        let mut calls: Vec<_> = expired.into_iter().filter_map(|id| self.take(id)).collect();
        calls.sort_by_key(|call| (call.deadline, call.seq));
        calls
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<I> {
        self.calls.values().map(|call| call.deadline).min()
    }
}
