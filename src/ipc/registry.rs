//! Outstanding-call bookkeeping.
//!
//! Ids are handed out from a monotonically increasing counter and each sent
//! call is tracked until its reply arrives, the connection drops, or it is
//! pruned as abandoned. Only the method name and submission time are kept;
//! calls are never replayed.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::protocol::CallId;

/// Metadata for a call awaiting its reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCall {
    pub method: String,
    pub submitted_at: DateTime<Utc>,
}

/// Pending-call set plus the id counter.
#[derive(Debug)]
pub struct CallRegistry {
    next_id: CallId,
    pending: BTreeMap<CallId, PendingCall>,
}

impl Default for CallRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CallRegistry {
    /// First id handed out by a fresh registry.
    pub const FIRST_ID: CallId = 1;

    pub fn new() -> Self {
        Self {
            next_id: Self::FIRST_ID,
            pending: BTreeMap::new(),
        }
    }

    /// Generate the next call id.
    ///
    /// On counter overflow the sequence restarts at [`Self::FIRST_ID`],
    /// skipping any id that is still pending.
    pub fn next_id(&mut self) -> CallId {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.checked_add(1).unwrap_or(Self::FIRST_ID);
            if !self.pending.contains_key(&id) {
                return id;
            }
        }
    }

    /// Record a call submitted now.
    pub fn track(&mut self, id: CallId, method: &str) {
        self.track_at(id, method, Utc::now());
    }

    /// Record a call with an explicit submission time.
    pub fn track_at(&mut self, id: CallId, method: &str, submitted_at: DateTime<Utc>) {
        let previous = self.pending.insert(
            id,
            PendingCall {
                method: method.to_string(),
                submitted_at,
            },
        );
        if let Some(previous) = previous {
            tracing::warn!(id, method = %previous.method, "Replaced pending call with duplicate id");
        }
    }

    /// Remove and return the entry for `id`, if any.
    pub fn resolve(&mut self, id: CallId) -> Option<PendingCall> {
        self.pending.remove(&id)
    }

    pub fn contains(&self, id: CallId) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Pending ids in ascending order.
    pub fn pending_ids(&self) -> Vec<CallId> {
        self.pending.keys().copied().collect()
    }

    /// Drop every pending entry, returning how many were abandoned.
    pub fn clear(&mut self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        count
    }

    /// Remove entries submitted more than `max_age` before `now`.
    ///
    /// Returns the removed entries in id order.
    pub fn prune_older_than(
        &mut self,
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> Vec<(CallId, PendingCall)> {
        let Ok(max_age) = TimeDelta::from_std(max_age) else {
            // Larger than chrono can represent: nothing is ever that old
            return Vec::new();
        };

        let expired: Vec<CallId> = self
            .pending
            .iter()
            .filter(|(_, call)| now.signed_duration_since(call.submitted_at) > max_age)
            .map(|(id, _)| *id)
            .collect();

        expired
            .into_iter()
            .filter_map(|id| self.pending.remove(&id).map(|call| (id, call)))
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn set_next_id(&mut self, id: CallId) {
        self.next_id = id;
    }
}
