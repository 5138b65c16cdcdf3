//! Trait seams for the durable catalog and the embedding server process.
//!
//! The catalog is the source of truth for cross-process state; the local
//! subsystems never assume it is immediately consistent with their own
//! in-memory view. All operations are blocking network round-trips from the
//! caller's perspective.

use std::collections::HashSet;

use sodalite_types::{
    CatalogServerInfo, LockDoc, LockName, PingDoc, ProcessId, SessionId, SessionRecord, Timestamp,
};

use crate::error::Result;

// ============================================================================
// Write concern
// ============================================================================

/// Durability level requested for a lock catalog write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteConcern {
    /// Acknowledged by a majority of the catalog's replicas. Default for
    /// lock writes; required for linearizable acquisition.
    #[default]
    Majority,

    /// Acknowledged by the contacted node only. Weaker guarantee used where
    /// availability is preferred over strict linearizability.
    Local,
}

// ============================================================================
// Session kill matcher
// ============================================================================

/// Set of per-session termination patterns handed to the service liaison.
///
/// Built from the dead-session set of a reconciliation cycle; the liaison
/// kills any cursor whose session matches one of the patterns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionKillMatcher {
    patterns: HashSet<SessionId>,
}

impl SessionKillMatcher {
    /// Builds a matcher with one pattern per dead session.
    pub fn for_sessions(sessions: impl IntoIterator<Item = SessionId>) -> Self {
        Self {
            patterns: sessions.into_iter().collect(),
        }
    }

    /// Returns true if cursors owned by `session` should be killed.
    pub fn matches(&self, session: &SessionId) -> bool {
        self.patterns.contains(session)
    }

    /// Returns true if the matcher contains no patterns.
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Number of patterns in the matcher.
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// Iterates over the matched sessions.
    pub fn sessions(&self) -> impl Iterator<Item = &SessionId> {
        self.patterns.iter()
    }
}

// ============================================================================
// Service liaison
// ============================================================================

/// Interface to the embedding server process.
///
/// Supplies the set of sessions with locally running operations and carries
/// out cursor termination on the session cache's behalf.
pub trait ServiceLiaison: Send + Sync {
    /// Returns the sessions that currently have active local operations.
    fn active_local_sessions(&self) -> HashSet<SessionId>;

    /// Requests termination of all cursors owned by matching sessions.
    ///
    /// Best-effort from the caller's perspective: the sessions are already
    /// considered gone when this is issued.
    fn kill_cursors_for_sessions(&self, matcher: &SessionKillMatcher) -> Result<()>;

    /// Blocks until liaison-side background work has completed.
    fn join(&self);
}

// ============================================================================
// Sessions catalog
// ============================================================================

/// Durable store operations for logical session records.
pub trait SessionsCatalog: Send + Sync {
    /// Upserts every record with `as_of` as its new last-use time.
    fn refresh_sessions(&self, records: &[SessionRecord], as_of: Timestamp) -> Result<()>;

    /// Removes the records for the given sessions.
    fn remove_records(&self, sessions: &HashSet<SessionId>) -> Result<()>;

    /// Returns the subset of `sessions` that no longer exist in the store
    /// (removed externally, e.g. by another node's reaper).
    fn find_externally_removed(
        &self,
        sessions: &HashSet<SessionId>,
    ) -> Result<HashSet<SessionId>>;
}

// ============================================================================
// Lock catalog
// ============================================================================

/// Durable store operations for distributed locks and heartbeats.
///
/// `grab_lock` and `overtake_lock` are conditional writes: they fail with
/// [`CatalogError::LockStateChangeFailed`](crate::CatalogError::LockStateChangeFailed)
/// when the lock's current state does not match the write's precondition.
/// That failure is an expected outcome, not an error to retry blindly.
pub trait LockCatalog: Send + Sync {
    /// Atomically takes `name` if it is not currently held.
    ///
    /// Returns the stored lock document on success.
    fn grab_lock(
        &self,
        name: &LockName,
        lock_session_id: &SessionId,
        who: &str,
        process: &ProcessId,
        when: Timestamp,
        why: &str,
        write_concern: WriteConcern,
    ) -> Result<LockDoc>;

    /// Atomically replaces the holder of `name`, but only if the current
    /// holder is still `expected_current`.
    fn overtake_lock(
        &self,
        name: &LockName,
        lock_session_id: &SessionId,
        expected_current: &SessionId,
        who: &str,
        process: &ProcessId,
        when: Timestamp,
        why: &str,
    ) -> Result<LockDoc>;

    /// Releases every lock held by `lock_session_id`. Idempotent: releasing
    /// a session that holds nothing succeeds.
    fn unlock(&self, lock_session_id: &SessionId) -> Result<()>;

    /// Releases `name` if it is held by `lock_session_id`. Idempotent.
    fn unlock_named(&self, lock_session_id: &SessionId, name: &LockName) -> Result<()>;

    /// Releases every lock owned by `process`.
    fn unlock_all(&self, process: &ProcessId) -> Result<()>;

    /// Fetches the current lock document for `name`.
    fn get_lock_by_name(&self, name: &LockName) -> Result<LockDoc>;

    /// Fetches the lock document held by `lock_session_id`.
    fn get_lock_by_session(&self, lock_session_id: &SessionId) -> Result<LockDoc>;

    /// Writes a heartbeat for `process`.
    fn ping(&self, process: &ProcessId, when: Timestamp) -> Result<()>;

    /// Removes the heartbeat document for `process` (clean shutdown).
    fn stop_ping(&self, process: &ProcessId) -> Result<()>;

    /// Fetches the latest heartbeat for `process`.
    fn get_ping(&self, process: &ProcessId) -> Result<PingDoc>;

    /// Returns the catalog primary's local time and election identifier.
    fn get_server_info(&self) -> Result<CatalogServerInfo>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kill_matcher_matches_only_members() {
        let dead = SessionId::new();
        let alive = SessionId::new();

        let matcher = SessionKillMatcher::for_sessions([dead.clone()]);
        assert!(matcher.matches(&dead));
        assert!(!matcher.matches(&alive));
        assert_eq!(matcher.len(), 1);
    }

    #[test]
    fn empty_matcher_matches_nothing() {
        let matcher = SessionKillMatcher::default();
        assert!(matcher.is_empty());
        assert!(!matcher.matches(&SessionId::new()));
    }
}
