//! In-memory catalog and liaison implementations.
//!
//! These back tests and single-node development deployments. They model the
//! observable behavior of a replicated document store: conditional lock
//! writes behave like `findAndModify` (fail with
//! [`CatalogError::LockStateChangeFailed`] when the precondition does not
//! hold), and each operation can be made to fail on demand through a fault
//! queue so retry paths are exercisable without a real network.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use sodalite_types::{
    CatalogServerInfo, ElectionId, LockDoc, LockName, PingDoc, ProcessId, SessionId,
    SessionRecord, Timestamp,
};

use crate::clock::Clock;
use crate::error::{CatalogError, Result};
use crate::traits::{
    LockCatalog, ServiceLiaison, SessionKillMatcher, SessionsCatalog, WriteConcern,
};

// ============================================================================
// Fault injection
// ============================================================================

/// Queue of failures to inject into an operation, consumed front-first.
///
/// Each call to the guarded operation takes at most one queued failure, so
/// `push` twice to fail two consecutive calls.
#[derive(Debug, Default)]
struct FaultQueue {
    faults: Mutex<VecDeque<CatalogError>>,
}

impl FaultQueue {
    fn push(&self, error: CatalogError) {
        self.faults.lock().unwrap().push_back(error);
    }

    fn take(&self) -> Option<CatalogError> {
        self.faults.lock().unwrap().pop_front()
    }
}

// ============================================================================
// MemorySessionsCatalog
// ============================================================================

/// In-memory durable store for session records.
#[derive(Debug, Default)]
pub struct MemorySessionsCatalog {
    records: Mutex<HashMap<SessionId, SessionRecord>>,

    /// Record sets pushed by `refresh_sessions`, oldest first. Tests assert
    /// against these to verify exactly what each cycle persisted.
    refresh_log: Mutex<Vec<Vec<SessionRecord>>>,

    refresh_faults: FaultQueue,
    remove_faults: FaultQueue,
    find_faults: FaultQueue,
}

impl MemorySessionsCatalog {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a record directly, as another node would have.
    pub fn insert_record(&self, record: SessionRecord) {
        self.records
            .lock()
            .unwrap()
            .insert(record.id.clone(), record);
    }

    /// Removes a record directly, as another node's reaper would have.
    pub fn remove_record(&self, session: &SessionId) {
        self.records.lock().unwrap().remove(session);
    }

    /// Returns true if a record exists for the session.
    pub fn has(&self, session: &SessionId) -> bool {
        self.records.lock().unwrap().contains_key(session)
    }

    /// Returns the stored record for the session, if any.
    pub fn get(&self, session: &SessionId) -> Option<SessionRecord> {
        self.records.lock().unwrap().get(session).cloned()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    /// Returns true if the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.lock().unwrap().is_empty()
    }

    /// Record sets pushed so far, oldest first.
    pub fn refresh_log(&self) -> Vec<Vec<SessionRecord>> {
        self.refresh_log.lock().unwrap().clone()
    }

    /// Fails the next `refresh_sessions` call with `error`.
    pub fn fail_next_refresh(&self, error: CatalogError) {
        self.refresh_faults.push(error);
    }

    /// Fails the next `remove_records` call with `error`.
    pub fn fail_next_remove(&self, error: CatalogError) {
        self.remove_faults.push(error);
    }

    /// Fails the next `find_externally_removed` call with `error`.
    pub fn fail_next_find(&self, error: CatalogError) {
        self.find_faults.push(error);
    }
}

impl SessionsCatalog for MemorySessionsCatalog {
    fn refresh_sessions(&self, records: &[SessionRecord], as_of: Timestamp) -> Result<()> {
        if let Some(error) = self.refresh_faults.take() {
            return Err(error);
        }

        let mut store = self.records.lock().unwrap();
        for record in records {
            store.insert(
                record.id.clone(),
                SessionRecord::new(record.id.clone(), as_of),
            );
        }
        drop(store);

        self.refresh_log.lock().unwrap().push(records.to_vec());
        Ok(())
    }

    fn remove_records(&self, sessions: &HashSet<SessionId>) -> Result<()> {
        if let Some(error) = self.remove_faults.take() {
            return Err(error);
        }

        let mut store = self.records.lock().unwrap();
        for session in sessions {
            store.remove(session);
        }
        Ok(())
    }

    fn find_externally_removed(
        &self,
        sessions: &HashSet<SessionId>,
    ) -> Result<HashSet<SessionId>> {
        if let Some(error) = self.find_faults.take() {
            return Err(error);
        }

        let store = self.records.lock().unwrap();
        Ok(sessions
            .iter()
            .filter(|session| !store.contains_key(*session))
            .cloned()
            .collect())
    }
}

// ============================================================================
// MemoryLockCatalog
// ============================================================================

#[derive(Debug, Default)]
struct LockState {
    locks: HashMap<LockName, LockDoc>,
    pings: HashMap<ProcessId, PingDoc>,
}

/// In-memory lock and heartbeat catalog.
///
/// Server time is read from the injected clock, so a test advancing a
/// [`SimClock`](crate::SimClock) also advances the catalog primary's
/// authoritative time.
pub struct MemoryLockCatalog {
    clock: Arc<dyn Clock>,
    state: Mutex<LockState>,
    election_id: AtomicU64,

    /// Signed skew (nanoseconds) applied to the primary's reported local
    /// time. Lets tests model a failover onto a node whose clock is behind.
    server_time_skew: Mutex<i64>,

    grab_faults: FaultQueue,
    overtake_faults: FaultQueue,
    unlock_faults: FaultQueue,
    ping_faults: FaultQueue,
    server_info_faults: FaultQueue,
}

impl MemoryLockCatalog {
    /// Creates an empty lock catalog reading server time from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(LockState::default()),
            election_id: AtomicU64::new(1),
            server_time_skew: Mutex::new(0),
            grab_faults: FaultQueue::default(),
            overtake_faults: FaultQueue::default(),
            unlock_faults: FaultQueue::default(),
            ping_faults: FaultQueue::default(),
            server_info_faults: FaultQueue::default(),
        }
    }

    /// Simulates a primary failover by installing a new election id.
    pub fn set_election_id(&self, election_id: ElectionId) {
        self.election_id.store(election_id.as_u64(), Ordering::SeqCst);
    }

    /// Skews the primary's reported local time by `skew_ns` nanoseconds.
    /// Negative values move the primary's clock backwards.
    pub fn set_server_time_skew(&self, skew_ns: i64) {
        *self.server_time_skew.lock().unwrap() = skew_ns;
    }

    /// Returns the current holder document for `name`, if held.
    pub fn lock_for(&self, name: &LockName) -> Option<LockDoc> {
        self.state.lock().unwrap().locks.get(name).cloned()
    }

    /// Returns the heartbeat document for `process`, if any.
    pub fn ping_for(&self, process: &ProcessId) -> Option<PingDoc> {
        self.state.lock().unwrap().pings.get(process).cloned()
    }

    /// Fails the next `grab_lock` call with `error`.
    pub fn fail_next_grab(&self, error: CatalogError) {
        self.grab_faults.push(error);
    }

    /// Fails the next `overtake_lock` call with `error`.
    pub fn fail_next_overtake(&self, error: CatalogError) {
        self.overtake_faults.push(error);
    }

    /// Fails the next unlock call (any variant) with `error`.
    pub fn fail_next_unlock(&self, error: CatalogError) {
        self.unlock_faults.push(error);
    }

    /// Fails the next `ping` call with `error`.
    pub fn fail_next_ping(&self, error: CatalogError) {
        self.ping_faults.push(error);
    }

    /// Fails the next `get_server_info` call with `error`.
    pub fn fail_next_server_info(&self, error: CatalogError) {
        self.server_info_faults.push(error);
    }

    fn make_doc(
        name: &LockName,
        lock_session_id: &SessionId,
        who: &str,
        process: &ProcessId,
        when: Timestamp,
        why: &str,
    ) -> LockDoc {
        LockDoc {
            name: name.clone(),
            lock_session_id: lock_session_id.clone(),
            process: process.clone(),
            who: who.to_string(),
            when,
            why: why.to_string(),
        }
    }
}

impl LockCatalog for MemoryLockCatalog {
    fn grab_lock(
        &self,
        name: &LockName,
        lock_session_id: &SessionId,
        who: &str,
        process: &ProcessId,
        when: Timestamp,
        why: &str,
        _write_concern: WriteConcern,
    ) -> Result<LockDoc> {
        if let Some(error) = self.grab_faults.take() {
            return Err(error);
        }

        let mut state = self.state.lock().unwrap();
        if state.locks.contains_key(name) {
            return Err(CatalogError::LockStateChangeFailed);
        }

        let doc = Self::make_doc(name, lock_session_id, who, process, when, why);
        state.locks.insert(name.clone(), doc.clone());
        tracing::debug!(lock = %name, session = %lock_session_id, "lock grabbed");
        Ok(doc)
    }

    fn overtake_lock(
        &self,
        name: &LockName,
        lock_session_id: &SessionId,
        expected_current: &SessionId,
        who: &str,
        process: &ProcessId,
        when: Timestamp,
        why: &str,
    ) -> Result<LockDoc> {
        if let Some(error) = self.overtake_faults.take() {
            return Err(error);
        }

        let mut state = self.state.lock().unwrap();
        match state.locks.get(name) {
            Some(current) if current.lock_session_id == *expected_current => {
                let doc = Self::make_doc(name, lock_session_id, who, process, when, why);
                state.locks.insert(name.clone(), doc.clone());
                tracing::debug!(lock = %name, session = %lock_session_id, "lock overtaken");
                Ok(doc)
            }
            _ => Err(CatalogError::LockStateChangeFailed),
        }
    }

    fn unlock(&self, lock_session_id: &SessionId) -> Result<()> {
        if let Some(error) = self.unlock_faults.take() {
            return Err(error);
        }

        let mut state = self.state.lock().unwrap();
        state
            .locks
            .retain(|_, doc| doc.lock_session_id != *lock_session_id);
        Ok(())
    }

    fn unlock_named(&self, lock_session_id: &SessionId, name: &LockName) -> Result<()> {
        if let Some(error) = self.unlock_faults.take() {
            return Err(error);
        }

        let mut state = self.state.lock().unwrap();
        if let Some(doc) = state.locks.get(name) {
            if doc.lock_session_id == *lock_session_id {
                state.locks.remove(name);
            }
        }
        Ok(())
    }

    fn unlock_all(&self, process: &ProcessId) -> Result<()> {
        if let Some(error) = self.unlock_faults.take() {
            return Err(error);
        }

        let mut state = self.state.lock().unwrap();
        state.locks.retain(|_, doc| doc.process != *process);
        Ok(())
    }

    fn get_lock_by_name(&self, name: &LockName) -> Result<LockDoc> {
        self.state
            .lock()
            .unwrap()
            .locks
            .get(name)
            .cloned()
            .ok_or_else(|| CatalogError::LockNotFound(name.clone()))
    }

    fn get_lock_by_session(&self, lock_session_id: &SessionId) -> Result<LockDoc> {
        self.state
            .lock()
            .unwrap()
            .locks
            .values()
            .find(|doc| doc.lock_session_id == *lock_session_id)
            .cloned()
            .ok_or_else(|| CatalogError::LockSessionNotFound(lock_session_id.clone()))
    }

    fn ping(&self, process: &ProcessId, when: Timestamp) -> Result<()> {
        if let Some(error) = self.ping_faults.take() {
            return Err(error);
        }

        self.state.lock().unwrap().pings.insert(
            process.clone(),
            PingDoc {
                process: process.clone(),
                ping: when,
            },
        );
        Ok(())
    }

    fn stop_ping(&self, process: &ProcessId) -> Result<()> {
        if let Some(error) = self.ping_faults.take() {
            return Err(error);
        }

        self.state.lock().unwrap().pings.remove(process);
        Ok(())
    }

    fn get_ping(&self, process: &ProcessId) -> Result<PingDoc> {
        self.state
            .lock()
            .unwrap()
            .pings
            .get(process)
            .cloned()
            .ok_or_else(|| {
                CatalogError::NoMatchingDocument(format!("no ping for process {process}"))
            })
    }

    fn get_server_info(&self) -> Result<CatalogServerInfo> {
        if let Some(error) = self.server_info_faults.take() {
            return Err(error);
        }

        let skew = *self.server_time_skew.lock().unwrap();
        let nanos = self.clock.now().as_nanos().saturating_add_signed(skew);
        Ok(CatalogServerInfo {
            server_time: Timestamp::from_nanos(nanos),
            election_id: ElectionId::new(self.election_id.load(Ordering::SeqCst)),
        })
    }
}

// ============================================================================
// RecordingLiaison
// ============================================================================

/// Service liaison with a settable active-session set and a record of every
/// kill request it received.
#[derive(Debug, Default)]
pub struct RecordingLiaison {
    active: Mutex<HashSet<SessionId>>,
    killed: Mutex<HashSet<SessionId>>,
    kill_faults: FaultQueue,
}

impl RecordingLiaison {
    /// Creates a liaison with no active sessions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a session as having active local operations.
    pub fn add_active(&self, session: SessionId) {
        self.active.lock().unwrap().insert(session);
    }

    /// Clears a session's active-operation mark.
    pub fn remove_active(&self, session: &SessionId) {
        self.active.lock().unwrap().remove(session);
    }

    /// Returns true if a kill was requested for the session.
    pub fn was_killed(&self, session: &SessionId) -> bool {
        self.killed.lock().unwrap().contains(session)
    }

    /// All sessions a kill was requested for.
    pub fn killed_sessions(&self) -> HashSet<SessionId> {
        self.killed.lock().unwrap().clone()
    }

    /// Fails the next kill request with `error`.
    pub fn fail_next_kill(&self, error: CatalogError) {
        self.kill_faults.push(error);
    }
}

impl ServiceLiaison for RecordingLiaison {
    fn active_local_sessions(&self) -> HashSet<SessionId> {
        self.active.lock().unwrap().clone()
    }

    fn kill_cursors_for_sessions(&self, matcher: &SessionKillMatcher) -> Result<()> {
        if let Some(error) = self.kill_faults.take() {
            return Err(error);
        }

        let mut killed = self.killed.lock().unwrap();
        for session in matcher.sessions() {
            killed.insert(session.clone());
        }
        Ok(())
    }

    fn join(&self) {}
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SimClock;
    use std::time::Duration;

    fn catalog() -> (Arc<SimClock>, MemoryLockCatalog) {
        let clock = Arc::new(SimClock::new());
        let catalog = MemoryLockCatalog::new(Arc::clone(&clock) as Arc<dyn Clock>);
        (clock, catalog)
    }

    #[test]
    fn grab_fails_while_held() {
        let (_clock, catalog) = catalog();
        let name = LockName::new("balancer");
        let first = SessionId::new();
        let second = SessionId::new();
        let process = ProcessId::new("node-1");

        catalog
            .grab_lock(
                &name,
                &first,
                "node-1:main",
                &process,
                Timestamp::EPOCH,
                "testing",
                WriteConcern::Majority,
            )
            .unwrap();

        let result = catalog.grab_lock(
            &name,
            &second,
            "node-1:main",
            &process,
            Timestamp::EPOCH,
            "testing",
            WriteConcern::Majority,
        );
        assert_eq!(result.unwrap_err(), CatalogError::LockStateChangeFailed);
    }

    #[test]
    fn overtake_requires_expected_holder() {
        let (_clock, catalog) = catalog();
        let name = LockName::new("balancer");
        let holder = SessionId::new();
        let taker = SessionId::new();
        let stranger = SessionId::new();
        let process = ProcessId::new("node-1");

        catalog
            .grab_lock(
                &name,
                &holder,
                "who",
                &process,
                Timestamp::EPOCH,
                "why",
                WriteConcern::Majority,
            )
            .unwrap();

        // Wrong expected holder: precondition fails
        let result = catalog.overtake_lock(
            &name, &taker, &stranger, "who", &process, Timestamp::EPOCH, "why",
        );
        assert_eq!(result.unwrap_err(), CatalogError::LockStateChangeFailed);

        // Right expected holder: replaced
        let doc = catalog
            .overtake_lock(&name, &taker, &holder, "who", &process, Timestamp::EPOCH, "why")
            .unwrap();
        assert_eq!(doc.lock_session_id, taker);
    }

    #[test]
    fn unlock_is_idempotent() {
        let (_clock, catalog) = catalog();
        let session = SessionId::new();

        assert!(catalog.unlock(&session).is_ok());
        assert!(catalog
            .unlock_named(&session, &LockName::new("missing"))
            .is_ok());
    }

    #[test]
    fn unlock_named_ignores_other_holder() {
        let (_clock, catalog) = catalog();
        let name = LockName::new("shard-split");
        let holder = SessionId::new();
        let other = SessionId::new();
        let process = ProcessId::new("node-1");

        catalog
            .grab_lock(
                &name,
                &holder,
                "who",
                &process,
                Timestamp::EPOCH,
                "why",
                WriteConcern::Majority,
            )
            .unwrap();

        catalog.unlock_named(&other, &name).unwrap();
        assert!(catalog.lock_for(&name).is_some());

        catalog.unlock_named(&holder, &name).unwrap();
        assert!(catalog.lock_for(&name).is_none());
    }

    #[test]
    fn unlock_all_releases_only_that_process() {
        let (_clock, catalog) = catalog();
        let ours = ProcessId::new("node-1");
        let theirs = ProcessId::new("node-2");

        catalog
            .grab_lock(
                &LockName::new("a"),
                &SessionId::new(),
                "who",
                &ours,
                Timestamp::EPOCH,
                "why",
                WriteConcern::Majority,
            )
            .unwrap();
        catalog
            .grab_lock(
                &LockName::new("b"),
                &SessionId::new(),
                "who",
                &theirs,
                Timestamp::EPOCH,
                "why",
                WriteConcern::Majority,
            )
            .unwrap();

        catalog.unlock_all(&ours).unwrap();
        assert!(catalog.lock_for(&LockName::new("a")).is_none());
        assert!(catalog.lock_for(&LockName::new("b")).is_some());
    }

    #[test]
    fn server_info_follows_injected_clock() {
        let (clock, catalog) = catalog();

        let info = catalog.get_server_info().unwrap();
        assert_eq!(info.server_time, Timestamp::EPOCH);
        assert_eq!(info.election_id, ElectionId::new(1));

        clock.advance(Duration::from_secs(10));
        catalog.set_election_id(ElectionId::new(2));

        let info = catalog.get_server_info().unwrap();
        assert_eq!(info.server_time, Timestamp::from_millis(10_000));
        assert_eq!(info.election_id, ElectionId::new(2));
    }

    #[test]
    fn ping_roundtrip_and_stop() {
        let (_clock, catalog) = catalog();
        let process = ProcessId::new("node-1");

        assert!(matches!(
            catalog.get_ping(&process),
            Err(CatalogError::NoMatchingDocument(_))
        ));

        catalog.ping(&process, Timestamp::from_millis(7)).unwrap();
        assert_eq!(
            catalog.get_ping(&process).unwrap().ping,
            Timestamp::from_millis(7)
        );

        catalog.stop_ping(&process).unwrap();
        assert!(catalog.get_ping(&process).is_err());
    }

    #[test]
    fn fault_queue_fails_exactly_once() {
        let (_clock, catalog) = catalog();
        let process = ProcessId::new("node-1");

        catalog.fail_next_ping(CatalogError::Network("boom".into()));
        assert!(catalog.ping(&process, Timestamp::EPOCH).is_err());
        assert!(catalog.ping(&process, Timestamp::EPOCH).is_ok());
    }

    #[test]
    fn sessions_catalog_find_externally_removed() {
        let catalog = MemorySessionsCatalog::new();
        let present = SessionId::new();
        let absent = SessionId::new();
        catalog.insert_record(SessionRecord::new(present.clone(), Timestamp::EPOCH));

        let query: HashSet<_> = [present.clone(), absent.clone()].into_iter().collect();
        let removed = catalog.find_externally_removed(&query).unwrap();

        assert!(removed.contains(&absent));
        assert!(!removed.contains(&present));
    }

    #[test]
    fn sessions_catalog_refresh_upserts_with_as_of() {
        let catalog = MemorySessionsCatalog::new();
        let session = SessionId::new();
        let record = SessionRecord::new(session.clone(), Timestamp::from_millis(1));

        catalog
            .refresh_sessions(&[record], Timestamp::from_millis(99))
            .unwrap();

        assert_eq!(
            catalog.get(&session).unwrap().last_use,
            Timestamp::from_millis(99)
        );
        assert_eq!(catalog.refresh_log().len(), 1);
    }

    #[test]
    fn recording_liaison_tracks_kills() {
        let liaison = RecordingLiaison::new();
        let dead = SessionId::new();

        let matcher = SessionKillMatcher::for_sessions([dead.clone()]);
        liaison.kill_cursors_for_sessions(&matcher).unwrap();

        assert!(liaison.was_killed(&dead));
        assert!(!liaison.was_killed(&SessionId::new()));
    }
}
