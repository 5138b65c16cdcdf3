//! The distributed lock manager.
//!
//! Acquisition works by trying to flip the lock document's state to
//! "taken" with a conditional catalog write. When the lock is held, the
//! manager decides between backing off and overtaking by consulting the
//! holder's heartbeat history; when a write's outcome is ambiguous, it
//! queues a deferred unlock instead of assuming the write did not apply.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::mem;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use sodalite_catalog::{CatalogError, Clock, LockCatalog, WriteConcern};
use sodalite_types::{ElectionId, LockDoc, LockName, ProcessId, SessionId, Timestamp};

use crate::config::DistLockConfig;
use crate::error::{Error, Result};

/// How many times to retry a grab that failed with a network error before
/// giving up on the attempt.
const MAX_LOCK_ACQUIRE_RETRIES: u32 = 2;

/// How long to back off between attempts while the lock is held.
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// How often to log progress while blocked on a contended lock.
const WAITING_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Locally observed ping state for one lock name.
///
/// The baseline against which a later observation judges elapsed time.
/// Only the catalog primary's own clock appears here; timestamps from
/// other processes are never compared against each other.
#[derive(Debug, Clone)]
struct PingHistory {
    /// Holder process at first sighting (log context only).
    process: ProcessId,

    /// Heartbeat value at the last baseline.
    last_ping: Timestamp,

    /// The catalog primary's local time at the last baseline.
    catalog_local_time: Timestamp,

    /// Holder session at the last baseline.
    lock_session: SessionId,

    /// Primary election at the last baseline.
    election_id: ElectionId,
}

#[derive(Default)]
struct Inner {
    shutdown: bool,
    ping_history: HashMap<LockName, PingHistory>,

    /// Unlocks to retry from the pinger thread: the attempt's session
    /// handle plus the lock name when it is known.
    unlock_queue: VecDeque<(SessionId, Option<LockName>)>,

    /// When the previous pinger cycle ran, for starvation detection.
    last_ping_cycle: Option<Timestamp>,
}

/// Distributed lock manager backed by the shared lock catalog.
///
/// # Lifecycle
///
/// 1. Create with [`DistLockManager::new`].
/// 2. Call [`start_up`](Self::start_up) to spawn the pinger thread.
/// 3. Acquire and release locks from any thread.
/// 4. Call [`shut_down`](Self::shut_down) to stop pinging and withdraw the
///    heartbeat document.
pub struct DistLockManager {
    config: DistLockConfig,
    clock: Arc<dyn Clock>,
    catalog: Arc<dyn LockCatalog>,

    inner: Mutex<Inner>,
    shutdown_cv: Condvar,
    pinger: Mutex<Option<thread::JoinHandle<()>>>,
}

impl DistLockManager {
    /// Creates a manager over the given catalog. The pinger thread is not
    /// started; call [`start_up`](Self::start_up).
    pub fn new(config: DistLockConfig, clock: Arc<dyn Clock>, catalog: Arc<dyn LockCatalog>) -> Self {
        Self {
            config,
            clock,
            catalog,
            inner: Mutex::new(Inner::default()),
            shutdown_cv: Condvar::new(),
            pinger: Mutex::new(None),
        }
    }

    /// This process's identity in the catalog.
    pub fn process_id(&self) -> &ProcessId {
        &self.config.process_id
    }

    /// Returns true once [`shut_down`](Self::shut_down) has been requested.
    pub fn is_shut_down(&self) -> bool {
        self.inner.lock().unwrap().shutdown
    }

    /// Number of deferred unlocks awaiting retry.
    pub fn deferred_unlock_count(&self) -> usize {
        self.inner.lock().unwrap().unlock_queue.len()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Spawns the background pinger thread.
    ///
    /// # Panics
    ///
    /// Panics if called more than once without an intervening
    /// [`shut_down`](Self::shut_down).
    pub fn start_up(self: &Arc<Self>) {
        let mut slot = self.pinger.lock().unwrap();
        assert!(slot.is_none(), "pinger thread already started");
        self.inner.lock().unwrap().shutdown = false;

        let manager = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("sodalite-distlock-pinger".to_string())
            .spawn(move || manager.do_task())
            .expect("failed to spawn distributed lock pinger thread");
        *slot = Some(handle);
    }

    /// Stops the pinger thread, then withdraws this process's heartbeat
    /// document (best effort).
    ///
    /// Safe to call multiple times.
    pub fn shut_down(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.shutdown = true;
            self.shutdown_cv.notify_all();
        }

        let joined = {
            let handle = self.pinger.lock().unwrap().take();
            match handle {
                Some(handle) => {
                    if handle.join().is_err() {
                        tracing::error!("distributed lock pinger thread panicked");
                    }
                    true
                }
                None => false,
            }
        };

        if joined {
            if let Err(error) = self.catalog.stop_ping(&self.config.process_id) {
                tracing::warn!(
                    process = %self.config.process_id,
                    %error,
                    "failed to clean up distributed lock ping entry"
                );
            }
        }
    }

    fn do_task(&self) {
        tracing::info!(
            process = %self.config.process_id,
            interval = ?self.config.ping_interval,
            "starting distributed lock pinger thread"
        );

        loop {
            if self.is_shut_down() {
                break;
            }

            self.run_pinger_cycle();

            let inner = self.inner.lock().unwrap();
            let _guard = self
                .shutdown_cv
                .wait_timeout_while(inner, self.config.ping_interval, |inner| !inner.shutdown)
                .unwrap();
        }
    }

    /// One pinger cycle: heartbeat, starvation check, deferred unlocks.
    ///
    /// Public so tests (and embedders without a background thread) can
    /// drive the pinger explicitly.
    pub fn run_pinger_cycle(&self) {
        let now = self.clock.now();

        if let Err(error) = self.catalog.ping(&self.config.process_id, now) {
            if !matches!(error, CatalogError::NotPrimary) {
                tracing::warn!(
                    process = %self.config.process_id,
                    %error,
                    "pinging failed for distributed lock pinger"
                );
            }
        }

        // A pinger that falls far behind schedule can no longer vouch for
        // this process's locks; other nodes may be judging them expired.
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(previous) = inner.last_ping_cycle {
                let elapsed = now.saturating_duration_since(previous);
                if elapsed > self.config.ping_interval * 10 {
                    tracing::warn!(
                        process = %self.config.process_id,
                        ?elapsed,
                        "distributed lock pinger was inactive for too long"
                    );
                }
            }
            inner.last_ping_cycle = Some(now);
        }

        let batch = {
            let mut inner = self.inner.lock().unwrap();
            mem::take(&mut inner.unlock_queue)
        };

        for (session, name) in batch {
            let result = match &name {
                Some(name) => self.catalog.unlock_named(&session, name),
                None => self.catalog.unlock(&session),
            };

            match result {
                Ok(()) => {
                    tracing::info!(session = %session, name = ?name, "deferred distributed lock released");
                }
                Err(error) => {
                    tracing::warn!(
                        session = %session,
                        name = ?name,
                        %error,
                        "failed to release deferred distributed lock"
                    );
                    // A non-primary cannot own authoritative lock state, so
                    // dropping the entry is correct; everything else retries.
                    if !matches!(error, CatalogError::NotPrimary) {
                        self.queue_unlock(session, name);
                    }
                }
            }

            if self.is_shut_down() {
                return;
            }
        }
    }

    // ------------------------------------------------------------------
    // Acquisition
    // ------------------------------------------------------------------

    /// Acquires the named lock, waiting up to `wait_for` while it is held.
    ///
    /// `Duration::ZERO` makes a single attempt; `Duration::MAX` waits
    /// indefinitely. On success the session handle identifies the held
    /// lock. Exhausting the budget fails with [`Error::LockBusy`].
    pub fn lock_with_session_id(
        &self,
        name: &LockName,
        why: &str,
        lock_session_id: &SessionId,
        wait_for: Duration,
    ) -> Result<SessionId> {
        let start = self.clock.now();
        let mut last_progress_log = start;

        // Network-error retries are counted per acquisition attempt; each
        // pass of the outer loop is an independent write.
        let mut network_retries = 0;

        while wait_for.is_zero() || self.clock.now().saturating_duration_since(start) < wait_for {
            let who = self.who();

            tracing::debug!(
                lock = %name,
                session = %lock_session_id,
                process = %self.config.process_id,
                why,
                "trying to acquire distributed lock"
            );

            let grab = self.catalog.grab_lock(
                name,
                lock_session_id,
                &who,
                &self.config.process_id,
                self.clock.now(),
                why,
                WriteConcern::Majority,
            );

            let mut status = match grab {
                Ok(_) => {
                    tracing::info!(lock = %name, session = %lock_session_id, why, "distributed lock acquired");
                    return Ok(lock_session_id.clone());
                }
                Err(status) => status,
            };

            // A network error leaves the write's outcome unknown: unlock
            // synchronously, then retry the grab.
            if status.is_retriable() && network_retries < MAX_LOCK_ACQUIRE_RETRIES {
                tracing::debug!(
                    lock = %name,
                    %status,
                    "retriable error while acquiring distributed lock, unlocking and retrying"
                );
                network_retries += 1;

                match self.catalog.unlock_named(lock_session_id, name) {
                    Ok(()) => continue, // certainly not held by us now
                    Err(unlock_status) => {
                        debug_assert!(!matches!(
                            unlock_status,
                            CatalogError::LockStateChangeFailed
                        ));
                        status = unlock_status;
                    }
                }
            }

            if !matches!(status, CatalogError::LockStateChangeFailed) {
                // The write might still have applied on the other side.
                self.queue_unlock(lock_session_id.clone(), Some(name.clone()));
                return Err(status.into());
            }

            // The lock is genuinely held. Overtake only a lock that still
            // exists; if it vanished, the next pass grabs it normally.
            match self.catalog.get_lock_by_name(name) {
                Err(CatalogError::LockNotFound(_)) => {}
                Err(other) => return Err(other.into()),
                Ok(current) => {
                    let expired = self.is_lock_expired(&current, self.config.lock_expiration)?;

                    if expired || current.lock_session_id == *lock_session_id {
                        match self.catalog.overtake_lock(
                            name,
                            lock_session_id,
                            &current.lock_session_id,
                            &who,
                            &self.config.process_id,
                            self.clock.now(),
                            why,
                        ) {
                            Ok(_) => {
                                tracing::info!(
                                    lock = %name,
                                    session = %lock_session_id,
                                    "distributed lock overtaken"
                                );
                                return Ok(lock_session_id.clone());
                            }
                            // Someone else overtook first; back off and retry.
                            Err(CatalogError::LockStateChangeFailed) => {}
                            Err(other) => {
                                self.queue_unlock(lock_session_id.clone(), None);
                                return Err(other.into());
                            }
                        }
                    }
                }
            }

            tracing::debug!(lock = %name, "distributed lock was not acquired");

            if wait_for.is_zero() {
                break;
            }

            let now = self.clock.now();
            if now.saturating_duration_since(last_progress_log) > WAITING_LOG_INTERVAL {
                tracing::info!(
                    lock = %name,
                    why,
                    waited = ?now.saturating_duration_since(start),
                    "still waiting for distributed lock"
                );
                last_progress_log = now;
            }

            // The previous pass found the lock busy, so the next one is a
            // fresh acquisition attempt.
            network_retries = 0;

            let remaining = wait_for.saturating_sub(now.saturating_duration_since(start));
            thread::sleep(LOCK_RETRY_INTERVAL.min(remaining));
        }

        Err(Error::LockBusy { name: name.clone() })
    }

    /// Single grab attempt with node-local write concern.
    ///
    /// No overtake, no retries: used where availability matters more than
    /// strict linearizability.
    pub fn try_lock_with_local_write_concern(
        &self,
        name: &LockName,
        why: &str,
        lock_session_id: &SessionId,
    ) -> Result<SessionId> {
        let who = self.who();

        tracing::debug!(
            lock = %name,
            session = %lock_session_id,
            process = %self.config.process_id,
            why,
            "trying to acquire distributed lock with local write concern"
        );

        match self.catalog.grab_lock(
            name,
            lock_session_id,
            &who,
            &self.config.process_id,
            self.clock.now(),
            why,
            WriteConcern::Local,
        ) {
            Ok(_) => {
                tracing::info!(lock = %name, session = %lock_session_id, why, "distributed lock acquired");
                Ok(lock_session_id.clone())
            }
            Err(CatalogError::LockStateChangeFailed) => Err(Error::LockBusy { name: name.clone() }),
            Err(other) => Err(other.into()),
        }
    }

    // ------------------------------------------------------------------
    // Expiration heuristic
    // ------------------------------------------------------------------

    /// Judges whether a lock's holder has been silent past the expiration
    /// window.
    ///
    /// Conservative by construction: the first sighting of a lock, any
    /// change in ping/holder/election since the baseline, and a backwards
    /// catalog clock all report "not expired". Only an unchanged baseline
    /// measured by the same catalog primary can expire a lock.
    pub fn is_lock_expired(&self, lock_doc: &LockDoc, lock_expiration: Duration) -> Result<bool> {
        let process = &lock_doc.process;

        let ping_value = match self.catalog.get_ping(process) {
            Ok(ping_doc) => ping_doc.ping,
            // A process that never pinged gets the epoch as its heartbeat.
            Err(CatalogError::NoMatchingDocument(_)) => Timestamp::EPOCH,
            Err(other) => return Err(other.into()),
        };

        let fetch_started = self.clock.now();
        let server_info = match self.catalog.get_server_info() {
            Ok(info) => info,
            Err(CatalogError::NotPrimary) => return Ok(false),
            Err(other) => return Err(other.into()),
        };

        // Map the primary's clock onto the moment the request was served,
        // assuming a symmetrical round trip.
        let delay = self.clock.now().saturating_duration_since(fetch_started) / 2;
        let catalog_local_time = server_info.server_time.saturating_sub(delay);

        let mut inner = self.inner.lock().unwrap();
        let history = match inner.ping_history.entry(lock_doc.name.clone()) {
            Entry::Vacant(entry) => {
                // No point of reference yet; record one and decline to judge.
                entry.insert(PingHistory {
                    process: process.clone(),
                    last_ping: ping_value,
                    catalog_local_time: server_info.server_time,
                    lock_session: lock_doc.lock_session_id.clone(),
                    election_id: server_info.election_id,
                });
                return Ok(false);
            }
            Entry::Occupied(entry) => entry.into_mut(),
        };

        tracing::debug!(
            lock = %lock_doc.name,
            process = %history.process,
            last_ping = %history.last_ping,
            "checking last ping for distributed lock"
        );

        if history.last_ping != ping_value
            || history.lock_session != lock_doc.lock_session_id
            || history.election_id != server_info.election_id
        {
            // The holder pinged, the lock changed hands, or the primary
            // changed. The old baseline proves nothing; start a new one.
            history.last_ping = ping_value;
            history.election_id = server_info.election_id;
            history.catalog_local_time = catalog_local_time;
            history.lock_session = lock_doc.lock_session_id.clone();
            return Ok(false);
        }

        if catalog_local_time < history.catalog_local_time {
            tracing::warn!(
                previous = %history.catalog_local_time,
                current = %catalog_local_time,
                "catalog server local time went backwards"
            );
            return Ok(false);
        }

        let elapsed = catalog_local_time.saturating_duration_since(history.catalog_local_time);
        if elapsed >= lock_expiration {
            tracing::info!(
                lock = %lock_doc.name,
                ?elapsed,
                takeover = ?lock_expiration,
                "forcing distributed lock: holder silent past takeover time"
            );
            return Ok(true);
        }

        tracing::debug!(
            lock = %lock_doc.name,
            ?elapsed,
            takeover = ?lock_expiration,
            "distributed lock holder not yet expired"
        );
        Ok(false)
    }

    // ------------------------------------------------------------------
    // Release
    // ------------------------------------------------------------------

    /// Releases every lock held by the session handle. Best effort: a
    /// failure queues a deferred unlock rather than propagating.
    pub fn unlock(&self, lock_session_id: &SessionId) {
        match self.catalog.unlock(lock_session_id) {
            Ok(()) => {
                tracing::info!(session = %lock_session_id, "distributed lock released");
            }
            Err(error) => {
                tracing::warn!(
                    session = %lock_session_id,
                    %error,
                    "failed to release distributed lock, deferring"
                );
                self.queue_unlock(lock_session_id.clone(), None);
            }
        }
    }

    /// Releases the named lock if held by the session handle. Best effort.
    pub fn unlock_with_name(&self, lock_session_id: &SessionId, name: &LockName) {
        match self.catalog.unlock_named(lock_session_id, name) {
            Ok(()) => {
                tracing::info!(session = %lock_session_id, lock = %name, "distributed lock released");
            }
            Err(error) => {
                tracing::warn!(
                    session = %lock_session_id,
                    lock = %name,
                    %error,
                    "failed to release distributed lock, deferring"
                );
                self.queue_unlock(lock_session_id.clone(), Some(name.clone()));
            }
        }
    }

    /// Releases everything owned by a process (e.g. on clean shutdown).
    /// Failures are logged only.
    pub fn unlock_all(&self, process: &ProcessId) {
        if let Err(error) = self.catalog.unlock_all(process) {
            tracing::warn!(
                process = %process,
                %error,
                "error while releasing distributed locks held by process"
            );
        }
    }

    /// Verifies that the session handle still holds a lock in the catalog.
    pub fn check_status(&self, lock_session_id: &SessionId) -> Result<()> {
        self.catalog.get_lock_by_session(lock_session_id)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn queue_unlock(&self, lock_session_id: SessionId, name: Option<LockName>) {
        let mut inner = self.inner.lock().unwrap();
        inner.unlock_queue.push_back((lock_session_id, name));
    }

    fn who(&self) -> String {
        let thread_name = thread::current()
            .name()
            .unwrap_or("unknown")
            .to_string();
        format!("{}:{}", self.config.process_id, thread_name)
    }
}

impl Drop for DistLockManager {
    fn drop(&mut self) {
        self.shut_down();
    }
}

// ============================================================================
// Tests
// ============================================================================
