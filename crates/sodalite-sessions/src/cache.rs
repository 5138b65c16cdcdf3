//! The reconciling logical session cache.
//!
//! Foreign calls (`start_session`, `promote`, `vivify`, ...) mutate the
//! local cache under one mutex and never touch the network. Durability
//! happens in the reconciliation cycle, which runs on the refresh thread at
//! a fixed interval and on demand via [`LogicalSessionCache::refresh_now`].
//!
//! # Reconciliation cycle
//!
//! 1. Snapshot and clear the ending set.
//! 2. Vivify every session the liaison reports locally active.
//! 3. Remove the ending set from the catalog; re-queue it on failure.
//! 4. Partition one cache snapshot into dead, stale, and recently active.
//! 5. Ask the catalog which stale sessions were removed externally.
//! 6. Erase dead sessions and request cursor termination for them.
//! 7. Push the recently active records.
//! 8. Advance the refresh watermark only after a successful push.
//!
//! Cursor termination must come after the dead set is final, and the
//! watermark is the threshold for the next cycle's recently-active test, so
//! the step order is load-bearing.

use std::collections::HashSet;
use std::mem;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use sodalite_catalog::{Clock, ServiceLiaison, SessionKillMatcher, SessionsCatalog};
use sodalite_types::{OwnerDigest, SessionId, SessionRecord, Timestamp};

use crate::config::SessionsConfig;
use crate::error::{Error, Result};
use crate::record_cache::SessionRecordCache;

struct Inner {
    cache: SessionRecordCache,

    /// Sessions marked for termination, drained by the next cycle.
    ending: HashSet<SessionId>,

    /// Time of the last successful push to the catalog. Records touched at
    /// or after this instant count as recently active.
    last_refresh: Timestamp,
}

/// Node-local cache of logical sessions, reconciled against the shared
/// sessions catalog.
pub struct LogicalSessionCache {
    config: SessionsConfig,
    clock: Arc<dyn Clock>,
    liaison: Arc<dyn ServiceLiaison>,
    catalog: Arc<dyn SessionsCatalog>,

    inner: Mutex<Inner>,

    shutdown: Mutex<bool>,
    shutdown_cv: Condvar,
    refresh_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl LogicalSessionCache {
    /// Creates a cache over the given collaborators. The refresh thread is
    /// not started; call [`start`](Self::start).
    pub fn new(
        config: SessionsConfig,
        clock: Arc<dyn Clock>,
        liaison: Arc<dyn ServiceLiaison>,
        catalog: Arc<dyn SessionsCatalog>,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                cache: SessionRecordCache::new(config.capacity),
                ending: HashSet::new(),
                last_refresh: Timestamp::EPOCH,
            }),
            config,
            clock,
            liaison,
            catalog,
            shutdown: Mutex::new(false),
            shutdown_cv: Condvar::new(),
            refresh_thread: Mutex::new(None),
        }
    }

    /// Spawns the periodic refresh thread.
    ///
    /// # Panics
    ///
    /// Panics if called more than once without an intervening
    /// [`shutdown`](Self::shutdown).
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.refresh_thread.lock().unwrap();
        assert!(slot.is_none(), "refresh thread already started");
        *self.shutdown.lock().unwrap() = false;

        let cache = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("sodalite-session-refresh".to_string())
            .spawn(move || cache.refresh_loop())
            .expect("failed to spawn session refresh thread");
        *slot = Some(handle);
    }

    /// Stops the refresh thread and waits for liaison-side background work.
    ///
    /// Safe to call multiple times.
    pub fn shutdown(&self) {
        {
            let mut stop = self.shutdown.lock().unwrap();
            *stop = true;
            self.shutdown_cv.notify_all();
        }

        if let Some(handle) = self.refresh_thread.lock().unwrap().take() {
            if handle.join().is_err() {
                tracing::error!("session refresh thread panicked");
            }
        }

        self.liaison.join();
    }

    fn refresh_loop(&self) {
        loop {
            let stop = self.shutdown.lock().unwrap();
            let (stop, _) = self
                .shutdown_cv
                .wait_timeout_while(stop, self.config.refresh_interval, |stop| !*stop)
                .unwrap();
            if *stop {
                break;
            }
            drop(stop);

            if let Err(error) = self.refresh_now() {
                tracing::warn!(%error, "failed to refresh session cache");
            }
        }
    }

    // ------------------------------------------------------------------
    // Foreign-call surface
    // ------------------------------------------------------------------

    /// Inserts (or overwrites) a session record in the local cache.
    ///
    /// The record reaches the catalog on the next reconciliation cycle, not
    /// synchronously. Returns [`Error::CacheEvicted`] if the insertion
    /// displaced another entry; the session is started either way.
    pub fn start_session(&self, record: SessionRecord) -> Result<()> {
        let evicted = self.inner.lock().unwrap().cache.add(record);

        if let Some(evicted) = evicted {
            tracing::debug!(session = %evicted.id, "session record evicted from full cache");
            return Err(Error::CacheEvicted { evicted: 1 });
        }
        Ok(())
    }

    /// Bumps a cached session's last-use time to now.
    ///
    /// Returns [`Error::NoSuchSession`] on a cache miss; the caller decides
    /// whether to re-create the session.
    pub fn promote(&self, session: &SessionId) -> Result<()> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap();

        match inner.cache.find(session) {
            Some(record) => {
                record.touch(now);
                Ok(())
            }
            None => Err(Error::NoSuchSession),
        }
    }

    /// Ensures a session is cached and fresh, creating it if necessary.
    ///
    /// Keeps locally active sessions alive in the cache even if they were
    /// previously evicted. Eviction caused by the re-insert is logged, not
    /// surfaced.
    pub fn vivify(&self, session: &SessionId) {
        if self.promote(session).is_ok() {
            return;
        }

        let record = SessionRecord::new(session.clone(), self.clock.now());
        if let Err(error) = self.start_session(record) {
            tracing::debug!(session = %session, %error, "eviction while vivifying session");
        }
    }

    /// Promotes each id, caching a fresh record for any that were absent.
    ///
    /// Returns an aggregate [`Error::CacheEvicted`] if any insertion
    /// displaced an entry.
    pub fn refresh_sessions(&self, sessions: &[SessionId]) -> Result<()> {
        let mut evicted = 0;
        for session in sessions {
            if self.promote(session).is_ok() {
                continue;
            }

            let record = SessionRecord::new(session.clone(), self.clock.now());
            if matches!(self.start_session(record), Err(Error::CacheEvicted { .. })) {
                evicted += 1;
            }
        }

        if evicted > 0 {
            return Err(Error::CacheEvicted { evicted });
        }
        Ok(())
    }

    /// Absorbs authoritative records from a cluster member and pushes the
    /// whole set to the catalog immediately.
    ///
    /// Unlike [`refresh_sessions`](Self::refresh_sessions), the push
    /// bypasses the staleness filter: the records came from a peer that
    /// already vouches for them.
    pub fn refresh_cluster_records(&self, records: &[SessionRecord]) -> Result<()> {
        let mut evicted = 0;
        {
            let mut inner = self.inner.lock().unwrap();
            for record in records {
                if inner.cache.add(record.clone()).is_some() {
                    evicted += 1;
                }
            }
        }
        if evicted > 0 {
            tracing::debug!(evicted, "evictions while absorbing cluster-member records");
        }

        self.catalog.refresh_sessions(records, self.clock.now())?;
        Ok(())
    }

    /// Marks sessions for termination.
    ///
    /// The sessions stay cached until the next reconciliation cycle so
    /// in-flight cursors can still be matched against them.
    pub fn end_sessions(&self, sessions: &[SessionId]) {
        let mut inner = self.inner.lock().unwrap();
        inner.ending.extend(sessions.iter().cloned());
    }

    // ------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------

    /// Runs one reconciliation cycle synchronously.
    ///
    /// Returns an error only when the final push to the catalog failed; in
    /// that case the refresh watermark does not advance and the push is
    /// retried (idempotently) on the next cycle. Earlier phases handle
    /// their own failures.
    pub fn refresh_now(&self) -> Result<()> {
        let now = self.clock.now();

        // Snapshot and clear the set of sessions waiting to be ended.
        let mut ending = {
            let mut inner = self.inner.lock().unwrap();
            mem::take(&mut inner.ending)
        };

        // Live local sessions must survive the cycle even if they were
        // evicted since the last one.
        for session in self.liaison.active_local_sessions() {
            self.vivify(&session);
        }

        // Remove ended sessions from the catalog. At-least-once: on
        // failure they are re-queued, stay cached, and are not killed
        // until a later cycle manages the removal.
        if !ending.is_empty() {
            if let Err(error) = self.catalog.remove_records(&ending) {
                tracing::warn!(%error, "failed to remove ended sessions from the sessions catalog");
                let mut inner = self.inner.lock().unwrap();
                inner.ending.extend(ending.drain());
            }
        }

        // Partition one consistent snapshot of the cache. Ended sessions
        // are dead whether cached or not; kill patterns must cover ended
        // sessions this node never cached.
        let mut dead: HashSet<SessionId> = ending;
        let (stale, active_recent) = {
            let inner = self.inner.lock().unwrap();
            let mut stale = HashSet::new();
            let mut active_recent = Vec::new();

            for record in inner.cache.iter() {
                if dead.contains(&record.id) {
                    continue;
                }
                if now.saturating_duration_since(record.last_use) > self.config.session_timeout {
                    stale.insert(record.id.clone());
                } else if record.last_use >= inner.last_refresh {
                    active_recent.push(record.clone());
                }
                // Neither stale, dead, nor recently active: leave cached,
                // nothing due this cycle.
            }
            (stale, active_recent)
        };

        // Ask the catalog which stale sessions were already removed by
        // another node's reaper, so we never locally expire a session
        // someone else is still extending.
        if !stale.is_empty() {
            match self.catalog.find_externally_removed(&stale) {
                Ok(removed) => dead.extend(removed),
                Err(error) => {
                    tracing::warn!(%error, "failed to query externally removed sessions");
                }
            }
        }

        // Drop dead sessions and request cursor termination for them.
        // Kills are best-effort: the sessions are already gone.
        if !dead.is_empty() {
            {
                let mut inner = self.inner.lock().unwrap();
                for session in &dead {
                    inner.cache.erase(session);
                }
            }

            let matcher = SessionKillMatcher::for_sessions(dead.iter().cloned());
            if let Err(error) = self.liaison.kill_cursors_for_sessions(&matcher) {
                tracing::debug!(%error, "failed to kill cursors for dead sessions");
            }
        }

        // Push recently active records. The watermark only advances after
        // the push is durable; stale/dead processing above is idempotent
        // and is not rolled back on failure.
        self.catalog.refresh_sessions(&active_recent, now)?;

        self.inner.lock().unwrap().last_refresh = now;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read-only accessors
    // ------------------------------------------------------------------

    /// Number of cached sessions.
    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().cache.len()
    }

    /// Ids of all cached sessions.
    pub fn list_ids(&self) -> Vec<SessionId> {
        let inner = self.inner.lock().unwrap();
        inner.cache.iter().map(|record| record.id.clone()).collect()
    }

    /// Ids of cached sessions owned by any of the given users.
    pub fn list_ids_for_owners(&self, owners: &[OwnerDigest]) -> Vec<SessionId> {
        let inner = self.inner.lock().unwrap();
        inner
            .cache
            .iter()
            .filter(|record| {
                record
                    .id
                    .owner()
                    .is_some_and(|owner| owners.contains(owner))
            })
            .map(|record| record.id.clone())
            .collect()
    }

    /// Returns a copy of the cached record without touching recency.
    pub fn peek_cached(&self, session: &SessionId) -> Option<SessionRecord> {
        self.inner.lock().unwrap().cache.peek(session).cloned()
    }
}

impl Drop for LogicalSessionCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Tests
// ============================================================================
