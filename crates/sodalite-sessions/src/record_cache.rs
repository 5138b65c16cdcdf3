//! Bounded least-recently-used cache of session records.
//!
//! Recency is tracked with a monotonic use-stamp per entry plus a
//! `BTreeMap` index from stamp to session id, so promotion is an index
//! update rather than an erase-and-reinsert, and the coldest entry is
//! always the first key of the index.
//!
//! The cache is not internally synchronized; the owning
//! [`LogicalSessionCache`](crate::LogicalSessionCache) serializes access
//! with its own mutex.

use std::collections::{BTreeMap, HashMap};

use sodalite_types::{SessionId, SessionRecord};

/// Default maximum number of cached session records.
pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;

#[derive(Debug, Clone)]
struct CacheEntry {
    record: SessionRecord,
    stamp: u64,
}

/// Fixed-capacity session record cache with LRU eviction.
///
/// # Invariants
///
/// - The cache never holds more than `capacity` entries.
/// - Inserting beyond capacity evicts exactly the least-recently-touched
///   entry (never the one just inserted) and returns it to the caller.
#[derive(Debug)]
pub struct SessionRecordCache {
    capacity: usize,
    entries: HashMap<SessionId, CacheEntry>,
    /// Use-stamp to session id, coldest first.
    recency: BTreeMap<u64, SessionId>,
    next_stamp: u64,
}

impl SessionRecordCache {
    /// Creates a cache bounded at `capacity` entries.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be positive");
        Self {
            capacity,
            entries: HashMap::new(),
            recency: BTreeMap::new(),
            next_stamp: 0,
        }
    }

    /// Creates a cache with the default capacity.
    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }

    /// Inserts or overwrites the record for its session id, marking it
    /// most recently used.
    ///
    /// Returns the evicted record if the insertion pushed the cache over
    /// capacity.
    pub fn add(&mut self, record: SessionRecord) -> Option<SessionRecord> {
        let stamp = self.bump_stamp();
        let id = record.id.clone();

        if let Some(previous) = self.entries.insert(id.clone(), CacheEntry { record, stamp }) {
            self.recency.remove(&previous.stamp);
        }
        self.recency.insert(stamp, id);

        if self.entries.len() > self.capacity {
            // The entry just inserted carries the newest stamp, so the
            // first index key is always someone else.
            let (_, coldest) = self
                .recency
                .pop_first()
                .expect("recency index empty with entries over capacity");
            let entry = self
                .entries
                .remove(&coldest)
                .expect("recency index names a session missing from the cache");
            return Some(entry.record);
        }

        None
    }

    /// Looks up a record, marking it most recently used.
    pub fn find(&mut self, id: &SessionId) -> Option<&mut SessionRecord> {
        let stamp = self.next_stamp;
        let entry = self.entries.get_mut(id)?;

        self.next_stamp += 1;
        self.recency.remove(&entry.stamp);
        entry.stamp = stamp;
        self.recency.insert(stamp, id.clone());
        Some(&mut entry.record)
    }

    /// Looks up a record without touching recency.
    pub fn peek(&self, id: &SessionId) -> Option<&SessionRecord> {
        self.entries.get(id).map(|entry| &entry.record)
    }

    /// Removes a record, returning it if present.
    pub fn erase(&mut self, id: &SessionId) -> Option<SessionRecord> {
        let entry = self.entries.remove(id)?;
        self.recency.remove(&entry.stamp);
        Some(entry.record)
    }

    /// Iterates over records from least to most recently used.
    pub fn iter(&self) -> impl Iterator<Item = &SessionRecord> {
        self.recency.values().map(|id| {
            &self
                .entries
                .get(id)
                .expect("recency index names a session missing from the cache")
                .record
        })
    }

    /// Number of cached records.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn bump_stamp(&mut self) -> u64 {
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        stamp
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use sodalite_types::Timestamp;

    fn record(id: &SessionId) -> SessionRecord {
        SessionRecord::new(id.clone(), Timestamp::EPOCH)
    }

    #[test]
    fn add_and_find() {
        let mut cache = SessionRecordCache::new(4);
        let id = SessionId::new();

        assert!(cache.add(record(&id)).is_none());
        assert!(cache.find(&id).is_some());
        assert!(cache.find(&SessionId::new()).is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn insert_beyond_capacity_evicts_least_recent() {
        let capacity = 5;
        let mut cache = SessionRecordCache::new(capacity);

        let ids: Vec<SessionId> = (0..=capacity).map(|_| SessionId::new()).collect();

        let mut evictions = 0;
        for id in &ids {
            if cache.add(record(id)).is_some() {
                evictions += 1;
            }
        }

        // Exactly one eviction, and the victim is the first inserted id,
        // which was never promoted.
        assert_eq!(evictions, 1);
        assert_eq!(cache.len(), capacity);
        assert!(cache.peek(&ids[0]).is_none());
        for id in &ids[1..] {
            assert!(cache.peek(id).is_some());
        }
    }

    #[test]
    fn promotion_changes_eviction_order() {
        let mut cache = SessionRecordCache::new(3);
        let a = SessionId::new();
        let b = SessionId::new();
        let c = SessionId::new();
        let d = SessionId::new();

        cache.add(record(&a));
        cache.add(record(&b));
        cache.add(record(&c));

        // Touch `a`, making `b` the coldest.
        assert!(cache.find(&a).is_some());

        let evicted = cache.add(record(&d)).expect("must evict at capacity");
        assert_eq!(evicted.id, b);
        assert!(cache.peek(&a).is_some());
    }

    #[test]
    fn overwrite_does_not_evict() {
        let mut cache = SessionRecordCache::new(2);
        let a = SessionId::new();
        let b = SessionId::new();

        cache.add(record(&a));
        cache.add(record(&b));

        // Overwriting an existing id is not an insertion over capacity.
        assert!(cache.add(record(&a)).is_none());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn peek_does_not_promote() {
        let mut cache = SessionRecordCache::new(2);
        let a = SessionId::new();
        let b = SessionId::new();
        let c = SessionId::new();

        cache.add(record(&a));
        cache.add(record(&b));

        // Peeking `a` must not rescue it from eviction.
        assert!(cache.peek(&a).is_some());
        let evicted = cache.add(record(&c)).unwrap();
        assert_eq!(evicted.id, a);
    }

    #[test]
    fn erase_frees_capacity() {
        let mut cache = SessionRecordCache::new(2);
        let a = SessionId::new();
        let b = SessionId::new();
        let c = SessionId::new();

        cache.add(record(&a));
        cache.add(record(&b));
        assert!(cache.erase(&a).is_some());
        assert!(cache.erase(&a).is_none());

        assert!(cache.add(record(&c)).is_none());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn iter_runs_cold_to_hot() {
        let mut cache = SessionRecordCache::new(4);
        let a = SessionId::new();
        let b = SessionId::new();
        let c = SessionId::new();

        cache.add(record(&a));
        cache.add(record(&b));
        cache.add(record(&c));
        cache.find(&a);

        let order: Vec<SessionId> = cache.iter().map(|r| r.id.clone()).collect();
        assert_eq!(order, vec![b.clone(), c.clone(), a.clone()]);
    }

    #[test]
    #[should_panic(expected = "capacity must be positive")]
    fn zero_capacity_panics() {
        let _cache = SessionRecordCache::new(0);
    }

    // ========================================================================
    // Property-Based Tests
    // ========================================================================

    use proptest::prelude::*;

    /// Operations against a small id universe so adds and promotes collide.
    #[derive(Debug, Clone)]
    enum Op {
        Add(u8),
        Find(u8),
        Erase(u8),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..16).prop_map(Op::Add),
            (0u8..16).prop_map(Op::Find),
            (0u8..16).prop_map(Op::Erase),
        ]
    }

    proptest! {
        /// Property: the cache never exceeds its capacity, regardless of
        /// the interleaving of adds, promotions, and erases.
        #[test]
        fn prop_size_never_exceeds_capacity(
            capacity in 1usize..8,
            ops in prop::collection::vec(op_strategy(), 1..100),
        ) {
            let ids: Vec<SessionId> = (0..16).map(|_| SessionId::new()).collect();
            let mut cache = SessionRecordCache::new(capacity);

            for op in ops {
                match op {
                    Op::Add(i) => { cache.add(record(&ids[i as usize])); }
                    Op::Find(i) => { cache.find(&ids[i as usize]); }
                    Op::Erase(i) => { cache.erase(&ids[i as usize]); }
                }
                prop_assert!(cache.len() <= capacity);
            }
        }

        /// Property: the evicted entry is always the least recently used,
        /// as tracked by a naive model of the same operations.
        #[test]
        fn prop_eviction_matches_lru_model(
            capacity in 1usize..6,
            ops in prop::collection::vec(op_strategy(), 1..100),
        ) {
            let ids: Vec<SessionId> = (0..16).map(|_| SessionId::new()).collect();
            let mut cache = SessionRecordCache::new(capacity);

            // Model: vector of ids ordered cold -> hot.
            let mut model: Vec<usize> = Vec::new();

            for op in ops {
                match op {
                    Op::Add(i) => {
                        let i = i as usize;
                        let evicted = cache.add(record(&ids[i]));

                        model.retain(|&m| m != i);
                        model.push(i);
                        let expected = if model.len() > capacity {
                            Some(model.remove(0))
                        } else {
                            None
                        };

                        prop_assert_eq!(
                            evicted.map(|r| r.id),
                            expected.map(|m| ids[m].clone())
                        );
                    }
                    Op::Find(i) => {
                        let i = i as usize;
                        let found = cache.find(&ids[i]).is_some();
                        let in_model = model.contains(&i);
                        prop_assert_eq!(found, in_model);
                        if in_model {
                            model.retain(|&m| m != i);
                            model.push(i);
                        }
                    }
                    Op::Erase(i) => {
                        let i = i as usize;
                        cache.erase(&ids[i]);
                        model.retain(|&m| m != i);
                    }
                }
            }
        }
    }
}
