//! Clock abstraction for production vs. deterministic test time.
//!
//! Everything time-dependent in the coordination layer (session timeouts,
//! ping intervals, lock expiration windows) reads time through this trait,
//! so tests drive the clock explicitly instead of sleeping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use sodalite_types::Timestamp;

/// Trait for time sources.
///
/// Implementations must be `Send + Sync`; the coordination subsystems share
/// one clock between caller threads and their background workers.
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> Timestamp;
}

// ============================================================================
// Production Implementation
// ============================================================================

/// System clock using wall-clock time.
#[derive(Debug, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Creates a new system clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

// ============================================================================
// Simulation Implementation
// ============================================================================

/// Deterministic clock that advances only when explicitly told to.
///
/// Time is held in an atomic so the clock can be shared (`Arc<SimClock>`)
/// between a test thread advancing it and subsystem threads reading it.
#[derive(Debug)]
pub struct SimClock {
    now_ns: AtomicU64,
}

impl SimClock {
    /// Creates a clock starting at the Unix epoch.
    pub fn new() -> Self {
        Self {
            now_ns: AtomicU64::new(0),
        }
    }

    /// Creates a clock starting at the given time.
    pub fn at(start: Timestamp) -> Self {
        Self {
            now_ns: AtomicU64::new(start.as_nanos()),
        }
    }

    /// Advances the clock by a delta.
    pub fn advance(&self, delta: Duration) {
        self.now_ns
            .fetch_add(delta.as_nanos() as u64, Ordering::SeqCst);
    }

    /// Advances the clock to the given time. Never moves time backwards.
    pub fn advance_to(&self, target: Timestamp) {
        self.now_ns.fetch_max(target.as_nanos(), Ordering::SeqCst);
    }
}

impl Clock for SimClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_nanos(self.now_ns.load(Ordering::SeqCst))
    }
}

impl Default for SimClock {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================
