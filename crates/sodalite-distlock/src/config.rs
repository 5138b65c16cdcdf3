//! Configuration for the distributed lock manager.

use std::time::Duration;

use sodalite_types::ProcessId;

/// How often the background pinger writes a heartbeat.
pub const DIST_LOCK_PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long a holder may go without a ping change before its locks become
/// eligible for overtake.
pub const DIST_LOCK_EXPIRATION: Duration = Duration::from_secs(15 * 60);

/// Configuration for [`DistLockManager`](crate::DistLockManager).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistLockConfig {
    /// This process's identity in the catalog. Heartbeats and lock
    /// ownership are keyed by it.
    pub process_id: ProcessId,

    /// Heartbeat interval for the pinger thread.
    pub ping_interval: Duration,

    /// Expiration window used by the overtake heuristic.
    pub lock_expiration: Duration,
}

impl DistLockConfig {
    /// Creates a configuration with the default intervals.
    pub fn new(process_id: ProcessId) -> Self {
        Self {
            process_id,
            ping_interval: DIST_LOCK_PING_INTERVAL,
            lock_expiration: DIST_LOCK_EXPIRATION,
        }
    }

    /// Configuration for testing (fast pings).
    pub fn testing(process_id: ProcessId) -> Self {
        Self {
            process_id,
            ping_interval: Duration::from_millis(10),
            lock_expiration: DIST_LOCK_EXPIRATION,
        }
    }
}
