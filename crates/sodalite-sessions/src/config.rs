//! Configuration for the logical session cache.

use std::time::Duration;

use crate::record_cache::DEFAULT_CACHE_CAPACITY;

/// Configuration for [`LogicalSessionCache`](crate::LogicalSessionCache).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionsConfig {
    /// Maximum number of records held in the local cache.
    pub capacity: usize,

    /// How often the background reconciliation cycle runs.
    pub refresh_interval: Duration,

    /// How long a session may go unused before it is considered stale.
    pub session_timeout: Duration,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CACHE_CAPACITY,
            refresh_interval: Duration::from_secs(5 * 60),
            session_timeout: Duration::from_secs(30 * 60),
        }
    }
}

impl SessionsConfig {
    /// Configuration for testing (small cache, fast refresh).
    pub fn testing() -> Self {
        Self {
            capacity: 128,
            refresh_interval: Duration::from_millis(20),
            session_timeout: Duration::from_secs(30 * 60),
        }
    }
}
