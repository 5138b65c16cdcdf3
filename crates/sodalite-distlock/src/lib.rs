//! Catalog-backed distributed lock manager for Sodalite.
//!
//! Cooperating server processes acquire mutually exclusive named locks by
//! writing conditional lock documents into the shared catalog. Liveness is
//! established through per-process heartbeat documents: a holder that stops
//! pinging for longer than the expiration window can be overtaken by
//! another process.
//!
//! # Clock skew
//!
//! Expiration never compares clocks between processes. The manager records
//! the catalog primary's own local time when it first observes a lock's
//! ping state, and judges elapsed time by asking the same primary again
//! later. An election change discards the baseline, because the
//! "same clock" assumption no longer holds.
//!
//! # Cleanup
//!
//! Unlock is advisory. A failed or ambiguous unlock is queued and retried
//! by the background pinger thread; a lock leaked past that is eventually
//! reclaimed through expiration.

pub mod config;
pub mod error;
pub mod manager;

pub use config::{DistLockConfig, DIST_LOCK_EXPIRATION, DIST_LOCK_PING_INTERVAL};
pub use error::{Error, Result};
pub use manager::DistLockManager;
