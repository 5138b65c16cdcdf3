//! Logical session cache for Sodalite.
//!
//! Tracks which client sessions are alive on this node, periodically
//! reconciles that view against the shared sessions catalog, and expires or
//! kills sessions that have gone stale or were ended.
//!
//! # Overview
//!
//! - [`SessionRecordCache`]: a bounded, least-recently-used map from session
//!   id to record. Insertion beyond capacity evicts the coldest entry and
//!   hands it back to the caller.
//! - [`LogicalSessionCache`]: the reconciling cache. Command handlers call
//!   `start_session`/`promote`/`vivify` on their own threads; a dedicated
//!   refresh thread runs the reconciliation cycle on a fixed interval.
//!
//! The cache is the node-local view only. The sessions catalog is the
//! source of truth across the cluster, and the reconciliation cycle is
//! written so every catalog interaction is independently retryable: a
//! failed removal re-queues the sessions, a failed push leaves the refresh
//! watermark where it was.

pub mod cache;
pub mod config;
pub mod error;
pub mod record_cache;

pub use cache::LogicalSessionCache;
pub use config::SessionsConfig;
pub use error::{Error, Result};
pub use record_cache::{SessionRecordCache, DEFAULT_CACHE_CAPACITY};
