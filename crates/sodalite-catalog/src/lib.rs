//! Collaborator abstractions for the Sodalite coordination layer.
//!
//! The session cache and the distributed lock manager both talk to a shared
//! durable catalog (a document-oriented network store) and to the embedding
//! server process. This crate defines those seams as traits so the
//! subsystems can run against:
//!
//! - **Production**: a replicated catalog client and the real server runtime
//! - **Testing**: the in-memory implementations in [`memory`], driven by a
//!   [`SimClock`] for deterministic time
//!
//! The error taxonomy matters as much as the traits: acquisition and
//! reconciliation logic branches on *which* failure a catalog write
//! produced, so "lock held by someone else" and "network flaked" are
//! distinct values, never a collapsed boolean.

pub mod clock;
pub mod error;
pub mod memory;
pub mod traits;

pub use clock::{Clock, SimClock, SystemClock};
pub use error::{CatalogError, Result};
pub use memory::{MemoryLockCatalog, MemorySessionsCatalog, RecordingLiaison};
pub use traits::{
    LockCatalog, ServiceLiaison, SessionKillMatcher, SessionsCatalog, WriteConcern,
};
