//! Error types for the logical session cache.

use sodalite_catalog::CatalogError;
use thiserror::Error;

/// Session cache errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The session is not present in the local cache. Recoverable; callers
    /// fall back to the catalog or treat the session as absent.
    #[error("no matching session record found in the cache")]
    NoSuchSession,

    /// Inserting displaced least-recently-used entries. Informational; the
    /// triggering operation still took effect.
    #[error("session cache is full: {evicted} record(s) evicted")]
    CacheEvicted {
        /// How many records were displaced.
        evicted: usize,
    },

    /// A catalog operation failed. Only surfaced from the cluster-member
    /// refresh path, which writes through synchronously.
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// Result type for session cache operations.
pub type Result<T> = std::result::Result<T, Error>;
