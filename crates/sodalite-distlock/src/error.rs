//! Error types for the distributed lock manager.

use sodalite_catalog::CatalogError;
use sodalite_types::LockName;
use thiserror::Error;

/// Distributed lock manager errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The acquisition wait budget ran out while the lock was held.
    /// Callers may retry with a new budget.
    #[error("timed out waiting for lock {name}")]
    LockBusy {
        /// The contended lock.
        name: LockName,
    },

    /// A catalog operation failed in a way the acquisition loop does not
    /// absorb. Any write with an ambiguous outcome has already been queued
    /// for a deferred unlock by the time this is returned.
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// Result type for lock manager operations.
pub type Result<T> = std::result::Result<T, Error>;
