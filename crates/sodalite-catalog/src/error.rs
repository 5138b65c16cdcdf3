//! Error types for catalog operations.

use sodalite_types::{LockName, SessionId};
use thiserror::Error;

/// Errors returned by catalog and liaison operations.
///
/// The distinction between variants drives control flow in the callers:
/// [`CatalogError::LockStateChangeFailed`] is the expected "someone else
/// holds it" outcome of a conditional lock write, the network class is
/// retried a bounded number of times, and everything else is surfaced as
/// the operation's failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    /// A conditional lock write found the lock in a different state than
    /// the condition required. Expected and recoverable; drives the
    /// overtake-or-retry branch, never surfaced to lock manager callers.
    #[error("lock state change failed: document was not updated")]
    LockStateChangeFailed,

    /// No lock document exists with the given name.
    #[error("no lock found with name {0}")]
    LockNotFound(LockName),

    /// No lock document exists for the given session handle.
    #[error("no lock found for session {0}")]
    LockSessionNotFound(SessionId),

    /// A lookup matched no document (e.g. a process has never pinged).
    #[error("no matching document: {0}")]
    NoMatchingDocument(String),

    /// The catalog node that served the request is no longer primary.
    /// A non-primary cannot own authoritative lock or session state.
    #[error("catalog node is not primary")]
    NotPrimary,

    /// A network-class failure: the write may or may not have applied.
    #[error("network error: {0}")]
    Network(String),

    /// A ping document failed validation.
    #[error("invalid ping document: {0}")]
    InvalidPing(String),
}

impl CatalogError {
    /// Returns true for transient network-class failures that are safe to
    /// retry with idempotent semantics.
    pub fn is_retriable(&self) -> bool {
        matches!(self, CatalogError::Network(_))
    }
}

/// Result type for catalog operations.
pub type Result<T> = std::result::Result<T, CatalogError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_network_errors_are_retriable() {
        assert!(CatalogError::Network("connection reset".into()).is_retriable());
        assert!(!CatalogError::LockStateChangeFailed.is_retriable());
        assert!(!CatalogError::NotPrimary.is_retriable());
        assert!(!CatalogError::LockNotFound(LockName::new("x")).is_retriable());
    }
}
