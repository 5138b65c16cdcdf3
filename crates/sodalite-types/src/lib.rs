//! Shared identifier and record types for the Sodalite coordination layer.
//!
//! These are the documents and identifiers exchanged between the in-memory
//! coordination subsystems and the shared durable catalog: logical session
//! records, named-lock ownership documents, and process heartbeat documents.
//!
//! All durable documents derive `Serialize`/`Deserialize` so catalog
//! implementations can persist them without re-describing the schema.

use std::fmt::{self, Display};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Timestamp - Copy (8-byte value with monotonic helper)
// ============================================================================

/// Wall-clock timestamp, stored as nanoseconds since the Unix epoch.
///
/// Coordination decisions never compare timestamps taken from different
/// processes; elapsed-time reasoning always compares one clock against
/// itself across two observations. The type therefore only needs saturating
/// arithmetic, not cross-clock normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The Unix epoch (1970-01-01 00:00:00 UTC).
    pub const EPOCH: Timestamp = Timestamp(0);

    /// Creates a timestamp from nanoseconds since the Unix epoch.
    pub fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Creates a timestamp from milliseconds since the Unix epoch.
    pub fn from_millis(millis: u64) -> Self {
        Self(millis.saturating_mul(1_000_000))
    }

    /// Returns the timestamp as nanoseconds since the Unix epoch.
    pub fn as_nanos(&self) -> u64 {
        self.0
    }

    /// Returns the timestamp as seconds since the Unix epoch (truncating).
    pub fn as_secs(&self) -> u64 {
        self.0 / 1_000_000_000
    }

    /// Creates a timestamp for the current wall-clock time.
    ///
    /// # Panics
    ///
    /// Panics if the system clock is before the Unix epoch (should never
    /// happen).
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before Unix epoch");
        Self(duration.as_nanos() as u64)
    }

    /// Returns `self + duration`, saturating at the numeric range.
    pub fn saturating_add(self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration.as_nanos() as u64))
    }

    /// Returns `self - duration`, saturating at the epoch.
    pub fn saturating_sub(self, duration: Duration) -> Self {
        Self(self.0.saturating_sub(duration.as_nanos() as u64))
    }

    /// Returns the duration elapsed from `earlier` to `self`.
    ///
    /// Saturates to zero if `earlier` is in the future; callers that care
    /// about regressions compare the timestamps directly first.
    pub fn saturating_duration_since(self, earlier: Timestamp) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Display as seconds.nanoseconds for readability
        let secs = self.0 / 1_000_000_000;
        let nanos = self.0 % 1_000_000_000;
        write!(f, "{secs}.{nanos:09}")
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Self::EPOCH
    }
}

impl From<u64> for Timestamp {
    fn from(nanos: u64) -> Self {
        Self(nanos)
    }
}

impl From<Timestamp> for u64 {
    fn from(ts: Timestamp) -> Self {
        ts.0
    }
}

// ============================================================================
// OwnerDigest - Copy (32-byte authenticated-user digest)
// ============================================================================

/// Length of an owner digest in bytes.
pub const OWNER_DIGEST_LENGTH: usize = 32;

/// Digest identifying the authenticated user that owns a session.
///
/// The digest is computed by the authentication layer; this crate only
/// carries it for equality comparison and owner-filtered listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerDigest([u8; OWNER_DIGEST_LENGTH]);

impl OwnerDigest {
    /// Creates a digest from raw bytes.
    pub fn from_bytes(bytes: [u8; OWNER_DIGEST_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Returns the digest bytes.
    pub fn as_bytes(&self) -> &[u8; OWNER_DIGEST_LENGTH] {
        &self.0
    }
}

impl Display for OwnerDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl From<[u8; OWNER_DIGEST_LENGTH]> for OwnerDigest {
    fn from(bytes: [u8; OWNER_DIGEST_LENGTH]) -> Self {
        Self(bytes)
    }
}

// ============================================================================
// SessionId
// ============================================================================

/// Unique identifier for a logical client session.
///
/// A session is tracked independently of any single physical connection.
/// The identifier is immutable once created; the optional owner digest ties
/// the session to the authenticated user that created it.
///
/// The same identifier type names the holder of a distributed lock
/// acquisition attempt, so a lock handle and the session that took it are
/// interchangeable values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId {
    /// Random unique identifier for this session.
    id: Uuid,

    /// Digest of the owning user, if the session was created while
    /// authenticated.
    owner: Option<OwnerDigest>,
}

impl SessionId {
    /// Creates a new random session identifier with no owner.
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            owner: None,
        }
    }

    /// Creates a new random session identifier owned by the given user.
    pub fn with_owner(owner: OwnerDigest) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner: Some(owner),
        }
    }

    /// Creates a session identifier from an existing UUID.
    pub fn from_uuid(id: Uuid) -> Self {
        Self { id, owner: None }
    }

    /// Returns the underlying UUID.
    pub fn uuid(&self) -> Uuid {
        self.id
    }

    /// Returns the owner digest, if any.
    pub fn owner(&self) -> Option<&OwnerDigest> {
        self.owner.as_ref()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.id)
    }
}

// ============================================================================
// SessionRecord
// ============================================================================

/// Durable record of a logical session.
///
/// Created on first use of a session and mutated only to bump `last_use`.
/// The record is logically deleted when it is removed from the durable
/// store or the session is explicitly ended.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionRecord {
    /// The session this record describes.
    pub id: SessionId,

    /// Timestamp of the most recent use of the session.
    pub last_use: Timestamp,
}

impl SessionRecord {
    /// Creates a record for a session first used at `last_use`.
    pub fn new(id: SessionId, last_use: Timestamp) -> Self {
        Self { id, last_use }
    }

    /// Bumps the last-use timestamp.
    pub fn touch(&mut self, now: Timestamp) {
        self.last_use = now;
    }
}

// ============================================================================
// ProcessId / LockName / ElectionId
// ============================================================================

/// Identity of a cooperating server process.
///
/// Heartbeat documents and lock ownership are keyed by this value, so it
/// must be stable for the lifetime of the process and unique across the
/// cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessId(String);

impl ProcessId {
    /// Creates a process identity from its string form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProcessId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Name of a distributed lock in the shared catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockName(String);

impl LockName {
    /// Creates a lock name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for LockName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LockName {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

/// Identifier of the catalog's current primary term.
///
/// Changes whenever the catalog elects a new primary. A change invalidates
/// any locally recorded clock-comparison baseline, because the catalog's
/// authoritative clock is now a different machine's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElectionId(u64);

impl ElectionId {
    /// Creates an election identifier.
    pub fn new(term: u64) -> Self {
        Self(term)
    }

    /// Returns the term as a u64.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for ElectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "election#{}", self.0)
    }
}

// ============================================================================
// Lock catalog documents
// ============================================================================

/// Durable document describing current ownership of a named lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockDoc {
    /// Name of the lock.
    pub name: LockName,

    /// Session handle of the current holder.
    pub lock_session_id: SessionId,

    /// Process that took the lock.
    pub process: ProcessId,

    /// Human-readable holder description (process plus thread).
    pub who: String,

    /// When the lock was taken, per the taker's clock. Informational only;
    /// expiration decisions never read this field.
    pub when: Timestamp,

    /// Why the lock was taken.
    pub why: String,
}

/// Durable heartbeat document for a lock-holding process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingDoc {
    /// The process this heartbeat belongs to.
    pub process: ProcessId,

    /// Timestamp of the most recent heartbeat write.
    pub ping: Timestamp,
}

/// Authoritative clock reading from the catalog's current primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogServerInfo {
    /// The primary's local time at the moment the request was served.
    pub server_time: Timestamp,

    /// The primary's election identifier.
    pub election_id: ElectionId,
}

// ============================================================================
// Tests
// ============================================================================
