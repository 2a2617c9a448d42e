//! Core type definitions shared across the context.

use crate::error::{CoreError, CoreResult};
use std::fmt;
use uuid::Uuid;

/// Unique identifier of a session.
///
/// Proxies and collection wrappers remember the id of the session they are
/// bound to, which is how "bound to this session" is decided without
/// comparing trait objects.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Creates a new random session id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a session id from a UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a managed entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Managed and eligible for dirty checking.
    Managed,
    /// Managed but never flushed.
    ReadOnly,
    /// Scheduled for deletion.
    Deleted,
    /// Deleted and flushed.
    Gone,
    /// Being inserted.
    Saving,
    /// Being loaded.
    Loading,
}

impl Status {
    /// Whether a transition into this status marks the context as holding
    /// modifiable entities.
    #[must_use]
    pub const fn is_modifiable(self) -> bool {
        matches!(self, Status::Managed | Status::Deleted | Status::Saving)
    }

    /// Whether the entity is deleted or gone.
    #[must_use]
    pub const fn is_deleted_or_gone(self) -> bool {
        matches!(self, Status::Deleted | Status::Gone)
    }

    /// Stable name used in passivated streams.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Status::Managed => "MANAGED",
            Status::ReadOnly => "READ_ONLY",
            Status::Deleted => "DELETED",
            Status::Gone => "GONE",
            Status::Saving => "SAVING",
            Status::Loading => "LOADING",
        }
    }

    /// Parses a stable name.
    ///
    /// # Errors
    ///
    /// Returns an invalid object error for an unknown name.
    pub fn parse(name: &str) -> CoreResult<Self> {
        Ok(match name {
            "MANAGED" => Status::Managed,
            "READ_ONLY" => Status::ReadOnly,
            "DELETED" => Status::Deleted,
            "GONE" => Status::Gone,
            "SAVING" => Status::Saving,
            "LOADING" => Status::Loading,
            other => return Err(CoreError::invalid_object(format!("unknown status {other}"))),
        })
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lock held on an entity row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum LockMode {
    /// No lock; state may come from the cache.
    #[default]
    None,
    /// Read from the database in this transaction.
    Read,
    /// Optimistic version check at commit.
    Optimistic,
    /// Optimistic version increment at commit.
    OptimisticForceIncrement,
    /// Shared pessimistic lock.
    PessimisticRead,
    /// Exclusive pessimistic lock.
    PessimisticWrite,
    /// Exclusive pessimistic lock with version increment.
    PessimisticForceIncrement,
    /// Row written in this transaction.
    Write,
}

impl LockMode {
    /// Whether this mode is stronger than `other`.
    #[must_use]
    pub fn greater_than(self, other: LockMode) -> bool {
        self > other
    }

    /// Stable name used in passivated streams.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            LockMode::None => "NONE",
            LockMode::Read => "READ",
            LockMode::Optimistic => "OPTIMISTIC",
            LockMode::OptimisticForceIncrement => "OPTIMISTIC_FORCE_INCREMENT",
            LockMode::PessimisticRead => "PESSIMISTIC_READ",
            LockMode::PessimisticWrite => "PESSIMISTIC_WRITE",
            LockMode::PessimisticForceIncrement => "PESSIMISTIC_FORCE_INCREMENT",
            LockMode::Write => "WRITE",
        }
    }

    /// Parses a stable name.
    ///
    /// # Errors
    ///
    /// Returns an invalid object error for an unknown name.
    pub fn parse(name: &str) -> CoreResult<Self> {
        Ok(match name {
            "NONE" => LockMode::None,
            "READ" => LockMode::Read,
            "OPTIMISTIC" => LockMode::Optimistic,
            "OPTIMISTIC_FORCE_INCREMENT" => LockMode::OptimisticForceIncrement,
            "PESSIMISTIC_READ" => LockMode::PessimisticRead,
            "PESSIMISTIC_WRITE" => LockMode::PessimisticWrite,
            "PESSIMISTIC_FORCE_INCREMENT" => LockMode::PessimisticForceIncrement,
            "WRITE" => LockMode::Write,
            other => {
                return Err(CoreError::invalid_object(format!(
                    "unknown lock mode {other}"
                )))
            }
        })
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which flavour of entry a persister's entities get.
///
/// Chosen once per persister; immutable entries refuse modifiable status
/// and most lock modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EntryKind {
    /// Regular, dirty-checked entity.
    #[default]
    Mutable,
    /// Entity whose state never changes after load.
    Immutable,
}
