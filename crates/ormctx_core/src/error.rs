//! Error types for the persistence context.

use ormctx_codec::{CodecError, Value};
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised by the persistence context and its collaborators.
///
/// None of these are retried internally; they propagate to the owning
/// session or transaction boundary.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Two different instances claim the same entity key.
    #[error("a different object with the same identifier value was already associated with the session: [{entity_name}#{identifier}]")]
    NonUniqueObject {
        /// Entity name of the conflicting key.
        entity_name: String,
        /// Identifier of the conflicting key.
        identifier: Value,
    },

    /// An internal invariant was violated by a caller.
    #[error("assertion failure: {message}")]
    AssertionFailure {
        /// What went wrong.
        message: String,
    },

    /// The instance is not associated with this persistence context.
    #[error("transient object: {message}")]
    TransientObject {
        /// Description of the offending instance.
        message: String,
    },

    /// A proxy or collection could not be initialized.
    #[error("lazy initialization failed: {message}")]
    LazyInitialization {
        /// Description of the failure.
        message: String,
    },

    /// A persistent-state requirement was not met (e.g. uninitialized proxy).
    #[error("persistent object error: {message}")]
    PersistentObject {
        /// Description of the failure.
        message: String,
    },

    /// No row exists for the requested identifier.
    #[error("no row with the given identifier exists: [{entity_name}#{identifier}]")]
    ObjectNotFound {
        /// Entity name searched.
        entity_name: String,
        /// Identifier searched.
        identifier: Value,
    },

    /// The metamodel has no persister for an entity name.
    #[error("unknown entity: {entity_name}")]
    UnknownEntity {
        /// The unknown entity name.
        entity_name: String,
    },

    /// The metamodel has no persister for a collection role.
    #[error("unknown collection role: {role}")]
    UnknownCollectionRole {
        /// The unknown role.
        role: String,
    },

    /// An operation was attempted in an invalid state.
    #[error("illegal state: {message}")]
    IllegalState {
        /// Description of the state problem.
        message: String,
    },

    /// A passivated context could not be restored.
    #[error("invalid object stream: {message}")]
    InvalidObject {
        /// Description of the failure.
        message: String,
    },

    /// The entry does not support the requested lock mode.
    #[error("unsupported lock attempt: {message}")]
    UnsupportedLock {
        /// Description of the attempt.
        message: String,
    },

    /// A persister reported a failure.
    #[error("persister error: {message}")]
    Persister {
        /// Description of the failure.
        message: String,
    },

    /// CBOR codec error.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

impl CoreError {
    /// Creates a non-unique object error.
    pub fn non_unique_object(entity_name: impl Into<String>, identifier: Value) -> Self {
        Self::NonUniqueObject {
            entity_name: entity_name.into(),
            identifier,
        }
    }

    /// Creates an assertion failure.
    pub fn assertion_failure(message: impl Into<String>) -> Self {
        Self::AssertionFailure {
            message: message.into(),
        }
    }

    /// Creates a transient object error.
    pub fn transient_object(message: impl Into<String>) -> Self {
        Self::TransientObject {
            message: message.into(),
        }
    }

    /// Creates a lazy initialization error.
    pub fn lazy_initialization(message: impl Into<String>) -> Self {
        Self::LazyInitialization {
            message: message.into(),
        }
    }

    /// Creates a persistent object error.
    pub fn persistent_object(message: impl Into<String>) -> Self {
        Self::PersistentObject {
            message: message.into(),
        }
    }

    /// Creates an object not found error.
    pub fn object_not_found(entity_name: impl Into<String>, identifier: Value) -> Self {
        Self::ObjectNotFound {
            entity_name: entity_name.into(),
            identifier,
        }
    }

    /// Creates an unknown entity error.
    pub fn unknown_entity(entity_name: impl Into<String>) -> Self {
        Self::UnknownEntity {
            entity_name: entity_name.into(),
        }
    }

    /// Creates an unknown collection role error.
    pub fn unknown_collection_role(role: impl Into<String>) -> Self {
        Self::UnknownCollectionRole { role: role.into() }
    }

    /// Creates an illegal state error.
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState {
            message: message.into(),
        }
    }

    /// Creates an invalid object error.
    pub fn invalid_object(message: impl Into<String>) -> Self {
        Self::InvalidObject {
            message: message.into(),
        }
    }

    /// Creates an unsupported lock error.
    pub fn unsupported_lock(message: impl Into<String>) -> Self {
        Self::UnsupportedLock {
            message: message.into(),
        }
    }

    /// Creates a persister error.
    pub fn persister(message: impl Into<String>) -> Self {
        Self::Persister {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_key() {
        let err = CoreError::non_unique_object("Order", Value::Integer(7));
        assert!(err.to_string().contains("[Order#7]"));

        let err = CoreError::object_not_found("Order", Value::text("a-1"));
        assert!(err.to_string().contains("[Order#a-1]"));
    }

    #[test]
    fn codec_errors_convert() {
        let err: CoreError = CodecError::UnexpectedEof.into();
        assert!(matches!(err, CoreError::Codec(CodecError::UnexpectedEof)));
    }
}
