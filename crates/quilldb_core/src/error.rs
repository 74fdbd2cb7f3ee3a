//! Error types for QuillDB core.

use quilldb_codec::CodecError;
use quilldb_storage::StorageError;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Logical category of a [`CoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A collection, document or index is absent.
    NotFound,
    /// A collection, index or document id already exists.
    AlreadyExists,
    /// Malformed document, criterion or identifier.
    InvalidInput,
    /// A planned index was dropped before it could be read.
    IndexUnavailable,
    /// The key/value backend failed.
    Backend,
    /// The backend rejected a transaction.
    Conflict,
    /// A caller deadline expired.
    Canceled,
    /// Stored data does not match the expected format.
    InvalidFormat,
    /// The database was closed.
    Closed,
    /// A caller-supplied callback failed.
    Callback,
}

/// Errors that can occur in QuillDB core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Collection not found.
    #[error("collection not found: {name}")]
    CollectionNotFound {
        /// Name of the collection.
        name: String,
    },

    /// Document not found (or expired).
    #[error("document {id:?} not found in collection {collection}")]
    DocumentNotFound {
        /// The collection searched.
        collection: String,
        /// The document id that was not found.
        id: String,
    },

    /// Collection already exists.
    #[error("collection already exists: {name}")]
    CollectionExists {
        /// Name of the collection.
        name: String,
    },

    /// Index already exists.
    #[error("index on {collection}.{field} already exists")]
    IndexExists {
        /// The collection.
        collection: String,
        /// The indexed field.
        field: String,
    },

    /// A document with the same id already exists.
    #[error("duplicate document id {id:?} in collection {collection}")]
    DuplicateId {
        /// The collection.
        collection: String,
        /// The conflicting id.
        id: String,
    },

    /// Malformed input.
    #[error("invalid input: {message}")]
    InvalidInput {
        /// Description of the problem.
        message: String,
    },

    /// Normalization or encoding failed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// A planned index disappeared.
    #[error("index on {collection}.{field} is unavailable")]
    IndexUnavailable {
        /// The collection.
        collection: String,
        /// The indexed field.
        field: String,
    },

    /// Storage backend error.
    #[error("storage error: {0}")]
    Backend(#[source] StorageError),

    /// Transaction rejected by the backend.
    #[error("transaction conflict: {message}")]
    Conflict {
        /// Backend description of the conflict.
        message: String,
    },

    /// Deadline expired during iteration.
    #[error("operation canceled: deadline exceeded")]
    Canceled,

    /// Invalid database format or version.
    #[error("invalid database format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },

    /// Database is closed.
    #[error("database is closed")]
    DatabaseClosed,

    /// A caller-supplied callback returned an error.
    #[error("callback failed: {0}")]
    Callback(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl From<StorageError> for CoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Conflict(message) => Self::Conflict { message },
            StorageError::Closed => Self::DatabaseClosed,
            other => Self::Backend(other),
        }
    }
}

impl CoreError {
    /// Returns the logical category of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CollectionNotFound { .. } | Self::DocumentNotFound { .. } => {
                ErrorKind::NotFound
            }
            Self::CollectionExists { .. } | Self::IndexExists { .. } | Self::DuplicateId { .. } => {
                ErrorKind::AlreadyExists
            }
            Self::InvalidInput { .. } | Self::Codec(_) => ErrorKind::InvalidInput,
            Self::IndexUnavailable { .. } => ErrorKind::IndexUnavailable,
            Self::Backend(_) => ErrorKind::Backend,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::Canceled => ErrorKind::Canceled,
            Self::InvalidFormat { .. } => ErrorKind::InvalidFormat,
            Self::DatabaseClosed => ErrorKind::Closed,
            Self::Callback(_) => ErrorKind::Callback,
        }
    }

    /// Returns true if this error means something was not found.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Creates a collection not found error.
    pub fn collection_not_found(name: impl Into<String>) -> Self {
        Self::CollectionNotFound { name: name.into() }
    }

    /// Creates a document not found error.
    pub fn document_not_found(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self::DocumentNotFound {
            collection: collection.into(),
            id: id.into(),
        }
    }

    /// Creates an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Wraps an error raised by a caller-supplied callback.
    pub fn callback(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Callback(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_conflict_maps_to_conflict() {
        let err = CoreError::from(StorageError::conflict("writer busy"));
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn storage_errors_keep_their_cause() {
        let err = CoreError::from(StorageError::corrupted("bad crc"));
        assert_eq!(err.kind(), ErrorKind::Backend);
        let source = std::error::Error::source(&err).map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("storage corrupted: bad crc"));
    }

    #[test]
    fn kinds_group_variants() {
        assert!(CoreError::collection_not_found("c").is_not_found());
        assert!(CoreError::document_not_found("c", "a").is_not_found());
        assert_eq!(
            CoreError::from(CodecError::IntegerOverflow).kind(),
            ErrorKind::InvalidInput
        );
        assert_eq!(CoreError::callback("boom").kind(), ErrorKind::Callback);
    }
}
