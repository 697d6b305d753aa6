//! Error types for cellmaster
//!
//! Recoverable failures (user errors, availability, replication ambiguity)
//! are values of [`Error`]. Invariant violations are not represented here:
//! they indicate replica divergence and abort the process via `panic!`.

use crate::types::{Epoch, ObjectId, ObjectType};
use crate::version::MetaVersion;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Common result type for cellmaster operations
pub type Result<T> = std::result::Result<T, Error>;

/// Machine-readable error class returned to RPC callers
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    ResolveError,
    AuthorizationError,
    InvalidArgument,
    InvalidState,
    Unavailable,
    MaybeCommitted,
    InvalidEpoch,
    InvalidVersion,
    StorageError,
    Internal,
}

/// Common error type for cellmaster
#[derive(Debug, Error)]
pub enum Error {
    // Resolution errors
    #[error("no such object {0}")]
    NoSuchObject(ObjectId),

    #[error("attribute {key:?} is not found at {object_id}")]
    NoSuchAttribute { object_id: ObjectId, key: String },

    // Authorization errors
    #[error("access denied: {permission} permission for object {object_id} is not allowed for user {user_id}")]
    AuthorizationError {
        user_id: ObjectId,
        object_id: ObjectId,
        permission: String,
    },

    // Request validation errors
    #[error("cannot create {object_type}: {reason}")]
    TransactionModeViolation {
        object_type: ObjectType,
        reason: String,
    },

    #[error("cannot create {object_type}: {reason}")]
    AccountModeViolation {
        object_type: ObjectType,
        reason: String,
    },

    #[error("verb {verb} is not supported by {object_type} objects")]
    VerbNotSupported {
        verb: String,
        object_type: String,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("object {object_id} is in invalid state: {reason}")]
    InvalidObjectState { object_id: ObjectId, reason: String },

    // Availability errors
    #[error("unavailable: {0}")]
    Unavailable(String),

    // Replication errors
    #[error("mutation is maybe committed; re-read the state before retrying")]
    MaybeCommitted,

    #[error("invalid epoch: expected {expected}, got {actual}")]
    InvalidEpoch { expected: Epoch, actual: Epoch },

    #[error("invalid version: expected {expected}, got {actual}")]
    InvalidVersion {
        expected: MetaVersion,
        actual: MetaVersion,
    },

    // Storage errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("changelog error: {0}")]
    ChangeLog(String),

    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    // Internal errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),

    /// An error computed on another replica or inside a mutation and
    /// transported in wire form.
    #[error("{0}")]
    Remote(WireError),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an unavailable error
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    /// Machine-readable class of this error
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NoSuchObject(_) | Self::NoSuchAttribute { .. } => ErrorCode::ResolveError,
            Self::AuthorizationError { .. } => ErrorCode::AuthorizationError,
            Self::TransactionModeViolation { .. }
            | Self::AccountModeViolation { .. }
            | Self::VerbNotSupported { .. }
            | Self::InvalidArgument(_)
            | Self::Configuration(_) => ErrorCode::InvalidArgument,
            Self::InvalidObjectState { .. } => ErrorCode::InvalidState,
            Self::Unavailable(_) => ErrorCode::Unavailable,
            Self::MaybeCommitted => ErrorCode::MaybeCommitted,
            Self::InvalidEpoch { .. } => ErrorCode::InvalidEpoch,
            Self::InvalidVersion { .. } => ErrorCode::InvalidVersion,
            Self::Io(_) | Self::ChangeLog(_) | Self::Snapshot(_) => ErrorCode::StorageError,
            Self::Serialization(_) | Self::Internal(_) => ErrorCode::Internal,
            Self::Remote(wire) => wire.code,
        }
    }

    /// Check if the caller may simply retry (with backoff)
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.code() == ErrorCode::Unavailable
    }

    /// Check if the outcome of a write is unknown
    #[must_use]
    pub fn is_ambiguous(&self) -> bool {
        self.code() == ErrorCode::MaybeCommitted
    }

    /// Check if this is a resolution error
    #[must_use]
    pub fn is_resolve_error(&self) -> bool {
        self.code() == ErrorCode::ResolveError
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Serializable form of [`Error`], carried inside responses and RPC replies.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{message}")]
pub struct WireError {
    pub code: ErrorCode,
    pub message: String,
}

impl From<&Error> for WireError {
    fn from(e: &Error) -> Self {
        match e {
            Error::Remote(wire) => wire.clone(),
            other => Self {
                code: other.code(),
                message: other.to_string(),
            },
        }
    }
}

impl From<Error> for WireError {
    fn from(e: Error) -> Self {
        Self::from(&e)
    }
}

impl From<WireError> for Error {
    fn from(e: WireError) -> Self {
        Self::Remote(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(Error::unavailable("not leading").is_retryable());
        assert!(!Error::MaybeCommitted.is_retryable());
        assert!(!Error::NoSuchObject(ObjectId::NULL).is_retryable());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            Error::NoSuchObject(ObjectId::NULL).code(),
            ErrorCode::ResolveError
        );
        assert_eq!(
            Error::AccountModeViolation {
                object_type: ObjectType::Tag,
                reason: "account must not be given".into(),
            }
            .code(),
            ErrorCode::InvalidArgument
        );
        assert!(Error::MaybeCommitted.is_ambiguous());
    }

    #[test]
    fn test_wire_error_preserves_code_and_message() {
        let err = Error::NoSuchAttribute {
            object_id: ObjectId::NULL,
            key: "owner".into(),
        };
        let wire = WireError::from(&err);
        assert_eq!(wire.code, ErrorCode::ResolveError);
        assert_eq!(wire.message, err.to_string());

        let back = Error::from(wire.clone());
        assert!(back.is_resolve_error());
        assert_eq!(WireError::from(&back), wire);
    }

    #[test]
    fn test_wire_error_serde() {
        let wire = WireError {
            code: ErrorCode::Unavailable,
            message: "no active quorum".into(),
        };
        let json = serde_json::to_string(&wire).unwrap();
        let parsed: WireError = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, wire);
    }
}
