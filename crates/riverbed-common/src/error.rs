//! Error types for Riverbed
//!
//! Every variant belongs to one [`ErrorKind`]; callers branch on the kind to
//! decide whether to retry, refetch state, or give up.

use crate::types::{NameError, SegmentId};
use thiserror::Error;

/// Common result type for Riverbed operations
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed input or unknown entity; never retried automatically
    Validation,
    /// The caller's view of the stream is stale; refetch and retry
    Precondition,
    /// Another operation holds the stream; retry after backoff
    Conflict,
    /// A required collaborator is not configured
    Configuration,
    /// The durable store could not be reached; retried with backoff
    StoreUnavailable,
    /// The call is not allowed in the current lifecycle state
    IllegalState,
    /// Bug or codec failure
    Internal,
}

/// Common error type for Riverbed
#[derive(Debug, Error)]
pub enum Error {
    // Validation errors
    #[error("scope not found: {0}")]
    ScopeNotFound(String),

    #[error("scope already exists: {0}")]
    ScopeAlreadyExists(String),

    #[error("stream not found: {scope}/{stream}")]
    StreamNotFound { scope: String, stream: String },

    #[error("stream already exists: {scope}/{stream}")]
    StreamAlreadyExists { scope: String, stream: String },

    #[error("epoch {epoch} not found for stream {scope}/{stream}")]
    EpochNotFound {
        scope: String,
        stream: String,
        epoch: u32,
    },

    #[error("segment not found: {0}")]
    SegmentNotFound(SegmentId),

    #[error("segment already mapped: {0}")]
    SegmentAlreadyMapped(String),

    #[error("invalid key ranges: {0}")]
    InvalidKeyRanges(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid name: {0}")]
    InvalidName(#[from] NameError),

    // Precondition errors
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    // Conflict errors
    #[error("scale already in progress on stream {scope}/{stream}")]
    ScaleInProgress { scope: String, stream: String },

    #[error("concurrent write conflict on key {0}")]
    WriteConflict(String),

    // Configuration errors
    #[error("scale requests not enabled: {0}")]
    ScaleRequestNotEnabled(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    // Store errors
    #[error("metadata store unavailable: {0}")]
    StoreUnavailable(String),

    // Lifecycle errors
    #[error("stream {scope}/{stream} is sealed")]
    StreamSealed { scope: String, stream: String },

    #[error("illegal state: {0}")]
    IllegalState(String),

    // Internal errors
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
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

    /// Create an illegal state error
    pub fn illegal_state(msg: impl Into<String>) -> Self {
        Self::IllegalState(msg.into())
    }

    /// Create a precondition failure
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::PreconditionFailed(msg.into())
    }

    /// Create a store unavailable error
    pub fn store_unavailable(msg: impl Into<String>) -> Self {
        Self::StoreUnavailable(msg.into())
    }

    /// Create a stream not found error
    pub fn stream_not_found(scope: impl Into<String>, stream: impl Into<String>) -> Self {
        Self::StreamNotFound {
            scope: scope.into(),
            stream: stream.into(),
        }
    }

    /// Classify this error
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::ScopeNotFound(_)
            | Self::ScopeAlreadyExists(_)
            | Self::StreamNotFound { .. }
            | Self::StreamAlreadyExists { .. }
            | Self::EpochNotFound { .. }
            | Self::SegmentNotFound(_)
            | Self::SegmentAlreadyMapped(_)
            | Self::InvalidKeyRanges(_)
            | Self::InvalidArgument(_)
            | Self::InvalidName(_) => ErrorKind::Validation,
            Self::PreconditionFailed(_) => ErrorKind::Precondition,
            Self::ScaleInProgress { .. } | Self::WriteConflict(_) => ErrorKind::Conflict,
            Self::ScaleRequestNotEnabled(_) | Self::Configuration(_) => ErrorKind::Configuration,
            Self::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            Self::StreamSealed { .. } | Self::IllegalState(_) => ErrorKind::IllegalState,
            Self::Serialization(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Check if this is a retryable error
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::ScopeNotFound(_)
                | Self::StreamNotFound { .. }
                | Self::EpochNotFound { .. }
                | Self::SegmentNotFound(_)
        )
    }
}
