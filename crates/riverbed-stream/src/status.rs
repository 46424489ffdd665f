//! Externally visible outcomes of controller operations

use crate::segment::Segment;
use serde::{Deserialize, Serialize};

/// Outcome of a scale request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScaleStatus {
    /// Proposed and queued; completes asynchronously
    Started,
    /// Completed synchronously
    Success,
    /// Stream sealed, a conflicting scale holds the stream, or the request was invalid
    Failure,
    /// The caller's view of the epoch is stale
    PreconditionFailed,
    /// An open transaction blocks the operation
    TxnConflict,
}

impl ScaleStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::PreconditionFailed => "precondition_failed",
            Self::TxnConflict => "txn_conflict",
        }
    }
}

/// Answer to a scale request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScaleResponse {
    pub status: ScaleStatus,
    /// Segments the scale creates (empty unless started or successful)
    pub segments_created: Vec<Segment>,
    /// Active epoch when the scale was proposed
    pub epoch: u32,
}

impl ScaleResponse {
    #[must_use]
    pub const fn rejected(status: ScaleStatus) -> Self {
        Self {
            status,
            segments_created: Vec::new(),
            epoch: 0,
        }
    }
}

/// Progress of the scale that started at a given epoch
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckScaleStatus {
    /// The epoch has been superseded
    Success,
    /// The epoch is still the active one
    InProgress,
    /// Unknown scope, stream or epoch
    InvalidInput,
}

/// Outcome of a stream lifecycle update such as sealing
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateStreamStatus {
    Success,
    Failure,
    ScopeNotFound,
    StreamNotFound,
    TxnConflict,
}
