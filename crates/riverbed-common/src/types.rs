//! Core type definitions for Riverbed
//!
//! Identifiers shared between the stream controller and the segment
//! containers: scoped stream names, segment ids and qualified segment names.

use derive_more::{From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Maximum length of a scope or stream name
pub const MAX_NAME_LENGTH: usize = 255;

/// Separator inserted between a segment number and its creation epoch
const EPOCH_DELIMITER: &str = ".#epoch.";

/// Separator inserted between a parent segment name and a transaction id
const TRANSACTION_DELIMITER: &str = "#transaction.";

/// Globally unique segment identifier.
///
/// The upper 32 bits hold the epoch in which the segment was created and the
/// lower 32 bits hold the stream-wide segment number. Segment numbers only
/// grow, so ids are strictly increasing in creation order and the creation
/// epoch can be recovered without a lookup.
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into,
)]
pub struct SegmentId(u64);

impl SegmentId {
    /// Compose an id from its creation epoch and segment number
    #[must_use]
    pub const fn new(epoch: u32, segment_number: u32) -> Self {
        Self(((epoch as u64) << 32) | segment_number as u64)
    }

    /// Wrap a raw id
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Epoch in which this segment was created
    #[must_use]
    pub const fn epoch(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Stream-wide segment number
    #[must_use]
    pub const fn segment_number(&self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }

    /// Raw 64-bit value
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SegmentId({self})")
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.segment_number(), EPOCH_DELIMITER, self.epoch())
    }
}

/// A stream identified by its scope and name
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScopedStream {
    scope: String,
    stream: String,
}

impl ScopedStream {
    /// Create a new scoped stream (validates both names)
    pub fn new(scope: impl Into<String>, stream: impl Into<String>) -> Result<Self, NameError> {
        let scope = scope.into();
        let stream = stream.into();
        validate_name(&scope)?;
        validate_name(&stream)?;
        Ok(Self { scope, stream })
    }

    /// Create without validation (internal use only)
    #[must_use]
    pub fn new_unchecked(scope: impl Into<String>, stream: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            stream: stream.into(),
        }
    }

    #[must_use]
    pub fn scope(&self) -> &str {
        &self.scope
    }

    #[must_use]
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Key used for this stream in the metadata store
    #[must_use]
    pub fn store_key(&self) -> String {
        format!("{}/{}", self.scope, self.stream)
    }

    /// Fully qualified name of one of this stream's segments
    #[must_use]
    pub fn segment_name(&self, segment: SegmentId) -> String {
        format!("{}/{}/{}", self.scope, self.stream, segment)
    }
}

impl fmt::Debug for ScopedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ScopedStream({:?})", self.store_key())
    }
}

impl fmt::Display for ScopedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scope, self.stream)
    }
}

/// Validate a scope or stream name
pub fn validate_name(name: &str) -> Result<(), NameError> {
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(NameError::TooLong);
    }
    // Leading underscore is reserved for internal streams
    for c in name.chars() {
        if !c.is_ascii_alphanumeric() && c != '-' && c != '.' && c != '_' {
            return Err(NameError::InvalidChar(c));
        }
    }
    Ok(())
}

/// Name of a transaction segment chained to `parent`
#[must_use]
pub fn transaction_segment_name(parent: &str, txn_id: Uuid) -> String {
    format!("{parent}{TRANSACTION_DELIMITER}{}", txn_id.simple())
}

/// Errors that can occur when validating a scope or stream name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    #[error("name cannot be empty")]
    Empty,
    #[error("name must be at most 255 characters")]
    TooLong,
    #[error("name contains invalid character: {0}")]
    InvalidChar(char),
}
