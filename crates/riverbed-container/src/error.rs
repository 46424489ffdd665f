//! Container operation log errors

use thiserror::Error;

/// Errors raised by the container operation log
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("log io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("log codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("log record at offset {offset} is corrupt: {reason}")]
    Corrupt { offset: u64, reason: String },

    #[error("log record {sequence} failed CRC check")]
    CrcMismatch { sequence: u64 },
}

pub type ContainerResult<T> = Result<T, ContainerError>;

impl From<ContainerError> for riverbed_common::Error {
    fn from(e: ContainerError) -> Self {
        match e {
            ContainerError::Io(e) => Self::StoreUnavailable(format!("container log: {e}")),
            ContainerError::Codec(e) => Self::Serialization(e.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}
