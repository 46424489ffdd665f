//! Riverbed Container - per-container segment metadata
//!
//! Each segment container keeps its own directory of segment names, a
//! container-wide sequence number allocator and the truncation markers that
//! bound recovery replay. The directory is rebuilt from its operation log on
//! restart.

pub mod directory;
pub mod error;
pub mod log;
pub mod metadata;

pub use directory::ContainerDirectory;
pub use error::{ContainerError, ContainerResult};
pub use log::{LogOperation, OperationLog};
pub use metadata::{ContainerMetadata, MetadataSnapshot, SegmentMetadata};
