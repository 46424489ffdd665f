//! Riverbed Stream - Stream segment metadata and scaling
//!
//! This crate models streams as an append-only history of epochs over
//! key-range partitioned segments, and drives repartitioning (scale) and
//! sealing as crash-safe, idempotent workflows over the metadata store.

pub mod collaborators;
pub mod coordinator;
pub mod epoch;
pub mod events;
pub mod metrics;
pub mod policy;
pub mod record;
pub mod segment;
pub mod state;
pub mod status;
pub mod store;
pub mod tasks;

// Re-exports
pub use collaborators::{
    ContainerProvisioner, NoTransactions, SegmentProvisioner, TransactionStatus,
    TransactionTracker,
};
pub use coordinator::ScaleCoordinator;
pub use epoch::EpochRecord;
pub use events::{ChannelEventWriter, ScaleEvent, ScaleEventProcessor, ScaleEventWriter};
pub use metrics::ScaleMetrics;
pub use policy::{ScalingPolicy, StreamConfiguration};
pub use record::{ResumePoint, ScaleOperation, ScaleOrigin, ScaleRequest, StreamRecord};
pub use segment::{KeyRange, Segment};
pub use state::StreamState;
pub use status::{CheckScaleStatus, ScaleResponse, ScaleStatus, UpdateStreamStatus};
pub use store::{Mutation, StreamMetadataStore};
pub use tasks::StreamMetadataTasks;
