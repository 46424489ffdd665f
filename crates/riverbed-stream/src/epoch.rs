//! Epoch records

use riverbed_common::SegmentId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Set of segments active between two scale events
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochRecord {
    /// Monotonic, starts at 0
    pub epoch: u32,
    /// Active segments, sorted by id
    pub segments: Vec<SegmentId>,
    /// Scale timestamp that produced the epoch (milliseconds)
    pub created_at: u64,
    /// Scale request that produced the epoch; `None` for epoch 0
    pub scale_request: Option<Uuid>,
}

impl EpochRecord {
    #[must_use]
    pub fn new(
        epoch: u32,
        mut segments: Vec<SegmentId>,
        created_at: u64,
        scale_request: Option<Uuid>,
    ) -> Self {
        segments.sort_unstable();
        Self {
            epoch,
            segments,
            created_at,
            scale_request,
        }
    }

    #[must_use]
    pub fn contains(&self, segment: SegmentId) -> bool {
        self.segments.binary_search(&segment).is_ok()
    }
}
