//! Scale coordinator.
//!
//! Sequences one scale as three durable, individually idempotent phases:
//!
//! 1. **Propose**: one compare-and-set moves the stream ACTIVE -> SCALING and
//!    records the [`ScaleOperation`]. A rejected proposal writes nothing, so
//!    the stream stays ACTIVE.
//! 2. **Provision**: records that the new segments exist physically.
//! 3. **Commit**: seals the old segments, appends the new epoch and moves the
//!    stream back to ACTIVE in the same write.
//!
//! Progress lives in the persisted [`ResumePoint`](crate::record::ResumePoint),
//! so after a crash any phase can be re-invoked with the same request id.

use crate::epoch::EpochRecord;
use crate::record::{ScaleOperation, ScaleRequest};
use crate::status::CheckScaleStatus;
use crate::store::StreamMetadataStore;
use riverbed_common::{ErrorKind, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Drives the scale phases of [`StreamMetadataStore`]
pub struct ScaleCoordinator {
    store: Arc<StreamMetadataStore>,
    /// Host id recorded on proposed operations
    owner: String,
}

impl ScaleCoordinator {
    pub fn new(store: Arc<StreamMetadataStore>, owner: impl Into<String>) -> Self {
        Self {
            store,
            owner: owner.into(),
        }
    }

    /// Phase 1: enter SCALING and allocate the new segments
    pub async fn propose(
        &self,
        scope: &str,
        stream: &str,
        request: &ScaleRequest,
    ) -> Result<ScaleOperation> {
        match self
            .store
            .start_scale(scope, stream, request, &self.owner)
            .await
        {
            Ok(op) => {
                info!(
                    "Scale {} on {}/{} proposed at epoch {}: sealing {:?}, creating {:?}",
                    op.request_id,
                    scope,
                    stream,
                    op.active_epoch,
                    op.sealed_segments,
                    op.new_segment_ids()
                );
                Ok(op)
            }
            Err(e) => {
                match e.kind() {
                    ErrorKind::Validation | ErrorKind::Precondition => warn!(
                        "Scale {} on {}/{} rejected, stream stays active: {}",
                        request.request_id, scope, stream, e
                    ),
                    _ => debug!(
                        "Scale {} on {}/{} not proposed: {}",
                        request.request_id, scope, stream, e
                    ),
                }
                Err(e)
            }
        }
    }

    /// Phase 2: acknowledge the new segments as created
    pub async fn provision(&self, scope: &str, stream: &str, request_id: Uuid) -> Result<()> {
        self.store
            .scale_new_segments_created(scope, stream, request_id)
            .await?;
        debug!("Scale {} on {}/{} provisioned", request_id, scope, stream);
        Ok(())
    }

    /// Phase 3: seal the old segments and commit the new epoch
    pub async fn commit(&self, scope: &str, stream: &str, request_id: Uuid) -> Result<EpochRecord> {
        let epoch = self
            .store
            .scale_segments_sealed(scope, stream, request_id)
            .await?;
        info!(
            "Scale {} on {}/{} committed epoch {} with {} segment(s)",
            request_id,
            scope,
            stream,
            epoch.epoch,
            epoch.segments.len()
        );
        Ok(epoch)
    }

    /// The scale left in flight on a stream, if any
    pub async fn pending(&self, scope: &str, stream: &str) -> Result<Option<ScaleOperation>> {
        Ok(self
            .store
            .get_stream(scope, stream)
            .await?
            .pending_scale()
            .cloned())
    }

    /// Whether the scale started from `epoch` has completed.
    ///
    /// Unknown scopes, streams and epochs beyond the active one are
    /// `InvalidInput`; this never writes.
    pub async fn check_scale(
        &self,
        scope: &str,
        stream: &str,
        epoch: u32,
    ) -> Result<CheckScaleStatus> {
        let record = match self.store.get_stream(scope, stream).await {
            Ok(record) => record,
            Err(e) if e.is_not_found() => return Ok(CheckScaleStatus::InvalidInput),
            Err(e) => return Err(e),
        };
        let active = record.active_epoch();
        Ok(match epoch.cmp(&active) {
            std::cmp::Ordering::Greater => CheckScaleStatus::InvalidInput,
            std::cmp::Ordering::Less => CheckScaleStatus::Success,
            std::cmp::Ordering::Equal => CheckScaleStatus::InProgress,
        })
    }
}
