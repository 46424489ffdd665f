//! External collaborators of the scale workflow.
//!
//! The controller never talks to storage nodes or the transaction manager
//! directly; it holds these capabilities as injected trait objects.

use crate::segment::Segment;
use async_trait::async_trait;
use parking_lot::RwLock;
use riverbed_common::{Result, ScopedStream, SegmentId};
use riverbed_container::ContainerDirectory;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Reports whether transactions are still open on a stream epoch
#[async_trait]
pub trait TransactionStatus: Send + Sync {
    async fn is_transaction_ongoing(&self, scope: &str, stream: &str, epoch: u32) -> Result<bool>;
}

/// Acknowledges creation and sealing of physical segments
#[async_trait]
pub trait SegmentProvisioner: Send + Sync {
    /// Create the given segments; must tolerate segments that already exist
    async fn create_segments(&self, stream: &ScopedStream, segments: &[Segment]) -> Result<()>;

    /// Seal the given segments; must tolerate segments already sealed
    async fn seal_segments(&self, stream: &ScopedStream, segments: &[SegmentId]) -> Result<()>;
}

/// No transactions are ever open
pub struct NoTransactions;

#[async_trait]
impl TransactionStatus for NoTransactions {
    async fn is_transaction_ongoing(&self, _: &str, _: &str, _: u32) -> Result<bool> {
        Ok(false)
    }
}

/// Open transaction counts tracked in memory, keyed by stream and epoch
#[derive(Default)]
pub struct TransactionTracker {
    open: RwLock<HashMap<(String, String, u32), u32>>,
}

impl TransactionTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, scope: &str, stream: &str, epoch: u32) {
        *self
            .open
            .write()
            .entry((scope.to_string(), stream.to_string(), epoch))
            .or_default() += 1;
    }

    pub fn end(&self, scope: &str, stream: &str, epoch: u32) {
        let mut open = self.open.write();
        let key = (scope.to_string(), stream.to_string(), epoch);
        if let Some(count) = open.get_mut(&key) {
            *count -= 1;
            if *count == 0 {
                open.remove(&key);
            }
        }
    }
}

#[async_trait]
impl TransactionStatus for TransactionTracker {
    async fn is_transaction_ongoing(&self, scope: &str, stream: &str, epoch: u32) -> Result<bool> {
        let key = (scope.to_string(), stream.to_string(), epoch);
        Ok(self.open.read().contains_key(&key))
    }
}

/// Provisions segments into the local segment containers.
///
/// A segment lives in container `crc32c(name) % container_count`.
pub struct ContainerProvisioner {
    containers: Vec<Arc<ContainerDirectory>>,
}

impl ContainerProvisioner {
    #[must_use]
    pub const fn new(containers: Vec<Arc<ContainerDirectory>>) -> Self {
        Self { containers }
    }

    /// Container that owns the segment called `name`
    fn container_for(&self, name: &str) -> Option<&ContainerDirectory> {
        if self.containers.is_empty() {
            return None;
        }
        let index = crc32c::crc32c(name.as_bytes()) as usize % self.containers.len();
        self.containers.get(index).map(Arc::as_ref)
    }

    fn no_containers() -> riverbed_common::Error {
        riverbed_common::Error::Configuration("no segment containers configured".into())
    }
}

#[async_trait]
impl SegmentProvisioner for ContainerProvisioner {
    async fn create_segments(&self, stream: &ScopedStream, segments: &[Segment]) -> Result<()> {
        for segment in segments {
            let name = stream.segment_name(segment.id);
            let container = self.container_for(&name).ok_or_else(Self::no_containers)?;
            if container.metadata().get_segment_id(&name).is_none() {
                let id = container.create_segment(&name)?;
                debug!(
                    "Mapped {} to id {} in container {}",
                    name,
                    id,
                    container.metadata().container_id()
                );
            }
        }
        Ok(())
    }

    async fn seal_segments(&self, stream: &ScopedStream, segments: &[SegmentId]) -> Result<()> {
        for segment in segments {
            let name = stream.segment_name(*segment);
            let container = self.container_for(&name).ok_or_else(Self::no_containers)?;
            let id = container.metadata().get_segment_id(&name).ok_or_else(|| {
                riverbed_common::Error::invalid_argument(format!("segment {name} was never created"))
            })?;
            container.seal_segment(id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::KeyRange;
    use riverbed_common::config::ContainerConfig;

    #[tokio::test]
    async fn test_transaction_tracker() {
        let tracker = TransactionTracker::new();
        assert!(!tracker.is_transaction_ongoing("s", "t", 0).await.unwrap());
        tracker.begin("s", "t", 0);
        tracker.begin("s", "t", 0);
        tracker.end("s", "t", 0);
        assert!(tracker.is_transaction_ongoing("s", "t", 0).await.unwrap());
        assert!(!tracker.is_transaction_ongoing("s", "t", 1).await.unwrap());
        tracker.end("s", "t", 0);
        assert!(!tracker.is_transaction_ongoing("s", "t", 0).await.unwrap());
    }

    #[tokio::test]
    async fn test_container_provisioner_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let config = ContainerConfig {
            container_count: 2,
            log_dir: dir.path().to_path_buf(),
            sync_on_write: false,
            checkpoint_every_ops: 0,
        };
        let containers: Vec<_> = (0..2)
            .map(|id| Arc::new(ContainerDirectory::open(id, &config).unwrap()))
            .collect();
        let provisioner = ContainerProvisioner::new(containers.clone());

        let stream = ScopedStream::new("scope", "stream1").unwrap();
        let segments: Vec<_> = KeyRange::split_evenly(4)
            .into_iter()
            .zip(0..)
            .map(|(range, n)| Segment::new(SegmentId::new(0, n), range, 0))
            .collect();

        provisioner.create_segments(&stream, &segments).await.unwrap();
        provisioner.create_segments(&stream, &segments).await.unwrap();
        let mapped: usize = containers
            .iter()
            .map(|c| c.metadata().active_segment_count())
            .sum();
        assert_eq!(mapped, 4);

        let ids: Vec<_> = segments.iter().map(|s| s.id).collect();
        provisioner.seal_segments(&stream, &ids).await.unwrap();
        provisioner.seal_segments(&stream, &ids).await.unwrap();

        let unknown = [SegmentId::new(3, 9)];
        assert!(provisioner.seal_segments(&stream, &unknown).await.is_err());
    }
}
