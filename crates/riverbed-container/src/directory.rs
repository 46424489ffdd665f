//! Durable container metadata directory.
//!
//! Couples a [`ContainerMetadata`] with its [`OperationLog`]. Every mutation
//! is validated, stamped with a freshly allocated sequence number, appended
//! to the log and only then applied in memory. Opening a directory replays
//! the log in recovery mode so the sequence counter resumes above every
//! number ever handed out.

use crate::log::{LogOperation, OperationLog};
use crate::metadata::{ContainerMetadata, SegmentMetadata};
use parking_lot::Mutex;
use riverbed_common::config::ContainerConfig;
use riverbed_common::{Error, Result, transaction_segment_name};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};
use uuid::Uuid;

/// Metadata directory of one segment container
pub struct ContainerDirectory {
    metadata: ContainerMetadata,
    log: OperationLog,
    /// Serializes allocate + append + apply so log order matches sequence order
    write_lock: Mutex<()>,
    ops_since_checkpoint: AtomicU64,
    checkpoint_every_ops: u64,
}

impl ContainerDirectory {
    /// Path of the operation log for `container_id`
    #[must_use]
    pub fn log_path(config: &ContainerConfig, container_id: u32) -> PathBuf {
        config.log_dir.join(format!("container-{container_id}.log"))
    }

    /// Open the container, replaying its log
    pub fn open(container_id: u32, config: &ContainerConfig) -> Result<Self> {
        let log = OperationLog::open(Self::log_path(config, container_id), config.sync_on_write)?;
        let metadata = ContainerMetadata::new(container_id);

        metadata.enter_recovery_mode()?;
        let mut replayed = 0u64;
        let last = log.replay(|sequence, op| {
            replayed += 1;
            replay_operation(&metadata, sequence, op)
        })?;
        metadata.exit_recovery_mode()?;

        info!(
            "Recovered container {} from {} ({} bytes): {} record(s), sequence {}, {} active segment(s)",
            container_id,
            log.path().display(),
            log.size()?,
            replayed,
            last,
            metadata.active_segment_count()
        );

        Ok(Self {
            metadata,
            log,
            write_lock: Mutex::new(()),
            ops_since_checkpoint: AtomicU64::new(0),
            checkpoint_every_ops: config.checkpoint_every_ops,
        })
    }

    /// Read access to the in-memory metadata
    #[must_use]
    pub const fn metadata(&self) -> &ContainerMetadata {
        &self.metadata
    }

    /// Map a new stream segment; returns its id
    pub fn create_segment(&self, name: &str) -> Result<u64> {
        let _guard = self.write_lock.lock();
        if self.metadata.get_segment_id(name).is_some() {
            return Err(Error::SegmentAlreadyMapped(name.to_string()));
        }
        self.append_and_apply(|sequence| LogOperation::MapSegment {
            name: name.to_string(),
            segment_id: sequence,
            parent_id: None,
        })
    }

    /// Map a transaction segment chained to `parent_name`.
    ///
    /// Returns the transaction segment's name and id.
    pub fn create_transaction_segment(
        &self,
        parent_name: &str,
        txn_id: Uuid,
    ) -> Result<(String, u64)> {
        let _guard = self.write_lock.lock();
        let parent_id = self.metadata.get_segment_id(parent_name).ok_or_else(|| {
            Error::invalid_argument(format!("parent segment {parent_name} is not mapped"))
        })?;
        let parent = self.live_segment(parent_id)?;
        if parent.parent_id.is_some() {
            return Err(Error::invalid_argument(format!(
                "{parent_name} is a transaction segment"
            )));
        }

        let name = transaction_segment_name(parent_name, txn_id);
        if self.metadata.get_segment_id(&name).is_some() {
            return Err(Error::SegmentAlreadyMapped(name));
        }
        let id = self.append_and_apply(|sequence| LogOperation::MapSegment {
            name: name.clone(),
            segment_id: sequence,
            parent_id: Some(parent_id),
        })?;
        Ok((name, id))
    }

    /// Record a new length for a segment
    pub fn update_length(&self, segment_id: u64, length: u64) -> Result<()> {
        let _guard = self.write_lock.lock();
        let segment = self.live_segment(segment_id)?;
        if segment.sealed {
            return Err(Error::illegal_state(format!(
                "segment {} is sealed",
                segment.name
            )));
        }
        if length < segment.length {
            return Err(Error::invalid_argument(format!(
                "segment {} length cannot shrink from {} to {}",
                segment.name, segment.length, length
            )));
        }
        self.append_and_apply(|_| LogOperation::UpdateLength { segment_id, length })?;
        Ok(())
    }

    /// Seal a segment; sealing an already sealed segment logs nothing
    pub fn seal_segment(&self, segment_id: u64) -> Result<()> {
        let _guard = self.write_lock.lock();
        if self.live_segment(segment_id)?.sealed {
            return Ok(());
        }
        self.append_and_apply(|_| LogOperation::SealSegment { segment_id })?;
        Ok(())
    }

    /// Delete a segment and its children; returns every deleted segment
    pub fn delete_segment(&self, name: &str) -> Result<Vec<SegmentMetadata>> {
        let _guard = self.write_lock.lock();
        if self.metadata.get_segment_id(name).is_none() {
            return Ok(Vec::new());
        }
        let sequence = self.metadata.next_sequence_number()?;
        self.log.append(
            sequence,
            &LogOperation::DeleteSegment {
                name: name.to_string(),
            },
        )?;
        let deleted = self.metadata.delete_segment(name, sequence);
        self.after_write()?;
        Ok(deleted)
    }

    /// Write a checkpoint and mark it as a valid truncation point.
    ///
    /// Returns the checkpoint's sequence number.
    pub fn checkpoint(&self) -> Result<u64> {
        let _guard = self.write_lock.lock();
        self.checkpoint_locked()
    }

    /// Drop log records below the latest valid truncation point.
    ///
    /// Returns the sequence number the log now starts at, or `None` if no
    /// checkpoint has been written yet.
    pub fn truncate_log(&self) -> Result<Option<u64>> {
        let _guard = self.write_lock.lock();
        let current = self.metadata.sequence_number();
        let Some((sequence, address)) = self.metadata.closest_truncation_marker(current) else {
            return Ok(None);
        };
        if !self.metadata.is_valid_truncation_point(sequence) {
            return Ok(None);
        }
        let dropped = self.log.truncate_before(address)?;
        self.metadata
            .remove_truncation_markers(sequence.saturating_sub(1));
        info!(
            "Container {} truncated {} record(s) below sequence {}",
            self.metadata.container_id(),
            dropped,
            sequence
        );
        Ok(Some(sequence))
    }

    fn live_segment(&self, segment_id: u64) -> Result<SegmentMetadata> {
        self.metadata
            .get_segment(segment_id)
            .filter(|s| !s.deleted)
            .ok_or_else(|| Error::invalid_argument(format!("segment id {segment_id} is not mapped")))
    }

    /// Allocate, log, apply; the caller holds `write_lock` and has validated.
    /// Returns the operation's sequence number.
    fn append_and_apply(&self, build: impl FnOnce(u64) -> LogOperation) -> Result<u64> {
        let sequence = self.metadata.next_sequence_number()?;
        let op = build(sequence);
        self.log.append(sequence, &op)?;
        apply_operation(&self.metadata, sequence, op)?;
        self.after_write()?;
        Ok(sequence)
    }

    fn after_write(&self) -> Result<()> {
        let ops = self.ops_since_checkpoint.fetch_add(1, Ordering::SeqCst) + 1;
        if self.checkpoint_every_ops > 0 && ops >= self.checkpoint_every_ops {
            self.checkpoint_locked()?;
        }
        Ok(())
    }

    fn checkpoint_locked(&self) -> Result<u64> {
        let sequence = self.metadata.next_sequence_number()?;
        let snapshot = self.metadata.snapshot();
        self.log.append(sequence, &LogOperation::Checkpoint(snapshot))?;
        self.log.sync()?;
        self.metadata.record_truncation_marker(sequence, sequence);
        self.metadata.set_valid_truncation_point(sequence);
        self.ops_since_checkpoint.store(0, Ordering::SeqCst);
        debug!(
            "Container {} checkpoint at sequence {}",
            self.metadata.container_id(),
            sequence
        );
        Ok(sequence)
    }
}

fn apply_operation(metadata: &ContainerMetadata, sequence: u64, op: LogOperation) -> Result<()> {
    match op {
        LogOperation::MapSegment {
            name,
            segment_id,
            parent_id,
        } => metadata.map_segment(&name, segment_id, parent_id, sequence),
        LogOperation::UpdateLength { segment_id, length } => {
            metadata.update_length(segment_id, length, sequence)
        }
        LogOperation::SealSegment { segment_id } => metadata.seal_segment(segment_id, sequence),
        LogOperation::DeleteSegment { name } => {
            metadata.delete_segment(&name, sequence);
            Ok(())
        }
        LogOperation::Checkpoint(snapshot) => {
            metadata.restore(&snapshot)?;
            metadata.record_truncation_marker(sequence, sequence);
            metadata.set_valid_truncation_point(sequence);
            Ok(())
        }
    }
}

fn replay_operation(metadata: &ContainerMetadata, sequence: u64, op: LogOperation) -> Result<()> {
    apply_operation(metadata, sequence, op)?;
    metadata.set_sequence_number(sequence)
}
