//! In-memory metadata of one segment container.
//!
//! Holds the name → id directory, the container-wide sequence number
//! allocator, the recovery-mode flag and the truncation markers. All
//! allocation goes through a single atomic counter; every other piece of
//! state sits behind one `RwLock` that is only held for the duration of a
//! synchronous update.

use parking_lot::RwLock;
use riverbed_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info};

/// Metadata of a segment mapped in a container
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentMetadata {
    pub name: String,
    pub id: u64,
    /// Set for transaction segments chained to a stream segment
    pub parent_id: Option<u64>,
    pub length: u64,
    pub sealed: bool,
    pub deleted: bool,
    /// Sequence number of the last operation that touched this segment
    pub last_modified: u64,
}

impl SegmentMetadata {
    fn new(name: String, id: u64, parent_id: Option<u64>, last_modified: u64) -> Self {
        Self {
            name,
            id,
            parent_id,
            length: 0,
            sealed: false,
            deleted: false,
            last_modified,
        }
    }
}

/// Serializable image of the segment directory, written by checkpoints
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataSnapshot {
    pub sequence_number: u64,
    pub segments: Vec<SegmentMetadata>,
}

#[derive(Default)]
struct Directory {
    ids_by_name: HashMap<String, u64>,
    segments: BTreeMap<u64, SegmentMetadata>,
    /// sequence number -> log address
    truncation_markers: BTreeMap<u64, u64>,
    valid_truncation_points: BTreeSet<u64>,
}

impl Directory {
    fn live(&self, id: u64) -> Result<&SegmentMetadata> {
        self.segments
            .get(&id)
            .filter(|s| !s.deleted)
            .ok_or_else(|| Error::invalid_argument(format!("segment id {id} is not mapped")))
    }

    fn live_mut(&mut self, id: u64) -> Result<&mut SegmentMetadata> {
        self.segments
            .get_mut(&id)
            .filter(|s| !s.deleted)
            .ok_or_else(|| Error::invalid_argument(format!("segment id {id} is not mapped")))
    }
}

/// Metadata of a single segment container
pub struct ContainerMetadata {
    container_id: u32,
    directory: RwLock<Directory>,
    /// Last sequence number handed out (or replayed)
    sequence_number: AtomicU64,
    recovery_mode: AtomicBool,
}

impl ContainerMetadata {
    #[must_use]
    pub fn new(container_id: u32) -> Self {
        Self {
            container_id,
            directory: RwLock::new(Directory::default()),
            sequence_number: AtomicU64::new(0),
            recovery_mode: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub const fn container_id(&self) -> u32 {
        self.container_id
    }

    // Sequence numbers

    /// Allocate the next operation sequence number.
    ///
    /// Fails with `IllegalState` in recovery mode, where numbers are replayed
    /// through [`Self::set_sequence_number`] instead of allocated.
    pub fn next_sequence_number(&self) -> Result<u64> {
        if self.is_recovery_mode() {
            return Err(Error::illegal_state(format!(
                "container {} cannot allocate sequence numbers in recovery mode",
                self.container_id
            )));
        }
        Ok(self.sequence_number.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Last allocated or replayed sequence number
    #[must_use]
    pub fn sequence_number(&self) -> u64 {
        self.sequence_number.load(Ordering::SeqCst)
    }

    /// Move the counter to a replayed value; recovery mode only, never backwards
    pub fn set_sequence_number(&self, value: u64) -> Result<()> {
        self.ensure_recovery_mode("set the sequence number")?;
        let current = self.sequence_number();
        if value < current {
            return Err(Error::illegal_state(format!(
                "sequence number cannot move backwards from {current} to {value}"
            )));
        }
        self.sequence_number.store(value, Ordering::SeqCst);
        Ok(())
    }

    // Recovery mode

    #[must_use]
    pub fn is_recovery_mode(&self) -> bool {
        self.recovery_mode.load(Ordering::SeqCst)
    }

    pub fn enter_recovery_mode(&self) -> Result<()> {
        if self.recovery_mode.swap(true, Ordering::SeqCst) {
            return Err(Error::illegal_state(format!(
                "container {} is already in recovery mode",
                self.container_id
            )));
        }
        info!("Container {} entered recovery mode", self.container_id);
        Ok(())
    }

    pub fn exit_recovery_mode(&self) -> Result<()> {
        if !self.recovery_mode.swap(false, Ordering::SeqCst) {
            return Err(Error::illegal_state(format!(
                "container {} is not in recovery mode",
                self.container_id
            )));
        }
        info!(
            "Container {} left recovery mode at sequence {}",
            self.container_id,
            self.sequence_number()
        );
        Ok(())
    }

    /// Drop every mapping, marker and the counter; recovery mode only
    pub fn reset(&self) -> Result<()> {
        self.ensure_recovery_mode("reset")?;
        *self.directory.write() = Directory::default();
        self.sequence_number.store(0, Ordering::SeqCst);
        debug!("Container {} metadata reset", self.container_id);
        Ok(())
    }

    fn ensure_recovery_mode(&self, action: &str) -> Result<()> {
        if self.is_recovery_mode() {
            Ok(())
        } else {
            Err(Error::illegal_state(format!(
                "container {} must be in recovery mode to {action}",
                self.container_id
            )))
        }
    }

    // Segment directory

    /// Register `name -> id`, optionally chained to an existing parent segment.
    ///
    /// The parent must already be mapped and must not itself be a child.
    pub fn map_segment(
        &self,
        name: &str,
        id: u64,
        parent_id: Option<u64>,
        sequence: u64,
    ) -> Result<()> {
        let mut dir = self.directory.write();
        if dir.ids_by_name.contains_key(name) {
            return Err(Error::SegmentAlreadyMapped(name.to_string()));
        }
        if dir.segments.contains_key(&id) {
            return Err(Error::invalid_argument(format!(
                "segment id {id} is already in use"
            )));
        }
        if let Some(parent) = parent_id {
            let parent_meta = dir.live(parent)?;
            if parent_meta.parent_id.is_some() {
                return Err(Error::invalid_argument(format!(
                    "parent segment {} is itself a child segment",
                    parent_meta.name
                )));
            }
        }
        dir.ids_by_name.insert(name.to_string(), id);
        dir.segments.insert(
            id,
            SegmentMetadata::new(name.to_string(), id, parent_id, sequence),
        );
        debug!("Container {} mapped {} -> {}", self.container_id, name, id);
        Ok(())
    }

    /// Id of a mapped, non-deleted segment
    #[must_use]
    pub fn get_segment_id(&self, name: &str) -> Option<u64> {
        self.directory.read().ids_by_name.get(name).copied()
    }

    /// Metadata by id, including deleted segments
    #[must_use]
    pub fn get_segment(&self, id: u64) -> Option<SegmentMetadata> {
        self.directory.read().segments.get(&id).cloned()
    }

    /// Grow a segment's length; lengths never shrink and sealed segments are frozen
    pub fn update_length(&self, id: u64, length: u64, sequence: u64) -> Result<()> {
        let mut dir = self.directory.write();
        let segment = dir.live_mut(id)?;
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
        segment.length = length;
        segment.last_modified = sequence;
        Ok(())
    }

    /// Mark a segment sealed; sealing twice is a no-op
    pub fn seal_segment(&self, id: u64, sequence: u64) -> Result<()> {
        let mut dir = self.directory.write();
        let segment = dir.live_mut(id)?;
        if !segment.sealed {
            segment.sealed = true;
            segment.last_modified = sequence;
        }
        Ok(())
    }

    /// Delete `name` and every segment chained to it.
    ///
    /// Returns all deleted segments so callers can release resources for each
    /// of them, not just the named one.
    pub fn delete_segment(&self, name: &str, sequence: u64) -> Vec<SegmentMetadata> {
        let mut dir = self.directory.write();
        let Some(root) = dir.ids_by_name.get(name).copied() else {
            return Vec::new();
        };

        // Walk children transitively
        let mut to_delete = vec![root];
        let mut i = 0;
        while i < to_delete.len() {
            let parent = to_delete[i];
            to_delete.extend(
                dir.segments
                    .values()
                    .filter(|s| !s.deleted && s.parent_id == Some(parent))
                    .map(|s| s.id),
            );
            i += 1;
        }

        let mut deleted = Vec::with_capacity(to_delete.len());
        for id in to_delete {
            if let Some(segment) = dir.segments.get_mut(&id) {
                segment.deleted = true;
                segment.last_modified = sequence;
                deleted.push(segment.clone());
            }
        }
        for segment in &deleted {
            dir.ids_by_name.remove(&segment.name);
        }
        debug!(
            "Container {} deleted {} segment(s) under {}",
            self.container_id,
            deleted.len(),
            name
        );
        deleted
    }

    /// Number of mapped segments that are not deleted
    #[must_use]
    pub fn active_segment_count(&self) -> usize {
        self.directory.read().ids_by_name.len()
    }

    // Truncation markers

    /// Remember that replay from `log_address` restores state as of `sequence`
    pub fn record_truncation_marker(&self, sequence: u64, log_address: u64) {
        self.directory
            .write()
            .truncation_markers
            .insert(sequence, log_address);
    }

    /// Drop every marker (and valid point) at or below `up_to_sequence`
    pub fn remove_truncation_markers(&self, up_to_sequence: u64) {
        let mut dir = self.directory.write();
        dir.truncation_markers.retain(|seq, _| *seq > up_to_sequence);
        dir.valid_truncation_points
            .retain(|seq| *seq > up_to_sequence);
    }

    /// Log address of the highest marker at or below `sequence`
    #[must_use]
    pub fn closest_truncation_marker(&self, sequence: u64) -> Option<(u64, u64)> {
        self.directory
            .read()
            .truncation_markers
            .range(..=sequence)
            .next_back()
            .map(|(seq, addr)| (*seq, *addr))
    }

    pub fn set_valid_truncation_point(&self, sequence: u64) {
        self.directory
            .write()
            .valid_truncation_points
            .insert(sequence);
    }

    #[must_use]
    pub fn is_valid_truncation_point(&self, sequence: u64) -> bool {
        self.directory
            .read()
            .valid_truncation_points
            .contains(&sequence)
    }

    // Checkpoints

    /// Capture the segment directory and counter
    #[must_use]
    pub fn snapshot(&self) -> MetadataSnapshot {
        let dir = self.directory.read();
        MetadataSnapshot {
            sequence_number: self.sequence_number(),
            segments: dir.segments.values().cloned().collect(),
        }
    }

    /// Replace the segment directory with a checkpoint image; recovery mode only.
    ///
    /// Truncation markers survive so a replay can keep accumulating them.
    pub fn restore(&self, snapshot: &MetadataSnapshot) -> Result<()> {
        self.ensure_recovery_mode("restore a checkpoint")?;
        let mut dir = self.directory.write();
        dir.ids_by_name.clear();
        dir.segments.clear();
        for segment in &snapshot.segments {
            if !segment.deleted {
                dir.ids_by_name.insert(segment.name.clone(), segment.id);
            }
            dir.segments.insert(segment.id, segment.clone());
        }
        drop(dir);
        self.set_sequence_number(snapshot.sequence_number)
    }
}
