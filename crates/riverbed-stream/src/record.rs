//! Persisted stream record and the pure scale transitions over it.
//!
//! A whole stream (state, epoch history, segment arena and the in-flight
//! scale operation) is stored as one versioned row. Every function here
//! mutates a [`StreamRecord`] in memory; the metadata store writes the
//! result back with a single compare-and-set, so a reader never observes
//! sealed segments without the epoch that replaced them.

use crate::epoch::EpochRecord;
use crate::policy::StreamConfiguration;
use crate::segment::{KeyRange, Segment, validate_replacement};
use crate::state::StreamState;
use riverbed_common::{Error, Result, ScopedStream, SegmentId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Who asked for a scale
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScaleOrigin {
    /// Operator override; ignores the scaling policy
    Manual,
    /// Driven by the scaling policy
    Auto,
}

/// Progress of a scale operation, persisted with it
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResumePoint {
    /// Stream is SCALING and the new segment ids are allocated
    Proposed,
    /// Physical segments acknowledged as created
    Provisioned,
    /// New epoch committed, stream back to ACTIVE
    Committed,
}

/// A request to replace some of the current segments
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScaleRequest {
    /// Retrying with the same id is idempotent
    pub request_id: Uuid,
    pub sealed_segments: Vec<SegmentId>,
    pub new_ranges: Vec<KeyRange>,
    pub scale_timestamp: u64,
    pub origin: ScaleOrigin,
    /// Epoch the caller based the request on, if it cares
    pub expected_epoch: Option<u32>,
}

/// In-flight (or just committed) scale of one stream
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScaleOperation {
    pub request_id: Uuid,
    pub origin: ScaleOrigin,
    pub sealed_segments: Vec<SegmentId>,
    /// Proposed segments; they join the arena at commit
    pub new_segments: Vec<Segment>,
    pub scale_timestamp: u64,
    /// Active epoch when the scale was proposed
    pub active_epoch: u32,
    pub resume_point: ResumePoint,
    /// Controller host that proposed the scale
    pub owner: String,
}

impl ScaleOperation {
    #[must_use]
    pub fn new_segment_ids(&self) -> Vec<SegmentId> {
        self.new_segments.iter().map(|s| s.id).collect()
    }

    /// Epoch the commit will create
    #[must_use]
    pub const fn target_epoch(&self) -> u32 {
        self.active_epoch + 1
    }
}

/// Everything persisted about one stream
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamRecord {
    configuration: StreamConfiguration,
    state: StreamState,
    created_at: u64,
    /// Append-only; never empty
    epochs: Vec<EpochRecord>,
    /// Every segment ever committed, indexed by id
    segments: BTreeMap<SegmentId, Segment>,
    next_segment_number: u32,
    scale: Option<ScaleOperation>,
    last_scale: Option<ScaleOperation>,
}

impl StreamRecord {
    /// New stream in CREATING with epoch 0 split evenly into the policy's
    /// minimum number of segments
    pub fn new(configuration: StreamConfiguration, created_at: u64) -> Result<Self> {
        configuration.validate()?;
        let count = configuration.scaling_policy.min_segments();

        let mut segments = BTreeMap::new();
        for (number, range) in (0..count).zip(KeyRange::split_evenly(count)) {
            let id = SegmentId::new(0, number);
            segments.insert(id, Segment::new(id, range, created_at));
        }
        let epoch = EpochRecord::new(0, segments.keys().copied().collect(), created_at, None);

        Ok(Self {
            configuration,
            state: StreamState::Creating,
            created_at,
            epochs: vec![epoch],
            segments,
            next_segment_number: count,
            scale: None,
            last_scale: None,
        })
    }

    #[must_use]
    pub const fn configuration(&self) -> &StreamConfiguration {
        &self.configuration
    }

    #[must_use]
    pub const fn stream(&self) -> &ScopedStream {
        &self.configuration.stream
    }

    #[must_use]
    pub const fn state(&self) -> StreamState {
        self.state
    }

    #[must_use]
    pub const fn created_at(&self) -> u64 {
        self.created_at
    }

    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.state == StreamState::Sealed
    }

    /// Latest committed epoch
    #[must_use]
    pub fn current_epoch(&self) -> &EpochRecord {
        &self.epochs[self.epochs.len() - 1]
    }

    #[must_use]
    pub fn active_epoch(&self) -> u32 {
        self.current_epoch().epoch
    }

    #[must_use]
    pub fn epoch(&self, epoch: u32) -> Option<&EpochRecord> {
        self.epochs.get(epoch as usize)
    }

    #[must_use]
    pub fn epochs(&self) -> &[EpochRecord] {
        &self.epochs
    }

    #[must_use]
    pub fn segment(&self, id: SegmentId) -> Option<&Segment> {
        self.segments.get(&id)
    }

    /// Segments accepting writes; empty once sealed
    #[must_use]
    pub fn current_segments(&self) -> Vec<Segment> {
        if self.is_sealed() {
            return Vec::new();
        }
        self.resolve(&self.current_epoch().segments)
    }

    #[must_use]
    pub fn successors(&self, id: SegmentId) -> Option<Vec<Segment>> {
        self.segment(id).map(|s| self.resolve(&s.successors))
    }

    #[must_use]
    pub fn predecessors(&self, id: SegmentId) -> Option<Vec<Segment>> {
        self.segment(id).map(|s| self.resolve(&s.predecessors))
    }

    #[must_use]
    pub const fn pending_scale(&self) -> Option<&ScaleOperation> {
        self.scale.as_ref()
    }

    /// The most recently committed scale
    #[must_use]
    pub const fn last_scale(&self) -> Option<&ScaleOperation> {
        self.last_scale.as_ref()
    }

    fn resolve(&self, ids: &[SegmentId]) -> Vec<Segment> {
        ids.iter()
            .filter_map(|id| self.segments.get(id))
            .cloned()
            .collect()
    }

    fn sealed_error(&self) -> Error {
        Error::StreamSealed {
            scope: self.stream().scope().to_string(),
            stream: self.stream().stream().to_string(),
        }
    }

    fn in_progress_error(&self) -> Error {
        Error::ScaleInProgress {
            scope: self.stream().scope().to_string(),
            stream: self.stream().stream().to_string(),
        }
    }

    /// Guarded state change
    pub fn transition(&mut self, next: StreamState) -> Result<()> {
        self.state.check_transition(next)?;
        self.state = next;
        Ok(())
    }

    /// Propose a scale: enter SCALING and allocate the new segment ids.
    ///
    /// Re-proposing the request that is already in flight (or was the last
    /// one committed) returns the stored operation unchanged.
    pub fn start_scale(&mut self, request: &ScaleRequest, owner: &str) -> Result<ScaleOperation> {
        if let Some(op) = &self.scale {
            if op.request_id == request.request_id {
                return Ok(op.clone());
            }
            return Err(self.in_progress_error());
        }
        if let Some(last) = &self.last_scale
            && last.request_id == request.request_id
        {
            return Ok(last.clone());
        }
        if let Some(epoch) = self
            .epochs
            .iter()
            .find(|e| e.scale_request == Some(request.request_id))
        {
            return Err(Error::precondition(format!(
                "scale request {} already committed epoch {}",
                request.request_id, epoch.epoch
            )));
        }

        match self.state {
            StreamState::Active => {}
            StreamState::Sealing | StreamState::Sealed => return Err(self.sealed_error()),
            StreamState::Scaling => return Err(self.in_progress_error()),
            StreamState::Creating => {
                return Err(Error::illegal_state(format!(
                    "stream {} is still being created",
                    self.stream()
                )));
            }
        }

        let active_epoch = self.active_epoch();
        if let Some(expected) = request.expected_epoch
            && expected != active_epoch
        {
            return Err(Error::precondition(format!(
                "stream {} is at epoch {active_epoch}, request expected {expected}",
                self.stream()
            )));
        }

        let sealed_ranges = self.check_sealed_segments(&request.sealed_segments)?;
        validate_replacement(&sealed_ranges, &request.new_ranges)?;
        if request.origin == ScaleOrigin::Auto {
            self.check_policy(request)?;
        }

        let count = u32::try_from(request.new_ranges.len())
            .map_err(|_| Error::invalid_argument("too many new key ranges"))?;
        let first = self.next_segment_number;
        let next = first
            .checked_add(count)
            .ok_or_else(|| Error::internal("segment numbers exhausted"))?;
        let target_epoch = active_epoch + 1;

        let new_segments = request
            .new_ranges
            .iter()
            .zip(first..next)
            .map(|(range, number)| {
                let mut segment =
                    Segment::new(SegmentId::new(target_epoch, number), *range, request.scale_timestamp);
                segment.predecessors = request
                    .sealed_segments
                    .iter()
                    .copied()
                    .filter(|id| {
                        self.segments
                            .get(id)
                            .is_some_and(|s| s.key_range.overlaps(range))
                    })
                    .collect();
                segment
            })
            .collect();

        let op = ScaleOperation {
            request_id: request.request_id,
            origin: request.origin,
            sealed_segments: request.sealed_segments.clone(),
            new_segments,
            scale_timestamp: request.scale_timestamp,
            active_epoch,
            resume_point: ResumePoint::Proposed,
            owner: owner.to_string(),
        };

        self.transition(StreamState::Scaling)?;
        self.next_segment_number = next;
        self.scale = Some(op.clone());
        Ok(op)
    }

    /// Ranges of the segments a scale wants to seal; all must be active now
    fn check_sealed_segments(&self, ids: &[SegmentId]) -> Result<Vec<KeyRange>> {
        if ids.is_empty() {
            return Err(Error::invalid_argument("no segments to seal"));
        }
        let unique: BTreeSet<_> = ids.iter().collect();
        if unique.len() != ids.len() {
            return Err(Error::invalid_argument("duplicate segments to seal"));
        }

        let current = self.current_epoch();
        ids.iter()
            .map(|id| {
                let segment = self.segments.get(id).ok_or(Error::SegmentNotFound(*id))?;
                if segment.is_sealed() || !current.contains(*id) {
                    return Err(Error::precondition(format!(
                        "segment {id} is not active in epoch {}",
                        current.epoch
                    )));
                }
                Ok(segment.key_range)
            })
            .collect()
    }

    fn check_policy(&self, request: &ScaleRequest) -> Result<()> {
        let policy = &self.configuration.scaling_policy;
        if !policy.allows_auto_scale() {
            return Err(Error::invalid_argument(format!(
                "stream {} has a fixed scaling policy",
                self.stream()
            )));
        }
        let resulting = self.current_epoch().segments.len() - request.sealed_segments.len()
            + request.new_ranges.len();
        if resulting < policy.min_segments() as usize {
            return Err(Error::invalid_argument(format!(
                "scale would leave {resulting} segments, policy minimum is {}",
                policy.min_segments()
            )));
        }
        Ok(())
    }

    /// Acknowledge that the proposed segments exist physically.
    ///
    /// Returns whether the record changed.
    pub fn scale_new_segments_created(&mut self, request_id: Uuid) -> Result<bool> {
        if let Some(op) = self
            .scale
            .as_mut()
            .filter(|op| op.request_id == request_id)
        {
            if op.resume_point == ResumePoint::Proposed {
                op.resume_point = ResumePoint::Provisioned;
                return Ok(true);
            }
            return Ok(false);
        }
        if self.committed_epoch(request_id).is_some() {
            Ok(false)
        } else {
            Err(self.not_in_progress(request_id))
        }
    }

    /// Seal the old segments and commit the new epoch.
    ///
    /// Returns the committed epoch and whether the record changed; repeating
    /// the call yields the same epoch.
    pub fn scale_segments_sealed(&mut self, request_id: Uuid) -> Result<(EpochRecord, bool)> {
        let op = match &self.scale {
            Some(op) if op.request_id == request_id => op.clone(),
            _ => {
                return self
                    .committed_epoch(request_id)
                    .map(|epoch| (epoch.clone(), false))
                    .ok_or_else(|| self.not_in_progress(request_id));
            }
        };
        if op.resume_point != ResumePoint::Provisioned {
            return Err(Error::illegal_state(format!(
                "scale {request_id} cannot commit before its segments are created"
            )));
        }
        self.transition(StreamState::Active)?;

        let new_ids = op.new_segment_ids();
        for id in &op.sealed_segments {
            if let Some(segment) = self.segments.get_mut(id) {
                segment.sealed_at = Some(op.scale_timestamp);
                segment.successors = op
                    .new_segments
                    .iter()
                    .filter(|n| n.key_range.overlaps(&segment.key_range))
                    .map(|n| n.id)
                    .collect();
            }
        }
        for segment in &op.new_segments {
            self.segments.insert(segment.id, segment.clone());
        }

        let sealed: BTreeSet<_> = op.sealed_segments.iter().collect();
        let mut active: Vec<SegmentId> = self
            .current_epoch()
            .segments
            .iter()
            .filter(|id| !sealed.contains(id))
            .copied()
            .collect();
        active.extend(new_ids);
        let epoch = EpochRecord::new(
            op.target_epoch(),
            active,
            op.scale_timestamp,
            Some(request_id),
        );
        self.epochs.push(epoch.clone());

        self.scale = None;
        self.last_scale = Some(ScaleOperation {
            resume_point: ResumePoint::Committed,
            ..op
        });
        Ok((epoch, true))
    }

    fn committed_epoch(&self, request_id: Uuid) -> Option<&EpochRecord> {
        self.epochs
            .iter()
            .rev()
            .find(|e| e.scale_request == Some(request_id))
    }

    fn not_in_progress(&self, request_id: Uuid) -> Error {
        Error::precondition(format!(
            "scale {request_id} is not in progress on stream {}",
            self.stream()
        ))
    }

    /// Enter SEALING; returns `false` if the stream is already sealing or sealed
    pub fn begin_seal(&mut self) -> Result<bool> {
        match self.state {
            state if state.is_terminating() => Ok(false),
            StreamState::Scaling => Err(self.in_progress_error()),
            _ => {
                self.transition(StreamState::Sealing)?;
                Ok(true)
            }
        }
    }

    /// Commit SEALED, sealing every active segment.
    ///
    /// Returns `false` if the stream was already sealed.
    pub fn seal(&mut self, sealed_at: u64) -> Result<bool> {
        if self.is_sealed() {
            return Ok(false);
        }
        self.transition(StreamState::Sealed)?;
        let active = self.current_epoch().segments.clone();
        for id in active {
            if let Some(segment) = self.segments.get_mut(&id) {
                segment.sealed_at.get_or_insert(sealed_at);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::ScalingPolicy;
    use crate::segment::covers_key_space;

    fn r(low: f64, high: f64) -> KeyRange {
        KeyRange::new(low, high).unwrap()
    }

    fn active_stream(policy: ScalingPolicy) -> StreamRecord {
        let config = StreamConfiguration::new(ScopedStream::new("scope", "stream1").unwrap(), policy);
        let mut record = StreamRecord::new(config, 1).unwrap();
        record.transition(StreamState::Active).unwrap();
        record
    }

    fn request(sealed: Vec<SegmentId>, ranges: Vec<KeyRange>) -> ScaleRequest {
        ScaleRequest {
            request_id: Uuid::new_v4(),
            sealed_segments: sealed,
            new_ranges: ranges,
            scale_timestamp: 100,
            origin: ScaleOrigin::Manual,
            expected_epoch: None,
        }
    }

    fn current_ranges(record: &StreamRecord) -> Vec<KeyRange> {
        record
            .current_segments()
            .into_iter()
            .map(|s| s.key_range)
            .collect()
    }

    fn run_scale(record: &mut StreamRecord, req: &ScaleRequest) -> EpochRecord {
        record.start_scale(req, "host").unwrap();
        record.scale_new_segments_created(req.request_id).unwrap();
        record.scale_segments_sealed(req.request_id).unwrap().0
    }

    #[test]
    fn test_new_stream_layout() {
        let record = active_stream(ScalingPolicy::Fixed(2));
        assert_eq!(record.active_epoch(), 0);
        let segments = record.current_segments();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].id.as_u64(), 0);
        assert_eq!(segments[1].id.as_u64(), 1);
        assert_eq!(segments[1].key_range, r(0.5, 1.0));
        assert!(covers_key_space(&current_ranges(&record)));
    }

    #[test]
    fn test_split_commits_new_epoch() {
        let mut record = active_stream(ScalingPolicy::Fixed(2));
        let one = SegmentId::new(0, 1);
        let req = request(vec![one], vec![r(0.5, 0.75), r(0.75, 1.0)]);

        let op = record.start_scale(&req, "host").unwrap();
        assert_eq!(record.state(), StreamState::Scaling);
        assert_eq!(op.active_epoch, 0);
        assert_eq!(
            op.new_segment_ids(),
            vec![SegmentId::new(1, 2), SegmentId::new(1, 3)]
        );
        // Nothing visible to readers yet
        assert_eq!(record.current_segments().len(), 2);

        // Commit needs provisioning first
        assert!(record.scale_segments_sealed(req.request_id).is_err());
        assert!(record.scale_new_segments_created(req.request_id).unwrap());
        assert!(!record.scale_new_segments_created(req.request_id).unwrap());

        let (epoch, changed) = record.scale_segments_sealed(req.request_id).unwrap();
        assert!(changed);
        assert_eq!(epoch.epoch, 1);
        assert_eq!(record.state(), StreamState::Active);
        assert_eq!(record.current_segments().len(), 3);
        assert!(covers_key_space(&current_ranges(&record)));

        let old = record.segment(one).unwrap();
        assert_eq!(old.sealed_at, Some(100));
        let successors: Vec<_> = record.successors(one).unwrap().iter().map(|s| s.id).collect();
        assert_eq!(successors, vec![SegmentId::new(1, 2), SegmentId::new(1, 3)]);
        let preds = record.predecessors(SegmentId::new(1, 3)).unwrap();
        assert_eq!(preds.len(), 1);
        assert_eq!(preds[0].id, one);
    }

    #[test]
    fn test_commit_is_idempotent() {
        let mut record = active_stream(ScalingPolicy::Fixed(2));
        let req = request(vec![SegmentId::new(0, 0)], vec![r(0.0, 0.25), r(0.25, 0.5)]);
        let first = run_scale(&mut record, &req);

        let (again, changed) = record.scale_segments_sealed(req.request_id).unwrap();
        assert!(!changed);
        assert_eq!(first, again);
        assert!(!record.scale_new_segments_created(req.request_id).unwrap());
        assert_eq!(record.epochs().len(), 2);

        // Re-proposing the committed request returns the committed operation
        let op = record.start_scale(&req, "host").unwrap();
        assert_eq!(op.resume_point, ResumePoint::Committed);
        assert_eq!(record.state(), StreamState::Active);
    }

    #[test]
    fn test_ids_increase_across_epochs() {
        let mut record = active_stream(ScalingPolicy::Fixed(1));
        let e1 = run_scale(
            &mut record,
            &request(vec![SegmentId::new(0, 0)], vec![r(0.0, 0.5), r(0.5, 1.0)]),
        );
        let e2 = run_scale(
            &mut record,
            &request(e1.segments.clone(), vec![r(0.0, 1.0)]),
        );

        let mut last = None;
        for epoch in record.epochs() {
            for id in &epoch.segments {
                if id.epoch() == epoch.epoch {
                    assert!(last.is_none_or(|prev| *id > prev));
                    last = Some(*id);
                }
            }
        }
        assert_eq!(e2.segments, vec![SegmentId::new(2, 3)]);
        assert!(covers_key_space(&current_ranges(&record)));
    }

    #[test]
    fn test_second_request_conflicts() {
        let mut record = active_stream(ScalingPolicy::Fixed(2));
        let first = request(vec![SegmentId::new(0, 0)], vec![r(0.0, 0.5)]);
        let second = request(vec![SegmentId::new(0, 1)], vec![r(0.5, 1.0)]);

        record.start_scale(&first, "a").unwrap();
        let err = record.start_scale(&second, "b").unwrap_err();
        assert!(matches!(err, Error::ScaleInProgress { .. }));
        // Same request again is fine
        assert_eq!(
            record.start_scale(&first, "a").unwrap().request_id,
            first.request_id
        );
    }

    #[test]
    fn test_rejections_leave_record_unchanged() {
        let mut record = active_stream(ScalingPolicy::Fixed(2));
        let before = record.clone();

        let gap = request(
            vec![SegmentId::new(0, 0)],
            vec![r(0.0, 0.2), r(0.3, 0.4), r(0.4, 0.5)],
        );
        assert!(matches!(
            record.start_scale(&gap, "h").unwrap_err(),
            Error::InvalidKeyRanges(_)
        ));

        let unknown = request(vec![SegmentId::new(0, 9)], vec![r(0.0, 0.5)]);
        assert!(matches!(
            record.start_scale(&unknown, "h").unwrap_err(),
            Error::SegmentNotFound(_)
        ));

        let mut stale = request(vec![SegmentId::new(0, 0)], vec![r(0.0, 0.5)]);
        stale.expected_epoch = Some(3);
        assert!(matches!(
            record.start_scale(&stale, "h").unwrap_err(),
            Error::PreconditionFailed(_)
        ));

        assert_eq!(record, before);
    }

    #[test]
    fn test_sealed_segment_is_stale() {
        let mut record = active_stream(ScalingPolicy::Fixed(2));
        run_scale(
            &mut record,
            &request(vec![SegmentId::new(0, 1)], vec![r(0.5, 0.75), r(0.75, 1.0)]),
        );
        let err = record
            .start_scale(
                &request(vec![SegmentId::new(0, 1)], vec![r(0.5, 1.0)]),
                "h",
            )
            .unwrap_err();
        assert!(matches!(err, Error::PreconditionFailed(_)));
    }

    #[test]
    fn test_auto_scale_policy_checks() {
        let mut fixed = active_stream(ScalingPolicy::Fixed(2));
        let mut req = request(vec![SegmentId::new(0, 0)], vec![r(0.0, 0.25), r(0.25, 0.5)]);
        req.origin = ScaleOrigin::Auto;
        assert!(matches!(
            fixed.start_scale(&req, "h").unwrap_err(),
            Error::InvalidArgument(_)
        ));

        let mut rate = active_stream(ScalingPolicy::ByEventRate {
            target_rate: 10,
            scale_factor: 2,
            min_segments: 2,
        });
        let mut merge = request(
            vec![SegmentId::new(0, 0), SegmentId::new(0, 1)],
            vec![r(0.0, 1.0)],
        );
        merge.origin = ScaleOrigin::Auto;
        assert!(rate.start_scale(&merge, "h").is_err());
        assert!(rate.start_scale(&req, "h").is_ok());
    }

    #[test]
    fn test_seal_lifecycle() {
        let mut record = active_stream(ScalingPolicy::Fixed(2));
        assert!(record.begin_seal().unwrap());
        assert!(!record.begin_seal().unwrap());
        assert!(record.seal(500).unwrap());
        assert!(!record.seal(600).unwrap());

        assert!(record.is_sealed());
        assert!(record.current_segments().is_empty());
        assert_eq!(record.segment(SegmentId::new(0, 0)).unwrap().sealed_at, Some(500));

        let err = record
            .start_scale(
                &request(vec![SegmentId::new(0, 0)], vec![r(0.0, 0.5)]),
                "h",
            )
            .unwrap_err();
        assert!(matches!(err, Error::StreamSealed { .. }));
    }

    #[test]
    fn test_seal_waits_for_scale() {
        let mut record = active_stream(ScalingPolicy::Fixed(2));
        record
            .start_scale(
                &request(vec![SegmentId::new(0, 0)], vec![r(0.0, 0.5)]),
                "h",
            )
            .unwrap();
        assert!(matches!(
            record.begin_seal().unwrap_err(),
            Error::ScaleInProgress { .. }
        ));
        assert!(record.seal(1).is_err());
    }
}
