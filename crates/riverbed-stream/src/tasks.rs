//! Scale task orchestrator.
//!
//! Public entry points of the controller: stream creation, sealing, manual
//! and automatic scaling, and scale status queries. Store outages are
//! retried here with capped exponential backoff; rejections are translated
//! into status codes instead of errors.

use crate::collaborators::{SegmentProvisioner, TransactionStatus};
use crate::coordinator::ScaleCoordinator;
use crate::epoch::EpochRecord;
use crate::events::{ScaleEvent, ScaleEventWriter};
use crate::metrics::ScaleMetrics;
use crate::policy::StreamConfiguration;
use crate::record::{ResumePoint, ScaleOperation, ScaleOrigin, ScaleRequest, StreamRecord};
use crate::segment::{KeyRange, Segment};
use crate::state::StreamState;
use crate::status::{CheckScaleStatus, ScaleResponse, ScaleStatus, UpdateStreamStatus};
use crate::store::StreamMetadataStore;
use parking_lot::RwLock;
use rand::Rng;
use riverbed_common::config::ScaleConfig;
use riverbed_common::{Error, ErrorKind, Result, ScopedStream, SegmentId};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Status for a proposal the coordinator turned down, or the error itself
/// when it is not a rejection
fn rejection_status(e: Error) -> Result<ScaleStatus> {
    match e.kind() {
        ErrorKind::Precondition => Ok(ScaleStatus::PreconditionFailed),
        ErrorKind::Conflict => Ok(ScaleStatus::Failure),
        ErrorKind::Validation if !e.is_not_found() => Ok(ScaleStatus::Failure),
        ErrorKind::IllegalState if matches!(e, Error::StreamSealed { .. }) => {
            Ok(ScaleStatus::Failure)
        }
        _ => Err(e),
    }
}

/// Orchestrates stream lifecycle and scale workflows
pub struct StreamMetadataTasks {
    store: Arc<StreamMetadataStore>,
    coordinator: ScaleCoordinator,
    transactions: Arc<dyn TransactionStatus>,
    provisioner: Arc<dyn SegmentProvisioner>,
    event_writer: RwLock<Option<Arc<dyn ScaleEventWriter>>>,
    config: ScaleConfig,
    metrics: ScaleMetrics,
}

impl StreamMetadataTasks {
    pub fn new(
        store: Arc<StreamMetadataStore>,
        transactions: Arc<dyn TransactionStatus>,
        provisioner: Arc<dyn SegmentProvisioner>,
        config: ScaleConfig,
        host_id: impl Into<String>,
    ) -> Self {
        let coordinator = ScaleCoordinator::new(Arc::clone(&store), host_id);
        Self {
            store,
            coordinator,
            transactions,
            provisioner,
            event_writer: RwLock::new(None),
            config,
            metrics: ScaleMetrics::new(),
        }
    }

    /// Register the channel manual scale requests are posted to
    pub fn set_request_event_writer(&self, writer: Arc<dyn ScaleEventWriter>) {
        *self.event_writer.write() = Some(writer);
        info!("Scale event channel registered");
    }

    #[must_use]
    pub const fn metrics(&self) -> &ScaleMetrics {
        &self.metrics
    }

    #[must_use]
    pub const fn config(&self) -> &ScaleConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &Arc<StreamMetadataStore> {
        &self.store
    }

    /// Run `op`, retrying store outages with jittered exponential backoff
    async fn with_retries<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match op().await {
                Err(e) if e.is_retryable() && attempt + 1 < max_attempts => {
                    let backoff = self.config.backoff(attempt);
                    let jitter_cap = u64::try_from(backoff.as_millis() / 4).unwrap_or(0);
                    let jitter = rand::thread_rng().gen_range(0..=jitter_cap);
                    let delay = backoff + Duration::from_millis(jitter);
                    warn!(
                        "{} failed (attempt {}/{}), retrying in {:?}: {}",
                        what,
                        attempt + 1,
                        max_attempts,
                        delay,
                        e
                    );
                    self.metrics.record_retry();
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    // Scopes and streams

    pub async fn create_scope(&self, scope: &str) -> Result<()> {
        self.store.create_scope(scope, now_millis()).await
    }

    /// Create a stream, provision its epoch 0 segments and activate it
    pub async fn create_stream(&self, configuration: StreamConfiguration) -> Result<StreamRecord> {
        let stream = configuration.stream.clone();
        let record = self
            .store
            .create_stream(configuration, now_millis())
            .await?;
        self.activate(&stream, &record).await?;
        self.metrics.record_stream_created();
        self.store.get_stream(stream.scope(), stream.stream()).await
    }

    /// CREATING -> ACTIVE once the initial segments exist
    async fn activate(&self, stream: &ScopedStream, record: &StreamRecord) -> Result<()> {
        let segments = record.current_segments();
        self.with_retries("create initial segments", || {
            self.provisioner.create_segments(stream, &segments)
        })
        .await?;
        self.with_retries("activate stream", || {
            self.store.compare_and_set_state(
                stream.scope(),
                stream.stream(),
                StreamState::Creating,
                StreamState::Active,
            )
        })
        .await?;
        info!("Stream {} is active", stream);
        Ok(())
    }

    pub async fn get_current_segments(&self, scope: &str, stream: &str) -> Result<Vec<Segment>> {
        self.with_retries("read current segments", || {
            self.store.get_current_segments(scope, stream)
        })
        .await
    }

    // Sealing

    /// Whether no transaction is open on `epoch`, waiting with backoff for
    /// up to `seal_txn_wait_attempts` polls
    async fn transactions_drained(&self, scope: &str, stream: &str, epoch: u32) -> Result<bool> {
        let polls = self.config.seal_txn_wait_attempts;
        for attempt in 0..=polls {
            if !self
                .transactions
                .is_transaction_ongoing(scope, stream, epoch)
                .await?
            {
                return Ok(true);
            }
            if attempt < polls {
                debug!(
                    "Transactions still open on {}/{} epoch {}, waiting",
                    scope, stream, epoch
                );
                tokio::time::sleep(self.config.backoff(attempt)).await;
            }
        }
        Ok(false)
    }

    /// Seal a stream. Idempotent; open transactions on the active epoch
    /// block the seal with `TxnConflict` both before and after the
    /// segments are sealed.
    pub async fn seal_stream(&self, scope: &str, stream: &str) -> Result<UpdateStreamStatus> {
        let status = self.seal_stream_inner(scope, stream).await?;
        self.metrics.record_seal(status);
        Ok(status)
    }

    async fn seal_stream_inner(&self, scope: &str, stream: &str) -> Result<UpdateStreamStatus> {
        let record = match self
            .with_retries("read stream", || self.store.get_stream(scope, stream))
            .await
        {
            Ok(record) => record,
            Err(Error::ScopeNotFound(_)) => return Ok(UpdateStreamStatus::ScopeNotFound),
            Err(Error::StreamNotFound { .. }) => return Ok(UpdateStreamStatus::StreamNotFound),
            Err(e) => return Err(e),
        };
        if record.is_sealed() {
            debug!("Stream {}/{} already sealed", scope, stream);
            return Ok(UpdateStreamStatus::Success);
        }
        if !self
            .transactions_drained(scope, stream, record.active_epoch())
            .await?
        {
            warn!(
                "Seal of {}/{} blocked by open transactions on epoch {}",
                scope,
                stream,
                record.active_epoch()
            );
            return Ok(UpdateStreamStatus::TxnConflict);
        }

        if !self.enter_sealing(scope, stream).await? {
            return Ok(UpdateStreamStatus::Failure);
        }

        // The active epoch cannot move once SEALING is persisted
        let record = self
            .with_retries("read stream", || self.store.get_stream(scope, stream))
            .await?;
        let active = record.current_epoch().segments.clone();
        self.with_retries("seal segments", || {
            self.provisioner.seal_segments(record.stream(), &active)
        })
        .await?;

        if !self
            .transactions_drained(scope, stream, record.active_epoch())
            .await?
        {
            warn!(
                "Transaction opened on {}/{} while sealing, leaving it in SEALING",
                scope, stream
            );
            return Ok(UpdateStreamStatus::TxnConflict);
        }

        self.with_retries("commit seal", || self.store.seal(scope, stream, now_millis()))
            .await?;
        info!("Sealed stream {}/{}", scope, stream);
        Ok(UpdateStreamStatus::Success)
    }

    /// Move the stream to SEALING, waiting out a scale in progress.
    /// `false` when the stream cannot be sealed from its current state.
    async fn enter_sealing(&self, scope: &str, stream: &str) -> Result<bool> {
        let max_attempts = self.config.max_attempts.max(1);
        for attempt in 0..max_attempts {
            match self
                .with_retries("begin seal", || self.store.begin_seal(scope, stream))
                .await
            {
                Ok(_) => return Ok(true),
                Err(Error::ScaleInProgress { .. }) if attempt + 1 < max_attempts => {
                    debug!("Seal of {}/{} waiting for a scale to finish", scope, stream);
                    tokio::time::sleep(self.config.backoff(attempt)).await;
                }
                Err(e) if matches!(e.kind(), ErrorKind::Conflict | ErrorKind::IllegalState) => {
                    warn!("Cannot seal {}/{}: {}", scope, stream, e);
                    return Ok(false);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(false)
    }

    // Scaling

    /// Propose a manual scale, then post it to the event channel.
    ///
    /// Answers `Started` with the proposed segments; the event processor
    /// completes the scale. A rejected proposal is never queued. Fails with
    /// `ScaleRequestNotEnabled` when no event channel is registered.
    pub async fn manual_scale(
        &self,
        scope: &str,
        stream: &str,
        sealed_segments: Vec<SegmentId>,
        new_ranges: Vec<KeyRange>,
        scale_timestamp: u64,
    ) -> Result<ScaleResponse> {
        let writer = self.event_writer.read().clone().ok_or_else(|| {
            Error::ScaleRequestNotEnabled(format!("no event channel for {scope}/{stream}"))
        })?;
        let event = ScaleEvent {
            request_id: Uuid::new_v4(),
            scope: scope.to_string(),
            stream: stream.to_string(),
            sealed_segments,
            new_ranges,
            scale_timestamp,
            origin: ScaleOrigin::Manual,
        };
        let request = event.to_request();

        let response = match self
            .with_retries("propose scale", || {
                self.coordinator.propose(scope, stream, &request)
            })
            .await
        {
            Ok(op) => {
                // The persisted proposal is resumed at startup if this post is lost
                if let Err(e) = writer.write_event(event).await {
                    warn!(
                        "Scale {} on {}/{} proposed but not queued: {}",
                        request.request_id, scope, stream, e
                    );
                    return Err(e);
                }
                ScaleResponse {
                    status: ScaleStatus::Started,
                    segments_created: op.new_segments,
                    epoch: op.active_epoch,
                }
            }
            Err(e) => ScaleResponse::rejected(rejection_status(e)?),
        };
        self.metrics.record_scale(response.status);
        Ok(response)
    }

    /// Run a policy-driven scale to completion
    pub async fn auto_scale(
        &self,
        scope: &str,
        stream: &str,
        sealed_segments: Vec<SegmentId>,
        new_ranges: Vec<KeyRange>,
        scale_timestamp: u64,
    ) -> Result<ScaleResponse> {
        let request = ScaleRequest {
            request_id: Uuid::new_v4(),
            sealed_segments,
            new_ranges,
            scale_timestamp,
            origin: ScaleOrigin::Auto,
            expected_epoch: None,
        };
        let response = self.execute(scope, stream, &request).await?;
        self.metrics.record_scale(response.status);
        Ok(response)
    }

    /// Drive a queued scale to completion; safe to call repeatedly.
    ///
    /// Manual events only resume a scale that was already proposed under
    /// the same request id; anything else is answered with `Failure`.
    pub async fn process_scale_event(&self, event: &ScaleEvent) -> Result<ScaleResponse> {
        match event.origin {
            ScaleOrigin::Manual => self.resume_started(event).await,
            ScaleOrigin::Auto => {
                self.execute(&event.scope, &event.stream, &event.to_request())
                    .await
            }
        }
    }

    async fn resume_started(&self, event: &ScaleEvent) -> Result<ScaleResponse> {
        let (scope, stream) = (event.scope.as_str(), event.stream.as_str());
        let record = self
            .with_retries("read stream", || self.store.get_stream(scope, stream))
            .await?;

        if let Some(op) = record
            .pending_scale()
            .filter(|op| op.request_id == event.request_id)
        {
            self.run_workflow(record.stream(), op).await?;
            return Ok(ScaleResponse {
                status: ScaleStatus::Success,
                segments_created: op.new_segments.clone(),
                epoch: op.active_epoch,
            });
        }
        if let Some(op) = record
            .last_scale()
            .filter(|op| op.request_id == event.request_id)
        {
            return Ok(ScaleResponse {
                status: ScaleStatus::Success,
                segments_created: op.new_segments.clone(),
                epoch: op.active_epoch,
            });
        }
        if let Some(epoch) = record
            .epochs()
            .iter()
            .find(|e| e.scale_request == Some(event.request_id))
        {
            return Ok(ScaleResponse {
                status: ScaleStatus::Success,
                segments_created: Vec::new(),
                epoch: epoch.epoch.saturating_sub(1),
            });
        }

        debug!(
            "Skipping scale {} on {}/{}: it was never started",
            event.request_id, scope, stream
        );
        Ok(ScaleResponse::rejected(ScaleStatus::Failure))
    }

    async fn execute(
        &self,
        scope: &str,
        stream: &str,
        request: &ScaleRequest,
    ) -> Result<ScaleResponse> {
        let op = match self
            .with_retries("propose scale", || {
                self.coordinator.propose(scope, stream, request)
            })
            .await
        {
            Ok(op) => op,
            Err(e) => return Ok(ScaleResponse::rejected(rejection_status(e)?)),
        };
        let target = ScopedStream::new_unchecked(scope, stream);
        self.run_workflow(&target, &op).await?;
        Ok(ScaleResponse {
            status: ScaleStatus::Success,
            segments_created: op.new_segments,
            epoch: op.active_epoch,
        })
    }

    /// Provision and commit a proposed scale. Every step is idempotent, so
    /// this resumes a scale interrupted at any point.
    async fn run_workflow(&self, stream: &ScopedStream, op: &ScaleOperation) -> Result<EpochRecord> {
        let (scope, name) = (stream.scope(), stream.stream());
        if op.resume_point == ResumePoint::Committed {
            return self.store.get_epoch(scope, name, op.target_epoch()).await;
        }
        self.with_retries("create segments", || {
            self.provisioner.create_segments(stream, &op.new_segments)
        })
        .await?;
        self.with_retries("provision scale", || {
            self.coordinator.provision(scope, name, op.request_id)
        })
        .await?;
        self.with_retries("seal segments", || {
            self.provisioner.seal_segments(stream, &op.sealed_segments)
        })
        .await?;
        let epoch = self
            .with_retries("commit scale", || {
                self.coordinator.commit(scope, name, op.request_id)
            })
            .await?;
        self.metrics.record_commit();
        Ok(epoch)
    }

    pub async fn check_scale(
        &self,
        scope: &str,
        stream: &str,
        epoch: u32,
    ) -> Result<CheckScaleStatus> {
        self.with_retries("check scale", || {
            self.coordinator.check_scale(scope, stream, epoch)
        })
        .await
    }

    // Recovery

    /// Finish every stream left mid-creation, mid-scale or mid-seal.
    /// Returns how many streams were resumed.
    pub async fn resume_pending_scales(&self) -> Result<usize> {
        let mut resumed = 0;
        for scope in self.store.list_scopes().await? {
            for record in self.store.list_streams(&scope).await? {
                let stream = record.stream().clone();
                let outcome = match record.state() {
                    StreamState::Creating => self.activate(&stream, &record).await,
                    StreamState::Scaling => match record.pending_scale() {
                        Some(op) => {
                            info!(
                                "Resuming scale {} on {} from {:?}",
                                op.request_id, stream, op.resume_point
                            );
                            self.run_workflow(&stream, op).await.map(|_| ())
                        }
                        None => Err(Error::internal(format!(
                            "stream {stream} is scaling without a scale operation"
                        ))),
                    },
                    StreamState::Sealing => self
                        .seal_stream(stream.scope(), stream.stream())
                        .await
                        .map(|status| debug!("Resumed seal of {} with {:?}", stream, status)),
                    StreamState::Active | StreamState::Sealed => continue,
                };
                match outcome {
                    Ok(()) => {
                        resumed += 1;
                        self.metrics.record_resumed();
                    }
                    Err(e) => error!("Failed to resume {}: {}", stream, e),
                }
            }
        }
        if resumed > 0 {
            info!("Resumed {} pending stream operation(s)", resumed);
        }
        Ok(resumed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{ContainerProvisioner, NoTransactions, TransactionTracker};
    use crate::events::ChannelEventWriter;
    use crate::policy::ScalingPolicy;
    use riverbed_common::config::ContainerConfig;
    use riverbed_container::ContainerDirectory;
    use riverbed_meta_store::MemoryKvStore;
    use std::ops::RangeInclusive;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn r(low: f64, high: f64) -> KeyRange {
        KeyRange::new(low, high).unwrap()
    }

    fn fast_config() -> ScaleConfig {
        ScaleConfig {
            max_attempts: 5,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            backoff_multiplier: 2,
            seal_txn_wait_attempts: 2,
            event_queue_capacity: 16,
        }
    }

    struct Harness {
        tasks: StreamMetadataTasks,
        kv: Arc<MemoryKvStore>,
        _dir: tempfile::TempDir,
    }

    fn harness(transactions: Arc<dyn TransactionStatus>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config = ContainerConfig {
            container_count: 2,
            log_dir: dir.path().to_path_buf(),
            sync_on_write: false,
            checkpoint_every_ops: 0,
        };
        let containers = (0..2)
            .map(|id| Arc::new(ContainerDirectory::open(id, &config).unwrap()))
            .collect();
        let kv = Arc::new(MemoryKvStore::new());
        let store = Arc::new(StreamMetadataStore::new(Arc::clone(&kv) as _));
        let tasks = StreamMetadataTasks::new(
            store,
            transactions,
            Arc::new(ContainerProvisioner::new(containers)),
            fast_config(),
            "host-1",
        );
        Harness {
            tasks,
            kv,
            _dir: dir,
        }
    }

    async fn create(tasks: &StreamMetadataTasks, policy: ScalingPolicy) {
        tasks.create_scope("scope").await.unwrap();
        tasks
            .create_stream(StreamConfiguration::new(
                ScopedStream::new("scope", "stream1").unwrap(),
                policy,
            ))
            .await
            .unwrap();
    }

    fn merge_sealed() -> Vec<SegmentId> {
        vec![SegmentId::new(0, 0), SegmentId::new(0, 1)]
    }

    #[tokio::test]
    async fn test_create_stream_activates() {
        let h = harness(Arc::new(NoTransactions));
        create(&h.tasks, ScalingPolicy::Fixed(3)).await;
        let store = h.tasks.store();
        assert_eq!(
            store.get_state("scope", "stream1").await.unwrap(),
            StreamState::Active
        );
        assert_eq!(
            h.tasks
                .get_current_segments("scope", "stream1")
                .await
                .unwrap()
                .len(),
            3
        );
    }

    #[tokio::test]
    async fn test_seal_stream() {
        let h = harness(Arc::new(NoTransactions));
        create(&h.tasks, ScalingPolicy::Fixed(2)).await;
        let (writer, _rx) = ChannelEventWriter::new(16);
        h.tasks.set_request_event_writer(Arc::new(writer));

        assert_eq!(
            h.tasks
                .get_current_segments("scope", "stream1")
                .await
                .unwrap()
                .len(),
            2
        );
        assert_eq!(
            h.tasks.seal_stream("scope", "stream1").await.unwrap(),
            UpdateStreamStatus::Success
        );
        assert!(
            h.tasks
                .get_current_segments("scope", "stream1")
                .await
                .unwrap()
                .is_empty()
        );
        assert_eq!(
            h.tasks.seal_stream("scope", "stream1").await.unwrap(),
            UpdateStreamStatus::Success
        );

        let response = h
            .tasks
            .manual_scale(
                "scope",
                "stream1",
                merge_sealed(),
                vec![r(0.0, 0.2), r(0.3, 0.4), r(0.4, 0.5)],
                10,
            )
            .await
            .unwrap();
        assert_eq!(response.status, ScaleStatus::Failure);
        assert!(h.tasks.store().is_sealed("scope", "stream1").await.unwrap());
        assert!(
            h.tasks
                .get_current_segments("scope", "stream1")
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_seal_unknown_stream() {
        let h = harness(Arc::new(NoTransactions));
        assert_eq!(
            h.tasks.seal_stream("missing", "stream1").await.unwrap(),
            UpdateStreamStatus::ScopeNotFound
        );
        h.tasks.create_scope("scope").await.unwrap();
        assert_eq!(
            h.tasks.seal_stream("scope", "missing").await.unwrap(),
            UpdateStreamStatus::StreamNotFound
        );
    }

    #[tokio::test]
    async fn test_manual_scale_requires_event_channel() {
        let h = harness(Arc::new(NoTransactions));
        create(&h.tasks, ScalingPolicy::Fixed(2)).await;

        let err = h
            .tasks
            .manual_scale(
                "scope",
                "stream1",
                vec![SegmentId::new(0, 0)],
                vec![r(0.0, 0.25), r(0.25, 0.5)],
                10,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ScaleRequestNotEnabled(_)));

        let (writer, mut rx) = ChannelEventWriter::new(16);
        h.tasks.set_request_event_writer(Arc::new(writer));
        let response = h
            .tasks
            .manual_scale(
                "scope",
                "stream1",
                vec![SegmentId::new(0, 0)],
                vec![r(0.0, 0.25), r(0.25, 0.5)],
                10,
            )
            .await
            .unwrap();
        assert_eq!(response.status, ScaleStatus::Started);
        assert_eq!(response.epoch, 0);
        assert_eq!(response.segments_created.len(), 2);

        assert_eq!(
            h.tasks.check_scale("scope", "stream1", 5).await.unwrap(),
            CheckScaleStatus::InvalidInput
        );
        assert_eq!(
            h.tasks.check_scale("scope", "unknown", 0).await.unwrap(),
            CheckScaleStatus::InvalidInput
        );
        assert_eq!(
            h.tasks.check_scale("unknown", "stream1", 0).await.unwrap(),
            CheckScaleStatus::InvalidInput
        );
        assert_eq!(
            h.tasks.check_scale("scope", "stream1", 0).await.unwrap(),
            CheckScaleStatus::InProgress
        );

        let event = rx.recv().await.unwrap();
        let done = h.tasks.process_scale_event(&event).await.unwrap();
        assert_eq!(done.status, ScaleStatus::Success);
        assert_eq!(done.segments_created, response.segments_created);
        assert_eq!(
            h.tasks.check_scale("scope", "stream1", 0).await.unwrap(),
            CheckScaleStatus::Success
        );
        assert_eq!(
            h.tasks
                .get_current_segments("scope", "stream1")
                .await
                .unwrap()
                .len(),
            3
        );

        // Redelivery of a committed event changes nothing
        let again = h.tasks.process_scale_event(&event).await.unwrap();
        assert_eq!(again.status, ScaleStatus::Success);
        assert_eq!(
            h.tasks
                .store()
                .get_active_epoch("scope", "stream1")
                .await
                .unwrap()
                .epoch,
            1
        );
    }

    #[tokio::test]
    async fn test_conflicting_manual_scale_fails() {
        let h = harness(Arc::new(NoTransactions));
        create(&h.tasks, ScalingPolicy::Fixed(2)).await;
        let (writer, _rx) = ChannelEventWriter::new(16);
        h.tasks.set_request_event_writer(Arc::new(writer));

        let first = h
            .tasks
            .manual_scale("scope", "stream1", merge_sealed(), vec![KeyRange::full()], 10)
            .await
            .unwrap();
        assert_eq!(first.status, ScaleStatus::Started);

        let second = h
            .tasks
            .manual_scale(
                "scope",
                "stream1",
                vec![SegmentId::new(0, 1)],
                vec![r(0.5, 0.75), r(0.75, 1.0)],
                11,
            )
            .await
            .unwrap();
        assert_eq!(second.status, ScaleStatus::Failure);
        assert_eq!(h.tasks.metrics().scale_count(ScaleStatus::Started), 1);
        assert_eq!(h.tasks.metrics().scale_count(ScaleStatus::Failure), 1);
    }

    #[tokio::test]
    async fn test_seal_blocked_by_transaction() {
        let tracker = Arc::new(TransactionTracker::new());
        let h = harness(Arc::clone(&tracker) as _);
        create(&h.tasks, ScalingPolicy::Fixed(2)).await;

        tracker.begin("scope", "stream1", 0);
        assert_eq!(
            h.tasks.seal_stream("scope", "stream1").await.unwrap(),
            UpdateStreamStatus::TxnConflict
        );
        assert_eq!(
            h.tasks
                .store()
                .get_state("scope", "stream1")
                .await
                .unwrap(),
            StreamState::Active
        );

        tracker.end("scope", "stream1", 0);
        assert_eq!(
            h.tasks.seal_stream("scope", "stream1").await.unwrap(),
            UpdateStreamStatus::Success
        );
    }

    #[tokio::test]
    async fn test_auto_scale_respects_policy() {
        let h = harness(Arc::new(NoTransactions));
        create(&h.tasks, ScalingPolicy::Fixed(2)).await;
        let response = h
            .tasks
            .auto_scale(
                "scope",
                "stream1",
                vec![SegmentId::new(0, 0)],
                vec![r(0.0, 0.25), r(0.25, 0.5)],
                10,
            )
            .await
            .unwrap();
        assert_eq!(response.status, ScaleStatus::Failure);
        assert_eq!(
            h.tasks
                .store()
                .get_state("scope", "stream1")
                .await
                .unwrap(),
            StreamState::Active
        );
    }

    #[tokio::test]
    async fn test_auto_scale_retries_store_outage() {
        let h = harness(Arc::new(NoTransactions));
        create(
            &h.tasks,
            ScalingPolicy::ByEventRate {
                target_rate: 100,
                scale_factor: 2,
                min_segments: 2,
            },
        )
        .await;

        h.kv.fail_next(2);
        let response = h
            .tasks
            .auto_scale(
                "scope",
                "stream1",
                vec![SegmentId::new(0, 0)],
                vec![r(0.0, 0.25), r(0.25, 0.5)],
                10,
            )
            .await
            .unwrap();
        assert_eq!(response.status, ScaleStatus::Success);
        assert_eq!(h.tasks.metrics().retries(), 2);
        assert_eq!(h.tasks.metrics().commits(), 1);

        let segments = h
            .tasks
            .get_current_segments("scope", "stream1")
            .await
            .unwrap();
        let ids: Vec<_> = segments.iter().map(|s| s.id).collect();
        assert_eq!(
            ids,
            vec![SegmentId::new(0, 1), SegmentId::new(1, 2), SegmentId::new(1, 3)]
        );
    }

    #[tokio::test]
    async fn test_resume_pending_scales() {
        let h = harness(Arc::new(NoTransactions));
        create(&h.tasks, ScalingPolicy::Fixed(2)).await;
        let store = Arc::clone(h.tasks.store());

        // A proposal whose controller died before provisioning
        let request = ScaleRequest {
            request_id: Uuid::new_v4(),
            sealed_segments: merge_sealed(),
            new_ranges: vec![KeyRange::full()],
            scale_timestamp: 10,
            origin: ScaleOrigin::Manual,
            expected_epoch: None,
        };
        store
            .start_scale("scope", "stream1", &request, "host-0")
            .await
            .unwrap();

        // A stream created but never activated
        store
            .create_stream(
                StreamConfiguration::new(
                    ScopedStream::new("scope", "stream2").unwrap(),
                    ScalingPolicy::Fixed(1),
                ),
                0,
            )
            .await
            .unwrap();

        assert_eq!(h.tasks.resume_pending_scales().await.unwrap(), 2);
        assert_eq!(
            store.get_state("scope", "stream1").await.unwrap(),
            StreamState::Active
        );
        assert_eq!(
            store.get_active_epoch("scope", "stream1").await.unwrap().epoch,
            1
        );
        assert_eq!(
            store.get_state("scope", "stream2").await.unwrap(),
            StreamState::Active
        );
        assert_eq!(h.tasks.resume_pending_scales().await.unwrap(), 0);
    }

    /// Reports an open transaction only for the queries numbered in `open`
    struct OpenDuring {
        queries: AtomicU32,
        open: RangeInclusive<u32>,
    }

    #[async_trait::async_trait]
    impl TransactionStatus for OpenDuring {
        async fn is_transaction_ongoing(&self, _: &str, _: &str, _: u32) -> Result<bool> {
            let query = self.queries.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(self.open.contains(&query))
        }
    }

    #[tokio::test]
    async fn test_rejected_manual_scale_is_never_applied() {
        let h = harness(Arc::new(NoTransactions));
        create(&h.tasks, ScalingPolicy::Fixed(2)).await;
        let (writer, mut rx) = ChannelEventWriter::new(16);
        h.tasks.set_request_event_writer(Arc::new(writer));

        let first = h
            .tasks
            .manual_scale(
                "scope",
                "stream1",
                vec![SegmentId::new(0, 0)],
                vec![r(0.0, 0.25), r(0.25, 0.5)],
                10,
            )
            .await
            .unwrap();
        assert_eq!(first.status, ScaleStatus::Started);
        let second = h
            .tasks
            .manual_scale(
                "scope",
                "stream1",
                vec![SegmentId::new(0, 1)],
                vec![r(0.5, 0.75), r(0.75, 1.0)],
                11,
            )
            .await
            .unwrap();
        assert_eq!(second.status, ScaleStatus::Failure);

        while let Ok(event) = rx.try_recv() {
            h.tasks.process_scale_event(&event).await.unwrap();
        }

        let store = h.tasks.store();
        assert_eq!(
            store.get_active_epoch("scope", "stream1").await.unwrap().epoch,
            1
        );
        assert_eq!(
            h.tasks
                .get_current_segments("scope", "stream1")
                .await
                .unwrap()
                .len(),
            3
        );
    }

    #[tokio::test]
    async fn test_manual_event_without_proposal_is_skipped() {
        let h = harness(Arc::new(NoTransactions));
        create(&h.tasks, ScalingPolicy::Fixed(2)).await;

        let event = ScaleEvent {
            request_id: Uuid::new_v4(),
            scope: "scope".to_string(),
            stream: "stream1".to_string(),
            sealed_segments: merge_sealed(),
            new_ranges: vec![KeyRange::full()],
            scale_timestamp: 10,
            origin: ScaleOrigin::Manual,
        };
        let response = h.tasks.process_scale_event(&event).await.unwrap();
        assert_eq!(response.status, ScaleStatus::Failure);

        let store = h.tasks.store();
        assert_eq!(
            store.get_state("scope", "stream1").await.unwrap(),
            StreamState::Active
        );
        assert_eq!(
            store.get_active_epoch("scope", "stream1").await.unwrap().epoch,
            0
        );
    }

    #[tokio::test]
    async fn test_transaction_opened_while_sealing_leaves_stream_sealing() {
        // First query passes; every poll of the second check sees a transaction
        let polls = fast_config().seal_txn_wait_attempts + 1;
        let transactions = Arc::new(OpenDuring {
            queries: AtomicU32::new(0),
            open: 2..=1 + polls,
        });
        let h = harness(transactions);
        create(&h.tasks, ScalingPolicy::Fixed(2)).await;

        assert_eq!(
            h.tasks.seal_stream("scope", "stream1").await.unwrap(),
            UpdateStreamStatus::TxnConflict
        );
        assert_eq!(
            h.tasks
                .store()
                .get_state("scope", "stream1")
                .await
                .unwrap(),
            StreamState::Sealing
        );

        assert_eq!(
            h.tasks.seal_stream("scope", "stream1").await.unwrap(),
            UpdateStreamStatus::Success
        );
        assert!(h.tasks.store().is_sealed("scope", "stream1").await.unwrap());
        assert!(
            h.tasks
                .get_current_segments("scope", "stream1")
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_resume_scale_after_provisioning() {
        let h = harness(Arc::new(NoTransactions));
        create(&h.tasks, ScalingPolicy::Fixed(2)).await;
        let store = Arc::clone(h.tasks.store());

        let request = ScaleRequest {
            request_id: Uuid::new_v4(),
            sealed_segments: vec![SegmentId::new(0, 1)],
            new_ranges: vec![r(0.5, 0.75), r(0.75, 1.0)],
            scale_timestamp: 10,
            origin: ScaleOrigin::Manual,
            expected_epoch: None,
        };
        store
            .start_scale("scope", "stream1", &request, "host-0")
            .await
            .unwrap();
        store
            .scale_new_segments_created("scope", "stream1", request.request_id)
            .await
            .unwrap();
        let pending = store.get_stream("scope", "stream1").await.unwrap();
        assert_eq!(
            pending.pending_scale().unwrap().resume_point,
            ResumePoint::Provisioned
        );

        assert_eq!(h.tasks.resume_pending_scales().await.unwrap(), 1);
        let record = store.get_stream("scope", "stream1").await.unwrap();
        assert_eq!(record.state(), StreamState::Active);
        assert_eq!(record.active_epoch(), 1);
        assert_eq!(
            record.last_scale().unwrap().resume_point,
            ResumePoint::Committed
        );
        assert_eq!(
            record.current_epoch().segments,
            vec![SegmentId::new(0, 0), SegmentId::new(1, 2), SegmentId::new(1, 3)]
        );
    }
}
