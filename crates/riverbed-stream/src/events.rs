//! Scale work items and the channel that carries them.
//!
//! The orchestrator posts a [`ScaleEvent`] before proposing a scale; the
//! [`ScaleEventProcessor`] drains the channel and drives each scale to
//! completion.

use crate::record::{ScaleOrigin, ScaleRequest};
use crate::segment::KeyRange;
use crate::tasks::StreamMetadataTasks;
use async_trait::async_trait;
use riverbed_common::{Error, Result, SegmentId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A scale request queued for asynchronous processing
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScaleEvent {
    pub request_id: Uuid,
    pub scope: String,
    pub stream: String,
    pub sealed_segments: Vec<SegmentId>,
    pub new_ranges: Vec<KeyRange>,
    pub scale_timestamp: u64,
    pub origin: ScaleOrigin,
}

impl ScaleEvent {
    /// The request this event replays
    #[must_use]
    pub fn to_request(&self) -> ScaleRequest {
        ScaleRequest {
            request_id: self.request_id,
            sealed_segments: self.sealed_segments.clone(),
            new_ranges: self.new_ranges.clone(),
            scale_timestamp: self.scale_timestamp,
            origin: self.origin,
            expected_epoch: None,
        }
    }
}

/// Outbound channel for scale work
#[async_trait]
pub trait ScaleEventWriter: Send + Sync {
    async fn write_event(&self, event: ScaleEvent) -> Result<()>;
}

/// [`ScaleEventWriter`] over a bounded in-process queue
pub struct ChannelEventWriter {
    tx: mpsc::Sender<ScaleEvent>,
}

impl ChannelEventWriter {
    /// Writer plus the receiving end for a [`ScaleEventProcessor`]
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ScaleEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ScaleEventWriter for ChannelEventWriter {
    async fn write_event(&self, event: ScaleEvent) -> Result<()> {
        debug!(
            "Queueing scale {} for {}/{}",
            event.request_id, event.scope, event.stream
        );
        self.tx
            .send(event)
            .await
            .map_err(|_| Error::store_unavailable("scale event queue is closed"))
    }
}

/// An event waiting to be processed again after a store outage
struct DelayedEvent {
    due: Instant,
    attempt: u32,
    event: ScaleEvent,
}

/// Drains scale events and completes each scale.
///
/// Events that fail with a retryable error are processed again after a
/// backoff until they reach a terminal outcome.
pub struct ScaleEventProcessor {
    tasks: Arc<StreamMetadataTasks>,
    rx: mpsc::Receiver<ScaleEvent>,
    delayed: Vec<DelayedEvent>,
}

impl ScaleEventProcessor {
    #[must_use]
    pub const fn new(tasks: Arc<StreamMetadataTasks>, rx: mpsc::Receiver<ScaleEvent>) -> Self {
        Self {
            tasks,
            rx,
            delayed: Vec::new(),
        }
    }

    /// Process events until every writer is dropped and no retry is pending
    pub async fn run(mut self) {
        info!("Scale event processor started");
        let mut closed = false;
        loop {
            let next_due = self.delayed.iter().map(|d| d.due).min();
            if closed && next_due.is_none() {
                break;
            }
            let (event, attempt) = tokio::select! {
                received = self.rx.recv(), if !closed => match received {
                    Some(event) => (event, 0),
                    None => {
                        closed = true;
                        continue;
                    }
                },
                () = time::sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {
                    match self.take_due() {
                        Some(delayed) => (delayed.event, delayed.attempt),
                        None => continue,
                    }
                }
            };
            self.process(event, attempt).await;
        }
        info!("Scale event processor stopped");
    }

    fn take_due(&mut self) -> Option<DelayedEvent> {
        let index = self
            .delayed
            .iter()
            .enumerate()
            .min_by_key(|(_, d)| d.due)
            .map(|(i, _)| i)?;
        Some(self.delayed.swap_remove(index))
    }

    async fn process(&mut self, event: ScaleEvent, attempt: u32) {
        let request_id = event.request_id;
        match self.tasks.process_scale_event(&event).await {
            Ok(response) => debug!(
                "Scale {} on {}/{} finished with {:?}",
                request_id, event.scope, event.stream, response.status
            ),
            Err(e) if e.is_retryable() => {
                let delay = self.tasks.config().backoff(attempt);
                warn!(
                    "Scale {} on {}/{} interrupted, retrying in {:?}: {}",
                    request_id, event.scope, event.stream, delay, e
                );
                self.delayed.push(DelayedEvent {
                    due: Instant::now() + delay,
                    attempt: attempt.saturating_add(1),
                    event,
                });
            }
            Err(e) => warn!(
                "Scale {} on {}/{} failed: {}",
                request_id, event.scope, event.stream, e
            ),
        }
    }
}
