//! Scale workflow metrics for Prometheus
//!
//! Tracks scale outcomes, workflow retries, commits and seals.

use crate::status::{ScaleStatus, UpdateStreamStatus};
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

const SCALE_STATUSES: [ScaleStatus; 5] = [
    ScaleStatus::Started,
    ScaleStatus::Success,
    ScaleStatus::Failure,
    ScaleStatus::PreconditionFailed,
    ScaleStatus::TxnConflict,
];

/// Counters for the scale and seal workflows
#[derive(Debug, Default)]
pub struct ScaleMetrics {
    /// Scale responses, indexed like `SCALE_STATUSES`
    scale_responses: [AtomicU64; 5],
    /// Workflow steps retried after a store outage
    retries_total: AtomicU64,
    /// Epochs committed
    commits_total: AtomicU64,
    /// Streams created
    streams_created_total: AtomicU64,
    /// Streams sealed
    streams_sealed_total: AtomicU64,
    /// Seals blocked by open transactions
    seal_txn_conflicts_total: AtomicU64,
    /// Scales resumed after a restart
    scales_resumed_total: AtomicU64,
}

impl ScaleMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_scale(&self, status: ScaleStatus) {
        let index = SCALE_STATUSES
            .iter()
            .position(|s| *s == status)
            .unwrap_or_default();
        self.scale_responses[index].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_seal(&self, status: UpdateStreamStatus) {
        match status {
            UpdateStreamStatus::Success => {
                self.streams_sealed_total.fetch_add(1, Ordering::Relaxed);
            }
            UpdateStreamStatus::TxnConflict => {
                self.seal_txn_conflicts_total.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    pub fn record_retry(&self) {
        self.retries_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_commit(&self) {
        self.commits_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stream_created(&self) {
        self.streams_created_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resumed(&self) {
        self.scales_resumed_total.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn scale_count(&self, status: ScaleStatus) -> u64 {
        SCALE_STATUSES
            .iter()
            .position(|s| *s == status)
            .map_or(0, |i| self.scale_responses[i].load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn commits(&self) -> u64 {
        self.commits_total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn retries(&self) -> u64 {
        self.retries_total.load(Ordering::Relaxed)
    }

    /// Export in Prometheus text format
    #[must_use]
    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();

        let _ = writeln!(
            output,
            "# HELP riverbed_scale_requests_total Scale requests by outcome"
        );
        let _ = writeln!(output, "# TYPE riverbed_scale_requests_total counter");
        for (status, counter) in SCALE_STATUSES.iter().zip(&self.scale_responses) {
            let _ = writeln!(
                output,
                "riverbed_scale_requests_total{{status=\"{}\"}} {}",
                status.as_str(),
                counter.load(Ordering::Relaxed)
            );
        }

        let counters = [
            (
                "riverbed_scale_retries_total",
                "Workflow steps retried after a store outage",
                &self.retries_total,
            ),
            (
                "riverbed_scale_commits_total",
                "Epochs committed",
                &self.commits_total,
            ),
            (
                "riverbed_scales_resumed_total",
                "Scales resumed after a restart",
                &self.scales_resumed_total,
            ),
            (
                "riverbed_streams_created_total",
                "Streams created",
                &self.streams_created_total,
            ),
            (
                "riverbed_streams_sealed_total",
                "Streams sealed",
                &self.streams_sealed_total,
            ),
            (
                "riverbed_seal_txn_conflicts_total",
                "Seals blocked by open transactions",
                &self.seal_txn_conflicts_total,
            ),
        ];
        for (name, help, counter) in counters {
            let _ = writeln!(output, "# HELP {name} {help}");
            let _ = writeln!(output, "# TYPE {name} counter");
            let _ = writeln!(output, "{name} {}", counter.load(Ordering::Relaxed));
        }

        output
    }
}
