//! Metrics for monitoring checkpoint storage.
//!
//! Prometheus-style counters, gauges and histograms kept in atomics:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     StorageMetrics                           │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────┐  │
//! │  │  Counters    │  │   Gauges     │  │   Histograms     │  │
//! │  │ - finalized  │  │ - open locs  │  │ - finalize time  │  │
//! │  │ - subsumed   │  │ - retained   │  │ - checkpoint     │  │
//! │  │ - discarded  │  │ - shared     │  │   size           │  │
//! │  │ - errors     │  │ - pending    │  │                  │  │
//! │  └──────────────┘  └──────────────┘  └──────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod counters;
mod gauges;
mod histograms;

pub use counters::{Counter, LabeledCounter};
pub use gauges::Gauge;
pub use histograms::{Histogram, HistogramSnapshot, DURATION_BUCKETS, SIZE_BUCKETS};

use crate::error::Error;
use std::time::Duration;

/// Metrics of one checkpoint storage coordinator.
#[derive(Debug)]
pub struct StorageMetrics {
    /// Locations handed out.
    pub locations_created: Counter,
    /// Checkpoints finalized and registered.
    pub checkpoints_finalized: Counter,
    /// Locations aborted or failed during finalize.
    pub checkpoints_aborted: Counter,
    /// Checkpoints released by subsumption or explicit discard.
    pub checkpoints_subsumed: Counter,
    /// Checkpoints re-registered from a restore pointer.
    pub checkpoints_restored: Counter,
    /// State handles physically deleted.
    pub handles_discarded: Counter,
    /// Physical deletions that failed and were parked.
    pub failed_discards: Counter,
    /// State bytes written into finalized checkpoints.
    pub bytes_written: Counter,

    /// Locations currently open.
    pub open_locations: Gauge,
    /// Completed checkpoints currently retained.
    pub retained_checkpoints: Gauge,
    /// Distinct shared handles currently referenced.
    pub shared_handles: Gauge,
    /// Deletions waiting for a retry.
    pub pending_discards: Gauge,

    /// Time from location creation to finalize.
    pub finalize_duration: Histogram,
    /// Total state size of finalized checkpoints.
    pub checkpoint_size: Histogram,

    /// Errors reported to the coordinator, by kind.
    pub errors: LabeledCounter,
}

impl StorageMetrics {
    pub fn new() -> Self {
        Self {
            locations_created: Counter::new(
                "chkstore_locations_created_total",
                "Checkpoint locations created",
            ),
            checkpoints_finalized: Counter::new(
                "chkstore_checkpoints_finalized_total",
                "Checkpoints finalized",
            ),
            checkpoints_aborted: Counter::new(
                "chkstore_checkpoints_aborted_total",
                "Checkpoint locations aborted",
            ),
            checkpoints_subsumed: Counter::new(
                "chkstore_checkpoints_subsumed_total",
                "Checkpoints subsumed or discarded",
            ),
            checkpoints_restored: Counter::new(
                "chkstore_checkpoints_restored_total",
                "Checkpoints registered from a restore pointer",
            ),
            handles_discarded: Counter::new(
                "chkstore_handles_discarded_total",
                "State handles physically deleted",
            ),
            failed_discards: Counter::new(
                "chkstore_failed_discards_total",
                "State deletions that failed and were parked for retry",
            ),
            bytes_written: Counter::new(
                "chkstore_bytes_written_total",
                "State bytes written into finalized checkpoints",
            ),
            open_locations: Gauge::new("chkstore_open_locations", "Open checkpoint locations"),
            retained_checkpoints: Gauge::new(
                "chkstore_retained_checkpoints",
                "Completed checkpoints retained",
            ),
            shared_handles: Gauge::new(
                "chkstore_shared_handles",
                "Distinct shared state handles referenced",
            ),
            pending_discards: Gauge::new(
                "chkstore_pending_discards",
                "Deletions waiting for retry",
            ),
            finalize_duration: Histogram::new(
                "chkstore_finalize_duration_seconds",
                "Time from location creation to finalize",
                DURATION_BUCKETS,
            ),
            checkpoint_size: Histogram::new(
                "chkstore_checkpoint_size_bytes",
                "Total state size of finalized checkpoints",
                SIZE_BUCKETS,
            ),
            errors: LabeledCounter::new("chkstore_errors_total", "Storage errors by kind", "kind"),
        }
    }

    /// Record a finalized checkpoint.
    pub fn record_finalize(&self, duration: Duration, total_size: u64) {
        self.checkpoints_finalized.inc();
        self.bytes_written.inc_by(total_size);
        self.finalize_duration.observe_duration(duration);
        self.checkpoint_size.observe(total_size as f64);
    }

    /// Record an error returned to the coordinator.
    pub fn record_error(&self, error: &Error) {
        self.errors.inc(error.kind());
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            locations_created: self.locations_created.get(),
            checkpoints_finalized: self.checkpoints_finalized.get(),
            checkpoints_aborted: self.checkpoints_aborted.get(),
            checkpoints_subsumed: self.checkpoints_subsumed.get(),
            checkpoints_restored: self.checkpoints_restored.get(),
            handles_discarded: self.handles_discarded.get(),
            failed_discards: self.failed_discards.get(),
            bytes_written: self.bytes_written.get(),
            open_locations: self.open_locations.get(),
            retained_checkpoints: self.retained_checkpoints.get(),
            shared_handles: self.shared_handles.get(),
            pending_discards: self.pending_discards.get(),
            errors: self.errors.total(),
            finalize_duration: self.finalize_duration.snapshot(),
        }
    }

    /// Format metrics in Prometheus exposition format.
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        for counter in [
            &self.locations_created,
            &self.checkpoints_finalized,
            &self.checkpoints_aborted,
            &self.checkpoints_subsumed,
            &self.checkpoints_restored,
            &self.handles_discarded,
            &self.failed_discards,
            &self.bytes_written,
        ] {
            counter.write_prometheus(&mut out);
        }
        for gauge in [
            &self.open_locations,
            &self.retained_checkpoints,
            &self.shared_handles,
            &self.pending_discards,
        ] {
            gauge.write_prometheus(&mut out);
        }
        self.finalize_duration.write_prometheus(&mut out);
        self.checkpoint_size.write_prometheus(&mut out);
        self.errors.write_prometheus(&mut out);

        out
    }
}

impl Default for StorageMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// A snapshot of storage metrics.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub locations_created: u64,
    pub checkpoints_finalized: u64,
    pub checkpoints_aborted: u64,
    pub checkpoints_subsumed: u64,
    pub checkpoints_restored: u64,
    pub handles_discarded: u64,
    pub failed_discards: u64,
    pub bytes_written: u64,
    pub open_locations: i64,
    pub retained_checkpoints: i64,
    pub shared_handles: i64,
    pub pending_discards: i64,
    pub errors: u64,
    pub finalize_duration: HistogramSnapshot,
}

impl MetricsSnapshot {
    /// Share of created locations that ended up finalized.
    pub fn success_rate(&self) -> f64 {
        if self.locations_created == 0 {
            0.0
        } else {
            self.checkpoints_finalized as f64 / self.locations_created as f64
        }
    }

    /// Mean finalize time in milliseconds.
    pub fn avg_finalize_ms(&self) -> f64 {
        self.finalize_duration.mean() * 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_metrics() {
        let metrics = StorageMetrics::new();
        metrics.locations_created.inc();
        metrics.locations_created.inc();
        metrics.record_finalize(Duration::from_millis(40), 4096);
        metrics.record_error(&Error::NotFound("x".into()));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.checkpoints_finalized, 1);
        assert_eq!(snapshot.bytes_written, 4096);
        assert_eq!(snapshot.errors, 1);
        assert!((snapshot.success_rate() - 0.5).abs() < f64::EPSILON);
        assert!((snapshot.avg_finalize_ms() - 40.0).abs() < 1e-6);
        assert_eq!(metrics.errors.get("not_found"), 1);
    }

    #[test]
    fn test_prometheus_output() {
        let metrics = StorageMetrics::new();
        metrics.handles_discarded.inc_by(3);

        let output = metrics.to_prometheus();
        assert!(output.contains("chkstore_handles_discarded_total 3"));
        assert!(output.contains("# TYPE chkstore_open_locations gauge"));
        assert!(output.contains("chkstore_finalize_duration_seconds_count 0"));
    }
}
