//! Batch jobs that maintain the bucket store
//!
//! # Architecture
//!
//! ```text
//! Scheduler ──┬──→ Aggregator  (daily)    events ──→ monthly buckets
//!             ├──→ Promoter    (monthly)  monthly totals ──→ yearly buckets
//!             └──→ Sweeper     (weekly)   processed events ──→ deleted
//! ```
//!
//! Every job is a single unit: it either completes for its whole window or
//! reports failure, and re-running the same window is always safe because
//! slots are overwritten and totals move by deltas.

pub mod aggregator;
pub mod promoter;
pub mod scheduler;
pub mod sweeper;
pub mod verify;

pub use aggregator::Aggregator;
pub use promoter::Promoter;
pub use scheduler::{Cadence, Job, Scheduler, SchedulerSnapshot, Schedules};
pub use sweeper::Sweeper;
pub use verify::{verify_buckets, VerifyReport};

use crate::error::{Result, RollupError};
use serde::Serialize;
use std::time::Instant;

/// Summary of a completed job run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    /// Events consumed, buckets promoted, or events deleted
    pub records_processed: u64,
    /// Bucket slots whose stored value changed
    pub slots_written: u64,
    /// Malformed events retired without being folded
    pub records_skipped: u64,
    pub execution_time_ms: u64,
}

impl RunReport {
    pub(crate) fn merge(&mut self, other: &RunReport) {
        self.records_processed += other.records_processed;
        self.slots_written += other.slots_written;
        self.records_skipped += other.records_skipped;
    }

    pub(crate) fn finish(mut self, started: Instant) -> Self {
        self.execution_time_ms = started.elapsed().as_millis() as u64;
        self
    }
}

/// Job result as reported to an operator or API caller
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    pub success: bool,
    pub records_processed: u64,
    pub execution_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunOutcome {
    pub fn from_result(result: &Result<RunReport>, started: Instant) -> Self {
        match result {
            Ok(report) => Self {
                success: true,
                records_processed: report.records_processed,
                execution_time_ms: report.execution_time_ms,
                error: None,
            },
            Err(e) => Self {
                success: false,
                records_processed: 0,
                execution_time_ms: started.elapsed().as_millis() as u64,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Tracks per-entity writes within one run
///
/// A run fails as a whole if any entity failed; entities already written
/// keep their (idempotent) slot values.
#[derive(Debug, Default)]
pub(crate) struct FanOut {
    succeeded: usize,
    changed: u64,
    failed: Vec<(String, String)>,
    first_error: Option<RollupError>,
}

impl FanOut {
    pub(crate) fn record(&mut self, entity: &str, result: Result<bool>) {
        match result {
            Ok(changed) => {
                self.succeeded += 1;
                if changed {
                    self.changed += 1;
                }
            }
            Err(e) => {
                tracing::warn!(entity, "Bucket write failed: {}", e);
                self.failed.push((entity.to_string(), e.to_string()));
                if self.first_error.is_none() {
                    self.first_error = Some(e);
                }
            }
        }
    }

    /// Number of slots changed, or the run's failure
    pub(crate) fn finish(self) -> Result<u64> {
        match self.first_error {
            None => Ok(self.changed),
            Some(e) if self.succeeded == 0 => Err(e),
            Some(_) => Err(RollupError::PartialWindow {
                succeeded: self.succeeded,
                failed: self.failed,
            }),
        }
    }
}
