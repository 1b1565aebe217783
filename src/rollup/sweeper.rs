//! Retention sweep over the activity log

use super::RunReport;
use crate::error::Result;
use crate::store::SqliteStore;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use std::time::Instant;

/// Deletes processed events older than the retention window
pub struct Sweeper {
    store: Arc<SqliteStore>,
    retention_days: u32,
}

impl Sweeper {
    /// `retention_days == 0` disables the sweep
    pub fn new(store: Arc<SqliteStore>, retention_days: u32) -> Self {
        Self {
            store,
            retention_days,
        }
    }

    pub fn run(&self) -> Result<RunReport> {
        self.run_at(Utc::now())
    }

    /// Sweep relative to `now`
    pub fn run_at(&self, now: DateTime<Utc>) -> Result<RunReport> {
        let started = Instant::now();
        if self.retention_days == 0 {
            tracing::debug!("Retention disabled, sweep skipped");
            return Ok(RunReport::default().finish(started));
        }

        let cutoff = now - Duration::days(i64::from(self.retention_days));
        let deleted = self.store.delete_processed_older_than(cutoff)?;
        let report = RunReport {
            records_processed: deleted,
            ..Default::default()
        }
        .finish(started);

        tracing::info!(
            deleted,
            cutoff = %cutoff,
            elapsed_ms = report.execution_time_ms,
            "Retention sweep complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NewEvent;
    use crate::store::test_support::temp_store;
    use chrono::TimeZone;

    #[test]
    fn test_sweep_only_removes_old_processed_events() {
        let (_dir, store) = temp_store();
        let store = Arc::new(store);
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();

        let old_done = store
            .append(&NewEvent::sale("p-1", 1, 0, now - Duration::days(120)))
            .unwrap();
        let old_pending = store
            .append(&NewEvent::sale("p-1", 1, 0, now - Duration::days(120)))
            .unwrap();
        let recent_done = store
            .append(&NewEvent::sale("p-1", 1, 0, now - Duration::days(10)))
            .unwrap();
        store.mark_processed(&[old_done, recent_done]).unwrap();

        let report = Sweeper::new(store.clone(), 90).run_at(now).unwrap();
        assert_eq!(report.records_processed, 1);
        assert!(store.get_event(old_done).unwrap().is_none());
        assert!(store.get_event(old_pending).unwrap().is_some());
        assert!(store.get_event(recent_done).unwrap().is_some());
    }

    #[test]
    fn test_zero_retention_disables_sweep() {
        let (_dir, store) = temp_store();
        let store = Arc::new(store);
        let long_ago = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap();
        let id = store
            .append(&NewEvent::sale("p-1", 1, 0, long_ago))
            .unwrap();
        store.mark_processed(&[id]).unwrap();

        let report = Sweeper::new(store.clone(), 0).run().unwrap();
        assert_eq!(report.records_processed, 0);
        assert!(store.get_event(id).unwrap().is_some());
    }
}
