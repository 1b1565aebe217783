//! Calendar-driven trigger for the rollup jobs
//!
//! Each job gets its own tokio task that sleeps until the next fire time of
//! its cadence, runs the job on the blocking pool, and goes back to sleep.
//! Failures are logged and counted; the next tick targets a fresh window, so
//! nothing is retried automatically.
//!
//! ```text
//! Scheduler::start()
//!     ├── task: Daily   ──→ Aggregator::run(yesterday)
//!     ├── task: Monthly ──→ Promoter::run(last month)
//!     └── task: Weekly  ──→ Sweeper::run_at(now)
//! Scheduler::stop() ──→ watch channel ──→ every task exits its select!
//! ```

use super::{Aggregator, Promoter, RunReport, Sweeper};
use crate::calendar::{last_month, yesterday, YearMonth};
use crate::error::{Result, RollupError};
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// When a job fires (always UTC)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    Daily { at: NaiveTime },
    Weekly { weekday: Weekday, at: NaiveTime },
    /// `day` past the end of a short month fires on its last day
    Monthly { day: u32, at: NaiveTime },
}

impl Cadence {
    /// First fire time strictly after `now`
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let today = now.date_naive();
        let at_time = |date: NaiveDate, at: NaiveTime| Utc.from_utc_datetime(&date.and_time(at));

        match *self {
            Cadence::Daily { at } => {
                let candidate = at_time(today, at);
                if candidate > now {
                    candidate
                } else {
                    candidate + Duration::days(1)
                }
            }
            Cadence::Weekly { weekday, at } => {
                let ahead = (7 + weekday.num_days_from_monday()
                    - today.weekday().num_days_from_monday())
                    % 7;
                let candidate = at_time(today + Duration::days(i64::from(ahead)), at);
                if candidate > now {
                    candidate
                } else {
                    candidate + Duration::weeks(1)
                }
            }
            Cadence::Monthly { day, at } => {
                let this_month = YearMonth::of(today);
                let candidate = at_time(monthly_fire_day(this_month, day), at);
                if candidate > now {
                    candidate
                } else {
                    at_time(monthly_fire_day(this_month.next(), day), at)
                }
            }
        }
    }
}

fn monthly_fire_day(period: YearMonth, day: u32) -> NaiveDate {
    let day = day.clamp(1, period.days());
    NaiveDate::from_ymd_opt(period.year, period.month, day).unwrap_or_else(|| period.first_day())
}

/// The three rollup jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Job {
    Aggregate,
    Promote,
    Sweep,
}

impl Job {
    pub const ALL: [Job; 3] = [Job::Aggregate, Job::Promote, Job::Sweep];

    pub fn name(&self) -> &'static str {
        match self {
            Job::Aggregate => "aggregate",
            Job::Promote => "promote",
            Job::Sweep => "sweep",
        }
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Cadence per job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedules {
    pub aggregate: Cadence,
    pub promote: Cadence,
    pub sweep: Cadence,
}

impl Schedules {
    /// Default cadences with the given fire times
    pub fn at(daily: NaiveTime, monthly: NaiveTime, weekly: NaiveTime) -> Self {
        Self {
            aggregate: Cadence::Daily { at: daily },
            promote: Cadence::Monthly { day: 1, at: monthly },
            sweep: Cadence::Weekly {
                weekday: Weekday::Mon,
                at: weekly,
            },
        }
    }

    pub fn cadence(&self, job: Job) -> Cadence {
        match job {
            Job::Aggregate => self.aggregate,
            Job::Promote => self.promote,
            Job::Sweep => self.sweep,
        }
    }
}

impl Default for Schedules {
    fn default() -> Self {
        let hm = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap_or(NaiveTime::MIN);
        Self::at(hm(0, 15), hm(1, 0), hm(2, 0))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Run counters
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct JobCounters {
    succeeded: AtomicU64,
    failed: AtomicU64,
    records: AtomicU64,
    last_duration_ms: AtomicU64,
    /// Unix millis of the last finished run (0 = never)
    last_finished: AtomicI64,
    running: AtomicBool,
}

impl JobCounters {
    fn snapshot(&self) -> JobSnapshot {
        let last = self.last_finished.load(Ordering::Relaxed);
        JobSnapshot {
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            records_processed: self.records.load(Ordering::Relaxed),
            last_duration_ms: self.last_duration_ms.load(Ordering::Relaxed),
            last_finished: (last > 0)
                .then(|| Utc.timestamp_millis_opt(last).single())
                .flatten(),
            running: self.running.load(Ordering::Relaxed),
        }
    }
}

/// Counters for one job
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub succeeded: u64,
    pub failed: u64,
    pub records_processed: u64,
    pub last_duration_ms: u64,
    pub last_finished: Option<DateTime<Utc>>,
    pub running: bool,
}

/// Snapshot of scheduler counters for monitoring
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerSnapshot {
    pub aggregate: JobSnapshot,
    pub promote: JobSnapshot,
    pub sweep: JobSnapshot,
}

// ─────────────────────────────────────────────────────────────────────────────
// Scheduler
// ─────────────────────────────────────────────────────────────────────────────

/// Job handles and counters shared with the timer tasks
struct Jobs {
    aggregator: Arc<Aggregator>,
    promoter: Arc<Promoter>,
    sweeper: Arc<Sweeper>,
    aggregate: JobCounters,
    promote: JobCounters,
    sweep: JobCounters,
}

impl Jobs {
    fn counters(&self, job: Job) -> &JobCounters {
        match job {
            Job::Aggregate => &self.aggregate,
            Job::Promote => &self.promote,
            Job::Sweep => &self.sweep,
        }
    }

    /// Run `job` for the window implied by `at`, on the blocking pool
    async fn execute(self: Arc<Self>, job: Job, at: DateTime<Utc>) -> Result<RunReport> {
        let counters = self.counters(job);
        counters.running.store(true, Ordering::Relaxed);

        let jobs = self.clone();
        let result = tokio::task::spawn_blocking(move || match job {
            Job::Aggregate => jobs.aggregator.run(yesterday(at)),
            Job::Promote => jobs.promoter.run(last_month(at)),
            Job::Sweep => jobs.sweeper.run_at(at),
        })
        .await
        .unwrap_or_else(|e| Err(RollupError::Storage(format!("{} job aborted: {}", job, e))));

        counters.running.store(false, Ordering::Relaxed);
        counters
            .last_finished
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        match &result {
            Ok(report) => {
                counters.succeeded.fetch_add(1, Ordering::Relaxed);
                counters
                    .records
                    .fetch_add(report.records_processed, Ordering::Relaxed);
                counters
                    .last_duration_ms
                    .store(report.execution_time_ms, Ordering::Relaxed);
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(%job, transient = e.is_transient(), "Scheduled run failed: {}", e);
            }
        }
        result
    }
}

/// Owns the timer tasks for the three jobs
pub struct Scheduler {
    jobs: Arc<Jobs>,
    schedules: Schedules,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        aggregator: Arc<Aggregator>,
        promoter: Arc<Promoter>,
        sweeper: Arc<Sweeper>,
        schedules: Schedules,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            jobs: Arc::new(Jobs {
                aggregator,
                promoter,
                sweeper,
                aggregate: JobCounters::default(),
                promote: JobCounters::default(),
                sweep: JobCounters::default(),
            }),
            schedules,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn one timer task per job (no-op if already started)
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let Ok(mut tasks) = self.tasks.lock() else {
            tracing::error!("Scheduler task list poisoned, not starting");
            return;
        };
        if !tasks.is_empty() {
            return;
        }
        self.shutdown.send_replace(false);

        for job in Job::ALL {
            let cadence = self.schedules.cadence(job);
            let jobs = self.jobs.clone();
            let mut shutdown = self.shutdown.subscribe();

            tasks.push(tokio::spawn(async move {
                loop {
                    let now = Utc::now();
                    let next = cadence.next_after(now);
                    let wait = (next - now).to_std().unwrap_or_default();
                    tracing::debug!(%job, next = %next, "Next scheduled run");

                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {
                            tracing::info!(%job, "Scheduled run starting");
                            // Errors are counted and logged inside execute
                            let _ = jobs.clone().execute(job, next).await;
                        }
                        _ = shutdown.changed() => break,
                    }
                }
                tracing::debug!(%job, "Scheduler task stopped");
            }));
        }

        tracing::info!(
            aggregate = ?self.schedules.aggregate,
            promote = ?self.schedules.promote,
            sweep = ?self.schedules.sweep,
            "Scheduler started"
        );
    }

    /// Signal every task to stop and wait for them
    ///
    /// A run already in progress on the blocking pool finishes on its own.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let tasks: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("Scheduler task ended abnormally: {}", e);
            }
        }
        tracing::info!("Scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.tasks.lock().map(|t| !t.is_empty()).unwrap_or(false)
    }

    /// Run `job` now, as if it fired at `at`
    pub async fn trigger(&self, job: Job, at: DateTime<Utc>) -> Result<RunReport> {
        self.jobs.clone().execute(job, at).await
    }

    pub fn metrics(&self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            aggregate: self.jobs.aggregate.snapshot(),
            promote: self.jobs.promote.snapshot(),
            sweep: self.jobs.sweep.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NewEvent;
    use crate::metrics::{FoldRules, SalesMetrics};
    use crate::store::test_support::temp_store;
    use crate::store::{MonthlyBucket, SqliteStore};

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn scheduler(store: Arc<SqliteStore>) -> Scheduler {
        Scheduler::new(
            Arc::new(Aggregator::new(store.clone(), FoldRules::default())),
            Arc::new(Promoter::new(store.clone())),
            Arc::new(Sweeper::new(store, 90)),
            Schedules::default(),
        )
    }

    #[test]
    fn test_daily_next_after() {
        let cadence = Cadence::Daily { at: hm(0, 15) };
        assert_eq!(
            cadence.next_after(utc(2024, 3, 5, 0, 0)),
            utc(2024, 3, 5, 0, 15)
        );
        assert_eq!(
            cadence.next_after(utc(2024, 3, 5, 0, 15)),
            utc(2024, 3, 6, 0, 15)
        );
        assert_eq!(
            cadence.next_after(utc(2024, 12, 31, 23, 0)),
            utc(2025, 1, 1, 0, 15)
        );
    }

    #[test]
    fn test_weekly_next_after() {
        let cadence = Cadence::Weekly {
            weekday: Weekday::Mon,
            at: hm(2, 0),
        };
        // Tuesday 2024-03-05
        assert_eq!(
            cadence.next_after(utc(2024, 3, 5, 12, 0)),
            utc(2024, 3, 11, 2, 0)
        );
        // Monday before and after the fire time
        assert_eq!(
            cadence.next_after(utc(2024, 3, 11, 1, 0)),
            utc(2024, 3, 11, 2, 0)
        );
        assert_eq!(
            cadence.next_after(utc(2024, 3, 11, 3, 0)),
            utc(2024, 3, 18, 2, 0)
        );
    }

    #[test]
    fn test_monthly_next_after() {
        let first = Cadence::Monthly { day: 1, at: hm(1, 0) };
        assert_eq!(
            first.next_after(utc(2024, 3, 5, 0, 0)),
            utc(2024, 4, 1, 1, 0)
        );
        assert_eq!(
            first.next_after(utc(2024, 12, 1, 0, 30)),
            utc(2024, 12, 1, 1, 0)
        );
        assert_eq!(
            first.next_after(utc(2024, 12, 1, 1, 0)),
            utc(2025, 1, 1, 1, 0)
        );

        let late = Cadence::Monthly { day: 31, at: hm(1, 0) };
        assert_eq!(
            late.next_after(utc(2024, 2, 10, 0, 0)),
            utc(2024, 2, 29, 1, 0)
        );
    }

    #[tokio::test]
    async fn test_trigger_aggregates_yesterday() {
        let (_dir, store) = temp_store();
        let store = Arc::new(store);
        store
            .append(&NewEvent::sale("p-1", 100, 10, utc(2024, 3, 5, 10, 0)))
            .unwrap();
        let scheduler = scheduler(store.clone());

        let report = scheduler
            .trigger(Job::Aggregate, utc(2024, 3, 6, 0, 15))
            .await
            .unwrap();
        assert_eq!(report.records_processed, 1);

        let bucket: MonthlyBucket<SalesMetrics> = store
            .monthly_bucket("p-1", YearMonth::new(2024, 3).unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(bucket.day(5).unwrap().amount, 100);

        let metrics = scheduler.metrics();
        assert_eq!(metrics.aggregate.succeeded, 1);
        assert_eq!(metrics.aggregate.records_processed, 1);
        assert!(metrics.aggregate.last_finished.is_some());
        assert_eq!(metrics.promote.succeeded, 0);
    }

    #[tokio::test]
    async fn test_failed_run_is_counted() {
        let (_dir, store) = temp_store();
        let store = Arc::new(store);
        store
            .append(&NewEvent::sale("p-1", 100, 10, utc(2024, 3, 5, 10, 0)))
            .unwrap();
        crate::store::test_support::exec(&store, "DROP TABLE monthly_buckets", []);
        let scheduler = scheduler(store);

        let result = scheduler
            .trigger(Job::Aggregate, utc(2024, 3, 6, 0, 15))
            .await;
        assert!(result.is_err());
        assert_eq!(scheduler.metrics().aggregate.failed, 1);
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let (_dir, store) = temp_store();
        let scheduler = scheduler(Arc::new(store));

        scheduler.start();
        assert!(scheduler.is_running());
        scheduler.start();

        scheduler.stop().await;
        assert!(!scheduler.is_running());
    }
}
