//! Engine facade: one handle over the store, the rollup jobs and queries
//!
//! This is the surface other services talk to. Collaborators emit events,
//! operators trigger runs, dashboards query series; the scheduler drives the
//! same job objects on its own cadence.

use crate::calendar::YearMonth;
use crate::config::Config;
use crate::error::Result;
use crate::events::{EntityId, EventId, EventKind, NewEvent};
use crate::metrics::FoldRules;
use crate::query::{EntityDirectory, QueryEngine, SeriesRequest, TimeSeries};
use crate::rollup::{
    verify_buckets, Aggregator, Promoter, RunReport, Scheduler, Schedules, Sweeper, VerifyReport,
};
use crate::store::{SqliteStore, StoreCounts};
use chrono::{DateTime, NaiveDate, Utc};
use std::sync::Arc;

pub struct Engine {
    store: Arc<SqliteStore>,
    aggregator: Arc<Aggregator>,
    promoter: Arc<Promoter>,
    sweeper: Arc<Sweeper>,
    query: QueryEngine,
}

impl Engine {
    pub fn new(store: Arc<SqliteStore>, rules: FoldRules, retention_days: u32) -> Self {
        Self {
            aggregator: Arc::new(Aggregator::new(store.clone(), rules)),
            promoter: Arc::new(Promoter::new(store.clone())),
            sweeper: Arc::new(Sweeper::new(store.clone(), retention_days)),
            query: QueryEngine::new(store.clone()),
            store,
        }
    }

    /// Open the configured database and wire every component
    pub fn open(config: &Config) -> Result<Self> {
        let store = Arc::new(SqliteStore::open(&config.db_path)?);
        Ok(Self::new(
            store,
            config.aggregation.fold_rules(),
            config.retention.retention_days,
        ))
    }

    /// Resolve empty entity lists through `directory` when an owner is given
    pub fn with_directory(mut self, directory: Arc<dyn EntityDirectory>) -> Self {
        self.query = self.query.with_directory(directory);
        self
    }

    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    /// Record one activity event for later aggregation
    pub fn emit(
        &self,
        entity_id: impl Into<EntityId>,
        kind: EventKind,
        occurred_at: DateTime<Utc>,
    ) -> Result<EventId> {
        self.emit_event(&NewEvent::new(entity_id, kind, occurred_at))
    }

    pub fn emit_event(&self, event: &NewEvent) -> Result<EventId> {
        let id = self.store.append(event)?;
        tracing::trace!(
            event_id = id,
            entity = %event.entity_id,
            kind = event.kind.tag(),
            "Event recorded"
        );
        Ok(id)
    }

    /// Aggregate one day, both domains
    pub fn run_aggregation(&self, date: NaiveDate) -> Result<RunReport> {
        self.aggregator.run(date)
    }

    /// Aggregate every day in `[from, to]`
    pub fn run_backfill(&self, from: NaiveDate, to: NaiveDate) -> Result<RunReport> {
        self.aggregator.backfill(from, to)
    }

    /// Promote the month containing `target` into its yearly buckets
    pub fn run_promotion(&self, target: NaiveDate) -> Result<RunReport> {
        self.promoter.run(YearMonth::of(target))
    }

    pub fn run_retention_sweep(&self) -> Result<RunReport> {
        self.sweeper.run()
    }

    pub fn query_time_series(&self, req: &SeriesRequest) -> Result<TimeSeries> {
        self.query.query(req)
    }

    pub fn verify(&self) -> Result<VerifyReport> {
        verify_buckets(&self.store)
    }

    pub fn status(&self) -> Result<StoreCounts> {
        self.store.counts()
    }

    /// Scheduler driving this engine's jobs (not started)
    pub fn scheduler(&self, schedules: Schedules) -> Scheduler {
        Scheduler::new(
            self.aggregator.clone(),
            self.promoter.clone(),
            self.sweeper.clone(),
            schedules,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Granularity;
    use chrono::TimeZone;

    #[test]
    fn test_emit_aggregate_promote_query() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            db_path: dir.path().join("engine.db"),
            ..Config::default()
        };
        let engine = Engine::open(&config).unwrap();

        let at = Utc.with_ymd_and_hms(2024, 3, 5, 9, 0, 0).unwrap();
        for _ in 0..3 {
            engine
                .emit("p-1", EventKind::Sale { amount: 100, profit: 20 }, at)
                .unwrap();
        }
        let day = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        assert_eq!(engine.run_aggregation(day).unwrap().records_processed, 3);
        assert_eq!(engine.run_promotion(day).unwrap().records_processed, 1);

        let series = engine
            .query_time_series(&SeriesRequest {
                entity_ids: vec![],
                owner: None,
                from: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                to: NaiveDate::from_ymd_opt(2024, 12, 31).unwrap(),
                granularity: Granularity::Year,
                metric: "salesProfit".into(),
            })
            .unwrap();
        assert_eq!(series.values, vec![60]);

        assert!(engine.verify().unwrap().is_consistent());
        let status = engine.status().unwrap();
        assert_eq!(status.events, 3);
        assert_eq!(status.unprocessed_events, 0);
        assert_eq!(status.monthly_buckets, 1);
        assert_eq!(status.yearly_buckets, 1);
    }
}
