//! Daily aggregation: fold one day of activity events into monthly buckets
//!
//! For each domain, the unprocessed events of the day decide which entities
//! are dirty. Each dirty entity's daily slot is re-derived from every retained
//! event of that day (so late arrivals extend the day rather than replace it),
//! written as a full overwrite, and the monthly totals and weekly slot move by
//! the delta. The slot write and the marking of that entity's events commit
//! together, so an entity either lands whole or is retried whole.

use super::{FanOut, RunReport};
use crate::calendar::day_window;
use crate::error::Result;
use crate::events::{ActivityEvent, Domain};
use crate::metrics::{EngagementMetrics, FoldRules, MetricSet, SalesMetrics};
use crate::store::SqliteStore;
use chrono::NaiveDate;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

pub struct Aggregator {
    store: Arc<SqliteStore>,
    rules: FoldRules,
}

impl Aggregator {
    pub fn new(store: Arc<SqliteStore>, rules: FoldRules) -> Self {
        Self { store, rules }
    }

    /// Aggregate every domain for `date`
    ///
    /// Domains are independent: a failure in one is returned after the other
    /// has been attempted, and re-running the date repairs whichever failed.
    pub fn run(&self, date: NaiveDate) -> Result<RunReport> {
        let started = Instant::now();
        let mut report = RunReport::default();
        let mut first_error = None;

        for domain in Domain::ALL {
            match self.run_domain(domain, date) {
                Ok(r) => report.merge(&r),
                Err(e) => {
                    tracing::error!(%domain, %date, "Aggregation failed: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        let report = report.finish(started);
        tracing::info!(
            %date,
            events = report.records_processed,
            slots = report.slots_written,
            skipped = report.records_skipped,
            elapsed_ms = report.execution_time_ms,
            "Aggregation complete"
        );
        Ok(report)
    }

    /// Aggregate a single domain for `date`
    pub fn run_domain(&self, domain: Domain, date: NaiveDate) -> Result<RunReport> {
        let started = Instant::now();
        let report = match domain {
            Domain::Sales => self.aggregate::<SalesMetrics>(date)?,
            Domain::Engagement => self.aggregate::<EngagementMetrics>(date)?,
        };
        Ok(report.finish(started))
    }

    /// Aggregate every day in `[from, to]`, stopping at the first failure
    pub fn backfill(&self, from: NaiveDate, to: NaiveDate) -> Result<RunReport> {
        let started = Instant::now();
        let mut report = RunReport::default();
        for date in crate::calendar::days_between(from, to) {
            report.merge(&self.run(date)?);
        }
        Ok(report.finish(started))
    }

    fn aggregate<M: MetricSet>(&self, date: NaiveDate) -> Result<RunReport> {
        let (start, end) = day_window(date);
        let batch = self.store.find_unprocessed(M::DOMAIN, start, end)?;

        if batch.events.is_empty() && batch.malformed.is_empty() {
            tracing::debug!(domain = %M::DOMAIN, %date, "Nothing to aggregate");
            return Ok(RunReport::default());
        }

        let dirty: BTreeSet<&str> = batch.events.iter().map(|e| e.entity_id.as_str()).collect();

        let rules = self.rules;
        let mut fan = FanOut::default();
        let mut consumed = 0u64;
        for entity in &dirty {
            let result = self
                .store
                .fold_daily_slot::<M, _>(entity, date, |stored, events| {
                    derive_slot(stored, events, &rules)
                })
                .map(|fold| {
                    consumed += fold.consumed;
                    fold.write.is_some_and(|w| !w.is_noop())
                });
            fan.record(entity, result);
        }
        let slots_written = fan.finish()?;

        self.store.mark_processed(&batch.malformed)?;

        tracing::debug!(
            domain = %M::DOMAIN,
            %date,
            entities = dirty.len(),
            events = consumed,
            "Domain aggregated"
        );

        Ok(RunReport {
            records_processed: consumed,
            slots_written,
            records_skipped: batch.malformed.len() as u64,
            execution_time_ms: 0,
        })
    }
}

/// Slot value for one entity's day from its stored slot and retained events
///
/// The whole retained day is folded again, so a late event extends the day.
/// When the stored slot no longer matches what the processed events add up
/// to, the retention sweep has already removed part of that history; the
/// stored slot is then the only record of it, and the pending events are
/// merged onto it instead.
fn derive_slot<M: MetricSet>(
    stored: Option<M>,
    events: &[ActivityEvent],
    rules: &FoldRules,
) -> Result<M> {
    let (pending, history): (Vec<&ActivityEvent>, Vec<&ActivityEvent>) =
        events.iter().partition(|e| !e.processed);

    let Some(stored) = stored else {
        return M::reduce(events, rules);
    };
    if stored == M::reduce(history.iter().copied(), rules)? {
        return M::reduce(events, rules);
    }

    tracing::debug!(
        domain = %M::DOMAIN,
        retained = history.len(),
        pending = pending.len(),
        "Day history partly swept, merging pending events onto stored slot"
    );
    stored.merge(M::reduce(pending.iter().copied(), rules)?, rules)
}
