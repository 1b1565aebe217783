//! Monthly promotion: copy each monthly bucket's totals into its yearly bucket

use super::{FanOut, RunReport};
use crate::calendar::YearMonth;
use crate::error::Result;
use crate::events::Domain;
use crate::metrics::{EngagementMetrics, MetricSet, SalesMetrics};
use crate::store::{EntityFilter, MonthlyBucket, SqliteStore};
use std::sync::Arc;
use std::time::Instant;

pub struct Promoter {
    store: Arc<SqliteStore>,
}

impl Promoter {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self { store }
    }

    /// Promote every domain's buckets for `period`
    ///
    /// Promoting a month twice overwrites the same yearly slot with the same
    /// totals, so re-runs after late aggregation simply refresh it.
    pub fn run(&self, period: YearMonth) -> Result<RunReport> {
        let started = Instant::now();
        let mut report = RunReport::default();
        let mut first_error = None;

        for domain in Domain::ALL {
            let result = match domain {
                Domain::Sales => self.promote::<SalesMetrics>(period),
                Domain::Engagement => self.promote::<EngagementMetrics>(period),
            };
            match result {
                Ok(r) => report.merge(&r),
                Err(e) => {
                    tracing::error!(%domain, %period, "Promotion failed: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        let report = report.finish(started);
        tracing::info!(
            %period,
            buckets = report.records_processed,
            slots = report.slots_written,
            elapsed_ms = report.execution_time_ms,
            "Promotion complete"
        );
        Ok(report)
    }

    fn promote<M: MetricSet>(&self, period: YearMonth) -> Result<RunReport> {
        let buckets: Vec<MonthlyBucket<M>> = self
            .store
            .monthly_buckets(EntityFilter::All, period, period)?;

        let mut fan = FanOut::default();
        for bucket in &buckets {
            let result = self
                .store
                .write_monthly_slot(&bucket.entity_id, period, bucket.totals)
                .map(|w| !w.is_noop());
            fan.record(&bucket.entity_id, result);
        }
        let slots_written = fan.finish()?;

        tracing::debug!(domain = %M::DOMAIN, %period, buckets = buckets.len(), "Domain promoted");
        Ok(RunReport {
            records_processed: buckets.len() as u64,
            slots_written,
            ..Default::default()
        })
    }
}
