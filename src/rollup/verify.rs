//! Consistency check over every stored bucket
//!
//! Totals must equal the sum of their slots, and each weekly slot must equal
//! the sum of the days in its row. A violation means a write bypassed the
//! delta path (or a document was edited by hand).

use crate::calendar::YearMonth;
use crate::error::Result;
use crate::metrics::{EngagementMetrics, MetricSet, SalesMetrics};
use crate::store::{EntityFilter, MonthlyBucket, SqliteStore, YearlyBucket};
use serde::Serialize;

const EARLIEST: YearMonth = YearMonth { year: 0, month: 1 };
const LATEST: YearMonth = YearMonth {
    year: 9999,
    month: 12,
};

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyReport {
    pub monthly_checked: usize,
    pub yearly_checked: usize,
    pub violations: Vec<String>,
}

impl VerifyReport {
    pub fn is_consistent(&self) -> bool {
        self.violations.is_empty()
    }
}

pub fn verify_buckets(store: &SqliteStore) -> Result<VerifyReport> {
    let mut report = VerifyReport::default();
    check_domain::<SalesMetrics>(store, &mut report)?;
    check_domain::<EngagementMetrics>(store, &mut report)?;

    if report.is_consistent() {
        tracing::info!(
            monthly = report.monthly_checked,
            yearly = report.yearly_checked,
            "Buckets consistent"
        );
    } else {
        tracing::warn!(
            violations = report.violations.len(),
            "Bucket consistency violations found"
        );
    }
    Ok(report)
}

fn check_domain<M: MetricSet>(store: &SqliteStore, report: &mut VerifyReport) -> Result<()> {
    let monthly: Vec<MonthlyBucket<M>> =
        store.monthly_buckets(EntityFilter::All, EARLIEST, LATEST)?;
    for bucket in &monthly {
        let label = format!("{} {} {}", M::DOMAIN, bucket.entity_id, bucket.period);
        if let Some(problem) = mismatch(&bucket.totals, bucket.sum_of_days(), "sum of days") {
            report.violations.push(format!("{}: totals {}", label, problem));
        }
        for (index, slot) in &bucket.weeks {
            if let Some(problem) = mismatch(&slot.metrics, bucket.sum_of_row(*index), "days sum") {
                report
                    .violations
                    .push(format!("{}: week row {} {}", label, index, problem));
            }
        }
    }
    report.monthly_checked += monthly.len();

    let yearly: Vec<YearlyBucket<M>> =
        store.yearly_buckets(EntityFilter::All, EARLIEST.year, LATEST.year)?;
    for bucket in &yearly {
        if let Some(problem) = mismatch(&bucket.totals, bucket.sum_of_months(), "sum of months") {
            report.violations.push(format!(
                "{} {} {}: totals {}",
                M::DOMAIN,
                bucket.entity_id,
                bucket.year,
                problem
            ));
        }
    }
    report.yearly_checked += yearly.len();
    Ok(())
}

/// Describe how `stored` differs from a recomputed sum, if it does
fn mismatch<M: MetricSet>(stored: &M, recomputed: Result<M>, what: &str) -> Option<String> {
    match recomputed {
        Ok(sum) if sum == *stored => None,
        Ok(sum) => Some(format!("{:?} != {} {:?}", stored, what, sum)),
        Err(e) => Some(format!("{:?}, {} failed: {}", stored, what, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::{exec, temp_store};
    use chrono::NaiveDate;
    use rusqlite::params;

    #[test]
    fn test_delta_writes_stay_consistent() {
        let (_dir, store) = temp_store();
        let sales = |n| SalesMetrics {
            count: n,
            amount: n * 10,
            profit: n,
        };
        for day in [1, 3, 4, 17, 31] {
            let date = NaiveDate::from_ymd_opt(2024, 3, day).unwrap();
            store.write_daily_slot("p-1", date, sales(day as i64)).unwrap();
            store.write_daily_slot("p-1", date, sales(day as i64 + 1)).unwrap();
        }
        store
            .write_monthly_slot("p-1", YearMonth::new(2024, 3).unwrap(), sales(9))
            .unwrap();

        let report = verify_buckets(&store).unwrap();
        assert_eq!(report.monthly_checked, 1);
        assert_eq!(report.yearly_checked, 1);
        assert!(report.is_consistent(), "{:?}", report.violations);
    }

    #[test]
    fn test_hand_edited_totals_are_flagged() {
        let (_dir, store) = temp_store();
        let date = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        store
            .write_daily_slot(
                "p-1",
                date,
                SalesMetrics {
                    count: 1,
                    amount: 10,
                    profit: 1,
                },
            )
            .unwrap();

        let mut bucket: MonthlyBucket<SalesMetrics> = store
            .monthly_bucket("p-1", YearMonth::of(date))
            .unwrap()
            .unwrap();
        bucket.totals.amount = 999;
        exec(
            &store,
            "UPDATE monthly_buckets SET doc = ?1",
            params![serde_json::to_string(&bucket).unwrap()],
        );

        let report = verify_buckets(&store).unwrap();
        assert_eq!(report.violations.len(), 1);
        assert!(report.violations[0].contains("p-1"));
    }
}
