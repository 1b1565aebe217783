//! Time-series queries over the bucket store
//!
//! Queries never touch the activity log. Every calendar period in the
//! requested range produces one point, whether or not any bucket has data for
//! it, so `labels`, `values` and `periods` always have the same length.
//!
//! | Granularity | Periods                     | Source                         |
//! |-------------|-----------------------------|--------------------------------|
//! | day         | each date                   | daily slots of monthly buckets |
//! | week        | each ISO week touching range| weekly slots tagged that week  |
//! | month       | each calendar month         | monthly totals                 |
//! | year        | each calendar year          | yearly totals                  |

use crate::calendar::{
    days_between, monday_of, months_between, weekday_name, weeks_between, years_between, WeekKey,
    YearMonth,
};
use crate::error::{Result, RollupError};
use crate::events::EntityId;
use crate::metrics::{metric_value, EngagementMetrics, Metric, MetricSet, SalesMetrics};
use crate::store::{EntityFilter, MonthlyBucket, SqliteStore, YearlyBucket};
use chrono::{Datelike, Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::str::FromStr;
use std::sync::Arc;

/// Longest day range labelled with weekday names
const WEEKDAY_LABEL_MAX_DAYS: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Day,
    Week,
    Month,
    Year,
}

impl FromStr for Granularity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "day" | "daily" => Ok(Self::Day),
            "week" | "weekly" => Ok(Self::Week),
            "month" | "monthly" => Ok(Self::Month),
            "year" | "yearly" => Ok(Self::Year),
            other => Err(format!(
                "unknown granularity '{}': expected day, week, month or year",
                other
            )),
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
            Self::Year => "year",
        })
    }
}

/// A time-series request as received from a caller
#[derive(Debug, Clone)]
pub struct SeriesRequest {
    /// Entities to sum over; empty means "owned by `owner`" or, with no
    /// owner, every entity in the store
    pub entity_ids: Vec<EntityId>,
    pub owner: Option<String>,
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub granularity: Granularity,
    pub metric: String,
}

/// Calendar descriptor of one point, independent of data
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Period {
    pub label: String,
    pub start: NaiveDate,
    /// Inclusive
    pub end: NaiveDate,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimeSeries {
    pub metric: &'static str,
    pub granularity: Granularity,
    pub labels: Vec<String>,
    pub values: Vec<i64>,
    pub periods: Vec<Period>,
}

impl TimeSeries {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn total(&self) -> i64 {
        self.values.iter().sum()
    }
}

/// Resolves an owner to the entities it owns
pub trait EntityDirectory: Send + Sync {
    fn list_owned_entity_ids(&self, owner: &str) -> anyhow::Result<Vec<EntityId>>;
}

/// In-memory directory, for embedding and tests
#[derive(Debug, Default, Clone)]
pub struct StaticDirectory {
    owned: HashMap<String, Vec<EntityId>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_owner(mut self, owner: impl Into<String>, ids: Vec<EntityId>) -> Self {
        self.owned.insert(owner.into(), ids);
        self
    }
}

impl EntityDirectory for StaticDirectory {
    fn list_owned_entity_ids(&self, owner: &str) -> anyhow::Result<Vec<EntityId>> {
        Ok(self.owned.get(owner).cloned().unwrap_or_default())
    }
}

/// Read-only query engine
pub struct QueryEngine {
    store: Arc<SqliteStore>,
    directory: Option<Arc<dyn EntityDirectory>>,
}

impl QueryEngine {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self {
            store,
            directory: None,
        }
    }

    pub fn with_directory(mut self, directory: Arc<dyn EntityDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Build the series described by `req`
    ///
    /// # Errors
    /// `InvalidMetric` for an unknown metric name, `InvalidRange` when
    /// `from > to`, `Storage` if buckets cannot be read.
    pub fn query(&self, req: &SeriesRequest) -> Result<TimeSeries> {
        let metric: Metric = req.metric.parse()?;
        if req.from > req.to {
            return Err(RollupError::InvalidRange {
                from: req.from,
                to: req.to,
            });
        }

        let scope = self.resolve_scope(req)?;
        let filter = match &scope {
            Some(ids) => EntityFilter::Only(ids),
            None => EntityFilter::All,
        };

        let (periods, values) = match metric {
            Metric::Sales(m) => {
                self.series::<SalesMetrics>(m, filter, req.from, req.to, req.granularity)?
            }
            Metric::Engagement(m) => {
                self.series::<EngagementMetrics>(m, filter, req.from, req.to, req.granularity)?
            }
        };

        tracing::debug!(
            metric = metric.name(),
            granularity = %req.granularity,
            points = values.len(),
            "Time series built"
        );

        Ok(TimeSeries {
            metric: metric.name(),
            granularity: req.granularity,
            labels: periods.iter().map(|p| p.label.clone()).collect(),
            values,
            periods,
        })
    }

    /// Entities to read, or `None` for every entity
    fn resolve_scope(&self, req: &SeriesRequest) -> Result<Option<Vec<EntityId>>> {
        if !req.entity_ids.is_empty() {
            return Ok(Some(req.entity_ids.clone()));
        }
        let Some(owner) = req.owner.as_deref() else {
            return Ok(None);
        };
        match &self.directory {
            Some(directory) => directory
                .list_owned_entity_ids(owner)
                .map(Some)
                .map_err(|e| RollupError::Storage(format!("entity directory: {:#}", e))),
            None => {
                tracing::warn!(owner, "No entity directory configured; owner owns nothing");
                Ok(Some(Vec::new()))
            }
        }
    }

    fn series<M: MetricSet>(
        &self,
        metric: M::Metric,
        filter: EntityFilter<'_>,
        from: NaiveDate,
        to: NaiveDate,
        granularity: Granularity,
    ) -> Result<(Vec<Period>, Vec<i64>)> {
        match granularity {
            Granularity::Day => self.daily::<M>(metric, filter, from, to),
            Granularity::Week => self.weekly::<M>(metric, filter, from, to),
            Granularity::Month => self.monthly::<M>(metric, filter, from, to),
            Granularity::Year => self.yearly::<M>(metric, filter, from, to),
        }
    }

    fn daily<M: MetricSet>(
        &self,
        metric: M::Metric,
        filter: EntityFilter<'_>,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<(Vec<Period>, Vec<i64>)> {
        let buckets: Vec<MonthlyBucket<M>> = self
            .store
            .monthly_buckets(filter, YearMonth::of(from), YearMonth::of(to))?;

        let mut by_day: HashMap<(YearMonth, u32), i64> = HashMap::new();
        for bucket in &buckets {
            for (day, slot) in &bucket.days {
                accumulate::<M, _>(&mut by_day, (bucket.period, *day), metric_value(slot, metric))?;
            }
        }

        let days = days_between(from, to);
        let short = days.len() <= WEEKDAY_LABEL_MAX_DAYS;
        let mut periods = Vec::with_capacity(days.len());
        let mut values = Vec::with_capacity(days.len());
        for date in days {
            let label = if short {
                weekday_name(date).to_string()
            } else {
                date.format("%Y-%m-%d").to_string()
            };
            periods.push(Period {
                label,
                start: date,
                end: date,
            });
            values.push(
                by_day
                    .get(&(YearMonth::of(date), date.day()))
                    .copied()
                    .unwrap_or(0),
            );
        }
        Ok((periods, values))
    }

    fn weekly<M: MetricSet>(
        &self,
        metric: M::Metric,
        filter: EntityFilter<'_>,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<(Vec<Period>, Vec<i64>)> {
        let weeks = weeks_between(from, to);
        // Whole weeks are reported, so read the months their edge days fall in
        let first = monday_of(from);
        let last = weeks
            .last()
            .map(|(_, monday)| *monday + Duration::days(6))
            .unwrap_or(to);
        let buckets: Vec<MonthlyBucket<M>> = self
            .store
            .monthly_buckets(filter, YearMonth::of(first), YearMonth::of(last))?;

        // A week spanning two months is split across two buckets' slots
        let mut by_week: HashMap<WeekKey, i64> = HashMap::new();
        for bucket in &buckets {
            for slot in bucket.weeks.values() {
                accumulate::<M, _>(&mut by_week, slot.week, metric_value(&slot.metrics, metric))?;
            }
        }

        let mut periods = Vec::with_capacity(weeks.len());
        let mut values = Vec::with_capacity(weeks.len());
        for (key, monday) in weeks {
            periods.push(Period {
                label: format!("Week {}", key.week),
                start: monday,
                end: monday + Duration::days(6),
            });
            values.push(by_week.get(&key).copied().unwrap_or(0));
        }
        Ok((periods, values))
    }

    fn monthly<M: MetricSet>(
        &self,
        metric: M::Metric,
        filter: EntityFilter<'_>,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<(Vec<Period>, Vec<i64>)> {
        let buckets: Vec<MonthlyBucket<M>> = self
            .store
            .monthly_buckets(filter, YearMonth::of(from), YearMonth::of(to))?;

        let mut by_month: HashMap<YearMonth, i64> = HashMap::new();
        for bucket in &buckets {
            accumulate::<M, _>(&mut by_month, bucket.period, metric_value(&bucket.totals, metric))?;
        }

        let months = months_between(from, to);
        let mut periods = Vec::with_capacity(months.len());
        let mut values = Vec::with_capacity(months.len());
        for period in months {
            periods.push(Period {
                label: period.to_string(),
                start: period.first_day(),
                end: period.last_day(),
            });
            values.push(by_month.get(&period).copied().unwrap_or(0));
        }
        Ok((periods, values))
    }

    fn yearly<M: MetricSet>(
        &self,
        metric: M::Metric,
        filter: EntityFilter<'_>,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<(Vec<Period>, Vec<i64>)> {
        let buckets: Vec<YearlyBucket<M>> =
            self.store.yearly_buckets(filter, from.year(), to.year())?;

        let mut by_year: HashMap<i32, i64> = HashMap::new();
        for bucket in &buckets {
            accumulate::<M, _>(&mut by_year, bucket.year, metric_value(&bucket.totals, metric))?;
        }

        let years = years_between(from, to);
        let mut periods = Vec::with_capacity(years.len());
        let mut values = Vec::with_capacity(years.len());
        for year in years {
            let start = NaiveDate::from_ymd_opt(year, 1, 1).unwrap_or(from);
            let end = NaiveDate::from_ymd_opt(year, 12, 31).unwrap_or(to);
            periods.push(Period {
                label: format!("{:04}", year),
                start,
                end,
            });
            values.push(by_year.get(&year).copied().unwrap_or(0));
        }
        Ok((periods, values))
    }
}

/// Add one entity's value into the running sum for `key`
fn accumulate<M: MetricSet, K: Eq + Hash>(
    sums: &mut HashMap<K, i64>,
    key: K,
    value: i64,
) -> Result<()> {
    let sum = sums.entry(key).or_default();
    *sum = sum.checked_add(value).ok_or(RollupError::Overflow {
        domain: M::DOMAIN,
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventKind, NewEvent};
    use crate::metrics::FoldRules;
    use crate::rollup::{Aggregator, Promoter};
    use crate::store::test_support::temp_store;
    use chrono::{TimeZone, Utc};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn request(
        from: NaiveDate,
        to: NaiveDate,
        granularity: Granularity,
        metric: &str,
    ) -> SeriesRequest {
        SeriesRequest {
            entity_ids: Vec::new(),
            owner: None,
            from,
            to,
            granularity,
            metric: metric.to_string(),
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<SqliteStore>,
        aggregator: Aggregator,
        engine: QueryEngine,
    }

    fn fixture() -> Fixture {
        let (dir, store) = temp_store();
        let store = Arc::new(store);
        Fixture {
            _dir: dir,
            aggregator: Aggregator::new(store.clone(), FoldRules::default()),
            engine: QueryEngine::new(store.clone()),
            store,
        }
    }

    impl Fixture {
        fn sale(&self, entity: &str, amount: i64, day: NaiveDate) {
            let at = Utc.from_utc_datetime(&day.and_hms_opt(12, 0, 0).unwrap());
            self.store
                .append(&NewEvent::sale(entity, amount, amount / 5, at))
                .unwrap();
        }

        fn aggregate(&self, from: NaiveDate, to: NaiveDate) {
            self.aggregator.backfill(from, to).unwrap();
        }
    }

    #[test]
    fn test_empty_store_zero_fills() {
        let f = fixture();
        let series = f
            .engine
            .query(&request(date(2024, 1, 1), date(2024, 1, 5), Granularity::Day, "salesCount"))
            .unwrap();
        assert_eq!(series.values, vec![0; 5]);
        assert_eq!(series.labels, vec!["Mon", "Tue", "Wed", "Thu", "Fri"]);
        assert_eq!(series.periods.len(), 5);
    }

    #[test]
    fn test_long_day_range_uses_iso_labels() {
        let f = fixture();
        let series = f
            .engine
            .query(&request(date(2024, 1, 1), date(2024, 1, 10), Granularity::Day, "count"))
            .unwrap();
        assert_eq!(series.len(), 10);
        assert_eq!(series.labels[0], "2024-01-01");
        assert_eq!(series.labels[9], "2024-01-10");
    }

    #[test]
    fn test_month_scenario() {
        let f = fixture();
        for _ in 0..3 {
            f.sale("p-1", 100, date(2024, 3, 5));
        }
        for _ in 0..2 {
            f.sale("p-1", 50, date(2024, 3, 6));
        }
        f.aggregate(date(2024, 3, 5), date(2024, 3, 6));

        let series = f
            .engine
            .query(&request(date(2024, 3, 1), date(2024, 3, 31), Granularity::Month, "salesAmount"))
            .unwrap();
        assert_eq!(series.labels, vec!["2024-03"]);
        assert_eq!(series.values, vec![400]);
        assert_eq!(series.metric, "amount");

        let counts = f
            .engine
            .query(&request(date(2024, 3, 5), date(2024, 3, 6), Granularity::Day, "count"))
            .unwrap();
        assert_eq!(counts.values, vec![3, 2]);
    }

    #[test]
    fn test_daily_sums_match_monthly_total() {
        let f = fixture();
        for (day, amount) in [(1, 10), (4, 25), (15, 40), (29, 5), (31, 7)] {
            f.sale("p-1", amount, date(2024, 3, day));
            f.sale("p-2", amount * 2, date(2024, 3, day));
        }
        f.aggregate(date(2024, 3, 1), date(2024, 3, 31));

        let daily = f
            .engine
            .query(&request(date(2024, 3, 1), date(2024, 3, 31), Granularity::Day, "profit"))
            .unwrap();
        let monthly = f
            .engine
            .query(&request(date(2024, 3, 1), date(2024, 3, 31), Granularity::Month, "profit"))
            .unwrap();
        assert_eq!(daily.len(), 31);
        assert_eq!(daily.total(), monthly.values[0]);
    }

    #[test]
    fn test_week_spanning_two_months() {
        let f = fixture();
        // ISO week 5 of 2024 runs Mon Jan 29 to Sun Feb 4
        f.sale("p-1", 10, date(2024, 1, 30));
        f.sale("p-1", 20, date(2024, 2, 2));
        f.sale("p-1", 99, date(2024, 2, 5));
        f.aggregate(date(2024, 1, 29), date(2024, 2, 5));

        let series = f
            .engine
            .query(&request(date(2024, 1, 31), date(2024, 2, 6), Granularity::Week, "amount"))
            .unwrap();
        assert_eq!(series.labels, vec!["Week 5", "Week 6"]);
        assert_eq!(series.values, vec![30, 99]);
        assert_eq!(series.periods[0].start, date(2024, 1, 29));
        assert_eq!(series.periods[0].end, date(2024, 2, 4));
    }

    #[test]
    fn test_yearly_reads_promoted_totals() {
        let f = fixture();
        f.sale("p-1", 100, date(2024, 3, 5));
        f.sale("p-1", 30, date(2024, 4, 2));
        f.aggregate(date(2024, 3, 5), date(2024, 4, 2));
        let promoter = Promoter::new(f.store.clone());
        promoter.run(YearMonth::new(2024, 3).unwrap()).unwrap();
        promoter.run(YearMonth::new(2024, 4).unwrap()).unwrap();

        let series = f
            .engine
            .query(&request(date(2023, 6, 1), date(2024, 12, 31), Granularity::Year, "amount"))
            .unwrap();
        assert_eq!(series.labels, vec!["2023", "2024"]);
        assert_eq!(series.values, vec![0, 130]);
    }

    #[test]
    fn test_entity_scoping() {
        let f = fixture();
        f.sale("p-1", 100, date(2024, 3, 5));
        f.sale("p-2", 10, date(2024, 3, 5));
        f.sale("p-3", 1, date(2024, 3, 5));
        f.aggregate(date(2024, 3, 5), date(2024, 3, 5));

        let mut req = request(date(2024, 3, 5), date(2024, 3, 5), Granularity::Day, "amount");
        assert_eq!(f.engine.query(&req).unwrap().values, vec![111]);

        req.entity_ids = vec!["p-1".into(), "p-3".into()];
        assert_eq!(f.engine.query(&req).unwrap().values, vec![101]);

        let directory = StaticDirectory::new().with_owner("seller-1", vec!["p-2".into()]);
        let engine = QueryEngine::new(f.store.clone()).with_directory(Arc::new(directory));
        req.entity_ids.clear();
        req.owner = Some("seller-1".into());
        assert_eq!(engine.query(&req).unwrap().values, vec![10]);

        req.owner = Some("nobody".into());
        assert_eq!(engine.query(&req).unwrap().values, vec![0]);
    }

    #[test]
    fn test_engagement_metric_query() {
        let f = fixture();
        let at = Utc.with_ymd_and_hms(2024, 3, 5, 8, 0, 0).unwrap();
        for kind in [EventKind::View, EventKind::View, EventKind::QuotationAccepted] {
            f.store.append(&NewEvent::new("svc-1", kind, at)).unwrap();
        }
        f.aggregate(date(2024, 3, 5), date(2024, 3, 5));

        let views = f
            .engine
            .query(&request(date(2024, 3, 5), date(2024, 3, 5), Granularity::Day, "views"))
            .unwrap();
        assert_eq!(views.values, vec![2]);

        let popularity = f
            .engine
            .query(&request(date(2024, 3, 1), date(2024, 3, 31), Granularity::Month, "popularity"))
            .unwrap();
        assert_eq!(popularity.values, vec![2 + 5]);
    }

    #[test]
    fn test_unknown_metric_rejected() {
        let f = fixture();
        let err = f
            .engine
            .query(&request(date(2024, 1, 1), date(2024, 1, 5), Granularity::Day, "revenue"))
            .unwrap_err();
        assert!(matches!(err, RollupError::InvalidMetric { ref name } if name == "revenue"));
    }

    #[test]
    fn test_inverted_range_rejected() {
        let f = fixture();
        let err = f
            .engine
            .query(&request(date(2024, 1, 5), date(2024, 1, 1), Granularity::Day, "count"))
            .unwrap_err();
        assert!(matches!(err, RollupError::InvalidRange { .. }));
    }

    #[test]
    fn test_cross_entity_sum_overflow_is_an_error() {
        let f = fixture();
        let huge = SalesMetrics {
            count: 1,
            amount: i64::MAX,
            profit: 0,
        };
        for entity in ["p-1", "p-2"] {
            f.store
                .write_daily_slot(entity, date(2024, 3, 5), huge)
                .unwrap();
        }

        let err = f
            .engine
            .query(&request(date(2024, 3, 1), date(2024, 3, 31), Granularity::Month, "amount"))
            .unwrap_err();
        assert!(matches!(err, RollupError::Overflow { .. }));
    }

    #[test]
    fn test_granularity_parsing() {
        assert_eq!("Week".parse::<Granularity>().unwrap(), Granularity::Week);
        assert_eq!("monthly".parse::<Granularity>().unwrap(), Granularity::Month);
        assert!("hour".parse::<Granularity>().is_err());
    }
}
