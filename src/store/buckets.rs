//! Monthly and yearly bucket documents
//!
//! A monthly bucket keeps sparse daily slots (keyed by day of month), sparse
//! weekly slots (keyed by Monday-aligned row, tagged with their ISO week) and
//! running totals. A yearly bucket keeps sparse monthly slots and totals.
//! Slots are only ever overwritten; totals move by the delta between the new
//! and previous slot value, never by re-summing.

use super::activity::{mark_ids, select_entity_window};
use super::{now_millis, SqliteStore};
use crate::calendar::{day_window, week_slot, WeekKey, YearMonth, MAX_WEEK_SLOT};
use crate::error::Result;
use crate::events::{ActivityEvent, EntityId, EventId};
use crate::metrics::MetricSet;
use chrono::{Datelike, NaiveDate};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Weekly slot tagged with the ISO week its days belong to
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeekSlot<M> {
    pub week: WeekKey,
    pub metrics: M,
}

/// Aggregates for one entity over one calendar month
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyBucket<M> {
    pub entity_id: EntityId,
    pub period: YearMonth,
    pub days: BTreeMap<u32, M>,
    pub weeks: BTreeMap<u32, WeekSlot<M>>,
    pub totals: M,
}

impl<M: MetricSet> MonthlyBucket<M> {
    pub fn empty(entity_id: impl Into<EntityId>, period: YearMonth) -> Self {
        Self {
            entity_id: entity_id.into(),
            period,
            days: BTreeMap::new(),
            weeks: BTreeMap::new(),
            totals: M::default(),
        }
    }

    /// Daily slot for a day of month (`None` = no activity recorded)
    pub fn day(&self, day: u32) -> Option<&M> {
        self.days.get(&day)
    }

    /// Sum of daily slots, used to check the totals invariant
    pub fn sum_of_days(&self) -> Result<M> {
        self.days
            .values()
            .try_fold(M::default(), |sum, slot| sum.try_add(*slot))
    }

    /// Sum of the daily slots that fall in weekly row `index`
    pub fn sum_of_row(&self, index: u32) -> Result<M> {
        let mut sum = M::default();
        for (day, slot) in &self.days {
            let Some(date) = NaiveDate::from_ymd_opt(self.period.year, self.period.month, *day)
            else {
                continue;
            };
            if week_slot(date) == index {
                sum = sum.try_add(*slot)?;
            }
        }
        Ok(sum)
    }

    /// Overwrite one daily slot and move totals and the week row by the delta
    ///
    /// Returns the delta that was applied (zero when the slot already held
    /// `value`).
    fn write_day(&mut self, date: NaiveDate, value: M) -> Result<M> {
        let day = date.day();
        let previous = self.days.get(&day).copied().unwrap_or_default();
        let delta = value.try_sub(previous)?;
        let totals = self.totals.try_add(delta)?;

        let index = week_slot(date);
        if index > MAX_WEEK_SLOT {
            tracing::warn!(
                entity = %self.entity_id,
                %date,
                index,
                "Week index out of range, weekly slot not updated"
            );
            self.days.insert(day, value);
            self.totals = totals;
            return Ok(delta);
        }

        let key = WeekKey::of(date);
        let week_metrics = self
            .weeks
            .get(&index)
            .map(|w| w.metrics)
            .unwrap_or_default()
            .try_add(delta)?;

        // Every sum is checked before anything is mutated
        self.days.insert(day, value);
        self.totals = totals;
        let slot = self.weeks.entry(index).or_insert(WeekSlot {
            week: key,
            metrics: M::default(),
        });
        if slot.week != key {
            tracing::warn!(
                entity = %self.entity_id,
                %date,
                "Weekly slot {} tagged {:?}, expected {:?}; retagging",
                index,
                slot.week,
                key
            );
            slot.week = key;
        }
        slot.metrics = week_metrics;
        Ok(delta)
    }
}

/// Aggregates for one entity over one calendar year
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YearlyBucket<M> {
    pub entity_id: EntityId,
    pub year: i32,
    pub months: BTreeMap<u32, M>,
    pub totals: M,
}

impl<M: MetricSet> YearlyBucket<M> {
    pub fn empty(entity_id: impl Into<EntityId>, year: i32) -> Self {
        Self {
            entity_id: entity_id.into(),
            year,
            months: BTreeMap::new(),
            totals: M::default(),
        }
    }

    pub fn sum_of_months(&self) -> Result<M> {
        self.months
            .values()
            .try_fold(M::default(), |sum, slot| sum.try_add(*slot))
    }

    fn write_month(&mut self, month: u32, value: M) -> Result<M> {
        let previous = self.months.get(&month).copied().unwrap_or_default();
        let delta = value.try_sub(previous)?;
        self.totals = self.totals.try_add(delta)?;
        self.months.insert(month, value);
        Ok(delta)
    }
}

/// Outcome of a slot overwrite
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlotWrite<M> {
    /// Slot value before the write (`None` = slot was absent)
    pub previous: Option<M>,
    /// Amount the totals moved by
    pub delta: M,
}

impl<M: MetricSet> SlotWrite<M> {
    /// Whether the write left stored state untouched
    pub fn is_noop(&self) -> bool {
        self.previous.is_some() && self.delta.is_zero()
    }
}

/// Outcome of folding one entity's day
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DayFold<M> {
    /// Slot write, `None` when the entity had nothing pending
    pub write: Option<SlotWrite<M>>,
    /// Events marked processed by this fold
    pub consumed: u64,
}

/// Which entities a bucket read covers
#[derive(Debug, Clone, Copy)]
pub enum EntityFilter<'a> {
    All,
    Only(&'a [EntityId]),
}

impl SqliteStore {
    /// Overwrite the daily slot of `date` for one entity
    ///
    /// Runs as one immediate transaction: read the bucket, replace the slot,
    /// move monthly totals and the weekly slot by the delta, write back.
    /// Nothing is written when the slot already holds `value`.
    pub fn write_daily_slot<M: MetricSet>(
        &self,
        entity_id: &str,
        date: NaiveDate,
        value: M,
    ) -> Result<SlotWrite<M>> {
        let period = YearMonth::of(date);
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let bucket = read_monthly(&tx, entity_id, period)?
            .unwrap_or_else(|| MonthlyBucket::empty(entity_id, period));
        let write = overwrite_day(&tx, bucket, date, value)?;
        tx.commit()?;
        Ok(write)
    }

    /// Fold one entity's day into its daily slot and retire its pending events
    ///
    /// One immediate transaction covers the whole step: read the entity's
    /// retained events of the day and its monthly bucket, let `derive` compute
    /// the slot from the stored value and those events, overwrite the slot,
    /// then mark the events that were still unprocessed. The slot never
    /// reflects an event that is not marked, and a marked event is always in
    /// the slot.
    pub fn fold_daily_slot<M, F>(
        &self,
        entity_id: &str,
        date: NaiveDate,
        derive: F,
    ) -> Result<DayFold<M>>
    where
        M: MetricSet,
        F: FnOnce(Option<M>, &[ActivityEvent]) -> Result<M>,
    {
        let period = YearMonth::of(date);
        let (start, end) = day_window(date);
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let events = select_entity_window(&tx, M::DOMAIN, entity_id, start, end)?;
        let pending: Vec<EventId> = events
            .iter()
            .filter(|e| !e.processed)
            .map(|e| e.id)
            .collect();
        if pending.is_empty() {
            // Another run got here first
            return Ok(DayFold {
                write: None,
                consumed: 0,
            });
        }

        let bucket = read_monthly(&tx, entity_id, period)?
            .unwrap_or_else(|| MonthlyBucket::empty(entity_id, period));
        let value = derive(bucket.day(date.day()).copied(), &events)?;
        let write = overwrite_day(&tx, bucket, date, value)?;
        let consumed = mark_ids(&tx, &pending)?;
        tx.commit()?;

        Ok(DayFold {
            write: Some(write),
            consumed,
        })
    }

    /// Overwrite the monthly slot of `period` in the owning yearly bucket
    pub fn write_monthly_slot<M: MetricSet>(
        &self,
        entity_id: &str,
        period: YearMonth,
        value: M,
    ) -> Result<SlotWrite<M>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let doc: Option<String> = tx
            .query_row(
                r#"
                SELECT doc FROM yearly_buckets
                WHERE entity_id = ?1 AND domain = ?2 AND year = ?3
                "#,
                params![entity_id, M::DOMAIN.as_str(), period.year],
                |row| row.get(0),
            )
            .optional()?;

        let mut bucket = match doc {
            Some(doc) => serde_json::from_str::<YearlyBucket<M>>(&doc)?,
            None => YearlyBucket::empty(entity_id, period.year),
        };

        let previous = bucket.months.get(&period.month).copied();
        if previous == Some(value) {
            return Ok(SlotWrite {
                previous,
                delta: M::default(),
            });
        }

        let delta = bucket.write_month(period.month, value)?;
        tx.execute(
            r#"
            INSERT INTO yearly_buckets (entity_id, domain, year, doc, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(entity_id, domain, year)
            DO UPDATE SET doc = excluded.doc, updated_at = excluded.updated_at
            "#,
            params![
                entity_id,
                M::DOMAIN.as_str(),
                period.year,
                serde_json::to_string(&bucket)?,
                now_millis(),
            ],
        )?;
        tx.commit()?;

        Ok(SlotWrite { previous, delta })
    }

    pub fn monthly_bucket<M: MetricSet>(
        &self,
        entity_id: &str,
        period: YearMonth,
    ) -> Result<Option<MonthlyBucket<M>>> {
        let conn = self.conn()?;
        read_monthly(&conn, entity_id, period)
    }

    pub fn yearly_bucket<M: MetricSet>(
        &self,
        entity_id: &str,
        year: i32,
    ) -> Result<Option<YearlyBucket<M>>> {
        let conn = self.conn()?;
        let doc: Option<String> = conn
            .query_row(
                r#"
                SELECT doc FROM yearly_buckets
                WHERE entity_id = ?1 AND domain = ?2 AND year = ?3
                "#,
                params![entity_id, M::DOMAIN.as_str(), year],
                |row| row.get(0),
            )
            .optional()?;
        Ok(doc.map(|d| serde_json::from_str(&d)).transpose()?)
    }

    /// Monthly buckets with `from <= period <= to`, optionally limited to entities
    pub fn monthly_buckets<M: MetricSet>(
        &self,
        filter: EntityFilter<'_>,
        from: YearMonth,
        to: YearMonth,
    ) -> Result<Vec<MonthlyBucket<M>>> {
        let base = r#"
            SELECT doc FROM monthly_buckets
            WHERE domain = ? AND (year * 100 + month) BETWEEN ? AND ?
        "#;
        let values = vec![
            Value::Text(M::DOMAIN.as_str().to_string()),
            Value::Integer(i64::from(from.year) * 100 + i64::from(from.month)),
            Value::Integer(i64::from(to.year) * 100 + i64::from(to.month)),
        ];
        self.load_docs(base, values, filter)
    }

    /// Yearly buckets with `from <= year <= to`, optionally limited to entities
    pub fn yearly_buckets<M: MetricSet>(
        &self,
        filter: EntityFilter<'_>,
        from: i32,
        to: i32,
    ) -> Result<Vec<YearlyBucket<M>>> {
        let base = r#"
            SELECT doc FROM yearly_buckets
            WHERE domain = ? AND year BETWEEN ? AND ?
        "#;
        let values = vec![
            Value::Text(M::DOMAIN.as_str().to_string()),
            Value::Integer(i64::from(from)),
            Value::Integer(i64::from(to)),
        ];
        self.load_docs(base, values, filter)
    }

    /// Run a document query, adding an `entity_id IN (...)` clause per chunk
    fn load_docs<T: serde::de::DeserializeOwned>(
        &self,
        base: &str,
        values: Vec<Value>,
        filter: EntityFilter<'_>,
    ) -> Result<Vec<T>> {
        let conn = self.conn()?;
        let mut out = Vec::new();

        let mut run = |sql: &str, values: Vec<Value>| -> Result<()> {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(params_from_iter(values), |row| row.get::<_, String>(0))?;
            for row in rows {
                out.push(serde_json::from_str(&row?)?);
            }
            Ok(())
        };

        match filter {
            EntityFilter::All => run(&format!("{} ORDER BY entity_id", base), values)?,
            EntityFilter::Only(ids) => {
                for chunk in ids.chunks(500) {
                    let placeholders = vec!["?"; chunk.len()].join(", ");
                    let sql = format!(
                        "{} AND entity_id IN ({}) ORDER BY entity_id",
                        base, placeholders
                    );
                    let mut chunk_values = values.clone();
                    chunk_values.extend(chunk.iter().map(|id| Value::Text(id.clone())));
                    run(&sql, chunk_values)?;
                }
            }
        }

        Ok(out)
    }
}

fn read_monthly<M: MetricSet>(
    conn: &Connection,
    entity_id: &str,
    period: YearMonth,
) -> Result<Option<MonthlyBucket<M>>> {
    let doc: Option<String> = conn
        .query_row(
            r#"
            SELECT doc FROM monthly_buckets
            WHERE entity_id = ?1 AND domain = ?2 AND year = ?3 AND month = ?4
            "#,
            params![entity_id, M::DOMAIN.as_str(), period.year, period.month],
            |row| row.get(0),
        )
        .optional()?;
    Ok(doc.map(|d| serde_json::from_str(&d)).transpose()?)
}

/// Replace one daily slot of `bucket` and persist it (no-op if unchanged)
fn overwrite_day<M: MetricSet>(
    conn: &Connection,
    mut bucket: MonthlyBucket<M>,
    date: NaiveDate,
    value: M,
) -> Result<SlotWrite<M>> {
    let previous = bucket.day(date.day()).copied();
    if previous == Some(value) {
        return Ok(SlotWrite {
            previous,
            delta: M::default(),
        });
    }

    let delta = bucket.write_day(date, value)?;
    conn.execute(
        r#"
        INSERT INTO monthly_buckets (entity_id, domain, year, month, doc, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(entity_id, domain, year, month)
        DO UPDATE SET doc = excluded.doc, updated_at = excluded.updated_at
        "#,
        params![
            bucket.entity_id,
            M::DOMAIN.as_str(),
            bucket.period.year,
            bucket.period.month,
            serde_json::to_string(&bucket)?,
            now_millis(),
        ],
    )?;
    Ok(SlotWrite { previous, delta })
}
