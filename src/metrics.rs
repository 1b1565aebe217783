//! Metric sets held in bucket slots, and metric identifiers for queries
//!
//! Every slot of a bucket holds one fixed metric set for its domain. Metric
//! sets are integer-valued so delta arithmetic is exact and totals always
//! equal the sum of their slots. All arithmetic is checked: a sum that leaves
//! the i64 range fails the entity with `RollupError::Overflow` instead of
//! wrapping into the totals.

use crate::error::{Result, RollupError};
use crate::events::{ActivityEvent, Domain, EventKind};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::str::FromStr;

/// Settings that shape how a day of events is reduced into a slot
#[derive(Debug, Clone, Copy)]
pub struct FoldRules {
    /// Accepted quotations in one day needed for the bestseller flag
    pub bestseller_min_accepted: i64,
}

impl Default for FoldRules {
    fn default() -> Self {
        Self {
            bestseller_min_accepted: 3,
        }
    }
}

/// A fixed set of integer metrics stored in one bucket slot
pub trait MetricSet:
    Debug + Default + Copy + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Identifier type for a single metric of this set
    type Metric: Copy + Debug;

    /// Domain whose events fold into this set
    const DOMAIN: Domain;

    /// Reduce one entity's events for one day into a slot value
    fn reduce<'a>(
        events: impl IntoIterator<Item = &'a ActivityEvent>,
        rules: &FoldRules,
    ) -> Result<Self>;

    /// Slot value of the union of two disjoint event sets of the same day
    ///
    /// Counters add up; per-day derived metrics are computed again from the
    /// merged counters rather than summed.
    fn merge(self, other: Self, rules: &FoldRules) -> Result<Self>;

    /// Field-wise sum, `None` on overflow
    fn checked_add(self, rhs: Self) -> Option<Self>;

    /// Field-wise difference, `None` on overflow
    fn checked_sub(self, rhs: Self) -> Option<Self>;

    /// Look up a single metric
    fn value(&self, metric: Self::Metric) -> i64;

    fn is_zero(&self) -> bool {
        *self == Self::default()
    }

    fn try_add(self, rhs: Self) -> Result<Self> {
        self.checked_add(rhs).ok_or(RollupError::Overflow {
            domain: Self::DOMAIN,
        })
    }

    fn try_sub(self, rhs: Self) -> Result<Self> {
        self.checked_sub(rhs).ok_or(RollupError::Overflow {
            domain: Self::DOMAIN,
        })
    }
}

/// Look up a metric in a slot by identifier
pub fn metric_value<M: MetricSet>(slot: &M, metric: M::Metric) -> i64 {
    slot.value(metric)
}

// ─────────────────────────────────────────────────────────────────────────────
// Sales
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SalesMetrics {
    pub count: i64,
    pub amount: i64,
    pub profit: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SalesMetric {
    Count,
    Amount,
    Profit,
}

impl MetricSet for SalesMetrics {
    type Metric = SalesMetric;
    const DOMAIN: Domain = Domain::Sales;

    fn reduce<'a>(
        events: impl IntoIterator<Item = &'a ActivityEvent>,
        _rules: &FoldRules,
    ) -> Result<Self> {
        let mut out = Self::default();
        for event in events {
            if let EventKind::Sale { amount, profit } = event.kind {
                out = out.try_add(Self {
                    count: 1,
                    amount,
                    profit,
                })?;
            }
        }
        Ok(out)
    }

    fn merge(self, other: Self, _rules: &FoldRules) -> Result<Self> {
        self.try_add(other)
    }

    fn checked_add(self, rhs: Self) -> Option<Self> {
        Some(Self {
            count: self.count.checked_add(rhs.count)?,
            amount: self.amount.checked_add(rhs.amount)?,
            profit: self.profit.checked_add(rhs.profit)?,
        })
    }

    fn checked_sub(self, rhs: Self) -> Option<Self> {
        Some(Self {
            count: self.count.checked_sub(rhs.count)?,
            amount: self.amount.checked_sub(rhs.amount)?,
            profit: self.profit.checked_sub(rhs.profit)?,
        })
    }

    fn value(&self, metric: SalesMetric) -> i64 {
        match metric {
            SalesMetric::Count => self.count,
            SalesMetric::Amount => self.amount,
            SalesMetric::Profit => self.profit,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Engagement
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngagementMetrics {
    pub views: i64,
    pub sent: i64,
    pub accepted: i64,
    pub rejected: i64,
    pub in_progress: i64,
    /// views + 2·sent + 3·in_progress + 5·accepted
    pub popularity: i64,
    /// 1 on days that reached the bestseller threshold
    pub bestseller: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngagementMetric {
    Views,
    Sent,
    Accepted,
    Rejected,
    InProgress,
    Popularity,
    Bestseller,
}

impl EngagementMetrics {
    /// Fill `popularity` and `bestseller` from the day's counters
    fn derive(mut self, rules: &FoldRules) -> Result<Self> {
        let weighted = || {
            self.views
                .checked_add(self.sent.checked_mul(2)?)?
                .checked_add(self.in_progress.checked_mul(3)?)?
                .checked_add(self.accepted.checked_mul(5)?)
        };
        self.popularity = weighted().ok_or(RollupError::Overflow {
            domain: Domain::Engagement,
        })?;
        self.bestseller = i64::from(
            rules.bestseller_min_accepted > 0 && self.accepted >= rules.bestseller_min_accepted,
        );
        Ok(self)
    }
}

impl MetricSet for EngagementMetrics {
    type Metric = EngagementMetric;
    const DOMAIN: Domain = Domain::Engagement;

    fn reduce<'a>(
        events: impl IntoIterator<Item = &'a ActivityEvent>,
        rules: &FoldRules,
    ) -> Result<Self> {
        let mut out = Self::default();
        for event in events {
            match event.kind {
                EventKind::View => out.views += 1,
                EventKind::QuotationSent => out.sent += 1,
                EventKind::QuotationAccepted => out.accepted += 1,
                EventKind::QuotationRejected => out.rejected += 1,
                EventKind::QuotationInProgress => out.in_progress += 1,
                EventKind::Sale { .. } => {}
            }
        }
        out.derive(rules)
    }

    fn merge(self, other: Self, rules: &FoldRules) -> Result<Self> {
        let counters = Self {
            popularity: 0,
            bestseller: 0,
            ..self.try_add(other)?
        };
        counters.derive(rules)
    }

    fn checked_add(self, rhs: Self) -> Option<Self> {
        Some(Self {
            views: self.views.checked_add(rhs.views)?,
            sent: self.sent.checked_add(rhs.sent)?,
            accepted: self.accepted.checked_add(rhs.accepted)?,
            rejected: self.rejected.checked_add(rhs.rejected)?,
            in_progress: self.in_progress.checked_add(rhs.in_progress)?,
            popularity: self.popularity.checked_add(rhs.popularity)?,
            bestseller: self.bestseller.checked_add(rhs.bestseller)?,
        })
    }

    fn checked_sub(self, rhs: Self) -> Option<Self> {
        Some(Self {
            views: self.views.checked_sub(rhs.views)?,
            sent: self.sent.checked_sub(rhs.sent)?,
            accepted: self.accepted.checked_sub(rhs.accepted)?,
            rejected: self.rejected.checked_sub(rhs.rejected)?,
            in_progress: self.in_progress.checked_sub(rhs.in_progress)?,
            popularity: self.popularity.checked_sub(rhs.popularity)?,
            bestseller: self.bestseller.checked_sub(rhs.bestseller)?,
        })
    }

    fn value(&self, metric: EngagementMetric) -> i64 {
        match metric {
            EngagementMetric::Views => self.views,
            EngagementMetric::Sent => self.sent,
            EngagementMetric::Accepted => self.accepted,
            EngagementMetric::Rejected => self.rejected,
            EngagementMetric::InProgress => self.in_progress,
            EngagementMetric::Popularity => self.popularity,
            EngagementMetric::Bestseller => self.bestseller,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Metric names at the query boundary
// ─────────────────────────────────────────────────────────────────────────────

/// A metric identifier across both domains
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Sales(SalesMetric),
    Engagement(EngagementMetric),
}

impl Metric {
    pub fn domain(&self) -> Domain {
        match self {
            Self::Sales(_) => Domain::Sales,
            Self::Engagement(_) => Domain::Engagement,
        }
    }

    /// Canonical name (what `from_str` round-trips to)
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sales(SalesMetric::Count) => "count",
            Self::Sales(SalesMetric::Amount) => "amount",
            Self::Sales(SalesMetric::Profit) => "profit",
            Self::Engagement(EngagementMetric::Views) => "views",
            Self::Engagement(EngagementMetric::Sent) => "sent",
            Self::Engagement(EngagementMetric::Accepted) => "accepted",
            Self::Engagement(EngagementMetric::Rejected) => "rejected",
            Self::Engagement(EngagementMetric::InProgress) => "inProgress",
            Self::Engagement(EngagementMetric::Popularity) => "popularity",
            Self::Engagement(EngagementMetric::Bestseller) => "bestseller",
        }
    }
}

impl FromStr for Metric {
    type Err = RollupError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let metric = match s {
            "count" | "salesCount" => Self::Sales(SalesMetric::Count),
            "amount" | "salesAmount" => Self::Sales(SalesMetric::Amount),
            "profit" | "salesProfit" => Self::Sales(SalesMetric::Profit),
            "views" => Self::Engagement(EngagementMetric::Views),
            "sent" => Self::Engagement(EngagementMetric::Sent),
            "accepted" => Self::Engagement(EngagementMetric::Accepted),
            "rejected" => Self::Engagement(EngagementMetric::Rejected),
            "inProgress" | "in_progress" => Self::Engagement(EngagementMetric::InProgress),
            "popularity" => Self::Engagement(EngagementMetric::Popularity),
            "bestseller" => Self::Engagement(EngagementMetric::Bestseller),
            _ => {
                return Err(RollupError::InvalidMetric {
                    name: s.to_string(),
                })
            }
        };
        Ok(metric)
    }
}
