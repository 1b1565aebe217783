//! Rollup engine configuration: fold rules, scheduler cadence, retention

use crate::metrics::FoldRules;
use crate::rollup::Schedules;
use anyhow::Context;
use chrono::NaiveTime;
use serde::Deserialize;

/// Parse an `HH:MM` fire time
pub fn parse_time_of_day(s: &str) -> anyhow::Result<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M")
        .with_context(|| format!("invalid time of day '{}', expected HH:MM (UTC)", s))
}

fn hm(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap_or(NaiveTime::MIN)
}

// ─────────────────────────────────────────────────────────────────────────────
// Aggregation
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationConfig {
    /// Accepted quotations in one day that flag it a bestseller day (0 = never)
    pub bestseller_min_accepted: i64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            bestseller_min_accepted: FoldRules::default().bestseller_min_accepted,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct FileAggregationConfig {
    pub bestseller_min_accepted: Option<i64>,
}

impl AggregationConfig {
    pub fn from_file(file: Option<FileAggregationConfig>) -> Self {
        let file = file.unwrap_or_default();
        let defaults = Self::default();
        Self {
            bestseller_min_accepted: file
                .bestseller_min_accepted
                .unwrap_or(defaults.bestseller_min_accepted),
        }
    }

    pub fn fold_rules(&self) -> FoldRules {
        FoldRules {
            bestseller_min_accepted: self.bestseller_min_accepted,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scheduler
// ─────────────────────────────────────────────────────────────────────────────

/// Fire times (UTC) for the background jobs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Run the timers in `rollstat run`
    pub enabled: bool,
    /// Daily aggregation of yesterday
    pub daily_at: NaiveTime,
    /// Promotion of last month, on the 1st
    pub monthly_at: NaiveTime,
    /// Retention sweep, on Mondays
    pub weekly_at: NaiveTime,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            daily_at: hm(0, 15),
            monthly_at: hm(1, 0),
            weekly_at: hm(2, 0),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct FileSchedulerConfig {
    pub enabled: Option<bool>,
    pub daily_at: Option<String>,
    pub monthly_at: Option<String>,
    pub weekly_at: Option<String>,
}

impl SchedulerConfig {
    /// Create from file config with defaults
    ///
    /// Malformed times are an error, and so is a promotion that would fire
    /// before (or with) the aggregation of the month's last day on the 1st.
    pub fn from_file(file: Option<FileSchedulerConfig>) -> anyhow::Result<Self> {
        let file = file.unwrap_or_default();
        let defaults = Self::default();
        let time = |value: Option<String>, default: NaiveTime, key: &str| {
            value
                .map(|s| parse_time_of_day(&s).with_context(|| format!("[scheduler] {}", key)))
                .transpose()
                .map(|t| t.unwrap_or(default))
        };

        let config = Self {
            enabled: file.enabled.unwrap_or(defaults.enabled),
            daily_at: time(file.daily_at, defaults.daily_at, "daily_at")?,
            monthly_at: time(file.monthly_at, defaults.monthly_at, "monthly_at")?,
            weekly_at: time(file.weekly_at, defaults.weekly_at, "weekly_at")?,
        };
        anyhow::ensure!(
            config.monthly_at > config.daily_at,
            "[scheduler] monthly_at ({}) must be later than daily_at ({})",
            config.monthly_at.format("%H:%M"),
            config.daily_at.format("%H:%M")
        );
        Ok(config)
    }

    pub fn schedules(&self) -> Schedules {
        Schedules::at(self.daily_at, self.monthly_at, self.weekly_at)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Retention
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionConfig {
    /// Days processed events are kept (0 = forever)
    pub retention_days: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self { retention_days: 90 }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct FileRetentionConfig {
    pub retention_days: Option<u32>,
}

impl RetentionConfig {
    pub fn from_file(file: Option<FileRetentionConfig>) -> Self {
        let file = file.unwrap_or_default();
        Self {
            retention_days: file
                .retention_days
                .unwrap_or(Self::default().retention_days),
        }
    }
}
