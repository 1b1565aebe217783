//! Calendar arithmetic shared by the aggregator and the query engine
//!
//! All windows are UTC. A month is split into at most six Monday-aligned
//! rows; each row holds the days of exactly one ISO week, so a weekly slot
//! can be tagged with that ISO week without ambiguity.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Highest weekly slot index a month can use
pub const MAX_WEEK_SLOT: u32 = 5;

/// Calendar month key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct YearMonth {
    pub year: i32,
    pub month: u32,
}

impl YearMonth {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        (1..=12).contains(&month).then_some(Self { year, month })
    }

    pub fn of(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn first_day(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or(NaiveDate::MIN)
    }

    pub fn last_day(&self) -> NaiveDate {
        self.next().first_day().pred_opt().unwrap_or(NaiveDate::MIN)
    }

    pub fn days(&self) -> u32 {
        self.last_day().day()
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    pub fn prev(&self) -> Self {
        if self.month == 1 {
            Self {
                year: self.year - 1,
                month: 12,
            }
        } else {
            Self {
                year: self.year,
                month: self.month - 1,
            }
        }
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for YearMonth {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (y, m) = s
            .split_once('-')
            .ok_or_else(|| format!("expected YYYY-MM, got '{}'", s))?;
        let year: i32 = y.parse().map_err(|_| format!("bad year in '{}'", s))?;
        let month: u32 = m.parse().map_err(|_| format!("bad month in '{}'", s))?;
        Self::new(year, month).ok_or_else(|| format!("month out of range in '{}'", s))
    }
}

/// ISO week key (ISO year may differ from calendar year near January 1st)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WeekKey {
    pub year: i32,
    pub week: u32,
}

impl WeekKey {
    pub fn of(date: NaiveDate) -> Self {
        let iso = date.iso_week();
        Self {
            year: iso.year(),
            week: iso.week(),
        }
    }
}

/// Midnight UTC at the start of `date`
pub fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN))
}

/// Half-open UTC window `[start, end)` covering one calendar day
pub fn day_window(date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = start_of_day(date);
    (start, start + Duration::days(1))
}

/// The calendar day before `now` (default aggregation target)
pub fn yesterday(now: DateTime<Utc>) -> NaiveDate {
    let today = now.date_naive();
    today.pred_opt().unwrap_or(today)
}

/// The month before the one containing `now` (default promotion target)
pub fn last_month(now: DateTime<Utc>) -> YearMonth {
    YearMonth::of(now.date_naive()).prev()
}

/// Monday on or before `date`
pub fn monday_of(date: NaiveDate) -> NaiveDate {
    date - Duration::days(i64::from(date.weekday().num_days_from_monday()))
}

/// Weekly slot index of `date` inside its month
///
/// Rows start on Monday; the first row is the (possibly partial) week holding
/// the 1st. The result is in `0..=5` for every real date.
pub fn week_slot(date: NaiveDate) -> u32 {
    let offset = YearMonth::of(date)
        .first_day()
        .weekday()
        .num_days_from_monday();
    (date.day0() + offset) / 7
}

/// Every day in `[from, to]`
pub fn days_between(from: NaiveDate, to: NaiveDate) -> Vec<NaiveDate> {
    from.iter_days().take_while(|d| *d <= to).collect()
}

/// Every ISO week touching `[from, to]`, with its Monday
pub fn weeks_between(from: NaiveDate, to: NaiveDate) -> Vec<(WeekKey, NaiveDate)> {
    if from > to {
        return Vec::new();
    }
    monday_of(from)
        .iter_weeks()
        .take_while(|monday| *monday <= to)
        .map(|monday| (WeekKey::of(monday), monday))
        .collect()
}

/// Every calendar month touching `[from, to]`
pub fn months_between(from: NaiveDate, to: NaiveDate) -> Vec<YearMonth> {
    let mut out = Vec::new();
    let last = YearMonth::of(to);
    let mut cur = YearMonth::of(from);
    while cur <= last {
        out.push(cur);
        cur = cur.next();
    }
    out
}

/// Every calendar year touching `[from, to]`
pub fn years_between(from: NaiveDate, to: NaiveDate) -> Vec<i32> {
    (from.year()..=to.year()).collect()
}

/// Short English weekday name used for day labels
pub fn weekday_name(date: NaiveDate) -> &'static str {
    match date.weekday() {
        Weekday::Mon => "Mon",
        Weekday::Tue => "Tue",
        Weekday::Wed => "Wed",
        Weekday::Thu => "Thu",
        Weekday::Fri => "Fri",
        Weekday::Sat => "Sat",
        Weekday::Sun => "Sun",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_days_in_month() {
        assert_eq!(YearMonth::new(2024, 2).unwrap().days(), 29);
        assert_eq!(YearMonth::new(2023, 2).unwrap().days(), 28);
        assert_eq!(YearMonth::new(2024, 4).unwrap().days(), 30);
        assert_eq!(YearMonth::new(2024, 12).unwrap().days(), 31);
        assert!(YearMonth::new(2024, 13).is_none());
    }

    #[test]
    fn test_year_month_parse_and_display() {
        let ym: YearMonth = "2024-03".parse().unwrap();
        assert_eq!(ym, YearMonth::new(2024, 3).unwrap());
        assert_eq!(ym.to_string(), "2024-03");
        assert_eq!(ym.prev().to_string(), "2024-02");
        assert_eq!(YearMonth::new(2024, 1).unwrap().prev().to_string(), "2023-12");
        assert!("2024".parse::<YearMonth>().is_err());
        assert!("2024-00".parse::<YearMonth>().is_err());
    }

    #[test]
    fn test_day_window_is_half_open() {
        let (start, end) = day_window(d(2024, 3, 5));
        assert_eq!(start.to_rfc3339(), "2024-03-05T00:00:00+00:00");
        assert_eq!(end - start, Duration::days(1));
    }

    #[test]
    fn test_yesterday_and_last_month() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 5, 0).unwrap();
        assert_eq!(yesterday(now), d(2024, 2, 29));
        assert_eq!(last_month(now), YearMonth::new(2024, 2).unwrap());
    }

    #[test]
    fn test_week_slot_rows_are_monday_aligned() {
        // March 2024 starts on a Friday
        assert_eq!(week_slot(d(2024, 3, 1)), 0);
        assert_eq!(week_slot(d(2024, 3, 3)), 0);
        assert_eq!(week_slot(d(2024, 3, 4)), 1);
        assert_eq!(week_slot(d(2024, 3, 31)), 4);
        // September 2024 starts on a Sunday and spans six rows
        assert_eq!(week_slot(d(2024, 9, 1)), 0);
        assert_eq!(week_slot(d(2024, 9, 30)), 5);
    }

    #[test]
    fn test_week_slot_never_exceeds_max() {
        for ym in months_between(d(2020, 1, 1), d(2030, 12, 1)) {
            for day in days_between(ym.first_day(), ym.last_day()) {
                assert!(week_slot(day) <= MAX_WEEK_SLOT);
            }
        }
    }

    #[test]
    fn test_row_days_share_one_iso_week() {
        // 2021-01-01 is ISO week 53 of 2020
        assert_eq!(WeekKey::of(d(2021, 1, 1)), WeekKey { year: 2020, week: 53 });
        assert_eq!(week_slot(d(2021, 1, 3)), 0);
        assert_eq!(WeekKey::of(d(2021, 1, 3)), WeekKey { year: 2020, week: 53 });
        assert_eq!(week_slot(d(2021, 1, 4)), 1);
        assert_eq!(WeekKey::of(d(2021, 1, 4)), WeekKey { year: 2021, week: 1 });
    }

    #[test]
    fn test_enumerations() {
        assert_eq!(days_between(d(2024, 1, 1), d(2024, 1, 5)).len(), 5);
        assert!(days_between(d(2024, 1, 5), d(2024, 1, 1)).is_empty());

        let weeks = weeks_between(d(2024, 3, 1), d(2024, 3, 31));
        assert_eq!(weeks.len(), 5);
        assert_eq!(weeks[0].0, WeekKey { year: 2024, week: 9 });
        assert_eq!(weeks[0].1, d(2024, 2, 26));

        let months = months_between(d(2023, 11, 15), d(2024, 2, 1));
        assert_eq!(months.len(), 4);
        assert_eq!(months[3], YearMonth::new(2024, 2).unwrap());

        assert_eq!(years_between(d(2022, 6, 1), d(2024, 1, 1)), vec![2022, 2023, 2024]);
    }
}
