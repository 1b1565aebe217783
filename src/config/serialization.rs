//! Config serialization to TOML
//!
//! Single source of truth for config file format.

use super::Config;

impl Config {
    /// Serialize config to TOML string (single source of truth for format)
    pub fn to_toml(&self) -> String {
        format!(
            r#"# rollstat configuration
#
# Environment variables override this file:
#   ROLLSTAT_DB, ROLLSTAT_RETENTION_DAYS, ROLLSTAT_LOG_LEVEL

# SQLite database holding activity events and buckets
db_path = "{db_path}"

# Logging configuration (RUST_LOG env var overrides)
[logging]
level = "{log_level}"
# JSON file logging (in addition to stderr)
file_enabled = {log_file_enabled}
file_dir = "{log_file_dir}"
file_rotation = "{log_file_rotation}"  # hourly, daily, never
file_prefix = "{log_file_prefix}"

# How a day of events folds into a daily slot
[aggregation]
# Accepted quotations in one day that mark it a bestseller day (0 = never)
bestseller_min_accepted = {bestseller}

# Background jobs for `rollstat run` (times are UTC, HH:MM)
[scheduler]
enabled = {sched_enabled}
daily_at = "{daily_at}"      # aggregate yesterday
monthly_at = "{monthly_at}"    # promote last month, on the 1st
weekly_at = "{weekly_at}"     # retention sweep, on Mondays

# Activity log retention
[retention]
retention_days = {retention_days}  # processed events older than this are deleted (0 = keep forever)
"#,
            db_path = self.db_path.display(),
            log_level = self.logging.level,
            log_file_enabled = self.logging.file_enabled,
            log_file_dir = self.logging.file_dir.display(),
            log_file_rotation = self.logging.file_rotation.as_str(),
            log_file_prefix = self.logging.file_prefix,
            bestseller = self.aggregation.bestseller_min_accepted,
            sched_enabled = self.scheduler.enabled,
            daily_at = self.scheduler.daily_at.format("%H:%M"),
            monthly_at = self.scheduler.monthly_at.format("%H:%M"),
            weekly_at = self.scheduler.weekly_at.format("%H:%M"),
            retention_days = self.retention.retention_days,
        )
    }
}
