// rollstat - Analytics rollup engine
//
// Collaborators append activity events; scheduled jobs fold them into
// pre-aggregated buckets; dashboards read time series from the buckets only.
//
// Architecture:
// - Store (rusqlite + r2d2): activity log, monthly and yearly bucket documents
// - Rollup jobs: daily aggregation, monthly promotion, weekly retention sweep
// - Scheduler (tokio): fires the jobs on calendar cadences
// - Query engine: zero-filled series at day/week/month/year granularity
// - Engine: facade wiring the pieces together for the CLI and embedders

pub mod calendar;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod logging;
pub mod metrics;
pub mod query;
pub mod rollup;
pub mod store;

pub use engine::Engine;
pub use error::{Result, RollupError};
