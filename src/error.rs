//! Error taxonomy for the rollup engine
//!
//! Storage failures are transient: the caller may re-run the same window.
//! Query parameter errors are synchronous rejections and are never retried.

use crate::events::Domain;
use chrono::NaiveDate;
use std::fmt;

/// Result alias used throughout the engine
pub type Result<T> = std::result::Result<T, RollupError>;

/// Errors surfaced by the aggregator, promoter, sweeper and query engine
#[derive(Debug)]
pub enum RollupError {
    /// Read or write against the store failed (safe to retry the window)
    Storage(String),
    /// Requested metric name is not part of any data domain
    InvalidMetric { name: String },
    /// Query range is inverted
    InvalidRange { from: NaiveDate, to: NaiveDate },
    /// A metric sum left the i64 range
    Overflow { domain: Domain },
    /// Some entities of a run were written, others failed
    PartialWindow {
        succeeded: usize,
        failed: Vec<(String, String)>,
    },
}

impl RollupError {
    /// Whether re-running the same window can succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::PartialWindow { .. })
    }
}

impl fmt::Display for RollupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Storage(msg) => write!(f, "Storage error: {}", msg),
            Self::InvalidMetric { name } => write!(
                f,
                "Invalid metric '{}': expected one of count, amount, profit, views, sent, \
                 accepted, rejected, inProgress, popularity, bestseller",
                name
            ),
            Self::InvalidRange { from, to } => {
                write!(f, "Invalid range: from {} is after to {}", from, to)
            }
            Self::Overflow { domain } => write!(f, "Overflow summing {} metrics", domain),
            Self::PartialWindow { succeeded, failed } => {
                write!(
                    f,
                    "Partial window failure: {} entities written, {} failed",
                    succeeded,
                    failed.len()
                )?;
                if let Some((entity, reason)) = failed.first() {
                    write!(f, " (first: {}: {})", entity, reason)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for RollupError {}

impl From<rusqlite::Error> for RollupError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<r2d2::Error> for RollupError {
    fn from(e: r2d2::Error) -> Self {
        Self::Storage(format!("connection pool: {}", e))
    }
}

impl From<serde_json::Error> for RollupError {
    fn from(e: serde_json::Error) -> Self {
        Self::Storage(format!("corrupt document: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(RollupError::Storage("disk I/O".into()).is_transient());
        assert!(RollupError::PartialWindow {
            succeeded: 1,
            failed: vec![("p-1".into(), "locked".into())],
        }
        .is_transient());
        assert!(!RollupError::InvalidMetric {
            name: "unknownMetric".into()
        }
        .is_transient());
        assert!(!RollupError::Overflow {
            domain: Domain::Sales
        }
        .is_transient());
    }

    #[test]
    fn test_partial_window_message_names_first_failure() {
        let err = RollupError::PartialWindow {
            succeeded: 3,
            failed: vec![("p-9".into(), "database is locked".into())],
        };
        let msg = err.to_string();
        assert!(msg.contains("3 entities written, 1 failed"));
        assert!(msg.contains("p-9: database is locked"));
    }
}
