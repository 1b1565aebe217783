//! Activity events emitted by the catalog and quotation collaborators
//!
//! Events are immutable once appended; only the processed flag changes, and
//! only once. Each kind belongs to exactly one data domain, which decides the
//! bucket family it is folded into.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque product/service identifier owned by the catalog
pub type EntityId = String;

/// Row id assigned by the activity log on append
pub type EventId = i64;

/// Data domain of an event kind (one bucket family per domain)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Sales,
    Engagement,
}

impl Domain {
    pub const ALL: [Domain; 2] = [Domain::Sales, Domain::Engagement];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sales => "sales",
            Self::Engagement => "engagement",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to an entity
///
/// Amounts are integers in the caller's currency minor unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Sale { amount: i64, profit: i64 },
    View,
    QuotationSent,
    QuotationAccepted,
    QuotationRejected,
    QuotationInProgress,
}

#[derive(Serialize, Deserialize)]
struct SalePayload {
    amount: i64,
    profit: i64,
}

impl EventKind {
    pub fn domain(&self) -> Domain {
        match self {
            Self::Sale { .. } => Domain::Sales,
            _ => Domain::Engagement,
        }
    }

    /// Stable tag stored in the `kind` column
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Sale { .. } => "sale",
            Self::View => "view",
            Self::QuotationSent => "quotation_sent",
            Self::QuotationAccepted => "quotation_accepted",
            Self::QuotationRejected => "quotation_rejected",
            Self::QuotationInProgress => "quotation_in_progress",
        }
    }

    /// JSON payload stored next to the tag
    pub fn payload(&self) -> String {
        match self {
            Self::Sale { amount, profit } => serde_json::to_string(&SalePayload {
                amount: *amount,
                profit: *profit,
            })
            .unwrap_or_else(|_| "{}".to_string()),
            _ => "{}".to_string(),
        }
    }

    /// Rebuild a kind from its stored tag and payload
    pub fn decode(tag: &str, payload: &str) -> Result<Self, String> {
        match tag {
            "sale" => {
                let p: SalePayload = serde_json::from_str(payload)
                    .map_err(|e| format!("bad sale payload: {}", e))?;
                Ok(Self::Sale {
                    amount: p.amount,
                    profit: p.profit,
                })
            }
            "view" => Ok(Self::View),
            "quotation_sent" => Ok(Self::QuotationSent),
            "quotation_accepted" => Ok(Self::QuotationAccepted),
            "quotation_rejected" => Ok(Self::QuotationRejected),
            "quotation_in_progress" => Ok(Self::QuotationInProgress),
            other => Err(format!("unknown event kind '{}'", other)),
        }
    }
}

/// Event as handed to the activity log by a collaborator
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub entity_id: EntityId,
    pub kind: EventKind,
    pub occurred_at: DateTime<Utc>,
    pub actor: Option<String>,
}

impl NewEvent {
    pub fn new(
        entity_id: impl Into<EntityId>,
        kind: EventKind,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            kind,
            occurred_at,
            actor: None,
        }
    }

    pub fn sale(
        entity_id: impl Into<EntityId>,
        amount: i64,
        profit: i64,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self::new(entity_id, EventKind::Sale { amount, profit }, occurred_at)
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }
}

/// Event as read back from the activity log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityEvent {
    pub id: EventId,
    pub entity_id: EntityId,
    pub kind: EventKind,
    pub occurred_at: DateTime<Utc>,
    pub processed: bool,
    pub actor: Option<String>,
}
