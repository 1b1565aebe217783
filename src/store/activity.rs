//! Activity log: append, scan by day window, mark processed, sweep

use super::{now_millis, SqliteStore};
use crate::error::Result;
use crate::events::{ActivityEvent, Domain, EventId, EventKind, NewEvent};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, params_from_iter, Connection, Row};

/// SQLite caps bound parameters per statement; id lists are chunked below it
const ID_CHUNK: usize = 500;

/// Unprocessed events in a window, plus rows that could not be decoded
#[derive(Debug, Default)]
pub struct UnprocessedBatch {
    pub events: Vec<ActivityEvent>,
    pub malformed: Vec<EventId>,
}

/// Undecoded activity row
struct RawEvent {
    id: EventId,
    entity_id: String,
    kind: String,
    payload: String,
    occurred_at: i64,
    processed: bool,
    actor: Option<String>,
}

impl RawEvent {
    const COLUMNS: &'static str = "id, entity_id, kind, payload, occurred_at, processed, actor";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            entity_id: row.get(1)?,
            kind: row.get(2)?,
            payload: row.get(3)?,
            occurred_at: row.get(4)?,
            processed: row.get(5)?,
            actor: row.get(6)?,
        })
    }

    fn decode(self) -> std::result::Result<ActivityEvent, String> {
        let kind = EventKind::decode(&self.kind, &self.payload)?;
        let occurred_at = Utc
            .timestamp_millis_opt(self.occurred_at)
            .single()
            .ok_or_else(|| format!("timestamp out of range: {}", self.occurred_at))?;
        Ok(ActivityEvent {
            id: self.id,
            entity_id: self.entity_id,
            kind,
            occurred_at,
            processed: self.processed,
            actor: self.actor,
        })
    }
}

impl SqliteStore {
    /// Append one event; returns its id
    pub fn append(&self, event: &NewEvent) -> Result<EventId> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO activity_events
                (entity_id, domain, kind, payload, occurred_at, processed, actor, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7)
            "#,
            params![
                event.entity_id,
                event.kind.domain().as_str(),
                event.kind.tag(),
                event.kind.payload(),
                event.occurred_at.timestamp_millis(),
                event.actor,
                now_millis(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Unprocessed events of `domain` with `start <= occurred_at < end`
    ///
    /// Rows that fail to decode are logged and reported in `malformed` so the
    /// caller can retire them without blocking the rest of the window.
    pub fn find_unprocessed(
        &self,
        domain: Domain,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<UnprocessedBatch> {
        let conn = self.conn()?;
        let sql = format!(
            r#"
            SELECT {}
            FROM activity_events
            WHERE domain = ?1 AND processed = 0
              AND occurred_at >= ?2 AND occurred_at < ?3
            ORDER BY id
            "#,
            RawEvent::COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![
                domain.as_str(),
                start.timestamp_millis(),
                end.timestamp_millis()
            ],
            RawEvent::from_row,
        )?;

        let mut batch = UnprocessedBatch::default();
        for row in rows {
            let raw = row?;
            let id = raw.id;
            match raw.decode() {
                Ok(event) => batch.events.push(event),
                Err(reason) => {
                    tracing::warn!(event_id = id, %domain, "Skipping malformed event: {}", reason);
                    batch.malformed.push(id);
                }
            }
        }
        Ok(batch)
    }

    /// Flip the processed flag for `ids` in one transaction
    ///
    /// Already-processed ids are left alone. Returns how many rows changed.
    pub fn mark_processed(&self, ids: &[EventId]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let changed = mark_ids(&tx, ids)?;
        tx.commit()?;
        Ok(changed)
    }

    /// Delete processed events that occurred before `cutoff`
    ///
    /// Unprocessed events are never deleted, whatever their age.
    pub fn delete_processed_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM activity_events WHERE processed = 1 AND occurred_at < ?1",
            params![cutoff.timestamp_millis()],
        )?;
        Ok(deleted as u64)
    }

    /// Number of events still waiting for aggregation
    pub fn count_unprocessed(&self) -> Result<u64> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM activity_events WHERE processed = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    /// Look up a single event by id (undecodable rows read as `None`)
    #[cfg(test)]
    pub(crate) fn get_event(&self, id: EventId) -> Result<Option<ActivityEvent>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM activity_events WHERE id = ?1",
            RawEvent::COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query_map(params![id], RawEvent::from_row)?;
        match rows.next() {
            Some(row) => Ok(row?.decode().ok()),
            None => Ok(None),
        }
    }
}

/// Every retained event (processed or not) of one entity in a window
///
/// Takes a connection so it can run inside a caller's transaction. Rows that
/// fail to decode are left out; `find_unprocessed` reports them.
pub(super) fn select_entity_window(
    conn: &Connection,
    domain: Domain,
    entity_id: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<ActivityEvent>> {
    let sql = format!(
        r#"
        SELECT {}
        FROM activity_events
        WHERE domain = ?1 AND entity_id = ?2
          AND occurred_at >= ?3 AND occurred_at < ?4
        ORDER BY id
        "#,
        RawEvent::COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(
        params![
            domain.as_str(),
            entity_id,
            start.timestamp_millis(),
            end.timestamp_millis()
        ],
        RawEvent::from_row,
    )?;

    let mut events = Vec::new();
    for row in rows {
        let raw = row?;
        let id = raw.id;
        match raw.decode() {
            Ok(event) => events.push(event),
            Err(reason) => tracing::debug!(event_id = id, "Ignoring malformed event: {}", reason),
        }
    }
    Ok(events)
}

/// Set `processed = 1` on `ids` using the caller's connection
pub(super) fn mark_ids(conn: &Connection, ids: &[EventId]) -> Result<u64> {
    let mut changed = 0u64;
    for chunk in ids.chunks(ID_CHUNK) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let sql = format!(
            "UPDATE activity_events SET processed = 1 WHERE processed = 0 AND id IN ({})",
            placeholders
        );
        changed += conn.execute(&sql, params_from_iter(chunk.iter()))? as u64;
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::select_entity_window;
    use crate::calendar::day_window;
    use crate::events::{Domain, EventKind, NewEvent};
    use crate::store::test_support::temp_store;
    use chrono::{Duration, NaiveDate, TimeZone, Utc};
    use rusqlite::params;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_append_and_read_back() {
        let (_dir, store) = temp_store();
        let at = Utc.with_ymd_and_hms(2024, 3, 5, 9, 30, 0).unwrap();
        let id = store
            .append(&NewEvent::sale("p-1", 100, 25, at).with_actor("buyer-7"))
            .unwrap();

        let event = store.get_event(id).unwrap().unwrap();
        assert_eq!(event.entity_id, "p-1");
        assert_eq!(
            event.kind,
            EventKind::Sale {
                amount: 100,
                profit: 25
            }
        );
        assert_eq!(event.occurred_at, at);
        assert_eq!(event.actor.as_deref(), Some("buyer-7"));
        assert!(!event.processed);
    }

    #[test]
    fn test_find_unprocessed_respects_window_and_domain() {
        let (_dir, store) = temp_store();
        let (start, end) = day_window(date(2024, 3, 5));

        store.append(&NewEvent::sale("p-1", 10, 1, start)).unwrap();
        store
            .append(&NewEvent::sale("p-1", 10, 1, end - Duration::milliseconds(1)))
            .unwrap();
        // Belongs to the next day
        store.append(&NewEvent::sale("p-1", 10, 1, end)).unwrap();
        // Other domain
        store
            .append(&NewEvent::new("p-1", EventKind::View, start))
            .unwrap();

        let batch = store.find_unprocessed(Domain::Sales, start, end).unwrap();
        assert_eq!(batch.events.len(), 2);
        assert!(batch.malformed.is_empty());
    }

    #[test]
    fn test_mark_processed_is_idempotent() {
        let (_dir, store) = temp_store();
        let (start, end) = day_window(date(2024, 3, 5));
        let a = store.append(&NewEvent::sale("p-1", 10, 1, start)).unwrap();
        let b = store.append(&NewEvent::sale("p-2", 10, 1, start)).unwrap();

        assert_eq!(store.mark_processed(&[a, b]).unwrap(), 2);
        assert_eq!(store.mark_processed(&[a, b]).unwrap(), 0);
        assert!(store
            .find_unprocessed(Domain::Sales, start, end)
            .unwrap()
            .events
            .is_empty());
        assert_eq!(store.count_unprocessed().unwrap(), 0);
    }

    #[test]
    fn test_malformed_rows_are_reported_not_fatal() {
        let (_dir, store) = temp_store();
        let (start, end) = day_window(date(2024, 3, 5));
        store.append(&NewEvent::sale("p-1", 10, 1, start)).unwrap();
        {
            let conn = store.conn().unwrap();
            conn.execute(
                "INSERT INTO activity_events
                    (entity_id, domain, kind, payload, occurred_at, processed, created_at)
                 VALUES ('p-1', 'sales', 'sale', 'garbage', ?1, 0, 0)",
                params![start.timestamp_millis()],
            )
            .unwrap();
        }

        let batch = store.find_unprocessed(Domain::Sales, start, end).unwrap();
        assert_eq!(batch.events.len(), 1);
        assert_eq!(batch.malformed.len(), 1);
    }

    #[test]
    fn test_entity_window_includes_processed() {
        let (_dir, store) = temp_store();
        let (start, end) = day_window(date(2024, 3, 5));
        let a = store.append(&NewEvent::sale("p-1", 10, 1, start)).unwrap();
        store.append(&NewEvent::sale("p-1", 20, 2, start)).unwrap();
        store.append(&NewEvent::sale("p-2", 30, 3, start)).unwrap();
        store.append(&NewEvent::sale("p-1", 40, 4, end)).unwrap();
        store.mark_processed(&[a]).unwrap();

        let conn = store.conn().unwrap();
        let events = select_entity_window(&conn, Domain::Sales, "p-1", start, end).unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.entity_id == "p-1"));
        assert_eq!(events.iter().filter(|e| e.processed).count(), 1);
    }

    #[test]
    fn test_delete_never_touches_unprocessed() {
        let (_dir, store) = temp_store();
        let old = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let processed = store.append(&NewEvent::sale("p-1", 10, 1, old)).unwrap();
        let pending = store.append(&NewEvent::sale("p-1", 10, 1, old)).unwrap();
        store.mark_processed(&[processed]).unwrap();

        let deleted = store.delete_processed_older_than(Utc::now()).unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get_event(processed).unwrap().is_none());
        assert!(store.get_event(pending).unwrap().is_some());
    }
}
