//! Append-only event log.
//!
//! Rows are only ever inserted; `seq` (AUTOINCREMENT) gives the global total
//! order. Stable event ids are unique, so redelivered events surface as
//! `DuplicateEventId` instead of a second row.

use serde_json::Value;
use sqlx::{Row, Sqlite, Transaction};
use uuid::Uuid;
use watchkeeper_protocol::types::{EventRecord, NewEvent, Severity};

use crate::error::{DbError, Result};
use crate::WatchkeeperDb;

/// Filter for `read_events`. Default reads the most recent 100.
#[derive(Debug, Clone)]
pub struct EventFilter {
    pub limit: u32,
    pub since_seq: Option<i64>,
    pub event_type: Option<String>,
    pub correlation_id: Option<String>,
    pub session_id: Option<String>,
}

impl Default for EventFilter {
    fn default() -> Self {
        Self {
            limit: 100,
            since_seq: None,
            event_type: None,
            correlation_id: None,
            session_id: None,
        }
    }
}

impl WatchkeeperDb {
    /// Append one event. A blank `event_id` gets a fresh uuid; a duplicate
    /// stable id fails with `DuplicateEventId`.
    pub async fn append_event(&self, mut event: NewEvent) -> Result<EventRecord> {
        if event.event_id.is_empty() {
            event.event_id = Uuid::new_v4().to_string();
        }

        let mut tx = self.pool().begin().await?;
        let seq = Self::insert_event_row(
            &mut tx,
            &event.event_id,
            &event.timestamp_utc,
            &event.event_type,
            &event.source,
            event.session_id.as_deref(),
            event.correlation_id.as_deref(),
            event.incident_id.as_deref(),
            event.watch_condition.map(|c| c.as_str()),
            event.severity,
            &event.payload,
            &event.tags,
        )
        .await?;
        tx.commit().await?;

        let record = EventRecord {
            seq,
            event_id: event.event_id,
            timestamp_utc: event.timestamp_utc,
            event_type: event.event_type,
            source: event.source,
            session_id: event.session_id,
            correlation_id: event.correlation_id,
            incident_id: event.incident_id,
            watch_condition: event.watch_condition.map(|c| c.as_str().to_string()),
            severity: event.severity,
            payload: event.payload,
            tags: event.tags,
        };
        self.publish(&record);
        Ok(record)
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn insert_event_row(
        tx: &mut Transaction<'_, Sqlite>,
        event_id: &str,
        timestamp_utc: &str,
        event_type: &str,
        source: &str,
        session_id: Option<&str>,
        correlation_id: Option<&str>,
        incident_id: Option<&str>,
        watch_condition: Option<&str>,
        severity: Severity,
        payload: &Value,
        tags: &[String],
    ) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO event_log(
                event_id, timestamp_utc, event_type, source, session_id,
                correlation_id, incident_id, watch_condition, severity,
                payload_json, tags_json
            )
            VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event_id)
        .bind(timestamp_utc)
        .bind(event_type)
        .bind(source)
        .bind(session_id)
        .bind(correlation_id)
        .bind(incident_id)
        .bind(watch_condition)
        .bind(severity.as_str())
        .bind(serde_json::to_string(payload)?)
        .bind(serde_json::to_string(tags)?)
        .execute(&mut **tx)
        .await;

        match result {
            Ok(done) => Ok(done.last_insert_rowid()),
            Err(err) if DbError::is_unique_violation(&err) => {
                Err(DbError::DuplicateEventId(event_id.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Read events matching the filter, ordered by sequence.
    ///
    /// With `since_seq` the scan runs forward from that sequence (exclusive);
    /// otherwise the newest `limit` rows are returned oldest-first.
    pub async fn read_events(&self, filter: EventFilter) -> Result<Vec<EventRecord>> {
        let limit = filter.limit.clamp(1, 1000) as i64;
        let forward = filter.since_seq.is_some();

        let mut sql = String::from(
            "SELECT seq, event_id, timestamp_utc, event_type, source, session_id, \
             correlation_id, incident_id, watch_condition, severity, payload_json, tags_json \
             FROM event_log WHERE 1=1",
        );
        if filter.since_seq.is_some() {
            sql.push_str(" AND seq > ?");
        }
        if filter.event_type.is_some() {
            sql.push_str(" AND event_type = ?");
        }
        if filter.correlation_id.is_some() {
            sql.push_str(" AND correlation_id = ?");
        }
        if filter.session_id.is_some() {
            sql.push_str(" AND session_id = ?");
        }
        sql.push_str(if forward {
            " ORDER BY seq ASC LIMIT ?"
        } else {
            " ORDER BY seq DESC LIMIT ?"
        });

        let mut query = sqlx::query(&sql);
        if let Some(since) = filter.since_seq {
            query = query.bind(since);
        }
        if let Some(ref event_type) = filter.event_type {
            query = query.bind(event_type);
        }
        if let Some(ref correlation_id) = filter.correlation_id {
            query = query.bind(correlation_id);
        }
        if let Some(ref session_id) = filter.session_id {
            query = query.bind(session_id);
        }
        query = query.bind(limit);

        let rows = query.fetch_all(self.pool()).await?;
        let mut records: Vec<EventRecord> =
            rows.iter().map(Self::row_to_event).collect::<Result<_>>()?;
        if !forward {
            records.reverse();
        }
        Ok(records)
    }

    fn row_to_event(row: &sqlx::sqlite::SqliteRow) -> Result<EventRecord> {
        let payload_raw: String = row.get("payload_json");
        let tags_raw: String = row.get("tags_json");
        let severity_raw: String = row.get("severity");
        Ok(EventRecord {
            seq: row.get("seq"),
            event_id: row.get("event_id"),
            timestamp_utc: row.get("timestamp_utc"),
            event_type: row.get("event_type"),
            source: row.get("source"),
            session_id: row.get("session_id"),
            correlation_id: row.get("correlation_id"),
            incident_id: row.get("incident_id"),
            watch_condition: row.get("watch_condition"),
            severity: severity_raw.parse().unwrap_or(Severity::Info),
            payload: serde_json::from_str(&payload_raw)?,
            tags: serde_json::from_str(&tags_raw).unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use watchkeeper_protocol::types::NewEvent;

    async fn test_db() -> WatchkeeperDb {
        WatchkeeperDb::open_in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn sequences_are_monotonic_in_emit_order() {
        let db = test_db().await;
        let mut last_seq = 0;
        for i in 0..5 {
            let record = db
                .append_event(NewEvent::new("TEST_EVENT", "test", json!({"i": i})))
                .await
                .unwrap();
            assert!(record.seq > last_seq);
            last_seq = record.seq;
        }
    }

    #[tokio::test]
    async fn duplicate_event_id_is_rejected() {
        let db = test_db().await;
        let mut event = NewEvent::new("TEST_EVENT", "test", json!({}));
        event.event_id = "stable-id-1".to_string();
        db.append_event(event.clone()).await.unwrap();

        let err = db.append_event(event).await.unwrap_err();
        assert!(matches!(err, DbError::DuplicateEventId(id) if id == "stable-id-1"));

        // Only one row survives.
        let events = db.read_events(Default::default()).await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn filter_by_correlation_and_since_seq() {
        let db = test_db().await;
        let first = db
            .append_event(NewEvent::new("A", "test", json!({})).correlation("inc-1"))
            .await
            .unwrap();
        db.append_event(NewEvent::new("B", "test", json!({})).correlation("inc-2"))
            .await
            .unwrap();
        db.append_event(NewEvent::new("C", "test", json!({})).correlation("inc-1"))
            .await
            .unwrap();

        let inc1 = db
            .read_events(EventFilter {
                correlation_id: Some("inc-1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(inc1.len(), 2);

        let after = db
            .read_events(EventFilter {
                since_seq: Some(first.seq),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(after.len(), 2);
        assert!(after.iter().all(|e| e.seq > first.seq));
    }

    #[tokio::test]
    async fn subscription_receives_new_events() {
        let db = test_db().await;
        let mut rx = db.subscribe_events();
        db.append_event(NewEvent::new("PING", "test", json!({})))
            .await
            .unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type, "PING");
    }
}
