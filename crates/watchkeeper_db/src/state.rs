//! Latest-truth state operations.
//!
//! Writes go through one transaction per call; a materially changed value
//! optionally appends a `STATE_CHANGED` event in the same transaction so the
//! event and the upsert are atomic. Equality is structural JSON equality, so
//! re-writing an identical value is a quiet refresh.

use serde_json::{json, Value};
use sqlx::Row;
use uuid::Uuid;
use watchkeeper_protocol::types::{utc_now_iso, EventRecord, Severity, StateEntry};

use crate::error::Result;
use crate::WatchkeeperDb;

pub const STATE_CHANGED_EVENT: &str = "STATE_CHANGED";

/// One pending state write.
#[derive(Debug, Clone)]
pub struct StateWrite {
    pub state_key: String,
    pub state_value: Value,
    pub source: String,
    pub confidence: Option<f64>,
    pub observed_at_utc: Option<String>,
    /// Append a `STATE_CHANGED` event when the value materially differs.
    /// High-frequency numeric sources opt out.
    pub emit_event: bool,
}

impl StateWrite {
    pub fn new(key: impl Into<String>, value: Value, source: impl Into<String>) -> Self {
        Self {
            state_key: key.into(),
            state_value: value,
            source: source.into(),
            confidence: None,
            observed_at_utc: None,
            emit_event: true,
        }
    }

    pub fn quiet(key: impl Into<String>, value: Value, source: impl Into<String>) -> Self {
        Self {
            emit_event: false,
            ..Self::new(key, value, source)
        }
    }

    pub fn confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn observed_at(mut self, ts: impl Into<String>) -> Self {
        self.observed_at_utc = Some(ts.into());
        self
    }
}

/// Event envelope applied to the `STATE_CHANGED` events of one batch.
#[derive(Debug, Clone, Default)]
pub struct EventContext {
    pub session_id: Option<String>,
    pub correlation_id: Option<String>,
    pub source: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StateWriteResult {
    pub state_key: String,
    pub changed: bool,
    pub event_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    pub upserted: usize,
    pub changed: usize,
    pub items: Vec<StateWriteResult>,
}

impl WatchkeeperDb {
    /// Upsert a single state entry. Idempotent by key.
    pub async fn set_state(&self, write: StateWrite) -> Result<StateWriteResult> {
        let mut result = self
            .batch_set_state(vec![write], EventContext::default())
            .await?;
        Ok(result.items.pop().expect("batch of one"))
    }

    /// Upsert a batch atomically, emitting `STATE_CHANGED` events for items
    /// that materially changed.
    pub async fn batch_set_state(
        &self,
        items: Vec<StateWrite>,
        ctx: EventContext,
    ) -> Result<BatchResult> {
        if items.is_empty() {
            return Ok(BatchResult::default());
        }

        let mut tx = self.pool().begin().await?;
        let mut out = BatchResult::default();
        let mut emitted: Vec<EventRecord> = Vec::new();

        for item in items {
            let now = utc_now_iso();
            let observed_at = item.observed_at_utc.clone().unwrap_or_else(|| now.clone());

            let existing = sqlx::query(
                "SELECT state_value_json, observed_at_utc FROM state_current WHERE state_key = ?",
            )
            .bind(&item.state_key)
            .fetch_optional(&mut *tx)
            .await?;

            // Last write wins by observed_at; a stale write never clobbers a
            // newer observation. Ties fall through to the newer update.
            if let Some(row) = &existing {
                let current_observed: String = row.get("observed_at_utc");
                if observed_at < current_observed {
                    out.upserted += 1;
                    out.items.push(StateWriteResult {
                        state_key: item.state_key,
                        changed: false,
                        event_id: None,
                    });
                    continue;
                }
            }

            let previous: Option<Value> = existing
                .map(|row| row.get::<String, _>("state_value_json"))
                .and_then(|raw| serde_json::from_str(&raw).ok());
            let changed = previous.as_ref() != Some(&item.state_value);

            sqlx::query(
                r#"
                INSERT INTO state_current(
                    state_key, state_value_json, source, confidence, observed_at_utc, updated_at_utc
                )
                VALUES(?, ?, ?, ?, ?, ?)
                ON CONFLICT(state_key) DO UPDATE SET
                    state_value_json = excluded.state_value_json,
                    source = excluded.source,
                    confidence = excluded.confidence,
                    observed_at_utc = excluded.observed_at_utc,
                    updated_at_utc = excluded.updated_at_utc
                "#,
            )
            .bind(&item.state_key)
            .bind(serde_json::to_string(&item.state_value)?)
            .bind(&item.source)
            .bind(item.confidence)
            .bind(&observed_at)
            .bind(&now)
            .execute(&mut *tx)
            .await?;

            out.upserted += 1;
            if changed {
                out.changed += 1;
            }

            let mut event_id = None;
            if item.emit_event && changed {
                let id = Uuid::new_v4().to_string();
                let payload = json!({
                    "state_key": item.state_key,
                    "state_value": item.state_value,
                    "source": item.source,
                    "confidence": item.confidence,
                    "observed_at_utc": observed_at,
                });
                let seq = Self::insert_event_row(
                    &mut tx,
                    &id,
                    &now,
                    STATE_CHANGED_EVENT,
                    ctx.source.as_deref().unwrap_or(&item.source),
                    ctx.session_id.as_deref(),
                    ctx.correlation_id.as_deref(),
                    None,
                    None,
                    Severity::Info,
                    &payload,
                    &[],
                )
                .await?;
                emitted.push(EventRecord {
                    seq,
                    event_id: id.clone(),
                    timestamp_utc: now.clone(),
                    event_type: STATE_CHANGED_EVENT.to_string(),
                    source: ctx.source.clone().unwrap_or_else(|| item.source.clone()),
                    session_id: ctx.session_id.clone(),
                    correlation_id: ctx.correlation_id.clone(),
                    incident_id: None,
                    watch_condition: None,
                    severity: Severity::Info,
                    payload,
                    tags: Vec::new(),
                });
                event_id = Some(id);
            }

            out.items.push(StateWriteResult {
                state_key: item.state_key,
                changed,
                event_id,
            });
        }

        tx.commit().await?;
        for record in &emitted {
            self.publish(record);
        }
        Ok(out)
    }

    pub async fn get_state(&self, state_key: &str) -> Result<Option<StateEntry>> {
        let row = sqlx::query(
            r#"SELECT state_key, state_value_json, source, confidence, observed_at_utc, updated_at_utc
               FROM state_current WHERE state_key = ?"#,
        )
        .bind(state_key)
        .fetch_optional(self.pool())
        .await?;

        row.map(|row| Self::row_to_state(&row)).transpose()
    }

    /// Current value decoded as a bool with the usual string/number coercions.
    pub async fn get_state_bool(&self, state_key: &str) -> Result<bool> {
        Ok(self
            .get_state(state_key)
            .await?
            .map(|entry| value_as_bool(&entry.state_value))
            .unwrap_or(false))
    }

    /// All entries whose key starts with `prefix` (empty prefix lists all).
    pub async fn list_state(&self, prefix: &str) -> Result<Vec<StateEntry>> {
        let rows = sqlx::query(
            r#"SELECT state_key, state_value_json, source, confidence, observed_at_utc, updated_at_utc
               FROM state_current
               WHERE state_key LIKE ? || '%'
               ORDER BY state_key ASC"#,
        )
        .bind(prefix)
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(Self::row_to_state).collect()
    }

    fn row_to_state(row: &sqlx::sqlite::SqliteRow) -> Result<StateEntry> {
        let raw: String = row.get("state_value_json");
        Ok(StateEntry {
            state_key: row.get("state_key"),
            state_value: serde_json::from_str(&raw)?,
            source: row.get("source"),
            confidence: row.get("confidence"),
            observed_at_utc: row.get("observed_at_utc"),
            updated_at_utc: row.get("updated_at_utc"),
        })
    }
}

/// Lenient bool coercion for state values written by external collectors.
pub fn value_as_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> WatchkeeperDb {
        WatchkeeperDb::open_in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn upsert_detects_material_change() {
        let db = test_db().await;
        let first = db
            .set_state(StateWrite::new("ed.running", json!(true), "test"))
            .await
            .unwrap();
        assert!(first.changed);
        assert!(first.event_id.is_some());

        // Same value: refresh only, no event.
        let second = db
            .set_state(StateWrite::new("ed.running", json!(true), "test"))
            .await
            .unwrap();
        assert!(!second.changed);
        assert!(second.event_id.is_none());

        let third = db
            .set_state(StateWrite::new("ed.running", json!(false), "test"))
            .await
            .unwrap();
        assert!(third.changed);
    }

    #[tokio::test]
    async fn quiet_writes_skip_events() {
        let db = test_db().await;
        let result = db
            .set_state(StateWrite::quiet("hw.cpu_percent", json!(42.5), "probe"))
            .await
            .unwrap();
        assert!(result.changed);
        assert!(result.event_id.is_none());
        let events = db.read_events(Default::default()).await.unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn get_returns_latest_value() {
        let db = test_db().await;
        db.set_state(
            StateWrite::new("music.track.title", json!("Interstellar"), "player")
                .observed_at("2026-01-01T00:00:00.000Z"),
        )
        .await
        .unwrap();
        db.set_state(
            StateWrite::new("music.track.title", json!("Cornfield Chase"), "player")
                .observed_at("2026-01-01T00:01:00.000Z"),
        )
        .await
        .unwrap();

        let entry = db.get_state("music.track.title").await.unwrap().unwrap();
        assert_eq!(entry.state_value, json!("Cornfield Chase"));
        assert_eq!(entry.observed_at_utc, "2026-01-01T00:01:00.000Z");
    }

    #[tokio::test]
    async fn stale_observation_never_clobbers_newer() {
        let db = test_db().await;
        db.set_state(
            StateWrite::new("ed.telemetry.hull_percent", json!(0.9), "parser")
                .observed_at("2026-01-01T00:02:00.000Z"),
        )
        .await
        .unwrap();

        // A delayed out-of-order write with an older observation is dropped.
        let stale = db
            .set_state(
                StateWrite::new("ed.telemetry.hull_percent", json!(0.5), "parser")
                    .observed_at("2026-01-01T00:01:00.000Z"),
            )
            .await
            .unwrap();
        assert!(!stale.changed);
        assert!(stale.event_id.is_none());

        let entry = db
            .get_state("ed.telemetry.hull_percent")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.state_value, json!(0.9));
    }

    #[tokio::test]
    async fn list_by_prefix() {
        let db = test_db().await;
        for key in ["ed.running", "ed.process_name", "music.playing"] {
            db.set_state(StateWrite::quiet(key, json!(1), "test"))
                .await
                .unwrap();
        }
        let ed = db.list_state("ed.").await.unwrap();
        assert_eq!(ed.len(), 2);
        let all = db.list_state("").await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn bool_coercion() {
        assert!(value_as_bool(&json!(true)));
        assert!(value_as_bool(&json!("yes")));
        assert!(value_as_bool(&json!(1)));
        assert!(!value_as_bool(&json!("off")));
        assert!(!value_as_bool(&json!(null)));
    }
}
