//! Intent, action, and feedback records.

use serde_json::Value;
use sqlx::Row;
use watchkeeper_protocol::http_types::IntentEnvelope;
use watchkeeper_protocol::types::{utc_now_iso, ActionStatus, SafetyClass};

use crate::error::{DbError, Result};
use crate::types::{ActionRow, IntentRow};
use crate::WatchkeeperDb;

impl WatchkeeperDb {
    /// Store an intent and queue its proposed actions. Idempotent by request
    /// id: re-posting replaces the intent row and its action rows, so the
    /// final record for an identical envelope is identical.
    pub async fn upsert_intent(&self, intent: &IntentEnvelope) -> Result<usize> {
        let mut tx = self.pool().begin().await?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO intent_log(
                request_id, schema_version, timestamp_utc, session_id, mode, domain,
                urgency, user_text, needs_tools, needs_clarification,
                clarification_questions_json, retrieval_json, proposed_actions_json,
                response_text
            )
            VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&intent.request_id)
        .bind(&intent.schema_version)
        .bind(&intent.timestamp_utc)
        .bind(&intent.session_id)
        .bind(intent.mode.as_str())
        .bind(intent.domain.as_str())
        .bind(intent.urgency.as_str())
        .bind(&intent.user_text)
        .bind(intent.needs_tools as i32)
        .bind(intent.needs_clarification as i32)
        .bind(serde_json::to_string(&intent.clarification_questions)?)
        .bind(serde_json::to_string(intent.retrieval.as_ref().unwrap_or(&Value::Null))?)
        .bind(serde_json::to_string(&intent.proposed_actions)?)
        .bind(&intent.response_text)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM action_log WHERE request_id = ?")
            .bind(&intent.request_id)
            .execute(&mut *tx)
            .await?;

        let now = utc_now_iso();
        for action in &intent.proposed_actions {
            sqlx::query(
                r#"
                INSERT INTO action_log(
                    request_id, action_id, tool_name, status, safety_class, reason,
                    parameters_json, mode_constraints_json, requires_confirmation,
                    timeout_ms, created_at_utc
                )
                VALUES(?, ?, ?, 'queued', ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&intent.request_id)
            .bind(&action.action_id)
            .bind(&action.tool_name)
            .bind(action.safety_class.as_str())
            .bind(&action.reason)
            .bind(serde_json::to_string(&action.parameters)?)
            .bind(serde_json::to_string(&action.mode_constraints)?)
            .bind(action.requires_confirmation as i32)
            .bind(action.timeout_ms)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(intent.proposed_actions.len())
    }

    pub async fn get_intent(&self, request_id: &str) -> Result<Option<IntentRow>> {
        let row = sqlx::query("SELECT * FROM intent_log WHERE request_id = ?")
            .bind(request_id)
            .fetch_optional(self.pool())
            .await?;

        row.map(|row| {
            let questions: String = row.get("clarification_questions_json");
            let retrieval: String = row.get("retrieval_json");
            let actions: String = row.get("proposed_actions_json");
            Ok(IntentRow {
                request_id: row.get("request_id"),
                schema_version: row.get("schema_version"),
                timestamp_utc: row.get("timestamp_utc"),
                session_id: row.get("session_id"),
                mode: row.get("mode"),
                domain: row.get("domain"),
                urgency: row.get("urgency"),
                user_text: row.get("user_text"),
                needs_tools: row.get::<i32, _>("needs_tools") != 0,
                needs_clarification: row.get::<i32, _>("needs_clarification") != 0,
                clarification_questions: serde_json::from_str(&questions)?,
                retrieval: serde_json::from_str(&retrieval)?,
                proposed_actions: serde_json::from_str(&actions)?,
                response_text: row.get("response_text"),
            })
        })
        .transpose()
    }

    /// Actions of an intent in declared order, optionally narrowed to ids.
    pub async fn list_actions(
        &self,
        request_id: &str,
        action_ids: Option<&[String]>,
    ) -> Result<Vec<ActionRow>> {
        let mut sql = String::from("SELECT * FROM action_log WHERE request_id = ?");
        if let Some(ids) = action_ids {
            if !ids.is_empty() {
                sql.push_str(" AND action_id IN (");
                sql.push_str(&vec!["?"; ids.len()].join(","));
                sql.push(')');
            }
        }
        sql.push_str(" ORDER BY id ASC");

        let mut query = sqlx::query(&sql).bind(request_id);
        if let Some(ids) = action_ids {
            for id in ids {
                query = query.bind(id);
            }
        }

        let rows = query.fetch_all(self.pool()).await?;
        rows.iter().map(Self::row_to_action).collect()
    }

    pub async fn get_action(&self, request_id: &str, action_id: &str) -> Result<Option<ActionRow>> {
        let row = sqlx::query("SELECT * FROM action_log WHERE request_id = ? AND action_id = ?")
            .bind(request_id)
            .bind(action_id)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(Self::row_to_action).transpose()
    }

    pub async fn mark_action_denied(
        &self,
        id: i64,
        error_code: &str,
        error_message: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE action_log SET status='denied', error_code=?, error_message=?, ended_at_utc=? WHERE id=?",
        )
        .bind(error_code)
        .bind(error_message)
        .bind(utc_now_iso())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Park a confirmation-gated action back in the queue with the reason
    /// recorded, so a later confirm can pick it up.
    pub async fn mark_action_pending_confirmation(
        &self,
        id: i64,
        error_code: &str,
        error_message: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE action_log SET status='queued', error_code=?, error_message=? WHERE id=?",
        )
        .bind(error_code)
        .bind(error_message)
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn mark_action_approved(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE action_log SET status='approved', started_at_utc=? WHERE id=?")
            .bind(utc_now_iso())
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn mark_action_executing(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE action_log SET status='executing' WHERE id=?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn finish_action(
        &self,
        id: i64,
        status: ActionStatus,
        output: Option<&Value>,
        error_code: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<()> {
        debug_assert!(status.is_terminal());
        sqlx::query(
            "UPDATE action_log SET status=?, output_json=?, error_code=?, error_message=?, ended_at_utc=? WHERE id=?",
        )
        .bind(status.as_str())
        .bind(output.map(serde_json::to_string).transpose()?)
        .bind(error_code)
        .bind(error_message)
        .bind(utc_now_iso())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Record feedback for an existing intent. `NotFound` when the request id
    /// was never posted.
    pub async fn record_feedback(
        &self,
        request_id: &str,
        rating: i8,
        correction_text: Option<&str>,
        reviewer: &str,
    ) -> Result<i64> {
        if self.get_intent(request_id).await?.is_none() {
            return Err(DbError::not_found(format!("request_id not found: {request_id}")));
        }
        let result = sqlx::query(
            "INSERT INTO feedback_log(request_id, rating, correction_text, reviewer, created_at_utc) VALUES(?, ?, ?, ?, ?)",
        )
        .bind(request_id)
        .bind(rating as i32)
        .bind(correction_text)
        .bind(reviewer)
        .bind(utc_now_iso())
        .execute(self.pool())
        .await?;
        Ok(result.last_insert_rowid())
    }

    fn row_to_action(row: &sqlx::sqlite::SqliteRow) -> Result<ActionRow> {
        let status_raw: String = row.get("status");
        let safety_raw: String = row.get("safety_class");
        let parameters: String = row.get("parameters_json");
        let constraints: String = row.get("mode_constraints_json");
        let output: Option<String> = row.get("output_json");
        let safety_class: SafetyClass =
            serde_json::from_value(Value::String(safety_raw.clone()))
                .map_err(|_| DbError::invalid_state(format!("bad safety class: {safety_raw}")))?;
        Ok(ActionRow {
            id: row.get("id"),
            request_id: row.get("request_id"),
            action_id: row.get("action_id"),
            tool_name: row.get("tool_name"),
            status: status_raw
                .parse::<ActionStatus>()
                .map_err(DbError::invalid_state)?,
            safety_class,
            reason: row.get("reason"),
            parameters: serde_json::from_str(&parameters)?,
            mode_constraints: serde_json::from_str(&constraints)?,
            requires_confirmation: row.get::<i32, _>("requires_confirmation") != 0,
            timeout_ms: row.get::<i64, _>("timeout_ms") as u32,
            output: output.map(|raw| serde_json::from_str(&raw)).transpose()?,
            error_code: row.get("error_code"),
            error_message: row.get("error_message"),
            created_at_utc: row.get("created_at_utc"),
            started_at_utc: row.get("started_at_utc"),
            ended_at_utc: row.get("ended_at_utc"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use watchkeeper_protocol::http_types::{Domain, ProposedAction, Urgency};
    use watchkeeper_protocol::types::Mode;

    fn envelope(request_id: &str, actions: Vec<ProposedAction>) -> IntentEnvelope {
        IntentEnvelope {
            schema_version: "1.0".to_string(),
            request_id: request_id.to_string(),
            session_id: Some("sess-1".to_string()),
            timestamp_utc: "2026-01-01T00:00:00.000Z".to_string(),
            mode: Mode::Game,
            domain: Domain::Gameplay,
            urgency: Urgency::Normal,
            user_text: "set the lights".to_string(),
            needs_tools: true,
            needs_clarification: false,
            clarification_questions: vec![],
            retrieval: None,
            proposed_actions: actions,
            response_text: "Setting the lights.".to_string(),
        }
    }

    fn lights_action(action_id: &str) -> ProposedAction {
        ProposedAction {
            action_id: action_id.to_string(),
            tool_name: "sammi.set_lights".to_string(),
            parameters: json!({"scene": "red_alert"}),
            safety_class: SafetyClass::LowRisk,
            mode_constraints: vec![],
            requires_confirmation: false,
            timeout_ms: 5000,
            reason: None,
            confidence: 0.95,
        }
    }

    #[tokio::test]
    async fn intent_upsert_is_idempotent() {
        let db = WatchkeeperDb::open_in_memory().await.unwrap();
        let intent = envelope("req-1", vec![lights_action("a1"), lights_action("a2")]);

        let first = db.upsert_intent(&intent).await.unwrap();
        let second = db.upsert_intent(&intent).await.unwrap();
        assert_eq!(first, 2);
        assert_eq!(second, 2);

        let actions = db.list_actions("req-1", None).await.unwrap();
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].action_id, "a1");
        assert_eq!(actions[0].status, ActionStatus::Queued);
    }

    #[tokio::test]
    async fn action_transitions_round_trip() {
        let db = WatchkeeperDb::open_in_memory().await.unwrap();
        db.upsert_intent(&envelope("req-1", vec![lights_action("a1")]))
            .await
            .unwrap();

        let action = db.get_action("req-1", "a1").await.unwrap().unwrap();
        db.mark_action_approved(action.id).await.unwrap();
        db.mark_action_executing(action.id).await.unwrap();
        db.finish_action(action.id, ActionStatus::Success, Some(&json!({"done": true})), None, None)
            .await
            .unwrap();

        let done = db.get_action("req-1", "a1").await.unwrap().unwrap();
        assert_eq!(done.status, ActionStatus::Success);
        assert_eq!(done.output, Some(json!({"done": true})));
        assert!(done.started_at_utc.is_some());
        assert!(done.ended_at_utc.is_some());
    }

    #[tokio::test]
    async fn feedback_requires_existing_intent() {
        let db = WatchkeeperDb::open_in_memory().await.unwrap();
        let err = db
            .record_feedback("missing", 1, None, "user")
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::NotFound(_)));

        db.upsert_intent(&envelope("req-1", vec![])).await.unwrap();
        let id = db
            .record_feedback("req-1", -1, Some("wrong scene"), "user")
            .await
            .unwrap();
        assert!(id > 0);
    }
}
