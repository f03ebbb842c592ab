//! Capability registry and STT bias lexicon.

use serde_json::Value;
use sqlx::Row;
use watchkeeper_protocol::types::utc_now_iso;

use crate::error::Result;
use crate::types::{CapabilityRow, SttBiasRow};
use crate::WatchkeeperDb;

impl WatchkeeperDb {
    /// Upsert a capability. `status` is one of available/degraded/unavailable.
    pub async fn upsert_capability(&self, name: &str, status: &str, detail: &Value) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO capabilities(name, status, detail_json, updated_at_utc)
            VALUES(?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                status = excluded.status,
                detail_json = excluded.detail_json,
                updated_at_utc = excluded.updated_at_utc
            "#,
        )
        .bind(name)
        .bind(status)
        .bind(serde_json::to_string(detail)?)
        .bind(utc_now_iso())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn list_capabilities(&self) -> Result<Vec<CapabilityRow>> {
        let rows = sqlx::query("SELECT * FROM capabilities ORDER BY name ASC")
            .fetch_all(self.pool())
            .await?;
        rows.iter()
            .map(|row| {
                let detail: String = row.get("detail_json");
                Ok(CapabilityRow {
                    name: row.get("name"),
                    status: row.get("status"),
                    detail: serde_json::from_str(&detail)?,
                    updated_at_utc: row.get("updated_at_utc"),
                })
            })
            .collect()
    }

    /// Upsert an STT bias phrase, unique by (normalized, mode).
    pub async fn upsert_stt_bias(
        &self,
        phrase: &str,
        mode: Option<&str>,
        weight: f64,
        active: bool,
    ) -> Result<()> {
        let normalized = phrase.trim().to_lowercase();
        sqlx::query(
            r#"
            INSERT INTO stt_bias(phrase, normalized, mode, weight, active)
            VALUES(?, ?, ?, ?, ?)
            ON CONFLICT(normalized, mode) DO UPDATE SET
                phrase = excluded.phrase,
                weight = excluded.weight,
                active = excluded.active
            "#,
        )
        .bind(phrase)
        .bind(&normalized)
        .bind(mode)
        .bind(weight.max(0.0))
        .bind(active as i32)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Active bias entries, scoped to a mode when given (mode-scoped entries
    /// plus global ones).
    pub async fn list_stt_bias(&self, mode: Option<&str>) -> Result<Vec<SttBiasRow>> {
        let rows = match mode {
            Some(mode) => {
                sqlx::query(
                    "SELECT * FROM stt_bias WHERE active=1 AND (mode IS NULL OR mode = ?) ORDER BY weight DESC",
                )
                .bind(mode)
                .fetch_all(self.pool())
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM stt_bias WHERE active=1 ORDER BY weight DESC")
                    .fetch_all(self.pool())
                    .await?
            }
        };
        Ok(rows
            .iter()
            .map(|row| SttBiasRow {
                id: row.get("id"),
                phrase: row.get("phrase"),
                normalized: row.get("normalized"),
                mode: row.get("mode"),
                weight: row.get("weight"),
                active: row.get::<i32, _>("active") != 0,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn capability_upsert_replaces_status() {
        let db = WatchkeeperDb::open_in_memory().await.unwrap();
        db.upsert_capability("edparser", "available", &json!({}))
            .await
            .unwrap();
        db.upsert_capability("edparser", "degraded", &json!({"error": "slow"}))
            .await
            .unwrap();

        let caps = db.list_capabilities().await.unwrap();
        assert_eq!(caps.len(), 1);
        assert_eq!(caps[0].status, "degraded");
    }

    #[tokio::test]
    async fn stt_bias_unique_by_normalized_and_mode() {
        let db = WatchkeeperDb::open_in_memory().await.unwrap();
        db.upsert_stt_bias("Lakon Type-9", Some("game"), 2.0, true)
            .await
            .unwrap();
        db.upsert_stt_bias("lakon type-9", Some("game"), 3.0, true)
            .await
            .unwrap();
        db.upsert_stt_bias("lakon type-9", None, 1.0, true)
            .await
            .unwrap();

        let game = db.list_stt_bias(Some("game")).await.unwrap();
        assert_eq!(game.len(), 2);
        assert_eq!(game[0].weight, 3.0);
    }
}
