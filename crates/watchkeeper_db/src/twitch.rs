//! Twitch ingest tables: dedupe cursors, users, redeems, recent events.
//!
//! Cursors only move forward. Markers are normalized ISO-8601 strings, so the
//! ordering comparison is plain string comparison.

use serde_json::Value;
use sqlx::Row;
use watchkeeper_protocol::types::utc_now_iso;

use crate::error::Result;
use crate::types::{CursorRow, RedeemCount, TwitchRecentEvent, TwitchUserRow};
use crate::WatchkeeperDb;

const RECENT_EVENTS_KEEP: i64 = 200;

impl WatchkeeperDb {
    pub async fn get_cursor(&self, category: &str) -> Result<Option<CursorRow>> {
        let row = sqlx::query("SELECT * FROM twitch_cursors WHERE category = ?")
            .bind(category)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.map(|row| CursorRow {
            category: row.get("category"),
            last_commit_marker: row.get("last_commit_marker"),
            last_seq: row.get("last_seq"),
            updated_at_utc: row.get("updated_at_utc"),
        }))
    }

    /// Advance the category cursor. Returns `false` (no write) when the
    /// marker is not strictly greater than the stored one.
    pub async fn advance_cursor(&self, category: &str, marker: &str, seq: u32) -> Result<bool> {
        let mut tx = self.pool().begin().await?;
        let current: Option<String> =
            sqlx::query("SELECT last_commit_marker FROM twitch_cursors WHERE category = ?")
                .bind(category)
                .fetch_optional(&mut *tx)
                .await?
                .map(|row| row.get("last_commit_marker"));

        if let Some(current) = current {
            if marker <= current.as_str() {
                tx.rollback().await?;
                return Ok(false);
            }
        }

        sqlx::query(
            r#"
            INSERT INTO twitch_cursors(category, last_commit_marker, last_seq, updated_at_utc)
            VALUES(?, ?, ?, ?)
            ON CONFLICT(category) DO UPDATE SET
                last_commit_marker = excluded.last_commit_marker,
                last_seq = excluded.last_seq,
                updated_at_utc = excluded.updated_at_utc
            "#,
        )
        .bind(category)
        .bind(marker)
        .bind(seq as i64)
        .bind(utc_now_iso())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    pub async fn upsert_twitch_user(
        &self,
        user_id: &str,
        login_name: Option<&str>,
        display_name: Option<&str>,
        flags: &Value,
        seen_ts_utc: &str,
        increment_messages: bool,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO twitch_users(
                user_id, login_name, display_name, flags_json,
                first_seen_utc, last_seen_utc, message_count
            )
            VALUES(?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                login_name = COALESCE(excluded.login_name, twitch_users.login_name),
                display_name = COALESCE(excluded.display_name, twitch_users.display_name),
                flags_json = excluded.flags_json,
                last_seen_utc = excluded.last_seen_utc,
                message_count = twitch_users.message_count + ?
            "#,
        )
        .bind(user_id)
        .bind(login_name)
        .bind(display_name)
        .bind(serde_json::to_string(flags)?)
        .bind(seen_ts_utc)
        .bind(seen_ts_utc)
        .bind(increment_messages as i64)
        .bind(increment_messages as i64)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_twitch_user(&self, user_id: &str) -> Result<Option<TwitchUserRow>> {
        let row = sqlx::query("SELECT * FROM twitch_users WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(self.pool())
            .await?;
        row.map(|row| {
            let flags: String = row.get("flags_json");
            Ok(TwitchUserRow {
                user_id: row.get("user_id"),
                login_name: row.get("login_name"),
                display_name: row.get("display_name"),
                flags: serde_json::from_str(&flags)?,
                first_seen_utc: row.get("first_seen_utc"),
                last_seen_utc: row.get("last_seen_utc"),
                message_count: row.get("message_count"),
                bits_total: row.get("bits_total"),
                hype_total: row.get("hype_total"),
            })
        })
        .transpose()
    }

    /// Record a chat line and keep only the newest `keep_last` per user.
    pub async fn insert_recent_message_and_prune(
        &self,
        user_id: &str,
        message_ts_utc: &str,
        msg_id: Option<&str>,
        text: &str,
        keep_last: i64,
    ) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        sqlx::query(
            "INSERT INTO twitch_recent_messages(user_id, message_ts_utc, msg_id, text) VALUES(?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(message_ts_utc)
        .bind(msg_id)
        .bind(text)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            DELETE FROM twitch_recent_messages
            WHERE user_id = ? AND id NOT IN (
                SELECT id FROM twitch_recent_messages
                WHERE user_id = ? ORDER BY id DESC LIMIT ?
            )
            "#,
        )
        .bind(user_id)
        .bind(user_id)
        .bind(keep_last)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn user_message_count(&self, user_id: &str) -> Result<i64> {
        let row = sqlx::query("SELECT message_count FROM twitch_users WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.map(|r| r.get("message_count")).unwrap_or(0))
    }

    pub async fn add_bits(&self, user_id: &str, amount: i64) -> Result<()> {
        sqlx::query("UPDATE twitch_users SET bits_total = bits_total + ? WHERE user_id = ?")
            .bind(amount)
            .bind(user_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn add_hype(&self, user_id: &str, amount: i64) -> Result<()> {
        sqlx::query("UPDATE twitch_users SET hype_total = hype_total + ? WHERE user_id = ?")
            .bind(amount)
            .bind(user_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn add_redeem(
        &self,
        user_id: &str,
        reward_id: &str,
        reward_title: &str,
        redeemed_at_utc: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO twitch_redeems(user_id, reward_id, reward_title, redeemed_at_utc) VALUES(?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(reward_id)
        .bind(reward_title)
        .bind(redeemed_at_utc)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn top_redeems(&self, user_id: &str, limit: u32) -> Result<Vec<RedeemCount>> {
        let rows = sqlx::query(
            r#"
            SELECT reward_id, MAX(reward_title) AS reward_title, COUNT(*) AS count
            FROM twitch_redeems
            WHERE user_id = ?
            GROUP BY reward_id
            ORDER BY count DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(limit.clamp(1, 100) as i64)
        .fetch_all(self.pool())
        .await?;
        Ok(rows
            .iter()
            .map(|row| RedeemCount {
                reward_id: row.get("reward_id"),
                reward_title: row.get("reward_title"),
                count: row.get("count"),
            })
            .collect())
    }

    pub async fn record_recent_twitch_event(
        &self,
        event_type: &str,
        commit_marker: &str,
        user_id: &str,
        payload: &Value,
    ) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        sqlx::query(
            r#"
            INSERT INTO twitch_recent_events(event_type, commit_marker, user_id, payload_json, received_at_utc)
            VALUES(?, ?, ?, ?, ?)
            "#,
        )
        .bind(event_type)
        .bind(commit_marker)
        .bind(user_id)
        .bind(serde_json::to_string(payload)?)
        .bind(utc_now_iso())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            DELETE FROM twitch_recent_events
            WHERE id NOT IN (SELECT id FROM twitch_recent_events ORDER BY id DESC LIMIT ?)
            "#,
        )
        .bind(RECENT_EVENTS_KEEP)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn recent_twitch_events(&self, limit: u32) -> Result<Vec<TwitchRecentEvent>> {
        let rows = sqlx::query(
            "SELECT * FROM twitch_recent_events ORDER BY id DESC LIMIT ?",
        )
        .bind(limit.clamp(1, 200) as i64)
        .fetch_all(self.pool())
        .await?;
        rows.iter()
            .map(|row| {
                let payload: String = row.get("payload_json");
                Ok(TwitchRecentEvent {
                    id: row.get("id"),
                    event_type: row.get("event_type"),
                    commit_marker: row.get("commit_marker"),
                    user_id: row.get("user_id"),
                    payload: serde_json::from_str(&payload)?,
                    received_at_utc: row.get("received_at_utc"),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn cursor_only_moves_forward() {
        let db = WatchkeeperDb::open_in_memory().await.unwrap();

        assert!(db
            .advance_cursor("CHAT", "2023-11-14T22:13:20.000Z", 0)
            .await
            .unwrap());
        // Equal marker: duplicate, dropped.
        assert!(!db
            .advance_cursor("CHAT", "2023-11-14T22:13:20.000Z", 1)
            .await
            .unwrap());
        // Older marker: dropped.
        assert!(!db
            .advance_cursor("CHAT", "2023-11-14T22:13:19.000Z", 0)
            .await
            .unwrap());
        // Strictly newer: accepted.
        assert!(db
            .advance_cursor("CHAT", "2023-11-14T22:13:21.000Z", 0)
            .await
            .unwrap());

        let cursor = db.get_cursor("CHAT").await.unwrap().unwrap();
        assert_eq!(cursor.last_commit_marker, "2023-11-14T22:13:21.000Z");
    }

    #[tokio::test]
    async fn cursors_are_per_category() {
        let db = WatchkeeperDb::open_in_memory().await.unwrap();
        assert!(db.advance_cursor("CHAT", "b", 0).await.unwrap());
        assert!(db.advance_cursor("REDEEM", "a", 0).await.unwrap());
        assert!(db.get_cursor("BITS").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn user_stats_accumulate() {
        let db = WatchkeeperDb::open_in_memory().await.unwrap();
        let ts = "2026-01-01T00:00:00.000Z";
        db.upsert_twitch_user("42", Some("viewer"), Some("Viewer"), &json!({}), ts, true)
            .await
            .unwrap();
        db.upsert_twitch_user("42", None, None, &json!({"is_vip": true}), ts, true)
            .await
            .unwrap();
        db.add_bits("42", 100).await.unwrap();

        let user = db.get_twitch_user("42").await.unwrap().unwrap();
        assert_eq!(user.message_count, 2);
        assert_eq!(user.bits_total, 100);
        assert_eq!(user.login_name.as_deref(), Some("viewer"));
        assert_eq!(user.flags, json!({"is_vip": true}));
    }

    #[tokio::test]
    async fn recent_messages_pruned_to_keep_last() {
        let db = WatchkeeperDb::open_in_memory().await.unwrap();
        for i in 0..8 {
            db.insert_recent_message_and_prune("42", "2026-01-01T00:00:00Z", None, &format!("m{i}"), 5)
                .await
                .unwrap();
        }
        let count: i64 =
            sqlx::query("SELECT COUNT(*) AS n FROM twitch_recent_messages WHERE user_id='42'")
                .fetch_one(db.pool())
                .await
                .map(|row| row.get("n"))
                .unwrap();
        assert_eq!(count, 5);
    }

    #[tokio::test]
    async fn redeem_leaderboard() {
        let db = WatchkeeperDb::open_in_memory().await.unwrap();
        let ts = "2026-01-01T00:00:00.000Z";
        for _ in 0..3 {
            db.add_redeem("42", "hydrate", "Hydrate!", ts).await.unwrap();
        }
        db.add_redeem("42", "lurk", "Lurk", ts).await.unwrap();

        let top = db.top_redeems("42", 10).await.unwrap();
        assert_eq!(top[0].reward_id, "hydrate");
        assert_eq!(top[0].count, 3);
        assert_eq!(top.len(), 2);
    }
}
