//! Schema creation. All CREATE TABLE statements live here.

use crate::error::Result;
use crate::WatchkeeperDb;
use tracing::debug;

impl WatchkeeperDb {
    pub(crate) async fn ensure_schema(&self) -> Result<()> {
        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(self.pool())
            .await?;
        sqlx::query("PRAGMA synchronous=NORMAL")
            .execute(self.pool())
            .await?;
        sqlx::query("PRAGMA foreign_keys=ON")
            .execute(self.pool())
            .await?;

        self.create_core_tables().await?;
        self.create_intent_tables().await?;
        self.create_twitch_tables().await?;

        debug!("schema verified");
        Ok(())
    }

    async fn create_core_tables(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS config (
                key TEXT PRIMARY KEY,
                value_json TEXT NOT NULL,
                updated_at_utc TEXT NOT NULL
            )"#,
        )
        .execute(self.pool())
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS state_current (
                state_key TEXT PRIMARY KEY,
                state_value_json TEXT NOT NULL,
                source TEXT NOT NULL,
                confidence REAL,
                observed_at_utc TEXT NOT NULL,
                updated_at_utc TEXT NOT NULL
            )"#,
        )
        .execute(self.pool())
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS event_log (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                event_id TEXT NOT NULL UNIQUE,
                timestamp_utc TEXT NOT NULL,
                event_type TEXT NOT NULL,
                source TEXT NOT NULL,
                session_id TEXT,
                correlation_id TEXT,
                incident_id TEXT,
                watch_condition TEXT,
                severity TEXT NOT NULL DEFAULT 'info',
                payload_json TEXT NOT NULL,
                tags_json TEXT NOT NULL DEFAULT '[]'
            )"#,
        )
        .execute(self.pool())
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_type ON event_log(event_type)")
            .execute(self.pool())
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_events_correlation ON event_log(correlation_id)",
        )
        .execute(self.pool())
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS capabilities (
                name TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                detail_json TEXT NOT NULL DEFAULT '{}',
                updated_at_utc TEXT NOT NULL
            )"#,
        )
        .execute(self.pool())
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS stt_bias (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                phrase TEXT NOT NULL,
                normalized TEXT NOT NULL,
                mode TEXT,
                weight REAL NOT NULL DEFAULT 1.0,
                active INTEGER NOT NULL DEFAULT 1,
                UNIQUE(normalized, mode)
            )"#,
        )
        .execute(self.pool())
        .await?;

        Ok(())
    }

    async fn create_intent_tables(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS intent_log (
                request_id TEXT PRIMARY KEY,
                schema_version TEXT NOT NULL,
                timestamp_utc TEXT NOT NULL,
                session_id TEXT,
                mode TEXT NOT NULL,
                domain TEXT NOT NULL,
                urgency TEXT NOT NULL,
                user_text TEXT NOT NULL,
                needs_tools INTEGER NOT NULL,
                needs_clarification INTEGER NOT NULL,
                clarification_questions_json TEXT NOT NULL DEFAULT '[]',
                retrieval_json TEXT NOT NULL DEFAULT '{}',
                proposed_actions_json TEXT NOT NULL DEFAULT '[]',
                response_text TEXT NOT NULL DEFAULT ''
            )"#,
        )
        .execute(self.pool())
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS action_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                request_id TEXT NOT NULL REFERENCES intent_log(request_id),
                action_id TEXT NOT NULL,
                tool_name TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'queued',
                safety_class TEXT NOT NULL,
                reason TEXT,
                parameters_json TEXT NOT NULL DEFAULT '{}',
                mode_constraints_json TEXT NOT NULL DEFAULT '[]',
                requires_confirmation INTEGER NOT NULL DEFAULT 0,
                timeout_ms INTEGER NOT NULL DEFAULT 5000,
                output_json TEXT,
                error_code TEXT,
                error_message TEXT,
                created_at_utc TEXT NOT NULL,
                started_at_utc TEXT,
                ended_at_utc TEXT,
                UNIQUE(request_id, action_id)
            )"#,
        )
        .execute(self.pool())
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_actions_request ON action_log(request_id)")
            .execute(self.pool())
            .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS feedback_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                request_id TEXT NOT NULL REFERENCES intent_log(request_id),
                rating INTEGER NOT NULL,
                correction_text TEXT,
                reviewer TEXT NOT NULL DEFAULT 'user',
                created_at_utc TEXT NOT NULL
            )"#,
        )
        .execute(self.pool())
        .await?;

        Ok(())
    }

    async fn create_twitch_tables(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS twitch_cursors (
                category TEXT PRIMARY KEY,
                last_commit_marker TEXT NOT NULL,
                last_seq INTEGER NOT NULL DEFAULT 0,
                updated_at_utc TEXT NOT NULL
            )"#,
        )
        .execute(self.pool())
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS twitch_users (
                user_id TEXT PRIMARY KEY,
                login_name TEXT,
                display_name TEXT,
                flags_json TEXT NOT NULL DEFAULT '{}',
                first_seen_utc TEXT NOT NULL,
                last_seen_utc TEXT NOT NULL,
                message_count INTEGER NOT NULL DEFAULT 0,
                bits_total INTEGER NOT NULL DEFAULT 0,
                hype_total INTEGER NOT NULL DEFAULT 0
            )"#,
        )
        .execute(self.pool())
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS twitch_recent_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                message_ts_utc TEXT NOT NULL,
                msg_id TEXT,
                text TEXT NOT NULL
            )"#,
        )
        .execute(self.pool())
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS twitch_redeems (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                reward_id TEXT NOT NULL,
                reward_title TEXT NOT NULL DEFAULT '',
                redeemed_at_utc TEXT NOT NULL
            )"#,
        )
        .execute(self.pool())
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_redeems_user ON twitch_redeems(user_id)")
            .execute(self.pool())
            .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS twitch_recent_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_type TEXT NOT NULL,
                commit_marker TEXT NOT NULL,
                user_id TEXT NOT NULL,
                payload_json TEXT NOT NULL DEFAULT '{}',
                received_at_utc TEXT NOT NULL
            )"#,
        )
        .execute(self.pool())
        .await?;

        Ok(())
    }
}
