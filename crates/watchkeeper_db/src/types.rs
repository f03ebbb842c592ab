//! Row types returned by the store.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use watchkeeper_protocol::types::{ActionStatus, SafetyClass};

/// Stored intent envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentRow {
    pub request_id: String,
    pub schema_version: String,
    pub timestamp_utc: String,
    pub session_id: Option<String>,
    pub mode: String,
    pub domain: String,
    pub urgency: String,
    pub user_text: String,
    pub needs_tools: bool,
    pub needs_clarification: bool,
    pub clarification_questions: Vec<String>,
    pub retrieval: Value,
    pub proposed_actions: Value,
    pub response_text: String,
}

/// Stored action record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRow {
    pub id: i64,
    pub request_id: String,
    pub action_id: String,
    pub tool_name: String,
    pub status: ActionStatus,
    pub safety_class: SafetyClass,
    pub reason: Option<String>,
    pub parameters: Value,
    pub mode_constraints: Vec<String>,
    pub requires_confirmation: bool,
    pub timeout_ms: u32,
    pub output: Option<Value>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub created_at_utc: String,
    pub started_at_utc: Option<String>,
    pub ended_at_utc: Option<String>,
}

/// Twitch per-category dedupe cursor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CursorRow {
    pub category: String,
    pub last_commit_marker: String,
    pub last_seq: i64,
    pub updated_at_utc: String,
}

/// Aggregated per-user Twitch stats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwitchUserRow {
    pub user_id: String,
    pub login_name: Option<String>,
    pub display_name: Option<String>,
    pub flags: Value,
    pub first_seen_utc: String,
    pub last_seen_utc: String,
    pub message_count: i64,
    pub bits_total: i64,
    pub hype_total: i64,
}

/// One recently ingested stream event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwitchRecentEvent {
    pub id: i64,
    pub event_type: String,
    pub commit_marker: String,
    pub user_id: String,
    pub payload: Value,
    pub received_at_utc: String,
}

/// Redeem leaderboard entry for one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedeemCount {
    pub reward_id: String,
    pub reward_title: String,
    pub count: i64,
}

/// Named capability with health status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityRow {
    pub name: String,
    pub status: String,
    pub detail: Value,
    pub updated_at_utc: String,
}

/// STT bias lexicon entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttBiasRow {
    pub id: i64,
    pub phrase: String,
    pub normalized: String,
    pub mode: Option<String>,
    pub weight: f64,
    pub active: bool,
}
