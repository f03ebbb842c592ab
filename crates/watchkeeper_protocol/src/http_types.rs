//! Request/response bodies for the HTTP surface.
//!
//! Bodies are closed schemas: unknown fields are rejected at the serde layer
//! (`deny_unknown_fields`), value-range checks happen in the pipeline.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::reason::ReasonCode;
use crate::types::{ActionStatus, Mode, SafetyClass};

/// Intent domain as proposed by the assist router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Gameplay,
    Lore,
    Astrophysics,
    GeneralGaming,
    Coding,
    Networking,
    System,
    Music,
    Speech,
    General,
}

impl Domain {
    pub fn as_str(self) -> &'static str {
        match self {
            Domain::Gameplay => "gameplay",
            Domain::Lore => "lore",
            Domain::Astrophysics => "astrophysics",
            Domain::GeneralGaming => "general_gaming",
            Domain::Coding => "coding",
            Domain::Networking => "networking",
            Domain::System => "system",
            Domain::Music => "music",
            Domain::Speech => "speech",
            Domain::General => "general",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    Normal,
    High,
}

impl Urgency {
    pub fn as_str(self) -> &'static str {
        match self {
            Urgency::Low => "low",
            Urgency::Normal => "normal",
            Urgency::High => "high",
        }
    }
}

/// One proposed action inside an intent envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProposedAction {
    pub action_id: String,
    pub tool_name: String,
    pub parameters: Value,
    pub safety_class: SafetyClass,
    #[serde(default)]
    pub mode_constraints: Vec<Mode>,
    #[serde(default)]
    pub requires_confirmation: bool,
    pub timeout_ms: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub confidence: f64,
}

/// `POST /intent` body: the assist router's proposal envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IntentEnvelope {
    pub schema_version: String,
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub timestamp_utc: String,
    pub mode: Mode,
    pub domain: Domain,
    pub urgency: Urgency,
    pub user_text: String,
    pub needs_tools: bool,
    pub needs_clarification: bool,
    #[serde(default)]
    pub clarification_questions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retrieval: Option<Value>,
    pub proposed_actions: Vec<ProposedAction>,
    pub response_text: String,
}

/// One item of a `POST /state` batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateItem {
    pub state_key: String,
    pub state_value: Value,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_at_utc: Option<String>,
}

/// `POST /state` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateIngestRequest {
    pub items: Vec<StateItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emit_events: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

/// `POST /execute` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecuteRequest {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incident_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watch_condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stt_confidence: Option<f64>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub allow_high_risk: bool,
    #[serde(default)]
    pub user_confirmed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_confirm_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmed_at_utc: Option<String>,
}

/// Per-action outcome inside an execute/confirm response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub action_id: String,
    pub tool_name: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<ReasonCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirm_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirm_by_ts: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ActionResult {
    pub fn terminal(action_id: &str, tool_name: &str, status: ActionStatus) -> Self {
        Self {
            action_id: action_id.to_string(),
            tool_name: tool_name.to_string(),
            status: status.as_str().to_string(),
            reason_code: None,
            reason: None,
            confirm_token: None,
            confirm_by_ts: None,
            output: None,
            error: None,
            message: None,
        }
    }
}

/// `POST /execute` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub ok: bool,
    pub request_id: String,
    pub incident_id: String,
    pub watch_condition: String,
    pub dry_run: bool,
    pub results: Vec<ActionResult>,
}

/// `POST /confirm` body: consume a minted confirmation token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfirmRequest {
    pub incident_id: String,
    pub confirm_token: String,
}

/// `POST /feedback` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FeedbackRequest {
    pub request_id: String,
    pub rating: i8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correction_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewer: Option<String>,
}

/// `POST /twitch/send_chat` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendChatRequest {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incident_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_confirm_token: Option<String>,
}

/// `POST /app/open` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppOpenRequest {
    pub app_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intent_rejects_unknown_fields() {
        let raw = serde_json::json!({
            "schema_version": "1.0",
            "request_id": "req-1",
            "timestamp_utc": "2026-01-01T00:00:00Z",
            "mode": "game",
            "domain": "gameplay",
            "urgency": "normal",
            "user_text": "hi",
            "needs_tools": false,
            "needs_clarification": false,
            "proposed_actions": [],
            "response_text": "",
            "surprise": true
        });
        assert!(serde_json::from_value::<IntentEnvelope>(raw).is_err());
    }

    #[test]
    fn execute_defaults_are_safe() {
        let req: ExecuteRequest =
            serde_json::from_value(serde_json::json!({"request_id": "r", "incident_id": "i"}))
                .unwrap();
        assert!(!req.dry_run);
        assert!(!req.allow_high_risk);
        assert!(!req.user_confirmed);
    }

    #[test]
    fn proposed_action_round_trip() {
        let action: ProposedAction = serde_json::from_value(serde_json::json!({
            "action_id": "a1",
            "tool_name": "sammi.set_lights",
            "parameters": {"scene": "red_alert"},
            "safety_class": "low_risk",
            "timeout_ms": 5000,
            "confidence": 0.9
        }))
        .unwrap();
        assert_eq!(action.safety_class, SafetyClass::LowRisk);
        assert!(action.mode_constraints.is_empty());
        assert!(!action.requires_confirmation);
    }
}
