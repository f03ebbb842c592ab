//! Decision engine over the Standing Orders document.

use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use std::time::SystemTime;
use tracing::{info, warn};
use watchkeeper_protocol::types::Decision;
use watchkeeper_protocol::{ReasonCode, WatchCondition};

use crate::document::{any_match, StandingOrders};
use crate::PolicyError;

/// Confirmations older than this fall out of the ledger entirely.
const CONFIRMATION_RETENTION_SECS: f64 = 3600.0;

/// One action evaluation request. `now_ts` is epoch seconds supplied by the
/// caller so decisions are reproducible.
#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub incident_id: String,
    pub watch_condition: WatchCondition,
    pub tool_name: String,
    pub source: String,
    pub stt_confidence: Option<f64>,
    pub foreground_process: Option<String>,
    pub now_ts: f64,
    pub user_confirm_token: Option<String>,
    /// Set when the proposing intent flagged the action as needing explicit
    /// confirmation regardless of the guard table.
    pub action_requires_confirmation: bool,
}

#[derive(Debug, Clone)]
struct ConfirmationRecord {
    incident_id: String,
    tool_name: String,
    token: String,
    ts: f64,
}

struct DocumentState {
    document: StandingOrders,
    path: Option<PathBuf>,
    mtime: Option<SystemTime>,
}

/// The policy engine. Evaluation itself is pure; the rate windows and
/// confirmation ledger advance only on the timestamps passed in.
pub struct PolicyEngine {
    state: RwLock<DocumentState>,
    confirmations: Mutex<Vec<ConfirmationRecord>>,
    rate_windows: Mutex<HashMap<String, Vec<f64>>>,
}

impl PolicyEngine {
    /// Load and validate the document from disk. Invalid documents fail
    /// loudly here; startup treats that as fatal.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        let path = path.as_ref().to_path_buf();
        let raw = std::fs::read_to_string(&path)?;
        let document = StandingOrders::parse(&raw)?;
        let mtime = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
        info!(path = %path.display(), version = %document.version, "standing orders loaded");
        Ok(Self {
            state: RwLock::new(DocumentState {
                document,
                path: Some(path),
                mtime,
            }),
            confirmations: Mutex::new(Vec::new()),
            rate_windows: Mutex::new(HashMap::new()),
        })
    }

    /// Build from an already-parsed document (tests, dev ingest).
    pub fn from_document(document: StandingOrders) -> Self {
        Self {
            state: RwLock::new(DocumentState {
                document,
                path: None,
                mtime: None,
            }),
            confirmations: Mutex::new(Vec::new()),
            rate_windows: Mutex::new(HashMap::new()),
        }
    }

    /// Reload the document when the file changed on disk. A document that no
    /// longer validates keeps the last good one.
    pub fn maybe_reload(&self) {
        let (path, last_mtime) = {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            match &state.path {
                Some(path) => (path.clone(), state.mtime),
                None => return,
            }
        };
        let Ok(mtime) = std::fs::metadata(&path).and_then(|m| m.modified()) else {
            return;
        };
        if last_mtime == Some(mtime) {
            return;
        }
        match std::fs::read_to_string(&path).map_err(PolicyError::from).and_then(|raw| {
            StandingOrders::parse(&raw)
        }) {
            Ok(document) => {
                let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
                info!(version = %document.version, "standing orders reloaded");
                state.document = document;
                state.mtime = Some(mtime);
            }
            Err(err) => {
                warn!(error = %err, "standing orders reload failed; keeping previous document");
            }
        }
    }

    pub fn confirm_window_seconds(&self) -> u64 {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .document
            .defaults
            .confirm_window_seconds
    }

    /// Canonical tool key: bare aliases resolve to their namespaced form.
    pub fn canonical_tool_name(tool_name: &str) -> String {
        let trimmed = tool_name.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "keypress" => "input.keypress".to_string(),
            "set_lights" => "sammi.set_lights".to_string(),
            "music_next" => "sammi.music_next".to_string(),
            "music_pause" => "sammi.music_pause".to_string(),
            "music_resume" => "sammi.music_resume".to_string(),
            "edparser_start" => "edparser.start".to_string(),
            "edparser_stop" => "edparser.stop".to_string(),
            "edparser_status" => "edparser.status".to_string(),
            other => other.to_string(),
        }
    }

    /// Record a user confirmation for (incident, tool). Old entries are
    /// pruned on every write.
    pub fn record_confirmation(&self, incident_id: &str, tool_name: &str, token: &str, ts: f64) {
        if incident_id.is_empty() || tool_name.is_empty() || token.is_empty() {
            return;
        }
        let tool_key = Self::canonical_tool_name(tool_name);
        let mut ledger = self.confirmations.lock().unwrap_or_else(|e| e.into_inner());
        ledger.push(ConfirmationRecord {
            incident_id: incident_id.trim().to_string(),
            tool_name: tool_key,
            token: token.trim().to_string(),
            ts,
        });
        let cutoff = ts - CONFIRMATION_RETENTION_SECS;
        ledger.retain(|record| record.ts >= cutoff);
    }

    fn latest_confirmation(
        &self,
        incident_id: &str,
        tool_key: &str,
        token: Option<&str>,
    ) -> Option<ConfirmationRecord> {
        let ledger = self.confirmations.lock().unwrap_or_else(|e| e.into_inner());
        ledger
            .iter()
            .filter(|record| record.incident_id == incident_id && record.tool_name == tool_key)
            .filter(|record| token.map(|t| record.token == t).unwrap_or(true))
            .max_by(|a, b| a.ts.total_cmp(&b.ts))
            .cloned()
    }

    /// Rolling-window rate check; records the call when admitted.
    fn rate_limit_check(
        &self,
        bucket: String,
        now_ts: f64,
        window_sec: u64,
        max_count: u32,
    ) -> (bool, u32) {
        let mut windows = self.rate_windows.lock().unwrap_or_else(|e| e.into_inner());
        let window = windows.entry(bucket).or_default();
        let cutoff = now_ts - window_sec as f64;
        window.retain(|ts| *ts >= cutoff);
        if window.len() >= max_count as usize {
            return (false, 0);
        }
        window.push(now_ts);
        (true, max_count.saturating_sub(window.len() as u32))
    }

    /// Evaluate one action. First hit wins: deny list, allow list,
    /// foreground, stt confidence, rate limit, confirmation.
    pub fn evaluate(&self, req: &ActionRequest) -> Decision {
        self.maybe_reload();
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let doc = &state.document;
        let tool_key = Self::canonical_tool_name(&req.tool_name);

        if doc.defaults.require_incident_id && req.incident_id.trim().is_empty() {
            return Decision::deny(
                ReasonCode::DenyPolicyInvalid,
                "incident_id is required by policy",
            );
        }

        let condition = doc.resolve_condition(req.watch_condition);

        if any_match(&condition.deny, &tool_key) {
            return Decision::deny(
                ReasonCode::DenyExplicitlyDenied,
                format!("{tool_key} denied in {}", req.watch_condition),
            );
        }

        if !any_match(&condition.allow, &tool_key) {
            return Decision::deny(
                ReasonCode::DenyNotAllowedInCondition,
                format!("{tool_key} not allowed in {}", req.watch_condition),
            );
        }

        let guard = doc.find_guard(&tool_key).cloned().unwrap_or_default();

        if let Some(expected) = &guard.foreground_process_required {
            let foreground = req
                .foreground_process
                .as_deref()
                .map(|p| p.to_ascii_lowercase());
            let matched = foreground
                .as_deref()
                .map(|fg| expected.iter().any(|e| e.to_ascii_lowercase() == fg))
                .unwrap_or(false);
            if !matched {
                return Decision::deny(
                    ReasonCode::DenyForegroundMismatch,
                    format!(
                        "foreground {:?} not in allowed [{}]",
                        req.foreground_process.as_deref().unwrap_or(""),
                        expected.join(", ")
                    ),
                );
            }
        }

        let stt_floor = guard.min_stt_confidence.unwrap_or(doc.defaults.stt_min_confidence);
        if guard.min_stt_confidence.is_some() {
            if let Some(confidence) = req.stt_confidence {
                if confidence < stt_floor {
                    return Decision::deny(
                        ReasonCode::DenyLowSttConfidence,
                        format!("stt_confidence {confidence} below threshold {stt_floor}"),
                    );
                }
            }
        }

        let mut rate_remaining = None;
        if let Some(rate) = guard.rate_limit {
            let bucket = format!("{}:{tool_key}", req.watch_condition);
            let (ok, remaining) =
                self.rate_limit_check(bucket, req.now_ts, rate.window_sec, rate.max_count);
            rate_remaining = Some(remaining);
            if !ok {
                return Decision::deny(
                    ReasonCode::DenyRateLimit,
                    format!(
                        "rate limit exceeded ({} per {}s)",
                        rate.max_count, rate.window_sec
                    ),
                )
                .with_constraint("rate_limit_remaining", json!(0));
            }
        }

        let needs_confirmation = guard.requires_confirmation || req.action_requires_confirmation;
        if needs_confirmation {
            let window = doc.defaults.confirm_window_seconds as f64;
            let confirm_by = req.now_ts + window;
            match self.latest_confirmation(
                req.incident_id.trim(),
                &tool_key,
                req.user_confirm_token.as_deref(),
            ) {
                None => {
                    let mut decision = Decision::deny(
                        ReasonCode::DenyNeedsConfirmation,
                        format!("{tool_key} requires user confirmation"),
                    )
                    .with_constraint("confirm_by_ts", json!(confirm_by));
                    decision.requires_confirmation = true;
                    return decision;
                }
                Some(record) => {
                    let age = req.now_ts - record.ts;
                    if age > window {
                        let mut decision = Decision::deny(
                            ReasonCode::DenyConfirmationExpired,
                            format!("confirmation expired ({age:.1}s > {window}s)"),
                        )
                        .with_constraint("confirm_by_ts", json!(confirm_by));
                        decision.requires_confirmation = true;
                        return decision;
                    }
                }
            }
        }

        let mut decision = Decision::allow();
        if let Some(remaining) = rate_remaining {
            decision = decision.with_constraint("rate_limit_remaining", json!(remaining));
        }
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> PolicyEngine {
        let doc = StandingOrders::parse(
            &serde_json::json!({
                "version": "1.0",
                "defaults": {"confirm_window_seconds": 12, "stt_min_confidence": 0.82},
                "watch_conditions": {
                    "STANDBY": {"allow": ["sammi.*", "edparser.status"], "deny": ["twitch.*"]},
                    "GAME": {"allow": ["input.keypress", "edparser.*", "twitch.send_chat"], "inherits": "STANDBY"},
                    "WORK": {"allow": ["sammi.music_next", "sammi.music_pause", "sammi.music_resume"]},
                    "TUTOR": {"inherits": "WORK"},
                    "RESTRICTED": {"deny": ["*"]},
                    "DEGRADED": {"allow": ["edparser.status"]}
                },
                "tool_guards": {
                    "input.keypress": {
                        "foreground_process_required": ["EliteDangerous64.exe"],
                        "min_stt_confidence": 0.82,
                        "requires_confirmation": true,
                        "rate_limit": {"window_sec": 60, "max_count": 3},
                        "safety_class": "high_risk"
                    },
                    "twitch.send_chat": {"requires_confirmation": true}
                }
            })
            .to_string(),
        )
        .unwrap();
        PolicyEngine::from_document(doc)
    }

    fn request(condition: WatchCondition, tool: &str) -> ActionRequest {
        ActionRequest {
            incident_id: "inc-1".to_string(),
            watch_condition: condition,
            tool_name: tool.to_string(),
            source: "test".to_string(),
            stt_confidence: None,
            foreground_process: Some("EliteDangerous64.exe".to_string()),
            now_ts: 1_700_000_000.0,
            user_confirm_token: None,
            action_requires_confirmation: false,
        }
    }

    #[test]
    fn deny_list_wins_over_allow() {
        let engine = engine();
        // GAME inherits STANDBY's deny of twitch.* but also allows
        // twitch.send_chat; explicit deny is checked first.
        let decision = engine.evaluate(&request(WatchCondition::Game, "twitch.send_chat"));
        assert_eq!(decision.reason_code, ReasonCode::DenyExplicitlyDenied);
    }

    #[test]
    fn tool_outside_allow_list_is_denied() {
        let engine = engine();
        let decision = engine.evaluate(&request(WatchCondition::Work, "sammi.set_lights"));
        assert_eq!(decision.reason_code, ReasonCode::DenyNotAllowedInCondition);
    }

    #[test]
    fn restricted_denies_everything() {
        let engine = engine();
        let decision = engine.evaluate(&request(WatchCondition::Restricted, "edparser.status"));
        assert_eq!(decision.reason_code, ReasonCode::DenyExplicitlyDenied);
    }

    #[test]
    fn missing_incident_id_is_policy_invalid() {
        let engine = engine();
        let mut req = request(WatchCondition::Standby, "sammi.set_lights");
        req.incident_id = String::new();
        let decision = engine.evaluate(&req);
        assert_eq!(decision.reason_code, ReasonCode::DenyPolicyInvalid);
    }

    #[test]
    fn foreground_mismatch() {
        let engine = engine();
        let mut req = request(WatchCondition::Game, "input.keypress");
        req.foreground_process = Some("notepad.exe".to_string());
        let decision = engine.evaluate(&req);
        assert_eq!(decision.reason_code, ReasonCode::DenyForegroundMismatch);
    }

    #[test]
    fn low_stt_confidence_denied_before_confirmation() {
        let engine = engine();
        let mut req = request(WatchCondition::Game, "input.keypress");
        req.stt_confidence = Some(0.5);
        let decision = engine.evaluate(&req);
        assert_eq!(decision.reason_code, ReasonCode::DenyLowSttConfidence);
    }

    #[test]
    fn confirmation_flow_allows_within_window() {
        let engine = engine();
        let mut req = request(WatchCondition::Game, "input.keypress");
        req.stt_confidence = Some(0.95);

        let first = engine.evaluate(&req);
        assert_eq!(first.reason_code, ReasonCode::DenyNeedsConfirmation);
        assert!(first.requires_confirmation);
        assert!(first.constraints.contains_key("confirm_by_ts"));

        engine.record_confirmation("inc-1", "input.keypress", "tok-1", req.now_ts);
        req.user_confirm_token = Some("tok-1".to_string());
        let second = engine.evaluate(&req);
        assert_eq!(second.reason_code, ReasonCode::Allow);
    }

    #[test]
    fn confirmation_boundary_is_exact_window() {
        let engine = engine();
        let mut req = request(WatchCondition::Game, "input.keypress");
        req.stt_confidence = Some(0.95);
        engine.record_confirmation("inc-1", "input.keypress", "tok-1", 1_700_000_000.0);
        req.user_confirm_token = Some("tok-1".to_string());

        // At window - 1ms: still valid.
        req.now_ts = 1_700_000_000.0 + 12.0 - 0.001;
        assert_eq!(engine.evaluate(&req).reason_code, ReasonCode::Allow);

        // At window + 1ms: expired.
        req.now_ts = 1_700_000_000.0 + 12.0 + 0.001;
        assert_eq!(
            engine.evaluate(&req).reason_code,
            ReasonCode::DenyConfirmationExpired
        );
    }

    #[test]
    fn rate_limit_window_rolls() {
        let engine = engine();
        let base = 1_700_000_000.0;
        let mut req = request(WatchCondition::Game, "input.keypress");
        req.stt_confidence = Some(0.95);
        engine.record_confirmation("inc-1", "input.keypress", "tok-1", base);
        req.user_confirm_token = Some("tok-1".to_string());

        for i in 0..3 {
            req.now_ts = base + i as f64;
            assert_eq!(engine.evaluate(&req).reason_code, ReasonCode::Allow, "call {i}");
        }
        // Fourth call inside the window: rate limited.
        req.now_ts = base + 3.0;
        assert_eq!(engine.evaluate(&req).reason_code, ReasonCode::DenyRateLimit);

        // Just past the 60s window from the first call: the slot frees up.
        req.now_ts = base + 60.001;
        engine.record_confirmation("inc-1", "input.keypress", "tok-2", req.now_ts);
        req.user_confirm_token = Some("tok-2".to_string());
        assert_eq!(engine.evaluate(&req).reason_code, ReasonCode::Allow);
    }

    #[test]
    fn action_level_confirmation_flag_gates_unguarded_tools() {
        let engine = engine();
        let mut req = request(WatchCondition::Standby, "sammi.set_lights");
        req.action_requires_confirmation = true;
        let decision = engine.evaluate(&req);
        assert_eq!(decision.reason_code, ReasonCode::DenyNeedsConfirmation);
    }

    #[test]
    fn alias_canonicalization() {
        assert_eq!(PolicyEngine::canonical_tool_name("keypress"), "input.keypress");
        assert_eq!(PolicyEngine::canonical_tool_name("music_next"), "sammi.music_next");
        assert_eq!(
            PolicyEngine::canonical_tool_name("edparser_status"),
            "edparser.status"
        );
        assert_eq!(
            PolicyEngine::canonical_tool_name("sammi.set_lights"),
            "sammi.set_lights"
        );
    }
}
