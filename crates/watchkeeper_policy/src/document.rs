//! The Standing Orders document.
//!
//! A JSON file mapping watch conditions to allow/deny pattern lists and tool
//! names to guard records. Patterns are exact tool names or a namespace with
//! a single trailing wildcard (`sammi.*`); a bare `*` matches everything.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use watchkeeper_protocol::WatchCondition;

use crate::PolicyError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Defaults {
    pub confirm_window_seconds: u64,
    pub stt_min_confidence: f64,
    #[serde(default = "default_true")]
    pub require_incident_id: bool,
}

fn default_true() -> bool {
    true
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            confirm_window_seconds: watchkeeper_protocol::defaults::DEFAULT_CONFIRM_WINDOW_SECONDS,
            stt_min_confidence: watchkeeper_protocol::defaults::DEFAULT_STT_MIN_CONFIDENCE,
            require_incident_id: true,
        }
    }
}

/// Allow/deny lists for one watch condition. An absent field falls through
/// to the `inherits` parent; a present field (even an empty list) overrides
/// the parent's entirely.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConditionPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deny: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inherits: Option<String>,
}

/// A condition with its inheritance chain applied.
#[derive(Debug, Clone, Default)]
pub struct ResolvedCondition {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimit {
    pub window_sec: u64,
    pub max_count: u32,
}

/// Guard record for one tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolGuard {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreground_process_required: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_stt_confidence: Option<f64>,
    #[serde(default)]
    pub requires_confirmation: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safety_class: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StandingOrders {
    pub version: String,
    #[serde(default)]
    pub defaults: Defaults,
    pub watch_conditions: BTreeMap<String, ConditionPolicy>,
    #[serde(default)]
    pub tool_guards: BTreeMap<String, ToolGuard>,
}

impl StandingOrders {
    pub fn parse(raw: &str) -> Result<Self, PolicyError> {
        let doc: StandingOrders = serde_json::from_str(raw)?;
        doc.validate()?;
        Ok(doc)
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        for condition in WatchCondition::ALL {
            if !self.watch_conditions.contains_key(condition.as_str()) {
                return Err(PolicyError::Invalid(format!(
                    "missing watch_conditions entry: {condition}"
                )));
            }
        }
        for (name, policy) in &self.watch_conditions {
            if name.parse::<WatchCondition>().is_err() {
                return Err(PolicyError::Invalid(format!("unknown watch condition: {name}")));
            }
            if let Some(parent) = &policy.inherits {
                if !self.watch_conditions.contains_key(parent.as_str()) {
                    return Err(PolicyError::Invalid(format!(
                        "{name}.inherits references unknown condition: {parent}"
                    )));
                }
            }
            for pattern in policy
                .allow
                .iter()
                .flatten()
                .chain(policy.deny.iter().flatten())
            {
                validate_pattern(pattern)
                    .map_err(|e| PolicyError::Invalid(format!("{name}: {e}")))?;
            }
        }
        for (tool, guard) in &self.tool_guards {
            if tool.trim().is_empty() {
                return Err(PolicyError::Invalid("empty tool guard key".to_string()));
            }
            if let Some(rate) = &guard.rate_limit {
                if rate.window_sec == 0 || rate.max_count == 0 {
                    return Err(PolicyError::Invalid(format!(
                        "{tool}.rate_limit must have positive window_sec and max_count"
                    )));
                }
            }
            if let Some(conf) = guard.min_stt_confidence {
                if !(0.0..=1.0).contains(&conf) {
                    return Err(PolicyError::Invalid(format!(
                        "{tool}.min_stt_confidence must be in 0..1"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Resolve a condition through its inheritance chain: the nearest
    /// condition that sets a field wins that field.
    pub fn resolve_condition(&self, condition: WatchCondition) -> ResolvedCondition {
        let mut resolved = ResolvedCondition::default();
        let mut allow_set = false;
        let mut deny_set = false;

        let mut cursor = self.watch_conditions.get(condition.as_str());
        let mut guard = 0;
        while let Some(policy) = cursor {
            if !allow_set {
                if let Some(allow) = &policy.allow {
                    resolved.allow = allow.clone();
                    allow_set = true;
                }
            }
            if !deny_set {
                if let Some(deny) = &policy.deny {
                    resolved.deny = deny.clone();
                    deny_set = true;
                }
            }
            guard += 1;
            if guard > self.watch_conditions.len() {
                break; // inheritance cycle; stop rather than loop
            }
            cursor = policy
                .inherits
                .as_ref()
                .and_then(|parent| self.watch_conditions.get(parent.as_str()));
        }
        resolved
    }

    /// First guard whose key matches the tool, exact keys before wildcards.
    pub fn find_guard(&self, tool_key: &str) -> Option<&ToolGuard> {
        if let Some(guard) = self.tool_guards.get(tool_key) {
            return Some(guard);
        }
        self.tool_guards
            .iter()
            .find(|(pattern, _)| pattern_matches(pattern, tool_key))
            .map(|(_, guard)| guard)
    }
}

fn validate_pattern(pattern: &str) -> Result<(), String> {
    let p = pattern.trim();
    if p.is_empty() {
        return Err("empty pattern".to_string());
    }
    match p.find('*') {
        None => Ok(()),
        Some(_) if p == "*" => Ok(()),
        Some(pos) if pos == p.len() - 1 && p.ends_with(".*") => Ok(()),
        Some(_) => Err(format!("only a single trailing wildcard is supported: {p:?}")),
    }
}

/// Case-insensitive pattern match: exact, `ns.*` prefix, or bare `*`.
pub fn pattern_matches(pattern: &str, value: &str) -> bool {
    let pattern = pattern.trim();
    if pattern == "*" {
        return true;
    }
    let value = value.to_ascii_lowercase();
    let pattern = pattern.to_ascii_lowercase();
    if let Some(namespace) = pattern.strip_suffix(".*") {
        return value
            .strip_prefix(namespace)
            .map(|rest| rest.starts_with('.'))
            .unwrap_or(false);
    }
    pattern == value
}

pub(crate) fn any_match(patterns: &[String], value: &str) -> bool {
    patterns.iter().any(|p| pattern_matches(p, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_doc() -> String {
        serde_json::json!({
            "version": "1.0",
            "defaults": {"confirm_window_seconds": 12, "stt_min_confidence": 0.82},
            "watch_conditions": {
                "STANDBY": {"allow": ["sammi.*", "edparser.status"], "deny": ["input.*"]},
                "GAME": {"allow": ["input.keypress"], "inherits": "STANDBY"},
                "WORK": {"allow": ["sammi.music_next"]},
                "TUTOR": {"inherits": "WORK"},
                "RESTRICTED": {"allow": [], "deny": ["*"]},
                "DEGRADED": {"allow": ["edparser.status"]}
            },
            "tool_guards": {
                "input.keypress": {
                    "foreground_process_required": ["elitedangerous64.exe"],
                    "requires_confirmation": true,
                    "rate_limit": {"window_sec": 60, "max_count": 3},
                    "safety_class": "high_risk"
                }
            }
        })
        .to_string()
    }

    #[test]
    fn parses_and_validates() {
        let doc = StandingOrders::parse(&minimal_doc()).unwrap();
        assert_eq!(doc.defaults.confirm_window_seconds, 12);
        assert!(doc.defaults.require_incident_id);
    }

    #[test]
    fn missing_condition_is_invalid() {
        let mut value: serde_json::Value = serde_json::from_str(&minimal_doc()).unwrap();
        value["watch_conditions"]
            .as_object_mut()
            .unwrap()
            .remove("DEGRADED");
        let err = StandingOrders::parse(&value.to_string()).unwrap_err();
        assert!(err.to_string().contains("DEGRADED"));
    }

    #[test]
    fn interior_wildcard_is_invalid() {
        let mut value: serde_json::Value = serde_json::from_str(&minimal_doc()).unwrap();
        value["watch_conditions"]["STANDBY"]["allow"] = serde_json::json!(["sammi.*.lights"]);
        assert!(StandingOrders::parse(&value.to_string()).is_err());
    }

    #[test]
    fn inheritance_overrides_per_field() {
        let doc = StandingOrders::parse(&minimal_doc()).unwrap();

        // GAME sets its own allow list, which replaces the parent's, but
        // inherits the parent's deny list untouched.
        let game = doc.resolve_condition(WatchCondition::Game);
        assert!(any_match(&game.allow, "input.keypress"));
        assert!(!any_match(&game.allow, "sammi.set_lights"));
        assert!(any_match(&game.deny, "input.anything"));

        // TUTOR sets nothing and mirrors WORK entirely.
        let tutor = doc.resolve_condition(WatchCondition::Tutor);
        assert!(any_match(&tutor.allow, "sammi.music_next"));
        assert!(tutor.deny.is_empty());
    }

    #[test]
    fn pattern_semantics() {
        assert!(pattern_matches("sammi.*", "sammi.set_lights"));
        assert!(pattern_matches("sammi.*", "SAMMI.MUSIC_NEXT"));
        assert!(!pattern_matches("sammi.*", "sammi"));
        assert!(!pattern_matches("sammi.*", "sammixtra.lights"));
        assert!(pattern_matches("*", "anything.at_all"));
        assert!(pattern_matches("edparser.status", "edparser.status"));
        assert!(!pattern_matches("edparser.status", "edparser.start"));
    }
}
