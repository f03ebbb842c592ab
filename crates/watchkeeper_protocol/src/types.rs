//! Core domain types shared across the control plane.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::reason::ReasonCode;

/// Current operational mode label, the policy key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WatchCondition {
    Standby,
    Game,
    Work,
    Tutor,
    Restricted,
    Degraded,
}

impl WatchCondition {
    pub const ALL: [WatchCondition; 6] = [
        WatchCondition::Standby,
        WatchCondition::Game,
        WatchCondition::Work,
        WatchCondition::Tutor,
        WatchCondition::Restricted,
        WatchCondition::Degraded,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            WatchCondition::Standby => "STANDBY",
            WatchCondition::Game => "GAME",
            WatchCondition::Work => "WORK",
            WatchCondition::Tutor => "TUTOR",
            WatchCondition::Restricted => "RESTRICTED",
            WatchCondition::Degraded => "DEGRADED",
        }
    }
}

impl fmt::Display for WatchCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WatchCondition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "STANDBY" => Ok(WatchCondition::Standby),
            "GAME" => Ok(WatchCondition::Game),
            "WORK" => Ok(WatchCondition::Work),
            "TUTOR" => Ok(WatchCondition::Tutor),
            "RESTRICTED" => Ok(WatchCondition::Restricted),
            "DEGRADED" => Ok(WatchCondition::Degraded),
            other => Err(format!("unknown watch_condition: {other}")),
        }
    }
}

/// Intent mode as proposed by the assist router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Standby,
    Game,
    Work,
    Tutor,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Standby => "standby",
            Mode::Game => "game",
            Mode::Work => "work",
            Mode::Tutor => "tutor",
        }
    }

    /// Fallback watch condition when nothing better is known.
    pub fn default_condition(self) -> WatchCondition {
        match self {
            Mode::Standby => WatchCondition::Standby,
            Mode::Game => WatchCondition::Game,
            Mode::Work => WatchCondition::Work,
            Mode::Tutor => WatchCondition::Tutor,
        }
    }
}

/// Tool risk class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyClass {
    ReadOnly,
    LowRisk,
    HighRisk,
}

impl SafetyClass {
    pub fn as_str(self) -> &'static str {
        match self {
            SafetyClass::ReadOnly => "read_only",
            SafetyClass::LowRisk => "low_risk",
            SafetyClass::HighRisk => "high_risk",
        }
    }
}

/// Action lifecycle: queued -> approved | denied -> executing -> terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Queued,
    Approved,
    Denied,
    Executing,
    Success,
    Error,
    Timeout,
}

impl ActionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionStatus::Queued => "queued",
            ActionStatus::Approved => "approved",
            ActionStatus::Denied => "denied",
            ActionStatus::Executing => "executing",
            ActionStatus::Success => "success",
            ActionStatus::Error => "error",
            ActionStatus::Timeout => "timeout",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ActionStatus::Denied | ActionStatus::Success | ActionStatus::Error | ActionStatus::Timeout
        )
    }
}

impl FromStr for ActionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(ActionStatus::Queued),
            "approved" => Ok(ActionStatus::Approved),
            "denied" => Ok(ActionStatus::Denied),
            "executing" => Ok(ActionStatus::Executing),
            "success" => Ok(ActionStatus::Success),
            "error" => Ok(ActionStatus::Error),
            "timeout" => Ok(ActionStatus::Timeout),
            other => Err(format!("unknown action status: {other}")),
        }
    }
}

/// Event severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Error => "error",
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(Severity::Debug),
            "info" => Ok(Severity::Info),
            "warn" => Ok(Severity::Warn),
            "error" => Ok(Severity::Error),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

/// ISO-8601 UTC with millisecond precision, the canonical timestamp text.
pub fn utc_now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn to_iso(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// A latest-truth state entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateEntry {
    pub state_key: String,
    pub state_value: Value,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    pub observed_at_utc: String,
    pub updated_at_utc: String,
}

/// An event about to be appended. The store assigns the sequence number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEvent {
    pub event_id: String,
    pub timestamp_utc: String,
    pub event_type: String,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incident_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watch_condition: Option<WatchCondition>,
    pub severity: Severity,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl NewEvent {
    pub fn new(event_type: impl Into<String>, source: impl Into<String>, payload: Value) -> Self {
        Self {
            event_id: String::new(),
            timestamp_utc: utc_now_iso(),
            event_type: event_type.into(),
            source: source.into(),
            session_id: None,
            correlation_id: None,
            incident_id: None,
            watch_condition: None,
            severity: Severity::Info,
            payload,
            tags: Vec::new(),
        }
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn correlation(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn incident(mut self, id: impl Into<String>) -> Self {
        self.incident_id = Some(id.into());
        self
    }

    pub fn condition(mut self, condition: WatchCondition) -> Self {
        self.watch_condition = Some(condition);
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// A stored event, globally ordered by `seq`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub seq: i64,
    pub event_id: String,
    pub timestamp_utc: String,
    pub event_type: String,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incident_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watch_condition: Option<String>,
    pub severity: Severity,
    pub payload: Value,
    pub tags: Vec<String>,
}

/// Policy decision for one (condition, tool, context) triple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub allowed: bool,
    pub requires_confirmation: bool,
    pub reason_code: ReasonCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason_text: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub constraints: BTreeMap<String, Value>,
}

impl Decision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            requires_confirmation: false,
            reason_code: ReasonCode::Allow,
            reason_text: None,
            constraints: BTreeMap::new(),
        }
    }

    pub fn deny(reason_code: ReasonCode, reason_text: impl Into<String>) -> Self {
        Self {
            allowed: false,
            requires_confirmation: false,
            reason_code,
            reason_text: Some(reason_text.into()),
            constraints: BTreeMap::new(),
        }
    }

    pub fn with_constraint(mut self, key: &str, value: Value) -> Self {
        self.constraints.insert(key.to_string(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watch_condition_round_trip() {
        for condition in WatchCondition::ALL {
            let parsed: WatchCondition = condition.as_str().parse().unwrap();
            assert_eq!(parsed, condition);
        }
        assert!("game".parse::<WatchCondition>().is_ok());
        assert!("UNKNOWN".parse::<WatchCondition>().is_err());
    }

    #[test]
    fn action_status_terminality() {
        assert!(ActionStatus::Denied.is_terminal());
        assert!(ActionStatus::Timeout.is_terminal());
        assert!(!ActionStatus::Queued.is_terminal());
        assert!(!ActionStatus::Executing.is_terminal());
    }

    #[test]
    fn decision_serializes_reason_code() {
        let decision = Decision::deny(ReasonCode::DenyRateLimit, "over limit");
        let json = serde_json::to_value(&decision).unwrap();
        assert_eq!(json["reason_code"], "DENY_RATE_LIMIT");
        assert_eq!(json["allowed"], false);
    }
}
