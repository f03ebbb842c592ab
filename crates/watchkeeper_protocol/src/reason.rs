//! Closed reason-code taxonomy.
//!
//! Codes are carried verbatim in JSON responses and event payloads; adding a
//! code is a wire-format change, so the set is closed and every consumer
//! matches exhaustively.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    Allow,

    // Validation
    InvalidStateKey,
    SchemaViolation,
    MissingIncidentId,

    // Policy
    DenyExplicitlyDenied,
    DenyNotAllowedInCondition,
    DenyForegroundMismatch,
    DenyLowSttConfidence,
    DenyRateLimit,
    DenyNeedsConfirmation,
    DenyConfirmationExpired,
    DenyPolicyInvalid,
    DenyModeConstraint,
    DenyHighRiskNotAllowed,
    ConfirmExpired,
    ConfirmTokenUnknown,

    // Dispatch
    ActuatorsDisabled,
    KeypressDisabled,
    ToolNotImplemented,
    AdapterTimeout,
    AdapterError,

    // Storage
    DuplicateEventId,
    StoreUnavailable,

    // Ingest
    DoorbellMalformed,
    BridgeUnreachable,
}

impl ReasonCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ReasonCode::Allow => "ALLOW",
            ReasonCode::InvalidStateKey => "INVALID_STATE_KEY",
            ReasonCode::SchemaViolation => "SCHEMA_VIOLATION",
            ReasonCode::MissingIncidentId => "MISSING_INCIDENT_ID",
            ReasonCode::DenyExplicitlyDenied => "DENY_EXPLICITLY_DENIED",
            ReasonCode::DenyNotAllowedInCondition => "DENY_NOT_ALLOWED_IN_CONDITION",
            ReasonCode::DenyForegroundMismatch => "DENY_FOREGROUND_MISMATCH",
            ReasonCode::DenyLowSttConfidence => "DENY_LOW_STT_CONFIDENCE",
            ReasonCode::DenyRateLimit => "DENY_RATE_LIMIT",
            ReasonCode::DenyNeedsConfirmation => "DENY_NEEDS_CONFIRMATION",
            ReasonCode::DenyConfirmationExpired => "DENY_CONFIRMATION_EXPIRED",
            ReasonCode::DenyPolicyInvalid => "DENY_POLICY_INVALID",
            ReasonCode::DenyModeConstraint => "DENY_MODE_CONSTRAINT",
            ReasonCode::DenyHighRiskNotAllowed => "DENY_HIGH_RISK_NOT_ALLOWED",
            ReasonCode::ConfirmExpired => "CONFIRM_EXPIRED",
            ReasonCode::ConfirmTokenUnknown => "CONFIRM_TOKEN_UNKNOWN",
            ReasonCode::ActuatorsDisabled => "ACTUATORS_DISABLED",
            ReasonCode::KeypressDisabled => "KEYPRESS_DISABLED",
            ReasonCode::ToolNotImplemented => "TOOL_NOT_IMPLEMENTED",
            ReasonCode::AdapterTimeout => "ADAPTER_TIMEOUT",
            ReasonCode::AdapterError => "ADAPTER_ERROR",
            ReasonCode::DuplicateEventId => "DUPLICATE_EVENT_ID",
            ReasonCode::StoreUnavailable => "STORE_UNAVAILABLE",
            ReasonCode::DoorbellMalformed => "DOORBELL_MALFORMED",
            ReasonCode::BridgeUnreachable => "BRIDGE_UNREACHABLE",
        }
    }

    /// Deny-family codes are expected outcomes, not faults; they ride back in
    /// the per-action decision array with HTTP 200.
    pub fn is_policy_deny(self) -> bool {
        matches!(
            self,
            ReasonCode::DenyExplicitlyDenied
                | ReasonCode::DenyNotAllowedInCondition
                | ReasonCode::DenyForegroundMismatch
                | ReasonCode::DenyLowSttConfidence
                | ReasonCode::DenyRateLimit
                | ReasonCode::DenyNeedsConfirmation
                | ReasonCode::DenyConfirmationExpired
                | ReasonCode::DenyPolicyInvalid
                | ReasonCode::DenyModeConstraint
                | ReasonCode::DenyHighRiskNotAllowed
        )
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_as_screaming_snake() {
        let json = serde_json::to_string(&ReasonCode::DenyNeedsConfirmation).unwrap();
        assert_eq!(json, "\"DENY_NEEDS_CONFIRMATION\"");
        assert_eq!(
            ReasonCode::DenyNeedsConfirmation.as_str(),
            "DENY_NEEDS_CONFIRMATION"
        );
    }

    #[test]
    fn deny_family_classification() {
        assert!(ReasonCode::DenyRateLimit.is_policy_deny());
        assert!(!ReasonCode::AdapterTimeout.is_policy_deny());
        assert!(!ReasonCode::Allow.is_policy_deny());
    }
}
