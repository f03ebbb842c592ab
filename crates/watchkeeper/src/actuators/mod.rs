//! Side-effect adapters.
//!
//! Every adapter exposes an `invoke`-shaped call returning an [`Outcome`].
//! Adapters are idempotent for caller-driven retries, never retry
//! internally, and never touch the store; the pipeline journals results.

pub mod jinx;
pub mod keypress;
pub mod launcher;
pub mod media;
pub mod parser;
pub mod webhook;

use serde_json::Value;
use watchkeeper_protocol::types::utc_now_iso;
use watchkeeper_protocol::ReasonCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    Success,
    Error,
    Timeout,
}

impl OutcomeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OutcomeStatus::Success => "success",
            OutcomeStatus::Error => "error",
            OutcomeStatus::Timeout => "timeout",
        }
    }
}

/// Result of one actuator call.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub status: OutcomeStatus,
    pub output: Value,
    pub error_code: Option<ReasonCode>,
    pub error_message: Option<String>,
    pub started_at_utc: String,
    pub ended_at_utc: String,
}

impl Outcome {
    pub fn success(started_at_utc: String, output: Value) -> Self {
        Self {
            status: OutcomeStatus::Success,
            output,
            error_code: None,
            error_message: None,
            started_at_utc,
            ended_at_utc: utc_now_iso(),
        }
    }

    pub fn error(started_at_utc: String, code: ReasonCode, message: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Error,
            output: Value::Null,
            error_code: Some(code),
            error_message: Some(message.into()),
            started_at_utc,
            ended_at_utc: utc_now_iso(),
        }
    }

    pub fn timeout(started_at_utc: String, message: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Timeout,
            output: Value::Null,
            error_code: Some(ReasonCode::AdapterTimeout),
            error_message: Some(message.into()),
            started_at_utc,
            ended_at_utc: utc_now_iso(),
        }
    }
}

/// Caller-supplied context for one dispatch.
#[derive(Debug, Clone, Default)]
pub struct DispatchContext {
    pub request_id: String,
    pub action_id: String,
    /// Current `app.foreground` state value, read by the pipeline.
    pub foreground_process: Option<String>,
}
