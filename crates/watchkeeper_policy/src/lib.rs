//! Standing Orders policy engine.
//!
//! The engine is a decision function over a declarative document: given the
//! current watch condition, a tool name, and the execution context, it
//! answers allow/deny with a reason code from the closed taxonomy. It
//! performs no I/O during evaluation; the only mutable state is the rolling
//! rate windows and the confirmation ledger, both driven by caller-supplied
//! timestamps so decisions stay reproducible under test.

mod document;
mod engine;

pub use document::{
    ConditionPolicy, Defaults, RateLimit, ResolvedCondition, StandingOrders, ToolGuard,
};
pub use engine::{ActionRequest, PolicyEngine};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("standing orders invalid: {0}")]
    Invalid(String),

    #[error("standing orders unreadable: {0}")]
    Io(#[from] std::io::Error),

    #[error("standing orders parse error: {0}")]
    Parse(#[from] serde_json::Error),
}
