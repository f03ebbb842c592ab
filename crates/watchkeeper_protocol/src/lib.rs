//! Shared types for the Watchkeeper control plane.
//!
//! Everything that crosses a component boundary lives here: watch conditions,
//! reason codes, event/intent/action envelopes, state-key validation, doorbell
//! token parsing, and the HTTP request/response bodies. The daemon, store, and
//! policy crates all speak these types so no component depends on another's
//! internals.

pub mod defaults;
pub mod doorbell;
pub mod http_types;
pub mod naming;
pub mod reason;
pub mod types;

pub use doorbell::{DoorbellToken, TwitchCategory};
pub use naming::{validate_state_key, StateKeyError};
pub use reason::ReasonCode;
pub use types::{
    ActionStatus, Decision, EventRecord, Mode, NewEvent, SafetyClass, Severity, StateEntry,
    WatchCondition,
};
