//! Watchkeeper: a local-first deterministic control plane.
//!
//! The AI proposes, the core decides. All actuation passes through the
//! policy gate before any side effect happens; supervisor loops translate
//! external process and telemetry state into store updates; the doorbell
//! gate ingests stream events only while the bridge runs.

pub mod actuators;
pub mod config;
pub mod http;
pub mod ingest;
pub mod pipeline;
pub mod router;
pub mod runtime;
pub mod sammi;
pub mod supervisor;

pub use config::RuntimeConfig;
pub use runtime::Runtime;
