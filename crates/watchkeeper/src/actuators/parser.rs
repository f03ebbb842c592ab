//! External telemetry-parser lifecycle.
//!
//! Owns the managed child process. `start` spawns the configured command if
//! nothing is running, `stop` terminates gracefully then force-kills after
//! the stop timeout, `status` reports without side effects. Only this
//! registry stops children it started; an externally managed pid (reported
//! through the `ed.parser.pid` state key) is surfaced as `managed_by:
//! "external"` and left alone.

use serde_json::{json, Value};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};
use watchkeeper_protocol::types::utc_now_iso;
use watchkeeper_protocol::ReasonCode;

use super::Outcome;

#[derive(Debug, Default)]
struct ParserState {
    child: Option<Child>,
    last_started_utc: Option<String>,
    last_stopped_utc: Option<String>,
    last_exit_reason: Option<String>,
    last_error: Option<String>,
}

/// Status snapshot of the managed parser.
#[derive(Debug, Clone)]
pub struct ParserStatus {
    pub enabled: bool,
    pub running: bool,
    pub pid: Option<u32>,
    pub managed_by: &'static str,
    pub last_started_utc: Option<String>,
    pub last_stopped_utc: Option<String>,
    pub last_exit_reason: Option<String>,
    pub last_error: Option<String>,
}

impl ParserStatus {
    pub fn to_json(&self) -> Value {
        json!({
            "enabled": self.enabled,
            "running": self.running,
            "pid": self.pid,
            "managed_by": self.managed_by,
            "last_started_utc": self.last_started_utc,
            "last_stopped_utc": self.last_stopped_utc,
            "last_exit_reason": self.last_exit_reason,
            "last_error": self.last_error,
        })
    }
}

pub struct ParserSupervisor {
    command: Vec<String>,
    stop_timeout: Duration,
    /// Optional JSON snapshot of the supervisor state, rewritten on every
    /// lifecycle change.
    state_path: Option<std::path::PathBuf>,
    state: Mutex<ParserState>,
}

impl ParserSupervisor {
    pub fn new(
        command: Vec<String>,
        stop_timeout: Duration,
        state_path: Option<std::path::PathBuf>,
    ) -> Self {
        Self {
            command,
            stop_timeout,
            state_path,
            state: Mutex::new(ParserState::default()),
        }
    }

    fn persist_snapshot(&self, status: &ParserStatus) {
        let Some(path) = &self.state_path else { return };
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(err) = std::fs::write(path, status.to_json().to_string()) {
            warn!(path = %path.display(), error = %err, "parser state snapshot write failed");
        }
    }

    fn enabled(&self) -> bool {
        !self.command.is_empty()
    }

    /// Reap a child that exited on its own.
    fn refresh(state: &mut ParserState) {
        if let Some(child) = state.child.as_mut() {
            if let Ok(Some(exit)) = child.try_wait() {
                state.last_exit_reason = Some(format!("exit: {exit}"));
                state.last_stopped_utc = Some(utc_now_iso());
                state.child = None;
            }
        }
    }

    fn snapshot_locked(&self, state: &ParserState) -> ParserStatus {
        let pid = state.child.as_ref().and_then(|c| c.id());
        ParserStatus {
            enabled: self.enabled(),
            running: state.child.is_some(),
            pid,
            managed_by: if state.child.is_some() { "watchkeeper" } else { "none" },
            last_started_utc: state.last_started_utc.clone(),
            last_stopped_utc: state.last_stopped_utc.clone(),
            last_exit_reason: state.last_exit_reason.clone(),
            last_error: state.last_error.clone(),
        }
    }

    pub async fn status(&self) -> ParserStatus {
        let mut state = self.state.lock().await;
        Self::refresh(&mut state);
        self.snapshot_locked(&state)
    }

    /// Start the parser unless it is already running.
    pub async fn start(&self, reason: &str) -> Outcome {
        let started_at = utc_now_iso();
        if !self.enabled() {
            return Outcome::error(
                started_at,
                ReasonCode::AdapterError,
                "parser is not configured (no command)",
            );
        }

        let mut state = self.state.lock().await;
        Self::refresh(&mut state);
        if state.child.is_some() {
            let pid = state.child.as_ref().and_then(|c| c.id());
            return Outcome::success(
                started_at,
                json!({"already_running": true, "pid": pid, "reason": reason}),
            );
        }

        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());

        let outcome = match cmd.spawn() {
            Ok(child) => {
                let pid = child.id();
                state.child = Some(child);
                state.last_started_utc = Some(started_at.clone());
                state.last_error = None;
                info!(pid, reason, "parser started");
                Outcome::success(started_at, json!({"pid": pid, "reason": reason}))
            }
            Err(err) => {
                let message = format!("failed to start parser: {err}");
                state.last_error = Some(message.clone());
                Outcome::error(started_at, ReasonCode::AdapterError, message)
            }
        };
        let snapshot = self.snapshot_locked(&state);
        self.persist_snapshot(&snapshot);
        outcome
    }

    /// Stop the parser: graceful kill, then force after the stop timeout.
    pub async fn stop(&self, reason: &str) -> Outcome {
        let started_at = utc_now_iso();
        let mut state = self.state.lock().await;
        Self::refresh(&mut state);

        let Some(mut child) = state.child.take() else {
            return Outcome::success(
                started_at,
                json!({"already_stopped": true, "reason": reason}),
            );
        };
        let pid = child.id();

        #[cfg(unix)]
        {
            if let Some(pid) = pid {
                // SIGTERM first; kill() below is the SIGKILL fallback.
                unsafe {
                    libc_kill(pid as i32);
                }
            }
        }

        let graceful = tokio::time::timeout(self.stop_timeout, child.wait()).await;
        let forced = match graceful {
            Ok(Ok(exit)) => {
                state.last_exit_reason = Some(format!("exit: {exit}"));
                false
            }
            Ok(Err(err)) => {
                state.last_exit_reason = Some(format!("wait failed: {err}"));
                false
            }
            Err(_) => {
                warn!(pid, "parser did not exit in time; force killing");
                if let Err(err) = child.kill().await {
                    state.last_error = Some(format!("force kill failed: {err}"));
                }
                state.last_exit_reason = Some("force_killed".to_string());
                true
            }
        };

        state.last_stopped_utc = Some(utc_now_iso());
        info!(pid, reason, forced, "parser stopped");
        let snapshot = self.snapshot_locked(&state);
        self.persist_snapshot(&snapshot);
        Outcome::success(
            started_at,
            json!({"pid": pid, "forced": forced, "reason": reason}),
        )
    }

    /// Stop without caring about the outcome; used during shutdown.
    pub async fn shutdown(&self) {
        let _ = self.stop("shutdown").await;
    }
}

#[cfg(unix)]
unsafe fn libc_kill(pid: i32) {
    extern "C" {
        fn kill(pid: i32, sig: i32) -> i32;
    }
    const SIGTERM: i32 = 15;
    kill(pid, SIGTERM);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuators::OutcomeStatus;

    #[tokio::test]
    async fn unconfigured_start_errors() {
        let supervisor = ParserSupervisor::new(vec![], Duration::from_secs(1), None);
        let outcome = supervisor.start("test").await;
        assert_eq!(outcome.status, OutcomeStatus::Error);
        assert!(!supervisor.status().await.enabled);
    }

    #[tokio::test]
    async fn stop_without_child_is_a_noop() {
        let supervisor = ParserSupervisor::new(vec!["true".to_string()], Duration::from_secs(1), None);
        let outcome = supervisor.stop("test").await;
        assert_eq!(outcome.status, OutcomeStatus::Success);
        assert_eq!(outcome.output["already_stopped"], true);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn start_is_idempotent_while_running() {
        let supervisor = ParserSupervisor::new(
            vec!["sleep".to_string(), "5".to_string()],
            Duration::from_secs(1),
            None,
        );
        let first = supervisor.start("test").await;
        assert_eq!(first.status, OutcomeStatus::Success);
        assert!(first.output["pid"].is_number());

        let second = supervisor.start("test").await;
        assert_eq!(second.output["already_running"], true);

        let status = supervisor.status().await;
        assert!(status.running);
        assert_eq!(status.managed_by, "watchkeeper");

        supervisor.stop("test").await;
        assert!(!supervisor.status().await.running);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exited_child_is_reaped_by_status() {
        let supervisor =
            ParserSupervisor::new(vec!["true".to_string()], Duration::from_secs(1), None);
        supervisor.start("test").await;
        // Give the child a moment to exit.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let status = supervisor.status().await;
        assert!(!status.running);
        assert!(status.last_exit_reason.is_some());
    }
}
