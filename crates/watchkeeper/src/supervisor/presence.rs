//! Process presence, telemetry ingest, and parser lifecycle coupling.
//!
//! Detects the game and sidecar processes by executable name, publishes
//! presence state, ingests the parser-written telemetry file while the game
//! runs, and couples the parser lifecycle to game transitions (one start per
//! false->true edge, one stop per true->false edge, debounced by the active
//! cadence).

use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;
use watchkeeper_db::{EventContext, StateWrite};
use watchkeeper_protocol::types::NewEvent;

use super::{read_json_file, tick, Shutdown};
use crate::runtime::Runtime;

pub const EVENT_ED_STARTED: &str = "ED_STARTED";
pub const EVENT_ED_STOPPED: &str = "ED_STOPPED";
pub const EVENT_AUX_STARTED: &str = "AUX_APP_STARTED";
pub const EVENT_AUX_STOPPED: &str = "AUX_APP_STOPPED";
pub const EVENT_PARSER_STARTED: &str = "EDPARSER_STARTED";
pub const EVENT_PARSER_STOPPED: &str = "EDPARSER_STOPPED";
pub const EVENT_PARSER_ERROR: &str = "EDPARSER_ERROR";
pub const EVENT_PARSER_RECOVERED: &str = "EDPARSER_RECOVERED";

const SOURCE: &str = "presence_supervisor";

/// Telemetry keys forwarded from the parser snapshot file.
const TELEMETRY_KEYS: &[(&str, &str)] = &[
    ("system_name", "ed.telemetry.system_name"),
    ("hull_percent", "ed.telemetry.hull_percent"),
    ("landed", "ed.telemetry.landed"),
    ("shield_up", "ed.telemetry.shield_up"),
    ("lights_on", "ed.telemetry.lights_on"),
];

#[derive(Default)]
struct PresenceState {
    ed_running: Option<bool>,
    parser: ParserCoupling,
    sammi_running: Option<bool>,
    jinx_running: Option<bool>,
}

pub async fn run(rt: Arc<Runtime>, mut shutdown: Shutdown) {
    let mut state = PresenceState::default();
    loop {
        if let Err(err) = cycle(&rt, &mut state).await {
            warn!(error = %err, "presence cycle failed");
        }
        let cadence = if state.ed_running.unwrap_or(false) {
            rt.config.presence_active
        } else {
            rt.config.presence_idle
        };
        if !tick(&mut shutdown, cadence).await {
            break;
        }
    }
}

async fn cycle(rt: &Arc<Runtime>, state: &mut PresenceState) -> anyhow::Result<()> {
    let names = list_process_names();
    let correlation = Uuid::new_v4().to_string();
    let ctx = EventContext {
        correlation_id: Some(correlation.clone()),
        source: Some(SOURCE.to_string()),
        ..Default::default()
    };

    let ed_name = rt
        .config
        .game_process_names
        .iter()
        .find(|name| name_present(&names, name));
    let ed_running = ed_name.is_some();
    let sammi_running = rt
        .config
        .sammi_process_names
        .iter()
        .any(|name| name_present(&names, name));
    let jinx_running = rt
        .config
        .jinx_process_names
        .iter()
        .any(|name| name_present(&names, name));

    let mut writes = vec![
        StateWrite::new("ed.running", json!(ed_running), SOURCE).confidence(1.0),
        StateWrite::new(
            "ed.process_name",
            ed_name.map(|n| json!(n)).unwrap_or(Value::Null),
            SOURCE,
        ),
        StateWrite::new("app.sammi.running", json!(sammi_running), SOURCE).confidence(1.0),
        StateWrite::new("app.jinx.running", json!(jinx_running), SOURCE).confidence(1.0),
    ];

    if ed_running {
        if let Some(telemetry) = read_json_file(&rt.config.telemetry_json) {
            for (field, key) in TELEMETRY_KEYS {
                let value = telemetry.get(*field).cloned().unwrap_or(Value::Null);
                writes.push(StateWrite::new(*key, value, "ed_telemetry"));
            }
        }
    }

    rt.db.batch_set_state(writes, ctx).await?;

    if let Some(previous) = state.ed_running {
        if previous != ed_running {
            rt.db
                .append_event(
                    NewEvent::new(
                        if ed_running { EVENT_ED_STARTED } else { EVENT_ED_STOPPED },
                        SOURCE,
                        json!({"running": ed_running, "process_name": ed_name}),
                    )
                    .correlation(correlation.clone())
                    .tags(["ed"]),
                )
                .await?;
        }
    }
    state.ed_running = Some(ed_running);

    for (app, running, previous) in [
        ("sammi", sammi_running, &mut state.sammi_running),
        ("jinx", jinx_running, &mut state.jinx_running),
    ] {
        if let Some(prev) = *previous {
            if prev != running {
                rt.db
                    .append_event(
                        NewEvent::new(
                            if running { EVENT_AUX_STARTED } else { EVENT_AUX_STOPPED },
                            SOURCE,
                            json!({"app": app, "running": running, "ed_running": ed_running}),
                        )
                        .correlation(correlation.clone())
                        .tags(["aux_app"]),
                    )
                    .await?;
            }
        }
        *previous = Some(running);
    }

    state.parser.sync(rt, ed_running, &correlation).await?;
    Ok(())
}

/// Parser lifecycle coupling: start on game up, stop on game down. The edge
/// detection happens against the parser's own running state, so an already
/// running parser never gets a second start.
#[derive(Default)]
pub struct ParserCoupling {
    running: Option<bool>,
    error: Option<String>,
}

impl ParserCoupling {
    pub async fn sync(
        &mut self,
        rt: &Arc<Runtime>,
        ed_running: bool,
        correlation: &str,
    ) -> anyhow::Result<()> {
        let mut status = rt.parser.status().await;
        let mut action = "status";

        if rt.config.parser_autorun && status.enabled {
            if ed_running && !status.running {
                rt.parser.start("supervisor_ed_running").await;
                action = "start";
                status = rt.parser.status().await;
            } else if !ed_running && status.running {
                rt.parser.stop("supervisor_ed_stopped").await;
                action = "stop";
                status = rt.parser.status().await;
            }
        }

        let running = status.running;
        let current_error = status.last_error.clone();

        rt.db
            .batch_set_state(
                vec![
                    StateWrite::quiet("ed.parser.autorun", json!(rt.config.parser_autorun), SOURCE),
                    StateWrite::quiet("ed.parser.enabled", json!(status.enabled), SOURCE),
                    StateWrite::quiet("ed.parser.running", json!(running), SOURCE),
                    StateWrite::quiet(
                        "ed.parser.pid",
                        status.pid.map(|p| json!(p)).unwrap_or(Value::Null),
                        SOURCE,
                    ),
                    StateWrite::quiet(
                        "ed.parser.last_error",
                        current_error.as_ref().map(|e| json!(e)).unwrap_or(Value::Null),
                        SOURCE,
                    ),
                ],
                EventContext::default(),
            )
            .await?;

        let capability = if !status.enabled {
            "unavailable"
        } else if current_error.is_some() {
            "degraded"
        } else {
            "available"
        };
        rt.db
            .upsert_capability(
                "edparser",
                capability,
                &json!({"running": running, "pid": status.pid}),
            )
            .await?;

        if let Some(previous) = self.running {
            if previous != running {
                rt.db
                    .append_event(
                        NewEvent::new(
                            if running { EVENT_PARSER_STARTED } else { EVENT_PARSER_STOPPED },
                            SOURCE,
                            json!({
                                "running": running,
                                "pid": status.pid,
                                "autorun": rt.config.parser_autorun,
                                "action": action,
                            }),
                        )
                        .correlation(correlation.to_string())
                        .tags(["edparser", "tool"]),
                    )
                    .await?;
            }
        }
        self.running = Some(running);

        if let Some(error) = &current_error {
            if self.error.as_deref() != Some(error) {
                rt.db
                    .append_event(
                        NewEvent::new(
                            EVENT_PARSER_ERROR,
                            SOURCE,
                            json!({"error": error, "running": running, "action": action}),
                        )
                        .correlation(correlation.to_string())
                        .severity(watchkeeper_protocol::types::Severity::Warn)
                        .tags(["edparser", "tool", "error"]),
                    )
                    .await?;
            }
        } else if self.error.is_some() {
            rt.db
                .append_event(
                    NewEvent::new(
                        EVENT_PARSER_RECOVERED,
                        SOURCE,
                        json!({"running": running, "pid": status.pid, "action": action}),
                    )
                    .correlation(correlation.to_string())
                    .tags(["edparser", "tool"]),
                )
                .await?;
        }
        self.error = current_error;

        Ok(())
    }
}

/// Snapshot of running process names, lowercased.
pub fn list_process_names() -> HashSet<String> {
    collect_process_names().unwrap_or_default()
}

#[cfg(target_os = "linux")]
fn collect_process_names() -> Option<HashSet<String>> {
    let mut names = HashSet::new();
    for entry in std::fs::read_dir("/proc").ok()? {
        let Ok(entry) = entry else { continue };
        let file_name = entry.file_name();
        let pid = file_name.to_string_lossy();
        if !pid.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        if let Ok(comm) = std::fs::read_to_string(entry.path().join("comm")) {
            let name = comm.trim().to_ascii_lowercase();
            if !name.is_empty() {
                names.insert(name);
            }
        }
    }
    Some(names)
}

#[cfg(windows)]
fn collect_process_names() -> Option<HashSet<String>> {
    let output = std::process::Command::new("tasklist")
        .args(["/FO", "CSV", "/NH"])
        .output()
        .ok()?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut names = HashSet::new();
    for line in stdout.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix('"') {
            if let Some(name) = rest.split("\",\"").next() {
                names.insert(name.to_ascii_lowercase());
            }
        }
    }
    Some(names)
}

#[cfg(all(unix, not(target_os = "linux")))]
fn collect_process_names() -> Option<HashSet<String>> {
    let output = std::process::Command::new("ps")
        .args(["-eo", "comm="])
        .output()
        .ok()?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    Some(
        stdout
            .lines()
            .map(|line| line.trim().to_ascii_lowercase())
            .filter(|line| !line.is_empty())
            .collect(),
    )
}

/// Match a configured executable name against the snapshot, tolerating
/// `.exe` suffix and punctuation differences.
pub fn name_present(names: &HashSet<String>, configured: &str) -> bool {
    let lowered = configured.trim().to_ascii_lowercase();
    if names.contains(&lowered) {
        return true;
    }
    let canon = canon_name(&lowered);
    names.iter().any(|name| canon_name(name) == canon)
}

fn canon_name(name: &str) -> String {
    let stem = name.strip_suffix(".exe").unwrap_or(name);
    stem.chars().filter(|c| c.is_ascii_alphanumeric()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_name_matching() {
        let mut names = HashSet::new();
        names.insert("elitedangerous64".to_string());
        names.insert("sammi core".to_string());

        assert!(name_present(&names, "EliteDangerous64.exe"));
        assert!(name_present(&names, "SAMMI Core.exe"));
        assert!(!name_present(&names, "notepad.exe"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn snapshot_includes_this_process() {
        let names = list_process_names();
        assert!(!names.is_empty());
    }
}
