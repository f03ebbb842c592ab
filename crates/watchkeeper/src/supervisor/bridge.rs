//! Overlay variable bridge.
//!
//! Diffs a curated variable map (built from store state) against the last
//! snapshot pushed to the SAMMI variable API, pushes changes priority-first
//! under a per-cycle cap, and pulses a new-write marker when any meaningful
//! variable changed. Runs only while the bridge is enabled and the game is
//! up; failures back off inside the client.

use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};
use watchkeeper_db::{EventContext, StateWrite, WatchkeeperDb};

use super::{tick, Shutdown};
use crate::runtime::Runtime;

const SOURCE: &str = "sammi_bridge";

/// Push order: flight-critical variables first when the cycle cap bites.
const PRIORITY_VARS: &[&str] = &[
    "lights",
    "shields_up",
    "landed",
    "current_system",
    "hull_percent",
    "YTM_NowPlaying",
];

#[derive(Default)]
struct BridgeState {
    last_sent: BTreeMap<String, Value>,
    heartbeat: u64,
}

pub async fn run(rt: Arc<Runtime>, mut shutdown: Shutdown) {
    let mut state = BridgeState::default();
    let cadence = rt
        .config
        .presence_active
        .max(std::time::Duration::from_millis(500));
    loop {
        if rt.config.bridge_enabled
            && rt.db.get_state_bool("ed.running").await.unwrap_or(false)
        {
            if let Err(err) = cycle(&rt, &mut state).await {
                warn!(error = %err, "bridge cycle failed");
            }
        }
        if !tick(&mut shutdown, cadence).await {
            break;
        }
    }
}

/// Build the curated variable map from store state.
pub async fn variable_map(db: &WatchkeeperDb, heartbeat: u64) -> BTreeMap<String, Value> {
    let mut map = BTreeMap::new();
    let read = |key: &'static str| async move {
        db.get_state(key)
            .await
            .ok()
            .flatten()
            .map(|e| e.state_value)
            .unwrap_or(Value::Null)
    };

    let system = read("ed.telemetry.system_name").await;
    if !system.is_null() {
        map.insert("current_system".to_string(), system);
    }
    if let Some(hull) = read("ed.telemetry.hull_percent").await.as_f64() {
        map.insert(
            "hull_percent".to_string(),
            json!((hull * 10_000.0).round() / 100.0),
        );
    }
    for (key, var, on, off) in [
        ("ed.telemetry.landed", "landed", "Landed", "Not Landed"),
        ("ed.telemetry.shield_up", "shields_up", "Up", "Down"),
        ("ed.telemetry.lights_on", "lights", "On", "Off"),
    ] {
        if let Some(flag) = read(key).await.as_bool() {
            map.insert(var.to_string(), json!(if flag { on } else { off }));
        }
    }

    let title = read("music.track.title").await;
    let artist = read("music.track.artist").await;
    let now_playing = read("music.now_playing").await;
    map.insert("YTM_Title".to_string(), null_to_empty(title));
    map.insert("YTM_Artist".to_string(), null_to_empty(artist));
    map.insert("YTM_NowPlaying".to_string(), null_to_empty(now_playing));
    map.insert("Heartbeat".to_string(), json!(heartbeat));

    map
}

fn null_to_empty(value: Value) -> Value {
    if value.is_null() {
        json!("")
    } else {
        value
    }
}

/// One push cycle: diff, pulse, push under the cap, record diagnostics.
async fn cycle(rt: &Arc<Runtime>, state: &mut BridgeState) -> anyhow::Result<()> {
    state.heartbeat += 1;
    let map = variable_map(&rt.db, state.heartbeat).await;

    let mut changed: Vec<(String, Value)> = map
        .iter()
        .filter(|(name, value)| state.last_sent.get(*name) != Some(value))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();

    let priority_rank = |name: &str| {
        PRIORITY_VARS
            .iter()
            .position(|p| *p == name)
            .unwrap_or(usize::MAX)
    };
    changed.sort_by_key(|(name, _)| priority_rank(name));

    // Pulse once per cycle when anything meaningful changed; the ignore set
    // keeps churn vars (heartbeat, timestamps) from spamming the overlay.
    let pulse = changed
        .iter()
        .any(|(name, _)| !rt.config.sammi_new_write_ignore.iter().any(|i| i == name));

    let cap = rt.config.sammi_max_updates_per_cycle.max(1);
    let mut sent = 0usize;
    let mut deferred = 0usize;
    let mut error_text: Option<String> = None;

    if pulse {
        if let Err(err) = rt
            .sammi
            .set_variable(&rt.config.sammi_new_write_var, &json!("yes"))
            .await
        {
            error_text = Some(err.to_string());
        } else {
            sent += 1;
        }
    }

    if error_text.is_none() {
        for (idx, (name, value)) in changed.iter().enumerate() {
            if sent >= cap {
                deferred = changed.len() - idx;
                break;
            }
            match rt.sammi.set_variable(name, value).await {
                Ok(()) => {
                    state.last_sent.insert(name.clone(), value.clone());
                    sent += 1;
                }
                Err(err) => {
                    error_text = Some(err.to_string());
                    deferred = changed.len() - idx;
                    break;
                }
            }
        }
    } else {
        deferred = changed.len();
    }

    debug!(sent, deferred, "bridge cycle");
    rt.db
        .batch_set_state(
            vec![
                StateWrite::quiet("app.sammi.api.last_push_count", json!(sent), SOURCE),
                StateWrite::quiet("app.sammi.api.deferred_count", json!(deferred), SOURCE),
                StateWrite::quiet(
                    "app.sammi.api.last_error",
                    error_text.map(|e| json!(e)).unwrap_or(Value::Null),
                    SOURCE,
                ),
            ],
            EventContext::default(),
        )
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn variable_map_curates_state() {
        let db = WatchkeeperDb::open_in_memory().await.unwrap();
        for (key, value) in [
            ("ed.telemetry.system_name", json!("Shinrarta Dezhra")),
            ("ed.telemetry.hull_percent", json!(0.875)),
            ("ed.telemetry.lights_on", json!(true)),
            ("music.track.title", json!("Cornfield Chase")),
        ] {
            db.set_state(StateWrite::quiet(key, value, "test")).await.unwrap();
        }

        let map = variable_map(&db, 3).await;
        assert_eq!(map["current_system"], json!("Shinrarta Dezhra"));
        assert_eq!(map["hull_percent"], json!(87.5));
        assert_eq!(map["lights"], json!("On"));
        assert_eq!(map["YTM_Title"], json!("Cornfield Chase"));
        assert_eq!(map["YTM_Artist"], json!(""));
        assert_eq!(map["Heartbeat"], json!(3));
        // Absent boolean telemetry stays out of the map entirely.
        assert!(!map.contains_key("landed"));
    }
}
