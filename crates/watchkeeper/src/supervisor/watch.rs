//! Watch-condition derivation and handover notes.
//!
//! The condition is computed from store state alone; on a transition the
//! loop emits exactly one `WATCH_CONDITION_CHANGED` and one `HANDOVER_NOTE`,
//! sharing a correlation id.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;
use watchkeeper_db::{StateWrite, WatchkeeperDb};
use watchkeeper_protocol::defaults::WATCH_CONDITION_KEY;
use watchkeeper_protocol::types::NewEvent;
use watchkeeper_protocol::WatchCondition;

use super::{tick, Shutdown};
use crate::runtime::Runtime;

pub const EVENT_WATCH_CONDITION_CHANGED: &str = "WATCH_CONDITION_CHANGED";
pub const EVENT_HANDOVER_NOTE: &str = "HANDOVER_NOTE";

const SOURCE: &str = "watch_supervisor";
const CADENCE: Duration = Duration::from_secs(1);

pub async fn run(rt: Arc<Runtime>, mut shutdown: Shutdown) {
    let mut previous: Option<WatchCondition> = None;
    loop {
        if let Err(err) = observe(&rt, &mut previous).await {
            warn!(error = %err, "watch-condition cycle failed");
        }
        if !tick(&mut shutdown, CADENCE).await {
            break;
        }
    }
}

/// Derive the current condition from the store.
pub async fn derive_condition(
    db: &WatchkeeperDb,
    forced: Option<&str>,
) -> anyhow::Result<WatchCondition> {
    if let Some(forced) = forced {
        if let Ok(condition) = forced.parse() {
            return Ok(condition);
        }
    }
    if db.get_state_bool("system.degraded").await? {
        return Ok(WatchCondition::Degraded);
    }
    if db.get_state_bool("system.restricted_mode").await? {
        return Ok(WatchCondition::Restricted);
    }
    if db.get_state_bool("ed.running").await? {
        return Ok(WatchCondition::Game);
    }
    Ok(WatchCondition::Standby)
}

/// One observation: write the derived condition and emit the transition
/// pair when it changed.
pub async fn observe(rt: &Arc<Runtime>, previous: &mut Option<WatchCondition>) -> anyhow::Result<()> {
    let condition = derive_condition(&rt.db, rt.config.forced_watch_condition.as_deref()).await?;

    rt.db
        .set_state(
            StateWrite::new(WATCH_CONDITION_KEY, json!(condition.as_str()), SOURCE)
                .confidence(1.0),
        )
        .await?;

    if *previous == Some(condition) {
        return Ok(());
    }

    let from = previous.map(|c| c.as_str().to_string());
    let correlation = Uuid::new_v4().to_string();
    rt.db
        .append_event(
            NewEvent::new(
                EVENT_WATCH_CONDITION_CHANGED,
                SOURCE,
                json!({"from": from, "to": condition.as_str()}),
            )
            .correlation(correlation.clone())
            .condition(condition)
            .tags(["watch_condition", "handover"]),
        )
        .await?;
    rt.db
        .append_event(
            NewEvent::new(EVENT_HANDOVER_NOTE, SOURCE, handover_snapshot(rt).await)
                .correlation(correlation)
                .condition(condition)
                .tags(["handover"]),
        )
        .await?;

    *previous = Some(condition);
    Ok(())
}

/// Structured operational picture carried by a handover note.
pub async fn handover_snapshot(rt: &Arc<Runtime>) -> Value {
    let db = &rt.db;
    let read = |key: &'static str| async move {
        db.get_state(key)
            .await
            .ok()
            .flatten()
            .map(|e| e.state_value)
            .unwrap_or(Value::Null)
    };

    let memory = read("hw.memory_used_percent").await;
    let mut alarms: Vec<String> = Vec::new();
    if memory
        .as_f64()
        .map(|v| v >= rt.config.memory_threshold)
        .unwrap_or(false)
    {
        alarms.push("hw.memory_used_percent_high".to_string());
    }

    let ai_local = read("ai.local.available").await;
    let ai_cloud = read("ai.cloud.available").await;
    let ai_degraded = read("ai.degraded").await;
    let ai_status = if ai_degraded.as_bool().unwrap_or(false) {
        "degraded"
    } else {
        match (
            ai_local.as_bool().unwrap_or(false),
            ai_cloud.as_bool().unwrap_or(false),
        ) {
            (true, true) => "local+cloud",
            (true, false) => "local_only",
            (false, true) => "cloud_only",
            (false, false) => "unknown",
        }
    };

    json!({
        "current_alarms": alarms,
        "ed_status": {
            "running": read("ed.running").await,
            "system_name": read("ed.telemetry.system_name").await,
            "parser_running": read("ed.parser.running").await,
            "parser_error": read("ed.parser.last_error").await,
            "aux_apps": {
                "sammi_running": read("app.sammi.running").await,
                "jinx_running": read("app.jinx.running").await,
            },
        },
        "music_status": {
            "playing": read("music.playing").await,
            "title": read("music.track.title").await,
            "artist": read("music.track.artist").await,
        },
        "ai_status": ai_status,
    })
}
