//! Hardware probe: samples the probe snapshot file and raises edge-triggered
//! threshold alarms.
//!
//! Alarms fire once when a metric crosses its threshold and re-arm only
//! after the value drops below threshold minus hysteresis.

use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;
use watchkeeper_db::{EventContext, StateWrite};
use watchkeeper_protocol::types::{NewEvent, Severity};

use super::{read_json_file, tick, Shutdown};
use crate::runtime::Runtime;

pub const EVENT_HARDWARE_THRESHOLD: &str = "HARDWARE_THRESHOLD";

const SOURCE: &str = "hardware_probe";

#[derive(Default)]
struct AlarmState {
    memory_alarm_armed: bool,
}

pub async fn run(rt: Arc<Runtime>, mut shutdown: Shutdown) {
    let mut alarms = AlarmState {
        memory_alarm_armed: true,
    };
    loop {
        if let Err(err) = cycle(&rt, &mut alarms).await {
            warn!(error = %err, "hardware cycle failed");
        }
        if !tick(&mut shutdown, rt.config.hardware_interval).await {
            break;
        }
    }
}

async fn cycle(rt: &Arc<Runtime>, alarms: &mut AlarmState) -> anyhow::Result<()> {
    let Some(probe) = read_json_file(&rt.config.hardware_json) else {
        return Ok(());
    };

    let cpu_percent = probe_float(&probe, &["cpu_percent", "cpu.usagePercent", "cpu.usage"]);
    let cpu_temp = probe_float(&probe, &["cpu_temp_c", "cpu.temp_c", "cpu.tempC"]);
    let gpu_percent = probe_float(
        &probe,
        &["gpu_percent", "gpu_usage_percent", "gpu.usagePercent", "gpu.usage"],
    );
    let gpu_temp = probe_float(&probe, &["gpu_temp_c", "gpu.temp_c", "gpu.tempC"]);
    let memory_used = normalize_ratio(probe_float(
        &probe,
        &["memory_used_percent", "memory.used_percent", "memory.usedPct"],
    ));

    // High-frequency numeric deltas: quiet writes, no per-sample events.
    let writes = vec![
        StateWrite::quiet("hw.cpu_percent", to_value(cpu_percent), SOURCE),
        StateWrite::quiet("hw.cpu_temp_c", to_value(cpu_temp), SOURCE),
        StateWrite::quiet("hw.gpu_percent", to_value(gpu_percent), SOURCE),
        StateWrite::quiet("hw.gpu_temp_c", to_value(gpu_temp), SOURCE),
        StateWrite::quiet("hw.memory_used_percent", to_value(memory_used), SOURCE),
        StateWrite::quiet("hw.source", json!("hardware_probe_json"), SOURCE),
    ];
    rt.db.batch_set_state(writes, EventContext::default()).await?;

    if let Some(memory_used) = memory_used {
        let threshold = rt.config.memory_threshold;
        if alarms.memory_alarm_armed && memory_used >= threshold {
            alarms.memory_alarm_armed = false;
            rt.db
                .append_event(
                    NewEvent::new(
                        EVENT_HARDWARE_THRESHOLD,
                        SOURCE,
                        json!({
                            "metric": "hw.memory_used_percent",
                            "value": memory_used,
                            "threshold": threshold,
                        }),
                    )
                    .correlation(Uuid::new_v4().to_string())
                    .severity(Severity::Warn)
                    .tags(["threshold", "hardware"]),
                )
                .await?;
        } else if !alarms.memory_alarm_armed
            && memory_used < threshold - rt.config.threshold_hysteresis
        {
            alarms.memory_alarm_armed = true;
        }
    }

    Ok(())
}

fn to_value(value: Option<f64>) -> Value {
    value.map(|v| json!(v)).unwrap_or(Value::Null)
}

/// Probe snapshot layouts differ between collector versions; try each
/// dotted candidate path in order.
pub fn probe_float(payload: &Value, candidates: &[&str]) -> Option<f64> {
    for path in candidates {
        let mut cursor = payload;
        let mut found = true;
        for part in path.split('.') {
            match cursor.get(part) {
                Some(next) => cursor = next,
                None => {
                    found = false;
                    break;
                }
            }
        }
        if !found {
            continue;
        }
        match cursor {
            Value::Number(n) => return n.as_f64(),
            Value::String(s) => {
                if let Ok(parsed) = s.trim().parse::<f64>() {
                    return Some(parsed);
                }
            }
            _ => {}
        }
    }
    None
}

/// Some probes report 0..100, others 0..1.
pub fn normalize_ratio(value: Option<f64>) -> Option<f64> {
    value.map(|v| if v > 1.0 && v <= 100.0 { v / 100.0 } else { v })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_candidate_paths() {
        let payload = json!({"cpu": {"usagePercent": 42.5}, "memory_used_percent": "88"});
        assert_eq!(
            probe_float(&payload, &["cpu_percent", "cpu.usagePercent"]),
            Some(42.5)
        );
        assert_eq!(probe_float(&payload, &["memory_used_percent"]), Some(88.0));
        assert_eq!(probe_float(&payload, &["gpu.temp_c"]), None);
    }

    #[test]
    fn ratio_normalization() {
        assert_eq!(normalize_ratio(Some(88.0)), Some(0.88));
        assert_eq!(normalize_ratio(Some(0.88)), Some(0.88));
        assert_eq!(normalize_ratio(Some(1.0)), Some(1.0));
        assert_eq!(normalize_ratio(None), None);
    }
}
