//! Guarded virtual keypress.
//!
//! Dispatches only while the foreground process is in the configured
//! allow-list; anything else is refused with a foreground-mismatch error.
//! Key names cover letters, digits, F-keys, and a small special set.

use serde_json::{json, Value};
use watchkeeper_protocol::types::utc_now_iso;
use watchkeeper_protocol::ReasonCode;

use super::{media::send_virtual_key, DispatchContext, Outcome};

pub struct KeypressActuator {
    allowed_processes: Vec<String>,
}

impl KeypressActuator {
    pub fn new(allowed_processes: Vec<String>) -> Self {
        Self {
            allowed_processes: allowed_processes
                .into_iter()
                .map(|p| p.to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn invoke(&self, parameters: &Value, ctx: &DispatchContext) -> Outcome {
        let started_at = utc_now_iso();

        let foreground = ctx
            .foreground_process
            .as_deref()
            .map(|p| p.to_ascii_lowercase());
        let allowed = foreground
            .as_deref()
            .map(|fg| self.allowed_processes.iter().any(|p| p == fg))
            .unwrap_or(false);
        if !allowed {
            return Outcome::error(
                started_at,
                ReasonCode::DenyForegroundMismatch,
                format!(
                    "keypress refused: foreground {:?} not in allow-list",
                    ctx.foreground_process.as_deref().unwrap_or("")
                ),
            );
        }

        let key_name = parameters
            .get("key")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or("");
        let vk_code = match key_to_vk(key_name) {
            Some(code) => code,
            None => {
                return Outcome::error(
                    started_at,
                    ReasonCode::AdapterError,
                    format!("unsupported keypress key: {key_name:?}"),
                )
            }
        };

        send_virtual_key(vk_code);
        Outcome::success(started_at, json!({"key": key_name, "vk_code": vk_code}))
    }
}

/// Map a key name to its virtual-key code.
pub fn key_to_vk(key_name: &str) -> Option<u32> {
    let key = key_name.trim().to_ascii_lowercase();
    if key.is_empty() {
        return None;
    }
    match key.as_str() {
        "space" => return Some(0x20),
        "enter" => return Some(0x0D),
        "tab" => return Some(0x09),
        "esc" | "escape" => return Some(0x1B),
        "up" => return Some(0x26),
        "down" => return Some(0x28),
        "left" => return Some(0x25),
        "right" => return Some(0x27),
        _ => {}
    }
    if let Some(number) = key.strip_prefix('f') {
        if let Ok(n) = number.parse::<u32>() {
            if (1..=12).contains(&n) {
                return Some(0x6F + n);
            }
        }
    }
    if key.len() == 1 {
        let ch = key.bytes().next().unwrap_or(0);
        if ch.is_ascii_lowercase() {
            return Some(ch.to_ascii_uppercase() as u32);
        }
        if ch.is_ascii_digit() {
            return Some(ch as u32);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuators::OutcomeStatus;

    fn ctx(foreground: Option<&str>) -> DispatchContext {
        DispatchContext {
            request_id: "req".to_string(),
            action_id: "a1".to_string(),
            foreground_process: foreground.map(String::from),
        }
    }

    #[test]
    fn refuses_when_foreground_not_allowed() {
        let actuator = KeypressActuator::new(vec!["EliteDangerous64.exe".to_string()]);
        let outcome = actuator.invoke(&json!({"key": "l"}), &ctx(Some("notepad.exe")));
        assert_eq!(outcome.status, OutcomeStatus::Error);
        assert_eq!(outcome.error_code, Some(ReasonCode::DenyForegroundMismatch));

        let no_fg = actuator.invoke(&json!({"key": "l"}), &ctx(None));
        assert_eq!(no_fg.error_code, Some(ReasonCode::DenyForegroundMismatch));
    }

    #[test]
    fn dispatches_when_foreground_matches() {
        let actuator = KeypressActuator::new(vec!["elitedangerous64.exe".to_string()]);
        let outcome = actuator.invoke(&json!({"key": "l"}), &ctx(Some("EliteDangerous64.exe")));
        assert_eq!(outcome.status, OutcomeStatus::Success);
        assert_eq!(outcome.output["vk_code"], 'L' as u32);
    }

    #[test]
    fn key_mapping_table() {
        assert_eq!(key_to_vk("space"), Some(0x20));
        assert_eq!(key_to_vk("F5"), Some(0x74));
        assert_eq!(key_to_vk("a"), Some(0x41));
        assert_eq!(key_to_vk("7"), Some('7' as u32));
        assert_eq!(key_to_vk("f13"), None);
        assert_eq!(key_to_vk("ctrl"), None);
        assert_eq!(key_to_vk(""), None);
    }
}
