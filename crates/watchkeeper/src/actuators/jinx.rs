//! Jinx lighting control.
//!
//! These tools steer the lighting sync loop through state keys rather than
//! talking to hardware: effect, scene, and chase are mutually exclusive, so
//! setting one clears the other two. The supervisor's sync loop picks the
//! change up on its next cycle.

use serde_json::{json, Value};
use watchkeeper_db::{StateWrite, WatchkeeperDb};
use watchkeeper_protocol::types::utc_now_iso;
use watchkeeper_protocol::ReasonCode;

use super::Outcome;

const SOURCE: &str = "jinx_tool";

/// Normalize an effect spec: `S<code>` / `C<code>` with canonical digits,
/// bare digits become a static effect.
pub fn normalize_effect(raw: &str) -> Option<String> {
    let text = raw.trim().to_ascii_uppercase();
    if text.is_empty() {
        return None;
    }
    if let Some(rest) = text.strip_prefix('S').or_else(|| text.strip_prefix('C')) {
        let code: u32 = rest.parse().ok()?;
        let kind = text.as_bytes()[0] as char;
        return Some(format!("{kind}{code}"));
    }
    if text.bytes().all(|b| b.is_ascii_digit()) {
        let code: u32 = text.parse().ok()?;
        return Some(format!("S{code}"));
    }
    None
}

pub struct JinxActuator {
    db: WatchkeeperDb,
    env_map: std::collections::BTreeMap<String, String>,
}

impl JinxActuator {
    pub fn new(db: WatchkeeperDb, env_map: std::collections::BTreeMap<String, String>) -> Self {
        Self { db, env_map }
    }

    async fn write(&self, effect: &str, scene: &str, chase: &str) -> Result<(), String> {
        for (key, value) in [
            ("jinx.effect", effect),
            ("jinx.scene", scene),
            ("jinx.chase", chase),
        ] {
            self.db
                .set_state(StateWrite::quiet(key, json!(value), SOURCE).confidence(1.0))
                .await
                .map_err(|e| e.to_string())?;
        }
        Ok(())
    }

    pub async fn invoke(&self, tool_key: &str, parameters: &Value) -> Outcome {
        let started_at = utc_now_iso();
        let result = match tool_key {
            "jinx.set_effect" => {
                // Either a literal effect code or a named environment
                // resolved through the configured environment map.
                let raw = match parameters.get("environment").and_then(Value::as_str) {
                    Some(environment) => match self.env_map.get(environment.trim()) {
                        Some(effect) => effect.as_str(),
                        None => {
                            return Outcome::error(
                                started_at,
                                ReasonCode::AdapterError,
                                format!("unmapped lighting environment: {environment:?}"),
                            )
                        }
                    },
                    None => parameters
                        .get("effect")
                        .or_else(|| parameters.get("mode"))
                        .and_then(Value::as_str)
                        .unwrap_or(""),
                };
                match normalize_effect(raw) {
                    Some(effect) => self
                        .write(&effect, "", "")
                        .await
                        .map(|_| json!({"jinx.effect": effect})),
                    None => Err(format!("invalid jinx effect: {raw:?}")),
                }
            }
            "jinx.set_scene" => {
                let scene = parameters
                    .get("scene")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .unwrap_or("");
                if scene.bytes().all(|b| b.is_ascii_digit()) && !scene.is_empty() {
                    self.write("", scene, "")
                        .await
                        .map(|_| json!({"jinx.scene": scene}))
                } else {
                    Err("jinx scene must be numeric".to_string())
                }
            }
            "jinx.set_chase" => {
                let chase = parameters
                    .get("chase")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .unwrap_or("");
                if chase.bytes().all(|b| b.is_ascii_digit()) && !chase.is_empty() {
                    self.write("", "", chase)
                        .await
                        .map(|_| json!({"jinx.chase": chase}))
                } else {
                    Err("jinx chase must be numeric".to_string())
                }
            }
            other => Err(format!("unsupported jinx tool: {other}")),
        };

        match result {
            Ok(output) => Outcome::success(started_at, output),
            Err(message) => Outcome::error(started_at, ReasonCode::AdapterError, message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuators::OutcomeStatus;

    #[test]
    fn effect_normalization() {
        assert_eq!(normalize_effect("s07"), Some("S7".to_string()));
        assert_eq!(normalize_effect("C14"), Some("C14".to_string()));
        assert_eq!(normalize_effect("12"), Some("S12".to_string()));
        assert_eq!(normalize_effect("X9"), None);
        assert_eq!(normalize_effect(""), None);
    }

    fn test_actuator(db: WatchkeeperDb) -> JinxActuator {
        let mut env_map = std::collections::BTreeMap::new();
        env_map.insert("Docked".to_string(), "C14".to_string());
        JinxActuator::new(db, env_map)
    }

    #[tokio::test]
    async fn environment_resolves_through_map() {
        let db = WatchkeeperDb::open_in_memory().await.unwrap();
        let actuator = test_actuator(db.clone());

        let outcome = actuator
            .invoke("jinx.set_effect", &json!({"environment": "Docked"}))
            .await;
        assert_eq!(outcome.status, OutcomeStatus::Success);
        assert_eq!(
            db.get_state("jinx.effect").await.unwrap().unwrap().state_value,
            json!("C14")
        );

        let unmapped = actuator
            .invoke("jinx.set_effect", &json!({"environment": "Witch Space"}))
            .await;
        assert_eq!(unmapped.status, OutcomeStatus::Error);
    }

    #[tokio::test]
    async fn setting_scene_clears_effect_and_chase() {
        let db = WatchkeeperDb::open_in_memory().await.unwrap();
        let actuator = test_actuator(db.clone());

        actuator
            .invoke("jinx.set_effect", &json!({"effect": "S3"}))
            .await;
        let outcome = actuator.invoke("jinx.set_scene", &json!({"scene": "5"})).await;
        assert_eq!(outcome.status, OutcomeStatus::Success);

        let effect = db.get_state("jinx.effect").await.unwrap().unwrap();
        let scene = db.get_state("jinx.scene").await.unwrap().unwrap();
        assert_eq!(effect.state_value, json!(""));
        assert_eq!(scene.state_value, json!("5"));
    }

    #[tokio::test]
    async fn non_numeric_scene_is_rejected() {
        let db = WatchkeeperDb::open_in_memory().await.unwrap();
        let actuator = test_actuator(db);
        let outcome = actuator
            .invoke("jinx.set_scene", &json!({"scene": "bright"}))
            .await;
        assert_eq!(outcome.status, OutcomeStatus::Error);
    }
}
