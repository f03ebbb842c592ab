//! Tool router: canonical tool name -> risk class + actuator binding.
//!
//! The tool set is closed. Global kill-switches are enforced here, before
//! any adapter runs: read-only tools survive `actuators_enabled=false`,
//! nothing survives for an unknown tool.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use watchkeeper_protocol::types::{utc_now_iso, SafetyClass};
use watchkeeper_protocol::ReasonCode;

use crate::actuators::jinx::JinxActuator;
use crate::actuators::keypress::KeypressActuator;
use crate::actuators::launcher::AppLauncher;
use crate::actuators::media::MediaKeyActuator;
use crate::actuators::parser::ParserSupervisor;
use crate::actuators::webhook::WebhookActuator;
use crate::actuators::{DispatchContext, Outcome};
use crate::sammi::SammiClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActuatorKind {
    Webhook,
    MediaKey,
    Keypress,
    ParserStart,
    ParserStop,
    ParserStatus,
    Jinx,
    Chat,
    AppOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct ToolBinding {
    pub safety_class: SafetyClass,
    pub kind: ActuatorKind,
}

pub struct ToolRouter {
    pub actuators_enabled: bool,
    pub keypress_enabled: bool,
    webhook: WebhookActuator,
    media: MediaKeyActuator,
    keypress: KeypressActuator,
    parser: Arc<ParserSupervisor>,
    jinx: JinxActuator,
    sammi: Arc<SammiClient>,
    launcher: AppLauncher,
}

impl ToolRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        actuators_enabled: bool,
        keypress_enabled: bool,
        webhook: WebhookActuator,
        media: MediaKeyActuator,
        keypress: KeypressActuator,
        parser: Arc<ParserSupervisor>,
        jinx: JinxActuator,
        sammi: Arc<SammiClient>,
        launcher: AppLauncher,
    ) -> Self {
        Self {
            actuators_enabled,
            keypress_enabled,
            webhook,
            media,
            keypress,
            parser,
            jinx,
            sammi,
            launcher,
        }
    }

    /// Resolve a canonical tool key to its binding.
    pub fn lookup(tool_key: &str) -> Option<ToolBinding> {
        let binding = match tool_key {
            "sammi.set_lights" => ToolBinding {
                safety_class: SafetyClass::LowRisk,
                kind: ActuatorKind::Webhook,
            },
            "sammi.music_next" | "sammi.music_pause" | "sammi.music_resume" => ToolBinding {
                safety_class: SafetyClass::LowRisk,
                kind: ActuatorKind::MediaKey,
            },
            "input.keypress" => ToolBinding {
                safety_class: SafetyClass::HighRisk,
                kind: ActuatorKind::Keypress,
            },
            "edparser.start" => ToolBinding {
                safety_class: SafetyClass::LowRisk,
                kind: ActuatorKind::ParserStart,
            },
            "edparser.stop" => ToolBinding {
                safety_class: SafetyClass::LowRisk,
                kind: ActuatorKind::ParserStop,
            },
            "edparser.status" => ToolBinding {
                safety_class: SafetyClass::ReadOnly,
                kind: ActuatorKind::ParserStatus,
            },
            "jinx.set_effect" | "jinx.set_scene" | "jinx.set_chase" => ToolBinding {
                safety_class: SafetyClass::LowRisk,
                kind: ActuatorKind::Jinx,
            },
            "twitch.send_chat" => ToolBinding {
                safety_class: SafetyClass::LowRisk,
                kind: ActuatorKind::Chat,
            },
            "app.open" => ToolBinding {
                safety_class: SafetyClass::LowRisk,
                kind: ActuatorKind::AppOpen,
            },
            _ => return None,
        };
        Some(binding)
    }

    /// Dispatch one tool call through its adapter, bounded by `timeout`.
    pub async fn dispatch(
        &self,
        tool_key: &str,
        parameters: &Value,
        ctx: &DispatchContext,
        timeout: Duration,
    ) -> Outcome {
        let started_at = utc_now_iso();
        let Some(binding) = Self::lookup(tool_key) else {
            return Outcome::error(
                started_at,
                ReasonCode::ToolNotImplemented,
                format!("unsupported tool: {tool_key}"),
            );
        };

        if !self.actuators_enabled && binding.safety_class != SafetyClass::ReadOnly {
            return Outcome::error(
                started_at,
                ReasonCode::ActuatorsDisabled,
                "actuators disabled by configuration",
            );
        }
        if binding.kind == ActuatorKind::Keypress && !self.keypress_enabled {
            return Outcome::error(
                started_at,
                ReasonCode::KeypressDisabled,
                "keypress actuator disabled by configuration",
            );
        }

        let call = self.invoke(binding.kind, tool_key, parameters, ctx);
        match tokio::time::timeout(timeout, call).await {
            Ok(outcome) => outcome,
            Err(_) => Outcome::timeout(
                started_at,
                format!("{tool_key} exceeded {}ms", timeout.as_millis()),
            ),
        }
    }

    async fn invoke(
        &self,
        kind: ActuatorKind,
        tool_key: &str,
        parameters: &Value,
        ctx: &DispatchContext,
    ) -> Outcome {
        match kind {
            ActuatorKind::Webhook => self.webhook.invoke(parameters, ctx).await,
            ActuatorKind::MediaKey => self.media.invoke(tool_key),
            ActuatorKind::Keypress => self.keypress.invoke(parameters, ctx),
            ActuatorKind::ParserStart => {
                let reason = param_reason(parameters);
                self.parser.start(&reason).await
            }
            ActuatorKind::ParserStop => {
                let reason = param_reason(parameters);
                self.parser.stop(&reason).await
            }
            ActuatorKind::ParserStatus => {
                let status = self.parser.status().await;
                Outcome::success(utc_now_iso(), status.to_json())
            }
            ActuatorKind::Jinx => self.jinx.invoke(tool_key, parameters).await,
            ActuatorKind::Chat => {
                let started_at = utc_now_iso();
                let message = parameters
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .unwrap_or("");
                if message.is_empty() {
                    return Outcome::error(
                        started_at,
                        ReasonCode::AdapterError,
                        "message is required",
                    );
                }
                match self.sammi.send_chat(message).await {
                    Ok(()) => Outcome::success(
                        started_at,
                        serde_json::json!({"sent": true, "chars": message.len()}),
                    ),
                    Err(err) => Outcome::error(
                        started_at,
                        ReasonCode::BridgeUnreachable,
                        err.to_string(),
                    ),
                }
            }
            ActuatorKind::AppOpen => {
                let app_id = parameters
                    .get("app_id")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .unwrap_or("");
                if app_id.is_empty() {
                    return Outcome::error(
                        utc_now_iso(),
                        ReasonCode::AdapterError,
                        "app_id is required",
                    );
                }
                self.launcher.open(app_id)
            }
        }
    }
}

fn param_reason(parameters: &Value) -> String {
    parameters
        .get("reason")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("execute_tool")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_tool_table() {
        assert!(ToolRouter::lookup("sammi.set_lights").is_some());
        assert!(ToolRouter::lookup("edparser.status").is_some());
        assert!(ToolRouter::lookup("twitch.send_chat").is_some());
        assert!(ToolRouter::lookup("app.open").is_some());
        assert!(ToolRouter::lookup("format.disk").is_none());
    }

    #[test]
    fn risk_classes() {
        assert_eq!(
            ToolRouter::lookup("input.keypress").unwrap().safety_class,
            SafetyClass::HighRisk
        );
        assert_eq!(
            ToolRouter::lookup("edparser.status").unwrap().safety_class,
            SafetyClass::ReadOnly
        );
    }
}
