//! Lighting webhook emitter.
//!
//! POSTs a small JSON body to a configured URL. A URL template with a
//! `{scene}` placeholder takes precedence over the fixed URL.

use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde_json::{json, Value};
use std::time::Duration;
use watchkeeper_protocol::types::utc_now_iso;
use watchkeeper_protocol::ReasonCode;

use super::{DispatchContext, Outcome};

pub struct WebhookActuator {
    http: reqwest::Client,
    url: Option<String>,
    url_template: Option<String>,
}

impl WebhookActuator {
    pub fn new(url: Option<String>, url_template: Option<String>, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            url,
            url_template,
        }
    }

    fn build_url(&self, scene: &str) -> Option<String> {
        if let Some(template) = &self.url_template {
            let encoded = utf8_percent_encode(scene, NON_ALPHANUMERIC).to_string();
            return Some(template.replace("{scene}", &encoded));
        }
        self.url.clone()
    }

    pub async fn invoke(&self, parameters: &Value, ctx: &DispatchContext) -> Outcome {
        let started_at = utc_now_iso();
        let scene = parameters
            .get("scene")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or("default");

        let Some(url) = self.build_url(scene) else {
            return Outcome::error(
                started_at,
                ReasonCode::AdapterError,
                "set_lights is not configured (no webhook url)",
            );
        };

        let body = json!({
            "scene": scene,
            "request_id": ctx.request_id,
            "action_id": ctx.action_id,
            "timestamp_utc": started_at,
        });

        match self.http.post(&url).json(&body).send().await {
            Ok(response) => {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                if status.is_success() {
                    Outcome::success(
                        started_at,
                        json!({
                            "scene": scene,
                            "webhook_url": url,
                            "http_status": status.as_u16(),
                            "response_body": text.chars().take(500).collect::<String>(),
                        }),
                    )
                } else {
                    Outcome::error(
                        started_at,
                        ReasonCode::AdapterError,
                        format!("webhook HTTP {}: {}", status.as_u16(), text),
                    )
                }
            }
            Err(err) if err.is_timeout() => {
                Outcome::timeout(started_at, format!("webhook timed out: {err}"))
            }
            Err(err) => Outcome::error(
                started_at,
                ReasonCode::AdapterError,
                format!("webhook request failed: {err}"),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_wins_and_is_encoded() {
        let actuator = WebhookActuator::new(
            Some("http://fixed/hook".to_string()),
            Some("http://lights/scene/{scene}".to_string()),
            Duration::from_secs(5),
        );
        assert_eq!(
            actuator.build_url("red alert").unwrap(),
            "http://lights/scene/red%20alert"
        );
    }

    #[test]
    fn fixed_url_fallback() {
        let actuator =
            WebhookActuator::new(Some("http://fixed/hook".to_string()), None, Duration::from_secs(5));
        assert_eq!(actuator.build_url("x").unwrap(), "http://fixed/hook");
    }

    #[tokio::test]
    async fn unconfigured_reports_adapter_error() {
        let actuator = WebhookActuator::new(None, None, Duration::from_secs(1));
        let outcome = actuator
            .invoke(&serde_json::json!({"scene": "calm"}), &DispatchContext::default())
            .await;
        assert_eq!(outcome.status, super::super::OutcomeStatus::Error);
        assert_eq!(outcome.error_code, Some(ReasonCode::AdapterError));
    }
}
