//! SAMMI bridge API client.
//!
//! Outbound HTTP to the local variable-setting API. Calls are short-timeout
//! and failures trip a backoff window so supervisor cycles don't pile up
//! behind a dead bridge.

use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("bridge unreachable: {0}")]
    Unreachable(String),

    #[error("bridge returned HTTP {0}")]
    Status(u16),

    #[error("bridge is in backoff")]
    Backoff,

    #[error("bridge disabled")]
    Disabled,
}

pub struct SammiClient {
    http: reqwest::Client,
    api_url: String,
    password: Option<String>,
    enabled: bool,
    backoff: Duration,
    backoff_until: Mutex<Option<Instant>>,
}

impl SammiClient {
    pub fn new(
        api_url: String,
        password: Option<String>,
        timeout: Duration,
        backoff: Duration,
        enabled: bool,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            http,
            api_url,
            password,
            enabled,
            backoff,
            backoff_until: Mutex::new(None),
        }
    }

    fn check_gate(&self) -> Result<(), BridgeError> {
        if !self.enabled {
            return Err(BridgeError::Disabled);
        }
        let until = self.backoff_until.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(until) = *until {
            if Instant::now() < until {
                return Err(BridgeError::Backoff);
            }
        }
        Ok(())
    }

    fn record_failure(&self) {
        let mut until = self.backoff_until.lock().unwrap_or_else(|e| e.into_inner());
        *until = Some(Instant::now() + self.backoff);
    }

    fn record_success(&self) {
        let mut until = self.backoff_until.lock().unwrap_or_else(|e| e.into_inner());
        *until = None;
    }

    async fn post(&self, request_name: &str, params: Value) -> Result<Value, BridgeError> {
        self.check_gate()?;
        let mut body = Map::new();
        body.insert("request".to_string(), json!(request_name));
        if let Value::Object(params) = params {
            body.extend(params);
        }

        let mut req = self.http.post(&self.api_url).json(&Value::Object(body));
        if let Some(password) = &self.password {
            req = req.header("Authorization", password);
        }

        let response = req.send().await.map_err(|err| {
            self.record_failure();
            BridgeError::Unreachable(err.to_string())
        })?;
        if !response.status().is_success() {
            self.record_failure();
            return Err(BridgeError::Status(response.status().as_u16()));
        }
        self.record_success();
        Ok(response.json::<Value>().await.unwrap_or(Value::Null))
    }

    /// Read one variable; `None` when unset or the bridge is down.
    pub async fn get_var(&self, name: &str) -> Option<Value> {
        if name.is_empty() || self.check_gate().is_err() {
            return None;
        }
        let mut req = self
            .http
            .get(&self.api_url)
            .query(&[("request", "getVariable"), ("name", name)]);
        if let Some(password) = &self.password {
            req = req.header("Authorization", password);
        }
        let response = match req.send().await {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(_) | Err(_) => {
                self.record_failure();
                return None;
            }
        };
        self.record_success();
        let payload = response.json::<Value>().await.ok()?;
        let data = payload.get("data")?;
        if let Some(obj) = data.as_object() {
            for key in ["value", "result", "variable"] {
                if let Some(value) = obj.get(key) {
                    return Some(value.clone());
                }
            }
        }
        Some(data.clone())
    }

    /// Read a batch of variables; missing or unreadable ones are absent.
    pub async fn get_vars(&self, names: &[String]) -> HashMap<String, Value> {
        let mut out = HashMap::new();
        for name in names {
            if let Some(value) = self.get_var(name).await {
                out.insert(name.clone(), value);
            }
        }
        out
    }

    pub async fn set_variable(&self, name: &str, value: &Value) -> Result<(), BridgeError> {
        debug!(name, "sammi setVariable");
        self.post("setVariable", json!({"name": name, "value": value}))
            .await
            .map(|_| ())
    }

    pub async fn trigger_button(&self, button: &str) -> Result<(), BridgeError> {
        self.post("triggerButton", json!({"trigger": button}))
            .await
            .map(|_| ())
    }

    /// Send a chat line through the bridge.
    pub async fn send_chat(&self, message: &str) -> Result<(), BridgeError> {
        self.post("sendMessage", json!({"message": message}))
            .await
            .map(|_| ())
    }
}
