//! Shared runtime context.
//!
//! One immutable bundle built at startup and handed to every component; no
//! ambient globals. The pending-confirmation registry and per-incident locks
//! live here because both the HTTP surface and the pipeline need them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;
use watchkeeper_db::WatchkeeperDb;
use watchkeeper_policy::PolicyEngine;
use watchkeeper_protocol::WatchCondition;

use crate::actuators::jinx::JinxActuator;
use crate::actuators::keypress::KeypressActuator;
use crate::actuators::launcher::AppLauncher;
use crate::actuators::media::MediaKeyActuator;
use crate::actuators::parser::ParserSupervisor;
use crate::actuators::webhook::WebhookActuator;
use crate::config::RuntimeConfig;
use crate::router::ToolRouter;
use crate::sammi::SammiClient;

/// What a pending confirmation token will execute when consumed.
#[derive(Debug, Clone)]
pub enum PendingTarget {
    /// A queued action of a stored intent.
    Action {
        request_id: String,
        action_id: String,
        dry_run: bool,
        allow_high_risk: bool,
        stt_confidence: Option<f64>,
    },
    /// A direct tool call (e.g. policy-gated chat send).
    Direct {
        parameters: serde_json::Value,
    },
}

/// A minted, single-use confirmation token.
#[derive(Debug, Clone)]
pub struct PendingConfirmation {
    pub token: String,
    pub incident_id: String,
    pub tool_key: String,
    pub watch_condition: WatchCondition,
    /// Epoch seconds past which the token is dead.
    pub confirm_by_ts: f64,
    pub target: PendingTarget,
}

pub struct Runtime {
    pub config: Arc<RuntimeConfig>,
    pub db: WatchkeeperDb,
    pub policy: Arc<PolicyEngine>,
    pub router: ToolRouter,
    pub parser: Arc<ParserSupervisor>,
    pub sammi: Arc<SammiClient>,
    pub started_at: Instant,
    pending: Mutex<HashMap<String, PendingConfirmation>>,
    incident_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig, db: WatchkeeperDb, policy: PolicyEngine) -> Arc<Self> {
        let config = Arc::new(config);
        let sammi = Arc::new(SammiClient::new(
            config.sammi_api_url.clone(),
            config.sammi_api_password.clone(),
            config.sammi_api_timeout,
            config.sammi_api_backoff,
            true,
        ));
        let parser = Arc::new(ParserSupervisor::new(
            config.parser_command.clone(),
            config.parser_stop_timeout,
            Some(config.parser_state_json.clone()),
        ));
        let router = ToolRouter::new(
            config.actuators_enabled,
            config.keypress_enabled,
            WebhookActuator::new(
                config.lights_webhook_url.clone(),
                config.lights_webhook_url_template.clone(),
                config.lights_webhook_timeout,
            ),
            MediaKeyActuator::new(),
            KeypressActuator::new(config.keypress_allowed_processes.clone()),
            Arc::clone(&parser),
            JinxActuator::new(db.clone(), config.jinx_env_map.clone()),
            Arc::clone(&sammi),
            AppLauncher::new(config.apps.clone()),
        );

        Arc::new(Self {
            config,
            db,
            policy: Arc::new(policy),
            router,
            parser,
            sammi,
            started_at: Instant::now(),
            pending: Mutex::new(HashMap::new()),
            incident_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Mint and register a single-use confirmation token.
    pub fn mint_confirmation(
        &self,
        incident_id: &str,
        tool_key: &str,
        watch_condition: WatchCondition,
        confirm_by_ts: f64,
        target: PendingTarget,
    ) -> String {
        let token = format!("confirm-{}", Uuid::new_v4().simple());
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.insert(
            token.clone(),
            PendingConfirmation {
                token: token.clone(),
                incident_id: incident_id.to_string(),
                tool_key: tool_key.to_string(),
                watch_condition,
                confirm_by_ts,
                target,
            },
        );
        token
    }

    /// Consume a token bound to the given incident. Single use: a hit
    /// removes the entry (even if it later turns out expired), so a second
    /// presentation reads as unknown. A token under a different incident is
    /// left alone and reads as unknown too.
    pub fn take_confirmation_for(
        &self,
        token: &str,
        incident_id: &str,
    ) -> Option<PendingConfirmation> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        match pending.get(token) {
            Some(entry) if entry.incident_id == incident_id => pending.remove(token),
            _ => None,
        }
    }

    /// Serialize execute calls per incident id.
    pub fn incident_lock(&self, incident_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.incident_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(incident_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}
