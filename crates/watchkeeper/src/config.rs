//! Runtime configuration.
//!
//! Captured once at startup from CLI flags (with env fallbacks) and passed
//! around in an `Arc`; nothing reads the environment after init.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use watchkeeper_protocol::defaults;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// HTTP surface bind address.
    pub http_bind: String,
    /// Store path.
    pub db_path: PathBuf,
    /// Standing orders document path.
    pub standing_orders_path: PathBuf,
    /// Optional SAMMI variable index document.
    pub variable_index_path: Option<PathBuf>,
    /// Optional operator UI static dir.
    pub ui_dir: Option<PathBuf>,

    // Feature switches
    pub actuators_enabled: bool,
    pub keypress_enabled: bool,
    pub twitch_udp_enabled: bool,
    /// When set, `user_confirmed` on /execute is ignored unless a previously
    /// minted token is presented; confirmation must go through /confirm.
    pub strict_confirm: bool,
    /// Allow runtime-managed prefixes through /state for local development.
    pub dev_ingest: bool,

    // Actuator wiring
    pub lights_webhook_url: Option<String>,
    pub lights_webhook_url_template: Option<String>,
    pub lights_webhook_timeout: Duration,
    pub keypress_allowed_processes: Vec<String>,
    pub parser_command: Vec<String>,
    pub parser_stop_timeout: Duration,
    /// Process-supervisor state snapshot file.
    pub parser_state_json: PathBuf,
    /// App id -> launch command for /app/open.
    pub apps: BTreeMap<String, Vec<String>>,
    /// Lighting environment name -> jinx effect code.
    pub jinx_env_map: BTreeMap<String, String>,

    // Supervisor wiring
    pub game_process_names: Vec<String>,
    pub sammi_process_names: Vec<String>,
    pub jinx_process_names: Vec<String>,
    pub telemetry_json: PathBuf,
    pub hardware_json: PathBuf,
    pub music_dir: PathBuf,
    pub presence_active: Duration,
    pub presence_idle: Duration,
    pub hardware_interval: Duration,
    pub music_active: Duration,
    pub music_idle: Duration,
    pub memory_threshold: f64,
    pub threshold_hysteresis: f64,
    pub parser_autorun: bool,
    pub forced_watch_condition: Option<String>,

    // Bridge / ingest wiring
    pub sammi_api_url: String,
    pub sammi_api_password: Option<String>,
    pub sammi_api_timeout: Duration,
    pub sammi_api_backoff: Duration,
    pub sammi_max_updates_per_cycle: usize,
    pub sammi_new_write_var: String,
    pub sammi_new_write_ignore: Vec<String>,
    pub bridge_enabled: bool,
    pub doorbell_bind: String,
    pub chat_debounce: Duration,
    pub gate_poll: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            http_bind: defaults::DEFAULT_HTTP_BIND.to_string(),
            db_path: PathBuf::from(defaults::DEFAULT_DB_FILE),
            standing_orders_path: PathBuf::from("config/standing_orders.json"),
            variable_index_path: None,
            ui_dir: None,
            actuators_enabled: true,
            keypress_enabled: false,
            twitch_udp_enabled: true,
            strict_confirm: false,
            dev_ingest: false,
            lights_webhook_url: None,
            lights_webhook_url_template: None,
            lights_webhook_timeout: Duration::from_secs_f64(defaults::LIGHTS_WEBHOOK_TIMEOUT_SECS),
            keypress_allowed_processes: vec![
                "elitedangerous64.exe".to_string(),
                "elitedangerous.exe".to_string(),
            ],
            parser_command: Vec::new(),
            parser_stop_timeout: Duration::from_secs_f64(defaults::PARSER_STOP_TIMEOUT_SECS),
            parser_state_json: PathBuf::from("data/parser_state.json"),
            apps: BTreeMap::new(),
            jinx_env_map: default_jinx_env_map(),
            game_process_names: vec![
                "elitedangerous64.exe".to_string(),
                "elitedangerous.exe".to_string(),
            ],
            sammi_process_names: vec!["sammi core.exe".to_string()],
            jinx_process_names: vec!["jinx.exe".to_string()],
            telemetry_json: PathBuf::from("data/ed_telemetry.json"),
            hardware_json: PathBuf::from("data/hardware_probe.json"),
            music_dir: PathBuf::from("data/music"),
            presence_active: Duration::from_secs_f64(defaults::PRESENCE_ACTIVE_SECS),
            presence_idle: Duration::from_secs_f64(defaults::PRESENCE_IDLE_SECS),
            hardware_interval: Duration::from_secs_f64(defaults::HARDWARE_LOOP_SECS),
            music_active: Duration::from_secs_f64(defaults::MUSIC_ACTIVE_SECS),
            music_idle: Duration::from_secs_f64(defaults::MUSIC_IDLE_SECS),
            memory_threshold: defaults::HARDWARE_MEMORY_THRESHOLD,
            threshold_hysteresis: defaults::HARDWARE_THRESHOLD_HYSTERESIS,
            parser_autorun: true,
            forced_watch_condition: None,
            sammi_api_url: defaults::DEFAULT_SAMMI_API.to_string(),
            sammi_api_password: None,
            sammi_api_timeout: Duration::from_secs_f64(defaults::SAMMI_API_TIMEOUT_SECS),
            sammi_api_backoff: Duration::from_secs_f64(defaults::SAMMI_API_BACKOFF_SECS),
            sammi_max_updates_per_cycle: defaults::SAMMI_MAX_UPDATES_PER_CYCLE,
            sammi_new_write_var: defaults::SAMMI_NEW_WRITE_VAR.to_string(),
            sammi_new_write_ignore: defaults::SAMMI_NEW_WRITE_IGNORE_VARS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            bridge_enabled: true,
            doorbell_bind: defaults::DEFAULT_DOORBELL_BIND.to_string(),
            chat_debounce: Duration::from_millis(defaults::CHAT_DEBOUNCE_MS),
            gate_poll: Duration::from_secs_f64(defaults::GATE_POLL_SECS),
        }
    }
}

/// Shape of the optional apps file for /app/open: id -> argv.
#[derive(Debug, Deserialize)]
pub struct AppsFile(pub BTreeMap<String, Vec<String>>);

impl RuntimeConfig {
    pub fn load_apps(&mut self, path: &Path) -> anyhow::Result<()> {
        let raw = std::fs::read_to_string(path)?;
        let parsed: AppsFile = serde_json::from_str(&raw)?;
        self.apps = parsed.0;
        Ok(())
    }

    pub fn load_jinx_env_map(&mut self, path: &Path) -> anyhow::Result<()> {
        let raw = std::fs::read_to_string(path)?;
        self.jinx_env_map = serde_json::from_str(&raw)?;
        Ok(())
    }
}

/// Fallback lighting map used when no environment-map document is supplied.
fn default_jinx_env_map() -> BTreeMap<String, String> {
    [
        ("Normal Space", "C7"),
        ("Supercruise", "C7"),
        ("Docked", "C14"),
        ("Planet Surface - SRV", "C7"),
        ("Planet Surface - Ship", "C7"),
        ("Planet Orbit", "C7"),
        ("Witch Space", "C7"),
        ("On Foot - Planet", "C7"),
        ("On Foot - Station", "C7"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}
