//! Watchkeeper daemon entry point.
//!
//! Usage:
//!     watchkeeper --bind 127.0.0.1:8787 --database ~/.watchkeeper/watchkeeper.sqlite3 \
//!         --standing-orders config/standing_orders.json

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch as watch_channel;
use watchkeeper::config::RuntimeConfig;
use watchkeeper::ingest::twitch::{TwitchIngest, VariableIndex};
use watchkeeper::ingest::DoorbellGate;
use watchkeeper::{http, supervisor, Runtime};
use watchkeeper_db::WatchkeeperDb;
use watchkeeper_logging::{init_logging, watchkeeper_home, LogConfig};
use watchkeeper_policy::PolicyEngine;
use watchkeeper_protocol::defaults;

#[derive(Parser, Debug)]
#[command(name = "watchkeeper", about = "Local-first deterministic control plane")]
struct Args {
    /// HTTP bind address
    #[arg(long, env = "WATCHKEEPER_BIND", default_value = defaults::DEFAULT_HTTP_BIND)]
    bind: String,

    /// Store path (defaults to ~/.watchkeeper/watchkeeper.sqlite3)
    #[arg(long, env = "WATCHKEEPER_DB")]
    database: Option<PathBuf>,

    /// Standing orders document
    #[arg(long, env = "WATCHKEEPER_STANDING_ORDERS", default_value = "config/standing_orders.json")]
    standing_orders: PathBuf,

    /// SAMMI variable index document
    #[arg(long, env = "WATCHKEEPER_VARIABLE_INDEX")]
    variable_index: Option<PathBuf>,

    /// Operator UI static files
    #[arg(long)]
    ui_dir: Option<PathBuf>,

    /// Telemetry snapshot written by the external parser
    #[arg(long, default_value = "data/ed_telemetry.json")]
    telemetry_json: PathBuf,

    /// Hardware probe snapshot
    #[arg(long, default_value = "data/hardware_probe.json")]
    hardware_json: PathBuf,

    /// Music player status directory
    #[arg(long, default_value = "data/music")]
    music_dir: PathBuf,

    /// Telemetry parser launch command (first element is the program)
    #[arg(long, num_args = 1..)]
    parser_command: Vec<String>,

    /// Apps file for /app/open (id -> argv)
    #[arg(long)]
    apps_json: Option<PathBuf>,

    /// Lighting environment-map document (environment -> effect code)
    #[arg(long)]
    jinx_envmap: Option<PathBuf>,

    /// Doorbell UDP bind address
    #[arg(long, default_value = defaults::DEFAULT_DOORBELL_BIND)]
    doorbell_bind: String,

    /// SAMMI variable API endpoint
    #[arg(long, env = "WATCHKEEPER_SAMMI_API", default_value = defaults::DEFAULT_SAMMI_API)]
    sammi_api: String,

    /// SAMMI API password
    #[arg(long, env = "WATCHKEEPER_SAMMI_PASSWORD")]
    sammi_password: Option<String>,

    /// Lights webhook URL
    #[arg(long, env = "WATCHKEEPER_LIGHTS_WEBHOOK")]
    lights_webhook: Option<String>,

    /// Lights webhook URL template with a {scene} placeholder
    #[arg(long, env = "WATCHKEEPER_LIGHTS_WEBHOOK_TEMPLATE")]
    lights_webhook_template: Option<String>,

    /// Enable actuator dispatch
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    enable_actuators: bool,

    /// Enable the virtual keypress actuator
    #[arg(long, default_value_t = false, action = clap::ArgAction::Set)]
    enable_keypress: bool,

    /// Enable the doorbell UDP gate
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    enable_twitch_udp: bool,

    /// Require minted tokens for confirmation (ignore bare user_confirmed)
    #[arg(long, default_value_t = false)]
    strict_confirm: bool,

    /// Allow runtime-managed state prefixes through /state (development)
    #[arg(long, default_value_t = false)]
    dev_ingest: bool,

    /// Start/stop the parser automatically with the game
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    parser_autorun: bool,

    /// Force the watch condition (debugging)
    #[arg(long)]
    force_watch_condition: Option<String>,

    /// Verbose console logging
    #[arg(long, short)]
    verbose: bool,
}

impl Args {
    fn into_config(self) -> anyhow::Result<RuntimeConfig> {
        let mut config = RuntimeConfig {
            http_bind: self.bind,
            db_path: self
                .database
                .unwrap_or_else(|| watchkeeper_home().join(defaults::DEFAULT_DB_FILE)),
            standing_orders_path: self.standing_orders,
            variable_index_path: self.variable_index,
            ui_dir: self.ui_dir,
            actuators_enabled: self.enable_actuators,
            keypress_enabled: self.enable_keypress,
            twitch_udp_enabled: self.enable_twitch_udp,
            strict_confirm: self.strict_confirm,
            dev_ingest: self.dev_ingest,
            lights_webhook_url: self.lights_webhook,
            lights_webhook_url_template: self.lights_webhook_template,
            parser_command: self.parser_command,
            parser_autorun: self.parser_autorun,
            forced_watch_condition: self.force_watch_condition,
            telemetry_json: self.telemetry_json,
            hardware_json: self.hardware_json,
            music_dir: self.music_dir,
            doorbell_bind: self.doorbell_bind,
            sammi_api_url: self.sammi_api,
            sammi_api_password: self.sammi_password,
            ..RuntimeConfig::default()
        };
        if let Some(apps_json) = &self.apps_json {
            config
                .load_apps(apps_json)
                .with_context(|| format!("failed to load apps file: {}", apps_json.display()))?;
        }
        if let Some(envmap) = &self.jinx_envmap {
            config
                .load_jinx_env_map(envmap)
                .with_context(|| format!("failed to load environment map: {}", envmap.display()))?;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let verbose = args.verbose;
    init_logging(LogConfig {
        app_name: "watchkeeper",
        verbose,
    })?;

    let config = args.into_config()?;
    tracing::info!(bind = %config.http_bind, db = %config.db_path.display(), "starting watchkeeper");

    // Fatal init: store, policy document, listener. Each error exits nonzero.
    let db = WatchkeeperDb::open(&config.db_path)
        .await
        .with_context(|| format!("failed to open store at {}", config.db_path.display()))?;
    let policy = PolicyEngine::from_path(&config.standing_orders_path).with_context(|| {
        format!(
            "failed to load standing orders from {}",
            config.standing_orders_path.display()
        )
    })?;
    let variable_index = match &config.variable_index_path {
        Some(path) => VariableIndex::load(path)
            .with_context(|| format!("failed to load variable index from {}", path.display()))?,
        None => VariableIndex::defaults(),
    };

    let listener = tokio::net::TcpListener::bind(&config.http_bind)
        .await
        .with_context(|| format!("failed to bind {}", config.http_bind))?;

    let rt = Runtime::new(config, db, policy);

    let (shutdown_tx, shutdown_rx) = watch_channel::channel(false);
    let loops = supervisor::spawn_all(Arc::clone(&rt), shutdown_rx.clone());

    let ingest = Arc::new(TwitchIngest::new(
        rt.db.clone(),
        Arc::clone(&rt.sammi),
        variable_index,
    ));
    let gate = DoorbellGate::new(Arc::clone(&rt), ingest);
    let gate_handle = tokio::spawn(gate.run(shutdown_rx.clone()));

    let app = http::build_router(Arc::clone(&rt));
    tracing::info!(addr = %listener.local_addr()?, "http surface listening");

    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
        }
        let _ = signal_tx.send(true);
    });

    let serve_shutdown = shutdown_rx.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let mut rx = serve_shutdown;
            let _ = rx.wait_for(|stop| *stop).await;
        })
        .await?;

    let _ = shutdown_tx.send(true);
    for handle in loops {
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    }
    let _ = tokio::time::timeout(Duration::from_secs(5), gate_handle).await;
    rt.parser.shutdown().await;
    tracing::info!("shutdown complete");
    Ok(())
}
