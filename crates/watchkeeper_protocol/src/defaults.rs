//! Canonical default values shared across the control plane.

/// HTTP surface bind address.
pub const DEFAULT_HTTP_BIND: &str = "127.0.0.1:8787";
/// Doorbell UDP bind address.
pub const DEFAULT_DOORBELL_BIND: &str = "127.0.0.1:9910";
/// SAMMI variable API endpoint.
pub const DEFAULT_SAMMI_API: &str = "http://127.0.0.1:9450/api";
/// Store file name under the data dir.
pub const DEFAULT_DB_FILE: &str = "watchkeeper.sqlite3";

/// Confirmation window when the standing orders don't override it.
pub const DEFAULT_CONFIRM_WINDOW_SECONDS: u64 = 12;
/// STT confidence floor when the standing orders don't override it.
pub const DEFAULT_STT_MIN_CONFIDENCE: f64 = 0.82;

/// Lights webhook timeout.
pub const LIGHTS_WEBHOOK_TIMEOUT_SECS: f64 = 5.0;
/// Parser graceful-stop window before force kill.
pub const PARSER_STOP_TIMEOUT_SECS: f64 = 4.0;
/// Bridge variable API timeout.
pub const SAMMI_API_TIMEOUT_SECS: f64 = 0.6;
/// Bridge backoff after a failed call.
pub const SAMMI_API_BACKOFF_SECS: f64 = 5.0;
/// Cap on bridge variable pushes per supervisor cycle.
pub const SAMMI_MAX_UPDATES_PER_CYCLE: usize = 12;
/// Bridge pulse marker variable.
pub const SAMMI_NEW_WRITE_VAR: &str = "ID116.new_write";
/// Variables whose churn never triggers the new-write pulse.
pub const SAMMI_NEW_WRITE_IGNORE_VARS: &[&str] = &["Heartbeat", "timestamp"];

/// Game presence cadence while the game is running.
pub const PRESENCE_ACTIVE_SECS: f64 = 0.35;
/// Game presence cadence while idle.
pub const PRESENCE_IDLE_SECS: f64 = 8.0;
/// Hardware probe cadence.
pub const HARDWARE_LOOP_SECS: f64 = 10.0;
/// Music poll cadence while playing.
pub const MUSIC_ACTIVE_SECS: f64 = 2.0;
/// Music poll cadence while paused.
pub const MUSIC_IDLE_SECS: f64 = 10.0;
/// Gate poll cadence for the doorbell bind key.
pub const GATE_POLL_SECS: f64 = 0.5;
/// Chat doorbell debounce.
pub const CHAT_DEBOUNCE_MS: u64 = 250;

/// Memory alarm threshold (ratio of physical memory).
pub const HARDWARE_MEMORY_THRESHOLD: f64 = 0.90;
/// Hysteresis subtracted from a threshold before an alarm re-arms.
pub const HARDWARE_THRESHOLD_HYSTERESIS: f64 = 0.05;

/// State key that gates the doorbell socket.
pub const DOORBELL_GATE_KEY: &str = "app.sammi.running";
/// State key holding the derived watch condition.
pub const WATCH_CONDITION_KEY: &str = "policy.watch_condition";
/// State key holding the foreground process name.
pub const FOREGROUND_KEY: &str = "app.foreground";
