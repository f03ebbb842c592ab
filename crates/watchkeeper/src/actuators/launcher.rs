//! Best-effort app launcher for /app/open.

use serde_json::json;
use std::collections::BTreeMap;
use tracing::info;
use watchkeeper_protocol::types::utc_now_iso;
use watchkeeper_protocol::ReasonCode;

use super::Outcome;

pub struct AppLauncher {
    apps: BTreeMap<String, Vec<String>>,
}

impl AppLauncher {
    pub fn new(apps: BTreeMap<String, Vec<String>>) -> Self {
        Self { apps }
    }

    pub fn open(&self, app_id: &str) -> Outcome {
        let started_at = utc_now_iso();
        let Some(argv) = self.apps.get(app_id).filter(|argv| !argv.is_empty()) else {
            return Outcome::error(
                started_at,
                ReasonCode::AdapterError,
                format!("unknown app id: {app_id:?}"),
            );
        };

        let mut cmd = std::process::Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());

        match cmd.spawn() {
            Ok(child) => {
                info!(app_id, pid = child.id(), "app launched");
                Outcome::success(started_at, json!({"app_id": app_id, "pid": child.id()}))
            }
            Err(err) => Outcome::error(
                started_at,
                ReasonCode::AdapterError,
                format!("failed to launch {app_id}: {err}"),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuators::OutcomeStatus;

    #[test]
    fn unknown_app_errors() {
        let launcher = AppLauncher::new(BTreeMap::new());
        let outcome = launcher.open("browser");
        assert_eq!(outcome.status, OutcomeStatus::Error);
    }

    #[cfg(unix)]
    #[test]
    fn known_app_spawns() {
        let mut apps = BTreeMap::new();
        apps.insert("noop".to_string(), vec!["true".to_string()]);
        let launcher = AppLauncher::new(apps);
        let outcome = launcher.open("noop");
        assert_eq!(outcome.status, OutcomeStatus::Success);
    }
}
