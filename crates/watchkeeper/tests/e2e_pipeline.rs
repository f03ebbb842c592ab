//! End-to-end pipeline scenarios against the HTTP surface.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;
use watchkeeper::http::build_router;
use watchkeeper::{Runtime, RuntimeConfig};
use watchkeeper_db::{EventFilter, StateWrite, WatchkeeperDb};
use watchkeeper_policy::{PolicyEngine, StandingOrders};

fn standing_orders() -> StandingOrders {
    StandingOrders::parse(
        &json!({
            "version": "1.0",
            "defaults": {"confirm_window_seconds": 12, "stt_min_confidence": 0.82},
            "watch_conditions": {
                "STANDBY": {"allow": ["sammi.*", "edparser.status"], "deny": ["twitch.*"]},
                "GAME": {
                    "allow": ["sammi.*", "edparser.*", "input.keypress", "jinx.*"],
                    "deny": []
                },
                "WORK": {"allow": ["sammi.music_next", "sammi.music_pause", "sammi.music_resume"]},
                "TUTOR": {"inherits": "WORK"},
                "RESTRICTED": {"deny": ["*"]},
                "DEGRADED": {"allow": ["edparser.status"]}
            },
            "tool_guards": {
                "input.keypress": {
                    "foreground_process_required": ["EliteDangerous64.exe"],
                    "requires_confirmation": true,
                    "rate_limit": {"window_sec": 60, "max_count": 3},
                    "safety_class": "high_risk"
                }
            }
        })
        .to_string(),
    )
    .unwrap()
}

async fn test_runtime_with(config: RuntimeConfig) -> (Router, Arc<Runtime>) {
    let db = WatchkeeperDb::open_in_memory().await.unwrap();
    let policy = PolicyEngine::from_document(standing_orders());
    let rt = Runtime::new(config, db, policy);
    (build_router(Arc::clone(&rt)), rt)
}

async fn test_runtime() -> (Router, Arc<Runtime>) {
    test_runtime_with(RuntimeConfig {
        keypress_enabled: true,
        ..RuntimeConfig::default()
    })
    .await
}

async fn post(app: &Router, path: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn get(app: &Router, path: &str) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("GET")
        .uri(path)
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

fn intent_body(request_id: &str, mode: &str, actions: Value) -> Value {
    json!({
        "schema_version": "1.0",
        "request_id": request_id,
        "timestamp_utc": "2026-01-01T00:00:00.000Z",
        "mode": mode,
        "domain": "gameplay",
        "urgency": "normal",
        "user_text": "do the thing",
        "needs_tools": true,
        "needs_clarification": false,
        "proposed_actions": actions,
        "response_text": "On it."
    })
}

fn action(action_id: &str, tool: &str, safety: &str, params: Value) -> Value {
    json!({
        "action_id": action_id,
        "tool_name": tool,
        "parameters": params,
        "safety_class": safety,
        "timeout_ms": 5000,
        "confidence": 0.95
    })
}

#[tokio::test]
async fn health_reports_version() {
    let (app, _rt) = test_runtime().await;
    let (status, body) = get(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn deny_in_condition_emits_one_action_denied() {
    let (app, rt) = test_runtime().await;

    let intent = intent_body(
        "req-1",
        "standby",
        json!([action("a1", "twitch.send_chat", "low_risk", json!({"message": "hi"}))]),
    );
    let (status, body) = post(&app, "/intent", intent).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["queued_actions"], 1);

    let (status, body) = post(
        &app,
        "/execute",
        json!({"request_id": "req-1", "incident_id": "inc-1"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["watch_condition"], "STANDBY");
    assert_eq!(body["results"][0]["status"], "denied");
    assert_eq!(body["results"][0]["reason_code"], "DENY_EXPLICITLY_DENIED");

    let denied = rt
        .db
        .read_events(EventFilter {
            event_type: Some("ACTION_DENIED".to_string()),
            correlation_id: Some("inc-1".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(denied.len(), 1);
    assert_eq!(denied[0].payload["action_id"], "a1");
}

#[tokio::test]
async fn needs_confirmation_then_confirm_executes() {
    let (app, rt) = test_runtime().await;

    rt.db
        .set_state(StateWrite::quiet(
            "app.foreground",
            json!("EliteDangerous64.exe"),
            "test",
        ))
        .await
        .unwrap();

    let intent = intent_body(
        "req-2",
        "game",
        json!([action("a1", "input.keypress", "high_risk", json!({"key": "l"}))]),
    );
    post(&app, "/intent", intent).await;

    let (status, body) = post(
        &app,
        "/execute",
        json!({
            "request_id": "req-2",
            "incident_id": "inc-2",
            "watch_condition": "GAME",
            "allow_high_risk": true
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let result = &body["results"][0];
    assert_eq!(result["status"], "requires_confirmation");
    assert_eq!(result["reason_code"], "DENY_NEEDS_CONFIRMATION");
    let token = result["confirm_token"].as_str().unwrap().to_string();
    assert!(result["confirm_by_ts"].is_string());

    // Confirm within the window: the action executes.
    let (status, body) = post(
        &app,
        "/confirm",
        json!({"incident_id": "inc-2", "confirm_token": token}),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["ok"], true);
    assert_eq!(body["result"]["status"], "success");

    // Second use of the same token: unknown.
    let (status, body) = post(
        &app,
        "/confirm",
        json!({"incident_id": "inc-2", "confirm_token": token}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], false);
    assert_eq!(body["reason_code"], "CONFIRM_TOKEN_UNKNOWN");

    let executed = rt
        .db
        .read_events(EventFilter {
            event_type: Some("ACTION_EXECUTED".to_string()),
            correlation_id: Some("inc-2".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(executed.len(), 1);
}

#[tokio::test]
async fn expired_confirm_token_is_rejected() {
    let (app, rt) = test_runtime().await;

    // Register a token already past its deadline.
    let token = rt.mint_confirmation(
        "inc-9",
        "input.keypress",
        "GAME".parse().unwrap(),
        0.0,
        watchkeeper::runtime::PendingTarget::Direct {
            parameters: json!({}),
        },
    );
    let (status, body) = post(
        &app,
        "/confirm",
        json!({"incident_id": "inc-9", "confirm_token": token}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], false);
    assert_eq!(body["reason_code"], "CONFIRM_EXPIRED");
}

#[tokio::test]
async fn foreground_mismatch_denies() {
    let (app, rt) = test_runtime().await;
    rt.db
        .set_state(StateWrite::quiet("app.foreground", json!("notepad.exe"), "test"))
        .await
        .unwrap();

    let intent = intent_body(
        "req-3",
        "game",
        json!([action("a1", "input.keypress", "high_risk", json!({"key": "l"}))]),
    );
    post(&app, "/intent", intent).await;

    let (_, body) = post(
        &app,
        "/execute",
        json!({
            "request_id": "req-3",
            "incident_id": "inc-3",
            "watch_condition": "GAME",
            "allow_high_risk": true
        }),
    )
    .await;
    assert_eq!(body["results"][0]["status"], "denied");
    assert_eq!(body["results"][0]["reason_code"], "DENY_FOREGROUND_MISMATCH");
}

#[tokio::test]
async fn execute_requires_incident_id() {
    let (app, _rt) = test_runtime().await;
    post(
        &app,
        "/intent",
        intent_body("req-4", "standby", json!([])),
    )
    .await;

    let (status, body) = post(&app, "/execute", json!({"request_id": "req-4"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["reason_code"], "MISSING_INCIDENT_ID");
}

#[tokio::test]
async fn dry_run_skips_dispatch_but_journals() {
    let (app, rt) = test_runtime().await;

    let intent = intent_body(
        "req-5",
        "game",
        json!([action("a1", "sammi.set_lights", "low_risk", json!({"scene": "red_alert"}))]),
    );
    post(&app, "/intent", intent).await;

    let (_, body) = post(
        &app,
        "/execute",
        json!({
            "request_id": "req-5",
            "incident_id": "inc-5",
            "watch_condition": "GAME",
            "dry_run": true
        }),
    )
    .await;
    assert_eq!(body["results"][0]["status"], "success");
    assert_eq!(body["results"][0]["output"]["dry_run"], true);

    // Policy decision still recorded.
    let decisions = rt
        .db
        .read_events(EventFilter {
            event_type: Some("POLICY_DECISION".to_string()),
            correlation_id: Some("inc-5".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0].payload["decision"]["allowed"], true);
}

#[tokio::test]
async fn reexecuting_success_is_a_noop() {
    let (app, _rt) = test_runtime().await;
    let intent = intent_body(
        "req-6",
        "game",
        json!([action("a1", "sammi.set_lights", "low_risk", json!({"scene": "calm"}))]),
    );
    post(&app, "/intent", intent).await;

    let execute = json!({
        "request_id": "req-6",
        "incident_id": "inc-6",
        "watch_condition": "GAME",
        "dry_run": true
    });
    let (_, first) = post(&app, "/execute", execute.clone()).await;
    assert_eq!(first["results"][0]["status"], "success");

    let (_, second) = post(&app, "/execute", execute).await;
    assert_eq!(second["results"][0]["status"], "success");
    assert_eq!(second["results"][0]["message"], "already finalized");
}

#[tokio::test]
async fn intent_post_is_idempotent() {
    let (app, rt) = test_runtime().await;
    let intent = intent_body(
        "req-7",
        "standby",
        json!([
            action("a1", "sammi.set_lights", "low_risk", json!({"scene": "calm"})),
            action("a2", "sammi.music_next", "low_risk", json!({}))
        ]),
    );
    let (_, first) = post(&app, "/intent", intent.clone()).await;
    let (_, second) = post(&app, "/intent", intent).await;
    assert_eq!(first["queued_actions"], 2);
    assert_eq!(second["queued_actions"], 2);

    let actions = rt.db.list_actions("req-7", None).await.unwrap();
    assert_eq!(actions.len(), 2);
}

#[tokio::test]
async fn intent_with_unknown_field_is_schema_violation() {
    let (app, _rt) = test_runtime().await;
    let mut intent = intent_body("req-8", "standby", json!([]));
    intent["extra_field"] = json!(1);
    let (status, body) = post(&app, "/intent", intent).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["reason_code"], "SCHEMA_VIOLATION");
}

#[tokio::test]
async fn state_ingest_validates_keys() {
    let (app, _rt) = test_runtime().await;

    for bad_key in ["ed..running", "System.CPU", "ed", "music-now_playing", "app.sammi.running"] {
        let (status, body) = post(
            &app,
            "/state",
            json!({"items": [{"state_key": bad_key, "state_value": 1, "source": "test"}]}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{bad_key}");
        assert_eq!(body["reason_code"], "INVALID_STATE_KEY", "{bad_key}");
    }

    let (status, body) = post(
        &app,
        "/state",
        json!({"items": [
            {"state_key": "ed.running", "state_value": true, "source": "collector"},
            {"state_key": "music.playing", "state_value": false, "source": "collector"}
        ]}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["upserted"], 2);

    let (_, state) = get(&app, "/state?key=ed.running").await;
    assert_eq!(state["items"][0]["state_value"], true);

    let (_, prefixed) = get(&app, "/state?prefix=music.").await;
    assert_eq!(prefixed["count"], 1);
}

#[tokio::test]
async fn events_filter_by_correlation() {
    let (app, rt) = test_runtime().await;
    post(
        &app,
        "/intent",
        intent_body(
            "req-9",
            "standby",
            json!([action("a1", "twitch.send_chat", "low_risk", json!({"message": "x"}))]),
        ),
    )
    .await;
    post(
        &app,
        "/execute",
        json!({"request_id": "req-9", "incident_id": "inc-9"}),
    )
    .await;

    let (_, body) = get(&app, "/events?correlation_id=inc-9").await;
    let items = body["items"].as_array().unwrap();
    assert!(!items.is_empty());
    assert!(items
        .iter()
        .all(|event| event["correlation_id"] == "inc-9"));

    // Sequence order equals emit order.
    let seqs: Vec<i64> = items.iter().map(|e| e["seq"].as_i64().unwrap()).collect();
    let mut sorted = seqs.clone();
    sorted.sort_unstable();
    assert_eq!(seqs, sorted);

    // Terminal action has exactly one ACTION_DENIED/EXECUTED event.
    let terminal = rt
        .db
        .read_events(EventFilter {
            correlation_id: Some("inc-9".to_string()),
            event_type: Some("ACTION_DENIED".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(terminal.len(), 1);
}

#[tokio::test]
async fn feedback_binds_to_existing_intent() {
    let (app, _rt) = test_runtime().await;
    post(&app, "/intent", intent_body("req-10", "standby", json!([]))).await;

    let (status, body) = post(
        &app,
        "/feedback",
        json!({"request_id": "req-10", "rating": 1, "correction_text": "good"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);

    let (status, _) = post(
        &app,
        "/feedback",
        json!({"request_id": "missing", "rating": -1}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = post(
        &app,
        "/feedback",
        json!({"request_id": "req-10", "rating": 0}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn send_chat_is_policy_gated() {
    let (app, rt) = test_runtime().await;

    // STANDBY denies twitch.*: the send is refused, not dispatched.
    rt.db
        .set_state(StateWrite::quiet(
            "policy.watch_condition",
            json!("STANDBY"),
            "test",
        ))
        .await
        .unwrap();
    let (status, body) = post(&app, "/twitch/send_chat", json!({"message": "hello"})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "denied");
    assert_eq!(body["reason_code"], "DENY_EXPLICITLY_DENIED");
}

fn noop_apps() -> std::collections::BTreeMap<String, Vec<String>> {
    let mut apps = std::collections::BTreeMap::new();
    apps.insert("noop".to_string(), vec!["true".to_string()]);
    apps
}

#[tokio::test]
async fn app_open_respects_actuator_kill_switch() {
    let (app, _rt) = test_runtime_with(RuntimeConfig {
        actuators_enabled: false,
        apps: noop_apps(),
        ..RuntimeConfig::default()
    })
    .await;

    // Kill switch off: the router refuses before the launcher runs.
    let (status, body) = post(&app, "/app/open", json!({"app_id": "noop"})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], false);
    assert_eq!(body["reason_code"], "ACTUATORS_DISABLED");
}

#[tokio::test]
async fn app_open_rejects_unknown_app() {
    let (app, _rt) = test_runtime_with(RuntimeConfig {
        apps: noop_apps(),
        ..RuntimeConfig::default()
    })
    .await;

    let (status, body) = post(&app, "/app/open", json!({"app_id": "browser"})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], false);
    assert_eq!(body["reason_code"], "ADAPTER_ERROR");
}

#[cfg(unix)]
#[tokio::test]
async fn app_open_launches_configured_app() {
    let (app, rt) = test_runtime_with(RuntimeConfig {
        apps: noop_apps(),
        ..RuntimeConfig::default()
    })
    .await;

    let (status, body) = post(&app, "/app/open", json!({"app_id": "noop"})).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["ok"], true);
    assert_eq!(body["status"], "success");

    let events = rt
        .db
        .read_events(EventFilter {
            event_type: Some("APP_OPEN_REQUESTED".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].payload["app_id"], "noop");
}

#[tokio::test]
async fn sitrep_reports_watch_condition() {
    let (app, rt) = test_runtime().await;
    rt.db
        .set_state(StateWrite::quiet(
            "policy.watch_condition",
            json!("GAME"),
            "test",
        ))
        .await
        .unwrap();
    let (status, body) = get(&app, "/sitrep").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["watch_condition"], "GAME");
    assert!(body["handover"].is_object());
}

#[tokio::test]
async fn watch_condition_transition_emits_handover_pair() {
    let (_, rt) = test_runtime().await;
    let mut previous = None;

    // First observation: STANDBY (nothing running).
    watchkeeper::supervisor::watch::observe(&rt, &mut previous)
        .await
        .unwrap();
    // Game comes up.
    rt.db
        .set_state(StateWrite::quiet("ed.running", json!(true), "test"))
        .await
        .unwrap();
    watchkeeper::supervisor::watch::observe(&rt, &mut previous)
        .await
        .unwrap();
    // No change: no extra events.
    watchkeeper::supervisor::watch::observe(&rt, &mut previous)
        .await
        .unwrap();

    let changes = rt
        .db
        .read_events(EventFilter {
            event_type: Some("WATCH_CONDITION_CHANGED".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(changes.len(), 2);
    let game_change = &changes[1];
    assert_eq!(game_change.payload["to"], "GAME");

    let notes = rt
        .db
        .read_events(EventFilter {
            event_type: Some("HANDOVER_NOTE".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(notes.len(), 2);
    // The pair shares a correlation id.
    assert_eq!(notes[1].correlation_id, game_change.correlation_id);
    assert_eq!(notes[1].payload["ed_status"]["running"], true);
}
