//! HTTP surface: state ingest, event reads, SSE stream, the execution
//! pipeline endpoints, sitrep, twitch queries, and the operator UI.

mod error;

pub use error::ApiError;

use axum::extract::{Path as AxumPath, Query, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::Stream;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::services::ServeDir;
use watchkeeper_db::{EventContext, EventFilter, StateWrite};
use watchkeeper_protocol::http_types::{
    AppOpenRequest, ConfirmRequest, ExecuteRequest, FeedbackRequest, IntentEnvelope,
    SendChatRequest, StateIngestRequest,
};
use watchkeeper_protocol::naming::{is_well_formed, validate_state_key};
use watchkeeper_protocol::ReasonCode;

use crate::pipeline;
use crate::runtime::Runtime;
use crate::supervisor::watch::{handover_snapshot, EVENT_HANDOVER_NOTE};

pub fn build_router(rt: Arc<Runtime>) -> Router {
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/state", get(get_state).post(post_state))
        .route("/events", get(get_events))
        .route("/events/stream", get(events_stream))
        .route("/intent", post(post_intent))
        .route("/execute", post(post_execute))
        .route("/confirm", post(post_confirm))
        .route("/feedback", post(post_feedback))
        .route("/sitrep", get(sitrep))
        .route("/twitch/recent", get(twitch_recent))
        .route("/twitch/user/:id", get(twitch_user))
        .route("/twitch/user/:id/redeems/top", get(twitch_user_redeems))
        .route("/twitch/send_chat", post(twitch_send_chat))
        .route("/app/open", post(app_open));

    if let Some(ui_dir) = &rt.config.ui_dir {
        router = router.nest_service("/ui", ServeDir::new(ui_dir));
    }

    router.with_state(rt)
}

/// Decode a closed-schema body; unknown fields and type mismatches are
/// schema violations, not server errors.
fn parse_body<T: DeserializeOwned>(value: Value) -> Result<T, ApiError> {
    serde_json::from_value(value).map_err(|err| ApiError::schema(err.to_string()))
}

async fn health(State(rt): State<Arc<Runtime>>) -> Json<Value> {
    Json(json!({
        "ok": true,
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_sec": rt.uptime().as_secs(),
    }))
}

#[derive(Deserialize)]
struct StateQuery {
    key: Option<String>,
    prefix: Option<String>,
}

async fn get_state(
    State(rt): State<Arc<Runtime>>,
    Query(query): Query<StateQuery>,
) -> Result<Json<Value>, ApiError> {
    if let Some(key) = query.key.as_deref().map(str::trim).filter(|k| !k.is_empty()) {
        let item = rt.db.get_state(key).await?;
        let items: Vec<_> = item.into_iter().collect();
        return Ok(Json(json!({"ok": true, "count": items.len(), "items": items})));
    }
    let prefix = query.prefix.unwrap_or_default();
    let items = rt.db.list_state(prefix.trim()).await?;
    Ok(Json(json!({"ok": true, "count": items.len(), "items": items})))
}

async fn post_state(
    State(rt): State<Arc<Runtime>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let req: StateIngestRequest = parse_body(body)?;
    if req.items.is_empty() {
        return Err(ApiError::validation("items is required and must be a non-empty array"));
    }

    let mut writes = Vec::with_capacity(req.items.len());
    for (idx, item) in req.items.iter().enumerate() {
        let key = item.state_key.trim();
        let valid = if rt.config.dev_ingest {
            // Dev ingest skips the prefix allow-list but keeps the shape.
            is_well_formed(key)
                .then_some(())
                .ok_or_else(|| format!("items[{idx}].state_key is malformed: {key:?}"))
        } else {
            validate_state_key(key).map_err(|err| format!("items[{idx}]: {err}"))
        };
        if let Err(message) = valid {
            return Err(ApiError::validation_code(ReasonCode::InvalidStateKey, message));
        }
        if item.source.trim().is_empty() {
            return Err(ApiError::validation(format!(
                "items[{idx}].source must be a non-empty string"
            )));
        }
        if let Some(confidence) = item.confidence {
            if !(0.0..=1.0).contains(&confidence) {
                return Err(ApiError::validation(format!(
                    "items[{idx}].confidence must be 0..1"
                )));
            }
        }

        let mut write = StateWrite::new(key, item.state_value.clone(), item.source.trim());
        write.confidence = item.confidence;
        write.observed_at_utc = item.observed_at_utc.clone();
        write.emit_event = req.emit_events.unwrap_or(true);
        writes.push(write);
    }

    let keys: Vec<String> = writes.iter().map(|w| w.state_key.clone()).collect();
    let result = rt
        .db
        .batch_set_state(
            writes,
            EventContext {
                session_id: req.session_id,
                correlation_id: req.correlation_id,
                source: None,
            },
        )
        .await?;

    Ok(Json(json!({
        "ok": true,
        "upserted": result.upserted,
        "changed": result.changed,
        "state_keys": keys,
    })))
}

#[derive(Deserialize)]
struct EventsQuery {
    limit: Option<u32>,
    since_seq: Option<i64>,
    event_type: Option<String>,
    correlation_id: Option<String>,
    session_id: Option<String>,
}

async fn get_events(
    State(rt): State<Arc<Runtime>>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Value>, ApiError> {
    let events = rt
        .db
        .read_events(EventFilter {
            limit: query.limit.unwrap_or(100),
            since_seq: query.since_seq,
            event_type: query.event_type.filter(|s| !s.is_empty()),
            correlation_id: query.correlation_id.filter(|s| !s.is_empty()),
            session_id: query.session_id.filter(|s| !s.is_empty()),
        })
        .await?;
    Ok(Json(json!({"ok": true, "count": events.len(), "items": events})))
}

async fn events_stream(
    State(rt): State<Arc<Runtime>>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = rt.db.subscribe_events();
    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(record) => {
                    let event = SseEvent::default().event(record.event_type.clone());
                    match event.json_data(&record) {
                        Ok(event) => return Some((Ok(event), rx)),
                        Err(_) => continue,
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn post_intent(
    State(rt): State<Arc<Runtime>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let intent: IntentEnvelope = parse_body(body)?;
    Ok(Json(pipeline::handle_intent(&rt, intent).await?))
}

async fn post_execute(
    State(rt): State<Arc<Runtime>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let req: ExecuteRequest = parse_body(body)?;
    let response = pipeline::handle_execute(&rt, req).await?;
    Ok(Json(serde_json::to_value(response)?))
}

async fn post_confirm(
    State(rt): State<Arc<Runtime>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let req: ConfirmRequest = parse_body(body)?;
    Ok(Json(pipeline::handle_confirm(&rt, req).await?))
}

async fn post_feedback(
    State(rt): State<Arc<Runtime>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let req: FeedbackRequest = parse_body(body)?;
    Ok(Json(pipeline::handle_feedback(&rt, req).await?))
}

async fn sitrep(State(rt): State<Arc<Runtime>>) -> Result<Json<Value>, ApiError> {
    let watch_condition = rt
        .db
        .get_state(watchkeeper_protocol::defaults::WATCH_CONDITION_KEY)
        .await?
        .map(|entry| entry.state_value)
        .unwrap_or(Value::Null);

    // Prefer the last recorded handover; fall back to a live snapshot.
    let last_handover = rt
        .db
        .read_events(EventFilter {
            limit: 1,
            event_type: Some(EVENT_HANDOVER_NOTE.to_string()),
            ..Default::default()
        })
        .await?
        .pop()
        .map(|event| event.payload);
    let handover = match last_handover {
        Some(payload) => payload,
        None => handover_snapshot(&rt).await,
    };

    let capabilities = rt.db.list_capabilities().await?;
    Ok(Json(json!({
        "ok": true,
        "watch_condition": watch_condition,
        "handover": handover,
        "capabilities": capabilities,
        "uptime_sec": rt.uptime().as_secs(),
    })))
}

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<u32>,
}

async fn twitch_recent(
    State(rt): State<Arc<Runtime>>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Value>, ApiError> {
    let items = rt.db.recent_twitch_events(query.limit.unwrap_or(25)).await?;
    Ok(Json(json!({"ok": true, "count": items.len(), "items": items})))
}

async fn twitch_user(
    State(rt): State<Arc<Runtime>>,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<Value>, ApiError> {
    match rt.db.get_twitch_user(&id).await? {
        Some(user) => Ok(Json(json!({"ok": true, "user": user}))),
        None => Err(ApiError::NotFound(format!("twitch user not found: {id}"))),
    }
}

async fn twitch_user_redeems(
    State(rt): State<Arc<Runtime>>,
    AxumPath(id): AxumPath<String>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Value>, ApiError> {
    let items = rt.db.top_redeems(&id, query.limit.unwrap_or(10)).await?;
    Ok(Json(json!({"ok": true, "user_id": id, "items": items})))
}

async fn twitch_send_chat(
    State(rt): State<Arc<Runtime>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let req: SendChatRequest = parse_body(body)?;
    Ok(Json(pipeline::handle_send_chat(&rt, req).await?))
}

async fn app_open(
    State(rt): State<Arc<Runtime>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let req: AppOpenRequest = parse_body(body)?;
    Ok(Json(pipeline::handle_app_open(&rt, &req.app_id).await?))
}
