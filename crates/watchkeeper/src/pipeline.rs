//! Execution pipeline: intent intake, policy gating, confirmation workflow,
//! actuator dispatch, and outcome journaling.
//!
//! Every event emitted by one execute call carries the incident id as its
//! correlation id, and events are appended in emit order so sequence order
//! equals emit order.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;
use watchkeeper_db::{ActionRow, IntentRow};
use watchkeeper_policy::{ActionRequest, PolicyEngine};
use watchkeeper_protocol::defaults::{FOREGROUND_KEY, WATCH_CONDITION_KEY};
use watchkeeper_protocol::http_types::{
    ActionResult, ConfirmRequest, ExecuteRequest, ExecuteResponse, FeedbackRequest,
    IntentEnvelope, SendChatRequest,
};
use watchkeeper_protocol::types::{
    utc_now_iso, ActionStatus, Decision, Mode, NewEvent, SafetyClass, Severity, WatchCondition,
};
use watchkeeper_protocol::ReasonCode;

use crate::actuators::{DispatchContext, Outcome, OutcomeStatus};
use crate::http::ApiError;
use crate::runtime::{PendingTarget, Runtime};

pub const EVENT_INTENT_PROPOSED: &str = "INTENT_PROPOSED";
pub const EVENT_POLICY_DECISION: &str = "POLICY_DECISION";
pub const EVENT_ACTION_APPROVED: &str = "ACTION_APPROVED";
pub const EVENT_ACTION_DENIED: &str = "ACTION_DENIED";
pub const EVENT_ACTION_EXECUTED: &str = "ACTION_EXECUTED";
pub const EVENT_CONFIRMATION_REQUIRED: &str = "ACTION_CONFIRMATION_REQUIRED";
pub const EVENT_CONFIRMATION_EXPIRED: &str = "ACTION_CONFIRMATION_EXPIRED";
pub const EVENT_USER_CONFIRMATION_RECORDED: &str = "USER_CONFIRMATION_RECORDED";
pub const EVENT_CONFIRM_ACCEPTED: &str = "CONFIRM_ACCEPTED";
pub const EVENT_USER_FEEDBACK: &str = "USER_FEEDBACK";
pub const EVENT_APP_OPEN: &str = "APP_OPEN_REQUESTED";

const MAX_ACTIONS: usize = 10;
const MAX_CLARIFICATION_QUESTIONS: usize = 3;

fn now_epoch() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

fn epoch_to_iso(epoch: f64) -> String {
    Utc.timestamp_millis_opt((epoch * 1000.0) as i64)
        .single()
        .map(|ts| ts.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_default()
}

fn parse_iso_epoch(value: &str) -> Result<f64, ApiError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.timestamp_millis() as f64 / 1000.0)
        .map_err(|_| ApiError::validation(format!("not an ISO-8601 timestamp: {value:?}")))
}

// ---------------------------------------------------------------------------
// Intent intake
// ---------------------------------------------------------------------------

fn validate_intent(intent: &IntentEnvelope) -> Result<(), ApiError> {
    if intent.schema_version != "1.0" {
        return Err(ApiError::validation("schema_version must be \"1.0\""));
    }
    if intent.request_id.trim().is_empty() {
        return Err(ApiError::validation("request_id must be a non-empty string"));
    }
    parse_iso_epoch(&intent.timestamp_utc)?;
    if intent.user_text.trim().is_empty() {
        return Err(ApiError::validation("user_text must be a non-empty string"));
    }
    if intent.clarification_questions.len() > MAX_CLARIFICATION_QUESTIONS {
        return Err(ApiError::validation(format!(
            "clarification_questions must have at most {MAX_CLARIFICATION_QUESTIONS} items"
        )));
    }
    if intent.proposed_actions.len() > MAX_ACTIONS {
        return Err(ApiError::validation(format!(
            "proposed_actions must have at most {MAX_ACTIONS} items"
        )));
    }
    for (idx, action) in intent.proposed_actions.iter().enumerate() {
        if action.action_id.trim().is_empty() {
            return Err(ApiError::validation(format!(
                "proposed_actions[{idx}].action_id must be a non-empty string"
            )));
        }
        if action.tool_name.trim().is_empty() {
            return Err(ApiError::validation(format!(
                "proposed_actions[{idx}].tool_name must be a non-empty string"
            )));
        }
        if !action.parameters.is_object() {
            return Err(ApiError::validation(format!(
                "proposed_actions[{idx}].parameters must be an object"
            )));
        }
        if !(100..=120_000).contains(&action.timeout_ms) {
            return Err(ApiError::validation(format!(
                "proposed_actions[{idx}].timeout_ms must be 100..120000"
            )));
        }
        if !(0.0..=1.0).contains(&action.confidence) {
            return Err(ApiError::validation(format!(
                "proposed_actions[{idx}].confidence must be 0..1"
            )));
        }
    }
    Ok(())
}

pub async fn handle_intent(rt: &Arc<Runtime>, intent: IntentEnvelope) -> Result<Value, ApiError> {
    validate_intent(&intent)?;
    let queued = rt.db.upsert_intent(&intent).await?;

    let event = NewEvent::new(
        EVENT_INTENT_PROPOSED,
        "pipeline",
        json!({
            "request_id": intent.request_id,
            "actions": intent.proposed_actions.iter().map(|a| a.action_id.clone()).collect::<Vec<_>>(),
            "domain": intent.domain.as_str(),
            "urgency": intent.urgency.as_str(),
        }),
    )
    .correlation(intent.request_id.clone());
    rt.db.append_event(event).await?;

    Ok(json!({
        "ok": true,
        "request_id": intent.request_id,
        "queued_actions": queued,
    }))
}

// ---------------------------------------------------------------------------
// Execute
// ---------------------------------------------------------------------------

/// Per-call knobs threaded through action evaluation.
#[derive(Debug, Clone)]
struct ExecOpts {
    incident_id: String,
    watch_condition: WatchCondition,
    stt_confidence: Option<f64>,
    dry_run: bool,
    allow_high_risk: bool,
    user_confirm_token: Option<String>,
}

async fn resolve_watch_condition(
    rt: &Runtime,
    requested: Option<&str>,
    intent_mode: &str,
) -> Result<WatchCondition, ApiError> {
    if let Some(forced) = &rt.config.forced_watch_condition {
        return forced.parse().map_err(ApiError::validation);
    }
    if let Some(requested) = requested {
        return requested.parse().map_err(ApiError::validation);
    }
    if let Some(entry) = rt.db.get_state(WATCH_CONDITION_KEY).await? {
        if let Some(text) = entry.state_value.as_str() {
            if let Ok(condition) = text.parse() {
                return Ok(condition);
            }
        }
    }
    let mode: Mode = serde_json::from_value(Value::String(intent_mode.to_string()))
        .unwrap_or(Mode::Standby);
    Ok(mode.default_condition())
}

async fn foreground_process(rt: &Runtime) -> Option<String> {
    match rt.db.get_state(FOREGROUND_KEY).await {
        Ok(entry) => entry.and_then(|e| e.state_value.as_str().map(str::to_string)),
        Err(err) => {
            warn!(error = %err, "foreground lookup failed");
            None
        }
    }
}

pub async fn handle_execute(
    rt: &Arc<Runtime>,
    req: ExecuteRequest,
) -> Result<ExecuteResponse, ApiError> {
    let incident_id = req
        .incident_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            ApiError::validation_code(ReasonCode::MissingIncidentId, "incident_id is required")
        })?
        .to_string();

    if let Some(confidence) = req.stt_confidence {
        if !(0.0..=1.0).contains(&confidence) {
            return Err(ApiError::validation("stt_confidence must be 0..1"));
        }
    }

    let intent = rt
        .db
        .get_intent(&req.request_id)
        .await?
        .ok_or_else(|| ApiError::validation(format!("request_id not found: {}", req.request_id)))?;

    let watch_condition =
        resolve_watch_condition(rt, req.watch_condition.as_deref(), &intent.mode).await?;

    // Serialize all execution per incident id.
    let lock = rt.incident_lock(&incident_id);
    let _guard = lock.lock().await;

    // A user_confirmed flag (outside strict-confirm) records a confirmation
    // usable by every action of this call.
    let confirm_token = req
        .user_confirm_token
        .clone()
        .unwrap_or_else(|| format!("manual-{}", Uuid::new_v4().simple()));
    if req.user_confirmed && (!rt.config.strict_confirm || req.user_confirm_token.is_some()) {
        let ts = match &req.confirmed_at_utc {
            Some(raw) => parse_iso_epoch(raw)?,
            None => now_epoch(),
        };
        for action in rt.db.list_actions(&req.request_id, None).await? {
            let tool_key = PolicyEngine::canonical_tool_name(&action.tool_name);
            rt.policy
                .record_confirmation(&incident_id, &tool_key, &confirm_token, ts);
        }
    }

    let opts = ExecOpts {
        incident_id: incident_id.clone(),
        watch_condition,
        stt_confidence: req.stt_confidence,
        dry_run: req.dry_run,
        allow_high_risk: req.allow_high_risk,
        user_confirm_token: if req.user_confirmed || req.user_confirm_token.is_some() {
            Some(confirm_token)
        } else {
            None
        },
    };

    let actions = rt
        .db
        .list_actions(&req.request_id, req.action_ids.as_deref())
        .await?;
    let mut results = Vec::with_capacity(actions.len());
    for action in &actions {
        results.push(run_action(rt, &intent, action, &opts).await?);
    }

    Ok(ExecuteResponse {
        ok: true,
        request_id: req.request_id,
        incident_id,
        watch_condition: watch_condition.as_str().to_string(),
        dry_run: req.dry_run,
        results,
    })
}

/// Drive one action through policy and (maybe) dispatch. Terminal actions
/// are reported untouched; re-executing a success is a no-op.
async fn run_action(
    rt: &Arc<Runtime>,
    intent: &IntentRow,
    action: &ActionRow,
    opts: &ExecOpts,
) -> Result<ActionResult, ApiError> {
    if action.status.is_terminal() {
        let mut result = ActionResult::terminal(&action.action_id, &action.tool_name, action.status);
        result.message = Some("already finalized".to_string());
        return Ok(result);
    }

    let tool_key = PolicyEngine::canonical_tool_name(&action.tool_name);

    // Action-level gates come before the policy engine.
    if !action.mode_constraints.is_empty()
        && !action.mode_constraints.iter().any(|m| m == &intent.mode)
    {
        return deny_action(
            rt,
            intent,
            action,
            opts,
            ReasonCode::DenyModeConstraint,
            format!("mode '{}' not in action mode_constraints", intent.mode),
            None,
        )
        .await;
    }

    if action.safety_class == SafetyClass::HighRisk && !opts.allow_high_risk {
        return deny_action(
            rt,
            intent,
            action,
            opts,
            ReasonCode::DenyHighRiskNotAllowed,
            "high_risk action requires allow_high_risk=true".to_string(),
            None,
        )
        .await;
    }

    let foreground = foreground_process(rt).await;
    let decision = rt.policy.evaluate(&ActionRequest {
        incident_id: opts.incident_id.clone(),
        watch_condition: opts.watch_condition,
        tool_name: action.tool_name.clone(),
        source: "pipeline".to_string(),
        stt_confidence: opts.stt_confidence,
        foreground_process: foreground.clone(),
        now_ts: now_epoch(),
        user_confirm_token: opts.user_confirm_token.clone(),
        action_requires_confirmation: action.requires_confirmation,
    });

    emit_policy_decision(rt, intent, &opts.incident_id, &tool_key, &action.action_id, &decision)
        .await?;

    if decision.requires_confirmation {
        let confirm_by_ts = decision
            .constraints
            .get("confirm_by_ts")
            .and_then(Value::as_f64)
            .unwrap_or_else(|| now_epoch() + rt.policy.confirm_window_seconds() as f64);
        let token = rt.mint_confirmation(
            &opts.incident_id,
            &tool_key,
            opts.watch_condition,
            confirm_by_ts,
            PendingTarget::Action {
                request_id: action.request_id.clone(),
                action_id: action.action_id.clone(),
                dry_run: opts.dry_run,
                allow_high_risk: opts.allow_high_risk,
                stt_confidence: opts.stt_confidence,
            },
        );
        rt.db
            .mark_action_pending_confirmation(
                action.id,
                decision.reason_code.as_str(),
                decision.reason_text.as_deref().unwrap_or(""),
            )
            .await?;

        let expired = decision.reason_code == ReasonCode::DenyConfirmationExpired;
        let event_type = if expired {
            EVENT_CONFIRMATION_EXPIRED
        } else {
            EVENT_CONFIRMATION_REQUIRED
        };
        rt.db
            .append_event(
                NewEvent::new(
                    event_type,
                    "pipeline",
                    json!({
                        "request_id": action.request_id,
                        "action_id": action.action_id,
                        "tool_name": tool_key,
                        "incident_id": opts.incident_id,
                        "watch_condition": opts.watch_condition.as_str(),
                        "decision": decision,
                        "confirm_token": token,
                    }),
                )
                .correlation(opts.incident_id.clone())
                .incident(opts.incident_id.clone())
                .condition(opts.watch_condition)
                .severity(Severity::Warn)
                .tags(["confirm"]),
            )
            .await?;

        let mut result =
            ActionResult::terminal(&action.action_id, &action.tool_name, ActionStatus::Queued);
        result.status = "requires_confirmation".to_string();
        result.reason_code = Some(decision.reason_code);
        result.reason = decision.reason_text.clone();
        result.confirm_token = Some(token);
        result.confirm_by_ts = Some(epoch_to_iso(confirm_by_ts));
        return Ok(result);
    }

    if !decision.allowed {
        let reason_text = decision.reason_text.clone().unwrap_or_default();
        return deny_action(
            rt,
            intent,
            action,
            opts,
            decision.reason_code,
            reason_text,
            Some(&decision),
        )
        .await;
    }

    // Approved; now execute.
    rt.db.mark_action_approved(action.id).await?;
    rt.db
        .append_event(
            NewEvent::new(
                EVENT_ACTION_APPROVED,
                "pipeline",
                json!({
                    "request_id": action.request_id,
                    "action_id": action.action_id,
                    "tool_name": tool_key,
                    "incident_id": opts.incident_id,
                    "watch_condition": opts.watch_condition.as_str(),
                }),
            )
            .correlation(opts.incident_id.clone())
            .incident(opts.incident_id.clone())
            .condition(opts.watch_condition),
        )
        .await?;
    rt.db.mark_action_executing(action.id).await?;

    let outcome = if opts.dry_run {
        Outcome::success(
            utc_now_iso(),
            json!({
                "dry_run": true,
                "stub_execution": true,
                "tool_name": tool_key,
                "result": "Dry run only. No actuator call executed.",
            }),
        )
    } else {
        rt.router
            .dispatch(
                &tool_key,
                &action.parameters,
                &DispatchContext {
                    request_id: action.request_id.clone(),
                    action_id: action.action_id.clone(),
                    foreground_process: foreground,
                },
                Duration::from_millis(action.timeout_ms as u64),
            )
            .await
    };

    let status = match outcome.status {
        OutcomeStatus::Success => ActionStatus::Success,
        OutcomeStatus::Error => ActionStatus::Error,
        OutcomeStatus::Timeout => ActionStatus::Timeout,
    };
    rt.db
        .finish_action(
            action.id,
            status,
            Some(&outcome.output),
            outcome.error_code.map(|c| c.as_str()),
            outcome.error_message.as_deref(),
        )
        .await?;

    // Every terminal dispatch gets exactly one ACTION_EXECUTED; failures ride
    // in the same event type with error detail and raised severity.
    let executed_event = NewEvent::new(
        EVENT_ACTION_EXECUTED,
        "pipeline",
        json!({
            "request_id": action.request_id,
            "action_id": action.action_id,
            "tool_name": tool_key,
            "incident_id": opts.incident_id,
            "watch_condition": opts.watch_condition.as_str(),
            "status": status.as_str(),
            "dry_run": opts.dry_run,
            "output": outcome.output.clone(),
            "error_code": outcome.error_code.map(|c| c.as_str()),
            "error_message": outcome.error_message.clone(),
        }),
    )
    .correlation(opts.incident_id.clone())
    .incident(opts.incident_id.clone())
    .condition(opts.watch_condition)
    .severity(if status == ActionStatus::Success {
        Severity::Info
    } else {
        Severity::Error
    });
    rt.db.append_event(executed_event).await?;

    let mut result = ActionResult::terminal(&action.action_id, &action.tool_name, status);
    if status == ActionStatus::Success {
        result.output = Some(outcome.output);
    } else {
        result.reason_code = outcome.error_code;
        result.error = outcome.error_message;
    }
    Ok(result)
}

#[allow(clippy::too_many_arguments)]
async fn deny_action(
    rt: &Arc<Runtime>,
    _intent: &IntentRow,
    action: &ActionRow,
    opts: &ExecOpts,
    reason_code: ReasonCode,
    reason_text: String,
    decision: Option<&Decision>,
) -> Result<ActionResult, ApiError> {
    rt.db
        .mark_action_denied(action.id, reason_code.as_str(), &reason_text)
        .await?;
    rt.db
        .append_event(
            NewEvent::new(
                EVENT_ACTION_DENIED,
                "pipeline",
                json!({
                    "request_id": action.request_id,
                    "action_id": action.action_id,
                    "tool_name": action.tool_name,
                    "incident_id": opts.incident_id,
                    "watch_condition": opts.watch_condition.as_str(),
                    "reason_code": reason_code.as_str(),
                    "reason": reason_text,
                    "decision": decision,
                }),
            )
            .correlation(opts.incident_id.clone())
            .incident(opts.incident_id.clone())
            .condition(opts.watch_condition)
            .severity(Severity::Warn),
        )
        .await?;

    let mut result = ActionResult::terminal(&action.action_id, &action.tool_name, ActionStatus::Denied);
    result.reason_code = Some(reason_code);
    result.reason = Some(reason_text);
    Ok(result)
}

async fn emit_policy_decision(
    rt: &Arc<Runtime>,
    intent: &IntentRow,
    incident_id: &str,
    tool_key: &str,
    action_id: &str,
    decision: &Decision,
) -> Result<(), ApiError> {
    let severity = if decision.allowed { Severity::Info } else { Severity::Warn };
    rt.db
        .append_event(
            NewEvent::new(
                EVENT_POLICY_DECISION,
                "pipeline",
                json!({
                    "incident_id": incident_id,
                    "request_id": intent.request_id,
                    "action_id": action_id,
                    "tool_name": tool_key,
                    "decision": decision,
                }),
            )
            .correlation(incident_id.to_string())
            .incident(incident_id.to_string())
            .severity(severity)
            .tags(["policy", "standing_orders"]),
        )
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Confirm
// ---------------------------------------------------------------------------

pub async fn handle_confirm(rt: &Arc<Runtime>, req: ConfirmRequest) -> Result<Value, ApiError> {
    let token = req.confirm_token.trim();
    let incident_id = req.incident_id.trim();
    if token.is_empty() || incident_id.is_empty() {
        return Err(ApiError::validation("incident_id and confirm_token are required"));
    }

    let Some(pending) = rt.take_confirmation_for(token, incident_id) else {
        return Ok(json!({
            "ok": false,
            "reason_code": ReasonCode::ConfirmTokenUnknown.as_str(),
            "error": "confirm token unknown or already used",
        }));
    };

    let now = now_epoch();
    if now > pending.confirm_by_ts {
        return Ok(json!({
            "ok": false,
            "reason_code": ReasonCode::ConfirmExpired.as_str(),
            "error": format!(
                "confirm token expired at {}",
                epoch_to_iso(pending.confirm_by_ts)
            ),
        }));
    }

    rt.policy
        .record_confirmation(incident_id, &pending.tool_key, token, now);
    rt.db
        .append_event(
            NewEvent::new(
                EVENT_USER_CONFIRMATION_RECORDED,
                "pipeline",
                json!({
                    "incident_id": incident_id,
                    "tool_name": pending.tool_key,
                    "confirm_token": token,
                }),
            )
            .correlation(incident_id.to_string())
            .incident(incident_id.to_string())
            .tags(["confirm"]),
        )
        .await?;

    let lock = rt.incident_lock(incident_id);
    let _guard = lock.lock().await;

    let result = match &pending.target {
        PendingTarget::Action {
            request_id,
            action_id,
            dry_run,
            allow_high_risk,
            stt_confidence,
        } => {
            let intent = rt
                .db
                .get_intent(request_id)
                .await?
                .ok_or_else(|| ApiError::validation(format!("request_id not found: {request_id}")))?;
            let action = rt
                .db
                .get_action(request_id, action_id)
                .await?
                .ok_or_else(|| ApiError::validation(format!("action not found: {action_id}")))?;
            let opts = ExecOpts {
                incident_id: incident_id.to_string(),
                watch_condition: pending.watch_condition,
                stt_confidence: *stt_confidence,
                dry_run: *dry_run,
                allow_high_risk: *allow_high_risk,
                user_confirm_token: Some(token.to_string()),
            };
            let outcome = run_action(rt, &intent, &action, &opts).await?;
            serde_json::to_value(outcome)?
        }
        PendingTarget::Direct { parameters } => {
            let outcome = rt
                .router
                .dispatch(
                    &pending.tool_key,
                    parameters,
                    &DispatchContext {
                        request_id: incident_id.to_string(),
                        action_id: "direct".to_string(),
                        foreground_process: foreground_process(rt).await,
                    },
                    Duration::from_secs(5),
                )
                .await;
            json!({
                "tool_name": pending.tool_key,
                "status": outcome.status.as_str(),
                "output": outcome.output,
                "error": outcome.error_message,
            })
        }
    };

    rt.db
        .append_event(
            NewEvent::new(
                EVENT_CONFIRM_ACCEPTED,
                "pipeline",
                json!({
                    "incident_id": incident_id,
                    "tool_name": pending.tool_key,
                    "confirm_token": token,
                    "result": result,
                }),
            )
            .correlation(incident_id.to_string())
            .incident(incident_id.to_string())
            .tags(["confirm", "accepted"]),
        )
        .await?;

    Ok(json!({
        "ok": true,
        "incident_id": incident_id,
        "tool_name": pending.tool_key,
        "result": result,
    }))
}

// ---------------------------------------------------------------------------
// Feedback
// ---------------------------------------------------------------------------

pub async fn handle_feedback(rt: &Arc<Runtime>, req: FeedbackRequest) -> Result<Value, ApiError> {
    if req.rating != 1 && req.rating != -1 {
        return Err(ApiError::validation("rating must be -1 or 1"));
    }
    let reviewer = req.reviewer.as_deref().unwrap_or("user");
    let feedback_id = rt
        .db
        .record_feedback(
            req.request_id.trim(),
            req.rating,
            req.correction_text.as_deref(),
            reviewer,
        )
        .await
        .map_err(|err| match err {
            watchkeeper_db::DbError::NotFound(msg) => ApiError::validation(msg),
            other => ApiError::from(other),
        })?;

    rt.db
        .append_event(
            NewEvent::new(
                EVENT_USER_FEEDBACK,
                "pipeline",
                json!({
                    "request_id": req.request_id,
                    "feedback_id": feedback_id,
                    "rating": req.rating,
                    "has_correction": req.correction_text.is_some(),
                    "reviewer": reviewer,
                }),
            )
            .correlation(req.request_id.clone()),
        )
        .await?;

    Ok(json!({
        "ok": true,
        "feedback_id": feedback_id,
        "request_id": req.request_id,
        "rating": req.rating,
    }))
}

// ---------------------------------------------------------------------------
// Policy-gated direct tools
// ---------------------------------------------------------------------------

/// `POST /twitch/send_chat`: gate the chat bridge behind policy, honoring
/// the confirmation flow.
pub async fn handle_send_chat(rt: &Arc<Runtime>, req: SendChatRequest) -> Result<Value, ApiError> {
    if req.message.trim().is_empty() {
        return Err(ApiError::validation("message must be a non-empty string"));
    }
    let incident_id = req
        .incident_id
        .clone()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| format!("inc-{}", Uuid::new_v4().simple()));

    let entry = rt.db.get_state(WATCH_CONDITION_KEY).await?;
    let watch_condition = entry
        .and_then(|e| e.state_value.as_str().and_then(|s| s.parse().ok()))
        .unwrap_or(WatchCondition::Standby);

    let tool_key = "twitch.send_chat";
    let decision = rt.policy.evaluate(&ActionRequest {
        incident_id: incident_id.clone(),
        watch_condition,
        tool_name: tool_key.to_string(),
        source: "http".to_string(),
        stt_confidence: None,
        foreground_process: foreground_process(rt).await,
        now_ts: now_epoch(),
        user_confirm_token: req.user_confirm_token.clone(),
        action_requires_confirmation: false,
    });

    rt.db
        .append_event(
            NewEvent::new(
                EVENT_POLICY_DECISION,
                "http",
                json!({
                    "incident_id": incident_id,
                    "tool_name": tool_key,
                    "decision": decision,
                }),
            )
            .correlation(incident_id.clone())
            .incident(incident_id.clone())
            .severity(if decision.allowed { Severity::Info } else { Severity::Warn })
            .tags(["policy", "standing_orders"]),
        )
        .await?;

    if decision.requires_confirmation {
        let confirm_by_ts = decision
            .constraints
            .get("confirm_by_ts")
            .and_then(Value::as_f64)
            .unwrap_or_else(|| now_epoch() + rt.policy.confirm_window_seconds() as f64);
        let token = rt.mint_confirmation(
            &incident_id,
            tool_key,
            watch_condition,
            confirm_by_ts,
            PendingTarget::Direct {
                parameters: json!({"message": req.message}),
            },
        );
        return Ok(json!({
            "ok": true,
            "incident_id": incident_id,
            "status": "requires_confirmation",
            "reason_code": decision.reason_code.as_str(),
            "confirm_token": token,
            "confirm_by_ts": epoch_to_iso(confirm_by_ts),
        }));
    }

    if !decision.allowed {
        return Ok(json!({
            "ok": true,
            "incident_id": incident_id,
            "status": "denied",
            "reason_code": decision.reason_code.as_str(),
            "reason": decision.reason_text,
        }));
    }

    let outcome = rt
        .router
        .dispatch(
            tool_key,
            &json!({"message": req.message}),
            &DispatchContext {
                request_id: incident_id.clone(),
                action_id: "send_chat".to_string(),
                foreground_process: None,
            },
            Duration::from_secs(5),
        )
        .await;

    Ok(json!({
        "ok": outcome.status == OutcomeStatus::Success,
        "incident_id": incident_id,
        "status": outcome.status.as_str(),
        "output": outcome.output,
        "error": outcome.error_message,
    }))
}

/// `POST /app/open`: best-effort launch of a configured app. The call rides
/// the tool router like every other low-risk tool, so the actuator
/// kill-switch covers it.
pub async fn handle_app_open(rt: &Arc<Runtime>, app_id: &str) -> Result<Value, ApiError> {
    let app_id = app_id.trim();
    if app_id.is_empty() {
        return Err(ApiError::validation("app_id must be a non-empty string"));
    }

    let outcome = rt
        .router
        .dispatch(
            "app.open",
            &json!({"app_id": app_id}),
            &DispatchContext {
                request_id: format!("app-open-{}", Uuid::new_v4().simple()),
                action_id: "app_open".to_string(),
                foreground_process: None,
            },
            Duration::from_secs(5),
        )
        .await;

    rt.db
        .append_event(NewEvent::new(
            EVENT_APP_OPEN,
            "http",
            json!({
                "app_id": app_id,
                "status": outcome.status.as_str(),
                "reason_code": outcome.error_code.map(|c| c.as_str()),
                "error": outcome.error_message,
            }),
        ))
        .await?;

    Ok(json!({
        "ok": outcome.status == OutcomeStatus::Success,
        "app_id": app_id,
        "status": outcome.status.as_str(),
        "reason_code": outcome.error_code.map(|c| c.as_str()),
        "output": outcome.output,
        "error": outcome.error_message,
    }))
}
