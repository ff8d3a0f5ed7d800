//! Gateway route handlers. Authentication and scope checks have already
//! run in the middleware.

use crate::agent::SkillRegistry;
use crate::autonomous::ActionReport;
use crate::config::{save_config, ConfigPatch, ZeptoClawConfig};
use crate::error::{GatewayError, GatewayResult};
use crate::logs::LogEntry;
use crate::server::error::{ApiJson, ApiResult};
use crate::server::AppState;
use crate::state::DerivedHealth;
use crate::types::*;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

const DEFAULT_LOG_LIMIT: usize = 100;

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "service": "zeptoclaw" }))
}

pub async fn status(State(app): State<AppState>) -> Json<serde_json::Value> {
    let now = Utc::now();
    let snapshot = app.state.snapshot().await;
    let autonomous_enabled = app.config.read().await.autonomous.enabled;
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "startedAt": app.started_at,
        "uptimeSeconds": (now - app.started_at).num_seconds(),
        "sessions": app.sessions.len(),
        "websocketClients": app.events.receiver_count(),
        "autonomousEnabled": autonomous_enabled,
        "agentConfigured": app.invoker.is_some(),
        "totalRequests": snapshot.total_requests,
        "totalErrors": snapshot.total_errors,
        "lastError": snapshot.last_error,
        "health": crate::state::store::derive_health(&snapshot, now),
    }))
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

pub async fn list_sessions(State(app): State<AppState>) -> Json<Vec<Session>> {
    Json(app.sessions.list())
}

pub async fn create_session(State(app): State<AppState>) -> ApiResult<Json<Session>> {
    let session = app.record_failure(app.sessions.create().await).await?;
    app.publish("session.created", json!(session));
    Ok(Json(session))
}

#[derive(Debug, Deserialize)]
pub struct MessageBody {
    pub prompt: String,
}

#[derive(Debug, Serialize)]
pub struct MessageReply {
    pub session: Session,
    pub reply: String,
}

/// One turn: count it, then answer through a skill or the agent.
pub async fn session_message(
    State(app): State<AppState>,
    Path(id): Path<String>,
    ApiJson(body): ApiJson<MessageBody>,
) -> ApiResult<Json<MessageReply>> {
    if body.prompt.trim().is_empty() {
        return Err(GatewayError::InvalidInput("prompt must not be empty".into()).into());
    }

    let session = app.record_failure(app.sessions.touch(&id).await).await?;

    let reply = if SkillRegistry::parse(&body.prompt).is_some() {
        app.skills.dispatch(&body.prompt, &session).await?
    } else {
        let result = match &app.invoker {
            Some(invoker) => invoker
                .invoke(&body.prompt)
                .await
                .map_err(|err| GatewayError::Upstream(format!("agent invocation failed: {err:#}"))),
            None => Err(GatewayError::Upstream("agent invocation not configured".into())),
        };
        app.record_failure(result).await?
    };

    app.publish(
        "session.message",
        json!({ "id": session.id, "messageCount": session.message_count }),
    );
    Ok(Json(MessageReply { session, reply }))
}

pub async fn terminate_session(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    if !app.record_failure(app.sessions.terminate(&id).await).await? {
        return Err(GatewayError::NotFound(format!("session '{id}'")).into());
    }
    app.publish("session.terminated", json!({ "id": id }));
    Ok(Json(json!({ "terminated": id })))
}

// ---------------------------------------------------------------------------
// Config and logs
// ---------------------------------------------------------------------------

pub async fn get_config(State(app): State<AppState>) -> Json<ZeptoClawConfig> {
    Json(app.config.read().await.redacted())
}

/// Validate, save, then apply a runtime patch. The file is written before
/// the in-memory config changes.
pub async fn update_config(
    State(app): State<AppState>,
    ApiJson(patch): ApiJson<ConfigPatch>,
) -> ApiResult<Json<ZeptoClawConfig>> {
    let mut config = app.config.write().await;
    let mut next = config.clone();
    patch.apply(&mut next)?;

    let saved = save_config(&next, &app.config_path)
        .map_err(|err| GatewayError::persistence(format!("{err:#}")));
    app.record_failure(saved).await?;

    app.sessions.set_max_messages(next.sessions.max_messages);
    *config = next;
    info!("Config updated: {:?}", patch);
    app.publish("config.updated", json!(patch));
    Ok(Json(config.redacted()))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub limit: Option<usize>,
}

pub async fn logs(State(app): State<AppState>, Query(query): Query<LogsQuery>) -> Json<Vec<LogEntry>> {
    Json(app.logs.recent(query.limit.unwrap_or(DEFAULT_LOG_LIMIT)))
}

// ---------------------------------------------------------------------------
// Autonomous
// ---------------------------------------------------------------------------

fn announce(app: &AppState, report: GatewayResult<ActionReport>) -> ApiResult<Json<ActionReport>> {
    let report = report?;
    app.publish("autonomous.action", json!(report));
    Ok(Json(report))
}

pub async fn autonomous_run(State(app): State<AppState>) -> ApiResult<Json<ActionReport>> {
    announce(&app, app.autonomous.run().await)
}

pub async fn autonomous_browse(State(app): State<AppState>) -> ApiResult<Json<ActionReport>> {
    announce(&app, app.autonomous.browse().await)
}

#[derive(Debug, Default, Deserialize)]
pub struct SearchBody {
    pub query: Option<String>,
}

/// The body is optional; without one the next configured topic is used.
pub async fn autonomous_search(State(app): State<AppState>, body: Bytes) -> ApiResult<Json<ActionReport>> {
    let body: SearchBody = if body.iter().all(u8::is_ascii_whitespace) {
        SearchBody::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|err| GatewayError::InvalidInput(format!("malformed request body: {err}")))?
    };
    announce(&app, app.autonomous.search(body.query).await)
}

pub async fn autonomous_post(State(app): State<AppState>) -> ApiResult<Json<ActionReport>> {
    announce(&app, app.autonomous.post().await)
}

#[derive(Debug, Deserialize)]
pub struct IdeaBody {
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub priority: Option<IdeaPriority>,
}

pub async fn autonomous_idea(
    State(app): State<AppState>,
    ApiJson(body): ApiJson<IdeaBody>,
) -> ApiResult<Json<PostIdea>> {
    let idea = app
        .autonomous
        .enqueue_idea(&body.title, body.body, body.priority.unwrap_or_default())
        .await?;
    app.publish("idea.enqueued", json!(idea));
    Ok(Json(idea))
}

pub async fn discoveries(State(app): State<AppState>) -> Json<Vec<Discovery>> {
    Json(app.autonomous.discoveries().await)
}

pub async fn clear_discoveries(State(app): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let cleared = app.autonomous.clear_discoveries().await?;
    app.publish("discoveries.cleared", json!({ "cleared": cleared }));
    Ok(Json(json!({ "cleared": cleared })))
}

// ---------------------------------------------------------------------------
// Heartbeats, state and incidents
// ---------------------------------------------------------------------------

pub async fn heartbeat(
    State(app): State<AppState>,
    ApiJson(heartbeat): ApiJson<HeartbeatData>,
) -> ApiResult<Json<serde_json::Value>> {
    app.state.record_heartbeat(heartbeat.clone()).await?;
    app.publish("heartbeat", json!(heartbeat));
    Ok(Json(json!({ "ok": true, "localLastSeen": heartbeat.timestamp })))
}

#[derive(Debug, Serialize)]
pub struct StateView {
    #[serde(flatten)]
    pub state: ZeptoClawState,
    pub health: DerivedHealth,
}

pub async fn full_state(State(app): State<AppState>) -> Json<StateView> {
    let state = app.state.snapshot().await;
    let health = crate::state::store::derive_health(&state, Utc::now());
    Json(StateView { state, health })
}

pub async fn report_incident(
    State(app): State<AppState>,
    ApiJson(incident): ApiJson<GatewayIncident>,
) -> ApiResult<Json<GatewayIncident>> {
    let incident = app.state.record_incident(incident).await?;
    if incident.kind == IncidentType::Crash {
        warn!("Crash reported: {}", incident.error.as_deref().unwrap_or("no details"));
    }
    app.publish("incident", json!(incident));
    Ok(Json(incident))
}

pub async fn incidents(State(app): State<AppState>) -> Json<Vec<GatewayIncident>> {
    Json(app.state.incidents().await)
}
