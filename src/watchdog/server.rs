//! HTTP surface of the edge watchdog.

use crate::server::error::{ApiError, ApiJson, ApiResult};
use crate::types::{GatewayIncident, HeartbeatData};
use crate::watchdog::{EdgeWatchdog, GatewayHealth, GatewayStatus, RelayRequest};
use axum::body::{Body, Bytes};
use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub fn router(watchdog: Arc<EdgeWatchdog>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/heartbeat/:gateway", post(heartbeat))
        .route("/gateway/:gateway/incident", post(incident))
        .route("/watchdog/status", get(status))
        .route("/relay/:gateway/*path", any(relay))
        .with_state(watchdog)
}

/// Serve the watchdog on `listener` until `cancel` fires.
pub async fn serve(
    watchdog: Arc<EdgeWatchdog>,
    listener: TcpListener,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let app = router(watchdog);
    info!("Watchdog listening on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "service": "zeptoclaw-watchdog" }))
}

async fn heartbeat(
    State(watchdog): State<Arc<EdgeWatchdog>>,
    Path(gateway): Path<String>,
    ApiJson(heartbeat): ApiJson<HeartbeatData>,
) -> ApiResult<Json<GatewayHealth>> {
    let health = watchdog
        .record_heartbeat(&gateway, heartbeat, Utc::now())
        .await?;
    Ok(Json(health))
}

async fn incident(
    State(watchdog): State<Arc<EdgeWatchdog>>,
    Path(gateway): Path<String>,
    ApiJson(incident): ApiJson<GatewayIncident>,
) -> ApiResult<Json<GatewayHealth>> {
    let health = watchdog
        .report_incident(&gateway, &incident, Utc::now())
        .await?;
    Ok(Json(health))
}

async fn status(State(watchdog): State<Arc<EdgeWatchdog>>) -> Json<Vec<GatewayStatus>> {
    Json(watchdog.status(Utc::now()).await)
}

async fn relay(
    State(watchdog): State<Arc<EdgeWatchdog>>,
    Path((gateway, path)): Path<(String, String)>,
    method: Method,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let req = RelayRequest {
        method,
        path,
        query,
        headers: headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect(),
        body: body.to_vec(),
    };

    let resp = watchdog.relay(&gateway, &req).await?;

    let status = StatusCode::from_u16(resp.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    if let Some(content_type) = &resp.content_type {
        builder = builder.header(axum::http::header::CONTENT_TYPE, content_type);
    }
    builder.body(Body::from(resp.body)).map_err(|err| {
        ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal",
            format!("building relay response: {err}"),
        )
    })
}
