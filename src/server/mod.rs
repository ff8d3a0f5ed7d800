//! Gateway HTTP/WebSocket API.

pub mod error;
pub mod handlers;
pub mod ws;

use crate::agent::{invoker_from_config, AgentInvoker, SkillRegistry};
use crate::auth::{bearer_token, fingerprint, TokenAuth};
use crate::autonomous::{AutonomousAgent, AutonomousSettings};
use crate::config::ZeptoClawConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::logs::LogBuffer;
use crate::ratelimit::RateLimiter;
use crate::server::error::ApiError;
use crate::sessions::SessionStore;
use crate::social::{SocialClient, SocialPlatform};
use crate::state::StateStore;
use crate::types::{GatewayEvent, Scope};
use anyhow::Result;
use axum::extract::{MatchedPath, Request, State};
use axum::http::Method;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Capacity of the WebSocket event channel. Slower clients skip events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Everything the handlers and the heartbeat daemon share.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RwLock<ZeptoClawConfig>>,
    pub config_path: PathBuf,
    pub auth: TokenAuth,
    pub sessions: Arc<SessionStore>,
    pub state: Arc<StateStore>,
    pub autonomous: Arc<AutonomousAgent>,
    pub invoker: Option<Arc<dyn AgentInvoker>>,
    pub skills: Arc<SkillRegistry>,
    pub logs: LogBuffer,
    pub events: broadcast::Sender<GatewayEvent>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Open the stores under the configured state directory and wire up the
    /// collaborators. Fails if another process owns the state.
    pub async fn open(config: ZeptoClawConfig, config_path: PathBuf, logs: LogBuffer) -> Result<Self> {
        let state_dir = config.resolved_state_dir();
        let state = Arc::new(StateStore::open(&state_dir, config.retention)?);
        let sessions = Arc::new(SessionStore::open(&state_dir, config.sessions.max_messages)?);
        let social: Arc<dyn SocialPlatform> = Arc::new(SocialClient::new(
            &config.autonomous.api_url,
            &config.autonomous.api_key,
        ));
        let invoker = invoker_from_config(&config.agent, &config.resolved_workspace_dir());
        Ok(Self::assemble(config, config_path, logs, state, sessions, social, invoker).await)
    }

    /// Wire already-open stores and collaborators together.
    pub async fn assemble(
        config: ZeptoClawConfig,
        config_path: PathBuf,
        logs: LogBuffer,
        state: Arc<StateStore>,
        sessions: Arc<SessionStore>,
        social: Arc<dyn SocialPlatform>,
        invoker: Option<Arc<dyn AgentInvoker>>,
    ) -> Self {
        let autonomous = AutonomousAgent::new(
            social,
            invoker.clone(),
            state.clone(),
            RateLimiter::from_config(&config.autonomous),
            AutonomousSettings::from_config(&config.autonomous, &config.retention),
        )
        .await;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            auth: TokenAuth::from_config(&config.gateway),
            config: Arc::new(RwLock::new(config)),
            config_path,
            sessions,
            state,
            autonomous: Arc::new(autonomous),
            invoker,
            skills: Arc::new(SkillRegistry::with_builtins()),
            logs,
            events,
            started_at: Utc::now(),
        }
    }

    /// Push an event to WebSocket subscribers, if any.
    pub fn publish(&self, kind: &str, payload: serde_json::Value) {
        // No subscribers is not an error.
        let _ = self.events.send(GatewayEvent::new(kind, payload));
    }

    /// Record a failure the caller observed before it turns into a
    /// response. Persistence failures from StateStore are already counted.
    pub async fn record_failure<T>(&self, result: GatewayResult<T>) -> GatewayResult<T> {
        if let Err(err @ (GatewayError::Persistence(_) | GatewayError::Upstream(_))) = &result {
            self.state.record_error(&err.to_string()).await;
        }
        result
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(handlers::status))
        .route("/sessions", get(handlers::list_sessions).post(handlers::create_session))
        .route("/sessions/:id/message", post(handlers::session_message))
        .route("/sessions/:id/terminate", post(handlers::terminate_session))
        .route("/config", get(handlers::get_config).post(handlers::update_config))
        .route("/logs", get(handlers::logs))
        .route("/ws", get(ws::upgrade))
        .route("/autonomous/run", post(handlers::autonomous_run))
        .route("/autonomous/browse", post(handlers::autonomous_browse))
        .route("/autonomous/search", post(handlers::autonomous_search))
        .route("/autonomous/post", post(handlers::autonomous_post))
        .route("/autonomous/idea", post(handlers::autonomous_idea))
        .route("/discoveries", get(handlers::discoveries))
        .route("/discoveries/clear", post(handlers::clear_discoveries))
        .route("/heartbeat", post(handlers::heartbeat))
        .route("/state", get(handlers::full_state))
        .route("/gateway/incident", post(handlers::report_incident))
        .route("/gateway/incidents", get(handlers::incidents))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .route("/health", get(handlers::health))
        .with_state(state)
}

/// Serve the gateway on `listener` until `cancel` fires.
pub async fn serve(state: AppState, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
    let app = router(state);
    info!("Gateway listening on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

/// Authenticate, check scope and count the request before any handler
/// runs.
async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    state.state.count_request();

    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());

    let header_token = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token);
    let query_token = (path == "/ws")
        .then(|| req.uri().query().and_then(token_from_query))
        .flatten();

    let presented = header_token.or(query_token);
    let scope = state.auth.validate(presented)?;

    if scope == Scope::Workspace && !workspace_allowed(req.method(), &path) {
        debug!(
            "Workspace token {} refused for {} {}",
            presented.map(fingerprint).unwrap_or_default(),
            req.method(),
            path
        );
        return Err(GatewayError::Forbidden(format!("{} {}", req.method(), path)).into());
    }

    req.extensions_mut().insert(scope);
    Ok(next.run(req).await)
}

fn token_from_query(query: &str) -> Option<&str> {
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
        .filter(|t| !t.is_empty())
}

/// Routes a workspace token may reach. Admin reaches everything.
fn workspace_allowed(method: &Method, path: &str) -> bool {
    match path {
        "/sessions" => method == Method::POST,
        "/sessions/:id/message" => true,
        "/discoveries" | "/discoveries/clear" => true,
        "/heartbeat" | "/gateway/incident" | "/ws" => true,
        p => p.starts_with("/autonomous/"),
    }
}
