//! WebSocket push channel. Clients receive gateway events; anything they
//! send is ignored.

use crate::server::AppState;
use crate::types::{GatewayEvent, Scope};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::Extension;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

pub async fn upgrade(
    ws: WebSocketUpgrade,
    State(app): State<AppState>,
    Extension(scope): Extension<Scope>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, app, scope))
}

async fn handle_socket(mut socket: WebSocket, app: AppState, scope: Scope) {
    let mut events = app.events.subscribe();
    debug!("WebSocket client connected ({scope})");

    let hello = GatewayEvent::new(
        "hello",
        json!({ "scope": scope, "version": env!("CARGO_PKG_VERSION") }),
    );
    if send_event(&mut socket, &hello).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if send_event(&mut socket, &event).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("WebSocket client lagged, skipped {skipped} events");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }

    debug!("WebSocket client disconnected ({scope})");
}

async fn send_event(socket: &mut WebSocket, event: &GatewayEvent) -> Result<(), axum::Error> {
    let text = serde_json::to_string(event).unwrap_or_default();
    socket.send(Message::Text(text)).await
}
