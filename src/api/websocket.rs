use crate::server::ManagerHandle;
use crate::subscription::protocol::{
    self, ControlMessage, ProtocolError, CLIENT_SUBPROTOCOL, CONTROL_SUBPROTOCOL,
};
use crate::subscription::{ConnectionId, ConnectionRegistry, Outgoing};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, Request, State,
    },
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::health::health_handler;

/// Query parameters for WebSocket upgrade
#[derive(Deserialize)]
struct WsQuery {
    token: Option<String>,
}

/// Shared application state for the WebSocket routes
#[derive(Clone)]
pub struct WsAppState {
    pub manager: ManagerHandle,
    pub registry: Arc<ConnectionRegistry>,
    /// Required on control connections when set
    pub control_token: Option<String>,
}

/// Which side of the protocol a socket speaks, fixed at the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Control,
}

impl Role {
    /// Role from the negotiated sub-protocol. No sub-protocol means client.
    pub fn from_protocol(protocol: Option<&str>) -> Self {
        match protocol {
            Some(CONTROL_SUBPROTOCOL) => Role::Control,
            _ => Role::Client,
        }
    }
}

/// True when the upgrade request will be negotiated as a control connection.
fn requests_control(headers: &HeaderMap) -> bool {
    let offered: Vec<&str> = headers
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .collect();

    offered.contains(&CONTROL_SUBPROTOCOL) && !offered.contains(&CLIENT_SUBPROTOCOL)
}

/// Auth middleware: control connections must carry ?token= when a control
/// token is configured. Client connections pass through.
///
/// Runs as a tower layer BEFORE WebSocket upgrade extraction so 401 can be
/// returned cleanly without requiring a valid upgrade request in tests.
async fn control_auth(
    State(state): State<Arc<WsAppState>>,
    Query(params): Query<WsQuery>,
    req: Request,
    next: Next,
) -> Response {
    if let Some(expected) = &state.control_token {
        if requests_control(req.headers()) && params.token.as_deref() != Some(expected.as_str()) {
            warn!("Control connection rejected: bad or missing token");
            return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
        }
    }
    next.run(req).await
}

/// WebSocket upgrade handler (auth handled by control_auth middleware)
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<WsAppState>>) -> Response {
    debug!("WebSocket upgrade request received");
    ws.protocols([CLIENT_SUBPROTOCOL, CONTROL_SUBPROTOCOL])
        .on_upgrade(|socket| handle_socket(socket, state))
}

/// Create the WebSocket router. `/health` sits outside the auth layer.
pub fn create_ws_router(state: Arc<WsAppState>, path: &str) -> Router {
    Router::new()
        .route(path, get(ws_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), control_auth))
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn handle_socket(socket: WebSocket, state: Arc<WsAppState>) {
    let protocol = socket.protocol().and_then(|value| value.to_str().ok());
    match Role::from_protocol(protocol) {
        Role::Client => handle_client(socket, state).await,
        Role::Control => handle_control(socket, state).await,
    }
}

/// Subscriber connection: frames go to the manager, the manager's outgoing
/// queue goes back to the socket.
async fn handle_client(mut socket: WebSocket, state: Arc<WsAppState>) {
    let connection = ConnectionId::new();
    let (outbound, mut outgoing) = mpsc::unbounded_channel();

    if state.manager.open(connection, outbound).await.is_err() {
        error!(connection = %connection, "Subscription manager unavailable, dropping connection");
        return;
    }
    info!(connection = %connection, "WebSocket connection established");

    loop {
        tokio::select! {
            // Handle incoming client messages
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if state.manager.frame(connection, text).await.is_err() {
                            error!(connection = %connection, "Subscription manager stopped");
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(connection = %connection, "WebSocket client disconnected");
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = socket.send(Message::Pong(data)).await {
                            error!(connection = %connection, error = %e, "Failed to send pong");
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!(connection = %connection, error = %ProtocolError::Binary, "Dropping client frame");
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Err(e)) => {
                        warn!(connection = %connection, error = %e, "WebSocket error");
                        break;
                    }
                }
            }

            // Handle frames queued by the manager
            queued = outgoing.recv() => {
                match queued {
                    Some(Outgoing::Frame(message)) => {
                        let text = match protocol::encode(&message) {
                            Ok(text) => text,
                            Err(e) => {
                                error!(connection = %connection, error = %e, "Failed to encode frame");
                                continue;
                            }
                        };
                        if let Err(e) = socket.send(Message::Text(text)).await {
                            warn!(connection = %connection, error = %e, "Failed to send frame");
                            break;
                        }
                    }
                    Some(Outgoing::Close) => {
                        let _ = socket.send(Message::Close(None)).await;
                        break;
                    }
                    None => {
                        error!(connection = %connection, "Outgoing queue closed");
                        break;
                    }
                }
            }
        }
    }

    // Cancels every subscription the connection owned
    let _ = state.manager.close(connection).await;
    info!(connection = %connection, "WebSocket connection closed");
}

/// Publisher connection: each `subscription_data` frame is an event.
async fn handle_control(mut socket: WebSocket, state: Arc<WsAppState>) {
    info!("Control connection established");

    while let Some(incoming) = socket.recv().await {
        match incoming {
            Ok(Message::Text(text)) => match protocol::parse_control_frame(&text) {
                Ok(ControlMessage::Publish {
                    subscription,
                    payload,
                }) => {
                    debug!(subscription = %subscription, "Event received");
                    if state.manager.publish(subscription, payload).await.is_err() {
                        error!("Subscription manager stopped");
                        break;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "Dropping invalid control frame");
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(data)) => {
                if let Err(e) = socket.send(Message::Pong(data)).await {
                    error!(error = %e, "Failed to send pong");
                    break;
                }
            }
            Ok(_) => {
                // Ignore binary, pong messages
            }
            Err(e) => {
                warn!(error = %e, "WebSocket error");
                break;
            }
        }
    }

    info!("Control connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_role_from_protocol() {
        assert_eq!(Role::from_protocol(None), Role::Client);
        assert_eq!(Role::from_protocol(Some("graphql-ws")), Role::Client);
        assert_eq!(Role::from_protocol(Some("graphql-subscriptions")), Role::Control);
        assert_eq!(Role::from_protocol(Some("something-else")), Role::Client);
    }

    #[test]
    fn test_requests_control() {
        let mut headers = HeaderMap::new();
        assert!(!requests_control(&headers));

        headers.insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static("graphql-subscriptions"),
        );
        assert!(requests_control(&headers));

        // Client protocol wins negotiation when both are offered
        headers.insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static("graphql-ws, graphql-subscriptions"),
        );
        assert!(!requests_control(&headers));
    }
}
