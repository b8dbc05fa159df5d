//! WebSocket endpoint for realtime clients
//!
//! `GET /ws?token=...` authenticates the token before upgrading, so a
//! rejected client never reaches the hub. The token may also be sent as an
//! `Authorization: Bearer` header.

use crate::auth::Authenticator;
use crate::dispatch::MessageDispatcher;
use crate::hub::registry::ConnectionHub;
use crate::hub::session::serve_socket;
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocketUpgrade},
        Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Realtime server configuration
#[derive(Debug, Clone)]
pub struct RealtimeServerConfig {
    pub port: u16,
    pub host: String,
    /// Interval between keepalive pings on each connection
    pub keepalive: Duration,
}

impl Default for RealtimeServerConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            host: "0.0.0.0".to_string(),
            keepalive: Duration::from_secs(30),
        }
    }
}

/// Shared state for the socket endpoint
#[derive(Clone)]
pub struct RealtimeState {
    pub hub: Arc<ConnectionHub>,
    pub dispatcher: Arc<MessageDispatcher>,
    pub authenticator: Arc<dyn Authenticator>,
    pub keepalive: Duration,
}

#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    #[serde(default)]
    pub token: Option<String>,
}

/// Build the realtime router
pub fn router(state: RealtimeState) -> Router {
    Router::new()
        .route("/ws", get(socket_handler))
        .with_state(state)
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string())
}

async fn socket_handler(
    State(state): State<RealtimeState>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
    upgrade: std::result::Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Some(token) = params.token.or_else(|| bearer_token(&headers)) else {
        return (StatusCode::UNAUTHORIZED, "missing token").into_response();
    };

    let principal = match state.authenticator.authenticate(&token).await {
        Ok(Some(principal)) => principal,
        Ok(None) => {
            debug!("Rejected socket upgrade with unknown token");
            return (StatusCode::UNAUTHORIZED, "invalid token").into_response();
        }
        Err(e) => {
            error!("Authentication backend failed: {}", e);
            return (StatusCode::SERVICE_UNAVAILABLE, "authentication unavailable")
                .into_response();
        }
    };

    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    info!(
        "Upgrading socket for {} {}",
        principal.kind, principal.user_id
    );
    let RealtimeState {
        hub,
        dispatcher,
        keepalive,
        ..
    } = state;
    upgrade.on_upgrade(move |socket| async move {
        let user_id = principal.user_id.clone();
        if let Err(e) = serve_socket(socket, principal, hub, dispatcher, keepalive).await {
            warn!("Socket session for user {} failed: {}", user_id, e);
        }
    })
}

/// HTTP server hosting the realtime endpoint
pub struct RealtimeServer {
    config: RealtimeServerConfig,
    state: RealtimeState,
    shutdown_tx: watch::Sender<bool>,
}

impl RealtimeServer {
    pub fn new(config: RealtimeServerConfig, state: RealtimeState) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            state,
            shutdown_tx,
        }
    }

    /// Serve until [`RealtimeServer::stop`] is called
    pub async fn start(&self) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .context("Invalid realtime server address")?;

        let listener = TcpListener::bind(addr).await?;
        info!("Realtime endpoint listening on ws://{}/ws", addr);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        axum::serve(listener, router(self.state.clone()))
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.wait_for(|stopped| *stopped).await;
                info!("Realtime server shutdown signal received");
            })
            .await?;

        info!("Realtime server stopped");
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        // Retained for a server that has not subscribed yet
        self.shutdown_tx.send_replace(true);
        Ok(())
    }
}
