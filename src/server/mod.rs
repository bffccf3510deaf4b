//! Gateway transport: the WebSocket endpoint and the health probe.
//!
//! One axum router serves the configured WebSocket path plus `GET /health`.
//! Everything connection-scoped lives in [`connection`]; this module owns the
//! listener, the shared state, and the idle-session sweeper.

pub mod connection;

use crate::config::GatewayConfig;
use crate::dialogue::InMemoryDialogueStore;
use crate::engine::EngineRegistry;
use crate::error::{GatewayError, Result};
use crate::session::SessionRegistry;
use axum::Router;
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Shared router state.
#[derive(Clone)]
pub(crate) struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub config: Arc<GatewayConfig>,
    pub connections: Arc<AtomicUsize>,
    /// Fired at shutdown so every open connection unwinds promptly.
    pub shutdown: CancellationToken,
}

/// A bound-but-not-yet-running gateway.
///
/// Splitting bind from run lets callers read the actual listen address
/// before serving (port 0 in tests).
pub struct GatewayServer {
    listener: TcpListener,
    router: Router,
    registry: Arc<SessionRegistry>,
    conn_shutdown: CancellationToken,
}

impl GatewayServer {
    /// Bind with the built-in engine providers.
    ///
    /// # Errors
    ///
    /// Fails on engine construction or if the address cannot be bound.
    pub async fn bind(config: GatewayConfig) -> Result<Self> {
        Self::bind_with_providers(config, &EngineRegistry::with_builtins()).await
    }

    /// Bind with a caller-supplied provider registry (for embedders that
    /// register their own engines).
    ///
    /// # Errors
    ///
    /// Fails on engine construction or if the address cannot be bound.
    pub async fn bind_with_providers(
        config: GatewayConfig,
        providers: &EngineRegistry,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let engines = providers.build(&config.engines)?;
        let store = Arc::new(InMemoryDialogueStore::new(config.dialogue.clone()));
        let registry = Arc::new(SessionRegistry::new(engines, store, Arc::clone(&config)));

        let conn_shutdown = CancellationToken::new();
        let state = AppState {
            registry: Arc::clone(&registry),
            config: Arc::clone(&config),
            connections: Arc::new(AtomicUsize::new(0)),
            shutdown: conn_shutdown.clone(),
        };
        let router = Router::new()
            .route(&config.server.path, get(ws_handler))
            .route("/health", get(health_handler))
            .with_state(state);

        let addr = format!("{}:{}", config.server.host, config.server.port);
        let listener = TcpListener::bind(&addr).await?;
        info!(addr = %listener.local_addr()?, path = %config.server.path, "gateway listening");

        Ok(Self {
            listener,
            router,
            registry,
            conn_shutdown,
        })
    }

    /// The actual listen address.
    ///
    /// # Errors
    ///
    /// Propagates the socket error.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(Into::into)
    }

    /// Serve until the shutdown token fires, then tear down every session.
    ///
    /// # Errors
    ///
    /// Propagates fatal accept-loop errors.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let sweeper = tokio::spawn(
            Arc::clone(&self.registry).run_sweeper(shutdown.child_token()),
        );

        // Unwind open connections before the accept loop drains, otherwise
        // graceful shutdown would wait on long-lived WebSockets forever.
        let serve_shutdown = shutdown.clone();
        let conn_shutdown = self.conn_shutdown.clone();
        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async move {
                serve_shutdown.cancelled().await;
                conn_shutdown.cancel();
            })
            .await
            .map_err(|e| GatewayError::Internal(format!("server error: {e}")))?;

        self.registry.shutdown().await;
        let _ = sweeper.await;
        info!("gateway shut down");
        Ok(())
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let session_id = params.get("session_id").cloned();
    let max_frame = state.config.server.max_frame_bytes;
    ws.max_message_size(max_frame)
        .on_upgrade(move |socket| connection::handle_socket(socket, session_id, state))
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "active_sessions": state.registry.active(),
    }))
}
