//! HTTP front door: binds the listener, owns the hub handle and upgrades
//! `GET /ws` requests into hub sessions.

use std::{future::Future, net::SocketAddr};

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{
        State,
        ws::{WebSocket, WebSocketUpgrade},
    },
    response::Response,
    routing::get,
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    connection::{Connection, new_connection_id},
    hub::{Hub, HubConfig, HubHandle},
};

pub struct Server {
    listener: TcpListener,
    hub: HubHandle,
}

impl Server {
    /// Starts a fresh hub for this server. Must be called inside a Tokio runtime.
    pub fn new(listener: TcpListener, config: HubConfig) -> Self {
        Self {
            listener,
            hub: Hub::spawn(config),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn hub(&self) -> HubHandle {
        self.hub.clone()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Server { listener, hub } = self;

        axum::serve(listener, router(hub))
            .with_graceful_shutdown(async move {
                shutdown.await;
                info!("hub shutting down");
            })
            .await
            .context("server exited with error")
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

/// The single upgrade route. Any origin is accepted.
pub fn router(hub: HubHandle) -> Router {
    Router::new()
        .route("/ws", get(upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(hub)
}

async fn upgrade(ws: WebSocketUpgrade, State(hub): State<HubHandle>) -> Response {
    ws.on_upgrade(move |socket| establish_session(socket, hub))
}

async fn establish_session(socket: WebSocket, hub: HubHandle) {
    let id = new_connection_id();
    let (connection, registration) = Connection::open(id, socket, hub.config().queue_capacity);

    if let Err(err) = hub.register(registration).await {
        warn!(conn_id = %connection.id(), error = ?err, "failed to register client");
        return;
    }

    info!(conn_id = %connection.id(), "client connected");
    connection.spawn(hub);
}
