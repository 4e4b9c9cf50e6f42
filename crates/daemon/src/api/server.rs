/// API Server implementation

use super::handlers::*;
use super::inbox::{EventInbox, INBOX_CAPACITY};
use anyhow::Result;
use axum::{
    routing::{delete, get, post},
    Router,
};
use onionmesh_core::Node;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

/// Local control API for building, using and tearing down tunnels
pub struct ApiServer {
    listen_addr: SocketAddr,
    node: Arc<Node>,
}

impl ApiServer {
    pub fn new(listen_addr: SocketAddr, node: Arc<Node>) -> Self {
        Self { listen_addr, node }
    }

    pub fn router(state: AppState) -> Router {
        Router::new()
            .route("/health", get(health_check))
            .route("/api/status", get(get_status))
            .route("/api/tunnels", get(list_tunnels).post(create_tunnel))
            .route("/api/tunnels/:id", delete(destroy_tunnel))
            .route("/api/tunnels/:id/data", post(send_data))
            .route("/api/cover", post(send_cover))
            .route("/api/events", get(drain_events))
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Serve until the listener fails
    pub async fn start(self) -> Result<()> {
        let inbox = Arc::new(EventInbox::new(INBOX_CAPACITY));
        let feeds = inbox.collect_from(self.node.controller());

        let app = Self::router(AppState {
            node: self.node.clone(),
            inbox,
        });

        info!("API server starting on {}", self.listen_addr);
        let listener = tokio::net::TcpListener::bind(self.listen_addr).await?;

        let served = axum::serve(listener, app)
            .await
            .map_err(|e| anyhow::anyhow!("API server error: {}", e));

        for feed in feeds {
            feed.abort();
        }
        served
    }
}
