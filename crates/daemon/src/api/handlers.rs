/// API request handlers

use super::inbox::EventInbox;
use super::responses::*;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use onionmesh_common::{OnionError, Peer};
use onionmesh_core::{Node, TunnelId};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub node: Arc<Node>,
    pub inbox: Arc<EventInbox>,
}

/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    debug!("API: GET /health");
    (StatusCode::OK, "OK")
}

/// Handler for GET /api/status
pub async fn get_status(State(state): State<AppState>) -> Json<NodeStatusResponse> {
    debug!("API: GET /api/status");

    let controller = state.node.controller();
    Json(NodeStatusResponse {
        public_key: state.node.host_key().public_hex(),
        listen_addr: state.node.local_addr().to_string(),
        min_hops: controller.config().min_hops,
        stats: controller.stats(),
    })
}

/// Handler for GET /api/tunnels
pub async fn list_tunnels(State(state): State<AppState>) -> Json<TunnelListResponse> {
    debug!("API: GET /api/tunnels");

    let tunnels = state.node.controller().tunnels();
    let total = tunnels.len();
    Json(TunnelListResponse { tunnels, total })
}

/// Handler for POST /api/tunnels
pub async fn create_tunnel(
    State(state): State<AppState>,
    Json(request): Json<CreateTunnelRequest>,
) -> Result<(StatusCode, Json<CreateTunnelResponse>), AppError> {
    debug!("API: POST /api/tunnels -> {}:{}", request.address, request.port);

    let public_key = hex::decode(&request.public_key)
        .map_err(|e| AppError::bad_request(format!("public_key is not hex: {}", e)))?;
    let destination = Peer::new(request.address, request.port, public_key);

    let tunnel_id = state.node.controller().create_tunnel(destination).await?;
    Ok((StatusCode::CREATED, Json(CreateTunnelResponse { tunnel_id })))
}

/// Handler for DELETE /api/tunnels/:id
pub async fn destroy_tunnel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DestroyTunnelResponse>, AppError> {
    debug!("API: DELETE /api/tunnels/{}", id);

    let tunnel_id = parse_tunnel_id(&id)?;
    if !state.node.controller().destroy_tunnel(tunnel_id).await? {
        return Err(AppError::not_found(format!("{} is not known", tunnel_id)));
    }
    Ok(Json(DestroyTunnelResponse {
        tunnel_id,
        destroyed: true,
    }))
}

/// Handler for POST /api/tunnels/:id/data
pub async fn send_data(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<SendDataRequest>,
) -> Result<Json<SendDataResponse>, AppError> {
    debug!("API: POST /api/tunnels/{}/data", id);

    let tunnel_id = parse_tunnel_id(&id)?;
    let data = hex::decode(&request.data)
        .map_err(|e| AppError::bad_request(format!("data is not hex: {}", e)))?;

    let datums = state.node.controller().forward(tunnel_id, &data).await?;
    Ok(Json(SendDataResponse { tunnel_id, datums }))
}

/// Handler for POST /api/cover
pub async fn send_cover(
    State(state): State<AppState>,
    Json(request): Json<CoverRequest>,
) -> Result<Json<CoverResponse>, AppError> {
    debug!("API: POST /api/cover ({} bytes)", request.size);

    let tunnel_id = state.node.controller().cover(request.size).await?;
    Ok(Json(CoverResponse {
        tunnel_id,
        size: request.size,
    }))
}

/// Handler for GET /api/events
pub async fn drain_events(State(state): State<AppState>) -> Json<EventsResponse> {
    let (events, dropped) = state.inbox.drain().await;
    if dropped > 0 {
        warn!("API: {} events dropped since the last poll", dropped);
    }
    Json(EventsResponse { events, dropped })
}

fn parse_tunnel_id(raw: &str) -> Result<TunnelId, AppError> {
    raw.parse()
        .map_err(|_| AppError::bad_request(format!("'{}' is not a tunnel id", raw)))
}

/// Application error type
#[derive(Debug)]
pub struct AppError {
    message: String,
    status_code: StatusCode,
}

impl AppError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: StatusCode::NOT_FOUND,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: StatusCode::BAD_REQUEST,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        self.status_code
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error!("API Error: {}", self.message);

        let body = Json(ErrorResponse::new(
            self.message,
            self.status_code.as_u16(),
        ));

        (self.status_code, body).into_response()
    }
}

impl From<OnionError> for AppError {
    fn from(err: OnionError) -> Self {
        let status_code = match &err {
            OnionError::Tunneling { .. } | OnionError::DataForwarding { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            OnionError::Initialization { .. } => StatusCode::BAD_GATEWAY,
            OnionError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            OnionError::Protocol { .. } | OnionError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            message: err.to_string(),
            status_code,
        }
    }
}
