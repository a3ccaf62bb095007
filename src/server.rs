//! REST wrapper around [`ActionService`].
//!
//! `POST /act` takes an [`ActRequest`] and answers with the action chunk as a
//! list of vectors; `GET /health` reports what the server was started with.

use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::DeployConfig;
use crate::error::ServiceError;
use crate::service::ActionService;
use crate::wire::{ActRequest, ErrorResponse};

/// Float32 images from two cameras exceed axum's 2 MB default.
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ActionService>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub checkpoint_id: String,
    pub unnorm_key: String,
    pub backend: String,
    pub chunk_horizon: usize,
    pub num_images_in_input: u8,
    pub use_proprio: bool,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match self {
            ServiceError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::InferenceFailure { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Transport(_) => StatusCode::BAD_GATEWAY,
        };
        (status, Json(ErrorResponse::from(&self))).into_response()
    }
}

/// Generate an action chunk for one observation
pub async fn act_handler(
    State(state): State<AppState>,
    Json(request): Json<ActRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let raw = request.into_raw_observation().map_err(|e| {
        warn!("rejecting undecodable request: {e}");
        ServiceError::from(e)
    })?;

    let chunk = state.service.act_raw(raw).await.map_err(|e| {
        warn!("request failed: {e}");
        e
    })?;

    Ok((StatusCode::OK, Json(chunk.to_response())))
}

pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let config = state.service.config();
    Json(HealthResponse {
        status: "ok".to_string(),
        checkpoint_id: config.checkpoint_id.clone(),
        unnorm_key: config.unnorm_key.clone(),
        backend: state.service.backend_name().to_string(),
        chunk_horizon: config.chunk_horizon,
        num_images_in_input: config.num_images_in_input,
        use_proprio: config.use_proprio,
    })
}

pub fn router(service: Arc<ActionService>) -> Router {
    Router::new()
        .route("/act", post(act_handler))
        .route("/health", get(health_handler))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(AppState { service })
}

/// Run the action server until the process is stopped.
pub async fn serve(deploy: &DeployConfig, service: Arc<ActionService>) -> anyhow::Result<()> {
    let addr = deploy.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, checkpoint = %service.config().checkpoint_id, "serving POST /act");

    axum::serve(listener, router(service)).await?;
    Ok(())
}
