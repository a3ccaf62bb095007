//! HTTP client for a remote action service.
//!
//! Speaks the same contract as the in-process service: 4xx answers become
//! [`ServiceError::BadRequest`], 5xx answers [`ServiceError::InferenceFailure`].
//! No retries; the caller owns retry policy.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::{debug, warn};

use crate::action::ActionChunk;
use crate::error::ServiceError;
use crate::observation::Observation;
use crate::server::HealthResponse;
use crate::wire::{ActRequest, ActResponse, ErrorResponse};
use crate::ActionPolicy;

/// Default request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct RemotePolicy {
    client: Client,
    base_url: String,
}

impl RemotePolicy {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ServiceError> {
        Self::with_timeout(base_url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ServiceError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Sends a request body as-is, e.g. a stored observation bundle.
    pub async fn act_request(&self, request: &ActRequest) -> Result<ActionChunk, ServiceError> {
        let url = format!("{}/act", self.base_url);
        debug!(%url, "posting observation");

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| ServiceError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            let rows: ActResponse = response
                .json()
                .await
                .map_err(|e| ServiceError::Transport(format!("undecodable response: {e}")))?;
            return Ok(ActionChunk::from_rows(rows));
        }

        let body = response.text().await.unwrap_or_default();
        warn!(%status, "action service returned an error");
        Err(error_from_response(status, &body))
    }

    pub async fn health(&self) -> Result<HealthResponse, ServiceError> {
        let url = format!("{}/health", self.base_url);
        self.client
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ServiceError::Transport(e.to_string()))?
            .json()
            .await
            .map_err(|e| ServiceError::Transport(e.to_string()))
    }
}

fn error_from_response(status: StatusCode, body: &str) -> ServiceError {
    let (message, detail) = match serde_json::from_str::<ErrorResponse>(body) {
        Ok(err) => (err.message, err.detail),
        Err(_) if body.is_empty() => (status.to_string(), None),
        Err(_) => (body.to_string(), None),
    };

    if status.is_client_error() {
        ServiceError::BadRequest(message)
    } else if status.is_server_error() {
        ServiceError::InferenceFailure { message, detail }
    } else {
        ServiceError::Transport(format!("unexpected status {status}: {message}"))
    }
}

#[async_trait]
impl ActionPolicy for RemotePolicy {
    async fn act(&self, observation: Observation) -> Result<ActionChunk, ServiceError> {
        self.act_request(&ActRequest::from_observation(&observation))
            .await
    }
}
