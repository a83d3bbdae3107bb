use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::{debug, warn};

use crate::raft::{Consensus, ConsensusError, NodeStatus, Peer};
use crate::storage::command::{IncrementCommand, JoinCommand};

/// Application state shared across handlers.
pub struct AppState<C: Consensus> {
    pub consensus: C,
}

impl<C: Consensus> AppState<C> {
    pub fn new(consensus: C) -> Self {
        Self { consensus }
    }
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Consensus(ConsensusError),
}

impl From<ConsensusError> for ApiError {
    fn from(value: ConsensusError) -> Self {
        ApiError::Consensus(value)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Consensus(err) => {
                let status = match err {
                    ConsensusError::NotLeader { .. } | ConsensusError::Unavailable(_) => {
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                    ConsensusError::Timeout => StatusCode::GATEWAY_TIMEOUT,
                    ConsensusError::InvalidBatch(_) => StatusCode::BAD_REQUEST,
                    ConsensusError::Exhausted
                    | ConsensusError::CorruptSnapshot(_)
                    | ConsensusError::Rejected(_)
                    | ConsensusError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, err.to_string())
            }
        };
        (status, message).into_response()
    }
}

/// `POST /doracle`: body is the batch size in decimal, the answer the
/// high-water mark after the batch committed.
pub async fn allocate<C: Consensus>(
    State(state): State<Arc<AppState<C>>>,
    body: String,
) -> Result<String, ApiError> {
    let num: i32 = body
        .trim()
        .parse()
        .map_err(|e| ApiError::BadRequest(format!("invalid batch size {:?}: {}", body, e)))?;
    if num < 1 {
        return Err(ApiError::BadRequest(format!(
            "invalid batch size {}, must be at least 1",
            num
        )));
    }

    debug!(num, "allocating batch");
    match state.consensus.propose(IncrementCommand::new(num)).await {
        Ok(high_water_mark) => Ok(high_water_mark.to_string()),
        Err(err) => {
            warn!(num, error = %err, "batch allocation failed");
            Err(err.into())
        }
    }
}

/// `POST /join`: JSON membership descriptor.
pub async fn join<C: Consensus>(
    State(state): State<Arc<AppState<C>>>,
    body: Bytes,
) -> Result<Json<Peer>, ApiError> {
    let command: JoinCommand = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("invalid join descriptor: {}", e)))?;

    let leader = state.consensus.add_member(command).await?;
    Ok(Json(leader))
}

pub async fn health_check<C: Consensus>(State(state): State<Arc<AppState<C>>>) -> Json<NodeStatus> {
    Json(state.consensus.status())
}
