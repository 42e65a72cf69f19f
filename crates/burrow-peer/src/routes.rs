use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::peer::{BackupStarted, Peer};
use crate::reclaim::{self, ReclaimOutcome};
use crate::state::StateReport;

/// Shared application state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub peer: Arc<Peer>,
}

// ── Request/response types ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct BackupRequest {
    pub path: String,
    pub replication_degree: u8,
}

#[derive(Debug, Deserialize)]
pub struct PathRequest {
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct ReclaimRequest {
    pub max_bytes: u64,
}

#[derive(Debug, Serialize)]
pub struct RestoreResponse {
    pub restored_to: String,
}

// ── Handlers ────────────────────────────────────────────────────────────

/// POST /backup — split the file and push its chunks to the network.
/// Returns once every PUTCHUNK is enqueued, not once replication completes.
pub async fn backup(
    State(state): State<AppState>,
    Json(req): Json<BackupRequest>,
) -> Result<Json<BackupStarted>, StatusCode> {
    match state.peer.backup(&req.path, req.replication_degree).await {
        Ok(started) => Ok(Json(started)),
        Err(e) => {
            warn!("Backup of {} failed: {:#}", req.path, e);
            Err(StatusCode::UNPROCESSABLE_ENTITY)
        }
    }
}

/// POST /restore — fetch all chunks back and reassemble the file.
pub async fn restore(
    State(state): State<AppState>,
    Json(req): Json<PathRequest>,
) -> Result<Json<RestoreResponse>, StatusCode> {
    match state.peer.restore(&req.path).await {
        Ok(out) => Ok(Json(RestoreResponse {
            restored_to: out.display().to_string(),
        })),
        Err(e) => {
            warn!("Restore of {} failed: {:#}", req.path, e);
            Err(StatusCode::UNPROCESSABLE_ENTITY)
        }
    }
}

/// POST /delete — delete a backed-up file network-wide. Blocks for the
/// whole escalating resend schedule.
pub async fn delete(
    State(state): State<AppState>,
    Json(req): Json<PathRequest>,
) -> Result<StatusCode, StatusCode> {
    match state.peer.delete(&req.path).await {
        Ok(()) => Ok(StatusCode::NO_CONTENT),
        Err(e) => {
            warn!("Delete of {} failed: {:#}", req.path, e);
            Err(StatusCode::UNPROCESSABLE_ENTITY)
        }
    }
}

/// POST /reclaim — adopt a new capacity budget, evicting redundant chunks
/// if occupation exceeds it.
pub async fn reclaim(
    State(state): State<AppState>,
    Json(req): Json<ReclaimRequest>,
) -> Json<ReclaimOutcome> {
    Json(reclaim::reclaim_to(&state.peer, req.max_bytes).await)
}

/// GET /state — full report of the peer's storage state.
pub async fn state_report(State(state): State<AppState>) -> Json<StateReport> {
    Json(state.peer.state_report())
}

/// GET /health
pub async fn health() -> StatusCode {
    StatusCode::OK
}
