//! Job read model, batch status, and health.

use std::collections::{HashMap, HashSet};

use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use strata_core::{JobRecord, JobRepository, JobStatusSummary, QueueStats};

use crate::{ApiError, AppState};

/// Upper bound on ids in one batch status request.
pub const MAX_BATCH_STATUS_IDS: usize = 500;

/// Get one job.
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobRecord>, ApiError> {
    let job = state
        .jobs
        .get(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Job not found: {id}")))?;
    Ok(Json(JobRecord::from(&job)))
}

#[derive(Debug, Deserialize)]
pub struct BatchStatusRequest {
    pub job_ids: Vec<Uuid>,
}

/// Status and progress of several jobs, in request order.
///
/// Unknown ids are omitted. Progress is the last reported value, or one
/// implied by the status when nothing was reported.
pub async fn batch_status(
    State(state): State<AppState>,
    Json(request): Json<BatchStatusRequest>,
) -> Result<Json<Vec<JobStatusSummary>>, ApiError> {
    if request.job_ids.len() > MAX_BATCH_STATUS_IDS {
        return Err(ApiError::BadRequest(format!(
            "at most {MAX_BATCH_STATUS_IDS} job ids per request"
        )));
    }

    let found: HashMap<Uuid, JobStatusSummary> = state
        .jobs
        .get_many(&request.job_ids)
        .await?
        .iter()
        .map(|job| (job.id, JobStatusSummary::from(job)))
        .collect();

    let mut seen = HashSet::new();
    let summaries = request
        .job_ids
        .iter()
        .filter(|id| seen.insert(**id))
        .filter_map(|id| found.get(id).cloned())
        .collect();
    Ok(Json(summaries))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub queue: QueueStats,
    pub connections: usize,
}

/// Liveness plus queue statistics.
pub async fn health(State(state): State<AppState>) -> Result<Json<HealthResponse>, ApiError> {
    let queue = state.jobs.queue_stats().await?;
    Ok(Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        queue,
        connections: state.gateway.connection_count().await,
    }))
}
