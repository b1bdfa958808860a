use super::protocol::*;
use super::results::JobResultStore;
use crate::error::SchedulerError;
use crate::scheduler::{Node, NodeReport};

use axum::{Extension, Json, extract::Path, http::StatusCode};
use std::sync::Arc;

pub async fn handle_submit_job(
    Extension(node): Extension<Arc<Node>>,
    Extension(results): Extension<Arc<JobResultStore>>,
    Json(req): Json<SubmitJobRequest>,
) -> (StatusCode, Json<SubmitJobResponse>) {
    match node.submit_by_name(&req.job, req.input, req.user_id) {
        Ok(job) => {
            results.record_submitted(&job);
            tracing::info!("Job {} submitted as {}", req.job, job);
            (
                StatusCode::OK,
                Json(SubmitJobResponse {
                    success: true,
                    serial: Some(job.serial),
                    error: None,
                }),
            )
        }
        Err(e) => {
            tracing::warn!("Rejected submission of {}: {}", req.job, e);
            let status = match &e {
                SchedulerError::UnknownJob(_) => StatusCode::NOT_FOUND,
                SchedulerError::Stopping => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (
                status,
                Json(SubmitJobResponse {
                    success: false,
                    serial: None,
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}

pub async fn handle_job_status(
    Extension(results): Extension<Arc<JobResultStore>>,
    Path(serial): Path<u64>,
) -> (StatusCode, Json<Option<JobStatusResponse>>) {
    match results.status(serial) {
        Some(status) => {
            tracing::debug!("Job status query: {} -> {:?}", serial, status.status);
            (StatusCode::OK, Json(Some(status)))
        }
        None => (StatusCode::NOT_FOUND, Json(None)),
    }
}

pub async fn handle_stats(Extension(node): Extension<Arc<Node>>) -> Json<NodeReport> {
    Json(node.stats())
}
