//! HTTP Surface
//!
//! A thin axum layer over one `Node`: clients submit jobs to the node they are
//! talking to (which becomes the job's origin), poll for the result, and read
//! the node's scheduling statistics.
//!
//! ## Submodules
//! - **`protocol`**: Request/response bodies and endpoint paths.
//! - **`handlers`**: The axum handlers.
//! - **`results`**: `JobResultStore`, the completion listener that keeps finished results.

pub mod handlers;
pub mod protocol;
pub mod results;

use crate::scheduler::Node;
use axum::{
    Router,
    extract::Extension,
    routing::{get, post},
};
use std::sync::Arc;

pub use results::JobResultStore;

pub fn router(node: Arc<Node>, results: Arc<JobResultStore>) -> Router {
    Router::new()
        .route(protocol::ENDPOINT_SUBMIT_JOB, post(handlers::handle_submit_job))
        .route(
            &format!("{}/:serial", protocol::ENDPOINT_JOB_STATUS),
            get(handlers::handle_job_status),
        )
        .route(protocol::ENDPOINT_STATS, get(handlers::handle_stats))
        .layer(Extension(node))
        .layer(Extension(results))
}
