//! API Protocol Definitions
//!
//! DTOs exchanged with HTTP clients. Job payloads are passed through untouched.

use crate::job::Payload;
use serde::{Deserialize, Serialize};

pub const ENDPOINT_SUBMIT_JOB: &str = "/job/submit";
pub const ENDPOINT_JOB_STATUS: &str = "/job/status";
pub const ENDPOINT_STATS: &str = "/stats";

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitJobRequest {
    /// Registered job name, e.g. "pipeline".
    pub job: String,
    pub input: Payload,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitJobResponse {
    pub success: bool,
    pub serial: Option<u64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Running,
    Completed,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub serial: u64,
    pub status: JobStatus,
    pub user_id: Option<String>,
    pub result: Option<Payload>,
}
