use super::protocol::{JobStatus, JobStatusResponse};
use crate::job::{JobInstanceId, Payload};
use crate::scheduler::JobCompletionListener;

use dashmap::DashMap;

#[derive(Debug, Clone)]
struct JobEntry {
    user_id: Option<String>,
    result: Option<Payload>,
}

/// Remembers the jobs submitted through the API and their results, by serial.
#[derive(Debug, Default)]
pub struct JobResultStore {
    jobs: DashMap<u64, JobEntry>,
}

impl JobResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_submitted(&self, job: &JobInstanceId) {
        self.jobs.entry(job.serial).or_insert_with(|| JobEntry {
            user_id: job.user_id.clone(),
            result: None,
        });
    }

    pub fn status(&self, serial: u64) -> Option<JobStatusResponse> {
        self.jobs.get(&serial).map(|entry| JobStatusResponse {
            serial,
            status: if entry.result.is_some() {
                JobStatus::Completed
            } else {
                JobStatus::Running
            },
            user_id: entry.user_id.clone(),
            result: entry.result.clone(),
        })
    }

    pub fn completed_count(&self) -> usize {
        self.jobs.iter().filter(|entry| entry.result.is_some()).count()
    }
}

impl JobCompletionListener for JobResultStore {
    fn job_completed(&self, job: &JobInstanceId, result: &Payload) {
        tracing::info!("Job {} finished with {}", job, result);
        let mut entry = self.jobs.entry(job.serial).or_insert_with(|| JobEntry {
            user_id: job.user_id.clone(),
            result: None,
        });
        if entry.result.is_none() {
            entry.result = Some(result.clone());
        }
    }
}
