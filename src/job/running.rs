use super::types::{JobInstanceId, TaskInstance};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug)]
struct RunningJob {
    first_task: TaskInstance,
    start: f64,
    resubmissions: u32,
}

/// Jobs submitted on this node whose final result has not arrived yet.
///
/// Results can arrive more than once (duplicate dispatch, orphan rescue); only
/// the first one completes the job.
#[derive(Debug, Default)]
pub struct RunningJobs {
    jobs: Mutex<HashMap<JobInstanceId, RunningJob>>,
}

impl RunningJobs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, first_task: TaskInstance, now: f64) {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.insert(
            first_task.job_instance.clone(),
            RunningJob {
                first_task,
                start: now,
                resubmissions: 0,
            },
        );
    }

    /// Marks a job as finished.
    ///
    /// Returns `true` for the first result of a running job and `false` for a
    /// redundant one.
    pub fn complete(&self, job: &JobInstanceId) -> bool {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        match jobs.remove(job) {
            Some(running) => {
                if running.resubmissions > 0 {
                    tracing::debug!(
                        "Job {} completed after {} resubmission(s)",
                        job,
                        running.resubmissions
                    );
                }
                true
            }
            None => false,
        }
    }

    /// Finds a job that has been running longer than `late_after` seconds.
    ///
    /// The job's clock restarts, so it is not reported again until another full
    /// `late_after` has passed. The returned copy of its first task is marked as
    /// an orphan, ready for resubmission.
    pub fn get_late_job(&self, now: f64, late_after: f64) -> Option<TaskInstance> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let late = jobs
            .values_mut()
            .filter(|running| now - running.start > late_after)
            .min_by(|a, b| a.start.total_cmp(&b.start))?;

        late.start = now;
        late.resubmissions += 1;
        tracing::warn!(
            "Job {} is late, resubmitting (attempt {})",
            late.first_task.job_instance,
            late.resubmissions
        );
        Some(late.first_task.as_orphan())
    }

    pub fn contains(&self, job: &JobInstanceId) -> bool {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.contains_key(job)
    }

    pub fn len(&self) -> usize {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
