use super::types::{JobId, TaskType};
use crate::error::SchedulerError;

/// Description of one pipeline stage at registration time.
#[derive(Debug, Clone)]
pub struct StageSpec {
    pub name: String,
    /// Initial execution-time guess in seconds; `None` marks the stage unpredictable.
    pub predicted_time: Option<f64>,
}

impl StageSpec {
    pub fn predictable(name: &str, predicted_time: f64) -> Self {
        Self {
            name: name.to_string(),
            predicted_time: Some(predicted_time),
        }
    }

    pub fn unpredictable(name: &str) -> Self {
        Self {
            name: name.to_string(),
            predicted_time: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobType {
    pub id: JobId,
    pub name: String,
    pub stages: Vec<TaskType>,
}

/// All job pipelines known to this node, and the task types they consist of.
///
/// Registration happens once at startup; afterwards the list is shared read-only.
/// Every node of a cluster must register the same pipelines in the same order so
/// that task-type indices agree across the wire.
#[derive(Debug, Default)]
pub struct JobList {
    jobs: Vec<JobType>,
    types: Vec<(TaskType, StageSpec)>,
}

impl JobList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_pipeline(
        &mut self,
        name: &str,
        stages: Vec<StageSpec>,
    ) -> Result<JobId, SchedulerError> {
        if stages.is_empty() {
            return Err(SchedulerError::InvalidJob(format!(
                "pipeline '{}' has no stages",
                name
            )));
        }
        if self.job_by_name(name).is_some() {
            return Err(SchedulerError::InvalidJob(format!(
                "pipeline '{}' registered twice",
                name
            )));
        }

        let id = JobId(self.jobs.len() as u32);
        let count = stages.len();

        // Unpredictability propagates towards the front of the pipeline.
        let mut unpredictable = vec![false; count];
        let mut seen_unpredictable = false;
        for (i, spec) in stages.iter().enumerate().rev() {
            seen_unpredictable |= spec.predicted_time.is_none();
            unpredictable[i] = seen_unpredictable;
        }

        let mut types = Vec::with_capacity(count);
        for (i, spec) in stages.into_iter().enumerate() {
            let task_type = TaskType {
                job: id,
                stage: i as u32,
                remaining_stages: (count - i - 1) as u32,
                unpredictable: unpredictable[i],
                index: self.types.len(),
            };
            self.types.push((task_type, spec));
            types.push(task_type);
        }

        tracing::info!("Registered pipeline '{}' as job {} with {} stage(s)", name, id.0, count);

        self.jobs.push(JobType {
            id,
            name: name.to_string(),
            stages: types,
        });
        Ok(id)
    }

    pub fn job(&self, id: JobId) -> Option<&JobType> {
        self.jobs.get(id.0 as usize)
    }

    pub fn job_by_name(&self, name: &str) -> Option<&JobType> {
        self.jobs.iter().find(|job| job.name == name)
    }

    pub fn jobs(&self) -> &[JobType] {
        &self.jobs
    }

    pub fn first_type(&self, id: JobId) -> Option<TaskType> {
        self.job(id).and_then(|job| job.stages.first().copied())
    }

    /// The successor stage of `task_type`, or `None` for the final stage.
    pub fn next_type(&self, task_type: &TaskType) -> Option<TaskType> {
        if task_type.is_last_stage() {
            return None;
        }
        self.job(task_type.job)
            .and_then(|job| job.stages.get(task_type.stage as usize + 1).copied())
    }

    pub fn stages(&self, id: JobId) -> &[TaskType] {
        self.job(id).map(|job| job.stages.as_slice()).unwrap_or(&[])
    }

    /// The locally registered type a peer's `wire` type stands for.
    ///
    /// `None` when the index is unknown or the peer's job layout differs from ours.
    pub fn canonical(&self, wire: &TaskType) -> Option<TaskType> {
        self.task_type(wire.index).filter(|local| {
            local.job == wire.job
                && local.stage == wire.stage
                && local.remaining_stages == wire.remaining_stages
        })
    }

    pub fn type_count(&self) -> usize {
        self.types.len()
    }

    pub fn task_type(&self, index: usize) -> Option<TaskType> {
        self.types.get(index).map(|(task_type, _)| *task_type)
    }

    pub fn stage_name(&self, task_type: &TaskType) -> Option<&str> {
        self.types
            .get(task_type.index)
            .map(|(_, spec)| spec.name.as_str())
    }

    pub fn predicted_time(&self, task_type: &TaskType) -> Option<f64> {
        self.types
            .get(task_type.index)
            .and_then(|(_, spec)| spec.predicted_time)
    }
}
