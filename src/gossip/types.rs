use crate::estimator::TimeEstimate;
use crate::job::TaskType;
use crate::membership::types::{Location, NodeId};
use serde::{Deserialize, Serialize};

/// A worker's view of one of its task-type queues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerQueueInfo {
    pub queue_length: usize,
    /// Estimated time between successive dequeues of this type.
    pub dequeue_time: TimeEstimate,
    pub execution_time: TimeEstimate,
}

impl WorkerQueueInfo {
    /// Time a newly arriving task waits before it starts executing.
    pub fn queue_time(&self, queued_ahead: usize) -> TimeEstimate {
        self.dequeue_time.multiply(queued_ahead as f64)
    }
}

/// One node's published performance snapshot.
///
/// Both vectors are indexed by task-type index. `completion_info[t]` is the node's
/// own estimate of the time from placing a type-`t` task in its master queue to the
/// completion of the whole job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodePerformanceInfo {
    pub source: NodeId,
    pub location: Location,
    /// Logical clock of the source; only strictly newer vectors replace older ones.
    pub timestamp: u64,
    pub completion_info: Vec<TimeEstimate>,
    pub worker_queue_info: Vec<Option<WorkerQueueInfo>>,
}

impl NodePerformanceInfo {
    pub fn new(source: NodeId, location: Location, type_count: usize) -> Self {
        Self {
            source,
            location,
            timestamp: 0,
            completion_info: vec![TimeEstimate::INFINITE; type_count],
            worker_queue_info: vec![None; type_count],
        }
    }

    pub fn completion(&self, task_type: &TaskType) -> TimeEstimate {
        self.completion_info
            .get(task_type.index)
            .copied()
            .unwrap_or(TimeEstimate::INFINITE)
    }

    pub fn worker_info(&self, task_type: &TaskType) -> Option<&WorkerQueueInfo> {
        self.worker_queue_info
            .get(task_type.index)
            .and_then(|info| info.as_ref())
    }

    pub fn supports(&self, task_type: &TaskType) -> bool {
        self.worker_info(task_type).is_some()
    }
}
