//! Worker Queue
//!
//! Tasks sent to this node for execution wait here, bucketed by task type. The
//! per-type statistics (dequeue interval, execution time) are what this node
//! publishes so that masters can estimate its load without asking.

use crate::estimator::DecayingEstimator;
use crate::gossip::WorkerQueueInfo;
use crate::job::{JobList, TaskId, TaskInstance, TaskType};
use crate::membership::types::NodeId;
use std::collections::{BTreeMap, VecDeque};

/// A task waiting for a work loop, with the master it came from.
#[derive(Debug, Clone)]
pub struct WorkerTask {
    pub source: NodeId,
    pub task_id: TaskId,
    pub task: TaskInstance,
    pub arrival: f64,
    /// Later dispatches of the same task instance that arrived while this one
    /// was waiting. They are answered together with the original.
    pub duplicates: Vec<(NodeId, TaskId)>,
}

impl WorkerTask {
    pub fn new(source: NodeId, task_id: TaskId, task: TaskInstance, arrival: f64) -> Self {
        Self {
            source,
            task_id,
            task,
            arrival,
            duplicates: Vec::new(),
        }
    }

    /// Every (master, task id) pair waiting for the outcome of this task.
    pub fn requesters(&self) -> impl Iterator<Item = (&NodeId, TaskId)> + '_ {
        std::iter::once((&self.source, self.task_id))
            .chain(self.duplicates.iter().map(|(source, task_id)| (source, *task_id)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    /// Queued; carries the new queue length of the task's type.
    Queued(usize),
    /// An equal task instance is already waiting; the requester was attached to it.
    Duplicate,
    Unsupported,
}

#[derive(Debug)]
struct TypeQueue {
    tasks: VecDeque<WorkerTask>,
    dequeue_interval: DecayingEstimator,
    execution_time: DecayingEstimator,
    last_dequeue: Option<f64>,
    became_non_empty: Option<f64>,
    task_count: u64,
    max_elements: usize,
}

impl TypeQueue {
    fn new(initial_execution: f64, initial_estimate: f64) -> Self {
        Self {
            tasks: VecDeque::new(),
            dequeue_interval: DecayingEstimator::new(initial_estimate),
            execution_time: DecayingEstimator::new(initial_execution),
            last_dequeue: None,
            became_non_empty: None,
            task_count: 0,
            max_elements: 0,
        }
    }

    fn pop(&mut self, now: f64) -> Option<WorkerTask> {
        let task = self.tasks.pop_front()?;
        // The interval only counts time during which the queue had work waiting.
        let busy_since = match (self.last_dequeue, self.became_non_empty) {
            (Some(last), Some(start)) => last.max(start),
            (None, Some(start)) => start,
            (Some(last), None) => last,
            (None, None) => now,
        };
        self.dequeue_interval.add_sample((now - busy_since).max(0.0));
        self.last_dequeue = Some(now);
        if self.tasks.is_empty() {
            self.became_non_empty = None;
        }
        Some(task)
    }
}

#[derive(Debug)]
pub struct WorkerQueue {
    queues: BTreeMap<TaskType, TypeQueue>,
    fair: bool,
    cursor: usize,
}

impl WorkerQueue {
    /// A queue for the types this node supports.
    ///
    /// Execution-time estimators start at the stage's predicted time, or at the
    /// pessimistic `initial_estimate` for unpredictable stages.
    pub fn new(supported: &[TaskType], jobs: &JobList, initial_estimate: f64, fair: bool) -> Self {
        let queues = supported
            .iter()
            .map(|task_type| {
                let predicted = jobs
                    .predicted_time(task_type)
                    .filter(|_| !task_type.unpredictable)
                    .unwrap_or(initial_estimate);
                (*task_type, TypeQueue::new(predicted, initial_estimate))
            })
            .collect();
        Self {
            queues,
            fair,
            cursor: 0,
        }
    }

    pub fn add(&mut self, task: WorkerTask, now: f64) -> AddOutcome {
        let Some(queue) = self.queues.get_mut(&task.task.task_type) else {
            return AddOutcome::Unsupported;
        };
        if let Some(queued) = queue.tasks.iter_mut().find(|queued| queued.task == task.task) {
            queued.duplicates.push((task.source, task.task_id));
            return AddOutcome::Duplicate;
        }
        if queue.tasks.is_empty() {
            queue.became_non_empty = Some(now);
        }
        queue.tasks.push_back(task);
        queue.task_count += 1;
        queue.max_elements = queue.max_elements.max(queue.tasks.len());
        AddOutcome::Queued(queue.tasks.len())
    }

    /// Takes the next task: lowest task-type index first, or round-robin over
    /// the occupied types when the queue is fair.
    pub fn remove(&mut self, now: f64) -> Option<WorkerTask> {
        if self.fair {
            let occupied: Vec<TaskType> = self
                .queues
                .iter()
                .filter(|(_, queue)| !queue.tasks.is_empty())
                .map(|(task_type, _)| *task_type)
                .collect();
            if occupied.is_empty() {
                return None;
            }
            let chosen = occupied
                .iter()
                .find(|task_type| task_type.index >= self.cursor)
                .copied()
                .unwrap_or(occupied[0]);
            self.cursor = chosen.index + 1;
            return self.queues.get_mut(&chosen).and_then(|queue| queue.pop(now));
        }

        self.queues
            .values_mut()
            .find(|queue| !queue.tasks.is_empty())
            .and_then(|queue| queue.pop(now))
    }

    pub fn record_execution_time(&mut self, task_type: &TaskType, seconds: f64) {
        match self.queues.get_mut(task_type) {
            Some(queue) => queue.execution_time.add_sample(seconds),
            None => tracing::error!("Execution time reported for unsupported type {}", task_type),
        }
    }

    /// After a handler failure the type is advertised as never finishing.
    pub fn mark_failed(&mut self, task_type: &TaskType) {
        if let Some(queue) = self.queues.get_mut(task_type) {
            queue.execution_time.set_infinite();
        }
    }

    pub fn queue_length(&self, task_type: &TaskType) -> usize {
        self.queues
            .get(task_type)
            .map(|queue| queue.tasks.len())
            .unwrap_or(0)
    }

    /// Per-type snapshot indexed by task-type index; unsupported types are `None`.
    pub fn queue_info(&self, type_count: usize) -> Vec<Option<WorkerQueueInfo>> {
        let mut infos = vec![None; type_count];
        for (task_type, queue) in &self.queues {
            if let Some(slot) = infos.get_mut(task_type.index) {
                *slot = Some(WorkerQueueInfo {
                    queue_length: queue.tasks.len(),
                    dequeue_time: queue.dequeue_interval.estimate(),
                    execution_time: queue.execution_time.estimate(),
                });
            }
        }
        infos
    }

    pub fn task_count(&self, task_type: &TaskType) -> u64 {
        self.queues.get(task_type).map(|queue| queue.task_count).unwrap_or(0)
    }

    pub fn max_elements(&self, task_type: &TaskType) -> usize {
        self.queues.get(task_type).map(|queue| queue.max_elements).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.queues.values().map(|queue| queue.tasks.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.values().all(|queue| queue.tasks.is_empty())
    }
}
