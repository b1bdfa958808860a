//! Master Queue
//!
//! Tasks this node originates (or continues after a local stage finished) wait
//! here until a worker is chosen for them. Buckets are visited in stage-priority
//! order; within a bucket tasks stay in job-instance order.

use super::routing::Selection;
use crate::estimator::{DecayingEstimator, TimeEstimate};
use crate::job::{TaskInstance, TaskType};
use crate::membership::types::NodeId;
use std::collections::{BTreeMap, VecDeque};

#[derive(Debug)]
struct TypeBucket {
    tasks: VecDeque<TaskInstance>,
    dequeue_interval: DecayingEstimator,
    last_dequeue: Option<f64>,
    became_non_empty: Option<f64>,
    task_count: u64,
    max_elements: usize,
}

impl TypeBucket {
    fn new(initial_estimate: f64) -> Self {
        Self {
            tasks: VecDeque::new(),
            dequeue_interval: DecayingEstimator::new(initial_estimate),
            last_dequeue: None,
            became_non_empty: None,
            task_count: 0,
            max_elements: 0,
        }
    }

    fn note_insert(&mut self, now: f64) {
        if self.tasks.is_empty() {
            self.became_non_empty = Some(now);
        }
        self.task_count += 1;
    }

    fn note_dequeue(&mut self, now: f64) {
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
    }
}

/// Per-type counters, for stats output.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MasterQueueTypeStats {
    pub task_type: String,
    pub queued: usize,
    pub task_count: u64,
    pub max_elements: usize,
    pub dequeue_interval: f64,
}

#[derive(Debug)]
pub struct MasterQueue {
    buckets: BTreeMap<TaskType, TypeBucket>,
    initial_estimate: f64,
}

impl MasterQueue {
    pub fn new(initial_estimate: f64) -> Self {
        Self {
            buckets: BTreeMap::new(),
            initial_estimate,
        }
    }

    fn bucket(&mut self, task_type: TaskType) -> &mut TypeBucket {
        let initial = self.initial_estimate;
        self.buckets
            .entry(task_type)
            .or_insert_with(|| TypeBucket::new(initial))
    }

    /// Inserts in job-instance order. An equal instance already waiting is not queued twice.
    pub fn add(&mut self, task: TaskInstance, now: f64) -> bool {
        let bucket = self.bucket(task.task_type);
        if bucket.tasks.contains(&task) {
            tracing::debug!("Task {} already waiting in master queue", task);
            return false;
        }
        bucket.note_insert(now);
        let position = bucket
            .tasks
            .partition_point(|queued| queued.job_instance <= task.job_instance);
        bucket.tasks.insert(position, task);
        bucket.max_elements = bucket.max_elements.max(bucket.tasks.len());
        true
    }

    /// Puts a task back at the head of its bucket, e.g. after a failed send.
    pub fn add_front(&mut self, task: TaskInstance, now: f64) {
        let bucket = self.bucket(task.task_type);
        if bucket.tasks.contains(&task) {
            return;
        }
        bucket.note_insert(now);
        bucket.tasks.push_front(task);
        bucket.max_elements = bucket.max_elements.max(bucket.tasks.len());
    }

    /// Re-enqueues rescued tasks. Returns how many were queued.
    pub fn add_all(&mut self, tasks: Vec<TaskInstance>, now: f64) -> usize {
        let mut queued = 0;
        for task in tasks {
            if self.add(task, now) {
                queued += 1;
            }
        }
        queued
    }

    /// Picks the next task to dispatch and its destination.
    ///
    /// Buckets are visited in priority order and only their head is offered to
    /// `select`. A bucket whose best node is merely reservable is skipped for now
    /// rather than overcommitting that node.
    pub fn select_submission<F>(&mut self, now: f64, mut select: F) -> Option<(TaskInstance, NodeId)>
    where
        F: FnMut(&TaskInstance) -> Selection,
    {
        for bucket in self.buckets.values_mut() {
            let Some(head) = bucket.tasks.front() else {
                continue;
            };
            match select(head) {
                Selection::Dispatch(node) => {
                    let task = bucket.tasks.pop_front()?;
                    bucket.note_dequeue(now);
                    return Some((task, node));
                }
                Selection::Reserve => {
                    tracing::trace!("Holding {} back: best node is at its allowance", head);
                }
                Selection::NoCandidate => {
                    tracing::trace!("No node available for {}", head);
                }
            }
        }
        None
    }

    /// Expected wait of a newly added task, per type index.
    pub fn queue_times(&self, type_count: usize) -> Vec<TimeEstimate> {
        let mut times = vec![TimeEstimate::ZERO; type_count];
        for (task_type, bucket) in &self.buckets {
            if let Some(slot) = times.get_mut(task_type.index) {
                *slot = bucket
                    .dequeue_interval
                    .estimate()
                    .multiply(bucket.tasks.len() as f64);
            }
        }
        times
    }

    pub fn queue_length(&self, task_type: &TaskType) -> usize {
        self.buckets
            .get(task_type)
            .map(|bucket| bucket.tasks.len())
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.buckets.values().map(|bucket| bucket.tasks.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.values().all(|bucket| bucket.tasks.is_empty())
    }

    pub fn stats(&self) -> Vec<MasterQueueTypeStats> {
        self.buckets
            .iter()
            .map(|(task_type, bucket)| MasterQueueTypeStats {
                task_type: task_type.to_string(),
                queued: bucket.tasks.len(),
                task_count: bucket.task_count,
                max_elements: bucket.max_elements,
                dequeue_interval: bucket.dequeue_interval.average(),
            })
            .collect()
    }
}
