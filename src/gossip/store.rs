use super::types::{NodePerformanceInfo, WorkerQueueInfo};
use crate::estimator::TimeEstimate;
use crate::job::{JobList, TaskType};
use crate::membership::types::{Location, NodeId};
use std::collections::HashMap;
use std::sync::Mutex;

struct GossipState {
    local: NodePerformanceInfo,
    remote: HashMap<NodeId, NodePerformanceInfo>,
    /// Removed sources with the last timestamp seen from them. Copies still
    /// circulating in other nodes' snapshots must not bring them back.
    departed: HashMap<NodeId, u64>,
}

impl GossipState {
    fn get(&self, node: &NodeId) -> Option<&NodePerformanceInfo> {
        if *node == self.local.source {
            Some(&self.local)
        } else {
            self.remote.get(node)
        }
    }
}

/// Latest known performance vector of every node, including this one.
///
/// The local vector is the only one produced here; every other entry is a copy
/// received through gossip and is only ever replaced by a newer copy.
pub struct Gossip {
    local: NodeId,
    state: Mutex<GossipState>,
}

impl Gossip {
    pub fn new(local: NodeId, location: Location, type_count: usize) -> Self {
        Self {
            state: Mutex::new(GossipState {
                local: NodePerformanceInfo::new(local.clone(), location, type_count),
                remote: HashMap::new(),
                departed: HashMap::new(),
            }),
            local,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GossipState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Merges a received vector.
    ///
    /// Accepted when nothing is known about the source yet or the incoming
    /// timestamp is strictly newer. Vectors of removed sources are never
    /// accepted again. Returns whether anything new was learned.
    pub fn register(&self, update: NodePerformanceInfo) -> bool {
        if update.source == self.local {
            return false;
        }
        let mut state = self.lock();
        if let Some(last) = state.departed.get(&update.source) {
            tracing::trace!(
                "Ignoring gossip of departed {} (timestamp {}, last known {})",
                update.source,
                update.timestamp,
                last
            );
            return false;
        }
        match state.remote.get(&update.source) {
            Some(known) if known.timestamp >= update.timestamp => false,
            _ => {
                tracing::trace!(
                    "Gossip from {} advanced to timestamp {}",
                    update.source,
                    update.timestamp
                );
                state.remote.insert(update.source.clone(), update);
                true
            }
        }
    }

    /// Merges a batch. Returns the sources whose vectors advanced.
    pub fn register_all(&self, updates: Vec<NodePerformanceInfo>) -> Vec<NodeId> {
        updates
            .into_iter()
            .filter_map(|update| {
                let source = update.source.clone();
                self.register(update).then_some(source)
            })
            .collect()
    }

    pub fn local_info(&self) -> NodePerformanceInfo {
        self.lock().local.clone()
    }

    /// Replaces this node's worker-queue vector. Returns whether it changed.
    pub fn update_local_queue_info(&self, infos: Vec<Option<WorkerQueueInfo>>) -> bool {
        let mut state = self.lock();
        if state.local.worker_queue_info == infos {
            return false;
        }
        state.local.worker_queue_info = infos;
        state.local.timestamp += 1;
        true
    }

    /// Recomputes this node's completion-time vector.
    ///
    /// For every job the stages are walked from last to first. The completion
    /// time of a stage is the time the task spends in the local master queue plus
    /// the best, over all known nodes, of transmission to that node, waiting in its
    /// worker queue, executing there, and the completion of the next stage as that
    /// node itself estimates it (results continue from the executing node).
    ///
    /// `transmission` returns `None` for nodes that must not be considered.
    pub fn recompute_completion_times<F>(
        &self,
        queue_times: &[TimeEstimate],
        jobs: &JobList,
        transmission: F,
    ) -> Vec<TimeEstimate>
    where
        F: Fn(&NodeId, &TaskType) -> Option<TimeEstimate>,
    {
        let mut state = self.lock();
        let mut completion = vec![TimeEstimate::INFINITE; jobs.type_count()];

        for job in jobs.jobs() {
            for stage in job.stages.iter().rev() {
                let next = jobs.next_type(stage);
                let mut best = TimeEstimate::INFINITE;

                let nodes = std::iter::once(&state.local).chain(state.remote.values());
                for info in nodes {
                    let Some(worker) = info.worker_info(stage) else {
                        continue;
                    };
                    if worker.execution_time.is_infinite() {
                        continue;
                    }
                    let Some(transmit) = transmission(&info.source, stage) else {
                        continue;
                    };
                    let downstream = match next {
                        None => TimeEstimate::ZERO,
                        Some(next) if info.source == self.local => completion[next.index],
                        Some(next) => info.completion(&next),
                    };
                    if downstream.is_infinite() {
                        continue;
                    }
                    let estimate = transmit
                        .add_independent(&worker.queue_time(worker.queue_length))
                        .add_independent(&worker.execution_time)
                        .add_independent(&downstream);
                    best = TimeEstimate::min_likely(best, estimate);
                }

                let queue_time = queue_times
                    .get(stage.index)
                    .copied()
                    .unwrap_or(TimeEstimate::ZERO);
                completion[stage.index] = if best.is_infinite() {
                    TimeEstimate::INFINITE
                } else {
                    queue_time.add_independent(&best)
                };
            }
        }

        if state.local.completion_info != completion {
            state.local.completion_info = completion.clone();
            state.local.timestamp += 1;
        }
        completion
    }

    pub fn completion_of(&self, node: &NodeId, task_type: &TaskType) -> Option<TimeEstimate> {
        let state = self.lock();
        state.get(node).map(|info| info.completion(task_type))
    }

    pub fn worker_info(&self, node: &NodeId, task_type: &TaskType) -> Option<WorkerQueueInfo> {
        let state = self.lock();
        state
            .get(node)
            .and_then(|info| info.worker_info(task_type).cloned())
    }

    pub fn get(&self, node: &NodeId) -> Option<NodePerformanceInfo> {
        let state = self.lock();
        state.get(node).cloned()
    }

    /// Every known vector, the local one first.
    pub fn snapshot(&self) -> Vec<NodePerformanceInfo> {
        let state = self.lock();
        std::iter::once(&state.local)
            .chain(state.remote.values())
            .cloned()
            .collect()
    }

    /// Forgets a dead or departed node for good.
    pub fn remove(&self, node: &NodeId) {
        if *node == self.local {
            return;
        }
        let mut state = self.lock();
        let last = state.remote.remove(node).map_or(0, |info| info.timestamp);
        state.departed.insert(node.clone(), last);
    }

    pub fn is_departed(&self, node: &NodeId) -> bool {
        self.lock().departed.contains_key(node)
    }

    /// Number of known nodes, this one included.
    pub fn node_count(&self) -> usize {
        self.lock().remote.len() + 1
    }
}
