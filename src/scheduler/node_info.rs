//! Per-node bookkeeping on the master side.
//!
//! A `NodeInfo` exists for every node this node has heard of, the local node
//! included. It tracks what has been sent there and not yet answered, how long
//! things take there, and how much more that node may be given right now.

use crate::config::NodeConfig;
use crate::estimator::{DecayingEstimator, TimeDecayingEstimator, TimeEstimate};
use crate::job::{TaskId, TaskInstance, TaskType};
use crate::membership::types::{Location, NodeId};
use std::collections::HashMap;
use std::sync::Mutex;

/// Half-life, in seconds, of the ping estimate.
const PING_HALF_LIFE: f64 = 30.0;

/// Whether a node can take another task of some type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Available,
    /// At its allowance limit; may free up soon.
    Reservable,
    Unavailable,
}

/// One outstanding remote execution.
#[derive(Debug, Clone)]
pub struct ActiveTask {
    pub task: TaskInstance,
    pub task_id: TaskId,
    pub start: f64,
    pub predicted: f64,
    pub allowance_deadline: f64,
    pub reschedule_deadline: f64,
    pub missed_allowance_deadline: bool,
    pub rescheduled: bool,
}

/// Statistics for one (node, task type) pair.
#[derive(Debug)]
pub struct NodeTaskInfo {
    pub roundtrip: DecayingEstimator,
    pub transmission: DecayingEstimator,
    pub outstanding: usize,
    pub maximal_allowance: usize,
    pub failed: bool,
    pub executed: u64,
    pub missed_allowance_deadlines: u64,
}

impl NodeTaskInfo {
    fn new(initial_roundtrip: f64, initial_transmission: f64, initial_allowance: usize) -> Self {
        Self {
            roundtrip: DecayingEstimator::new(initial_roundtrip),
            transmission: DecayingEstimator::new(initial_transmission),
            outstanding: 0,
            maximal_allowance: initial_allowance,
            failed: false,
            executed: 0,
            missed_allowance_deadlines: 0,
        }
    }

    /// Adjusts the allowance from the worker's reported queue length.
    ///
    /// Only a node that is using its whole allowance is adjusted: an empty queue
    /// earns one more slot, more than one waiting task costs one, more than four
    /// cost two. The result stays within `[0, max]`. Returns whether it changed.
    pub fn update_allowance(&mut self, queue_length: usize, max: usize) -> bool {
        if self.failed || self.outstanding < self.maximal_allowance {
            return false;
        }
        let before = self.maximal_allowance;
        self.maximal_allowance = match queue_length {
            0 => self.maximal_allowance + 1,
            1 => self.maximal_allowance,
            2..=4 => self.maximal_allowance.saturating_sub(1),
            _ => self.maximal_allowance.saturating_sub(2),
        }
        .min(max);
        self.maximal_allowance != before
    }

    pub fn availability(&self) -> Availability {
        if self.failed {
            Availability::Unavailable
        } else if self.outstanding < self.maximal_allowance {
            Availability::Available
        } else {
            Availability::Reservable
        }
    }
}

#[derive(Debug)]
struct NodeState {
    suspect: bool,
    dead: bool,
    accepted: bool,
    /// This node has sent us work, so it wants our UpdateNode messages.
    task_source: bool,
    active: Vec<ActiveTask>,
    task_infos: HashMap<TaskType, NodeTaskInfo>,
    ping: TimeDecayingEstimator,
}

/// Everything this node knows about one (possibly remote) node.
#[derive(Debug)]
pub struct NodeInfo {
    pub id: NodeId,
    pub location: Location,
    pub is_local: bool,
    state: Mutex<NodeState>,
}

impl NodeInfo {
    pub fn new(id: NodeId, location: Location, is_local: bool, initial_estimate: f64) -> Self {
        Self {
            id,
            location,
            is_local,
            state: Mutex::new(NodeState {
                suspect: false,
                dead: false,
                accepted: is_local,
                task_source: false,
                active: Vec::new(),
                task_infos: HashMap::new(),
                ping: TimeDecayingEstimator::new(
                    if is_local { 0.0 } else { initial_estimate },
                    PING_HALF_LIFE,
                ),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Records the task types the node executes. Types already known keep their statistics.
    pub fn register_types(&self, types: &[TaskType], config: &NodeConfig, predicted: impl Fn(&TaskType) -> Option<f64>) {
        let initial = config.initial_time_estimate.as_secs_f64();
        let (allowance, transmission) = if self.is_local {
            (config.local_initial_allowance, 0.0)
        } else {
            (0, initial)
        };
        let mut state = self.lock();
        for task_type in types {
            let roundtrip = predicted(task_type)
                .filter(|_| !task_type.unpredictable)
                .map(|p| p + transmission)
                .unwrap_or(initial);
            state
                .task_infos
                .entry(*task_type)
                .or_insert_with(|| NodeTaskInfo::new(roundtrip, transmission, allowance));
        }
    }

    pub fn supports(&self, task_type: &TaskType) -> bool {
        self.lock().task_infos.contains_key(task_type)
    }

    pub fn supported_types(&self) -> Vec<TaskType> {
        let mut types: Vec<TaskType> = self.lock().task_infos.keys().copied().collect();
        types.sort();
        types
    }

    pub fn is_dead(&self) -> bool {
        self.lock().dead
    }

    pub fn is_suspect(&self) -> bool {
        self.lock().suspect
    }

    /// Returns whether the node was not suspect before.
    pub fn set_suspect(&self) -> bool {
        let mut state = self.lock();
        let changed = !state.suspect;
        state.suspect = true;
        changed
    }

    /// A dead node stays dead. Returns whether the suspicion was lifted.
    pub fn clear_suspect(&self) -> bool {
        let mut state = self.lock();
        if state.dead || !state.suspect {
            return false;
        }
        state.suspect = false;
        true
    }

    /// Declares the node dead and hands back its outstanding work as orphans.
    ///
    /// Only the first call returns anything; later calls return an empty list.
    pub fn set_dead(&self) -> Vec<TaskInstance> {
        let mut state = self.lock();
        if state.dead {
            return Vec::new();
        }
        state.dead = true;
        state.suspect = true;
        for info in state.task_infos.values_mut() {
            info.outstanding = 0;
        }
        state
            .active
            .drain(..)
            .map(|active| active.task.as_orphan())
            .collect()
    }

    /// The node answered our registration; `ping` is the measured round trip.
    pub fn set_accepted(&self, ping: f64, now: f64) {
        let mut state = self.lock();
        state.accepted = true;
        state.ping.add_sample(ping, now);
        for info in state.task_infos.values_mut() {
            if info.transmission.sample_count() == 0 {
                info.transmission.add_sample(ping / 2.0);
            }
        }
    }

    pub fn ping(&self) -> f64 {
        self.lock().ping.average()
    }

    pub fn mark_task_source(&self) {
        self.lock().task_source = true;
    }

    pub fn is_task_source(&self) -> bool {
        self.lock().task_source
    }

    /// Records a dispatch. Returns `None` (and records nothing) when the node is
    /// dead or does not execute the task's type.
    pub fn register_task_start(
        &self,
        task: TaskInstance,
        task_id: TaskId,
        now: f64,
        config: &NodeConfig,
    ) -> Option<ActiveTask> {
        let mut state = self.lock();
        if state.dead {
            return None;
        }
        let info = state.task_infos.get_mut(&task.task_type)?;
        info.outstanding += 1;
        let predicted = info.roundtrip.likely_value();
        let interval = config.allowance_interval(predicted);
        let active = ActiveTask {
            task,
            task_id,
            start: now,
            predicted,
            allowance_deadline: now + interval,
            reschedule_deadline: now + interval * config.reschedule_deadline_multiplier,
            missed_allowance_deadline: false,
            rescheduled: false,
        };
        state.active.push(active.clone());
        Some(active)
    }

    fn take_active(state: &mut NodeState, task_id: TaskId) -> Option<ActiveTask> {
        let position = state.active.iter().position(|active| active.task_id == task_id)?;
        let active = state.active.swap_remove(position);
        if let Some(info) = state.task_infos.get_mut(&active.task.task_type) {
            info.outstanding = info.outstanding.saturating_sub(1);
        }
        Some(active)
    }

    /// Closes an outstanding task and folds the observed timings into the estimators.
    ///
    /// Returns the task and its round-trip time, or `None` when the id is unknown
    /// (a duplicate or late completion).
    pub fn register_task_completed(
        &self,
        task_id: TaskId,
        now: f64,
        worker_dwell_time: f64,
    ) -> Option<(ActiveTask, f64)> {
        let mut state = self.lock();
        let active = Self::take_active(&mut state, task_id)?;
        let roundtrip = (now - active.start).max(0.0);
        if let Some(info) = state.task_infos.get_mut(&active.task.task_type) {
            info.roundtrip.add_sample(roundtrip);
            info.transmission
                .add_sample((roundtrip - worker_dwell_time).max(0.0));
            info.executed += 1;
        }
        Some((active, roundtrip))
    }

    /// The worker could not run the task. This node is no longer offered the type.
    pub fn register_task_failed(&self, task_id: TaskId) -> Option<ActiveTask> {
        let mut state = self.lock();
        let active = Self::take_active(&mut state, task_id)?;
        if let Some(info) = state.task_infos.get_mut(&active.task.task_type) {
            info.failed = true;
            info.maximal_allowance = 0;
            info.roundtrip.set_infinite();
        }
        Some(active)
    }

    /// Undoes `register_task_start` after the dispatch could not be sent.
    pub fn retract_task(&self, task_id: TaskId) -> Option<ActiveTask> {
        let mut state = self.lock();
        Self::take_active(&mut state, task_id)
    }

    pub fn update_allowance(&self, task_type: &TaskType, queue_length: usize, max: usize) -> bool {
        let mut state = self.lock();
        match state.task_infos.get_mut(task_type) {
            Some(info) => info.update_allowance(queue_length, max),
            None => false,
        }
    }

    pub fn availability(&self, task_type: &TaskType) -> Availability {
        let state = self.lock();
        if state.dead || state.suspect || !state.accepted {
            return Availability::Unavailable;
        }
        state
            .task_infos
            .get(task_type)
            .map(NodeTaskInfo::availability)
            .unwrap_or(Availability::Unavailable)
    }

    pub fn maximal_allowance(&self, task_type: &TaskType) -> Option<usize> {
        self.lock()
            .task_infos
            .get(task_type)
            .map(|info| info.maximal_allowance)
    }

    pub fn outstanding(&self, task_type: &TaskType) -> usize {
        self.lock()
            .task_infos
            .get(task_type)
            .map(|info| info.outstanding)
            .unwrap_or(0)
    }

    pub fn outstanding_total(&self) -> usize {
        self.lock().active.len()
    }

    pub fn transmission(&self, task_type: &TaskType) -> Option<TimeEstimate> {
        if self.is_local {
            return Some(TimeEstimate::ZERO);
        }
        self.lock()
            .task_infos
            .get(task_type)
            .map(|info| info.transmission.estimate())
    }

    pub fn roundtrip(&self, task_type: &TaskType) -> Option<TimeEstimate> {
        self.lock()
            .task_infos
            .get(task_type)
            .map(|info| info.roundtrip.estimate())
    }

    /// Checks the deadlines of outstanding tasks.
    ///
    /// A missed allowance deadline is only counted. A task past its reschedule
    /// deadline is returned (once) as an orphan for duplicate dispatch; the
    /// original stays outstanding in case it still completes.
    pub fn take_late_tasks(&self, now: f64) -> Vec<TaskInstance> {
        let mut state = self.lock();
        let NodeState {
            active, task_infos, ..
        } = &mut *state;
        let mut late = Vec::new();
        for task in active.iter_mut() {
            if !task.missed_allowance_deadline && now > task.allowance_deadline {
                task.missed_allowance_deadline = true;
                if let Some(info) = task_infos.get_mut(&task.task.task_type) {
                    info.missed_allowance_deadlines += 1;
                }
                tracing::debug!(
                    "{} on {} missed its allowance deadline (predicted {:.3}s)",
                    task.task,
                    self.id,
                    task.predicted
                );
            }
            if !task.rescheduled && now > task.reschedule_deadline {
                task.rescheduled = true;
                late.push(task.task.as_orphan());
            }
        }
        late
    }

    pub fn stats(&self) -> NodeStats {
        let state = self.lock();
        NodeStats {
            node: self.id.to_string(),
            local: self.is_local,
            suspect: state.suspect,
            dead: state.dead,
            outstanding: state.active.len(),
            executed: state.task_infos.values().map(|info| info.executed).sum(),
            missed_allowance_deadlines: state
                .task_infos
                .values()
                .map(|info| info.missed_allowance_deadlines)
                .sum(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct NodeStats {
    pub node: String,
    pub local: bool,
    pub suspect: bool,
    pub dead: bool,
    pub outstanding: usize,
    pub executed: u64,
    pub missed_allowance_deadlines: u64,
}
