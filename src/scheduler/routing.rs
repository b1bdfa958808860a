//! Routing Strategies
//!
//! The master side asks a `RoutingStrategy` where the head task of a bucket
//! should go. The node engine builds the candidate list (live nodes executing
//! the type, each with its availability and estimated completion time); the
//! strategy only chooses.
//!
//! - **`GossipRouting`**: minimum estimated completion time.
//! - **`AntRouting`**: follows a per-type trail of nodes that recently delivered.
//! - **`QRouting`**: learns a value per (type, node) from observed round trips.

use super::node_info::Availability;
use crate::config::RoutingKind;
use crate::estimator::TimeEstimate;
use crate::job::TaskType;
use crate::membership::types::NodeId;

use std::collections::HashMap;
use std::sync::Mutex;

/// Learning rate of the Q-routing update.
const Q_LEARNING_RATE: f64 = 0.3;

/// Longest pheromone trail kept per task type.
const MAX_TRAIL: usize = 8;

#[derive(Debug, Clone)]
pub struct Candidate {
    pub node: NodeId,
    pub availability: Availability,
    /// Estimated time until the whole job completes if the task goes there.
    pub estimate: TimeEstimate,
    /// The part of `estimate` spent after this stage finishes on that node.
    pub downstream: TimeEstimate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Dispatch(NodeId),
    /// The preferred node is at its allowance limit; wait rather than overcommit.
    Reserve,
    NoCandidate,
}

impl Selection {
    fn for_candidate(candidate: &Candidate) -> Selection {
        match candidate.availability {
            Availability::Available => Selection::Dispatch(candidate.node.clone()),
            Availability::Reservable => Selection::Reserve,
            Availability::Unavailable => Selection::NoCandidate,
        }
    }
}

pub trait RoutingStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn select_destination(&self, task_type: &TaskType, candidates: &[Candidate]) -> Selection;

    fn on_task_completed(&self, _task_type: &TaskType, _node: &NodeId, _roundtrip: f64) {}

    fn on_task_failed(&self, _task_type: &TaskType, _node: &NodeId) {}

    fn on_gossip_received(&self, _source: &NodeId) {}
}

pub fn strategy_for(kind: RoutingKind) -> Box<dyn RoutingStrategy> {
    match kind {
        RoutingKind::Gossip => Box::new(GossipRouting),
        RoutingKind::Ant => Box::new(AntRouting::default()),
        RoutingKind::QRouting => Box::new(QRouting::default()),
    }
}

fn usable(candidates: &[Candidate]) -> impl Iterator<Item = &Candidate> {
    candidates
        .iter()
        .filter(|candidate| candidate.availability != Availability::Unavailable)
}

/// Ties go to an available node, then to the lower node id.
fn best_by<F>(candidates: &[Candidate], value: F) -> Option<&Candidate>
where
    F: Fn(&Candidate) -> f64,
{
    usable(candidates).min_by(|a, b| {
        value(a)
            .total_cmp(&value(b))
            .then_with(|| {
                let rank = |c: &Candidate| (c.availability != Availability::Available) as u8;
                rank(a).cmp(&rank(b))
            })
            .then_with(|| a.node.cmp(&b.node))
    })
}

#[derive(Debug, Default)]
pub struct GossipRouting;

impl RoutingStrategy for GossipRouting {
    fn name(&self) -> &'static str {
        "gossip"
    }

    fn select_destination(&self, _task_type: &TaskType, candidates: &[Candidate]) -> Selection {
        best_by(candidates, |candidate| candidate.estimate.likely_value())
            .map(Selection::for_candidate)
            .unwrap_or(Selection::NoCandidate)
    }
}

/// Pheromone trail per task type: the node that most recently delivered a
/// result is moved to the front, a node that failed is dropped from it.
#[derive(Debug, Default)]
pub struct AntRouting {
    trails: Mutex<HashMap<TaskType, Vec<NodeId>>>,
}

impl AntRouting {
    pub fn trail(&self, task_type: &TaskType) -> Vec<NodeId> {
        let trails = self.trails.lock().unwrap_or_else(|e| e.into_inner());
        trails.get(task_type).cloned().unwrap_or_default()
    }
}

impl RoutingStrategy for AntRouting {
    fn name(&self) -> &'static str {
        "ant"
    }

    fn select_destination(&self, task_type: &TaskType, candidates: &[Candidate]) -> Selection {
        let trail = self.trail(task_type);

        // Follow the trail to the first node that can take the task now.
        for node in &trail {
            let on_trail = usable(candidates).find(|candidate| candidate.node == *node);
            if let Some(candidate) = on_trail {
                if candidate.availability == Availability::Available {
                    return Selection::Dispatch(candidate.node.clone());
                }
            }
        }

        // No trail yet (or nobody on it is free): explore by estimate.
        let off_trail: Vec<Candidate> = usable(candidates)
            .filter(|candidate| !trail.contains(&candidate.node))
            .cloned()
            .collect();
        match best_by(&off_trail, |candidate| candidate.estimate.likely_value()) {
            Some(candidate) => Selection::for_candidate(candidate),
            None if usable(candidates).next().is_some() => Selection::Reserve,
            None => Selection::NoCandidate,
        }
    }

    fn on_task_completed(&self, task_type: &TaskType, node: &NodeId, _roundtrip: f64) {
        let mut trails = self.trails.lock().unwrap_or_else(|e| e.into_inner());
        let trail = trails.entry(*task_type).or_default();
        trail.retain(|known| known != node);
        trail.insert(0, node.clone());
        trail.truncate(MAX_TRAIL);
    }

    fn on_task_failed(&self, task_type: &TaskType, node: &NodeId) {
        let mut trails = self.trails.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(trail) = trails.get_mut(task_type) {
            trail.retain(|known| known != node);
        }
    }
}

/// Learned per-(type, node) stage times, combined with the gossiped downstream
/// estimate of the node. Until a pair has been observed the gossip estimate is used.
#[derive(Debug, Default)]
pub struct QRouting {
    values: Mutex<HashMap<(TaskType, NodeId), f64>>,
}

impl QRouting {
    pub fn value(&self, task_type: &TaskType, node: &NodeId) -> Option<f64> {
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.get(&(*task_type, node.clone())).copied()
    }
}

impl RoutingStrategy for QRouting {
    fn name(&self) -> &'static str {
        "q-routing"
    }

    fn select_destination(&self, task_type: &TaskType, candidates: &[Candidate]) -> Selection {
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        best_by(candidates, |candidate| {
            match values.get(&(*task_type, candidate.node.clone())) {
                Some(stage) => stage + candidate.downstream.likely_value(),
                None => candidate.estimate.likely_value(),
            }
        })
        .map(Selection::for_candidate)
        .unwrap_or(Selection::NoCandidate)
    }

    fn on_task_completed(&self, task_type: &TaskType, node: &NodeId, roundtrip: f64) {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values
            .entry((*task_type, node.clone()))
            .and_modify(|value| {
                if value.is_finite() {
                    *value += Q_LEARNING_RATE * (roundtrip - *value);
                } else {
                    *value = roundtrip;
                }
            })
            .or_insert(roundtrip);
    }

    fn on_task_failed(&self, task_type: &TaskType, node: &NodeId) {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.insert((*task_type, node.clone()), f64::INFINITY);
    }
}
