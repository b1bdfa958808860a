use super::node_info::{NodeInfo, NodeStats};
use crate::config::NodeConfig;
use crate::estimator::TimeEstimate;
use crate::job::{JobList, TaskInstance, TaskType};
use crate::membership::types::{Location, NodeId};

use dashmap::DashMap;
use std::sync::Arc;

/// Every node this node knows about, keyed by id.
///
/// Entries are never removed: a dead node stays in the list, marked dead, so that
/// late messages from it are recognized and ignored.
pub struct NodeList {
    local: NodeId,
    nodes: DashMap<NodeId, Arc<NodeInfo>>,
}

impl NodeList {
    pub fn new(local: NodeId) -> Self {
        Self {
            local,
            nodes: DashMap::new(),
        }
    }

    /// Returns the entry for `id` and whether it was created by this call.
    pub fn register_node(&self, id: NodeId, location: Location, initial_estimate: f64) -> (Arc<NodeInfo>, bool) {
        if let Some(existing) = self.nodes.get(&id) {
            return (existing.clone(), false);
        }
        let is_local = id == self.local;
        let entry = self
            .nodes
            .entry(id.clone())
            .or_insert_with(|| Arc::new(NodeInfo::new(id, location, is_local, initial_estimate)));
        (entry.clone(), true)
    }

    pub fn register_supported_types(
        &self,
        id: &NodeId,
        types: &[TaskType],
        config: &NodeConfig,
        jobs: &JobList,
    ) -> bool {
        match self.get(id) {
            Some(node) => {
                node.register_types(types, config, |task_type| jobs.predicted_time(task_type));
                true
            }
            None => {
                tracing::error!("Supported types for unregistered node {}", id);
                false
            }
        }
    }

    pub fn get(&self, id: &NodeId) -> Option<Arc<NodeInfo>> {
        self.nodes.get(id).map(|entry| entry.clone())
    }

    pub fn local(&self) -> Option<Arc<NodeInfo>> {
        self.get(&self.local)
    }

    /// Any message from a node lifts a suspicion against it.
    pub fn received_from(&self, id: &NodeId) {
        if let Some(node) = self.get(id) {
            if node.clear_suspect() {
                tracing::info!("Node {} is reachable again", id);
            }
        }
    }

    pub fn mark_suspect(&self, id: &NodeId) {
        if let Some(node) = self.get(id) {
            if node.set_suspect() {
                tracing::warn!("Node {} is suspect", id);
            }
        }
    }

    /// Returns the orphaned tasks the first time a node is declared dead.
    pub fn declare_dead(&self, id: &NodeId) -> Vec<TaskInstance> {
        match self.get(id) {
            Some(node) => {
                let orphans = node.set_dead();
                if !orphans.is_empty() {
                    tracing::warn!("Node {} is dead, rescuing {} task(s)", id, orphans.len());
                }
                orphans
            }
            None => Vec::new(),
        }
    }

    /// Nodes that execute `task_type` and are neither dead nor suspect.
    pub fn candidates(&self, task_type: &TaskType) -> Vec<Arc<NodeInfo>> {
        let nodes: Vec<Arc<NodeInfo>> = self.nodes.iter().map(|entry| entry.clone()).collect();
        let mut candidates: Vec<Arc<NodeInfo>> = nodes
            .into_iter()
            .filter(|node| !node.is_dead() && !node.is_suspect() && node.supports(task_type))
            .collect();
        candidates.sort_by(|a, b| a.id.cmp(&b.id));
        candidates
    }

    /// Whether any live node (this one included) executes `task_type`.
    pub fn any_supports(&self, task_type: &TaskType) -> bool {
        self.nodes
            .iter()
            .any(|entry| !entry.is_dead() && entry.supports(task_type))
    }

    pub fn alive_ids(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|entry| !entry.is_dead())
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn task_sources(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|entry| entry.is_task_source() && !entry.is_dead() && *entry.key() != self.local)
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn outstanding_total(&self) -> usize {
        self.nodes.iter().map(|entry| entry.outstanding_total()).sum()
    }

    /// Collects tasks past their reschedule deadline on any live node.
    pub fn take_late_tasks(&self, now: f64) -> Vec<TaskInstance> {
        let nodes: Vec<Arc<NodeInfo>> = self.nodes.iter().map(|entry| entry.clone()).collect();
        nodes
            .into_iter()
            .filter(|node| !node.is_dead())
            .flat_map(|node| node.take_late_tasks(now))
            .collect()
    }

    /// Transmission estimate used by the completion-time recomputation.
    ///
    /// `None` for nodes that must not be considered: unknown, dead, suspect or
    /// not executing the type.
    pub fn transmission(&self, id: &NodeId, task_type: &TaskType) -> Option<TimeEstimate> {
        let node = self.get(id)?;
        if node.is_dead() || node.is_suspect() {
            return None;
        }
        node.transmission(task_type)
    }

    pub fn stats(&self) -> Vec<NodeStats> {
        let mut stats: Vec<NodeStats> = self.nodes.iter().map(|entry| entry.stats()).collect();
        stats.sort_by(|a, b| a.node.cmp(&b.node));
        stats
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
