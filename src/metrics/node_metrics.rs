use super::graph::{Aggregate, CalculationGraph, VertexId};
use crate::scheduler::NodeReport;
use std::collections::{BTreeMap, HashMap};

pub const MASTER_QUEUE: &str = "master_queue";
pub const WORKER_QUEUE: &str = "worker_queue";
pub const RUNNING_JOBS: &str = "running_jobs";
pub const QUEUED_TASKS: &str = "queued_tasks";
pub const REMOTE_OUTSTANDING: &str = "remote_outstanding";
pub const BUSIEST_PEER: &str = "busiest_peer";
pub const IDLEST_PEER: &str = "idlest_peer";
pub const LOAD: &str = "load";

struct Peer {
    outstanding: VertexId,
    attached: bool,
}

/// Derived load figures of one node, recomputed from each `NodeReport`.
///
/// `load` is everything this node is waiting on: tasks in its own queues plus
/// tasks outstanding at live peers. Dead peers drop out of the peer aggregates.
pub struct NodeMetrics {
    graph: CalculationGraph,
    master_queue: VertexId,
    worker_queue: VertexId,
    running_jobs: VertexId,
    peer_aggregates: [VertexId; 3],
    peers: HashMap<String, Peer>,
}

impl NodeMetrics {
    pub fn new() -> Self {
        let mut graph = CalculationGraph::new();
        let master_queue = graph.add_input(MASTER_QUEUE, 0.0);
        let worker_queue = graph.add_input(WORKER_QUEUE, 0.0);
        let running_jobs = graph.add_input(RUNNING_JOBS, 0.0);

        let queued = graph.add_aggregate(QUEUED_TASKS, Aggregate::Sum, &[master_queue, worker_queue]);
        let remote = graph.add_aggregate(REMOTE_OUTSTANDING, Aggregate::Sum, &[]);
        let busiest = graph.add_aggregate(BUSIEST_PEER, Aggregate::Max, &[]);
        let idlest = graph.add_aggregate(IDLEST_PEER, Aggregate::Min, &[]);
        graph.add_aggregate(LOAD, Aggregate::Sum, &[queued, remote]);

        Self {
            graph,
            master_queue,
            worker_queue,
            running_jobs,
            peer_aggregates: [remote, busiest, idlest],
            peers: HashMap::new(),
        }
    }

    /// Feeds a report in and returns every metric by name.
    pub fn observe(&mut self, report: &NodeReport) -> BTreeMap<String, f64> {
        self.set(self.master_queue, report.master_queue_length as f64);
        self.set(self.worker_queue, report.worker_queue_length as f64);
        self.set(self.running_jobs, report.running_jobs as f64);

        for peer in report.known_nodes.iter().filter(|peer| !peer.local) {
            let outstanding = self.peer_input(&peer.node);
            self.set(outstanding, peer.outstanding as f64);
            if peer.dead {
                self.retire(&peer.node);
            }
        }
        self.graph.values()
    }

    pub fn value(&self, name: &str) -> Option<f64> {
        self.graph.value_of(name)
    }

    fn set(&mut self, input: VertexId, value: f64) {
        if let Err(e) = self.graph.set(input, value) {
            tracing::error!("Failed to update metric: {}", e);
        }
    }

    fn peer_input(&mut self, node: &str) -> VertexId {
        if let Some(peer) = self.peers.get(node) {
            return peer.outstanding;
        }
        let outstanding = self
            .graph
            .add_input(&format!("peer/{}/outstanding", node), 0.0);
        for aggregate in self.peer_aggregates {
            if let Err(e) = self.graph.attach(aggregate, outstanding) {
                tracing::error!("Failed to attach metrics of {}: {}", node, e);
            }
        }
        self.peers.insert(
            node.to_string(),
            Peer {
                outstanding,
                attached: true,
            },
        );
        outstanding
    }

    fn retire(&mut self, node: &str) {
        let Some(peer) = self.peers.get_mut(node) else {
            return;
        };
        if !peer.attached {
            return;
        }
        peer.attached = false;
        let outstanding = peer.outstanding;
        for aggregate in self.peer_aggregates {
            if let Err(e) = self.graph.detach(aggregate, outstanding) {
                tracing::error!("Failed to detach metrics of {}: {}", node, e);
            }
        }
    }
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self::new()
    }
}
