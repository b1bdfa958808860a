//! Gossiper Loop
//!
//! Pushes this node's performance vector to peers. Pushes are paid for out of a
//! bounded budget (the quotum): registering a node, learning something new or a
//! local state change earns budget, every message sent costs one unit. Peers are
//! visited in order of when their information goes stale; peers in the same
//! cluster go stale sooner than remote ones.

use super::counter::UpDownCounter;
use super::store::Gossip;
use crate::context::NodeContext;
use crate::membership::types::{Location, NodeId};
use crate::scheduler::protocol::{Message, MessageBody};
use crate::scheduler::sender::NonEssentialSender;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Longest the loop sleeps without re-checking its state.
const MAX_IDLE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
struct GossipTarget {
    id: NodeId,
    next_due: f64,
    same_cluster: bool,
    rank: u64,
}

pub struct Gossiper {
    ctx: Arc<NodeContext>,
    gossip: Arc<Gossip>,
    sender: Arc<NonEssentialSender>,
    quotum: UpDownCounter,
    targets: Mutex<Vec<GossipTarget>>,
    direct_replies: Mutex<VecDeque<NodeId>>,
    wake: Notify,
    stopped: AtomicBool,
}

impl Gossiper {
    pub fn new(
        ctx: Arc<NodeContext>,
        gossip: Arc<Gossip>,
        sender: Arc<NonEssentialSender>,
    ) -> Arc<Self> {
        let ceiling = ctx.config.gossip_quotum_ceiling;
        Arc::new(Self {
            ctx,
            gossip,
            sender,
            quotum: UpDownCounter::new(0, ceiling),
            targets: Mutex::new(Vec::new()),
            direct_replies: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
            stopped: AtomicBool::new(false),
        })
    }

    fn interval(&self, same_cluster: bool) -> f64 {
        if same_cluster {
            self.ctx.config.same_cluster_gossip_interval.as_secs_f64()
        } else {
            self.ctx.config.cross_cluster_gossip_interval.as_secs_f64()
        }
    }

    /// Starts gossiping with a newly known node. Its information counts as stale right away.
    pub fn register_node(&self, id: NodeId, location: &Location) {
        if id == self.ctx.local || self.gossip.is_departed(&id) {
            return;
        }
        {
            let mut targets = self.targets.lock().unwrap_or_else(|e| e.into_inner());
            if targets.iter().any(|target| target.id == id) {
                return;
            }
            targets.push(GossipTarget {
                rank: self.ctx.location.distance_rank(location),
                same_cluster: self.ctx.location.same_cluster(location),
                next_due: self.ctx.now(),
                id,
            });
        }
        self.quotum.up();
    }

    pub fn remove_node(&self, id: &NodeId) {
        let mut targets = self.targets.lock().unwrap_or_else(|e| e.into_inner());
        targets.retain(|target| target.id != *id);
        drop(targets);
        self.gossip.remove(id);
    }

    /// Handles an incoming gossip push. Returns the nodes whose vectors advanced.
    pub fn receive(
        &self,
        source: &NodeId,
        snapshot: Vec<crate::gossip::NodePerformanceInfo>,
        needs_reply: bool,
    ) -> Vec<NodeId> {
        let learned = self.gossip.register_all(snapshot);
        if !learned.is_empty() {
            self.quotum.up();
        }
        if needs_reply {
            self.queue_direct_reply(source.clone());
        }
        learned
    }

    pub fn queue_direct_reply(&self, target: NodeId) {
        {
            let mut replies = self.direct_replies.lock().unwrap_or_else(|e| e.into_inner());
            if !replies.contains(&target) {
                replies.push_back(target);
            }
        }
        self.wake.notify_one();
    }

    /// A failed task, a new queue length or a new execution-time sample.
    pub fn local_state_changed(&self) {
        self.quotum.up();
    }

    pub fn quotum(&self) -> i64 {
        self.quotum.value()
    }

    pub fn target_count(&self) -> usize {
        self.targets.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.wake.notify_one();
        self.quotum.add(0);
    }

    /// Decides what to send now: queued direct replies first (no reply requested),
    /// then stale targets for as long as the quotum lasts (reply requested).
    pub(crate) fn plan_sends(&self, now: f64) -> Vec<(NodeId, bool)> {
        let mut plan: Vec<(NodeId, bool)> = {
            let mut replies = self.direct_replies.lock().unwrap_or_else(|e| e.into_inner());
            replies.drain(..).map(|target| (target, false)).collect()
        };

        let mut targets = self.targets.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            let due = targets
                .iter_mut()
                .filter(|target| target.next_due <= now)
                .min_by(|a, b| a.next_due.total_cmp(&b.next_due).then(a.rank.cmp(&b.rank)));
            let Some(target) = due else {
                break;
            };
            if !self.quotum.try_down() {
                break;
            }
            target.next_due = now + self.interval(target.same_cluster);
            plan.push((target.id.clone(), true));
        }
        plan
    }

    /// Time of the next target going stale, if any.
    fn next_due(&self) -> Option<f64> {
        let targets = self.targets.lock().unwrap_or_else(|e| e.into_inner());
        targets
            .iter()
            .map(|target| target.next_due)
            .min_by(|a, b| a.total_cmp(b))
    }

    pub async fn run(self: Arc<Self>) {
        tracing::info!("Gossiper started");

        while !self.stopped.load(Ordering::SeqCst) {
            let now = self.ctx.now();
            let plan = self.plan_sends(now);
            if !plan.is_empty() {
                let snapshot = self.gossip.snapshot();
                for (target, needs_reply) in plan {
                    tracing::trace!("Gossiping to {} (needs_reply={})", target, needs_reply);
                    self.sender.submit(
                        target,
                        Message::new(
                            self.ctx.local.clone(),
                            MessageBody::Gossip {
                                snapshot: snapshot.clone(),
                                needs_reply,
                            },
                        ),
                    );
                }
            }

            let now = self.ctx.now();
            let wait = if self.quotum.value() <= 0 {
                MAX_IDLE
            } else {
                match self.next_due() {
                    Some(due) => Duration::from_secs_f64((due - now).max(0.0)).min(MAX_IDLE),
                    None => MAX_IDLE,
                }
            };

            tokio::select! {
                _ = self.wake.notified() => {}
                _ = self.quotum.wait_change(wait) => {}
            }
        }

        tracing::info!("Gossiper stopped");
    }
}
