//! Node Engine
//!
//! Ties the queues, the node registry, gossip and a routing strategy into one
//! running node. Every node is both a master (it accepts job submissions and
//! dispatches their tasks) and a worker (it executes tasks it is sent).
//!
//! ## Background loops
//! - **Message pump**: handles inbound messages as they arrive.
//! - **Membership pump**: turns joined/died/left events into registry changes.
//! - **Work loops**: run administration, then execute one worker-queue task.
//! - **Gossiper** and **best-effort sender**: see their modules.
//!
//! All loops wake each other through a shared `Notify`; the poll interval is
//! only a safety net.

use super::master_queue::{MasterQueue, MasterQueueTypeStats};
use super::node_info::{Availability, NodeStats};
use super::node_list::NodeList;
use super::protocol::{Message, MessageBody};
use super::routing::{Candidate, RoutingStrategy, Selection, strategy_for};
use super::sender::NonEssentialSender;
use super::worker_queue::{AddOutcome, WorkerQueue, WorkerTask};
use crate::context::NodeContext;
use crate::error::SchedulerError;
use crate::estimator::TimeEstimate;
use crate::gossip::{Gossip, Gossiper, NodePerformanceInfo};
use crate::job::{
    JobId, JobInstanceId, JobList, Payload, RunningJobs, TaskHandlerRegistry, TaskId, TaskInstance,
    TaskType,
};
use crate::membership::types::{Location, MembershipEvent, NodeId};
use crate::metrics::NodeMetrics;
use crate::transport::{Endpoint, Outlet, SendMode, Transport};

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;

/// Receives final job results on the node that submitted the job.
pub trait JobCompletionListener: Send + Sync {
    fn job_completed(&self, job: &JobInstanceId, result: &Payload);
}

/// Forwards every completed job into a channel.
pub struct ChannelListener {
    results: mpsc::UnboundedSender<(JobInstanceId, Payload)>,
}

impl ChannelListener {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(JobInstanceId, Payload)>) {
        let (results, receiver) = mpsc::unbounded_channel();
        (Arc::new(Self { results }), receiver)
    }
}

impl JobCompletionListener for ChannelListener {
    fn job_completed(&self, job: &JobInstanceId, result: &Payload) {
        if self.results.send((job.clone(), result.clone())).is_err() {
            tracing::debug!("Result of job {} has no receiver", job);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Lifecycle {
    Starting,
    Running,
    Stopping,
    Terminated,
}

impl Lifecycle {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Lifecycle::Starting,
            1 => Lifecycle::Running,
            2 => Lifecycle::Stopping,
            _ => Lifecycle::Terminated,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    pub node: String,
    pub lifecycle: Lifecycle,
    pub routing: &'static str,
    pub supported_types: Vec<String>,
    pub master_queue_length: usize,
    pub worker_queue_length: usize,
    pub running_jobs: usize,
    pub jobs_submitted: u64,
    pub jobs_completed: u64,
    pub tasks_executed: u64,
    pub tasks_failed: u64,
    pub gossip_quotum: i64,
    /// Performance vectors held, the local one included.
    pub gossip_vectors: usize,
    pub known_nodes: Vec<NodeStats>,
    pub master_queue: Vec<MasterQueueTypeStats>,
    /// Derived load figures, see `metrics::NodeMetrics`.
    pub metrics: BTreeMap<String, f64>,
}

#[derive(Default)]
struct Counters {
    jobs_submitted: AtomicU64,
    jobs_completed: AtomicU64,
    tasks_executed: AtomicU64,
    tasks_failed: AtomicU64,
}

struct Receivers {
    messages: mpsc::UnboundedReceiver<Message>,
    membership: mpsc::UnboundedReceiver<MembershipEvent>,
}

pub struct Node {
    ctx: Arc<NodeContext>,
    jobs: Arc<JobList>,
    handlers: Arc<TaskHandlerRegistry>,
    listener: Arc<dyn JobCompletionListener>,
    outlet: Outlet,
    sender: Arc<NonEssentialSender>,
    gossip: Arc<Gossip>,
    gossiper: Arc<Gossiper>,
    routing: Box<dyn RoutingStrategy>,
    nodes: NodeList,
    supported: Vec<TaskType>,
    master_queue: Mutex<MasterQueue>,
    worker_queue: Mutex<WorkerQueue>,
    running_jobs: RunningJobs,
    pending_registrations: Mutex<Vec<NodeId>>,
    metrics: Mutex<NodeMetrics>,
    /// Held while draining the master queue; only one loop drains at a time.
    drain: Mutex<()>,
    last_update: Mutex<f64>,
    receivers: Mutex<Option<Receivers>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    lifecycle: AtomicU8,
    work_available: Notify,
    shutdown: watch::Sender<bool>,
    counters: Counters,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Node {
    pub fn new(
        ctx: Arc<NodeContext>,
        jobs: Arc<JobList>,
        handlers: Arc<TaskHandlerRegistry>,
        transport: Arc<dyn Transport>,
        endpoint: Endpoint,
        listener: Arc<dyn JobCompletionListener>,
    ) -> Arc<Self> {
        let config = &ctx.config;
        let outlet = Outlet::new(
            ctx.local.clone(),
            transport,
            endpoint.loopback,
            config.essential_timeout,
            config.optional_timeout,
        );
        let sender = Arc::new(NonEssentialSender::new(
            outlet.clone(),
            config.non_essential_attempts,
            config.backoff_base,
            config.backoff_cap,
        ));
        let gossip = Arc::new(Gossip::new(
            ctx.local.clone(),
            ctx.location.clone(),
            jobs.type_count(),
        ));
        let gossiper = Gossiper::new(ctx.clone(), gossip.clone(), sender.clone());

        let supported: Vec<TaskType> = handlers
            .supported_types()
            .into_iter()
            .filter_map(|task_type| jobs.canonical(&task_type))
            .collect();
        let initial = ctx.initial_estimate();

        let nodes = NodeList::new(ctx.local.clone());
        nodes.register_node(ctx.local.clone(), ctx.location.clone(), initial);
        nodes.register_supported_types(&ctx.local, &supported, config, &jobs);

        let worker_queue = WorkerQueue::new(&supported, &jobs, initial, config.fair_worker_queue);
        let (shutdown, _) = watch::channel(false);

        tracing::info!(
            "Node {} executes {} of {} task types, routing: {:?}",
            ctx.local,
            supported.len(),
            jobs.type_count(),
            config.routing
        );

        Arc::new(Self {
            routing: strategy_for(config.routing),
            master_queue: Mutex::new(MasterQueue::new(initial)),
            worker_queue: Mutex::new(worker_queue),
            receivers: Mutex::new(Some(Receivers {
                messages: endpoint.messages,
                membership: endpoint.membership,
            })),
            running_jobs: RunningJobs::new(),
            pending_registrations: Mutex::new(Vec::new()),
            metrics: Mutex::new(NodeMetrics::new()),
            drain: Mutex::new(()),
            last_update: Mutex::new(0.0),
            handles: Mutex::new(Vec::new()),
            lifecycle: AtomicU8::new(Lifecycle::Starting as u8),
            work_available: Notify::new(),
            counters: Counters::default(),
            shutdown,
            supported,
            nodes,
            gossiper,
            gossip,
            sender,
            outlet,
            listener,
            handlers,
            jobs,
            ctx,
        })
    }

    pub fn id(&self) -> &NodeId {
        &self.ctx.local
    }

    pub fn jobs(&self) -> &JobList {
        &self.jobs
    }

    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.load(Ordering::SeqCst))
    }

    /// Spawns every background loop of the node.
    pub fn start(self: &Arc<Self>) {
        let Some(receivers) = lock(&self.receivers).take() else {
            tracing::error!("Node {} started twice", self.ctx.local);
            return;
        };
        self.refresh_local_state();

        let work_loops = self.ctx.config.work_thread_count();
        let mut handles = Vec::with_capacity(work_loops + 4);

        let sender = self.sender.clone();
        handles.push(tokio::spawn(async move { sender.run().await }));
        handles.push(tokio::spawn(self.gossiper.clone().run()));

        let node = self.clone();
        handles.push(tokio::spawn(async move {
            node.message_pump(receivers.messages).await;
        }));
        let node = self.clone();
        handles.push(tokio::spawn(async move {
            node.membership_pump(receivers.membership).await;
        }));

        for worker in 0..work_loops {
            let node = self.clone();
            handles.push(tokio::spawn(async move { node.work_loop(worker).await }));
        }
        lock(&self.handles).extend(handles);

        self.lifecycle
            .store(Lifecycle::Running as u8, Ordering::SeqCst);
        tracing::info!("Node {} running with {} work loops", self.ctx.local, work_loops);
    }

    /// Submits a new job instance; its first stage goes to the master queue.
    pub fn submit(
        &self,
        job: JobId,
        input: Payload,
        user_id: Option<String>,
    ) -> Result<JobInstanceId, SchedulerError> {
        if self.lifecycle() >= Lifecycle::Stopping {
            return Err(SchedulerError::Stopping);
        }
        let first = self
            .jobs
            .first_type(job)
            .ok_or_else(|| SchedulerError::UnknownJob(format!("job id {}", job.0)))?;
        if !self.nodes.any_supports(&first) {
            tracing::warn!("No known node executes {} yet, job will wait", first);
        }

        let now = self.ctx.now();
        let instance = self.ctx.next_job_instance(user_id);
        let task = TaskInstance::new(instance.clone(), first, input);
        self.running_jobs.add(task.clone(), now);
        lock(&self.master_queue).add(task, now);
        self.counters.jobs_submitted.fetch_add(1, Ordering::Relaxed);

        tracing::debug!("Submitted job {}", instance);
        self.work_available.notify_waiters();
        Ok(instance)
    }

    pub fn submit_by_name(
        &self,
        name: &str,
        input: Payload,
        user_id: Option<String>,
    ) -> Result<JobInstanceId, SchedulerError> {
        let job = self
            .jobs
            .job_by_name(name)
            .ok_or_else(|| SchedulerError::UnknownJob(name.to_string()))?;
        self.submit(job.id, input, user_id)
    }

    /// Stops taking new jobs. The node terminates once its own work is done.
    pub fn set_stopped(&self) {
        let _ = self.lifecycle.fetch_max(Lifecycle::Stopping as u8, Ordering::SeqCst);
        tracing::info!("Node {} stopping", self.ctx.local);
        self.work_available.notify_waiters();
    }

    /// Stopped, nothing queued for dispatch, nothing outstanding anywhere and
    /// no submitted job still waiting for its result.
    pub fn is_finished(&self) -> bool {
        self.lifecycle() >= Lifecycle::Stopping
            && lock(&self.master_queue).is_empty()
            && self.nodes.outstanding_total() == 0
            && self.running_jobs.is_empty()
    }

    pub async fn wait_for_termination(&self) {
        let mut shutdown = self.shutdown.subscribe();
        while !*shutdown.borrow_and_update() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
        let handles: Vec<JoinHandle<()>> = lock(&self.handles).drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!("Node {} terminated", self.ctx.local);
    }

    pub fn stats(&self) -> NodeReport {
        let mut report = NodeReport {
            node: self.ctx.local.to_string(),
            lifecycle: self.lifecycle(),
            routing: self.routing.name(),
            supported_types: self.supported.iter().map(|t| t.to_string()).collect(),
            master_queue_length: lock(&self.master_queue).len(),
            worker_queue_length: lock(&self.worker_queue).len(),
            running_jobs: self.running_jobs.len(),
            jobs_submitted: self.counters.jobs_submitted.load(Ordering::Relaxed),
            jobs_completed: self.counters.jobs_completed.load(Ordering::Relaxed),
            tasks_executed: self.counters.tasks_executed.load(Ordering::Relaxed),
            tasks_failed: self.counters.tasks_failed.load(Ordering::Relaxed),
            gossip_quotum: self.gossiper.quotum(),
            gossip_vectors: self.gossip.node_count(),
            known_nodes: self.nodes.stats(),
            master_queue: lock(&self.master_queue).stats(),
            metrics: BTreeMap::new(),
        };
        report.metrics = lock(&self.metrics).observe(&report);
        report
    }

    pub(crate) fn node_list(&self) -> &NodeList {
        &self.nodes
    }

    pub(crate) fn gossip(&self) -> &Gossip {
        &self.gossip
    }

    // ---- loops ----

    async fn message_pump(self: Arc<Self>, mut messages: mpsc::UnboundedReceiver<Message>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                received = messages.recv() => {
                    let Some(message) = received else {
                        tracing::debug!("Inbox of {} closed", self.ctx.local);
                        break;
                    };
                    self.handle_message(message);
                    self.work_available.notify_waiters();
                }
            }
        }
    }

    async fn membership_pump(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<MembershipEvent>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                received = events.recv() => {
                    let Some(event) = received else {
                        break;
                    };
                    match event {
                        MembershipEvent::Joined(id, location) => self.handle_joined(id, location),
                        MembershipEvent::Died(id) => {
                            tracing::warn!("Node {} died", id);
                            self.handle_node_gone(&id);
                        }
                        MembershipEvent::Left(id) => {
                            tracing::info!("Node {} left", id);
                            self.handle_node_gone(&id);
                        }
                    }
                    self.work_available.notify_waiters();
                }
            }
        }
    }

    async fn work_loop(self: Arc<Self>, worker: usize) {
        tracing::debug!("Work loop {} started", worker);
        let poll = self.ctx.config.work_poll_interval;
        let mut shutdown = self.shutdown.subscribe();

        while self.lifecycle() != Lifecycle::Terminated {
            self.update_administration();

            let next = {
                let now = self.ctx.now();
                lock(&self.worker_queue).remove(now)
            };
            match next {
                Some(task) => self.execute(task).await,
                None => {
                    tokio::select! {
                        _ = self.work_available.notified() => {}
                        _ = tokio::time::sleep(poll) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
            self.check_termination();
        }
        tracing::debug!("Work loop {} stopped", worker);
    }

    // ---- administration ----

    fn update_administration(self: &Arc<Self>) {
        let now = self.ctx.now();

        let pending: Vec<NodeId> = lock(&self.pending_registrations).drain(..).collect();
        for id in pending {
            tracing::debug!("Registering with {}", id);
            self.post(
                id,
                MessageBody::RegisterNode {
                    supported_types: self.supported.clone(),
                    location: self.ctx.location.clone(),
                    send_moment: now,
                },
            );
        }

        let late = self.nodes.take_late_tasks(now);
        if !late.is_empty() {
            tracing::warn!("Re-dispatching {} task(s) past their reschedule deadline", late.len());
            lock(&self.master_queue).add_all(late, now);
        }
        let late_after = self.ctx.config.late_job_duration.as_secs_f64();
        while let Some(task) = self.running_jobs.get_late_job(now, late_after) {
            lock(&self.master_queue).add(task, now);
        }

        let update_due = {
            let mut last = lock(&self.last_update);
            if now - *last >= self.ctx.config.update_interval.as_secs_f64() {
                *last = now;
                true
            } else {
                false
            }
        };
        if update_due {
            self.refresh_local_state();
            self.send_updates();
        }

        self.drain_master_queue();
    }

    /// Dispatches as many master-queue tasks as the workers will take.
    fn drain_master_queue(self: &Arc<Self>) {
        let Ok(_draining) = self.drain.try_lock() else {
            return;
        };
        let now = self.ctx.now();
        let mut budget = lock(&self.master_queue).len();
        while budget > 0 {
            budget -= 1;
            let next = lock(&self.master_queue)
                .select_submission(now, |task| self.select_destination(&task.task_type));
            let Some((task, node)) = next else {
                break;
            };
            self.dispatch(task, node);
        }
    }

    fn select_destination(&self, task_type: &TaskType) -> Selection {
        let candidates = self.candidates(task_type);
        if candidates.is_empty() {
            return Selection::NoCandidate;
        }
        self.routing.select_destination(task_type, &candidates)
    }

    /// Live nodes executing `task_type`, with their estimated job completion time.
    ///
    /// Queueing on a worker is estimated from the larger of the gossiped queue
    /// length and the number of our tasks still outstanding there.
    pub(crate) fn candidates(&self, task_type: &TaskType) -> Vec<Candidate> {
        let next = self.jobs.next_type(task_type);
        self.nodes
            .candidates(task_type)
            .into_iter()
            .filter_map(|node| {
                let availability = node.availability(task_type);
                if availability == Availability::Unavailable {
                    return None;
                }
                let downstream = match next {
                    None => TimeEstimate::ZERO,
                    Some(next) => self
                        .gossip
                        .completion_of(&node.id, &next)
                        .unwrap_or(TimeEstimate::INFINITE),
                };
                let stage = match self.gossip.worker_info(&node.id, task_type) {
                    Some(info) => {
                        let waiting = info.queue_length.max(node.outstanding(task_type));
                        node.transmission(task_type)
                            .unwrap_or(TimeEstimate::INFINITE)
                            .add_independent(&info.queue_time(waiting))
                            .add_independent(&info.execution_time)
                    }
                    None => node.roundtrip(task_type).unwrap_or(TimeEstimate::INFINITE),
                };
                Some(Candidate {
                    node: node.id.clone(),
                    availability,
                    estimate: stage.add_independent(&downstream),
                    downstream,
                })
            })
            .collect()
    }

    fn dispatch(self: &Arc<Self>, task: TaskInstance, destination: NodeId) {
        let now = self.ctx.now();
        let task_id = self.ctx.next_task_id();
        let registered = self
            .nodes
            .get(&destination)
            .and_then(|node| node.register_task_start(task.clone(), task_id, now, &self.ctx.config));
        if registered.is_none() {
            tracing::error!("Cannot dispatch {} to {}: node unusable", task, destination);
            lock(&self.master_queue).add_front(task, now);
            return;
        }

        tracing::debug!("Dispatching {} as {} to {}", task, task_id, destination);
        let node = self.clone();
        tokio::spawn(async move {
            let body = MessageBody::RunTask {
                task: task.clone(),
                task_id,
            };
            if let Err(e) = node.send_essential(&destination, body).await {
                tracing::warn!("Dispatch of {} to {} failed, requeueing: {}", task, destination, e);
                if let Some(info) = node.nodes.get(&destination) {
                    info.retract_task(task_id);
                }
                lock(&node.master_queue).add_front(task, node.ctx.now());
                node.work_available.notify_waiters();
            }
        });
    }

    /// Publishes the worker-queue snapshot and recomputes completion times.
    fn refresh_local_state(&self) {
        let type_count = self.jobs.type_count();
        let infos = lock(&self.worker_queue).queue_info(type_count);
        let changed = self.gossip.update_local_queue_info(infos);
        let queue_times = lock(&self.master_queue).queue_times(type_count);
        self.gossip
            .recompute_completion_times(&queue_times, &self.jobs, |id, task_type| {
                self.nodes.transmission(id, task_type)
            });
        if changed {
            self.gossiper.local_state_changed();
        }
    }

    fn send_updates(self: &Arc<Self>) {
        let sources = self.nodes.task_sources();
        if sources.is_empty() {
            return;
        }
        let info = self.gossip.local_info();
        for source in sources {
            self.post(source, MessageBody::UpdateNode { info: info.clone() });
        }
    }

    fn check_termination(self: &Arc<Self>) {
        if self.lifecycle() != Lifecycle::Stopping || !self.is_finished() {
            return;
        }
        let terminated = self.lifecycle.compare_exchange(
            Lifecycle::Stopping as u8,
            Lifecycle::Terminated as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        if terminated.is_err() {
            return;
        }

        tracing::info!("Node {} finished its work, resigning", self.ctx.local);
        for peer in self.nodes.alive_ids() {
            if peer != self.ctx.local {
                self.post(peer, MessageBody::NodeResign);
            }
        }
        self.gossiper.stop();
        self.sender.stop();
        self.shutdown.send_replace(true);
        self.work_available.notify_waiters();
    }

    // ---- sending ----

    /// Sends a message that must not be lost silently: one retry, then the
    /// destination becomes suspect.
    async fn send_essential(&self, destination: &NodeId, body: MessageBody) -> Result<(), SchedulerError> {
        let message = Message::new(self.ctx.local.clone(), body);
        let kind = message.body.kind();
        if let Err(e) = self
            .outlet
            .send(destination, message.clone(), SendMode::Essential)
            .await
        {
            tracing::debug!("Sending {} to {} failed ({}), retrying once", kind, destination, e);
            if let Err(e) = self
                .outlet
                .send(destination, message, SendMode::Essential)
                .await
            {
                self.nodes.mark_suspect(destination);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Sends without waiting: essential messages get their own task with the
    /// single retry, the rest go to the best-effort background sender.
    fn post(self: &Arc<Self>, destination: NodeId, body: MessageBody) {
        if !body.is_essential() {
            self.sender
                .submit(destination, Message::new(self.ctx.local.clone(), body));
            return;
        }
        let node = self.clone();
        tokio::spawn(async move {
            let kind = body.kind();
            if let Err(e) = node.send_essential(&destination, body).await {
                tracing::error!("Dropping {} to {}: {}", kind, destination, e);
            }
        });
    }

    // ---- membership ----

    fn handle_joined(&self, id: NodeId, location: Location) {
        if id == self.ctx.local {
            return;
        }
        let (node, created) = self
            .nodes
            .register_node(id.clone(), location.clone(), self.ctx.initial_estimate());
        if node.is_dead() {
            tracing::warn!("Ignoring join of dead node {}", id);
            return;
        }
        if created {
            tracing::info!("Node {} joined", id);
        }
        self.gossiper.register_node(id.clone(), &location);
        lock(&self.pending_registrations).push(id);
    }

    /// Death or departure: everything outstanding there is dispatched again.
    fn handle_node_gone(&self, id: &NodeId) {
        if *id == self.ctx.local {
            return;
        }
        let orphans = self.nodes.declare_dead(id);
        if !orphans.is_empty() {
            let now = self.ctx.now();
            let queued = lock(&self.master_queue).add_all(orphans, now);
            tracing::info!("Requeued {} orphaned task(s) from {}", queued, id);
        }
        self.gossiper.remove_node(id);
    }

    // ---- inbound messages ----

    fn handle_message(self: &Arc<Self>, message: Message) {
        let Message { source, body } = message;
        tracing::trace!("{} from {}", body.kind(), source);
        self.nodes.received_from(&source);

        match body {
            MessageBody::RegisterNode {
                supported_types,
                location,
                send_moment,
            } => self.on_register(source, supported_types, location, send_moment),
            MessageBody::AcceptNode { send_moment } => self.on_accept(&source, send_moment),
            MessageBody::UpdateNode { info } => self.on_update(&source, info),
            MessageBody::RunTask { task, task_id } => self.on_run_task(source, task, task_id),
            MessageBody::TaskCompleted {
                task_id,
                worker_dwell_time,
                queue_length,
            } => self.on_task_completed(&source, task_id, worker_dwell_time, queue_length),
            MessageBody::TaskFailed { task_id } => self.on_task_failed(&source, task_id),
            MessageBody::Gossip {
                snapshot,
                needs_reply,
            } => self.on_gossip(&source, snapshot, needs_reply),
            MessageBody::NodeResign => {
                tracing::info!("Node {} resigned", source);
                self.handle_node_gone(&source);
            }
            MessageBody::JobResult { job, result } => self.on_job_result(job, result),
        }
    }

    fn on_register(
        self: &Arc<Self>,
        source: NodeId,
        supported_types: Vec<TaskType>,
        location: Location,
        send_moment: f64,
    ) {
        let (node, created) = self.nodes.register_node(
            source.clone(),
            location.clone(),
            self.ctx.initial_estimate(),
        );
        if node.is_dead() {
            tracing::warn!("Registration from dead node {} ignored", source);
            return;
        }

        let known: Vec<TaskType> = supported_types
            .into_iter()
            .filter_map(|task_type| {
                let canonical = self.jobs.canonical(&task_type);
                if canonical.is_none() {
                    tracing::error!("Node {} claims unknown task type {}", source, task_type);
                }
                canonical
            })
            .collect();
        self.nodes
            .register_supported_types(&source, &known, &self.ctx.config, &self.jobs);
        // Gossip may have arrived before the registration.
        if let Some(info) = self.gossip.get(&source) {
            self.apply_queue_reports(&info);
        }
        self.gossiper.register_node(source.clone(), &location);
        if created && source != self.ctx.local {
            lock(&self.pending_registrations).push(source.clone());
        }

        tracing::debug!("Node {} registered {} task type(s)", source, known.len());
        self.post(source, MessageBody::AcceptNode { send_moment });
    }

    fn on_accept(&self, source: &NodeId, send_moment: f64) {
        let Some(node) = self.nodes.get(source) else {
            tracing::error!("AcceptNode from unknown node {}", source);
            return;
        };
        let now = self.ctx.now();
        node.set_accepted((now - send_moment).max(0.0), now);
        tracing::debug!("Node {} accepted us (ping {:.4}s)", source, node.ping());
    }

    fn apply_queue_reports(&self, info: &NodePerformanceInfo) {
        let Some(node) = self.nodes.get(&info.source) else {
            return;
        };
        let max = self.ctx.config.max_allowance;
        for (index, report) in info.worker_queue_info.iter().enumerate() {
            let (Some(report), Some(task_type)) = (report, self.jobs.task_type(index)) else {
                continue;
            };
            if node.update_allowance(&task_type, report.queue_length, max) {
                tracing::trace!(
                    "Allowance of {} for {} is now {:?}",
                    info.source,
                    task_type,
                    node.maximal_allowance(&task_type)
                );
            }
        }
    }

    fn on_update(&self, source: &NodeId, info: NodePerformanceInfo) {
        if info.source != *source {
            tracing::error!("UpdateNode from {} carries the vector of {}", source, info.source);
            return;
        }
        if self.gossip.register(info.clone()) {
            self.apply_queue_reports(&info);
        }
    }

    fn on_run_task(self: &Arc<Self>, source: NodeId, mut task: TaskInstance, task_id: TaskId) {
        let local_type = self
            .jobs
            .canonical(&task.task_type)
            .filter(|task_type| self.supported.contains(task_type));
        let Some(local_type) = local_type else {
            tracing::error!("{} asked us to run unsupported {}", source, task);
            self.post(source, MessageBody::TaskFailed { task_id });
            return;
        };
        task.task_type = local_type;

        if let Some(node) = self.nodes.get(&source) {
            node.mark_task_source();
        }

        let now = self.ctx.now();
        let label = task.to_string();
        let outcome = lock(&self.worker_queue).add(
            WorkerTask::new(source.clone(), task_id, task, now),
            now,
        );
        match outcome {
            AddOutcome::Queued(length) => {
                tracing::debug!("Queued {} from {} ({} waiting)", label, source, length);
                self.refresh_local_state();
                if source != self.ctx.local {
                    let info = self.gossip.local_info();
                    self.post(source, MessageBody::UpdateNode { info });
                }
            }
            AddOutcome::Duplicate => {
                tracing::debug!("{} from {} is already queued, answering both", label, source);
            }
            AddOutcome::Unsupported => {
                tracing::error!("Worker queue has no bucket for {}", label);
            }
        }
    }

    fn on_task_completed(&self, source: &NodeId, task_id: TaskId, dwell: f64, queue_length: usize) {
        let Some(node) = self.nodes.get(source) else {
            tracing::error!("TaskCompleted {} from unknown node {}", task_id, source);
            return;
        };
        let now = self.ctx.now();
        match node.register_task_completed(task_id, now, dwell) {
            Some((active, roundtrip)) => {
                let task_type = active.task.task_type;
                tracing::debug!("{} completed on {} in {:.3}s", active.task, source, roundtrip);
                self.routing.on_task_completed(&task_type, source, roundtrip);
                node.update_allowance(&task_type, queue_length, self.ctx.config.max_allowance);
            }
            None => {
                tracing::debug!("Redundant completion of {} from {}", task_id, source);
            }
        }
    }

    fn on_task_failed(&self, source: &NodeId, task_id: TaskId) {
        let Some(node) = self.nodes.get(source) else {
            tracing::error!("TaskFailed {} from unknown node {}", task_id, source);
            return;
        };
        let Some(active) = node.register_task_failed(task_id) else {
            tracing::debug!("Failure report for unknown task {} from {}", task_id, source);
            return;
        };
        tracing::error!(
            "{} failed on {}; that node no longer gets {}",
            active.task,
            source,
            active.task.task_type
        );
        self.routing.on_task_failed(&active.task.task_type, source);
        lock(&self.master_queue).add(active.task.as_orphan(), self.ctx.now());
    }

    fn on_gossip(&self, source: &NodeId, snapshot: Vec<NodePerformanceInfo>, needs_reply: bool) {
        let advanced = self.gossiper.receive(source, snapshot, needs_reply);
        self.routing.on_gossip_received(source);
        for id in advanced {
            if let Some(info) = self.gossip.get(&id) {
                self.apply_queue_reports(&info);
            }
        }
    }

    fn on_job_result(&self, job: JobInstanceId, result: Payload) {
        if job.origin != self.ctx.local {
            tracing::error!("Result of foreign job {} delivered here", job);
            return;
        }
        if self.running_jobs.complete(&job) {
            self.counters.jobs_completed.fetch_add(1, Ordering::Relaxed);
            tracing::info!("Job {} completed", job);
            self.listener.job_completed(&job, &result);
        } else {
            tracing::debug!("Redundant result for job {}", job);
        }
    }

    // ---- execution ----

    async fn execute(self: &Arc<Self>, task: WorkerTask) {
        let task_type = task.task.task_type;
        let started = self.ctx.now();
        let outcome = self
            .handlers
            .execute(&task_type, task.task.input.clone())
            .await;
        let finished = self.ctx.now();

        match outcome {
            Ok(output) => {
                let queue_length = {
                    let mut queue = lock(&self.worker_queue);
                    queue.record_execution_time(&task_type, finished - started);
                    queue.queue_length(&task_type)
                };
                self.counters.tasks_executed.fetch_add(1, Ordering::Relaxed);
                self.continue_job(&task.task, output, finished);

                for (requester, task_id) in task.requesters() {
                    self.post(
                        requester.clone(),
                        MessageBody::TaskCompleted {
                            task_id,
                            worker_dwell_time: finished - task.arrival,
                            queue_length,
                        },
                    );
                }
            }
            Err(e) => {
                tracing::error!("Handler for {} failed: {:#}", task.task, e);
                self.counters.tasks_failed.fetch_add(1, Ordering::Relaxed);
                lock(&self.worker_queue).mark_failed(&task_type);
                for (requester, task_id) in task.requesters() {
                    self.post(requester.clone(), MessageBody::TaskFailed { task_id });
                }
            }
        }

        self.refresh_local_state();
        self.gossiper.local_state_changed();
        self.work_available.notify_waiters();
    }

    /// Hands the output of a finished stage on: the next stage is queued here,
    /// the last stage's output goes back to the job's origin.
    fn continue_job(self: &Arc<Self>, finished: &TaskInstance, output: Payload, now: f64) {
        match self.jobs.next_type(&finished.task_type) {
            Some(next) => {
                let successor = TaskInstance::new(finished.job_instance.clone(), next, output);
                tracing::trace!("Continuing with {}", successor);
                lock(&self.master_queue).add(successor, now);
            }
            None => {
                let job = finished.job_instance.clone();
                self.post(
                    job.origin.clone(),
                    MessageBody::JobResult { job, result: output },
                );
            }
        }
    }
}
