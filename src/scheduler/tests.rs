//! Scheduler Module Tests
//!
//! ## Test Scopes
//! - **Queues**: Priority and job-instance ordering, reservation skips, duplicate filtering.
//! - **Node registry**: Allowance control, deadlines, orphan rescue, liveness.
//! - **Routing**: The three strategies.
//! - **Sender**: Retry with backoff and bounded attempts.
//! - **Cluster**: Whole nodes over the in-process network, end to end.

#[cfg(test)]
mod tests {
    use crate::config::{NodeConfig, RoutingKind};
    use crate::context::NodeContext;
    use crate::error::SchedulerError;
    use crate::estimator::TimeEstimate;
    use crate::job::{
        JobId, JobInstanceId, JobList, Payload, StageSpec, TaskHandlerRegistry, TaskId,
        TaskInstance, TaskType,
    };
    use crate::membership::types::{Location, NodeId};
    use crate::scheduler::master_queue::MasterQueue;
    use crate::scheduler::node::{ChannelListener, Lifecycle, Node};
    use crate::scheduler::node_info::{Availability, NodeInfo};
    use crate::scheduler::protocol::{Message, MessageBody};
    use crate::scheduler::routing::{AntRouting, Candidate, GossipRouting, QRouting, RoutingStrategy, Selection};
    use crate::scheduler::sender::NonEssentialSender;
    use crate::scheduler::worker_queue::{AddOutcome, WorkerQueue, WorkerTask};
    use crate::transport::local::LocalNetwork;
    use crate::transport::{Outlet, Transport};

    use async_trait::async_trait;
    use rand::Rng;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn node(name: &str) -> NodeId {
        NodeId(name.to_string())
    }

    fn pipeline(stages: usize) -> (JobList, JobId, Vec<TaskType>) {
        let mut jobs = JobList::new();
        let specs = (0..stages)
            .map(|i| StageSpec::predictable(&format!("stage{}", i), 0.01))
            .collect();
        let id = jobs.register_pipeline("pipeline", specs).unwrap();
        let types = jobs.stages(id).to_vec();
        (jobs, id, types)
    }

    fn instance(serial: u64) -> JobInstanceId {
        JobInstanceId {
            origin: node("origin"),
            serial,
            user_id: None,
        }
    }

    fn task(serial: u64, task_type: TaskType) -> TaskInstance {
        TaskInstance::new(instance(serial), task_type, json!(serial))
    }

    fn remote_node(types: &[TaskType], config: &NodeConfig, jobs: &JobList) -> NodeInfo {
        let info = NodeInfo::new(node("remote"), Location::new(&["lab"], "remote"), false, 1.0);
        info.register_types(types, config, |t| jobs.predicted_time(t));
        info.set_accepted(0.002, 0.0);
        info
    }

    // ============================================================
    // MASTER QUEUE
    // ============================================================

    #[test]
    fn test_master_queue_prefers_lower_priority_number() {
        let (_, _, types) = pipeline(2);
        let (a, b) = (types[0], types[1]);
        let mut queue = MasterQueue::new(1.0);

        // B is queued first but A has the lower stage-priority number.
        queue.add(task(1, b), 0.0);
        queue.add(task(2, a), 0.0);

        let (first, destination) = queue
            .select_submission(1.0, |_| Selection::Dispatch(node("w")))
            .unwrap();
        assert_eq!(first.task_type, a);
        assert_eq!(destination, node("w"));

        let (second, _) = queue
            .select_submission(1.0, |_| Selection::Dispatch(node("w")))
            .unwrap();
        assert_eq!(second.task_type, b);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_master_queue_skips_reserved_bucket() {
        let (_, _, types) = pipeline(2);
        let (a, b) = (types[0], types[1]);
        let mut queue = MasterQueue::new(1.0);
        queue.add(task(1, a), 0.0);
        queue.add(task(2, b), 0.0);

        let picked = queue.select_submission(1.0, |task| {
            if task.task_type == a {
                Selection::Reserve
            } else {
                Selection::Dispatch(node("w"))
            }
        });

        assert_eq!(picked.unwrap().0.task_type, b);
        assert_eq!(queue.queue_length(&a), 1);
        assert!(queue
            .select_submission(1.0, |_| Selection::NoCandidate)
            .is_none());
    }

    #[test]
    fn test_master_queue_orders_by_job_instance_and_retries_first() {
        let (_, _, types) = pipeline(1);
        let mut queue = MasterQueue::new(1.0);
        for serial in [3, 1, 2] {
            assert!(queue.add(task(serial, types[0]), 0.0));
        }
        assert!(!queue.add(task(2, types[0]), 0.0));

        let mut order = Vec::new();
        while let Some((task, _)) = queue.select_submission(0.0, |_| Selection::Dispatch(node("w"))) {
            order.push(task.job_instance.serial);
            if order.len() == 1 {
                // A failed send puts the task back at the head.
                queue.add_front(task, 0.0);
            }
        }
        assert_eq!(order, vec![1, 1, 2, 3]);
    }

    #[test]
    fn test_master_queue_times_scale_with_backlog() {
        let (_, _, types) = pipeline(2);
        let mut queue = MasterQueue::new(2.0);
        queue.add(task(1, types[1]), 0.0);
        queue.add(task(2, types[1]), 0.0);

        let times = queue.queue_times(2);
        assert_eq!(times[0], TimeEstimate::ZERO);
        assert!((times[1].mean - 4.0).abs() < 1e-9);
    }

    // ============================================================
    // WORKER QUEUE
    // ============================================================

    #[test]
    fn test_worker_queue_attaches_duplicates_to_waiting_task() {
        let (jobs, _, types) = pipeline(1);
        let mut queue = WorkerQueue::new(&types, &jobs, 1.0, false);

        let first = queue.add(WorkerTask::new(node("m1"), TaskId(1), task(1, types[0]), 0.0), 0.0);
        let again = queue.add(WorkerTask::new(node("m2"), TaskId(7), task(1, types[0]), 0.1), 0.1);

        assert_eq!(first, AddOutcome::Queued(1));
        assert_eq!(again, AddOutcome::Duplicate);
        assert_eq!(queue.len(), 1);

        let waiting = queue.remove(0.2).unwrap();
        let requesters: Vec<(NodeId, TaskId)> = waiting
            .requesters()
            .map(|(source, id)| (source.clone(), id))
            .collect();
        assert_eq!(requesters, vec![(node("m1"), TaskId(1)), (node("m2"), TaskId(7))]);
    }

    #[test]
    fn test_worker_queue_rejects_unsupported_types() {
        let (jobs, _, types) = pipeline(2);
        let mut queue = WorkerQueue::new(&types[..1], &jobs, 1.0, false);

        let outcome = queue.add(WorkerTask::new(node("m"), TaskId(1), task(1, types[1]), 0.0), 0.0);

        assert_eq!(outcome, AddOutcome::Unsupported);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_worker_queue_priority_and_fair_order() {
        let (jobs, _, types) = pipeline(2);

        let mut strict = WorkerQueue::new(&types, &jobs, 1.0, false);
        let mut fair = WorkerQueue::new(&types, &jobs, 1.0, true);
        for queue in [&mut strict, &mut fair] {
            for serial in 0..2 {
                queue.add(WorkerTask::new(node("m"), TaskId(serial), task(serial, types[1]), 0.0), 0.0);
                queue.add(WorkerTask::new(node("m"), TaskId(10 + serial), task(serial, types[0]), 0.0), 0.0);
            }
        }

        let strict_order: Vec<usize> = std::iter::from_fn(|| strict.remove(1.0))
            .map(|t| t.task.task_type.index)
            .collect();
        let fair_order: Vec<usize> = std::iter::from_fn(|| fair.remove(1.0))
            .map(|t| t.task.task_type.index)
            .collect();

        assert_eq!(strict_order, vec![0, 0, 1, 1]);
        assert_eq!(fair_order, vec![0, 1, 0, 1]);
    }

    #[test]
    fn test_worker_queue_info_reflects_state() {
        let (jobs, _, types) = pipeline(2);
        let mut queue = WorkerQueue::new(&types[..1], &jobs, 1.0, false);
        queue.add(WorkerTask::new(node("m"), TaskId(1), task(1, types[0]), 0.0), 0.0);
        queue.record_execution_time(&types[0], 0.5);

        let info = queue.queue_info(2);
        let stage0 = info[0].as_ref().unwrap();
        assert_eq!(stage0.queue_length, 1);
        assert!((stage0.execution_time.mean - 0.5).abs() < 1e-9);
        assert!(info[1].is_none());

        queue.mark_failed(&types[0]);
        assert!(queue.queue_info(2)[0].as_ref().unwrap().execution_time.is_infinite());
    }

    // ============================================================
    // NODE REGISTRY
    // ============================================================

    #[test]
    fn test_allowance_stays_in_bounds_and_moves_with_queue_length() {
        let (jobs, _, types) = pipeline(1);
        let config = NodeConfig::default();
        let info = remote_node(&types, &config, &jobs);
        let t = types[0];
        assert_eq!(info.maximal_allowance(&t), Some(0));

        let mut rng = rand::thread_rng();
        let mut next_id = 0u64;
        for _ in 0..500 {
            // Bring the node to its limit, or leave it below at random.
            let allowance = info.maximal_allowance(&t).unwrap();
            let outstanding = info.outstanding(&t);
            if outstanding < allowance && rng.gen_range(0..2) == 0 {
                for _ in outstanding..allowance {
                    next_id += 1;
                    info.register_task_start(task(next_id, t), TaskId(next_id), 0.0, &config);
                }
            }

            let at_limit = info.outstanding(&t) >= allowance;
            let queue_length = rng.gen_range(0..8usize);
            info.update_allowance(&t, queue_length, config.max_allowance);
            let after = info.maximal_allowance(&t).unwrap();

            assert!(after <= config.max_allowance);
            if !at_limit || queue_length == 1 {
                assert_eq!(after, allowance);
            } else if queue_length == 0 {
                assert!(after >= allowance);
            } else {
                assert!(after <= allowance);
            }

            // Occasionally let a task complete.
            if info.outstanding(&t) > 0 && rng.gen_range(0..3) == 0 {
                let done = TaskId(next_id);
                info.register_task_completed(done, 1.0, 0.5);
            }
        }
    }

    #[test]
    fn test_allowance_rules() {
        let (jobs, _, types) = pipeline(1);
        let config = NodeConfig::default();
        let info = remote_node(&types, &config, &jobs);
        let t = types[0];

        // Remote nodes start with nothing allowed.
        assert_eq!(info.availability(&t), Availability::Reservable);
        assert!(info.update_allowance(&t, 0, 10));
        assert_eq!(info.availability(&t), Availability::Available);

        info.register_task_start(task(1, t), TaskId(1), 0.0, &config);
        assert_eq!(info.availability(&t), Availability::Reservable);
        assert!(!info.update_allowance(&t, 1, 10));
        assert!(info.update_allowance(&t, 3, 10));
        assert_eq!(info.maximal_allowance(&t), Some(0));
        assert!(!info.update_allowance(&t, 9, 10));

        for _ in 0..20 {
            info.update_allowance(&t, 0, 10);
        }
        assert_eq!(info.maximal_allowance(&t), Some(2));
    }

    #[test]
    fn test_dead_node_returns_every_outstanding_task_once() {
        let (jobs, _, types) = pipeline(2);
        let config = NodeConfig::default();
        let info = remote_node(&types, &config, &jobs);
        let n = 7;
        for i in 0..n {
            let started = info.register_task_start(task(i, types[(i % 2) as usize]), TaskId(i), 0.0, &config);
            assert!(started.is_some());
        }
        assert_eq!(info.outstanding_total(), n as usize);

        let orphans = info.set_dead();
        assert_eq!(orphans.len(), n as usize);
        assert!(orphans.iter().all(|orphan| orphan.orphan));
        assert!(info.set_dead().is_empty());
        assert!(info.is_dead() && info.is_suspect());
        assert!(!info.clear_suspect());
        assert!(info.register_task_start(task(99, types[0]), TaskId(99), 0.0, &config).is_none());

        let mut queue = MasterQueue::new(1.0);
        assert_eq!(queue.add_all(orphans, 1.0), n as usize);
        assert_eq!(queue.len(), n as usize);
    }

    #[test]
    fn test_completion_is_counted_once() {
        let (jobs, _, types) = pipeline(1);
        let config = NodeConfig::default();
        let info = remote_node(&types, &config, &jobs);
        info.register_task_start(task(1, types[0]), TaskId(1), 0.0, &config);

        let (active, roundtrip) = info.register_task_completed(TaskId(1), 0.4, 0.3).unwrap();
        assert_eq!(active.task, task(1, types[0]));
        assert!((roundtrip - 0.4).abs() < 1e-9);
        assert!(info.register_task_completed(TaskId(1), 0.5, 0.3).is_none());
        assert_eq!(info.outstanding(&types[0]), 0);
    }

    #[test]
    fn test_failed_type_is_no_longer_offered() {
        let (jobs, _, types) = pipeline(1);
        let config = NodeConfig::default();
        let info = remote_node(&types, &config, &jobs);
        info.update_allowance(&types[0], 0, 10);
        info.register_task_start(task(1, types[0]), TaskId(1), 0.0, &config);

        assert!(info.register_task_failed(TaskId(1)).is_some());
        assert_eq!(info.availability(&types[0]), Availability::Unavailable);
        assert_eq!(info.maximal_allowance(&types[0]), Some(0));
        assert!(info.roundtrip(&types[0]).unwrap().is_infinite());
    }

    #[test]
    fn test_deadlines_and_late_tasks() {
        let (jobs, _, types) = pipeline(1);
        let config = NodeConfig::default();
        let info = remote_node(&types, &config, &jobs);

        let active = info
            .register_task_start(task(1, types[0]), TaskId(1), 10.0, &config)
            .unwrap();
        let interval = config.allowance_interval(active.predicted);
        assert!((active.allowance_deadline - (10.0 + interval)).abs() < 1e-9);
        assert!(
            (active.reschedule_deadline - (10.0 + interval * config.reschedule_deadline_multiplier)).abs()
                < 1e-9
        );

        assert!(info.take_late_tasks(active.allowance_deadline + 0.001).is_empty());
        let late = info.take_late_tasks(active.reschedule_deadline + 0.001);
        assert_eq!(late.len(), 1);
        assert!(late[0].orphan);
        // Re-dispatched once only; the original stays outstanding.
        assert!(info.take_late_tasks(active.reschedule_deadline + 100.0).is_empty());
        assert_eq!(info.outstanding_total(), 1);
        assert_eq!(info.stats().missed_allowance_deadlines, 1);
    }

    #[test]
    fn test_retract_and_suspicion() {
        let (jobs, _, types) = pipeline(1);
        let config = NodeConfig::default();
        let info = remote_node(&types, &config, &jobs);
        info.update_allowance(&types[0], 0, 10);
        info.register_task_start(task(1, types[0]), TaskId(1), 0.0, &config);

        assert!(info.retract_task(TaskId(1)).is_some());
        assert_eq!(info.outstanding_total(), 0);

        assert!(info.set_suspect());
        assert_eq!(info.availability(&types[0]), Availability::Unavailable);
        assert!(info.clear_suspect());
        assert_eq!(info.availability(&types[0]), Availability::Available);
    }

    // ============================================================
    // ROUTING
    // ============================================================

    fn candidate(name: &str, availability: Availability, estimate: f64) -> Candidate {
        Candidate {
            node: node(name),
            availability,
            estimate: TimeEstimate::exact(estimate),
            downstream: TimeEstimate::ZERO,
        }
    }

    #[test]
    fn test_gossip_routing_picks_fastest_or_reserves() {
        let (_, _, types) = pipeline(1);
        let routing = GossipRouting;

        let candidates = vec![
            candidate("slow", Availability::Available, 5.0),
            candidate("fast", Availability::Available, 1.0),
        ];
        assert_eq!(routing.select_destination(&types[0], &candidates), Selection::Dispatch(node("fast")));

        let candidates = vec![
            candidate("slow", Availability::Available, 5.0),
            candidate("fast", Availability::Reservable, 1.0),
        ];
        assert_eq!(routing.select_destination(&types[0], &candidates), Selection::Reserve);

        assert_eq!(routing.select_destination(&types[0], &[]), Selection::NoCandidate);
    }

    #[test]
    fn test_ant_routing_follows_the_trail() {
        let (_, _, types) = pipeline(1);
        let t = types[0];
        let routing = AntRouting::default();
        let candidates = vec![
            candidate("a", Availability::Available, 1.0),
            candidate("b", Availability::Available, 2.0),
        ];

        // No trail yet: explore by estimate.
        assert_eq!(routing.select_destination(&t, &candidates), Selection::Dispatch(node("a")));

        routing.on_task_completed(&t, &node("b"), 0.3);
        assert_eq!(routing.select_destination(&t, &candidates), Selection::Dispatch(node("b")));

        routing.on_task_completed(&t, &node("a"), 0.3);
        assert_eq!(routing.trail(&t), vec![node("a"), node("b")]);

        routing.on_task_failed(&t, &node("a"));
        assert_eq!(routing.trail(&t), vec![node("b")]);
    }

    #[test]
    fn test_q_routing_learns_from_round_trips() {
        let (_, _, types) = pipeline(1);
        let t = types[0];
        let routing = QRouting::default();
        let candidates = vec![
            candidate("a", Availability::Available, 1.0),
            candidate("b", Availability::Available, 2.0),
        ];
        assert_eq!(routing.select_destination(&t, &candidates), Selection::Dispatch(node("a")));

        // "a" turns out to be slow in practice.
        routing.on_task_completed(&t, &node("a"), 10.0);
        routing.on_task_completed(&t, &node("b"), 0.5);
        assert_eq!(routing.select_destination(&t, &candidates), Selection::Dispatch(node("b")));

        routing.on_task_completed(&t, &node("b"), 1.5);
        let learned = routing.value(&t, &node("b")).unwrap();
        assert!((learned - 0.8).abs() < 1e-9);

        routing.on_task_failed(&t, &node("b"));
        assert_eq!(routing.select_destination(&t, &candidates), Selection::Dispatch(node("a")));
    }

    // ============================================================
    // BEST-EFFORT SENDER
    // ============================================================

    struct FlakyTransport {
        failures: usize,
        calls: AtomicUsize,
        delivered: Mutex<Vec<Message>>,
    }

    #[async_trait]
    impl Transport for FlakyTransport {
        async fn send(&self, destination: &NodeId, message: Message, _timeout: Duration) -> Result<(), SchedulerError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(SchedulerError::UnknownNode(destination.clone()));
            }
            self.delivered.lock().unwrap().push(message);
            Ok(())
        }
    }

    fn flaky_sender(failures: usize, attempts: u32) -> (Arc<NonEssentialSender>, Arc<FlakyTransport>) {
        let transport = Arc::new(FlakyTransport {
            failures,
            calls: AtomicUsize::new(0),
            delivered: Mutex::new(Vec::new()),
        });
        let (loopback, _) = mpsc::unbounded_channel();
        let outlet = Outlet::new(
            node("me"),
            transport.clone(),
            loopback,
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        let sender = Arc::new(NonEssentialSender::new(
            outlet,
            attempts,
            Duration::from_millis(5),
            Duration::from_millis(20),
        ));
        (sender, transport)
    }

    #[tokio::test]
    async fn test_sender_retries_until_delivered() {
        let (sender, transport) = flaky_sender(2, 5);
        let runner = sender.clone();
        let handle = tokio::spawn(async move { runner.run().await });

        sender.submit(node("peer"), Message::new(node("me"), MessageBody::NodeResign));

        for _ in 0..100 {
            if !transport.delivered.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(transport.delivered.lock().unwrap().len(), 1);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);

        sender.stop();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_sender_gives_up_after_attempt_budget() {
        let (sender, transport) = flaky_sender(usize::MAX, 3);
        let runner = sender.clone();
        let handle = tokio::spawn(async move { runner.run().await });

        sender.submit(node("peer"), Message::new(node("me"), MessageBody::NodeResign));
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
        assert!(transport.delivered.lock().unwrap().is_empty());

        sender.stop();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_outlet_short_circuits_local_messages() {
        let (loopback, mut inbox) = mpsc::unbounded_channel();
        let transport = Arc::new(FlakyTransport {
            failures: usize::MAX,
            calls: AtomicUsize::new(0),
            delivered: Mutex::new(Vec::new()),
        });
        let outlet = Outlet::new(node("me"), transport.clone(), loopback, Duration::from_secs(1), Duration::from_secs(1));

        outlet
            .send(&node("me"), Message::new(node("me"), MessageBody::NodeResign), crate::transport::SendMode::Essential)
            .await
            .unwrap();

        assert!(inbox.try_recv().is_ok());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    // ============================================================
    // CLUSTER (in-process)
    // ============================================================

    fn test_config(routing: RoutingKind) -> NodeConfig {
        NodeConfig {
            extra_work_threads: 1,
            work_poll_interval: Duration::from_millis(10),
            update_interval: Duration::from_millis(200),
            same_cluster_gossip_interval: Duration::from_millis(200),
            cross_cluster_gossip_interval: Duration::from_millis(500),
            essential_timeout: Duration::from_secs(2),
            optional_timeout: Duration::from_secs(1),
            routing,
            ..NodeConfig::default()
        }
    }

    type Executions = Arc<Mutex<Vec<(TaskType, Payload)>>>;

    /// Stage i maps n to n + 1, n * 2, n - 3 for i = 0, 1, 2.
    fn pipeline_handlers(types: &[TaskType], executions: &Executions) -> Arc<TaskHandlerRegistry> {
        let registry = TaskHandlerRegistry::new();
        for task_type in types.iter().copied() {
            let executions = executions.clone();
            registry.register(task_type, move |input: Payload| {
                let executions = executions.clone();
                async move {
                    executions.lock().unwrap().push((task_type, input.clone()));
                    let n = input.as_i64().ok_or_else(|| anyhow::anyhow!("not a number"))?;
                    let out = match task_type.stage {
                        0 => n + 1,
                        1 => n * 2,
                        _ => n - 3,
                    };
                    Ok::<Payload, anyhow::Error>(json!(out))
                }
            });
        }
        registry
    }

    struct Cluster {
        network: Arc<LocalNetwork>,
        jobs: Arc<JobList>,
        job: JobId,
        types: Vec<TaskType>,
    }

    impl Cluster {
        fn new(stages: usize) -> Self {
            let (jobs, job, types) = pipeline(stages);
            Self {
                network: LocalNetwork::new(),
                jobs: Arc::new(jobs),
                job,
                types,
            }
        }

        fn spawn(
            &self,
            name: &str,
            handlers: Arc<TaskHandlerRegistry>,
            routing: RoutingKind,
        ) -> (Arc<Node>, mpsc::UnboundedReceiver<(JobInstanceId, Payload)>) {
            let id = node(name);
            let location = Location::new(&["lab"], name);
            let ctx = Arc::new(NodeContext::new(id.clone(), location.clone(), test_config(routing)));
            let (transport, endpoint) = self.network.attach(id, location);
            let (listener, results) = ChannelListener::new();
            let node = Node::new(ctx, self.jobs.clone(), handlers, transport, endpoint, listener);
            node.start();
            (node, results)
        }
    }

    async fn next_result(
        results: &mut mpsc::UnboundedReceiver<(JobInstanceId, Payload)>,
    ) -> (JobInstanceId, Payload) {
        tokio::time::timeout(Duration::from_secs(15), results.recv())
            .await
            .expect("job did not complete in time")
            .expect("listener closed")
    }

    async fn run_pipeline_on_three_nodes(routing: RoutingKind) {
        let cluster = Cluster::new(3);
        let executions: Executions = Arc::new(Mutex::new(Vec::new()));

        let (x, mut results) = cluster.spawn("x", TaskHandlerRegistry::new(), routing);
        let (y, _) = cluster.spawn("y", pipeline_handlers(&cluster.types, &executions), routing);
        let (z, _) = cluster.spawn("z", pipeline_handlers(&cluster.types, &executions), routing);

        let job = x.submit(cluster.job, json!(5), Some("alice".to_string())).unwrap();
        let (done, result) = next_result(&mut results).await;

        assert_eq!(done, job);
        assert_eq!(done.user_id.as_deref(), Some("alice"));
        assert_eq!(result, json!(9));

        // No second result shows up.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(results.try_recv().is_err());
        assert_eq!(x.stats().jobs_completed, 1);

        // Every stage ran as the registered successor of the one before.
        let executions = executions.lock().unwrap().clone();
        let stages: Vec<TaskType> = executions.iter().map(|(t, _)| *t).collect();
        assert_eq!(stages, cluster.types);
        for pair in stages.windows(2) {
            assert_eq!(cluster.jobs.next_type(&pair[0]), Some(pair[1]));
        }
        assert_eq!(executions[1].1, json!(6));

        for node in [&x, &y, &z] {
            node.set_stopped();
        }
        for node in [&x, &y, &z] {
            tokio::time::timeout(Duration::from_secs(5), node.wait_for_termination())
                .await
                .expect("node did not terminate");
            assert_eq!(node.lifecycle(), Lifecycle::Terminated);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_three_stage_pipeline_end_to_end() {
        run_pipeline_on_three_nodes(RoutingKind::Gossip).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pipeline_with_ant_routing() {
        run_pipeline_on_three_nodes(RoutingKind::Ant).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pipeline_with_q_routing() {
        run_pipeline_on_three_nodes(RoutingKind::QRouting).await;
    }

    async fn wait_for_executions(node: &Node, count: u64) {
        for _ in 0..500 {
            if node.stats().tasks_executed >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "only {} of {} executions happened",
            node.stats().tasks_executed,
            count
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_duplicate_dispatch_yields_one_result() {
        let cluster = Cluster::new(3);
        let executions: Executions = Arc::new(Mutex::new(Vec::new()));
        let (x, mut results) = cluster.spawn(
            "x",
            pipeline_handlers(&cluster.types, &executions),
            RoutingKind::Gossip,
        );

        // A bare peer that injects a second copy of the first stage.
        let (intruder, _endpoint) = cluster.network.attach(node("peer"), Location::new(&["lab"], "peer"));

        let job = x.submit(cluster.job, json!(1), None).unwrap();
        let (done, result) = next_result(&mut results).await;
        assert_eq!(done, job);
        assert_eq!(result, json!(1));
        wait_for_executions(&x, 3).await;

        // The first copy is finished, so the duplicate cannot be merged with it.
        let duplicate = TaskInstance::new(job.clone(), cluster.types[0], json!(1)).as_orphan();
        intruder
            .send(
                &node("x"),
                Message::new(node("peer"), MessageBody::RunTask { task: duplicate, task_id: TaskId(42) }),
                Duration::from_secs(1),
            )
            .await
            .unwrap();

        // The second copy runs through every stage and reports its result again.
        wait_for_executions(&x, 6).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        let first_stage_runs = executions
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| *t == cluster.types[0])
            .count();
        assert_eq!(first_stage_runs, 2);
        assert!(results.try_recv().is_err(), "redundant result reached the listener");
        assert_eq!(x.stats().jobs_completed, 1);
        assert_eq!(x.stats().running_jobs, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_run_task_with_foreign_layout_is_refused() {
        let cluster = Cluster::new(3);
        let executions: Executions = Arc::new(Mutex::new(Vec::new()));
        let (x, _results) = cluster.spawn(
            "x",
            pipeline_handlers(&cluster.types, &executions),
            RoutingKind::Gossip,
        );
        let (intruder, mut endpoint) =
            cluster.network.attach(node("peer"), Location::new(&["lab"], "peer"));

        // Same index as our first stage, but claims to be the last one.
        let forged = TaskType {
            remaining_stages: 0,
            ..cluster.types[0]
        };
        let job = JobInstanceId {
            origin: node("peer"),
            serial: 1,
            user_id: None,
        };
        intruder
            .send(
                &node("x"),
                Message::new(
                    node("peer"),
                    MessageBody::RunTask {
                        task: TaskInstance::new(job, forged, json!(1)),
                        task_id: TaskId(7),
                    },
                ),
                Duration::from_secs(1),
            )
            .await
            .unwrap();

        let refused = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(message) = endpoint.messages.recv().await {
                if let MessageBody::TaskFailed { task_id } = message.body {
                    return task_id;
                }
            }
            panic!("peer inbox closed");
        })
        .await
        .expect("no TaskFailed for the forged task");

        assert_eq!(refused, TaskId(7));
        assert!(executions.lock().unwrap().is_empty());
        assert_eq!(x.stats().tasks_executed, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_dead_worker_tasks_are_rescued() {
        let cluster = Cluster::new(1);
        let stage = cluster.types[0];

        let (x, mut results) = cluster.spawn("x", TaskHandlerRegistry::new(), RoutingKind::Gossip);

        let stuck = TaskHandlerRegistry::new();
        stuck.register(stage, |_input: Payload| async move {
            tokio::time::sleep(Duration::from_secs(120)).await;
            Ok::<Payload, anyhow::Error>(json!("never"))
        });
        let (_y, _) = cluster.spawn("y", stuck, RoutingKind::Gossip);

        let job = x.submit(cluster.job, json!(0), None).unwrap();

        // Wait until the task is outstanding on y.
        let mut dispatched = false;
        for _ in 0..300 {
            let outstanding = x
                .node_list()
                .get(&node("y"))
                .map(|info| info.outstanding_total())
                .unwrap_or(0);
            if outstanding == 1 {
                dispatched = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(dispatched, "task never reached y");

        let healthy = TaskHandlerRegistry::new();
        healthy.register(stage, |_input: Payload| async move {
            Ok::<Payload, anyhow::Error>(json!("rescued"))
        });
        let (_z, _) = cluster.spawn("z", healthy, RoutingKind::Gossip);

        cluster.network.kill(&node("y"));

        let (done, result) = next_result(&mut results).await;
        assert_eq!(done, job);
        assert_eq!(result, json!("rescued"));
        assert!(x.node_list().get(&node("y")).unwrap().is_dead());
        assert_eq!(x.node_list().get(&node("y")).unwrap().outstanding_total(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failing_handler_sends_work_elsewhere() {
        let cluster = Cluster::new(1);
        let stage = cluster.types[0];
        let (x, mut results) = cluster.spawn("x", TaskHandlerRegistry::new(), RoutingKind::Gossip);

        let broken = TaskHandlerRegistry::new();
        broken.register(stage, |_input: Payload| async move {
            Err::<Payload, anyhow::Error>(anyhow::anyhow!("disk on fire"))
        });
        let (_y, _) = cluster.spawn("y", broken, RoutingKind::Gossip);

        let working = TaskHandlerRegistry::new();
        working.register(stage, |input: Payload| async move { Ok::<Payload, anyhow::Error>(input) });
        let (_z, _) = cluster.spawn("z", working, RoutingKind::Gossip);

        for serial in 0..4 {
            x.submit(cluster.job, json!(serial), None).unwrap();
        }
        let mut seen = Vec::new();
        for _ in 0..4 {
            let (_, result) = next_result(&mut results).await;
            seen.push(result.as_i64().unwrap());
        }
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_node_rejects_unknown_jobs_and_submissions_after_stop() {
        let cluster = Cluster::new(1);
        let (x, _) = cluster.spawn("x", TaskHandlerRegistry::new(), RoutingKind::Gossip);

        assert!(matches!(
            x.submit(JobId(99), json!(null), None),
            Err(SchedulerError::UnknownJob(_))
        ));
        assert!(matches!(
            x.submit_by_name("nope", json!(null), None),
            Err(SchedulerError::UnknownJob(_))
        ));

        x.set_stopped();
        assert!(matches!(
            x.submit(cluster.job, json!(null), None),
            Err(SchedulerError::Stopping)
        ));
        tokio::time::timeout(Duration::from_secs(5), x.wait_for_termination())
            .await
            .expect("idle node did not terminate");
    }

    #[tokio::test]
    async fn test_local_only_node_runs_its_own_jobs() {
        let cluster = Cluster::new(3);
        let executions: Executions = Arc::new(Mutex::new(Vec::new()));
        let (x, mut results) = cluster.spawn(
            "solo",
            pipeline_handlers(&cluster.types, &executions),
            RoutingKind::Gossip,
        );

        x.submit_by_name("pipeline", json!(10), None).unwrap();
        let (_, result) = next_result(&mut results).await;

        assert_eq!(result, json!(19));
        let stats = x.stats();
        assert_eq!(stats.tasks_executed, 3);
        assert!(x.gossip().completion_of(&node("solo"), &cluster.types[0]).is_some());
        assert_eq!(stats.metrics.get("remote_outstanding"), Some(&0.0));
        assert!(stats.metrics.contains_key("load"));
    }
}
