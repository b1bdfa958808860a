use dataflow_scheduler::api::{self, JobResultStore};
use dataflow_scheduler::config::{NodeConfig, load_dotenv};
use dataflow_scheduler::context::NodeContext;
use dataflow_scheduler::job::{JobList, Payload, StageSpec, TaskHandlerRegistry};
use dataflow_scheduler::membership::service::MembershipService;
use dataflow_scheduler::membership::types::{Location, NodeId};
use dataflow_scheduler::metrics::node_metrics::LOAD;
use dataflow_scheduler::scheduler::Node;
use dataflow_scheduler::transport::Endpoint;
use dataflow_scheduler::transport::http::{self as http_transport, HttpTransport};

use anyhow::{Context, anyhow};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct Args {
    bind_addr: SocketAddr,
    seed_nodes: Vec<SocketAddr>,
    cluster: String,
}

fn usage(program: &str) {
    eprintln!(
        "Usage: {} --bind <addr:port> [--seed <addr:port>] [--cluster <a/b/c>]",
        program
    );
    eprintln!("Example: {} --bind 127.0.0.1:5000", program);
    eprintln!(
        "Example: {} --bind 127.0.0.1:5010 --seed 127.0.0.1:5000 --cluster eu/rack2",
        program
    );
}

fn parse_args(args: &[String]) -> anyhow::Result<Args> {
    let mut bind_addr: Option<SocketAddr> = None;
    let mut seed_nodes: Vec<SocketAddr> = vec![];
    let mut cluster = String::from("default");

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match (args[i].as_str(), value) {
            ("--bind", Some(value)) => {
                bind_addr = Some(value.parse().context("invalid --bind address")?);
                i += 2;
            }
            ("--seed", Some(value)) => {
                seed_nodes.push(value.parse().context("invalid --seed address")?);
                i += 2;
            }
            ("--cluster", Some(value)) => {
                cluster = value.clone();
                i += 2;
            }
            _ => {
                i += 1;
            }
        }
    }

    Ok(Args {
        bind_addr: bind_addr.ok_or_else(|| anyhow!("--bind is required"))?,
        seed_nodes,
        cluster,
    })
}

/// The pipeline every node of the demo cluster can run: n -> (n + 1) * 2 - 3.
fn demo_jobs() -> anyhow::Result<(JobList, Arc<TaskHandlerRegistry>)> {
    let mut jobs = JobList::new();
    let pipeline = jobs.register_pipeline(
        "pipeline",
        vec![
            StageSpec::predictable("increment", 0.2),
            StageSpec::predictable("double", 0.5),
            StageSpec::unpredictable("offset"),
        ],
    )?;

    let handlers = TaskHandlerRegistry::new();
    for (position, task_type) in jobs.stages(pipeline).iter().copied().enumerate() {
        handlers.register(task_type, move |input: Payload| async move {
            let n = input
                .as_i64()
                .ok_or_else(|| anyhow!("{} expects an integer, got {}", task_type, input))?;
            // Simulated work, so queues actually build up under load.
            let work = match position {
                0 => Duration::from_millis(200),
                1 => Duration::from_millis(500),
                _ => Duration::from_millis(rand::random::<u64>() % 1000),
            };
            tokio::time::sleep(work).await;
            let out = match position {
                0 => n + 1,
                1 => n * 2,
                _ => n - 3,
            };
            Ok::<Payload, anyhow::Error>(json!(out))
        });
    }
    Ok((jobs, handlers))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        // .with_max_level(tracing::Level::DEBUG)
        .with_max_level(tracing::Level::INFO)
        .init();

    load_dotenv();
    let config = NodeConfig::from_env();

    let args: Vec<String> = std::env::args().collect();
    let program = args.first().cloned().unwrap_or_else(|| "dataflow-node".to_string());
    let args = match parse_args(&args) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{}", e);
            usage(&program);
            std::process::exit(1);
        }
    };

    let bind_addr = args.bind_addr;
    let data_addr = SocketAddr::new(bind_addr.ip(), bind_addr.port() + 1);
    let local_id = NodeId::new();
    let location = Location::from_path(&args.cluster, &bind_addr.to_string());

    tracing::info!("Starting node {} on {} (data {})", local_id, bind_addr, data_addr);
    tracing::info!("Location: {}, routing: {:?}", location, config.routing);
    if !args.seed_nodes.is_empty() {
        tracing::info!("Seed nodes: {:?}", args.seed_nodes);
    } else {
        tracing::info!("Starting as seed node (founder)");
    }

    // 1. Membership (UDP gossip):
    let (membership, membership_events) = MembershipService::new(
        local_id.clone(),
        bind_addr,
        data_addr,
        location.clone(),
        args.seed_nodes,
    )
    .await?;

    // 2. Scheduler transport (HTTP on the data address):
    let transport = HttpTransport::new(membership.clone());
    let (inbox, messages) = mpsc::unbounded_channel();
    let data_listener = tokio::net::TcpListener::bind(data_addr).await?;
    let data_app = http_transport::router(inbox.clone());
    tokio::spawn(async move {
        if let Err(e) = axum::serve(data_listener, data_app).await {
            tracing::error!("Scheduler transport stopped: {}", e);
        }
    });
    tracing::info!("Scheduler transport listening on {}", data_addr);
    let endpoint = Endpoint {
        messages,
        membership: membership_events,
        loopback: inbox,
    };

    // 3. Scheduler node:
    let (jobs, handlers) = demo_jobs()?;
    let ctx = Arc::new(NodeContext::new(local_id, location, config));
    let results = Arc::new(JobResultStore::new());
    let node = Node::new(ctx, Arc::new(jobs), handlers, transport, endpoint, results.clone());
    node.start();

    membership.clone().start().await;

    // 4. Stats reporter:
    let stats_node = node.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));

        loop {
            interval.tick().await;
            let report = stats_node.stats();
            tracing::info!(
                "Node stats: master queue {}, worker queue {}, running jobs {}, completed {}, executed {}, load {}",
                report.master_queue_length,
                report.worker_queue_length,
                report.running_jobs,
                report.jobs_completed,
                report.tasks_executed,
                report.metrics.get(LOAD).copied().unwrap_or(0.0)
            );
            for peer in report.known_nodes.iter().filter(|peer| !peer.local) {
                tracing::info!(
                    "  - {} outstanding={} executed={} suspect={} dead={}",
                    peer.node,
                    peer.outstanding,
                    peer.executed,
                    peer.suspect,
                    peer.dead
                );
            }
        }
    });

    // 5. HTTP server:
    let http_port = bind_addr.port() + 1000;
    let http_addr = SocketAddr::new(bind_addr.ip(), http_port);
    let app = api::router(node.clone(), results);

    tracing::info!("HTTP server listening on {}", http_addr);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(node, membership))
        .await?;

    Ok(())
}

/// Stops accepting jobs on Ctrl+C, lets outstanding work drain, then leaves the cluster.
async fn shutdown_signal(node: Arc<Node>, membership: Arc<MembershipService>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl+C: {}", e);
        return;
    }
    tracing::info!("Shutdown requested, draining outstanding work");
    node.set_stopped();
    node.wait_for_termination().await;
    membership.leave().await;
    tracing::info!("Node terminated");
}
