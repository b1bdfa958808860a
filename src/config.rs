//! Node Configuration
//!
//! Every tunable of the scheduler lives in `NodeConfig`. Defaults are chosen for
//! a LAN cluster; each field can be overridden from a `DATAFLOW_*` environment
//! variable (a `.env` file is loaded first when present).

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which routing policy the master side uses to pick a worker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RoutingKind {
    /// Minimum gossip-estimated completion time.
    Gossip,
    /// Pheromone trail: prefer the node that most recently succeeded.
    Ant,
    /// Learned per-(type, node) completion values.
    QRouting,
}

impl std::str::FromStr for RoutingKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gossip" => Ok(RoutingKind::Gossip),
            "ant" => Ok(RoutingKind::Ant),
            "q" | "qrouting" | "q-routing" => Ok(RoutingKind::QRouting),
            other => Err(format!("unknown routing strategy '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Work loops run = available parallelism + this margin.
    pub extra_work_threads: usize,
    /// Upper bound on how long an idle work loop sleeps before re-polling.
    pub work_poll_interval: Duration,
    /// Period of UpdateNode broadcasts to the nodes that send us work.
    pub update_interval: Duration,
    pub essential_timeout: Duration,
    pub optional_timeout: Duration,
    pub allowance_deadline_margin: f64,
    pub minimal_deadline: Duration,
    pub reschedule_deadline_multiplier: f64,
    pub late_job_duration: Duration,
    pub max_allowance: usize,
    pub local_initial_allowance: usize,
    /// Pessimistic starting value of every duration estimator.
    pub initial_time_estimate: Duration,
    pub same_cluster_gossip_interval: Duration,
    pub cross_cluster_gossip_interval: Duration,
    pub gossip_quotum_ceiling: i64,
    pub non_essential_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Round-robin over task types instead of strict priority order.
    pub fair_worker_queue: bool,
    pub routing: RoutingKind,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            extra_work_threads: 2,
            work_poll_interval: Duration::from_millis(50),
            update_interval: Duration::from_secs(1),
            essential_timeout: Duration::from_secs(30),
            optional_timeout: Duration::from_secs(5),
            allowance_deadline_margin: 1.5,
            minimal_deadline: Duration::from_millis(100),
            reschedule_deadline_multiplier: 3.0,
            late_job_duration: Duration::from_secs(60),
            max_allowance: 10,
            local_initial_allowance: 1,
            initial_time_estimate: Duration::from_secs(1),
            same_cluster_gossip_interval: Duration::from_secs(1),
            cross_cluster_gossip_interval: Duration::from_secs(5),
            gossip_quotum_ceiling: 20,
            non_essential_attempts: 5,
            backoff_base: Duration::from_millis(150),
            backoff_cap: Duration::from_millis(1200),
            fair_worker_queue: false,
            routing: RoutingKind::Gossip,
        }
    }
}

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl NodeConfig {
    /// Build config from environment variables (call `load_dotenv()` first).
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup; unknown or unparsable values keep their default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(&format!("DATAFLOW_{}", key)).filter(|value| !value.trim().is_empty())
        };
        let millis = |key: &str, default: Duration| {
            get(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(default)
        };

        let defaults = Self::default();
        Self {
            extra_work_threads: parse_or(get("EXTRA_WORK_THREADS"), defaults.extra_work_threads),
            work_poll_interval: millis("WORK_POLL_MS", defaults.work_poll_interval),
            update_interval: millis("UPDATE_INTERVAL_MS", defaults.update_interval),
            essential_timeout: millis("ESSENTIAL_TIMEOUT_MS", defaults.essential_timeout),
            optional_timeout: millis("OPTIONAL_TIMEOUT_MS", defaults.optional_timeout),
            allowance_deadline_margin: parse_or(get("ALLOWANCE_DEADLINE_MARGIN"), defaults.allowance_deadline_margin),
            minimal_deadline: millis("MINIMAL_DEADLINE_MS", defaults.minimal_deadline),
            reschedule_deadline_multiplier: parse_or(get("RESCHEDULE_DEADLINE_MULTIPLIER"), defaults.reschedule_deadline_multiplier),
            late_job_duration: millis("LATE_JOB_MS", defaults.late_job_duration),
            max_allowance: parse_or(get("MAX_ALLOWANCE"), defaults.max_allowance),
            local_initial_allowance: parse_or(get("LOCAL_INITIAL_ALLOWANCE"), defaults.local_initial_allowance),
            initial_time_estimate: millis("INITIAL_ESTIMATE_MS", defaults.initial_time_estimate),
            same_cluster_gossip_interval: millis(
                "SAME_CLUSTER_GOSSIP_MS",
                defaults.same_cluster_gossip_interval,
            ),
            cross_cluster_gossip_interval: millis(
                "CROSS_CLUSTER_GOSSIP_MS",
                defaults.cross_cluster_gossip_interval,
            ),
            gossip_quotum_ceiling: parse_or(get("GOSSIP_QUOTUM_CEILING"), defaults.gossip_quotum_ceiling),
            non_essential_attempts: parse_or(get("NON_ESSENTIAL_ATTEMPTS"), defaults.non_essential_attempts),
            backoff_base: millis("BACKOFF_BASE_MS", defaults.backoff_base),
            backoff_cap: millis("BACKOFF_CAP_MS", defaults.backoff_cap),
            fair_worker_queue: parse_or(get("FAIR_WORKER_QUEUE"), defaults.fair_worker_queue),
            routing: get("ROUTING")
                .and_then(|v| match v.parse::<RoutingKind>() {
                    Ok(kind) => Some(kind),
                    Err(e) => {
                        tracing::warn!("{}, using default", e);
                        None
                    }
                })
                .unwrap_or(defaults.routing),
        }
    }

    pub fn work_thread_count(&self) -> usize {
        let processors = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        processors + self.extra_work_threads
    }

    /// Allowance interval for a task predicted to take `predicted` seconds.
    pub fn allowance_interval(&self, predicted: f64) -> f64 {
        (predicted * self.allowance_deadline_margin).max(self.minimal_deadline.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_lookup_overrides_defaults() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("DATAFLOW_MAX_ALLOWANCE", "4"),
            ("DATAFLOW_UPDATE_INTERVAL_MS", "250"),
            ("DATAFLOW_ROUTING", "ant"),
            ("DATAFLOW_FAIR_WORKER_QUEUE", "true"),
        ]);

        let config = NodeConfig::from_lookup(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.max_allowance, 4);
        assert_eq!(config.update_interval, Duration::from_millis(250));
        assert_eq!(config.routing, RoutingKind::Ant);
        assert!(config.fair_worker_queue);
        assert_eq!(config.late_job_duration, NodeConfig::default().late_job_duration);
    }

    #[test]
    fn test_garbage_values_keep_defaults() {
        let config = NodeConfig::from_lookup(|key| match key {
            "DATAFLOW_MAX_ALLOWANCE" => Some("many".to_string()),
            "DATAFLOW_ROUTING" => Some("carrier-pigeon".to_string()),
            _ => None,
        });

        assert_eq!(config.max_allowance, 10);
        assert_eq!(config.routing, RoutingKind::Gossip);
    }

    #[test]
    fn test_allowance_interval_has_a_floor() {
        let config = NodeConfig::default();

        assert!((config.allowance_interval(2.0) - 3.0).abs() < 1e-9);
        assert!((config.allowance_interval(0.001) - 0.1).abs() < 1e-9);
    }
}
