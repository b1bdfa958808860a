use crate::config::NodeConfig;
use crate::job::{JobInstanceId, TaskId};
use crate::membership::types::{Location, NodeId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Per-node identity and the identifier generators every component shares.
///
/// Constructed once at startup and handed to components behind an `Arc`.
pub struct NodeContext {
    pub local: NodeId,
    pub location: Location,
    pub config: NodeConfig,
    started: Instant,
    job_serial: AtomicU64,
    task_serial: AtomicU64,
}

impl NodeContext {
    pub fn new(local: NodeId, location: Location, config: NodeConfig) -> Self {
        Self {
            local,
            location,
            config,
            started: Instant::now(),
            job_serial: AtomicU64::new(0),
            task_serial: AtomicU64::new(0),
        }
    }

    /// Seconds since this node started. All local deadlines use this clock.
    pub fn now(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    pub fn next_job_instance(&self, user_id: Option<String>) -> JobInstanceId {
        JobInstanceId {
            origin: self.local.clone(),
            serial: self.job_serial.fetch_add(1, Ordering::Relaxed),
            user_id,
        }
    }

    pub fn next_task_id(&self) -> TaskId {
        TaskId(self.task_serial.fetch_add(1, Ordering::Relaxed))
    }

    pub fn initial_estimate(&self) -> f64 {
        self.config.initial_time_estimate.as_secs_f64()
    }
}
