//! Decentralized Dataflow Scheduler Library
//!
//! Every node is both a master and a worker. Jobs are linear pipelines of
//! stages; the node a job is submitted to dispatches each stage to whichever
//! node is expected to finish the rest of the job soonest, using performance
//! information spread by gossip. There is no central coordinator.
//!
//! ## Architecture Modules
//! - **`scheduler`**: The node engine. Master queue, worker queue, node registry with
//!   allowance-based backpressure, routing strategies and the message protocol.
//! - **`gossip`**: Performance vectors, completion-time recomputation and the gossiper thread.
//! - **`job`**: Job graphs, task types and instances, handler registry, running-job tracking.
//! - **`estimator`**: Time estimates (mean, variance) and decaying estimators.
//! - **`membership`**: UDP SWIM-like membership producing join/death/leave events.
//! - **`transport`**: How messages move: in-process channels or HTTP between processes.
//! - **`metrics`**: Min/Max/Sum calculation graph deriving load figures from node statistics.
//! - **`api`**: HTTP surface for submitting jobs and reading results and stats.
//! - **`config`** / **`context`** / **`error`**: Tunables, per-node shared state, error type.

pub mod api;
pub mod config;
pub mod context;
pub mod error;
pub mod estimator;
pub mod gossip;
pub mod job;
pub mod membership;
pub mod metrics;
pub mod scheduler;
pub mod transport;
