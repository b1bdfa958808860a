//! Performance Gossip
//!
//! Lets every node estimate, without asking anyone, how long a job will take if a
//! task of a given type is enqueued now. Each node periodically publishes a
//! `NodePerformanceInfo` vector (its worker-queue state and its own completion-time
//! estimates) and merges the vectors it receives from peers.
//!
//! ## Components
//! - **`types`**: The gossiped vectors.
//! - **`store`**: The `Gossip` map with monotonic merging and the backward
//!   completion-time recomputation.
//! - **`counter`**: `UpDownCounter`, the bounded gossip budget ("quotum").
//! - **`gossiper`**: The background loop deciding whom to push to and when.

pub mod counter;
pub mod gossiper;
pub mod store;
pub mod types;

pub use counter::UpDownCounter;
pub use gossiper::Gossiper;
pub use store::Gossip;
pub use types::{NodePerformanceInfo, WorkerQueueInfo};
