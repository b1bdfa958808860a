//! Distributed Scheduling Core
//!
//! Decides, on every node independently, where each task of a job pipeline runs.
//! There is no coordinator: a node routes work using its own live bookkeeping of
//! what it has sent where, plus the performance vectors it hears through gossip.
//!
//! ## Delivery model
//! Task delivery is at-least-once. A task can be dispatched twice (its first
//! target died or ran past its reschedule deadline); workers answer duplicates
//! together, and the submitting node keeps only the first result of a job.
//!
//! ## Components
//! - **`protocol`**: The messages nodes exchange.
//! - **`master_queue`** / **`worker_queue`**: Tasks waiting for dispatch / execution.
//! - **`node_info`** / **`node_list`**: Liveness, outstanding tasks, estimators and
//!   allowance control per known node.
//! - **`routing`**: Pluggable choice of destination.
//! - **`sender`**: Best-effort background delivery with backoff.
//! - **`node`**: The engine running all of the above.

pub mod master_queue;
pub mod node;
pub mod node_info;
pub mod node_list;
pub mod protocol;
pub mod routing;
pub mod sender;
pub mod worker_queue;

pub use node::{ChannelListener, JobCompletionListener, Lifecycle, Node, NodeReport};
pub use protocol::{Message, MessageBody};
pub use routing::{RoutingStrategy, Selection};

#[cfg(test)]
mod tests;
