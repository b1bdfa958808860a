//! Jobs, Stages and Task Instances
//!
//! A job is a pipeline of stages. Every stage is described by an immutable
//! `TaskType`, registered once in the `JobList`; the scheduler never looks
//! inside task payloads, it only needs a type's predicted execution time and
//! its successor.
//!
//! ## Submodules
//! - **`types`**: Identifiers and value types (`TaskType`, `TaskInstance`, ...).
//! - **`graph`**: The `JobList`, which assigns task types and the successor relation.
//! - **`registry`**: Maps task types to executable Rust closures.
//! - **`running`**: Submitter-side bookkeeping of jobs that have not returned yet.

pub mod graph;
pub mod registry;
pub mod running;
pub mod types;

pub use graph::{JobList, StageSpec};
pub use registry::TaskHandlerRegistry;
pub use running::RunningJobs;
pub use types::{JobId, JobInstanceId, Payload, TaskId, TaskInstance, TaskType, payload_text};
