//! Derived Metrics
//!
//! Small calculation network over a node's statistics. Raw figures enter as
//! inputs; `Min`, `Max` and `Sum` aggregates over them (and over each other)
//! are re-evaluated whenever an input changes.
//!
//! ## Submodules
//! - **`graph`**: `CalculationGraph`, the acyclic vertex arena.
//! - **`node_metrics`**: The load figures every node publishes in its `NodeReport`.

pub mod graph;
pub mod node_metrics;

pub use graph::{Aggregate, CalculationGraph, VertexId};
pub use node_metrics::NodeMetrics;
