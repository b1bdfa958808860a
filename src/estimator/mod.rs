//! Duration Estimators
//!
//! Every scheduling decision in the cluster is driven by estimated durations:
//! transmission time, round-trip time, dequeue interval and execution time.
//! This module provides the scalar estimators that fold observations into a
//! running estimate, and the `TimeEstimate` algebra used to compose them.
//!
//! ## Components
//! - **`TimeEstimate`**: A (mean, variance) pair that can be added and scaled
//!   without losing track of uncertainty.
//! - **`DecayingEstimator`**: Exponential decay with a 3:1 old:new weighting.
//! - **`TimeDecayingEstimator`**: Time-weighted average, used for node performance.

pub mod decaying;
pub mod time_estimate;

pub use decaying::{DecayingEstimator, TimeDecayingEstimator};
pub use time_estimate::TimeEstimate;
