use crate::membership::types::NodeId;
use thiserror::Error;

/// Errors that can occur in the scheduling layer.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("send timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("node {0} is dead")]
    NodeDead(NodeId),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("unknown job: {0}")]
    UnknownJob(String),

    #[error("invalid job definition: {0}")]
    InvalidJob(String),

    #[error("metric graph error: {0}")]
    Metric(String),

    #[error("node is stopping and accepts no new jobs")]
    Stopping,
}
