//! Scheduler Wire Protocol
//!
//! The closed set of messages nodes exchange. The wire format is whatever the
//! transport uses to serialize these types (bincode bodies for the HTTP
//! transport, nothing at all in-process). Payloads travel as JSON text inside.

use crate::gossip::NodePerformanceInfo;
use crate::job::{JobInstanceId, Payload, TaskId, TaskInstance, TaskType, payload_text};
use crate::membership::types::{Location, NodeId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub source: NodeId,
    pub body: MessageBody,
}

impl Message {
    pub fn new(source: NodeId, body: MessageBody) -> Self {
        Self { source, body }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MessageBody {
    /// A node introduces itself and the task types it can execute.
    RegisterNode {
        supported_types: Vec<TaskType>,
        location: Location,
        /// Sender's clock; echoed back in `AcceptNode` to time the round trip.
        send_moment: f64,
    },

    AcceptNode {
        send_moment: f64,
    },

    /// Periodic or opportunistic push of the sender's queue and completion state.
    UpdateNode {
        info: NodePerformanceInfo,
    },

    RunTask {
        task: TaskInstance,
        task_id: TaskId,
    },

    TaskCompleted {
        task_id: TaskId,
        /// Seconds the task spent on the worker, queueing included.
        worker_dwell_time: f64,
        /// Worker queue length of this task type after the task left it.
        queue_length: usize,
    },

    TaskFailed {
        task_id: TaskId,
    },

    Gossip {
        snapshot: Vec<NodePerformanceInfo>,
        needs_reply: bool,
    },

    NodeResign,

    JobResult {
        job: JobInstanceId,
        #[serde(with = "payload_text")]
        result: Payload,
    },
}

impl MessageBody {
    /// Essential messages are retried once synchronously; the rest go through the
    /// best-effort background sender.
    pub fn is_essential(&self) -> bool {
        matches!(
            self,
            MessageBody::RegisterNode { .. }
                | MessageBody::AcceptNode { .. }
                | MessageBody::RunTask { .. }
                | MessageBody::TaskCompleted { .. }
                | MessageBody::TaskFailed { .. }
                | MessageBody::JobResult { .. }
                | MessageBody::NodeResign
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MessageBody::RegisterNode { .. } => "RegisterNode",
            MessageBody::AcceptNode { .. } => "AcceptNode",
            MessageBody::UpdateNode { .. } => "UpdateNode",
            MessageBody::RunTask { .. } => "RunTask",
            MessageBody::TaskCompleted { .. } => "TaskCompleted",
            MessageBody::TaskFailed { .. } => "TaskFailed",
            MessageBody::Gossip { .. } => "Gossip",
            MessageBody::NodeResign => "NodeResign",
            MessageBody::JobResult { .. } => "JobResult",
        }
    }
}
