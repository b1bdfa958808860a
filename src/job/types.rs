use crate::membership::types::NodeId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Opaque task input/output. The scheduler never interprets it.
pub type Payload = serde_json::Value;

/// Carries a `Payload` as JSON text, so non-self-describing formats such as
/// bincode can round-trip it.
pub mod payload_text {
    use super::Payload;
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _, ser::Error as _};

    pub fn serialize<S: Serializer>(payload: &Payload, serializer: S) -> Result<S::Ok, S::Error> {
        let text = serde_json::to_string(payload).map_err(S::Error::custom)?;
        serializer.serialize_str(&text)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Payload, D::Error> {
        let text = String::deserialize(deserializer)?;
        serde_json::from_str(&text).map_err(D::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub u32);

/// One stage of a job pipeline.
///
/// `index` is global over all registered types and doubles as the stage-priority
/// number: a lower index is dispatched first. Types are created once, at job
/// registration, and never change afterwards.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TaskType {
    pub job: JobId,
    pub stage: u32,
    pub remaining_stages: u32,
    /// Execution-time estimates for this stage are not trusted for cutoffs.
    pub unpredictable: bool,
    pub index: usize,
}

impl TaskType {
    pub fn is_last_stage(&self) -> bool {
        self.remaining_stages == 0
    }
}

impl PartialEq for TaskType {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl Eq for TaskType {}

impl Hash for TaskType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}

impl PartialOrd for TaskType {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TaskType {
    fn cmp(&self, other: &Self) -> Ordering {
        self.index.cmp(&other.index)
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job{}.stage{}", self.job.0, self.stage)
    }
}

/// Identifies one submitted job, unique per originating node.
///
/// The origin is also the return address: the final stage's result is sent there.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInstanceId {
    pub origin: NodeId,
    pub serial: u64,
    pub user_id: Option<String>,
}

impl PartialEq for JobInstanceId {
    fn eq(&self, other: &Self) -> bool {
        self.serial == other.serial && self.origin == other.origin
    }
}

impl Eq for JobInstanceId {}

impl Hash for JobInstanceId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.origin.hash(state);
        self.serial.hash(state);
    }
}

impl PartialOrd for JobInstanceId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for JobInstanceId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.origin
            .cmp(&other.origin)
            .then(self.serial.cmp(&other.serial))
    }
}

impl fmt::Display for JobInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.origin, self.serial)
    }
}

/// Locally assigned identifier of one dispatch of a task to a worker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// One stage of one job instance, with its input.
///
/// Two instances are equal when they belong to the same job instance and stage,
/// which is how duplicates from at-least-once delivery are recognized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInstance {
    pub job_instance: JobInstanceId,
    pub task_type: TaskType,
    #[serde(with = "payload_text")]
    pub input: Payload,
    /// Set when this copy is a re-dispatch of work whose first target died or ran late.
    pub orphan: bool,
}

impl TaskInstance {
    pub fn new(job_instance: JobInstanceId, task_type: TaskType, input: Payload) -> Self {
        Self {
            job_instance,
            task_type,
            input,
            orphan: false,
        }
    }

    /// A copy marked as a re-dispatch.
    pub fn as_orphan(&self) -> Self {
        Self {
            orphan: true,
            ..self.clone()
        }
    }
}

impl PartialEq for TaskInstance {
    fn eq(&self, other: &Self) -> bool {
        self.task_type == other.task_type && self.job_instance == other.job_instance
    }
}

impl Eq for TaskInstance {}

impl Hash for TaskInstance {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.job_instance.hash(state);
        self.task_type.hash(state);
    }
}

impl fmt::Display for TaskInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.task_type, self.job_instance)
    }
}
