//! Task Handler Registry
//!
//! Maps task types to executable Rust closures. A node supports exactly the
//! task types it has a handler for.

use super::types::{Payload, TaskType};

use anyhow::Result;
use dashmap::DashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Type alias for a thread-safe, asynchronous stage implementation.
/// It takes the stage input and resolves to the stage output.
pub type TaskHandlerFn =
    Arc<dyn Fn(Payload) -> Pin<Box<dyn Future<Output = Result<Payload>> + Send>> + Send + Sync>;

pub struct TaskHandlerRegistry {
    handlers: DashMap<TaskType, TaskHandlerFn>,
}

impl TaskHandlerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register<F, Fut>(&self, task_type: TaskType, handler: F)
    where
        F: Fn(Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload>> + Send + 'static,
    {
        let handler_fn: TaskHandlerFn = Arc::new(move |input: Payload| {
            Box::pin(handler(input)) as Pin<Box<dyn Future<Output = Result<Payload>> + Send>>
        });

        self.handlers.insert(task_type, handler_fn);

        tracing::info!("Registered task handler for {}", task_type);
    }

    /// Runs the handler for `task_type` on `input`.
    ///
    /// # Returns
    /// * `Ok(output)` if the handler succeeded.
    /// * `Err` if the handler failed or no handler exists for the type.
    pub async fn execute(&self, task_type: &TaskType, input: Payload) -> Result<Payload> {
        // Clone the Arc out so the map shard is not locked while the handler runs.
        let handler_fn = self
            .handlers
            .get(task_type)
            .map(|entry| entry.value().clone());

        match handler_fn {
            Some(handler_fn) => handler_fn(input).await,
            None => {
                let error = format!("Unknown task type: {}", task_type);
                tracing::error!("{}", error);
                Err(anyhow::anyhow!(error))
            }
        }
    }

    pub fn supports(&self, task_type: &TaskType) -> bool {
        self.handlers.contains_key(task_type)
    }

    pub fn supported_types(&self) -> Vec<TaskType> {
        let mut types: Vec<TaskType> = self.handlers.iter().map(|entry| *entry.key()).collect();
        types.sort();
        types
    }
}

impl Default for TaskHandlerRegistry {
    fn default() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }
}
