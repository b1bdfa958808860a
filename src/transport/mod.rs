//! Messaging Transport
//!
//! The scheduler treats the network as `send(destination, message)` plus an
//! asynchronous stream of inbound messages and membership events. Two
//! implementations are provided:
//!
//! - **`local`**: An in-process hub connecting any number of nodes through channels.
//!   Used for tests and single-process clusters.
//! - **`http`**: bincode bodies POSTed with `reqwest` to an axum route on the
//!   peer's data address, which is looked up in the membership service.
//!
//! Messages a node addresses to itself never reach a transport: the `Outlet`
//! short-circuits them straight into the node's own inbox.

pub mod http;
pub mod local;

use crate::error::SchedulerError;
use crate::membership::types::{MembershipEvent, NodeId};
use crate::scheduler::protocol::Message;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Selects the timeout a send is allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    /// One-shot send of a message that must not be lost silently.
    Essential,
    /// Best-effort send over a cached connection.
    Optional,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        destination: &NodeId,
        message: Message,
        timeout: Duration,
    ) -> Result<(), SchedulerError>;
}

/// Blanket implementation so `Arc<dyn Transport>` can be used directly.
#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(
        &self,
        destination: &NodeId,
        message: Message,
        timeout: Duration,
    ) -> Result<(), SchedulerError> {
        (**self).send(destination, message, timeout).await
    }
}

/// What a node receives from the network.
pub struct Endpoint {
    pub messages: mpsc::UnboundedReceiver<Message>,
    pub membership: mpsc::UnboundedReceiver<MembershipEvent>,
    /// Feeds the node's own inbox; used for local delivery.
    pub loopback: mpsc::UnboundedSender<Message>,
}

/// Sending side of a node: the transport plus the local short-circuit.
#[derive(Clone)]
pub struct Outlet {
    local: NodeId,
    transport: Arc<dyn Transport>,
    loopback: mpsc::UnboundedSender<Message>,
    essential_timeout: Duration,
    optional_timeout: Duration,
}

impl Outlet {
    pub fn new(
        local: NodeId,
        transport: Arc<dyn Transport>,
        loopback: mpsc::UnboundedSender<Message>,
        essential_timeout: Duration,
        optional_timeout: Duration,
    ) -> Self {
        Self {
            local,
            transport,
            loopback,
            essential_timeout,
            optional_timeout,
        }
    }

    pub fn local(&self) -> &NodeId {
        &self.local
    }

    pub async fn send(
        &self,
        destination: &NodeId,
        message: Message,
        mode: SendMode,
    ) -> Result<(), SchedulerError> {
        if *destination == self.local {
            return self
                .loopback
                .send(message)
                .map_err(|_| SchedulerError::Transport("local inbox closed".to_string()));
        }
        let timeout = match mode {
            SendMode::Essential => self.essential_timeout,
            SendMode::Optional => self.optional_timeout,
        };
        match tokio::time::timeout(timeout, self.transport.send(destination, message, timeout)).await
        {
            Ok(result) => result,
            Err(_) => Err(SchedulerError::Timeout(timeout)),
        }
    }
}
