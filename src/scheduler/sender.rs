//! Best-effort Sender
//!
//! Gossip and speculative updates are not worth blocking a work loop for. They are
//! queued here and sent from a background loop; a failed send is retried with
//! exponential backoff and jitter until the attempt budget runs out, after which
//! the message is dropped.

use super::protocol::Message;
use crate::membership::types::NodeId;
use crate::transport::{Outlet, SendMode};

use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;

struct PendingSend {
    destination: NodeId,
    message: Message,
    attempt: u32,
    due: Instant,
}

pub struct NonEssentialSender {
    outlet: Outlet,
    queue: mpsc::UnboundedSender<(NodeId, Message)>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<(NodeId, Message)>>>,
    attempts: u32,
    backoff_base: Duration,
    backoff_cap: Duration,
    shutdown: Notify,
}

impl NonEssentialSender {
    pub fn new(outlet: Outlet, attempts: u32, backoff_base: Duration, backoff_cap: Duration) -> Self {
        let (queue, receiver) = mpsc::unbounded_channel();
        Self {
            outlet,
            queue,
            receiver: Mutex::new(Some(receiver)),
            attempts: attempts.max(1),
            backoff_base,
            backoff_cap,
            shutdown: Notify::new(),
        }
    }

    /// Queues a message; never blocks.
    pub fn submit(&self, destination: NodeId, message: Message) {
        if self.queue.send((destination, message)).is_err() {
            tracing::debug!("Best-effort sender is gone, dropping message");
        }
    }

    pub fn stop(&self) {
        self.shutdown.notify_one();
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        let delay = self.backoff_base.saturating_mul(factor).min(self.backoff_cap);
        // Simple jitter to prevent thundering herd
        let jitter = Duration::from_millis(rand::random::<u64>() % 50);
        delay + jitter
    }

    async fn attempt(&self, mut pending: PendingSend, retries: &mut Vec<PendingSend>) {
        let kind = pending.message.body.kind();
        match self
            .outlet
            .send(&pending.destination, pending.message.clone(), SendMode::Optional)
            .await
        {
            Ok(()) => {
                tracing::trace!("Sent {} to {}", kind, pending.destination);
            }
            Err(e) => {
                pending.attempt += 1;
                if pending.attempt >= self.attempts {
                    tracing::debug!(
                        "Giving up on {} to {} after {} attempt(s): {}",
                        kind,
                        pending.destination,
                        pending.attempt,
                        e
                    );
                    return;
                }
                pending.due = Instant::now() + self.backoff(pending.attempt - 1);
                retries.push(pending);
            }
        }
    }

    pub async fn run(&self) {
        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(mut receiver) = receiver else {
            tracing::error!("Best-effort sender started twice");
            return;
        };

        let mut retries: Vec<PendingSend> = Vec::new();

        loop {
            let next_due = retries.iter().map(|pending| pending.due).min();
            let far = Instant::now() + Duration::from_secs(3600);

            tokio::select! {
                _ = self.shutdown.notified() => break,
                received = receiver.recv() => {
                    let Some((destination, message)) = received else {
                        break;
                    };
                    let pending = PendingSend {
                        destination,
                        message,
                        attempt: 0,
                        due: Instant::now(),
                    };
                    self.attempt(pending, &mut retries).await;
                }
                _ = tokio::time::sleep_until(next_due.unwrap_or(far)), if next_due.is_some() => {
                    let now = Instant::now();
                    let (due, waiting): (Vec<_>, Vec<_>) =
                        retries.drain(..).partition(|pending| pending.due <= now);
                    retries = waiting;
                    for pending in due {
                        self.attempt(pending, &mut retries).await;
                    }
                }
            }
        }

        if !retries.is_empty() {
            tracing::debug!("Best-effort sender stopped with {} retries pending", retries.len());
        }
    }
}
