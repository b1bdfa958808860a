use super::Transport;
use crate::error::SchedulerError;
use crate::membership::service::MembershipService;
use crate::membership::types::NodeId;
use crate::scheduler::protocol::Message;

use async_trait::async_trait;
use axum::{Extension, Router, body::Bytes, http::StatusCode, routing::post};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Route every node serves on its data address.
pub const ENDPOINT_MESSAGE: &str = "/internal/message";

/// Scheduler messages as bincode bodies POSTed to the peer's data address.
///
/// A send succeeds only when the peer answered 2xx within the timeout, so a
/// crashed or partitioned peer surfaces as an error to the caller.
pub struct HttpTransport {
    membership: Arc<MembershipService>,
    http_client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(membership: Arc<MembershipService>) -> Arc<Self> {
        Arc::new(Self {
            membership,
            http_client: reqwest::Client::new(),
        })
    }

    fn url_of(&self, destination: &NodeId) -> Result<String, SchedulerError> {
        let addr = self.membership.data_addr(destination).ok_or_else(|| {
            // Known but no longer reachable means dead or left.
            match self.membership.get_member(destination) {
                Some(_) => SchedulerError::NodeDead(destination.clone()),
                None => SchedulerError::UnknownNode(destination.clone()),
            }
        })?;
        Ok(format!("http://{}{}", addr, ENDPOINT_MESSAGE))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        destination: &NodeId,
        message: Message,
        timeout: Duration,
    ) -> Result<(), SchedulerError> {
        let url = self.url_of(destination)?;
        let kind = message.body.kind();
        let encoded = bincode::serialize(&message)?;

        let response = self
            .http_client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(encoded)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SchedulerError::Timeout(timeout)
                } else {
                    SchedulerError::Transport(format!("{} to {}: {}", kind, destination, e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SchedulerError::Transport(format!(
                "{} to {} rejected with {}",
                kind, destination, status
            )));
        }
        Ok(())
    }
}

/// Receiving side: decodes each POSTed message into `inbox`.
pub fn router(inbox: mpsc::UnboundedSender<Message>) -> Router {
    Router::new()
        .route(ENDPOINT_MESSAGE, post(handle_message))
        .layer(Extension(inbox))
}

async fn handle_message(
    Extension(inbox): Extension<mpsc::UnboundedSender<Message>>,
    body: Bytes,
) -> StatusCode {
    let message = match bincode::deserialize::<Message>(&body) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!("Failed to deserialize scheduler message: {}", e);
            return StatusCode::BAD_REQUEST;
        }
    };
    if inbox.send(message).is_err() {
        // Node already stopped; the sender must treat the message as lost.
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobId, JobInstanceId, TaskId, TaskInstance, TaskType};
    use crate::membership::types::{Location, Member, MemberState, MembershipEvent};
    use crate::scheduler::protocol::MessageBody;
    use serde_json::json;
    use std::net::SocketAddr;
    use std::time::Instant;

    async fn membership() -> (
        Arc<MembershipService>,
        mpsc::UnboundedReceiver<MembershipEvent>,
    ) {
        let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let data: SocketAddr = "127.0.0.1:0".parse().unwrap();
        MembershipService::new(NodeId::new(), bind, data, Location::default(), vec![])
            .await
            .expect("Failed to create membership service")
    }

    fn add_member(service: &MembershipService, id: &str, data_addr: SocketAddr, state: MemberState) {
        service.members.insert(
            NodeId(id.to_string()),
            Member {
                id: NodeId(id.to_string()),
                gossip_addr: "127.0.0.1:7000".parse().unwrap(),
                data_addr,
                location: Location::default(),
                state,
                incarnation: 1,
                last_seen: Some(Instant::now()),
            },
        );
    }

    async fn serve(inbox: mpsc::UnboundedSender<Message>) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router(inbox)).await;
        });
        addr
    }

    fn run_task(source: &str) -> Message {
        let task_type = TaskType {
            job: JobId(0),
            stage: 0,
            remaining_stages: 1,
            unpredictable: false,
            index: 0,
        };
        let job = JobInstanceId {
            origin: NodeId(source.to_string()),
            serial: 7,
            user_id: None,
        };
        Message::new(
            NodeId(source.to_string()),
            MessageBody::RunTask {
                task: TaskInstance::new(job, task_type, json!({"n": 3, "tags": ["a", "b"]})),
                task_id: TaskId(1),
            },
        )
    }

    #[tokio::test]
    async fn test_send_to_unlistened_port_fails() {
        let (service, _events) = membership().await;
        // Discard port: nothing accepts connections there.
        add_member(&service, "ghost", "127.0.0.1:9".parse().unwrap(), MemberState::Alive);
        let transport = HttpTransport::new(service);

        let result = transport
            .send(&NodeId("ghost".to_string()), run_task("me"), Duration::from_millis(10))
            .await;

        assert!(result.is_err(), "send to a silent peer must fail, got {:?}", result);
    }

    #[tokio::test]
    async fn test_send_to_unknown_or_dead_member_fails() {
        let (service, _events) = membership().await;
        add_member(&service, "gone", "127.0.0.1:9".parse().unwrap(), MemberState::Dead);
        let transport = HttpTransport::new(service);

        let unknown = transport
            .send(&NodeId("nobody".to_string()), run_task("me"), Duration::from_secs(1))
            .await;
        let dead = transport
            .send(&NodeId("gone".to_string()), run_task("me"), Duration::from_secs(1))
            .await;

        assert!(matches!(unknown, Err(SchedulerError::UnknownNode(_))));
        assert!(matches!(dead, Err(SchedulerError::NodeDead(_))));
    }

    #[tokio::test]
    async fn test_message_delivered_to_peer_inbox() {
        let (inbox, mut messages) = mpsc::unbounded_channel();
        let addr = serve(inbox).await;
        let (service, _events) = membership().await;
        add_member(&service, "peer", addr, MemberState::Alive);
        let transport = HttpTransport::new(service);

        transport
            .send(&NodeId("peer".to_string()), run_task("me"), Duration::from_secs(2))
            .await
            .expect("send to a listening peer should succeed");

        let received = messages.recv().await.expect("message should arrive");
        assert_eq!(received.source, NodeId("me".to_string()));
        match received.body {
            MessageBody::RunTask { task, task_id } => {
                assert_eq!(task_id, TaskId(1));
                assert_eq!(task.input, json!({"n": 3, "tags": ["a", "b"]}));
            }
            other => panic!("Unexpected body {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_closed_inbox_is_reported_as_failure() {
        let (inbox, messages) = mpsc::unbounded_channel();
        drop(messages);
        let addr = serve(inbox).await;
        let (service, _events) = membership().await;
        add_member(&service, "stopped", addr, MemberState::Alive);
        let transport = HttpTransport::new(service);

        let result = transport
            .send(&NodeId("stopped".to_string()), run_task("me"), Duration::from_secs(2))
            .await;

        assert!(matches!(result, Err(SchedulerError::Transport(_))));
    }
}
