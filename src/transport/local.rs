use super::{Endpoint, Transport};
use crate::error::SchedulerError;
use crate::membership::types::{Location, MembershipEvent, NodeId};
use crate::scheduler::protocol::Message;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct Peer {
    location: Location,
    messages: mpsc::UnboundedSender<Message>,
    membership: mpsc::UnboundedSender<MembershipEvent>,
}

/// In-process network: every attached node can reach every other one.
///
/// Membership is exact: attaching announces `Joined` to everyone, `detach`
/// announces `Left` and `kill` announces `Died`. A `partition` makes sends to
/// a node fail without telling anyone, which is how a silent failure looks.
#[derive(Default)]
pub struct LocalNetwork {
    peers: DashMap<NodeId, Peer>,
    unreachable: DashSet<NodeId>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn attach(self: &Arc<Self>, id: NodeId, location: Location) -> (Arc<LocalTransport>, Endpoint) {
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let (membership_tx, membership_rx) = mpsc::unbounded_channel();

        for peer in self.peers.iter() {
            let _ = peer
                .membership
                .send(MembershipEvent::Joined(id.clone(), location.clone()));
            let _ = membership_tx.send(MembershipEvent::Joined(
                peer.key().clone(),
                peer.location.clone(),
            ));
        }

        self.peers.insert(
            id.clone(),
            Peer {
                location,
                messages: message_tx.clone(),
                membership: membership_tx,
            },
        );
        tracing::debug!("Attached {} to local network ({} peers)", id, self.peers.len());

        let transport = Arc::new(LocalTransport {
            network: self.clone(),
            local: id,
        });
        let endpoint = Endpoint {
            messages: message_rx,
            membership: membership_rx,
            loopback: message_tx,
        };
        (transport, endpoint)
    }

    /// Graceful departure: the others see `Left`.
    pub fn detach(&self, id: &NodeId) {
        if self.peers.remove(id).is_some() {
            self.announce(MembershipEvent::Left(id.clone()));
        }
    }

    /// Crash: the others see `Died`.
    pub fn kill(&self, id: &NodeId) {
        if self.peers.remove(id).is_some() {
            self.announce(MembershipEvent::Died(id.clone()));
        }
    }

    pub fn partition(&self, id: &NodeId) {
        self.unreachable.insert(id.clone());
    }

    pub fn heal(&self, id: &NodeId) {
        self.unreachable.remove(id);
    }

    fn announce(&self, event: MembershipEvent) {
        for peer in self.peers.iter() {
            let _ = peer.membership.send(event.clone());
        }
    }

    fn deliver(&self, destination: &NodeId, message: Message) -> Result<(), SchedulerError> {
        if self.unreachable.contains(destination) || self.unreachable.contains(&message.source) {
            return Err(SchedulerError::Transport(format!("{} is unreachable", destination)));
        }
        let peer = self
            .peers
            .get(destination)
            .ok_or_else(|| SchedulerError::UnknownNode(destination.clone()))?;
        peer.messages
            .send(message)
            .map_err(|_| SchedulerError::Transport(format!("{} stopped receiving", destination)))
    }
}

pub struct LocalTransport {
    network: Arc<LocalNetwork>,
    local: NodeId,
}

impl LocalTransport {
    pub fn local_id(&self) -> &NodeId {
        &self.local
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send(
        &self,
        destination: &NodeId,
        message: Message,
        _timeout: Duration,
    ) -> Result<(), SchedulerError> {
        self.network.deliver(destination, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::protocol::MessageBody;

    #[tokio::test]
    async fn test_attach_announces_both_directions() {
        let network = LocalNetwork::new();
        let a = NodeId("a".to_string());
        let b = NodeId("b".to_string());

        let (_ta, mut ea) = network.attach(a.clone(), Location::default());
        let (_tb, mut eb) = network.attach(b.clone(), Location::default());

        assert_eq!(
            ea.membership.try_recv().unwrap(),
            MembershipEvent::Joined(b.clone(), Location::default())
        );
        assert_eq!(
            eb.membership.try_recv().unwrap(),
            MembershipEvent::Joined(a.clone(), Location::default())
        );
    }

    #[tokio::test]
    async fn test_send_and_partition() {
        let network = LocalNetwork::new();
        let a = NodeId("a".to_string());
        let b = NodeId("b".to_string());
        let (ta, _ea) = network.attach(a.clone(), Location::default());
        let (_tb, mut eb) = network.attach(b.clone(), Location::default());

        let message = Message::new(a.clone(), MessageBody::NodeResign);
        ta.send(&b, message.clone(), Duration::from_secs(1)).await.unwrap();
        assert!(matches!(eb.messages.try_recv().unwrap().body, MessageBody::NodeResign));

        network.partition(&b);
        assert!(ta.send(&b, message.clone(), Duration::from_secs(1)).await.is_err());

        network.heal(&b);
        network.kill(&b);
        assert!(ta.send(&b, message, Duration::from_secs(1)).await.is_err());
    }
}
