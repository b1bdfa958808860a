use anyhow::Result;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{RwLock, mpsc};
use tracing::info;

use super::types::{Location, Member, MemberState, MembershipEvent, MembershipMessage, NodeId};

const PING_INTERVAL: Duration = Duration::from_millis(500);
const FAILURE_DETECTION_INTERVAL: Duration = Duration::from_secs(2);
const SUSPECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEAD_TIMEOUT: Duration = Duration::from_secs(10);

/// UDP membership service producing `MembershipEvent`s for the scheduler.
///
/// Also acts as the address book of the HTTP transport: it knows the data
/// address every member advertised when it joined.
pub struct MembershipService {
    pub local_member: Member,
    pub members: Arc<DashMap<NodeId, Member>>,
    socket: Arc<UdpSocket>,
    incarnation: Arc<RwLock<u64>>,
    events: mpsc::UnboundedSender<MembershipEvent>,
}

impl MembershipService {
    pub async fn new(
        local_id: NodeId,
        bind_addr: SocketAddr,
        data_addr: SocketAddr,
        location: Location,
        seed_nodes: Vec<SocketAddr>,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<MembershipEvent>)> {
        let socket = UdpSocket::bind(bind_addr).await?;
        let gossip_addr = socket.local_addr()?;
        let incarnation_counter = Arc::new(RwLock::new(1));
        let current_inc = *incarnation_counter.read().await;
        let local_member = Member {
            id: local_id,
            gossip_addr,
            data_addr,
            location,
            state: MemberState::Alive,
            incarnation: current_inc,
            last_seen: Some(Instant::now()),
        };
        let members = Arc::new(DashMap::new());
        members.insert(local_member.id.clone(), local_member.clone());

        if !seed_nodes.is_empty() {
            info!("Joining cluster via {} seed node(s)", seed_nodes.len());

            for seed_node in seed_nodes.iter() {
                let msg = MembershipMessage::Join {
                    member: local_member.clone(),
                };

                let encoded = bincode::serialize(&msg)?;
                socket.send_to(&encoded, seed_node).await?;
                info!("Sent join request to {}", seed_node);
            }
        }

        let (events, receiver) = mpsc::unbounded_channel();

        Ok((
            Arc::new(Self {
                local_member,
                members,
                socket: Arc::new(socket),
                incarnation: incarnation_counter,
                events,
            }),
            receiver,
        ))
    }

    pub async fn start(self: Arc<Self>) {
        tracing::info!("Starting membership service...");

        {
            let service = self.clone();
            tokio::spawn(async move {
                service.ping_loop().await;
            });
        }

        {
            let service = self.clone();
            tokio::spawn(async move {
                service.receive_loop().await;
            });
        }

        {
            let service = self.clone();
            tokio::spawn(async move {
                service.failure_detection_loop().await;
            });
        }

        tracing::info!("Membership background tasks started");
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_member.id
    }

    pub fn get_member(&self, id: &NodeId) -> Option<Member> {
        self.members.get(id).map(|entry| entry.value().clone())
    }

    /// Data-plane address a member advertised, if it is still considered reachable.
    pub fn data_addr(&self, id: &NodeId) -> Option<SocketAddr> {
        self.members.get(id).and_then(|entry| match entry.state {
            MemberState::Dead | MemberState::Left => None,
            _ => Some(entry.data_addr),
        })
    }

    pub fn get_alive_members(&self) -> Vec<Member> {
        self.members
            .iter()
            .filter(|entry| entry.value().state == MemberState::Alive)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Announces a graceful departure to every reachable member.
    pub async fn leave(&self) {
        info!("Leaving cluster");
        let msg = MembershipMessage::Leave {
            node_id: self.local_member.id.clone(),
        };
        self.broadcast_message(msg).await;
    }

    fn emit(&self, event: MembershipEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("Membership event dropped: scheduler is gone");
        }
    }

    async fn ping_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(PING_INTERVAL);

        loop {
            interval.tick().await;

            let alive_members: Vec<Member> = self
                .members
                .iter()
                .filter(|entry| {
                    entry.value().id != self.local_member.id
                        && entry.value().state == MemberState::Alive
                })
                .map(|entry| entry.value().clone())
                .collect();

            if alive_members.is_empty() {
                continue;
            }

            use rand::Rng;
            let idx = rand::thread_rng().gen_range(0..alive_members.len());
            let target = &alive_members[idx];

            let incarnation = *self.incarnation.read().await;
            let msg = MembershipMessage::Ping {
                from: self.local_member.id.clone(),
                incarnation,
            };

            match bincode::serialize(&msg) {
                Ok(encoded) => {
                    if let Err(e) = self.socket.send_to(&encoded, target.gossip_addr).await {
                        tracing::warn!("Failed to send ping to {}: {}", target.id, e);
                    } else {
                        tracing::trace!("Sent ping to {}", target.id);
                    }
                }
                Err(e) => tracing::error!("Failed to serialize ping: {}", e),
            }
        }
    }

    async fn receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; 65536];

        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, src)) => match bincode::deserialize::<MembershipMessage>(&buf[..len]) {
                    Ok(msg) => {
                        if let Err(e) = self.handle_message(msg, src).await {
                            tracing::error!("Error handling membership message from {}: {}", src, e);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Failed to deserialize membership message from {}: {}", src, e);
                    }
                },
                Err(e) => {
                    tracing::error!("Failed to receive UDP packet: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    pub(crate) async fn handle_message(&self, msg: MembershipMessage, src: SocketAddr) -> Result<()> {
        match msg {
            MembershipMessage::Ping { from, incarnation } => {
                self.handle_ping(from, incarnation, src).await?;
            }
            MembershipMessage::Ack {
                from,
                incarnation,
                members,
            } => {
                self.handle_ack(from, incarnation, members).await;
            }
            MembershipMessage::Join { member } => {
                self.handle_join(member);
            }
            MembershipMessage::Suspect {
                node_id,
                incarnation,
            } => {
                self.handle_suspect(node_id, incarnation).await;
            }
            MembershipMessage::Alive {
                node_id,
                incarnation,
            } => {
                self.handle_alive(node_id, incarnation);
            }
            MembershipMessage::Leave { node_id } => {
                self.handle_leave(node_id);
            }
        }

        Ok(())
    }

    async fn handle_ping(&self, from: NodeId, from_incarnation: u64, src: SocketAddr) -> Result<()> {
        tracing::trace!("Received ping from {}", from);

        match self.members.get_mut(&from) {
            Some(mut member) => {
                member.last_seen = Some(Instant::now());
                if from_incarnation > member.incarnation {
                    member.incarnation = from_incarnation;
                }
            }
            None => {
                // We only know its gossip address; the data address arrives with its Join/Ack.
                tracing::debug!("Ping from unknown member {} at {}", from, src);
            }
        }

        let all_members: Vec<Member> = self
            .members
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let my_incarnation = *self.incarnation.read().await;
        let reply = MembershipMessage::Ack {
            from: self.local_member.id.clone(),
            incarnation: my_incarnation,
            members: all_members,
        };

        let encoded = bincode::serialize(&reply)?;
        self.socket.send_to(&encoded, src).await?;

        Ok(())
    }

    async fn handle_ack(&self, from: NodeId, from_incarnation: u64, members: Vec<Member>) {
        tracing::trace!(
            "Received ack from {} (inc={}) with {} members",
            from,
            from_incarnation,
            members.len()
        );

        if let Some(mut member) = self.members.get_mut(&from) {
            member.last_seen = Some(Instant::now());
            if from_incarnation > member.incarnation {
                member.incarnation = from_incarnation;
            }
        }

        for member in members {
            self.merge_member(member);
        }
    }

    fn merge_member(&self, new_member: Member) {
        if new_member.id == self.local_member.id {
            return;
        }

        let mut joined = None;
        match self.members.get_mut(&new_member.id) {
            Some(mut existing) => {
                if matches!(existing.state, MemberState::Dead | MemberState::Left) {
                    // Terminal for the scheduler; a restarted process comes back with a new id.
                    return;
                }
                if new_member.incarnation > existing.incarnation {
                    existing.incarnation = new_member.incarnation;
                    if new_member.state == MemberState::Alive || new_member.state == MemberState::Suspect {
                        existing.state = new_member.state;
                    }
                    existing.last_seen = Some(Instant::now());
                } else if new_member.incarnation == existing.incarnation
                    && new_member.state == MemberState::Alive
                    && existing.state == MemberState::Suspect
                {
                    tracing::info!("{} refuted suspicion", new_member.id);
                    existing.state = MemberState::Alive;
                    existing.last_seen = Some(Instant::now());
                }
            }
            None => {
                if new_member.state != MemberState::Alive {
                    return;
                }
                tracing::info!(
                    "Discovered new member: {} at {}",
                    new_member.id,
                    new_member.gossip_addr
                );

                let mut member_with_timestamp = new_member;
                member_with_timestamp.last_seen = Some(Instant::now());
                joined = Some((
                    member_with_timestamp.id.clone(),
                    member_with_timestamp.location.clone(),
                ));
                self.members
                    .insert(member_with_timestamp.id.clone(), member_with_timestamp);
            }
        }

        if let Some((id, location)) = joined {
            self.emit(MembershipEvent::Joined(id, location));
        }
    }

    async fn handle_suspect(&self, node_id: NodeId, incarnation: u64) {
        if node_id == self.local_member.id {
            let my_incarnation = {
                let mut inc = self.incarnation.write().await;
                *inc = (*inc).max(incarnation) + 1;
                *inc
            };
            tracing::info!("Refuting suspicion about myself (inc={})", my_incarnation);

            let msg = MembershipMessage::Alive {
                node_id,
                incarnation: my_incarnation,
            };
            self.broadcast_message(msg).await;
            return;
        }

        match self.members.get_mut(&node_id) {
            Some(mut existing) => {
                if incarnation >= existing.incarnation && existing.state == MemberState::Alive {
                    tracing::info!("Node {} at {} suspected", existing.id, existing.gossip_addr);
                    existing.state = MemberState::Suspect;
                    existing.incarnation = incarnation;
                }
            }
            None => {
                tracing::debug!("Suspected node {} doesn't exist", node_id);
            }
        }
    }

    fn handle_alive(&self, node_id: NodeId, incarnation: u64) {
        match self.members.get_mut(&node_id) {
            Some(mut existing) => {
                if existing.state == MemberState::Suspect && incarnation >= existing.incarnation {
                    tracing::info!(
                        "Node {} at {} is alive again (inc={})",
                        existing.id,
                        existing.gossip_addr,
                        incarnation
                    );
                    existing.state = MemberState::Alive;
                    existing.incarnation = incarnation;
                    existing.last_seen = Some(Instant::now());
                } else if incarnation > existing.incarnation {
                    existing.incarnation = incarnation;
                }
            }
            None => {
                tracing::debug!("Alive message for unknown node {}", node_id);
            }
        }
    }

    fn handle_join(&self, mut member: Member) {
        tracing::info!("Node {} joining cluster at {}", member.id, member.gossip_addr);

        if member.id == self.local_member.id {
            return;
        }
        member.state = MemberState::Alive;
        member.last_seen = Some(Instant::now());
        let is_new = !self.members.contains_key(&member.id);
        let location = member.location.clone();
        let id = member.id.clone();
        self.members.insert(id.clone(), member);

        tracing::info!("Cluster size now: {}", self.members.len());
        if is_new {
            self.emit(MembershipEvent::Joined(id, location));
        }
    }

    fn handle_leave(&self, node_id: NodeId) {
        if let Some(mut member) = self.members.get_mut(&node_id) {
            if member.state == MemberState::Left || member.state == MemberState::Dead {
                return;
            }
            tracing::info!("Node {} left the cluster", node_id);
            member.state = MemberState::Left;
        } else {
            return;
        }
        self.emit(MembershipEvent::Left(node_id));
    }

    /// Runs one failure-detection sweep. Returns the suspicions to broadcast.
    pub(crate) fn detect_failures(&self, now: Instant) -> Vec<MembershipMessage> {
        let mut messages_to_broadcast = Vec::new();
        let mut died = Vec::new();

        for mut entry in self.members.iter_mut() {
            let member = entry.value_mut();

            if member.id == self.local_member.id {
                continue;
            }

            let Some(last_seen) = member.last_seen else {
                member.last_seen = Some(now);
                continue;
            };
            let elapsed = now.saturating_duration_since(last_seen);

            match member.state {
                MemberState::Alive => {
                    if elapsed > SUSPECT_TIMEOUT {
                        tracing::warn!("Node {} suspected (no contact for {:?})", member.id, elapsed);
                        member.state = MemberState::Suspect;
                        messages_to_broadcast.push(MembershipMessage::Suspect {
                            node_id: member.id.clone(),
                            incarnation: member.incarnation,
                        });
                    }
                }
                MemberState::Suspect => {
                    if elapsed > DEAD_TIMEOUT {
                        tracing::info!("Node {} declared dead (no contact for {:?})", member.id, elapsed);
                        member.state = MemberState::Dead;
                        died.push(member.id.clone());
                    }
                }
                MemberState::Dead | MemberState::Left => {}
            }
        }

        for id in died {
            self.emit(MembershipEvent::Died(id));
        }

        messages_to_broadcast
    }

    async fn failure_detection_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(FAILURE_DETECTION_INTERVAL);

        loop {
            interval.tick().await;
            for msg in self.detect_failures(Instant::now()) {
                self.broadcast_message(msg).await;
            }
        }
    }

    async fn broadcast_message(&self, msg: MembershipMessage) {
        let encoded = match bincode::serialize(&msg) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::error!("Failed to serialize membership broadcast: {}", e);
                return;
            }
        };

        let targets: Vec<(NodeId, SocketAddr)> = self
            .members
            .iter()
            .filter(|entry| {
                entry.id != self.local_member.id
                    && matches!(entry.state, MemberState::Alive | MemberState::Suspect)
            })
            .map(|entry| (entry.id.clone(), entry.gossip_addr))
            .collect();

        for (id, addr) in targets {
            if let Err(e) = self.socket.send_to(&encoded, addr).await {
                tracing::warn!("Failed to broadcast to {}: {}", id, e);
            }
        }
    }
}
