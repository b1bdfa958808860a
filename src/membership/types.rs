use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::time::Instant;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form keeps log lines readable.
        let short: String = self.0.chars().take(8).collect();
        write!(f, "{}", short)
    }
}

/// Where a node lives: a hierarchical cluster path (e.g. `["eu", "rack-3"]`)
/// plus a host name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub struct Location {
    pub cluster: Vec<String>,
    pub host: String,
}

impl Location {
    pub fn new(cluster: &[&str], host: &str) -> Self {
        Self {
            cluster: cluster.iter().map(|c| c.to_string()).collect(),
            host: host.to_string(),
        }
    }

    /// Parses `"eu/rack-3"` style cluster paths.
    pub fn from_path(path: &str, host: &str) -> Self {
        Self {
            cluster: path
                .split('/')
                .filter(|level| !level.is_empty())
                .map(|level| level.to_string())
                .collect(),
            host: host.to_string(),
        }
    }

    pub fn same_cluster(&self, other: &Location) -> bool {
        self.cluster == other.cluster
    }

    /// Number of leading cluster levels both locations share.
    pub fn common_depth(&self, other: &Location) -> usize {
        self.cluster
            .iter()
            .zip(other.cluster.iter())
            .take_while(|(a, b)| a == b)
            .count()
    }

    /// Deterministic tie-break rank of `other` as seen from `self`.
    ///
    /// Closer nodes rank lower. Within the same topological distance the rank is a
    /// hash of both hosts, so different observers order the same targets differently
    /// and do not all pick the same node at the same moment.
    pub fn distance_rank(&self, other: &Location) -> u64 {
        let depth = self.cluster.len().max(other.cluster.len());
        let distance = (depth - self.common_depth(other)) as u64;
        let mut hasher = DefaultHasher::new();
        self.host.hash(&mut hasher);
        other.host.hash(&mut hasher);
        (distance << 48) | (hasher.finish() & 0xFFFF_FFFF_FFFF)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.cluster.join("/"), self.host)
    }
}

/// What the scheduler learns from the membership layer.
#[derive(Debug, Clone, PartialEq)]
pub enum MembershipEvent {
    Joined(NodeId, Location),
    Died(NodeId),
    Left(NodeId),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum MemberState {
    Alive,
    Suspect,
    Dead,
    Left,
}

/// Represents a single member in the cluster.
///
/// Contains identity, network addressing, and current lifecycle state.
/// The `incarnation` field is a logical clock used to order updates and resolve conflicts
/// (e.g., refuting a false "Suspect" claim).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub id: NodeId,
    pub gossip_addr: SocketAddr,
    pub data_addr: SocketAddr,
    pub location: Location,
    pub state: MemberState,
    pub incarnation: u64,

    #[serde(skip)]
    pub last_seen: Option<Instant>,
}

/// The membership wire protocol.
///
/// - `Ping/Ack`: Used for liveness checks and state synchronization.
/// - `Join`: Sent by new nodes to seed nodes to enter the cluster.
/// - `Suspect/Alive`: Disseminates changes in node health.
/// - `Leave`: A node announces a graceful departure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MembershipMessage {
    Ping {
        from: NodeId,
        incarnation: u64,
    },

    Ack {
        from: NodeId,
        incarnation: u64,
        members: Vec<Member>,
    },

    Join {
        member: Member,
    },

    Suspect {
        node_id: NodeId,
        incarnation: u64,
    },

    Alive {
        node_id: NodeId,
        incarnation: u64,
    },

    Leave {
        node_id: NodeId,
    },
}
