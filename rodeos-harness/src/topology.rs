//! Cluster topology.
//!
//! Replicas consume from ship nodes. The assignment is fixed when the cluster is constructed:
//! replica `i` consumes from the `i mod n`th ship in creation order, so sources are cycled across
//! replicas whenever the two counts differ.

use std::fmt;
use std::path::PathBuf;

use crate::error::{ClusterError, ClusterResult};

/// The id of a chain node. The producer is node 0, ship nodes count up from 1.
pub type NodeId = u32;
/// The id of a replica, its index in creation order.
pub type ReplicaId = usize;

/// The id of the block producing node.
pub const PRODUCER_NODE_ID: NodeId = 0;

/// The address at which a replica reaches its source's state-history stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Endpoint {
    /// A TCP `host:port` address.
    Tcp { host: String, port: u16 },
    /// A local unix socket path.
    Unix(PathBuf),
}

impl Endpoint {
    /// Parse a `host:port` string as a TCP endpoint.
    pub fn tcp(addr: &str) -> ClusterResult<Self> {
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| ClusterError::InvalidInput(format!("expected host:port, got {}", addr)))?;
        let port = port
            .parse()
            .map_err(|_| ClusterError::InvalidInput(format!("invalid port in endpoint {}", addr)))?;
        Ok(Self::Tcp { host: host.to_string(), port })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(f, "{}:{}", host, port),
            Self::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// A fixed mapping of replica ids to the source node each consumes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopologyMap {
    /// The source of each replica, indexed by replica id.
    assignments: Vec<NodeId>,
}

impl TopologyMap {
    /// Assign `num_replicas` replicas to the given sources, cycling through sources in order.
    pub fn assign(num_replicas: usize, sources: &[NodeId]) -> ClusterResult<Self> {
        if sources.is_empty() && num_replicas > 0 {
            return Err(ClusterError::InvalidInput("at least one source is required to attach replicas".into()));
        }
        let assignments = sources.iter().copied().cycle().take(num_replicas).collect();
        Ok(Self { assignments })
    }

    /// The source assigned to the given replica.
    pub fn source_of(&self, replica: ReplicaId) -> ClusterResult<NodeId> {
        self.assignments.get(replica).copied().ok_or(ClusterError::UnknownReplica(replica))
    }

    /// All replicas assigned to the given source.
    pub fn replicas_of(&self, source: NodeId) -> impl Iterator<Item = ReplicaId> + '_ {
        self.assignments
            .iter()
            .enumerate()
            .filter(move |(_, assigned)| **assigned == source)
            .map(|(replica, _)| replica)
    }

    /// The number of replicas in this topology.
    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    /// Iterate over `(replica, source)` pairs in replica creation order.
    pub fn iter(&self) -> impl Iterator<Item = (ReplicaId, NodeId)> + '_ {
        self.assignments.iter().copied().enumerate()
    }
}
