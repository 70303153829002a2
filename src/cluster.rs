use std::{collections::BTreeSet, fmt, str::FromStr};

use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};

pub type ReplicaId = u64;

/// A static cluster member. Membership never changes at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaNode {
    pub id: ReplicaId,
    pub host: String,
    pub port: u16,
}

impl ReplicaNode {
    pub fn new(id: ReplicaId, host: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            host: host.into(),
            port,
        }
    }

    /// `host:port`, also used as the `leader_id` on replication payloads.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Leader identification is by address equality, never by id.
    pub fn is_at(&self, leader: &LeaderDescriptor) -> bool {
        self.host == leader.host && self.port == leader.port
    }
}

impl fmt::Display for ReplicaNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}:{}", self.id, self.host, self.port)
    }
}

/// Parses `ID=HOST:PORT`.
impl FromStr for ReplicaNode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, addr) = s
            .trim()
            .split_once('=')
            .ok_or_else(|| format!("peer must be ID=HOST:PORT, got: {s}"))?;
        let id: ReplicaId = id
            .trim()
            .parse()
            .map_err(|_| format!("invalid peer id: {id}"))?;
        let (host, port) = addr
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| format!("peer address must be HOST:PORT, got: {addr}"))?;
        if host.is_empty() {
            return Err(format!("peer host is empty: {s}"));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| format!("invalid peer port: {port}"))?;
        Ok(Self::new(id, host, port))
    }
}

/// The externally supplied designation of the acting leader.
///
/// The gateway probes for a reachable node and attaches this to every write; a replica never
/// decides on its own that it is the leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderDescriptor {
    pub host: String,
    pub port: u16,
}

impl From<&ReplicaNode> for LeaderDescriptor {
    fn from(node: &ReplicaNode) -> Self {
        Self {
            host: node.host.clone(),
            port: node.port,
        }
    }
}

/// Immutable peer table, including the local node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerTable {
    local_id: ReplicaId,
    nodes: Vec<ReplicaNode>,
}

impl PeerTable {
    pub fn new(local_id: ReplicaId, mut nodes: Vec<ReplicaNode>) -> Result<Self> {
        ensure!(!nodes.is_empty(), "peer table requires at least one node");
        let ids: BTreeSet<ReplicaId> = nodes.iter().map(|n| n.id).collect();
        ensure!(ids.len() == nodes.len(), "peer table has duplicate replica ids");
        ensure!(
            ids.contains(&local_id),
            "replica id {local_id} is not present in the peer table"
        );
        nodes.sort_by_key(|n| n.id);
        Ok(Self { local_id, nodes })
    }

    pub fn local_id(&self) -> ReplicaId {
        self.local_id
    }

    pub fn local(&self) -> &ReplicaNode {
        self.nodes
            .iter()
            .find(|n| n.id == self.local_id)
            .unwrap_or(&self.nodes[0])
    }

    pub fn nodes(&self) -> &[ReplicaNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Every configured node except the one at the leader's address.
    pub fn followers_of<'a>(
        &'a self,
        leader: &'a LeaderDescriptor,
    ) -> impl Iterator<Item = &'a ReplicaNode> + 'a {
        self.nodes.iter().filter(move |n| !n.is_at(leader))
    }

    /// Peers to ask during catch-up: highest replica id first, self excluded.
    pub fn catch_up_order(&self) -> Vec<&ReplicaNode> {
        let mut out: Vec<&ReplicaNode> =
            self.nodes.iter().filter(|n| n.id != self.local_id).collect();
        out.sort_by(|a, b| b.id.cmp(&a.id));
        out
    }
}
