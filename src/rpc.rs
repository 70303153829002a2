//! Replica-to-replica wire types and paths.

use std::{future::Future, pin::Pin};

use serde::{Deserialize, Serialize};

use crate::domain::{OrderLogEntry, RaftLogEntry};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub const REPLICATE_RAFT_PATH: &str = "/replicate_raft";
pub const REPLICATE_ORDER_PATH: &str = "/replicate_order";
pub const INVALIDATE_RAFT_PATH: &str = "/invalidate_raft";
pub const MISSED_RAFT_PATH: &str = "/missed_raft";
pub const MISSED_ORDER_PATH: &str = "/missed_order";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicateRaft {
    #[serde(flatten)]
    pub entry: RaftLogEntry,
    /// `host:port` of the proposing node.
    pub leader_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicateOrder {
    #[serde(flatten)]
    pub entry: OrderLogEntry,
    pub leader_id: String,
}

/// `None` means the requester's log is empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissedRaftRequest {
    #[serde(default)]
    pub latest_raft_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissedRaftResponse {
    pub missed_raft_entries: Vec<RaftLogEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissedOrderRequest {
    #[serde(default)]
    pub latest_order_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissedOrderResponse {
    pub missed_orders: Vec<OrderLogEntry>,
}
