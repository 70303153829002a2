//! The replication engine behind every HTTP handler.
//!
//! Raft indices and order numbers live in two independent [`LogDomain`]s, each behind its own
//! mutex. Lock order, when both are needed, is raft then orders; the write path never holds
//! both. The election term is a plain atomic set externally.

use std::{
    fmt,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    anti_entropy::{self, CatchUpStrategy, ReconcileOutcome},
    catalog::{Availability, Catalog, DebitOutcome},
    cluster::{LeaderDescriptor, PeerTable},
    counter::FollowerCounterRule,
    domain::{CatchUp, LogDomain, OrderLogEntry, RaftLogEntry},
    log_store::{LogFile, LogPaths, LogStoreError, rollback_token},
    peer::{Broadcast, PeerSet, count_acks},
    rpc::{ReplicateOrder, ReplicateRaft},
};

/// How many follower acknowledgements a proposal needs before the catalog is debited.
#[derive(clap::ValueEnum, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QuorumPolicy {
    /// One acknowledgement from any follower.
    #[default]
    AtLeastOne,
    /// Enough followers that, with the leader, a strict majority of the cluster holds it.
    Majority,
}

impl QuorumPolicy {
    pub fn required_acks(self, cluster_size: usize) -> usize {
        match self {
            Self::AtLeastOne => 1,
            Self::Majority => cluster_size / 2,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnginePolicy {
    pub quorum: QuorumPolicy,
    pub follower_counter: FollowerCounterRule,
}

/// Body of `POST /orders`.
///
/// `name` and `quantity` stay untyped until the leader gate has run, so a leaderless request
/// is refused with 403 whatever shape the rest of the body has.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PlaceOrder {
    #[serde(default)]
    pub name: Option<Value>,
    #[serde(default)]
    pub quantity: Option<Value>,
    #[serde(default)]
    pub leader: Option<LeaderDescriptor>,
}

#[derive(Debug)]
pub enum WriteError {
    NoLeader,
    InvalidInput(String),
    InsufficientStock {
        product: String,
        requested: u32,
        available: u64,
    },
    /// Catalog answered with something other than success; status and body pass through.
    Catalog {
        status: u16,
        body: String,
    },
    CatalogUnavailable(anyhow::Error),
    NoQuorum {
        acks: usize,
        required: usize,
    },
    Storage(LogStoreError),
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoLeader => write!(f, "no leader designated for this write"),
            Self::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Self::InsufficientStock {
                product,
                requested,
                available,
            } => write!(
                f,
                "insufficient stock for {product}: requested {requested}, available {available}"
            ),
            Self::Catalog { status, body } => write!(f, "catalog answered {status}: {body}"),
            Self::CatalogUnavailable(e) => write!(f, "catalog unavailable: {e}"),
            Self::NoQuorum { acks, required } => write!(
                f,
                "replication failed: {acks} of {required} required acknowledgements"
            ),
            Self::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for WriteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(e) => Some(e),
            Self::CatalogUnavailable(e) => Some(&**e),
            _ => None,
        }
    }
}

impl From<LogStoreError> for WriteError {
    fn from(value: LogStoreError) -> Self {
        Self::Storage(value)
    }
}

pub struct OrderEngine {
    raft: Mutex<LogDomain<RaftLogEntry>>,
    orders: Mutex<LogDomain<OrderLogEntry>>,
    term: AtomicU64,
    peers: PeerSet,
    catalog: Arc<dyn Catalog>,
    policy: EnginePolicy,
}

impl OrderEngine {
    pub fn new(
        raft: LogDomain<RaftLogEntry>,
        orders: LogDomain<OrderLogEntry>,
        peers: PeerSet,
        catalog: Arc<dyn Catalog>,
        policy: EnginePolicy,
    ) -> Self {
        Self {
            raft: Mutex::new(raft),
            orders: Mutex::new(orders),
            term: AtomicU64::new(0),
            peers,
            catalog,
            policy,
        }
    }

    /// Opens both logs of the local replica under `data_dir`.
    pub fn open(
        data_dir: &Path,
        peers: PeerSet,
        catalog: Arc<dyn Catalog>,
        policy: EnginePolicy,
    ) -> Result<Self, LogStoreError> {
        let paths = LogPaths::new(data_dir, peers.table().local_id());
        let raft = LogDomain::open(LogFile::open(&paths.raft)?)?;
        let orders = LogDomain::open(LogFile::open(&paths.orders)?)?;
        info!(
            replica_id = peers.table().local_id(),
            raft_next = raft.counter().next(),
            order_next = orders.counter().next(),
            "logs opened"
        );
        Ok(Self::new(raft, orders, peers, catalog, policy))
    }

    pub fn table(&self) -> &PeerTable {
        self.peers.table()
    }

    /// `host:port` of this replica, sent as `leader_id` on everything it replicates.
    pub fn leader_id(&self) -> String {
        self.peers.table().local().addr()
    }

    pub fn current_term(&self) -> u64 {
        self.term.load(Ordering::SeqCst)
    }

    pub fn note_term(&self, term: u64) {
        let prev = self.term.swap(term, Ordering::SeqCst);
        info!(prev, term, "election term noted");
    }

    /// The leader-side write path. Returns the issued order number.
    pub async fn place_order(&self, req: PlaceOrder) -> Result<u64, WriteError> {
        let Some(leader) = req.leader else {
            return Err(WriteError::NoLeader);
        };
        let (product, quantity) = validate(req.name, req.quantity)?;

        let availability = self
            .catalog
            .check(&product, quantity)
            .await
            .map_err(WriteError::CatalogUnavailable)?;
        match availability {
            Availability::InStock { .. } => {}
            Availability::Insufficient { available } => {
                return Err(WriteError::InsufficientStock {
                    product,
                    requested: quantity,
                    available,
                });
            }
            Availability::Rejected { status, body } => {
                return Err(WriteError::Catalog { status, body });
            }
        }

        let proposal = {
            let mut raft = self.raft.lock().await;
            let term = self.current_term();
            raft.append_next(|index| RaftLogEntry {
                index,
                term,
                product_name: product.clone(),
                quantity,
            })?
        };
        debug!(index = proposal.index, term = proposal.term, "proposal appended");

        let deliveries = self
            .peers
            .broadcast(
                &leader,
                &Broadcast::Propose(ReplicateRaft {
                    entry: proposal.clone(),
                    leader_id: self.leader_id(),
                }),
            )
            .await;
        let acks = count_acks(&deliveries);
        let required = self.policy.quorum.required_acks(self.peers.table().len());
        if acks < required {
            warn!(index = proposal.index, acks, required, "proposal not replicated");
            self.rollback_local(proposal.index).await?;
            if acks > 0 {
                self.peers
                    .broadcast(&leader, &Broadcast::Invalidate(rollback_token(proposal.index)))
                    .await;
            }
            return Err(WriteError::NoQuorum { acks, required });
        }

        let debit = self.catalog.debit(&product, quantity).await;
        let declined = match debit {
            Ok(DebitOutcome::Accepted) => None,
            Ok(DebitOutcome::Declined { status, body }) => Some(WriteError::Catalog { status, body }),
            Err(e) => Some(WriteError::CatalogUnavailable(e)),
        };
        if let Some(err) = declined {
            warn!(index = proposal.index, %err, "catalog debit failed, rolling back proposal");
            self.rollback_local(proposal.index).await?;
            self.peers
                .broadcast(&leader, &Broadcast::Invalidate(rollback_token(proposal.index)))
                .await;
            return Err(err);
        }

        let order = {
            let mut orders = self.orders.lock().await;
            orders.append_next(|order_number| OrderLogEntry {
                order_number,
                product_name: product,
                quantity,
            })?
        };
        info!(
            order_number = order.order_number,
            product = %order.product_name,
            quantity = order.quantity,
            "order committed"
        );

        self.peers
            .broadcast(
                &leader,
                &Broadcast::Commit(ReplicateOrder {
                    entry: order.clone(),
                    leader_id: self.leader_id(),
                }),
            )
            .await;
        Ok(order.order_number)
    }

    async fn rollback_local(&self, index: u64) -> Result<(), LogStoreError> {
        let mut raft = self.raft.lock().await;
        raft.invalidate(rollback_token(index))?;
        Ok(())
    }

    pub async fn accept_raft(&self, req: ReplicateRaft) -> Result<(), LogStoreError> {
        let mut raft = self.raft.lock().await;
        raft.accept_replicated(&req.entry, self.policy.follower_counter)?;
        debug!(
            index = req.entry.index,
            leader_id = %req.leader_id,
            "replicated proposal accepted"
        );
        Ok(())
    }

    pub async fn accept_order(&self, req: ReplicateOrder) -> Result<(), LogStoreError> {
        let mut orders = self.orders.lock().await;
        orders.accept_replicated(&req.entry, self.policy.follower_counter)?;
        info!(
            order_number = req.entry.order_number,
            leader_id = %req.leader_id,
            "replicated order accepted"
        );
        Ok(())
    }

    /// Follower side of a rollback. Missing targets are not an error.
    pub async fn invalidate_raft(&self, n: u64) -> Result<Option<RaftLogEntry>, LogStoreError> {
        let mut raft = self.raft.lock().await;
        let removed = raft.invalidate(n)?;
        match &removed {
            Some(entry) => info!(n, index = entry.index, "proposal invalidated"),
            None => debug!(n, "invalidation matched nothing"),
        }
        Ok(removed)
    }

    pub async fn order(&self, order_number: u64) -> Result<Option<OrderLogEntry>, LogStoreError> {
        self.orders.lock().await.find(order_number)
    }

    pub async fn missing_raft(
        &self,
        latest: Option<u64>,
    ) -> Result<CatchUp<RaftLogEntry>, LogStoreError> {
        self.raft.lock().await.missing_after(latest)
    }

    pub async fn missing_orders(
        &self,
        latest: Option<u64>,
    ) -> Result<CatchUp<OrderLogEntry>, LogStoreError> {
        self.orders.lock().await.missing_after(latest)
    }

    /// Startup catch-up: the raft log first, then orders.
    pub async fn reconcile(
        &self,
        strategy: CatchUpStrategy,
    ) -> Result<(ReconcileOutcome, ReconcileOutcome), LogStoreError> {
        let raft = anti_entropy::reconcile(&self.raft, &self.peers, strategy).await?;
        let orders = anti_entropy::reconcile(&self.orders, &self.peers, strategy).await?;
        Ok((raft, orders))
    }

    pub async fn snapshot(&self) -> Result<(Vec<RaftLogEntry>, Vec<OrderLogEntry>), LogStoreError> {
        let raft = self.raft.lock().await.read_all()?;
        let orders = self.orders.lock().await.read_all()?;
        Ok((raft, orders))
    }
}

fn validate(name: Option<Value>, quantity: Option<Value>) -> Result<(String, u32), WriteError> {
    let invalid = |msg: &str| WriteError::InvalidInput(msg.to_string());
    let name = match name {
        None | Some(Value::Null) => return Err(invalid("product name is required")),
        Some(Value::String(name)) => name.trim().to_string(),
        Some(_) => return Err(invalid("product name must be a string")),
    };
    if name.is_empty() {
        return Err(invalid("product name is required"));
    }
    let quantity = match quantity {
        None | Some(Value::Null) => return Err(invalid("quantity is required")),
        Some(Value::Number(n)) => n,
        Some(_) => return Err(invalid("quantity must be an integer")),
    };
    let quantity = match (quantity.as_u64(), quantity.as_i64()) {
        (Some(0), _) | (None, Some(_)) => {
            return Err(invalid("quantity must be a positive integer"));
        }
        (Some(q), _) => u32::try_from(q).map_err(|_| invalid("quantity is too large"))?,
        (None, None) => return Err(invalid("quantity must be an integer")),
    };
    Ok((name, quantity))
}
