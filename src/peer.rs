//! Outbound calls to other replicas.
//!
//! [`PeerEndpoint`] is the seam: [`HttpPeer`] talks to a live replica over HTTP, tests plug in
//! in-memory endpoints. [`PeerSet`] owns one endpoint per configured node and fans messages out
//! to every follower of a given leader.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use anyhow::{Context, bail};
use futures_util::future::join_all;
use reqwest::StatusCode;
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, warn};

use crate::{
    cluster::{LeaderDescriptor, PeerTable, ReplicaId, ReplicaNode},
    domain::{CatchUp, OrderLogEntry, RaftLogEntry},
    rpc::{
        BoxFuture, INVALIDATE_RAFT_PATH, MISSED_ORDER_PATH, MISSED_RAFT_PATH,
        MissedOrderRequest, MissedOrderResponse, MissedRaftRequest, MissedRaftResponse,
        REPLICATE_ORDER_PATH, REPLICATE_RAFT_PATH, ReplicateOrder, ReplicateRaft,
    },
};

pub trait PeerEndpoint: Send + Sync + 'static {
    fn replicate_raft<'a>(&'a self, req: &'a ReplicateRaft) -> BoxFuture<'a, anyhow::Result<()>>;

    fn replicate_order<'a>(&'a self, req: &'a ReplicateOrder)
    -> BoxFuture<'a, anyhow::Result<()>>;

    fn invalidate_raft(&self, n: u64) -> BoxFuture<'_, anyhow::Result<()>>;

    fn missed_raft(
        &self,
        latest: Option<u64>,
    ) -> BoxFuture<'_, anyhow::Result<CatchUp<RaftLogEntry>>>;

    fn missed_orders(
        &self,
        latest: Option<u64>,
    ) -> BoxFuture<'_, anyhow::Result<CatchUp<OrderLogEntry>>>;
}

pub fn build_client(timeout: Duration) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .context("build http client")
}

#[derive(Clone)]
pub struct HttpPeer {
    base: String,
    client: reqwest::Client,
}

impl HttpPeer {
    pub fn new(node: &ReplicaNode, client: reqwest::Client) -> Self {
        Self {
            base: node.base_url(),
            client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    async fn post_ok<Req: Serialize>(&self, path: &str, req: &Req) -> anyhow::Result<()> {
        let url = self.url(path);
        let resp = self.client.post(&url).json(req).send().await?;
        ensure_success(&url, resp.status())
    }

    /// `200` means up to date; `201` carries the missing records.
    async fn post_missed<Req, Resp, R>(
        &self,
        path: &str,
        req: &Req,
        records: impl FnOnce(Resp) -> Vec<R>,
    ) -> anyhow::Result<CatchUp<R>>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let url = self.url(path);
        let resp = self.client.post(&url).json(req).send().await?;
        match resp.status() {
            StatusCode::OK => Ok(CatchUp::UpToDate),
            StatusCode::CREATED => {
                let body: Resp = resp
                    .json()
                    .await
                    .with_context(|| format!("decode catch-up response from {url}"))?;
                Ok(CatchUp::Behind(records(body)))
            }
            status => bail!("{url} answered {status}"),
        }
    }
}

fn ensure_success(url: &str, status: StatusCode) -> anyhow::Result<()> {
    if status.is_success() {
        Ok(())
    } else {
        bail!("{url} answered {status}")
    }
}

impl PeerEndpoint for HttpPeer {
    fn replicate_raft<'a>(&'a self, req: &'a ReplicateRaft) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move { self.post_ok(REPLICATE_RAFT_PATH, req).await })
    }

    fn replicate_order<'a>(
        &'a self,
        req: &'a ReplicateOrder,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move { self.post_ok(REPLICATE_ORDER_PATH, req).await })
    }

    fn invalidate_raft(&self, n: u64) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            let url = self.url(&format!("{INVALIDATE_RAFT_PATH}/{n}"));
            let resp = self.client.get(&url).send().await?;
            ensure_success(&url, resp.status())
        })
    }

    fn missed_raft(
        &self,
        latest: Option<u64>,
    ) -> BoxFuture<'_, anyhow::Result<CatchUp<RaftLogEntry>>> {
        Box::pin(async move {
            let req = MissedRaftRequest {
                latest_raft_id: latest,
            };
            self.post_missed(MISSED_RAFT_PATH, &req, |resp: MissedRaftResponse| {
                resp.missed_raft_entries
            })
            .await
        })
    }

    fn missed_orders(
        &self,
        latest: Option<u64>,
    ) -> BoxFuture<'_, anyhow::Result<CatchUp<OrderLogEntry>>> {
        Box::pin(async move {
            let req = MissedOrderRequest {
                latest_order_id: latest,
            };
            self.post_missed(MISSED_ORDER_PATH, &req, |resp: MissedOrderResponse| {
                resp.missed_orders
            })
            .await
        })
    }
}

/// A message fanned out to every follower.
#[derive(Debug, Clone)]
pub enum Broadcast {
    Propose(ReplicateRaft),
    Commit(ReplicateOrder),
    Invalidate(u64),
}

impl Broadcast {
    fn name(&self) -> &'static str {
        match self {
            Self::Propose(_) => "replicate_raft",
            Self::Commit(_) => "replicate_order",
            Self::Invalidate(_) => "invalidate_raft",
        }
    }

    fn deliver<'a>(&'a self, peer: &'a dyn PeerEndpoint) -> BoxFuture<'a, anyhow::Result<()>> {
        match self {
            Self::Propose(req) => peer.replicate_raft(req),
            Self::Commit(req) => peer.replicate_order(req),
            Self::Invalidate(n) => peer.invalidate_raft(*n),
        }
    }
}

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub replica_id: ReplicaId,
    pub error: Option<String>,
}

impl Delivery {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

pub fn count_acks(deliveries: &[Delivery]) -> usize {
    deliveries.iter().filter(|d| d.is_ok()).count()
}

#[derive(Clone)]
pub struct PeerSet {
    table: PeerTable,
    endpoints: BTreeMap<ReplicaId, Arc<dyn PeerEndpoint>>,
}

impl PeerSet {
    pub fn new(table: PeerTable, endpoints: BTreeMap<ReplicaId, Arc<dyn PeerEndpoint>>) -> Self {
        Self { table, endpoints }
    }

    /// One [`HttpPeer`] per configured node, the local one included: the designated leader
    /// may be any address, so the local node can be a follower of its own write.
    pub fn http(table: PeerTable, client: reqwest::Client) -> Self {
        let endpoints = table
            .nodes()
            .iter()
            .map(|node| {
                let peer: Arc<dyn PeerEndpoint> = Arc::new(HttpPeer::new(node, client.clone()));
                (node.id, peer)
            })
            .collect();
        Self { table, endpoints }
    }

    pub fn table(&self) -> &PeerTable {
        &self.table
    }

    pub fn endpoint(&self, id: ReplicaId) -> Option<&dyn PeerEndpoint> {
        self.endpoints.get(&id).map(|p| p.as_ref())
    }

    /// Sends `msg` to every node not at the leader's address, concurrently, and waits for all
    /// of them. Failures are logged and reported, never retried.
    pub async fn broadcast(&self, leader: &LeaderDescriptor, msg: &Broadcast) -> Vec<Delivery> {
        let tasks = self.table.followers_of(leader).filter_map(|node| {
            let Some(endpoint) = self.endpoint(node.id) else {
                warn!(replica_id = node.id, "no endpoint for replica");
                return None;
            };
            Some(async move {
                let result = msg.deliver(endpoint).await;
                match result {
                    Ok(()) => {
                        debug!(replica_id = node.id, rpc = msg.name(), "peer acknowledged");
                        Delivery {
                            replica_id: node.id,
                            error: None,
                        }
                    }
                    Err(err) => {
                        warn!(
                            replica_id = node.id,
                            addr = %node.addr(),
                            rpc = msg.name(),
                            %err,
                            "peer delivery failed"
                        );
                        Delivery {
                            replica_id: node.id,
                            error: Some(err.to_string()),
                        }
                    }
                }
            })
        });
        join_all(tasks).await
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_json, method, path},
    };

    use super::*;

    fn node_for(server: &MockServer, id: ReplicaId) -> ReplicaNode {
        let addr = server.address();
        ReplicaNode::new(id, addr.ip().to_string(), addr.port())
    }

    fn client() -> reqwest::Client {
        build_client(Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn replicate_raft_posts_flat_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/replicate_raft"))
            .and(body_json(json!({
                "raft_index": 0,
                "raft_term": 2,
                "product_name": "Tux",
                "quantity": 1,
                "leader_id": "localhost:12502"
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let peer = HttpPeer::new(&node_for(&server, 2), client());
        let req = ReplicateRaft {
            entry: RaftLogEntry {
                index: 0,
                term: 2,
                product_name: "Tux".to_string(),
                quantity: 1,
            },
            leader_id: "localhost:12502".to_string(),
        };
        peer.replicate_raft(&req).await.unwrap();
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/invalidate_raft/4"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let peer = HttpPeer::new(&node_for(&server, 2), client());
        assert!(peer.invalidate_raft(4).await.is_err());
    }

    #[tokio::test]
    async fn missed_orders_maps_status_codes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/missed_order"))
            .and(body_json(json!({ "latest_order_id": null })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "missed_orders": [
                    { "order_number": 0, "product_name": "Tux", "quantity": 2 }
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/missed_order"))
            .and(body_json(json!({ "latest_order_id": 0 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "message": "up to date"
            })))
            .mount(&server)
            .await;

        let peer = HttpPeer::new(&node_for(&server, 3), client());
        assert_eq!(
            peer.missed_orders(None).await.unwrap(),
            CatchUp::Behind(vec![OrderLogEntry {
                order_number: 0,
                product_name: "Tux".to_string(),
                quantity: 2,
            }])
        );
        assert_eq!(peer.missed_orders(Some(0)).await.unwrap(), CatchUp::UpToDate);
    }

    #[tokio::test]
    async fn broadcast_skips_leader_address_and_reports_failures() {
        let healthy = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/invalidate_raft/1"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&healthy)
            .await;

        let leader_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&leader_server)
            .await;

        let leader = node_for(&leader_server, 1);
        // Nothing listens on port 9 of the discard range; the connection is refused.
        let dead = ReplicaNode::new(3, "127.0.0.1", 9);
        let table = PeerTable::new(
            1,
            vec![leader.clone(), node_for(&healthy, 2), dead],
        )
        .unwrap();
        let peers = PeerSet::http(table, client());

        let deliveries = peers
            .broadcast(&LeaderDescriptor::from(&leader), &Broadcast::Invalidate(1))
            .await;
        assert_eq!(deliveries.len(), 2);
        assert_eq!(count_acks(&deliveries), 1);
        let failed: Vec<ReplicaId> = deliveries
            .iter()
            .filter(|d| !d.is_ok())
            .map(|d| d.replica_id)
            .collect();
        assert_eq!(failed, vec![3]);
    }

    #[tokio::test]
    async fn stalled_follower_times_out_as_failed_ack() {
        let healthy = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/replicate_order"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&healthy)
            .await;
        let stalled = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/replicate_order"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&stalled)
            .await;

        let leader = ReplicaNode::new(1, "127.0.0.1", 9);
        let table = PeerTable::new(
            1,
            vec![leader.clone(), node_for(&healthy, 2), node_for(&stalled, 3)],
        )
        .unwrap();
        let timeout = Duration::from_millis(300);
        let peers = PeerSet::http(table, build_client(timeout).unwrap());

        let msg = Broadcast::Commit(ReplicateOrder {
            entry: OrderLogEntry {
                order_number: 0,
                product_name: "Tux".to_string(),
                quantity: 1,
            },
            leader_id: leader.addr(),
        });
        let started = std::time::Instant::now();
        let deliveries = peers.broadcast(&LeaderDescriptor::from(&leader), &msg).await;
        let elapsed = started.elapsed();

        assert!(elapsed < Duration::from_secs(2), "broadcast took {elapsed:?}");
        assert_eq!(count_acks(&deliveries), 1);
        let failed: Vec<ReplicaId> = deliveries
            .iter()
            .filter(|d| !d.is_ok())
            .map(|d| d.replica_id)
            .collect();
        assert_eq!(failed, vec![3]);
    }
}
