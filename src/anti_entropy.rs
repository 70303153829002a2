//! Startup catch-up from peers.
//!
//! Only missing suffixes are repaired. A replica that holds records its peers never saw, or a
//! different record under the same key, is not detected here.

use std::collections::{BTreeMap, BTreeSet};

use futures_util::future::join_all;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{
    cluster::ReplicaId,
    domain::{CatchUp, LogDomain, OrderLogEntry, RaftLogEntry},
    log_store::{LogRecord, LogStoreError},
    peer::{PeerEndpoint, PeerSet},
    rpc::BoxFuture,
};

#[derive(clap::ValueEnum, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CatchUpStrategy {
    /// Ask peers from the highest replica id down and take the first answer.
    #[default]
    FirstResponder,
    /// Ask every peer and merge the union of what they report.
    Union,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    UpToDate,
    Merged {
        from: Vec<ReplicaId>,
        records: usize,
    },
    /// No peer answered; the local log is used as is.
    Unreachable,
}

/// A record kind that peers can be asked about.
pub trait CatchUpRecord: LogRecord {
    fn query_missing(
        peer: &dyn PeerEndpoint,
        latest: Option<u64>,
    ) -> BoxFuture<'_, anyhow::Result<CatchUp<Self>>>;
}

impl CatchUpRecord for RaftLogEntry {
    fn query_missing(
        peer: &dyn PeerEndpoint,
        latest: Option<u64>,
    ) -> BoxFuture<'_, anyhow::Result<CatchUp<Self>>> {
        peer.missed_raft(latest)
    }
}

impl CatchUpRecord for OrderLogEntry {
    fn query_missing(
        peer: &dyn PeerEndpoint,
        latest: Option<u64>,
    ) -> BoxFuture<'_, anyhow::Result<CatchUp<Self>>> {
        peer.missed_orders(latest)
    }
}

pub async fn reconcile<R: CatchUpRecord>(
    domain: &Mutex<LogDomain<R>>,
    peers: &PeerSet,
    strategy: CatchUpStrategy,
) -> Result<ReconcileOutcome, LogStoreError> {
    let latest = domain.lock().await.last_issued();
    let outcome = match strategy {
        CatchUpStrategy::FirstResponder => first_responder(domain, peers, latest).await?,
        CatchUpStrategy::Union => union(domain, peers, latest).await?,
    };
    match &outcome {
        ReconcileOutcome::UpToDate => info!(kind = R::KIND, ?latest, "log up to date"),
        ReconcileOutcome::Merged { from, records } => {
            info!(kind = R::KIND, ?from, records, "caught up from peers")
        }
        ReconcileOutcome::Unreachable => {
            warn!(kind = R::KIND, "no peer answered catch-up; continuing with local log")
        }
    }
    Ok(outcome)
}

async fn first_responder<R: CatchUpRecord>(
    domain: &Mutex<LogDomain<R>>,
    peers: &PeerSet,
    latest: Option<u64>,
) -> Result<ReconcileOutcome, LogStoreError> {
    for node in peers.table().catch_up_order() {
        let Some(endpoint) = peers.endpoint(node.id) else {
            continue;
        };
        match R::query_missing(endpoint, latest).await {
            Ok(CatchUp::UpToDate) => return Ok(ReconcileOutcome::UpToDate),
            Ok(CatchUp::Behind(records)) => {
                domain.lock().await.merge_missing(&records)?;
                return Ok(ReconcileOutcome::Merged {
                    from: vec![node.id],
                    records: records.len(),
                });
            }
            Err(err) => {
                warn!(kind = R::KIND, replica_id = node.id, %err, "catch-up query failed");
            }
        }
    }
    Ok(ReconcileOutcome::Unreachable)
}

async fn union<R: CatchUpRecord>(
    domain: &Mutex<LogDomain<R>>,
    peers: &PeerSet,
    latest: Option<u64>,
) -> Result<ReconcileOutcome, LogStoreError> {
    let order = peers.table().catch_up_order();
    let queries = order.iter().filter_map(|node| {
        let endpoint = peers.endpoint(node.id)?;
        Some(async move { (node.id, R::query_missing(endpoint, latest).await) })
    });
    let answers = join_all(queries).await;

    let mut answered = false;
    let mut from = Vec::new();
    // Highest replica id first, so on key collisions its record wins.
    let mut merged: BTreeMap<u64, R> = BTreeMap::new();
    for (replica_id, answer) in answers {
        match answer {
            Ok(CatchUp::UpToDate) => answered = true,
            Ok(CatchUp::Behind(records)) => {
                answered = true;
                from.push(replica_id);
                for record in records {
                    merged.entry(record.key()).or_insert(record);
                }
            }
            Err(err) => {
                warn!(kind = R::KIND, replica_id, %err, "catch-up query failed");
            }
        }
    }
    if !answered {
        return Ok(ReconcileOutcome::Unreachable);
    }

    let mut domain = domain.lock().await;
    let present: BTreeSet<u64> = domain.read_all()?.iter().map(|r| r.key()).collect();
    let missing: Vec<R> = merged
        .into_values()
        .filter(|r| !present.contains(&r.key()))
        .collect();
    if missing.is_empty() {
        return Ok(ReconcileOutcome::UpToDate);
    }
    domain.merge_missing(&missing)?;
    Ok(ReconcileOutcome::Merged {
        from,
        records: missing.len(),
    })
}
