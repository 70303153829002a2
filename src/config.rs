use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::{
    anti_entropy::CatchUpStrategy,
    cluster::{PeerTable, ReplicaId, ReplicaNode},
    counter::FollowerCounterRule,
    engine::{EnginePolicy, QuorumPolicy},
};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "order-replica",
    about = "Replicated order service node",
    version = crate::version::VERSION,
    disable_help_subcommand = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub config: Config,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Catch up from peers, then serve HTTP (default).
    Run,

    /// Print a JSON summary of the local logs and exit.
    Status,
}

fn default_peers() -> Vec<ReplicaNode> {
    vec![
        ReplicaNode::new(1, "localhost", 12502),
        ReplicaNode::new(2, "localhost", 12504),
        ReplicaNode::new(3, "localhost", 12505),
    ]
}

#[derive(Args, Debug, Clone)]
pub struct Config {
    #[arg(
        long,
        global = true,
        env = "ORDER_BIND",
        value_name = "ADDR",
        default_value = "127.0.0.1:12502"
    )]
    pub bind: SocketAddr,

    #[arg(
        long = "replica-id",
        global = true,
        env = "REPLICA_ID",
        value_name = "ID",
        default_value_t = 1
    )]
    pub replica_id: ReplicaId,

    #[arg(
        long = "data-dir",
        global = true,
        env = "ORDER_DATA_DIR",
        value_name = "DIR",
        default_value = "./data"
    )]
    pub data_dir: PathBuf,

    #[arg(
        long = "catalog-url",
        global = true,
        env = "CATALOG_URL",
        value_name = "URL",
        default_value = "http://127.0.0.1:12501"
    )]
    pub catalog_url: String,

    /// Cluster member as ID=HOST:PORT. Repeat the flag or separate entries with commas.
    #[arg(
        long = "peer",
        global = true,
        env = "ORDER_PEERS",
        value_name = "ID=HOST:PORT",
        value_delimiter = ',',
        default_values_t = default_peers()
    )]
    pub peers: Vec<ReplicaNode>,

    #[arg(
        long = "rpc-timeout-ms",
        global = true,
        env = "ORDER_RPC_TIMEOUT_MS",
        value_name = "MS",
        default_value_t = 3000,
        value_parser = clap::value_parser!(u64).range(100..=60000)
    )]
    pub rpc_timeout_ms: u64,

    #[arg(
        long,
        global = true,
        env = "ORDER_QUORUM",
        value_name = "POLICY",
        default_value = "at-least-one",
        value_enum
    )]
    pub quorum: QuorumPolicy,

    #[arg(
        long = "catch-up",
        global = true,
        env = "ORDER_CATCH_UP",
        value_name = "STRATEGY",
        default_value = "first-responder",
        value_enum
    )]
    pub catch_up: CatchUpStrategy,

    #[arg(
        long = "follower-counter",
        global = true,
        env = "ORDER_FOLLOWER_COUNTER",
        value_name = "RULE",
        default_value = "overwrite",
        value_enum
    )]
    pub follower_counter: FollowerCounterRule,
}

impl Config {
    pub fn peer_table(&self) -> anyhow::Result<PeerTable> {
        PeerTable::new(self.replica_id, self.peers.clone())
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn policy(&self) -> EnginePolicy {
        EnginePolicy {
            quorum: self.quorum,
            follower_counter: self.follower_counter,
        }
    }
}
