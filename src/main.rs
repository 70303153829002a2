use anyhow::{Context, Result};
use std::sync::Arc;

use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

use order_replica::{
    catalog::HttpCatalog,
    config::{Cli, Command, Config},
    domain::{LogDomain, OrderLogEntry, RaftLogEntry},
    engine::OrderEngine,
    log_store::{LogFile, LogPaths},
    peer::{PeerSet, build_client},
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let cmd = cli.command.clone().unwrap_or(Command::Run);

    match cmd {
        Command::Run => run_server(cli.config).await,
        Command::Status => print_status(&cli.config),
    }
}

fn print_status(config: &Config) -> Result<()> {
    let paths = LogPaths::new(&config.data_dir, config.replica_id);
    let raft: LogDomain<RaftLogEntry> = LogDomain::open(LogFile::open(&paths.raft)?)
        .with_context(|| format!("open {}", paths.raft.display()))?;
    let orders: LogDomain<OrderLogEntry> = LogDomain::open(LogFile::open(&paths.orders)?)
        .with_context(|| format!("open {}", paths.orders.display()))?;

    let report = serde_json::json!({
        "replica_id": config.replica_id,
        "raft": raft.summary()?,
        "orders": orders.summary()?,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_server(config: Config) -> Result<()> {
    let table = config.peer_table()?;
    let client = build_client(config.rpc_timeout())?;
    let catalog = HttpCatalog::new(&config.catalog_url, client.clone())?;
    let peers = PeerSet::http(table, client);

    let engine = Arc::new(
        OrderEngine::open(&config.data_dir, peers, Arc::new(catalog), config.policy())
            .context("open replica logs")?,
    );

    let (raft, orders) = engine
        .reconcile(config.catch_up)
        .await
        .context("catch up from peers")?;
    info!(?raft, ?orders, "catch-up finished");

    let app = order_replica::http::build_router(engine).layer(TraceLayer::new_for_http());

    info!(
        bind = %config.bind,
        replica_id = config.replica_id,
        data_dir = %config.data_dir.display(),
        catalog = %config.catalog_url,
        version = order_replica::version::VERSION,
        "starting order-replica"
    );
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
