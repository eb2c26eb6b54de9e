use std::sync::Arc;

use clap::Parser;
use tokio::net::{TcpListener, UdpSocket};
use tracing_subscriber::EnvFilter;

use trackgate::commands::CommandCache;
use trackgate::config::GatewayConfig;
use trackgate::directory::DeviceDirectory;
use trackgate::geo::{identity_transform, NullCellLocator};
use trackgate::pipeline;
use trackgate::protocol::{GatewayContext, ProtocolRegistry};
use trackgate::queue::BoundedQueue;
use trackgate::server;
use trackgate::stats::{GatewayStats, StatsReporter};
use trackgate::storage::{MySqlStorage, Storage};
use trackgate::vendors::{Atr805Protocol, EworldProtocol};

#[tokio::main]
async fn main() -> trackgate::Result<()> {
    let config = GatewayConfig::parse();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_filter.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!(?config, "starting gateway");

    let storage: Arc<dyn Storage> =
        Arc::new(MySqlStorage::connect(&config.storage_url, config.storage_conns).await?);
    let stats = Arc::new(GatewayStats::new());
    let ctx = Arc::new(GatewayContext {
        directory: Arc::new(DeviceDirectory::new(storage.clone())),
        commands: Arc::new(CommandCache::new(storage.clone())),
        storage: storage.clone(),
        stats: stats.clone(),
        transform: identity_transform,
        cells: Arc::new(NullCellLocator),
    });

    // Registration order is claim priority.
    let mut registry = ProtocolRegistry::new();
    registry.register(Arc::new(EworldProtocol));
    registry.register(Arc::new(Atr805Protocol));
    let registry = Arc::new(registry);

    let persistence = Arc::new(BoundedQueue::new(config.persistence_queue));
    pipeline::spawn_persistence_pool(
        persistence.clone(),
        storage,
        stats.clone(),
        config.persistence_workers,
    );
    ctx.commands.clone().spawn_refresh(config.command_refresh());
    Arc::new(StatsReporter::new(stats)).spawn_report(config.report_interval());

    let listener = TcpListener::bind(&config.tcp_addr).await?;
    tracing::info!(addr = %config.tcp_addr, "tcp server listening");
    tokio::spawn(server::run_tcp_server(
        listener,
        registry.clone(),
        ctx.clone(),
        persistence.clone(),
        config.session(),
    ));

    if let Some(udp_addr) = &config.udp_addr {
        let socket = UdpSocket::bind(udp_addr).await?;
        tracing::info!(addr = %udp_addr, "udp server listening");
        tokio::spawn(server::run_udp_server(
            socket,
            registry,
            ctx,
            persistence,
            config.udp_workers,
            config.session_queue,
        ));
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    Ok(())
}
