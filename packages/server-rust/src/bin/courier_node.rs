//! `courier-node`: runs one relay node until interrupted.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use courier_server::{
    ClusterChange, ClusterModule, ClusterState, HttpDeliveryClient, Maintenance, MessageLog,
    NodeConfig, RelayService, ShutdownController,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "courier-node")]
#[command(about = "Peer-to-peer message relay node", long_about = None)]
struct Cli {
    /// Node UUID announced to peers (random when unset)
    #[arg(long, env = "COURIER_NODE_ID")]
    node_id: Option<String>,

    /// Bind address for the cluster listener
    #[arg(long, env = "COURIER_HOST")]
    host: Option<String>,

    /// Cluster listener port
    #[arg(long, env = "COURIER_PORT")]
    port: Option<u16>,

    /// Peers to dial at startup (comma-separated host:port)
    #[arg(long, env = "COURIER_SEEDS")]
    seeds: Option<String>,

    /// Message cache log file
    #[arg(long, env = "COURIER_MESSAGE_LOG")]
    message_log: Option<PathBuf>,

    /// Ownership log file
    #[arg(long, env = "COURIER_OWNER_LOG")]
    owner_log: Option<PathBuf>,

    /// Upper bound on resident message bytes
    #[arg(long, env = "COURIER_CACHE_LOAD_LIMIT")]
    cache_load_limit: Option<u64>,

    /// Idle time before a peer is probed, in milliseconds
    #[arg(long, env = "COURIER_HEARTBEAT_INTERVAL_MS")]
    heartbeat_interval_ms: Option<u64>,

    /// Time a probe may go unanswered, in milliseconds
    #[arg(long, env = "COURIER_HEARTBEAT_TIMEOUT_MS")]
    heartbeat_timeout_ms: Option<u64>,

    /// Read bound while a bid is outstanding, in milliseconds
    #[arg(long, env = "COURIER_BID_TIMEOUT_MS")]
    bid_timeout_ms: Option<u64>,

    /// Delivery loop period, in milliseconds
    #[arg(long, env = "COURIER_DELIVERY_INTERVAL_MS")]
    delivery_interval_ms: Option<u64>,

    /// Timeout of one HTTP delivery or status request, in seconds
    #[arg(long, env = "COURIER_HTTP_TIMEOUT_SECS", default_value_t = 30)]
    http_timeout_secs: u64,

    /// Serve Prometheus metrics on this port
    #[arg(long, env = "COURIER_METRICS_PORT")]
    metrics_port: Option<u16>,

    /// Emit logs as JSON lines
    #[arg(long, env = "COURIER_LOG_JSON")]
    log_json: bool,
}

impl Cli {
    /// Named properties for every flag that was given.
    fn properties(&self) -> HashMap<String, String> {
        let mut props = HashMap::new();
        let mut set = |name: &str, value: Option<String>| {
            if let Some(value) = value {
                props.insert(name.to_string(), value);
            }
        };
        set("UUID", self.node_id.clone());
        set("host", self.host.clone());
        set("ports.cluster", self.port.map(|p| p.to_string()));
        set("cluster.seeds", self.seeds.clone());
        set(
            "messageLog",
            self.message_log.as_ref().map(|p| p.display().to_string()),
        );
        set(
            "ownerFile",
            self.owner_log.as_ref().map(|p| p.display().to_string()),
        );
        set("cache.loadLimit", self.cache_load_limit.map(|v| v.to_string()));
        set(
            "heartBeatInterval",
            self.heartbeat_interval_ms.map(|v| v.to_string()),
        );
        set(
            "timeouts.heart_beat",
            self.heartbeat_timeout_ms.map(|v| v.to_string()),
        );
        set("timeouts.bid", self.bid_timeout_ms.map(|v| v.to_string()));
        set(
            "deliveryInterval",
            self.delivery_interval_ms.map(|v| v.to_string()),
        );
        props
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn log_changes(mut changes: mpsc::UnboundedReceiver<ClusterChange>) {
    while let Some(change) = changes.recv().await {
        match change {
            ClusterChange::LeaderElected { dead_node, leader } => {
                info!(%dead_node, %leader, "dead-node leader elected");
            }
            ClusterChange::MessagesRedistributed(redistribution) => {
                info!(
                    dead_node = %redistribution.dead_node,
                    messages = redistribution.assignments.len(),
                    "dead node's messages redistributed"
                );
            }
            other => debug!(change = ?other, "cluster change"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    if let Some(port) = cli.metrics_port {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to install Prometheus exporter")?;
        info!(%addr, "serving metrics");
    }

    let config = NodeConfig::from_properties(&cli.properties())?;
    info!(node = %config.node_id, "starting courier node");

    let store = Arc::new(MessageLog::open(&config.storage));
    store.recover().context("message store could not be recovered")?;

    let (cluster, changes) = ClusterState::new(
        config.node_id,
        config.cluster.clone(),
        config.connection.clone(),
        Arc::clone(&store),
    );
    let cluster = Arc::new(cluster);
    tokio::spawn(log_changes(changes));

    let shutdown = Arc::new(ShutdownController::new());
    let client = HttpDeliveryClient::new(Duration::from_secs(cli.http_timeout_secs))?;
    let relay = Arc::new(RelayService::new(
        Arc::clone(&cluster),
        Arc::new(client),
        Arc::clone(&shutdown),
    ));

    let mut module = ClusterModule::new(Arc::clone(&cluster), Arc::clone(&shutdown));
    let port = module.start().await?;
    info!(port, "cluster port open");
    let dialers = module.spawn_dialers();
    let mut maintenance = Maintenance::start(&relay, &config);
    let server = tokio::spawn(module.serve());

    tokio::signal::ctrl_c().await?;
    shutdown.trigger_shutdown();
    info!(status = ?relay.status(), "shutdown requested");

    for dialer in dialers {
        if let Err(e) = dialer.await {
            warn!(error = %e, "dialer task failed");
        }
    }
    server.await??;
    maintenance.stop().await;

    if shutdown.wait_for_drain(Duration::from_secs(30)).await {
        info!(status = ?relay.status(), "node stopped");
    } else {
        warn!(status = ?relay.status(), "stopped with deliveries still running");
    }
    Ok(())
}
