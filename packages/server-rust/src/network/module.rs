//! Cluster listener and seed dialers with deferred startup.
//!
//! `new()` wires the module to the shared cluster state, `start()` binds the
//! TCP listener, and `serve()` accepts peers until shutdown. Seed dialers run
//! beside the accept loop and keep retrying unreachable seeds.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use courier_core::NodeId;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::connection::Direction;
use super::shutdown::ShutdownController;
use super::transport::spawn_peer;
use crate::cluster::state::ClusterState;
use crate::storage::MessageStore;

/// Owns the cluster listener.
///
/// 1. `new()` -- shares the cluster state and shutdown controller
/// 2. `start()` -- binds the listener to the configured host and port
/// 3. `serve()` -- accepts peers until shutdown is signalled
pub struct ClusterModule {
    cluster: Arc<ClusterState>,
    shutdown: Arc<ShutdownController>,
    listener: Option<TcpListener>,
    /// Set while this node still has to ask a peer for everything it knows.
    catch_up: Arc<AtomicBool>,
}

impl ClusterModule {
    /// Creates the module without binding any port. A node whose store is
    /// empty asks the first seed it reaches for a catch-up.
    #[must_use]
    pub fn new(cluster: Arc<ClusterState>, shutdown: Arc<ShutdownController>) -> Self {
        let store = cluster.store();
        let empty = store.message_count() == 0 && store.ownership().is_empty();
        Self {
            cluster,
            shutdown,
            listener: None,
            catch_up: Arc::new(AtomicBool::new(empty)),
        }
    }

    #[must_use]
    pub fn cluster(&self) -> Arc<ClusterState> {
        Arc::clone(&self.cluster)
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Binds the listener and returns the bound port, which differs from
    /// the configured one when that is 0.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let config = self.cluster.config();
        let addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();

        info!("cluster listener bound to {}:{}", config.host, port);

        self.listener = Some(listener);
        Ok(port)
    }

    /// Starts one reconnecting dialer per configured seed.
    #[must_use]
    pub fn spawn_dialers(&self) -> Vec<JoinHandle<()>> {
        self.cluster
            .config()
            .seeds
            .iter()
            .map(|seed| {
                tokio::spawn(dial_seed(
                    seed.clone(),
                    Arc::clone(&self.cluster),
                    Arc::clone(&self.catch_up),
                    self.shutdown.shutdown_receiver(),
                ))
            })
            .collect()
    }

    /// Accepts peers until shutdown, then closes every connection.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called first.
    pub async fn serve(self) -> anyhow::Result<()> {
        let listener = self
            .listener
            .ok_or_else(|| anyhow::anyhow!("start() must be called before serve()"))?;
        let mut shutdown_rx = self.shutdown.shutdown_receiver();
        self.shutdown.mark_serving();

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(error = %e, "failed to set TCP_NODELAY");
                        }
                        spawn_peer(stream, peer.to_string(), Direction::Inbound, Arc::clone(&self.cluster));
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
            }
        }

        let open = self.cluster.registry().count();
        info!(connections = open, "closing peer connections");
        self.cluster.shutdown();
        Ok(())
    }
}

/// Keeps a connection to `seed` open, retrying every reconnect interval
/// while it is down.
async fn dial_seed(
    seed: String,
    cluster: Arc<ClusterState>,
    catch_up: Arc<AtomicBool>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let retry = cluster.config().reconnect_interval;
    let connect_timeout = cluster.connection_config().send_timeout;

    // node last reached through this seed; an inbound connection from it
    // counts as connected, so crossed dials are not retried
    let mut seed_node: Option<NodeId> = None;

    while !*shutdown_rx.borrow() {
        let registry = cluster.registry();
        let dialed = registry
            .connections()
            .into_iter()
            .find(|h| h.direction == Direction::Outbound && h.address == seed);
        if let Some(node) = dialed.as_ref().and_then(|h| h.partner()) {
            seed_node = Some(node);
        }
        let connected =
            dialed.is_some() || seed_node.is_some_and(|node| registry.find(node).is_some());

        if !connected {
            match tokio::time::timeout(connect_timeout, TcpStream::connect(&seed)).await {
                Ok(Ok(stream)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(error = %e, "failed to set TCP_NODELAY");
                    }
                    info!(seed = %seed, "connected to seed");
                    let handle =
                        spawn_peer(stream, seed.clone(), Direction::Outbound, Arc::clone(&cluster));
                    let wants_catch_up = catch_up.swap(false, Ordering::AcqRel);
                    cluster.open_session(&handle, wants_catch_up).await;
                }
                Ok(Err(e)) => debug!(seed = %seed, error = %e, "seed unreachable"),
                Err(_) => debug!(seed = %seed, "seed connect timed out"),
            }
        }

        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            () = tokio::time::sleep(retry) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;
    use uuid::Uuid;

    use super::*;
    use crate::cluster::types::ConnectionState;
    use crate::config::{ClusterConfig, ConnectionConfig, StorageConfig};
    use crate::storage::MessageLog;

    fn cluster_in(dir: &TempDir, seeds: Vec<String>) -> Arc<ClusterState> {
        let store = Arc::new(MessageLog::open(&StorageConfig {
            message_log: dir.path().join("messages.log"),
            owner_log: dir.path().join("owners.log"),
            ..StorageConfig::default()
        }));
        let config = ClusterConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            seeds,
            reconnect_interval: Duration::from_millis(50),
            ..ClusterConfig::default()
        };
        let (state, _changes) =
            ClusterState::new(Uuid::new_v4(), config, ConnectionConfig::default(), store);
        Arc::new(state)
    }

    #[tokio::test]
    async fn start_binds_to_os_assigned_port() {
        let dir = TempDir::new().unwrap();
        let mut module = ClusterModule::new(cluster_in(&dir, Vec::new()), Arc::default());
        let port = module.start().await.expect("start should succeed");
        assert!(port > 0);
        assert!(module.listener.is_some());
    }

    #[tokio::test]
    async fn serve_without_start_is_an_error() {
        let dir = TempDir::new().unwrap();
        let module = ClusterModule::new(cluster_in(&dir, Vec::new()), Arc::default());
        assert!(module.serve().await.is_err());
    }

    #[tokio::test]
    async fn empty_store_requests_catch_up() {
        let dir = TempDir::new().unwrap();
        let module = ClusterModule::new(cluster_in(&dir, Vec::new()), Arc::default());
        assert!(module.catch_up.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn seed_dialer_joins_a_listening_node() {
        let (dir_a, dir_b) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let listener_cluster = cluster_in(&dir_a, Vec::new());
        let shutdown_a = Arc::new(ShutdownController::new());
        let mut listening = ClusterModule::new(Arc::clone(&listener_cluster), Arc::clone(&shutdown_a));
        let port = listening.start().await.unwrap();
        let serving = tokio::spawn(listening.serve());

        let dialer_cluster = cluster_in(&dir_b, vec![format!("127.0.0.1:{port}")]);
        let shutdown_b = Arc::new(ShutdownController::new());
        let dialing = ClusterModule::new(Arc::clone(&dialer_cluster), Arc::clone(&shutdown_b));
        let dialers = dialing.spawn_dialers();
        assert_eq!(dialers.len(), 1);

        let mut joined = false;
        for _ in 0..500 {
            let nodes = listener_cluster.registry().identified_nodes();
            let state = dialer_cluster
                .registry()
                .connections()
                .first()
                .map(|h| h.state());
            if nodes == vec![dialer_cluster.local()] && state == Some(ConnectionState::General) {
                joined = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(joined, "dialer never established a session");
        // the fresh dialer used its one catch-up on this seed
        assert!(!dialing.catch_up.load(Ordering::Acquire));

        shutdown_b.trigger_shutdown();
        for dialer in dialers {
            dialer.await.unwrap();
        }
        shutdown_a.trigger_shutdown();
        serving.await.unwrap().unwrap();
        assert_eq!(listener_cluster.registry().count(), 0);
    }
}
