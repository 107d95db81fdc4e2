//! Periodic node maintenance: log compaction, the delivery loop, and the
//! orphan scan, each on its own [`BackgroundWorker`].

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info};

use super::relay::RelayService;
use super::worker::{BackgroundRunnable, BackgroundWorker};
use crate::cluster::state::ClusterState;
use crate::config::NodeConfig;
use crate::storage::MessageLog;

// ---------------------------------------------------------------------------
// Compaction
// ---------------------------------------------------------------------------

/// Rewrites both logs without forgotten messages. Runs once more on stop.
pub struct CompactionRunnable {
    store: Arc<MessageLog>,
}

impl CompactionRunnable {
    #[must_use]
    pub fn new(store: Arc<MessageLog>) -> Self {
        Self { store }
    }

    async fn compact(&self) {
        let store = Arc::clone(&self.store);
        match tokio::task::spawn_blocking(move || store.compact()).await {
            Ok(Ok(())) => debug!("compacted message store"),
            Ok(Err(e)) => error!(error = %e, "compaction failed"),
            Err(e) => error!(error = %e, "compaction task panicked"),
        }
    }
}

#[async_trait]
impl BackgroundRunnable for CompactionRunnable {
    type Task = ();

    async fn run(&mut self, _task: ()) {
        self.compact().await;
    }

    async fn on_tick(&mut self) {
        self.compact().await;
    }

    async fn shutdown(&mut self) {
        self.compact().await;
    }
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

pub struct DeliveryRunnable {
    relay: Arc<RelayService>,
}

impl DeliveryRunnable {
    #[must_use]
    pub fn new(relay: Arc<RelayService>) -> Self {
        Self { relay }
    }

    async fn deliver(&self) {
        let report = self.relay.deliver_owned().await;
        if report.delivered + report.failed > 0 {
            debug!(delivered = report.delivered, failed = report.failed, "delivery pass");
        }
    }
}

#[async_trait]
impl BackgroundRunnable for DeliveryRunnable {
    type Task = ();

    async fn run(&mut self, _task: ()) {
        self.deliver().await;
    }

    async fn on_tick(&mut self) {
        self.deliver().await;
    }
}

// ---------------------------------------------------------------------------
// Orphan scan
// ---------------------------------------------------------------------------

pub struct OrphanScanRunnable {
    cluster: Arc<ClusterState>,
}

impl OrphanScanRunnable {
    #[must_use]
    pub fn new(cluster: Arc<ClusterState>) -> Self {
        Self { cluster }
    }

    async fn scan(&self) {
        let settled = self.cluster.auction_orphans().await;
        if !settled.is_empty() {
            info!(messages = settled.len(), "orphan scan reassigned messages");
        }
    }
}

#[async_trait]
impl BackgroundRunnable for OrphanScanRunnable {
    type Task = ();

    async fn run(&mut self, _task: ()) {
        self.scan().await;
    }

    async fn on_tick(&mut self) {
        self.scan().await;
    }
}

// ---------------------------------------------------------------------------
// Maintenance
// ---------------------------------------------------------------------------

/// The three maintenance workers of a running node.
pub struct Maintenance {
    pub compaction: BackgroundWorker<CompactionRunnable>,
    pub delivery: BackgroundWorker<DeliveryRunnable>,
    pub orphans: BackgroundWorker<OrphanScanRunnable>,
}

impl Maintenance {
    #[must_use]
    pub fn start(relay: &Arc<RelayService>, config: &NodeConfig) -> Self {
        let cluster = Arc::clone(relay.cluster());
        Self {
            compaction: BackgroundWorker::start(
                CompactionRunnable::new(Arc::clone(cluster.store())),
                config.storage.compaction_interval,
            ),
            delivery: BackgroundWorker::start(
                DeliveryRunnable::new(Arc::clone(relay)),
                config.delivery_interval,
            ),
            orphans: BackgroundWorker::start(
                OrphanScanRunnable::new(cluster),
                config.cluster.orphan_scan_interval,
            ),
        }
    }

    /// Stops delivery and the orphan scan first so the final compaction
    /// sees their last changes.
    pub async fn stop(&mut self) {
        self.delivery.stop().await;
        self.orphans.stop().await;
        self.compaction.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use courier_core::Message;
    use tempfile::TempDir;
    use uuid::Uuid;

    use super::*;
    use crate::config::{ClusterConfig, ConnectionConfig, StorageConfig};
    use crate::storage::MessageStore;

    fn cluster_in(dir: &TempDir) -> Arc<ClusterState> {
        let store = Arc::new(MessageLog::open(&StorageConfig {
            message_log: dir.path().join("messages.log"),
            owner_log: dir.path().join("owners.log"),
            ..StorageConfig::default()
        }));
        let (cluster, _changes) = ClusterState::new(
            Uuid::new_v4(),
            ClusterConfig::default(),
            ConnectionConfig::default(),
            store,
        );
        Arc::new(cluster)
    }

    #[tokio::test]
    async fn compaction_on_stop_drops_forgotten_messages() {
        let dir = TempDir::new().unwrap();
        let cluster = cluster_in(&dir);
        let store = Arc::clone(cluster.store());
        let kept = Message::new("", "http://d", vec![1; 32]);
        let gone = Message::new("", "http://d", vec![2; 32]);
        store.add_message(kept.clone(), cluster.local()).unwrap();
        store.add_message(gone.clone(), cluster.local()).unwrap();
        store.forget(gone.id);
        let before = std::fs::metadata(dir.path().join("messages.log")).unwrap().len();

        let mut worker = BackgroundWorker::start(
            CompactionRunnable::new(Arc::clone(&store)),
            Duration::from_secs(60),
        );
        worker.stop().await;

        let after = std::fs::metadata(dir.path().join("messages.log")).unwrap().len();
        assert!(after < before);
        assert!(store.message(kept.id).unwrap().is_some());
    }

    #[tokio::test]
    async fn orphan_scan_without_peers_takes_ownership() {
        let dir = TempDir::new().unwrap();
        let cluster = cluster_in(&dir);
        let gone = Uuid::new_v4();
        let orphan = Message::new("", "http://d", b"o".to_vec());
        cluster.store().add_message(orphan.clone(), gone).unwrap();

        let mut worker = BackgroundWorker::start(
            OrphanScanRunnable::new(Arc::clone(&cluster)),
            Duration::from_secs(60),
        );
        worker.submit(()).await.unwrap();
        worker.stop().await;

        assert_eq!(cluster.store().owner_of(orphan.id), Some(cluster.local()));
    }
}
