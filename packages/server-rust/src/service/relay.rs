//! Relay operations exposed to the outer layers: submitting messages,
//! delivering owned ones, and read-only cluster queries.

use std::sync::Arc;

use courier_core::{Message, MessageId, NodeId, WireMessage};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cluster::state::ClusterState;
use crate::cluster::traits::{DeliveryClient, StatusEvent};
use crate::cluster::types::ClusterHealth;
use crate::network::shutdown::{NodePhase, ShutdownController};
use crate::storage::{MessageLog, MessageStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("message {id} is owned by {owner:?}")]
    NotOwner { id: MessageId, owner: Option<NodeId> },
    #[error("message {0} is not stored on this node")]
    UnknownMessage(MessageId),
    #[error("delivery of message {id} failed: {source}")]
    Delivery {
        id: MessageId,
        #[source]
        source: anyhow::Error,
    },
}

/// Result of one pass over the messages this node owns.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Snapshot for the status layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub phase: NodePhase,
    pub in_flight_deliveries: u64,
    pub cluster: ClusterHealth,
}

pub struct RelayService {
    cluster: Arc<ClusterState>,
    client: Arc<dyn DeliveryClient>,
    shutdown: Arc<ShutdownController>,
    /// Last HTTP status per message still awaiting delivery.
    last_status: DashMap<MessageId, u16>,
}

impl RelayService {
    #[must_use]
    pub fn new(
        cluster: Arc<ClusterState>,
        client: Arc<dyn DeliveryClient>,
        shutdown: Arc<ShutdownController>,
    ) -> Self {
        Self {
            cluster,
            client,
            shutdown,
            last_status: DashMap::new(),
        }
    }

    #[must_use]
    pub fn cluster(&self) -> &Arc<ClusterState> {
        &self.cluster
    }

    fn store(&self) -> &MessageLog {
        self.cluster.store()
    }

    /// Accepts a new message: stores it owned by this node, replicates the
    /// creation to every identified peer and tells the status URL.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Store`] when the message cannot be stored, e.g.
    /// it is larger than the cache load limit.
    pub async fn submit_message(
        &self,
        status_url: &str,
        delivery_url: &str,
        contents: Vec<u8>,
    ) -> Result<MessageId, RelayError> {
        let message = Message::new(status_url, delivery_url, contents);
        let id = message.id;
        self.store().add_message(message.clone(), self.cluster.local())?;
        metrics::counter!("courier_messages_submitted_total").increment(1);
        record_cache_load(self.store());

        let peers = self
            .cluster
            .broadcast(&WireMessage::MessageCreated(message.clone()));
        info!(message = %id, size = message.size(), peers, "message submitted");

        self.notify(&message, StatusEvent::Created).await;
        Ok(id)
    }

    /// Tries to deliver one message this node owns. Returns the HTTP status;
    /// a 2xx status means the message was delivered and is now forgotten
    /// cluster-wide.
    ///
    /// # Errors
    ///
    /// - [`RelayError::NotOwner`] if another node (or nobody) owns it.
    /// - [`RelayError::UnknownMessage`] if the body is not stored here.
    /// - [`RelayError::Delivery`] if no response was received.
    pub async fn deliver_once(&self, id: MessageId) -> Result<u16, RelayError> {
        let owner = self.store().owner_of(id);
        if owner != Some(self.cluster.local()) {
            return Err(RelayError::NotOwner { id, owner });
        }
        let message = self
            .store()
            .message(id)?
            .ok_or(RelayError::UnknownMessage(id))?;

        let _guard = self.shutdown.in_flight_guard();
        let status = match self.client.deliver(&message).await {
            Ok(status) => status,
            Err(source) => {
                metrics::counter!("courier_delivery_failures_total").increment(1);
                warn!(message = %id, error = %source, "delivery attempt failed");
                return Err(RelayError::Delivery { id, source });
            }
        };

        if (200..300).contains(&status) {
            self.store().forget(id);
            self.last_status.remove(&id);
            record_cache_load(self.store());
            metrics::counter!("courier_messages_delivered_total").increment(1);
            let peers = self.cluster.broadcast(&WireMessage::MessageDelivered(id));
            info!(message = %id, status, peers, "message delivered");
            self.notify(&message, StatusEvent::Delivered).await;
        } else {
            self.last_status.insert(id, status);
            metrics::counter!("courier_delivery_failures_total").increment(1);
            debug!(message = %id, status, "delivery rejected, will retry");
        }
        Ok(status)
    }

    /// One delivery attempt for every message this node owns.
    pub async fn deliver_owned(&self) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        for id in self.store().messages_owned_by(self.cluster.local()) {
            if self.shutdown.is_shutting_down() {
                break;
            }
            match self.deliver_once(id).await {
                Ok(status) if (200..300).contains(&status) => report.delivered += 1,
                Ok(_) => report.failed += 1,
                // ownership can move while the pass runs
                Err(RelayError::NotOwner { .. }) => {}
                Err(e) => {
                    debug!(message = %id, error = %e, "delivery pass skipped message");
                    report.failed += 1;
                }
            }
        }
        report
    }

    #[must_use]
    pub fn owner_of(&self, id: MessageId) -> Option<NodeId> {
        self.store().owner_of(id)
    }

    /// Nodes in the cluster as seen from here, this node included.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.cluster.registry().identified_nodes().len() + 1
    }

    #[must_use]
    pub fn message_count(&self) -> usize {
        self.store().message_count()
    }

    #[must_use]
    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            node_id: self.cluster.local(),
            phase: self.shutdown.phase(),
            in_flight_deliveries: self.shutdown.in_flight_count(),
            cluster: self.cluster.health(),
        }
    }

    /// HTTP status of the last failed attempt, if any.
    #[must_use]
    pub fn last_status(&self, id: MessageId) -> Option<u16> {
        self.last_status.get(&id).map(|status| *status)
    }

    async fn notify(&self, message: &Message, event: StatusEvent) {
        if message.status_url.is_empty() {
            return;
        }
        if let Err(e) = self.client.notify(message, event).await {
            warn!(message = %message.id, ?event, error = %e, "status notification failed");
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn record_cache_load(store: &MessageLog) {
    metrics::gauge!("courier_cache_load_bytes").set(store.cache().current_load() as f64);
}
