//! Facade pairing the message cache with the ownership map.

use courier_core::{Message, MessageId, NodeId};
use tracing::{info, warn};

use super::{MessageCache, MessageStore, OwnershipMap, RecoveryReport, StoreError};
use crate::config::StorageConfig;

/// Combined recovery outcome of both logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreRecovery {
    pub messages: RecoveryReport,
    pub owners: RecoveryReport,
}

/// The node's durable state: message bodies plus who owns each message.
///
/// The two logs are independent; neither operation here spans both
/// atomically, and recovery order does not matter.
#[derive(Debug)]
pub struct MessageLog {
    cache: MessageCache,
    owners: OwnershipMap,
}

impl MessageLog {
    #[must_use]
    pub fn new(cache: MessageCache, owners: OwnershipMap) -> Self {
        Self { cache, owners }
    }

    /// Opens both logs at the configured paths without reading them.
    #[must_use]
    pub fn open(config: &StorageConfig) -> Self {
        Self::new(
            MessageCache::new(&config.message_log, config.cache_load_limit),
            OwnershipMap::new(&config.owner_log),
        )
    }

    #[must_use]
    pub fn cache(&self) -> &MessageCache {
        &self.cache
    }

    #[must_use]
    pub fn owners(&self) -> &OwnershipMap {
        &self.owners
    }

    /// Caches a newly accepted message and records its first owner. A body
    /// whose owner cannot be written is dropped again, so no message is
    /// left without an owner.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Capacity`] for an oversized body, or
    /// [`StoreError::Io`] if either log append fails.
    pub fn add_message(&self, message: Message, owner: NodeId) -> Result<(), StoreError> {
        let id = message.id;
        self.cache.add(message)?;
        if let Err(e) = self.owners.put(id, owner) {
            warn!(message = %id, error = %e, "owner write failed, dropping message");
            self.cache.remove(id);
            return Err(e);
        }
        Ok(())
    }

    /// Replays both logs.
    ///
    /// # Errors
    ///
    /// Returns the first fatal [`StoreError`] of either log.
    pub fn recover(&self) -> Result<StoreRecovery, StoreError> {
        let recovery = StoreRecovery {
            messages: self.cache.recover()?,
            owners: self.owners.recover()?,
        };
        info!(
            messages = recovery.messages.applied,
            skipped_messages = recovery.messages.skipped,
            owners = recovery.owners.applied,
            skipped_owners = recovery.owners.skipped,
            "recovered message store"
        );
        Ok(recovery)
    }

    /// Compacts both logs.
    ///
    /// # Errors
    ///
    /// Returns the first [`StoreError`] of either compaction.
    pub fn compact(&self) -> Result<(), StoreError> {
        self.cache.compact()?;
        self.owners.compact()?;
        Ok(())
    }
}

impl MessageStore for MessageLog {
    fn record_message(&self, message: Message) -> Result<(), StoreError> {
        if self.cache.contains(message.id) {
            return Ok(());
        }
        self.cache.add(message)
    }

    fn message(&self, id: MessageId) -> Result<Option<Message>, StoreError> {
        self.cache.get(id)
    }

    fn contains_message(&self, id: MessageId) -> bool {
        self.cache.contains(id)
    }

    fn all_messages(&self) -> Result<Vec<Message>, StoreError> {
        self.cache.copy_all_messages()
    }

    fn forget(&self, id: MessageId) {
        self.cache.remove(id);
        self.owners.remove(id);
    }

    fn set_owner(&self, id: MessageId, owner: NodeId) -> Result<(), StoreError> {
        self.owners.put(id, owner)
    }

    fn owner_of(&self, id: MessageId) -> Option<NodeId> {
        self.owners.get(id)
    }

    fn messages_owned_by(&self, owner: NodeId) -> Vec<MessageId> {
        self.owners.owned_by(owner)
    }

    fn ownership(&self) -> Vec<(MessageId, NodeId)> {
        self.owners.entries()
    }

    fn message_count(&self) -> usize {
        self.cache.len()
    }
}
