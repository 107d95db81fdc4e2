//! Courier node: a peer-to-peer message relay.
//!
//! Nodes keep every accepted message in a durable hybrid cache, agree on a
//! single owner per message, and redistribute a dead node's messages through
//! a seeded election so that the cluster survives the loss of any one node.

pub mod cluster;
pub mod config;
pub mod network;
pub mod service;
pub mod storage;

pub use cluster::{ClusterChange, ClusterState};
pub use config::{ConfigError, NodeConfig, PropertySource};
pub use network::{ClusterModule, ShutdownController};
pub use service::{HttpDeliveryClient, Maintenance, RelayError, RelayService};
pub use storage::{MessageLog, MessageStore, StoreError};
