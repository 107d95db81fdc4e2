//! Courier core: the relayed `Message` value and the cluster wire grammar.
//!
//! Nothing in this crate performs I/O. The server crate layers durable
//! storage and the peer protocol on top of these types.

pub mod error;
pub mod message;
pub mod wire;

pub use error::WireError;
pub use message::{Message, MessageId, NodeId};
pub use wire::WireMessage;
