//! Peer transport, connection management, the cluster listener, and
//! shutdown control.

pub mod connection;
pub mod module;
pub mod shutdown;
pub mod transport;

pub use connection::*;
pub use module::ClusterModule;
pub use shutdown::*;
pub use transport::spawn_peer;
