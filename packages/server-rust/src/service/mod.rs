//! Relay operations and node maintenance.
//!
//! 1. **Relay** (`relay`): submission, delivery, and cluster queries
//! 2. **Delivery client** (`delivery`): HTTP side of delivery and status notices
//! 3. **Background workers** (`worker`): generic periodic task runner
//! 4. **Maintenance** (`maintenance`): compaction, delivery loop, orphan scan

pub mod delivery;
pub mod maintenance;
pub mod relay;
pub mod worker;

pub use delivery::HttpDeliveryClient;
pub use maintenance::{CompactionRunnable, DeliveryRunnable, Maintenance, OrphanScanRunnable};
pub use relay::{DeliveryReport, NodeStatus, RelayError, RelayService};
pub use worker::{BackgroundRunnable, BackgroundWorker};
