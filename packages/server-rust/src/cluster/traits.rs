//! Collaborator traits at the edges of the cluster protocol.

use async_trait::async_trait;
use courier_core::Message;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

// ---------------------------------------------------------------------------
// BidSource
// ---------------------------------------------------------------------------

/// Supplies bid values for auctions.
///
/// Each connection owns one, so tests can script tie sequences.
pub trait BidSource: Send {
    fn next_bid(&mut self) -> i32;
}

/// Uniformly random 32-bit bids.
#[derive(Debug)]
pub struct RandomBids {
    rng: StdRng,
}

impl RandomBids {
    #[must_use]
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_os_rng(),
        }
    }
}

impl Default for RandomBids {
    fn default() -> Self {
        Self::new()
    }
}

impl BidSource for RandomBids {
    fn next_bid(&mut self) -> i32 {
        self.rng.random()
    }
}

// ---------------------------------------------------------------------------
// DeliveryClient
// ---------------------------------------------------------------------------

/// Lifecycle event reported to a message's status URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusEvent {
    Created,
    Delivered,
}

/// HTTP side of the relay: delivering contents and notifying the submitter.
#[async_trait]
pub trait DeliveryClient: Send + Sync {
    /// POSTs the contents to the message's delivery URL and returns the
    /// HTTP status code.
    ///
    /// # Errors
    ///
    /// Returns an error when no response was received at all.
    async fn deliver(&self, message: &Message) -> anyhow::Result<u16>;

    /// Tells the message's status URL about a lifecycle event.
    ///
    /// # Errors
    ///
    /// Returns an error when the notification could not be sent.
    async fn notify(&self, message: &Message, event: StatusEvent) -> anyhow::Result<u16>;
}
