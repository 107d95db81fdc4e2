//! Node lifecycle and graceful shutdown.
//!
//! The phase lives in an `ArcSwap` so the status surface reads it without
//! locking. A watch channel tells the listener, the dialers and the
//! maintenance tasks to stop. Delivery attempts hold an [`InFlightGuard`];
//! the last guard to drop wakes whoever waits for the drain, so shutdown
//! never cuts an HTTP POST off halfway.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tracing::debug;

/// Where the node is in its life: `Starting -> Serving -> Draining -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodePhase {
    /// Store recovery and listener setup.
    Starting,
    /// Accepting peers and delivering owned messages.
    Serving,
    /// No new deliveries start; running ones finish.
    Draining,
    Stopped,
}

#[derive(Debug, Default)]
struct InFlight {
    count: AtomicU64,
    idle: Notify,
}

#[derive(Debug)]
pub struct ShutdownController {
    stop: watch::Sender<bool>,
    phase: ArcSwap<NodePhase>,
    in_flight: Arc<InFlight>,
}

impl ShutdownController {
    #[must_use]
    pub fn new() -> Self {
        let (stop, _rx) = watch::channel(false);
        Self {
            stop,
            phase: ArcSwap::from_pointee(NodePhase::Starting),
            in_flight: Arc::new(InFlight::default()),
        }
    }

    #[must_use]
    pub fn phase(&self) -> NodePhase {
        **self.phase.load()
    }

    /// The listener is accepting peers. Ignored once shutdown has begun.
    pub fn mark_serving(&self) {
        self.phase.rcu(|phase| match **phase {
            NodePhase::Starting => Arc::new(NodePhase::Serving),
            _ => Arc::clone(phase),
        });
    }

    /// Receiver that flips to `true` once shutdown is triggered.
    #[must_use]
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }

    /// Enters `Draining` and signals every receiver.
    pub fn trigger_shutdown(&self) {
        self.phase.store(Arc::new(NodePhase::Draining));
        let _ = self.stop.send(true);
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.stop.borrow()
    }

    /// Counts one delivery attempt until the guard drops.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.count.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.count.load(Ordering::Acquire)
    }

    /// Waits up to `timeout` for every running delivery to finish. Returns
    /// `true` and enters `Stopped` once none is left; on timeout the phase
    /// stays `Draining`.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let drained = tokio::time::timeout(timeout, async {
            loop {
                let idle = self.in_flight.idle.notified();
                tokio::pin!(idle);
                idle.as_mut().enable();
                if self.in_flight_count() == 0 {
                    return;
                }
                idle.await;
            }
        })
        .await
        .is_ok();

        if drained {
            self.phase.store(Arc::new(NodePhase::Stopped));
        } else {
            debug!(in_flight = self.in_flight_count(), "drain timed out");
        }
        drained
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Held for the duration of one delivery attempt; released on drop,
/// panics included.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<InFlight>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.in_flight.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.in_flight.idle.notify_waiters();
        }
    }
}
