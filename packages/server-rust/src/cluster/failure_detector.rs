//! Per-connection heartbeat failure detector.
//!
//! Each connection owns one [`HeartbeatState`]. The transport records every
//! inbound line as activity; a recurring timer asks
//! [`HeartbeatState::begin_probe_if_idle`] whether the peer has been quiet for
//! a full interval, and if so sends `HEART BEAT START` and checks
//! [`HeartbeatState::probe_met`] once the heartbeat timeout has elapsed.

use std::time::Duration;

use tokio::time::Instant;

/// Verdict after a probe's timeout elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeVerdict {
    Alive,
    Dead,
}

#[derive(Debug, Clone)]
pub struct HeartbeatState {
    last_activity: Instant,
    /// When the outstanding `HEART BEAT START` was sent.
    probe_sent: Option<Instant>,
    /// The outstanding probe was answered.
    met: bool,
}

impl HeartbeatState {
    #[must_use]
    pub fn new(now: Instant) -> Self {
        Self {
            last_activity: now,
            probe_sent: None,
            met: false,
        }
    }

    /// Any inbound line counts as activity.
    pub fn record_activity(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// A `HEART BEAT` answered our probe.
    pub fn record_reply(&mut self, now: Instant) {
        self.last_activity = now;
        if self.probe_sent.is_some() {
            self.met = true;
        }
    }

    #[must_use]
    pub fn idle(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    #[must_use]
    pub fn awaiting_reply(&self) -> bool {
        self.probe_sent.is_some() && !self.met
    }

    /// Starts a probe when the peer has been silent for at least `interval`.
    /// Returns `true` when the caller must send `HEART BEAT START`.
    pub fn begin_probe_if_idle(&mut self, now: Instant, interval: Duration) -> bool {
        if self.probe_sent.is_some() || self.idle(now) < interval {
            return false;
        }
        self.begin_probe(now);
        true
    }

    /// Starts a probe unconditionally, e.g. after another node claimed this
    /// peer is dead.
    pub fn begin_probe(&mut self, now: Instant) {
        self.probe_sent = Some(now);
        self.met = false;
    }

    /// Closes the outstanding probe once its timeout elapsed.
    pub fn probe_met(&mut self) -> ProbeVerdict {
        let answered = self.met || self.probe_sent.is_none();
        self.probe_sent = None;
        self.met = false;
        if answered {
            ProbeVerdict::Alive
        } else {
            ProbeVerdict::Dead
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
