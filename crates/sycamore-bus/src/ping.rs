//! Liveness supervision.
//!
//! A periodic task probes the remote endpoint: a discovery request while no
//! routing table is installed, a ping otherwise. Each tick that finds the
//! previous probe still unanswered counts as a miss. Too many consecutive
//! misses declare the remote lost, which tears down the routing table and
//! every device.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::bus::BusShared;
use crate::drt::DiscoveryRequest;

/// Whether the supervisor acts on its ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingState {
    Active,
    Suspended,
}

/// What a tick puts on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    Discovery(DiscoveryRequest),
    Ping,
}

/// Liveness bookkeeping shared by the supervisor and the dispatch path.
#[derive(Debug)]
pub struct Liveness {
    state: PingState,
    found: bool,
    awaiting: bool,
    missed: u32,
    max_missed: u32,
}

impl Liveness {
    pub fn new(enabled: bool, max_missed: u32) -> Self {
        Self {
            state: if enabled {
                PingState::Active
            } else {
                PingState::Suspended
            },
            found: false,
            awaiting: false,
            missed: 0,
            max_missed,
        }
    }

    pub fn state(&self) -> PingState {
        self.state
    }

    /// The remote answered at least once since it was last lost.
    pub fn is_found(&self) -> bool {
        self.found
    }

    /// Consecutive unanswered probes.
    pub fn missed(&self) -> u32 {
        self.missed
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        let next = if enabled {
            PingState::Active
        } else {
            PingState::Suspended
        };
        if next != self.state {
            debug!(state = ?next, "ping supervisor state change");
            self.state = next;
            if next == PingState::Suspended {
                self.clear();
            }
        }
    }

    /// Count a tick against the outstanding probe.
    ///
    /// Returns true once the miss budget is exhausted; the counters are
    /// reset and the remote is marked not found.
    pub fn record_tick(&mut self) -> bool {
        if !self.awaiting {
            return false;
        }
        self.missed += 1;
        trace!(missed = self.missed, max = self.max_missed, "probe unanswered");
        if self.missed < self.max_missed {
            return false;
        }
        self.missed = 0;
        self.awaiting = false;
        self.found = false;
        true
    }

    /// A probe went out (or is still outstanding) and needs an answer.
    pub fn await_response(&mut self) {
        self.awaiting = true;
    }

    /// The remote answered. Returns true if it was not known to be alive.
    pub fn confirm(&mut self) -> bool {
        self.awaiting = false;
        self.missed = 0;
        !std::mem::replace(&mut self.found, true)
    }

    /// Forget any outstanding probe without judging the remote.
    pub fn clear(&mut self) {
        self.awaiting = false;
        self.missed = 0;
    }
}

/// Start the periodic supervisor. The first tick fires one period after start.
pub(crate) fn spawn_supervisor(
    shared: Arc<BusShared>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = shared.config.ping_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Some(probe) = shared.ping_tick() {
                        // Probes run detached from the tick loop so a stalled
                        // write still lets later ticks count misses.
                        let shared = shared.clone();
                        tokio::spawn(async move { shared.send_probe(probe).await });
                    }
                }
            }
        }
        debug!("ping supervisor stopped");
    })
}
