//! Retry and timeout configuration for the core state machine

use crate::conn::CmState;
use std::time::Duration;

/// Retry policy for one reply-expecting phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseTimer {
    /// Wait before the first retransmission
    pub base_timeout: Duration,
    /// Retransmissions allowed before the phase is exhausted
    pub max_retries: u32,
}

impl PhaseTimer {
    pub const fn new(base_timeout: Duration, max_retries: u32) -> Self {
        Self {
            base_timeout,
            max_retries,
        }
    }

    /// `base_timeout << retries`, saturating at `Duration::MAX`.
    pub fn backoff(&self, retries: u32) -> Duration {
        let factor = 1u32.checked_shl(retries).unwrap_or(0);
        if factor == 0 {
            return Duration::MAX;
        }
        self.base_timeout.saturating_mul(factor)
    }

    pub fn exhausted(&self, retries: u32) -> bool {
        retries >= self.max_retries
    }
}

/// Protocol-only configuration read by [`CmConn`](crate::conn::CmConn).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmCoreConfig {
    /// REQ → REP
    pub req: PhaseTimer,
    /// REP → RTU
    pub rep: PhaseTimer,
    /// DREQ → DREP
    pub dreq: PhaseTimer,
    /// Largest capability value this side advertises or accepts
    pub max_rd_in: u8,
}

impl Default for CmCoreConfig {
    fn default() -> Self {
        Self {
            req: PhaseTimer::new(Duration::from_millis(800), 10),
            rep: PhaseTimer::new(Duration::from_millis(400), 10),
            dreq: PhaseTimer::new(Duration::from_millis(400), 10),
            max_rd_in: 4,
        }
    }
}

impl CmCoreConfig {
    /// Retry policy for the phase `state` is waiting in, if any.
    pub fn phase(&self, state: CmState) -> Option<&PhaseTimer> {
        match state {
            CmState::RepPending => Some(&self.req),
            CmState::RtuPending => Some(&self.rep),
            CmState::DiscPending => Some(&self.dreq),
            _ => None,
        }
    }

    /// Shortest base timeout across all phases
    pub fn min_timeout(&self) -> Duration {
        self.req
            .base_timeout
            .min(self.rep.base_timeout)
            .min(self.dreq.base_timeout)
    }
}
