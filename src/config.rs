//! Configuration types for the connection manager.
//!
//! [`CmConfig`] extends the core [`PhaseTimer`] retry policies with the
//! transport and worker settings (send ring size, receive batching, local
//! capability limits, abrupt-disconnect wait).

use crate::error::{CmError, Result};
use std::time::Duration;

// Re-export from ucm-core so users see a single PhaseTimer type.
pub use ucm_core::config::PhaseTimer;

/// Longest idle scheduler interval `validate` accepts.
pub const MAX_TICK: Duration = Duration::from_secs(3600);

// ── CmConfig ────────────────────────────────────────────────────────────

/// Full connection manager configuration: protocol timers plus runtime settings.
#[derive(Debug, Clone)]
pub struct CmConfig {
    // Protocol settings (forwarded to the ucm-core state machine)
    pub req: PhaseTimer,
    pub rep: PhaseTimer,
    pub dreq: PhaseTimer,
    pub max_rd_in: u8,

    // Runtime settings (used only by ucm-tokio)
    pub tick: Option<Duration>,
    pub send_slots: usize,
    pub tx_burst: usize,
    pub recv_batch: usize,
    pub disconnect_wait: Duration,
    pub lid: u16,
}

impl Default for CmConfig {
    fn default() -> Self {
        Self {
            req: PhaseTimer::new(Duration::from_millis(800), 10),
            rep: PhaseTimer::new(Duration::from_millis(400), 10),
            dreq: PhaseTimer::new(Duration::from_millis(400), 10),
            max_rd_in: 4,
            tick: None,
            send_slots: 500,
            tx_burst: 50,
            recv_batch: 10,
            disconnect_wait: Duration::from_secs(5),
            lid: 0,
        }
    }
}

/// Extracts the protocol-only fields that `CmConn` reads.
impl From<&CmConfig> for ucm_core::CmCoreConfig {
    fn from(c: &CmConfig) -> Self {
        Self {
            req: c.req,
            rep: c.rep,
            dreq: c.dreq,
            max_rd_in: c.max_rd_in,
        }
    }
}

// ── Builder methods ─────────────────────────────────────────────────────

impl CmConfig {
    pub fn new() -> Self {
        Self::default()
    }

    // -- Protocol tuning --

    /// Base timeout for REQ → REP
    pub fn req_timeout(mut self, timeout: Duration) -> Self {
        self.req.base_timeout = timeout;
        self
    }

    /// Base timeout for REP → RTU
    pub fn rep_timeout(mut self, timeout: Duration) -> Self {
        self.rep.base_timeout = timeout;
        self
    }

    /// Base timeout for DREQ → DREP
    pub fn dreq_timeout(mut self, timeout: Duration) -> Self {
        self.dreq.base_timeout = timeout;
        self
    }

    /// Same retry count for every phase
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.req.max_retries = retries;
        self.rep.max_retries = retries;
        self.dreq.max_retries = retries;
        self
    }

    pub fn req_retries(mut self, retries: u32) -> Self {
        self.req.max_retries = retries;
        self
    }

    pub fn rep_retries(mut self, retries: u32) -> Self {
        self.rep.max_retries = retries;
        self
    }

    pub fn dreq_retries(mut self, retries: u32) -> Self {
        self.dreq.max_retries = retries;
        self
    }

    pub fn max_rd_in(mut self, rd_in: u8) -> Self {
        self.max_rd_in = rd_in;
        self
    }

    // -- Runtime tuning --

    /// Idle scheduler interval; defaults to the shortest phase timeout
    pub fn tick(mut self, tick: Duration) -> Self {
        self.tick = Some(tick);
        self
    }

    pub fn send_slots(mut self, slots: usize) -> Self {
        self.send_slots = slots;
        self
    }

    pub fn tx_burst(mut self, burst: usize) -> Self {
        self.tx_burst = burst;
        self
    }

    pub fn recv_batch(mut self, batch: usize) -> Self {
        self.recv_batch = batch;
        self
    }

    pub fn disconnect_wait(mut self, wait: Duration) -> Self {
        self.disconnect_wait = wait;
        self
    }

    /// Link-layer id advertised in every message
    pub fn lid(mut self, lid: u16) -> Self {
        self.lid = lid;
        self
    }

    /// Scheduler interval actually used by the worker
    pub fn effective_tick(&self) -> Duration {
        self.tick.unwrap_or_else(|| {
            self.req
                .base_timeout
                .min(self.rep.base_timeout)
                .min(self.dreq.base_timeout)
        })
    }

    // -- Presets --

    /// Low-latency local network
    pub fn lan() -> Self {
        Self::default()
            .req_timeout(Duration::from_millis(200))
            .rep_timeout(Duration::from_millis(100))
            .dreq_timeout(Duration::from_millis(100))
            .max_retries(7)
    }

    /// Large or congested fabrics
    pub fn wan() -> Self {
        Self::default()
            .req_timeout(Duration::from_millis(4000))
            .rep_timeout(Duration::from_millis(2000))
            .dreq_timeout(Duration::from_millis(2000))
            .max_retries(10)
    }

    /// Tiny timeouts and few retries for tests
    pub fn test() -> Self {
        Self::default()
            .req_timeout(Duration::from_millis(20))
            .rep_timeout(Duration::from_millis(10))
            .dreq_timeout(Duration::from_millis(10))
            .max_retries(3)
            .disconnect_wait(Duration::from_millis(500))
    }

    // -- Environment --

    /// Defaults overridden by `UCM_RETRY`, `UCM_REP_TIME`, `UCM_RTU_TIME`
    /// (milliseconds), `UCM_QP_SIZE` and `UCM_TX_BURST`.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides read through `lookup`. Unparseable values are errors.
    pub fn with_env_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        fn parse<T: std::str::FromStr>(key: &str, raw: String) -> Result<T> {
            raw.trim()
                .parse()
                .map_err(|_| CmError::config(format!("{key}: cannot parse {raw:?}")))
        }

        if let Some(raw) = lookup("UCM_RETRY") {
            let retries: u32 = parse("UCM_RETRY", raw)?;
            self = self.max_retries(retries);
        }
        if let Some(raw) = lookup("UCM_REP_TIME") {
            let ms: u64 = parse("UCM_REP_TIME", raw)?;
            self.req.base_timeout = Duration::from_millis(ms);
        }
        if let Some(raw) = lookup("UCM_RTU_TIME") {
            let ms: u64 = parse("UCM_RTU_TIME", raw)?;
            self.rep.base_timeout = Duration::from_millis(ms);
            self.dreq.base_timeout = Duration::from_millis(ms);
        }
        if let Some(raw) = lookup("UCM_QP_SIZE") {
            self.send_slots = parse("UCM_QP_SIZE", raw)?;
        }
        if let Some(raw) = lookup("UCM_TX_BURST") {
            self.tx_burst = parse("UCM_TX_BURST", raw)?;
        }
        Ok(self)
    }

    // -- Validation --

    pub fn validate(&self) -> Result<()> {
        for (name, phase) in [("req", &self.req), ("rep", &self.rep), ("dreq", &self.dreq)] {
            if phase.base_timeout.is_zero() {
                return Err(CmError::config(format!("{name} timeout must be non-zero")));
            }
        }
        if self.send_slots == 0 {
            return Err(CmError::config("send_slots must be non-zero"));
        }
        if self.tx_burst == 0 || self.tx_burst > self.send_slots {
            return Err(CmError::config(format!(
                "tx_burst must be in 1..={}",
                self.send_slots
            )));
        }
        if self.recv_batch == 0 {
            return Err(CmError::config("recv_batch must be non-zero"));
        }
        if let Some(tick) = self.tick {
            if tick.is_zero() || tick > MAX_TICK {
                return Err(CmError::config(format!(
                    "tick must be in (0, {}s]",
                    MAX_TICK.as_secs()
                )));
            }
        }
        Ok(())
    }
}
