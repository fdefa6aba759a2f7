//! Protocol counters for one connection manager instance

use std::sync::atomic::{AtomicU64, Ordering};
use ucm_core::Opcode;

/// Per-service counters.
#[derive(Debug, Default)]
pub struct CmCounters {
    pub req_tx: AtomicU64,
    pub rep_tx: AtomicU64,
    pub rtu_tx: AtomicU64,
    pub rej_tx: AtomicU64,
    pub dreq_tx: AtomicU64,
    pub drep_tx: AtomicU64,
    pub req_rx: AtomicU64,
    pub rep_rx: AtomicU64,
    pub rtu_rx: AtomicU64,
    pub rej_rx: AtomicU64,
    pub dreq_rx: AtomicU64,
    pub drep_rx: AtomicU64,
    /// REQ retransmissions
    pub req_retry: AtomicU64,
    /// REP retransmissions
    pub rep_retry: AtomicU64,
    /// DREQ retransmissions
    pub dreq_retry: AtomicU64,
    pub dup_req: AtomicU64,
    /// Inbound messages with no owning connection
    pub unmatched: AtomicU64,
    pub bad_version: AtomicU64,
    pub malformed: AtomicU64,
    /// Connection objects created
    pub created: AtomicU64,
    /// Connection objects destroyed
    pub destroyed: AtomicU64,
    pub send_errors: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl CmCounters {
    pub fn record_tx(&self, op: Opcode) {
        bump(match op {
            Opcode::Req => &self.req_tx,
            Opcode::Rep => &self.rep_tx,
            Opcode::Rtu => &self.rtu_tx,
            Opcode::Rej => &self.rej_tx,
            Opcode::Dreq => &self.dreq_tx,
            Opcode::Drep => &self.drep_tx,
        });
    }

    pub fn record_rx(&self, op: Opcode) {
        bump(match op {
            Opcode::Req => &self.req_rx,
            Opcode::Rep => &self.rep_rx,
            Opcode::Rtu => &self.rtu_rx,
            Opcode::Rej => &self.rej_rx,
            Opcode::Dreq => &self.dreq_rx,
            Opcode::Drep => &self.drep_rx,
        });
    }

    /// Record a timer-driven retransmission of `op`
    pub fn record_retry(&self, op: Opcode) {
        match op {
            Opcode::Req => bump(&self.req_retry),
            Opcode::Rep => bump(&self.rep_retry),
            Opcode::Dreq => bump(&self.dreq_retry),
            _ => {}
        }
    }

    pub fn dup_req(&self) {
        bump(&self.dup_req);
    }

    pub fn unmatched(&self) {
        bump(&self.unmatched);
    }

    pub fn bad_version(&self) {
        bump(&self.bad_version);
    }

    pub fn malformed(&self) {
        bump(&self.malformed);
    }

    pub fn created(&self) {
        bump(&self.created);
    }

    pub fn destroyed(&self) {
        bump(&self.destroyed);
    }

    pub fn send_error(&self) {
        bump(&self.send_errors);
    }

    /// Get current counters snapshot
    pub fn snapshot(&self) -> CountersSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CountersSnapshot {
            req_tx: load(&self.req_tx),
            rep_tx: load(&self.rep_tx),
            rtu_tx: load(&self.rtu_tx),
            rej_tx: load(&self.rej_tx),
            dreq_tx: load(&self.dreq_tx),
            drep_tx: load(&self.drep_tx),
            req_rx: load(&self.req_rx),
            rep_rx: load(&self.rep_rx),
            rtu_rx: load(&self.rtu_rx),
            rej_rx: load(&self.rej_rx),
            dreq_rx: load(&self.dreq_rx),
            drep_rx: load(&self.drep_rx),
            req_retry: load(&self.req_retry),
            rep_retry: load(&self.rep_retry),
            dreq_retry: load(&self.dreq_retry),
            dup_req: load(&self.dup_req),
            unmatched: load(&self.unmatched),
            bad_version: load(&self.bad_version),
            malformed: load(&self.malformed),
            created: load(&self.created),
            destroyed: load(&self.destroyed),
            send_errors: load(&self.send_errors),
        }
    }
}

/// Snapshot of counters at a point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CountersSnapshot {
    pub req_tx: u64,
    pub rep_tx: u64,
    pub rtu_tx: u64,
    pub rej_tx: u64,
    pub dreq_tx: u64,
    pub drep_tx: u64,
    pub req_rx: u64,
    pub rep_rx: u64,
    pub rtu_rx: u64,
    pub rej_rx: u64,
    pub dreq_rx: u64,
    pub drep_rx: u64,
    pub req_retry: u64,
    pub rep_retry: u64,
    pub dreq_retry: u64,
    pub dup_req: u64,
    pub unmatched: u64,
    pub bad_version: u64,
    pub malformed: u64,
    pub created: u64,
    pub destroyed: u64,
    pub send_errors: u64,
}

impl CountersSnapshot {
    /// Connection objects still alive
    pub fn live(&self) -> u64 {
        self.created.saturating_sub(self.destroyed)
    }

    pub fn total_retries(&self) -> u64 {
        self.req_retry + self.rep_retry + self.dreq_retry
    }
}

/// Format counters for human-readable display
pub fn format_counters(s: &CountersSnapshot) -> String {
    format!(
        "UCM Counters:\n\
         Sent: REQ {} REP {} RTU {} REJ {} DREQ {} DREP {}\n\
         Received: REQ {} REP {} RTU {} REJ {} DREQ {} DREP {}\n\
         Retries: REQ {} REP {} DREQ {}\n\
         Dropped: dup REQ {}, unmatched {}, bad version {}, malformed {}\n\
         Objects: {} created, {} destroyed, {} send errors",
        s.req_tx,
        s.rep_tx,
        s.rtu_tx,
        s.rej_tx,
        s.dreq_tx,
        s.drep_tx,
        s.req_rx,
        s.rep_rx,
        s.rtu_rx,
        s.rej_rx,
        s.dreq_rx,
        s.drep_rx,
        s.req_retry,
        s.rep_retry,
        s.dreq_retry,
        s.dup_req,
        s.unmatched,
        s.bad_version,
        s.malformed,
        s.created,
        s.destroyed,
        s.send_errors,
    )
}
