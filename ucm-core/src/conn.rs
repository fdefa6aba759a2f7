//! Connection state machine.
//!
//! [`CmConn`] is one side of one connection. It never performs I/O: every
//! operation takes the current time and returns the [`CmAction`]s the caller
//! must carry out (send a message, raise an event, wake disconnect waiters,
//! release the object). Callers serialize access with their own lock.

use crate::config::CmCoreConfig;
use crate::error::{CmCoreError, CmCoreResult};
use crate::protocol::constants::UCM_MAX_PDATA;
use crate::protocol::{CmAddr, Message, Opcode, Rejection, SessionId};

use bytes::Bytes;
use std::fmt;
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmState {
    Init,
    /// REQ sent, waiting for REP
    RepPending,
    /// REQ received, waiting for the local application
    AcceptingLocal,
    /// REP sent, waiting for RTU
    RtuPending,
    Connected,
    /// DREQ sent, waiting for DREP
    DiscPending,
    DiscRecv,
    Disconnected,
    Rejected,
    Free,
}

impl CmState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::RepPending => "REP_PENDING",
            Self::AcceptingLocal => "ACCEPTING",
            Self::RtuPending => "RTU_PENDING",
            Self::Connected => "CONNECTED",
            Self::DiscPending => "DISC_PENDING",
            Self::DiscRecv => "DISC_RECV",
            Self::Disconnected => "DISCONNECTED",
            Self::Rejected => "REJECTED",
            Self::Free => "FREE",
        }
    }

    /// No further protocol traffic is expected.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Rejected | Self::Free)
    }

    /// Still negotiating, never connected.
    pub fn is_handshake(self) -> bool {
        matches!(
            self,
            Self::Init | Self::RepPending | Self::AcceptingLocal | Self::RtuPending
        )
    }
}

impl fmt::Display for CmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Active,
    Passive,
}

/// Lifecycle notification for the owning application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CmEventKind {
    ConnectionRequestPending { private_data: Bytes },
    Connected { private_data: Bytes },
    Disconnected,
    Rejected(Rejection),
    Unreachable,
    LocalFailure,
}

impl CmEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConnectionRequestPending { .. } => "CONN_REQUEST",
            Self::Connected { .. } => "CONNECTED",
            Self::Disconnected => "DISCONNECTED",
            Self::Rejected(_) => "REJECTED",
            Self::Unreachable => "UNREACHABLE",
            Self::LocalFailure => "LOCAL_FAILURE",
        }
    }
}

/// Work the caller must perform, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CmAction {
    Send(Message),
    Raise(CmEventKind),
    /// Signal anyone blocked in an abrupt disconnect
    WakeDisconnect,
    /// The object is finished: unlink it and drop its references
    Release,
}

/// Result of a timer evaluation.
#[derive(Debug, Default)]
pub struct TimerPoll {
    pub actions: Vec<CmAction>,
    /// When this connection next needs attention
    pub next_deadline: Option<Instant>,
}

/// Local identity of a connection.
#[derive(Debug, Clone, Copy)]
pub struct LocalEnd {
    pub port: u16,
    pub addr: CmAddr,
    pub session: SessionId,
    /// Capability limit advertised by this side
    pub rd_in: u8,
}

/// One side of one connection.
#[derive(Debug)]
pub struct CmConn {
    role: Role,
    state: CmState,
    prev_state: CmState,
    retries: u32,
    sent_at: Option<Instant>,
    // Template for everything this side sends; op and private data vary.
    msg: Message,
    req_data: Bytes,
    reply_data: Bytes,
    peer_data: Bytes,
    rd_in: u8,
    config: CmCoreConfig,
}

impl CmConn {
    /// Create the active side of a connection in `Init`.
    pub fn active(
        local: LocalEnd,
        remote_port: u16,
        private_data: Bytes,
        config: CmCoreConfig,
    ) -> CmCoreResult<Self> {
        if private_data.len() > UCM_MAX_PDATA {
            return Err(CmCoreError::length(private_data.len(), UCM_MAX_PDATA));
        }
        let rd_in = local.rd_in.min(config.max_rd_in);
        let mut msg = Message::new(Opcode::Req);
        msg.sport = local.port;
        msg.dport = remote_port;
        msg.s_id = local.session;
        msg.saddr = local.addr;
        msg.rd_in = rd_in;

        Ok(Self {
            role: Role::Active,
            state: CmState::Init,
            prev_state: CmState::Init,
            retries: 0,
            sent_at: None,
            msg,
            req_data: private_data,
            reply_data: Bytes::new(),
            peer_data: Bytes::new(),
            rd_in,
            config,
        })
    }

    /// Create the passive side from an unmatched REQ. Starts in
    /// `AcceptingLocal` and asks the application for a decision.
    pub fn passive(local: LocalEnd, req: &Message, config: CmCoreConfig) -> (Self, Vec<CmAction>) {
        let rd_in = req.rd_in.min(local.rd_in).min(config.max_rd_in);
        let mut msg = req.reply(Opcode::Rep);
        msg.sport = local.port;
        msg.s_id = local.session;
        msg.saddr = local.addr;
        msg.rd_in = rd_in;

        let conn = Self {
            role: Role::Passive,
            state: CmState::AcceptingLocal,
            prev_state: CmState::Init,
            retries: 0,
            sent_at: None,
            msg,
            req_data: Bytes::new(),
            reply_data: Bytes::new(),
            peer_data: req.private_data.clone(),
            rd_in,
            config,
        };
        let actions = vec![CmAction::Raise(CmEventKind::ConnectionRequestPending {
            private_data: req.private_data.clone(),
        })];
        (conn, actions)
    }

    // ── Accessors ───────────────────────────────────────────────────────

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> CmState {
        self.state
    }

    /// State before the most recent transition
    pub fn prev_state(&self) -> CmState {
        self.prev_state
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn local_port(&self) -> u16 {
        self.msg.sport
    }

    pub fn remote_port(&self) -> u16 {
        self.msg.dport
    }

    pub fn local_session(&self) -> SessionId {
        self.msg.s_id
    }

    /// Zero until learned from the peer
    pub fn remote_session(&self) -> SessionId {
        self.msg.d_id
    }

    pub fn local_addr(&self) -> CmAddr {
        self.msg.saddr
    }

    pub fn remote_addr(&self) -> CmAddr {
        self.msg.daddr
    }

    /// Negotiated capability: the minimum of both sides' limits
    pub fn rd_in(&self) -> u8 {
        self.rd_in
    }

    /// Private data most recently received from the peer
    pub fn peer_private_data(&self) -> &Bytes {
        &self.peer_data
    }

    /// When the outstanding phase times out, if one is outstanding.
    pub fn deadline(&self) -> Option<Instant> {
        let phase = self.config.phase(self.state)?;
        self.sent_at?.checked_add(phase.backoff(self.retries))
    }

    // ── Application operations ──────────────────────────────────────────

    /// Send the initial REQ.
    pub fn connect(&mut self, now: Instant) -> CmCoreResult<Vec<CmAction>> {
        if self.role != Role::Active || self.state != CmState::Init {
            return Err(CmCoreError::invalid_state(self.state, "connect"));
        }
        self.set_state(CmState::RepPending);
        self.retries = 0;
        Ok(vec![self.transmit(Opcode::Req, now)])
    }

    /// Accept a pending request: send REP and wait for RTU.
    pub fn accept(
        &mut self,
        local_addr: CmAddr,
        rd_in: u8,
        private_data: Bytes,
        now: Instant,
    ) -> CmCoreResult<Vec<CmAction>> {
        if self.role != Role::Passive || self.state != CmState::AcceptingLocal {
            return Err(CmCoreError::invalid_state(self.state, "accept"));
        }
        if private_data.len() > UCM_MAX_PDATA {
            return Err(CmCoreError::length(private_data.len(), UCM_MAX_PDATA));
        }
        self.rd_in = self.rd_in.min(rd_in);
        self.msg.rd_in = self.rd_in;
        self.msg.saddr = local_addr;
        self.reply_data = private_data;
        self.set_state(CmState::RtuPending);
        self.retries = 0;
        Ok(vec![self.transmit(Opcode::Rep, now)])
    }

    /// Refuse a request that has not reached `Connected`. The REJ is sent
    /// once and never retried.
    pub fn reject(&mut self, rejection: Rejection) -> CmCoreResult<Vec<CmAction>> {
        if self.role != Role::Passive
            || !matches!(self.state, CmState::AcceptingLocal | CmState::RtuPending)
        {
            return Err(CmCoreError::invalid_state(self.state, "reject"));
        }
        let private_data = rejection.encode()?;
        self.msg.op = Opcode::Rej;
        self.msg.private_data = private_data;
        self.sent_at = None;
        self.set_state(CmState::Rejected);
        Ok(vec![CmAction::Send(self.msg.clone()), CmAction::Release])
    }

    /// Start teardown. Safe to call in any state: only the first call on a
    /// live connection has an effect.
    pub fn disconnect(&mut self, now: Instant) -> Vec<CmAction> {
        match self.state {
            CmState::Connected => {
                self.set_state(CmState::DiscPending);
                self.retries = 0;
                vec![self.transmit(Opcode::Dreq, now)]
            }
            CmState::Init | CmState::RepPending | CmState::AcceptingLocal | CmState::RtuPending => {
                debug!(state = %self.state, "Disconnect during handshake, aborting");
                self.sent_at = None;
                self.set_state(CmState::Free);
                vec![
                    CmAction::Raise(CmEventKind::Disconnected),
                    CmAction::WakeDisconnect,
                    CmAction::Release,
                ]
            }
            CmState::DiscPending
            | CmState::DiscRecv
            | CmState::Disconnected
            | CmState::Rejected
            | CmState::Free => Vec::new(),
        }
    }

    /// Last external reference is gone: stop all protocol activity.
    pub fn free(&mut self) {
        if self.state != CmState::Free {
            self.sent_at = None;
            self.set_state(CmState::Free);
        }
    }

    // ── Inbound ─────────────────────────────────────────────────────────

    /// Apply a message already routed to this connection.
    pub fn on_message(&mut self, msg: &Message, now: Instant) -> Vec<CmAction> {
        if msg.d_id != 0 && msg.d_id != self.msg.s_id {
            warn!(
                op = msg.op.as_str(),
                state = %self.state,
                d_id = msg.d_id,
                local_id = self.msg.s_id,
                "Foreign destination session id, ignoring"
            );
            return Vec::new();
        }
        if self.msg.d_id != 0 && msg.s_id != self.msg.d_id {
            warn!(
                op = msg.op.as_str(),
                state = %self.state,
                s_id = msg.s_id,
                remote_id = self.msg.d_id,
                "Stale source session id, ignoring"
            );
            return Vec::new();
        }

        trace!(op = msg.op.as_str(), state = %self.state, "Applying message");

        match (self.state, msg.op) {
            (CmState::RepPending, Opcode::Rep) => self.on_reply(msg, now),
            (CmState::RepPending, Opcode::Rej) => {
                let rejection = Rejection::decode(&msg.private_data);
                debug!(%rejection, "Connection rejected");
                self.sent_at = None;
                self.set_state(CmState::Rejected);
                vec![
                    CmAction::Raise(CmEventKind::Rejected(rejection)),
                    CmAction::Release,
                ]
            }
            (CmState::RtuPending, Opcode::Rtu) => {
                self.sent_at = None;
                self.set_state(CmState::Connected);
                vec![CmAction::Raise(CmEventKind::Connected {
                    private_data: Bytes::new(),
                })]
            }
            (CmState::RtuPending, op) => {
                warn!(op = op.as_str(), "Unexpected message while waiting for RTU");
                self.sent_at = None;
                self.set_state(CmState::Free);
                vec![CmAction::Raise(CmEventKind::LocalFailure), CmAction::Release]
            }
            (CmState::Connected, Opcode::Rep) if self.role == Role::Active => {
                debug!("REP while connected, resending RTU");
                vec![self.transmit(Opcode::Rtu, now)]
            }
            (CmState::Connected, Opcode::Dreq) => {
                self.set_state(CmState::DiscRecv);
                let drep = self.transmit(Opcode::Drep, now);
                self.set_state(CmState::Disconnected);
                vec![
                    drep,
                    CmAction::Raise(CmEventKind::Disconnected),
                    CmAction::WakeDisconnect,
                ]
            }
            (CmState::DiscPending, Opcode::Dreq | Opcode::Drep) => {
                self.sent_at = None;
                self.set_state(CmState::Disconnected);
                vec![
                    CmAction::Raise(CmEventKind::Disconnected),
                    CmAction::WakeDisconnect,
                ]
            }
            (CmState::Disconnected | CmState::Free, Opcode::Dreq) => {
                debug!(state = %self.state, "Duplicate DREQ, resending DREP");
                vec![self.transmit(Opcode::Drep, now)]
            }
            (CmState::Disconnected | CmState::Free, Opcode::Drep) => Vec::new(),
            (CmState::Rejected, Opcode::Rej) => Vec::new(),
            (state, op) => {
                warn!(
                    op = op.as_str(),
                    state = %state,
                    role = ?self.role,
                    "Unexpected message for state, ignoring"
                );
                Vec::new()
            }
        }
    }

    fn on_reply(&mut self, msg: &Message, now: Instant) -> Vec<CmAction> {
        if msg.s_id == 0 || msg.private_data.len() > UCM_MAX_PDATA {
            warn!(s_id = msg.s_id, "Invalid REP, ignoring");
            return Vec::new();
        }
        self.msg.d_id = msg.s_id;
        self.msg.daddr = msg.saddr;
        self.rd_in = self.rd_in.min(msg.rd_in);
        self.peer_data = msg.private_data.clone();
        self.sent_at = None;
        self.set_state(CmState::Connected);
        let rtu = self.transmit(Opcode::Rtu, now);
        vec![
            rtu,
            CmAction::Raise(CmEventKind::Connected {
                private_data: self.peer_data.clone(),
            }),
        ]
    }

    // ── Timers ──────────────────────────────────────────────────────────

    /// Re-evaluate the outstanding phase: retransmit, exhaust, or report
    /// when to look again.
    pub fn on_timer(&mut self, now: Instant) -> TimerPoll {
        let Some(phase) = self.config.phase(self.state).copied() else {
            return TimerPoll::default();
        };
        let Some(sent_at) = self.sent_at else {
            return TimerPoll::default();
        };

        let wait = phase.backoff(self.retries);
        if now.saturating_duration_since(sent_at) < wait {
            return TimerPoll {
                actions: Vec::new(),
                next_deadline: sent_at.checked_add(wait),
            };
        }

        if phase.exhausted(self.retries) {
            return TimerPoll {
                actions: self.exhaust(),
                next_deadline: None,
            };
        }

        self.retries += 1;
        let op = match self.state {
            CmState::RepPending => Opcode::Req,
            CmState::RtuPending => Opcode::Rep,
            _ => Opcode::Dreq,
        };
        debug!(
            op = op.as_str(),
            retries = self.retries,
            max = phase.max_retries,
            "Retransmitting"
        );
        let send = self.transmit(op, now);
        TimerPoll {
            actions: vec![send],
            next_deadline: now.checked_add(phase.backoff(self.retries)),
        }
    }

    fn exhaust(&mut self) -> Vec<CmAction> {
        self.sent_at = None;
        match self.state {
            CmState::RepPending => {
                warn!(
                    retries = self.retries,
                    port = self.msg.dport,
                    "REQ retries exhausted, destination unreachable"
                );
                self.set_state(CmState::Free);
                vec![CmAction::Raise(CmEventKind::Unreachable), CmAction::Release]
            }
            CmState::RtuPending => {
                warn!(retries = self.retries, "REP retries exhausted, no RTU");
                self.set_state(CmState::Free);
                vec![CmAction::Raise(CmEventKind::LocalFailure), CmAction::Release]
            }
            CmState::DiscPending => {
                warn!(retries = self.retries, "DREQ retries exhausted, finalizing");
                self.set_state(CmState::Disconnected);
                vec![
                    CmAction::Raise(CmEventKind::Disconnected),
                    CmAction::WakeDisconnect,
                ]
            }
            _ => Vec::new(),
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────────

    fn set_state(&mut self, next: CmState) {
        if next != self.state {
            debug!(from = %self.state, to = %next, "State transition");
            self.prev_state = self.state;
            self.state = next;
        }
    }

    /// Stamp the template with `op` and the matching private data. Phases
    /// that expect a reply record the send time.
    fn transmit(&mut self, op: Opcode, now: Instant) -> CmAction {
        self.msg.op = op;
        self.msg.private_data = match op {
            Opcode::Req => self.req_data.clone(),
            Opcode::Rep => self.reply_data.clone(),
            _ => Bytes::new(),
        };
        if matches!(op, Opcode::Req | Opcode::Rep | Opcode::Dreq) {
            self.sent_at = Some(now);
        }
        CmAction::Send(self.msg.clone())
    }
}
