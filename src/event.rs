//! Events raised to endpoints and listeners

use crate::error::CmError;
use crate::handle::Connection;
use crate::transport::Addr;

use bytes::Bytes;
use std::fmt;
use ucm_core::{CmAddr, CmConn, CmEventKind, CmState, Rejection, Role, SessionId};

/// Diagnostic snapshot of one connection object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmInfo<A: Addr> {
    pub id: u64,
    pub peer: A,
    pub role: Role,
    pub state: CmState,
    pub prev_state: CmState,
    pub retries: u32,
    pub local_port: u16,
    pub remote_port: u16,
    pub local_session: SessionId,
    pub remote_session: SessionId,
    pub rd_in: u8,
    pub remote_addr: CmAddr,
}

impl<A: Addr> CmInfo<A> {
    pub(crate) fn capture(id: u64, peer: &A, conn: &CmConn) -> Self {
        Self {
            id,
            peer: peer.clone(),
            role: conn.role(),
            state: conn.state(),
            prev_state: conn.prev_state(),
            retries: conn.retries(),
            local_port: conn.local_port(),
            remote_port: conn.remote_port(),
            local_session: conn.local_session(),
            remote_session: conn.remote_session(),
            rd_in: conn.rd_in(),
            remote_addr: conn.remote_addr(),
        }
    }
}

impl<A: Addr> fmt::Display for CmInfo<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let role = match self.role {
            Role::Active => "ACTIVE",
            Role::Passive => "PASSIVE",
        };
        write!(
            f,
            "CM#{} {role} {} <- {}: {:#x} -> {} {:#x} ({:#x} -> {:#x}) rd_in {} retries {}",
            self.id,
            self.state,
            self.prev_state,
            self.local_port,
            self.peer,
            self.remote_port,
            self.local_session,
            self.remote_session,
            self.rd_in,
            self.retries,
        )
    }
}

/// Lifecycle event delivered on an [`Endpoint`](crate::endpoint::Endpoint).
#[derive(Debug, Clone)]
pub struct CmEvent<A: Addr> {
    pub kind: CmEventKind,
    /// Connection state right after the transition that raised the event
    pub info: CmInfo<A>,
}

impl<A: Addr> CmEvent<A> {
    /// Private data carried by the event, if any.
    pub fn private_data(&self) -> Option<&Bytes> {
        match &self.kind {
            CmEventKind::ConnectionRequestPending { private_data }
            | CmEventKind::Connected { private_data } => Some(private_data),
            CmEventKind::Rejected(Rejection::Consumer { private_data, .. }) => Some(private_data),
            _ => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.kind, CmEventKind::Connected { .. })
    }

    /// Nothing further will be raised for this connection.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            CmEventKind::Disconnected
                | CmEventKind::Rejected(_)
                | CmEventKind::Unreachable
                | CmEventKind::LocalFailure
        )
    }

    /// The failure this event reports, if it reports one.
    pub fn into_error(self) -> Option<CmError> {
        match self.kind {
            CmEventKind::Rejected(rejection) => Some(CmError::PeerRejected(rejection)),
            CmEventKind::Unreachable => Some(CmError::Unreachable),
            CmEventKind::LocalFailure if self.info.retries > 0 => Some(CmError::ProtocolTimeout {
                phase: self.info.prev_state.as_str(),
                retries: self.info.retries,
            }),
            CmEventKind::LocalFailure => Some(CmError::internal(format!(
                "local failure in {}",
                self.info.prev_state
            ))),
            _ => None,
        }
    }
}

impl<A: Addr> fmt::Display for CmEvent<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.kind.name(), self.info)
    }
}

/// Inbound connection request waiting for [`accept`] or [`reject`].
///
/// [`accept`]: crate::service::CmService::accept
/// [`reject`]: crate::service::CmService::reject
#[derive(Debug, Clone)]
pub struct ConnectionRequest<A: Addr> {
    pub(crate) conn: Connection<A>,
    pub(crate) private_data: Bytes,
    pub(crate) info: CmInfo<A>,
}

impl<A: Addr> ConnectionRequest<A> {
    pub fn peer(&self) -> &A {
        self.conn.peer()
    }

    pub fn private_data(&self) -> &Bytes {
        &self.private_data
    }

    pub fn connection(&self) -> &Connection<A> {
        &self.conn
    }

    pub fn info(&self) -> &CmInfo<A> {
        &self.info
    }

    /// Capability limit offered by the requester
    pub fn rd_in(&self) -> u8 {
        self.info.rd_in
    }
}
