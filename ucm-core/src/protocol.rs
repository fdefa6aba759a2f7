//! UCM wire types, constants, and codec

use crate::error::{CmCoreError, CmCoreResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// UCM protocol constants
pub mod constants {
    pub const UCM_VERSION: u16 = 7; // current wire version
    pub const UCM_VERSION_MIN: u16 = 6; // oldest version still accepted
    pub const UCM_HEADER_SIZE: usize = 40; // fixed header
    pub const UCM_MAX_MSG_SIZE: usize = 256; // one datagram
    pub const UCM_MAX_PDATA: usize = UCM_MAX_MSG_SIZE - UCM_HEADER_SIZE;
    pub const UCM_REJ_MAGIC: u16 = 0x524A; // "RJ"
    pub const UCM_REJ_HDR_SIZE: usize = 4;
    pub const UCM_MAX_REJ_PDATA: usize = UCM_MAX_PDATA - UCM_REJ_HDR_SIZE;
    pub const UCM_REJ_CONSUMER: u8 = 1;
    pub const UCM_REJ_PROTOCOL: u8 = 2;
    pub const UCM_OP_REQ: u16 = 1;
    pub const UCM_OP_REP: u16 = 2;
    pub const UCM_OP_REJ: u16 = 3;
    pub const UCM_OP_RTU: u16 = 4;
    pub const UCM_OP_DREQ: u16 = 5;
    pub const UCM_OP_DREP: u16 = 6;
}

use constants::*;

/// Session id type. Zero means "not yet learned".
pub type SessionId = u32;

/// Generate a random non-zero session id.
pub fn random_session_id() -> SessionId {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    loop {
        let id = RandomState::new().build_hasher().finish() as u32;
        if id != 0 {
            return id;
        }
    }
}

/// Handshake message opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Req,
    Rep,
    Rej,
    Rtu,
    Dreq,
    Drep,
}

impl Opcode {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            UCM_OP_REQ => Some(Self::Req),
            UCM_OP_REP => Some(Self::Rep),
            UCM_OP_REJ => Some(Self::Rej),
            UCM_OP_RTU => Some(Self::Rtu),
            UCM_OP_DREQ => Some(Self::Dreq),
            UCM_OP_DREP => Some(Self::Drep),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        match self {
            Self::Req => UCM_OP_REQ,
            Self::Rep => UCM_OP_REP,
            Self::Rej => UCM_OP_REJ,
            Self::Rtu => UCM_OP_RTU,
            Self::Dreq => UCM_OP_DREQ,
            Self::Drep => UCM_OP_DREP,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Req => "REQ",
            Self::Rep => "REP",
            Self::Rej => "REJ",
            Self::Rtu => "RTU",
            Self::Dreq => "DREQ",
            Self::Drep => "DREP",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Endpoint addressing block: link-layer id plus queue number.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CmAddr {
    pub lid: u16,
    pub qp_type: u8,
    pub qpn: u32,
}

impl CmAddr {
    pub const SIZE: usize = 8;

    pub fn new(lid: u16, qpn: u32) -> Self {
        Self { lid, qp_type: 0, qpn }
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(self.lid);
        buf.put_u8(self.qp_type);
        buf.put_u8(0);
        buf.put_u32(self.qpn);
    }

    fn decode(buf: &mut Bytes) -> Self {
        let lid = buf.get_u16();
        let qp_type = buf.get_u8();
        buf.advance(1);
        let qpn = buf.get_u32();
        Self { lid, qp_type, qpn }
    }
}

impl fmt::Display for CmAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}:{:x}", self.lid, self.qpn)
    }
}

/// A decoded handshake message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub version: u16,
    pub op: Opcode,
    pub sport: u16,
    pub dport: u16,
    pub s_id: SessionId,
    pub d_id: SessionId,
    pub rd_in: u8,
    pub saddr: CmAddr,
    pub daddr: CmAddr,
    pub private_data: Bytes,
}

impl Message {
    /// Size of the fixed header in bytes
    pub const HEADER_SIZE: usize = UCM_HEADER_SIZE;

    /// Create a message with the current version and no private data
    pub fn new(op: Opcode) -> Self {
        Self {
            version: UCM_VERSION,
            op,
            sport: 0,
            dport: 0,
            s_id: 0,
            d_id: 0,
            rd_in: 0,
            saddr: CmAddr::default(),
            daddr: CmAddr::default(),
            private_data: Bytes::new(),
        }
    }

    /// Build the reply skeleton for `self`: addressing, ports and session
    /// ids swapped, no private data.
    pub fn reply(&self, op: Opcode) -> Self {
        Self {
            version: UCM_VERSION,
            op,
            sport: self.dport,
            dport: self.sport,
            s_id: self.d_id,
            d_id: self.s_id,
            rd_in: 0,
            saddr: self.daddr,
            daddr: self.saddr,
            private_data: Bytes::new(),
        }
    }

    /// Total encoded size
    pub fn encoded_len(&self) -> usize {
        Self::HEADER_SIZE + self.private_data.len()
    }

    /// Encode into `buf`. Fails if the private data exceeds [`UCM_MAX_PDATA`].
    pub fn encode(&self, buf: &mut BytesMut) -> CmCoreResult<()> {
        if self.private_data.len() > UCM_MAX_PDATA {
            return Err(CmCoreError::length(self.private_data.len(), UCM_MAX_PDATA));
        }
        buf.reserve(self.encoded_len());
        buf.put_u16(self.version);
        buf.put_u16(self.op.as_u16());
        buf.put_u16(self.sport);
        buf.put_u16(self.dport);
        buf.put_u32(self.s_id);
        buf.put_u32(self.d_id);
        buf.put_u8(self.rd_in);
        buf.put_bytes(0, 3);
        self.saddr.encode(buf);
        self.daddr.encode(buf);
        buf.put_u16(self.private_data.len() as u16);
        buf.put_u16(0);
        buf.extend_from_slice(&self.private_data);
        Ok(())
    }

    /// Encode into a freshly allocated buffer
    pub fn to_bytes(&self) -> CmCoreResult<Bytes> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode a datagram.
    ///
    /// Rejects short datagrams, unknown opcodes, versions below
    /// [`UCM_VERSION_MIN`], and private-data lengths over the maximum or past
    /// the end of the datagram. Trailing bytes are ignored.
    pub fn decode(mut buf: Bytes) -> CmCoreResult<Self> {
        if buf.len() < Self::HEADER_SIZE {
            return Err(CmCoreError::malformed(format!(
                "short datagram: {} bytes",
                buf.len()
            )));
        }

        let version = buf.get_u16();
        if version < UCM_VERSION_MIN {
            return Err(CmCoreError::Version { found: version });
        }
        let raw_op = buf.get_u16();
        let op = Opcode::from_u16(raw_op)
            .ok_or_else(|| CmCoreError::malformed(format!("unknown opcode {raw_op}")))?;
        let sport = buf.get_u16();
        let dport = buf.get_u16();
        let s_id = buf.get_u32();
        let d_id = buf.get_u32();
        let rd_in = buf.get_u8();
        buf.advance(3);
        let saddr = CmAddr::decode(&mut buf);
        let daddr = CmAddr::decode(&mut buf);
        let p_size = buf.get_u16() as usize;
        buf.advance(2);

        if p_size > UCM_MAX_PDATA {
            return Err(CmCoreError::length(p_size, UCM_MAX_PDATA));
        }
        if p_size > buf.len() {
            return Err(CmCoreError::malformed(format!(
                "private data length {p_size} exceeds remaining {}",
                buf.len()
            )));
        }

        Ok(Self {
            version,
            op,
            sport,
            dport,
            s_id,
            d_id,
            rd_in,
            saddr,
            daddr,
            private_data: buf.split_to(p_size),
        })
    }
}

// ── Reject private-data header ──────────────────────────────────────────

/// Why the protocol layer (not the peer application) refused a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolReason {
    NoListener,
    BadVersion,
    Malformed,
    Timeout,
    Other(u8),
}

impl ProtocolReason {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::NoListener,
            2 => Self::BadVersion,
            3 => Self::Malformed,
            4 => Self::Timeout,
            other => Self::Other(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::NoListener => 1,
            Self::BadVersion => 2,
            Self::Malformed => 3,
            Self::Timeout => 4,
            Self::Other(v) => v,
        }
    }
}

impl fmt::Display for ProtocolReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoListener => write!(f, "no listener"),
            Self::BadVersion => write!(f, "bad version"),
            Self::Malformed => write!(f, "malformed request"),
            Self::Timeout => write!(f, "timeout"),
            Self::Other(v) => write!(f, "reason {v}"),
        }
    }
}

/// Decoded meaning of a REJ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// The peer application rejected the request; carries its payload.
    Consumer { reason: u8, private_data: Bytes },
    /// The peer's connection manager refused it. Never carries a payload.
    Protocol(Option<ProtocolReason>),
}

impl Rejection {
    pub fn is_consumer(&self) -> bool {
        matches!(self, Self::Consumer { .. })
    }

    /// Build the REJ private data for this rejection.
    pub fn encode(&self) -> CmCoreResult<Bytes> {
        let mut buf = BytesMut::with_capacity(UCM_REJ_HDR_SIZE);
        match self {
            Self::Consumer {
                reason,
                private_data,
            } => {
                if private_data.len() > UCM_MAX_REJ_PDATA {
                    return Err(CmCoreError::length(private_data.len(), UCM_MAX_REJ_PDATA));
                }
                buf.put_u16(UCM_REJ_MAGIC);
                buf.put_u8(UCM_REJ_CONSUMER);
                buf.put_u8(*reason);
                buf.extend_from_slice(private_data);
            }
            Self::Protocol(reason) => {
                buf.put_u16(UCM_REJ_MAGIC);
                buf.put_u8(UCM_REJ_PROTOCOL);
                buf.put_u8(reason.map(ProtocolReason::as_u8).unwrap_or(0));
            }
        }
        Ok(buf.freeze())
    }

    /// Interpret REJ private data. Anything without a valid consumer header
    /// is a protocol-level rejection, and any bytes after a protocol header
    /// are discarded.
    pub fn decode(private_data: &Bytes) -> Self {
        if private_data.len() < UCM_REJ_HDR_SIZE {
            return Self::Protocol(None);
        }
        let mut hdr = private_data.slice(..UCM_REJ_HDR_SIZE);
        if hdr.get_u16() != UCM_REJ_MAGIC {
            return Self::Protocol(None);
        }
        let origin = hdr.get_u8();
        let reason = hdr.get_u8();
        match origin {
            UCM_REJ_CONSUMER => Self::Consumer {
                reason,
                private_data: private_data.slice(UCM_REJ_HDR_SIZE..),
            },
            UCM_REJ_PROTOCOL if reason != 0 => {
                Self::Protocol(Some(ProtocolReason::from_u8(reason)))
            }
            _ => Self::Protocol(None),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Consumer {
                reason,
                private_data,
            } => write!(
                f,
                "rejected by peer application (reason {reason}, {} bytes)",
                private_data.len()
            ),
            Self::Protocol(Some(r)) => write!(f, "rejected by peer CM: {r}"),
            Self::Protocol(None) => write!(f, "rejected by peer CM"),
        }
    }
}

/// Build the protocol-level REJ answering an unmatched `req`.
pub fn protocol_reject(req: &Message, reason: ProtocolReason) -> Message {
    let mut rej = req.reply(Opcode::Rej);
    // A protocol header is 4 bytes, always within the limit.
    rej.private_data = Rejection::Protocol(Some(reason))
        .encode()
        .unwrap_or_default();
    rej
}
