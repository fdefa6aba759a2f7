//! Error types for the connection manager.
//!
//! [`CmError`] extends [`ucm_core::CmCoreError`] with the I/O, resource,
//! registry and configuration variants needed by the async runtime layer.

use std::fmt;
use std::time::Duration;
use thiserror::Error;
use ucm_core::{CmState, Rejection};

pub type Result<T> = std::result::Result<T, CmError>;

// ── Error types ─────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CmError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol timeout: {phase} retries exhausted after {retries}")]
    ProtocolTimeout { phase: &'static str, retries: u32 },

    #[error("Peer rejected: {0}")]
    PeerRejected(Rejection),

    #[error("Destination unreachable")]
    Unreachable,

    #[error("Duplicate connection request")]
    DuplicateRequest,

    #[error("Malformed message: {message}")]
    MalformedMessage { message: String },

    #[error("Resource exhausted: {resource}")]
    ResourceExhausted { resource: ResourceKind },

    #[error("Invalid state: {op} not permitted in {state}")]
    InvalidState { state: CmState, op: &'static str },

    #[error("Invalid parameter: {message}")]
    InvalidParameter { message: String },

    #[error("Service id {port:#x} already in use")]
    ConnQualInUse { port: u16 },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Connection manager closed")]
    Closed,

    #[error("Internal error: {message}")]
    Internal { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    SendSlots,
    Ports,
    Transport,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SendSlots => write!(f, "send slots"),
            Self::Ports => write!(f, "service ids"),
            Self::Transport => write!(f, "transport queue"),
        }
    }
}

// ── Bridge: ucm-core errors → CmError ───────────────────────────────────

impl From<ucm_core::CmCoreError> for CmError {
    fn from(e: ucm_core::CmCoreError) -> Self {
        match e {
            ucm_core::CmCoreError::Malformed { message } => Self::MalformedMessage { message },
            ucm_core::CmCoreError::Version { found } => Self::MalformedMessage {
                message: format!("unsupported version {found}"),
            },
            ucm_core::CmCoreError::Length { len, max } => Self::InvalidParameter {
                message: format!("private data {len} bytes exceeds {max}"),
            },
            ucm_core::CmCoreError::InvalidState { state, op } => Self::InvalidState { state, op },
        }
    }
}

// ── Constructors ────────────────────────────────────────────────────────

impl CmError {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedMessage {
            message: message.into(),
        }
    }

    pub fn exhausted(resource: ResourceKind) -> Self {
        Self::ResourceExhausted { resource }
    }

    pub fn invalid_state(state: CmState, op: &'static str) -> Self {
        Self::InvalidState { state, op }
    }

    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::Timeout {
            timeout_ms: after.as_millis() as u64,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

// ── Predicates ──────────────────────────────────────────────────────────

impl CmError {
    /// Worth retrying the same call later.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
            ),
            Self::ResourceExhausted { .. } | Self::Timeout { .. } => true,
            _ => false,
        }
    }

    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::PeerRejected(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Closed | Self::Internal { .. })
    }
}
