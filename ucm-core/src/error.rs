//! Error types for the UCM core state machine

use crate::conn::CmState;
use std::fmt;

/// Result type for UCM core operations
pub type CmCoreResult<T> = std::result::Result<T, CmCoreError>;

/// Errors produced by the codec and the connection state machine.
#[derive(Debug)]
pub enum CmCoreError {
    /// Datagram that cannot be decoded
    Malformed { message: String },
    /// Peer speaks a version below the supported minimum
    Version { found: u16 },
    /// Private data over the wire limit
    Length { len: usize, max: usize },
    /// Operation not permitted in the current state
    InvalidState { state: CmState, op: &'static str },
}

impl CmCoreError {
    pub fn malformed(message: impl Into<String>) -> Self {
        CmCoreError::Malformed {
            message: message.into(),
        }
    }

    pub fn length(len: usize, max: usize) -> Self {
        CmCoreError::Length { len, max }
    }

    pub fn invalid_state(state: CmState, op: &'static str) -> Self {
        CmCoreError::InvalidState { state, op }
    }

    /// Inbound-path errors: drop the datagram, log, carry on.
    pub fn is_inbound(&self) -> bool {
        matches!(
            self,
            CmCoreError::Malformed { .. } | CmCoreError::Version { .. }
        )
    }
}

impl fmt::Display for CmCoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CmCoreError::Malformed { message } => write!(f, "Malformed message: {message}"),
            CmCoreError::Version { found } => write!(f, "Unsupported protocol version {found}"),
            CmCoreError::Length { len, max } => {
                write!(f, "Private data too long: {len} bytes (max {max})")
            }
            CmCoreError::InvalidState { state, op } => {
                write!(f, "{op} not permitted in state {state}")
            }
        }
    }
}

impl std::error::Error for CmCoreError {}
