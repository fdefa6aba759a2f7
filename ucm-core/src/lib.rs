//! Pure synchronous UCM connection manager core.
//!
//! This crate holds the wire codec and the per-connection state machine with
//! no runtime dependencies: no tokio, no async, no I/O. It only depends on
//! `bytes` and `tracing`.
//!
//! ```text
//! ┌──────────────────────────────┐
//! │  ucm-core                    │
//! │                              │
//! │  protocol  ← wire codec      │
//! │  config    ← retry timers    │
//! │  error     ← 4 variants      │
//! │  conn      ← state machine   │
//! └──────────────────────────────┘
//! ```

pub mod config;
pub mod conn;
pub mod error;
pub mod protocol;

pub use config::{CmCoreConfig, PhaseTimer};
pub use conn::{CmAction, CmConn, CmEventKind, CmState, LocalEnd, Role, TimerPoll};
pub use error::{CmCoreError, CmCoreResult};
pub use protocol::*;
