//! # UCM - user-mode connection manager
//!
//! An async connection manager that establishes and tears down
//! point-to-point connections over an unreliable datagram transport.
//! The protocol is a reduced three-way handshake (REQ → REP → RTU), a
//! REJ for refusals, and a DREQ → DREP graceful close, with its own
//! retransmission timers and duplicate suppression.
//!
//! ## Features
//!
//! - **Sans-IO core**: the state machine and codec live in `ucm-core`
//! - **Any datagram transport**: UDP out of the box, plus an in-memory
//!   network with loss and duplication for tests
//! - **Reference-counted connection objects**: destroyed exactly once,
//!   after every holder lets go
//! - **Observability**: `tracing` spans and per-service counters
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use ucm_tokio::{CmConfig, CmService, EndpointAttrs};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = CmService::bind("127.0.0.1:0".parse()?, CmConfig::default()).await?;
//!     let client = CmService::bind("127.0.0.1:0".parse()?, CmConfig::default()).await?;
//!
//!     let mut listener = server.listen(0x100)?;
//!     let mut ep = client.create_endpoint(EndpointAttrs::default());
//!     client
//!         .connect(&ep, *server.local_addr(), 0x100, Bytes::from_static(b"hi"))
//!         .await?;
//!
//!     let req = listener.next_request().await.ok_or("listener closed")?;
//!     let server_ep = server.create_endpoint(EndpointAttrs::default());
//!     server.accept(&req, &server_ep, Bytes::new()).await?;
//!
//!     let event = ep.next_event().await.ok_or("endpoint closed")?;
//!     println!("{event}");
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────┐
//! │   Application API   │  CmService, Endpoint, Listener, Connection
//! ├─────────────────────┤
//! │   Protocol Engine   │  engine, registry, handle, scheduler
//! ├─────────────────────┤
//! │   Worker Task       │  receive path + retry pass (select! loop)
//! ├─────────────────────┤
//! │   Transport Adapter │  send ring, address cache, Transport trait
//! ├─────────────────────┤
//! │   ucm-core          │  codec + CmConn state machine (sync)
//! └─────────────────────┘
//! ```

pub(crate) mod adapter;
pub(crate) mod common;
pub(crate) mod engine;
pub(crate) mod handle;
pub(crate) mod registry;
pub(crate) mod scheduler;
pub(crate) mod send_ring;
pub(crate) mod worker;

pub mod config;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod listener;
pub mod metrics;
pub mod service;
pub mod transport;

// Re-exports
pub use adapter::AddressHandle;
pub use config::{CmConfig, PhaseTimer};
pub use endpoint::{Endpoint, EndpointAttrs};
pub use error::{CmError, ResourceKind, Result};
pub use event::{CmEvent, CmInfo, ConnectionRequest};
pub use handle::Connection;
pub use listener::Listener;
pub use metrics::{format_counters, CmCounters, CountersSnapshot};
pub use service::{CloseMode, CmDump, CmService};
pub use transport::{
    Addr, Datagram, MemoryAddr, MemoryNetwork, MemoryTransport, Transport, UdpTransport, Verdict,
};
pub use ucm_core::{
    CmAddr, CmEventKind, CmState, Message, Opcode, ProtocolReason, Rejection, Role, SessionId,
};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PROTOCOL_VERSION: u16 = ucm_core::constants::UCM_VERSION;
