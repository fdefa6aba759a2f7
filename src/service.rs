//! The connection manager service: application entry points.

use crate::common::now;
use crate::config::CmConfig;
use crate::endpoint::{Endpoint, EndpointAttrs};
use crate::engine::Shared;
use crate::error::{CmError, Result};
use crate::event::{CmInfo, ConnectionRequest};
use crate::handle::{CmKey, Connection};
use crate::listener::Listener;
use crate::metrics::CountersSnapshot;
use crate::transport::{Transport, UdpTransport};
use crate::worker::run_cm_worker;

use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use ucm_core::{random_session_id, CmAddr, CmConn, CmState, LocalEnd, Rejection, Role};

/// How [`CmService::disconnect`] waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CloseMode {
    /// Return as soon as the DREQ is queued.
    #[default]
    Graceful,
    /// Wait for teardown to finish, bounded by
    /// [`CmConfig::disconnect_wait`](crate::config::CmConfig::disconnect_wait).
    Abrupt,
}

/// Listeners and connection objects at one point in time.
#[derive(Debug, Clone)]
pub struct CmDump<A: crate::transport::Addr> {
    pub listeners: Vec<u16>,
    pub connections: Vec<CmInfo<A>>,
}

impl<A: crate::transport::Addr> fmt::Display for CmDump<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "UCM listeners: {}", self.listeners.len())?;
        for port in &self.listeners {
            writeln!(f, "  LISTEN {port:#x}")?;
        }
        writeln!(f, "UCM connections: {}", self.connections.len())?;
        for info in &self.connections {
            writeln!(f, "  {info}")?;
        }
        Ok(())
    }
}

/// User-mode connection manager bound to one datagram transport.
///
/// Owns a worker task that receives CM messages, drives retransmissions
/// and releases finished connection objects. Dropping the service stops
/// the worker.
pub struct CmService<T: Transport = UdpTransport> {
    shared: Arc<Shared<T>>,
    shutdown: watch::Sender<bool>,
    worker: parking_lot::Mutex<Option<JoinHandle<()>>>,
    next_qpn: AtomicU32,
}

// --- UDP-specific convenience methods ---

impl CmService<UdpTransport> {
    /// Bind a UDP socket and start a service on it.
    pub async fn bind(addr: SocketAddr, config: CmConfig) -> Result<Self> {
        let transport = UdpTransport::bind(addr).await?;
        Self::with_transport(Arc::new(transport), config)
    }
}

// --- Generic methods for any Transport ---

impl<T: Transport> CmService<T> {
    /// Start a service over a custom [`Transport`]. Must be called within a
    /// tokio runtime.
    pub fn with_transport(transport: Arc<T>, config: CmConfig) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(Shared::new(transport, config)?);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(run_cm_worker(shared.clone(), shutdown_rx));
        info!(addr = %shared.local_addr, "CM service started");
        Ok(Self {
            shared,
            shutdown,
            worker: parking_lot::Mutex::new(Some(worker)),
            next_qpn: AtomicU32::new(1),
        })
    }

    pub fn local_addr(&self) -> &T::Addr {
        &self.shared.local_addr
    }

    pub fn config(&self) -> &CmConfig {
        &self.shared.config
    }

    pub fn counters(&self) -> CountersSnapshot {
        self.shared.counters.snapshot()
    }

    /// (idle, awaiting reclaim) send slots
    pub fn send_ring_stats(&self) -> (usize, usize) {
        self.shared.transport.ring_stats()
    }

    fn ensure_running(&self) -> Result<()> {
        if *self.shutdown.borrow() {
            return Err(CmError::Closed);
        }
        Ok(())
    }

    /// Create an endpoint with a fresh queue number.
    pub fn create_endpoint(&self, attrs: EndpointAttrs) -> Endpoint<T::Addr> {
        let qpn = self.next_qpn.fetch_add(1, Ordering::Relaxed);
        let addr = CmAddr::new(self.shared.config.lid, qpn);
        debug!(%addr, max_rd_in = attrs.max_rd_in, "Endpoint created");
        Endpoint::new(addr, attrs, self.shared.wake.clone())
    }

    /// Listen on `port`; 0 picks a free service id.
    pub fn listen(&self, port: u16) -> Result<Listener<T::Addr>> {
        self.ensure_running()?;
        Listener::start(
            port,
            self.shared.registry.clone(),
            self.shared.resources.clone(),
            self.shared.wake.clone(),
        )
    }

    /// Refuse to reuse `ep` while its current connection is still live.
    /// A finished one is released.
    async fn ensure_unlinked(&self, ep: &Endpoint<T::Addr>, op: &'static str) -> Result<()> {
        let Some(current) = ep.linked() else {
            return Ok(());
        };
        if !current.is_freed() {
            let state = current.conn.lock().await.state();
            if !state.is_terminal() {
                return Err(CmError::invalid_state(state, op));
            }
        }
        drop(current);
        ep.unlink();
        Ok(())
    }

    /// Open a connection from `ep` to service id `remote_port` at `remote`.
    ///
    /// Returns once the REQ is queued. The outcome arrives on `ep` as
    /// `Connected`, `Rejected` or `Unreachable`.
    pub async fn connect(
        &self,
        ep: &Endpoint<T::Addr>,
        remote: T::Addr,
        remote_port: u16,
        private_data: Bytes,
    ) -> Result<Connection<T::Addr>> {
        self.ensure_running()?;
        if remote_port == 0 {
            return Err(CmError::invalid_parameter("remote service id must be non-zero"));
        }
        self.ensure_unlinked(ep, "connect").await?;

        let port = self.shared.resources.ports.reserve(0)?;
        let local = LocalEnd {
            port,
            addr: ep.addr(),
            session: random_session_id(),
            rd_in: ep.attrs().max_rd_in,
        };
        let conn = match CmConn::active(local, remote_port, private_data, self.shared.core) {
            Ok(conn) => conn,
            Err(e) => {
                self.shared.resources.ports.release(port);
                return Err(e.into());
            }
        };
        let key = CmKey {
            local_port: port,
            remote_port,
            peer: remote.clone(),
            remote_session: 0,
            role: Role::Active,
        };
        let cm = self.shared.create_cm(key, conn, Weak::new(), Some(port));
        ep.link(&cm);
        self.shared.registry.insert(cm.clone());

        let mut conn = cm.conn.lock().await;
        let sent = match conn.connect(now()) {
            Ok(actions) => self.shared.execute(&cm, &conn, actions, false).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = sent {
            warn!(peer = %remote, port = remote_port, error = %e, "Connect failed");
            conn.free();
            drop(conn);
            ep.unlink();
            return Err(e);
        }
        drop(conn);
        self.shared.wake.notify_one();

        info!(peer = %remote, port = remote_port, local_port = port, "Connecting");
        Ok(Connection::new(cm.arc().clone()))
    }

    /// Accept `req` on `ep`, answering with `private_data`.
    pub async fn accept(
        &self,
        req: &ConnectionRequest<T::Addr>,
        ep: &Endpoint<T::Addr>,
        private_data: Bytes,
    ) -> Result<()> {
        self.ensure_running()?;
        let cm = req
            .conn
            .acquire()
            .ok_or_else(|| CmError::invalid_state(CmState::Free, "accept"))?;
        self.ensure_unlinked(ep, "accept").await?;

        let mut conn = cm.conn.lock().await;
        if cm.is_freed() {
            return Err(CmError::invalid_state(conn.state(), "accept"));
        }
        let actions = conn.accept(ep.addr(), ep.attrs().max_rd_in, private_data, now())?;
        ep.link(&cm);
        let sent = self.shared.execute(&cm, &conn, actions, false).await;
        if let Err(e) = sent {
            warn!(peer = %cm.key.peer, error = %e, "Accept failed");
            conn.free();
            drop(conn);
            ep.unlink();
            return Err(e);
        }
        drop(conn);
        self.shared.wake.notify_one();
        debug!(serial = cm.serial, peer = %cm.key.peer, "Accepted");
        Ok(())
    }

    /// Refuse `req`. `reason` and `private_data` reach the requester's
    /// `Rejected` event.
    pub async fn reject(
        &self,
        req: &ConnectionRequest<T::Addr>,
        reason: u8,
        private_data: Bytes,
    ) -> Result<()> {
        self.ensure_running()?;
        let cm = req
            .conn
            .acquire()
            .ok_or_else(|| CmError::invalid_state(CmState::Free, "reject"))?;

        let mut conn = cm.conn.lock().await;
        if cm.is_freed() {
            return Err(CmError::invalid_state(conn.state(), "reject"));
        }
        let actions = conn.reject(Rejection::Consumer {
            reason,
            private_data,
        })?;
        let sent = self.shared.execute(&cm, &conn, actions, false).await;
        drop(conn);
        self.shared.wake.notify_one();
        debug!(serial = cm.serial, peer = %cm.key.peer, reason, "Rejected");
        sent
    }

    /// Tear `conn` down. Safe to call repeatedly: only the first call on a
    /// live connection does anything.
    pub async fn disconnect(&self, conn: &Connection<T::Addr>, mode: CloseMode) -> Result<()> {
        let Some(cm) = conn.acquire() else {
            return Ok(());
        };
        let mut done = cm.subscribe_disconnect();

        let mut guard = cm.conn.lock().await;
        let actions = guard.disconnect(now());
        let sent = self.shared.execute(&cm, &guard, actions, false).await;
        let state = guard.state();
        drop(guard);
        drop(cm);
        self.shared.wake.notify_one();
        sent?;

        if mode == CloseMode::Abrupt && state == CmState::DiscPending {
            let wait = self.shared.config.disconnect_wait;
            match tokio::time::timeout(wait, done.wait_for(|d| *d)).await {
                Ok(_) => {}
                Err(_) => {
                    warn!(peer = %conn.peer(), ?wait, "Abrupt disconnect timed out");
                    return Err(CmError::timeout(wait));
                }
            }
        }
        Ok(())
    }

    /// Snapshot of every linked connection object.
    pub async fn connections(&self) -> Vec<CmInfo<T::Addr>> {
        let snapshot = self.shared.registry.snapshot();
        let mut infos = Vec::with_capacity(snapshot.len());
        for cm in &snapshot {
            let conn = cm.conn.lock().await;
            infos.push(cm.info(&conn));
        }
        infos
    }

    pub fn listeners(&self) -> Vec<u16> {
        self.shared.registry.listener_ports()
    }

    /// Listeners and connections, printable with `{}`.
    pub async fn dump(&self) -> CmDump<T::Addr> {
        CmDump {
            listeners: self.listeners(),
            connections: self.connections().await,
        }
    }

    /// Stop the worker. Every connection object is released and every
    /// listener closed before this returns.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(error = %e, "CM worker ended abnormally");
            }
        }
        info!(addr = %self.shared.local_addr, "CM service shut down");
    }
}

impl<T: Transport> Drop for CmService<T> {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}
