//! Protocol engine: carries out state-machine actions and routes inbound
//! datagrams to their connection objects.

use crate::adapter::CmTransport;
use crate::common::now;
use crate::config::CmConfig;
use crate::error::Result;
use crate::event::{CmEvent, ConnectionRequest};
use crate::handle::{CmKey, CmRef, CmResources, Connection};
use crate::listener::ListenerInner;
use crate::metrics::CmCounters;
use crate::registry::{Lookup, Registry};
use crate::transport::Transport;

use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tracing::{debug, error, info, trace, warn};
use ucm_core::{
    protocol_reject, random_session_id, CmAction, CmAddr, CmConn, CmCoreConfig, CmCoreError,
    CmEventKind, LocalEnd, Message, Opcode, ProtocolReason, Role,
};

/// State shared by the service handle and its worker task.
pub(crate) struct Shared<T: Transport> {
    pub config: CmConfig,
    pub core: CmCoreConfig,
    pub transport: CmTransport<T>,
    pub registry: Arc<Registry<T::Addr>>,
    pub resources: Arc<CmResources<T::Addr>>,
    pub counters: Arc<CmCounters>,
    /// Wakes the worker for an immediate scheduler pass
    pub wake: Arc<Notify>,
    pub local_addr: T::Addr,
    serial: AtomicU64,
}

impl<T: Transport> Shared<T> {
    pub fn new(transport: Arc<T>, config: CmConfig) -> Result<Self> {
        let local_addr = transport.local_addr()?;
        let counters = Arc::new(CmCounters::default());
        Ok(Self {
            core: CmCoreConfig::from(&config),
            transport: CmTransport::new(
                transport,
                config.send_slots,
                config.tx_burst,
                counters.clone(),
            ),
            registry: Arc::new(Registry::new()),
            resources: Arc::new(CmResources::new(counters.clone())),
            counters,
            wake: Arc::new(Notify::new()),
            local_addr,
            serial: AtomicU64::new(1),
            config,
        })
    }

    /// Build and count a new connection object.
    pub fn create_cm(
        &self,
        key: CmKey<T::Addr>,
        conn: CmConn,
        listener: Weak<ListenerInner<T::Addr>>,
        owned_port: Option<u16>,
    ) -> CmRef<T::Addr> {
        let serial = self.serial.fetch_add(1, Ordering::Relaxed);
        CmRef::create(
            serial,
            key,
            conn,
            listener,
            owned_port,
            self.resources.clone(),
        )
    }

    /// Carry out `actions` for `cm`, whose lock the caller holds as `conn`.
    ///
    /// Every action runs even if a send fails; the first send error is
    /// returned. `retry` marks timer-driven retransmissions.
    pub async fn execute(
        &self,
        cm: &CmRef<T::Addr>,
        conn: &CmConn,
        actions: Vec<CmAction>,
        retry: bool,
    ) -> Result<()> {
        let mut first_err = None;
        for action in actions {
            match action {
                CmAction::Send(msg) => {
                    let Some(ah) = cm.address_handle() else {
                        debug!(serial = cm.serial, op = msg.op.as_str(), "Send after destroy, dropped");
                        continue;
                    };
                    match self.transport.send(&ah, &msg).await {
                        Ok(()) => {
                            if retry {
                                self.counters.record_retry(msg.op);
                            }
                        }
                        Err(e) => {
                            error!(
                                serial = cm.serial,
                                peer = %cm.key.peer,
                                op = msg.op.as_str(),
                                error = %e,
                                "CM send failed"
                            );
                            first_err.get_or_insert(e);
                        }
                    }
                }
                CmAction::Raise(kind) => self.raise(cm, conn, kind),
                CmAction::WakeDisconnect => cm.wake_disconnect(),
                CmAction::Release => {
                    if cm.mark_freed() {
                        trace!(serial = cm.serial, state = %conn.state(), "Released");
                    }
                    self.wake.notify_one();
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Deliver an event to whoever owns `cm`: the listener for a new
    /// request, the linked endpoint for everything else.
    fn raise(&self, cm: &CmRef<T::Addr>, conn: &CmConn, kind: CmEventKind) {
        let info = cm.info(conn);
        match kind {
            CmEventKind::ConnectionRequestPending { private_data } => {
                let request = ConnectionRequest {
                    conn: Connection::new(cm.arc().clone()),
                    private_data,
                    info,
                };
                let delivered = match cm.listener.upgrade() {
                    Some(listener) => listener.deliver(request).is_ok(),
                    None => false,
                };
                if !delivered {
                    warn!(serial = cm.serial, peer = %cm.key.peer, "Listener gone, releasing request");
                    cm.mark_freed();
                    self.wake.notify_one();
                }
            }
            kind => {
                match &kind {
                    CmEventKind::Connected { .. } => {
                        info!(serial = cm.serial, peer = %cm.key.peer, role = ?cm.key.role, "Connection established")
                    }
                    CmEventKind::Disconnected => {
                        info!(serial = cm.serial, peer = %cm.key.peer, "Connection disconnected")
                    }
                    other => {
                        debug!(serial = cm.serial, peer = %cm.key.peer, event = other.name(), "Raising event")
                    }
                }
                let event = CmEvent { kind, info };
                let delivered = match cm.linked_endpoint() {
                    Some(ep) => ep.raise(event),
                    None => false,
                };
                if !delivered {
                    debug!(serial = cm.serial, "No endpoint linked, event dropped");
                }
            }
        }
    }

    /// Decode one datagram and apply it.
    pub async fn process_datagram(&self, data: Bytes, from: T::Addr) {
        let msg = match Message::decode(data) {
            Ok(msg) => msg,
            Err(CmCoreError::Version { found }) => {
                self.counters.bad_version();
                warn!(peer = %from, version = found, "Unsupported CM version, dropping");
                return;
            }
            Err(e) => {
                self.counters.malformed();
                warn!(peer = %from, error = %e, "Malformed CM message, dropping");
                return;
            }
        };
        self.counters.record_rx(msg.op);
        trace!(
            peer = %from,
            op = msg.op.as_str(),
            sport = msg.sport,
            dport = msg.dport,
            s_id = msg.s_id,
            d_id = msg.d_id,
            pd = msg.private_data.len(),
            "CM recv"
        );

        match self.registry.find(&msg, &from) {
            Lookup::Found(cm) => {
                let mut conn = cm.conn.lock().await;
                let actions = conn.on_message(&msg, now());
                if let Err(e) = self.execute(&cm, &conn, actions, false).await {
                    debug!(serial = cm.serial, error = %e, "Reply to inbound message failed");
                }
            }
            Lookup::Duplicate(cm) => {
                self.counters.dup_req();
                warn!(
                    serial = cm.serial,
                    peer = %from,
                    sport = msg.sport,
                    s_id = msg.s_id,
                    "Duplicate REQ, ignoring"
                );
            }
            Lookup::Listener(listener) => self.spawn_passive(listener, msg, from).await,
            Lookup::Unmatched => {
                self.counters.unmatched();
                warn!(
                    peer = %from,
                    op = msg.op.as_str(),
                    sport = msg.sport,
                    dport = msg.dport,
                    s_id = msg.s_id,
                    d_id = msg.d_id,
                    "No connection for message"
                );
                if msg.op == Opcode::Req {
                    self.send_unbound(&from, &protocol_reject(&msg, ProtocolReason::NoListener))
                        .await;
                }
            }
        }
    }

    /// Create the passive side for a new REQ and ask the listener.
    async fn spawn_passive(
        &self,
        listener: Arc<ListenerInner<T::Addr>>,
        req: Message,
        from: T::Addr,
    ) {
        let local = LocalEnd {
            port: listener.port,
            addr: CmAddr::new(self.config.lid, 0),
            session: random_session_id(),
            rd_in: self.config.max_rd_in,
        };
        let (conn, actions) = CmConn::passive(local, &req, self.core);
        let key = CmKey {
            local_port: listener.port,
            remote_port: req.sport,
            peer: from,
            remote_session: req.s_id,
            role: Role::Passive,
        };
        let cm = self.create_cm(key, conn, Arc::downgrade(&listener), None);
        self.registry.insert(cm.clone());

        let conn = cm.conn.lock().await;
        if let Err(e) = self.execute(&cm, &conn, actions, false).await {
            debug!(serial = cm.serial, error = %e, "Passive setup failed");
        }
    }

    /// Answer a message that has no connection object.
    async fn send_unbound(&self, to: &T::Addr, msg: &Message) {
        let ah = self.resources.cache.resolve(to);
        if let Err(e) = self.transport.send(&ah, msg).await {
            error!(peer = %to, op = msg.op.as_str(), error = %e, "CM send failed");
        }
        drop(ah);
        self.resources.cache.purge(to);
    }
}
