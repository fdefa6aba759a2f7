//! Reference-counted connection objects.
//!
//! A [`CmInner`] wraps one [`CmConn`] state machine with everything the
//! runtime needs around it: the lookup key, the owner lock, the holder
//! count, the disconnect wait-object and the endpoint/listener back links.
//!
//! Holders own a [`CmRef`]. The registry, the linked endpoint and any
//! in-flight scan or dispatch each hold exactly one. The object is
//! destroyed when the last `CmRef` drops; dropping the second-to-last one
//! wakes anybody waiting to become the sole holder.
//!
//! [`Connection`] is the application's view of the object. It keeps the
//! memory alive but is not a holder: operations through it take a
//! transient reference, and fail once the object has been destroyed.

use crate::adapter::{AddressCache, AddressHandle};
use crate::endpoint::EndpointInner;
use crate::event::CmInfo;
use crate::listener::ListenerInner;
use crate::metrics::CmCounters;
use crate::registry::PortSpace;
use crate::transport::Addr;

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{watch, Mutex, Notify};
use tracing::debug;
use ucm_core::{CmConn, CmState, Role, SessionId};

/// Service-wide state a connection object needs to tear itself down.
pub(crate) struct CmResources<A: Addr> {
    pub ports: PortSpace,
    pub cache: AddressCache<A>,
    pub counters: Arc<CmCounters>,
}

impl<A: Addr> CmResources<A> {
    pub fn new(counters: Arc<CmCounters>) -> Self {
        Self {
            ports: PortSpace::new(),
            cache: AddressCache::new(),
            counters,
        }
    }
}

/// Registry lookup key. Fixed at creation.
#[derive(Debug, Clone)]
pub(crate) struct CmKey<A: Addr> {
    pub local_port: u16,
    pub remote_port: u16,
    pub peer: A,
    /// Peer session id; only known up front on the passive side.
    pub remote_session: SessionId,
    pub role: Role,
}

pub(crate) struct CmInner<A: Addr> {
    pub serial: u64,
    pub key: CmKey<A>,
    pub conn: Mutex<CmConn>,
    refs: AtomicUsize,
    freed: AtomicBool,
    destroyed: AtomicBool,
    last_ref: Notify,
    disconnected: watch::Sender<bool>,
    pub endpoint: parking_lot::Mutex<Weak<EndpointInner<A>>>,
    pub listener: Weak<ListenerInner<A>>,
    ah: parking_lot::Mutex<Option<Arc<AddressHandle<A>>>>,
    owned_port: Option<u16>,
    resources: Arc<CmResources<A>>,
}

impl<A: Addr> CmInner<A> {
    pub fn is_freed(&self) -> bool {
        self.freed.load(Ordering::Acquire)
    }

    /// Flag the object for release. The worker moves it to `Free` and drops
    /// the registry's reference on its next pass. Returns `false` if it was
    /// already flagged.
    pub fn mark_freed(&self) -> bool {
        !self.freed.swap(true, Ordering::AcqRel)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    pub fn address_handle(&self) -> Option<Arc<AddressHandle<A>>> {
        self.ah.lock().clone()
    }

    pub fn wake_disconnect(&self) {
        self.disconnected.send_replace(true);
    }

    pub fn subscribe_disconnect(&self) -> watch::Receiver<bool> {
        self.disconnected.subscribe()
    }

    pub fn linked_endpoint(&self) -> Option<Arc<EndpointInner<A>>> {
        self.endpoint.lock().upgrade()
    }

    pub fn info(&self, conn: &CmConn) -> CmInfo<A> {
        CmInfo::capture(self.serial, &self.key.peer, conn)
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(port) = self.owned_port {
            self.resources.ports.release(port);
        }
        drop(self.ah.lock().take());
        self.resources.cache.purge(&self.key.peer);
        self.resources.counters.destroyed();
        debug!(serial = self.serial, peer = %self.key.peer, "Connection object destroyed");
    }
}

/// One counted reference to a connection object.
pub(crate) struct CmRef<A: Addr> {
    inner: Arc<CmInner<A>>,
}

impl<A: Addr> CmRef<A> {
    /// Build a new object; the returned reference is its first holder.
    pub fn create(
        serial: u64,
        key: CmKey<A>,
        conn: CmConn,
        listener: Weak<ListenerInner<A>>,
        owned_port: Option<u16>,
        resources: Arc<CmResources<A>>,
    ) -> Self {
        let ah = resources.cache.resolve(&key.peer);
        resources.counters.created();
        debug!(
            serial,
            peer = %key.peer,
            role = ?key.role,
            local_port = key.local_port,
            remote_port = key.remote_port,
            "Connection object created"
        );
        let (disconnected, _) = watch::channel(false);
        Self {
            inner: Arc::new(CmInner {
                serial,
                key,
                conn: Mutex::new(conn),
                refs: AtomicUsize::new(1),
                freed: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
                last_ref: Notify::new(),
                disconnected,
                endpoint: parking_lot::Mutex::new(Weak::new()),
                listener,
                ah: parking_lot::Mutex::new(Some(ah)),
                owned_port,
                resources,
            }),
        }
    }

    /// Take a reference through an uncounted handle. `None` once the
    /// object has been destroyed.
    pub fn acquire(inner: &Arc<CmInner<A>>) -> Option<Self> {
        let mut n = inner.refs.load(Ordering::Acquire);
        loop {
            if n == 0 {
                return None;
            }
            match inner
                .refs
                .compare_exchange_weak(n, n + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    return Some(Self {
                        inner: inner.clone(),
                    })
                }
                Err(actual) => n = actual,
            }
        }
    }

    pub fn arc(&self) -> &Arc<CmInner<A>> {
        &self.inner
    }

    /// Resolve once this is the only remaining reference.
    pub async fn wait_last_ref(&self) {
        loop {
            let notified = self.inner.last_ref.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.refs.load(Ordering::Acquire) <= 1 {
                return;
            }
            notified.await;
        }
    }
}

impl<A: Addr> Clone for CmRef<A> {
    fn clone(&self) -> Self {
        self.inner.refs.fetch_add(1, Ordering::AcqRel);
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A: Addr> Deref for CmRef<A> {
    type Target = CmInner<A>;

    fn deref(&self) -> &CmInner<A> {
        &self.inner
    }
}

impl<A: Addr> Drop for CmRef<A> {
    fn drop(&mut self) {
        match self.inner.refs.fetch_sub(1, Ordering::AcqRel) {
            1 => self.inner.destroy(),
            2 => self.inner.last_ref.notify_waiters(),
            _ => {}
        }
    }
}

// ── Application handle ──────────────────────────────────────────────────

/// Application handle to one connection.
///
/// Cheap to clone. Holding a `Connection` does not keep the connection
/// registered; it only keeps its final state readable.
#[derive(Clone)]
pub struct Connection<A: Addr> {
    inner: Arc<CmInner<A>>,
}

impl<A: Addr> Connection<A> {
    pub(crate) fn new(inner: Arc<CmInner<A>>) -> Self {
        Self { inner }
    }

    pub(crate) fn acquire(&self) -> Option<CmRef<A>> {
        CmRef::acquire(&self.inner)
    }

    /// Process-unique object id
    pub fn id(&self) -> u64 {
        self.inner.serial
    }

    pub fn peer(&self) -> &A {
        &self.inner.key.peer
    }

    pub fn role(&self) -> Role {
        self.inner.key.role
    }

    pub fn local_port(&self) -> u16 {
        self.inner.key.local_port
    }

    pub fn remote_port(&self) -> u16 {
        self.inner.key.remote_port
    }

    pub async fn state(&self) -> CmState {
        self.inner.conn.lock().await.state()
    }

    pub async fn info(&self) -> CmInfo<A> {
        let conn = self.inner.conn.lock().await;
        self.inner.info(&conn)
    }

    /// The object has been released and no longer takes part in the
    /// protocol.
    pub fn is_released(&self) -> bool {
        self.inner.is_freed()
    }

    /// All holders are gone and the object's resources are returned.
    pub fn is_destroyed(&self) -> bool {
        self.inner.is_destroyed()
    }

    /// Resolve once teardown of this connection has completed.
    pub async fn wait_disconnected(&self) {
        let mut rx = self.inner.subscribe_disconnect();
        // The sender lives as long as `self.inner`.
        let _ = rx.wait_for(|done| *done).await;
    }
}

impl<A: Addr> fmt::Debug for Connection<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.serial)
            .field("peer", &self.inner.key.peer)
            .field("role", &self.inner.key.role)
            .field("local_port", &self.inner.key.local_port)
            .field("remote_port", &self.inner.key.remote_port)
            .finish()
    }
}
