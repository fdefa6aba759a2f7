//! Application endpoints.
//!
//! An [`Endpoint`] is one side of a data connection as the application sees
//! it. It is linked to at most one live connection object at a time and
//! holds a reference to it for as long as the link lasts. Lifecycle events
//! for the linked connection arrive through [`Endpoint::next_event`].

use crate::event::CmEvent;
use crate::handle::{CmRef, Connection};
use crate::transport::Addr;

use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace};
use ucm_core::CmAddr;

/// Local endpoint attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointAttrs {
    /// Largest number of outstanding reads this side accepts; negotiated
    /// down against the peer and the service maximum.
    pub max_rd_in: u8,
}

impl Default for EndpointAttrs {
    fn default() -> Self {
        Self { max_rd_in: 4 }
    }
}

pub(crate) struct EndpointInner<A: Addr> {
    pub addr: CmAddr,
    pub attrs: EndpointAttrs,
    events: mpsc::UnboundedSender<CmEvent<A>>,
    link: parking_lot::Mutex<Option<CmRef<A>>>,
}

impl<A: Addr> EndpointInner<A> {
    pub fn raise(&self, event: CmEvent<A>) -> bool {
        self.events.send(event).is_ok()
    }
}

/// One application endpoint.
pub struct Endpoint<A: Addr> {
    inner: Arc<EndpointInner<A>>,
    events: mpsc::UnboundedReceiver<CmEvent<A>>,
    wake: Arc<Notify>,
}

impl<A: Addr> Endpoint<A> {
    pub(crate) fn new(addr: CmAddr, attrs: EndpointAttrs, wake: Arc<Notify>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(EndpointInner {
                addr,
                attrs,
                events: tx,
                link: parking_lot::Mutex::new(None),
            }),
            events: rx,
            wake,
        }
    }

    /// Fabric address advertised to peers
    pub fn addr(&self) -> CmAddr {
        self.inner.addr
    }

    pub fn attrs(&self) -> EndpointAttrs {
        self.inner.attrs
    }

    /// Wait for the next lifecycle event.
    pub async fn next_event(&mut self) -> Option<CmEvent<A>> {
        self.events.recv().await
    }

    pub fn try_next_event(&mut self) -> Option<CmEvent<A>> {
        self.events.try_recv().ok()
    }

    /// The connection this endpoint is currently linked to.
    pub fn connection(&self) -> Option<Connection<A>> {
        self.inner
            .link
            .lock()
            .as_ref()
            .map(|cm| Connection::new(cm.arc().clone()))
    }

    pub(crate) fn linked(&self) -> Option<CmRef<A>> {
        self.inner.link.lock().clone()
    }

    /// Link `cm` to this endpoint: events for it are raised here, and the
    /// endpoint holds a reference until [`unlink`](Self::unlink).
    pub(crate) fn link(&self, cm: &CmRef<A>) {
        *cm.endpoint.lock() = Arc::downgrade(&self.inner);
        let previous = self.inner.link.lock().replace(cm.clone());
        drop(previous);
    }

    /// Drop the link without waiting, flagging the object for release.
    pub(crate) fn unlink(&self) {
        let link = self.inner.link.lock().take();
        if let Some(cm) = link {
            cm.mark_freed();
            self.wake.notify_one();
        }
    }

    /// Release the linked connection and wait until every other holder has
    /// let go of it, so the object is destroyed by the time this returns.
    pub async fn free(self) {
        let link = self.inner.link.lock().take();
        let Some(cm) = link else {
            return;
        };
        cm.mark_freed();
        self.wake.notify_one();
        trace!(serial = cm.serial, refs = cm.ref_count(), "Waiting for last reference");
        cm.wait_last_ref().await;
        debug!(serial = cm.serial, "Endpoint freed");
    }
}

impl<A: Addr> Drop for Endpoint<A> {
    fn drop(&mut self) {
        self.unlink();
    }
}
