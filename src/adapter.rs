//! Transport adapter: send ring, address-handle cache, and message framing
//! on top of a raw [`Transport`].

use crate::error::Result;
use crate::metrics::CmCounters;
use crate::send_ring::SendRing;
use crate::transport::{Addr, Transport};

use bytes::Bytes;
use dashmap::DashMap;
use std::io;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, trace};
use ucm_core::Message;

/// Resolved route to one destination.
///
/// Shared by every connection to the same peer through an
/// [`AddressCache`]; dropped with the last connection that uses it.
#[derive(Debug)]
pub struct AddressHandle<A: Addr> {
    addr: A,
    created: Instant,
}

impl<A: Addr> AddressHandle<A> {
    pub fn addr(&self) -> &A {
        &self.addr
    }

    pub fn age(&self) -> std::time::Duration {
        self.created.elapsed()
    }
}

/// Lazily populated destination → handle cache.
pub(crate) struct AddressCache<A: Addr> {
    handles: DashMap<A, Weak<AddressHandle<A>>>,
}

impl<A: Addr> AddressCache<A> {
    pub fn new() -> Self {
        Self {
            handles: DashMap::new(),
        }
    }

    pub fn resolve(&self, dest: &A) -> Arc<AddressHandle<A>> {
        let mut entry = self.handles.entry(dest.clone()).or_default();
        if let Some(ah) = entry.upgrade() {
            return ah;
        }
        trace!(%dest, "Creating address handle");
        let ah = Arc::new(AddressHandle {
            addr: dest.clone(),
            created: Instant::now(),
        });
        *entry = Arc::downgrade(&ah);
        ah
    }

    /// Drop the cache entry for `dest` if no connection holds its handle.
    pub fn purge(&self, dest: &A) {
        if self
            .handles
            .remove_if(dest, |_, weak| weak.strong_count() == 0)
            .is_some()
        {
            debug!(%dest, "Address handle destroyed");
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.handles.len()
    }
}

/// The CM's view of the transport.
pub(crate) struct CmTransport<T: Transport> {
    transport: Arc<T>,
    ring: SendRing,
    counters: Arc<CmCounters>,
}

impl<T: Transport> CmTransport<T> {
    pub fn new(transport: Arc<T>, slots: usize, burst: usize, counters: Arc<CmCounters>) -> Self {
        Self {
            transport,
            ring: SendRing::new(slots, burst),
            counters,
        }
    }

    /// Queue one message for `ah`. Failures are returned to the caller.
    pub async fn send(&self, ah: &AddressHandle<T::Addr>, msg: &Message) -> Result<()> {
        match self.ring.send(self.transport.as_ref(), msg, ah.addr()).await {
            Ok(()) => {
                self.counters.record_tx(msg.op);
                trace!(
                    peer = %ah.addr(),
                    op = msg.op.as_str(),
                    sport = msg.sport,
                    dport = msg.dport,
                    s_id = msg.s_id,
                    d_id = msg.d_id,
                    pd = msg.private_data.len(),
                    "CM send"
                );
                Ok(())
            }
            Err(e) => {
                self.counters.send_error();
                Err(e)
            }
        }
    }

    /// Receive one datagram.
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<(Bytes, T::Addr)> {
        let (n, from) = self.transport.recv_from(buf).await?;
        Ok((Bytes::copy_from_slice(&buf[..n]), from))
    }

    pub fn reclaim(&self) -> usize {
        self.ring.reclaim()
    }

    pub fn ring_stats(&self) -> (usize, usize) {
        self.ring.stats()
    }
}
