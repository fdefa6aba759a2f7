//! Connection registry: the active-connection list, the listener table and
//! the service-id space they share.
//!
//! Lock order is registry before connection. Nothing here awaits, and no
//! connection lock is ever taken while a registry lock is held.

use crate::error::{CmError, ResourceKind, Result};
use crate::handle::CmRef;
use crate::listener::ListenerInner;
use crate::transport::Addr;

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;
use ucm_core::{Message, Opcode, Role};

// ── Port space ──────────────────────────────────────────────────────────

const PORT_WORDS: usize = (u16::MAX as usize + 1) / 64;

/// Bitmap of reserved service ids. Id 0 is never handed out.
pub(crate) struct PortSpace {
    bits: Mutex<Box<[u64; PORT_WORDS]>>,
}

impl PortSpace {
    pub fn new() -> Self {
        Self {
            bits: Mutex::new(Box::new([0u64; PORT_WORDS])),
        }
    }

    /// Reserve `port`, or the highest free id when `port` is 0.
    pub fn reserve(&self, port: u16) -> Result<u16> {
        let mut bits = self.bits.lock();
        if port != 0 {
            let (word, bit) = Self::slot(port);
            if bits[word] & bit != 0 {
                return Err(CmError::ConnQualInUse { port });
            }
            bits[word] |= bit;
            debug!(port, "Reserved service id");
            return Ok(port);
        }

        for port in (1..=u16::MAX).rev() {
            let (word, bit) = Self::slot(port);
            if bits[word] == u64::MAX {
                continue;
            }
            if bits[word] & bit == 0 {
                bits[word] |= bit;
                debug!(port, "Allocated service id");
                return Ok(port);
            }
        }
        Err(CmError::exhausted(ResourceKind::Ports))
    }

    pub fn release(&self, port: u16) {
        let (word, bit) = Self::slot(port);
        self.bits.lock()[word] &= !bit;
        debug!(port, "Released service id");
    }

    #[cfg(test)]
    pub fn is_reserved(&self, port: u16) -> bool {
        let (word, bit) = Self::slot(port);
        self.bits.lock()[word] & bit != 0
    }

    fn slot(port: u16) -> (usize, u64) {
        (port as usize / 64, 1u64 << (port % 64))
    }
}

// ── Registry ────────────────────────────────────────────────────────────

/// Where an inbound message belongs.
pub(crate) enum Lookup<A: Addr> {
    Found(CmRef<A>),
    /// A REQ retransmission for a connection that already exists
    Duplicate(CmRef<A>),
    /// A new REQ for a listening service id
    Listener(Arc<ListenerInner<A>>),
    Unmatched,
}

pub(crate) struct Registry<A: Addr> {
    active: Mutex<Vec<CmRef<A>>>,
    listeners: DashMap<u16, Arc<ListenerInner<A>>>,
}

impl<A: Addr> Registry<A> {
    pub fn new() -> Self {
        Self {
            active: Mutex::new(Vec::new()),
            listeners: DashMap::new(),
        }
    }

    /// Link `cm`; the registry keeps the passed reference.
    pub fn insert(&self, cm: CmRef<A>) {
        self.active.lock().push(cm);
    }

    /// Resolve the owner of `msg` received from `from`.
    pub fn find(&self, msg: &Message, from: &A) -> Lookup<A> {
        {
            let active = self.active.lock();
            for cm in active.iter() {
                let key = &cm.key;
                if key.local_port != msg.dport || key.remote_port != msg.sport || key.peer != *from
                {
                    continue;
                }
                if msg.op == Opcode::Req {
                    if key.role == Role::Passive && key.remote_session == msg.s_id {
                        return Lookup::Duplicate(cm.clone());
                    }
                    // Same tuple, new session: a fresh request.
                    continue;
                }
                if key.role == Role::Passive && key.remote_session != msg.s_id {
                    continue;
                }
                return Lookup::Found(cm.clone());
            }
        }

        if msg.op == Opcode::Req {
            if let Some(listener) = self.listeners.get(&msg.dport) {
                return Lookup::Listener(listener.value().clone());
            }
        }
        Lookup::Unmatched
    }

    /// Transient references to every linked object.
    pub fn snapshot(&self) -> Vec<CmRef<A>> {
        self.active.lock().clone()
    }

    /// Unlink every object flagged for release. The caller drops the
    /// returned references outside the registry lock.
    pub fn unlink_freed(&self) -> Vec<CmRef<A>> {
        let mut active = self.active.lock();
        let mut removed = Vec::new();
        let mut i = 0;
        while i < active.len() {
            if active[i].is_freed() {
                removed.push(active.swap_remove(i));
            } else {
                i += 1;
            }
        }
        removed
    }

    /// Unlink everything.
    pub fn drain(&self) -> Vec<CmRef<A>> {
        std::mem::take(&mut *self.active.lock())
    }

    pub fn len(&self) -> usize {
        self.active.lock().len()
    }

    // -- Listener table --

    pub fn add_listener(&self, listener: Arc<ListenerInner<A>>) -> Result<()> {
        let port = listener.port;
        match self.listeners.entry(port) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(CmError::ConnQualInUse { port }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(listener);
                Ok(())
            }
        }
    }

    /// Remove the listener on `port`. Requests it spawned that were never
    /// accepted are flagged for release.
    pub fn remove_listener(&self, port: u16) -> Option<Arc<ListenerInner<A>>> {
        let (_, listener) = self.listeners.remove(&port)?;
        let mut orphaned = 0;
        for cm in self.active.lock().iter() {
            let spawned = std::ptr::eq(cm.listener.as_ptr(), Arc::as_ptr(&listener));
            if spawned && cm.linked_endpoint().is_none() && cm.mark_freed() {
                orphaned += 1;
            }
        }
        if orphaned > 0 {
            debug!(port, orphaned, "Released unaccepted requests");
        }
        Some(listener)
    }

    pub fn listener_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.listeners.iter().map(|l| *l.key()).collect();
        ports.sort_unstable();
        ports
    }

    pub fn clear_listeners(&self) -> Vec<Arc<ListenerInner<A>>> {
        let ports: Vec<u16> = self.listeners.iter().map(|l| *l.key()).collect();
        ports
            .into_iter()
            .filter_map(|port| self.listeners.remove(&port).map(|(_, l)| l))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{CmKey, CmResources};
    use crate::metrics::CmCounters;
    use bytes::Bytes;
    use std::sync::Weak;
    use ucm_core::{CmAddr, CmConn, CmCoreConfig, LocalEnd};

    #[test]
    fn test_port_space() {
        let ports = PortSpace::new();
        assert_eq!(ports.reserve(0).unwrap(), 0xffff);
        assert_eq!(ports.reserve(0).unwrap(), 0xfffe);
        assert_eq!(ports.reserve(100).unwrap(), 100);
        assert!(matches!(
            ports.reserve(100),
            Err(CmError::ConnQualInUse { port: 100 })
        ));
        ports.release(0xffff);
        assert_eq!(ports.reserve(0).unwrap(), 0xffff);
        ports.release(100);
        assert!(!ports.is_reserved(100));
    }

    fn passive(
        resources: &Arc<CmResources<String>>,
        peer: &str,
        sport: u16,
        s_id: u32,
    ) -> CmRef<String> {
        let mut req = Message::new(Opcode::Req);
        req.sport = sport;
        req.dport = 10;
        req.s_id = s_id;
        let local = LocalEnd {
            port: 10,
            addr: CmAddr::new(1, 0),
            session: 0x77,
            rd_in: 4,
        };
        let (conn, _) = CmConn::passive(local, &req, CmCoreConfig::default());
        let key = CmKey {
            local_port: 10,
            remote_port: sport,
            peer: peer.to_string(),
            remote_session: s_id,
            role: Role::Passive,
        };
        CmRef::create(s_id as u64, key, conn, Weak::new(), None, resources.clone())
    }

    fn inbound(op: Opcode, sport: u16, s_id: u32) -> Message {
        let mut msg = Message::new(op);
        msg.sport = sport;
        msg.dport = 10;
        msg.s_id = s_id;
        msg.d_id = 0x77;
        msg.private_data = Bytes::new();
        msg
    }

    #[test]
    fn test_find_and_duplicates() {
        let resources = Arc::new(CmResources::new(Arc::new(CmCounters::default())));
        let reg = Registry::new();
        reg.insert(passive(&resources, "a", 500, 1));
        let peer = "a".to_string();

        assert!(matches!(
            reg.find(&inbound(Opcode::Req, 500, 1), &peer),
            Lookup::Duplicate(_)
        ));
        assert!(matches!(
            reg.find(&inbound(Opcode::Rtu, 500, 1), &peer),
            Lookup::Found(_)
        ));
        // New session on the same tuple, no listener: unmatched.
        assert!(matches!(
            reg.find(&inbound(Opcode::Req, 500, 2), &peer),
            Lookup::Unmatched
        ));
        assert!(matches!(
            reg.find(&inbound(Opcode::Rtu, 500, 2), &peer),
            Lookup::Unmatched
        ));
        assert!(matches!(
            reg.find(&inbound(Opcode::Rtu, 500, 1), &"b".to_string()),
            Lookup::Unmatched
        ));
    }

    #[test]
    fn test_unlink_freed() {
        let resources = Arc::new(CmResources::new(Arc::new(CmCounters::default())));
        let reg = Registry::new();
        let a = passive(&resources, "a", 500, 1);
        let b = passive(&resources, "b", 501, 2);
        reg.insert(a.clone());
        reg.insert(b.clone());
        drop(b);

        a.mark_freed();
        let removed = reg.unlink_freed();
        assert_eq!(removed.len(), 1);
        assert_eq!(reg.len(), 1);
        drop(removed);
        drop(a);
        assert_eq!(resources.counters.snapshot().destroyed, 1);

        drop(reg.drain());
        assert_eq!(resources.counters.snapshot().destroyed, 2);
    }
}
