//! Bounded ring of reusable send slots.
//!
//! Every outgoing CM message is encoded into one of `slots` fixed buffers.
//! A slot leaves the idle pool when a send starts and is parked on the
//! completion queue once the transport has taken the datagram. Parked slots
//! return to the pool on every `tx_burst`-th send, whenever the pool runs
//! dry, and on each worker pass. A send that finds every slot in flight
//! fails at once with `ResourceExhausted`.

use crate::error::{CmError, ResourceKind, Result};
use crate::transport::Transport;

use bytes::BytesMut;
use crossbeam_queue::ArrayQueue;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use ucm_core::constants::UCM_MAX_MSG_SIZE;
use ucm_core::Message;

pub(crate) struct SendRing {
    idle: ArrayQueue<BytesMut>,
    completed: ArrayQueue<BytesMut>,
    posted: AtomicU64,
    burst: u64,
}

/// A slot out of the idle pool. Parked for reclaim when dropped, so a
/// cancelled send still gives its slot back.
struct Posted<'a> {
    ring: &'a SendRing,
    slot: Option<BytesMut>,
}

impl Drop for Posted<'_> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            let _ = self.ring.completed.push(slot);
        }
    }
}

impl SendRing {
    pub fn new(slots: usize, burst: usize) -> Self {
        let slots = slots.max(1);
        let idle = ArrayQueue::new(slots);
        for _ in 0..slots {
            let _ = idle.push(BytesMut::with_capacity(UCM_MAX_MSG_SIZE));
        }
        Self {
            idle,
            completed: ArrayQueue::new(slots),
            posted: AtomicU64::new(0),
            burst: burst.max(1) as u64,
        }
    }

    fn take_slot(&self) -> Result<BytesMut> {
        if let Some(slot) = self.idle.pop() {
            return Ok(slot);
        }
        self.reclaim();
        self.idle
            .pop()
            .ok_or_else(|| CmError::exhausted(ResourceKind::SendSlots))
    }

    /// Encode `msg` into a free slot and send it.
    pub async fn send<T: Transport>(
        &self,
        transport: &T,
        msg: &Message,
        target: &T::Addr,
    ) -> Result<()> {
        let mut slot = self.take_slot()?;
        slot.clear();
        if let Err(e) = msg.encode(&mut slot) {
            let _ = self.idle.push(slot);
            return Err(e.into());
        }

        let posted = Posted {
            ring: self,
            slot: Some(slot),
        };
        let result = transport
            .send_to(posted.slot.as_deref().unwrap_or(&[]), target)
            .await;
        drop(posted);

        if (self.posted.fetch_add(1, Ordering::Relaxed) + 1) % self.burst == 0 {
            self.reclaim();
        }

        match result {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                Err(CmError::exhausted(ResourceKind::Transport))
            }
            Err(e) => Err(CmError::Io(e)),
        }
    }

    /// Return completed slots to the idle pool.
    pub fn reclaim(&self) -> usize {
        let mut n = 0;
        while let Some(slot) = self.completed.pop() {
            let _ = self.idle.push(slot);
            n += 1;
        }
        n
    }

    /// (idle, awaiting reclaim)
    pub fn stats(&self) -> (usize, usize) {
        (self.idle.len(), self.completed.len())
    }
}
