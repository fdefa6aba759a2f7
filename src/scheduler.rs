//! Retry/timeout scheduler.
//!
//! One pass visits every linked connection once: released objects are moved
//! to `Free`, expired phases are retransmitted or exhausted, and the
//! earliest remaining deadline is reported back to the worker.

use crate::engine::Shared;
use crate::transport::Transport;

use std::time::Instant;
use tracing::{debug, trace};

/// Run one scheduler pass at `now`. Returns the earliest pending deadline.
pub(crate) async fn run_pass<T: Transport>(shared: &Shared<T>, now: Instant) -> Option<Instant> {
    let snapshot = shared.registry.snapshot();
    let mut next: Option<Instant> = None;
    let mut fired = 0usize;

    for cm in &snapshot {
        let mut conn = cm.conn.lock().await;
        if cm.is_freed() {
            if !conn.state().is_terminal() {
                debug!(serial = cm.serial, state = %conn.state(), "Released mid-protocol, freeing");
            }
            conn.free();
            continue;
        }

        let poll = conn.on_timer(now);
        fired += poll.actions.len();
        if !poll.actions.is_empty() {
            // Failures are counted and logged; the next expiry retries.
            let _ = shared.execute(cm, &conn, poll.actions, true).await;
        }
        if let Some(deadline) = poll.next_deadline {
            next = Some(next.map_or(deadline, |n| n.min(deadline)));
        }
    }
    drop(snapshot);

    let removed = shared.registry.unlink_freed();
    let unlinked = removed.len();
    drop(removed);

    let reclaimed = shared.transport.reclaim();
    if fired > 0 || unlinked > 0 {
        trace!(
            linked = shared.registry.len(),
            fired,
            unlinked,
            reclaimed,
            "Scheduler pass"
        );
    }
    next
}
