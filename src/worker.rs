//! The CM worker task: receive path, retry scheduler and completion
//! reclamation in one `select!` loop.

use crate::common::{now, wake_at};
use crate::engine::Shared;
use crate::scheduler;
use crate::transport::Transport;

use std::io;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Receive buffer; larger than any valid message so oversize datagrams
/// are caught by the codec instead of being truncated into valid ones.
const RECV_BUF_SIZE: usize = 2048;

pub(crate) async fn run_cm_worker<T: Transport>(
    shared: Arc<Shared<T>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let tick = shared.config.effective_tick();
    let batch = shared.config.recv_batch;
    let mut buf = vec![0u8; RECV_BUF_SIZE];
    let mut next_deadline = None;
    let mut received = 0usize;

    info!(addr = %shared.local_addr, ?tick, "CM worker started");

    loop {
        let wake = tokio::time::Instant::from_std(wake_at(next_deadline, now(), tick));

        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }

            _ = tokio::time::sleep_until(wake) => {}

            _ = shared.wake.notified() => {}

            result = shared.transport.recv(&mut buf) => match result {
                Ok((data, from)) => {
                    shared.process_datagram(data, from).await;
                    received += 1;
                    if received >= batch {
                        received = 0;
                        tokio::task::yield_now().await;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                    error!(error = %e, "Transport detached, stopping CM worker");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "CM receive failed");
                }
            },
        }

        next_deadline = scheduler::run_pass(&shared, now()).await;
    }

    drain(&shared).await;
    info!(addr = %shared.local_addr, "CM worker stopped");
}

/// Release every linked object and close every listener.
async fn drain<T: Transport>(shared: &Shared<T>) {
    let listeners = shared.registry.clear_listeners();
    drop(listeners);

    let linked = shared.registry.drain();
    debug!(count = linked.len(), "Draining connections");
    for cm in &linked {
        cm.mark_freed();
        cm.conn.lock().await.free();
        cm.wake_disconnect();
    }
    drop(linked);
}
