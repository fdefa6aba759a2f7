//! Listening service ids

use crate::event::ConnectionRequest;
use crate::handle::CmResources;
use crate::registry::Registry;
use crate::transport::Addr;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::info;

/// Table entry for one listener. Dropping the last one closes the request
/// channel.
pub(crate) struct ListenerInner<A: Addr> {
    pub port: u16,
    requests: mpsc::UnboundedSender<ConnectionRequest<A>>,
}

impl<A: Addr> ListenerInner<A> {
    /// Hand a request to the application. Gives it back if the listener
    /// is gone.
    pub fn deliver(
        &self,
        request: ConnectionRequest<A>,
    ) -> std::result::Result<(), ConnectionRequest<A>> {
        self.requests.send(request).map_err(|e| e.0)
    }
}

/// A service id accepting inbound connection requests.
///
/// Requests arrive through [`next_request`](Self::next_request) and are
/// answered with [`CmService::accept`](crate::service::CmService::accept)
/// or [`CmService::reject`](crate::service::CmService::reject). Dropping
/// the listener stops it.
pub struct Listener<A: Addr> {
    port: u16,
    requests: mpsc::UnboundedReceiver<ConnectionRequest<A>>,
    registry: Arc<Registry<A>>,
    resources: Arc<CmResources<A>>,
    wake: Arc<Notify>,
    stopped: AtomicBool,
}

impl<A: Addr> Listener<A> {
    /// Reserve `port` (any free id when 0) and register a listener on it.
    pub(crate) fn start(
        port: u16,
        registry: Arc<Registry<A>>,
        resources: Arc<CmResources<A>>,
        wake: Arc<Notify>,
    ) -> crate::error::Result<Self> {
        let port = resources.ports.reserve(port)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ListenerInner { port, requests: tx });
        if let Err(e) = registry.add_listener(inner) {
            resources.ports.release(port);
            return Err(e);
        }
        info!(port, "Listening");
        Ok(Self {
            port,
            requests: rx,
            registry,
            resources,
            wake,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Wait for the next inbound request. `None` once the listener has been
    /// stopped or the service has shut down.
    pub async fn next_request(&mut self) -> Option<ConnectionRequest<A>> {
        self.requests.recv().await
    }

    pub fn try_next_request(&mut self) -> Option<ConnectionRequest<A>> {
        self.requests.try_recv().ok()
    }

    /// Stop listening and release the service id. Requests not yet
    /// accepted are released as well.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.registry.remove_listener(self.port).is_some() {
            info!(port = self.port, "Listener stopped");
            self.wake.notify_one();
        }
        self.resources.ports.release(self.port);
    }
}

impl<A: Addr> Drop for Listener<A> {
    fn drop(&mut self) {
        self.stop();
    }
}
