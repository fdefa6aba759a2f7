//! Shared test helpers for CM integration tests

#![allow(dead_code)]

use bytes::Bytes;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use ucm_tokio::{
    CmConfig, CmEvent, CmService, Connection, ConnectionRequest, Endpoint, EndpointAttrs,
    Listener, MemoryAddr, MemoryNetwork, MemoryTransport, Transport,
};

pub type MemService = CmService<MemoryTransport>;
pub type FaultyService = CmService<FaultyTransport>;

/// Generous upper bound for any single expected event.
pub const WAIT: Duration = Duration::from_secs(30);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Two services on one in-memory network.
pub struct Pair {
    pub net: MemoryNetwork,
    pub server: MemService,
    pub client: MemService,
}

impl Pair {
    pub fn new(config: CmConfig) -> Self {
        Self::with_configs(config.clone(), config)
    }

    pub fn with_configs(server: CmConfig, client: CmConfig) -> Self {
        init_tracing();
        let net = MemoryNetwork::new();
        let server = CmService::with_transport(Arc::new(net.bind()), server).unwrap();
        let client = CmService::with_transport(Arc::new(net.bind()), client).unwrap();
        Self { net, server, client }
    }

    pub fn server_addr(&self) -> MemoryAddr {
        *self.server.local_addr()
    }

    pub fn client_addr(&self) -> MemoryAddr {
        *self.client.local_addr()
    }
}

/// A node on a [`MemoryNetwork`] whose sends can be slowed down or refused.
pub struct FaultyTransport {
    inner: MemoryTransport,
    refuse: AtomicBool,
    delay_ms: AtomicU64,
}

impl FaultyTransport {
    pub fn new(inner: MemoryTransport) -> Self {
        Self {
            inner,
            refuse: AtomicBool::new(false),
            delay_ms: AtomicU64::new(0),
        }
    }

    /// Fail every send with `WouldBlock` while set.
    pub fn refuse_sends(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Hold every send for `delay` before handing it to the network.
    pub fn delay_sends(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Transport for FaultyTransport {
    type Addr = MemoryAddr;

    async fn send_to(&self, buf: &[u8], target: &MemoryAddr) -> io::Result<usize> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.refuse.load(Ordering::SeqCst) {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        self.inner.send_to(buf, target).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, MemoryAddr)> {
        self.inner.recv_from(buf).await
    }

    fn local_addr(&self) -> io::Result<MemoryAddr> {
        self.inner.local_addr()
    }
}

/// Start a service on `net` behind a [`FaultyTransport`] the test can steer.
pub fn faulty_service(net: &MemoryNetwork, config: CmConfig) -> (FaultyService, Arc<FaultyTransport>) {
    init_tracing();
    let transport = Arc::new(FaultyTransport::new(net.bind()));
    let service = CmService::with_transport(transport.clone(), config).unwrap();
    (service, transport)
}

pub async fn next_event(ep: &mut Endpoint<MemoryAddr>) -> CmEvent<MemoryAddr> {
    timeout(WAIT, ep.next_event())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

pub async fn next_request(listener: &mut Listener<MemoryAddr>) -> ConnectionRequest<MemoryAddr> {
    timeout(WAIT, listener.next_request())
        .await
        .expect("timed out waiting for request")
        .expect("listener closed")
}

/// A connected pair of endpoints.
pub struct Established {
    pub listener: Listener<MemoryAddr>,
    pub client_ep: Endpoint<MemoryAddr>,
    pub server_ep: Endpoint<MemoryAddr>,
    pub client_conn: Connection<MemoryAddr>,
    pub server_conn: Connection<MemoryAddr>,
}

/// Connect the client to a listener on `port` and complete the handshake.
pub async fn establish(pair: &Pair, port: u16) -> Established {
    let mut listener = pair.server.listen(port).unwrap();
    let mut client_ep = pair.client.create_endpoint(EndpointAttrs::default());
    let mut server_ep = pair.server.create_endpoint(EndpointAttrs::default());

    let client_conn = pair
        .client
        .connect(&client_ep, pair.server_addr(), port, Bytes::new())
        .await
        .unwrap();
    let req = next_request(&mut listener).await;
    pair.server
        .accept(&req, &server_ep, Bytes::new())
        .await
        .unwrap();

    assert!(next_event(&mut client_ep).await.is_connected());
    assert!(next_event(&mut server_ep).await.is_connected());

    Established {
        listener,
        client_ep,
        server_ep,
        client_conn,
        server_conn: req.connection().clone(),
    }
}

/// Let the workers run until nothing is in flight.
pub async fn settle() {
    tokio::time::sleep(Duration::from_secs(5)).await;
}
