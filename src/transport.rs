//! Abstract datagram transport for the connection manager
//!
//! The [`Transport`] trait lets the CM run over any async, unreliable
//! datagram service. [`UdpTransport`] is backed by `tokio::net::UdpSocket`;
//! [`MemoryNetwork`] is an in-process network with fault injection, used by
//! the tests and benchmarks.

use std::fmt::{Debug, Display};
use std::future::Future;
use std::hash::Hash;
use std::io;

/// Marker trait for address types used by [`Transport`] implementations.
///
/// Any type satisfying the required bounds automatically implements `Addr`
/// via the blanket impl. This keeps bound lists short elsewhere.
pub trait Addr: Clone + Eq + Hash + Send + Sync + Debug + Display + 'static {}

impl<T: Clone + Eq + Hash + Send + Sync + Debug + Display + 'static> Addr for T {}

/// Async datagram transport used by [`CmService`](crate::service::CmService).
///
/// Delivery and ordering are not assumed: the CM supplies its own
/// retransmission and duplicate suppression.
pub trait Transport: Send + Sync + 'static {
    /// The address type used to identify peers.
    type Addr: Addr;

    /// Send `buf` to `target`, returning the number of bytes written.
    fn send_to<'a>(
        &'a self,
        buf: &'a [u8],
        target: &'a Self::Addr,
    ) -> impl Future<Output = io::Result<usize>> + Send + 'a;

    /// Receive a datagram into `buf`, returning `(bytes_read, source_address)`.
    fn recv_from<'a>(
        &'a self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = io::Result<(usize, Self::Addr)>> + Send + 'a;

    /// Return the local address this transport is bound to.
    fn local_addr(&self) -> io::Result<Self::Addr>;
}

// ---------------------------------------------------------------------------
// UdpTransport: default implementation backed by tokio::net::UdpSocket
// ---------------------------------------------------------------------------

mod udp {
    use super::*;
    use std::net::SocketAddr;
    use tokio::net::UdpSocket;

    /// Default [`Transport`] implementation wrapping a `tokio::net::UdpSocket`.
    pub struct UdpTransport {
        socket: UdpSocket,
    }

    impl UdpTransport {
        /// Bind a new UDP socket to `addr`.
        pub async fn bind(addr: impl tokio::net::ToSocketAddrs) -> io::Result<Self> {
            let socket = UdpSocket::bind(addr).await?;
            Ok(Self { socket })
        }

        /// Wrap an existing `UdpSocket`.
        pub fn new(socket: UdpSocket) -> Self {
            Self { socket }
        }
    }

    impl Transport for UdpTransport {
        type Addr = SocketAddr;

        async fn send_to(&self, buf: &[u8], target: &SocketAddr) -> io::Result<usize> {
            self.socket.send_to(buf, target).await
        }

        async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            self.socket.recv_from(buf).await
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            self.socket.local_addr()
        }
    }
}

pub use udp::UdpTransport;

// ---------------------------------------------------------------------------
// MemoryNetwork: in-process datagrams with loss / duplication
// ---------------------------------------------------------------------------

mod memory {
    use super::*;
    use bytes::Bytes;
    use dashmap::DashMap;
    use parking_lot::Mutex;
    use rand::Rng;
    use std::fmt;
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tracing::trace;
    use ucm_core::Opcode;

    /// Address of a node on a [`MemoryNetwork`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct MemoryAddr(pub u32);

    impl fmt::Display for MemoryAddr {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "mem:{}", self.0)
        }
    }

    /// A datagram in flight, as seen by a fault filter.
    pub struct Datagram<'a> {
        pub from: MemoryAddr,
        pub to: MemoryAddr,
        pub data: &'a [u8],
    }

    impl Datagram<'_> {
        /// Opcode of a CM message, if the payload carries one.
        pub fn opcode(&self) -> Option<Opcode> {
            let raw = self.data.get(2..4)?;
            Opcode::from_u16(u16::from_be_bytes([raw[0], raw[1]]))
        }
    }

    /// What the network does with one datagram.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Verdict {
        Deliver,
        Drop,
        Duplicate,
    }

    type Filter = Box<dyn Fn(&Datagram<'_>) -> Verdict + Send + Sync>;

    struct Faults {
        loss_rate: f64,
        duplicate_rate: f64,
        filter: Option<Filter>,
    }

    struct NetInner {
        nodes: DashMap<MemoryAddr, mpsc::UnboundedSender<(Bytes, MemoryAddr)>>,
        next_addr: AtomicU32,
        faults: Mutex<Faults>,
        delivered: AtomicU64,
        dropped: AtomicU64,
    }

    /// In-process unreliable datagram network.
    ///
    /// Every [`MemoryTransport`] bound on the same network can reach every
    /// other one. Loss and duplication are applied on send, either randomly
    /// or through a filter closure.
    #[derive(Clone)]
    pub struct MemoryNetwork {
        inner: Arc<NetInner>,
    }

    impl Default for MemoryNetwork {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MemoryNetwork {
        pub fn new() -> Self {
            Self {
                inner: Arc::new(NetInner {
                    nodes: DashMap::new(),
                    next_addr: AtomicU32::new(1),
                    faults: Mutex::new(Faults {
                        loss_rate: 0.0,
                        duplicate_rate: 0.0,
                        filter: None,
                    }),
                    delivered: AtomicU64::new(0),
                    dropped: AtomicU64::new(0),
                }),
            }
        }

        /// Attach a new node with a fresh address.
        pub fn bind(&self) -> MemoryTransport {
            let addr = MemoryAddr(self.inner.next_addr.fetch_add(1, Ordering::Relaxed));
            let (tx, rx) = mpsc::unbounded_channel();
            self.inner.nodes.insert(addr, tx);
            MemoryTransport {
                addr,
                rx: tokio::sync::Mutex::new(rx),
                net: self.clone(),
            }
        }

        /// Probability in `[0.0, 1.0]` that a datagram is silently dropped.
        pub fn set_loss_rate(&self, rate: f64) {
            self.inner.faults.lock().loss_rate = rate.clamp(0.0, 1.0);
        }

        /// Probability in `[0.0, 1.0]` that a datagram is delivered twice.
        pub fn set_duplicate_rate(&self, rate: f64) {
            self.inner.faults.lock().duplicate_rate = rate.clamp(0.0, 1.0);
        }

        /// Decide the fate of each datagram with `filter`. Takes precedence
        /// over the random rates.
        pub fn set_filter(&self, filter: impl Fn(&Datagram<'_>) -> Verdict + Send + Sync + 'static) {
            self.inner.faults.lock().filter = Some(Box::new(filter));
        }

        pub fn clear_filter(&self) {
            self.inner.faults.lock().filter = None;
        }

        /// Deliver raw bytes as if `from` had sent them, bypassing faults.
        pub fn inject(&self, from: MemoryAddr, to: MemoryAddr, data: Bytes) -> bool {
            self.deliver(from, to, data)
        }

        /// (delivered, dropped) datagram counts
        pub fn stats(&self) -> (u64, u64) {
            (
                self.inner.delivered.load(Ordering::Relaxed),
                self.inner.dropped.load(Ordering::Relaxed),
            )
        }

        fn verdict(&self, dgram: &Datagram<'_>) -> Verdict {
            let faults = self.inner.faults.lock();
            if let Some(filter) = &faults.filter {
                return filter(dgram);
            }
            let mut rng = rand::thread_rng();
            if faults.loss_rate > 0.0 && rng.gen_bool(faults.loss_rate) {
                Verdict::Drop
            } else if faults.duplicate_rate > 0.0 && rng.gen_bool(faults.duplicate_rate) {
                Verdict::Duplicate
            } else {
                Verdict::Deliver
            }
        }

        fn deliver(&self, from: MemoryAddr, to: MemoryAddr, data: Bytes) -> bool {
            let sent = match self.inner.nodes.get(&to) {
                Some(tx) => tx.send((data, from)).is_ok(),
                None => false,
            };
            if sent {
                self.inner.delivered.fetch_add(1, Ordering::Relaxed);
            } else {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            }
            sent
        }

        fn send(&self, from: MemoryAddr, to: MemoryAddr, buf: &[u8]) {
            let verdict = self.verdict(&Datagram {
                from,
                to,
                data: buf,
            });
            trace!(%from, %to, len = buf.len(), ?verdict, "Memory datagram");
            match verdict {
                Verdict::Deliver => {
                    self.deliver(from, to, Bytes::copy_from_slice(buf));
                }
                Verdict::Duplicate => {
                    let data = Bytes::copy_from_slice(buf);
                    self.deliver(from, to, data.clone());
                    self.deliver(from, to, data);
                }
                Verdict::Drop => {
                    self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// One node on a [`MemoryNetwork`].
    pub struct MemoryTransport {
        addr: MemoryAddr,
        rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Bytes, MemoryAddr)>>,
        net: MemoryNetwork,
    }

    impl MemoryTransport {
        pub fn addr(&self) -> MemoryAddr {
            self.addr
        }

        pub fn network(&self) -> &MemoryNetwork {
            &self.net
        }
    }

    impl Transport for MemoryTransport {
        type Addr = MemoryAddr;

        async fn send_to(&self, buf: &[u8], target: &MemoryAddr) -> io::Result<usize> {
            self.net.send(self.addr, *target, buf);
            Ok(buf.len())
        }

        async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, MemoryAddr)> {
            let mut rx = self.rx.lock().await;
            match rx.recv().await {
                Some((data, from)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    Ok((n, from))
                }
                None => Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "memory node detached",
                )),
            }
        }

        fn local_addr(&self) -> io::Result<MemoryAddr> {
            Ok(self.addr)
        }
    }

    impl Drop for MemoryTransport {
        fn drop(&mut self) {
            self.net.inner.nodes.remove(&self.addr);
        }
    }

}

pub use memory::{Datagram, MemoryAddr, MemoryNetwork, MemoryTransport, Verdict};
