//! In-process transport
//!
//! [`MemoryNetwork`] routes messages between [`MemoryTransport`] endpoints
//! without touching a socket. Delivery is instant and lossless unless two
//! endpoints are partitioned; channel timeouts follow the shared clock.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::trace;

use crate::clock::Clock;
use crate::protocol::Message;

use super::error::NetworkError;
use super::transport::{Inbound, Transport, DEFAULT_CHANNEL_TIMEOUT};

#[derive(Default)]
struct NetworkInner {
    queues: HashMap<SocketAddr, VecDeque<Inbound>>,
    /// Unordered pairs that cannot reach each other
    partitions: HashSet<(SocketAddr, SocketAddr)>,
    isolated: HashSet<SocketAddr>,
}

impl NetworkInner {
    fn blocked(&self, a: SocketAddr, b: SocketAddr) -> bool {
        self.isolated.contains(&a)
            || self.isolated.contains(&b)
            || self.partitions.contains(&ordered(a, b))
    }

    fn deliver(&mut self, inbound: Inbound, to: SocketAddr) {
        if self.blocked(inbound.from, to) {
            trace!("Partition drops {} from {} to {}", inbound.message.name(), inbound.from, to);
            return;
        }
        if let Some(queue) = self.queues.get_mut(&to) {
            queue.push_back(inbound);
        }
    }
}

fn ordered(a: SocketAddr, b: SocketAddr) -> (SocketAddr, SocketAddr) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Shared in-memory network. Clones share the same routing table.
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
    clock: Arc<dyn Clock>,
}

impl MemoryNetwork {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(NetworkInner::default())),
            clock,
        }
    }

    /// Attach a new endpoint at `addr`
    pub fn endpoint(&self, addr: SocketAddr) -> MemoryTransport {
        self.inner.lock().queues.entry(addr).or_default();
        MemoryTransport {
            network: self.clone(),
            addr,
            channels: HashMap::new(),
        }
    }

    /// Stop all traffic between `a` and `b`
    pub fn partition(&self, a: SocketAddr, b: SocketAddr) {
        self.inner.lock().partitions.insert(ordered(a, b));
    }

    pub fn heal(&self, a: SocketAddr, b: SocketAddr) {
        self.inner.lock().partitions.remove(&ordered(a, b));
    }

    /// Cut `addr` off from everyone
    pub fn isolate(&self, addr: SocketAddr) {
        self.inner.lock().isolated.insert(addr);
    }

    /// Number of messages waiting for `addr`
    pub fn queued(&self, addr: SocketAddr) -> usize {
        self.inner
            .lock()
            .queues
            .get(&addr)
            .map(VecDeque::len)
            .unwrap_or(0)
    }
}

struct MemoryChannel {
    last_receive: Duration,
    timeout: Duration,
}

/// One endpoint on a [`MemoryNetwork`]
pub struct MemoryTransport {
    network: MemoryNetwork,
    addr: SocketAddr,
    channels: HashMap<SocketAddr, MemoryChannel>,
}

impl MemoryTransport {
    fn push(&self, to: SocketAddr, message: &Message, connectionless: bool) {
        let inbound = Inbound {
            from: self.addr,
            message: message.clone(),
            connectionless,
        };
        self.network.inner.lock().deliver(inbound, to);
    }
}

impl Transport for MemoryTransport {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn open(&mut self, addr: SocketAddr) {
        let now = self.network.clock.now();
        self.channels.entry(addr).or_insert(MemoryChannel {
            last_receive: now,
            timeout: DEFAULT_CHANNEL_TIMEOUT,
        });
    }

    fn close(&mut self, addr: SocketAddr) {
        self.channels.remove(&addr);
    }

    fn is_open(&self, addr: SocketAddr) -> bool {
        self.channels.contains_key(&addr)
    }

    fn send(&mut self, addr: SocketAddr, message: &Message, _reliable: bool) -> Result<(), NetworkError> {
        if !self.channels.contains_key(&addr) {
            return Err(NetworkError::NotConnected(addr));
        }
        self.push(addr, message, false);
        Ok(())
    }

    fn send_connectionless(&mut self, addr: SocketAddr, message: &Message) -> Result<(), NetworkError> {
        self.push(addr, message, true);
        Ok(())
    }

    fn broadcast(&mut self, port: u16, message: &Message) -> Result<(), NetworkError> {
        let mut inner = self.network.inner.lock();
        let targets: Vec<SocketAddr> = inner
            .queues
            .keys()
            .filter(|addr| addr.port() == port && **addr != self.addr)
            .copied()
            .collect();
        for to in targets {
            let inbound = Inbound {
                from: self.addr,
                message: message.clone(),
                connectionless: true,
            };
            inner.deliver(inbound, to);
        }
        Ok(())
    }

    fn recv(&mut self) -> Option<Inbound> {
        loop {
            let inbound = self.network.inner.lock().queues.get_mut(&self.addr)?.pop_front()?;
            if inbound.connectionless {
                return Some(inbound);
            }
            let now = self.network.clock.now();
            match self.channels.get_mut(&inbound.from) {
                Some(channel) => {
                    channel.last_receive = now;
                    return Some(inbound);
                }
                None => trace!("Dropping {} from {} (no channel)", inbound.message.name(), inbound.from),
            }
        }
    }

    fn set_timeout(&mut self, addr: SocketAddr, timeout: Duration) {
        if let Some(channel) = self.channels.get_mut(&addr) {
            channel.timeout = timeout;
        }
    }

    fn is_timed_out(&self, addr: SocketAddr) -> bool {
        let now = self.network.clock.now();
        self.channels
            .get(&addr)
            .map(|channel| now.saturating_sub(channel.last_receive) > channel.timeout)
            .unwrap_or(false)
    }

    fn flush(&mut self) {}
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.network.inner.lock().queues.remove(&self.addr);
    }
}
