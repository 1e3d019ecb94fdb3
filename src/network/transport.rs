//! Transport abstraction and the UDP transport layer
//!
//! The coordinator runs one synchronous frame per tick, so [`Transport`] is a
//! non-blocking interface: sends go straight to the socket and inbound
//! datagrams are queued by background receive loops until [`Transport::recv`]
//! drains them.

use std::collections::{BTreeMap, HashMap};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::clock::Clock;
use crate::protocol::{Message, Packet, PacketFlags, PacketType, MAX_PAYLOAD_SIZE};

use super::error::NetworkError;
use super::sequence_tracker::SequenceTracker;

/// Timeout applied to a channel until `set_timeout` overrides it
pub const DEFAULT_CHANNEL_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between retransmissions of an unacknowledged reliable packet
pub const RESEND_INTERVAL: Duration = Duration::from_millis(200);

/// Reliable packets are dropped after this many transmissions
pub const MAX_SEND_ATTEMPTS: u32 = 30;

/// A decoded inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub from: SocketAddr,
    pub message: Message,
    /// Arrived outside any channel
    pub connectionless: bool,
}

/// Message transport used by the session coordinator
///
/// Channel traffic (`send`) only flows between addresses that opened a
/// channel to each other; anything arriving on a channel nobody opened is
/// dropped. Connectionless traffic always flows.
pub trait Transport {
    fn local_addr(&self) -> SocketAddr;

    /// Open a channel to `addr`. Opening an open channel is a no-op.
    fn open(&mut self, addr: SocketAddr);

    fn close(&mut self, addr: SocketAddr);

    fn is_open(&self, addr: SocketAddr) -> bool;

    fn send(&mut self, addr: SocketAddr, message: &Message, reliable: bool) -> Result<(), NetworkError>;

    fn send_connectionless(&mut self, addr: SocketAddr, message: &Message) -> Result<(), NetworkError>;

    /// Send a connectionless message to every listener on `port` in the local network
    fn broadcast(&mut self, port: u16, message: &Message) -> Result<(), NetworkError>;

    /// Next queued inbound message, if any
    fn recv(&mut self) -> Option<Inbound>;

    fn set_timeout(&mut self, addr: SocketAddr, timeout: Duration);

    /// Whether nothing has arrived on the channel for longer than its timeout
    fn is_timed_out(&self, addr: SocketAddr) -> bool;

    /// Retransmit unacknowledged reliable packets
    fn flush(&mut self);
}

struct PendingPacket {
    payload: Vec<u8>,
    last_sent: Duration,
    attempts: u32,
}

struct Channel {
    next_sequence: u32,
    received: SequenceTracker,
    pending: BTreeMap<u32, PendingPacket>,
    last_receive: Duration,
    timeout: Duration,
}

impl Channel {
    fn new(now: Duration) -> Self {
        Self {
            next_sequence: 0,
            received: SequenceTracker::new(),
            pending: BTreeMap::new(),
            last_receive: now,
            timeout: DEFAULT_CHANNEL_TIMEOUT,
        }
    }
}

/// Create a UDP socket with SO_REUSEADDR (and optionally SO_BROADCAST) enabled
fn bind_socket(addr: SocketAddr, broadcast: bool) -> Result<UdpSocket, NetworkError> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

    // Enable SO_REUSEADDR so several coordinators on one machine share the system-link port
    socket.set_reuse_address(true)?;
    if broadcast && addr.is_ipv4() {
        socket.set_broadcast(true)?;
    }

    // Set non-blocking mode for async operation
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

/// Spawn a loop forwarding raw datagrams from `socket` into `tx`
fn spawn_receive_loop(socket: Arc<UdpSocket>, tx: mpsc::Sender<(Vec<u8>, SocketAddr)>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, addr)) => {
                    trace!("Received {} bytes from {}", len, addr);
                    if tx.send((buf[..len].to_vec(), addr)).await.is_err() {
                        debug!("Receive channel closed, stopping receive loop");
                        break;
                    }
                }
                Err(e) => {
                    error!("Receive error: {}", e);
                }
            }
        }
    })
}

/// UDP transport with lightweight reliable channels
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    clock: Arc<dyn Clock>,
    channels: HashMap<SocketAddr, Channel>,
    inbound_tx: mpsc::Sender<(Vec<u8>, SocketAddr)>,
    inbound_rx: mpsc::Receiver<(Vec<u8>, SocketAddr)>,
    tasks: Vec<JoinHandle<()>>,
}

impl UdpTransport {
    /// Bind to a local address and start receiving.
    ///
    /// Must be called inside a tokio runtime.
    pub async fn bind(addr: &str, clock: Arc<dyn Clock>) -> Result<Self, NetworkError> {
        let parsed_addr: SocketAddr = addr.parse()?;
        let socket = Arc::new(bind_socket(parsed_addr, true)?);
        let local_addr = socket.local_addr()?;

        info!("UDP transport bound to {} (SO_REUSEADDR enabled)", local_addr);

        let (inbound_tx, inbound_rx) = mpsc::channel(1024);
        let task = spawn_receive_loop(socket.clone(), inbound_tx.clone());

        Ok(Self {
            socket,
            local_addr,
            clock,
            channels: HashMap::new(),
            inbound_tx,
            inbound_rx,
            tasks: vec![task],
        })
    }

    /// Listen for system-link broadcasts on `port`
    pub async fn listen_system_link(&mut self, port: u16) -> Result<(), NetworkError> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        let socket = Arc::new(bind_socket(addr, true)?);
        info!("Listening for system-link probes on {}", addr);
        self.tasks
            .push(spawn_receive_loop(socket, self.inbound_tx.clone()));
        Ok(())
    }

    fn timestamp(&self) -> u32 {
        self.clock.now().as_millis() as u32
    }

    fn send_packet(&self, packet: &Packet, addr: SocketAddr) -> Result<(), NetworkError> {
        let data = packet.to_bytes();
        match self.socket.try_send_to(&data, addr) {
            Ok(_) => {
                trace!("Sent {} bytes to {}", data.len(), addr);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(NetworkError::SendBufferFull),
            Err(e) => Err(e.into()),
        }
    }

    fn encode(message: &Message) -> Result<Vec<u8>, NetworkError> {
        let payload = message.encode()?;
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(NetworkError::PayloadTooLarge(payload.len()));
        }
        Ok(payload)
    }

    /// Turn a raw datagram into a message, handling acks and duplicates
    fn process_datagram(&mut self, data: &[u8], from: SocketAddr) -> Option<Inbound> {
        let packet = Packet::from_bytes(data)?;
        let now = self.clock.now();

        if packet.packet_type == PacketType::Connectionless {
            return decode_inbound(from, &packet.payload, true);
        }

        let timestamp = self.timestamp();
        let Some(channel) = self.channels.get_mut(&from) else {
            trace!("Dropping {:?} packet from {} (no channel)", packet.packet_type, from);
            return None;
        };
        channel.last_receive = now;

        match packet.packet_type {
            PacketType::Ack => {
                channel.pending.remove(&packet.sequence);
                None
            }
            PacketType::Reliable => {
                let fresh = channel.received.accept(packet.sequence);
                if let Err(e) = self.send_packet(&Packet::ack(packet.sequence, timestamp), from) {
                    debug!("Failed to ack {} to {}: {}", packet.sequence, from, e);
                }
                if !fresh {
                    trace!("Dropping duplicate {} from {}", packet.sequence, from);
                    return None;
                }
                decode_inbound(from, &packet.payload, false)
            }
            _ => decode_inbound(from, &packet.payload, false),
        }
    }
}

fn decode_inbound(from: SocketAddr, payload: &[u8], connectionless: bool) -> Option<Inbound> {
    match Message::decode(payload) {
        Ok(message) => Some(Inbound {
            from,
            message,
            connectionless,
        }),
        Err(e) => {
            warn!("Undecodable message from {}: {}", from, e);
            None
        }
    }
}

impl Transport for UdpTransport {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn open(&mut self, addr: SocketAddr) {
        let now = self.clock.now();
        self.channels.entry(addr).or_insert_with(|| {
            debug!("Opening channel to {}", addr);
            Channel::new(now)
        });
    }

    fn close(&mut self, addr: SocketAddr) {
        if self.channels.remove(&addr).is_some() {
            debug!("Closed channel to {}", addr);
        }
    }

    fn is_open(&self, addr: SocketAddr) -> bool {
        self.channels.contains_key(&addr)
    }

    fn send(&mut self, addr: SocketAddr, message: &Message, reliable: bool) -> Result<(), NetworkError> {
        let payload = Self::encode(message)?;
        let now = self.clock.now();
        let timestamp = self.timestamp();
        let channel = self
            .channels
            .get_mut(&addr)
            .ok_or(NetworkError::NotConnected(addr))?;

        if !reliable {
            return self.send_packet(&Packet::unreliable(timestamp, payload), addr);
        }

        let sequence = channel.next_sequence;
        channel.next_sequence = channel.next_sequence.wrapping_add(1);
        channel.pending.insert(
            sequence,
            PendingPacket {
                payload: payload.clone(),
                last_sent: now,
                attempts: 1,
            },
        );

        // A failed first send is covered by the retransmit in flush()
        if let Err(e) = self.send_packet(&Packet::reliable(sequence, timestamp, payload), addr) {
            debug!("Reliable send to {} deferred: {}", addr, e);
        }
        Ok(())
    }

    fn send_connectionless(&mut self, addr: SocketAddr, message: &Message) -> Result<(), NetworkError> {
        let payload = Self::encode(message)?;
        self.send_packet(&Packet::connectionless(self.timestamp(), payload), addr)
    }

    fn broadcast(&mut self, port: u16, message: &Message) -> Result<(), NetworkError> {
        let payload = Self::encode(message)?;
        let packet = Packet::connectionless(self.timestamp(), payload).with_flags(PacketFlags {
            broadcast: true,
            resend: false,
        });
        self.send_packet(&packet, SocketAddr::from((Ipv4Addr::BROADCAST, port)))
    }

    fn recv(&mut self) -> Option<Inbound> {
        while let Ok((data, from)) = self.inbound_rx.try_recv() {
            if let Some(inbound) = self.process_datagram(&data, from) {
                return Some(inbound);
            }
        }
        None
    }

    fn set_timeout(&mut self, addr: SocketAddr, timeout: Duration) {
        if let Some(channel) = self.channels.get_mut(&addr) {
            debug!("Setting timeout for {}: {:?}", addr, timeout);
            channel.timeout = timeout;
        }
    }

    fn is_timed_out(&self, addr: SocketAddr) -> bool {
        let now = self.clock.now();
        self.channels
            .get(&addr)
            .map(|channel| now.saturating_sub(channel.last_receive) > channel.timeout)
            .unwrap_or(false)
    }

    fn flush(&mut self) {
        let now = self.clock.now();
        let timestamp = self.timestamp();
        let mut resends = Vec::new();

        for (addr, channel) in self.channels.iter_mut() {
            channel.pending.retain(|sequence, pending| {
                if now.saturating_sub(pending.last_sent) < RESEND_INTERVAL {
                    return true;
                }
                if pending.attempts >= MAX_SEND_ATTEMPTS {
                    warn!("Giving up on reliable packet {} to {}", sequence, addr);
                    return false;
                }
                pending.attempts += 1;
                pending.last_sent = now;
                resends.push((
                    *addr,
                    Packet::reliable(*sequence, timestamp, pending.payload.clone()).with_flags(
                        PacketFlags {
                            broadcast: false,
                            resend: true,
                        },
                    ),
                ));
                true
            });
        }

        for (addr, packet) in resends {
            if let Err(e) = self.send_packet(&packet, addr) {
                debug!("Resend to {} failed: {}", addr, e);
            }
        }
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
