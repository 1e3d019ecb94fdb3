//! Packet framing for the huddle protocol
//!
//! Packet format (12-byte header):
//! - version: 1 byte
//! - type: 1 byte
//! - sequence: 4 bytes (big-endian, per-peer reliable sequence)
//! - timestamp: 4 bytes (big-endian, sender milliseconds)
//! - flags: 2 bytes
//!
//! The payload is a bincode-encoded [`Message`](super::Message); ack packets
//! carry no payload.

use serde::{Deserialize, Serialize};

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Header size in bytes
pub const HEADER_SIZE: usize = 12;

/// Maximum payload size (MTU - IP header - UDP header - our header)
/// 1500 - 20 - 8 - 12 = 1460 bytes
pub const MAX_PAYLOAD_SIZE: usize = 1460;

/// Packet types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum PacketType {
    /// Sent outside any channel (system-link probes and replies)
    Connectionless = 0x01,
    /// Channel message without delivery guarantee
    Unreliable = 0x02,
    /// Channel message retransmitted until acknowledged
    Reliable = 0x03,
    /// Acknowledges a reliable sequence number
    Ack = 0x04,
}

impl TryFrom<u8> for PacketType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(PacketType::Connectionless),
            0x02 => Ok(PacketType::Unreliable),
            0x03 => Ok(PacketType::Reliable),
            0x04 => Ok(PacketType::Ack),
            _ => Err(()),
        }
    }
}

/// Packet flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketFlags {
    /// Packet was sent to the broadcast address
    pub broadcast: bool,
    /// Reliable packet is a retransmission
    pub resend: bool,
}

impl PacketFlags {
    pub fn to_u16(self) -> u16 {
        let mut flags = 0u16;
        if self.broadcast {
            flags |= 0x0001;
        }
        if self.resend {
            flags |= 0x0002;
        }
        flags
    }

    pub fn from_u16(value: u16) -> Self {
        Self {
            broadcast: (value & 0x0001) != 0,
            resend: (value & 0x0002) != 0,
        }
    }
}

/// A network packet
#[derive(Debug, Clone)]
pub struct Packet {
    pub version: u8,
    pub packet_type: PacketType,
    pub sequence: u32,
    pub timestamp: u32,
    pub flags: PacketFlags,
    pub payload: Vec<u8>,
}

impl Packet {
    fn new(packet_type: PacketType, sequence: u32, timestamp: u32, payload: Vec<u8>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            packet_type,
            sequence,
            timestamp,
            flags: PacketFlags::default(),
            payload,
        }
    }

    /// Create a connectionless packet
    pub fn connectionless(timestamp: u32, payload: Vec<u8>) -> Self {
        Self::new(PacketType::Connectionless, 0, timestamp, payload)
    }

    /// Create an unreliable channel packet
    pub fn unreliable(timestamp: u32, payload: Vec<u8>) -> Self {
        Self::new(PacketType::Unreliable, 0, timestamp, payload)
    }

    /// Create a reliable channel packet
    pub fn reliable(sequence: u32, timestamp: u32, payload: Vec<u8>) -> Self {
        Self::new(PacketType::Reliable, sequence, timestamp, payload)
    }

    /// Create an acknowledgement for a reliable sequence
    pub fn ack(sequence: u32, timestamp: u32) -> Self {
        Self::new(PacketType::Ack, sequence, timestamp, Vec::new())
    }

    pub fn with_flags(mut self, flags: PacketFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Serialize the packet to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());

        buf.push(self.version);
        buf.push(self.packet_type as u8);
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.extend_from_slice(&self.flags.to_u16().to_be_bytes());
        buf.extend_from_slice(&self.payload);

        buf
    }

    /// Deserialize a packet from bytes
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_SIZE {
            return None;
        }

        let version = data[0];
        if version != PROTOCOL_VERSION {
            return None;
        }

        let packet_type = PacketType::try_from(data[1]).ok()?;
        let sequence = u32::from_be_bytes([data[2], data[3], data[4], data[5]]);
        let timestamp = u32::from_be_bytes([data[6], data[7], data[8], data[9]]);
        let flags = PacketFlags::from_u16(u16::from_be_bytes([data[10], data[11]]));
        let payload = data[HEADER_SIZE..].to_vec();

        Some(Self {
            version,
            packet_type,
            sequence,
            timestamp,
            flags,
            payload,
        })
    }
}
