//! Network error types

use std::net::SocketAddr;

use thiserror::Error;

/// Errors that can occur in the network subsystem
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("No channel open to {0}")]
    NotConnected(SocketAddr),

    #[error("Payload of {0} bytes exceeds the packet limit")]
    PayloadTooLarge(usize),

    #[error("Send buffer full")]
    SendBufferFull,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid packet")]
    InvalidPacket,

    #[error("Message codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),
}
