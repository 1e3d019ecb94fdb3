//! Network module for session traffic
//!
//! Handles the transport abstraction, UDP channels with reliable delivery,
//! and the in-process network used by tests and embedders.

mod error;
mod memory;
mod sequence_tracker;
mod transport;

pub use error::NetworkError;
pub use memory::{MemoryNetwork, MemoryTransport};
pub use sequence_tracker::SequenceTracker;
pub use transport::{
    Inbound, Transport, UdpTransport, DEFAULT_CHANNEL_TIMEOUT, MAX_SEND_ATTEMPTS, RESEND_INTERVAL,
};
