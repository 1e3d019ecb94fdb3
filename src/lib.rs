//! huddle - Serverless multiplayer session coordination
//!
//! This library runs the lifecycle of a peer-hosted game session: creating
//! and finding sessions, the lobby with teams and slots, the pregame
//! countdown, loading and stats barriers, and host migration when the host
//! drops out.

pub mod clock;
pub mod network;
pub mod protocol;
pub mod session;

pub use clock::{Clock, ManualClock, SystemClock};
pub use network::{MemoryNetwork, Transport, UdpTransport};
pub use protocol::Message;
pub use session::{CoordinatorConfig, CoordinatorState, NotificationSink, NotifyKind, SessionCoordinator};
