//! Session coordination
//!
//! Membership, admission, teams, phase barriers and host migration for a
//! small peer-hosted game session. [`SessionCoordinator`] drives everything;
//! the other modules are its building blocks.

pub mod config;
mod coordinator;
pub mod directory;
pub mod error;
pub mod notify;
pub mod record;
pub mod registry;
pub mod teams;

pub use config::{CoordinatorConfig, LocalPlayer, DEFAULT_SYSTEM_LINK_PORT};
pub use coordinator::{
    ping_quality, CoordinatorState, InviteState, MigrationState, PingQuality, SearchResult,
    SessionCoordinator, SessionInfo, SessionInvite, DEFAULT_GAME_SIZE, DEFAULT_TEAM_COUNT,
};
pub use directory::{DirectoryClient, DirectoryService, MemoryDirectory};
pub use error::{DirectoryError, SessionError};
pub use notify::{NotificationSink, NotifyKind, RecordingSink, SinkEvent, StorageStatus};
pub use record::{RecordState, SessionRecord, SlotCounts};
pub use registry::{ClientRegistry, Participant, SlotKind};
