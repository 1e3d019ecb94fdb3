//! Network protocol definitions
//!
//! Defines the packet framing and the session coordination messages.

mod message;
mod packet;
pub mod types;

pub use message::{
    Checkpoint, JoinRequest, JoinResponse, JoinResult, MemberInfo, Message, Migrate, MigrateKind,
    Mutelist,
};
pub use packet::{Packet, PacketFlags, PacketType, HEADER_SIZE, MAX_PAYLOAD_SIZE, PROTOCOL_VERSION};
pub use types::{
    GameState, HostData, MachineId, PlayerId, PlayerSlot, SessionAdvert, SessionId, SessionMeta,
    clamp_team_count, SessionProperties, VoiceState, CONTEXT_SCENARIO, MAX_PLAYERS_PER_PARTICIPANT, MAX_TEAMS, NO_TEAM,
    PROPERTY_GAME_SIZE, PROPERTY_MAX_GAME_TIME, PROPERTY_NUMBER_OF_TEAMS, PROPERTY_PRIVATE_SLOTS,
};
