//! Session coordination messages
//!
//! Every message travels as the bincode payload of a [`Packet`](super::Packet).
//! System-link search and reply are connectionless; everything else rides a
//! per-peer channel.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use super::types::{MachineId, PlayerId, PlayerSlot, SessionAdvert, SessionMeta, SessionProperties};

/// Result code carried by a join response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinResult {
    Approved,
    ApprovedJoinInProgress,
    Full,
    NotHosting,
    /// Not an answer to a join: the host changed session properties
    ModifySession,
}

/// Lockstep phase checkpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Checkpoint {
    Pregame,
    Lobby,
    Connect,
    LoadingComplete,
    ReportStats,
    ReportingComplete,
    Postgame,
    ChangeTeam,
    Disconnect,
}

/// Host migration message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrateKind {
    /// New host announces itself
    Hosting,
    /// Client confirms it switched to the new host
    Migrated,
    /// New host is still migrating; clients keep waiting
    Standby,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub machine_id: MachineId,
    pub invited: bool,
    pub players: Vec<PlayerSlot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinResponse {
    pub result: JoinResult,
    pub meta: SessionMeta,
}

/// Membership of one participant. Empty `players` means the participant was removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub machine_id: MachineId,
    pub addr: Option<SocketAddr>,
    pub invited: bool,
    pub players: Vec<PlayerSlot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Migrate {
    pub kind: MigrateKind,
    pub machine_id: MachineId,
    pub new_host_addr: Option<SocketAddr>,
    pub meta: SessionMeta,
}

/// Players muted by one remote player
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutelist {
    pub player: PlayerId,
    pub muted: Vec<PlayerId>,
}

/// Message envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    SystemLinkSearch {
        nonce: u64,
        criteria: SessionProperties,
    },
    SystemLinkReply {
        nonce: u64,
        advert: SessionAdvert,
    },
    JoinRequest(JoinRequest),
    JoinResponse(JoinResponse),
    MemberInfo(MemberInfo),
    Checkpoint(Checkpoint),
    Migrate(Migrate),
    Mutelist(Mutelist),
    RegisterResponse {
        machine_id: MachineId,
    },
    Heartbeat,
}

impl Message {
    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Message::SystemLinkSearch { .. } => "SystemLinkSearch",
            Message::SystemLinkReply { .. } => "SystemLinkReply",
            Message::JoinRequest(_) => "JoinRequest",
            Message::JoinResponse(_) => "JoinResponse",
            Message::MemberInfo(_) => "MemberInfo",
            Message::Checkpoint(_) => "Checkpoint",
            Message::Migrate(_) => "Migrate",
            Message::Mutelist(_) => "Mutelist",
            Message::RegisterResponse { .. } => "RegisterResponse",
            Message::Heartbeat => "Heartbeat",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}
