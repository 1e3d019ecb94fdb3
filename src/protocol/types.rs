//! Identity and session description types shared by the wire protocol
//! and the session coordinator.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum local players on one participant machine
pub const MAX_PLAYERS_PER_PARTICIPANT: usize = 4;

/// Team index meaning "not placed on a team yet"
pub const NO_TEAM: i32 = -1;

/// Most teams a session may have
pub const MAX_TEAMS: u32 = 64;

/// Team count clamped to `1..=MAX_TEAMS`
pub fn clamp_team_count(teams: u32) -> u32 {
    teams.clamp(1, MAX_TEAMS)
}

/// Game size property (total slots, public + private)
pub const PROPERTY_GAME_SIZE: &str = "PROPERTY_GAME_SIZE";
/// Number of teams property
pub const PROPERTY_NUMBER_OF_TEAMS: &str = "PROPERTY_NUMBER_OF_TEAMS";
/// Private slot count. Not a search criterion.
pub const PROPERTY_PRIVATE_SLOTS: &str = "PROPERTY_PRIVATE_SLOTS";
/// Maximum game time, mirrored into the host advertisement
pub const PROPERTY_MAX_GAME_TIME: &str = "PROPERTY_MAX_GAME_TIME";
/// Scenario context, mirrored into the host advertisement
pub const CONTEXT_SCENARIO: &str = "CONTEXT_SCENARIO";

/// Stable id of a participant machine.
///
/// Ordering matters: host migration picks the largest id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct MachineId(pub u64);

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Identity token of a single player. `PlayerId(0)` is never a real player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct PlayerId(pub u64);

impl PlayerId {
    pub const NONE: PlayerId = PlayerId(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Advertised session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Voice status shown next to a player in the lobby
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VoiceState {
    #[default]
    Off,
    Idle,
    Talking,
}

/// One player on a participant machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerSlot {
    pub id: PlayerId,
    pub name: String,
    pub team: i32,
    pub voice: VoiceState,
    pub ready: bool,
}

impl PlayerSlot {
    pub fn new(id: PlayerId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            team: NO_TEAM,
            voice: VoiceState::Off,
            ready: false,
        }
    }
}

/// Searchable description of a session: contexts, integer properties and flags
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionProperties {
    pub contexts: BTreeMap<String, String>,
    pub properties: BTreeMap<String, i64>,
    /// Membership must be verified by the directory before play counts
    pub arbitrated: bool,
}

impl SessionProperties {
    pub fn with_context(mut self, id: &str, value: &str) -> Self {
        self.contexts.insert(id.to_string(), value.to_string());
        self
    }

    pub fn with_property(mut self, id: &str, value: i64) -> Self {
        self.properties.insert(id.to_string(), value);
        self
    }

    pub fn arbitrated(mut self, arbitrated: bool) -> Self {
        self.arbitrated = arbitrated;
        self
    }

    pub fn property(&self, id: &str) -> Option<i64> {
        self.properties.get(id).copied()
    }

    pub fn context(&self, id: &str) -> Option<&str> {
        self.contexts.get(id).map(String::as_str)
    }

    /// Whether `self` satisfies every criterion in `criteria`.
    /// Private slot count is not a search criterion.
    pub fn matches(&self, criteria: &SessionProperties) -> bool {
        let contexts_match = criteria
            .contexts
            .iter()
            .all(|(k, v)| self.contexts.get(k) == Some(v));
        let properties_match = criteria
            .properties
            .iter()
            .filter(|(k, _)| k.as_str() != PROPERTY_PRIVATE_SLOTS)
            .all(|(k, v)| self.properties.get(k) == Some(v));
        contexts_match && properties_match && self.arbitrated == criteria.arbitrated
    }
}

/// Whether the advertised game is waiting in the lobby or already running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GameState {
    #[default]
    InLobby,
    InProgress,
}

/// Data a host hands back to searching clients
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HostData {
    pub host_name: String,
    pub host_player: PlayerId,
    pub game_state: GameState,
    pub game_time: i64,
    pub scenario: String,
}

/// A discoverable session as seen by searching clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionAdvert {
    pub session_id: SessionId,
    pub host_addr: SocketAddr,
    pub open_public: u32,
    pub open_private: u32,
    pub filled_public: u32,
    pub filled_private: u32,
    pub total_teams: u32,
    pub host_data: HostData,
    pub properties: SessionProperties,
}

impl SessionAdvert {
    pub fn total_public(&self) -> u32 {
        self.open_public + self.filled_public
    }

    pub fn total_private(&self) -> u32 {
        self.open_private + self.filled_private
    }
}

/// Session description a host sends along with join and migrate messages
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionMeta {
    pub host_id: MachineId,
    pub session_id: SessionId,
    pub nonce: u64,
    pub arbitrated: bool,
    /// Index of the host's player that owns the session
    pub owner_index: u8,
    pub total_teams: u32,
    /// Teams assigned to the joiner's players, in player order
    pub teams: Vec<i32>,
    pub properties: SessionProperties,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_properties_match_ignores_private_slots() {
        let advertised = SessionProperties::default()
            .with_context(CONTEXT_SCENARIO, "harbor")
            .with_property(PROPERTY_GAME_SIZE, 8)
            .with_property(PROPERTY_PRIVATE_SLOTS, 2);
        let criteria = SessionProperties::default()
            .with_context(CONTEXT_SCENARIO, "harbor")
            .with_property(PROPERTY_PRIVATE_SLOTS, 0);

        assert!(advertised.matches(&criteria));
    }

    #[test]
    fn test_properties_mismatch() {
        let advertised = SessionProperties::default().with_context(CONTEXT_SCENARIO, "harbor");
        let criteria = SessionProperties::default().with_context(CONTEXT_SCENARIO, "canyon");
        assert!(!advertised.matches(&criteria));

        let ranked = SessionProperties::default().arbitrated(true);
        assert!(!advertised.matches(&ranked));
    }

    #[test]
    fn test_machine_id_ordering() {
        let mut ids = vec![MachineId(5), MachineId(12), MachineId(7)];
        ids.sort();
        assert_eq!(ids.last(), Some(&MachineId(12)));
    }

    #[test]
    fn test_new_player_is_unassigned() {
        let player = PlayerSlot::new(PlayerId(9), "Ana");
        assert_eq!(player.team, NO_TEAM);
        assert_eq!(player.voice, VoiceState::Off);
    }
}
