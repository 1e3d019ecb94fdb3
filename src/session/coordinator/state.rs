//! Coordinator states

use std::fmt;

/// Top-level coordinator state. Declaration order is meaningful: range
/// checks such as "at or past `AcceptingConnections`" follow it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum CoordinatorState {
    #[default]
    Initial,
    Creating,
    AcceptingConnections,
    Modifying,
    Searching,
    WaitingQos,
    Browsing,
    SessionConnecting,
    SessionConnected,
    Pregame,
    Loading,
    ConnectedToServer,
    GameLocked,
    InGame,
    ReportingStats,
    Postgame,
    HostMigrateStarting,
    HostMigrateMigrating,
    HostMigrateWaitingForClients,
    HostMigrateWaitingForHost,
    SessionDisconnecting,
}

impl CoordinatorState {
    pub fn is_migrating(self) -> bool {
        matches!(
            self,
            CoordinatorState::HostMigrateStarting
                | CoordinatorState::HostMigrateMigrating
                | CoordinatorState::HostMigrateWaitingForClients
                | CoordinatorState::HostMigrateWaitingForHost
        )
    }

    /// Waiting in the lobby of a session, host or client
    pub fn is_lobby(self) -> bool {
        matches!(
            self,
            CoordinatorState::AcceptingConnections | CoordinatorState::SessionConnected
        )
    }

    /// The game server is up and players are loading into or playing it
    pub fn is_game_active(self) -> bool {
        matches!(
            self,
            CoordinatorState::GameLocked
                | CoordinatorState::InGame
                | CoordinatorState::ReportingStats
                | CoordinatorState::Postgame
        )
    }

    /// Part of a session with peers to heartbeat
    pub fn is_in_session(self) -> bool {
        !matches!(
            self,
            CoordinatorState::Initial
                | CoordinatorState::Creating
                | CoordinatorState::Searching
                | CoordinatorState::WaitingQos
                | CoordinatorState::Browsing
        )
    }
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
