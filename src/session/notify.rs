//! Outbound notifications
//!
//! The coordinator reports to the embedding application (UI, voice, game
//! server) only through [`NotificationSink`]. Sinks observe; nothing they do
//! feeds back into coordinator state except the storage check of an invite.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::protocol::{PlayerId, PlayerSlot};

/// Kind of a session notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotifyKind {
    Welcome,
    CreatedHost,
    CreatedClient,
    FailCreate,
    FailSearch,
    SearchCompleted,
    ConnectedToSession,
    ConnectNotAvailable,
    ConnectSessionFull,
    ConnectFailed,
    ClientKicked,
    /// Param is the remaining whole seconds, -1 when the countdown is cancelled
    Countdown,
    ConnectedToServer,
    LostHost,
    LostServer,
    MigrationCompleted,
    /// Every host candidate failed or the retry budget ran out
    MigrationExhausted,
    FailMigrate,
    ModifyingCompletedHost,
    ModifyingCompletedClient,
    ModifyingSession,
    RegisterCompleted,
    FailRegister,
    EndgameHost,
    EndgameClient,
    EndgameRanked,
    DumpStats,
}

/// Whether a storage device is ready for an invite to proceed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageStatus {
    Ready,
    /// The user must pick a device; the application calls `storage_selected` afterwards
    NeedsSelection,
}

/// Receiver of coordinator side effects
pub trait NotificationSink {
    fn notify(&mut self, kind: NotifyKind, param: i64);

    /// A player's lobby entry changed
    fn player_updated(&mut self, _player: &PlayerSlot, _players_needed: u32, _is_host: bool) {}

    fn player_removed(&mut self, _player: PlayerId) {}

    fn voice_register(&mut self, _player: PlayerId) {}

    fn voice_unregister(&mut self, _player: PlayerId) {}

    fn mute_changed(&mut self, _player: PlayerId, _muted: bool) {}

    /// The game server is up; connect to it at `host`
    fn connect_to_server(&mut self, _host: SocketAddr) {}

    fn check_storage(&mut self) -> StorageStatus {
        StorageStatus::Ready
    }
}

/// Everything a [`RecordingSink`] saw, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    Notify(NotifyKind, i64),
    PlayerUpdated { player: PlayerId, team: i32, players_needed: u32 },
    PlayerRemoved(PlayerId),
    VoiceRegister(PlayerId),
    VoiceUnregister(PlayerId),
    MuteChanged(PlayerId, bool),
    ConnectToServer(SocketAddr),
}

#[derive(Default)]
struct Recording {
    events: Vec<SinkEvent>,
    storage_needs_selection: bool,
}

/// Sink that keeps every event. Clones share the same log.
#[derive(Clone, Default)]
pub struct RecordingSink {
    inner: Arc<Mutex<Recording>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.inner.lock().events.clone()
    }

    pub fn notifications(&self) -> Vec<(NotifyKind, i64)> {
        self.inner
            .lock()
            .events
            .iter()
            .filter_map(|event| match event {
                SinkEvent::Notify(kind, param) => Some((*kind, *param)),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, kind: NotifyKind) -> usize {
        self.notifications().iter().filter(|(k, _)| *k == kind).count()
    }

    pub fn last(&self) -> Option<(NotifyKind, i64)> {
        self.notifications().last().copied()
    }

    pub fn clear(&self) {
        self.inner.lock().events.clear();
    }

    /// Make `check_storage` ask for a device selection
    pub fn require_storage_selection(&self, required: bool) {
        self.inner.lock().storage_needs_selection = required;
    }

    fn push(&self, event: SinkEvent) {
        self.inner.lock().events.push(event);
    }
}

impl NotificationSink for RecordingSink {
    fn notify(&mut self, kind: NotifyKind, param: i64) {
        self.push(SinkEvent::Notify(kind, param));
    }

    fn player_updated(&mut self, player: &PlayerSlot, players_needed: u32, _is_host: bool) {
        self.push(SinkEvent::PlayerUpdated {
            player: player.id,
            team: player.team,
            players_needed,
        });
    }

    fn player_removed(&mut self, player: PlayerId) {
        self.push(SinkEvent::PlayerRemoved(player));
    }

    fn voice_register(&mut self, player: PlayerId) {
        self.push(SinkEvent::VoiceRegister(player));
    }

    fn voice_unregister(&mut self, player: PlayerId) {
        self.push(SinkEvent::VoiceUnregister(player));
    }

    fn mute_changed(&mut self, player: PlayerId, muted: bool) {
        self.push(SinkEvent::MuteChanged(player, muted));
    }

    fn connect_to_server(&mut self, host: SocketAddr) {
        self.push(SinkEvent::ConnectToServer(host));
    }

    fn check_storage(&mut self) -> StorageStatus {
        if self.inner.lock().storage_needs_selection {
            StorageStatus::NeedsSelection
        } else {
            StorageStatus::Ready
        }
    }
}
