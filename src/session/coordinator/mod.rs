//! Session coordinator
//!
//! [`SessionCoordinator`] is the top-level state machine. It owns the
//! session record, the participant registry, the transport and the directory
//! client, and is driven entirely by [`SessionCoordinator::run_frame`]: one
//! call per tick, no threads and no blocking.
//!
//! The implementation is split by concern:
//! - `handlers`: inbound message dispatch
//! - `lobby`: hosting, admission, teams, session changes, leaving
//! - `phases`: pregame countdown, loading barrier, stats and postgame
//! - `migration`: host election and handover
//! - `search`: system-link and directory search, QoS ranking
//! - `invite`: invite acceptance
//! - `voice`: voice state and mute lists

mod handlers;
mod invite;
mod lobby;
mod migration;
mod phases;
mod search;
mod state;
mod voice;

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, trace, warn};

use crate::clock::Clock;
use crate::network::Transport;
use crate::protocol::{
    GameState, HostData, MachineId, Message, PlayerId, PlayerSlot, SessionAdvert, SessionId,
    SessionProperties, CONTEXT_SCENARIO, PROPERTY_MAX_GAME_TIME,
};

use super::config::CoordinatorConfig;
use super::directory::{DirectoryClient, DirectoryService};
use super::error::SessionError;
use super::notify::{NotificationSink, NotifyKind};
use super::record::{RecordEvent, RecordState, SessionRecord, SlotCounts};
use super::registry::{ClientRegistry, Participant};

pub use invite::{InviteState, SessionInvite};
pub use migration::MigrationState;
pub use search::{ping_quality, PingQuality, SearchResult};
pub use state::CoordinatorState;

/// Diagnostic snapshot of the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub state: CoordinatorState,
    pub is_host: bool,
    pub is_system_link: bool,
    pub session_id: SessionId,
    pub slots: SlotCounts,
    pub total_players: u32,
    pub remotes: usize,
    pub send_count: u32,
    pub since_send: Duration,
    pub since_wait: Duration,
}

pub struct SessionCoordinator {
    config: CoordinatorConfig,
    state: CoordinatorState,
    transport: Box<dyn Transport>,
    directory: DirectoryClient,
    sink: Box<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    rng: StdRng,

    registry: ClientRegistry,
    record: SessionRecord,
    properties: SessionProperties,
    host_data: HostData,
    total_teams: u32,

    send_timer: Duration,
    wait_timer: Duration,
    /// Outstanding record operation and when it was first seen
    record_timer: Option<(RecordState, Duration)>,
    countdown_start: Duration,
    last_countdown: Option<i64>,
    send_count: u32,
    next_heartbeat: Duration,
    heartbeat_interval: Duration,
    entered_lobby: bool,

    search_nonce: u64,
    search_results: Vec<SearchResult>,
    qos_candidates: Vec<SessionAdvert>,

    invite_state: InviteState,
    pending_invite: Option<SessionInvite>,
    storage_ready: bool,

    migration: MigrationState,

    voice_registered: BTreeSet<PlayerId>,
    /// Players each local player has muted
    mutes: BTreeMap<PlayerId, BTreeSet<PlayerId>>,
    /// Remote players that have muted each local player
    muted_by: BTreeMap<PlayerId, BTreeSet<PlayerId>>,
}

/// Game size used when the session properties do not carry one
pub const DEFAULT_GAME_SIZE: u32 = 8;
/// Team count used when the session properties do not carry one
pub const DEFAULT_TEAM_COUNT: u32 = 2;

impl SessionCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        transport: Box<dyn Transport>,
        directory: Box<dyn DirectoryService>,
        sink: Box<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SessionError> {
        config.validate().map_err(SessionError::Config)?;

        let mut rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let machine_id = MachineId(config.machine_id.unwrap_or_else(|| rng.gen_range(1..u64::MAX)));
        let players = config
            .local_players
            .iter()
            .map(|p| PlayerSlot::new(p.player_id(), p.name.clone()))
            .collect();
        let local = Participant::new(machine_id, None, players);
        let heartbeat_interval = CoordinatorConfig::ms(config.heartbeat_interval_lobby_ms);

        info!(
            "Coordinator {} on {} with {} local players",
            machine_id,
            transport.local_addr(),
            config.local_players.len()
        );

        Ok(Self {
            config,
            state: CoordinatorState::Initial,
            transport,
            directory: DirectoryClient::new(directory),
            sink,
            clock,
            rng,
            registry: ClientRegistry::new(local),
            record: SessionRecord::new(),
            properties: SessionProperties::default(),
            host_data: HostData::default(),
            total_teams: DEFAULT_TEAM_COUNT,
            send_timer: Duration::ZERO,
            wait_timer: Duration::ZERO,
            record_timer: None,
            countdown_start: Duration::ZERO,
            last_countdown: None,
            send_count: 0,
            next_heartbeat: Duration::ZERO,
            heartbeat_interval,
            entered_lobby: false,
            search_nonce: 0,
            search_results: Vec::new(),
            qos_candidates: Vec::new(),
            invite_state: InviteState::None,
            pending_invite: None,
            storage_ready: false,
            migration: MigrationState::default(),
            voice_registered: BTreeSet::new(),
            mutes: BTreeMap::new(),
            muted_by: BTreeMap::new(),
        })
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn machine_id(&self) -> MachineId {
        self.registry.local_id()
    }

    pub fn is_host(&self) -> bool {
        self.record.is_host()
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    pub fn record(&self) -> &SessionRecord {
        &self.record
    }

    pub fn total_teams(&self) -> u32 {
        self.total_teams
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// Players still missing before the host may start the game
    pub fn players_needed(&self) -> u32 {
        let on_teams: u32 = self.registry.team_counts(self.total_teams).iter().sum();
        self.config.min_players.saturating_sub(on_teams)
    }

    pub fn session_info(&self) -> SessionInfo {
        let now = self.now();
        SessionInfo {
            state: self.state,
            is_host: self.record.is_host(),
            is_system_link: self.record.is_system_link(),
            session_id: self.record.session_id(),
            slots: self.record.slots(),
            total_players: self.registry.total_players(),
            remotes: self.registry.remote_count(),
            send_count: self.send_count,
            since_send: now.saturating_sub(self.send_timer),
            since_wait: now.saturating_sub(self.wait_timer),
        }
    }

    /// Run one tick: dispatch inbound traffic, advance asynchronous work and
    /// timers, apply deferred removals, heartbeat and flush.
    pub fn run_frame(&mut self) {
        while let Some(inbound) = self.transport.recv() {
            self.dispatch(inbound);
        }

        self.poll_record();
        self.check_record_deadline();
        self.update_invite();
        self.update_state();
        self.check_timeouts();

        self.apply_removals();
        self.registry.cleanup_marked_channels(self.transport.as_mut());

        self.send_heartbeats();
        self.transport.flush();
    }

    fn now(&self) -> Duration {
        self.clock.now()
    }

    fn elapsed(&self, since: Duration) -> Duration {
        self.now().saturating_sub(since)
    }

    /// Single mutator for the coordinator state: exit effects of the old
    /// state, then the new state, then its entry effects.
    fn switch_to_state(&mut self, new_state: CoordinatorState) {
        let old_state = self.state;

        match old_state {
            CoordinatorState::Browsing if new_state != CoordinatorState::Browsing => {
                self.search_results.clear();
            }
            CoordinatorState::Pregame => self.last_countdown = None,
            _ => {}
        }

        info!("State {} -> {}", old_state, new_state);
        self.state = new_state;

        let now = self.now();
        match new_state {
            CoordinatorState::Initial => self.cleanup(),
            CoordinatorState::Modifying => self.send_timer = now,
            CoordinatorState::WaitingQos
            | CoordinatorState::SessionDisconnecting
            | CoordinatorState::ReportingStats
            | CoordinatorState::GameLocked
            | CoordinatorState::HostMigrateWaitingForHost => self.wait_timer = now,
            CoordinatorState::SessionConnecting => self.connect_to_host(),
            CoordinatorState::Pregame => {
                self.countdown_start = now;
                self.last_countdown = None;
            }
            CoordinatorState::Loading => {
                self.heartbeat_interval = CoordinatorConfig::ms(self.config.heartbeat_interval_game_ms);
            }
            CoordinatorState::AcceptingConnections | CoordinatorState::SessionConnected => {
                self.entered_lobby = true;
            }
            _ => {}
        }
    }

    /// Report `kind` to the sink and apply the transition it implies
    fn notify(&mut self, kind: NotifyKind, param: i64) {
        debug!("Notify {:?} ({})", kind, param);
        self.sink.notify(kind, param);

        match kind {
            NotifyKind::CreatedHost => {
                self.add_players_to_session(self.registry.local_id());
                self.refresh_advert();
                self.switch_to_state(CoordinatorState::AcceptingConnections);
            }
            NotifyKind::CreatedClient => self.switch_to_state(CoordinatorState::SessionConnecting),
            NotifyKind::ModifyingSession => self.switch_to_state(CoordinatorState::Modifying),
            NotifyKind::ModifyingCompletedHost => self.switch_to_state(CoordinatorState::AcceptingConnections),
            NotifyKind::ModifyingCompletedClient | NotifyKind::ConnectedToSession => {
                self.switch_to_state(CoordinatorState::SessionConnected)
            }
            NotifyKind::SearchCompleted => self.switch_to_state(CoordinatorState::Browsing),
            NotifyKind::ConnectedToServer => self.switch_to_state(CoordinatorState::ConnectedToServer),
            NotifyKind::MigrationCompleted => {
                if self.record.is_host() {
                    self.begin_waiting_for_clients();
                } else {
                    self.end_migration();
                }
            }
            NotifyKind::RegisterCompleted => self.on_registered(),
            NotifyKind::EndgameHost | NotifyKind::EndgameClient => {
                self.heartbeat_interval = CoordinatorConfig::ms(self.config.heartbeat_interval_lobby_ms);
            }
            NotifyKind::LostHost
            | NotifyKind::LostServer
            | NotifyKind::MigrationExhausted
            | NotifyKind::FailMigrate => self.switch_to_state(CoordinatorState::SessionDisconnecting),
            NotifyKind::FailRegister
            | NotifyKind::FailCreate
            | NotifyKind::FailSearch
            | NotifyKind::ConnectSessionFull
            | NotifyKind::ConnectNotAvailable
            | NotifyKind::ConnectFailed => self.switch_to_state(CoordinatorState::Initial),
            _ => {}
        }
    }

    fn poll_record(&mut self) {
        let Some(event) = self.record.poll(&mut self.directory) else {
            return;
        };
        debug!("Record event {:?}", event);
        match event {
            RecordEvent::Created => {
                if self.state != CoordinatorState::Creating {
                    warn!("Session created while {}, ignoring", self.state);
                } else if self.record.is_host() {
                    self.notify(NotifyKind::CreatedHost, 0);
                } else {
                    self.notify(NotifyKind::CreatedClient, 0);
                }
            }
            RecordEvent::CreateFailed(e) => {
                warn!("Session create failed: {}", e);
                self.notify(NotifyKind::FailCreate, 0);
            }
            RecordEvent::Migrated => self.notify(NotifyKind::MigrationCompleted, 0),
            RecordEvent::MigrateFailed(e) => {
                warn!("Session migrate failed: {}", e);
                self.notify(NotifyKind::FailMigrate, 0);
            }
            RecordEvent::Registered => self.notify(NotifyKind::RegisterCompleted, 0),
            RecordEvent::RegisterFailed(e) => {
                warn!("Arbitration registration failed: {}", e);
                self.notify(NotifyKind::FailRegister, 0);
            }
        }
    }

    /// Give up on a directory operation that stays pending past its wait
    fn check_record_deadline(&mut self) {
        let state = self.record.state();
        if !self.record.is_busy() {
            self.record_timer = None;
            return;
        }
        let since = match self.record_timer {
            Some((timed, since)) if timed == state => since,
            _ => {
                let now = self.now();
                self.record_timer = Some((state, now));
                now
            }
        };

        let (wait_ms, kind) = match state {
            RecordState::Creating => (self.config.create_wait_ms, NotifyKind::FailCreate),
            RecordState::Migrating => (self.config.migrate_wait_ms, NotifyKind::FailMigrate),
            _ => (self.config.register_reply_wait_ms, NotifyKind::FailRegister),
        };
        if self.elapsed(since) <= CoordinatorConfig::ms(wait_ms) {
            return;
        }

        warn!("Directory gave no answer for {:?} within {} ms", state, wait_ms);
        self.record_timer = None;
        self.record.cancel(&mut self.directory);
        self.notify(kind, 0);
    }

    fn update_state(&mut self) {
        match self.state {
            CoordinatorState::Searching => self.update_searching(),
            CoordinatorState::WaitingQos => self.update_waiting_qos(),
            CoordinatorState::SessionConnecting => self.update_connecting(),
            CoordinatorState::Modifying => self.update_modifying(),
            CoordinatorState::Pregame => self.update_pregame(),
            CoordinatorState::GameLocked => self.update_game_locked(),
            CoordinatorState::ReportingStats => self.update_reporting_stats(),
            CoordinatorState::HostMigrateWaitingForClients => self.update_waiting_for_clients(),
            CoordinatorState::HostMigrateWaitingForHost => self.update_waiting_for_host(),
            CoordinatorState::SessionDisconnecting => self.update_disconnecting(),
            _ => {}
        }
    }

    /// Drop peers whose channel went quiet
    fn check_timeouts(&mut self) {
        if !self.state.is_in_session()
            || self.state.is_migrating()
            || matches!(
                self.state,
                CoordinatorState::SessionConnecting | CoordinatorState::SessionDisconnecting
            )
        {
            return;
        }

        let candidates: Vec<(MachineId, SocketAddr)> = if self.record.is_host() {
            self.registry
                .remotes()
                .filter_map(|p| p.addr.map(|addr| (p.id, addr)))
                .collect()
        } else {
            self.registry
                .host()
                .and_then(|h| h.addr.map(|addr| (h.id, addr)))
                .into_iter()
                .collect()
        };

        for (id, addr) in candidates {
            if self.registry.is_pending_removal(id) || !self.registry.has_channel(addr) {
                continue;
            }
            if self.transport.is_timed_out(addr) {
                warn!("Channel to {} at {} timed out", id, addr);
                self.client_dropped(id);
            }
        }
    }

    fn send_heartbeats(&mut self) {
        if !self.state.is_in_session() {
            return;
        }
        let now = self.now();
        if now < self.next_heartbeat {
            return;
        }
        self.next_heartbeat = now + self.heartbeat_interval;

        let targets: Vec<SocketAddr> = if self.record.is_host() {
            self.registry.remotes().filter_map(|p| p.addr).collect()
        } else {
            self.host_addr().into_iter().collect()
        };
        for addr in targets {
            if !self.registry.has_channel(addr) {
                continue;
            }
            trace!("Heartbeat to {}", addr);
            if let Err(e) = self.transport.send(addr, &Message::Heartbeat, false) {
                debug!("Heartbeat to {} failed: {}", addr, e);
            }
        }
    }

    /// Remove participants scheduled during this frame and release what
    /// they held
    fn apply_removals(&mut self) {
        let removed = self.registry.apply_removals();
        if removed.is_empty() {
            return;
        }
        for participant in &removed {
            if let Some(kind) = participant.slot {
                self.record.leave(kind, participant.player_count());
            }
            for player in participant.player_ids() {
                self.unregister_voice(player);
                self.sink.player_removed(player);
                for set in self.muted_by.values_mut() {
                    set.remove(&player);
                }
            }
        }
        if self.record.is_host() {
            self.refresh_advert();
        }
    }

    /// Forget the session entirely. Entry effect of `Initial`.
    fn cleanup(&mut self) {
        debug!("Cleaning up session state");
        self.record.reset(&mut self.directory);
        self.directory.cancel_all();

        for participant in self.registry.clear() {
            for player in participant.player_ids() {
                self.unregister_voice(player);
                self.sink.player_removed(player);
            }
        }
        for addr in self.registry.channel_addrs() {
            self.registry.mark_channel_for_removal(addr);
        }
        self.registry.cleanup_marked_channels(self.transport.as_mut());

        let local_players = self.registry.local().player_ids();
        for player in local_players {
            self.unregister_voice(player);
        }
        let local = self.registry.local_mut();
        local.reset_flags();
        local.clear_teams();
        local.invited = false;
        local.slot = None;

        self.host_data = HostData::default();
        self.search_results.clear();
        self.qos_candidates.clear();
        self.search_nonce = 0;
        self.send_count = 0;
        self.last_countdown = None;
        self.migration = MigrationState::default();
        self.muted_by.clear();
        self.entered_lobby = false;
        self.heartbeat_interval = CoordinatorConfig::ms(self.config.heartbeat_interval_lobby_ms);
    }

    fn host_addr(&self) -> Option<SocketAddr> {
        self.registry.host_addr().or(self.record.host_addr())
    }

    fn open_channel(&mut self, addr: SocketAddr, timeout: Duration) {
        self.registry.open_channel(self.transport.as_mut(), addr, timeout);
    }

    fn send_to(&mut self, addr: SocketAddr, message: &Message) {
        if let Err(e) = self.transport.send(addr, message, true) {
            warn!("Failed to send {} to {}: {}", message.name(), addr, e);
        }
    }

    fn send_to_participant(&mut self, id: MachineId, message: &Message) {
        match self.registry.get(id).and_then(|p| p.addr) {
            Some(addr) => self.send_to(addr, message),
            None => debug!("No address for {}, dropping {}", id, message.name()),
        }
    }

    fn send_to_host(&mut self, message: &Message) {
        match self.host_addr() {
            Some(addr) => self.send_to(addr, message),
            None => warn!("No host to send {} to", message.name()),
        }
    }

    /// Send to every remote with a live channel, skipping `except`
    fn send_to_remotes(&mut self, message: &Message, except: Option<MachineId>) {
        let targets: Vec<SocketAddr> = self
            .registry
            .remotes()
            .filter(|p| Some(p.id) != except && !self.registry.is_pending_removal(p.id))
            .filter_map(|p| p.addr)
            .filter(|addr| self.registry.has_channel(*addr))
            .collect();
        for addr in targets {
            self.send_to(addr, message);
        }
    }

    /// Host: every remote. Client: the host.
    fn send_to_session(&mut self, message: &Message) {
        if self.record.is_host() {
            self.send_to_remotes(message, None);
        } else {
            self.send_to_host(message);
        }
    }

    fn register_voice(&mut self, player: PlayerId) {
        if self.voice_registered.insert(player) {
            self.sink.voice_register(player);
        }
    }

    fn unregister_voice(&mut self, player: PlayerId) {
        if self.voice_registered.remove(&player) {
            self.sink.voice_unregister(player);
        }
    }

    /// Push a participant's players to the lobby display
    fn update_lobby(&mut self, id: MachineId) {
        let Some(participant) = self.registry.get(id) else {
            return;
        };
        let is_host = self.registry.host_id() == Some(id);
        let players = participant.players.clone();
        let needed = self.players_needed();
        for player in &players {
            self.sink.player_updated(player, needed, is_host);
        }
    }

    fn update_lobby_all(&mut self) {
        let ids: Vec<MachineId> = self.registry.members().map(|p| p.id).collect();
        for id in ids {
            self.update_lobby(id);
        }
    }

    /// Voice registration and lobby entry for a participant's players
    fn add_players_to_session(&mut self, id: MachineId) {
        let players = self.registry.get(id).map(Participant::player_ids).unwrap_or_default();
        for player in players {
            self.register_voice(player);
        }
        self.update_lobby(id);
    }

    fn remove_players_from_session(&mut self, players: &[PlayerId]) {
        for &player in players {
            self.unregister_voice(player);
            self.sink.player_removed(player);
        }
    }

    /// Re-derive the advertised host data and push it to the directory
    fn refresh_advert(&mut self) {
        if !self.record.is_host() {
            return;
        }
        let local = self.registry.local();
        self.host_data.host_name = local.display_name().to_string();
        self.host_data.host_player = local.players.first().map(|p| p.id).unwrap_or_default();
        self.host_data.scenario = self.properties.context(CONTEXT_SCENARIO).unwrap_or_default().to_string();
        self.host_data.game_time = self.properties.property(PROPERTY_MAX_GAME_TIME).unwrap_or(0);

        if self.record.is_system_link() || self.record.session_id().is_nil() {
            return;
        }
        let advert = self.current_advert();
        self.directory.update_advert(&advert);
    }

    fn current_advert(&self) -> SessionAdvert {
        self.record.advert(
            self.transport.local_addr(),
            self.total_teams,
            self.host_data.clone(),
            self.properties.clone(),
        )
    }

    fn set_game_state(&mut self, game_state: GameState) {
        if self.host_data.game_state != game_state {
            self.host_data.game_state = game_state;
            self.refresh_advert();
        }
    }
}

#[cfg(test)]
mod tests;
