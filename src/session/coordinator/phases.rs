//! Pregame countdown, loading barrier, stats reporting and postgame

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::protocol::{Checkpoint, GameState, MachineId, Message};

use super::super::config::CoordinatorConfig;
use super::super::notify::NotifyKind;
use super::super::record::RecordState;
use super::{CoordinatorState, SessionCoordinator};

impl SessionCoordinator {
    pub(super) fn update_pregame(&mut self) {
        let elapsed = self.elapsed(self.countdown_start);

        if self.record.is_host()
            && self.record.is_arbitrated()
            && elapsed > CoordinatorConfig::ms(self.config.registration_wait_ms)
            && matches!(
                self.record.state(),
                RecordState::Idle | RecordState::WaitingForRegistration
            )
            && !self.registry.local().registered
        {
            let local_id = self.registry.local_id();
            if let Err(e) = self.record.begin_register(&mut self.directory, local_id) {
                warn!("Host registration failed to start: {}", e);
            }
        }

        let countdown = self.config.start_countdown();
        if elapsed < countdown {
            let remaining = (countdown - elapsed).as_millis().div_ceil(1000) as i64;
            if self.last_countdown != Some(remaining) {
                self.last_countdown = Some(remaining);
                self.notify(NotifyKind::Countdown, remaining);
            }
            return;
        }

        self.notify(NotifyKind::Countdown, 0);
        self.set_channel_timeouts(self.config.loading_timeout());
        self.record.start();
        self.switch_to_state(CoordinatorState::Loading);
    }

    fn set_channel_timeouts(&mut self, timeout: Duration) {
        for addr in self.registry.channel_addrs() {
            self.transport.set_timeout(addr, timeout);
        }
    }

    pub(super) fn on_registered(&mut self) {
        self.registry.local_mut().registered = true;
        if self.record.is_host() {
            let unregistered: Vec<MachineId> = self
                .registry
                .remotes()
                .filter(|p| !p.registered)
                .map(|p| p.id)
                .collect();
            for id in unregistered {
                warn!("{} failed to register for arbitration", id);
                self.client_dropped(id);
            }
        } else {
            let machine_id = self.registry.local_id();
            self.send_to_host(&Message::RegisterResponse { machine_id });
        }
    }

    /// Host: the game server is up, tell everyone to connect
    pub fn on_server_ready(&mut self) {
        if !self.record.is_host() || self.state != CoordinatorState::Loading {
            warn!("Server ready while {}", self.state);
            return;
        }
        self.handle_connect();
    }

    pub(super) fn handle_connect(&mut self) {
        if matches!(
            self.state,
            CoordinatorState::ConnectedToServer | CoordinatorState::InGame
        ) {
            debug!("Already connected to the server");
            return;
        }

        if self.record.is_host() {
            self.send_to_remotes(&Message::Checkpoint(Checkpoint::Connect), None);
        }
        if self.state != CoordinatorState::Loading {
            self.set_channel_timeouts(self.config.loading_timeout());
            self.switch_to_state(CoordinatorState::Loading);
        }
        if !self.record.is_host() {
            match self.host_addr() {
                Some(addr) => self.sink.connect_to_server(addr),
                None => warn!("No host address to connect to"),
            }
        }
        self.notify(NotifyKind::ConnectedToServer, 0);
    }

    /// The local level finished loading. Enters the loading barrier.
    pub fn on_level_loading_finished(&mut self) {
        if self.state != CoordinatorState::ConnectedToServer {
            warn!("Level loaded while {}", self.state);
            return;
        }
        info!("Level loaded");
        self.registry.local_mut().loaded = true;

        if self.record.is_host() {
            if !self.record.is_arbitrated() {
                self.set_game_state(GameState::InProgress);
            }
            let loaded: Vec<_> = self
                .registry
                .remotes()
                .filter(|p| p.loaded)
                .filter_map(|p| p.addr)
                .collect();
            let timeout = self.config.heartbeat_timeout();
            for addr in loaded {
                self.send_to(addr, &Message::Checkpoint(Checkpoint::LoadingComplete));
                self.transport.set_timeout(addr, timeout);
            }
        } else {
            self.send_to_host(&Message::Checkpoint(Checkpoint::LoadingComplete));
        }

        if self.loading_barrier_met() {
            self.switch_to_state(CoordinatorState::InGame);
        } else {
            self.switch_to_state(CoordinatorState::GameLocked);
        }
    }

    pub(super) fn handle_loading_complete(&mut self, sender: MachineId) {
        let timeout = self.config.heartbeat_timeout();
        let Some(participant) = self.registry.get_mut(sender) else {
            return;
        };
        participant.loaded = true;
        let addr = participant.addr;
        debug!("{} finished loading", sender);

        if self.record.is_host() {
            if self.state.is_game_active() {
                if let Some(addr) = addr {
                    self.send_to(addr, &Message::Checkpoint(Checkpoint::LoadingComplete));
                    self.transport.set_timeout(addr, timeout);
                }
            }
        } else if let Some(addr) = addr {
            self.transport.set_timeout(addr, timeout);
        }

        if self.state == CoordinatorState::GameLocked && self.loading_barrier_met() {
            self.switch_to_state(CoordinatorState::InGame);
        }
    }

    /// Host: every remote loaded. Client: the host loaded.
    fn loading_barrier_met(&self) -> bool {
        if self.record.is_host() {
            self.registry
                .remotes()
                .filter(|p| !self.registry.is_pending_removal(p.id))
                .all(|p| p.loaded)
        } else {
            self.registry.host().is_some_and(|host| host.loaded)
        }
    }

    pub(super) fn update_game_locked(&mut self) {
        if self.loading_barrier_met() {
            self.switch_to_state(CoordinatorState::InGame);
            return;
        }
        if self.elapsed(self.wait_timer) <= CoordinatorConfig::ms(self.config.loading_barrier_wait_ms) {
            return;
        }
        if self.record.is_host() {
            let stragglers: Vec<MachineId> = self
                .registry
                .remotes()
                .filter(|p| !p.loaded)
                .map(|p| p.id)
                .collect();
            for id in stragglers {
                warn!("{} never finished loading", id);
                self.client_dropped(id);
            }
        } else {
            warn!("Host never reported loading complete");
        }
        self.switch_to_state(CoordinatorState::InGame);
    }

    /// Host: the match is over, collect stats from everyone
    pub fn end_game(&mut self) {
        if !self.record.is_host() || self.state != CoordinatorState::InGame {
            warn!("Cannot end game while {}", self.state);
            return;
        }
        info!("Game over, reporting stats");
        self.send_to_remotes(&Message::Checkpoint(Checkpoint::ReportStats), None);
        self.begin_stats_reporting();
    }

    pub(super) fn begin_stats_reporting(&mut self) {
        if !matches!(
            self.state,
            CoordinatorState::InGame | CoordinatorState::GameLocked
        ) {
            debug!("Ignoring stats request while {}", self.state);
            return;
        }
        self.record.end();
        self.registry.local_mut().reported_stats = true;
        self.heartbeat_interval = CoordinatorConfig::ms(self.config.heartbeat_interval_lobby_ms);
        self.notify(NotifyKind::DumpStats, 0);
        self.switch_to_state(CoordinatorState::ReportingStats);
        self.end_stats_reporting(false);
    }

    /// Client: report completion. Host: move on once everyone has
    /// reported, or unconditionally when `force` is set.
    pub(super) fn end_stats_reporting(&mut self, force: bool) {
        if !self.record.is_host() {
            self.send_to_host(&Message::Checkpoint(Checkpoint::ReportingComplete));
            return;
        }

        let finished = self.registry.local().reported_stats
            && self
                .registry
                .remotes()
                .filter(|p| !self.registry.is_pending_removal(p.id))
                .all(|p| p.reported_stats);
        if finished || force {
            self.send_to_remotes(&Message::Checkpoint(Checkpoint::Postgame), None);
            self.enter_postgame();
        }
    }

    pub(super) fn update_reporting_stats(&mut self) {
        if self.elapsed(self.wait_timer) <= CoordinatorConfig::ms(self.config.report_stats_wait_ms) {
            return;
        }
        warn!("Stats reporting timed out");
        if self.record.is_host() {
            self.end_stats_reporting(true);
        } else {
            self.enter_postgame();
        }
    }

    pub(super) fn enter_postgame(&mut self) {
        if !matches!(
            self.state,
            CoordinatorState::ReportingStats | CoordinatorState::InGame | CoordinatorState::GameLocked
        ) {
            debug!("Ignoring postgame while {}", self.state);
            return;
        }
        self.switch_to_state(CoordinatorState::Postgame);

        if self.record.is_arbitrated() {
            self.notify(NotifyKind::EndgameRanked, 0);
            self.switch_to_state(CoordinatorState::Initial);
            return;
        }

        let is_host = self.record.is_host();
        if is_host {
            self.set_game_state(GameState::InLobby);
        }
        self.record.return_to_lobby();
        for participant in self.registry.members_mut() {
            participant.loaded = false;
            participant.reported_stats = false;
        }
        let kind = if is_host {
            NotifyKind::EndgameHost
        } else {
            NotifyKind::EndgameClient
        };
        self.notify(kind, 0);
        self.update_lobby_all();

        if is_host {
            self.switch_to_state(CoordinatorState::AcceptingConnections);
        } else {
            self.switch_to_state(CoordinatorState::SessionConnected);
        }
    }
}
