//! Hosting, admission, teams, session changes and leaving

use std::net::SocketAddr;

use tracing::{debug, info, warn};

use crate::protocol::{
    clamp_team_count, Checkpoint, JoinRequest, JoinResponse, JoinResult, MachineId, MemberInfo, Message, Mutelist, PlayerId,
    SessionMeta, SessionProperties, MAX_PLAYERS_PER_PARTICIPANT, PROPERTY_GAME_SIZE, PROPERTY_NUMBER_OF_TEAMS,
    PROPERTY_PRIVATE_SLOTS,
};

use super::super::config::CoordinatorConfig;
use super::super::directory::CreateParams;
use super::super::notify::NotifyKind;
use super::super::registry::Participant;
use super::super::teams::{choose_team, next_open_team, team_capacity};
use super::{CoordinatorState, SessionCoordinator, DEFAULT_GAME_SIZE, DEFAULT_TEAM_COUNT};

impl SessionCoordinator {
    /// Create and advertise a session with this machine as host
    pub fn start_host(&mut self, system_link: bool) {
        if self.state != CoordinatorState::Initial {
            warn!("Cannot host while {}", self.state);
            return;
        }
        info!("Starting host (system link: {})", system_link);

        self.record.set_is_host(true);
        self.record.set_system_link(system_link);
        self.record.set_arbitrated(self.properties.arbitrated && !system_link);
        self.apply_topology();

        let local_id = self.registry.local_id();
        self.registry.set_host(Some(local_id));
        let players = self.registry.local().player_count();
        match self.record.join(false, players) {
            Ok(kind) => {
                let local = self.registry.local_mut();
                local.invited = false;
                local.slot = Some(kind);
            }
            Err(e) => {
                warn!("Session too small for local players: {}", e);
                self.notify(NotifyKind::FailCreate, 0);
                return;
            }
        }
        self.assign_teams(local_id);
        self.refresh_advert();

        let slots = self.record.slots();
        let params = CreateParams {
            session_id: None,
            host_id: local_id,
            host_addr: self.transport.local_addr(),
            public_slots: slots.total_public,
            private_slots: slots.total_private,
            total_teams: self.total_teams,
            properties: self.properties.clone(),
            host_data: self.host_data.clone(),
        };
        match self.record.begin_create(&mut self.directory, params, &mut self.rng) {
            Ok(()) => self.switch_to_state(CoordinatorState::Creating),
            Err(e) => {
                warn!("Session create failed to start: {}", e);
                self.notify(NotifyKind::FailCreate, 0);
            }
        }
    }

    /// Derive slot totals and team count from the session properties.
    /// Public slots are the game size minus the private slots.
    pub(super) fn apply_topology(&mut self) {
        let game_size = self
            .properties
            .property(PROPERTY_GAME_SIZE)
            .map(|v| saturate_u32(v).max(1))
            .unwrap_or(DEFAULT_GAME_SIZE);
        let private = self
            .properties
            .property(PROPERTY_PRIVATE_SLOTS)
            .map(|v| saturate_u32(v).min(game_size))
            .unwrap_or(0);
        self.record.set_slots(game_size - private, private);
        self.total_teams = self
            .properties
            .property(PROPERTY_NUMBER_OF_TEAMS)
            .map(|v| clamp_team_count(saturate_u32(v)))
            .unwrap_or(DEFAULT_TEAM_COUNT);
    }

    /// Place every player of `id` on the least-populated team
    pub(super) fn assign_teams(&mut self, id: MachineId) -> Vec<i32> {
        let mut counts = self.registry.team_counts(self.total_teams);
        let player_count = self.registry.get(id).map(|p| p.players.len()).unwrap_or(0);
        let teams: Vec<i32> = (0..player_count)
            .map(|_| {
                let team = choose_team(&counts, &mut self.rng);
                counts[team] += 1;
                team as i32
            })
            .collect();
        if let Some(participant) = self.registry.get_mut(id) {
            for (player, team) in participant.players.iter_mut().zip(&teams) {
                player.team = *team;
            }
        }
        teams
    }

    pub(super) fn session_meta(&self, teams: Vec<i32>) -> SessionMeta {
        SessionMeta {
            host_id: self.registry.local_id(),
            session_id: self.record.session_id(),
            nonce: self.record.nonce(),
            arbitrated: self.record.is_arbitrated(),
            owner_index: self.record.owner_index(),
            total_teams: self.total_teams,
            teams,
            properties: self.properties.clone(),
        }
    }

    pub fn is_accepting_connections(&self) -> bool {
        if !self.record.is_host() || self.state < CoordinatorState::AcceptingConnections {
            return false;
        }
        match self.state {
            CoordinatorState::AcceptingConnections => true,
            CoordinatorState::ConnectedToServer | CoordinatorState::GameLocked | CoordinatorState::InGame => {
                !(self.record.is_arbitrated() && self.state > CoordinatorState::GameLocked)
            }
            _ => false,
        }
    }

    fn refuse_join(&mut self, from: SocketAddr, result: JoinResult) {
        let response = Message::JoinResponse(JoinResponse {
            result,
            meta: SessionMeta::default(),
        });
        if let Err(e) = self.transport.send_connectionless(from, &response) {
            warn!("Failed to refuse join from {}: {}", from, e);
        }
    }

    /// Host side of admission control
    pub(super) fn handle_join_request(&mut self, from: SocketAddr, request: JoinRequest) {
        let id = request.machine_id;
        if !self.is_accepting_connections() {
            debug!("Refusing join from {} while {}", id, self.state);
            self.refuse_join(from, JoinResult::NotHosting);
            return;
        }
        if request.players.is_empty() || request.players.len() > MAX_PLAYERS_PER_PARTICIPANT {
            warn!("Join from {} with {} players", id, request.players.len());
            self.refuse_join(from, JoinResult::NotHosting);
            return;
        }
        if id == self.registry.local_id() {
            warn!("Join from {} collides with the host id", from);
            self.refuse_join(from, JoinResult::NotHosting);
            return;
        }
        if self.registry.contains(id) {
            debug!("Duplicate join request from {}", id);
            return;
        }

        let slot = match self.record.join(request.invited, request.players.len() as u32) {
            Ok(kind) => kind,
            Err(e) => {
                info!("Rejecting join from {}: {}", id, e);
                self.refuse_join(from, JoinResult::Full);
                return;
            }
        };

        let join_in_progress = self.state != CoordinatorState::AcceptingConnections;
        let mut participant = Participant::new(id, Some(from), request.players);
        participant.invited = request.invited;
        participant.slot = Some(slot);
        self.registry.add(participant);
        let teams = self.assign_teams(id);

        let timeout = if join_in_progress {
            self.config.loading_timeout()
        } else {
            self.config.heartbeat_timeout()
        };
        self.open_channel(from, timeout);

        let result = if join_in_progress {
            JoinResult::ApprovedJoinInProgress
        } else {
            JoinResult::Approved
        };
        let meta = self.session_meta(teams);
        self.send_to(from, &Message::JoinResponse(JoinResponse { result, meta }));

        let existing: Vec<MemberInfo> = self
            .registry
            .members()
            .filter(|p| p.id != id && !self.registry.is_pending_removal(p.id))
            .map(Participant::to_member_info)
            .collect();
        for info in existing {
            self.send_to(from, &Message::MemberInfo(info));
        }
        if let Some(joiner) = self.registry.get(id).map(Participant::to_member_info) {
            self.send_to_remotes(&Message::MemberInfo(joiner), Some(id));
        }
        let mute_lists: Vec<Mutelist> = self
            .mutes
            .iter()
            .map(|(player, muted)| Mutelist {
                player: *player,
                muted: muted.iter().copied().collect(),
            })
            .collect();
        for list in mute_lists {
            self.send_to(from, &Message::Mutelist(list));
        }

        self.add_players_to_session(id);
        self.refresh_advert();

        if join_in_progress {
            self.send_to(from, &Message::Checkpoint(Checkpoint::Connect));
        }
    }

    /// Entry effect of `SessionConnecting`: ask the host to let us in
    pub(super) fn connect_to_host(&mut self) {
        let Some(host) = self.record.host_addr() else {
            warn!("No host address to connect to");
            self.notify(NotifyKind::ConnectFailed, 0);
            return;
        };
        info!("Connecting to host at {}", host);

        let local_id = self.registry.local_id();
        self.add_players_to_session(local_id);
        let timeout = self.config.heartbeat_timeout();
        self.open_channel(host, timeout);

        let local = self.registry.local();
        let request = Message::JoinRequest(JoinRequest {
            machine_id: local.id,
            invited: local.invited,
            players: local.players.clone(),
        });
        self.wait_timer = self.now();
        if let Err(e) = self.transport.send_connectionless(host, &request) {
            warn!("Failed to send join request to {}: {}", host, e);
            self.notify(NotifyKind::ConnectFailed, 0);
        }
    }

    pub(super) fn update_connecting(&mut self) {
        let wait = CoordinatorConfig::ms(self.config.join_reply_wait_ms);
        if self.elapsed(self.wait_timer) > wait {
            info!("No reply from host within {:?}", wait);
            self.notify(NotifyKind::ConnectNotAvailable, 0);
        }
    }

    /// A participant left, timed out or was dropped by the host
    pub(super) fn client_dropped(&mut self, id: MachineId) {
        if id == self.registry.local_id() || self.registry.is_pending_removal(id) {
            return;
        }
        let Some(participant) = self.registry.get_mut(id) else {
            return;
        };
        if self.state == CoordinatorState::SessionConnecting {
            self.notify(NotifyKind::ConnectNotAvailable, 0);
            return;
        }

        warn!("Dropping participant {} ({})", id, participant.display_name());
        participant.clear_teams();
        let addr = participant.addr;
        self.update_lobby(id);
        if let Some(addr) = addr {
            self.registry.mark_channel_for_removal(addr);
        }
        self.registry.schedule_removal(id);

        let was_host = self.registry.host_id() == Some(id);
        if was_host {
            if self.record.is_system_link() {
                self.notify(NotifyKind::LostHost, 0);
            } else {
                self.start_host_migration(id);
            }
        } else if self.record.is_host() {
            if let Some(addr) = addr {
                self.send_to(addr, &Message::Checkpoint(Checkpoint::Disconnect));
            }
            let removal = MemberInfo {
                machine_id: id,
                addr,
                invited: false,
                players: Vec::new(),
            };
            self.send_to_remotes(&Message::MemberInfo(removal), Some(id));
        }
    }

    /// Leave the session (`PlayerId::NONE` or a local player) or, as host,
    /// kick the machine owning `player`
    pub fn kick_player_from_session(&mut self, player: PlayerId) {
        if matches!(
            self.state,
            CoordinatorState::Initial | CoordinatorState::SessionDisconnecting
        ) {
            debug!("Not in a session, nothing to leave");
            return;
        }

        let local = self.registry.local();
        if player.is_none() || local.has_player(player) {
            info!("Leaving session");
            let removal = Message::MemberInfo(local.removal_info());
            if self.record.is_host() {
                self.send_to_remotes(&removal, None);
            } else if self.state != CoordinatorState::SessionConnecting && self.host_addr().is_some() {
                self.send_to_host(&removal);
            }
            self.switch_to_state(CoordinatorState::SessionDisconnecting);
            return;
        }

        if !self.record.is_host() {
            warn!("Only the host can kick player {}", player);
            return;
        }
        let Some(target) = self.registry.find_by_player_id(player) else {
            warn!("No participant owns player {}", player);
            return;
        };
        info!("Kicking {} ({})", target.id, target.display_name());
        if let Some(addr) = target.addr {
            let removal = Message::MemberInfo(target.removal_info());
            self.send_to(addr, &removal);
        }
    }

    pub(super) fn update_disconnecting(&mut self) {
        let wait = CoordinatorConfig::ms(self.config.disconnect_wait_ms);
        if self.registry.remote_count() == 0 || self.elapsed(self.wait_timer) > wait {
            self.perform_disconnect();
        }
    }

    pub(super) fn perform_disconnect(&mut self) {
        if self.state != CoordinatorState::SessionDisconnecting {
            return;
        }
        if self.entered_lobby {
            self.notify(NotifyKind::Welcome, 0);
        }
        self.switch_to_state(CoordinatorState::Initial);
    }

    /// Change team: `Some(team)` picks a team, `None` moves to the next team
    /// with room (clients ask the host)
    pub fn change_team(&mut self, team: Option<i32>) {
        if !self.state.is_lobby() {
            warn!("Cannot change team while {}", self.state);
            return;
        }
        let local_id = self.registry.local_id();
        match team {
            Some(team) => {
                if team < 0 || team as u32 >= self.total_teams {
                    warn!("No team {} in a {}-team session", team, self.total_teams);
                    return;
                }
                for player in &mut self.registry.local_mut().players {
                    player.team = team;
                }
                let info = self.registry.local().to_member_info();
                self.send_to_session(&Message::MemberInfo(info));
                self.update_lobby(local_id);
            }
            None if self.record.is_host() => self.switch_to_next_open_team(local_id),
            None => self.send_to_host(&Message::Checkpoint(Checkpoint::ChangeTeam)),
        }
    }

    /// Host: move every player of `id` to the next team with room
    pub(super) fn switch_to_next_open_team(&mut self, id: MachineId) {
        let capacity = team_capacity(
            self.record.slots().total(),
            self.total_teams,
            self.config.team_capacity_slack,
        );
        let mut counts = self.registry.team_counts(self.total_teams);
        let Some(participant) = self.registry.get_mut(id) else {
            return;
        };
        for player in &mut participant.players {
            let current = if player.team >= 0 && (player.team as usize) < counts.len() {
                counts[player.team as usize] -= 1;
                player.team as usize
            } else {
                0
            };
            let next = next_open_team(current, &counts, capacity);
            if let Some(count) = counts.get_mut(next) {
                *count += 1;
            }
            player.team = next as i32;
        }
        debug!("{} switched teams", id);
        let info = participant.to_member_info();
        self.send_to_remotes(&Message::MemberInfo(info), None);
        self.update_lobby(id);
    }

    /// Host: change the session properties and wait for every client to
    /// acknowledge. Clients that do not acknowledge in time are dropped.
    pub fn modify_session(&mut self, properties: SessionProperties) {
        if !self.record.is_host() || self.state != CoordinatorState::AcceptingConnections {
            warn!("Cannot modify session while {}", self.state);
            return;
        }
        info!("Modifying session properties");
        self.properties = properties;
        self.apply_topology();
        for participant in self.registry.remotes_mut() {
            participant.modified = false;
        }

        let meta = self.session_meta(Vec::new());
        self.send_to_remotes(
            &Message::JoinResponse(JoinResponse {
                result: JoinResult::ModifySession,
                meta,
            }),
            None,
        );
        self.notify(NotifyKind::ModifyingSession, 0);
        if self.modify_barrier_done() {
            self.end_session_modify();
        }
    }

    pub(super) fn modify_barrier_done(&self) -> bool {
        self.registry
            .remotes()
            .filter(|p| !self.registry.is_pending_removal(p.id))
            .all(|p| p.modified)
    }

    pub(super) fn update_modifying(&mut self) {
        if self.modify_barrier_done() {
            self.end_session_modify();
            return;
        }
        let wait = CoordinatorConfig::ms(self.config.session_modify_wait_ms);
        if self.elapsed(self.send_timer) <= wait {
            return;
        }
        let stragglers: Vec<MachineId> = self
            .registry
            .remotes()
            .filter(|p| !p.modified)
            .map(|p| p.id)
            .collect();
        for id in stragglers {
            warn!("{} did not acknowledge the session change", id);
            self.client_dropped(id);
        }
        self.end_session_modify();
    }

    pub(super) fn end_session_modify(&mut self) {
        if self.state != CoordinatorState::Modifying {
            return;
        }
        self.refresh_advert();
        self.update_lobby_all();
        self.notify(NotifyKind::ModifyingCompletedHost, 0);
    }

    /// Host: begin the pregame countdown. Refused until enough players are
    /// on teams, except on system link.
    pub fn start_game(&mut self) -> bool {
        if !self.record.is_host() || self.state != CoordinatorState::AcceptingConnections {
            warn!("Cannot start game while {}", self.state);
            return false;
        }
        let needed = self.players_needed();
        if !self.record.is_system_link() && needed > 0 {
            info!("Cannot start game, {} more players needed", needed);
            return false;
        }

        info!("Starting game countdown");
        self.send_to_remotes(&Message::Checkpoint(Checkpoint::Pregame), None);
        if self.record.is_arbitrated() {
            self.record.await_registration();
        }
        self.switch_to_state(CoordinatorState::Pregame);
        true
    }

    /// Host: abort the countdown and return everyone to the lobby
    pub fn cancel_start_game(&mut self) {
        if !self.record.is_host() || self.state != CoordinatorState::Pregame {
            warn!("No countdown to cancel while {}", self.state);
            return;
        }
        info!("Cancelling game start");
        self.send_to_remotes(&Message::Checkpoint(Checkpoint::Lobby), None);
        self.return_to_lobby_from_countdown();
    }

    pub(super) fn return_to_lobby_from_countdown(&mut self) {
        if self.state != CoordinatorState::Pregame {
            return;
        }
        self.record.cancel(&mut self.directory);
        self.record.return_to_lobby();
        self.notify(NotifyKind::Countdown, -1);
        if self.record.is_host() {
            self.switch_to_state(CoordinatorState::AcceptingConnections);
        } else {
            self.switch_to_state(CoordinatorState::SessionConnected);
        }
    }

    pub fn session_properties(&self) -> &SessionProperties {
        &self.properties
    }

    /// Replace the properties used by the next host or search
    pub fn set_session_properties(&mut self, properties: SessionProperties) {
        self.properties = properties;
        self.refresh_advert();
    }

    pub fn add_session_property(&mut self, id: &str, value: i64) {
        self.properties.properties.insert(id.to_string(), value);
        self.refresh_advert();
    }

    pub fn add_session_context(&mut self, id: &str, value: &str) {
        self.properties.contexts.insert(id.to_string(), value.to_string());
        self.refresh_advert();
    }
}

/// Integer property as `u32`, saturating at both ends
fn saturate_u32(value: i64) -> u32 {
    u32::try_from(value).unwrap_or(if value < 0 { 0 } else { u32::MAX })
}
