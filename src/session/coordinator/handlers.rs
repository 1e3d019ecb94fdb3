//! Inbound message dispatch

use std::net::SocketAddr;

use tracing::{debug, info, trace, warn};

use crate::network::Inbound;
use crate::protocol::{
    clamp_team_count, Checkpoint, JoinResponse, JoinResult, MachineId, MemberInfo, Message, PlayerId, SessionMeta,
    MAX_PLAYERS_PER_PARTICIPANT,
};

use super::super::notify::NotifyKind;
use super::super::registry::Participant;
use super::{CoordinatorState, SessionCoordinator};

impl SessionCoordinator {
    pub(super) fn dispatch(&mut self, inbound: Inbound) {
        let Inbound {
            from,
            message,
            connectionless,
        } = inbound;
        trace!("{} from {}", message.name(), from);

        if connectionless
            && !matches!(
                message,
                Message::SystemLinkSearch { .. }
                    | Message::SystemLinkReply { .. }
                    | Message::JoinRequest(_)
                    | Message::JoinResponse(_)
            )
        {
            debug!("Dropping connectionless {} from {}", message.name(), from);
            return;
        }

        match message {
            Message::SystemLinkSearch { nonce, criteria } => self.handle_system_link_search(from, nonce, &criteria),
            Message::SystemLinkReply { nonce, advert } => self.handle_system_link_reply(from, nonce, advert),
            Message::JoinRequest(request) => self.handle_join_request(from, request),
            Message::JoinResponse(response) => self.process_join_response(from, response),
            Message::MemberInfo(info) => self.process_client_info(from, info),
            Message::Checkpoint(checkpoint) => self.process_checkpoint(from, checkpoint),
            Message::Migrate(migrate) => self.process_migrate(from, migrate),
            Message::Mutelist(list) => self.process_mutelist(from, list),
            Message::RegisterResponse { machine_id } => self.process_register_response(from, machine_id),
            Message::Heartbeat => {}
        }
    }

    fn sender_id(&self, from: SocketAddr) -> Option<MachineId> {
        self.registry.find_by_address(from).map(|p| p.id)
    }

    fn process_join_response(&mut self, from: SocketAddr, response: JoinResponse) {
        match response.result {
            JoinResult::NotHosting | JoinResult::Full => {
                if self.state != CoordinatorState::SessionConnecting || self.record.host_addr() != Some(from) {
                    debug!("Ignoring join refusal from {}", from);
                    return;
                }
                info!("Join refused by {}: {:?}", from, response.result);
                let kind = if response.result == JoinResult::Full {
                    NotifyKind::ConnectSessionFull
                } else {
                    NotifyKind::ConnectNotAvailable
                };
                self.notify(kind, 0);
            }
            JoinResult::Approved | JoinResult::ApprovedJoinInProgress => {
                if self.state != CoordinatorState::SessionConnecting || self.record.host_addr() != Some(from) {
                    debug!("Ignoring join approval from {} while {}", from, self.state);
                    return;
                }
                self.apply_join_approval(from, response.meta);
                if response.result == JoinResult::Approved {
                    info!("Joined session {}", self.record.session_id());
                    self.notify(NotifyKind::ConnectedToSession, 0);
                    self.update_lobby_all();
                } else {
                    info!("Joined game in progress, waiting for connect");
                    self.wait_timer = self.now();
                }
            }
            JoinResult::ModifySession => self.process_modify_response(from, response.meta),
        }
    }

    fn apply_join_approval(&mut self, from: SocketAddr, meta: SessionMeta) {
        self.registry.set_host(Some(meta.host_id));
        if !self.registry.contains(meta.host_id) {
            self.registry.add(Participant::new(meta.host_id, Some(from), Vec::new()));
        }

        self.record.set_session_id(meta.session_id);
        self.record.set_nonce(meta.nonce);
        self.record.set_arbitrated(meta.arbitrated);
        self.record.set_owner_index(meta.owner_index);
        self.record.set_host_addr(Some(from));
        self.properties = meta.properties;
        self.total_teams = clamp_team_count(meta.total_teams);

        for (player, team) in self.registry.local_mut().players.iter_mut().zip(meta.teams) {
            player.team = team;
        }
        let local_id = self.registry.local_id();
        self.add_players_to_session(local_id);
    }

    fn process_modify_response(&mut self, from: SocketAddr, meta: SessionMeta) {
        if self.record.is_host() {
            if self.state != CoordinatorState::Modifying {
                return;
            }
            let Some(id) = self.sender_id(from) else {
                return;
            };
            if let Some(participant) = self.registry.get_mut(id) {
                debug!("{} acknowledged session change", id);
                participant.modified = true;
            }
            if self.modify_barrier_done() {
                self.end_session_modify();
            }
        } else if self.state == CoordinatorState::SessionConnected && self.host_addr() == Some(from) {
            info!("Host changed session properties");
            self.properties = meta.properties;
            self.total_teams = clamp_team_count(meta.total_teams);
            let reply = Message::JoinResponse(JoinResponse {
                result: JoinResult::ModifySession,
                meta: SessionMeta {
                    host_id: self.registry.local_id(),
                    ..SessionMeta::default()
                },
            });
            self.send_to(from, &reply);
            self.notify(NotifyKind::ModifyingCompletedClient, 0);
        }
    }

    /// Apply a participant announcement. Empty player lists mean the
    /// participant left.
    fn process_client_info(&mut self, from: SocketAddr, info: MemberInfo) {
        if self.state == CoordinatorState::Initial {
            return;
        }

        let is_host = self.record.is_host();
        if is_host && self.sender_id(from) != Some(info.machine_id) {
            warn!("MemberInfo for {} from unrelated address {}", info.machine_id, from);
            return;
        }
        if !is_host && self.host_addr() != Some(from) {
            debug!("Ignoring MemberInfo from non-host {}", from);
            return;
        }
        if is_host && info.players.len() > MAX_PLAYERS_PER_PARTICIPANT {
            warn!("MemberInfo from {} with {} players", info.machine_id, info.players.len());
            return;
        }

        let local_id = self.registry.local_id();
        if info.machine_id == local_id {
            self.apply_own_info(info);
            return;
        }
        if self.registry.is_pending_removal(info.machine_id) {
            return;
        }

        let Some(existing) = self.registry.get(info.machine_id) else {
            if info.players.is_empty() {
                return;
            }
            if is_host {
                warn!("MemberInfo for unknown machine {}", info.machine_id);
                return;
            }
            let mut participant = Participant::from_member_info(&info);
            participant.addr = participant.addr.or(Some(from));
            let id = participant.id;
            self.registry.add(participant);
            self.add_players_to_session(id);
            return;
        };

        let id = existing.id;
        if info.players.is_empty() {
            self.client_dropped(id);
            return;
        }

        let old_ids = existing.player_ids();
        let new_ids: Vec<PlayerId> = info.players.iter().map(|p| p.id).collect();
        let players_changed = old_ids != new_ids;
        let lobby_changed = existing
            .players
            .iter()
            .zip(&info.players)
            .any(|(old, new)| old.team != new.team || old.voice != new.voice);
        let old_count = existing.player_count();
        let invited = existing.invited;
        let slot = existing.slot;

        if is_host && new_ids.len() as u32 != old_count {
            if let Some(kind) = slot {
                self.record.leave(kind, old_count);
            }
            match self.record.join(invited, new_ids.len() as u32) {
                Ok(kind) => {
                    if let Some(participant) = self.registry.get_mut(id) {
                        participant.slot = Some(kind);
                    }
                }
                Err(e) => {
                    warn!("Ignoring player change from {}: {}", id, e);
                    if let Some(kind) = slot {
                        if let Err(e) = self.record.occupy(kind, old_count) {
                            warn!("Could not restore slots of {}: {}", id, e);
                        }
                    }
                    return;
                }
            }
        }

        let Some(participant) = self.registry.get_mut(id) else {
            return;
        };
        participant.players = info.players;
        if participant.addr.is_none() {
            participant.addr = info.addr.or(Some(from));
        }
        let relay = participant.to_member_info();

        if players_changed {
            let removed: Vec<PlayerId> = old_ids.into_iter().filter(|p| !new_ids.contains(p)).collect();
            self.remove_players_from_session(&removed);
            self.add_players_to_session(id);
        } else if lobby_changed {
            self.update_lobby(id);
        }

        if is_host {
            self.send_to_remotes(&Message::MemberInfo(relay), Some(id));
            self.refresh_advert();
        }
    }

    /// The host echoed our own info: either a kick or a team assignment
    fn apply_own_info(&mut self, info: MemberInfo) {
        if info.players.is_empty() {
            if self.state != CoordinatorState::SessionDisconnecting {
                info!("Kicked from session");
                self.kick_player_from_session(PlayerId::NONE);
                self.notify(NotifyKind::ClientKicked, 0);
            }
            return;
        }

        let mut changed = false;
        for player in &mut self.registry.local_mut().players {
            if let Some(update) = info.players.iter().find(|p| p.id == player.id) {
                if player.team != update.team {
                    player.team = update.team;
                    changed = true;
                }
            }
        }
        if changed {
            let local_id = self.registry.local_id();
            self.update_lobby(local_id);
        }
    }

    fn process_checkpoint(&mut self, from: SocketAddr, checkpoint: Checkpoint) {
        let Some(sender) = self.sender_id(from) else {
            debug!("Checkpoint {:?} from unknown address {}", checkpoint, from);
            return;
        };
        let is_host = self.record.is_host();
        if !is_host && self.registry.host_id() != Some(sender) {
            debug!("Ignoring checkpoint {:?} from non-host {}", checkpoint, sender);
            return;
        }
        // Clients only report progress; everything else is the host's to send
        if is_host
            && !matches!(
                checkpoint,
                Checkpoint::ChangeTeam | Checkpoint::LoadingComplete | Checkpoint::ReportingComplete
            )
        {
            warn!("Ignoring host-only checkpoint {:?} from client {}", checkpoint, sender);
            return;
        }
        debug!("Checkpoint {:?} from {}", checkpoint, sender);

        match checkpoint {
            Checkpoint::ChangeTeam => {
                if is_host && self.state == CoordinatorState::AcceptingConnections {
                    self.switch_to_next_open_team(sender);
                }
            }
            Checkpoint::Pregame => {
                if is_host || self.state != CoordinatorState::SessionConnected {
                    return;
                }
                if self.record.is_arbitrated() {
                    let local_id = self.registry.local_id();
                    if let Err(e) = self.record.begin_register(&mut self.directory, local_id) {
                        warn!("Could not register for arbitration: {}", e);
                    }
                }
                self.switch_to_state(CoordinatorState::Pregame);
            }
            Checkpoint::Lobby => self.return_to_lobby_from_countdown(),
            Checkpoint::Connect => self.handle_connect(),
            Checkpoint::LoadingComplete => self.handle_loading_complete(sender),
            Checkpoint::ReportStats => self.begin_stats_reporting(),
            Checkpoint::ReportingComplete => {
                if is_host && self.state == CoordinatorState::ReportingStats {
                    if let Some(participant) = self.registry.get_mut(sender) {
                        participant.reported_stats = true;
                    }
                    self.end_stats_reporting(false);
                }
            }
            Checkpoint::Postgame => self.enter_postgame(),
            Checkpoint::Disconnect => {
                if self.state != CoordinatorState::SessionDisconnecting {
                    info!("Host disconnected us");
                    self.notify(NotifyKind::ClientKicked, 0);
                    self.switch_to_state(CoordinatorState::SessionDisconnecting);
                }
                self.perform_disconnect();
            }
        }
    }

    fn process_register_response(&mut self, from: SocketAddr, machine_id: MachineId) {
        if !self.record.is_host() || self.sender_id(from) != Some(machine_id) {
            return;
        }
        if let Some(participant) = self.registry.get_mut(machine_id) {
            debug!("{} registered for arbitration", machine_id);
            participant.registered = true;
        }
    }
}
