//! Invite acceptance
//!
//! Accepting an invite can span many frames: the current session has to be
//! left first, and the user may have to pick a storage device. The invite
//! moves through `Pending → Validating → AwaitingStorage → Accepting`, one
//! step per frame at most, and a newer invite replaces an older one at any
//! point.

use std::net::SocketAddr;

use tracing::{debug, info, warn};

use crate::protocol::{clamp_team_count, PlayerId, SessionId, SessionProperties};

use super::super::directory::CreateParams;
use super::super::notify::{NotifyKind, StorageStatus};
use super::{CoordinatorState, SessionCoordinator};

/// Where to find the session an invite points at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInvite {
    pub session_id: SessionId,
    pub host_addr: SocketAddr,
    pub properties: SessionProperties,
    pub total_teams: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InviteState {
    #[default]
    None,
    /// Waiting for the current session to wind down
    Pending,
    Validating,
    /// Waiting for the user to pick a storage device
    AwaitingStorage,
    Accepting,
}

impl SessionCoordinator {
    pub fn invite_state(&self) -> InviteState {
        self.invite_state
    }

    /// Accept an invite, or cancel a pending one with `None`
    pub fn join_invite_session(&mut self, invite: Option<SessionInvite>) {
        let Some(invite) = invite else {
            debug!("Invite cancelled");
            self.cancel_invite();
            return;
        };

        if invite.session_id == self.record.session_id() && self.state.is_in_session() {
            info!("Already in invited session {}", invite.session_id);
            return;
        }

        if self.invite_state == InviteState::None {
            info!("Accepting invite to session {}", invite.session_id);
            self.kick_player_from_session(PlayerId::NONE);
        } else {
            info!("Newer invite to session {} replaces the pending one", invite.session_id);
        }
        self.pending_invite = Some(invite);
        self.storage_ready = false;
        self.invite_state = InviteState::Pending;
        self.update_invite();
    }

    /// The user picked a storage device for the pending invite
    pub fn storage_selected(&mut self) {
        if self.invite_state == InviteState::AwaitingStorage {
            debug!("Storage selected");
            self.storage_ready = true;
        }
    }

    fn cancel_invite(&mut self) {
        self.invite_state = InviteState::None;
        self.pending_invite = None;
        self.storage_ready = false;
    }

    /// Advance the invite as far as it can go this frame
    pub(super) fn update_invite(&mut self) {
        loop {
            match self.invite_state {
                InviteState::None => return,
                InviteState::Pending => {
                    if self.state != CoordinatorState::Initial {
                        return;
                    }
                    self.invite_state = InviteState::Validating;
                }
                InviteState::Validating => {
                    if self.storage_ready || self.sink.check_storage() == StorageStatus::Ready {
                        self.invite_state = InviteState::Accepting;
                    } else {
                        info!("Waiting for storage selection");
                        self.invite_state = InviteState::AwaitingStorage;
                        return;
                    }
                }
                InviteState::AwaitingStorage => {
                    if !self.storage_ready {
                        return;
                    }
                    self.invite_state = InviteState::Accepting;
                }
                InviteState::Accepting => {
                    self.accept_invite();
                    return;
                }
            }
        }
    }

    fn accept_invite(&mut self) {
        let Some(invite) = self.pending_invite.take() else {
            self.cancel_invite();
            return;
        };
        self.cancel_invite();
        info!("Joining invited session {} at {}", invite.session_id, invite.host_addr);

        self.registry.local_mut().invited = true;
        self.properties = invite.properties;
        self.total_teams = clamp_team_count(invite.total_teams);
        self.record.set_is_host(false);
        self.record.set_system_link(false);
        self.record.set_host_addr(Some(invite.host_addr));
        self.record.set_slots(self.config.invite_public_slots, 0);

        let params = CreateParams {
            session_id: Some(invite.session_id),
            host_id: self.registry.local_id(),
            host_addr: invite.host_addr,
            public_slots: self.config.invite_public_slots,
            private_slots: 0,
            total_teams: self.total_teams,
            properties: self.properties.clone(),
            host_data: Default::default(),
        };
        match self.record.begin_create(&mut self.directory, params, &mut self.rng) {
            Ok(()) => self.switch_to_state(CoordinatorState::Creating),
            Err(e) => {
                warn!("Invite session attach failed to start: {}", e);
                self.notify(NotifyKind::FailCreate, 0);
            }
        }
    }
}
