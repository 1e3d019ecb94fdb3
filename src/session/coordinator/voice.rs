//! Voice state and mute lists
//!
//! Each local player keeps a set of players they muted. The set travels as a
//! `Mutelist` to the host, which relays it to everyone else. A player is
//! muted for a local player when either side muted the other.

use std::net::SocketAddr;

use tracing::{debug, warn};

use crate::protocol::{Message, Mutelist, PlayerId, VoiceState};

use super::SessionCoordinator;

impl SessionCoordinator {
    /// Update a local player's voice state and announce it
    pub fn set_voice_state(&mut self, player: PlayerId, voice: VoiceState) {
        let local_id = self.registry.local_id();
        let Some(slot) = self
            .registry
            .local_mut()
            .players
            .iter_mut()
            .find(|p| p.id == player)
        else {
            warn!("{} is not a local player", player);
            return;
        };
        if slot.voice == voice {
            return;
        }
        slot.voice = voice;

        if self.state.is_in_session() {
            let info = self.registry.local().to_member_info();
            self.send_to_session(&Message::MemberInfo(info));
        }
        self.update_lobby(local_id);
    }

    /// Mute or unmute `target` for the local player `local`
    pub fn set_muted(&mut self, local: PlayerId, target: PlayerId, muted: bool) {
        if !self.registry.local().has_player(local) {
            warn!("{} is not a local player", local);
            return;
        }
        let list = self.mutes.entry(local).or_default();
        let changed = if muted { list.insert(target) } else { list.remove(&target) };
        if !changed {
            return;
        }
        debug!("{} {} {}", local, if muted { "muted" } else { "unmuted" }, target);

        if self.state.is_in_session() {
            let message = Message::Mutelist(Mutelist {
                player: local,
                muted: self.mute_list(local),
            });
            self.send_to_session(&message);
        }
    }

    pub fn mute_list(&self, local: PlayerId) -> Vec<PlayerId> {
        self.mutes
            .get(&local)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Whether `local` and `target` should not hear each other
    pub fn is_player_muted(&self, local: PlayerId, target: PlayerId) -> bool {
        let muted = self.mutes.get(&local).is_some_and(|set| set.contains(&target));
        let muted_by = self.muted_by.get(&local).is_some_and(|set| set.contains(&target));
        muted || muted_by
    }

    pub(super) fn process_mutelist(&mut self, from: SocketAddr, list: Mutelist) {
        let Some(owner) = self.registry.find_by_player_id(list.player).map(|p| p.id) else {
            debug!("Mute list for unknown player {}", list.player);
            return;
        };
        if owner == self.registry.local_id() {
            return;
        }
        let is_host = self.record.is_host();
        let trusted = if is_host {
            self.registry.get(owner).and_then(|p| p.addr) == Some(from)
        } else {
            self.host_addr() == Some(from)
        };
        if !trusted {
            warn!("Mute list for {} from unrelated address {}", list.player, from);
            return;
        }

        for local in self.registry.local().player_ids() {
            let now = list.muted.contains(&local);
            let set = self.muted_by.entry(local).or_default();
            let changed = if now {
                set.insert(list.player)
            } else {
                set.remove(&list.player)
            };
            if changed {
                self.sink.mute_changed(list.player, now);
            }
        }

        if is_host {
            self.send_to_remotes(&Message::Mutelist(list), Some(owner));
        }
    }
}
