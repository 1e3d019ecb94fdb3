//! Participant registry
//!
//! Owns one [`Participant`] per machine in the session (local, host and
//! remotes) and the set of channels opened to them. Removal of participants
//! and channels is deferred: handlers schedule it while dispatching, and the
//! coordinator applies it once per frame after dispatch.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;

use tracing::{debug, info, warn};

use crate::network::Transport;
use crate::protocol::{MachineId, MemberInfo, PlayerId, PlayerSlot, NO_TEAM};

/// Which slot pool a participant occupies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Public,
    Private,
}

/// One machine in the session with its local players
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub id: MachineId,
    pub addr: Option<SocketAddr>,
    pub players: Vec<PlayerSlot>,
    pub invited: bool,
    pub registered: bool,
    pub migrated: bool,
    pub modified: bool,
    pub reported_stats: bool,
    pub loaded: bool,
    pub slot: Option<SlotKind>,
}

impl Participant {
    pub fn new(id: MachineId, addr: Option<SocketAddr>, players: Vec<PlayerSlot>) -> Self {
        Self {
            id,
            addr,
            players,
            invited: false,
            registered: false,
            migrated: false,
            modified: false,
            reported_stats: false,
            loaded: false,
            slot: None,
        }
    }

    pub fn from_member_info(info: &MemberInfo) -> Self {
        let mut participant = Self::new(info.machine_id, info.addr, info.players.clone());
        participant.invited = info.invited;
        participant
    }

    pub fn player_count(&self) -> u32 {
        self.players.len() as u32
    }

    pub fn has_player(&self, player: PlayerId) -> bool {
        self.players.iter().any(|p| p.id == player)
    }

    pub fn player_ids(&self) -> Vec<PlayerId> {
        self.players.iter().map(|p| p.id).collect()
    }

    /// First player's display name
    pub fn display_name(&self) -> &str {
        self.players.first().map(|p| p.name.as_str()).unwrap_or("")
    }

    pub fn to_member_info(&self) -> MemberInfo {
        MemberInfo {
            machine_id: self.id,
            addr: self.addr,
            invited: self.invited,
            players: self.players.clone(),
        }
    }

    /// Member info announcing that this participant left
    pub fn removal_info(&self) -> MemberInfo {
        MemberInfo {
            machine_id: self.id,
            addr: self.addr,
            invited: self.invited,
            players: Vec::new(),
        }
    }

    pub fn clear_teams(&mut self) {
        for player in &mut self.players {
            player.team = NO_TEAM;
        }
    }

    /// Reset per-phase flags
    pub fn reset_flags(&mut self) {
        self.registered = false;
        self.migrated = false;
        self.modified = false;
        self.reported_stats = false;
        self.loaded = false;
    }
}

/// Registry of session participants and their channels
pub struct ClientRegistry {
    local: Participant,
    remotes: BTreeMap<MachineId, Participant>,
    host_id: Option<MachineId>,
    pending_removal: BTreeSet<MachineId>,
    channels: BTreeSet<SocketAddr>,
    channels_to_remove: BTreeSet<SocketAddr>,
}

impl ClientRegistry {
    pub fn new(local: Participant) -> Self {
        Self {
            local,
            remotes: BTreeMap::new(),
            host_id: None,
            pending_removal: BTreeSet::new(),
            channels: BTreeSet::new(),
            channels_to_remove: BTreeSet::new(),
        }
    }

    pub fn local(&self) -> &Participant {
        &self.local
    }

    pub fn local_mut(&mut self) -> &mut Participant {
        &mut self.local
    }

    pub fn local_id(&self) -> MachineId {
        self.local.id
    }

    /// Add a remote participant, replacing any entry with the same id
    pub fn add(&mut self, participant: Participant) {
        if participant.id == self.local.id {
            warn!("Refusing to add local machine {} as a remote", participant.id);
            return;
        }
        info!(
            "Adding participant {} ({}) at {:?}",
            participant.id,
            participant.display_name(),
            participant.addr
        );
        self.pending_removal.remove(&participant.id);
        self.remotes.insert(participant.id, participant);
    }

    /// Remove a participant now, marking its channel for removal
    pub fn remove(&mut self, id: MachineId) -> Option<Participant> {
        let removed = self.remotes.remove(&id)?;
        info!("Removing participant {} ({})", id, removed.display_name());
        if let Some(addr) = removed.addr {
            self.mark_channel_for_removal(addr);
        }
        self.pending_removal.remove(&id);
        if self.host_id == Some(id) {
            self.host_id = None;
        }
        Some(removed)
    }

    /// Defer removal of `id` to the next `apply_removals`
    pub fn schedule_removal(&mut self, id: MachineId) {
        if self.remotes.contains_key(&id) {
            debug!("Scheduling removal of {}", id);
            self.pending_removal.insert(id);
        }
    }

    pub fn is_pending_removal(&self, id: MachineId) -> bool {
        self.pending_removal.contains(&id)
    }

    /// Remove every participant scheduled since the last call
    pub fn apply_removals(&mut self) -> Vec<Participant> {
        let ids: Vec<MachineId> = std::mem::take(&mut self.pending_removal).into_iter().collect();
        ids.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    pub fn get(&self, id: MachineId) -> Option<&Participant> {
        if id == self.local.id {
            Some(&self.local)
        } else {
            self.remotes.get(&id)
        }
    }

    pub fn get_mut(&mut self, id: MachineId) -> Option<&mut Participant> {
        if id == self.local.id {
            Some(&mut self.local)
        } else {
            self.remotes.get_mut(&id)
        }
    }

    pub fn contains(&self, id: MachineId) -> bool {
        self.get(id).is_some()
    }

    pub fn find_by_address(&self, addr: SocketAddr) -> Option<&Participant> {
        self.remotes.values().find(|p| p.addr == Some(addr))
    }

    pub fn find_by_player_id(&self, player: PlayerId) -> Option<&Participant> {
        self.members().find(|p| p.has_player(player))
    }

    /// Every participant other than the local one, host included
    pub fn remotes(&self) -> impl Iterator<Item = &Participant> {
        self.remotes.values()
    }

    pub fn remotes_mut(&mut self) -> impl Iterator<Item = &mut Participant> {
        self.remotes.values_mut()
    }

    pub fn for_each_remote(&self, mut f: impl FnMut(&Participant)) {
        for participant in self.remotes.values() {
            f(participant);
        }
    }

    pub fn remote_ids(&self) -> Vec<MachineId> {
        self.remotes.keys().copied().collect()
    }

    pub fn remote_count(&self) -> usize {
        self.remotes.len()
    }

    /// Local participant followed by every remote
    pub fn members(&self) -> impl Iterator<Item = &Participant> {
        std::iter::once(&self.local).chain(self.remotes.values())
    }

    pub fn members_mut(&mut self) -> impl Iterator<Item = &mut Participant> {
        std::iter::once(&mut self.local).chain(self.remotes.values_mut())
    }

    pub fn set_host(&mut self, id: Option<MachineId>) {
        self.host_id = id;
    }

    pub fn host_id(&self) -> Option<MachineId> {
        self.host_id
    }

    pub fn host(&self) -> Option<&Participant> {
        self.host_id.and_then(|id| self.get(id))
    }

    pub fn host_addr(&self) -> Option<SocketAddr> {
        self.host().and_then(|h| h.addr)
    }

    pub fn is_local_host(&self) -> bool {
        self.host_id == Some(self.local.id)
    }

    /// Players per team for teams `0..total_teams`
    pub fn team_counts(&self, total_teams: u32) -> Vec<u32> {
        let mut counts = vec![0u32; total_teams as usize];
        for player in self.members().flat_map(|p| p.players.iter()) {
            if player.team >= 0 && (player.team as usize) < counts.len() {
                counts[player.team as usize] += 1;
            }
        }
        counts
    }

    pub fn total_players(&self) -> u32 {
        self.members().map(Participant::player_count).sum()
    }

    /// Drop every remote and forget the host. Returns the removed participants.
    pub fn clear(&mut self) -> Vec<Participant> {
        let ids = self.remote_ids();
        let removed = ids.into_iter().filter_map(|id| self.remove(id)).collect();
        self.host_id = None;
        self.pending_removal.clear();
        removed
    }

    /// Open a channel to `addr` on `transport`
    pub fn open_channel(&mut self, transport: &mut dyn Transport, addr: SocketAddr, timeout: std::time::Duration) {
        self.channels_to_remove.remove(&addr);
        if self.channels.insert(addr) {
            transport.open(addr);
        }
        transport.set_timeout(addr, timeout);
    }

    pub fn has_channel(&self, addr: SocketAddr) -> bool {
        self.channels.contains(&addr) && !self.channels_to_remove.contains(&addr)
    }

    pub fn channel_addrs(&self) -> Vec<SocketAddr> {
        self.channels.iter().copied().collect()
    }

    pub fn mark_channel_for_removal(&mut self, addr: SocketAddr) {
        if self.channels.contains(&addr) {
            self.channels_to_remove.insert(addr);
        }
    }

    /// Close every channel marked since the last call
    pub fn cleanup_marked_channels(&mut self, transport: &mut dyn Transport) {
        for addr in std::mem::take(&mut self.channels_to_remove) {
            if self.channels.remove(&addr) {
                transport.close(addr);
            }
        }
    }
}
