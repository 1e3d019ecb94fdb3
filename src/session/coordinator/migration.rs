//! Host migration
//!
//! When the host goes away every remaining participant elects the machine
//! with the largest id (excluding the old host and any candidate that
//! already failed to take over). The winner promotes itself without a round
//! trip: it migrates the session record, then announces itself with
//! `Migrate::Hosting` until every client acknowledges or the retry budget
//! runs out. Everyone else waits for that announcement, bounded by
//! retry interval × max retries, before discarding the candidate and
//! electing again.

use std::collections::BTreeSet;
use std::net::SocketAddr;

use tracing::{debug, info, warn};

use crate::protocol::{MachineId, Message, Migrate, MigrateKind, SessionMeta};

use super::super::config::CoordinatorConfig;
use super::super::notify::NotifyKind;
use super::{CoordinatorState, SessionCoordinator};

/// Bookkeeping of an ongoing host migration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationState {
    pub old_host: Option<MachineId>,
    pub candidate: Option<MachineId>,
    /// Machines that may no longer become host
    pub excluded: BTreeSet<MachineId>,
    /// State the coordinator was in when migration started
    pub resumed_from: CoordinatorState,
}

/// State to return to once a migration completes
fn resume_state(previous: CoordinatorState, is_host: bool) -> CoordinatorState {
    match previous {
        CoordinatorState::Loading
        | CoordinatorState::ConnectedToServer
        | CoordinatorState::GameLocked
        | CoordinatorState::InGame
        | CoordinatorState::ReportingStats => previous,
        _ if is_host => CoordinatorState::AcceptingConnections,
        _ => CoordinatorState::SessionConnected,
    }
}

impl SessionCoordinator {
    pub fn migration(&self) -> &MigrationState {
        &self.migration
    }

    /// Largest machine id still eligible to host
    pub fn select_new_host(&self) -> Option<MachineId> {
        self.registry
            .members()
            .map(|p| p.id)
            .filter(|id| !self.migration.excluded.contains(id) && !self.registry.is_pending_removal(*id))
            .max()
    }

    pub(super) fn start_host_migration(&mut self, old_host: MachineId) {
        if self.state.is_migrating() {
            self.migration.excluded.insert(old_host);
            if self.migration.candidate == Some(old_host) {
                self.elect_host();
            }
            return;
        }

        info!("Host {} lost, starting migration", old_host);
        if self.state == CoordinatorState::Pregame {
            self.notify(NotifyKind::Countdown, -1);
        }
        self.migration = MigrationState {
            old_host: Some(old_host),
            candidate: None,
            excluded: BTreeSet::from([old_host]),
            resumed_from: self.state,
        };
        self.registry.set_host(None);
        self.switch_to_state(CoordinatorState::HostMigrateStarting);
        self.elect_host();
    }

    fn elect_host(&mut self) {
        loop {
            let Some(candidate) = self.select_new_host() else {
                warn!("No host candidates left");
                self.migration.candidate = None;
                self.notify(NotifyKind::MigrationExhausted, 0);
                return;
            };

            if candidate == self.registry.local_id() {
                self.begin_hosting();
                return;
            }

            let Some(addr) = self.registry.get(candidate).and_then(|p| p.addr) else {
                debug!("Candidate {} has no address, skipping", candidate);
                self.migration.excluded.insert(candidate);
                continue;
            };

            info!("Waiting for {} to take over as host", candidate);
            self.migration.candidate = Some(candidate);
            self.registry.set_host(Some(candidate));
            self.record.set_host_addr(Some(addr));
            let timeout = self.config.heartbeat_timeout();
            self.open_channel(addr, timeout);
            self.switch_to_state(CoordinatorState::HostMigrateWaitingForHost);
            return;
        }
    }

    /// Promote this machine to host
    pub(super) fn begin_hosting(&mut self) {
        info!("Taking over as host");
        let local_id = self.registry.local_id();
        self.migration.candidate = Some(local_id);
        self.record.cancel(&mut self.directory);
        self.record.set_is_host(true);
        self.record.set_host_addr(None);
        self.registry.set_host(Some(local_id));
        self.switch_to_state(CoordinatorState::HostMigrateMigrating);

        let addr = self.transport.local_addr();
        if let Err(e) = self
            .record
            .begin_migrate(&mut self.directory, local_id, addr, &mut self.rng)
        {
            warn!("Session migrate failed to start: {}", e);
            self.notify(NotifyKind::FailMigrate, 0);
        }
    }

    /// Recount slots from the participants this host inherited
    fn rebuild_slots(&mut self) {
        self.record.clear_filled();
        let members: Vec<(MachineId, bool, u32)> = self
            .registry
            .members()
            .map(|p| (p.id, p.invited, p.player_count()))
            .collect();
        for (id, invited, players) in members {
            let slot = match self.record.join(invited, players) {
                Ok(kind) => Some(kind),
                Err(e) => {
                    warn!("No slot for inherited participant {}: {}", id, e);
                    None
                }
            };
            if let Some(participant) = self.registry.get_mut(id) {
                participant.slot = slot;
            }
        }
    }

    /// Migration completed on the directory; announce ourselves
    pub(super) fn begin_waiting_for_clients(&mut self) {
        self.rebuild_slots();
        let timeout = self.config.heartbeat_timeout();
        let addrs: Vec<SocketAddr> = self
            .registry
            .remotes_mut()
            .map(|p| {
                p.migrated = false;
                p.addr
            })
            .collect::<Vec<_>>()
            .into_iter()
            .flatten()
            .collect();
        for addr in addrs {
            self.open_channel(addr, timeout);
        }

        self.switch_to_state(CoordinatorState::HostMigrateWaitingForClients);
        self.refresh_advert();
        self.send_count = 0;
        self.announce_hosting();
    }

    fn announce_hosting(&mut self) {
        let message = Message::Migrate(Migrate {
            kind: MigrateKind::Hosting,
            machine_id: self.registry.local_id(),
            new_host_addr: None,
            meta: self.session_meta(Vec::new()),
        });
        let targets: Vec<SocketAddr> = self
            .registry
            .remotes()
            .filter(|p| !p.migrated && !self.registry.is_pending_removal(p.id))
            .filter_map(|p| p.addr)
            .collect();
        for addr in targets {
            self.send_to(addr, &message);
        }
        self.send_count += 1;
        self.send_timer = self.now();
    }

    fn all_migrated(&self) -> bool {
        self.registry
            .remotes()
            .filter(|p| !self.registry.is_pending_removal(p.id))
            .all(|p| p.migrated)
    }

    pub(super) fn update_waiting_for_clients(&mut self) {
        if self.all_migrated() {
            self.end_migration();
            return;
        }
        let interval = CoordinatorConfig::ms(self.config.host_migration_retry_interval_ms);
        if self.elapsed(self.send_timer) <= interval {
            return;
        }
        if self.send_count > self.config.host_migration_max_retries {
            self.end_migration();
        } else {
            self.announce_hosting();
        }
    }

    pub(super) fn update_waiting_for_host(&mut self) {
        if self.elapsed(self.wait_timer) <= self.config.host_migration_max_wait() {
            return;
        }
        if let Some(candidate) = self.migration.candidate.take() {
            warn!("{} never took over as host", candidate);
            self.migration.excluded.insert(candidate);
            if let Some(addr) = self.registry.get(candidate).and_then(|p| p.addr) {
                self.registry.mark_channel_for_removal(addr);
            }
            self.registry.schedule_removal(candidate);
        }
        self.registry.set_host(None);
        self.elect_host();
    }

    pub(super) fn end_migration(&mut self) {
        if self.record.is_host() {
            let stragglers: Vec<MachineId> = self
                .registry
                .remotes()
                .filter(|p| !p.migrated)
                .map(|p| p.id)
                .collect();
            for id in stragglers {
                warn!("{} did not follow the migration", id);
                self.client_dropped(id);
            }
        }

        let resume = resume_state(self.migration.resumed_from, self.record.is_host());
        info!("Migration complete, resuming {}", resume);
        self.migration = MigrationState::default();
        if self.record.is_host() {
            self.refresh_advert();
            self.update_lobby_all();
        }
        self.switch_to_state(resume);
    }

    fn step_down(&mut self) {
        info!("Standing down as host");
        self.record.cancel(&mut self.directory);
        self.record.set_is_host(false);
        self.migration.excluded.insert(self.registry.local_id());
    }

    pub(super) fn process_migrate(&mut self, from: SocketAddr, migrate: Migrate) {
        let sender = migrate.machine_id;
        if sender == self.registry.local_id() || !self.registry.contains(sender) {
            debug!("Migrate from unknown machine {}", sender);
            return;
        }

        match migrate.kind {
            MigrateKind::Hosting => {
                if self.registry.host_id() == Some(sender) && !self.state.is_migrating() {
                    self.acknowledge_host(from, sender);
                    return;
                }
                if self.record.is_host() {
                    if sender < self.registry.local_id() {
                        debug!("Telling {} to stand by", sender);
                        let standby = Message::Migrate(Migrate {
                            kind: MigrateKind::Standby,
                            machine_id: self.registry.local_id(),
                            new_host_addr: None,
                            meta: SessionMeta::default(),
                        });
                        self.send_to(from, &standby);
                        return;
                    }
                    self.step_down();
                }
                if !self.state.is_migrating() {
                    let old_host = self.registry.host_id();
                    info!("{} announced itself as host", sender);
                    self.migration = MigrationState {
                        old_host,
                        candidate: None,
                        excluded: old_host.into_iter().collect(),
                        resumed_from: self.state,
                    };
                    if let Some(old) = old_host.filter(|old| *old != sender) {
                        if let Some(addr) = self.registry.get(old).and_then(|p| p.addr) {
                            self.registry.mark_channel_for_removal(addr);
                        }
                        self.registry.schedule_removal(old);
                    }
                }
                self.accept_new_host(from, sender, migrate.meta);
            }
            MigrateKind::Migrated => {
                if !self.record.is_host() || self.state != CoordinatorState::HostMigrateWaitingForClients {
                    return;
                }
                if let Some(participant) = self.registry.get_mut(sender) {
                    debug!("{} followed the migration", sender);
                    participant.migrated = true;
                }
                if self.all_migrated() {
                    self.end_migration();
                }
            }
            MigrateKind::Standby => {
                if self.record.is_host() && self.state.is_migrating() && sender > self.registry.local_id() {
                    self.step_down();
                    self.migration.candidate = Some(sender);
                    self.registry.set_host(Some(sender));
                    self.record.set_host_addr(Some(from));
                    self.switch_to_state(CoordinatorState::HostMigrateWaitingForHost);
                }
            }
        }
    }

    fn accept_new_host(&mut self, from: SocketAddr, host: MachineId, meta: SessionMeta) {
        self.migration.candidate = Some(host);
        self.registry.set_host(Some(host));
        if let Some(participant) = self.registry.get_mut(host) {
            participant.addr = Some(from);
        }
        self.record.set_is_host(false);
        self.record.set_host_addr(Some(from));
        if !meta.session_id.is_nil() {
            self.record.set_session_id(meta.session_id);
            self.record.set_nonce(meta.nonce);
        }
        let timeout = self.config.heartbeat_timeout();
        self.open_channel(from, timeout);
        self.acknowledge_host(from, host);
        self.notify(NotifyKind::MigrationCompleted, 0);
    }

    fn acknowledge_host(&mut self, to: SocketAddr, host: MachineId) {
        debug!("Acknowledging {} as host", host);
        let ack = Message::Migrate(Migrate {
            kind: MigrateKind::Migrated,
            machine_id: self.registry.local_id(),
            new_host_addr: None,
            meta: SessionMeta::default(),
        });
        self.send_to(to, &ack);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resume_state_maps_lobby_by_role() {
        assert_eq!(
            resume_state(CoordinatorState::Pregame, true),
            CoordinatorState::AcceptingConnections
        );
        assert_eq!(
            resume_state(CoordinatorState::AcceptingConnections, false),
            CoordinatorState::SessionConnected
        );
        assert_eq!(resume_state(CoordinatorState::InGame, false), CoordinatorState::InGame);
    }
}
