use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::clock::ManualClock;
use crate::network::{Inbound, MemoryNetwork};
use crate::protocol::{
    Checkpoint, MemberInfo, Migrate, MigrateKind, PlayerSlot, SessionMeta, MAX_TEAMS, PROPERTY_GAME_SIZE,
    PROPERTY_NUMBER_OF_TEAMS, PROPERTY_PRIVATE_SLOTS,
};
use crate::session::config::{LocalPlayer, DEFAULT_SYSTEM_LINK_PORT};
use crate::session::directory::MemoryDirectory;
use crate::session::notify::RecordingSink;

fn addr(n: u8) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, n], DEFAULT_SYSTEM_LINK_PORT))
}

/// One clock, network and directory shared by the coordinators of a test
struct Bench {
    clock: ManualClock,
    network: MemoryNetwork,
    directory: MemoryDirectory,
}

impl Bench {
    fn new() -> Self {
        let clock = ManualClock::new();
        let network = MemoryNetwork::new(Arc::new(clock.clone()));
        Self {
            clock,
            network,
            directory: MemoryDirectory::new(),
        }
    }

    /// Coordinator at 10.0.0.`n` with one local player `machine * 10`
    fn coordinator(&self, n: u8, machine: u64) -> (SessionCoordinator, RecordingSink) {
        let config = CoordinatorConfig {
            machine_id: Some(machine),
            rng_seed: Some(machine),
            local_players: vec![LocalPlayer {
                id: machine * 10,
                name: format!("player{}", machine),
            }],
            ..CoordinatorConfig::default()
        };
        let sink = RecordingSink::new();
        let coordinator = SessionCoordinator::new(
            config,
            Box::new(self.network.endpoint(addr(n))),
            Box::new(self.directory.clone()),
            Box::new(sink.clone()),
            Arc::new(self.clock.clone()),
        )
        .expect("valid config");
        (coordinator, sink)
    }
}

fn remote(id: u64, n: u8) -> Participant {
    Participant::new(
        MachineId(id),
        Some(addr(n)),
        vec![PlayerSlot::new(PlayerId(id * 10), format!("player{}", id))],
    )
}

#[test]
fn test_new_rejects_invalid_config() {
    let bench = Bench::new();
    let config = CoordinatorConfig {
        local_players: Vec::new(),
        ..CoordinatorConfig::default()
    };
    let result = SessionCoordinator::new(
        config,
        Box::new(bench.network.endpoint(addr(1))),
        Box::new(bench.directory.clone()),
        Box::new(RecordingSink::new()),
        Arc::new(bench.clock.clone()),
    );
    assert!(matches!(result, Err(SessionError::Config(_))));
}

#[test]
fn test_host_reaches_accepting_connections() {
    let bench = Bench::new();
    let (mut host, sink) = bench.coordinator(1, 100);

    host.start_host(false);
    assert_eq!(host.state(), CoordinatorState::Creating);

    host.run_frame();
    assert_eq!(host.state(), CoordinatorState::AcceptingConnections);
    assert_eq!(sink.count(NotifyKind::CreatedHost), 1);
    assert_eq!(host.record().slots().filled_public, 1);
    assert_eq!(bench.directory.sessions().len(), 1);
    assert!(host.registry().is_local_host());
}

#[test]
fn test_failed_create_returns_to_initial() {
    let bench = Bench::new();
    bench.directory.fail_next(crate::session::directory::DirectoryOp::Create);
    let (mut host, sink) = bench.coordinator(1, 100);

    host.start_host(false);
    host.run_frame();

    assert_eq!(host.state(), CoordinatorState::Initial);
    assert_eq!(sink.count(NotifyKind::FailCreate), 1);
    assert!(bench.directory.sessions().is_empty());
}

#[test]
fn test_leaving_browsing_discards_results() {
    let bench = Bench::new();
    let (mut host, _) = bench.coordinator(1, 100);
    let (mut client, _) = bench.coordinator(2, 50);

    host.start_host(false);
    host.run_frame();
    client.start_client(false);
    client.run_frame();
    client.run_frame();
    assert_eq!(client.state(), CoordinatorState::Browsing);
    assert_eq!(client.search_results().len(), 1);

    client.cancel_operation();
    assert_eq!(client.state(), CoordinatorState::Initial);
    assert!(client.search_results.is_empty());
}

/// Given a client whose host never answers
/// When the join reply wait elapses
/// Then exactly one ConnectNotAvailable is reported
#[test]
fn test_join_timeout_notifies_once() {
    let bench = Bench::new();
    let (mut client, sink) = bench.coordinator(2, 50);

    client.record.set_host_addr(Some(addr(9)));
    client.switch_to_state(CoordinatorState::SessionConnecting);
    client.run_frame();
    assert_eq!(client.state(), CoordinatorState::SessionConnecting);

    bench.clock.advance_ms(15_001);
    client.run_frame();
    client.run_frame();

    assert_eq!(sink.count(NotifyKind::ConnectNotAvailable), 1);
    assert_eq!(client.state(), CoordinatorState::Initial);
}

#[test]
fn test_uninvited_join_refused_when_public_slots_full() {
    let bench = Bench::new();
    let (mut host, _) = bench.coordinator(1, 100);
    let (mut client, sink) = bench.coordinator(2, 50);

    host.set_session_properties(
        SessionProperties::default()
            .with_property(PROPERTY_GAME_SIZE, 2)
            .with_property(PROPERTY_PRIVATE_SLOTS, 1),
    );
    host.start_host(false);
    host.run_frame();
    assert_eq!(host.record().slots().open_public(), 0);
    assert_eq!(host.record().slots().open_private(), 1);

    client.record.set_host_addr(Some(addr(1)));
    client.switch_to_state(CoordinatorState::SessionConnecting);
    for _ in 0..2 {
        host.run_frame();
        client.run_frame();
    }

    assert_eq!(sink.count(NotifyKind::ConnectSessionFull), 1);
    assert_eq!(client.state(), CoordinatorState::Initial);
    assert_eq!(host.registry().remote_count(), 0);
}

#[test]
fn test_invited_join_takes_private_slot() {
    let bench = Bench::new();
    let (mut host, _) = bench.coordinator(1, 100);
    let (mut client, _) = bench.coordinator(2, 50);

    host.set_session_properties(
        SessionProperties::default()
            .with_property(PROPERTY_GAME_SIZE, 2)
            .with_property(PROPERTY_PRIVATE_SLOTS, 1),
    );
    host.start_host(false);
    host.run_frame();

    client.registry.local_mut().invited = true;
    client.record.set_host_addr(Some(addr(1)));
    client.switch_to_state(CoordinatorState::SessionConnecting);
    for _ in 0..2 {
        host.run_frame();
        client.run_frame();
    }

    assert_eq!(client.state(), CoordinatorState::SessionConnected);
    assert_eq!(host.record().slots().filled_private, 1);
    assert_eq!(
        host.registry().get(MachineId(50)).and_then(|p| p.slot),
        Some(super::super::registry::SlotKind::Private)
    );
}

/// Given remotes {5, 7} with 5 hosting and local machine 12
/// When the host drops
/// Then the local machine promotes itself
#[test]
fn test_largest_machine_id_wins_migration() {
    let bench = Bench::new();
    let (mut client, _) = bench.coordinator(12, 12);

    client.registry.add(remote(5, 5));
    client.registry.add(remote(7, 7));
    client.registry.set_host(Some(MachineId(5)));
    client.state = CoordinatorState::SessionConnected;

    assert_eq!(client.select_new_host(), Some(MachineId(12)));
    client.client_dropped(MachineId(5));

    assert_eq!(client.state(), CoordinatorState::HostMigrateMigrating);
    assert!(client.is_host());
    assert_eq!(client.migration().old_host, Some(MachineId(5)));
    assert_eq!(client.migration().resumed_from, CoordinatorState::SessionConnected);
}

#[test]
fn test_smaller_machine_waits_for_new_host() {
    let bench = Bench::new();
    let (mut client, _) = bench.coordinator(3, 3);

    client.registry.add(remote(5, 5));
    client.registry.add(remote(7, 7));
    client.registry.set_host(Some(MachineId(5)));
    client.state = CoordinatorState::SessionConnected;

    client.client_dropped(MachineId(5));

    assert_eq!(client.state(), CoordinatorState::HostMigrateWaitingForHost);
    assert_eq!(client.migration().candidate, Some(MachineId(7)));
    assert_eq!(client.registry().host_id(), Some(MachineId(7)));
    assert!(!client.is_host());
}

/// Given a candidate host that never announces itself
/// When the migration wait elapses twice
/// Then each silent candidate is skipped until the local machine wins
#[test]
fn test_migration_skips_silent_candidates() {
    let bench = Bench::new();
    let (mut client, sink) = bench.coordinator(3, 3);

    client.registry.add(remote(5, 5));
    client.registry.add(remote(7, 7));
    client.registry.add(remote(9, 9));
    client.registry.set_host(Some(MachineId(5)));
    client.state = CoordinatorState::SessionConnected;
    client.client_dropped(MachineId(5));
    client.run_frame();
    assert_eq!(client.migration().candidate, Some(MachineId(9)));

    bench.clock.advance(client.config().host_migration_max_wait() + Duration::from_millis(1));
    client.run_frame();
    assert_eq!(client.migration().candidate, Some(MachineId(7)));

    bench.clock.advance(client.config().host_migration_max_wait() + Duration::from_millis(1));
    client.run_frame();

    // Only the local machine is left, so it takes over
    assert_eq!(client.state(), CoordinatorState::HostMigrateMigrating);
    assert_eq!(sink.count(NotifyKind::MigrationExhausted), 0);
}

#[test]
fn test_system_link_host_loss_is_not_migrated() {
    let bench = Bench::new();
    let (mut client, sink) = bench.coordinator(3, 3);

    client.record.set_system_link(true);
    client.registry.add(remote(5, 5));
    client.registry.set_host(Some(MachineId(5)));
    client.state = CoordinatorState::SessionConnected;

    client.client_dropped(MachineId(5));

    assert_eq!(sink.count(NotifyKind::LostHost), 1);
    assert_eq!(client.state(), CoordinatorState::SessionDisconnecting);
}

#[test]
fn test_newer_invite_replaces_pending_one() {
    let bench = Bench::new();
    let (mut client, _) = bench.coordinator(2, 50);

    client.state = CoordinatorState::Searching;
    let first = SessionInvite {
        session_id: SessionId::new(),
        host_addr: addr(1),
        properties: SessionProperties::default(),
        total_teams: 2,
    };
    let second = SessionInvite {
        session_id: SessionId::new(),
        host_addr: addr(4),
        ..first.clone()
    };

    client.join_invite_session(Some(first));
    assert_eq!(client.invite_state(), InviteState::Pending);
    client.join_invite_session(Some(second.clone()));
    assert_eq!(client.pending_invite.as_ref(), Some(&second));

    client.join_invite_session(None);
    assert_eq!(client.invite_state(), InviteState::None);
    assert!(client.pending_invite.is_none());
}

#[test]
fn test_countdown_ticks_whole_seconds() {
    let bench = Bench::new();
    let (mut host, sink) = bench.coordinator(1, 100);

    host.start_host(true);
    host.run_frame();
    assert!(host.start_game());

    for _ in 0..31 {
        host.run_frame();
        bench.clock.advance_ms(500);
    }
    host.run_frame();

    let countdown: Vec<i64> = sink
        .notifications()
        .into_iter()
        .filter(|(kind, _)| *kind == NotifyKind::Countdown)
        .map(|(_, param)| param)
        .collect();
    let expected: Vec<i64> = (0..=15).rev().collect();
    assert_eq!(countdown, expected);
    assert_eq!(host.state(), CoordinatorState::Loading);
}

#[test]
fn test_switch_to_pregame_stamps_countdown_start() {
    let bench = Bench::new();
    let (mut host, _) = bench.coordinator(1, 100);

    bench.clock.advance_ms(4_000);
    host.switch_to_state(CoordinatorState::Pregame);
    assert_eq!(host.countdown_start, Duration::from_millis(4_000));
    assert_eq!(host.last_countdown, None);
}

/// Host at 10.0.0.1 (machine 100) with client 50 at 10.0.0.2 joined
fn joined_pair(bench: &Bench) -> (SessionCoordinator, RecordingSink, SessionCoordinator) {
    let (mut host, host_sink) = bench.coordinator(1, 100);
    let (mut client, _) = bench.coordinator(2, 50);

    host.start_host(false);
    host.run_frame();
    client.record.set_host_addr(Some(addr(1)));
    client.switch_to_state(CoordinatorState::SessionConnecting);
    for _ in 0..2 {
        host.run_frame();
        client.run_frame();
    }
    assert_eq!(client.state(), CoordinatorState::SessionConnected);
    assert!(host.registry().contains(MachineId(50)));
    (host, host_sink, client)
}

fn from_client(message: Message) -> Inbound {
    Inbound {
        from: addr(2),
        message,
        connectionless: false,
    }
}

/// Given a host with one client
/// When the client sends checkpoints only a host may send
/// Then the host ignores them and keeps the session
#[test]
fn test_host_ignores_host_only_checkpoints_from_clients() {
    let bench = Bench::new();
    let (mut host, sink, _client) = joined_pair(&bench);

    for checkpoint in [
        Checkpoint::Disconnect,
        Checkpoint::Postgame,
        Checkpoint::ReportStats,
        Checkpoint::Lobby,
        Checkpoint::Connect,
        Checkpoint::Pregame,
    ] {
        host.dispatch(from_client(Message::Checkpoint(checkpoint)));
    }
    host.run_frame();

    assert_eq!(host.state(), CoordinatorState::AcceptingConnections);
    assert!(host.is_host());
    assert_eq!(host.registry().remote_count(), 1);
    assert_eq!(sink.count(NotifyKind::ClientKicked), 0);
    assert_eq!(sink.count(NotifyKind::ConnectedToServer), 0);
}

/// Given a joined client with one player
/// When it announces more players than a machine may carry
/// Then the host keeps the old player list and slot counts
#[test]
fn test_member_info_over_player_limit_is_rejected() {
    let bench = Bench::new();
    let (mut host, _, _client) = joined_pair(&bench);
    let slots = host.record().slots();

    let players = (1..=6)
        .map(|i| PlayerSlot::new(PlayerId(500 + i), format!("extra{}", i)))
        .collect();
    host.dispatch(from_client(Message::MemberInfo(MemberInfo {
        machine_id: MachineId(50),
        addr: Some(addr(2)),
        invited: false,
        players,
    })));

    let participant = host.registry().get(MachineId(50)).expect("still a member");
    assert_eq!(participant.player_count(), 1);
    assert_eq!(host.record().slots(), slots);
}

#[test]
fn test_oversized_properties_saturate() {
    let bench = Bench::new();
    let (mut host, _) = bench.coordinator(1, 100);

    host.set_session_properties(
        SessionProperties::default()
            .with_property(PROPERTY_GAME_SIZE, 1 << 32)
            .with_property(PROPERTY_PRIVATE_SLOTS, -3)
            .with_property(PROPERTY_NUMBER_OF_TEAMS, i64::MAX),
    );
    host.apply_topology();

    assert_eq!(host.record().slots().total_public, u32::MAX);
    assert_eq!(host.record().slots().total_private, 0);
    assert_eq!(host.total_teams(), MAX_TEAMS);
}

/// Given a machine that took over as host
/// When a larger machine tells it to stand by and then never hosts
/// Then no candidate is left and exhaustion is reported once
#[test]
fn test_migration_exhausted_when_no_candidate_remains() {
    let bench = Bench::new();
    let (mut client, sink) = bench.coordinator(3, 3);

    client.registry.add(remote(1, 1));
    client.registry.set_host(Some(MachineId(1)));
    client.state = CoordinatorState::SessionConnected;
    client.client_dropped(MachineId(1));
    assert_eq!(client.state(), CoordinatorState::HostMigrateMigrating);

    client.registry.add(remote(5, 5));
    client.process_migrate(
        addr(5),
        Migrate {
            kind: MigrateKind::Standby,
            machine_id: MachineId(5),
            new_host_addr: None,
            meta: SessionMeta::default(),
        },
    );
    assert_eq!(client.state(), CoordinatorState::HostMigrateWaitingForHost);
    assert!(!client.is_host());

    bench.clock.advance(client.config().host_migration_max_wait() + Duration::from_millis(1));
    client.run_frame();
    assert_eq!(sink.count(NotifyKind::MigrationExhausted), 1);
    assert_eq!(sink.count(NotifyKind::LostHost), 0);
    assert_eq!(client.state(), CoordinatorState::SessionDisconnecting);

    client.run_frame();
    assert_eq!(client.state(), CoordinatorState::Initial);
    assert_eq!(sink.count(NotifyKind::MigrationExhausted), 1);
}

/// Given a registration the directory never answers
/// When the register wait elapses
/// Then registration fails and the request is released
#[test]
fn test_unanswered_registration_times_out() {
    let bench = Bench::new();
    let (mut client, sink) = bench.coordinator(2, 50);
    bench.directory.set_latency(u32::MAX);

    client.state = CoordinatorState::SessionConnected;
    client
        .record
        .begin_register(&mut client.directory, MachineId(50))
        .expect("register starts");
    client.run_frame();
    assert_eq!(bench.directory.outstanding(), 1);

    bench.clock.advance_ms(client.config().register_reply_wait_ms + 1);
    client.run_frame();

    assert_eq!(sink.count(NotifyKind::FailRegister), 1);
    assert_eq!(client.state(), CoordinatorState::Initial);
    assert_eq!(bench.directory.outstanding(), 0);
}

