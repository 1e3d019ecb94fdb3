//! Host migration tests
//!
//! The host of a directory session drops out and the remaining machines
//! elect and adopt a new one.

mod common;

use common::{addr, host_session, join_first_session, pump, World};
use huddle::protocol::MachineId;
use huddle::session::directory::DirectoryOp;
use huddle::session::{CoordinatorState, NotifyKind};

/// Test: The machine with the largest id takes over
/// Given a host with two clients 50 and 70
/// When the host vanishes from the network
/// Then 70 hosts the session and 50 follows it
#[test]
fn test_largest_machine_takes_over() {
    let world = World::new();
    let (mut host, _) = world.peer(1, 100);
    let (mut a, a_sink) = world.peer(2, 50);
    let (mut b, b_sink) = world.peer(3, 70);

    host_session(&mut host);
    join_first_session(&mut a, &mut host);
    join_first_session(&mut b, &mut host);
    pump(&mut [&mut a, &mut b, &mut host], 2);
    let session_id = host.record().session_id();

    world.network.isolate(addr(1));
    let wait = a.config().heartbeat_timeout_ms + 2_000;
    world.advance(&mut [&mut a, &mut b], wait, 500);

    assert!(b.is_host());
    assert_eq!(b.state(), CoordinatorState::AcceptingConnections);
    assert_eq!(b.registry().remote_count(), 1);
    assert_eq!(world.directory.host_of(session_id), Some(MachineId(70)));
    assert_eq!(b_sink.count(NotifyKind::MigrationCompleted), 1);

    assert!(!a.is_host());
    assert_eq!(a.state(), CoordinatorState::SessionConnected);
    assert_eq!(a.registry().host_id(), Some(MachineId(70)));
    assert!(!a.registry().contains(MachineId(100)));
    assert_eq!(a_sink.count(NotifyKind::MigrationCompleted), 1);
    assert_eq!(a.record().host_addr(), Some(addr(3)));

    // The new host keeps the session running
    world.advance(&mut [&mut a, &mut b], 15_000, 500);
    assert_eq!(a.state(), CoordinatorState::SessionConnected);
    assert_eq!(b.registry().remote_count(), 1);
}

/// Test: Migration during a game resumes the game
#[test]
fn test_migration_resumes_game() {
    let world = World::new();
    let (mut host, _) = world.peer(1, 100);
    let (mut a, _) = world.peer(2, 50);
    let (mut b, _) = world.peer(3, 70);

    host_session(&mut host);
    join_first_session(&mut a, &mut host);
    join_first_session(&mut b, &mut host);
    pump(&mut [&mut a, &mut b, &mut host], 2);

    assert!(host.start_game());
    pump(&mut [&mut host, &mut a, &mut b], 1);
    let countdown = host.config().start_countdown_ms;
    world.advance(&mut [&mut host, &mut a, &mut b], countdown + 500, 500);
    host.on_server_ready();
    pump(&mut [&mut host, &mut a, &mut b], 1);
    host.on_level_loading_finished();
    a.on_level_loading_finished();
    b.on_level_loading_finished();
    pump(&mut [&mut host, &mut a, &mut b], 2);
    assert_eq!(a.state(), CoordinatorState::InGame);
    assert_eq!(b.state(), CoordinatorState::InGame);

    world.network.isolate(addr(1));
    let wait = a.config().heartbeat_timeout_ms + 2_000;
    world.advance(&mut [&mut a, &mut b], wait, 500);

    assert!(b.is_host());
    assert_eq!(b.state(), CoordinatorState::InGame);
    assert_eq!(a.state(), CoordinatorState::InGame);
    assert_eq!(a.registry().host_id(), Some(MachineId(70)));
}

/// Test: The last machine standing hosts alone
#[test]
fn test_sole_survivor_hosts() {
    let world = World::new();
    let (mut host, _) = world.peer(1, 100);
    let (mut client, sink) = world.peer(2, 50);

    host_session(&mut host);
    join_first_session(&mut client, &mut host);
    let session_id = host.record().session_id();

    world.network.isolate(addr(1));
    let wait = client.config().heartbeat_timeout_ms + 2_000;
    world.advance(&mut [&mut client], wait, 500);

    assert!(client.is_host());
    assert_eq!(client.state(), CoordinatorState::AcceptingConnections);
    assert_eq!(client.registry().remote_count(), 0);
    assert_eq!(sink.count(NotifyKind::MigrationCompleted), 1);
    assert_eq!(world.directory.host_of(session_id), Some(MachineId(50)));
}

/// Test: A refused directory migration ends the session
/// Given a client about to take over
/// When the directory refuses the migration
/// Then the client leaves the session
#[test]
fn test_failed_migration_disconnects() {
    let world = World::new();
    let (mut host, _) = world.peer(1, 100);
    let (mut client, sink) = world.peer(2, 50);

    host_session(&mut host);
    join_first_session(&mut client, &mut host);

    world.directory.fail_next(DirectoryOp::Migrate);
    world.network.isolate(addr(1));
    let wait = client.config().heartbeat_timeout_ms + 2_000;
    world.advance(&mut [&mut client], wait, 500);

    assert_eq!(sink.count(NotifyKind::FailMigrate), 1);
    assert_eq!(sink.count(NotifyKind::MigrationCompleted), 0);
    assert!(matches!(
        client.state(),
        CoordinatorState::SessionDisconnecting | CoordinatorState::Initial
    ));
}

/// Test: A migration the directory never confirms gives up
/// Given a client taking over from a vanished host
/// When the directory leaves the migration pending past its wait
/// Then the client reports the failed migration and leaves
#[test]
fn test_unanswered_migration_times_out() {
    let world = World::new();
    let (mut host, _) = world.peer(1, 100);
    let (mut client, sink) = world.peer(2, 50);

    host_session(&mut host);
    join_first_session(&mut client, &mut host);

    world.directory.set_latency(u32::MAX);
    world.network.isolate(addr(1));
    let wait = client.config().heartbeat_timeout_ms + 2_000;
    world.advance(&mut [&mut client], wait, 500);
    assert_eq!(client.state(), CoordinatorState::HostMigrateMigrating);
    assert_eq!(world.directory.outstanding(), 1);

    let migrate_wait = client.config().migrate_wait_ms;
    world.advance(&mut [&mut client], migrate_wait + 1_000, 500);

    assert_eq!(sink.count(NotifyKind::FailMigrate), 1);
    assert_eq!(sink.count(NotifyKind::MigrationCompleted), 0);
    assert!(matches!(
        client.state(),
        CoordinatorState::SessionDisconnecting | CoordinatorState::Initial
    ));
    assert_eq!(world.directory.outstanding(), 0);
}
