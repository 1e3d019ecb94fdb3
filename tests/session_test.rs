//! Session lobby tests
//!
//! Hosting, searching, joining, team changes, session changes, leaving and
//! kicking, all over the in-memory network and directory.

mod common;

use common::{addr, host_session, join_first_session, pump, World};
use huddle::protocol::{MachineId, PlayerId, SessionProperties, VoiceState};
use huddle::session::directory::{DirectoryOp, QosProfile};
use huddle::session::{CoordinatorState, InviteState, NotifyKind, SessionInvite, SinkEvent};

/// Test: Join a session found through the directory
/// Given a host advertising a session
/// When a client searches and selects it
/// Then both sides see each other in the lobby
#[test]
fn test_directory_search_and_join() {
    let world = World::new();
    let (mut host, host_sink) = world.peer(1, 100);
    let (mut client, client_sink) = world.peer(2, 50);

    host_session(&mut host);
    join_first_session(&mut client, &mut host);

    assert_eq!(client_sink.count(NotifyKind::SearchCompleted), 1);
    assert_eq!(client_sink.count(NotifyKind::CreatedClient), 1);
    assert_eq!(client_sink.count(NotifyKind::ConnectedToSession), 1);
    assert_eq!(client.registry().host_id(), Some(MachineId(100)));
    assert_eq!(client.record().session_id(), host.record().session_id());

    assert_eq!(host.registry().remote_count(), 1);
    assert_eq!(host.record().slots().filled_public, 2);
    assert!(host_sink
        .events()
        .contains(&SinkEvent::VoiceRegister(PlayerId(500))));

    // The directory advert follows the lobby
    let advert = world
        .directory
        .session(host.record().session_id())
        .expect("advertised");
    assert_eq!(advert.filled_public, 2);
}

/// Test: Both players end up on different teams
#[test]
fn test_join_balances_teams() {
    let world = World::new();
    let (mut host, _) = world.peer(1, 100);
    let (mut client, _) = world.peer(2, 50);

    host_session(&mut host);
    join_first_session(&mut client, &mut host);

    let host_team = host.registry().local().players[0].team;
    let client_team = client.registry().local().players[0].team;
    assert!(host_team >= 0 && client_team >= 0);
    assert_ne!(host_team, client_team);
    assert_eq!(host.registry().team_counts(2), vec![1, 1]);
    assert_eq!(host.players_needed(), 0);
}

/// Test: Hosts that cannot be reached are left out of the results
#[test]
fn test_search_skips_unreachable_hosts() {
    let world = World::new();
    let (mut host, _) = world.peer(1, 100);
    let (mut client, sink) = world.peer(2, 50);

    host_session(&mut host);
    world.directory.set_qos(
        addr(1),
        QosProfile {
            contacted: false,
            ..QosProfile::default()
        },
    );

    client.start_client(false);
    pump(&mut [&mut client], 2);

    assert_eq!(sink.count(NotifyKind::FailSearch), 1);
    assert_eq!(client.state(), CoordinatorState::Initial);
    assert!(client.search_results().is_empty());
}

/// Test: A failing directory search returns to the start
#[test]
fn test_search_failure_returns_to_initial() {
    let world = World::new();
    let (mut client, sink) = world.peer(2, 50);

    world.directory.fail_next(DirectoryOp::Search);
    client.start_client(false);
    client.run_frame();

    assert_eq!(sink.count(NotifyKind::FailSearch), 1);
    assert_eq!(client.state(), CoordinatorState::Initial);
}

/// Test: A slow directory search times out
/// Given a directory that never answers in time
/// When the lookup wait elapses
/// Then the search fails once
#[test]
fn test_directory_search_times_out() {
    let world = World::new();
    let (mut client, sink) = world.peer(2, 50);
    world.directory.set_latency(u32::MAX);

    client.start_client(false);
    client.run_frame();
    assert_eq!(client.state(), CoordinatorState::Searching);

    world.clock.advance_ms(client.config().qos_lookup_wait_ms + 1);
    client.run_frame();
    client.run_frame();

    assert_eq!(sink.count(NotifyKind::FailSearch), 1);
    assert_eq!(client.state(), CoordinatorState::Initial);
    assert_eq!(world.directory.outstanding(), 0);
}

/// Test: System-link search on the local network
/// Given a system-link host
/// When a client broadcasts its probes
/// Then the host is found and can be joined
#[test]
fn test_system_link_search_and_join() {
    let world = World::new();
    let (mut host, _) = world.peer(1, 100);
    let (mut client, sink) = world.peer(2, 50);

    host.start_host(true);
    host.run_frame();
    assert_eq!(host.state(), CoordinatorState::AcceptingConnections);

    client.start_client(true);
    assert_eq!(client.state(), CoordinatorState::Searching);
    for _ in 0..4 {
        pump(&mut [&mut host, &mut client], 1);
        world.clock.advance_ms(client.config().system_link_retry_interval_ms + 1);
    }
    pump(&mut [&mut host, &mut client], 1);

    assert_eq!(client.state(), CoordinatorState::Browsing);
    assert_eq!(sink.count(NotifyKind::SearchCompleted), 1);
    let results = client.search_results();
    assert_eq!(results.len(), 1, "repeated replies are deduplicated");
    assert_eq!(results[0].advert.host_addr, addr(1));

    assert!(client.select_session(0));
    pump(&mut [&mut client, &mut host], 3);

    assert_eq!(client.state(), CoordinatorState::SessionConnected);
    assert!(client.record().is_system_link());
    assert_eq!(host.registry().remote_count(), 1);
    // System-link sessions never touch the directory
    assert!(world.directory.sessions().is_empty());
}

/// Test: System-link search with nobody answering
#[test]
fn test_system_link_search_without_hosts_fails() {
    let world = World::new();
    let (mut client, sink) = world.peer(2, 50);

    client.start_client(true);
    world.advance(&mut [&mut client], 5_000, 500);

    assert_eq!(sink.count(NotifyKind::FailSearch), 1);
    assert_eq!(client.state(), CoordinatorState::Initial);
}

/// Test: Client asks the host for the next team with room
#[test]
fn test_client_team_change_goes_through_host() {
    let world = World::new();
    let (mut host, _) = world.peer(1, 100);
    let (mut client, _) = world.peer(2, 50);

    host_session(&mut host);
    join_first_session(&mut client, &mut host);
    let before = client.registry().local().players[0].team;

    client.change_team(None);
    pump(&mut [&mut host, &mut client], 2);

    let after = client.registry().local().players[0].team;
    assert_ne!(after, before);
    let on_host = host
        .registry()
        .get(MachineId(50))
        .map(|p| p.players[0].team);
    assert_eq!(on_host, Some(after));
}

/// Test: Picking an explicit team is relayed to the host
#[test]
fn test_explicit_team_change_is_relayed() {
    let world = World::new();
    let (mut host, _) = world.peer(1, 100);
    let (mut client, _) = world.peer(2, 50);

    host_session(&mut host);
    join_first_session(&mut client, &mut host);
    let host_team = host.registry().local().players[0].team;

    client.change_team(Some(host_team));
    pump(&mut [&mut host, &mut client], 2);

    let on_host = host
        .registry()
        .get(MachineId(50))
        .map(|p| p.players[0].team);
    assert_eq!(on_host, Some(host_team));
}

/// Test: Session changes wait for every client
/// Given a host and a client in the lobby
/// When the host changes the session properties
/// Then the client adopts them and the host returns to the lobby
#[test]
fn test_modify_session_barrier() {
    let world = World::new();
    let (mut host, host_sink) = world.peer(1, 100);
    let (mut client, client_sink) = world.peer(2, 50);

    host_session(&mut host);
    join_first_session(&mut client, &mut host);

    host.modify_session(SessionProperties::default().with_property("PROPERTY_MODE", 3));
    assert_eq!(host.state(), CoordinatorState::Modifying);

    pump(&mut [&mut client, &mut host], 2);

    assert_eq!(host.state(), CoordinatorState::AcceptingConnections);
    assert_eq!(host_sink.count(NotifyKind::ModifyingCompletedHost), 1);
    assert_eq!(client_sink.count(NotifyKind::ModifyingCompletedClient), 1);
    assert_eq!(client.session_properties().property("PROPERTY_MODE"), Some(3));
}

/// Test: Clients that never acknowledge a session change are dropped
#[test]
fn test_modify_session_drops_silent_clients() {
    let world = World::new();
    let (mut host, _) = world.peer(1, 100);
    let (mut client, _) = world.peer(2, 50);

    host_session(&mut host);
    join_first_session(&mut client, &mut host);

    world.network.partition(addr(1), addr(2));
    host.modify_session(SessionProperties::default().with_property("PROPERTY_MODE", 1));
    world.clock.advance_ms(host.config().session_modify_wait_ms + 1);
    host.run_frame();

    assert_eq!(host.state(), CoordinatorState::AcceptingConnections);
    assert_eq!(host.registry().remote_count(), 0);
    assert_eq!(host.record().slots().filled_public, 1);
}

/// Test: Leave a session
/// Given a client in the lobby
/// When it leaves twice
/// Then it says goodbye once and the host forgets it
#[test]
fn test_leave_session_is_idempotent() {
    let world = World::new();
    let (mut host, _) = world.peer(1, 100);
    let (mut client, sink) = world.peer(2, 50);

    host_session(&mut host);
    join_first_session(&mut client, &mut host);

    client.kick_player_from_session(PlayerId::NONE);
    assert_eq!(client.state(), CoordinatorState::SessionDisconnecting);
    client.kick_player_from_session(PlayerId::NONE);

    pump(&mut [&mut host, &mut client], 2);

    assert_eq!(client.state(), CoordinatorState::Initial);
    assert_eq!(sink.count(NotifyKind::Welcome), 1);
    assert_eq!(sink.count(NotifyKind::ClientKicked), 0);
    assert_eq!(host.registry().remote_count(), 0);
    assert_eq!(host.record().slots().filled_public, 1);
}

/// Test: Host kicks a player
#[test]
fn test_host_kicks_player() {
    let world = World::new();
    let (mut host, host_sink) = world.peer(1, 100);
    let (mut client, sink) = world.peer(2, 50);

    host_session(&mut host);
    join_first_session(&mut client, &mut host);

    host.kick_player_from_session(PlayerId(500));
    pump(&mut [&mut client, &mut host], 2);

    assert_eq!(sink.count(NotifyKind::ClientKicked), 1);
    assert_eq!(client.state(), CoordinatorState::Initial);
    assert_eq!(host.registry().remote_count(), 0);
    assert!(host_sink
        .events()
        .contains(&SinkEvent::PlayerRemoved(PlayerId(500))));
}

/// Test: Only the host may kick
#[test]
fn test_client_cannot_kick() {
    let world = World::new();
    let (mut host, _) = world.peer(1, 100);
    let (mut client, _) = world.peer(2, 50);

    host_session(&mut host);
    join_first_session(&mut client, &mut host);

    client.kick_player_from_session(PlayerId(1000));
    pump(&mut [&mut host, &mut client], 2);

    assert_eq!(client.state(), CoordinatorState::SessionConnected);
    assert_eq!(host.registry().remote_count(), 1);
}

/// Test: A third machine learns about everyone already in the lobby
#[test]
fn test_late_joiner_sees_existing_members() {
    let world = World::new();
    let (mut host, _) = world.peer(1, 100);
    let (mut first, first_sink) = world.peer(2, 50);
    let (mut second, _) = world.peer(3, 70);

    host_session(&mut host);
    join_first_session(&mut first, &mut host);
    join_first_session(&mut second, &mut host);
    pump(&mut [&mut first, &mut second, &mut host], 2);

    assert!(second.registry().contains(MachineId(50)));
    assert_eq!(
        second.registry().get(MachineId(50)).and_then(|p| p.addr),
        Some(addr(2))
    );
    assert!(first.registry().contains(MachineId(70)));
    assert!(first_sink
        .events()
        .contains(&SinkEvent::VoiceRegister(PlayerId(700))));
    assert_eq!(host.registry().total_players(), 3);
}

/// Test: Join an invited session after choosing storage
/// Given an invite while storage still has to be picked
/// When the user picks a device
/// Then the client joins the invited session
#[test]
fn test_invite_waits_for_storage_selection() {
    let world = World::new();
    let (mut host, _) = world.peer(1, 100);
    let (mut client, sink) = world.peer(2, 50);

    host_session(&mut host);
    sink.require_storage_selection(true);

    client.join_invite_session(Some(SessionInvite {
        session_id: host.record().session_id(),
        host_addr: addr(1),
        properties: SessionProperties::default(),
        total_teams: 2,
    }));
    assert_eq!(client.invite_state(), InviteState::AwaitingStorage);

    client.run_frame();
    assert_eq!(client.invite_state(), InviteState::AwaitingStorage);
    assert_eq!(client.state(), CoordinatorState::Initial);

    client.storage_selected();
    pump(&mut [&mut client, &mut host], 3);

    assert_eq!(client.invite_state(), InviteState::None);
    assert_eq!(client.state(), CoordinatorState::SessionConnected);
    assert!(client.registry().local().invited);
    assert_eq!(
        host.registry().get(MachineId(50)).map(|p| p.invited),
        Some(true)
    );
}

/// Test: Accepting an invite leaves the current session first
#[test]
fn test_invite_leaves_current_session() {
    let world = World::new();
    let (mut host, _) = world.peer(1, 100);
    let (mut other_host, _) = world.peer(3, 70);
    let (mut client, sink) = world.peer(2, 50);

    host_session(&mut host);
    join_first_session(&mut client, &mut host);
    host_session(&mut other_host);

    client.join_invite_session(Some(SessionInvite {
        session_id: other_host.record().session_id(),
        host_addr: addr(3),
        properties: SessionProperties::default(),
        total_teams: 2,
    }));
    assert_eq!(client.invite_state(), InviteState::Pending);
    assert_eq!(client.state(), CoordinatorState::SessionDisconnecting);

    pump(&mut [&mut host, &mut other_host, &mut client], 4);

    assert_eq!(sink.count(NotifyKind::Welcome), 1);
    assert_eq!(client.state(), CoordinatorState::SessionConnected);
    assert_eq!(client.registry().host_id(), Some(MachineId(70)));
    assert_eq!(host.registry().remote_count(), 0);
    assert_eq!(other_host.registry().remote_count(), 1);
}

/// Test: An invite to the session the client is already in changes nothing
#[test]
fn test_invite_to_current_session_is_ignored() {
    let world = World::new();
    let (mut host, _) = world.peer(1, 100);
    let (mut client, sink) = world.peer(2, 50);

    host_session(&mut host);
    join_first_session(&mut client, &mut host);

    client.join_invite_session(Some(SessionInvite {
        session_id: host.record().session_id(),
        host_addr: addr(1),
        properties: SessionProperties::default(),
        total_teams: 2,
    }));
    pump(&mut [&mut client, &mut host], 2);

    assert_eq!(client.invite_state(), InviteState::None);
    assert_eq!(client.state(), CoordinatorState::SessionConnected);
    assert_eq!(sink.count(NotifyKind::Welcome), 0);
    assert_eq!(host.registry().remote_count(), 1);
}

/// Test: A create the directory never answers gives up
/// Given a directory that never resolves requests
/// When the create wait elapses
/// Then hosting fails once and the request is released
#[test]
fn test_unanswered_create_times_out() {
    let world = World::new();
    let (mut host, sink) = world.peer(1, 100);
    world.directory.set_latency(u32::MAX);

    host.start_host(false);
    host.run_frame();
    assert_eq!(host.state(), CoordinatorState::Creating);

    let wait = host.config().create_wait_ms;
    world.advance(&mut [&mut host], wait + 1_000, 1_000);

    assert_eq!(sink.count(NotifyKind::FailCreate), 1);
    assert_eq!(sink.count(NotifyKind::CreatedHost), 0);
    assert_eq!(host.state(), CoordinatorState::Initial);
    assert_eq!(world.directory.outstanding(), 0);
}

/// Test: Mute lists travel through the host
/// Given three machines in the lobby
/// When one player mutes another
/// Then the muted player's machine learns about it
#[test]
fn test_mute_list_is_relayed_by_host() {
    let world = World::new();
    let (mut host, _) = world.peer(1, 100);
    let (mut first, _) = world.peer(2, 50);
    let (mut second, second_sink) = world.peer(3, 70);

    host_session(&mut host);
    join_first_session(&mut first, &mut host);
    join_first_session(&mut second, &mut host);
    pump(&mut [&mut first, &mut second, &mut host], 2);

    first.set_muted(PlayerId(500), PlayerId(700), true);
    pump(&mut [&mut host, &mut second], 1);

    assert!(first.is_player_muted(PlayerId(500), PlayerId(700)));
    assert!(second.is_player_muted(PlayerId(700), PlayerId(500)));
    assert!(!host.is_player_muted(PlayerId(1000), PlayerId(500)));
    assert!(second_sink
        .events()
        .contains(&SinkEvent::MuteChanged(PlayerId(500), true)));
    assert_eq!(first.mute_list(PlayerId(500)), vec![PlayerId(700)]);
}

/// Test: Voice state changes reach the host's lobby
#[test]
fn test_voice_state_is_announced() {
    let world = World::new();
    let (mut host, _) = world.peer(1, 100);
    let (mut client, _) = world.peer(2, 50);

    host_session(&mut host);
    join_first_session(&mut client, &mut host);

    client.set_voice_state(PlayerId(500), VoiceState::Talking);
    host.run_frame();

    let voice = host
        .registry()
        .get(MachineId(50))
        .map(|p| p.players[0].voice);
    assert_eq!(voice, Some(VoiceState::Talking));
}
