//! Shared harness: coordinators on an in-memory network and directory,
//! driven by one manual clock.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use huddle::clock::ManualClock;
use huddle::network::MemoryNetwork;
use huddle::session::{
    CoordinatorConfig, CoordinatorState, LocalPlayer, MemoryDirectory, RecordingSink,
    SessionCoordinator, DEFAULT_SYSTEM_LINK_PORT,
};

pub fn addr(n: u8) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, n], DEFAULT_SYSTEM_LINK_PORT))
}

pub struct World {
    pub clock: ManualClock,
    pub network: MemoryNetwork,
    pub directory: MemoryDirectory,
}

impl World {
    pub fn new() -> Self {
        let clock = ManualClock::new();
        let network = MemoryNetwork::new(Arc::new(clock.clone()));
        Self {
            clock,
            network,
            directory: MemoryDirectory::new(),
        }
    }

    pub fn config(machine: u64) -> CoordinatorConfig {
        CoordinatorConfig {
            machine_id: Some(machine),
            rng_seed: Some(machine),
            local_players: vec![LocalPlayer {
                id: machine * 10,
                name: format!("player{}", machine),
            }],
            ..CoordinatorConfig::default()
        }
    }

    /// Coordinator at 10.0.0.`n` with machine id `machine` and one local
    /// player `machine * 10`
    pub fn peer(&self, n: u8, machine: u64) -> (SessionCoordinator, RecordingSink) {
        self.peer_with(n, Self::config(machine))
    }

    pub fn peer_with(&self, n: u8, config: CoordinatorConfig) -> (SessionCoordinator, RecordingSink) {
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

    /// Advance time by `total_ms` in `step_ms` steps, running one frame of
    /// every peer after each step
    pub fn advance(&self, peers: &mut [&mut SessionCoordinator], total_ms: u64, step_ms: u64) {
        let mut elapsed = 0;
        while elapsed < total_ms {
            self.clock.advance_ms(step_ms);
            elapsed += step_ms;
            pump(peers, 1);
        }
    }
}

pub fn pump(peers: &mut [&mut SessionCoordinator], frames: usize) {
    for _ in 0..frames {
        for peer in peers.iter_mut() {
            peer.run_frame();
        }
    }
}

/// Host a directory session and let it settle
pub fn host_session(host: &mut SessionCoordinator) {
    host.start_host(false);
    host.run_frame();
    assert_eq!(host.state(), CoordinatorState::AcceptingConnections);
}

/// Search the directory and join its first session
pub fn join_first_session(client: &mut SessionCoordinator, host: &mut SessionCoordinator) {
    client.start_client(false);
    pump(&mut [&mut *client], 2);
    assert_eq!(client.state(), CoordinatorState::Browsing);
    assert!(client.select_session(0));
    pump(&mut [&mut *client, &mut *host], 3);
    assert_eq!(client.state(), CoordinatorState::SessionConnected);
}
