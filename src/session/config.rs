//! Coordinator configuration
//!
//! Every timing and sizing knob of the coordinator lives here. Configuration
//! is plain JSON, e.g. `huddle.json`; missing fields take their defaults.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::{PlayerId, MAX_PLAYERS_PER_PARTICIPANT};

/// Default UDP port for system-link discovery
pub const DEFAULT_SYSTEM_LINK_PORT: u16 = 27031;

/// A player signed in on this machine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LocalPlayer {
    pub id: u64,
    pub name: String,
}

impl LocalPlayer {
    pub fn player_id(&self) -> PlayerId {
        PlayerId(self.id)
    }
}

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Players required before the host may start
    pub min_players: u32,
    pub max_spectators: u32,
    /// Extra players a team may hold beyond an even split
    pub team_capacity_slack: u32,

    pub heartbeat_interval_lobby_ms: u64,
    pub heartbeat_interval_game_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub loading_timeout_ms: u64,
    pub start_countdown_ms: u64,
    pub join_reply_wait_ms: u64,
    pub qos_lookup_wait_ms: u64,
    pub session_modify_wait_ms: u64,
    pub registration_wait_ms: u64,
    /// Longest a directory create may stay unanswered
    pub create_wait_ms: u64,
    pub migrate_wait_ms: u64,
    pub register_reply_wait_ms: u64,
    pub report_stats_wait_ms: u64,
    pub disconnect_wait_ms: u64,
    pub loading_barrier_wait_ms: u64,
    pub host_migration_retry_interval_ms: u64,
    pub host_migration_max_retries: u32,

    pub system_link_retry_interval_ms: u64,
    pub system_link_max_retries: u32,
    pub system_link_max_results: usize,
    pub system_link_port: u16,

    pub max_search_results: usize,
    pub ping_max_green_ms: u32,
    pub ping_max_yellow_ms: u32,
    pub ping_max_red_ms: u32,

    /// Public slots of a session created from an invite
    pub invite_public_slots: u32,

    /// Fixed machine id (random when absent)
    pub machine_id: Option<u64>,
    /// Seed for nonces, ids and team tie-breaks (entropy when absent)
    pub rng_seed: Option<u64>,
    pub local_players: Vec<LocalPlayer>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            min_players: 2,
            max_spectators: 0,
            team_capacity_slack: 1,
            heartbeat_interval_lobby_ms: 1000,
            heartbeat_interval_game_ms: 3000,
            heartbeat_timeout_ms: 10_000,
            loading_timeout_ms: 100_000,
            start_countdown_ms: 15_000,
            join_reply_wait_ms: 15_000,
            qos_lookup_wait_ms: 20_000,
            session_modify_wait_ms: 10_000,
            registration_wait_ms: 7_000,
            create_wait_ms: 20_000,
            migrate_wait_ms: 20_000,
            register_reply_wait_ms: 20_000,
            report_stats_wait_ms: 20_000,
            disconnect_wait_ms: 5_000,
            loading_barrier_wait_ms: 60_000,
            host_migration_retry_interval_ms: 1000,
            host_migration_max_retries: 10,
            system_link_retry_interval_ms: 1000,
            system_link_max_retries: 3,
            system_link_max_results: 16,
            system_link_port: DEFAULT_SYSTEM_LINK_PORT,
            max_search_results: 20,
            ping_max_green_ms: 70,
            ping_max_yellow_ms: 140,
            ping_max_red_ms: 250,
            invite_public_slots: 8,
            machine_id: None,
            rng_seed: None,
            local_players: vec![LocalPlayer {
                id: 1,
                name: "Player".to_string(),
            }],
        }
    }
}

impl CoordinatorConfig {
    /// Validate the configuration values
    ///
    /// Returns an error message if any value is invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.local_players.is_empty() || self.local_players.len() > MAX_PLAYERS_PER_PARTICIPANT {
            return Err(format!(
                "Invalid local player count: {}. Must be 1 to {}",
                self.local_players.len(),
                MAX_PLAYERS_PER_PARTICIPANT
            ));
        }

        if let Some(player) = self.local_players.iter().find(|p| p.id == 0) {
            return Err(format!("Local player {:?} has reserved id 0", player.name));
        }

        if self.min_players == 0 {
            return Err("min_players must be at least 1".to_string());
        }

        if self.heartbeat_timeout_ms <= self.heartbeat_interval_game_ms {
            return Err(format!(
                "heartbeat_timeout_ms ({}) must exceed heartbeat_interval_game_ms ({})",
                self.heartbeat_timeout_ms, self.heartbeat_interval_game_ms
            ));
        }

        if !(self.ping_max_green_ms <= self.ping_max_yellow_ms
            && self.ping_max_yellow_ms <= self.ping_max_red_ms)
        {
            return Err("Ping ceilings must satisfy green <= yellow <= red".to_string());
        }

        if self.system_link_port == 0 {
            return Err("system_link_port must not be 0".to_string());
        }

        Ok(())
    }

    /// Load and validate a configuration file
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file at {:?}: {}", path, e))?;

        let config: CoordinatorConfig = serde_json::from_str(&content)
            .map_err(|e| format!("Failed to parse config file: {}", e))?;

        config.validate()?;

        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, String> {
        serde_json::to_string_pretty(self).map_err(|e| format!("Failed to serialize config: {}", e))
    }

    pub(crate) fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Self::ms(self.heartbeat_timeout_ms)
    }

    pub fn loading_timeout(&self) -> Duration {
        Self::ms(self.loading_timeout_ms)
    }

    pub fn start_countdown(&self) -> Duration {
        Self::ms(self.start_countdown_ms)
    }

    /// How long a client waits for a new host before trying the next candidate
    pub fn host_migration_max_wait(&self) -> Duration {
        Self::ms(self.host_migration_retry_interval_ms * u64::from(self.host_migration_max_retries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(CoordinatorConfig::default().validate().is_ok());
    }

    #[test]
    fn test_too_many_local_players() {
        let mut config = CoordinatorConfig::default();
        config.local_players = (1..=5)
            .map(|id| LocalPlayer {
                id,
                name: format!("P{}", id),
            })
            .collect();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_reserved_player_id() {
        let mut config = CoordinatorConfig::default();
        config.local_players[0].id = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ping_ceilings_must_be_ordered() {
        let mut config = CoordinatorConfig::default();
        config.ping_max_yellow_ms = 300;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let config: CoordinatorConfig =
            serde_json::from_str(r#"{ "min_players": 4, "rng_seed": 7 }"#).unwrap();
        assert_eq!(config.min_players, 4);
        assert_eq!(config.rng_seed, Some(7));
        assert_eq!(config.join_reply_wait_ms, 15_000);
        assert_eq!(config.create_wait_ms, 20_000);
        assert_eq!(config.local_players.len(), 1);
    }

    #[test]
    fn test_migration_wait_is_interval_times_retries() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.host_migration_max_wait(), Duration::from_secs(10));
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("huddle-config-{}.json", std::process::id()));
        let config = CoordinatorConfig {
            min_players: 3,
            ..CoordinatorConfig::default()
        };
        fs::write(&path, config.to_json().unwrap()).unwrap();

        let loaded = CoordinatorConfig::load(&path).unwrap();
        fs::remove_file(&path).ok();
        assert_eq!(loaded, config);
    }
}
