//! Session search
//!
//! Directory search runs `Searching → WaitingQos → Browsing`: the directory
//! returns candidates, a QoS probe ranks them. System-link search instead
//! broadcasts a probe `system_link_max_retries` times and collects replies,
//! deduplicated by session id, until the reply quota or the retry count is
//! reached.

use std::net::SocketAddr;

use rand::Rng;
use tracing::{debug, info, warn};

use crate::protocol::{clamp_team_count, Message, SessionAdvert, SessionProperties};

use super::super::config::CoordinatorConfig;
use super::super::directory::{CreateParams, DirectoryPoll, QosReport, SearchParams};
use super::super::error::DirectoryError;
use super::super::notify::NotifyKind;
use super::{CoordinatorState, SessionCoordinator};

/// Latency bucket of a search result
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PingQuality {
    Green,
    Yellow,
    Red,
}

/// A joinable session found by a search
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResult {
    pub advert: SessionAdvert,
    pub rtt_ms: u32,
    pub quality: PingQuality,
}

/// Bucket a round-trip time. `None` when above the red ceiling.
pub fn ping_quality(rtt_ms: u32, config: &CoordinatorConfig) -> Option<PingQuality> {
    if rtt_ms <= config.ping_max_green_ms {
        Some(PingQuality::Green)
    } else if rtt_ms <= config.ping_max_yellow_ms {
        Some(PingQuality::Yellow)
    } else if rtt_ms <= config.ping_max_red_ms {
        Some(PingQuality::Red)
    } else {
        None
    }
}

/// Keep reachable candidates with host data, fastest first
fn rank_qos(candidates: &[SessionAdvert], reports: &[QosReport], config: &CoordinatorConfig) -> Vec<SearchResult> {
    let mut results: Vec<SearchResult> = candidates
        .iter()
        .filter_map(|advert| {
            let report = reports.iter().find(|r| r.session_id == advert.session_id)?;
            if !report.contacted || report.disabled {
                return None;
            }
            let data = report.data.clone()?;
            let quality = ping_quality(report.rtt_ms, config)?;
            let mut advert = advert.clone();
            advert.host_data = data;
            Some(SearchResult {
                advert,
                rtt_ms: report.rtt_ms,
                quality,
            })
        })
        .collect();
    results.sort_by_key(|r| r.rtt_ms);
    results.truncate(config.max_search_results);
    results
}

impl SessionCoordinator {
    /// Search for a session to join
    pub fn start_client(&mut self, system_link: bool) {
        if self.state != CoordinatorState::Initial {
            warn!("Cannot search while {}", self.state);
            return;
        }
        info!("Searching for sessions (system link: {})", system_link);

        self.record.set_is_host(false);
        self.record.set_system_link(system_link);
        self.search_results.clear();
        self.qos_candidates.clear();
        self.wait_timer = self.now();

        if system_link {
            self.search_nonce = self.rng.gen();
            self.send_count = 0;
            self.switch_to_state(CoordinatorState::Searching);
            self.send_system_link_search();
            return;
        }

        let params = SearchParams {
            criteria: self.properties.clone(),
            players: self.registry.local().player_count(),
            max_results: self.config.max_search_results,
        };
        match self.directory.begin_search(params) {
            Ok(()) => self.switch_to_state(CoordinatorState::Searching),
            Err(e) => {
                warn!("Search failed to start: {}", e);
                self.notify(NotifyKind::FailSearch, 0);
            }
        }
    }

    fn send_system_link_search(&mut self) {
        let probe = Message::SystemLinkSearch {
            nonce: self.search_nonce,
            criteria: self.properties.clone(),
        };
        if let Err(e) = self.transport.broadcast(self.config.system_link_port, &probe) {
            warn!("System-link probe failed: {}", e);
        }
        self.send_count += 1;
        self.send_timer = self.now();
        debug!("System-link probe {} of {}", self.send_count, self.config.system_link_max_retries);
    }

    pub(super) fn update_searching(&mut self) {
        if self.record.is_system_link() {
            if self.search_results.len() >= self.config.system_link_max_results {
                self.finish_system_link_search();
                return;
            }
            let interval = CoordinatorConfig::ms(self.config.system_link_retry_interval_ms);
            if self.elapsed(self.send_timer) <= interval {
                return;
            }
            if self.send_count >= self.config.system_link_max_retries {
                self.finish_system_link_search();
            } else {
                self.send_system_link_search();
            }
            return;
        }

        let result = match self.directory.poll_search() {
            Some(DirectoryPoll::Pending) => {
                let wait = CoordinatorConfig::ms(self.config.qos_lookup_wait_ms);
                if self.elapsed(self.wait_timer) > wait {
                    warn!("Directory search timed out");
                    self.directory.cancel_search();
                    self.notify(NotifyKind::FailSearch, 0);
                }
                return;
            }
            Some(result) => result,
            None => DirectoryPoll::Failed(DirectoryError::SearchFailed("no search outstanding".to_string())),
        };

        match result {
            DirectoryPoll::Done(found) => {
                debug!("Directory returned {} sessions", found.len());
                match self.directory.begin_qos_probe(&found) {
                    Ok(()) => {
                        self.qos_candidates = found;
                        self.switch_to_state(CoordinatorState::WaitingQos);
                    }
                    Err(e) => {
                        warn!("QoS probe failed to start: {}", e);
                        self.notify(NotifyKind::FailSearch, 0);
                    }
                }
            }
            DirectoryPoll::Failed(e) => {
                info!("Search failed: {}", e);
                self.notify(NotifyKind::FailSearch, 0);
            }
            DirectoryPoll::Pending => {}
        }
    }

    fn finish_system_link_search(&mut self) {
        if self.search_results.is_empty() {
            info!("No system-link sessions found");
            self.notify(NotifyKind::FailSearch, 0);
        } else {
            info!("Found {} system-link sessions", self.search_results.len());
            self.notify(NotifyKind::SearchCompleted, 0);
        }
    }

    pub(super) fn update_waiting_qos(&mut self) {
        match self.directory.poll_qos() {
            Some(DirectoryPoll::Pending) => {
                let wait = CoordinatorConfig::ms(self.config.qos_lookup_wait_ms);
                if self.elapsed(self.wait_timer) > wait {
                    warn!("QoS lookup timed out");
                    self.directory.cancel_qos();
                    self.notify(NotifyKind::FailSearch, 0);
                }
            }
            Some(DirectoryPoll::Done(reports)) => {
                let candidates = std::mem::take(&mut self.qos_candidates);
                self.search_results = rank_qos(&candidates, &reports, &self.config);
                if self.search_results.is_empty() {
                    info!("No reachable sessions among {} candidates", candidates.len());
                    self.notify(NotifyKind::FailSearch, 0);
                } else {
                    self.notify(NotifyKind::SearchCompleted, 0);
                }
            }
            Some(DirectoryPoll::Failed(e)) => {
                warn!("QoS lookup failed: {}", e);
                self.notify(NotifyKind::FailSearch, 0);
            }
            None => {
                warn!("No QoS lookup outstanding");
                self.notify(NotifyKind::FailSearch, 0);
            }
        }
    }

    /// Host: answer a system-link probe
    pub(super) fn handle_system_link_search(&mut self, from: SocketAddr, nonce: u64, criteria: &SessionProperties) {
        if !self.record.is_host() || !self.record.is_system_link() || !self.is_accepting_connections() {
            return;
        }
        if !self.properties.matches(criteria) {
            debug!("System-link probe from {} does not match", from);
            return;
        }
        let reply = Message::SystemLinkReply {
            nonce,
            advert: self.current_advert(),
        };
        if let Err(e) = self.transport.send_connectionless(from, &reply) {
            warn!("Failed to answer system-link probe from {}: {}", from, e);
        }
    }

    pub(super) fn handle_system_link_reply(&mut self, from: SocketAddr, nonce: u64, mut advert: SessionAdvert) {
        if self.state != CoordinatorState::Searching || !self.record.is_system_link() || nonce != self.search_nonce {
            debug!("Stale system-link reply from {}", from);
            return;
        }
        if self.search_results.len() >= self.config.system_link_max_results
            || self
                .search_results
                .iter()
                .any(|r| r.advert.session_id == advert.session_id)
        {
            return;
        }
        debug!("System-link session {} at {}", advert.session_id, from);
        advert.host_addr = from;
        self.search_results.push(SearchResult {
            advert,
            rtt_ms: 0,
            quality: PingQuality::Green,
        });
    }

    pub fn search_results(&self) -> &[SearchResult] {
        &self.search_results
    }

    /// Join the search result at `index`
    pub fn select_session(&mut self, index: usize) -> bool {
        if self.state != CoordinatorState::Browsing {
            warn!("Cannot select a session while {}", self.state);
            return false;
        }
        let Some(result) = self.search_results.get(index).cloned() else {
            warn!("No search result {}", index);
            return false;
        };
        let advert = result.advert;
        info!("Joining session {} at {}", advert.session_id, advert.host_addr);

        self.properties = advert.properties.clone();
        self.total_teams = clamp_team_count(advert.total_teams);
        self.record.set_is_host(false);
        self.record.set_host_addr(Some(advert.host_addr));
        self.record.set_slots(advert.total_public(), advert.total_private());
        self.registry.local_mut().invited = false;

        let params = CreateParams {
            session_id: Some(advert.session_id),
            host_id: self.registry.local_id(),
            host_addr: advert.host_addr,
            public_slots: advert.total_public(),
            private_slots: advert.total_private(),
            total_teams: self.total_teams,
            properties: self.properties.clone(),
            host_data: advert.host_data,
        };
        match self.record.begin_create(&mut self.directory, params, &mut self.rng) {
            Ok(()) => {
                self.switch_to_state(CoordinatorState::Creating);
                true
            }
            Err(e) => {
                warn!("Session attach failed to start: {}", e);
                self.notify(NotifyKind::FailCreate, 0);
                false
            }
        }
    }

    /// Abandon a search, session create or join attempt
    pub fn cancel_operation(&mut self) {
        match self.state {
            CoordinatorState::Searching
            | CoordinatorState::WaitingQos
            | CoordinatorState::Browsing
            | CoordinatorState::Creating
            | CoordinatorState::SessionConnecting => {
                info!("Cancelling {}", self.state);
                self.directory.cancel_search();
                self.directory.cancel_qos();
                self.record.cancel(&mut self.directory);
                self.switch_to_state(CoordinatorState::Initial);
            }
            _ => debug!("Nothing to cancel while {}", self.state),
        }
    }
}
