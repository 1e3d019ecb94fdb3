//! Directory service: session advertisement, search and QoS probing
//!
//! The directory is poll-based. Every `begin_*` call returns a request id
//! that the owner polls once per frame until it resolves, then releases.
//! [`DirectoryClient`] wraps a service and tracks the outstanding request of
//! each kind so the coordinator never leaks or double-issues a request.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, warn};

use crate::protocol::{HostData, MachineId, SessionAdvert, SessionId, SessionProperties};

use super::error::DirectoryError;

pub type RequestId = u64;

/// State of an outstanding directory request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryPoll<T> {
    Pending,
    Done(T),
    Failed(DirectoryError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateParams {
    /// Existing session to attach to (clients), or `None` to advertise a new one
    pub session_id: Option<SessionId>,
    pub host_id: MachineId,
    pub host_addr: SocketAddr,
    pub public_slots: u32,
    pub private_slots: u32,
    pub total_teams: u32,
    pub properties: SessionProperties,
    pub host_data: HostData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateResult {
    pub session_id: SessionId,
    pub nonce: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchParams {
    pub criteria: SessionProperties,
    /// Local players that need open slots
    pub players: u32,
    pub max_results: usize,
}

/// Probe outcome for one search candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QosReport {
    pub session_id: SessionId,
    pub contacted: bool,
    pub disabled: bool,
    /// Host data returned by the probe, `None` when nothing arrived
    pub data: Option<HostData>,
    pub rtt_ms: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryReply {
    Created(CreateResult),
    Sessions(Vec<SessionAdvert>),
    Qos(Vec<QosReport>),
    Migrated(CreateResult),
    Registered,
}

/// Poll-based directory service
pub trait DirectoryService {
    fn begin_create(&mut self, params: CreateParams) -> Result<RequestId, DirectoryError>;

    fn begin_search(&mut self, params: SearchParams) -> Result<RequestId, DirectoryError>;

    fn begin_qos_probe(&mut self, candidates: &[SessionAdvert]) -> Result<RequestId, DirectoryError>;

    /// Move the session's host role to `new_host`
    fn begin_migrate(
        &mut self,
        session: SessionId,
        new_host: MachineId,
        new_host_addr: SocketAddr,
    ) -> Result<RequestId, DirectoryError>;

    /// Register `machine` for arbitration in `session`
    fn begin_register(&mut self, session: SessionId, machine: MachineId) -> Result<RequestId, DirectoryError>;

    fn poll(&mut self, request: RequestId) -> DirectoryPoll<DirectoryReply>;

    /// Forget a request, resolved or not
    fn release(&mut self, request: RequestId);

    /// Refresh the advertised slots and host data of a session
    fn update_advert(&mut self, advert: &SessionAdvert);

    fn delete(&mut self, session: SessionId);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RequestKind {
    Create,
    Search,
    Qos,
    Migrate,
    Register,
}

impl RequestKind {
    fn name(self) -> &'static str {
        match self {
            RequestKind::Create => "create",
            RequestKind::Search => "search",
            RequestKind::Qos => "qos",
            RequestKind::Migrate => "migrate",
            RequestKind::Register => "register",
        }
    }
}

/// Tracks outstanding requests on a [`DirectoryService`]
pub struct DirectoryClient {
    service: Box<dyn DirectoryService>,
    outstanding: HashMap<RequestKind, RequestId>,
}

impl DirectoryClient {
    pub fn new(service: Box<dyn DirectoryService>) -> Self {
        Self {
            service,
            outstanding: HashMap::new(),
        }
    }

    fn ensure_free(&self, kind: RequestKind) -> Result<(), DirectoryError> {
        if self.outstanding.contains_key(&kind) {
            return Err(DirectoryError::Busy(kind.name()));
        }
        Ok(())
    }

    pub fn is_outstanding_create(&self) -> bool {
        self.outstanding.contains_key(&RequestKind::Create)
    }

    pub fn is_outstanding_search(&self) -> bool {
        self.outstanding.contains_key(&RequestKind::Search)
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }

    /// At most one create or search may be outstanding
    pub fn begin_create(&mut self, params: CreateParams) -> Result<(), DirectoryError> {
        self.ensure_free(RequestKind::Create)?;
        self.ensure_free(RequestKind::Search)?;
        let id = self.service.begin_create(params)?;
        debug!("Directory create request {}", id);
        self.outstanding.insert(RequestKind::Create, id);
        Ok(())
    }

    pub fn begin_search(&mut self, params: SearchParams) -> Result<(), DirectoryError> {
        self.ensure_free(RequestKind::Search)?;
        self.ensure_free(RequestKind::Create)?;
        let id = self.service.begin_search(params)?;
        debug!("Directory search request {}", id);
        self.outstanding.insert(RequestKind::Search, id);
        Ok(())
    }

    pub fn begin_qos_probe(&mut self, candidates: &[SessionAdvert]) -> Result<(), DirectoryError> {
        self.ensure_free(RequestKind::Qos)?;
        let id = self.service.begin_qos_probe(candidates)?;
        debug!("Directory QoS request {} for {} candidates", id, candidates.len());
        self.outstanding.insert(RequestKind::Qos, id);
        Ok(())
    }

    pub fn begin_migrate(
        &mut self,
        session: SessionId,
        new_host: MachineId,
        new_host_addr: SocketAddr,
    ) -> Result<(), DirectoryError> {
        self.ensure_free(RequestKind::Migrate)?;
        let id = self.service.begin_migrate(session, new_host, new_host_addr)?;
        self.outstanding.insert(RequestKind::Migrate, id);
        Ok(())
    }

    pub fn begin_register(&mut self, session: SessionId, machine: MachineId) -> Result<(), DirectoryError> {
        self.ensure_free(RequestKind::Register)?;
        let id = self.service.begin_register(session, machine)?;
        self.outstanding.insert(RequestKind::Register, id);
        Ok(())
    }

    /// Poll the outstanding request of `kind`, releasing it once resolved.
    /// `None` when nothing of that kind is outstanding.
    fn poll_kind(&mut self, kind: RequestKind) -> Option<DirectoryPoll<DirectoryReply>> {
        let id = *self.outstanding.get(&kind)?;
        let result = self.service.poll(id);
        if !matches!(result, DirectoryPoll::Pending) {
            self.service.release(id);
            self.outstanding.remove(&kind);
        }
        Some(result)
    }

    pub fn poll_create(&mut self) -> Option<DirectoryPoll<CreateResult>> {
        self.poll_kind(RequestKind::Create).map(|poll| match poll {
            DirectoryPoll::Pending => DirectoryPoll::Pending,
            DirectoryPoll::Done(DirectoryReply::Created(result)) => DirectoryPoll::Done(result),
            DirectoryPoll::Done(other) => unexpected(other, DirectoryError::CreateFailed),
            DirectoryPoll::Failed(e) => DirectoryPoll::Failed(e),
        })
    }

    pub fn poll_search(&mut self) -> Option<DirectoryPoll<Vec<SessionAdvert>>> {
        self.poll_kind(RequestKind::Search).map(|poll| match poll {
            DirectoryPoll::Pending => DirectoryPoll::Pending,
            DirectoryPoll::Done(DirectoryReply::Sessions(found)) if found.is_empty() => {
                DirectoryPoll::Failed(DirectoryError::NoResults)
            }
            DirectoryPoll::Done(DirectoryReply::Sessions(found)) => DirectoryPoll::Done(found),
            DirectoryPoll::Done(other) => unexpected(other, DirectoryError::SearchFailed),
            DirectoryPoll::Failed(e) => DirectoryPoll::Failed(e),
        })
    }

    pub fn poll_qos(&mut self) -> Option<DirectoryPoll<Vec<QosReport>>> {
        self.poll_kind(RequestKind::Qos).map(|poll| match poll {
            DirectoryPoll::Pending => DirectoryPoll::Pending,
            DirectoryPoll::Done(DirectoryReply::Qos(reports)) => DirectoryPoll::Done(reports),
            DirectoryPoll::Done(other) => unexpected(other, DirectoryError::SearchFailed),
            DirectoryPoll::Failed(e) => DirectoryPoll::Failed(e),
        })
    }

    pub fn poll_migrate(&mut self) -> Option<DirectoryPoll<CreateResult>> {
        self.poll_kind(RequestKind::Migrate).map(|poll| match poll {
            DirectoryPoll::Pending => DirectoryPoll::Pending,
            DirectoryPoll::Done(DirectoryReply::Migrated(result)) => DirectoryPoll::Done(result),
            DirectoryPoll::Done(other) => unexpected(other, DirectoryError::MigrateFailed),
            DirectoryPoll::Failed(e) => DirectoryPoll::Failed(e),
        })
    }

    pub fn poll_register(&mut self) -> Option<DirectoryPoll<()>> {
        self.poll_kind(RequestKind::Register).map(|poll| match poll {
            DirectoryPoll::Pending => DirectoryPoll::Pending,
            DirectoryPoll::Done(DirectoryReply::Registered) => DirectoryPoll::Done(()),
            DirectoryPoll::Done(other) => unexpected(other, DirectoryError::RegisterFailed),
            DirectoryPoll::Failed(e) => DirectoryPoll::Failed(e),
        })
    }

    fn cancel(&mut self, kind: RequestKind) {
        if let Some(id) = self.outstanding.remove(&kind) {
            debug!("Cancelling directory {} request {}", kind.name(), id);
            self.service.release(id);
        }
    }

    pub fn cancel_create(&mut self) {
        self.cancel(RequestKind::Create);
    }

    pub fn cancel_search(&mut self) {
        self.cancel(RequestKind::Search);
    }

    pub fn cancel_qos(&mut self) {
        self.cancel(RequestKind::Qos);
    }

    pub fn cancel_migrate(&mut self) {
        self.cancel(RequestKind::Migrate);
    }

    pub fn cancel_register(&mut self) {
        self.cancel(RequestKind::Register);
    }

    pub fn cancel_all(&mut self) {
        let kinds: Vec<RequestKind> = self.outstanding.keys().copied().collect();
        for kind in kinds {
            self.cancel(kind);
        }
    }

    pub fn update_advert(&mut self, advert: &SessionAdvert) {
        self.service.update_advert(advert);
    }

    pub fn delete(&mut self, session: SessionId) {
        self.service.delete(session);
    }
}

fn unexpected<T>(reply: DirectoryReply, kind: fn(String) -> DirectoryError) -> DirectoryPoll<T> {
    warn!("Unexpected directory reply {:?}", reply);
    DirectoryPoll::Failed(kind("unexpected reply".to_string()))
}

/// Operation kinds that can be made to fail in a [`MemoryDirectory`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DirectoryOp {
    Create,
    Search,
    Qos,
    Migrate,
    Register,
}

/// Probe behaviour of one host in a [`MemoryDirectory`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QosProfile {
    pub contacted: bool,
    pub disabled: bool,
    pub has_data: bool,
    pub rtt_ms: u32,
}

impl Default for QosProfile {
    fn default() -> Self {
        Self {
            contacted: true,
            disabled: false,
            has_data: true,
            rtt_ms: 20,
        }
    }
}

struct DirectoryEntry {
    advert: SessionAdvert,
    nonce: u64,
    host_id: MachineId,
    registered: BTreeSet<MachineId>,
}

struct PendingRequest {
    polls_left: u32,
    outcome: DirectoryPoll<DirectoryReply>,
}

#[derive(Default)]
struct DirectoryState {
    next_request: RequestId,
    latency_polls: u32,
    entries: BTreeMap<SessionId, DirectoryEntry>,
    requests: HashMap<RequestId, PendingRequest>,
    qos: HashMap<SocketAddr, QosProfile>,
    fail_next: HashSet<DirectoryOp>,
}

impl DirectoryState {
    fn take_failure(&mut self, op: DirectoryOp) -> bool {
        self.fail_next.remove(&op)
    }

    fn enqueue(&mut self, outcome: DirectoryPoll<DirectoryReply>) -> RequestId {
        self.next_request += 1;
        let id = self.next_request;
        self.requests.insert(
            id,
            PendingRequest {
                polls_left: self.latency_polls,
                outcome,
            },
        );
        id
    }
}

/// In-process directory shared between coordinators. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryDirectory {
    state: Arc<Mutex<DirectoryState>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests stay pending for this many polls before resolving
    pub fn set_latency(&self, polls: u32) {
        self.state.lock().latency_polls = polls;
    }

    /// Make the next request of kind `op` fail
    pub fn fail_next(&self, op: DirectoryOp) {
        self.state.lock().fail_next.insert(op);
    }

    pub fn set_qos(&self, host: SocketAddr, profile: QosProfile) {
        self.state.lock().qos.insert(host, profile);
    }

    pub fn sessions(&self) -> Vec<SessionAdvert> {
        self.state
            .lock()
            .entries
            .values()
            .map(|entry| entry.advert.clone())
            .collect()
    }

    pub fn session(&self, id: SessionId) -> Option<SessionAdvert> {
        self.state.lock().entries.get(&id).map(|entry| entry.advert.clone())
    }

    pub fn host_of(&self, id: SessionId) -> Option<MachineId> {
        self.state.lock().entries.get(&id).map(|entry| entry.host_id)
    }

    pub fn registered(&self, id: SessionId) -> Vec<MachineId> {
        self.state
            .lock()
            .entries
            .get(&id)
            .map(|entry| entry.registered.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Requests issued and not yet released
    pub fn outstanding(&self) -> usize {
        self.state.lock().requests.len()
    }
}

impl DirectoryService for MemoryDirectory {
    fn begin_create(&mut self, params: CreateParams) -> Result<RequestId, DirectoryError> {
        let mut state = self.state.lock();
        if state.take_failure(DirectoryOp::Create) {
            return Ok(state.enqueue(DirectoryPoll::Failed(DirectoryError::CreateFailed(
                "injected failure".to_string(),
            ))));
        }

        let outcome = match params.session_id {
            Some(id) => match state.entries.get(&id) {
                Some(entry) => DirectoryPoll::Done(DirectoryReply::Created(CreateResult {
                    session_id: id,
                    nonce: entry.nonce,
                })),
                None => DirectoryPoll::Failed(DirectoryError::SessionNotFound(id)),
            },
            None => {
                let session_id = SessionId::new();
                let nonce = rand::thread_rng().gen();
                let advert = SessionAdvert {
                    session_id,
                    host_addr: params.host_addr,
                    open_public: params.public_slots,
                    open_private: params.private_slots,
                    filled_public: 0,
                    filled_private: 0,
                    total_teams: params.total_teams,
                    host_data: params.host_data,
                    properties: params.properties,
                };
                state.entries.insert(
                    session_id,
                    DirectoryEntry {
                        advert,
                        nonce,
                        host_id: params.host_id,
                        registered: BTreeSet::new(),
                    },
                );
                DirectoryPoll::Done(DirectoryReply::Created(CreateResult { session_id, nonce }))
            }
        };
        Ok(state.enqueue(outcome))
    }

    fn begin_search(&mut self, params: SearchParams) -> Result<RequestId, DirectoryError> {
        let mut state = self.state.lock();
        if state.take_failure(DirectoryOp::Search) {
            return Ok(state.enqueue(DirectoryPoll::Failed(DirectoryError::SearchFailed(
                "injected failure".to_string(),
            ))));
        }

        let found: Vec<SessionAdvert> = state
            .entries
            .values()
            .map(|entry| &entry.advert)
            .filter(|advert| advert.properties.matches(&params.criteria))
            .filter(|advert| advert.open_public >= params.players)
            .take(params.max_results)
            .cloned()
            .collect();
        Ok(state.enqueue(DirectoryPoll::Done(DirectoryReply::Sessions(found))))
    }

    fn begin_qos_probe(&mut self, candidates: &[SessionAdvert]) -> Result<RequestId, DirectoryError> {
        let mut state = self.state.lock();
        if state.take_failure(DirectoryOp::Qos) {
            return Ok(state.enqueue(DirectoryPoll::Failed(DirectoryError::SearchFailed(
                "QoS probe failed".to_string(),
            ))));
        }

        let reports = candidates
            .iter()
            .map(|advert| {
                let profile = state.qos.get(&advert.host_addr).copied().unwrap_or_default();
                let data = state
                    .entries
                    .get(&advert.session_id)
                    .filter(|_| profile.has_data)
                    .map(|entry| entry.advert.host_data.clone());
                QosReport {
                    session_id: advert.session_id,
                    contacted: profile.contacted,
                    disabled: profile.disabled,
                    data,
                    rtt_ms: profile.rtt_ms,
                }
            })
            .collect();
        Ok(state.enqueue(DirectoryPoll::Done(DirectoryReply::Qos(reports))))
    }

    fn begin_migrate(
        &mut self,
        session: SessionId,
        new_host: MachineId,
        new_host_addr: SocketAddr,
    ) -> Result<RequestId, DirectoryError> {
        let mut state = self.state.lock();
        let injected = state.take_failure(DirectoryOp::Migrate);
        let nonce: u64 = rand::thread_rng().gen();
        let outcome = match state.entries.get_mut(&session) {
            Some(entry) if !injected => {
                entry.host_id = new_host;
                entry.advert.host_addr = new_host_addr;
                entry.nonce = nonce;
                DirectoryPoll::Done(DirectoryReply::Migrated(CreateResult {
                    session_id: session,
                    nonce,
                }))
            }
            Some(_) => DirectoryPoll::Failed(DirectoryError::MigrateFailed("injected failure".to_string())),
            None => DirectoryPoll::Failed(DirectoryError::SessionNotFound(session)),
        };
        Ok(state.enqueue(outcome))
    }

    fn begin_register(&mut self, session: SessionId, machine: MachineId) -> Result<RequestId, DirectoryError> {
        let mut state = self.state.lock();
        let injected = state.take_failure(DirectoryOp::Register);
        let outcome = match state.entries.get_mut(&session) {
            Some(entry) if !injected => {
                entry.registered.insert(machine);
                DirectoryPoll::Done(DirectoryReply::Registered)
            }
            Some(_) => DirectoryPoll::Failed(DirectoryError::RegisterFailed("injected failure".to_string())),
            None => DirectoryPoll::Failed(DirectoryError::SessionNotFound(session)),
        };
        Ok(state.enqueue(outcome))
    }

    fn poll(&mut self, request: RequestId) -> DirectoryPoll<DirectoryReply> {
        let mut state = self.state.lock();
        let Some(pending) = state.requests.get_mut(&request) else {
            return DirectoryPoll::Failed(DirectoryError::SearchFailed(format!("unknown request {}", request)));
        };
        if pending.polls_left > 0 {
            pending.polls_left -= 1;
            return DirectoryPoll::Pending;
        }
        pending.outcome.clone()
    }

    fn release(&mut self, request: RequestId) {
        self.state.lock().requests.remove(&request);
    }

    fn update_advert(&mut self, advert: &SessionAdvert) {
        if let Some(entry) = self.state.lock().entries.get_mut(&advert.session_id) {
            entry.advert = advert.clone();
        }
    }

    fn delete(&mut self, session: SessionId) {
        if self.state.lock().entries.remove(&session).is_some() {
            debug!("Directory deleted session {}", session);
        }
    }
}
