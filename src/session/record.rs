//! Authoritative description of the current session
//!
//! [`SessionRecord`] holds the session identity, the slot accounting and a
//! small sub-state machine for the asynchronous create, migrate and register
//! operations. At most one of those is outstanding at any time.

use std::net::SocketAddr;

use rand::Rng;
use tracing::{debug, info, warn};

use crate::protocol::{HostData, MachineId, SessionAdvert, SessionId, SessionProperties};

use super::directory::{CreateParams, CreateResult, DirectoryClient, DirectoryPoll};
use super::error::{DirectoryError, SessionError};
use super::registry::SlotKind;

/// Record sub-state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordState {
    #[default]
    None,
    Creating,
    Migrating,
    Idle,
    WaitingForRegistration,
    Registering,
    Registered,
    Starting,
    InGame,
    Ending,
    Finished,
    Deleting,
}

/// Slot totals and fill counts.
///
/// `filled_public <= total_public` and `filled_private <= total_private`
/// hold at all times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlotCounts {
    pub total_public: u32,
    pub total_private: u32,
    pub filled_public: u32,
    pub filled_private: u32,
}

impl SlotCounts {
    pub fn open_public(&self) -> u32 {
        self.total_public.saturating_sub(self.filled_public)
    }

    pub fn open_private(&self) -> u32 {
        self.total_private.saturating_sub(self.filled_private)
    }

    pub fn total(&self) -> u32 {
        self.total_public + self.total_private
    }

    pub fn filled(&self) -> u32 {
        self.filled_public + self.filled_private
    }
}

/// Completion of an asynchronous record operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordEvent {
    Created,
    CreateFailed(DirectoryError),
    Migrated,
    MigrateFailed(DirectoryError),
    Registered,
    RegisterFailed(DirectoryError),
}

#[derive(Debug, Default)]
pub struct SessionRecord {
    state: RecordState,
    session_id: SessionId,
    nonce: u64,
    host_addr: Option<SocketAddr>,
    is_host: bool,
    is_arbitrated: bool,
    is_system_link: bool,
    owner_index: u8,
    slots: SlotCounts,
    /// Result of a system-link operation, applied on the next poll
    local_result: Option<CreateResult>,
}

impl SessionRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> RecordState {
        self.state
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn set_session_id(&mut self, id: SessionId) {
        self.session_id = id;
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn set_nonce(&mut self, nonce: u64) {
        self.nonce = nonce;
    }

    pub fn host_addr(&self) -> Option<SocketAddr> {
        self.host_addr
    }

    pub fn set_host_addr(&mut self, addr: Option<SocketAddr>) {
        self.host_addr = addr;
    }

    pub fn is_host(&self) -> bool {
        self.is_host
    }

    pub fn set_is_host(&mut self, is_host: bool) {
        self.is_host = is_host;
    }

    pub fn is_arbitrated(&self) -> bool {
        self.is_arbitrated
    }

    pub fn set_arbitrated(&mut self, arbitrated: bool) {
        self.is_arbitrated = arbitrated;
    }

    pub fn is_system_link(&self) -> bool {
        self.is_system_link
    }

    pub fn set_system_link(&mut self, system_link: bool) {
        self.is_system_link = system_link;
    }

    pub fn owner_index(&self) -> u8 {
        self.owner_index
    }

    pub fn set_owner_index(&mut self, index: u8) {
        self.owner_index = index;
    }

    pub fn slots(&self) -> SlotCounts {
        self.slots
    }

    /// Set slot totals. Totals never drop below what is already filled.
    pub fn set_slots(&mut self, total_public: u32, total_private: u32) {
        if total_public < self.slots.filled_public || total_private < self.slots.filled_private {
            warn!(
                "Slot totals {}/{} below filled {}/{}, clamping",
                total_public, total_private, self.slots.filled_public, self.slots.filled_private
            );
        }
        self.slots.total_public = total_public.max(self.slots.filled_public);
        self.slots.total_private = total_private.max(self.slots.filled_private);
    }

    /// Take slots for `players` players.
    ///
    /// Invited participants use private slots while any fit, falling back to
    /// public slots.
    pub fn join(&mut self, invited: bool, players: u32) -> Result<SlotKind, SessionError> {
        if invited && self.occupy(SlotKind::Private, players).is_ok() {
            return Ok(SlotKind::Private);
        }
        self.occupy(SlotKind::Public, players)
            .map(|_| SlotKind::Public)
            .map_err(|_| SessionError::SlotsExhausted(if invited { "private" } else { "public" }))
    }

    /// Take `players` slots from one specific pool
    pub fn occupy(&mut self, kind: SlotKind, players: u32) -> Result<(), SessionError> {
        let (open, filled, name) = match kind {
            SlotKind::Public => (self.slots.open_public(), &mut self.slots.filled_public, "public"),
            SlotKind::Private => (self.slots.open_private(), &mut self.slots.filled_private, "private"),
        };
        if open < players {
            return Err(SessionError::SlotsExhausted(name));
        }
        *filled += players;
        Ok(())
    }

    /// Forget every fill count, keeping the totals
    pub fn clear_filled(&mut self) {
        self.slots.filled_public = 0;
        self.slots.filled_private = 0;
    }

    /// Release slots taken by `join`
    pub fn leave(&mut self, kind: SlotKind, players: u32) {
        let filled = match kind {
            SlotKind::Public => &mut self.slots.filled_public,
            SlotKind::Private => &mut self.slots.filled_private,
        };
        if *filled < players {
            warn!("Releasing {} {:?} slots with only {} filled", players, kind, filled);
        }
        *filled = filled.saturating_sub(players);
    }

    /// A create, migrate or register is outstanding
    pub fn is_busy(&self) -> bool {
        matches!(
            self.state,
            RecordState::Creating | RecordState::Migrating | RecordState::Registering
        )
    }

    fn ensure_idle(&self, operation: &'static str) -> Result<(), SessionError> {
        if self.is_busy() {
            return Err(SessionError::OperationPending(operation));
        }
        Ok(())
    }

    /// Start creating (host) or attaching to (client) a session.
    /// System-link sessions resolve locally on the next poll.
    pub fn begin_create<R: Rng + ?Sized>(
        &mut self,
        directory: &mut DirectoryClient,
        params: CreateParams,
        rng: &mut R,
    ) -> Result<(), SessionError> {
        self.ensure_idle("create")?;
        if self.is_system_link {
            self.local_result = Some(CreateResult {
                session_id: params.session_id.unwrap_or_else(SessionId::new),
                nonce: rng.gen(),
            });
        } else {
            directory.begin_create(params)?;
        }
        debug!("Record creating (system link: {})", self.is_system_link);
        self.state = RecordState::Creating;
        Ok(())
    }

    /// Move the host role of the current session to `new_host`
    pub fn begin_migrate<R: Rng + ?Sized>(
        &mut self,
        directory: &mut DirectoryClient,
        new_host: MachineId,
        new_host_addr: SocketAddr,
        rng: &mut R,
    ) -> Result<(), SessionError> {
        self.ensure_idle("migrate")?;
        if self.is_system_link {
            self.local_result = Some(CreateResult {
                session_id: self.session_id,
                nonce: rng.gen(),
            });
        } else {
            directory.begin_migrate(self.session_id, new_host, new_host_addr)?;
        }
        info!("Record migrating session {} to {}", self.session_id, new_host);
        self.state = RecordState::Migrating;
        Ok(())
    }

    pub fn begin_register(&mut self, directory: &mut DirectoryClient, machine: MachineId) -> Result<(), SessionError> {
        self.ensure_idle("register")?;
        if self.is_system_link {
            self.local_result = Some(CreateResult {
                session_id: self.session_id,
                nonce: self.nonce,
            });
        } else {
            directory.begin_register(self.session_id, machine)?;
        }
        self.state = RecordState::Registering;
        Ok(())
    }

    /// Arbitrated sessions wait for registration between lobby and game
    pub fn await_registration(&mut self) {
        if matches!(self.state, RecordState::Idle) {
            self.state = RecordState::WaitingForRegistration;
        }
    }

    pub fn start(&mut self) {
        self.state = RecordState::Starting;
    }

    pub fn end(&mut self) {
        self.state = RecordState::Ending;
    }

    /// Back to the lobby after a finished game
    pub fn return_to_lobby(&mut self) {
        if !self.is_busy() {
            self.state = RecordState::Idle;
        }
    }

    /// Advance the sub-state machine. Returns the completion of an
    /// outstanding operation, if one resolved.
    pub fn poll(&mut self, directory: &mut DirectoryClient) -> Option<RecordEvent> {
        match self.state {
            RecordState::Creating => {
                let result = match self.local_result.take() {
                    Some(local) => DirectoryPoll::Done(local),
                    None => directory.poll_create()?,
                };
                match result {
                    DirectoryPoll::Pending => None,
                    DirectoryPoll::Done(created) => {
                        self.session_id = created.session_id;
                        self.nonce = created.nonce;
                        self.state = RecordState::Idle;
                        info!("Session {} created", self.session_id);
                        Some(RecordEvent::Created)
                    }
                    DirectoryPoll::Failed(e) => {
                        self.state = RecordState::None;
                        Some(RecordEvent::CreateFailed(e))
                    }
                }
            }
            RecordState::Migrating => {
                let result = match self.local_result.take() {
                    Some(local) => DirectoryPoll::Done(local),
                    None => directory.poll_migrate()?,
                };
                match result {
                    DirectoryPoll::Pending => None,
                    DirectoryPoll::Done(migrated) => {
                        self.nonce = migrated.nonce;
                        self.state = RecordState::Idle;
                        Some(RecordEvent::Migrated)
                    }
                    DirectoryPoll::Failed(e) => {
                        self.state = RecordState::Idle;
                        Some(RecordEvent::MigrateFailed(e))
                    }
                }
            }
            RecordState::Registering => {
                let result = match self.local_result.take() {
                    Some(_) => DirectoryPoll::Done(()),
                    None => directory.poll_register()?,
                };
                match result {
                    DirectoryPoll::Pending => None,
                    DirectoryPoll::Done(()) => {
                        self.state = RecordState::Registered;
                        Some(RecordEvent::Registered)
                    }
                    DirectoryPoll::Failed(e) => {
                        self.state = RecordState::WaitingForRegistration;
                        Some(RecordEvent::RegisterFailed(e))
                    }
                }
            }
            RecordState::Starting => {
                self.state = RecordState::InGame;
                None
            }
            RecordState::Ending => {
                self.state = RecordState::Finished;
                None
            }
            _ => None,
        }
    }

    /// Abandon any outstanding operation
    pub fn cancel(&mut self, directory: &mut DirectoryClient) {
        self.local_result = None;
        match self.state {
            RecordState::Creating => {
                directory.cancel_create();
                self.state = RecordState::None;
            }
            RecordState::Migrating => {
                directory.cancel_migrate();
                self.state = RecordState::Idle;
            }
            RecordState::Registering => {
                directory.cancel_register();
                self.state = RecordState::WaitingForRegistration;
            }
            _ => {}
        }
    }

    /// Snapshot for advertisement on the directory or in system-link replies
    pub fn advert(
        &self,
        host_addr: SocketAddr,
        total_teams: u32,
        host_data: HostData,
        properties: SessionProperties,
    ) -> SessionAdvert {
        SessionAdvert {
            session_id: self.session_id,
            host_addr,
            open_public: self.slots.open_public(),
            open_private: self.slots.open_private(),
            filled_public: self.slots.filled_public,
            filled_private: self.slots.filled_private,
            total_teams,
            host_data,
            properties,
        }
    }

    /// Tear down the session: cancel outstanding work, withdraw a hosted
    /// advertisement, forget everything.
    pub fn reset(&mut self, directory: &mut DirectoryClient) {
        self.cancel(directory);
        if self.is_host && !self.is_system_link && !self.session_id.is_nil() {
            self.state = RecordState::Deleting;
            directory.delete(self.session_id);
        }
        debug!("Record reset (was {:?})", self.state);
        *self = Self::default();
    }
}
