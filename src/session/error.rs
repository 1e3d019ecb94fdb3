//! Session error types

use thiserror::Error;

use crate::protocol::{MachineId, SessionId};

/// Errors reported by a directory service
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("Session creation failed: {0}")]
    CreateFailed(String),

    #[error("Session search failed: {0}")]
    SearchFailed(String),

    #[error("Search returned no sessions")]
    NoResults,

    #[error("Session migration failed: {0}")]
    MigrateFailed(String),

    #[error("Arbitration registration failed: {0}")]
    RegisterFailed(String),

    #[error("Session {0} not found")]
    SessionNotFound(SessionId),

    #[error("Another {0} request is outstanding")]
    Busy(&'static str),
}

/// Errors from session record, registry and configuration invariants
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Operation requires the host role")]
    NotHost,

    #[error("No open {0} slots")]
    SlotsExhausted(&'static str),

    #[error("Unknown participant {0}")]
    UnknownParticipant(MachineId),

    #[error("A {0} operation is already outstanding")]
    OperationPending(&'static str),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Directory(#[from] DirectoryError),
}
