use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::models::{TransferId, TransferState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthKind {
    Server,
    Proxy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthError {
    pub kind: AuthKind,
    pub phrase: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpError {
    pub code: u16,
    pub phrase: String,
}

/// Transport-level failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkErrorKind {
    ConnectionRefused,
    RemoteHostClosed,
    HostNotFound,
    Timeout,
    OperationCanceled,
    ContentNotFound,
    AuthenticationRequired,
    ProxyAuthenticationRequired,
    ProtocolFailure,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkError {
    pub kind: NetworkErrorKind,
    pub phrase: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashError {
    pub algorithm: String,
    pub expected: String,
    pub checksum: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessErrorKind {
    FailedToStart,
    Crashed,
    NonZeroExit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessError {
    pub kind: ProcessErrorKind,
    pub phrase: String,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Everything a transfer reports to the outside world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum TransferEvent {
    Started(bool),
    Paused(bool),
    Resumed(bool),
    Canceled(bool),

    Progress { received: u64, total: u64 },

    /// Post-download work (hashing or command) began on this file.
    Processing { path: PathBuf },

    Finished { path: PathBuf },

    /// A group completed; one path per member in completion order.
    GroupFinished { paths: Vec<PathBuf> },

    /// Generic terminal error; always follows a structured error event
    /// unless the failure was local.
    Error { message: String },

    AuthError(AuthError),
    HttpError(HttpError),
    NetworkError(NetworkError),
    HashError(HashError),
    ProcessError(ProcessError),

    StateChanged { state: TransferState },
}

impl TransferEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::StateChanged { state } if state.is_terminal()
        )
    }
}

/// Event tagged with the transfer that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub transfer_id: TransferId,
    pub event: TransferEvent,
}
