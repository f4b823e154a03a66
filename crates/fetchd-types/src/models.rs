use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::metadata::TransferMetadata;

/// Opaque identifier of a single or group transfer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(String);

impl TransferId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for TransferId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for TransferId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a transfer as driven by its state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Idle,
    Init,
    Downloading,
    DownloadingDisconnected,
    Paused,
    PausedDisconnected,
    Downloaded,
    Hashing,
    PostProcessing,
    Error,
    Canceled,
    Finished,
}

impl TransferState {
    /// Finished, Canceled and Error accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Canceled | Self::Error)
    }

    /// States in which the transfer is moving bytes or waiting to.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Downloading
                | Self::DownloadingDisconnected
                | Self::Downloaded
                | Self::Hashing
                | Self::PostProcessing
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Init => "init",
            Self::Downloading => "downloading",
            Self::DownloadingDisconnected => "downloading_disconnected",
            Self::Paused => "paused",
            Self::PausedDisconnected => "paused_disconnected",
            Self::Downloaded => "downloaded",
            Self::Hashing => "hashing",
            Self::PostProcessing => "post_processing",
            Self::Error => "error",
            Self::Canceled => "canceled",
            Self::Finished => "finished",
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse state stored in the database. Reflects the last operation
/// requested rather than the fine-grained machine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistedState {
    Idle,
    Start,
    Pause,
    Resume,
    Cancel,
    Finish,
    Error,
}

impl PersistedState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Cancel => "cancel",
            Self::Finish => "finish",
            Self::Error => "error",
        }
    }

    /// Unknown strings map to `Idle`.
    pub fn from_db(value: &str) -> Self {
        match value {
            "start" => Self::Start,
            "pause" => Self::Pause,
            "resume" => Self::Resume,
            "cancel" => Self::Cancel,
            "finish" => Self::Finish,
            "error" => Self::Error,
            _ => Self::Idle,
        }
    }
}

/// One member of a group request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
    pub url: String,
    /// Local file name (or path) requested for this member.
    pub local_file: String,
    /// Expected digest; empty means unchecked.
    #[serde(default)]
    pub hash: String,
}

/// Persistent view of a single transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub id: TransferId,
    pub owner: String,
    pub group_id: Option<TransferId>,
    pub url: String,
    pub local_path: PathBuf,
    pub hash: String,
    pub hash_algo: String,
    pub state: PersistedState,
    pub total_size: u64,
    pub throttle: u64,
    pub metadata: TransferMetadata,
    pub headers: BTreeMap<String, String>,
    pub is_confined: bool,
    pub root_path: PathBuf,
}

/// Persistent view of a group transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRecord {
    pub id: TransferId,
    pub owner: String,
    pub state: PersistedState,
    pub total_size: u64,
    pub hash_algo: String,
    pub throttle: u64,
    pub metadata: TransferMetadata,
    pub headers: BTreeMap<String, String>,
    pub is_confined: bool,
    pub root_path: PathBuf,
}

/// What the persister writes after every state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Snapshot {
    Single(TransferRecord),
    Group {
        group: GroupRecord,
        members: Vec<TransferRecord>,
    },
}

impl Snapshot {
    pub fn id(&self) -> &TransferId {
        match self {
            Self::Single(record) => &record.id,
            Self::Group { group, .. } => &group.id,
        }
    }

    pub fn owner(&self) -> &str {
        match self {
            Self::Single(record) => &record.owner,
            Self::Group { group, .. } => &group.owner,
        }
    }

    pub fn state(&self) -> PersistedState {
        match self {
            Self::Single(record) => record.state,
            Self::Group { group, .. } => group.state,
        }
    }
}
