use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Metadata key holding the post-download command.
pub const COMMAND_KEY: &str = "post-download-command";
/// Token in the command arguments replaced by the final file path.
pub const FILE_PLACEHOLDER: &str = "$file";
/// Metadata key overriding the destination path (unconfined owners only).
pub const LOCAL_PATH_KEY: &str = "local-path";

/// Client-supplied metadata. Two keys are interpreted by the engine, the rest
/// is carried through untouched.
///
/// On the wire this is a flat JSON object, so clients see the reserved keys
/// next to their own entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Map<String, Value>", into = "Map<String, Value>")]
pub struct TransferMetadata {
    /// Executable followed by its arguments.
    pub command: Option<Vec<String>>,
    pub local_path: Option<PathBuf>,
    pub extra: Map<String, Value>,
}

impl TransferMetadata {
    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = Some(command.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_local_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.local_path = Some(path.into());
        self
    }

    pub fn with_entry(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Command with every placeholder replaced by `path`. `None` when no
    /// command is configured or the list is empty.
    pub fn command_for(&self, path: &str) -> Option<(String, Vec<String>)> {
        let command = self.command.as_ref()?;
        let (program, args) = command.split_first()?;
        let args = args
            .iter()
            .map(|arg| {
                if arg == FILE_PLACEHOLDER {
                    path.to_string()
                } else {
                    arg.clone()
                }
            })
            .collect();
        Some((program.clone(), args))
    }

    /// Looks up a string value by key, reserved keys included.
    pub fn get_str(&self, key: &str) -> Option<String> {
        match key {
            LOCAL_PATH_KEY => self
                .local_path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            _ => self.extra.get(key)?.as_str().map(str::to_string),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.command.is_none() && self.local_path.is_none() && self.extra.is_empty()
    }
}

impl TryFrom<Map<String, Value>> for TransferMetadata {
    type Error = String;

    fn try_from(mut map: Map<String, Value>) -> Result<Self, Self::Error> {
        let command = match map.remove(COMMAND_KEY) {
            None => None,
            Some(Value::Array(items)) => Some(
                items
                    .into_iter()
                    .map(|item| match item {
                        Value::String(s) => Ok(s),
                        other => Err(format!("{COMMAND_KEY} entries must be strings, got {other}")),
                    })
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            Some(other) => return Err(format!("{COMMAND_KEY} must be a list, got {other}")),
        };

        let local_path = match map.remove(LOCAL_PATH_KEY) {
            None => None,
            Some(Value::String(s)) => Some(PathBuf::from(s)),
            Some(other) => return Err(format!("{LOCAL_PATH_KEY} must be a string, got {other}")),
        };

        Ok(Self {
            command,
            local_path,
            extra: map,
        })
    }
}

impl From<TransferMetadata> for Map<String, Value> {
    fn from(metadata: TransferMetadata) -> Self {
        let mut map = metadata.extra;
        if let Some(command) = metadata.command {
            map.insert(
                COMMAND_KEY.to_string(),
                Value::Array(command.into_iter().map(Value::String).collect()),
            );
        }
        if let Some(path) = metadata.local_path {
            map.insert(
                LOCAL_PATH_KEY.to_string(),
                Value::String(path.to_string_lossy().into_owned()),
            );
        }
        map
    }
}
