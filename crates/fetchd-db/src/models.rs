//! Database row types, mapped column for column from SQLite rows.
//! JSON columns stay as text until converted into the shared records.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use fetchd_types::metadata::TransferMetadata;
use fetchd_types::models::{GroupRecord, PersistedState, TransferId, TransferRecord};
use rusqlite::Row;

pub struct SingleRow {
    pub id: String,
    pub owner: String,
    pub url: String,
    pub local_path: String,
    pub hash: String,
    pub hash_algo: String,
    pub state: String,
    pub total_size: i64,
    pub throttle: i64,
    pub metadata: String,
    pub headers: String,
    pub is_confined: bool,
    pub root_path: String,
    pub group_id: Option<String>,
}

pub struct GroupRow {
    pub id: String,
    pub owner: String,
    pub state: String,
    pub total_size: i64,
    pub hash_algo: String,
    pub throttle: i64,
    pub metadata: String,
    pub headers: String,
    pub is_confined: bool,
    pub root_path: String,
}

pub const SINGLE_COLUMNS: &str = "id, owner, url, local_path, hash, hash_algo, state, total_size, \
     throttle, metadata, headers, is_confined, root_path, group_id";

pub const GROUP_COLUMNS: &str =
    "id, owner, state, total_size, hash_algo, throttle, metadata, headers, is_confined, root_path";

impl SingleRow {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner: row.get(1)?,
            url: row.get(2)?,
            local_path: row.get(3)?,
            hash: row.get(4)?,
            hash_algo: row.get(5)?,
            state: row.get(6)?,
            total_size: row.get(7)?,
            throttle: row.get(8)?,
            metadata: row.get(9)?,
            headers: row.get(10)?,
            is_confined: row.get(11)?,
            root_path: row.get(12)?,
            group_id: row.get(13)?,
        })
    }

    pub fn into_record(self) -> Result<TransferRecord> {
        Ok(TransferRecord {
            metadata: parse_metadata(&self.metadata, &self.id)?,
            headers: parse_headers(&self.headers, &self.id)?,
            id: TransferId::from(self.id),
            owner: self.owner,
            group_id: self.group_id.map(TransferId::from),
            url: self.url,
            local_path: PathBuf::from(self.local_path),
            hash: self.hash,
            hash_algo: self.hash_algo,
            state: PersistedState::from_db(&self.state),
            total_size: self.total_size.max(0) as u64,
            throttle: self.throttle.max(0) as u64,
            is_confined: self.is_confined,
            root_path: PathBuf::from(self.root_path),
        })
    }
}

impl GroupRow {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner: row.get(1)?,
            state: row.get(2)?,
            total_size: row.get(3)?,
            hash_algo: row.get(4)?,
            throttle: row.get(5)?,
            metadata: row.get(6)?,
            headers: row.get(7)?,
            is_confined: row.get(8)?,
            root_path: row.get(9)?,
        })
    }

    pub fn into_record(self) -> Result<GroupRecord> {
        Ok(GroupRecord {
            metadata: parse_metadata(&self.metadata, &self.id)?,
            headers: parse_headers(&self.headers, &self.id)?,
            id: TransferId::from(self.id),
            owner: self.owner,
            state: PersistedState::from_db(&self.state),
            total_size: self.total_size.max(0) as u64,
            hash_algo: self.hash_algo,
            throttle: self.throttle.max(0) as u64,
            is_confined: self.is_confined,
            root_path: PathBuf::from(self.root_path),
        })
    }
}

fn parse_metadata(json: &str, id: &str) -> Result<TransferMetadata> {
    serde_json::from_str(json).with_context(|| format!("Bad metadata for transfer {}", id))
}

fn parse_headers(json: &str, id: &str) -> Result<BTreeMap<String, String>> {
    serde_json::from_str(json).with_context(|| format!("Bad headers for transfer {}", id))
}
