use crate::Database;
use crate::models::{GROUP_COLUMNS, GroupRow, SINGLE_COLUMNS, SingleRow};
use anyhow::{Result, bail};
use fetchd_types::models::{GroupRecord, PersistedState, Snapshot, TransferId, TransferRecord};
use fetchd_types::store::PersistentStore;
use rusqlite::Connection;
use tracing::debug;

impl Database {
    // -- Writes --

    /// Inserts or updates a record; a group is written with all its members.
    pub fn save(&self, snapshot: &Snapshot) -> Result<()> {
        self.with_conn(|conn| match snapshot {
            Snapshot::Single(record) => upsert_single(conn, record),
            Snapshot::Group { group, members } => {
                let tx = conn.unchecked_transaction()?;
                upsert_group(&tx, group)?;
                for (position, member) in members.iter().enumerate() {
                    upsert_single(&tx, member)?;
                    tx.execute(
                        "INSERT INTO group_members (group_id, transfer_id, position)
                         VALUES (?1, ?2, ?3)
                         ON CONFLICT (group_id, transfer_id) DO UPDATE SET position = excluded.position",
                        rusqlite::params![group.id.as_str(), member.id.as_str(), position as i64],
                    )?;
                }
                tx.commit()?;
                Ok(())
            }
        })?;
        debug!(transfer_id = %snapshot.id(), state = snapshot.state().as_str(), "Record saved");
        Ok(())
    }

    pub fn mark_collected(&self, id: &TransferId) -> Result<()> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE single_transfers SET collected = 1, updated_at = datetime('now') WHERE id = ?1",
                [id.as_str()],
            )? + conn.execute(
                "UPDATE group_transfers SET collected = 1, updated_at = datetime('now') WHERE id = ?1",
                [id.as_str()],
            )?;
            if updated == 0 {
                bail!("Transfer not found: {}", id);
            }
            Ok(())
        })
    }

    // -- Reads --

    pub fn load(&self, id: &TransferId) -> Result<Option<Snapshot>> {
        self.with_conn(|conn| {
            if let Some(record) = query_single(conn, id)? {
                return Ok(Some(Snapshot::Single(record)));
            }
            let Some(group) = query_group(conn, id)? else {
                return Ok(None);
            };
            let members = query_members(conn, &group.id)?;
            Ok(Some(Snapshot::Group { group, members }))
        })
    }

    /// Finished records of `owner` not collected yet, oldest first. Group
    /// members only show up inside their group.
    pub fn uncollected(&self, owner: &str) -> Result<Vec<Snapshot>> {
        self.with_conn(|conn| {
            let finish = PersistedState::Finish.as_str();
            let mut stmt = conn.prepare(&format!(
                "SELECT {SINGLE_COLUMNS} FROM single_transfers
                 WHERE owner = ?1 AND state = ?2 AND collected = 0 AND group_id IS NULL
                 ORDER BY rowid"
            ))?;
            let singles = stmt
                .query_map(rusqlite::params![owner, finish], SingleRow::from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut stmt = conn.prepare(&format!(
                "SELECT {GROUP_COLUMNS} FROM group_transfers
                 WHERE owner = ?1 AND state = ?2 AND collected = 0
                 ORDER BY rowid"
            ))?;
            let groups = stmt
                .query_map(rusqlite::params![owner, finish], GroupRow::from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut snapshots = Vec::with_capacity(singles.len() + groups.len());
            for row in singles {
                snapshots.push(Snapshot::Single(row.into_record()?));
            }
            for row in groups {
                let group = row.into_record()?;
                let members = query_members(conn, &group.id)?;
                snapshots.push(Snapshot::Group { group, members });
            }
            Ok(snapshots)
        })
    }
}

impl PersistentStore for Database {
    fn save(&self, snapshot: &Snapshot) -> Result<()> {
        Database::save(self, snapshot)
    }

    fn load(&self, id: &TransferId) -> Result<Option<Snapshot>> {
        Database::load(self, id)
    }

    fn uncollected(&self, owner: &str) -> Result<Vec<Snapshot>> {
        Database::uncollected(self, owner)
    }

    fn mark_collected(&self, id: &TransferId) -> Result<()> {
        Database::mark_collected(self, id)
    }
}

fn upsert_single(conn: &Connection, record: &TransferRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO single_transfers
             (id, owner, url, local_path, hash, hash_algo, state, total_size, throttle,
              metadata, headers, is_confined, root_path, group_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
         ON CONFLICT (id) DO UPDATE SET
             url = excluded.url,
             local_path = excluded.local_path,
             state = excluded.state,
             total_size = excluded.total_size,
             throttle = excluded.throttle,
             metadata = excluded.metadata,
             headers = excluded.headers,
             updated_at = datetime('now')",
        rusqlite::params![
            record.id.as_str(),
            record.owner,
            record.url,
            record.local_path.to_string_lossy(),
            record.hash,
            record.hash_algo,
            record.state.as_str(),
            record.total_size as i64,
            record.throttle as i64,
            serde_json::to_string(&record.metadata)?,
            serde_json::to_string(&record.headers)?,
            record.is_confined,
            record.root_path.to_string_lossy(),
            record.group_id.as_ref().map(TransferId::as_str),
        ],
    )?;
    Ok(())
}

fn upsert_group(conn: &Connection, record: &GroupRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO group_transfers
             (id, owner, state, total_size, hash_algo, throttle, metadata, headers,
              is_confined, root_path)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT (id) DO UPDATE SET
             state = excluded.state,
             total_size = excluded.total_size,
             throttle = excluded.throttle,
             metadata = excluded.metadata,
             headers = excluded.headers,
             updated_at = datetime('now')",
        rusqlite::params![
            record.id.as_str(),
            record.owner,
            record.state.as_str(),
            record.total_size as i64,
            record.hash_algo,
            record.throttle as i64,
            serde_json::to_string(&record.metadata)?,
            serde_json::to_string(&record.headers)?,
            record.is_confined,
            record.root_path.to_string_lossy(),
        ],
    )?;
    Ok(())
}

fn query_single(conn: &Connection, id: &TransferId) -> Result<Option<TransferRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SINGLE_COLUMNS} FROM single_transfers WHERE id = ?1"
    ))?;

    let row = stmt.query_row([id.as_str()], SingleRow::from_row).optional()?;
    row.map(SingleRow::into_record).transpose()
}

fn query_group(conn: &Connection, id: &TransferId) -> Result<Option<GroupRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {GROUP_COLUMNS} FROM group_transfers WHERE id = ?1"
    ))?;

    let row = stmt.query_row([id.as_str()], GroupRow::from_row).optional()?;
    row.map(GroupRow::into_record).transpose()
}

fn query_members(conn: &Connection, group_id: &TransferId) -> Result<Vec<TransferRecord>> {
    let columns = SINGLE_COLUMNS
        .split(", ")
        .map(|column| format!("s.{column}"))
        .collect::<Vec<_>>()
        .join(", ");
    let mut stmt = conn.prepare(&format!(
        "SELECT {columns}
         FROM group_members m
         JOIN single_transfers s ON s.id = m.transfer_id
         WHERE m.group_id = ?1
         ORDER BY m.position"
    ))?;

    let rows = stmt
        .query_map([group_id.as_str()], SingleRow::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter().map(SingleRow::into_record).collect()
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
