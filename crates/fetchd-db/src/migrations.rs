use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |r| r.get(0),
    )?;

    if version < 1 {
        info!("Running migration v1 (initial schema)");
        conn.execute_batch(
            "
            CREATE TABLE group_transfers (
                id          TEXT PRIMARY KEY,
                owner       TEXT NOT NULL,
                state       TEXT NOT NULL DEFAULT 'idle',
                total_size  INTEGER NOT NULL DEFAULT 0,
                hash_algo   TEXT NOT NULL DEFAULT '',
                throttle    INTEGER NOT NULL DEFAULT 0,
                metadata    TEXT NOT NULL DEFAULT '{}',
                headers     TEXT NOT NULL DEFAULT '{}',
                is_confined INTEGER NOT NULL DEFAULT 0,
                root_path   TEXT NOT NULL,
                collected   INTEGER NOT NULL DEFAULT 0,
                created_at  TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at  TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE single_transfers (
                id          TEXT PRIMARY KEY,
                owner       TEXT NOT NULL,
                url         TEXT NOT NULL,
                local_path  TEXT NOT NULL,
                hash        TEXT NOT NULL DEFAULT '',
                hash_algo   TEXT NOT NULL DEFAULT '',
                state       TEXT NOT NULL DEFAULT 'idle',
                total_size  INTEGER NOT NULL DEFAULT 0,
                throttle    INTEGER NOT NULL DEFAULT 0,
                metadata    TEXT NOT NULL DEFAULT '{}',
                headers     TEXT NOT NULL DEFAULT '{}',
                is_confined INTEGER NOT NULL DEFAULT 0,
                root_path   TEXT NOT NULL,
                group_id    TEXT REFERENCES group_transfers(id) ON DELETE CASCADE,
                collected   INTEGER NOT NULL DEFAULT 0,
                created_at  TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at  TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX idx_single_owner ON single_transfers(owner, state, collected);
            CREATE INDEX idx_group_owner ON group_transfers(owner, state, collected);

            CREATE TABLE group_members (
                group_id    TEXT NOT NULL REFERENCES group_transfers(id) ON DELETE CASCADE,
                transfer_id TEXT NOT NULL REFERENCES single_transfers(id) ON DELETE CASCADE,
                position    INTEGER NOT NULL,
                PRIMARY KEY (group_id, transfer_id)
            );

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
