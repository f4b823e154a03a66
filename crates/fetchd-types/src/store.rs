use anyhow::Result;

use crate::models::{Snapshot, TransferId};

/// Catalog the engine writes snapshots into for crash recovery.
///
/// Implementations are called from blocking contexts.
pub trait PersistentStore: Send + Sync {
    fn save(&self, snapshot: &Snapshot) -> Result<()>;

    fn load(&self, id: &TransferId) -> Result<Option<Snapshot>>;

    /// Finished or failed top-level transfers of `owner` nobody has collected yet.
    fn uncollected(&self, owner: &str) -> Result<Vec<Snapshot>>;

    fn mark_collected(&self, id: &TransferId) -> Result<()>;
}
