//! Snapshot store backed by redb.
//!
//! A snapshot is the full automaton state at the start of a segment,
//! stored as an ordered list of named sections. Snapshots are keyed by the
//! segment id they were taken at.

use cellmaster_common::MetaVersion;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

const SNAPSHOTS: TableDefinition<u32, &[u8]> = TableDefinition::new("snapshots");

/// Error type for snapshot store operations
#[derive(Debug, thiserror::Error)]
pub enum SnapshotStoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redb::TransactionError> for SnapshotStoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<SnapshotStoreError> for cellmaster_common::Error {
    fn from(e: SnapshotStoreError) -> Self {
        Self::Snapshot(e.to_string())
    }
}

pub type SnapshotStoreResult<T> = Result<T, SnapshotStoreError>;

/// Load order of snapshot sections. Keys are loaded before values so that
/// value loaders can resolve references to any object of any subsystem.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SavePriority {
    Keys,
    Values,
}

/// One named part of a snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSection {
    pub priority: SavePriority,
    pub name: String,
    pub data: Vec<u8>,
}

/// Full state of an automaton at `version`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: MetaVersion,
    pub sections: Vec<SnapshotSection>,
}

impl Snapshot {
    /// Snapshot id, i.e. the segment it was taken at.
    pub const fn id(&self) -> u32 {
        self.version.segment_id
    }
}

/// Persistent snapshot store.
pub struct SnapshotStore {
    db: Database,
}

impl SnapshotStore {
    /// Open (or create) the redb database at the given path.
    pub fn open(path: impl AsRef<Path>) -> SnapshotStoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create the table eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(SNAPSHOTS)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }

    /// Persist a snapshot, replacing any snapshot with the same id.
    pub fn save(&self, snapshot: &Snapshot) -> SnapshotStoreResult<()> {
        let bytes = bincode::serialize(snapshot)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SNAPSHOTS)?;
            table.insert(snapshot.id(), bytes.as_slice())?;
        }
        write_txn.commit()?;
        info!(
            snapshot_id = snapshot.id(),
            version = %snapshot.version,
            sections = snapshot.sections.len(),
            bytes = bytes.len(),
            "Snapshot saved"
        );
        Ok(())
    }

    pub fn load(&self, snapshot_id: u32) -> SnapshotStoreResult<Option<Snapshot>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SNAPSHOTS)?;
        match table.get(snapshot_id)? {
            Some(val) => Ok(Some(bincode::deserialize(val.value())?)),
            None => Ok(None),
        }
    }

    /// Id of the newest snapshot, if any.
    pub fn latest_id(&self) -> SnapshotStoreResult<Option<u32>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SNAPSHOTS)?;
        Ok(table.last()?.map(|(key, _)| key.value()))
    }

    /// Delete every snapshot newer than `snapshot_id`.
    pub fn remove_after(&self, snapshot_id: u32) -> SnapshotStoreResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SNAPSHOTS)?;
            let mut newer = Vec::new();
            for entry in table.range(snapshot_id.saturating_add(1)..)? {
                newer.push(entry?.0.value());
            }
            for id in newer {
                table.remove(id)?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }
}
