use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of a snapshot.
///
/// The `uuid` is the durable identity; the `name` is user facing and
/// may be reused once the snapshot has been deleted.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotId {
    pub name: String,
    pub uuid: String,
}

impl SnapshotId {
    pub fn new<N: Into<String>>(name: N) -> Self {
        Self {
            name: name.into(),
            uuid: crate::new_uuid(),
        }
    }

    pub fn with_uuid<N: Into<String>, U: Into<String>>(name: N, uuid: U) -> Self {
        Self {
            name: name.into(),
            uuid: uuid.into(),
        }
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.uuid)
    }
}

/// Identity of an index inside the repository.
///
/// The `uuid` binds the entry to one specific index creation; two
/// snapshots may contain indices of the same name with different
/// uuids.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IndexId {
    pub name: String,
    pub uuid: String,
}

impl IndexId {
    pub fn new<N: Into<String>>(name: N) -> Self {
        Self {
            name: name.into(),
            uuid: crate::new_uuid(),
        }
    }

    pub fn with_uuid<N: Into<String>, U: Into<String>>(name: N, uuid: U) -> Self {
        Self {
            name: name.into(),
            uuid: uuid.into(),
        }
    }
}

impl fmt::Display for IndexId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.uuid)
    }
}

/// One shard of one index, as addressed inside the repository.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RepositoryShardId {
    pub index: IndexId,
    pub shard: u32,
}

impl RepositoryShardId {
    pub fn new(index: IndexId, shard: u32) -> Self {
        Self { index, shard }
    }
}

impl fmt::Display for RepositoryShardId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}][{}]", self.index, self.shard)
    }
}

/// Lifecycle state of a snapshot as recorded in the repository
/// manifest.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SnapshotState {
    InProgress,
    Success,
    /// Some shards failed; the surviving shards are restorable.
    Partial,
    Failed,
}

impl SnapshotState {
    /// Whether shard data of this snapshot may be referenced by
    /// restores and clones.
    pub fn restorable(&self) -> bool {
        matches!(self, SnapshotState::Success | SnapshotState::Partial)
    }
}
