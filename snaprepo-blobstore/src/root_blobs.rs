//! Repository-root metadata blobs.

use serde::{Deserialize, Serialize};

use snaprepo_api_types::{IndexId, SnapshotId, SnapshotState};

use crate::format::ChecksumBlobFormat;

/// The root `snap-<uuid>.dat` blob: user visible description of a
/// completed snapshot.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct SnapshotInfo {
    pub snapshot: SnapshotId,
    pub state: SnapshotState,
    pub version: u32,
    /// Names of the indices contained in the snapshot.
    pub indices: Vec<String>,
    pub start_time: i64,
    pub end_time: i64,
    pub shards_total: u32,
    pub shards_failed: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl SnapshotInfo {
    /// The same snapshot content under a new identity, as written by
    /// clone: file references stay, the timestamps are the clone's.
    pub fn cloned_as(&self, target: &SnapshotId, start_time: i64, end_time: i64) -> Self {
        let mut info = self.clone();
        info.snapshot = target.clone();
        info.start_time = start_time;
        info.end_time = end_time;
        info
    }
}

/// The root `meta-<snapshotUUID>.dat` blob: cluster-wide metadata
/// captured with the snapshot.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterMetadata {
    pub cluster_uuid: String,
    /// Persistent cluster settings, kept opaque.
    pub settings: serde_json::Value,
}

/// The `indices/<indexUUID>/meta-<blobUUID>.dat` blob.
///
/// Identical payloads across snapshots are written once; the identity
/// key below is what the deduplication is keyed on.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct IndexMetadata {
    pub index: IndexId,
    pub number_of_shards: u32,
    pub settings: serde_json::Value,
    pub mappings: serde_json::Value,
}

impl IndexMetadata {
    /// Identity of this payload for cross-snapshot deduplication:
    /// SHA-256 over the canonical JSON serialization. serde_json maps
    /// iterate in key order, so equal payloads hash equally.
    pub fn identity_key(&self) -> String {
        let canonical = serde_json::to_vec(self).expect("index metadata serializes");
        hex::encode(openssl::sha::sha256(&canonical))
    }
}

pub const SNAPSHOT_INFO_FORMAT: ChecksumBlobFormat<SnapshotInfo> =
    ChecksumBlobFormat::new("snapshot-info");
pub const CLUSTER_METADATA_FORMAT: ChecksumBlobFormat<ClusterMetadata> =
    ChecksumBlobFormat::new("cluster-metadata");
pub const INDEX_METADATA_FORMAT: ChecksumBlobFormat<IndexMetadata> =
    ChecksumBlobFormat::new("index-metadata");
