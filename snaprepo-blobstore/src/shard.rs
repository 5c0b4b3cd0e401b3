//! Per-shard blob naming and manifest formats.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use snaprepo_api_types::ShardGeneration;

use crate::format::ChecksumBlobFormat;

/// Raw data blob, content addressed through the shard manifests.
pub const DATA_BLOB_PREFIX: &str = "__";
/// Reference to a file whose bytes are inline in the manifest.
pub const VIRTUAL_DATA_BLOB_PREFIX: &str = "v__";
pub const SNAPSHOT_BLOB_PREFIX: &str = "snap-";
pub const SHALLOW_SNAPSHOT_BLOB_PREFIX: &str = "shallow-snap-";
pub const SHARD_INDEX_BLOB_PREFIX: &str = "index-";
pub const METADATA_BLOB_PREFIX: &str = "meta-";
/// Left-overs of interrupted atomic writes; removed by shard GC.
pub const TEMP_BLOB_PREFIX: &str = "tmp.";

/// Name of the directory holding all per-index containers.
pub const INDICES_CONTAINER: &str = "indices";

pub fn data_blob_name(uuid: &str) -> String {
    format!("{}{}", DATA_BLOB_PREFIX, uuid)
}

pub fn virtual_data_blob_name(uuid: &str) -> String {
    format!("{}{}", VIRTUAL_DATA_BLOB_PREFIX, uuid)
}

pub fn snapshot_blob_name(snapshot_uuid: &str) -> String {
    format!("{}{}.dat", SNAPSHOT_BLOB_PREFIX, snapshot_uuid)
}

pub fn shallow_snapshot_blob_name(snapshot_uuid: &str) -> String {
    format!("{}{}.dat", SHALLOW_SNAPSHOT_BLOB_PREFIX, snapshot_uuid)
}

pub fn metadata_blob_name(uuid: &str) -> String {
    format!("{}{}.dat", METADATA_BLOB_PREFIX, uuid)
}

pub fn shard_index_blob_name(generation: &ShardGeneration) -> String {
    format!("{}{}", SHARD_INDEX_BLOB_PREFIX, generation)
}

/// Metadata of one file inside a shard commit, as reported by the
/// local store.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct FileMetadata {
    /// Physical file name inside the shard directory.
    pub name: String,
    pub length: u64,
    /// Content checksum as maintained by the store (CRC32, hex).
    pub checksum: String,
    /// Uuid of the writer that produced the file, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub writer_uuid: Option<String>,
    /// Full file contents (hex) for small metadata files. Such files
    /// are stored inline instead of as data blobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// SHA-256 of the file contents (hex), used to verify streams.
    pub sha256: String,
}

impl FileMetadata {
    /// Whether the inline `hash` holds the complete file contents.
    pub fn hash_equals_contents(&self) -> bool {
        match &self.hash {
            Some(hash) => hash.len() as u64 == self.length * 2,
            None => false,
        }
    }

    pub fn inline_bytes(&self) -> Option<Vec<u8>> {
        if !self.hash_equals_contents() {
            return None;
        }
        hex::decode(self.hash.as_ref().unwrap()).ok()
    }

    /// Content equality as far as it can be judged without reading
    /// the file: equal length plus checksum and writer uuid, or equal
    /// length plus inline contents.
    pub fn is_same(&self, other: &FileMetadata) -> bool {
        if self.length != other.length {
            return false;
        }
        if self.hash_equals_contents() && other.hash_equals_contents() {
            return self.hash == other.hash;
        }
        self.checksum == other.checksum && self.writer_uuid == other.writer_uuid
    }
}

/// A file captured by a snapshot: which blob (or inline reference)
/// holds it, and in how many parts it was uploaded.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct FileInfo {
    /// `__<uuid>` for stored files, `v__<uuid>` for inline ones.
    pub blob_name: String,
    pub metadata: FileMetadata,
    /// Upload part size; absent means one part for the whole file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part_size: Option<u64>,
}

impl FileInfo {
    pub fn is_virtual(&self) -> bool {
        self.blob_name.starts_with(VIRTUAL_DATA_BLOB_PREFIX)
    }

    fn effective_part_size(&self) -> u64 {
        match self.part_size {
            Some(size) => size,
            None => self.metadata.length.max(1),
        }
    }

    pub fn part_count(&self) -> u64 {
        if self.metadata.length == 0 {
            return 1;
        }
        self.metadata.length.div_ceil(self.effective_part_size())
    }

    pub fn part_name(&self, part: u64) -> String {
        if self.part_count() == 1 {
            self.blob_name.clone()
        } else {
            format!("{}.part{}", self.blob_name, part)
        }
    }

    pub fn part_length(&self, part: u64) -> u64 {
        let part_size = self.effective_part_size();
        let offset = part * part_size;
        part_size.min(self.metadata.length.saturating_sub(offset))
    }

    /// Blob names this file occupies in the shard container. Empty for
    /// virtual files.
    pub fn blob_names(&self) -> Vec<String> {
        if self.is_virtual() {
            return Vec::new();
        }
        (0..self.part_count()).map(|part| self.part_name(part)).collect()
    }
}

/// The files one snapshot references in one shard.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct SnapshotFiles {
    /// Snapshot name; unique among the live snapshots of a repository.
    pub snapshot: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard_state_id: Option<String>,
    pub files: Vec<FileInfo>,
}

/// The per-shard manifest (`index-<generation>`): one entry per
/// full-copy snapshot containing the shard.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct BlobStoreIndexShardSnapshots {
    pub snapshots: Vec<SnapshotFiles>,
}

impl BlobStoreIndexShardSnapshots {
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Find a file with the given physical name in any snapshot.
    /// Multiple snapshots referencing the same content share one
    /// `FileInfo`-equivalent entry, so the first match is as good as
    /// any.
    pub fn find_physical<'a>(
        &'a self,
        physical_name: &'a str,
    ) -> impl Iterator<Item = &'a FileInfo> + 'a {
        self.snapshots
            .iter()
            .flat_map(|entry| entry.files.iter())
            .filter(move |file| file.metadata.name == physical_name)
    }

    /// The entry recorded for a given store commit identifier, if any.
    pub fn entry_for_state_id(&self, state_id: &str) -> Option<&SnapshotFiles> {
        self.snapshots
            .iter()
            .find(|entry| entry.shard_state_id.as_deref() == Some(state_id))
    }

    pub fn with_entry(&self, entry: SnapshotFiles) -> Self {
        let mut snapshots = self.snapshots.clone();
        snapshots.push(entry);
        Self { snapshots }
    }

    /// Keep only the entries of the named snapshots.
    pub fn retain_snapshots(&self, surviving: &BTreeSet<String>) -> Self {
        Self {
            snapshots: self
                .snapshots
                .iter()
                .filter(|entry| surviving.contains(&entry.snapshot))
                .cloned()
                .collect(),
        }
    }

    /// All data blob names referenced by any entry.
    pub fn referenced_blob_names(&self) -> BTreeSet<String> {
        self.snapshots
            .iter()
            .flat_map(|entry| entry.files.iter())
            .flat_map(|file| file.blob_names())
            .collect()
    }
}

/// The shard-level `snap-<uuid>.dat` blob: the authoritative record
/// that a snapshot of this shard completed, written only after every
/// data part is in place.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct BlobStoreIndexShardSnapshot {
    pub snapshot: String,
    pub index_files: Vec<FileInfo>,
    pub start_time: i64,
    pub time: i64,
    pub incremental_file_count: u64,
    pub incremental_size: u64,
    pub total_file_count: u64,
    pub total_size: u64,
}

/// The shard-level `shallow-snap-<uuid>.dat` blob: shard payload kept
/// in a remote store tier, referenced through a lock acquirer uuid.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct RemoteStoreShardShallowCopySnapshot {
    pub snapshot: String,
    pub index_uuid: String,
    pub shard: u32,
    /// The remote-store lock held on behalf of this snapshot.
    pub remote_store_lock_acquirer: String,
    pub file_names: Vec<String>,
    pub total_size: u64,
    pub start_time: i64,
    pub time: i64,
}

pub const SHARD_INDEX_FORMAT: ChecksumBlobFormat<BlobStoreIndexShardSnapshots> =
    ChecksumBlobFormat::new("shard-index");
pub const SHARD_SNAPSHOT_FORMAT: ChecksumBlobFormat<BlobStoreIndexShardSnapshot> =
    ChecksumBlobFormat::new("shard-snapshot");
pub const SHALLOW_SNAPSHOT_FORMAT: ChecksumBlobFormat<RemoteStoreShardShallowCopySnapshot> =
    ChecksumBlobFormat::new("shallow-shard-snapshot");

#[cfg(test)]
mod test {
    use super::*;

    fn metadata(name: &str, length: u64, checksum: &str) -> FileMetadata {
        FileMetadata {
            name: name.to_string(),
            length,
            checksum: checksum.to_string(),
            writer_uuid: None,
            hash: None,
            sha256: "00".repeat(32),
        }
    }

    #[test]
    fn part_naming() {
        let single = FileInfo {
            blob_name: data_blob_name("abc"),
            metadata: metadata("_0.cfs", 10, "aabbccdd"),
            part_size: None,
        };
        assert_eq!(single.part_count(), 1);
        assert_eq!(single.part_name(0), "__abc");
        assert_eq!(single.part_length(0), 10);
        assert_eq!(single.blob_names(), vec!["__abc"]);

        let parted = FileInfo {
            blob_name: data_blob_name("abc"),
            metadata: metadata("_0.cfs", 10, "aabbccdd"),
            part_size: Some(4),
        };
        assert_eq!(parted.part_count(), 3);
        assert_eq!(parted.part_name(0), "__abc.part0");
        assert_eq!(parted.part_length(2), 2);
        assert_eq!(
            parted.blob_names(),
            vec!["__abc.part0", "__abc.part1", "__abc.part2"]
        );
    }

    #[test]
    fn zero_length_files_have_one_part() {
        let empty = FileInfo {
            blob_name: data_blob_name("xyz"),
            metadata: metadata("segments_1", 0, "00000000"),
            part_size: Some(4),
        };
        assert_eq!(empty.part_count(), 1);
        assert_eq!(empty.part_length(0), 0);
    }

    #[test]
    fn virtual_files_occupy_no_blobs() {
        let mut md = metadata("segments_2", 2, "aabbccdd");
        md.hash = Some(hex::encode(b"ok"));
        assert!(md.hash_equals_contents());
        assert_eq!(md.inline_bytes().unwrap(), b"ok");

        let file = FileInfo {
            blob_name: virtual_data_blob_name("xyz"),
            metadata: md,
            part_size: None,
        };
        assert!(file.is_virtual());
        assert!(file.blob_names().is_empty());
    }

    #[test]
    fn is_same_matches_by_checksum_or_inline_hash() {
        let a = metadata("f", 10, "aabbccdd");
        let b = metadata("f", 10, "aabbccdd");
        let c = metadata("f", 10, "ddccbbaa");
        let shorter = metadata("f", 9, "aabbccdd");
        assert!(a.is_same(&b));
        assert!(!a.is_same(&c));
        assert!(!a.is_same(&shorter));

        let mut inline_a = metadata("g", 2, "11111111");
        inline_a.hash = Some(hex::encode(b"hi"));
        let mut inline_b = metadata("g", 2, "22222222");
        inline_b.hash = Some(hex::encode(b"hi"));
        // inline contents win over checksum differences
        assert!(inline_a.is_same(&inline_b));
    }

    #[test]
    fn shard_index_lookup_and_retain() {
        let file = FileInfo {
            blob_name: data_blob_name("d1"),
            metadata: metadata("_0.cfs", 10, "aabbccdd"),
            part_size: None,
        };
        let index = BlobStoreIndexShardSnapshots::default()
            .with_entry(SnapshotFiles {
                snapshot: "s1".into(),
                shard_state_id: Some("commit-1".into()),
                files: vec![file.clone()],
            })
            .with_entry(SnapshotFiles {
                snapshot: "s2".into(),
                shard_state_id: None,
                files: vec![file.clone()],
            });

        assert_eq!(index.find_physical("_0.cfs").count(), 2);
        assert!(index.entry_for_state_id("commit-1").is_some());
        assert_eq!(index.referenced_blob_names().len(), 1);

        let surviving: BTreeSet<String> = ["s2".to_string()].into();
        let retained = index.retain_snapshots(&surviving);
        assert_eq!(retained.snapshots.len(), 1);
        assert_eq!(retained.snapshots[0].snapshot, "s2");
    }
}
