//! The repository-wide manifest (`index-<N>`).

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{bail, format_err, Error};
use serde::{Deserialize, Serialize};

use snaprepo_api_types::{IndexId, ShardGeneration, SnapshotId, SnapshotState, EMPTY_REPO_GEN};

pub const INDEX_BLOB_PREFIX: &str = "index-";
pub const INDEX_LATEST_BLOB: &str = "index.latest";

/// Format version of the generational manifest. Pre-v2 layouts are
/// not read.
pub const REPOSITORY_DATA_VERSION: u32 = 2;

pub fn index_blob_name(gen: i64) -> String {
    format!("{}{}", INDEX_BLOB_PREFIX, gen)
}

/// Parse the generation out of an `index-<N>` blob name.
pub fn parse_index_blob_gen(name: &str) -> Option<i64> {
    let gen: i64 = name.strip_prefix(INDEX_BLOB_PREFIX)?.parse().ok()?;
    (gen >= 0).then_some(gen)
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct SnapshotRecord {
    pub name: String,
    pub uuid: String,
    pub state: SnapshotState,
    pub version: u32,
}

impl SnapshotRecord {
    pub fn id(&self) -> SnapshotId {
        SnapshotId::with_uuid(self.name.clone(), self.uuid.clone())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct IndexRecord {
    pub uuid: String,
    /// Uuids of the snapshots containing this index, oldest first.
    pub snapshots: Vec<String>,
    /// Current generation token per shard, indexed by shard number.
    pub shard_generations: Vec<ShardGeneration>,
}

/// Blobs that stopped being referenced by a manifest mutation. The
/// delete path turns these into garbage collection work.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RemovedArtifacts {
    /// Snapshot uuids that left the manifest.
    pub snapshot_uuids: Vec<String>,
    /// Indices no longer contained in any snapshot; their whole
    /// directory is orphaned.
    pub index_dirs: Vec<IndexId>,
    /// Deduplicated index metadata blobs without remaining referrers,
    /// as `(index uuid, metadata blob uuid)`.
    pub index_meta_blobs: Vec<(String, String)>,
}

/// In-memory manifest of snapshots, indices and per-shard generations,
/// loaded from (and written to) one `index-<N>` blob.
///
/// All mutation happens copy-on-write: operations return an updated
/// manifest and leave `self` untouched, so a failed publish never
/// poisons the loaded state.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct RepositoryData {
    /// The generation this manifest was loaded from. Not serialized;
    /// `index-<N>` does not repeat its own name.
    #[serde(skip, default = "default_gen_id")]
    pub gen_id: i64,
    version: u32,
    snapshots: Vec<SnapshotRecord>,
    indices: BTreeMap<String, IndexRecord>,
    /// Identity key of an index metadata payload to the uuid of the
    /// `meta-<uuid>.dat` blob storing it.
    index_meta_identifiers: BTreeMap<String, String>,
    /// Snapshot uuid to index uuid to identity key.
    index_meta_lookup: BTreeMap<String, BTreeMap<String, String>>,
}

fn default_gen_id() -> i64 {
    EMPTY_REPO_GEN
}

impl RepositoryData {
    /// The manifest of a repository nothing was ever written to.
    pub fn empty() -> Self {
        Self {
            gen_id: EMPTY_REPO_GEN,
            version: REPOSITORY_DATA_VERSION,
            snapshots: Vec::new(),
            indices: BTreeMap::new(),
            index_meta_identifiers: BTreeMap::new(),
            index_meta_lookup: BTreeMap::new(),
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn deserialize(gen_id: i64, data: &[u8]) -> Result<Self, Error> {
        let mut parsed: RepositoryData = serde_json::from_slice(data)?;
        if parsed.version != REPOSITORY_DATA_VERSION {
            bail!(
                "unsupported repository manifest version {} (expected {})",
                parsed.version,
                REPOSITORY_DATA_VERSION,
            );
        }
        parsed.gen_id = gen_id;
        Ok(parsed)
    }

    pub fn snapshots(&self) -> &[SnapshotRecord] {
        &self.snapshots
    }

    pub fn snapshot_ids(&self) -> Vec<SnapshotId> {
        self.snapshots.iter().map(|record| record.id()).collect()
    }

    pub fn contains_snapshot(&self, snapshot: &SnapshotId) -> bool {
        self.snapshots.iter().any(|record| record.uuid == snapshot.uuid)
    }

    pub fn snapshot_by_name(&self, name: &str) -> Option<&SnapshotRecord> {
        self.snapshots.iter().find(|record| record.name == name)
    }

    pub fn indices(&self) -> impl Iterator<Item = IndexId> + '_ {
        self.indices
            .iter()
            .map(|(name, record)| IndexId::with_uuid(name.clone(), record.uuid.clone()))
    }

    pub fn index_id(&self, name: &str) -> Option<IndexId> {
        self.indices
            .get(name)
            .map(|record| IndexId::with_uuid(name, record.uuid.clone()))
    }

    fn index_record(&self, index: &IndexId) -> Result<&IndexRecord, Error> {
        match self.indices.get(&index.name) {
            Some(record) if record.uuid == index.uuid => Ok(record),
            _ => Err(format_err!("index {} is not part of the repository", index)),
        }
    }

    /// Indices contained in the given snapshot.
    pub fn indices_of_snapshot(&self, snapshot_uuid: &str) -> Vec<IndexId> {
        self.indices
            .iter()
            .filter(|(_, record)| record.snapshots.iter().any(|uuid| uuid == snapshot_uuid))
            .map(|(name, record)| IndexId::with_uuid(name.clone(), record.uuid.clone()))
            .collect()
    }

    pub fn shard_count(&self, index: &IndexId) -> Result<usize, Error> {
        Ok(self.index_record(index)?.shard_generations.len())
    }

    pub fn shard_generation(
        &self,
        index: &IndexId,
        shard: u32,
    ) -> Result<Option<&ShardGeneration>, Error> {
        Ok(self.index_record(index)?.shard_generations.get(shard as usize))
    }

    pub fn index_meta_blob_uuid(&self, identity: &str) -> Option<&String> {
        self.index_meta_identifiers.get(identity)
    }

    /// Identity key of the metadata written for `index` in `snapshot`.
    pub fn index_meta_identity(&self, snapshot_uuid: &str, index_uuid: &str) -> Option<&String> {
        self.index_meta_lookup.get(snapshot_uuid)?.get(index_uuid)
    }

    /// Insert a freshly finalized (or cloned) snapshot.
    pub fn with_snapshot(
        &self,
        snapshot: &SnapshotId,
        state: SnapshotState,
        version: u32,
        shard_generations: &BTreeMap<IndexId, BTreeMap<u32, ShardGeneration>>,
        index_meta_identities: &BTreeMap<IndexId, String>,
        new_meta_identifiers: &BTreeMap<String, String>,
    ) -> Result<RepositoryData, Error> {
        if self.contains_snapshot(snapshot) {
            bail!("snapshot {} is already part of the repository", snapshot);
        }
        if self.snapshot_by_name(&snapshot.name).is_some() {
            bail!("snapshot name '{}' is already in use", snapshot.name);
        }

        let mut updated = self.clone();
        updated.snapshots.push(SnapshotRecord {
            name: snapshot.name.clone(),
            uuid: snapshot.uuid.clone(),
            state,
            version,
        });

        for (index, generations) in shard_generations {
            let record = updated
                .indices
                .entry(index.name.clone())
                .or_insert_with(|| IndexRecord {
                    uuid: index.uuid.clone(),
                    snapshots: Vec::new(),
                    shard_generations: Vec::new(),
                });
            if record.uuid != index.uuid {
                bail!(
                    "index name '{}' is already bound to uuid {}",
                    index.name,
                    record.uuid,
                );
            }
            record.snapshots.push(snapshot.uuid.clone());
            for (&shard, generation) in generations {
                let slot = shard as usize;
                if record.shard_generations.len() <= slot {
                    record
                        .shard_generations
                        .resize(slot + 1, ShardGeneration::New);
                }
                record.shard_generations[slot] = generation.clone();
            }
        }

        for (index, identity) in index_meta_identities {
            updated
                .index_meta_lookup
                .entry(snapshot.uuid.clone())
                .or_default()
                .insert(index.uuid.clone(), identity.clone());
        }
        for (identity, blob_uuid) in new_meta_identifiers {
            updated
                .index_meta_identifiers
                .insert(identity.clone(), blob_uuid.clone());
        }

        updated.assert_consistent();
        Ok(updated)
    }

    /// Remove a set of snapshots, applying the shard generations the
    /// delete rewrote. Returns the updated manifest and everything
    /// that became unreferenced.
    pub fn remove_snapshots(
        &self,
        snapshots: &[SnapshotId],
        updated_shard_generations: &BTreeMap<IndexId, BTreeMap<u32, ShardGeneration>>,
    ) -> Result<(RepositoryData, RemovedArtifacts), Error> {
        let removed_uuids: BTreeSet<&str> = snapshots
            .iter()
            .filter(|id| self.contains_snapshot(id))
            .map(|id| id.uuid.as_str())
            .collect();
        if removed_uuids.is_empty() {
            bail!("none of the snapshots to delete are part of the repository");
        }

        let mut updated = self.clone();
        let mut removed = RemovedArtifacts {
            snapshot_uuids: removed_uuids.iter().map(|uuid| uuid.to_string()).collect(),
            ..Default::default()
        };

        updated
            .snapshots
            .retain(|record| !removed_uuids.contains(record.uuid.as_str()));

        for (index, generations) in updated_shard_generations {
            let record = updated
                .indices
                .get_mut(&index.name)
                .ok_or_else(|| format_err!("index {} is not part of the repository", index))?;
            for (&shard, generation) in generations {
                let slot = shard as usize;
                if slot >= record.shard_generations.len() {
                    bail!("shard {} out of range for index {}", shard, index);
                }
                record.shard_generations[slot] = generation.clone();
            }
        }

        let mut orphaned_indices = Vec::new();
        for (name, record) in updated.indices.iter_mut() {
            record
                .snapshots
                .retain(|uuid| !removed_uuids.contains(uuid.as_str()));
            if record.snapshots.is_empty() {
                orphaned_indices.push(name.clone());
            }
        }
        for name in orphaned_indices {
            if let Some(record) = updated.indices.remove(&name) {
                removed
                    .index_dirs
                    .push(IndexId::with_uuid(name, record.uuid));
            }
        }

        // identity keys referenced only by the removed snapshots lose
        // their metadata blob
        let mut identity_to_index: BTreeMap<String, String> = BTreeMap::new();
        for uuid in &removed.snapshot_uuids {
            if let Some(row) = updated.index_meta_lookup.remove(uuid) {
                for (index_uuid, identity) in row {
                    identity_to_index.insert(identity, index_uuid);
                }
            }
        }
        let still_referenced: BTreeSet<&String> = updated
            .index_meta_lookup
            .values()
            .flat_map(|row| row.values())
            .collect();
        for (identity, index_uuid) in identity_to_index {
            if still_referenced.contains(&identity) {
                continue;
            }
            if let Some(blob_uuid) = updated.index_meta_identifiers.remove(&identity) {
                removed.index_meta_blobs.push((index_uuid, blob_uuid));
            }
        }

        updated.assert_consistent();
        Ok((updated, removed))
    }

    /// Debug-time referential integrity: every snapshot referenced by
    /// an index record exists, and so does every metadata lookup row.
    fn assert_consistent(&self) {
        if cfg!(debug_assertions) {
            let live: BTreeSet<&str> = self
                .snapshots
                .iter()
                .map(|record| record.uuid.as_str())
                .collect();
            for (name, record) in &self.indices {
                for uuid in &record.snapshots {
                    debug_assert!(
                        live.contains(uuid.as_str()),
                        "index '{}' references unknown snapshot {}",
                        name,
                        uuid,
                    );
                }
            }
            for uuid in self.index_meta_lookup.keys() {
                debug_assert!(
                    live.contains(uuid.as_str()),
                    "metadata lookup references unknown snapshot {}",
                    uuid,
                );
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn shard_gens(
        index: &IndexId,
        gens: &[(u32, ShardGeneration)],
    ) -> BTreeMap<IndexId, BTreeMap<u32, ShardGeneration>> {
        let mut map = BTreeMap::new();
        map.insert(index.clone(), gens.iter().cloned().collect());
        map
    }

    fn add_snapshot(
        data: &RepositoryData,
        snapshot: &SnapshotId,
        index: &IndexId,
        generation: ShardGeneration,
    ) -> RepositoryData {
        let mut identities = BTreeMap::new();
        identities.insert(index.clone(), format!("identity-{}", index.uuid));
        let mut new_identifiers = BTreeMap::new();
        new_identifiers.insert(format!("identity-{}", index.uuid), "metablob".to_string());
        data.with_snapshot(
            snapshot,
            SnapshotState::Success,
            REPOSITORY_DATA_VERSION,
            &shard_gens(index, &[(0, generation)]),
            &identities,
            &new_identifiers,
        )
        .unwrap()
    }

    #[test]
    fn round_trip() {
        let index = IndexId::new("docs");
        let snapshot = SnapshotId::new("s1");
        let data = add_snapshot(
            &RepositoryData::empty(),
            &snapshot,
            &index,
            ShardGeneration::new_generation(),
        );

        let bytes = data.serialize().unwrap();
        let parsed = RepositoryData::deserialize(7, &bytes).unwrap();
        assert_eq!(parsed.gen_id, 7);
        assert_eq!(parsed.snapshots(), data.snapshots());
        assert_eq!(parsed.index_id("docs"), Some(index.clone()));
        assert!(parsed.contains_snapshot(&snapshot));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let index = IndexId::new("docs");
        let data = add_snapshot(
            &RepositoryData::empty(),
            &SnapshotId::new("s1"),
            &index,
            ShardGeneration::new_generation(),
        );
        let err = data
            .with_snapshot(
                &SnapshotId::new("s1"),
                SnapshotState::Success,
                REPOSITORY_DATA_VERSION,
                &BTreeMap::new(),
                &BTreeMap::new(),
                &BTreeMap::new(),
            )
            .unwrap_err();
        assert!(err.to_string().contains("already in use"));
    }

    #[test]
    fn removing_the_last_snapshot_orphans_the_index() {
        let index = IndexId::new("docs");
        let s1 = SnapshotId::new("s1");
        let s2 = SnapshotId::new("s2");
        let data = add_snapshot(
            &RepositoryData::empty(),
            &s1,
            &index,
            ShardGeneration::new_generation(),
        );
        let data = data
            .with_snapshot(
                &s2,
                SnapshotState::Success,
                REPOSITORY_DATA_VERSION,
                &shard_gens(&index, &[(0, ShardGeneration::new_generation())]),
                &BTreeMap::new(),
                &BTreeMap::new(),
            )
            .unwrap();

        let (data, removed) = data
            .remove_snapshots(
                &[s1.clone()],
                &shard_gens(&index, &[(0, ShardGeneration::new_generation())]),
            )
            .unwrap();
        assert_eq!(removed.snapshot_uuids, vec![s1.uuid.clone()]);
        assert!(removed.index_dirs.is_empty());
        // the identity key was only referenced by s1
        assert_eq!(removed.index_meta_blobs.len(), 1);

        let (data, removed) = data
            .remove_snapshots(
                &[s2.clone()],
                &shard_gens(&index, &[(0, ShardGeneration::Deleted)]),
            )
            .unwrap();
        assert_eq!(removed.index_dirs, vec![index]);
        assert!(data.snapshots().is_empty());
    }

    #[test]
    fn index_blob_names_parse() {
        assert_eq!(parse_index_blob_gen("index-12"), Some(12));
        assert_eq!(parse_index_blob_gen("index-"), None);
        assert_eq!(parse_index_blob_gen("index-x"), None);
        assert_eq!(parse_index_blob_gen("index.latest"), None);
        assert_eq!(parse_index_blob_gen(&index_blob_name(3)), Some(3));
    }
}
