//! Snapshot finalization: turning a set of completed shard uploads
//! into a published repository generation.

use std::collections::BTreeMap;

use anyhow::Error;

use snaprepo_api_types::{new_uuid, IndexId, ShardGeneration, SnapshotId, SnapshotState};
use snaprepo_blobstore::container::BlobContainer;
use snaprepo_blobstore::repository_data::REPOSITORY_DATA_VERSION;
use snaprepo_blobstore::root_blobs::{
    ClusterMetadata, IndexMetadata, SnapshotInfo, CLUSTER_METADATA_FORMAT, INDEX_METADATA_FORMAT,
    SNAPSHOT_INFO_FORMAT,
};
use snaprepo_blobstore::shard::{metadata_blob_name, shard_index_blob_name, snapshot_blob_name};
use snaprepo_tools::fs::epoch_millis_i64;

use super::BlobStoreRepository;

/// Everything the shard upload phase produced for one snapshot.
pub struct SnapshotFinalization {
    pub snapshot: SnapshotId,
    pub state: SnapshotState,
    /// New shard generation per `(index, shard)`.
    pub shard_generations: BTreeMap<IndexId, BTreeMap<u32, ShardGeneration>>,
    /// Metadata of every index in the snapshot.
    pub index_metadata: Vec<IndexMetadata>,
    pub cluster_metadata: ClusterMetadata,
    pub start_time: i64,
    pub shards_failed: u32,
    pub failure_reason: Option<String>,
}

impl BlobStoreRepository {
    /// Write the global, index and snapshot metadata blobs, insert the
    /// snapshot into the repository manifest and publish the new
    /// generation. Returns the published generation.
    ///
    /// Metadata writes do not fail on pre-existing blobs: after a
    /// cluster-manager failover the previous manager may have written
    /// identical blobs already, and identical identifiers always point
    /// at identical bytes.
    pub fn finalize_snapshot(&self, finalization: SnapshotFinalization) -> Result<i64, Error> {
        self.ensure_writable()?;
        let repository_data = self.get_repository_data()?;
        let expected_gen = repository_data.gen_id;
        let compression = self.compression()?;

        let SnapshotFinalization {
            snapshot,
            state,
            shard_generations,
            index_metadata,
            cluster_metadata,
            start_time,
            shards_failed,
            failure_reason,
        } = finalization;

        // shard index blobs replaced by this snapshot, for the GC pass
        let mut replaced: Vec<(IndexId, u32, ShardGeneration)> = Vec::new();
        for (index, generations) in &shard_generations {
            if repository_data.index_id(&index.name).as_ref() != Some(index) {
                continue;
            }
            for (&shard, new_generation) in generations {
                if let Ok(Some(old)) = repository_data.shard_generation(index, shard) {
                    if old.has_blob() && old != new_generation {
                        replaced.push((index.clone(), shard, old.clone()));
                    }
                }
            }
        }

        // deduplicated index metadata
        let mut identities: BTreeMap<IndexId, String> = BTreeMap::new();
        let mut new_identifiers: BTreeMap<String, String> = BTreeMap::new();
        for meta in &index_metadata {
            let identity = meta.identity_key();
            identities.insert(meta.index.clone(), identity.clone());
            if repository_data.index_meta_blob_uuid(&identity).is_some()
                || new_identifiers.contains_key(&identity)
            {
                log::debug!(
                    "[{}] reusing index metadata blob for {}",
                    self.name(),
                    meta.index,
                );
                continue;
            }
            let blob_uuid = new_uuid();
            let container = self.index_container(&meta.index.uuid)?;
            INDEX_METADATA_FORMAT.write_atomic(
                &*container,
                &metadata_blob_name(&blob_uuid),
                meta,
                compression,
                false,
            )?;
            new_identifiers.insert(identity, blob_uuid);
        }

        // root level blobs
        let end_time = epoch_millis_i64();
        let shards_total: u32 = shard_generations
            .values()
            .map(|generations| generations.len() as u32)
            .sum();
        let info = SnapshotInfo {
            snapshot: snapshot.clone(),
            state,
            version: REPOSITORY_DATA_VERSION,
            indices: shard_generations.keys().map(|id| id.name.clone()).collect(),
            start_time,
            end_time,
            shards_total,
            shards_failed,
            reason: failure_reason,
        };
        let root = self.root()?;
        CLUSTER_METADATA_FORMAT.write_atomic(
            &**root,
            &metadata_blob_name(&snapshot.uuid),
            &cluster_metadata,
            compression,
            false,
        )?;
        SNAPSHOT_INFO_FORMAT.write_atomic(
            &**root,
            &snapshot_blob_name(&snapshot.uuid),
            &info,
            compression,
            false,
        )?;

        let updated = repository_data.with_snapshot(
            &snapshot,
            state,
            REPOSITORY_DATA_VERSION,
            &shard_generations,
            &identities,
            &new_identifiers,
        )?;
        let new_gen = self.write_index_gen(&updated, expected_gen)?;

        // the shard index blobs this snapshot superseded are garbage
        // now; losing this race only leaves work for the next delete
        for (index, shard, old_generation) in replaced {
            let result = self.shard_container(&index.uuid, shard).and_then(|container| {
                container.delete_blobs_ignoring_if_not_exists(&[shard_index_blob_name(
                    &old_generation,
                )])
            });
            if let Err(err) = result {
                log::warn!(
                    "[{}] unable to delete superseded shard index of {}[{}]: {}",
                    self.name(),
                    index,
                    shard,
                    err,
                );
            }
        }

        log::info!(
            "[{}] finalized snapshot {} at generation {}",
            self.name(),
            snapshot,
            new_gen,
        );
        Ok(new_gen)
    }
}
