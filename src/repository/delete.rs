//! Snapshot deletion and snapshot clone.
//!
//! Both operations rewrite per-shard manifests and then publish an
//! updated repository manifest through the generation protocol. Any
//! failure before the publish leaves the repository at its previous
//! generation; half-written blobs become stale and are reclaimed by a
//! later delete or cleanup.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use anyhow::{bail, format_err, Error};

use snaprepo_api_types::{
    CompressionType, IndexId, RepositoryShardId, ShardGeneration, SnapshotId,
};
use snaprepo_blobstore::container::{BlobContainer, BlobContainerExt, DeleteStats};
use snaprepo_blobstore::shard::{
    metadata_blob_name, shallow_snapshot_blob_name, shard_index_blob_name, snapshot_blob_name,
    BlobStoreIndexShardSnapshots, SnapshotFiles, DATA_BLOB_PREFIX, SHALLOW_SNAPSHOT_BLOB_PREFIX,
    SHARD_INDEX_BLOB_PREFIX, SHARD_INDEX_FORMAT, SHARD_SNAPSHOT_FORMAT, SNAPSHOT_BLOB_PREFIX,
    SHALLOW_SNAPSHOT_FORMAT, TEMP_BLOB_PREFIX,
};
use snaprepo_blobstore::root_blobs::{
    ClusterMetadata, SnapshotInfo, CLUSTER_METADATA_FORMAT, SNAPSHOT_INFO_FORMAT,
};
use snaprepo_tools::fs::epoch_millis_i64;
use snaprepo_tools::worker_pool::assert_pool_thread;
use snaprepo_tools::{Completion, GroupedCompletion, WorkerPool};

use super::BlobStoreRepository;

/// Result of a completed snapshot delete.
#[derive(Debug)]
pub struct DeleteResult {
    /// The repository generation after the delete.
    pub generation: i64,
    /// Blobs reclaimed by the post-publish garbage collection.
    pub stats: DeleteStats,
}

/// What the per-shard rewrite produced for one `(index, shard)`.
pub(crate) struct ShardDeleteOutcome {
    pub index: IndexId,
    pub shard: u32,
    /// New generation token, absent when the shard manifest was left
    /// untouched.
    pub new_generation: Option<ShardGeneration>,
    /// Blobs no longer referenced once the delete publishes.
    pub stale_blobs: Vec<String>,
    /// `(blob name, snapshot uuid)` of shallow snapshot markers whose
    /// remote-store lock must be released before the blob is deleted.
    pub shallow_stale: Vec<(String, String)>,
}

impl BlobStoreRepository {
    /// Delete a collection of snapshots, atomically with respect to
    /// the repository manifest.
    ///
    /// Deleting snapshots that are already gone is a no-op returning
    /// the current generation, so a retried delete converges.
    pub fn delete_snapshots(
        &self,
        snapshots: &[SnapshotId],
        expected_gen: i64,
    ) -> Result<DeleteResult, Error> {
        assert_pool_thread(&["snap", "generic"]);
        self.ensure_writable()?;
        let repository_data = self.get_repository_data()?;
        self.expect_generation(&repository_data, expected_gen)?;

        let to_delete: Vec<SnapshotId> = snapshots
            .iter()
            .filter(|id| repository_data.contains_snapshot(id))
            .cloned()
            .collect();
        if to_delete.is_empty() {
            log::info!(
                "[{}] snapshots already deleted, nothing to do",
                self.name(),
            );
            return Ok(DeleteResult {
                generation: repository_data.gen_id,
                stats: DeleteStats::default(),
            });
        }

        let deleted_uuids: BTreeSet<String> =
            to_delete.iter().map(|id| id.uuid.clone()).collect();
        let surviving_names: BTreeSet<String> = repository_data
            .snapshots()
            .iter()
            .filter(|record| !deleted_uuids.contains(&record.uuid))
            .map(|record| record.name.clone())
            .collect();

        // every shard of every index the deleted snapshots touch
        let mut affected_indices: BTreeMap<String, IndexId> = BTreeMap::new();
        for id in &to_delete {
            for index in repository_data.indices_of_snapshot(&id.uuid) {
                affected_indices.insert(index.uuid.clone(), index);
            }
        }
        let mut jobs: Vec<(RepositoryShardId, Option<ShardGeneration>)> = Vec::new();
        for index in affected_indices.values() {
            for shard in 0..repository_data.shard_count(index)? as u32 {
                let current = repository_data.shard_generation(index, shard)?.cloned();
                jobs.push((RepositoryShardId::new(index.clone(), shard), current));
            }
        }

        // rewrite the shard manifests in parallel; one worker per
        // shard up to the snapshot pool capacity
        let compression = self.compression()?;
        let surviving_names = Arc::new(surviving_names);
        let deleted_uuids = Arc::new(deleted_uuids);

        // fan-in over the per-shard rewrites: the grouped completion
        // collects all outcomes, or the first failure
        let collected: Arc<Mutex<Option<Result<Vec<ShardDeleteOutcome>, Error>>>> =
            Arc::new(Mutex::new(None));
        let slot = Arc::clone(&collected);
        let group = GroupedCompletion::new(
            jobs.len(),
            Completion::new(move |result| {
                *slot.lock().unwrap() = Some(result);
            }),
        );

        let workers = self.snapshot_pool_size().min(jobs.len().max(1));
        let pool = WorkerPool::new("snap-shard-delete", workers);
        for (shard_id, current) in jobs {
            let container = self.shard_container(&shard_id.index.uuid, shard_id.shard)?;
            let surviving_names = Arc::clone(&surviving_names);
            let deleted_uuids = Arc::clone(&deleted_uuids);
            let group = group.clone();
            pool.spawn(move || {
                match rewrite_shard_for_delete(
                    &*container,
                    shard_id,
                    current,
                    &surviving_names,
                    &deleted_uuids,
                    compression,
                ) {
                    Ok(outcome) => {
                        group.child_success(outcome);
                        Ok(())
                    }
                    Err(err) => {
                        group.child_failure(anyhow::format_err!("{}", err));
                        Err(err)
                    }
                }
            })?;
        }
        pool.complete()?;
        let outcomes = collected
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| Ok(Vec::new()))?;

        let mut updated_generations: BTreeMap<IndexId, BTreeMap<u32, ShardGeneration>> =
            BTreeMap::new();
        for outcome in &outcomes {
            if let Some(generation) = &outcome.new_generation {
                updated_generations
                    .entry(outcome.index.clone())
                    .or_default()
                    .insert(outcome.shard, generation.clone());
            }
        }

        let (updated, removed) =
            repository_data.remove_snapshots(&to_delete, &updated_generations)?;
        let generation = self.write_index_gen(&updated, expected_gen)?;

        let stats = self.delete_unreferenced_blobs(&removed, &outcomes);
        log::info!(
            "[{}] deleted {} snapshot(s), now at generation {}",
            self.name(),
            to_delete.len(),
            generation,
        );
        Ok(DeleteResult { generation, stats })
    }

    /// Create `target` as a copy of the snapshot named `source`,
    /// referencing the same file set per shard without copying data.
    pub fn clone_snapshot(
        &self,
        source_name: &str,
        target: SnapshotId,
        expected_gen: i64,
    ) -> Result<i64, Error> {
        assert_pool_thread(&["snap", "generic"]);
        self.ensure_writable()?;
        let repository_data = self.get_repository_data()?;
        self.expect_generation(&repository_data, expected_gen)?;

        let source = self.resolve_snapshot(&repository_data, source_name)?;
        let record = repository_data
            .snapshot_by_name(source_name)
            .expect("source resolved above")
            .clone();
        if !record.state.restorable() {
            bail!(
                "cannot clone snapshot {} in state {:?}",
                source,
                record.state,
            );
        }

        let compression = self.compression()?;
        let start_time = epoch_millis_i64();
        let mut new_generations: BTreeMap<IndexId, BTreeMap<u32, ShardGeneration>> =
            BTreeMap::new();
        let mut identities: BTreeMap<IndexId, String> = BTreeMap::new();
        let mut replaced: Vec<(IndexId, u32, ShardGeneration)> = Vec::new();

        for index in repository_data.indices_of_snapshot(&source.uuid) {
            if let Some(identity) =
                repository_data.index_meta_identity(&source.uuid, &index.uuid)
            {
                identities.insert(index.clone(), identity.clone());
            }
            for shard in 0..repository_data.shard_count(&index)? as u32 {
                let shard_id = RepositoryShardId::new(index.clone(), shard);
                let container = self.shard_container(&index.uuid, shard)?;
                let generation = self.clone_shard_snapshot(
                    &*container,
                    &shard_id,
                    &source,
                    &target,
                    &repository_data.shard_generation(&index, shard)?.cloned(),
                    compression,
                    start_time,
                    &mut replaced,
                )?;
                new_generations
                    .entry(index.clone())
                    .or_default()
                    .insert(shard, generation);
            }
        }

        // root level: same cluster metadata, refreshed snapshot info
        let root = self.root()?;
        let cluster_metadata: ClusterMetadata =
            CLUSTER_METADATA_FORMAT.read(&**root, &metadata_blob_name(&source.uuid))?;
        CLUSTER_METADATA_FORMAT.write_atomic(
            &**root,
            &metadata_blob_name(&target.uuid),
            &cluster_metadata,
            compression,
            false,
        )?;
        let info: SnapshotInfo =
            SNAPSHOT_INFO_FORMAT.read(&**root, &snapshot_blob_name(&source.uuid))?;
        let cloned_info = info.cloned_as(&target, start_time, epoch_millis_i64());
        SNAPSHOT_INFO_FORMAT.write_atomic(
            &**root,
            &snapshot_blob_name(&target.uuid),
            &cloned_info,
            compression,
            false,
        )?;

        let updated = repository_data.with_snapshot(
            &target,
            record.state,
            record.version,
            &new_generations,
            &identities,
            &BTreeMap::new(),
        )?;
        let generation = self.write_index_gen(&updated, expected_gen)?;

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
            "[{}] cloned snapshot {} as {} at generation {}",
            self.name(),
            source,
            target,
            generation,
        );
        Ok(generation)
    }

    #[allow(clippy::too_many_arguments)]
    fn clone_shard_snapshot(
        &self,
        container: &dyn BlobContainer,
        shard_id: &RepositoryShardId,
        source: &SnapshotId,
        target: &SnapshotId,
        current_generation: &Option<ShardGeneration>,
        compression: Option<CompressionType>,
        start_time: i64,
        replaced: &mut Vec<(IndexId, u32, ShardGeneration)>,
    ) -> Result<ShardGeneration, Error> {
        let shallow_name = shallow_snapshot_blob_name(&source.uuid);
        if container.blob_exists(&shallow_name)? {
            // shallow clone: duplicate the remote-store lock before
            // the new marker blob exists
            self.lock_manager()
                .clone_lock(shard_id, &source.uuid, &target.uuid)?;
            let mut cloned = SHALLOW_SNAPSHOT_FORMAT.read(container, &shallow_name)?;
            cloned.snapshot = target.name.clone();
            cloned.remote_store_lock_acquirer = target.uuid.clone();
            cloned.start_time = start_time;
            cloned.time = epoch_millis_i64();
            SHALLOW_SNAPSHOT_FORMAT.write_atomic(
                container,
                &shallow_snapshot_blob_name(&target.uuid),
                &cloned,
                compression,
                false,
            )?;
            // the shard manifest tracks full copies only
            return current_generation
                .clone()
                .ok_or_else(|| format_err!("shallow snapshot on untracked shard {}", shard_id));
        }

        let source_snapshot =
            SHARD_SNAPSHOT_FORMAT.read(container, &snapshot_blob_name(&source.uuid))?;
        let target_snapshot = snaprepo_blobstore::shard::BlobStoreIndexShardSnapshot {
            snapshot: target.name.clone(),
            index_files: source_snapshot.index_files.clone(),
            start_time,
            time: epoch_millis_i64(),
            incremental_file_count: 0,
            incremental_size: 0,
            total_file_count: source_snapshot.total_file_count,
            total_size: source_snapshot.total_size,
        };
        SHARD_SNAPSHOT_FORMAT.write_atomic(
            container,
            &snapshot_blob_name(&target.uuid),
            &target_snapshot,
            compression,
            false,
        )?;

        let current = current_generation
            .clone()
            .filter(|generation| generation.has_blob())
            .ok_or_else(|| {
                format_err!("no shard manifest for {} to clone into", shard_id)
            })?;
        let existing =
            SHARD_INDEX_FORMAT.read(container, &shard_index_blob_name(&current))?;
        let source_entry = existing
            .snapshots
            .iter()
            .find(|entry| entry.snapshot == source.name)
            .ok_or_else(|| {
                format_err!(
                    "snapshot {} has no entry in the manifest of {}",
                    source,
                    shard_id,
                )
            })?
            .clone();

        let new_generation = current.successor();
        let updated = existing.with_entry(SnapshotFiles {
            snapshot: target.name.clone(),
            shard_state_id: source_entry.shard_state_id.clone(),
            files: source_entry.files,
        });
        SHARD_INDEX_FORMAT.write_atomic(
            container,
            &shard_index_blob_name(&new_generation),
            &updated,
            compression,
            true,
        )?;
        replaced.push((shard_id.index.clone(), shard_id.shard, current));
        Ok(new_generation)
    }
}

/// Rewrite one shard's manifest for a delete and compute the blobs
/// that will be unreferenced once the delete publishes.
fn rewrite_shard_for_delete(
    container: &dyn BlobContainer,
    shard_id: RepositoryShardId,
    current_generation: Option<ShardGeneration>,
    surviving_names: &BTreeSet<String>,
    deleted_uuids: &BTreeSet<String>,
    compression: Option<CompressionType>,
) -> Result<ShardDeleteOutcome, Error> {
    let existing = match &current_generation {
        Some(generation) if generation.has_blob() => {
            SHARD_INDEX_FORMAT.read(container, &shard_index_blob_name(generation))?
        }
        _ => BlobStoreIndexShardSnapshots::default(),
    };

    let updated = existing.retain_snapshots(surviving_names);
    let changed = updated != existing;

    let new_generation = if !changed {
        None
    } else if updated.is_empty() {
        // no full-copy snapshot references this shard any longer
        Some(ShardGeneration::Deleted)
    } else {
        let generation = match &current_generation {
            Some(current) => current.successor(),
            None => ShardGeneration::new_generation(),
        };
        SHARD_INDEX_FORMAT.write_atomic(
            container,
            &shard_index_blob_name(&generation),
            &updated,
            compression,
            true,
        )?;
        Some(generation)
    };

    // the manifest blob that stays authoritative after the publish
    let kept_index_blob = match &new_generation {
        Some(generation) if generation.has_blob() => Some(shard_index_blob_name(generation)),
        Some(_) => None,
        None => current_generation
            .as_ref()
            .filter(|generation| generation.has_blob())
            .map(shard_index_blob_name),
    };

    let referenced = updated.referenced_blob_names();
    let mut stale_blobs = Vec::new();
    let mut shallow_stale = Vec::new();
    for name in container.list_blobs()?.into_keys() {
        if Some(&name) == kept_index_blob.as_ref() {
            continue;
        }
        if name.starts_with(TEMP_BLOB_PREFIX) || name.starts_with(SHARD_INDEX_BLOB_PREFIX) {
            stale_blobs.push(name);
        } else if let Some(rest) = name.strip_prefix(SHALLOW_SNAPSHOT_BLOB_PREFIX) {
            if let Some(uuid) = rest.strip_suffix(".dat") {
                if deleted_uuids.contains(uuid) {
                    shallow_stale.push((name.clone(), uuid.to_string()));
                }
            }
        } else if let Some(rest) = name.strip_prefix(SNAPSHOT_BLOB_PREFIX) {
            if let Some(uuid) = rest.strip_suffix(".dat") {
                if deleted_uuids.contains(uuid) {
                    stale_blobs.push(name.clone());
                }
            }
        } else if name.starts_with(DATA_BLOB_PREFIX) && !referenced.contains(&name) {
            stale_blobs.push(name);
        }
    }

    Ok(ShardDeleteOutcome {
        index: shard_id.index,
        shard: shard_id.shard,
        new_generation,
        stale_blobs,
        shallow_stale,
    })
}
