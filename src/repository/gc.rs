//! Stale-blob garbage collection.
//!
//! Everything here runs after a new generation is already visible, so
//! failures are never escalated: the work is idempotent and the next
//! delete or cleanup retries it implicitly.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Error};

use snaprepo_blobstore::container::{BlobContainer, DeleteStats};
use snaprepo_blobstore::repository_data::{RemovedArtifacts, RepositoryData};
use snaprepo_blobstore::shard::{
    metadata_blob_name, snapshot_blob_name, INDICES_CONTAINER, METADATA_BLOB_PREFIX,
    SNAPSHOT_BLOB_PREFIX,
};
use snaprepo_tools::worker_pool::assert_pool_thread;
use snaprepo_tools::WorkerPool;

use super::delete::ShardDeleteOutcome;
use super::BlobStoreRepository;

impl BlobStoreRepository {
    /// Repository cleanup: a manifest write that changes no snapshot
    /// membership, followed by root-level garbage collection. Useful
    /// after interrupted writes left stale blobs behind.
    pub fn cleanup(&self) -> Result<DeleteStats, Error> {
        assert_pool_thread(&["snap", "generic"]);
        self.ensure_writable()?;

        let state = self.cluster().state();
        if state.snapshots_in_progress.for_repository(self.name()) {
            bail!("cannot clean up repository '{}' while a snapshot is running", self.name());
        }
        if state.deletions_in_progress.for_repository(self.name()) {
            bail!("cannot clean up repository '{}' while a deletion is running", self.name());
        }
        if state.cleanup_in_progress.for_repository(self.name()) {
            bail!("a cleanup of repository '{}' is already running", self.name());
        }

        let repository_data = self.get_repository_data()?;
        let expected_gen = repository_data.gen_id;
        self.write_index_gen(&repository_data, expected_gen)?;
        self.gc_root_blobs(&repository_data)
    }

    /// Scan-based root garbage collection: remove `snap-*`/`meta-*`
    /// blobs of unknown snapshots and whole index directories no
    /// manifest entry points at. Obsolete `index-<N>` manifests are
    /// already handled when a generation publishes.
    fn gc_root_blobs(&self, repository_data: &RepositoryData) -> Result<DeleteStats, Error> {
        let root = self.root()?;
        let mut stats = DeleteStats::default();

        let live_uuids: BTreeSet<&str> = repository_data
            .snapshots()
            .iter()
            .map(|record| record.uuid.as_str())
            .collect();

        let mut stale = Vec::new();
        for (name, entry) in root.list_blobs()? {
            let uuid = name
                .strip_prefix(SNAPSHOT_BLOB_PREFIX)
                .or_else(|| name.strip_prefix(METADATA_BLOB_PREFIX))
                .and_then(|rest| rest.strip_suffix(".dat"));
            if let Some(uuid) = uuid {
                if !live_uuids.contains(uuid) {
                    stats.blobs_deleted += 1;
                    stats.bytes_deleted += entry.length;
                    stale.push(name);
                }
            }
        }
        if !stale.is_empty() {
            log::info!(
                "[{}] cleanup deleting {} stale root blobs",
                self.name(),
                stale.len(),
            );
            root.delete_blobs_ignoring_if_not_exists(&stale)?;
        }

        let live_index_uuids: BTreeSet<String> =
            repository_data.indices().map(|index| index.uuid).collect();
        for (uuid, child) in root.child(INDICES_CONTAINER)?.children()? {
            if live_index_uuids.contains(&uuid) {
                continue;
            }
            match child.delete() {
                Ok(deleted) => {
                    log::info!(
                        "[{}] cleanup deleted orphaned index directory {} ({} blobs)",
                        self.name(),
                        uuid,
                        deleted.blobs_deleted,
                    );
                    stats.merge(deleted);
                }
                Err(err) => {
                    log::warn!(
                        "[{}] unable to delete orphaned index directory {}: {}",
                        self.name(),
                        uuid,
                        err,
                    );
                }
            }
        }

        Ok(stats)
    }

    /// Post-publish garbage collection for a completed delete: root
    /// blobs of the removed snapshots, orphaned index directories and
    /// the per-shard stale blobs, the latter in bounded batches on a
    /// bounded worker pool.
    pub(crate) fn delete_unreferenced_blobs(
        &self,
        removed: &RemovedArtifacts,
        outcomes: &[ShardDeleteOutcome],
    ) -> DeleteStats {
        let mut stats = DeleteStats::default();

        // (a) root level
        let root_result: Result<(), Error> = (|| {
            let root = self.root()?;
            let mut names = Vec::with_capacity(removed.snapshot_uuids.len() * 2);
            for uuid in &removed.snapshot_uuids {
                names.push(snapshot_blob_name(uuid));
                names.push(metadata_blob_name(uuid));
            }
            root.delete_blobs_ignoring_if_not_exists(&names)?;
            stats.blobs_deleted += names.len() as u64;

            for (index_uuid, blob_uuid) in &removed.index_meta_blobs {
                self.index_container(index_uuid)?
                    .delete_blobs_ignoring_if_not_exists(&[metadata_blob_name(blob_uuid)])?;
                stats.blobs_deleted += 1;
            }

            for index in &removed.index_dirs {
                match self.index_container(&index.uuid)?.delete() {
                    Ok(deleted) => stats.merge(deleted),
                    Err(err) => log::warn!(
                        "[{}] unable to delete orphaned index directory {}: {}",
                        self.name(),
                        index,
                        err,
                    ),
                }
            }
            Ok(())
        })();
        if let Err(err) = root_result {
            log::warn!("[{}] root-level cleanup after delete failed: {}", self.name(), err);
        }

        // (b) shard level, in batches
        let batch_size = match self.settings() {
            Ok(settings) => settings.max_snapshot_shard_blob_delete_batch_size,
            Err(_) => return stats,
        };

        struct Batch {
            container: Arc<dyn BlobContainer>,
            names: Vec<String>,
        }

        let mut batches = Vec::new();
        for outcome in outcomes {
            let container = match self.shard_container(&outcome.index.uuid, outcome.shard) {
                Ok(container) => container,
                Err(err) => {
                    log::warn!(
                        "[{}] unable to open shard container {}[{}]: {}",
                        self.name(),
                        outcome.index,
                        outcome.shard,
                        err,
                    );
                    continue;
                }
            };

            // release remote-store locks before their marker blobs go
            let mut names = Vec::with_capacity(outcome.stale_blobs.len());
            for (blob_name, snapshot_uuid) in &outcome.shallow_stale {
                let shard_id = snaprepo_api_types::RepositoryShardId::new(
                    outcome.index.clone(),
                    outcome.shard,
                );
                match self.lock_manager().release(&shard_id, snapshot_uuid) {
                    Ok(()) => names.push(blob_name.clone()),
                    Err(err) => {
                        // keep the marker so a retried delete can
                        // release the lock later
                        log::warn!(
                            "[{}] unable to release remote store lock of {} on {}: {}",
                            self.name(),
                            snapshot_uuid,
                            shard_id,
                            err,
                        );
                    }
                }
            }
            names.extend(outcome.stale_blobs.iter().cloned());

            for chunk in names.chunks(batch_size) {
                batches.push(Batch {
                    container: Arc::clone(&container),
                    names: chunk.to_vec(),
                });
            }
        }

        if batches.is_empty() {
            return stats;
        }

        let shared_stats = Arc::new(Mutex::new(DeleteStats::default()));
        let workers = self.snapshot_pool_size().min(batches.len());
        let pool = WorkerPool::new("snap-blob-delete", workers);
        for batch in batches {
            let shared_stats = Arc::clone(&shared_stats);
            let spawned = pool.spawn(move || {
                match batch
                    .container
                    .delete_blobs_ignoring_if_not_exists(&batch.names)
                {
                    Ok(()) => {
                        shared_stats.lock().unwrap().blobs_deleted += batch.names.len() as u64;
                    }
                    Err(err) => {
                        log::warn!("unable to delete stale shard blobs: {}", err);
                    }
                }
                Ok(())
            });
            if let Err(err) = spawned {
                log::warn!("unable to queue stale blob batch: {}", err);
            }
        }
        if let Err(err) = pool.complete() {
            log::warn!("stale blob deletion pool failed: {}", err);
        }

        stats.merge(*shared_stats.lock().unwrap());
        stats
    }
}
