//! Incremental shard snapshot upload and shard restore.

use std::collections::VecDeque;
use std::io::{BufReader, Read};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Error};

use snaprepo_api_types::{new_uuid, RepoError, RepositoryShardId, ShardGeneration, SnapshotId};
use snaprepo_blobstore::container::BlobContainer;
use snaprepo_blobstore::checksum::ChecksumReader;
use snaprepo_blobstore::shard::{
    data_blob_name, shard_index_blob_name, snapshot_blob_name, virtual_data_blob_name,
    BlobStoreIndexShardSnapshot, BlobStoreIndexShardSnapshots, FileInfo, SnapshotFiles,
    SHARD_INDEX_BLOB_PREFIX, SHARD_INDEX_FORMAT, SHARD_SNAPSHOT_FORMAT,
};
use snaprepo_tools::fs::epoch_millis_i64;
use snaprepo_tools::worker_pool::assert_pool_thread;
use snaprepo_tools::{RateLimitedReader, RateLimiter, WorkerPool};

use crate::status::ShardSnapshotStatus;
use crate::store::{ShardStore, StoreGuard};

use super::BlobStoreRepository;

impl BlobStoreRepository {
    /// Snapshot one shard: diff the pinned commit against the shard's
    /// existing manifest, upload only new content, and write the new
    /// shard-level manifest. Returns the new shard generation, to be
    /// fed into [`super::SnapshotFinalization`].
    pub fn snapshot_shard(
        &self,
        store: &Arc<dyn ShardStore>,
        snapshot: &SnapshotId,
        shard: &RepositoryShardId,
        previous_generation: Option<ShardGeneration>,
        status: &Arc<ShardSnapshotStatus>,
    ) -> Result<ShardGeneration, Error> {
        assert_pool_thread(&["snap"]);
        self.ensure_writable()?;
        let _guard = StoreGuard::acquire(&**store)?;
        let container = self.shard_container(&shard.index.uuid, shard.shard)?;

        let (existing, previous) =
            self.load_shard_index(&*container, previous_generation.as_ref())?;
        let start_time = epoch_millis_i64();

        // fast path: this exact commit was snapshotted before, reuse
        // its file list verbatim
        if let Some(state_id) = store.state_id() {
            if let Some(entry) = existing.entry_for_state_id(&state_id) {
                log::debug!(
                    "[{}] shard {} commit {} already snapshotted, reusing file list",
                    self.name(),
                    shard,
                    state_id,
                );
                let files = entry.files.clone();
                let total_size: u64 = files.iter().map(|file| file.metadata.length).sum();
                status.set_totals(files.len() as u64, total_size);
                let entry = SnapshotFiles {
                    snapshot: snapshot.name.clone(),
                    shard_state_id: Some(state_id),
                    files,
                };
                return self.finish_shard_snapshot(
                    &*container,
                    &existing,
                    entry,
                    previous,
                    snapshot,
                    start_time,
                    status,
                );
            }
        }

        // diff the commit against all files known to the shard
        let store_files = store.list_files()?;
        let total_size: u64 = store_files.iter().map(|file| file.length).sum();
        status.set_totals(store_files.len() as u64, total_size);

        let chunk_size = self.settings()?.chunk_size;
        let mut files = Vec::with_capacity(store_files.len());
        let mut to_upload = Vec::new();
        for metadata in store_files {
            status.ensure_not_aborted()?;
            if let Some(known) = existing
                .find_physical(&metadata.name)
                .find(|file| file.metadata.is_same(&metadata))
            {
                log::debug!(
                    "[{}] shard {} file '{}' unchanged, referencing {}",
                    self.name(),
                    shard,
                    metadata.name,
                    known.blob_name,
                );
                files.push(known.clone());
                continue;
            }
            status.add_incremental(metadata.length);
            let blob_name = if metadata.hash_equals_contents() {
                virtual_data_blob_name(&new_uuid())
            } else {
                data_blob_name(&new_uuid())
            };
            let info = FileInfo {
                blob_name,
                metadata,
                part_size: chunk_size,
            };
            if !info.is_virtual() {
                to_upload.push(info.clone());
            }
            files.push(info);
        }

        if !to_upload.is_empty() {
            let workers = self.snapshot_pool_size().min(to_upload.len());
            let pool = WorkerPool::new("snap-shard-upload", workers);
            let buffer_size = self.settings()?.io_buffer_size as usize;
            for info in to_upload {
                let container = Arc::clone(&container);
                let store = Arc::clone(store);
                let status = Arc::clone(status);
                let limiter = self.snapshot_rate();
                pool.spawn(move || {
                    upload_file(&*container, &*store, &status, limiter, buffer_size, &info)
                })?;
            }
            if let Err(err) = pool.complete() {
                if status.is_aborted() {
                    return Err(Error::new(RepoError::Aborted));
                }
                return Err(err);
            }
        }
        status.ensure_not_aborted()?;

        let entry = SnapshotFiles {
            snapshot: snapshot.name.clone(),
            shard_state_id: store.state_id(),
            files,
        };
        self.finish_shard_snapshot(
            &*container,
            &existing,
            entry,
            previous,
            snapshot,
            start_time,
            status,
        )
    }

    /// Load the shard manifest the previous generation points at, or
    /// discover it by listing for legacy numeric generations.
    fn load_shard_index(
        &self,
        container: &dyn BlobContainer,
        previous_generation: Option<&ShardGeneration>,
    ) -> Result<(BlobStoreIndexShardSnapshots, Option<ShardGeneration>), Error> {
        match previous_generation {
            Some(generation) if generation.has_blob() => {
                let index = SHARD_INDEX_FORMAT
                    .read(container, &shard_index_blob_name(generation))
                    .with_context(|| {
                        format!("unable to load shard manifest for generation {}", generation)
                    })?;
                Ok((index, Some(generation.clone())))
            }
            Some(_) => Ok((BlobStoreIndexShardSnapshots::default(), None)),
            None => {
                // legacy numeric generations are discoverable by
                // listing; uuid generations are only reachable via the
                // repository manifest
                let listing = container.list_blobs_by_prefix(SHARD_INDEX_BLOB_PREFIX)?;
                let latest = listing
                    .keys()
                    .filter_map(|name| {
                        name.strip_prefix(SHARD_INDEX_BLOB_PREFIX)?.parse::<u64>().ok()
                    })
                    .max();
                match latest {
                    Some(gen) => {
                        let generation = ShardGeneration::Legacy(gen);
                        let index = SHARD_INDEX_FORMAT
                            .read(container, &shard_index_blob_name(&generation))?;
                        Ok((index, Some(generation)))
                    }
                    None => Ok((BlobStoreIndexShardSnapshots::default(), None)),
                }
            }
        }
    }

    /// Write the per-snapshot commit blob and the successor shard
    /// manifest. The commit blob goes first: a shard manifest never
    /// references a snapshot whose commit blob is missing.
    #[allow(clippy::too_many_arguments)]
    fn finish_shard_snapshot(
        &self,
        container: &dyn BlobContainer,
        existing: &BlobStoreIndexShardSnapshots,
        entry: SnapshotFiles,
        previous: Option<ShardGeneration>,
        snapshot: &SnapshotId,
        start_time: i64,
        status: &ShardSnapshotStatus,
    ) -> Result<ShardGeneration, Error> {
        let compression = self.compression()?;
        let shard_snapshot = BlobStoreIndexShardSnapshot {
            snapshot: snapshot.name.clone(),
            index_files: entry.files.clone(),
            start_time,
            time: epoch_millis_i64(),
            incremental_file_count: status.incremental_file_count(),
            incremental_size: status.incremental_size(),
            total_file_count: status.total_file_count(),
            total_size: status.total_size(),
        };
        SHARD_SNAPSHOT_FORMAT.write_atomic(
            container,
            &snapshot_blob_name(&snapshot.uuid),
            &shard_snapshot,
            compression,
            false,
        )?;

        let new_generation = match previous {
            Some(generation) => generation.successor(),
            None => ShardGeneration::new_generation(),
        };
        let updated = existing.with_entry(entry);
        SHARD_INDEX_FORMAT.write_atomic(
            container,
            &shard_index_blob_name(&new_generation),
            &updated,
            compression,
            true,
        )?;
        Ok(new_generation)
    }

    /// Restore every file of `snapshot`'s copy of the shard into the
    /// local store. Parallelism and rate limiting mirror the upload
    /// path; integrity failures mark the local store corrupted.
    pub fn restore_shard(
        &self,
        store: &Arc<dyn ShardStore>,
        snapshot: &SnapshotId,
        shard: &RepositoryShardId,
    ) -> Result<(), Error> {
        assert_pool_thread(&["snap"]);
        let _guard = StoreGuard::acquire(&**store)?;
        let container = self.shard_container(&shard.index.uuid, shard.shard)?;

        let shard_snapshot =
            SHARD_SNAPSHOT_FORMAT.read(&*container, &snapshot_blob_name(&snapshot.uuid))?;
        let files = shard_snapshot.index_files;
        if files.is_empty() {
            return Ok(());
        }

        let workers = self.snapshot_pool_size().min(files.len());
        let pool = WorkerPool::new("snap-shard-restore", workers);
        let buffer_size = self.settings()?.io_buffer_size as usize;
        for info in files {
            let container = Arc::clone(&container);
            let store = Arc::clone(store);
            let limiter = self.restore_rate();
            pool.spawn(move || restore_file(container, &*store, limiter, buffer_size, &info))?;
        }
        pool.complete()?;
        log::info!(
            "[{}] restored shard {} from snapshot {}",
            self.name(),
            shard,
            snapshot,
        );
        Ok(())
    }
}

fn upload_file(
    container: &dyn BlobContainer,
    store: &dyn ShardStore,
    status: &ShardSnapshotStatus,
    limiter: Option<Arc<Mutex<RateLimiter>>>,
    buffer_size: usize,
    info: &FileInfo,
) -> Result<(), Error> {
    status.ensure_not_aborted()?;
    let reader = store.open_file(&info.metadata.name)?;
    let buffered = BufReader::with_capacity(buffer_size, reader);
    let mut reader = ChecksumReader::new(RateLimitedReader::new(buffered, limiter));

    for part in 0..info.part_count() {
        status.ensure_not_aborted()?;
        let part_length = info.part_length(part);
        let mut part_reader = (&mut reader).take(part_length);
        container
            .write_blob(&info.part_name(part), &mut part_reader, part_length, false)
            .with_context(|| format!("unable to upload part {} of '{}'", part, info.blob_name))?;
    }

    match reader.finish_verified(&info.metadata.name, info.metadata.length, &info.metadata.sha256)
    {
        Ok(_) => {
            status.add_processed(info.metadata.length);
            Ok(())
        }
        Err(err) => {
            // the bytes we just read disagree with the commit's
            // metadata; the local shard copy cannot be trusted
            store.mark_corrupted(err.to_string());
            Err(err)
        }
    }
}

fn restore_file(
    container: Arc<dyn BlobContainer>,
    store: &dyn ShardStore,
    limiter: Option<Arc<Mutex<RateLimiter>>>,
    buffer_size: usize,
    info: &FileInfo,
) -> Result<(), Error> {
    if let Some(bytes) = info.metadata.inline_bytes() {
        return store.write_file(&info.metadata, &mut &bytes[..]);
    }

    let parts = MultiPartReader {
        container,
        names: info.blob_names().into(),
        current: None,
    };
    let mut reader = BufReader::with_capacity(
        buffer_size,
        RateLimitedReader::new(parts, limiter),
    );
    store
        .write_file(&info.metadata, &mut reader)
        .with_context(|| format!("unable to restore '{}'", info.metadata.name))
}

/// Sequential reader over the parts of one data blob, opening each
/// part on demand.
struct MultiPartReader {
    container: Arc<dyn BlobContainer>,
    names: VecDeque<String>,
    current: Option<Box<dyn Read + Send>>,
}

impl Read for MultiPartReader {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, std::io::Error> {
        loop {
            if self.current.is_none() {
                match self.names.pop_front() {
                    Some(name) => {
                        let reader = self.container.read_blob(&name).map_err(|err| {
                            std::io::Error::new(std::io::ErrorKind::Other, err.to_string())
                        })?;
                        self.current = Some(reader);
                    }
                    None => return Ok(0),
                }
            }
            let count = self.current.as_mut().unwrap().read(buf)?;
            if count > 0 {
                return Ok(count);
            }
            self.current = None;
        }
    }
}
