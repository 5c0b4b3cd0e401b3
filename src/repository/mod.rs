//! The blob-store snapshot repository engine.
//!
//! A repository persists point-in-time snapshots of sharded index data
//! into an opaque blob store. The authoritative repository contents at
//! any time are described by exactly one `index-<N>` manifest blob;
//! which `N` is current is agreed between the blob store and the
//! cluster state through the three-phase generation protocol
//! implemented in [`BlobStoreRepository::write_index_gen`].

use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{format_err, Context, Error};
use byteorder::{BigEndian, ByteOrder};
use once_cell::sync::OnceCell;

use snaprepo_api_types::{
    CompressionType, RepoError, RepositoryMetadata, SnapshotId, CORRUPTED_REPO_GEN,
    EMPTY_REPO_GEN, UNKNOWN_REPO_GEN,
};
use snaprepo_blobstore::container::{BlobContainer, BlobContainerExt};
use snaprepo_blobstore::repository_data::{
    index_blob_name, parse_index_blob_gen, RepositoryData, INDEX_BLOB_PREFIX, INDEX_LATEST_BLOB,
};
use snaprepo_blobstore::root_blobs::{SnapshotInfo, SNAPSHOT_INFO_FORMAT};
use snaprepo_blobstore::shard::{snapshot_blob_name, INDICES_CONTAINER};
use snaprepo_tools::worker_pool::assert_pool_thread;
use snaprepo_tools::RateLimiter;

use crate::cluster::{update_cluster_state_sync, ClusterService};
use crate::remote::RemoteStoreLockManager;

mod delete;
mod finalize;
mod gc;
mod shard;
mod verify;

pub use delete::DeleteResult;
pub use finalize::SnapshotFinalization;

/// How many obsolete root manifests one publish cleans up at most.
const MAX_OLD_INDEX_BLOBS_TO_DELETE: usize = 1000;

/// Builds the root [`BlobContainer`] on first use. Construction may
/// perform I/O, so it is deferred until an operation needs it.
pub type ContainerFactory = Box<dyn Fn() -> Result<Arc<dyn BlobContainer>, Error> + Send + Sync>;

pub struct BlobStoreRepository {
    name: String,
    cluster: Arc<dyn ClusterService>,
    lock_manager: Arc<dyn RemoteStoreLockManager>,
    container_factory: ContainerFactory,
    root: OnceCell<Arc<dyn BlobContainer>>,
    /// Highest generation this node saw published. Never decreases.
    latest_known_gen: AtomicI64,
    /// `(generation, deflated manifest bytes)` of the last read.
    cached_repo_data: Mutex<Option<(i64, Vec<u8>)>>,
    // set once, never cleared
    best_effort: AtomicBool,
    snapshot_pool_size: usize,
    state_update_timeout: Option<Duration>,
    snapshot_rate: Option<Arc<Mutex<RateLimiter>>>,
    restore_rate: Option<Arc<Mutex<RateLimiter>>>,
}

fn limiter(rate: u64) -> Option<Arc<Mutex<RateLimiter>>> {
    (rate > 0).then(|| Arc::new(Mutex::new(RateLimiter::new(rate))))
}

impl BlobStoreRepository {
    /// Open the repository registered as `name` in the cluster state.
    pub fn new(
        name: &str,
        cluster: Arc<dyn ClusterService>,
        lock_manager: Arc<dyn RemoteStoreLockManager>,
        container_factory: ContainerFactory,
        snapshot_pool_size: usize,
    ) -> Result<Self, Error> {
        let metadata = cluster
            .state()
            .repositories
            .repository(name)
            .ok_or_else(|| format_err!("repository '{}' is not registered", name))?
            .clone();
        metadata.settings.validate()?;

        let settings = &metadata.settings;
        // a node starting with a dangling pending generation cannot
        // trust the cluster-state pointer
        let best_effort = settings.readonly
            || settings.allow_concurrent_modifications
            || metadata.generation == UNKNOWN_REPO_GEN
            || metadata.has_pending_write();

        Ok(Self {
            name: name.to_string(),
            cluster,
            lock_manager,
            container_factory,
            root: OnceCell::new(),
            latest_known_gen: AtomicI64::new(metadata.generation.max(EMPTY_REPO_GEN)),
            cached_repo_data: Mutex::new(None),
            best_effort: AtomicBool::new(best_effort),
            snapshot_pool_size: snapshot_pool_size.max(1),
            state_update_timeout: None,
            snapshot_rate: limiter(settings.max_snapshot_bytes_per_sec),
            restore_rate: limiter(settings.max_restore_bytes_per_sec),
        })
    }

    /// Deadline applied to the cluster-state updates of the
    /// generation protocol.
    pub fn with_state_update_timeout(mut self, timeout: Duration) -> Self {
        self.state_update_timeout = Some(timeout);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metadata(&self) -> Result<RepositoryMetadata, Error> {
        self.cluster
            .state()
            .repositories
            .repository(&self.name)
            .cloned()
            .ok_or_else(|| format_err!("repository '{}' was removed from the cluster", self.name))
    }

    pub fn settings(&self) -> Result<snaprepo_api_types::RepositorySettings, Error> {
        Ok(self.metadata()?.settings)
    }

    pub(crate) fn compression(&self) -> Result<Option<CompressionType>, Error> {
        let settings = self.settings()?;
        Ok(settings.compress.then_some(settings.compression_type))
    }

    pub(crate) fn snapshot_pool_size(&self) -> usize {
        self.snapshot_pool_size
    }

    pub(crate) fn snapshot_rate(&self) -> Option<Arc<Mutex<RateLimiter>>> {
        self.snapshot_rate.clone()
    }

    pub(crate) fn restore_rate(&self) -> Option<Arc<Mutex<RateLimiter>>> {
        self.restore_rate.clone()
    }

    pub(crate) fn lock_manager(&self) -> &dyn RemoteStoreLockManager {
        &*self.lock_manager
    }

    pub(crate) fn cluster(&self) -> &dyn ClusterService {
        &*self.cluster
    }

    /// The lazily initialized root container.
    pub(crate) fn root(&self) -> Result<&Arc<dyn BlobContainer>, Error> {
        self.root.get_or_try_init(|| (self.container_factory)())
    }

    pub(crate) fn index_container(&self, index_uuid: &str) -> Result<Arc<dyn BlobContainer>, Error> {
        self.root()?.child(INDICES_CONTAINER)?.child(index_uuid)
    }

    pub(crate) fn shard_container(
        &self,
        index_uuid: &str,
        shard: u32,
    ) -> Result<Arc<dyn BlobContainer>, Error> {
        self.index_container(index_uuid)?.child(&shard.to_string())
    }

    pub(crate) fn ensure_writable(&self) -> Result<(), Error> {
        if self.settings()?.readonly {
            return Err(Error::new(RepoError::Readonly(self.name.clone())));
        }
        Ok(())
    }

    /// Whether blob listings are trusted over the cluster-state
    /// generation pointer. Once entered, the mode is never left.
    pub fn best_effort_consistency(&self) -> bool {
        self.best_effort.load(Ordering::Relaxed)
    }

    fn refresh_best_effort(&self, metadata: &RepositoryMetadata) -> bool {
        let best_effort = metadata.settings.readonly
            || metadata.settings.allow_concurrent_modifications
            || metadata.generation == UNKNOWN_REPO_GEN;
        if best_effort {
            self.best_effort.store(true, Ordering::Relaxed);
        }
        self.best_effort_consistency()
    }

    /// The current generation according to a blob listing: the highest
    /// `index-<N>` present, or [`EMPTY_REPO_GEN`] for a fresh store.
    pub(crate) fn latest_index_gen_from_listing(&self) -> Result<i64, Error> {
        let listing = self.root()?.list_blobs_by_prefix(INDEX_BLOB_PREFIX)?;
        let latest = listing
            .keys()
            .filter_map(|name| parse_index_blob_gen(name))
            .max();
        match latest {
            Some(gen) => Ok(gen),
            // a mirror that only carries `index.latest` cannot be
            // listed; fall back to the pointer blob
            None => Ok(self.read_index_latest()?.unwrap_or(EMPTY_REPO_GEN)),
        }
    }

    /// Read the `index.latest` pointer blob, if present.
    pub fn read_index_latest(&self) -> Result<Option<i64>, Error> {
        let mut reader = match self.root()?.read_blob(INDEX_LATEST_BLOB) {
            Ok(reader) => reader,
            Err(err) if snaprepo_api_types::is_not_found(&err) => return Ok(None),
            Err(err) => return Err(err),
        };
        let mut raw = [0u8; 8];
        reader.read_exact(&mut raw)?;
        Ok(Some(BigEndian::read_i64(&raw)))
    }

    fn compress_cache_entry(data: &[u8]) -> Result<Vec<u8>, Error> {
        use std::io::Write;
        let mut encoder =
            flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::fast());
        encoder.write_all(data)?;
        Ok(encoder.finish()?)
    }

    fn decompress_cache_entry(data: &[u8]) -> Result<Vec<u8>, Error> {
        let mut decoder = flate2::read::DeflateDecoder::new(data);
        let mut raw = Vec::new();
        decoder.read_to_end(&mut raw)?;
        Ok(raw)
    }

    fn cache_repo_data(&self, gen: i64, serialized: &[u8]) {
        match Self::compress_cache_entry(serialized) {
            Ok(compressed) => {
                *self.cached_repo_data.lock().unwrap() = Some((gen, compressed));
            }
            Err(err) => {
                log::warn!(
                    "[{}] unable to cache repository data for generation {}: {}",
                    self.name,
                    gen,
                    err,
                );
            }
        }
    }

    fn cached_repo_data(&self, gen: i64) -> Option<RepositoryData> {
        let cache = self.cached_repo_data.lock().unwrap();
        let (cached_gen, compressed) = cache.as_ref()?;
        if *cached_gen != gen {
            return None;
        }
        let raw = Self::decompress_cache_entry(compressed).ok()?;
        let data = RepositoryData::deserialize(gen, &raw).ok()?;
        log::debug!("[{}] repository data cache hit for generation {}", self.name, gen);
        Some(data)
    }

    /// Load the current [`RepositoryData`].
    ///
    /// In strict mode the generation comes from the cluster state; in
    /// best-effort mode it is re-derived from a listing and the cache
    /// is not consulted.
    pub fn get_repository_data(&self) -> Result<RepositoryData, Error> {
        assert_pool_thread(&["snap", "generic"]);
        let metadata = self.metadata()?;
        if metadata.is_corrupted() {
            return Err(Error::new(RepoError::RepositoryCorrupted(self.name.clone())));
        }
        let best_effort = self.refresh_best_effort(&metadata);

        let gen = if best_effort {
            self.latest_index_gen_from_listing()?
        } else {
            self.latest_known_gen
                .load(Ordering::SeqCst)
                .max(metadata.generation)
        };
        if gen == EMPTY_REPO_GEN || gen == UNKNOWN_REPO_GEN {
            return Ok(RepositoryData::empty());
        }

        let cache_enabled = !best_effort && metadata.settings.cache_repository_data;
        if cache_enabled {
            if let Some(data) = self.cached_repo_data(gen) {
                return Ok(data);
            }
        }

        let blob_name = index_blob_name(gen);
        let raw = match self.root()?.read_blob_bytes(&blob_name) {
            Ok(raw) => raw,
            Err(err) => {
                // the cluster state points at a manifest the store no
                // longer serves: that is corruption, not a retry case
                if !best_effort && gen == metadata.generation {
                    self.mark_corrupted(&format!(
                        "manifest '{}' referenced by the cluster state could not be read: {}",
                        blob_name, err,
                    ));
                    return Err(Error::new(RepoError::RepositoryCorrupted(self.name.clone())));
                }
                return Err(err);
            }
        };

        let data = match RepositoryData::deserialize(gen, &raw) {
            Ok(data) => data,
            Err(err) => {
                if !best_effort && gen == metadata.generation {
                    self.mark_corrupted(&format!("manifest '{}' unreadable: {}", blob_name, err));
                    return Err(Error::new(RepoError::RepositoryCorrupted(self.name.clone())));
                }
                return Err(err);
            }
        };

        if cache_enabled {
            self.cache_repo_data(gen, &raw);
        }
        Ok(data)
    }

    /// Flip the cluster-state entry to [`CORRUPTED_REPO_GEN`], leaving
    /// the pending generation untouched.
    pub(crate) fn mark_corrupted(&self, reason: &str) {
        log::error!("[{}] marking repository corrupted: {}", self.name, reason);
        let repo_name = self.name.clone();
        let result = update_cluster_state_sync(
            &*self.cluster,
            &format!("mark repository [{}] corrupted", self.name),
            self.state_update_timeout,
            move |state| {
                let meta = state
                    .repositories
                    .repository(&repo_name)
                    .ok_or_else(|| format_err!("repository '{}' is not registered", repo_name))?;
                let updated = meta.with_generations(CORRUPTED_REPO_GEN, meta.pending_generation);
                let mut state = state.clone();
                state.repositories = state.repositories.with_repository(updated);
                Ok(state)
            },
        );
        if let Err(err) = result {
            log::warn!("[{}] unable to record corruption marker: {}", self.name, err);
        }
    }

    /// Publish `repository_data` as the next repository generation
    /// through the three-phase protocol (claim, write, publish).
    /// Returns the published generation.
    pub(crate) fn write_index_gen(
        &self,
        repository_data: &RepositoryData,
        expected_gen: i64,
    ) -> Result<i64, Error> {
        assert_pool_thread(&["snap", "generic"]);
        self.ensure_writable()?;
        let best_effort = self.best_effort_consistency();

        // Phase 1 - claim the next generation.
        let repo_name = self.name.clone();
        let (_, claimed_state) = update_cluster_state_sync(
            &*self.cluster,
            &format!("set pending repository generation [{}]", self.name),
            self.state_update_timeout,
            move |state| {
                let meta = state
                    .repositories
                    .repository(&repo_name)
                    .ok_or_else(|| format_err!("repository '{}' is not registered", repo_name))?;
                if meta.is_corrupted() {
                    return Err(Error::new(RepoError::RepositoryCorrupted(repo_name.clone())));
                }
                let observed = meta.generation;
                if observed != expected_gen && observed != UNKNOWN_REPO_GEN && !best_effort {
                    return Err(Error::new(RepoError::ConcurrentModification {
                        repository: repo_name.clone(),
                        expected: expected_gen,
                        actual: observed,
                    }));
                }
                // in best-effort mode the caller's listing-derived
                // generation outranks a lagging cluster-state pointer
                let safe = if observed == UNKNOWN_REPO_GEN || best_effort {
                    expected_gen
                } else {
                    observed
                };
                // generations are numbered from 1; the sentinels are
                // all negative
                let pending = meta.pending_generation.max(safe).max(0) + 1;
                let updated = meta.with_generations(safe, pending);
                let mut state = state.clone();
                state.repositories = state.repositories.with_repository(updated);
                Ok(state)
            },
        )?;
        let claimed = claimed_state
            .repositories
            .repository(&self.name)
            .expect("repository registered in phase 1")
            .clone();
        let new_gen = claimed.pending_generation;
        let safe_gen = claimed.generation;

        // Phase 2 - write the new manifest.
        let root = Arc::clone(self.root()?);
        if !best_effort && safe_gen >= 0 {
            let previous = index_blob_name(safe_gen);
            if !root.blob_exists(&previous)? {
                self.mark_corrupted(&format!(
                    "previous manifest '{}' vanished before generation {} was written",
                    previous, new_gen,
                ));
                return Err(Error::new(RepoError::RepositoryCorrupted(self.name.clone())));
            }
        }

        let serialized = repository_data.serialize()?;
        root.write_blob_bytes_atomic(&index_blob_name(new_gen), &serialized, true)
            .with_context(|| {
                format!(
                    "[{}] unable to write repository manifest for generation {}",
                    self.name, new_gen,
                )
            })?;

        if self.settings()?.support_url_repo {
            let mut raw = [0u8; 8];
            BigEndian::write_i64(&mut raw, new_gen);
            // the pointer is advisory; URL mirrors re-read it and a
            // stale value only delays them one generation
            if let Err(err) = root.write_blob_bytes(INDEX_LATEST_BLOB, &raw, false) {
                log::warn!("[{}] unable to update index.latest: {}", self.name, err);
            }
        }

        // Phase 3 - publish.
        let repo_name = self.name.clone();
        update_cluster_state_sync(
            &*self.cluster,
            &format!("publish repository generation [{}] [{}]", self.name, new_gen),
            self.state_update_timeout,
            move |state| {
                let meta = state
                    .repositories
                    .repository(&repo_name)
                    .ok_or_else(|| format_err!("repository '{}' is not registered", repo_name))?;
                if meta.is_corrupted() {
                    return Err(Error::new(RepoError::RepositoryCorrupted(repo_name.clone())));
                }
                if !best_effort
                    && (meta.generation != safe_gen || meta.pending_generation != new_gen)
                {
                    return Err(Error::new(RepoError::ConcurrentModification {
                        repository: repo_name.clone(),
                        expected: new_gen,
                        actual: meta.generation,
                    }));
                }
                let updated =
                    meta.with_generations(new_gen, meta.pending_generation.max(new_gen));
                let mut state = state.clone();
                state.repositories = state.repositories.with_repository(updated);
                Ok(state)
            },
        )?;

        self.latest_known_gen.fetch_max(new_gen, Ordering::SeqCst);
        if !best_effort && self.settings()?.cache_repository_data {
            self.cache_repo_data(new_gen, &serialized);
        }
        log::info!("[{}] published repository generation {}", self.name, new_gen);

        self.clean_old_index_blobs(new_gen);
        Ok(new_gen)
    }

    /// Best-effort removal of root manifests preceding `current_gen`.
    /// Failure only leaves blobs for the next cleanup to find.
    fn clean_old_index_blobs(&self, current_gen: i64) {
        let result: Result<(), Error> = (|| {
            let root = self.root()?;
            let stale: Vec<String> = root
                .list_blobs_by_prefix(INDEX_BLOB_PREFIX)?
                .into_keys()
                .filter(|name| matches!(parse_index_blob_gen(name), Some(gen) if gen < current_gen))
                .take(MAX_OLD_INDEX_BLOBS_TO_DELETE)
                .collect();
            if !stale.is_empty() {
                log::debug!(
                    "[{}] deleting {} obsolete root manifest blobs",
                    self.name,
                    stale.len(),
                );
                root.delete_blobs_ignoring_if_not_exists(&stale)?;
            }
            Ok(())
        })();
        if let Err(err) = result {
            log::warn!(
                "[{}] unable to clean up obsolete root manifests: {}",
                self.name,
                err,
            );
        }
    }

    /// Read one snapshot's root-level description.
    pub fn get_snapshot_info(&self, snapshot: &SnapshotId) -> Result<SnapshotInfo, Error> {
        SNAPSHOT_INFO_FORMAT.read(&**self.root()?, &snapshot_blob_name(&snapshot.uuid))
    }

    /// All snapshots currently in the repository.
    pub fn list_snapshots(&self) -> Result<Vec<SnapshotId>, Error> {
        Ok(self.get_repository_data()?.snapshot_ids())
    }

    pub(crate) fn resolve_snapshot(
        &self,
        repository_data: &RepositoryData,
        name: &str,
    ) -> Result<SnapshotId, Error> {
        repository_data
            .snapshot_by_name(name)
            .map(|record| record.id())
            .ok_or_else(|| {
                Error::new(RepoError::NotFound {
                    container: self.name.clone(),
                    name: format!("snapshot '{}'", name),
                })
            })
    }

    pub(crate) fn expect_generation(
        &self,
        repository_data: &RepositoryData,
        expected_gen: i64,
    ) -> Result<(), Error> {
        if repository_data.gen_id != expected_gen {
            return Err(Error::new(RepoError::ConcurrentModification {
                repository: self.name.clone(),
                expected: expected_gen,
                actual: repository_data.gen_id,
            }));
        }
        Ok(())
    }
}
