//! Progress and abort tracking for one shard snapshot.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use anyhow::Error;

use snaprepo_api_types::RepoError;

/// Shared between the engine and whoever drives the snapshot: the
/// engine bumps the counters, the driver may flip `aborted` at any
/// time. The flag is honored at every part boundary of every file
/// transfer.
#[derive(Default)]
pub struct ShardSnapshotStatus {
    aborted: AtomicBool,
    total_file_count: AtomicU64,
    total_size: AtomicU64,
    incremental_file_count: AtomicU64,
    incremental_size: AtomicU64,
    processed_size: AtomicU64,
}

impl ShardSnapshotStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Relaxed);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Relaxed)
    }

    pub fn ensure_not_aborted(&self) -> Result<(), Error> {
        if self.is_aborted() {
            return Err(Error::new(RepoError::Aborted));
        }
        Ok(())
    }

    pub fn set_totals(&self, files: u64, bytes: u64) {
        self.total_file_count.store(files, Ordering::Relaxed);
        self.total_size.store(bytes, Ordering::Relaxed);
    }

    pub fn add_incremental(&self, bytes: u64) {
        self.incremental_file_count.fetch_add(1, Ordering::Relaxed);
        self.incremental_size.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_processed(&self, bytes: u64) {
        self.processed_size.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn total_file_count(&self) -> u64 {
        self.total_file_count.load(Ordering::Relaxed)
    }

    pub fn total_size(&self) -> u64 {
        self.total_size.load(Ordering::Relaxed)
    }

    pub fn incremental_file_count(&self) -> u64 {
        self.incremental_file_count.load(Ordering::Relaxed)
    }

    pub fn incremental_size(&self) -> u64 {
        self.incremental_size.load(Ordering::Relaxed)
    }

    pub fn processed_size(&self) -> u64 {
        self.processed_size.load(Ordering::Relaxed)
    }
}
