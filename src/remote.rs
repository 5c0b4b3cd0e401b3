//! Remote-store lock management for shallow snapshots.
//!
//! Shallow snapshots keep their shard payload in a separate remote
//! store tier and pin it through a lock keyed by the acquiring
//! snapshot's uuid. The engine only touches the lock manager while
//! deleting or cloning shallow snapshots.

use std::collections::BTreeSet;
use std::sync::Mutex;

use anyhow::{bail, Error};

use snaprepo_api_types::RepositoryShardId;

pub trait RemoteStoreLockManager: Send + Sync {
    /// Pin the remote shard data on behalf of `acquirer`.
    fn acquire(&self, shard: &RepositoryShardId, acquirer: &str) -> Result<(), Error>;

    /// Release the pin held by `acquirer`.
    fn release(&self, shard: &RepositoryShardId, acquirer: &str) -> Result<(), Error>;

    /// Duplicate the pin of `from` for `to`, for snapshot clone.
    fn clone_lock(&self, shard: &RepositoryShardId, from: &str, to: &str) -> Result<(), Error>;
}

/// Lock manager for repositories without shallow snapshots.
pub struct NoopLockManager;

impl RemoteStoreLockManager for NoopLockManager {
    fn acquire(&self, _shard: &RepositoryShardId, _acquirer: &str) -> Result<(), Error> {
        Ok(())
    }

    fn release(&self, _shard: &RepositoryShardId, _acquirer: &str) -> Result<(), Error> {
        Ok(())
    }

    fn clone_lock(&self, _shard: &RepositoryShardId, _from: &str, _to: &str) -> Result<(), Error> {
        Ok(())
    }
}

type LockKey = (String, u32, String);

/// In-memory lock manager used by the tests.
#[derive(Default)]
pub struct InMemoryLockManager {
    locks: Mutex<BTreeSet<LockKey>>,
}

impl InMemoryLockManager {
    fn key(shard: &RepositoryShardId, acquirer: &str) -> LockKey {
        (shard.index.uuid.clone(), shard.shard, acquirer.to_string())
    }

    pub fn is_locked(&self, shard: &RepositoryShardId, acquirer: &str) -> bool {
        self.locks.lock().unwrap().contains(&Self::key(shard, acquirer))
    }

    pub fn lock_count(&self) -> usize {
        self.locks.lock().unwrap().len()
    }
}

impl RemoteStoreLockManager for InMemoryLockManager {
    fn acquire(&self, shard: &RepositoryShardId, acquirer: &str) -> Result<(), Error> {
        self.locks.lock().unwrap().insert(Self::key(shard, acquirer));
        Ok(())
    }

    fn release(&self, shard: &RepositoryShardId, acquirer: &str) -> Result<(), Error> {
        self.locks.lock().unwrap().remove(&Self::key(shard, acquirer));
        Ok(())
    }

    fn clone_lock(&self, shard: &RepositoryShardId, from: &str, to: &str) -> Result<(), Error> {
        let mut locks = self.locks.lock().unwrap();
        if !locks.contains(&Self::key(shard, from)) {
            bail!(
                "no remote store lock held by {} for {}",
                from,
                shard,
            );
        }
        locks.insert(Self::key(shard, to));
        Ok(())
    }
}
