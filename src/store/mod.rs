//! Access to the local shard storage layer.
//!
//! The engine reads shard files through [`ShardStore`] during snapshot
//! and writes restored files back through it. The real implementation
//! sits on top of the index engine's commit machinery; the directory
//! backed implementation here serves tests and tooling.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{bail, format_err, Context, Error};

use snaprepo_api_types::RepoError;
use snaprepo_blobstore::checksum::ChecksumReader;
use snaprepo_blobstore::shard::FileMetadata;
use snaprepo_tools::fs::replace_file;

/// A handle on one local shard, pinned to a commit.
///
/// Readers must hold a reference (see [`StoreGuard`]) for the duration
/// of any file access; a store that was closed refuses new references
/// and the snapshot fails as aborted.
pub trait ShardStore: Send + Sync {
    /// Human readable identity for error messages.
    fn description(&self) -> String;

    /// Identifier of the pinned commit, when the engine can tell that
    /// two commits are identical without diffing files.
    fn state_id(&self) -> Option<String>;

    /// Metadata of every file in the pinned commit.
    fn list_files(&self) -> Result<Vec<FileMetadata>, Error>;

    /// Open a file of the pinned commit for streaming.
    fn open_file(&self, name: &str) -> Result<Box<dyn Read + Send>, Error>;

    /// Write a restored file, verifying length and digest against
    /// `metadata`. An integrity failure marks the store corrupted.
    fn write_file(&self, metadata: &FileMetadata, data: &mut dyn Read) -> Result<(), Error>;

    /// Take a reference; fails when the store is closed or corrupted.
    fn try_acquire(&self) -> Result<(), Error>;

    /// Release a reference taken by [`ShardStore::try_acquire`].
    fn release(&self);

    /// Record an integrity failure. Subsequent operations fail.
    fn mark_corrupted(&self, reason: String);
}

/// Scoped store reference: released on every exit path.
pub struct StoreGuard<'a> {
    store: &'a dyn ShardStore,
}

impl<'a> StoreGuard<'a> {
    pub fn acquire(store: &'a dyn ShardStore) -> Result<Self, Error> {
        store.try_acquire()?;
        Ok(Self { store })
    }
}

impl Drop for StoreGuard<'_> {
    fn drop(&mut self) {
        self.store.release();
    }
}

#[derive(Default)]
struct RefState {
    count: u64,
    closed: bool,
}

/// [`ShardStore`] over a plain directory of files.
///
/// File metadata is computed on listing: CRC32 and SHA-256 over the
/// contents, with files up to `inline_threshold` bytes carried inline
/// so they become virtual references instead of data blobs.
pub struct DirectoryShardStore {
    dir: PathBuf,
    inline_threshold: u64,
    state_id: Mutex<Option<String>>,
    refs: Mutex<RefState>,
    corrupted: Mutex<Option<String>>,
}

impl DirectoryShardStore {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Result<Self, Error> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("unable to create shard directory {:?}", dir))?;
        Ok(Self {
            dir,
            inline_threshold: 0,
            state_id: Mutex::new(None),
            refs: Mutex::new(RefState::default()),
            corrupted: Mutex::new(None),
        })
    }

    /// Carry files of up to `threshold` bytes inline in the manifest.
    pub fn with_inline_threshold(mut self, threshold: u64) -> Self {
        self.inline_threshold = threshold;
        self
    }

    pub fn set_state_id(&self, state_id: Option<String>) {
        *self.state_id.lock().unwrap() = state_id;
    }

    pub fn corruption(&self) -> Option<String> {
        self.corrupted.lock().unwrap().clone()
    }

    /// Refuse new references, as after the shard was closed locally.
    pub fn close(&self) {
        self.refs.lock().unwrap().closed = true;
    }

    fn ensure_usable(&self) -> Result<(), Error> {
        if let Some(reason) = self.corruption() {
            bail!("shard store {:?} is corrupted: {}", self.dir, reason);
        }
        Ok(())
    }

    fn file_metadata(&self, name: &str, contents: &[u8]) -> FileMetadata {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(contents);
        let hash = (contents.len() as u64 <= self.inline_threshold)
            .then(|| hex::encode(contents));
        FileMetadata {
            name: name.to_string(),
            length: contents.len() as u64,
            checksum: hex::encode(hasher.finalize().to_be_bytes()),
            writer_uuid: None,
            hash,
            sha256: hex::encode(openssl::sha::sha256(contents)),
        }
    }
}

impl ShardStore for DirectoryShardStore {
    fn description(&self) -> String {
        format!("{:?}", self.dir)
    }

    fn state_id(&self) -> Option<String> {
        self.state_id.lock().unwrap().clone()
    }

    fn list_files(&self) -> Result<Vec<FileMetadata>, Error> {
        self.ensure_usable()?;
        let mut files = BTreeMap::new();
        for entry in std::fs::read_dir(&self.dir)
            .with_context(|| format!("unable to list shard directory {:?}", self.dir))?
        {
            let entry = entry?;
            if !entry.metadata()?.is_file() {
                continue;
            }
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };
            let contents = std::fs::read(entry.path())?;
            files.insert(name.clone(), self.file_metadata(&name, &contents));
        }
        Ok(files.into_values().collect())
    }

    fn open_file(&self, name: &str) -> Result<Box<dyn Read + Send>, Error> {
        self.ensure_usable()?;
        let path = self.dir.join(name);
        let file = std::fs::File::open(&path)
            .with_context(|| format!("unable to open shard file {:?}", path))?;
        Ok(Box::new(file))
    }

    fn write_file(&self, metadata: &FileMetadata, data: &mut dyn Read) -> Result<(), Error> {
        self.ensure_usable()?;
        let mut reader = ChecksumReader::new(data);
        let mut contents = Vec::with_capacity(metadata.length as usize);
        reader.read_to_end(&mut contents)?;
        if let Err(err) =
            reader.finish_verified(&metadata.name, metadata.length, &metadata.sha256)
        {
            self.mark_corrupted(err.to_string());
            return Err(err);
        }
        replace_file(self.dir.join(&metadata.name), &contents, false)
    }

    fn try_acquire(&self) -> Result<(), Error> {
        self.ensure_usable()?;
        let mut refs = self.refs.lock().unwrap();
        if refs.closed {
            return Err(Error::new(RepoError::Aborted)
                .context(format_err!("shard store {:?} is closed", self.dir)));
        }
        refs.count += 1;
        Ok(())
    }

    fn release(&self) {
        let mut refs = self.refs.lock().unwrap();
        debug_assert!(refs.count > 0, "store reference released twice");
        refs.count = refs.count.saturating_sub(1);
    }

    fn mark_corrupted(&self, reason: String) {
        let mut corrupted = self.corrupted.lock().unwrap();
        if corrupted.is_none() {
            log::error!("shard store {:?} marked corrupted: {}", self.dir, reason);
            *corrupted = Some(reason);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn listing_reports_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryShardStore::new(dir.path().join("shard"))
            .unwrap()
            .with_inline_threshold(4);
        std::fs::write(dir.path().join("shard/_0.cfs"), b"0123456789").unwrap();
        std::fs::write(dir.path().join("shard/segments_1"), b"abc").unwrap();

        let files = store.list_files().unwrap();
        assert_eq!(files.len(), 2);
        let segments = files.iter().find(|f| f.name == "segments_1").unwrap();
        assert!(segments.hash_equals_contents());
        let data = files.iter().find(|f| f.name == "_0.cfs").unwrap();
        assert!(data.hash.is_none());
        assert_eq!(data.length, 10);
    }

    #[test]
    fn closed_store_refuses_references() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryShardStore::new(dir.path().join("shard")).unwrap();
        {
            let _guard = StoreGuard::acquire(&store).unwrap();
            let _second = StoreGuard::acquire(&store).unwrap();
        }
        store.close();
        assert!(StoreGuard::acquire(&store).is_err());
    }

    #[test]
    fn verified_write_rejects_wrong_contents() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryShardStore::new(dir.path().join("shard")).unwrap();
        std::fs::write(dir.path().join("shard/file"), b"expected").unwrap();
        let metadata = store.list_files().unwrap().remove(0);

        let err = store
            .write_file(&metadata, &mut &b"tampered"[..])
            .unwrap_err();
        assert!(err.to_string().contains("digest mismatch"));
        assert!(store.corruption().is_some());
        assert!(store.list_files().is_err());
    }
}
