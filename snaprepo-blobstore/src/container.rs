use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;

use anyhow::Error;

use snaprepo_api_types::RepoError;

/// Listing entry for one blob.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlobEntry {
    pub length: u64,
}

/// Result of a recursive container delete.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeleteStats {
    pub blobs_deleted: u64,
    pub bytes_deleted: u64,
}

impl DeleteStats {
    pub fn merge(&mut self, other: DeleteStats) {
        self.blobs_deleted += other.blobs_deleted;
        self.bytes_deleted += other.bytes_deleted;
    }
}

/// A flat namespace of blobs inside an object store.
///
/// Implementations may be backed by a local filesystem, an object
/// storage service, or a read-only URL mirror. The engine assumes
/// eventual consistency: a listing may lag behind a completed write,
/// and read-after-list is never relied upon across containers.
pub trait BlobContainer: Send + Sync {
    /// Slash separated path of this container below the repository
    /// root, for error reporting.
    fn path(&self) -> &str;

    /// List every blob in this container (not recursive).
    fn list_blobs(&self) -> Result<BTreeMap<String, BlobEntry>, Error>;

    /// List blobs whose name starts with `prefix`.
    fn list_blobs_by_prefix(&self, prefix: &str) -> Result<BTreeMap<String, BlobEntry>, Error> {
        let mut listing = self.list_blobs()?;
        listing.retain(|name, _| name.starts_with(prefix));
        Ok(listing)
    }

    /// Open a blob for reading. Fails with [`RepoError::NotFound`] if
    /// the blob does not exist.
    fn read_blob(&self, name: &str) -> Result<Box<dyn Read + Send>, Error>;

    /// Write a blob. Not required to be atomic; a failed write may
    /// leave a partial blob behind, which later garbage collection
    /// reclaims.
    fn write_blob(
        &self,
        name: &str,
        data: &mut dyn Read,
        length: u64,
        fail_if_exists: bool,
    ) -> Result<(), Error>;

    /// Write a blob that becomes visible only after the full write
    /// succeeded. On failure the blob is either absent or unchanged.
    fn write_blob_atomic(
        &self,
        name: &str,
        data: &mut dyn Read,
        length: u64,
        fail_if_exists: bool,
    ) -> Result<(), Error>;

    /// Delete the named blobs, silently skipping missing entries.
    fn delete_blobs_ignoring_if_not_exists(&self, names: &[String]) -> Result<(), Error>;

    /// The direct sub-containers of this container.
    fn children(&self) -> Result<BTreeMap<String, Arc<dyn BlobContainer>>, Error>;

    /// Navigate to (without creating) the named sub-container.
    fn child(&self, name: &str) -> Result<Arc<dyn BlobContainer>, Error>;

    /// Recursively delete this container and everything below it.
    fn delete(&self) -> Result<DeleteStats, Error>;
}

/// Byte-level conveniences shared by all container implementations.
pub trait BlobContainerExt: BlobContainer {
    fn blob_exists(&self, name: &str) -> Result<bool, Error> {
        Ok(self.list_blobs_by_prefix(name)?.contains_key(name))
    }

    fn read_blob_bytes(&self, name: &str) -> Result<Vec<u8>, Error> {
        let mut reader = self.read_blob(name)?;
        let mut data = Vec::new();
        reader.read_to_end(&mut data).map_err(|err| {
            Error::new(RepoError::CorruptBlob {
                name: format!("{}/{}", self.path(), name),
                reason: err.to_string(),
            })
        })?;
        Ok(data)
    }

    fn write_blob_bytes(&self, name: &str, data: &[u8], fail_if_exists: bool) -> Result<(), Error> {
        let mut cursor = std::io::Cursor::new(data);
        self.write_blob(name, &mut cursor, data.len() as u64, fail_if_exists)
    }

    fn write_blob_bytes_atomic(
        &self,
        name: &str,
        data: &[u8],
        fail_if_exists: bool,
    ) -> Result<(), Error> {
        let mut cursor = std::io::Cursor::new(data);
        self.write_blob_atomic(name, &mut cursor, data.len() as u64, fail_if_exists)
    }
}

impl<T: BlobContainer + ?Sized> BlobContainerExt for T {}
