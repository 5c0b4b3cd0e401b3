//! Identifier, metadata and settings types shared between the
//! repository engine and the blob storage layer.

mod error;
mod generation;
mod repository;
mod settings;
mod snapshot;

pub use error::{is_not_found, RepoError};
pub use generation::{
    ShardGeneration, CORRUPTED_REPO_GEN, EMPTY_REPO_GEN, UNKNOWN_REPO_GEN,
};
pub use repository::{RepositoriesMetadata, RepositoryMetadata};
pub use settings::{CompressionType, RepositorySettings};
pub use snapshot::{IndexId, RepositoryShardId, SnapshotId, SnapshotState};

/// Generate a random identifier for snapshots, indices, blobs and
/// shard generations. 32 hex characters, no separators, safe inside
/// blob names.
pub fn new_uuid() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
