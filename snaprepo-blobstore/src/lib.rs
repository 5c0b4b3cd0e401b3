//! This crate implements the blob storage layer of the snapshot
//! repository.
//!
//! # Containers
//!
//! A repository is rooted in a [BlobContainer]: a flat namespace of
//! opaque blobs with list/read/write/delete primitives and named
//! sub-containers. Backends only need to provide these primitives;
//! everything above assumes an eventually consistent store and never
//! relies on read-after-write visibility across listings.
//!
//! # Blob formats
//!
//! Metadata blobs (snapshot info, index metadata, shard manifests) are
//! wrapped by [format::ChecksumBlobFormat]: a small codec header, the
//! JSON body (optionally compressed), and a trailing CRC32 covering
//! both. Reads verify header, version window and checksum before any
//! payload is parsed.
//!
//! Shard data blobs (`__<uuid>`) are raw bytes. They are content
//! addressed through the file metadata recorded in the shard
//! manifests, so identical files across snapshots share one blob and
//! concurrent writers racing on the same content are harmless.
//!
//! # Manifests
//!
//! [repository_data::RepositoryData] is the repository-wide manifest
//! (`index-<N>`), mapping snapshots to indices, indices to per-shard
//! generations, and index metadata to deduplicated blob identifiers.
//! [shard::BlobStoreIndexShardSnapshots] is the per-shard manifest
//! (`index-<generation>`), listing which files each snapshot of the
//! shard references.

pub mod checksum;
pub mod container;
pub mod format;
pub mod fs_container;
pub mod repository_data;
pub mod root_blobs;
pub mod shard;

pub use checksum::{ChecksumReader, ChecksumWriter};
pub use container::{BlobContainer, BlobContainerExt, BlobEntry, DeleteStats};
pub use format::ChecksumBlobFormat;
pub use fs_container::FilesystemBlobContainer;
pub use repository_data::RepositoryData;
pub use shard::{BlobStoreIndexShardSnapshot, BlobStoreIndexShardSnapshots, FileInfo};
