//! Blob-store snapshot repository engine.
//!
//! This crate persists point-in-time snapshots of sharded index data
//! into an opaque blob store while preserving cross-snapshot
//! deduplication, atomic visibility and correctness under concurrent
//! cluster-manager failover and eventually consistent backends.
//!
//! The authoritative repository contents are always described by one
//! `index-<N>` manifest blob. Advancing `N` goes through a three-phase
//! protocol against the cluster-state store (claim, write, publish) so
//! that the blob store and the cluster state never disagree about the
//! current manifest for longer than one in-flight write; see
//! [`repository::BlobStoreRepository`].
//!
//! Layering, bottom up:
//!
//! * `snaprepo-blobstore` - blob containers, checksummed blob formats
//!   and the manifest data model.
//! * [`cluster`] - the cluster-state interface the engine consumes.
//! * [`store`] - access to the local shard files being snapshotted or
//!   restored.
//! * [`repository`] - the engine: generation protocol, snapshot
//!   finalize/delete/clone, shard upload/restore, verification and
//!   garbage collection.

pub mod cluster;
pub mod remote;
pub mod repository;
pub mod status;
pub mod store;

pub use repository::{BlobStoreRepository, ContainerFactory, DeleteResult, SnapshotFinalization};
pub use status::ShardSnapshotStatus;
