use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};

const MIN_IO_BUFFER_SIZE: u64 = 8 * 1024;
const MAX_IO_BUFFER_SIZE: u64 = 16 * 1024 * 1024;

fn default_io_buffer_size() -> u64 {
    128 * 1024
}

fn default_snapshot_rate() -> u64 {
    40 * 1024 * 1024
}

fn default_delete_batch_size() -> usize {
    1000
}

fn default_cache_repository_data() -> bool {
    true
}

fn default_support_url_repo() -> bool {
    true
}

/// Codec used for compressed metadata blob bodies.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    #[default]
    Deflate,
    Lz4,
}

/// Per-repository settings, as supplied by the user when registering
/// the repository.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct RepositorySettings {
    /// Compress metadata blob bodies.
    #[serde(default)]
    pub compress: bool,

    /// Codec used when `compress` is enabled.
    #[serde(default)]
    pub compression_type: CompressionType,

    /// Stream buffer size for blob uploads and downloads, in bytes.
    #[serde(default = "default_io_buffer_size")]
    pub io_buffer_size: u64,

    /// Upload rate cap in bytes per second, `0` = unlimited.
    #[serde(default = "default_snapshot_rate")]
    pub max_snapshot_bytes_per_sec: u64,

    /// Download rate cap in bytes per second, `0` = unlimited.
    #[serde(default)]
    pub max_restore_bytes_per_sec: u64,

    /// Upper bound on the number of shard blobs deleted per batch
    /// during garbage collection.
    #[serde(default = "default_delete_batch_size")]
    pub max_snapshot_shard_blob_delete_batch_size: usize,

    /// Disable all writes and write-side consistency checks.
    #[serde(default)]
    pub readonly: bool,

    /// Cache the last read repository manifest.
    #[serde(default = "default_cache_repository_data")]
    pub cache_repository_data: bool,

    /// Trust blob listings over the cluster-state generation pointer.
    #[serde(default)]
    pub allow_concurrent_modifications: bool,

    /// Maintain the `index.latest` pointer so the repository can be
    /// mounted as a URL-only read mirror.
    #[serde(default = "default_support_url_repo")]
    pub support_url_repo: bool,

    /// Allow shallow snapshots whose shard payload lives in a remote
    /// store tier.
    #[serde(default)]
    pub remote_store_index_shallow_copy: bool,

    /// Split files into parts of at most this many bytes. Unset means
    /// a single part per file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u64>,
}

impl Default for RepositorySettings {
    fn default() -> Self {
        // serde defaults are the single source of truth
        serde_json::from_value(serde_json::json!({})).unwrap()
    }
}

impl RepositorySettings {
    pub fn from_value(value: serde_json::Value) -> Result<Self, Error> {
        let settings: RepositorySettings = serde_json::from_value(value)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.io_buffer_size < MIN_IO_BUFFER_SIZE || self.io_buffer_size > MAX_IO_BUFFER_SIZE {
            bail!(
                "io-buffer-size {} out of range [{}, {}]",
                self.io_buffer_size,
                MIN_IO_BUFFER_SIZE,
                MAX_IO_BUFFER_SIZE,
            );
        }
        if self.max_snapshot_shard_blob_delete_batch_size == 0 {
            bail!("max-snapshot-shard-blob-delete-batch-size must be positive");
        }
        if let Some(chunk_size) = self.chunk_size {
            if chunk_size == 0 {
                bail!("chunk-size must be positive");
            }
        }
        Ok(())
    }
}
