use thiserror::Error;

/// Typed error kinds of the repository engine.
///
/// Everything still travels as `anyhow::Error`; call sites that need
/// to branch on a kind recover it with `downcast_ref::<RepoError>()`.
#[derive(Error, Debug)]
pub enum RepoError {
    /// A blob that was expected to exist is absent. Garbage collection
    /// paths treat this as a signal, not a failure.
    #[error("blob '{name}' not found in container '{container}'")]
    NotFound { container: String, name: String },

    /// Checksum, magic or codec mismatch while reading a blob.
    #[error("corrupt blob '{name}': {reason}")]
    CorruptBlob { name: String, reason: String },

    /// The blob was written by a newer format than this build reads.
    #[error("blob '{name}' has format version {version}, newest supported is {supported}")]
    FormatTooNew {
        name: String,
        version: i32,
        supported: i32,
    },

    /// The blob predates the oldest supported format version.
    #[error("blob '{name}' has format version {version}, oldest supported is {supported}")]
    FormatTooOld {
        name: String,
        version: i32,
        supported: i32,
    },

    /// The observed safe generation does not match the caller's
    /// expectation. The caller reloads the repository data and
    /// retries.
    #[error(
        "concurrent modification of repository '{repository}': expected generation {expected}, current generation is {actual}"
    )]
    ConcurrentModification {
        repository: String,
        expected: i64,
        actual: i64,
    },

    /// Cooperative cancellation observed at a part boundary.
    #[error("snapshot aborted")]
    Aborted,

    /// The blob layout no longer matches the cluster-state pointer.
    /// The repository is read-only until removed and re-added.
    #[error("repository '{0}' is corrupted and must be removed and re-added")]
    RepositoryCorrupted(String),

    /// The verification probe could not be read back.
    #[error("repository verification failed: {0}")]
    VerificationFailed(String),

    /// A write was attempted against a readonly repository.
    #[error("repository '{0}' is readonly")]
    Readonly(String),
}

/// True if `err` is a [`RepoError::NotFound`] at any context depth.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<RepoError>(), Some(RepoError::NotFound { .. }))
}
