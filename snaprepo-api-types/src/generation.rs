use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// The repository has never been written to.
pub const EMPTY_REPO_GEN: i64 = -1;
/// The blob layout disagrees with the cluster-state pointer; all
/// writes fail until the repository is removed and re-added.
pub const CORRUPTED_REPO_GEN: i64 = -2;
/// The current generation is unknown (fresh node, or recovering from
/// an interrupted write); it must be derived by listing.
pub const UNKNOWN_REPO_GEN: i64 = -3;

const NEW_SHARD_GEN: &str = "_new";
const DELETED_SHARD_GEN: &str = "_deleted";

/// Opaque token identifying one shard-level `index-*` manifest blob.
///
/// New writes always produce random uuid generations; numeric tokens
/// are only parsed for repositories written by the legacy scheme.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ShardGeneration {
    /// The shard has never been snapshotted into this repository.
    New,
    /// No full-copy snapshot references the shard any longer.
    Deleted,
    /// Current scheme: a random uuid naming `index-<uuid>`.
    Uuid(String),
    /// Legacy scheme: consecutive numeric generations.
    Legacy(u64),
}

impl ShardGeneration {
    /// A fresh random generation token.
    pub fn new_generation() -> Self {
        ShardGeneration::Uuid(crate::new_uuid())
    }

    /// The token following `self` for a new shard-index write.
    pub fn successor(&self) -> Self {
        match self {
            // legacy repositories keep counting
            ShardGeneration::Legacy(n) => ShardGeneration::Legacy(n + 1),
            _ => ShardGeneration::new_generation(),
        }
    }

    /// Whether a shard-index blob exists for this token.
    pub fn has_blob(&self) -> bool {
        matches!(self, ShardGeneration::Uuid(_) | ShardGeneration::Legacy(_))
    }

    pub fn as_str(&self) -> std::borrow::Cow<'_, str> {
        match self {
            ShardGeneration::New => NEW_SHARD_GEN.into(),
            ShardGeneration::Deleted => DELETED_SHARD_GEN.into(),
            ShardGeneration::Uuid(uuid) => uuid.as_str().into(),
            ShardGeneration::Legacy(n) => n.to_string().into(),
        }
    }

    pub fn parse(token: &str) -> Self {
        match token {
            NEW_SHARD_GEN => ShardGeneration::New,
            DELETED_SHARD_GEN => ShardGeneration::Deleted,
            other => match other.parse::<u64>() {
                Ok(n) => ShardGeneration::Legacy(n),
                Err(_) => ShardGeneration::Uuid(other.to_string()),
            },
        }
    }
}

impl fmt::Display for ShardGeneration {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for ShardGeneration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_str())
    }
}

impl<'de> Deserialize<'de> for ShardGeneration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let token = String::deserialize(deserializer)?;
        Ok(ShardGeneration::parse(&token))
    }
}
