use serde::{Deserialize, Serialize};

use crate::generation::{CORRUPTED_REPO_GEN, EMPTY_REPO_GEN, UNKNOWN_REPO_GEN};
use crate::settings::RepositorySettings;

/// Cluster-state entry describing one registered repository.
///
/// `generation` is the safe generation visible to readers,
/// `pending_generation` the highest generation ever claimed. Outside
/// of an in-flight write both are equal; a node observing
/// `pending_generation > generation` at startup must assume an
/// interrupted write and fall back to best-effort consistency.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct RepositoryMetadata {
    pub name: String,
    pub settings: RepositorySettings,
    pub generation: i64,
    pub pending_generation: i64,
}

impl RepositoryMetadata {
    pub fn new<N: Into<String>>(name: N, settings: RepositorySettings) -> Self {
        Self {
            name: name.into(),
            settings,
            generation: UNKNOWN_REPO_GEN,
            pending_generation: UNKNOWN_REPO_GEN,
        }
    }

    pub fn is_corrupted(&self) -> bool {
        self.generation == CORRUPTED_REPO_GEN
    }

    pub fn is_empty(&self) -> bool {
        self.generation == EMPTY_REPO_GEN
    }

    pub fn is_generation_known(&self) -> bool {
        self.generation != UNKNOWN_REPO_GEN && !self.is_corrupted()
    }

    /// A write is in flight (or was interrupted) when the pending
    /// generation has advanced past the safe one.
    pub fn has_pending_write(&self) -> bool {
        self.pending_generation > self.generation
    }

    pub fn with_generations(&self, safe: i64, pending: i64) -> Self {
        let mut updated = self.clone();
        updated.generation = safe;
        updated.pending_generation = pending;
        updated
    }
}

/// The `repositories` custom of the cluster state.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct RepositoriesMetadata {
    pub repositories: Vec<RepositoryMetadata>,
}

impl RepositoriesMetadata {
    pub fn repository(&self, name: &str) -> Option<&RepositoryMetadata> {
        self.repositories.iter().find(|repo| repo.name == name)
    }

    /// Replace the entry for `updated.name`, keeping the list order.
    pub fn with_repository(&self, updated: RepositoryMetadata) -> Self {
        let mut repositories = Vec::with_capacity(self.repositories.len() + 1);
        let mut replaced = false;
        for repo in &self.repositories {
            if repo.name == updated.name {
                repositories.push(updated.clone());
                replaced = true;
            } else {
                repositories.push(repo.clone());
            }
        }
        if !replaced {
            repositories.push(updated);
        }
        Self { repositories }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fresh_metadata_is_unknown() {
        let meta = RepositoryMetadata::new("repo", RepositorySettings::default());
        assert!(!meta.is_generation_known());
        assert!(!meta.is_corrupted());
        assert!(!meta.has_pending_write());
    }

    #[test]
    fn with_repository_replaces_in_place() {
        let a = RepositoryMetadata::new("a", RepositorySettings::default());
        let b = RepositoryMetadata::new("b", RepositorySettings::default());
        let metas = RepositoriesMetadata {
            repositories: vec![a.clone(), b],
        };
        let updated = metas.with_repository(a.with_generations(3, 3));
        assert_eq!(updated.repositories.len(), 2);
        assert_eq!(updated.repository("a").unwrap().generation, 3);
        assert_eq!(updated.repositories[0].name, "a");
    }
}
