//! End-to-end snapshot lifecycle against a filesystem blob store and
//! an in-process cluster-state service.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;

use snaprepo::cluster::{ClusterService, ClusterState, LocalClusterService, StateUpdateTask};
use snaprepo::remote::{InMemoryLockManager, NoopLockManager, RemoteStoreLockManager};
use snaprepo::repository::{BlobStoreRepository, SnapshotFinalization};
use snaprepo::status::ShardSnapshotStatus;
use snaprepo::store::{DirectoryShardStore, ShardStore};
use snaprepo_api_types::{
    IndexId, RepoError, RepositoriesMetadata, RepositoryMetadata, RepositoryShardId,
    RepositorySettings, ShardGeneration, SnapshotId, SnapshotState, EMPTY_REPO_GEN,
};
use snaprepo_blobstore::container::{BlobContainer, BlobContainerExt};
use snaprepo_blobstore::fs_container::FilesystemBlobContainer;
use snaprepo_blobstore::root_blobs::{ClusterMetadata, IndexMetadata};
use snaprepo_blobstore::shard::RemoteStoreShardShallowCopySnapshot;

struct TestRepo {
    dir: tempfile::TempDir,
    service: Arc<LocalClusterService>,
    repo: BlobStoreRepository,
    root_path: PathBuf,
}

impl TestRepo {
    fn new(settings: RepositorySettings) -> Self {
        Self::build(settings, Arc::new(NoopLockManager), None)
    }

    fn with_lock_manager(
        settings: RepositorySettings,
        lock_manager: Arc<dyn RemoteStoreLockManager>,
    ) -> Self {
        Self::build(settings, lock_manager, None)
    }

    fn with_timeout(settings: RepositorySettings, timeout: Duration) -> Self {
        Self::build(settings, Arc::new(NoopLockManager), Some(timeout))
    }

    fn build(
        settings: RepositorySettings,
        lock_manager: Arc<dyn RemoteStoreLockManager>,
        timeout: Option<Duration>,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root_path = dir.path().join("repo");

        let mut metadata = RepositoryMetadata::new("backups", settings);
        metadata.generation = EMPTY_REPO_GEN;
        metadata.pending_generation = EMPTY_REPO_GEN;
        let initial = ClusterState {
            repositories: RepositoriesMetadata {
                repositories: vec![metadata],
            },
            ..ClusterState::default()
        };
        let service = Arc::new(LocalClusterService::new(initial));

        let factory_path = root_path.clone();
        let mut repo = BlobStoreRepository::new(
            "backups",
            service.clone(),
            lock_manager,
            Box::new(move || {
                Ok(Arc::new(FilesystemBlobContainer::new(factory_path.clone())?)
                    as Arc<dyn BlobContainer>)
            }),
            2,
        )
        .unwrap();
        if let Some(timeout) = timeout {
            repo = repo.with_state_update_timeout(timeout);
        }

        Self {
            dir,
            service,
            repo,
            root_path,
        }
    }

    fn safe_generation(&self) -> i64 {
        self.service
            .state()
            .repositories
            .repository("backups")
            .unwrap()
            .generation
    }

    fn pending_generation(&self) -> i64 {
        self.service
            .state()
            .repositories
            .repository("backups")
            .unwrap()
            .pending_generation
    }

    fn root_container(&self) -> FilesystemBlobContainer {
        FilesystemBlobContainer::new(self.root_path.clone()).unwrap()
    }

    fn shard_container(&self, index: &IndexId) -> Arc<dyn BlobContainer> {
        self.root_container()
            .child("indices")
            .unwrap()
            .child(&index.uuid)
            .unwrap()
            .child("0")
            .unwrap()
    }

    fn shard_store(&self, name: &str, files: &[(&str, &[u8])]) -> Arc<dyn ShardStore> {
        let path = self.dir.path().join(name);
        std::fs::create_dir_all(&path).unwrap();
        for (file_name, contents) in files {
            std::fs::write(path.join(file_name), contents).unwrap();
        }
        Arc::new(DirectoryShardStore::new(path).unwrap())
    }

    fn index_metadata(&self, index: &IndexId) -> IndexMetadata {
        IndexMetadata {
            index: index.clone(),
            number_of_shards: 1,
            settings: serde_json::json!({"codec": "default"}),
            mappings: serde_json::json!({"properties": {}}),
        }
    }

    fn take_snapshot(
        &self,
        name: &str,
        index: &IndexId,
        store: &Arc<dyn ShardStore>,
    ) -> (SnapshotId, i64, ShardGeneration) {
        let repository_data = self.repo.get_repository_data().unwrap();
        let previous = repository_data
            .index_id(&index.name)
            .and_then(|id| repository_data.shard_generation(&id, 0).unwrap().cloned());

        let snapshot = SnapshotId::new(name);
        let status = Arc::new(ShardSnapshotStatus::new());
        let shard_generation = self
            .repo
            .snapshot_shard(
                store,
                &snapshot,
                &RepositoryShardId::new(index.clone(), 0),
                previous,
                &status,
            )
            .unwrap();

        let mut shards = BTreeMap::new();
        shards.insert(0u32, shard_generation.clone());
        let mut shard_generations = BTreeMap::new();
        shard_generations.insert(index.clone(), shards);

        let generation = self
            .repo
            .finalize_snapshot(SnapshotFinalization {
                snapshot: snapshot.clone(),
                state: SnapshotState::Success,
                shard_generations,
                index_metadata: vec![self.index_metadata(index)],
                cluster_metadata: ClusterMetadata {
                    cluster_uuid: "test-cluster".into(),
                    settings: serde_json::json!({}),
                },
                start_time: 1,
                shards_failed: 0,
                failure_reason: None,
            })
            .unwrap();
        (snapshot, generation, shard_generation)
    }
}

fn blob_names_with_prefix(container: &dyn BlobContainer, prefix: &str) -> Vec<String> {
    container
        .list_blobs_by_prefix(prefix)
        .unwrap()
        .into_keys()
        .collect()
}

#[test]
fn first_snapshot_lays_out_the_repository() {
    // E1
    let repo = TestRepo::new(RepositorySettings::default());
    let index = IndexId::new("i");
    let store = repo.shard_store("shard-e1", &[("a", &[1u8; 10]), ("b", &[2u8; 20])]);

    let (snapshot, generation, shard_generation) = repo.take_snapshot("s1", &index, &store);
    assert_eq!(generation, 1);
    assert_eq!(repo.safe_generation(), 1);
    assert_eq!(repo.pending_generation(), 1);

    let root = repo.root_container();
    assert!(root.blob_exists("index-1").unwrap());
    assert!(root.blob_exists("index.latest").unwrap());
    assert!(root
        .blob_exists(&format!("snap-{}.dat", snapshot.uuid))
        .unwrap());
    assert!(root
        .blob_exists(&format!("meta-{}.dat", snapshot.uuid))
        .unwrap());

    let index_container = root.child("indices").unwrap().child(&index.uuid).unwrap();
    assert_eq!(blob_names_with_prefix(&*index_container, "meta-").len(), 1);

    let shard = repo.shard_container(&index);
    assert!(shard
        .blob_exists(&format!("index-{}", shard_generation))
        .unwrap());
    assert!(shard
        .blob_exists(&format!("snap-{}.dat", snapshot.uuid))
        .unwrap());
    assert_eq!(blob_names_with_prefix(&*shard, "__").len(), 2);

    assert_eq!(repo.repo.read_index_latest().unwrap(), Some(1));
}

#[test]
fn identical_content_deduplicates_completely() {
    // E2
    let repo = TestRepo::new(RepositorySettings::default());
    let index = IndexId::new("i");
    let files: &[(&str, &[u8])] = &[("a", &[1u8; 10]), ("b", &[2u8; 20])];
    let store = repo.shard_store("shard-e2", files);

    let (s1, _, g1) = repo.take_snapshot("s1", &index, &store);
    let shard = repo.shard_container(&index);
    let data_blobs_before = blob_names_with_prefix(&*shard, "__");

    let (s2, generation, g2) = repo.take_snapshot("s2", &index, &store);
    assert_eq!(generation, 2);
    assert_eq!(repo.safe_generation(), 2);
    assert_ne!(g1, g2);

    // deduplication: the second snapshot wrote no data blobs
    assert_eq!(blob_names_with_prefix(&*shard, "__"), data_blobs_before);

    // the new shard manifest lists both snapshots, the old one is gone
    let manifests = blob_names_with_prefix(&*shard, "index-");
    assert_eq!(manifests, vec![format!("index-{}", g2)]);
    let manifest = snaprepo_blobstore::shard::SHARD_INDEX_FORMAT
        .read(&*shard, &manifests[0])
        .unwrap();
    let names: Vec<&str> = manifest
        .snapshots
        .iter()
        .map(|entry| entry.snapshot.as_str())
        .collect();
    assert_eq!(names, vec![s1.name.as_str(), s2.name.as_str()]);
}

#[test]
fn clone_references_the_same_data() {
    // E3
    let repo = TestRepo::new(RepositorySettings::default());
    let index = IndexId::new("i");
    let store = repo.shard_store("shard-e3", &[("a", &[1u8; 10])]);

    let (s1, _, _) = repo.take_snapshot("s1", &index, &store);
    let shard = repo.shard_container(&index);
    let data_blobs_before = blob_names_with_prefix(&*shard, "__");

    let target = SnapshotId::new("s3");
    let generation = repo
        .repo
        .clone_snapshot(&s1.name, target.clone(), repo.safe_generation())
        .unwrap();
    assert_eq!(generation, 2);
    assert_eq!(repo.safe_generation(), 2);

    let root = repo.root_container();
    assert!(root
        .blob_exists(&format!("snap-{}.dat", target.uuid))
        .unwrap());
    assert!(shard
        .blob_exists(&format!("snap-{}.dat", target.uuid))
        .unwrap());
    assert_eq!(blob_names_with_prefix(&*shard, "__"), data_blobs_before);

    let snapshots = repo.repo.list_snapshots().unwrap();
    assert_eq!(snapshots.len(), 2);

    let info = repo.repo.get_snapshot_info(&target).unwrap();
    assert_eq!(info.snapshot, target);
}

#[test]
fn delete_keeps_surviving_references_intact() {
    // E4, plus idempotence of a retried delete
    let repo = TestRepo::new(RepositorySettings::default());
    let index = IndexId::new("i");
    let files: &[(&str, &[u8])] = &[("a", &[1u8; 10]), ("b", &[2u8; 20])];
    let store = repo.shard_store("shard-e4", files);

    let (s1, _, _) = repo.take_snapshot("s1", &index, &store);
    let (s2, _, _) = repo.take_snapshot("s2", &index, &store);
    let s3 = SnapshotId::new("s3");
    repo.repo
        .clone_snapshot(&s1.name, s3.clone(), repo.safe_generation())
        .unwrap();
    assert_eq!(repo.safe_generation(), 3);

    let shard = repo.shard_container(&index);
    let data_blobs_before = blob_names_with_prefix(&*shard, "__");

    let result = repo
        .repo
        .delete_snapshots(std::slice::from_ref(&s2), repo.safe_generation())
        .unwrap();
    assert_eq!(result.generation, 4);
    assert_eq!(repo.safe_generation(), 4);

    // shared data blobs survive, the deleted snapshot's markers do not
    assert_eq!(blob_names_with_prefix(&*shard, "__"), data_blobs_before);
    assert!(!shard.blob_exists(&format!("snap-{}.dat", s2.uuid)).unwrap());
    let root = repo.root_container();
    assert!(!root.blob_exists(&format!("snap-{}.dat", s2.uuid)).unwrap());
    assert!(!root.blob_exists(&format!("meta-{}.dat", s2.uuid)).unwrap());

    let manifests = blob_names_with_prefix(&*shard, "index-");
    assert_eq!(manifests.len(), 1);
    let manifest = snaprepo_blobstore::shard::SHARD_INDEX_FORMAT
        .read(&*shard, &manifests[0])
        .unwrap();
    let names: Vec<&str> = manifest
        .snapshots
        .iter()
        .map(|entry| entry.snapshot.as_str())
        .collect();
    assert_eq!(names, vec!["s1", "s3"]);

    let mut surviving: Vec<String> = repo
        .repo
        .list_snapshots()
        .unwrap()
        .into_iter()
        .map(|id| id.name)
        .collect();
    surviving.sort();
    assert_eq!(surviving, vec!["s1", "s3"]);

    // deleting the same snapshot again is a no-op at the same
    // generation
    let retry = repo
        .repo
        .delete_snapshots(std::slice::from_ref(&s2), repo.safe_generation())
        .unwrap();
    assert_eq!(retry.generation, 4);
    assert_eq!(repo.safe_generation(), 4);
}

#[test]
fn concurrent_modification_is_reported_and_harmless() {
    // E5: a stale expected generation fails the phase-1 CAS
    let repo = TestRepo::new(RepositorySettings::default());
    let index = IndexId::new("i");
    let store = repo.shard_store("shard-e5", &[("a", &[1u8; 10])]);

    let (s1, _, _) = repo.take_snapshot("s1", &index, &store);
    assert_eq!(repo.safe_generation(), 1);

    let stale_gen = 0;
    let err = repo
        .repo
        .delete_snapshots(std::slice::from_ref(&s1), stale_gen)
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<RepoError>(),
        Some(RepoError::ConcurrentModification { .. })
    ));

    // nothing was claimed or written
    assert_eq!(repo.safe_generation(), 1);
    assert_eq!(repo.pending_generation(), 1);
    assert!(!repo.root_container().blob_exists("index-2").unwrap());
}

#[test]
fn failed_publish_leaves_the_safe_generation_unchanged() {
    // E5 variant: the phase-3 CAS fails; the claimed manifest becomes
    // a stale blob and the repository stays at the old generation
    let repo = TestRepo::new(RepositorySettings::default());
    let index = IndexId::new("i");
    let store = repo.shard_store("shard-e5b", &[("a", &[1u8; 10])]);
    repo.take_snapshot("s1", &index, &store);

    repo.service.set_task_hook(Some(Box::new(|source| {
        if source.starts_with("publish repository generation") {
            bail!("injected publish failure");
        }
        Ok(())
    })));

    let store2 = repo.shard_store("shard-e5b-2", &[("c", &[3u8; 5])]);
    let repository_data = repo.repo.get_repository_data().unwrap();
    let snapshot = SnapshotId::new("s2");
    let status = Arc::new(ShardSnapshotStatus::new());
    let shard_generation = repo
        .repo
        .snapshot_shard(
            &store2,
            &snapshot,
            &RepositoryShardId::new(index.clone(), 0),
            repository_data
                .index_id(&index.name)
                .and_then(|id| repository_data.shard_generation(&id, 0).unwrap().cloned()),
            &status,
        )
        .unwrap();
    let mut shards = BTreeMap::new();
    shards.insert(0u32, shard_generation);
    let mut shard_generations = BTreeMap::new();
    shard_generations.insert(index.clone(), shards);
    let err = repo
        .repo
        .finalize_snapshot(SnapshotFinalization {
            snapshot,
            state: SnapshotState::Success,
            shard_generations,
            index_metadata: vec![repo.index_metadata(&index)],
            cluster_metadata: ClusterMetadata {
                cluster_uuid: "test-cluster".into(),
                settings: serde_json::json!({}),
            },
            start_time: 1,
            shards_failed: 0,
            failure_reason: None,
        })
        .unwrap_err();
    assert!(err.to_string().contains("injected publish failure"));

    assert_eq!(repo.safe_generation(), 1);
    assert_eq!(repo.pending_generation(), 2);
    repo.service.set_task_hook(None);
}

#[test]
fn slow_cluster_state_updates_hit_the_caller_deadline() {
    let repo = TestRepo::with_timeout(RepositorySettings::default(), Duration::from_millis(20));
    let index = IndexId::new("i");
    let store = repo.shard_store("shard-timeout", &[("a", &[1u8; 10])]);
    repo.take_snapshot("s1", &index, &store);

    // occupy the applier thread so the next update sits in the queue
    // past its deadline
    repo.service.set_task_hook(Some(Box::new(|source| {
        if source == "stall" {
            std::thread::sleep(Duration::from_millis(200));
        }
        Ok(())
    })));
    repo.service.submit_state_update_task(StateUpdateTask {
        source: "stall".into(),
        timeout: None,
        execute: Box::new(|state| Ok(state.clone())),
        on_failure: Box::new(|_| {}),
        cluster_state_processed: Box::new(|_, _| {}),
    });

    let err = repo.repo.cleanup().unwrap_err();
    assert!(err.to_string().contains("timed out"));
    repo.service.set_task_hook(None);

    // the expired phase-1 task was never applied
    assert_eq!(repo.safe_generation(), 1);
    assert_eq!(repo.pending_generation(), 1);
    assert_eq!(repo.repo.list_snapshots().unwrap().len(), 1);
}

#[test]
fn a_vanished_manifest_corrupts_the_repository() {
    // E6
    let repo = TestRepo::new(RepositorySettings::default());
    let index = IndexId::new("i");
    let store = repo.shard_store("shard-e6", &[("a", &[1u8; 10])]);
    let (s1, _, _) = repo.take_snapshot("s1", &index, &store);

    // sabotage: remove the manifest the cluster state points at
    repo.root_container()
        .delete_blobs_ignoring_if_not_exists(&["index-1".into()])
        .unwrap();

    // the next write notices the missing manifest in phase 2 and
    // escalates to repository corruption
    let err = repo
        .repo
        .delete_snapshots(std::slice::from_ref(&s1), 1)
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<RepoError>(),
        Some(RepoError::RepositoryCorrupted(_))
    ));
    assert!(repo
        .service
        .state()
        .repositories
        .repository("backups")
        .unwrap()
        .is_corrupted());

    // all further writes fail fast
    let err = repo.repo.get_repository_data().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<RepoError>(),
        Some(RepoError::RepositoryCorrupted(_))
    ));
}

#[test]
fn restore_round_trips_file_contents() {
    let repo = TestRepo::new(RepositorySettings {
        chunk_size: Some(7),
        ..RepositorySettings::default()
    });
    let index = IndexId::new("i");
    let contents_a: Vec<u8> = (0u16..100).map(|i| i as u8).collect();
    let files: &[(&str, &[u8])] = &[("a", &contents_a), ("b", b"short")];
    let store = repo.shard_store("shard-restore", files);
    let (s1, _, _) = repo.take_snapshot("s1", &index, &store);

    // multi-part upload happened: the 100 byte file has 15 parts
    let shard = repo.shard_container(&index);
    let parts = blob_names_with_prefix(&*shard, "__");
    assert!(parts.iter().any(|name| name.ends_with(".part14")));

    let restore_path = repo.dir.path().join("restore-target");
    let target: Arc<dyn ShardStore> =
        Arc::new(DirectoryShardStore::new(restore_path.clone()).unwrap());
    repo.repo
        .restore_shard(&target, &s1, &RepositoryShardId::new(index.clone(), 0))
        .unwrap();

    assert_eq!(std::fs::read(restore_path.join("a")).unwrap(), contents_a);
    assert_eq!(std::fs::read(restore_path.join("b")).unwrap(), b"short");
}

#[test]
fn aborted_snapshots_fail_cleanly() {
    let repo = TestRepo::new(RepositorySettings::default());
    let index = IndexId::new("i");
    let store = repo.shard_store("shard-abort", &[("a", &[1u8; 10])]);

    let status = Arc::new(ShardSnapshotStatus::new());
    status.abort();
    let err = repo
        .repo
        .snapshot_shard(
            &store,
            &SnapshotId::new("s1"),
            &RepositoryShardId::new(index, 0),
            None,
            &status,
        )
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<RepoError>(),
        Some(RepoError::Aborted)
    ));
}

#[test]
fn readonly_repositories_refuse_writes() {
    let repo = TestRepo::new(RepositorySettings {
        readonly: true,
        ..RepositorySettings::default()
    });
    let index = IndexId::new("i");
    let store = repo.shard_store("shard-ro", &[("a", &[1u8; 10])]);

    let err = repo
        .repo
        .snapshot_shard(
            &store,
            &SnapshotId::new("s1"),
            &RepositoryShardId::new(index, 0),
            None,
            &Arc::new(ShardSnapshotStatus::new()),
        )
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<RepoError>(),
        Some(RepoError::Readonly(_))
    ));
}

#[test]
fn best_effort_mode_derives_the_generation_from_listings() {
    let repo = TestRepo::new(RepositorySettings {
        allow_concurrent_modifications: true,
        ..RepositorySettings::default()
    });
    assert!(repo.repo.best_effort_consistency());

    let index = IndexId::new("i");
    let store = repo.shard_store("shard-be", &[("a", &[1u8; 10])]);
    let (_, generation, _) = repo.take_snapshot("s1", &index, &store);
    assert_eq!(generation, 1);

    let repository_data = repo.repo.get_repository_data().unwrap();
    assert_eq!(repository_data.gen_id, 1);
}

#[test]
fn verification_probe_round_trips() {
    let repo = TestRepo::new(RepositorySettings::default());
    let seed = repo.repo.start_verification().unwrap();
    repo.repo.verify(&seed).unwrap();

    let err = repo.repo.verify("deadbeef").unwrap_err();
    assert!(matches!(
        err.downcast_ref::<RepoError>(),
        Some(RepoError::VerificationFailed(_))
    ));

    repo.repo.end_verification(&seed).unwrap();
    assert!(repo.repo.verify(&seed).is_err());
}

#[test]
fn cleanup_reclaims_unreferenced_blobs() {
    let repo = TestRepo::new(RepositorySettings::default());
    let index = IndexId::new("i");
    let store = repo.shard_store("shard-cleanup", &[("a", &[1u8; 10])]);
    repo.take_snapshot("s1", &index, &store);

    // a snapshot blob of a snapshot no manifest knows about
    let root = repo.root_container();
    root.write_blob_bytes("snap-deadbeef.dat", b"stale", true).unwrap();
    // and a whole index directory nothing references
    root.child("indices")
        .unwrap()
        .child("orphan")
        .unwrap()
        .child("0")
        .unwrap()
        .write_blob_bytes("__orphan", b"data", true)
        .unwrap();

    let stats = repo.repo.cleanup().unwrap();
    assert!(stats.blobs_deleted >= 2);
    assert!(!root.blob_exists("snap-deadbeef.dat").unwrap());
    assert!(!root
        .child("indices")
        .unwrap()
        .children()
        .unwrap()
        .contains_key("orphan"));
    // the live snapshot's layout is untouched
    assert_eq!(repo.repo.list_snapshots().unwrap().len(), 1);
}

#[test]
fn shallow_snapshots_release_their_locks_on_delete() {
    let locks = Arc::new(InMemoryLockManager::default());
    let repo = TestRepo::with_lock_manager(
        RepositorySettings {
            remote_store_index_shallow_copy: true,
            ..RepositorySettings::default()
        },
        locks.clone(),
    );
    let index = IndexId::new("i");
    let store = repo.shard_store("shard-shallow", &[("a", &[1u8; 10])]);
    let (_, _, shard_generation) = repo.take_snapshot("s1", &index, &store);
    let shard_id = RepositoryShardId::new(index.clone(), 0);

    // a shallow snapshot: a marker blob plus a remote-store lock,
    // registered in the manifest with the unchanged shard generation
    let shallow = SnapshotId::new("s2");
    locks.acquire(&shard_id, &shallow.uuid).unwrap();
    let marker = RemoteStoreShardShallowCopySnapshot {
        snapshot: shallow.name.clone(),
        index_uuid: index.uuid.clone(),
        shard: 0,
        remote_store_lock_acquirer: shallow.uuid.clone(),
        file_names: vec!["a".into()],
        total_size: 10,
        start_time: 1,
        time: 2,
    };
    let shard = repo.shard_container(&index);
    snaprepo_blobstore::shard::SHALLOW_SNAPSHOT_FORMAT
        .write_atomic(
            &*shard,
            &format!("shallow-snap-{}.dat", shallow.uuid),
            &marker,
            None,
            true,
        )
        .unwrap();
    let mut shards = BTreeMap::new();
    shards.insert(0u32, shard_generation);
    let mut shard_generations = BTreeMap::new();
    shard_generations.insert(index.clone(), shards);
    repo.repo
        .finalize_snapshot(SnapshotFinalization {
            snapshot: shallow.clone(),
            state: SnapshotState::Success,
            shard_generations,
            index_metadata: vec![repo.index_metadata(&index)],
            cluster_metadata: ClusterMetadata {
                cluster_uuid: "test-cluster".into(),
                settings: serde_json::json!({}),
            },
            start_time: 1,
            shards_failed: 0,
            failure_reason: None,
        })
        .unwrap();
    assert!(locks.is_locked(&shard_id, &shallow.uuid));

    // clone duplicates the lock before the target marker exists
    let clone_target = SnapshotId::new("s3");
    repo.repo
        .clone_snapshot(&shallow.name, clone_target.clone(), repo.safe_generation())
        .unwrap();
    assert!(locks.is_locked(&shard_id, &clone_target.uuid));

    // deleting the shallow snapshot releases its lock and removes the
    // marker, leaving the full snapshot and the clone intact
    repo.repo
        .delete_snapshots(std::slice::from_ref(&shallow), repo.safe_generation())
        .unwrap();
    assert!(!locks.is_locked(&shard_id, &shallow.uuid));
    assert!(locks.is_locked(&shard_id, &clone_target.uuid));
    assert!(!shard
        .blob_exists(&format!("shallow-snap-{}.dat", shallow.uuid))
        .unwrap());
    assert!(shard
        .blob_exists(&format!("shallow-snap-{}.dat", clone_target.uuid))
        .unwrap());
}
