//! The cluster-state interface consumed by the repository engine.
//!
//! The real cluster-state machine is a replicated, version-monotonic
//! store of cluster metadata living outside this crate. The engine
//! only needs two things from it: read access to the current state and
//! a submit-update-task primitive whose tasks are applied one at a
//! time. [`LocalClusterService`] provides exactly that contract for a
//! single process, which is also what drives the tests.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{format_err, Error};
use crossbeam_channel::{unbounded, Sender};

use snaprepo_api_types::RepositoriesMetadata;

/// One running snapshot, as tracked by the cluster-state machine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotInProgress {
    pub repository: String,
    pub snapshot: String,
}

/// The `snapshots` custom: snapshots currently being written.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SnapshotsInProgress {
    pub entries: Vec<SnapshotInProgress>,
}

impl SnapshotsInProgress {
    pub fn for_repository(&self, repository: &str) -> bool {
        self.entries.iter().any(|entry| entry.repository == repository)
    }
}

/// The `snapshot-deletions` custom: deletions currently running.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SnapshotDeletionsInProgress {
    pub repositories: Vec<String>,
}

impl SnapshotDeletionsInProgress {
    pub fn for_repository(&self, repository: &str) -> bool {
        self.repositories.iter().any(|name| name == repository)
    }
}

/// The `repository-cleanup` custom: at most one cleanup per
/// repository.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RepositoryCleanupInProgress {
    pub repositories: Vec<String>,
}

impl RepositoryCleanupInProgress {
    pub fn for_repository(&self, repository: &str) -> bool {
        self.repositories.iter().any(|name| name == repository)
    }
}

/// The slice of cluster state the repository engine reads.
#[derive(Clone, Debug, Default)]
pub struct ClusterState {
    /// Monotonically increasing; bumped on every applied update.
    pub version: u64,
    pub repositories: RepositoriesMetadata,
    pub snapshots_in_progress: SnapshotsInProgress,
    pub deletions_in_progress: SnapshotDeletionsInProgress,
    pub cleanup_in_progress: RepositoryCleanupInProgress,
}

/// A cluster-state update: `execute` derives the new state (or fails),
/// then exactly one of the two callbacks fires.
pub struct StateUpdateTask {
    pub source: String,
    /// Give up if the task was not applied within this window.
    pub timeout: Option<Duration>,
    pub execute: Box<dyn FnOnce(&ClusterState) -> Result<ClusterState, Error> + Send>,
    pub on_failure: Box<dyn FnOnce(Error) + Send>,
    pub cluster_state_processed:
        Box<dyn FnOnce(Arc<ClusterState>, Arc<ClusterState>) + Send>,
}

pub trait ClusterService: Send + Sync {
    fn state(&self) -> Arc<ClusterState>;
    fn submit_state_update_task(&self, task: StateUpdateTask);
}

/// Hook invoked before a task executes; failing it fails the task.
/// Used by tests to inject publish failures.
pub type TaskHook = Box<dyn FnMut(&str) -> Result<(), Error> + Send>;

struct QueuedTask {
    task: StateUpdateTask,
    submitted: Instant,
}

/// In-process [`ClusterService`]: updates are applied serially on a
/// dedicated generic worker thread, with the version bumped per
/// applied task.
pub struct LocalClusterService {
    state: Arc<Mutex<Arc<ClusterState>>>,
    input: Option<Sender<QueuedTask>>,
    handle: Option<JoinHandle<()>>,
    hook: Arc<Mutex<Option<TaskHook>>>,
}

impl LocalClusterService {
    pub fn new(initial: ClusterState) -> Self {
        let state = Arc::new(Mutex::new(Arc::new(initial)));
        let hook: Arc<Mutex<Option<TaskHook>>> = Arc::new(Mutex::new(None));
        let (input_tx, input_rx) = unbounded::<QueuedTask>();

        let state_slot = Arc::clone(&state);
        let task_hook = Arc::clone(&hook);
        let handle = std::thread::Builder::new()
            .name("generic-0".to_string())
            .spawn(move || {
                while let Ok(queued) = input_rx.recv() {
                    Self::apply(&state_slot, &task_hook, queued);
                }
            })
            .unwrap();

        Self {
            state,
            input: Some(input_tx),
            handle: Some(handle),
            hook,
        }
    }

    /// Install (or clear) the pre-execution hook.
    pub fn set_task_hook(&self, hook: Option<TaskHook>) {
        *self.hook.lock().unwrap() = hook;
    }

    fn apply(
        state_slot: &Mutex<Arc<ClusterState>>,
        hook: &Mutex<Option<TaskHook>>,
        queued: QueuedTask,
    ) {
        let QueuedTask { task, submitted } = queued;

        if let Some(timeout) = task.timeout {
            if submitted.elapsed() > timeout {
                (task.on_failure)(format_err!(
                    "cluster state update task '{}' timed out after {:?}",
                    task.source,
                    timeout,
                ));
                return;
            }
        }

        if let Some(hook) = hook.lock().unwrap().as_mut() {
            if let Err(err) = hook(&task.source) {
                (task.on_failure)(err);
                return;
            }
        }

        let old = state_slot.lock().unwrap().clone();
        match (task.execute)(&old) {
            Ok(mut new_state) => {
                new_state.version = old.version + 1;
                let new_state = Arc::new(new_state);
                *state_slot.lock().unwrap() = Arc::clone(&new_state);
                (task.cluster_state_processed)(old, new_state);
            }
            Err(err) => (task.on_failure)(err),
        }
    }
}

impl ClusterService for LocalClusterService {
    fn state(&self) -> Arc<ClusterState> {
        self.state.lock().unwrap().clone()
    }

    fn submit_state_update_task(&self, task: StateUpdateTask) {
        let queued = QueuedTask {
            task,
            submitted: Instant::now(),
        };
        if let Some(input) = &self.input {
            if input.send(queued).is_ok() {
                return;
            }
        }
        unreachable!("cluster service used after shutdown");
    }
}

impl Drop for LocalClusterService {
    fn drop(&mut self) {
        drop(self.input.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Submit an update task and block until it was processed.
///
/// The repository engine runs on snapshot pool threads, so blocking
/// here never stalls the applier thread itself.
pub fn update_cluster_state_sync<F>(
    service: &dyn ClusterService,
    source: &str,
    timeout: Option<Duration>,
    execute: F,
) -> Result<(Arc<ClusterState>, Arc<ClusterState>), Error>
where
    F: FnOnce(&ClusterState) -> Result<ClusterState, Error> + Send + 'static,
{
    let (done_tx, done_rx) = crossbeam_channel::bounded(1);
    // exactly one of the two task callbacks fires; the single-fire
    // completion also swallows a late duplicate from a buggy service
    let completion = snaprepo_tools::Completion::new(move |result| {
        let _ = done_tx.send(result);
    });
    let on_failure = completion.clone();
    let on_processed = completion;

    service.submit_state_update_task(StateUpdateTask {
        source: source.to_string(),
        timeout,
        execute: Box::new(execute),
        on_failure: Box::new(move |err| on_failure.fail(err)),
        cluster_state_processed: Box::new(move |old, new| on_processed.succeed((old, new))),
    });

    done_rx
        .recv()
        .map_err(|_| format_err!("cluster state update task '{}' was dropped", source))?
}
