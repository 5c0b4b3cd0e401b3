//! A thread pool which drains a queue of fallible tasks in parallel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use anyhow::{bail, format_err, Error};
use crossbeam_channel::{unbounded, Sender};

type Task = Box<dyn FnOnce() -> Result<(), Error> + Send + 'static>;

/// Controls whether blob I/O entry points assert the name of the
/// calling thread. Off by default; tests and debug deployments may
/// turn it on.
static ENFORCE_THREAD_CHECKS: AtomicBool = AtomicBool::new(false);

pub fn set_thread_checks(enforce: bool) {
    ENFORCE_THREAD_CHECKS.store(enforce, Ordering::Relaxed);
}

/// Assert that the current thread belongs to one of the named pools.
///
/// Blob I/O must not run on latency-critical threads. The exact set of
/// allowed pools depends on the call site, so callers pass the
/// prefixes they accept.
pub fn assert_pool_thread(allowed_prefixes: &[&str]) {
    if !ENFORCE_THREAD_CHECKS.load(Ordering::Relaxed) {
        return;
    }
    let current = std::thread::current();
    let name = current.name().unwrap_or("");
    debug_assert!(
        allowed_prefixes.iter().any(|p| name.starts_with(p)),
        "thread '{}' must not perform blob I/O (allowed pools: {:?})",
        name,
        allowed_prefixes,
    );
}

/// A pool of named worker threads executing queued tasks.
///
/// Tasks are closures returning `Result<(), Error>`. The first error
/// poisons the pool: queued tasks are still drained but no new tasks
/// are accepted, and `complete()` returns the recorded error. This
/// mirrors the "submit min(capacity, queue) workers, drain until
/// empty" scheduling the repository engine uses for batched blob
/// deletes and parallel file transfers.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    name: String,
    input: Option<Sender<Task>>,
    abort: Arc<Mutex<Option<String>>>,
}

fn check_abort(abort: &Mutex<Option<String>>) -> Result<(), Error> {
    let guard = abort.lock().unwrap();
    if let Some(err_msg) = &*guard {
        return Err(format_err!("{}", err_msg));
    }
    Ok(())
}

impl WorkerPool {
    /// Create a pool of `threads` workers. Thread names are
    /// `<name>-<i>` so the pool membership assertions can identify
    /// them.
    pub fn new(name: &str, threads: usize) -> Self {
        let threads = threads.max(1);
        let (input_tx, input_rx) = unbounded::<Task>();
        let abort = Arc::new(Mutex::new(None));

        let mut handles = Vec::new();
        for i in 0..threads {
            let input_rx = input_rx.clone();
            let abort = Arc::clone(&abort);
            handles.push(
                std::thread::Builder::new()
                    .name(format!("{}-{}", name, i))
                    .spawn(move || loop {
                        let task = match input_rx.recv() {
                            Ok(task) => task,
                            Err(_) => return,
                        };
                        if let Err(err) = task() {
                            let mut guard = abort.lock().unwrap();
                            if guard.is_none() {
                                *guard = Some(err.to_string());
                            }
                        }
                    })
                    .unwrap(),
            );
        }

        Self {
            handles,
            name: name.to_string(),
            input: Some(input_tx),
            abort,
        }
    }

    /// Queue a task. Fails if a previous task already errored.
    pub fn spawn<F>(&self, task: F) -> Result<(), Error>
    where
        F: FnOnce() -> Result<(), Error> + Send + 'static,
    {
        check_abort(&self.abort)?;
        match self.input.as_ref().unwrap().send(Box::new(task)) {
            Ok(()) => Ok(()),
            Err(_) => bail!("worker pool '{}' - channel closed", self.name),
        }
    }

    /// Wait for all queued tasks to finish and surface the first error.
    pub fn complete(mut self) -> Result<(), Error> {
        let abort = Arc::clone(&self.abort);
        check_abort(&abort)?;
        drop(self.input.take());

        let msg_list = self.join_threads();

        // an error might be recorded while waiting for the join
        check_abort(&abort)?;

        if msg_list.is_empty() {
            return Ok(());
        }
        Err(format_err!("{}", msg_list.join("\n")))
    }

    fn join_threads(&mut self) -> Vec<String> {
        let mut msg_list = Vec::new();

        let mut i = 0;
        while let Some(handle) = self.handles.pop() {
            if let Err(panic) = handle.join() {
                match panic.downcast::<&str>() {
                    Ok(panic_msg) => msg_list.push(format!(
                        "worker {} ({}) panicked: {}",
                        self.name, i, panic_msg
                    )),
                    Err(_) => msg_list.push(format!("worker {} ({}) panicked", self.name, i)),
                }
            }
            i += 1;
        }
        msg_list
    }
}

// Note: We make sure that all threads will be joined
impl Drop for WorkerPool {
    fn drop(&mut self) {
        drop(self.input.take());
        while let Some(handle) = self.handles.pop() {
            let _ = handle.join();
        }
    }
}
