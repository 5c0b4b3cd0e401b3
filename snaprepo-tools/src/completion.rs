//! Single-fire completion callbacks and a fan-in group.
//!
//! Long running repository operations hand their continuation to the
//! next step instead of blocking. The two primitives here cover the
//! patterns the engine needs: a callback slot that fires exactly once,
//! and a group that fires once all of N children completed (or as soon
//! as the first of them failed).

use std::sync::{Arc, Mutex};

use anyhow::Error;

struct CompletionState<T> {
    callback: Option<Box<dyn FnOnce(Result<T, Error>) + Send>>,
}

/// A completion handle that invokes its callback at most once.
///
/// Further calls to [`Completion::complete`] are ignored, which makes
/// it safe to report an error from several failure paths.
pub struct Completion<T> {
    state: Arc<Mutex<CompletionState<T>>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> Completion<T> {
    pub fn new<F>(callback: F) -> Self
    where
        F: FnOnce(Result<T, Error>) + Send + 'static,
    {
        Self {
            state: Arc::new(Mutex::new(CompletionState {
                callback: Some(Box::new(callback)),
            })),
        }
    }

    pub fn complete(&self, result: Result<T, Error>) {
        let callback = self.state.lock().unwrap().callback.take();
        if let Some(callback) = callback {
            callback(result);
        }
    }

    pub fn succeed(&self, value: T) {
        self.complete(Ok(value));
    }

    pub fn fail(&self, err: Error) {
        self.complete(Err(err));
    }
}

struct GroupState<T> {
    remaining: usize,
    results: Vec<T>,
    failed: bool,
}

/// Fan-in of `n` child completions.
///
/// The grouped callback fires once: with the collected results after
/// the last child succeeded, or with the first error as soon as any
/// child failed. Results are collected in completion order.
pub struct GroupedCompletion<T> {
    state: Arc<Mutex<GroupState<T>>>,
    done: Completion<Vec<T>>,
}

impl<T> Clone for GroupedCompletion<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            done: self.done.clone(),
        }
    }
}

impl<T: Send + 'static> GroupedCompletion<T> {
    pub fn new(n: usize, done: Completion<Vec<T>>) -> Self {
        let group = Self {
            state: Arc::new(Mutex::new(GroupState {
                remaining: n,
                results: Vec::with_capacity(n),
                failed: false,
            })),
            done,
        };
        if n == 0 {
            group.done.succeed(Vec::new());
        }
        group
    }

    pub fn child_success(&self, value: T) {
        let fire = {
            let mut state = self.state.lock().unwrap();
            if state.failed || state.remaining == 0 {
                return;
            }
            state.results.push(value);
            state.remaining -= 1;
            if state.remaining == 0 {
                Some(std::mem::take(&mut state.results))
            } else {
                None
            }
        };
        if let Some(results) = fire {
            self.done.succeed(results);
        }
    }

    pub fn child_failure(&self, err: Error) {
        {
            let mut state = self.state.lock().unwrap();
            if state.failed {
                return;
            }
            state.failed = true;
        }
        self.done.fail(err);
    }
}
