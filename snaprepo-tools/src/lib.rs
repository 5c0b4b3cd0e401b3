//! Shared infrastructure for the snapshot repository engine: bounded
//! worker pools, single-fire completions, filesystem helpers and
//! byte-rate limiting.

pub mod completion;
pub mod fs;
pub mod rate_limiter;
pub mod worker_pool;

pub use completion::{Completion, GroupedCompletion};
pub use rate_limiter::{RateLimitedReader, RateLimiter};
pub use worker_pool::WorkerPool;
