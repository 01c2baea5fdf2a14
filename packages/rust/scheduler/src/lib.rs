//! Scheduling primitives shared by every generation run.
//!
//! This crate provides:
//! - [`CancellationToken`] / [`PauseToken`]: cooperative run control
//! - [`WorkerPool`]: a bounded-concurrency gate for one category of calls
//! - [`RateLimiter`] / [`RateLimiterRegistry`]: per-provider call-start rate limits

pub mod cancel;
pub mod pool;
pub mod rate_limit;

pub use cancel::{CancellationToken, PauseSignal, PauseToken, wait_while_paused};
pub use pool::WorkerPool;
pub use rate_limit::{RateLimiter, RateLimiterRegistry};
