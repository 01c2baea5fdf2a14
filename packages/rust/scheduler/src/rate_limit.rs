//! Per-provider call-start rate limiting.
//!
//! Orthogonal to pool concurrency: a call holds a pool slot first and then
//! takes a rate-limit token, so nobody sits on a token while blocked on
//! pool capacity.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use storyforge_shared::{Result, StoryforgeError};

use crate::cancel::CancellationToken;

/// Sliding-window limiter: at most `limit` call starts in any `window`.
///
/// Waiters are served in FIFO order; the caller at the head of the queue
/// holds the queue lock while it sleeps for the next free slot.
#[derive(Debug)]
pub struct RateLimiter {
    provider: String,
    limit: u32,
    window: Duration,
    starts: tokio::sync::Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// `limit` starts per `window`. A limit of 0 disables limiting.
    pub fn new(provider: impl Into<String>, limit: u32, window: Duration) -> Self {
        Self {
            provider: provider.into(),
            limit,
            window,
            starts: tokio::sync::Mutex::new(VecDeque::new()),
        }
    }

    pub fn per_minute(provider: impl Into<String>, requests_per_minute: u32) -> Self {
        Self::new(provider, requests_per_minute, Duration::from_secs(60))
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn is_unlimited(&self) -> bool {
        self.limit == 0
    }

    /// Wait until a call may start, recording the start.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<()> {
        cancel.check()?;
        if self.is_unlimited() {
            return Ok(());
        }

        // tokio's Mutex grants the lock in request order.
        let mut starts = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StoryforgeError::Cancelled),
            guard = self.starts.lock() => guard,
        };

        loop {
            cancel.check()?;
            let now = Instant::now();
            while starts
                .front()
                .is_some_and(|&oldest| now.duration_since(oldest) >= self.window)
            {
                starts.pop_front();
            }

            let Some(&oldest) = starts.front() else {
                starts.push_back(now);
                return Ok(());
            };
            if starts.len() < self.limit as usize {
                starts.push_back(now);
                return Ok(());
            }

            let wait = self.window - now.duration_since(oldest);
            debug!(
                provider = %self.provider,
                wait_ms = wait.as_millis() as u64,
                "rate limit reached, waiting"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StoryforgeError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

/// One limiter per provider identity, shared across concurrent runs.
#[derive(Debug, Default)]
pub struct RateLimiterRegistry {
    limiters: Mutex<HashMap<String, Arc<RateLimiter>>>,
}

impl RateLimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The limiter for `provider`, created with `requests_per_minute` on first use.
    pub fn get_or_create(&self, provider: &str, requests_per_minute: u32) -> Arc<RateLimiter> {
        let mut limiters = self.limiters.lock().unwrap_or_else(|e| e.into_inner());
        limiters
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(RateLimiter::per_minute(provider, requests_per_minute)))
            .clone()
    }
}
