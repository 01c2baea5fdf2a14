//! Cooperative cancellation and pausing.
//!
//! Neither signal preempts anything: work observes them at its own
//! suspension points (pool acquisition, rate-limit waits, the pause loop,
//! and before/after each network call).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::debug;

use storyforge_shared::{Result, StoryforgeError};

// ---------------------------------------------------------------------------
// CancellationToken
// ---------------------------------------------------------------------------

/// A shared, clonable cancellation flag.
///
/// Cancelling a token cancels every child created from it; cancelling a
/// child leaves the parent untouched.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
    children: Mutex<Vec<Weak<Inner>>>,
}

impl Inner {
    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.notify.notify_waiters();
        let children = std::mem::take(
            &mut *self.children.lock().unwrap_or_else(|e| e.into_inner()),
        );
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once cancellation has been requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(StoryforgeError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// A token cancelled together with this one, but cancellable on its own.
    pub fn child_token(&self) -> Self {
        let child = Self::new();
        self.inner
            .children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::downgrade(&child.inner));
        // The parent may have been cancelled before the child was registered.
        if self.is_cancelled() {
            child.cancel();
        }
        child
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Pause
// ---------------------------------------------------------------------------

/// Anything that can report whether a run should hold off starting work.
pub trait PauseSignal: Send + Sync {
    fn is_paused(&self) -> bool;
}

impl<F> PauseSignal for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_paused(&self) -> bool {
        self()
    }
}

/// A shared pause flag toggled by the caller.
#[derive(Debug, Clone, Default)]
pub struct PauseToken {
    paused: Arc<AtomicBool>,
}

impl PauseToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }
}

impl PauseSignal for PauseToken {
    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

/// Block while `pause` reports paused, polling every `poll`.
///
/// Cancellation is rechecked on every iteration and also wakes the wait
/// early. Returns whether the caller actually had to wait.
pub async fn wait_while_paused(
    pause: &dyn PauseSignal,
    cancel: &CancellationToken,
    poll: Duration,
) -> Result<bool> {
    let mut waited = false;
    loop {
        cancel.check()?;
        if !pause.is_paused() {
            return Ok(waited);
        }
        if !waited {
            debug!("run paused, waiting");
            waited = true;
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StoryforgeError::Cancelled),
            _ = tokio::time::sleep(poll) => {}
        }
    }
}
