//! Resumable, concurrent runs over a book's chunk list.
//!
//! One run drives every runnable chunk of one task entry:
//!
//! 1. Reload the persisted entry and demote chunks left `running`.
//! 2. Submit each `pending`/`failed` chunk to the primary pool.
//! 3. Per chunk: wait for a slot, honour pause, mark `running`, process,
//!    settle as `completed`/`failed`, report progress, maybe persist.
//! 4. Persist the final state, or flush settled work on cancellation.
//!
//! Chunks only ever touch their own line range of the book, and every write
//! to the store goes through a single gate.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{error, info, instrument, warn};

use storyforge_scheduler::{CancellationToken, PauseSignal, WorkerPool};
use storyforge_shared::{
    Book, BookId, ChunkStatus, GenerationKind, Result, RunConfig, SavePolicy, StoryforgeError,
    TaskEntry, TaskStatus,
};
use storyforge_storage::TaskStore;

use crate::processor::{ChunkOutput, ChunkProcessor, ChunkWork, ProcessContext};
use crate::progress::RunProgress;

/// Outcome counts for a run that was not cancelled.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub kind: GenerationKind,
    /// Chunks in the entry.
    pub total: usize,
    /// Chunks already completed when the run started.
    pub previously_completed: usize,
    /// Chunks this run moved to `running`.
    pub attempted: usize,
    pub completed: usize,
    pub failed: usize,
    pub elapsed: Duration,
}

impl RunSummary {
    /// Chunks completed overall once this run finished.
    pub fn completed_overall(&self) -> usize {
        self.previously_completed + self.completed
    }
}

/// How a chunk task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settled {
    Completed,
    Failed,
    /// Cancelled mid-attempt and handed back to `pending`.
    Released,
    /// Never started.
    Skipped,
}

struct RunState {
    book: Book,
    entry: TaskEntry,
}

/// State shared by the chunk tasks of one run.
struct RunShared {
    store: Arc<dyn TaskStore>,
    processor: Arc<dyn ChunkProcessor>,
    state: tokio::sync::Mutex<RunState>,
    save_gate: tokio::sync::Mutex<()>,
    llm_pool: WorkerPool,
    ctx: ProcessContext,
    progress: Arc<dyn RunProgress>,
    save_policy: SavePolicy,
    /// The caller's token; `ctx.cancel` is a child that also fires on halt.
    cancel: CancellationToken,
    persist_error: Mutex<Option<StoryforgeError>>,
}

/// Drives runs of one generation kind.
pub struct Orchestrator {
    store: Arc<dyn TaskStore>,
    processor: Arc<dyn ChunkProcessor>,
    config: RunConfig,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn TaskStore>,
        processor: Arc<dyn ChunkProcessor>,
        config: RunConfig,
    ) -> Self {
        Self {
            store,
            processor,
            config,
        }
    }

    pub fn kind(&self) -> GenerationKind {
        self.processor.kind()
    }

    /// Run every pending or failed chunk of the book's entry for this kind.
    ///
    /// Individual chunk failures are recorded on the chunk and do not fail
    /// the run. Cancellation returns [`StoryforgeError::Cancelled`] after
    /// settled work has been saved. A store failure stops new work and is
    /// returned as the run's error.
    #[instrument(skip_all, fields(book = %book_id, kind = %self.kind()))]
    pub async fn run(
        &self,
        book_id: &BookId,
        cancel: &CancellationToken,
        progress: Arc<dyn RunProgress>,
        pause: Arc<dyn PauseSignal>,
    ) -> Result<RunSummary> {
        let start = Instant::now();
        let kind = self.kind();
        cancel.check()?;

        let mut entry = self.store.load_chunks(book_id, kind).await?.ok_or_else(|| {
            StoryforgeError::NotFound(format!("{kind} task entry for book {book_id}"))
        })?;

        let recovered = entry.recover_interrupted();
        if recovered > 0 {
            warn!(recovered, "chunks left running by an earlier process marked failed");
        }

        let total = entry.chunks.len();
        let previously_completed = entry.completed_count();
        let runnable: Vec<String> = entry.runnable().map(|c| c.id.clone()).collect();

        let mut summary = RunSummary {
            kind,
            total,
            previously_completed,
            attempted: 0,
            completed: 0,
            failed: 0,
            elapsed: Duration::ZERO,
        };

        if runnable.is_empty() {
            info!(total, "all chunks completed, nothing to do");
            summary.elapsed = start.elapsed();
            progress.finished(&summary);
            return Ok(summary);
        }

        let book = self.store.load_book(book_id).await?;
        entry.status = TaskStatus::Running;
        entry.last_error = None;
        entry.touch();

        info!(
            total,
            previously_completed,
            runnable = runnable.len(),
            llm_pool = self.config.llm_pool_size,
            media_pool = self.config.media_pool_size,
            "starting run"
        );
        progress.started(total, previously_completed, runnable.len());

        let shared = Arc::new(RunShared {
            store: self.store.clone(),
            processor: self.processor.clone(),
            state: tokio::sync::Mutex::new(RunState { book, entry }),
            save_gate: tokio::sync::Mutex::new(()),
            llm_pool: WorkerPool::new("llm", self.config.llm_pool_size),
            ctx: ProcessContext::new(
                WorkerPool::new("media", self.config.media_pool_size),
                cancel.child_token(),
            )
            .with_pause(pause, self.config.pause_poll_interval),
            progress: progress.clone(),
            save_policy: self.config.save_policy,
            cancel: cancel.clone(),
            persist_error: Mutex::new(None),
        });

        // Submitted in source order; completion order is unconstrained.
        let mut handles = Vec::with_capacity(runnable.len());
        for chunk_id in runnable {
            let task = shared.clone();
            let id = chunk_id.clone();
            handles.push((chunk_id, tokio::spawn(async move { task.run_chunk(id).await })));
        }

        for (chunk_id, handle) in handles {
            let settled = match handle.await {
                Ok(settled) => settled,
                Err(e) => {
                    error!(chunk = %chunk_id, error = %e, "chunk task panicked");
                    shared.fail_abandoned(&chunk_id, &e.to_string()).await
                }
            };
            match settled {
                Settled::Completed => summary.completed += 1,
                Settled::Failed => summary.failed += 1,
                Settled::Released | Settled::Skipped => {}
            }
            if settled != Settled::Skipped {
                summary.attempted += 1;
            }
        }

        if let Some(err) = shared.take_persist_error() {
            return Err(err);
        }

        let cancelled = cancel.is_cancelled();
        {
            let mut state = shared.state.lock().await;
            let entry = &mut state.entry;
            entry.status = if cancelled {
                TaskStatus::Cancelled
            } else {
                entry.derive_status()
            };
            entry.last_error =
                (summary.failed > 0).then(|| format!("{} chunk(s) failed", summary.failed));
            entry.touch();
        }
        shared.persist().await?;

        if cancelled {
            info!(
                completed = summary.completed,
                attempted = summary.attempted,
                "run cancelled, settled work saved"
            );
            return Err(StoryforgeError::Cancelled);
        }

        summary.elapsed = start.elapsed();
        info!(
            completed = summary.completed,
            failed = summary.failed,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "run finished"
        );
        progress.finished(&summary);
        Ok(summary)
    }
}

impl RunShared {
    async fn run_chunk(self: Arc<Self>, chunk_id: String) -> Settled {
        let cancel = &self.ctx.cancel;

        // The primary pool bounds how many chunks are in flight.
        let Ok(_slot) = self.llm_pool.acquire(cancel).await else {
            return Settled::Skipped;
        };
        if self.ctx.ready().await.is_err() {
            return Settled::Skipped;
        }

        let prepared = {
            let mut state = self.state.lock().await;
            // Checked under the lock: no chunk starts once cancellation is seen.
            if cancel.is_cancelled() {
                return Settled::Skipped;
            }
            let RunState { book, entry } = &mut *state;
            let Some(chunk) = entry.chunk_mut(&chunk_id) else {
                return Settled::Skipped;
            };
            if let Err(e) = chunk.transition(ChunkStatus::Running) {
                warn!(chunk = %chunk_id, error = %e, "chunk not runnable");
                return Settled::Skipped;
            }
            let snapshot = chunk.clone();
            self.progress.chunk_update(entry.progress(), &snapshot);
            ChunkWork::prepare(book, snapshot)
        };

        let result = match prepared {
            Ok(work) => self.processor.process(&work, &self.ctx).await,
            Err(e) => Err(e),
        };
        self.settle(&chunk_id, result).await
    }

    /// Record a chunk's outcome, report it, and persist if the policy says so.
    async fn settle(&self, chunk_id: &str, result: Result<ChunkOutput>) -> Settled {
        let settled = {
            let mut state = self.state.lock().await;
            let RunState { book, entry } = &mut *state;
            let applied = result.and_then(|output| output.apply(book, chunk_id));

            let Some(chunk) = entry.chunk_mut(chunk_id) else {
                return Settled::Skipped;
            };
            let settled = match applied {
                Ok(artifacts) => match chunk.transition(ChunkStatus::Completed) {
                    Ok(()) => {
                        info!(chunk = %chunk_id, artifacts, "chunk completed");
                        Settled::Completed
                    }
                    Err(e) => {
                        warn!(chunk = %chunk_id, error = %e, "could not complete chunk");
                        Settled::Skipped
                    }
                },
                Err(StoryforgeError::Cancelled) => {
                    chunk.release();
                    Settled::Released
                }
                Err(e) => {
                    warn!(chunk = %chunk_id, error = %e, "chunk failed");
                    if chunk.transition(ChunkStatus::Failed).is_ok() {
                        chunk.last_error = Some(e.to_string());
                    }
                    Settled::Failed
                }
            };

            if !self.cancel.is_cancelled() {
                let snapshot = chunk.clone();
                self.progress.chunk_update(entry.progress(), &snapshot);
            }
            settled
        };

        let should_save = matches!(settled, Settled::Completed | Settled::Failed)
            && self.save_policy == SavePolicy::EveryChunk
            && !self.ctx.cancel.is_cancelled();
        if should_save {
            self.persist_or_halt().await;
        }
        settled
    }

    /// Mark a chunk whose task died as failed.
    async fn fail_abandoned(&self, chunk_id: &str, reason: &str) -> Settled {
        let mut state = self.state.lock().await;
        match state.entry.chunk_mut(chunk_id) {
            Some(chunk) if chunk.status == ChunkStatus::Running => {
                chunk.status = ChunkStatus::Failed;
                chunk.last_error = Some(format!("worker task failed: {reason}"));
                Settled::Failed
            }
            _ => Settled::Skipped,
        }
    }

    /// Write the book and chunk list.
    ///
    /// The gate is taken before the snapshot, so writes land in the order
    /// their snapshots were taken.
    async fn persist(&self) -> Result<()> {
        let _gate = self.save_gate.lock().await;
        let (book, entry) = {
            let state = self.state.lock().await;
            (state.book.clone(), state.entry.clone())
        };
        // Book first: a crash in between re-runs a chunk rather than losing
        // its artifacts.
        self.store.save_book(&book).await?;
        self.store.save_chunks(&entry).await
    }

    /// Persist, or stop all new work and remember why.
    async fn persist_or_halt(&self) {
        if let Err(e) = self.persist().await {
            error!(error = %e, "failed to persist run state, halting run");
            let mut slot = self.persist_error.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_none() {
                *slot = Some(e);
            }
            drop(slot);
            self.ctx.cancel.cancel();
        }
    }

    fn take_persist_error(&self) -> Option<StoryforgeError> {
        self.persist_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }
}
