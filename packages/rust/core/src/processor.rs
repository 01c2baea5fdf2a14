//! The kind-specific half of a chunk run.
//!
//! The orchestrator owns scheduling and status; a [`ChunkProcessor`] turns
//! one chunk's lines into artifacts. Processors never touch the shared
//! book: they work on a snapshot and hand back a [`ChunkOutput`] that the
//! orchestrator applies under its lock.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use storyforge_providers::{ChatMessage, LanguageModel};
use storyforge_scheduler::{
    CancellationToken, PauseSignal, RateLimiter, WorkerPool, wait_while_paused,
};
use storyforge_shared::{Book, BookId, Chunk, GenerationKind, Illustration, Line, Result};

/// Request-and-parse attempts before malformed output is terminal.
pub const PARSE_ATTEMPTS: u32 = 2;

/// Everything a processor needs to know about one chunk.
#[derive(Debug, Clone)]
pub struct ChunkWork {
    pub book_id: BookId,
    pub chunk: Chunk,
    pub chapter_title: Option<String>,
    pub lines: Vec<Line>,
}

impl ChunkWork {
    /// Snapshot the chunk's lines out of the book.
    pub fn prepare(book: &Book, chunk: Chunk) -> Result<Self> {
        let lines = book.chunk_lines(&chunk)?.to_vec();
        let chapter_title = book
            .chapter(&chunk.chapter_id)
            .and_then(|c| c.title.clone());
        Ok(Self {
            book_id: book.id.clone(),
            chunk,
            chapter_title,
            lines,
        })
    }

    pub fn contains_line(&self, line_id: &str) -> bool {
        self.lines.iter().any(|l| l.id == line_id)
    }
}

/// Shared run resources handed to every processor call.
#[derive(Clone)]
pub struct ProcessContext {
    /// Pool bounding concurrent media calls across the whole run.
    pub media_pool: WorkerPool,
    pub cancel: CancellationToken,
    pause: Arc<dyn PauseSignal>,
    pause_poll: Duration,
}

impl ProcessContext {
    /// A context that is never paused.
    pub fn new(media_pool: WorkerPool, cancel: CancellationToken) -> Self {
        Self {
            media_pool,
            cancel,
            pause: Arc::new(|| false),
            pause_poll: Duration::from_secs(1),
        }
    }

    pub fn with_pause(mut self, pause: Arc<dyn PauseSignal>, poll: Duration) -> Self {
        self.pause = pause;
        self.pause_poll = poll;
        self
    }

    /// Wait out a pause, then fail if the run was cancelled meanwhile.
    ///
    /// Called before every network call, so a paused chunk holds before
    /// issuing anything.
    pub async fn ready(&self) -> Result<()> {
        wait_while_paused(self.pause.as_ref(), &self.cancel, self.pause_poll).await?;
        Ok(())
    }
}

/// Artifacts produced for one chunk, keyed by line id.
#[derive(Debug, Clone)]
pub enum ChunkOutput {
    Illustrations(Vec<(String, Illustration)>),
    Translations(Vec<(String, String)>),
}

impl ChunkOutput {
    /// Number of artifacts.
    pub fn len(&self) -> usize {
        match self {
            Self::Illustrations(items) => items.len(),
            Self::Translations(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write the artifacts into the book.
    ///
    /// Illustrations from an earlier attempt of the same chunk are replaced,
    /// never duplicated.
    pub fn apply(self, book: &mut Book, chunk_id: &str) -> Result<usize> {
        let count = self.len();
        match self {
            Self::Illustrations(items) => {
                book.detach_illustrations(chunk_id);
                for (line_id, illustration) in items {
                    book.attach_illustration(&line_id, illustration)?;
                }
            }
            Self::Translations(items) => {
                for (line_id, text) in items {
                    book.attach_translation(&line_id, text)?;
                }
            }
        }
        Ok(count)
    }
}

/// Kind-specific chunk processing.
#[async_trait]
pub trait ChunkProcessor: Send + Sync {
    fn kind(&self) -> GenerationKind;

    /// Produce the chunk's artifacts.
    ///
    /// Returns [`StoryforgeError::Cancelled`](storyforge_shared::StoryforgeError::Cancelled)
    /// when cancellation stopped the chunk before it produced anything.
    async fn process(&self, work: &ChunkWork, ctx: &ProcessContext) -> Result<ChunkOutput>;
}

/// Ask the language model and parse its reply, retrying once on malformed output.
///
/// Provider errors are not retried here. Each attempt waits out any pause
/// and takes its own rate-limit token.
pub(crate) async fn complete_parsed<T, F>(
    model: &dyn LanguageModel,
    limiter: &RateLimiter,
    ctx: &ProcessContext,
    system_prompt: &str,
    messages: &[ChatMessage],
    parse: F,
) -> Result<T>
where
    T: Send,
    F: Fn(&str) -> Result<T> + Send + Sync,
{
    let mut attempt = 1;
    loop {
        ctx.ready().await?;
        limiter.acquire(&ctx.cancel).await?;
        let reply = model.complete(system_prompt, messages).await?;
        match parse(&reply) {
            Ok(parsed) => return Ok(parsed),
            Err(e) if e.is_retryable_parse() && attempt < PARSE_ATTEMPTS => {
                warn!(
                    provider = model.provider_id(),
                    attempt,
                    error = %e,
                    "unusable model output, retrying"
                );
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
