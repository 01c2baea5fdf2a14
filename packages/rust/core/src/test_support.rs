//! In-crate fakes for the generation backends and the task store.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{LazyLock, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use storyforge_providers::{ChatMessage, GenerationRequest, LanguageModel, MediaGenerator};
use storyforge_shared::{
    Book, BookId, Chapter, Chunk, ChunkStatus, GenerationKind, Line, Result, StoryforgeError,
    TaskEntry,
};
use storyforge_storage::TaskStore;

use crate::orchestrator::RunSummary;
use crate::progress::RunProgress;

type Responder = Box<dyn Fn(&str) -> Result<String> + Send + Sync>;

/// Tracks concurrent calls and their high-water mark.
#[derive(Default)]
pub(crate) struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Gauge {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Language model
// ---------------------------------------------------------------------------

pub(crate) struct FakeLanguageModel {
    responder: Responder,
    delay: Duration,
    calls: AtomicUsize,
    pub gauge: Gauge,
}

impl FakeLanguageModel {
    /// Answer with `f(user_message)`.
    pub fn responding(f: impl Fn(&str) -> Result<String> + Send + Sync + 'static) -> Self {
        Self {
            responder: Box::new(f),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            gauge: Gauge::default(),
        }
    }

    /// Answer with the given replies in order, then fail.
    pub fn scripted(replies: Vec<Result<String>>) -> Self {
        let replies = Mutex::new(VecDeque::from(replies));
        Self::responding(move |_| {
            replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(StoryforgeError::provider("fake-llm", "script exhausted")))
        })
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LanguageModel for FakeLanguageModel {
    fn provider_id(&self) -> &str {
        "fake-llm"
    }

    async fn complete(&self, _system_prompt: &str, messages: &[ChatMessage]) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.gauge.enter();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.gauge.exit();
        let user = messages.last().map(|m| m.content.as_str()).unwrap_or("");
        (self.responder)(user)
    }
}

static SCENE_LINE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^\[([^\]]+)\]").unwrap());
static SCENE_COUNT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Scenes requested: (\d+)").unwrap());
static SOURCE_ID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#""id":"([^"]+)""#).unwrap());

/// A well-formed scene reply for a scene request, anchored on its lines.
pub(crate) fn scene_reply(user: &str) -> Result<String> {
    let ids: Vec<&str> = SCENE_LINE_RE
        .captures_iter(user)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect();
    let count: usize = SCENE_COUNT_RE
        .captures(user)
        .and_then(|c| c[1].parse().ok())
        .unwrap_or(1);
    let scenes: Vec<serde_json::Value> = (0..count)
        .map(|i| {
            let line_id = ids.get(i % ids.len().max(1)).copied().unwrap_or("");
            serde_json::json!({
                "line_id": line_id,
                "description": format!("scene {i}"),
                "prompt": format!("illustration of {line_id}"),
            })
        })
        .collect();
    Ok(format!(
        "Here you go:\n```json\n{}\n```",
        serde_json::json!({ "scenes": scenes })
    ))
}

/// A complete translation reply for a translation request.
pub(crate) fn translation_reply(user: &str) -> Result<String> {
    let translations: Vec<serde_json::Value> = SOURCE_ID_RE
        .captures_iter(user)
        .map(|c| serde_json::json!({ "id": &c[1], "text": format!("[fr] {}", &c[1]) }))
        .collect();
    Ok(serde_json::json!({ "translations": translations }).to_string())
}

// ---------------------------------------------------------------------------
// Media
// ---------------------------------------------------------------------------

pub(crate) struct FakeMedia {
    delay: Duration,
    fail_prompts_containing: Option<String>,
    calls: AtomicUsize,
    pub gauge: Gauge,
}

impl FakeMedia {
    pub fn new() -> Self {
        Self {
            delay: Duration::ZERO,
            fail_prompts_containing: None,
            calls: AtomicUsize::new(0),
            gauge: Gauge::default(),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing_on(mut self, needle: &str) -> Self {
        self.fail_prompts_containing = Some(needle.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaGenerator for FakeMedia {
    fn provider_id(&self) -> &str {
        "fake-media"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<PathBuf>> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        self.gauge.enter();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.gauge.exit();
        if let Some(needle) = &self.fail_prompts_containing {
            if request.prompt.contains(needle.as_str()) {
                return Err(StoryforgeError::provider("fake-media", "HTTP 500"));
            }
        }
        let stem = request
            .output_stem
            .clone()
            .unwrap_or_else(|| format!("fake-{n}"));
        Ok((0..request.count)
            .map(|i| request.output_dir.join(format!("{stem}-{i}.png")))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct MemoryStore {
    books: Mutex<HashMap<BookId, Book>>,
    entries: Mutex<HashMap<(BookId, GenerationKind), TaskEntry>>,
    saves: AtomicUsize,
    pub fail_saves: AtomicBool,
    /// Overlapping `save_book` / `save_chunks` calls.
    pub writes: Gauge,
}

impl MemoryStore {
    pub fn with(book: &Book, entry: Option<&TaskEntry>) -> Self {
        let store = Self::default();
        store.books.lock().unwrap().insert(book.id.clone(), book.clone());
        if let Some(entry) = entry {
            store
                .entries
                .lock()
                .unwrap()
                .insert((entry.book_id.clone(), entry.kind), entry.clone());
        }
        store
    }

    pub fn book(&self, id: &BookId) -> Book {
        self.books.lock().unwrap()[id].clone()
    }

    pub fn entry(&self, id: &BookId, kind: GenerationKind) -> TaskEntry {
        self.entries.lock().unwrap()[&(id.clone(), kind)].clone()
    }

    /// Book and chunk writes combined.
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn load_book(&self, id: &BookId) -> Result<Book> {
        self.books
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| StoryforgeError::NotFound(format!("book {id}")))
    }

    async fn load_chunks(&self, id: &BookId, kind: GenerationKind) -> Result<Option<TaskEntry>> {
        Ok(self.entries.lock().unwrap().get(&(id.clone(), kind)).cloned())
    }

    async fn save_book(&self, book: &Book) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoryforgeError::Storage("disk full".into()));
        }
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.writes.enter();
        // Give a concurrent writer the chance to overlap.
        tokio::task::yield_now().await;
        self.books.lock().unwrap().insert(book.id.clone(), book.clone());
        self.writes.exit();
        Ok(())
    }

    async fn save_chunks(&self, entry: &TaskEntry) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoryforgeError::Storage("disk full".into()));
        }
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.writes.enter();
        // Give a concurrent writer the chance to overlap.
        tokio::task::yield_now().await;
        self.entries
            .lock()
            .unwrap()
            .insert((entry.book_id.clone(), entry.kind), entry.clone());
        self.writes.exit();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct RecordingProgress {
    pub updates: Mutex<Vec<(f64, String, ChunkStatus)>>,
    pub finished: Mutex<Option<RunSummary>>,
}

impl RunProgress for RecordingProgress {
    fn started(&self, _total: usize, _already_completed: usize, _runnable: usize) {}

    fn chunk_update(&self, fraction: f64, chunk: &Chunk) {
        self.updates
            .lock()
            .unwrap()
            .push((fraction, chunk.id.clone(), chunk.status));
    }

    fn finished(&self, summary: &RunSummary) {
        *self.finished.lock().unwrap() = Some(summary.clone());
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// A book with one chapter per entry of `lines_per_chapter`.
pub(crate) fn book_with_chapters(lines_per_chapter: &[usize]) -> Book {
    let chapters = lines_per_chapter
        .iter()
        .enumerate()
        .map(|(c, &n)| Chapter {
            id: format!("ch{c}"),
            title: Some(format!("Chapter {c}")),
            lines: (0..n)
                .map(|l| Line::new(format!("ch{c}-{l}"), format!("Line {l} of chapter {c}.")))
                .collect(),
        })
        .collect();
    Book::new("Fixture", chapters)
}

/// One single-line chunk per line of chapter `ch0`.
pub(crate) fn line_chunks(book: &Book, units: Option<u32>) -> Vec<Chunk> {
    book.chapters[0]
        .lines
        .iter()
        .enumerate()
        .map(|(i, line)| Chunk::new(format!("ch0#{i}"), "ch0", &line.id, &line.id, units))
        .collect()
}
