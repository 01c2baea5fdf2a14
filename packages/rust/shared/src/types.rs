//! Core domain types: the book tree, chunks, and per-kind task entries.

use std::collections::HashSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, StoryforgeError};

// ---------------------------------------------------------------------------
// BookId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for book identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BookId(pub Uuid);

impl BookId {
    /// Generate a new time-sortable book identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for BookId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BookId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for BookId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// Book tree
// ---------------------------------------------------------------------------

/// A book: an ordered list of chapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Book {
    /// Unique identifier for this book.
    #[serde(default)]
    pub id: BookId,
    /// Display title.
    pub title: String,
    /// Chapters in reading order.
    pub chapters: Vec<Chapter>,
}

/// A chapter: an ordered list of lines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chapter {
    /// Stable chapter identifier, unique within the book.
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub lines: Vec<Line>,
}

/// A single line of text with its generated artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Line {
    /// Stable line identifier, unique within the book.
    pub id: String,
    pub text: String,
    /// Illustrations anchored to this line.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub illustrations: Vec<Illustration>,
    /// Translated text, once produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translation: Option<String>,
}

impl Line {
    /// Create a line with no artifacts.
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            illustrations: Vec::new(),
            translation: None,
        }
    }
}

/// Scene metadata returned by the language model for one illustration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    /// Line the scene is anchored to.
    pub line_id: String,
    /// Human-readable description of the scene.
    #[serde(default)]
    pub description: String,
    /// Prompt sent to the media backend.
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
}

/// Generated media attached to a line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Illustration {
    /// Chunk that produced this artifact.
    pub chunk_id: String,
    /// Output files written by the media backend.
    pub paths: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scene: Option<Scene>,
}

impl Chapter {
    /// Total number of characters across all lines.
    pub fn char_count(&self) -> usize {
        self.lines.iter().map(|l| l.text.chars().count()).sum()
    }
}

impl Book {
    /// Create a book with a fresh identifier.
    pub fn new(title: impl Into<String>, chapters: Vec<Chapter>) -> Self {
        Self {
            id: BookId::new(),
            title: title.into(),
            chapters,
        }
    }

    /// Check that chapter ids and line ids are unique.
    pub fn validate(&self) -> Result<()> {
        let mut chapter_ids = HashSet::new();
        let mut line_ids = HashSet::new();
        for chapter in &self.chapters {
            if !chapter_ids.insert(chapter.id.as_str()) {
                return Err(StoryforgeError::validation(format!(
                    "duplicate chapter id '{}'",
                    chapter.id
                )));
            }
            for line in &chapter.lines {
                if !line_ids.insert(line.id.as_str()) {
                    return Err(StoryforgeError::validation(format!(
                        "duplicate line id '{}'",
                        line.id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Look up a chapter by id.
    pub fn chapter(&self, chapter_id: &str) -> Option<&Chapter> {
        self.chapters.iter().find(|c| c.id == chapter_id)
    }

    /// The contiguous lines covered by a chunk.
    pub fn chunk_lines(&self, chunk: &Chunk) -> Result<&[Line]> {
        let chapter = self.chapter(&chunk.chapter_id).ok_or_else(|| {
            StoryforgeError::NotFound(format!("chapter '{}'", chunk.chapter_id))
        })?;
        let position = |line_id: &str| {
            chapter
                .lines
                .iter()
                .position(|l| l.id == line_id)
                .ok_or_else(|| StoryforgeError::NotFound(format!("line '{line_id}'")))
        };
        let start = position(&chunk.start_line_id)?;
        let end = position(&chunk.end_line_id)?;
        if start > end {
            return Err(StoryforgeError::validation(format!(
                "chunk {} has start line after end line",
                chunk.id
            )));
        }
        Ok(&chapter.lines[start..=end])
    }

    fn line_mut(&mut self, line_id: &str) -> Result<&mut Line> {
        self.chapters
            .iter_mut()
            .flat_map(|c| c.lines.iter_mut())
            .find(|l| l.id == line_id)
            .ok_or_else(|| StoryforgeError::NotFound(format!("line '{line_id}'")))
    }

    /// Attach generated media to a line.
    pub fn attach_illustration(&mut self, line_id: &str, illustration: Illustration) -> Result<()> {
        self.line_mut(line_id)?.illustrations.push(illustration);
        Ok(())
    }

    /// Remove every illustration produced by `chunk_id`. Returns the count.
    pub fn detach_illustrations(&mut self, chunk_id: &str) -> usize {
        let mut removed = 0;
        for line in self.chapters.iter_mut().flat_map(|c| c.lines.iter_mut()) {
            let before = line.illustrations.len();
            line.illustrations.retain(|i| i.chunk_id != chunk_id);
            removed += before - line.illustrations.len();
        }
        removed
    }

    /// Attach translated text to a line, replacing any previous translation.
    pub fn attach_translation(&mut self, line_id: &str, text: impl Into<String>) -> Result<()> {
        self.line_mut(line_id)?.translation = Some(text.into());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Generation kinds
// ---------------------------------------------------------------------------

/// The kind of content a task entry generates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationKind {
    /// N independent media items per chunk.
    Illustration,
    /// One language-model result per chunk.
    Translation,
}

impl GenerationKind {
    /// Storage key for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Illustration => "illustration",
            Self::Translation => "translation",
        }
    }

    /// Whether chunks of this kind carry a per-chapter unit budget.
    pub fn uses_units(&self) -> bool {
        matches!(self, Self::Illustration)
    }
}

impl std::fmt::Display for GenerationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for GenerationKind {
    type Err = StoryforgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "illustration" => Ok(Self::Illustration),
            "translation" => Ok(Self::Translation),
            other => Err(StoryforgeError::validation(format!(
                "unknown generation kind '{other}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Chunk
// ---------------------------------------------------------------------------

/// Lifecycle state of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ChunkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Allowed moves: `{pending, failed} -> running -> {completed, failed}`.
    pub fn can_transition_to(&self, next: ChunkStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending | Self::Failed, Self::Running)
                | (Self::Running, Self::Completed | Self::Failed)
        )
    }
}

impl std::str::FromStr for ChunkStatus {
    type Err = StoryforgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(StoryforgeError::validation(format!(
                "unknown chunk status '{other}'"
            ))),
        }
    }
}

/// A bounded, contiguous line range within one chapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Deterministic identifier (`{chapter_id}#{index}`).
    pub id: String,
    pub chapter_id: String,
    pub start_line_id: String,
    pub end_line_id: String,
    pub status: ChunkStatus,
    /// Units allocated to this chunk; absent for whole-chunk kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units_to_generate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Number of times the chunk has been moved to `running`.
    #[serde(default)]
    pub attempts: u32,
}

impl Chunk {
    /// Create a pending chunk.
    pub fn new(
        id: impl Into<String>,
        chapter_id: impl Into<String>,
        start_line_id: impl Into<String>,
        end_line_id: impl Into<String>,
        units_to_generate: Option<u32>,
    ) -> Self {
        Self {
            id: id.into(),
            chapter_id: chapter_id.into(),
            start_line_id: start_line_id.into(),
            end_line_id: end_line_id.into(),
            status: ChunkStatus::Pending,
            units_to_generate,
            last_error: None,
            attempts: 0,
        }
    }

    /// Whether a run should submit this chunk.
    pub fn is_runnable(&self) -> bool {
        matches!(self.status, ChunkStatus::Pending | ChunkStatus::Failed)
    }

    /// Move to `next`, rejecting transitions that would go backwards.
    pub fn transition(&mut self, next: ChunkStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(StoryforgeError::validation(format!(
                "chunk {}: illegal transition {} -> {}",
                self.id,
                self.status.as_str(),
                next.as_str()
            )));
        }
        if next == ChunkStatus::Running {
            self.attempts += 1;
            self.last_error = None;
        }
        self.status = next;
        Ok(())
    }

    /// Hand a `running` chunk back to `pending` after a cancelled attempt.
    ///
    /// The attempt counter is kept. Chunks in any other state are untouched.
    pub fn release(&mut self) -> bool {
        if self.status != ChunkStatus::Running {
            return false;
        }
        self.status = ChunkStatus::Pending;
        true
    }
}

// ---------------------------------------------------------------------------
// TaskEntry
// ---------------------------------------------------------------------------

/// Aggregate status of a task entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Idle,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = StoryforgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "idle" => Ok(Self::Idle),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(StoryforgeError::validation(format!(
                "unknown task status '{other}'"
            ))),
        }
    }
}

/// A book's chunk list for one generation kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEntry {
    pub book_id: BookId,
    pub kind: GenerationKind,
    pub status: TaskStatus,
    pub chunks: Vec<Chunk>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl TaskEntry {
    /// Create an idle entry over freshly split chunks.
    pub fn new(book_id: BookId, kind: GenerationKind, chunks: Vec<Chunk>) -> Self {
        let now = Utc::now();
        Self {
            book_id,
            kind,
            status: TaskStatus::Idle,
            chunks,
            created_at: now,
            updated_at: now,
            last_error: None,
        }
    }

    /// Number of chunks in `completed` state.
    pub fn completed_count(&self) -> usize {
        self.chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Completed)
            .count()
    }

    /// Fraction of chunks completed, `1.0` for an empty entry.
    pub fn progress(&self) -> f64 {
        if self.chunks.is_empty() {
            return 1.0;
        }
        self.completed_count() as f64 / self.chunks.len() as f64
    }

    /// Chunks a run should submit, in source order.
    pub fn runnable(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.iter().filter(|c| c.is_runnable())
    }

    pub fn chunk_mut(&mut self, chunk_id: &str) -> Option<&mut Chunk> {
        self.chunks.iter_mut().find(|c| c.id == chunk_id)
    }

    /// Demote chunks left `running` by a killed process to `failed`.
    ///
    /// Returns the number of chunks demoted.
    pub fn recover_interrupted(&mut self) -> usize {
        let mut recovered = 0;
        for chunk in &mut self.chunks {
            if chunk.status == ChunkStatus::Running {
                chunk.status = ChunkStatus::Failed;
                chunk.last_error = Some("interrupted".into());
                recovered += 1;
            }
        }
        recovered
    }

    /// Move every `failed` chunk back to `pending`. Returns the count.
    pub fn reset_failed(&mut self) -> usize {
        let mut reset = 0;
        for chunk in &mut self.chunks {
            if chunk.status == ChunkStatus::Failed {
                chunk.status = ChunkStatus::Pending;
                chunk.last_error = None;
                reset += 1;
            }
        }
        reset
    }

    /// Aggregate status computed from the chunk list.
    pub fn derive_status(&self) -> TaskStatus {
        if self.chunks.iter().any(|c| c.status == ChunkStatus::Running) {
            TaskStatus::Running
        } else if self.chunks.iter().all(|c| c.status == ChunkStatus::Completed) {
            TaskStatus::Completed
        } else if self.chunks.iter().any(|c| c.status == ChunkStatus::Failed) {
            TaskStatus::Failed
        } else {
            TaskStatus::Idle
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_book() -> Book {
        Book::new(
            "Sample",
            vec![Chapter {
                id: "c1".into(),
                title: Some("One".into()),
                lines: vec![Line::new("l1", "Hello"), Line::new("l2", "World"), Line::new("l3", "!")],
            }],
        )
    }

    #[test]
    fn book_id_roundtrip() {
        let id = BookId::new();
        let parsed: BookId = id.to_string().parse().expect("parse BookId");
        assert_eq!(id, parsed);
    }

    #[test]
    fn chunk_lines_returns_inclusive_range() {
        let book = sample_book();
        let chunk = Chunk::new("c1#0", "c1", "l2", "l3", None);
        let lines = book.chunk_lines(&chunk).expect("lines");
        let ids: Vec<&str> = lines.iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, ["l2", "l3"]);
    }

    #[test]
    fn chunk_lines_rejects_reversed_range() {
        let book = sample_book();
        let chunk = Chunk::new("c1#0", "c1", "l3", "l1", None);
        assert!(book.chunk_lines(&chunk).is_err());
    }

    #[test]
    fn attach_to_unknown_line_fails() {
        let mut book = sample_book();
        let err = book.attach_translation("nope", "x").unwrap_err();
        assert!(matches!(err, StoryforgeError::NotFound(_)));

        book.attach_translation("l1", "Bonjour").expect("attach");
        assert_eq!(book.chapters[0].lines[0].translation.as_deref(), Some("Bonjour"));
    }

    #[test]
    fn validate_rejects_duplicate_lines() {
        let mut book = sample_book();
        book.chapters[0].lines.push(Line::new("l1", "dup"));
        assert!(book.validate().is_err());
    }

    #[test]
    fn status_transitions_are_monotonic() {
        let mut chunk = Chunk::new("c1#0", "c1", "l1", "l1", Some(1));
        assert!(chunk.transition(ChunkStatus::Completed).is_err());
        chunk.transition(ChunkStatus::Running).expect("pending -> running");
        assert_eq!(chunk.attempts, 1);
        chunk.transition(ChunkStatus::Failed).expect("running -> failed");
        chunk.transition(ChunkStatus::Running).expect("failed -> running");
        chunk.transition(ChunkStatus::Completed).expect("running -> completed");
        assert!(chunk.transition(ChunkStatus::Running).is_err());
        assert_eq!(chunk.attempts, 2);
    }

    #[test]
    fn release_only_affects_running_chunks() {
        let mut chunk = Chunk::new("c1#0", "c1", "l1", "l1", None);
        assert!(!chunk.release());
        chunk.transition(ChunkStatus::Running).unwrap();
        assert!(chunk.release());
        assert_eq!(chunk.status, ChunkStatus::Pending);
        assert_eq!(chunk.attempts, 1);
    }

    #[test]
    fn detach_removes_only_that_chunks_artifacts() {
        let mut book = sample_book();
        for chunk_id in ["c1#0", "c1#0", "c1#1"] {
            book.attach_illustration(
                "l1",
                Illustration {
                    chunk_id: chunk_id.into(),
                    paths: vec![PathBuf::from("/tmp/x.png")],
                    scene: None,
                },
            )
            .unwrap();
        }
        assert_eq!(book.detach_illustrations("c1#0"), 2);
        assert_eq!(book.chapters[0].lines[0].illustrations.len(), 1);
        assert_eq!(book.chapters[0].lines[0].illustrations[0].chunk_id, "c1#1");
    }

    #[test]
    fn task_entry_progress_and_recovery() {
        let mut chunks = vec![
            Chunk::new("a", "c1", "l1", "l1", None),
            Chunk::new("b", "c1", "l2", "l2", None),
            Chunk::new("c", "c1", "l3", "l3", None),
        ];
        chunks[0].status = ChunkStatus::Completed;
        chunks[1].status = ChunkStatus::Running;
        let mut entry = TaskEntry::new(BookId::new(), GenerationKind::Translation, chunks);

        assert!((entry.progress() - 1.0 / 3.0).abs() < f64::EPSILON);
        assert_eq!(entry.derive_status(), TaskStatus::Running);

        assert_eq!(entry.recover_interrupted(), 1);
        assert_eq!(entry.chunks[1].status, ChunkStatus::Failed);
        assert_eq!(entry.runnable().count(), 2);
        assert_eq!(entry.derive_status(), TaskStatus::Failed);

        assert_eq!(entry.reset_failed(), 1);
        assert_eq!(entry.derive_status(), TaskStatus::Idle);
    }

    #[test]
    fn kind_parsing() {
        assert_eq!("illustration".parse::<GenerationKind>().unwrap(), GenerationKind::Illustration);
        assert!("video".parse::<GenerationKind>().is_err());
        assert!(GenerationKind::Illustration.uses_units());
        assert!(!GenerationKind::Translation.uses_units());
    }

    #[test]
    fn book_json_roundtrip_keeps_artifacts() {
        let mut book = sample_book();
        book.attach_illustration(
            "l2",
            Illustration {
                chunk_id: "c1#0".into(),
                paths: vec![PathBuf::from("/tmp/a.png")],
                scene: None,
            },
        )
        .unwrap();
        let json = serde_json::to_string(&book).expect("serialize");
        let parsed: Book = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed.chapters[0].lines[1].illustrations.len(), 1);
        assert!(parsed.chapters[0].lines[0].illustrations.is_empty());
    }
}
