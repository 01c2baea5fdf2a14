//! Turso Embedded / libSQL storage layer (offline mode).
//!
//! The [`Storage`] struct wraps a libSQL database holding book trees and
//! the per-kind task entries (chunk lists) that make runs resumable.
//!
//! The orchestrator only depends on the [`TaskStore`] trait, so tests can
//! swap in an in-memory store.

mod migrations;

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database, params};
use tracing::{debug, instrument};

use storyforge_shared::{
    Book, BookId, Chunk, ChunkStatus, GenerationKind, Result, StoryforgeError, TaskEntry,
};

// ---------------------------------------------------------------------------
// TaskStore
// ---------------------------------------------------------------------------

/// Persistence boundary used by the orchestrator.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Load a book tree. Missing books are a [`StoryforgeError::NotFound`].
    async fn load_book(&self, id: &BookId) -> Result<Book>;

    /// Load the task entry for `(book, kind)`, if one has been split.
    async fn load_chunks(&self, id: &BookId, kind: GenerationKind) -> Result<Option<TaskEntry>>;

    /// Persist a book tree with its attached artifacts.
    async fn save_book(&self, book: &Book) -> Result<()>;

    /// Persist a task entry, replacing its chunk list.
    async fn save_chunks(&self, entry: &TaskEntry) -> Result<()>;
}

/// Listing row for a stored book.
#[derive(Debug, Clone)]
pub struct BookSummary {
    pub id: BookId,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    _db: Database,
    conn: Connection,
    readonly: bool,
}

fn storage_err(e: impl std::fmt::Display) -> StoryforgeError {
    StoryforgeError::Storage(e.to_string())
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoryforgeError::Storage(format!("invalid date '{s}': {e}")))
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoryforgeError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .await
            .map_err(storage_err)?;

        let storage = Self {
            _db: db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` for inspection only.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(StoryforgeError::NotFound(format!(
                "database {}",
                path.display()
            )));
        }
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        Ok(Self {
            _db: db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        StoryforgeError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Current schema version, or 0 before the first migration.
    async fn schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => match rows.next().await {
                Ok(Some(row)) => row.get::<u32>(0).unwrap_or(0),
                _ => 0,
            },
            Err(_) => 0, // table doesn't exist yet
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(StoryforgeError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Book operations
    // -----------------------------------------------------------------------

    /// Insert or replace a book tree.
    #[instrument(skip_all, fields(book = %book.id))]
    pub async fn save_book(&self, book: &Book) -> Result<()> {
        self.check_writable()?;
        let tree_json = serde_json::to_string(book).map_err(storage_err)?;
        let now = Utc::now().to_rfc3339();
        let id = book.id.to_string();
        self.conn
            .execute(
                "INSERT INTO books (id, title, tree_json, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                   title = excluded.title,
                   tree_json = excluded.tree_json,
                   updated_at = excluded.updated_at",
                params![id.as_str(), book.title.as_str(), tree_json.as_str(), now.as_str()],
            )
            .await
            .map_err(storage_err)?;
        debug!(bytes = tree_json.len(), "book saved");
        Ok(())
    }

    /// Load a book tree by id.
    pub async fn load_book(&self, id: &BookId) -> Result<Book> {
        let mut rows = self
            .conn
            .query(
                "SELECT tree_json FROM books WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(storage_err)?;

        let row = rows
            .next()
            .await
            .map_err(storage_err)?
            .ok_or_else(|| StoryforgeError::NotFound(format!("book {id}")))?;
        let tree_json: String = row.get(0).map_err(storage_err)?;
        let mut book: Book = serde_json::from_str(&tree_json)
            .map_err(|e| StoryforgeError::Storage(format!("corrupt book tree for {id}: {e}")))?;
        // The row key is authoritative.
        book.id = id.clone();
        Ok(book)
    }

    /// List stored books, most recently updated first.
    pub async fn list_books(&self) -> Result<Vec<BookSummary>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, title, created_at, updated_at FROM books ORDER BY updated_at DESC",
                params![],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let id: String = row.get(0).map_err(storage_err)?;
            let created_at: String = row.get(2).map_err(storage_err)?;
            let updated_at: String = row.get(3).map_err(storage_err)?;
            results.push(BookSummary {
                id: id
                    .parse()
                    .map_err(|e| StoryforgeError::Storage(format!("invalid book id '{id}': {e}")))?,
                title: row.get(1).map_err(storage_err)?,
                created_at: parse_time(&created_at)?,
                updated_at: parse_time(&updated_at)?,
            });
        }
        Ok(results)
    }

    /// Delete a book with all its task entries. Returns whether it existed.
    pub async fn delete_book(&self, id: &BookId) -> Result<bool> {
        self.check_writable()?;
        let id = id.to_string();
        let tx = self.conn.transaction().await.map_err(storage_err)?;
        tx.execute("DELETE FROM chunks WHERE book_id = ?1", params![id.as_str()])
            .await
            .map_err(storage_err)?;
        tx.execute(
            "DELETE FROM task_entries WHERE book_id = ?1",
            params![id.as_str()],
        )
        .await
        .map_err(storage_err)?;
        let deleted = tx
            .execute("DELETE FROM books WHERE id = ?1", params![id.as_str()])
            .await
            .map_err(storage_err)?;
        tx.commit().await.map_err(storage_err)?;
        Ok(deleted > 0)
    }

    // -----------------------------------------------------------------------
    // Task entry operations
    // -----------------------------------------------------------------------

    /// Write a task entry and replace its chunk list in one transaction.
    #[instrument(skip_all, fields(book = %entry.book_id, kind = %entry.kind, chunks = entry.chunks.len()))]
    pub async fn save_task_entry(&self, entry: &TaskEntry) -> Result<()> {
        self.check_writable()?;
        let book_id = entry.book_id.to_string();
        let kind = entry.kind.as_str();

        let tx = self.conn.transaction().await.map_err(storage_err)?;
        tx.execute(
            "INSERT INTO task_entries (book_id, kind, status, created_at, updated_at, last_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(book_id, kind) DO UPDATE SET
               status = excluded.status,
               updated_at = excluded.updated_at,
               last_error = excluded.last_error",
            params![
                book_id.as_str(),
                kind,
                entry.status.as_str(),
                entry.created_at.to_rfc3339(),
                entry.updated_at.to_rfc3339(),
                entry.last_error.as_deref(),
            ],
        )
        .await
        .map_err(storage_err)?;

        tx.execute(
            "DELETE FROM chunks WHERE book_id = ?1 AND kind = ?2",
            params![book_id.as_str(), kind],
        )
        .await
        .map_err(storage_err)?;

        for (seq, chunk) in entry.chunks.iter().enumerate() {
            tx.execute(
                "INSERT INTO chunks (book_id, kind, seq, id, chapter_id, start_line_id, end_line_id,
                                     status, units, last_error, attempts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    book_id.as_str(),
                    kind,
                    seq as i64,
                    chunk.id.as_str(),
                    chunk.chapter_id.as_str(),
                    chunk.start_line_id.as_str(),
                    chunk.end_line_id.as_str(),
                    chunk.status.as_str(),
                    chunk.units_to_generate.map(i64::from),
                    chunk.last_error.as_deref(),
                    i64::from(chunk.attempts),
                ],
            )
            .await
            .map_err(storage_err)?;
        }

        tx.commit().await.map_err(storage_err)?;
        Ok(())
    }

    /// Load the task entry for `(book, kind)` with its chunks in order.
    pub async fn load_task_entry(
        &self,
        book_id: &BookId,
        kind: GenerationKind,
    ) -> Result<Option<TaskEntry>> {
        let id = book_id.to_string();
        let mut rows = self
            .conn
            .query(
                "SELECT status, created_at, updated_at, last_error
                 FROM task_entries WHERE book_id = ?1 AND kind = ?2",
                params![id.as_str(), kind.as_str()],
            )
            .await
            .map_err(storage_err)?;

        let Some(row) = rows.next().await.map_err(storage_err)? else {
            return Ok(None);
        };
        let status: String = row.get(0).map_err(storage_err)?;
        let created_at: String = row.get(1).map_err(storage_err)?;
        let updated_at: String = row.get(2).map_err(storage_err)?;
        let last_error = row.get::<String>(3).ok();

        let mut rows = self
            .conn
            .query(
                "SELECT id, chapter_id, start_line_id, end_line_id, status, units, last_error, attempts
                 FROM chunks WHERE book_id = ?1 AND kind = ?2 ORDER BY seq",
                params![id.as_str(), kind.as_str()],
            )
            .await
            .map_err(storage_err)?;

        let mut chunks = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            chunks.push(row_to_chunk(&row)?);
        }

        Ok(Some(TaskEntry {
            book_id: book_id.clone(),
            kind,
            status: status.parse()?,
            chunks,
            created_at: parse_time(&created_at)?,
            updated_at: parse_time(&updated_at)?,
            last_error,
        }))
    }

    /// Drop the task entry for `(book, kind)` so the next run re-splits.
    pub async fn delete_task_entry(&self, book_id: &BookId, kind: GenerationKind) -> Result<bool> {
        self.check_writable()?;
        let id = book_id.to_string();
        let tx = self.conn.transaction().await.map_err(storage_err)?;
        tx.execute(
            "DELETE FROM chunks WHERE book_id = ?1 AND kind = ?2",
            params![id.as_str(), kind.as_str()],
        )
        .await
        .map_err(storage_err)?;
        let deleted = tx
            .execute(
                "DELETE FROM task_entries WHERE book_id = ?1 AND kind = ?2",
                params![id.as_str(), kind.as_str()],
            )
            .await
            .map_err(storage_err)?;
        tx.commit().await.map_err(storage_err)?;
        Ok(deleted > 0)
    }
}

/// Convert a `chunks` row to a [`Chunk`].
fn row_to_chunk(row: &libsql::Row) -> Result<Chunk> {
    let status: String = row.get(4).map_err(storage_err)?;
    Ok(Chunk {
        id: row.get(0).map_err(storage_err)?,
        chapter_id: row.get(1).map_err(storage_err)?,
        start_line_id: row.get(2).map_err(storage_err)?,
        end_line_id: row.get(3).map_err(storage_err)?,
        status: status.parse::<ChunkStatus>()?,
        units_to_generate: row.get::<i64>(5).ok().map(|v| v as u32),
        last_error: row.get::<String>(6).ok(),
        attempts: row.get::<i64>(7).map(|v| v as u32).unwrap_or(0),
    })
}

#[async_trait]
impl TaskStore for Storage {
    async fn load_book(&self, id: &BookId) -> Result<Book> {
        Storage::load_book(self, id).await
    }

    async fn load_chunks(&self, id: &BookId, kind: GenerationKind) -> Result<Option<TaskEntry>> {
        self.load_task_entry(id, kind).await
    }

    async fn save_book(&self, book: &Book) -> Result<()> {
        Storage::save_book(self, book).await
    }

    async fn save_chunks(&self, entry: &TaskEntry) -> Result<()> {
        self.save_task_entry(entry).await
    }
}
