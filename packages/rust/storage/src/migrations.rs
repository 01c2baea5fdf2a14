//! SQL migration definitions for the storyforge database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: books, task_entries, chunks",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Book trees, stored whole with their attached artifacts
CREATE TABLE IF NOT EXISTS books (
    id         TEXT PRIMARY KEY,
    title      TEXT NOT NULL,
    tree_json  TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- One entry per (book, generation kind)
CREATE TABLE IF NOT EXISTS task_entries (
    book_id    TEXT NOT NULL REFERENCES books(id) ON DELETE CASCADE,
    kind       TEXT NOT NULL,
    status     TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    last_error TEXT,
    PRIMARY KEY (book_id, kind)
);

-- Chunk lists, ordered by seq within an entry
CREATE TABLE IF NOT EXISTS chunks (
    book_id       TEXT NOT NULL,
    kind          TEXT NOT NULL,
    seq           INTEGER NOT NULL,
    id            TEXT NOT NULL,
    chapter_id    TEXT NOT NULL,
    start_line_id TEXT NOT NULL,
    end_line_id   TEXT NOT NULL,
    status        TEXT NOT NULL,
    units         INTEGER,
    last_error    TEXT,
    attempts      INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (book_id, kind, seq),
    UNIQUE (book_id, kind, id),
    FOREIGN KEY (book_id, kind) REFERENCES task_entries(book_id, kind) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_chunks_status ON chunks(book_id, kind, status);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
