//! Creating and reusing task entries.

use tracing::{debug, info, instrument};

use storyforge_shared::{Book, GenerationKind, Result, RunConfig, StoryforgeError, TaskEntry};
use storyforge_splitter::{SplitOptions, Tokenizer, split};
use storyforge_storage::TaskStore;

/// Splitter parameters for `kind`.
///
/// Only unit kinds carry a per-chapter budget.
pub fn split_options(kind: GenerationKind, config: &RunConfig, units_per_chapter: u32) -> SplitOptions {
    let units = kind.uses_units().then_some(units_per_chapter);
    let mut options = SplitOptions::new(config.chunk_token_budget, units);
    options.min_chapter_chars = config.min_chapter_chars;
    options
}

/// Return the persisted entry for `(book, kind)`, splitting a fresh one if
/// none exists or `resplit` is set.
///
/// A re-split replaces the chunk list wholesale, so every chunk starts
/// `pending` again.
#[instrument(skip_all, fields(book = %book.id, kind = %kind, resplit))]
pub async fn ensure_task_entry(
    store: &dyn TaskStore,
    book: &Book,
    kind: GenerationKind,
    options: &SplitOptions,
    tokenizer: &dyn Tokenizer,
    resplit: bool,
) -> Result<TaskEntry> {
    if !resplit {
        if let Some(entry) = store.load_chunks(&book.id, kind).await? {
            debug!(chunks = entry.chunks.len(), "reusing persisted task entry");
            return Ok(entry);
        }
    }

    book.validate()?;
    let chunks = split(book, options, tokenizer);
    if chunks.is_empty() {
        let message = if options.units_per_chapter == Some(0) {
            "units_per_chapter is 0, so no chunk has units to generate".to_string()
        } else {
            format!(
                "book {} has no chapter of at least {} characters",
                book.id, options.min_chapter_chars
            )
        };
        return Err(StoryforgeError::validation(message));
    }

    let entry = TaskEntry::new(book.id.clone(), kind, chunks);
    store.save_chunks(&entry).await?;
    info!(
        chunks = entry.chunks.len(),
        units = entry
            .chunks
            .iter()
            .filter_map(|c| c.units_to_generate)
            .sum::<u32>(),
        "split book into chunks"
    );
    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use storyforge_shared::{Chapter, ChunkStatus, Line};
    use storyforge_splitter::WordTokenizer;

    use crate::test_support::MemoryStore;

    /// Two chapters of 60 ten-word lines each.
    fn long_book() -> Book {
        let chapters = (0..2)
            .map(|c| Chapter {
                id: format!("ch{c}"),
                title: None,
                lines: (0..60)
                    .map(|l| {
                        Line::new(
                            format!("ch{c}-{l}"),
                            "one two three four five six seven eight nine ten",
                        )
                    })
                    .collect(),
            })
            .collect();
        Book::new("Long", chapters)
    }

    fn options(kind: GenerationKind) -> SplitOptions {
        let config = RunConfig {
            chunk_token_budget: 200,
            ..RunConfig::default()
        };
        split_options(kind, &config, 3)
    }

    #[test]
    fn units_only_for_unit_kinds() {
        assert_eq!(options(GenerationKind::Illustration).units_per_chapter, Some(3));
        assert_eq!(options(GenerationKind::Translation).units_per_chapter, None);
        assert_eq!(options(GenerationKind::Translation).chunk_token_budget, 200);
    }

    #[tokio::test]
    async fn splits_and_persists_when_missing() {
        let book = long_book();
        let store = MemoryStore::with(&book, None);

        let entry = ensure_task_entry(
            &store,
            &book,
            GenerationKind::Translation,
            &options(GenerationKind::Translation),
            &WordTokenizer,
            false,
        )
        .await
        .unwrap();

        // 600 words per chapter at 200 per chunk.
        assert_eq!(entry.chunks.len(), 6);
        assert!(entry.chunks.iter().all(|c| c.units_to_generate.is_none()));
        assert_eq!(store.saves(), 1);
        assert_eq!(store.entry(&book.id, GenerationKind::Translation).chunks.len(), 6);
    }

    #[tokio::test]
    async fn reuses_existing_entry_unless_resplit() {
        let book = long_book();
        let store = MemoryStore::with(&book, None);
        let opts = options(GenerationKind::Illustration);

        let mut first = ensure_task_entry(&store, &book, GenerationKind::Illustration, &opts, &WordTokenizer, false)
            .await
            .unwrap();
        first.chunks[0].status = ChunkStatus::Completed;
        store.save_chunks(&first).await.unwrap();

        let reused = ensure_task_entry(&store, &book, GenerationKind::Illustration, &opts, &WordTokenizer, false)
            .await
            .unwrap();
        assert_eq!(reused.chunks[0].status, ChunkStatus::Completed);

        let fresh = ensure_task_entry(&store, &book, GenerationKind::Illustration, &opts, &WordTokenizer, true)
            .await
            .unwrap();
        assert!(fresh.chunks.iter().all(|c| c.status == ChunkStatus::Pending));
        assert_eq!(
            fresh.chunks.iter().map(|c| c.id.as_str()).collect::<Vec<_>>(),
            reused.chunks.iter().map(|c| c.id.as_str()).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn zero_unit_budget_is_reported() {
        let book = long_book();
        let store = MemoryStore::with(&book, None);
        let config = RunConfig {
            chunk_token_budget: 200,
            ..RunConfig::default()
        };
        let opts = split_options(GenerationKind::Illustration, &config, 0);

        let err = ensure_task_entry(&store, &book, GenerationKind::Illustration, &opts, &WordTokenizer, false)
            .await
            .unwrap_err();
        assert!(matches!(err, StoryforgeError::Validation { .. }));
        assert!(err.to_string().contains("units_per_chapter"), "{err}");
        assert_eq!(store.saves(), 0);
    }

    #[tokio::test]
    async fn book_without_eligible_chapters_is_rejected() {
        let book = Book::new(
            "Short",
            vec![Chapter {
                id: "ch0".into(),
                title: None,
                lines: vec![Line::new("ch0-0", "Too short.")],
            }],
        );
        let store = MemoryStore::with(&book, None);

        let err = ensure_task_entry(
            &store,
            &book,
            GenerationKind::Translation,
            &options(GenerationKind::Translation),
            &WordTokenizer,
            false,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, StoryforgeError::Validation { .. }));
        assert_eq!(store.saves(), 0);
    }
}
