//! Deterministic chapter splitting.
//!
//! Converts each eligible chapter's lines into token-bounded chunks and,
//! for unit-based generation kinds, allocates the per-chapter unit budget
//! across those chunks in proportion to their token counts.

pub mod tokenizer;

use tracing::debug;

use storyforge_shared::{Book, Chunk, Line};

pub use tokenizer::{ApproxTokenizer, Tokenizer, WordTokenizer};

/// Chapters below this many characters contribute no chunks.
pub const MIN_CHAPTER_CHARS: usize = 500;

/// Parameters for [`split`].
#[derive(Debug, Clone)]
pub struct SplitOptions {
    /// A new chunk starts before this budget would be exceeded.
    pub chunk_token_budget: usize,
    /// Units to spread over each chapter; `None` for whole-chunk kinds.
    pub units_per_chapter: Option<u32>,
    pub min_chapter_chars: usize,
}

impl SplitOptions {
    pub fn new(chunk_token_budget: usize, units_per_chapter: Option<u32>) -> Self {
        Self {
            chunk_token_budget,
            units_per_chapter,
            min_chapter_chars: MIN_CHAPTER_CHARS,
        }
    }
}

/// A run of consecutive lines, by index into the chapter's line list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineGroup {
    pub start: usize,
    /// Inclusive.
    pub end: usize,
    pub tokens: usize,
}

/// Split a book into ordered chunks.
///
/// Chunk ids are `{chapter_id}#{n}` where `n` is the group's position in
/// the chapter before zero-unit groups are dropped, so ids stay stable
/// across re-splits of unchanged text.
pub fn split(book: &Book, options: &SplitOptions, tokenizer: &dyn Tokenizer) -> Vec<Chunk> {
    let mut chunks = Vec::new();

    for chapter in &book.chapters {
        let chars = chapter.char_count();
        if chars < options.min_chapter_chars {
            debug!(chapter = %chapter.id, chars, "chapter below size threshold, skipping");
            continue;
        }

        let groups = group_lines(&chapter.lines, options.chunk_token_budget, tokenizer);
        let units = options.units_per_chapter.map(|budget| {
            let tokens: Vec<usize> = groups.iter().map(|g| g.tokens).collect();
            allocate_units(&tokens, budget)
        });

        for (i, group) in groups.iter().enumerate() {
            let unit = units.as_ref().map(|u| u[i]);
            if unit == Some(0) {
                continue;
            }
            chunks.push(Chunk::new(
                format!("{}#{i}", chapter.id),
                chapter.id.clone(),
                chapter.lines[group.start].id.clone(),
                chapter.lines[group.end].id.clone(),
                unit,
            ));
        }

        debug!(
            chapter = %chapter.id,
            groups = groups.len(),
            "chapter split"
        );
    }

    chunks
}

/// Greedily group consecutive lines so no group exceeds `budget` tokens.
///
/// A line is never split; a single line larger than the budget forms a
/// group of its own. Every group holds at least one line.
pub fn group_lines(lines: &[Line], budget: usize, tokenizer: &dyn Tokenizer) -> Vec<LineGroup> {
    let mut groups = Vec::new();
    let mut current: Option<LineGroup> = None;

    for (i, line) in lines.iter().enumerate() {
        let tokens = tokenizer.count_tokens(&line.text);
        match current.as_mut() {
            Some(group) if group.tokens + tokens <= budget => {
                group.end = i;
                group.tokens += tokens;
            }
            _ => {
                if let Some(group) = current.take() {
                    groups.push(group);
                }
                current = Some(LineGroup {
                    start: i,
                    end: i,
                    tokens,
                });
            }
        }
    }

    if let Some(group) = current {
        groups.push(group);
    }
    groups
}

/// Spread `budget` units over groups in proportion to their token counts.
///
/// Every group but the last gets `round(budget * t / total)`, capped so the
/// running total never passes `budget`; the last group takes the exact
/// remainder. With zero total tokens the whole budget goes to the first group.
pub fn allocate_units(token_counts: &[usize], budget: u32) -> Vec<u32> {
    let Some(last) = token_counts.len().checked_sub(1) else {
        return Vec::new();
    };

    let mut units = vec![0; token_counts.len()];
    let total: usize = token_counts.iter().sum();
    if total == 0 {
        units[0] = budget;
        return units;
    }

    let mut allocated = 0u32;
    for (i, &tokens) in token_counts[..last].iter().enumerate() {
        let share = (f64::from(budget) * tokens as f64 / total as f64).round() as u32;
        let share = share.min(budget - allocated);
        units[i] = share;
        allocated += share;
    }
    units[last] = budget - allocated;
    units
}
