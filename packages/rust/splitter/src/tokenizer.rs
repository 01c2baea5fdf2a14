//! Token counting used to size chunks.

use std::sync::LazyLock;

use regex::Regex;

/// Counts tokens in a piece of text.
///
/// Implementations must be deterministic: the same text always yields the
/// same count, so a re-split reproduces the same chunk boundaries.
pub trait Tokenizer: Send + Sync {
    fn count_tokens(&self, text: &str) -> usize;
}

/// Pre-tokenizer pattern in the style of byte-level BPE vocabularies:
/// contractions, letter runs, digit runs, punctuation runs, whitespace.
static PIECE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"'(?:s|t|re|ve|m|ll|d)| ?\p{L}+| ?\p{N}+| ?[^\s\p{L}\p{N}]+|\s+")
        .expect("valid tokenizer pattern")
});

static CJK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\p{Han}\p{Hiragana}\p{Katakana}\p{Hangul}]").expect("valid CJK pattern")
});

/// Approximates a BPE tokenizer without shipping a vocabulary.
///
/// Each pre-token costs one token per four characters (at least one);
/// CJK pieces cost one token per ideograph/syllable.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApproxTokenizer;

impl Tokenizer for ApproxTokenizer {
    fn count_tokens(&self, text: &str) -> usize {
        PIECE_RE
            .find_iter(text)
            .map(|m| {
                let piece = m.as_str().trim_start();
                if piece.is_empty() {
                    // pure whitespace run
                    return 1;
                }
                let cjk = CJK_RE.find_iter(piece).count();
                if cjk > 0 {
                    cjk + (piece.chars().count() - cjk).div_ceil(4)
                } else {
                    piece.chars().count().div_ceil(4).max(1)
                }
            })
            .sum()
    }
}

/// One token per whitespace-separated word.
#[derive(Debug, Clone, Copy, Default)]
pub struct WordTokenizer;

impl Tokenizer for WordTokenizer {
    fn count_tokens(&self, text: &str) -> usize {
        text.split_whitespace().count()
    }
}
